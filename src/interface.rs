//! Host control channel.
//!
//! The host shares a single 256-byte command buffer with the device. Byte 0
//! is the opcode; the host writes a command and polls until byte 0 reads
//! back as [`RESPONSE_SUCCESS`]. The device polls the buffer from its idle
//! loop and dispatches at most one command at a time — filesystem mutation
//! is strictly serialised.
//!
//! | Opcode | Name        | Payload                          |
//! |--------|-------------|----------------------------------|
//! | `0x00` | no-op       | —                                |
//! | `0x01` | push patch  | `pos: u32`, `len: u8`, `bytes`   |
//! | `0x02` | remount     | —                                |
//! | `0x03` | extended    | see [`ExtendedOp`]               |
//! | `0x04` | format      | —                                |
//! | `0xFF` | success     | response sentinel                |
//!
//! After handling, bytes 1..256 are zeroed and byte 0 is set to
//! [`RESPONSE_SUCCESS`]. Unknown opcodes are consumed the same way.
use crate::FsError;
use crate::fs::FileSystem;
use crate::nvm::NvmController;
use alloc::vec;
use log::{info, warn};

/// Size of the shared command buffer.
pub const COMMAND_BUFFER_LENGTH: usize = 256;

/// Response sentinel: the previous command has been consumed.
pub const RESPONSE_SUCCESS: u8 = 0xff;

/// A patch payload is bounded by the frame size minus the 6-byte header.
pub const MAX_PATCH_LENGTH: usize = 250;

/// Host command opcodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Opcode {
    /// Ignored.
    NoOp = 0x00,
    /// Overlay bytes onto the managed region through the cache.
    PushPatch = 0x01,
    /// Ask the NVM controller to re-enumerate on the host side.
    Remount = 0x02,
    /// Deployment-dependent; see [`ExtendedOp`].
    Extended = 0x03,
    /// Re-format the filesystem.
    FormatFs = 0x04,
}

impl TryFrom<u8> for Opcode {
    type Error = FsError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Opcode::NoOp),
            0x01 => Ok(Opcode::PushPatch),
            0x02 => Ok(Opcode::Remount),
            0x03 => Ok(Opcode::Extended),
            0x04 => Ok(Opcode::FormatFs),
            _ => Err(FsError::InvalidParameter),
        }
    }
}

/// Meaning of opcode `0x03`, which differs between deployments.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExtendedOp {
    /// `pos: u32` — drop the cache and erase the physical page containing
    /// the region-relative position.
    ErasePage,
    /// NUL-terminated message — write it to the log.
    PrintMessage,
}

/// The device side of the host control channel.
pub struct ControlInterface {
    buffer: [u8; COMMAND_BUFFER_LENGTH],
    extended_op: ExtendedOp,
    handling: bool,
}

impl ControlInterface {
    pub fn new(extended_op: ExtendedOp) -> Self {
        let mut buffer = [0u8; COMMAND_BUFFER_LENGTH];
        buffer[0] = RESPONSE_SUCCESS;
        Self {
            buffer,
            extended_op,
            handling: false,
        }
    }

    /// The shared buffer, as the host transport sees it.
    pub fn buffer(&self) -> &[u8; COMMAND_BUFFER_LENGTH] {
        &self.buffer
    }

    /// The shared buffer, for the host transport to write a command into.
    pub fn buffer_mut(&mut self) -> &mut [u8; COMMAND_BUFFER_LENGTH] {
        &mut self.buffer
    }

    /// Checks the buffer for a pending command and dispatches it against
    /// `fs`.
    ///
    /// Returns `Ok(false)` when there was nothing to do. A handled command
    /// is always acknowledged — the payload is zeroed and byte 0 set to
    /// [`RESPONSE_SUCCESS`] — even if it failed; the error is returned to
    /// the caller.
    pub fn poll<N: NvmController>(&mut self, fs: &mut FileSystem<N>) -> Result<bool, FsError> {
        let command = self.buffer[0];
        if self.handling || command == Opcode::NoOp as u8 || command == RESPONSE_SUCCESS {
            return Ok(false);
        }

        self.handling = true;
        let result = self.dispatch(command, fs);

        for byte in &mut self.buffer[1..] {
            *byte = 0;
        }
        self.buffer[0] = RESPONSE_SUCCESS;
        self.handling = false;

        result.map(|_| true)
    }

    fn dispatch<N: NvmController>(
        &mut self,
        command: u8,
        fs: &mut FileSystem<N>,
    ) -> Result<(), FsError> {
        let Ok(opcode) = Opcode::try_from(command) else {
            warn!("ignoring unknown host command {command:#04x}");
            return Ok(());
        };
        info!("host command {opcode:?}");

        match opcode {
            Opcode::NoOp => Ok(()),
            Opcode::PushPatch => {
                let position = u32::from_le_bytes([
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                    self.buffer[4],
                ]);
                let mut length = self.buffer[5] as usize;
                if length > MAX_PATCH_LENGTH {
                    warn!("patch length {length} clamped to {MAX_PATCH_LENGTH}");
                    length = MAX_PATCH_LENGTH;
                }

                // Programs are word-granular: widen the patch to the
                // covering word-aligned window.
                let aligned_position = position & !3;
                let lead = (position - aligned_position) as usize;
                let window_length = (lead + length + 3) & !3;

                let mut window = vec![0u8; window_length];
                fs.read_region(aligned_position, &mut window)?;
                window[lead..lead + length].copy_from_slice(&self.buffer[6..6 + length]);
                fs.write_region(aligned_position, &window)?;
                fs.sync()
            }
            Opcode::Remount => {
                fs.remount();
                Ok(())
            }
            Opcode::Extended => match self.extended_op {
                ExtendedOp::ErasePage => {
                    let position = u32::from_le_bytes([
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                        self.buffer[4],
                    ]);
                    fs.erase_page_at(position)
                }
                ExtendedOp::PrintMessage => {
                    let payload = &self.buffer[1..];
                    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                    match core::str::from_utf8(&payload[..end]) {
                        Ok(message) => info!("host: {message}"),
                        Err(_) => warn!("host message is not valid UTF-8"),
                    }
                    Ok(())
                }
            },
            Opcode::FormatFs => fs.format(),
        }
    }
}
