//! Non-volatile memory controllers.
//!
//! The filesystem consumes flash through the [`NvmController`] trait:
//! byte-granular reads, word-aligned programs, and page-granular erases
//! over a linear address range. Programming NOR flash can only turn 1 bits
//! into 0 bits; a 0 to 1 transition requires erasing the whole page.
//!
//! [`RamNvm`] is a RAM-backed controller with those exact semantics. It
//! backs the test suite and host-side tooling, and accepts an I/O hook so
//! tests can observe or veto individual operations (e.g. to simulate a
//! power cut partway through a write sequence).
use crate::FsError;
use alloc::{boxed::Box, vec, vec::Vec};

/// Flash word size in bytes. Program operations are aligned to this.
pub const WORD_SIZE: u32 = 4;

/// Access to a linear range of NOR flash.
pub trait NvmController {
    /// First address of the flash region.
    fn flash_start(&self) -> u32;

    /// One past the last address of the flash region.
    fn flash_end(&self) -> u32;

    /// Total size of the flash region in bytes.
    fn flash_size(&self) -> u32 {
        self.flash_end() - self.flash_start()
    }

    /// Erase granularity in bytes.
    fn page_size(&self) -> u32;

    /// Erases the page beginning at `page_address`, returning every byte in
    /// it to `0xFF`. The address must be page-aligned.
    fn erase(&mut self, page_address: u32) -> Result<(), FsError>;

    /// Reads `buf.len()` bytes starting at `address`.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FsError>;

    /// Programs `words` at `address`. Address and length must be multiples
    /// of [`WORD_SIZE`]. Programming clears bits; it never sets them.
    fn write(&mut self, address: u32, words: &[u8]) -> Result<(), FsError>;

    /// Asks the host side to re-enumerate the storage device.
    fn remount(&mut self) {}
}

/// Observer/interceptor for [`RamNvm`] operations.
///
/// Called with the target address, the payload (empty for erases), and
/// whether the operation is an erase. Returning an error vetoes the
/// operation, which then leaves the flash contents untouched.
pub type NvmHook = Box<dyn FnMut(u32, &[u8], bool) -> Result<(), FsError>>;

/// A NOR flash simulated in RAM.
///
/// Freshly constructed flash is fully erased (`0xFF`). Writes AND bytes
/// into place, mirroring real NOR programming, so code that forgets an
/// erase corrupts its own data here just as it would on hardware. In debug
/// builds an attempted 0 to 1 transition also trips an assertion.
pub struct RamNvm {
    base: u32,
    page_size: u32,
    data: Vec<u8>,
    hook: Option<NvmHook>,
}

impl RamNvm {
    /// Creates an erased flash of `size` bytes starting at address zero.
    pub fn new(size: u32, page_size: u32) -> Self {
        Self::with_base(0, size, page_size)
    }

    /// Creates an erased flash of `size` bytes starting at `base`.
    pub fn with_base(base: u32, size: u32, page_size: u32) -> Self {
        assert!(page_size.is_power_of_two() && size % page_size == 0);
        Self {
            base,
            page_size,
            data: vec![0xff; size as usize],
            hook: None,
        }
    }

    /// Installs an I/O hook, replacing any previous one.
    pub fn set_hook(&mut self, hook: Option<NvmHook>) {
        self.hook = hook;
    }

    /// The raw flash contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn offset_of(&self, address: u32, len: usize) -> Result<usize, FsError> {
        let end = address as u64 + len as u64;
        if address < self.base || end > self.base as u64 + self.data.len() as u64 {
            return Err(FsError::InvalidParameter);
        }
        Ok((address - self.base) as usize)
    }
}

impl NvmController for RamNvm {
    fn flash_start(&self) -> u32 {
        self.base
    }

    fn flash_end(&self) -> u32 {
        self.base + self.data.len() as u32
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn erase(&mut self, page_address: u32) -> Result<(), FsError> {
        if page_address % self.page_size != 0 {
            return Err(FsError::InvalidParameter);
        }
        let offset = self.offset_of(page_address, self.page_size as usize)?;
        if let Some(hook) = self.hook.as_mut() {
            hook(page_address, &[], true)?;
        }
        self.data[offset..offset + self.page_size as usize].fill(0xff);
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FsError> {
        let offset = self.offset_of(address, buf.len())?;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, address: u32, words: &[u8]) -> Result<(), FsError> {
        if address % WORD_SIZE != 0 || words.len() as u32 % WORD_SIZE != 0 {
            return Err(FsError::InvalidParameter);
        }
        let offset = self.offset_of(address, words.len())?;
        if let Some(hook) = self.hook.as_mut() {
            hook(address, words, false)?;
        }
        for (cell, byte) in self.data[offset..offset + words.len()].iter_mut().zip(words) {
            debug_assert!(
                *cell & byte == *byte,
                "program would set a cleared bit at {:#x}; the page was not erased",
                address
            );
            *cell &= byte;
        }
        Ok(())
    }
}
