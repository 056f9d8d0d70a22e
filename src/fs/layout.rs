//! On-flash record formats and address arithmetic.
//!
//! This module defines the raw shapes the filesystem persists: the file
//! allocation table entries, the 24-byte directory entry record, and the
//! [`Geometry`] that maps block numbers to flash addresses. Everything on
//! flash is little-endian and is encoded/decoded explicitly; in-memory
//! structures refer to flash by block index and byte offset, never by
//! pointer.
//!
//! ## Entry lifecycle
//!
//! A directory slot moves through four states, each reachable from the
//! previous one by clearing bits only (the NOR programming constraint):
//!
//! ```text
//! FREE (0xFFFF)  ──▶  NEW (0x7FFF)  ──▶  VALID (0x4xxx)  ──▶  DELETED (0x0000)
//!   erased slot       allocated,         finalised with       invalidated; slot
//!                     length unwritten   a real length        reclaimed by a
//!                                                             page recycle
//! ```
//!
//! Directories skip the NEW state: they are created `VALID | DIRECTORY`
//! with a fixed length word, so no second program of the slot is needed.
use crate::FsError;

/// Maximum length of one path component, in bytes.
pub const FILENAME_LENGTH: usize = 16;

/// Filename of the root directory's first entry; doubles as the format
/// signature probed on mount.
pub const MAGIC: &str = "FLASHFS_1_0";

/// Marker bit in a directory entry's length word identifying a directory.
/// The root entry carries `DIRECTORY_LENGTH | fs_size`.
pub const DIRECTORY_LENGTH: u32 = 0x8000_0000;

/// Path separator.
pub const SEPARATOR: char = '/';

/// Chain links must be a bitwise subset of [`FatEntry::EOF`] so a block can
/// be appended to a chain without a page erase; that caps the block count.
pub const MAX_BLOCKS: u32 = 0x1000;

/// One file allocation table entry, describing the block with the same
/// index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FatEntry(pub u16);

impl FatEntry {
    /// The block is erased and free.
    pub const UNUSED: FatEntry = FatEntry(0xffff);
    /// The block's contents are obsolete; a page erase reclaims it.
    pub const DELETED: FatEntry = FatEntry(0x0000);
    /// The block is the last of its chain.
    pub const EOF: FatEntry = FatEntry(0xefff);

    pub fn is_unused(self) -> bool {
        self == Self::UNUSED
    }

    pub fn is_deleted(self) -> bool {
        self == Self::DELETED
    }

    pub fn is_eof(self) -> bool {
        self == Self::EOF
    }

    /// The next block of the chain, or `None` for any sentinel value.
    pub fn next_link(self) -> Option<u16> {
        if self.is_unused() || self.is_deleted() || self.is_eof() {
            None
        } else {
            Some(self.0)
        }
    }
}

bitflags::bitflags! {
    /// Directory entry flag word.
    ///
    /// An erased slot reads as all ones. Writing an entry clears FREE (and
    /// more); invalidating it clears everything. A live entry has FREE
    /// clear and VALID set.
    pub struct EntryFlags: u16 {
        /// Slot has never been written since the last erase.
        const FREE = 0x8000;
        /// Entry is live.
        const VALID = 0x4000;
        /// Entry names a directory rather than a regular file.
        const DIRECTORY = 0x2000;
        /// Low bits, left set until an entry is finalised or deleted.
        const RESERVED = 0x1fff;
        /// Freshly created regular file: allocated but its length word is
        /// still unwritten.
        const NEW = Self::VALID.bits | Self::DIRECTORY.bits | Self::RESERVED.bits;
        /// An erased slot.
        const ERASED = 0xffff;
    }
}

impl EntryFlags {
    pub fn is_free(self) -> bool {
        self.contains(EntryFlags::FREE)
    }

    pub fn is_valid(self) -> bool {
        !self.is_free() && self.contains(EntryFlags::VALID)
    }

    pub fn is_directory(self) -> bool {
        self.contains(EntryFlags::DIRECTORY)
    }
}

bitflags::bitflags! {
    /// Open mode for [`FileSystem::open`](crate::FileSystem::open).
    pub struct OpenFlags: u32 {
        /// Read from the file.
        const READ = 0x01;
        /// Write to the file.
        const WRITE = 0x02;
        /// Create the file if it does not exist.
        const CREAT = 0x04;
        /// Start with the seek position at the end of the file.
        const APPEND = 0x08;
    }
}

/// Origin for [`FileSystem::seek`](crate::FileSystem::seek).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Whence {
    /// Absolute position.
    Set,
    /// Relative to the current seek position.
    Cur,
    /// Relative to the end of the file.
    End,
}

/// A directory entry: one named file or subdirectory.
///
/// Entries are laid out back-to-back across a directory's block chain and
/// never straddle a block boundary; tail space in a block smaller than one
/// entry stays unused.
#[derive(Clone, Copy, Debug)]
pub struct DirectoryEntry {
    /// Zero-padded printable ASCII.
    pub file_name: [u8; FILENAME_LENGTH],
    /// First block of the file's chain.
    pub first_block: u16,
    /// State word; transitions clear bits only.
    pub flags: EntryFlags,
    /// File length in bytes. `0xFFFF_FFFF` while the entry is NEW; for
    /// directories the [`DIRECTORY_LENGTH`] bit is set.
    pub length: u32,
}

/// Encoded size of a directory entry on flash.
pub const ENTRY_SIZE: u32 = 24;
const_assert!(ENTRY_SIZE as usize == FILENAME_LENGTH + 2 + 2 + 4);

/// Byte offset of the flags word within an encoded entry, for in-place
/// invalidation.
pub(crate) const ENTRY_FLAGS_OFFSET: u32 = FILENAME_LENGTH as u32 + 2;

impl DirectoryEntry {
    /// Builds an entry for `name`, which must fit [`FILENAME_LENGTH`].
    pub fn new(name: &str, first_block: u16, flags: EntryFlags, length: u32) -> Self {
        debug_assert!(name.len() <= FILENAME_LENGTH);
        let mut file_name = [0u8; FILENAME_LENGTH];
        file_name[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            file_name,
            first_block,
            flags,
            length,
        }
    }

    pub fn decode(raw: &[u8; ENTRY_SIZE as usize]) -> Self {
        let mut file_name = [0u8; FILENAME_LENGTH];
        file_name.copy_from_slice(&raw[..FILENAME_LENGTH]);
        Self {
            file_name,
            first_block: u16::from_le_bytes([raw[16], raw[17]]),
            flags: EntryFlags::from_bits_truncate(u16::from_le_bytes([raw[18], raw[19]])),
            length: u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]),
        }
    }

    pub fn encode(&self) -> [u8; ENTRY_SIZE as usize] {
        let mut raw = [0u8; ENTRY_SIZE as usize];
        raw[..FILENAME_LENGTH].copy_from_slice(&self.file_name);
        raw[16..18].copy_from_slice(&self.first_block.to_le_bytes());
        raw[18..20].copy_from_slice(&self.flags.bits().to_le_bytes());
        raw[20..24].copy_from_slice(&self.length.to_le_bytes());
        raw
    }

    /// Whether this entry's name equals `name` under zero padding.
    pub fn name_eq(&self, name: &str) -> bool {
        if name.len() > FILENAME_LENGTH {
            return false;
        }
        let mut padded = [0u8; FILENAME_LENGTH];
        padded[..name.len()].copy_from_slice(name.as_bytes());
        self.file_name == padded
    }

    pub fn is_valid(&self) -> bool {
        self.flags.is_valid()
    }

    pub fn is_directory(&self) -> bool {
        self.flags.is_directory()
    }
}

/// Shape of the managed flash region and the derived block layout.
///
/// There is a single canonical address mapping: a region-relative logical
/// address `l` lives at flash address `flash_start + offset + l`, and block
/// `b` begins at logical address `b * block_size`.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    /// First address of the flash device.
    pub flash_start: u32,
    /// One past the last address of the flash device.
    pub flash_end: u32,
    /// Physical erase granularity.
    pub page_size: u32,
    /// Logical block size; a power of two no larger than `page_size`.
    pub block_size: u32,
    /// Start of the managed region relative to `flash_start`; a multiple
    /// of `page_size`.
    pub offset: u32,
    /// Number of logical blocks in the region.
    pub fs_size: u16,
    /// Number of blocks occupied by the file allocation table.
    pub table_size: u16,
}

impl Geometry {
    /// Blocks needed to hold a FAT of `fs_size` two-byte entries.
    pub fn table_blocks(fs_size: u16, block_size: u32) -> u16 {
        ((fs_size as u32 * 2).div_ceil(block_size)) as u16
    }

    /// Flash address where the managed region begins.
    pub fn region_start(&self) -> u32 {
        self.flash_start + self.offset
    }

    /// Translates a region-relative logical address to a flash address.
    pub fn to_flash(&self, logical: u32) -> u32 {
        self.region_start() + logical
    }

    pub fn blocks_per_page(&self) -> u32 {
        self.page_size / self.block_size
    }

    /// Directory entries that fit in one block.
    pub fn entries_per_block(&self) -> u32 {
        self.block_size / ENTRY_SIZE
    }

    /// Logical address of the start of `block`.
    pub fn logical_of_block(&self, block: u16) -> u32 {
        block as u32 * self.block_size
    }

    /// Flash address of the start of `block`.
    pub fn address_of_block(&self, block: u16) -> u32 {
        self.to_flash(self.logical_of_block(block))
    }

    /// Flash address of the erase page containing `block`.
    pub fn page_of_block(&self, block: u16) -> u32 {
        let address = self.address_of_block(block);
        address - address % self.page_size
    }

    /// The block containing the given flash address.
    pub fn block_of_address(&self, address: u32) -> u16 {
        ((address - self.region_start()) / self.block_size) as u16
    }

    /// Flash address of the FAT entry for `block`.
    pub fn fat_address(&self, block: u16) -> u32 {
        self.region_start() + block as u32 * 2
    }

    /// Logical address of the root directory's own entry (the magic entry
    /// at the start of the root block).
    pub fn root_entry(&self) -> u32 {
        self.logical_of_block(self.table_size)
    }
}
