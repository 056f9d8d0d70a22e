//! # flashfs
//!
//! A small filesystem for the raw NOR flash of a microcontroller-class
//! device, designed to share the flash with program code. It offers
//! hierarchical directories and named files with create/read/write/seek/
//! delete, and survives power loss between flush points.
//!
//! The filesystem is layered over an NVM controller ([`nvm::NvmController`])
//! that exposes page-granular erase, word-granular program, and
//! byte-granular read over a linear address range. All flash access is
//! mediated by a small write-back cache of page-sized lines.
//!
//! ## On-flash layout
//!
//! The managed region `[flash_start + offset, flash_end)` is divided into
//! equal logical blocks; physical erase pages contain
//! `page_size / block_size` blocks.
//!
//! ```text
//!            +────────────────────────+  block 0
//!            │ File allocation table  │
//!            │   u16 per block, LE    │
//!            +────────────────────────+  block T = ceil(2 * fs_size / block_size)
//!            │ Root directory         │
//!            │   (first entry: magic) │
//!            +────────────────────────+  block T + 1
//!            │ Data blocks            │
//!            │   chained via the FAT  │
//!            │   ...                  │
//!            +────────────────────────+  block fs_size
//! ```
//!
//! Every FAT entry describes one block: `UNUSED` (erased and free),
//! `DELETED` (obsolete, reclaimed lazily by a page recycle), `EOF` (last
//! block of a chain), or the index of the next block in a chain. Directory
//! contents are back-to-back 24-byte entries; entry flag words only ever
//! clear bits between erases, so every state transition is realisable on
//! NOR flash without a page erase. See [`fs::layout`] for the record
//! formats.
//!
//! ## Example
//!
//! ```no_run
//! use flashfs::{FileSystem, OpenFlags, RamNvm};
//!
//! let nvm = RamNvm::new(64 * 1024, 1024);
//! let mut fs = FileSystem::new(nvm, 128).unwrap();
//! let fd = fs.open("/hello.txt", OpenFlags::WRITE | OpenFlags::CREAT).unwrap();
//! fs.write(fd, b"hello").unwrap();
//! fs.close(fd).unwrap();
//! ```
#![cfg_attr(not(test), no_std)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;

macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

pub mod cache;
pub mod fs;
pub mod interface;
pub mod nvm;

pub use fs::layout::{DirectoryEntry, EntryFlags, FatEntry, Geometry, OpenFlags, Whence};
pub use fs::{Fd, FileSystem, FsConfig};
pub use interface::{ControlInterface, ExtendedOp};
pub use nvm::{NvmController, RamNvm};

/// Errors surfaced by the filesystem.
///
/// Internal helpers signal "not found" through `Option` returns; only the
/// kinds below ever reach a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The operation is not allowed in the current state, e.g. opening a
    /// file that is already open.
    NotSupported,
    /// A bad filename, a missing path component, an out-of-range seek, an
    /// empty buffer, or a misaligned flash access.
    InvalidParameter,
    /// Out of blocks, directory slots, or cache lines, even after
    /// recycling.
    NoResources,
    /// No valid filesystem was found on the flash. Construction recovers
    /// from this by formatting.
    NoData,
}
