//! The filesystem proper: mount/format, geometry, and the public surface.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ FileSystem: open/read/write/seek/    │
//! │ flush/close/remove/mkdir             │   fs::file
//! └──────────────┬───────────────────────┘
//!                │
//! ┌──────────────▼───────────────────────┐
//! │ Directory entries: lookup, resolve,  │
//! │ slot allocation, creation            │   fs::dir
//! └──────────────┬───────────────────────┘
//!                │
//! ┌──────────────▼───────────────────────┐
//! │ FAT: chains, free-block allocator,   │
//! │ page recycler                        │   fs::fat
//! └──────────────┬───────────────────────┘
//!                │
//! ┌──────────────▼───────────────────────┐
//! │ Block cache: page lines, write-back  │   cache
//! └──────────────┬───────────────────────┘
//!                │
//! ┌──────────────▼───────────────────────┐
//! │ NVM controller: erase/program/read   │   nvm
//! └──────────────────────────────────────┘
//! ```
//!
//! Construction mounts: an existing filesystem on the flash is loaded, and
//! anything else is formatted over. A mounted filesystem keeps its root
//! directory page pinned in the cache.
use crate::FsError;
use crate::cache::BlockCache;
use crate::nvm::NvmController;
use alloc::vec::Vec;
use log::{debug, info};

pub mod layout;

pub(crate) mod dir;
pub(crate) mod fat;
pub(crate) mod file;

pub use file::Fd;

use layout::{DIRECTORY_LENGTH, DirectoryEntry, EntryFlags, FatEntry, Geometry, MAGIC, MAX_BLOCKS};

/// Construction parameters for [`FileSystem`].
#[derive(Clone, Copy, Debug)]
pub struct FsConfig {
    /// Logical block size in bytes; a power of two no larger than the NVM
    /// page size.
    pub block_size: u32,
    /// Start of the managed region relative to the flash start; a multiple
    /// of the page size. Lets the filesystem share the flash with program
    /// code.
    pub offset: u32,
    /// Number of page-sized cache lines.
    pub cache_lines: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            block_size: 256,
            offset: 0,
            cache_lines: 4,
        }
    }
}

/// A filesystem over one NVM controller.
pub struct FileSystem<N: NvmController> {
    pub(crate) nvm: N,
    pub(crate) cache: BlockCache,
    pub(crate) geo: Geometry,
    pub(crate) last_block_allocated: u16,
    pub(crate) open_files: Vec<file::FileDescriptor>,
}

impl<N: NvmController> FileSystem<N> {
    /// Mounts the filesystem on `nvm`, formatting if no valid filesystem is
    /// found. Equivalent to [`FileSystem::with_config`] with the default
    /// configuration and the given block size.
    pub fn new(nvm: N, block_size: u32) -> Result<Self, FsError> {
        Self::with_config(
            nvm,
            FsConfig {
                block_size,
                ..FsConfig::default()
            },
        )
    }

    /// Mounts the filesystem on `nvm` with explicit parameters, formatting
    /// if no valid filesystem is found.
    pub fn with_config(nvm: N, config: FsConfig) -> Result<Self, FsError> {
        let page_size = nvm.page_size();
        if !config.block_size.is_power_of_two()
            || config.block_size < layout::ENTRY_SIZE
            || config.block_size > page_size
            || nvm.flash_start() % page_size != 0
            || config.offset % page_size != 0
            || config.offset >= nvm.flash_size()
        {
            return Err(FsError::InvalidParameter);
        }

        let fs_size = Self::region_blocks(&nvm, &config);
        let table_size = Geometry::table_blocks(fs_size, config.block_size);
        // Needs the FAT, the root block, and at least one data block.
        if fs_size <= table_size + 1 {
            return Err(FsError::InvalidParameter);
        }

        let geo = Geometry {
            flash_start: nvm.flash_start(),
            flash_end: nvm.flash_end(),
            page_size,
            block_size: config.block_size,
            offset: config.offset,
            fs_size,
            table_size,
        };

        let mut fs = Self {
            cache: BlockCache::new(page_size, config.cache_lines),
            nvm,
            geo,
            last_block_allocated: 0,
            open_files: Vec::new(),
        };

        if fs.load().is_err() {
            info!("no filesystem found, formatting");
            fs.format()?;
        }

        Ok(fs)
    }

    /// Largest block count the managed region can hold, within the chain
    /// link limit.
    fn region_blocks(nvm: &N, config: &FsConfig) -> u16 {
        ((nvm.flash_size() - config.offset) / config.block_size).min(MAX_BLOCKS) as u16
    }

    /// Probes the flash for an existing filesystem.
    ///
    /// A valid filesystem has its first `T` FAT entries all equal to `T`
    /// (where `T` is read from entry 0), and block `T` starting with the
    /// magic directory entry whose length word carries the block count. On
    /// success the geometry is adopted from the flash and the root page is
    /// pinned.
    fn load(&mut self) -> Result<(), FsError> {
        let table_size = self.fat_read(0)?.0;
        let limit = self.geo.fs_size;
        if table_size == 0 || table_size >= limit {
            debug!("load: implausible table size {table_size:#x}");
            return Err(FsError::NoData);
        }

        for block in 0..table_size {
            let entry = self.fat_read(block)?.0;
            if entry >= limit || entry != table_size {
                debug!("load: table corrupted at block {block}");
                return Err(FsError::NoData);
            }
        }

        let root = self.read_dirent(self.geo.logical_of_block(table_size))?;
        if !root.name_eq(MAGIC) {
            debug!("load: bad magic entry");
            return Err(FsError::NoData);
        }

        let fs_size = root.length & !DIRECTORY_LENGTH;
        if fs_size == 0
            || fs_size > limit as u32
            || Geometry::table_blocks(fs_size as u16, self.geo.block_size) != table_size
        {
            debug!("load: implausible size {fs_size:#x} in magic entry");
            return Err(FsError::NoData);
        }

        self.geo.fs_size = fs_size as u16;
        self.geo.table_size = table_size;
        self.cache
            .pin(&mut self.nvm, self.geo.address_of_block(table_size))?;

        info!(
            "mounted: {} blocks of {} bytes, table {} blocks",
            self.geo.fs_size, self.geo.block_size, self.geo.table_size
        );
        Ok(())
    }

    /// Initialises a fresh, empty filesystem over the managed region.
    ///
    /// Pages are erased lazily on first allocation; only the pages holding
    /// the FAT and the root block are erased here. All open handles are
    /// invalidated.
    pub fn format(&mut self) -> Result<(), FsError> {
        let fs_size = ((self.geo.flash_end - self.geo.flash_start - self.geo.offset)
            / self.geo.block_size)
            .min(MAX_BLOCKS) as u16;
        let table_size = Geometry::table_blocks(fs_size, self.geo.block_size);

        info!(
            "formatting: {} blocks of {} bytes, table {} blocks",
            fs_size, self.geo.block_size, table_size
        );

        self.open_files.clear();
        self.cache.clear(&mut self.nvm)?;

        let per_page = self.geo.blocks_per_page() as u16;
        let mut block = 0;
        while block < table_size + 1 {
            let page = self.geo.page_of_block(block);
            self.cache.erase(page);
            self.nvm.erase(page)?;
            block += per_page;
        }

        self.geo.fs_size = fs_size;
        self.geo.table_size = table_size;
        self.last_block_allocated = 0;

        // The FAT's own blocks are marked with the table size, which is
        // also the signature probed on mount.
        for block in 0..table_size {
            self.fat_write(block, FatEntry(table_size))?;
        }
        self.fat_write(table_size, FatEntry::EOF)?;

        let magic = DirectoryEntry::new(
            MAGIC,
            table_size,
            EntryFlags::VALID,
            DIRECTORY_LENGTH | fs_size as u32,
        );
        self.write_dirent(self.geo.root_entry(), &magic)?;
        self.cache
            .pin(&mut self.nvm, self.geo.address_of_block(table_size))?;

        self.sync()
    }

    /// The mounted geometry.
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// The underlying NVM controller.
    pub fn nvm(&self) -> &N {
        &self.nvm
    }

    /// Releases the NVM controller, discarding unflushed state.
    pub fn into_nvm(self) -> N {
        self.nvm
    }

    /// Reads the FAT entry describing `block`. Diagnostic surface; the
    /// on-flash invariants in the crate docs are checkable with this alone.
    pub fn fat_entry(&mut self, block: u16) -> Result<FatEntry, FsError> {
        if block >= self.geo.fs_size {
            return Err(FsError::InvalidParameter);
        }
        self.fat_read(block)
    }

    /// Commits all staged writes to flash.
    pub fn sync(&mut self) -> Result<(), FsError> {
        self.cache.sync(&mut self.nvm)
    }

    /// Asks the NVM controller to re-enumerate on the host side.
    pub fn remount(&mut self) {
        self.nvm.remount();
    }

    /// Reads raw bytes at a region-relative logical address through the
    /// cache. Host patch surface.
    pub fn read_region(&mut self, logical: u32, buf: &mut [u8]) -> Result<(), FsError> {
        self.check_region(logical, buf.len())?;
        self.cache.read(&mut self.nvm, self.geo.to_flash(logical), buf)
    }

    /// Stages raw bytes at a region-relative logical address through the
    /// cache. Host patch surface; the host is responsible for erasing any
    /// page it patches bits up in.
    pub fn write_region(&mut self, logical: u32, buf: &[u8]) -> Result<(), FsError> {
        self.check_region(logical, buf.len())?;
        self.cache.write(&mut self.nvm, self.geo.to_flash(logical), buf)
    }

    /// Drops all cached state and erases the physical page containing the
    /// given region-relative logical address.
    pub fn erase_page_at(&mut self, logical: u32) -> Result<(), FsError> {
        self.check_region(logical, 0)?;
        let address = self.geo.to_flash(logical);
        let page = address - address % self.geo.page_size;
        self.cache.clear(&mut self.nvm)?;
        self.cache.erase(page);
        self.nvm.erase(page)
    }

    fn check_region(&self, logical: u32, len: usize) -> Result<(), FsError> {
        let end = self.geo.to_flash(logical) as u64 + len as u64;
        if end > self.geo.flash_end as u64 {
            return Err(FsError::InvalidParameter);
        }
        Ok(())
    }
}
