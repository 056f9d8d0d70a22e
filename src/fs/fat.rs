//! File allocation table access, the free-block allocator, and the page
//! recycler.
//!
//! The FAT is a flat array of little-endian u16 entries packed at the start
//! of the managed region, one per logical block. Updating an entry in
//! place is only legal when the new value is a bitwise subset of the old
//! one; every other durable state change is framed as a whole-page rewrite
//! through a RAM scratch buffer ([`FileSystem::recycle_block`]).
use crate::FsError;
use crate::fs::FileSystem;
use crate::fs::layout::{ENTRY_SIZE, EntryFlags, FatEntry};
use crate::nvm::NvmController;
use alloc::vec;
use log::debug;

/// What the block being recycled holds, which decides how its page is
/// filtered during the rewrite.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RecycleKind {
    File,
    Directory,
}

impl<N: NvmController> FileSystem<N> {
    /// Reads the FAT entry for `block` through the cache.
    pub(crate) fn fat_read(&mut self, block: u16) -> Result<FatEntry, FsError> {
        let mut raw = [0u8; 2];
        self.cache
            .read(&mut self.nvm, self.geo.fat_address(block), &mut raw)?;
        Ok(FatEntry(u16::from_le_bytes(raw)))
    }

    /// Stages a FAT entry update. The caller must ensure `value` is a
    /// bitwise subset of the current entry, or have erased the page.
    pub(crate) fn fat_write(&mut self, block: u16, value: FatEntry) -> Result<(), FsError> {
        self.cache
            .write(&mut self.nvm, self.geo.fat_address(block), &value.0.to_le_bytes())
    }

    /// The FAT entry of `block`, i.e. the next block of its chain.
    pub(crate) fn next_block(&mut self, block: u16) -> Result<FatEntry, FsError> {
        self.fat_read(block)
    }

    /// Allocates a free logical block, spreading wear round-robin from the
    /// most recently allocated block.
    ///
    /// Prefers an `UNUSED` block; if the block's whole erase page reads as
    /// unused, the page is erased before first use (pages are erased
    /// lazily, so the bookkeeping may run ahead of the hardware). With no
    /// `UNUSED` block left the FAT is recycled in bulk to turn `DELETED`
    /// blocks back into usable ones.
    ///
    /// Returns `None` when the filesystem is full.
    pub(crate) fn alloc_free_block(&mut self) -> Result<Option<u16>, FsError> {
        let size = self.geo.fs_size;
        let mut deleted = None;

        for i in 0..size.saturating_sub(1) {
            let block = (self.last_block_allocated + 1 + i) % size;
            let entry = self.fat_read(block)?;

            if entry.is_unused() {
                self.last_block_allocated = block;

                // First use of a fully unused page: make sure the hardware
                // page is actually erased.
                let per_page = self.geo.blocks_per_page() as u16;
                let first = block - block % per_page;
                let mut need_erase = true;
                for b in first..(first + per_page).min(size) {
                    if !self.fat_read(b)?.is_unused() {
                        need_erase = false;
                        break;
                    }
                }
                if need_erase {
                    let page = self.geo.page_of_block(block);
                    self.cache.erase(page);
                    self.nvm.erase(page)?;
                }
                return Ok(Some(block));
            }

            if entry.is_deleted() {
                deleted = Some(block);
            }
        }

        if let Some(block) = deleted {
            // Convert DELETED blocks back to UNUSED in bulk rather than one
            // page at a time.
            self.recycle_fat()?;
            self.last_block_allocated = block;
            return Ok(Some(block));
        }

        Ok(None)
    }

    /// Rewrites the erase page holding `block` through a scratch buffer,
    /// dropping reclaimable content.
    ///
    /// Per block of the page: `UNUSED`/`DELETED` blocks are left erased;
    /// the target block of a directory recycle keeps only its VALID
    /// entries; FAT blocks have `DELETED` entries upcycled to `UNUSED`;
    /// everything else is live data and is copied verbatim. The page is
    /// then erased, reprogrammed from the scratch buffer, and the cached
    /// copy refreshed.
    pub(crate) fn recycle_block(&mut self, block: u16, kind: RecycleKind) -> Result<(), FsError> {
        let page = self.geo.page_of_block(block);
        let page_size = self.geo.page_size as usize;
        let block_size = self.geo.block_size as usize;
        let mut scratch = vec![0xffu8; page_size];
        let mut any_live = false;

        debug!("recycling page {:#x} for block {}", page, block);

        let mut b = self.geo.block_of_address(page);
        for slot in scratch.chunks_exact_mut(block_size) {
            if b >= self.geo.fs_size {
                break;
            }
            let entry = self.fat_read(b)?;

            if entry.is_deleted() || entry.is_unused() {
                // Nothing to preserve; the slot stays erased.
            } else if b == block && kind == RecycleKind::Directory {
                any_live = true;
                let mut content = vec![0u8; block_size];
                self.cache
                    .read(&mut self.nvm, self.geo.address_of_block(b), &mut content)?;
                for (src, dst) in content
                    .chunks_exact(ENTRY_SIZE as usize)
                    .zip(slot.chunks_exact_mut(ENTRY_SIZE as usize))
                {
                    let flags =
                        EntryFlags::from_bits_truncate(u16::from_le_bytes([src[18], src[19]]));
                    if flags.is_valid() {
                        dst.copy_from_slice(src);
                    }
                }
            } else if b < self.geo.table_size {
                any_live = true;
                let mut content = vec![0u8; block_size];
                self.cache
                    .read(&mut self.nvm, self.geo.address_of_block(b), &mut content)?;
                for (src, dst) in content.chunks_exact(2).zip(slot.chunks_exact_mut(2)) {
                    if FatEntry(u16::from_le_bytes([src[0], src[1]])) != FatEntry::DELETED {
                        dst.copy_from_slice(src);
                    }
                }
            } else {
                any_live = true;
                self.cache.read(&mut self.nvm, self.geo.address_of_block(b), slot)?;
            }

            b += 1;
        }

        self.nvm.erase(page)?;
        self.nvm.write(page, &scratch)?;

        if any_live {
            self.cache.update(page, &scratch);
        } else {
            self.cache.erase(page);
        }

        Ok(())
    }

    /// Recycles every erase page holding at least one `DELETED` block, then
    /// the FAT pages themselves so their `DELETED` entries become `UNUSED`.
    pub(crate) fn recycle_fat(&mut self) -> Result<(), FsError> {
        let per_page = self.geo.blocks_per_page() as u16;
        let mut page_recycled = false;

        for block in 0..self.geo.fs_size {
            if block % per_page == 0 {
                page_recycled = false;
            }
            if !page_recycled && self.fat_read(block)?.is_deleted() {
                self.recycle_block(block, RecycleKind::File)?;
                page_recycled = true;
            }
        }

        let mut block = 0;
        while block < self.geo.table_size {
            self.recycle_block(block, RecycleKind::File)?;
            block += per_page;
        }

        Ok(())
    }
}
