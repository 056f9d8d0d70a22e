//! Write-back block cache.
//!
//! All filesystem access to flash goes through this cache. It holds a small
//! number of page-sized lines keyed by page base address. Reads load pages
//! on demand; writes stage bytes into the cached page and mark the line
//! dirty. Dirty lines are written back as one word-aligned program of the
//! whole page when they are evicted or synced.
//!
//! A line can be pinned, which exempts it from eviction; the root directory
//! page is pinned for the lifetime of a mounted filesystem. Eviction picks
//! the least recently used unpinned line.
//!
//! The cache does not police the NOR monotonic-clear rule. Callers must
//! only stage writes that clear bits, or erase the page first; a violation
//! surfaces as an assertion in [`RamNvm`](crate::nvm::RamNvm)-backed tests.
use crate::FsError;
use crate::nvm::NvmController;
use alloc::{vec, vec::Vec};

struct CacheLine {
    page: u32,
    data: Vec<u8>,
    dirty: bool,
    pinned: bool,
    stamp: u64,
}

/// A cache of page-sized flash windows.
pub struct BlockCache {
    page_size: u32,
    capacity: usize,
    lines: Vec<CacheLine>,
    tick: u64,
}

impl BlockCache {
    /// Creates a cache of `capacity` lines of `page_size` bytes each.
    pub fn new(page_size: u32, capacity: usize) -> Self {
        assert!(capacity >= 2, "need one evictable line besides the pinned root");
        Self {
            page_size,
            capacity,
            lines: Vec::new(),
            tick: 0,
        }
    }

    fn page_base(&self, address: u32) -> u32 {
        address - address % self.page_size
    }

    fn find(&self, page: u32) -> Option<usize> {
        self.lines.iter().position(|line| line.page == page)
    }

    fn flush_line<N: NvmController>(nvm: &mut N, line: &mut CacheLine) -> Result<(), FsError> {
        if line.dirty {
            nvm.write(line.page, &line.data)?;
            line.dirty = false;
        }
        Ok(())
    }

    /// Returns the index of a line holding `page`, loading it on demand.
    /// May evict (and flush) the least recently used unpinned line.
    fn load<N: NvmController>(&mut self, nvm: &mut N, page: u32) -> Result<usize, FsError> {
        self.tick += 1;
        if let Some(index) = self.find(page) {
            self.lines[index].stamp = self.tick;
            return Ok(index);
        }

        let index = if self.lines.len() < self.capacity {
            self.lines.push(CacheLine {
                page,
                data: vec![0; self.page_size as usize],
                dirty: false,
                pinned: false,
                stamp: self.tick,
            });
            self.lines.len() - 1
        } else {
            let victim = self
                .lines
                .iter()
                .enumerate()
                .filter(|(_, line)| !line.pinned)
                .min_by_key(|(_, line)| line.stamp)
                .map(|(index, _)| index)
                .ok_or(FsError::NoResources)?;
            Self::flush_line(nvm, &mut self.lines[victim])?;
            victim
        };

        let line = &mut self.lines[index];
        line.page = page;
        line.dirty = false;
        line.pinned = false;
        line.stamp = self.tick;
        nvm.read(page, &mut line.data)?;
        Ok(index)
    }

    /// Copies `dst.len()` bytes from `address`, loading pages on demand.
    pub fn read<N: NvmController>(
        &mut self,
        nvm: &mut N,
        mut address: u32,
        dst: &mut [u8],
    ) -> Result<(), FsError> {
        let mut copied = 0;
        while copied < dst.len() {
            let page = self.page_base(address);
            let offset = (address - page) as usize;
            let n = core::cmp::min(dst.len() - copied, self.page_size as usize - offset);
            let index = self.load(nvm, page)?;
            dst[copied..copied + n].copy_from_slice(&self.lines[index].data[offset..offset + n]);
            address += n as u32;
            copied += n;
        }
        Ok(())
    }

    /// Stages `src` at `address` and marks the affected lines dirty. No
    /// flash program happens until the lines are flushed.
    pub fn write<N: NvmController>(
        &mut self,
        nvm: &mut N,
        mut address: u32,
        src: &[u8],
    ) -> Result<(), FsError> {
        let mut copied = 0;
        while copied < src.len() {
            let page = self.page_base(address);
            let offset = (address - page) as usize;
            let n = core::cmp::min(src.len() - copied, self.page_size as usize - offset);
            let index = self.load(nvm, page)?;
            let line = &mut self.lines[index];
            line.data[offset..offset + n].copy_from_slice(&src[copied..copied + n]);
            line.dirty = true;
            address += n as u32;
            copied += n;
        }
        Ok(())
    }

    /// Pins the page containing `address` so it is never evicted.
    pub fn pin<N: NvmController>(&mut self, nvm: &mut N, address: u32) -> Result<(), FsError> {
        let page = self.page_base(address);
        let index = self.load(nvm, page)?;
        self.lines[index].pinned = true;
        Ok(())
    }

    /// Forgets the cached copy of the page containing `address` without
    /// writing it back. Used when the page is about to be erased.
    pub fn erase(&mut self, address: u32) {
        let page = self.page_base(address);
        if let Some(index) = self.find(page) {
            self.lines.swap_remove(index);
        }
    }

    /// Replaces the cached copy of `page` with `data`, marking it clean.
    /// Used by the page recycler after it has rewritten the page on flash.
    pub fn update(&mut self, page: u32, data: &[u8]) {
        if let Some(index) = self.find(page) {
            let line = &mut self.lines[index];
            line.data.copy_from_slice(data);
            line.dirty = false;
        }
    }

    /// Flushes every dirty line and drops all unpinned lines.
    pub fn clear<N: NvmController>(&mut self, nvm: &mut N) -> Result<(), FsError> {
        self.sync(nvm)?;
        self.lines.retain(|line| line.pinned);
        Ok(())
    }

    /// Flushes every dirty line, keeping them cached.
    pub fn sync<N: NvmController>(&mut self, nvm: &mut N) -> Result<(), FsError> {
        for line in self.lines.iter_mut() {
            Self::flush_line(nvm, line)?;
        }
        Ok(())
    }
}
