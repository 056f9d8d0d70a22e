//! Open file handles and byte-granular I/O over block chains.
use crate::FsError;
use crate::fs::FileSystem;
use crate::fs::dir::is_valid_path;
use crate::fs::layout::{ENTRY_FLAGS_OFFSET, EntryFlags, FatEntry, OpenFlags, Whence};
use crate::nvm::NvmController;

/// A file handle id, as returned by [`FileSystem::open`].
pub type Fd = usize;

/// Per-open-file state. Lives only in RAM; the flash is referenced through
/// the entry's logical address.
pub(crate) struct FileDescriptor {
    pub id: Fd,
    pub flags: OpenFlags,
    pub seek: u32,
    pub length: u32,
    /// Logical address of this file's directory entry.
    pub dirent: u32,
    /// Logical address of the holding directory's own entry.
    pub directory: u32,
}

impl<N: NvmController> FileSystem<N> {
    fn descriptor_index(&self, fd: Fd) -> Result<usize, FsError> {
        self.open_files
            .iter()
            .position(|file| file.id == fd)
            .ok_or(FsError::InvalidParameter)
    }

    /// Opens `filename`, returning a handle for read/write/seek.
    ///
    /// Without [`OpenFlags::CREAT`] a missing file is
    /// [`FsError::InvalidParameter`]; with it, the file is created. A file
    /// may only be open once at a time ([`FsError::NotSupported`]).
    /// [`OpenFlags::APPEND`] starts the seek position at the end of the
    /// file. Opening `/` yields the root directory's own entry.
    pub fn open(&mut self, filename: &str, flags: OpenFlags) -> Result<Fd, FsError> {
        if !is_valid_path(filename) {
            return Err(FsError::InvalidParameter);
        }

        let directory_address = self
            .resolve_parent(filename)?
            .ok_or(FsError::InvalidParameter)?;

        let found = if filename == "/" {
            // The root directory has no parent; it is its own entry.
            Some(directory_address)
        } else {
            let directory = self.read_dirent(directory_address)?;
            self.lookup(filename, &directory)?
        };

        if let Some(address) = found {
            if self.open_files.iter().any(|file| file.dirent == address) {
                return Err(FsError::NotSupported);
            }
        }

        let dirent_address = match found {
            Some(address) => address,
            None => {
                if !flags.contains(OpenFlags::CREAT) {
                    return Err(FsError::InvalidParameter);
                }
                self.create_file(filename, directory_address, false)?
                    .ok_or(FsError::NoResources)?
            }
        };

        let entry = self.read_dirent(dirent_address)?;
        let length = if entry.flags == EntryFlags::NEW {
            0
        } else {
            entry.length
        };

        let mut id = 0;
        while self.open_files.iter().any(|file| file.id == id) {
            id += 1;
        }

        self.open_files.push(FileDescriptor {
            id,
            flags: flags & !OpenFlags::CREAT,
            seek: if flags.contains(OpenFlags::APPEND) { length } else { 0 },
            length,
            dirent: dirent_address,
            directory: directory_address,
        });

        Ok(id)
    }

    /// Walks the chain from `first_block` to the block containing `seek`,
    /// returning that block and the byte offset of `seek` within it. The
    /// offset may equal the block size when `seek` sits exactly on a block
    /// boundary; the caller crosses into the next block lazily.
    fn seek_block(&mut self, first_block: u16, seek: u32) -> Result<Option<(u16, u32)>, FsError> {
        let block_size = self.geo.block_size;
        let mut block = first_block;
        let mut position = 0;
        let mut hops = 0;
        while seek - position > block_size {
            hops += 1;
            if hops > self.geo.fs_size {
                return Err(FsError::InvalidParameter);
            }
            match self.next_block(block)?.next_link() {
                Some(next) => block = next,
                None => return Ok(None),
            }
            position += block_size;
        }
        Ok(Some((block, seek - position)))
    }

    /// Reads up to `buffer.len()` bytes from the current seek position,
    /// advancing it. Returns the number of bytes read; 0 at end of file.
    pub fn read(&mut self, fd: Fd, buffer: &mut [u8]) -> Result<usize, FsError> {
        if buffer.is_empty() {
            return Err(FsError::InvalidParameter);
        }
        let index = self.descriptor_index(fd)?;
        let (seek, length, dirent) = {
            let file = &self.open_files[index];
            (file.seek, file.length, file.dirent)
        };

        let size = core::cmp::min(buffer.len() as u64, (length - seek) as u64) as usize;
        let entry = self.read_dirent(dirent)?;
        let Some((mut block, mut offset)) = self.seek_block(entry.first_block, seek)? else {
            return Ok(0);
        };

        let block_size = self.geo.block_size;
        let mut copied = 0;
        while copied < size {
            let segment = core::cmp::min(size - copied, (block_size - offset) as usize);
            if segment > 0 {
                let address = self.geo.address_of_block(block) + offset;
                self.cache
                    .read(&mut self.nvm, address, &mut buffer[copied..copied + segment])?;
            }
            copied += segment;
            offset += segment as u32;

            if offset == block_size {
                offset = 0;
                // Reading a directory as a file runs off the chain before
                // the nominal length; stop at the end of the chain.
                match self.next_block(block)?.next_link() {
                    Some(next) => block = next,
                    None => break,
                }
            }
        }

        self.open_files[index].seek += copied as u32;
        Ok(copied)
    }

    /// Writes `buffer` at the current seek position, advancing it and
    /// growing the file's chain as needed. Writes are staged through the
    /// cache; durability comes with [`FileSystem::close`] or
    /// [`FileSystem::sync`]. Returns the number of bytes written, which is
    /// short only when the filesystem runs out of blocks.
    pub fn write(&mut self, fd: Fd, buffer: &[u8]) -> Result<usize, FsError> {
        if buffer.is_empty() {
            return Err(FsError::InvalidParameter);
        }
        let index = self.descriptor_index(fd)?;
        let (seek, length, dirent) = {
            let file = &self.open_files[index];
            (file.seek, file.length, file.dirent)
        };

        let entry = self.read_dirent(dirent)?;
        let Some((mut block, mut offset)) = self.seek_block(entry.first_block, seek)? else {
            return Ok(0);
        };

        let block_size = self.geo.block_size;
        let size = buffer.len();
        let mut copied = 0;
        while copied < size {
            let segment = core::cmp::min(size - copied, (block_size - offset) as usize);
            if segment > 0 {
                let address = self.geo.address_of_block(block) + offset;
                self.cache
                    .write(&mut self.nvm, address, &buffer[copied..copied + segment])?;
            }
            copied += segment;
            offset += segment as u32;

            if offset == block_size && copied < size {
                let next = match self.next_block(block)?.next_link() {
                    // Overwriting within the file: follow the existing
                    // chain.
                    Some(next) => next,
                    None => {
                        // Past the end: splice in a fresh block.
                        let Some(new_block) = self.alloc_free_block()? else {
                            break;
                        };
                        self.fat_write(new_block, FatEntry::EOF)?;
                        self.fat_write(block, FatEntry(new_block))?;
                        new_block
                    }
                };
                block = next;
                offset = 0;
            }
        }

        let file = &mut self.open_files[index];
        file.length = core::cmp::max(length, seek + copied as u32);
        file.seek += copied as u32;
        Ok(copied)
    }

    /// Moves the seek position. The resulting position must stay within
    /// `0..=length`.
    pub fn seek(&mut self, fd: Fd, offset: i32, whence: Whence) -> Result<u32, FsError> {
        let index = self.descriptor_index(fd)?;
        let file = &mut self.open_files[index];

        let position = match whence {
            Whence::Set => offset as i64,
            Whence::Cur => file.seek as i64 + offset as i64,
            Whence::End => file.length as i64 + offset as i64,
        };
        if position < 0 || position > file.length as i64 {
            return Err(FsError::InvalidParameter);
        }

        file.seek = position as u32;
        Ok(file.seek)
    }

    /// Writes the file's length back to its directory entry, leaving the
    /// file open.
    ///
    /// A NEW entry still has its length word unprogrammed, so both the
    /// length and the VALID transition are in-place bit-clearing writes. A
    /// VALID entry cannot be updated in place; the entry is re-homed to a
    /// freshly allocated slot and the old one invalidated.
    pub fn flush(&mut self, fd: Fd) -> Result<(), FsError> {
        let index = self.descriptor_index(fd)?;
        let (length, dirent, directory) = {
            let file = &self.open_files[index];
            (file.length, file.dirent, file.directory)
        };

        let entry = self.read_dirent(dirent)?;
        if entry.length == length {
            return Ok(());
        }

        let mut updated = entry;
        updated.length = length;

        if entry.flags == EntryFlags::NEW {
            updated.flags = EntryFlags::VALID;
            self.write_dirent(dirent, &updated)?;
        } else {
            let new_address = self
                .allocate_entry(directory)?
                .ok_or(FsError::NoResources)?;
            self.write_dirent(new_address, &updated)?;
            self.cache.write(
                &mut self.nvm,
                self.geo.to_flash(dirent + ENTRY_FLAGS_OFFSET),
                &0u16.to_le_bytes(),
            )?;
            self.open_files[index].dirent = new_address;
        }

        Ok(())
    }

    /// Flushes the file and releases its handle. This is the durability
    /// point: all staged writes are committed to flash.
    pub fn close(&mut self, fd: Fd) -> Result<(), FsError> {
        self.flush(fd)?;
        let index = self.descriptor_index(fd)?;
        self.open_files.remove(index);
        self.sync()
    }

    /// Removes `filename`, returning its blocks for reuse.
    ///
    /// The chain's FAT entries and the directory entry are marked DELETED;
    /// nothing is erased here. Reclamation happens lazily the next time the
    /// allocator finds no UNUSED block.
    pub fn remove(&mut self, filename: &str) -> Result<(), FsError> {
        let fd = self.open(filename, OpenFlags::READ)?;
        let index = self.descriptor_index(fd)?;
        let file = self.open_files.remove(index);

        let entry = self.read_dirent(file.dirent)?;
        let mut block = Some(entry.first_block);
        let mut hops = 0;
        while let Some(b) = block {
            hops += 1;
            if hops > self.geo.fs_size {
                return Err(FsError::InvalidParameter);
            }
            let next = self.next_block(b)?;
            self.fat_write(b, FatEntry::DELETED)?;
            block = next.next_link();
        }

        self.cache.write(
            &mut self.nvm,
            self.geo.to_flash(file.dirent + ENTRY_FLAGS_OFFSET),
            &0u16.to_le_bytes(),
        )?;
        self.sync()
    }

    /// Creates a directory at `name`. Fails with
    /// [`FsError::InvalidParameter`] if the name is taken.
    pub fn mkdir(&mut self, name: &str) -> Result<(), FsError> {
        if !is_valid_path(name) || name == "/" {
            return Err(FsError::InvalidParameter);
        }

        let directory_address = self
            .resolve_parent(name)?
            .ok_or(FsError::InvalidParameter)?;
        let directory = self.read_dirent(directory_address)?;
        if self.lookup(name, &directory)?.is_some() {
            return Err(FsError::InvalidParameter);
        }

        self.create_file(name, directory_address, true)?
            .ok_or(FsError::NoResources)?;
        self.sync()
    }
}
