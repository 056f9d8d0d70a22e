//! End-to-end filesystem tests over a simulated NOR flash.
//!
//! Geometry used throughout: 64 KiB flash, 1 KiB pages, 128-byte blocks,
//! so 512 logical blocks of which 8 hold the FAT and block 8 is the root
//! directory.
use flashfs::{
    DirectoryEntry, FatEntry, FileSystem, FsConfig, FsError, OpenFlags, RamNvm, Whence,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

const FLASH_SIZE: u32 = 64 * 1024;
const PAGE_SIZE: u32 = 1024;
const BLOCK_SIZE: u32 = 128;
const ENTRY_SIZE: u32 = 24;

fn new_fs() -> FileSystem<RamNvm> {
    mount(RamNvm::new(FLASH_SIZE, PAGE_SIZE))
}

fn mount(nvm: RamNvm) -> FileSystem<RamNvm> {
    FileSystem::with_config(
        nvm,
        FsConfig {
            block_size: BLOCK_SIZE,
            offset: 0,
            cache_lines: 4,
        },
    )
    .unwrap()
}

fn write_file(fs: &mut FileSystem<RamNvm>, path: &str, data: &[u8]) {
    let fd = fs.open(path, OpenFlags::WRITE | OpenFlags::CREAT).unwrap();
    assert_eq!(fs.write(fd, data).unwrap(), data.len());
    fs.close(fd).unwrap();
}

fn read_file(fs: &mut FileSystem<RamNvm>, path: &str) -> Vec<u8> {
    let fd = fs.open(path, OpenFlags::READ).unwrap();
    let length = fs.seek(fd, 0, Whence::End).unwrap();
    fs.seek(fd, 0, Whence::Set).unwrap();
    let mut data = vec![0u8; length as usize];
    if !data.is_empty() {
        assert_eq!(fs.read(fd, &mut data).unwrap(), data.len());
    }
    fs.close(fd).unwrap();
    data
}

/// All VALID directory entries reachable from the root, paired with their
/// depth-first path names.
fn walk_tree(fs: &mut FileSystem<RamNvm>) -> Vec<(String, DirectoryEntry)> {
    fn walk(
        fs: &mut FileSystem<RamNvm>,
        first_block: u16,
        prefix: &str,
        out: &mut Vec<(String, DirectoryEntry)>,
    ) {
        let geo = *fs.geometry();
        let mut block = first_block;
        loop {
            let mut raw = vec![0u8; BLOCK_SIZE as usize];
            fs.read_region(geo.logical_of_block(block), &mut raw).unwrap();
            for slot in raw.chunks_exact(ENTRY_SIZE as usize) {
                let entry = DirectoryEntry::decode(slot.try_into().unwrap());
                if !entry.is_valid() || entry.first_block == first_block {
                    continue;
                }
                let name = entry
                    .file_name
                    .iter()
                    .take_while(|&&b| b != 0)
                    .map(|&b| b as char)
                    .collect::<String>();
                let path = format!("{prefix}/{name}");
                if entry.is_directory() {
                    walk(fs, entry.first_block, &path, out);
                }
                out.push((path, entry));
            }
            match fs.fat_entry(block).unwrap().next_link() {
                Some(next) => block = next,
                None => break,
            }
        }
    }

    let root = fs.geometry().table_size;
    let mut out = Vec::new();
    walk(fs, root, "", &mut out);
    out
}

/// The set of blocks reachable by following a chain from `first`, asserting
/// the chain is well formed (terminates at EOF, no UNUSED/DELETED hops, no
/// cycles).
fn chain_blocks(fs: &mut FileSystem<RamNvm>, first: u16) -> Vec<u16> {
    let fs_size = fs.geometry().fs_size;
    let mut blocks = Vec::new();
    let mut block = first;
    loop {
        assert!(blocks.len() <= fs_size as usize, "chain does not terminate");
        assert!(!blocks.contains(&block), "chain cycles through {block}");
        blocks.push(block);
        let entry = fs.fat_entry(block).unwrap();
        assert!(!entry.is_unused() && !entry.is_deleted(), "chain crosses a free block");
        match entry.next_link() {
            Some(next) => block = next,
            None => {
                assert!(entry.is_eof());
                break;
            }
        }
    }
    blocks
}

/// Checks that every chain reachable from a VALID entry is well formed and
/// that no two chains share a block. Returns the per-block owner counts.
fn check_chains(fs: &mut FileSystem<RamNvm>) -> Vec<u32> {
    let geo = *fs.geometry();
    let mut owners = vec![0u32; geo.fs_size as usize];

    for block in chain_blocks(fs, geo.table_size) {
        owners[block as usize] += 1;
    }
    let entries = walk_tree(fs);
    for (path, entry) in &entries {
        for block in chain_blocks(fs, entry.first_block) {
            assert!(
                owners[block as usize] == 0,
                "block {block} shared by {path} and another chain"
            );
            owners[block as usize] += 1;
        }
    }
    owners
}

/// Checks the block accounting invariant: every data block is reachable
/// from exactly one VALID entry, DELETED, or UNUSED.
fn check_accounting(fs: &mut FileSystem<RamNvm>) {
    let geo = *fs.geometry();
    let owners = check_chains(fs);

    for block in geo.table_size..geo.fs_size {
        let entry = fs.fat_entry(block).unwrap();
        let owned = owners[block as usize] > 0;
        let free = entry.is_unused() || entry.is_deleted();
        assert!(
            owned != free,
            "block {block} is {entry:?} but has {} owners",
            owners[block as usize]
        );
    }
}

#[test]
fn create_then_read_back() {
    let mut fs = new_fs();
    write_file(&mut fs, "/a.txt", b"hello");

    let fd = fs.open("/a.txt", OpenFlags::READ).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    // Subsequent reads hit end of file.
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 0);
    fs.close(fd).unwrap();
}

#[test]
fn append_after_close() {
    let mut fs = new_fs();
    write_file(&mut fs, "/a.txt", b"hello");

    let fd = fs.open("/a.txt", OpenFlags::WRITE | OpenFlags::APPEND).unwrap();
    assert_eq!(fs.write(fd, b" world").unwrap(), 6);
    fs.close(fd).unwrap();

    assert_eq!(read_file(&mut fs, "/a.txt"), b"hello world");

    let fd = fs.open("/a.txt", OpenFlags::READ).unwrap();
    assert_eq!(fs.seek(fd, 0, Whence::End).unwrap(), 11);
    fs.close(fd).unwrap();
}

#[test]
fn cross_block_write_builds_a_chain() {
    let mut fs = new_fs();
    let pattern: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();
    write_file(&mut fs, "/big.bin", &pattern);

    assert_eq!(read_file(&mut fs, "/big.bin"), pattern);

    let entries = walk_tree(&mut fs);
    let (_, entry) = entries.iter().find(|(path, _)| path == "/big.bin").unwrap();
    assert_eq!(entry.length, 300);
    assert_eq!(chain_blocks(&mut fs, entry.first_block).len(), 3);
    check_accounting(&mut fs);
}

#[test]
fn overwrite_in_place_follows_the_chain() {
    let mut fs = new_fs();
    let pattern = vec![0xaau8; 3 * BLOCK_SIZE as usize];
    write_file(&mut fs, "/f", &pattern);

    // Overwrite the middle of the file; the chain must not grow.
    let fd = fs.open("/f", OpenFlags::WRITE).unwrap();
    fs.seek(fd, BLOCK_SIZE as i32, Whence::Set).unwrap();
    assert_eq!(fs.write(fd, &[0u8; 64]).unwrap(), 64);
    fs.close(fd).unwrap();

    let entries = walk_tree(&mut fs);
    let (_, entry) = entries.iter().find(|(path, _)| path == "/f").unwrap();
    assert_eq!(entry.length, 3 * BLOCK_SIZE);
    assert_eq!(chain_blocks(&mut fs, entry.first_block).len(), 3);

    let data = read_file(&mut fs, "/f");
    assert_eq!(&data[..BLOCK_SIZE as usize], &pattern[..BLOCK_SIZE as usize]);
    assert_eq!(&data[BLOCK_SIZE as usize..BLOCK_SIZE as usize + 64], &[0u8; 64]);
}

#[test]
fn delete_reclaims_space() {
    let mut fs = new_fs();

    // Fill the filesystem with one-block files until it refuses another.
    let mut names = Vec::new();
    for i in 0..1000 {
        let name = format!("/f{i}");
        let fd = match fs.open(&name, OpenFlags::WRITE | OpenFlags::CREAT) {
            Ok(fd) => fd,
            Err(FsError::NoResources) => break,
            Err(e) => panic!("unexpected error {e:?}"),
        };
        if fs.write(fd, &[i as u8; 64]).unwrap() < 64 {
            fs.close(fd).unwrap();
            break;
        }
        fs.close(fd).unwrap();
        names.push(name);
    }
    assert!(names.len() > 100, "fill only created {} files", names.len());

    // Delete every other file, then a two-block write must succeed by
    // recycling the deleted blocks.
    for name in names.iter().step_by(2) {
        fs.remove(name).unwrap();
    }

    let pattern = vec![0x5au8; 2 * BLOCK_SIZE as usize];
    write_file(&mut fs, "/fresh", &pattern);
    assert_eq!(read_file(&mut fs, "/fresh"), pattern);
    check_accounting(&mut fs);

    // Survivors are intact.
    assert_eq!(read_file(&mut fs, &names[1]), vec![1u8; 64]);
}

#[test]
fn nested_directories() {
    let mut fs = new_fs();
    fs.mkdir("/a").unwrap();
    fs.mkdir("/a/b").unwrap();

    write_file(&mut fs, "/a/b/x", b"deep");
    assert_eq!(read_file(&mut fs, "/a/b/x"), b"deep");

    assert_eq!(
        fs.open("/a//b/x", OpenFlags::READ),
        Err(FsError::InvalidParameter)
    );
    assert_eq!(fs.mkdir("/a"), Err(FsError::InvalidParameter));
    assert_eq!(
        fs.open("/a/missing/x", OpenFlags::READ),
        Err(FsError::InvalidParameter)
    );
    check_accounting(&mut fs);
}

#[test]
fn open_root_directory() {
    let mut fs = new_fs();
    let fd = fs.open("/", OpenFlags::READ).unwrap();
    // The root's first entry is its own magic entry.
    let mut raw = [0u8; ENTRY_SIZE as usize];
    assert_eq!(fs.read(fd, &mut raw).unwrap(), raw.len());
    let entry = DirectoryEntry::decode(&raw);
    assert!(entry.is_valid());
    assert_eq!(entry.first_block, fs.geometry().table_size);
    fs.close(fd).unwrap();

    // The root cannot be opened twice.
    let first = fs.open("/", OpenFlags::READ).unwrap();
    assert_eq!(fs.open("/", OpenFlags::READ), Err(FsError::NotSupported));
    fs.close(first).unwrap();
}

#[test]
fn double_open_is_rejected() {
    let mut fs = new_fs();
    write_file(&mut fs, "/f", b"x");
    let fd = fs.open("/f", OpenFlags::READ).unwrap();
    assert_eq!(fs.open("/f", OpenFlags::WRITE), Err(FsError::NotSupported));
    fs.close(fd).unwrap();
    let fd = fs.open("/f", OpenFlags::WRITE).unwrap();
    fs.close(fd).unwrap();
}

#[test]
fn seek_bounds() {
    let mut fs = new_fs();
    write_file(&mut fs, "/f", b"0123456789");
    let fd = fs.open("/f", OpenFlags::READ).unwrap();

    assert_eq!(fs.seek(fd, -3, Whence::End).unwrap(), 7);
    let mut buf = [0u8; 3];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"789");

    assert_eq!(fs.seek(fd, -1, Whence::Set), Err(FsError::InvalidParameter));
    assert_eq!(fs.seek(fd, 11, Whence::Set), Err(FsError::InvalidParameter));
    assert_eq!(fs.seek(fd, 1, Whence::End), Err(FsError::InvalidParameter));
    fs.close(fd).unwrap();
}

#[test]
fn format_is_idempotent() {
    let mut fs = new_fs();
    write_file(&mut fs, "/junk", &[9u8; 200]);

    fs.format().unwrap();
    fs.sync().unwrap();
    let first: Vec<u8> = fs.nvm().data().to_vec();

    fs.format().unwrap();
    fs.sync().unwrap();
    assert_eq!(fs.nvm().data(), &first[..]);

    // A formatted image mounts back cleanly with no files.
    let mut fs = mount(fs.into_nvm());
    assert!(walk_tree(&mut fs).is_empty());
}

#[test]
fn remount_preserves_files() {
    let mut fs = new_fs();
    fs.mkdir("/dir").unwrap();
    write_file(&mut fs, "/dir/f", b"persistent");
    write_file(&mut fs, "/top", &[3u8; 400]);

    let mut fs = mount(fs.into_nvm());
    assert_eq!(read_file(&mut fs, "/dir/f"), b"persistent");
    assert_eq!(read_file(&mut fs, "/top"), vec![3u8; 400]);
    check_accounting(&mut fs);
}

#[test]
fn new_file_without_close_is_not_visible_after_remount() {
    let mut fs = new_fs();
    write_file(&mut fs, "/kept", b"kept");

    let fd = fs.open("/lost", OpenFlags::WRITE | OpenFlags::CREAT).unwrap();
    fs.write(fd, b"never closed").unwrap();
    // No close, no sync: the entry stays NEW in the cache.

    let mut fs = mount(fs.into_nvm());
    assert_eq!(read_file(&mut fs, "/kept"), b"kept");
    assert_eq!(fs.open("/lost", OpenFlags::READ), Err(FsError::InvalidParameter));
}

#[test]
fn wear_is_spread_round_robin() {
    let mut fs = new_fs();
    let geo = *fs.geometry();
    let cycles = 200u32;

    // Track how often each block gets allocated across create/delete
    // cycles by diffing the FAT around each create.
    let mut allocations: BTreeMap<u16, u32> = BTreeMap::new();
    let mut before: Vec<FatEntry> = Vec::new();
    for cycle in 0..cycles {
        before.clear();
        for block in 0..geo.fs_size {
            before.push(fs.fat_entry(block).unwrap());
        }

        let name = format!("/wear{}", cycle % 7);
        write_file(&mut fs, &name, b"w");
        for block in 0..geo.fs_size {
            let now = fs.fat_entry(block).unwrap();
            if now != before[block as usize] && !now.is_deleted() && !now.is_unused() {
                *allocations.entry(block).or_default() += 1;
            }
        }
        fs.remove(&name).unwrap();
    }

    let bound =
        (cycles * geo.blocks_per_page()).div_ceil(geo.fs_size as u32) + 1;
    for (block, count) in allocations {
        assert!(
            count <= bound,
            "block {block} allocated {count} times, bound {bound}"
        );
    }
}

#[test]
fn random_operations_keep_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut fs = new_fs();
    let mut shadow: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for round in 0..400 {
        let name = format!("/r{}", rng.gen_range(0..12));
        if shadow.contains_key(&name) && rng.gen_bool(0.4) {
            fs.remove(&name).unwrap();
            shadow.remove(&name);
        } else if !shadow.contains_key(&name) {
            let len = rng.gen_range(0..400);
            let data: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            let fd = match fs.open(&name, OpenFlags::WRITE | OpenFlags::CREAT) {
                Ok(fd) => fd,
                Err(FsError::NoResources) => continue,
                Err(e) => panic!("unexpected error {e:?}"),
            };
            if !data.is_empty() && fs.write(fd, &data).unwrap() < data.len() {
                // Out of space mid-write; drop the file again.
                fs.close(fd).unwrap();
                fs.remove(&name).unwrap();
                continue;
            }
            fs.close(fd).unwrap();
            shadow.insert(name, data);
        }

        if round % 50 == 0 {
            check_accounting(&mut fs);
        }
    }

    for (name, data) in &shadow {
        assert_eq!(&read_file(&mut fs, name), data, "{name} diverged");
    }
    check_accounting(&mut fs);

    // And everything survives a remount.
    fs.sync().unwrap();
    let mut fs = mount(fs.into_nvm());
    for (name, data) in &shadow {
        assert_eq!(&read_file(&mut fs, name), data, "{name} lost at remount");
    }
}

#[test]
fn power_cut_leaves_old_or_new_state() {
    // Cut power (drop every NVM program/erase) after each possible prefix
    // length and check the flash always mounts to a sane state with the
    // earlier file intact.
    for budget in 0..12 {
        let mut fs = new_fs();
        write_file(&mut fs, "/keep", b"precious");
        fs.sync().unwrap();

        let mut nvm = fs.into_nvm();
        let remaining = Rc::new(Cell::new(budget));
        let counter = remaining.clone();
        nvm.set_hook(Some(Box::new(move |_, _, _| {
            if counter.get() == 0 {
                return Err(FsError::NoData);
            }
            counter.set(counter.get() - 1);
            Ok(())
        })));

        let mut fs = mount(nvm);
        let update = (|| -> Result<(), FsError> {
            let fd = fs.open("/update", OpenFlags::WRITE | OpenFlags::CREAT)?;
            fs.write(fd, &[0x42u8; 200])?;
            fs.close(fd)
        })();

        let mut nvm = fs.into_nvm();
        nvm.set_hook(None);
        let mut fs = mount(nvm);

        assert_eq!(read_file(&mut fs, "/keep"), b"precious");
        // A cut mid-flush may leak a block, but never a cycle, a shared
        // block, or a VALID entry over an unwritten chain.
        check_chains(&mut fs);

        if update.is_ok() {
            assert_eq!(read_file(&mut fs, "/update"), vec![0x42u8; 200]);
        }
    }
}
