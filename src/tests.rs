// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::client::{BlockDevice, DiskClient, FsClient, MemBlockDevice};
use crate::consts::{BLOCK_SIZE, DIR_ENTRIES, FAT_EOF, FAT_FREE, FAT_RESERVED};
use crate::disk::{DiskImage, DiskServer, Geometry};
use crate::fs::{DirEntry, FatCache, FsError, FsServer, FsState, Layout, Superblock};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use tempfile::NamedTempFile;

fn start_disk(geometry: Geometry) -> (SocketAddr, NamedTempFile) {
    let backing = NamedTempFile::new().unwrap();
    let server = DiskServer::bind("127.0.0.1:0", geometry, 0, backing.path()).unwrap();
    let addr = server.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    thread::spawn(move || server.run(&stop).unwrap());
    (addr, backing)
}

fn start_fs(disk_addr: SocketAddr) -> SocketAddr {
    let server = FsServer::bind("127.0.0.1:0", disk_addr).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || {
        let stop = AtomicBool::new(false);
        server.run(&stop).unwrap()
    });
    addr
}

fn formatted_mem(total_blocks: u32) -> (FsState, MemBlockDevice) {
    let mut dev = MemBlockDevice::new(total_blocks);
    let mut state = FsState::new();
    state.format(&mut dev).unwrap();
    (state, dev)
}

#[test]
fn geometry_bounds() {
    let geometry = Geometry::new(4, 8).unwrap();
    assert_eq!(geometry.total_blocks(), 32);
    assert_eq!(geometry.capacity_bytes(), 32 * 128);
    assert!(geometry.contains(3, 7));
    assert!(!geometry.contains(4, 0));
    assert!(!geometry.contains(0, 8));
    assert!(!geometry.contains(-1, 0));
    assert_eq!(geometry.split_index(17), (2, 1));
    assert!(Geometry::new(0, 8).is_err());
    assert!(Geometry::new(4, 0).is_err());
}

#[test]
fn layout_computation() {
    let layout = Layout::compute(1024).unwrap();
    assert_eq!(layout.fat_start, 1);
    assert_eq!(layout.fat_sectors, 32);
    assert_eq!(layout.dir_start, 33);
    assert_eq!(layout.dir_sectors, 32);
    assert_eq!(layout.dir_entries, DIR_ENTRIES);
    assert_eq!(layout.data_start(), 65);

    // 34 blocks cannot even hold the metadata tables.
    assert!(Layout::compute(34).is_err());
    // 36 blocks leave exactly one data block.
    assert_eq!(Layout::compute(36).unwrap().data_start(), 35);
}

#[test]
fn superblock_roundtrip() {
    let superblock = Superblock {
        cylinders: 8,
        sectors: 32,
        layout: Layout::compute(256).unwrap(),
    };
    let packed = superblock.pack();
    assert_eq!(Superblock::parse(&packed).unwrap(), superblock);

    let blank = [0u8; BLOCK_SIZE];
    assert!(Superblock::parse(&blank).is_err());
}

#[test]
fn dir_entry_roundtrip() {
    let entry = DirEntry {
        name: "notes.txt".to_string(),
        length: 300,
        first: 65,
        used: true,
    };
    let mut raw = [0u8; 64];
    entry.pack(&mut raw);
    assert_eq!(DirEntry::unpack(&raw), entry);

    let blank = [0u8; 64];
    let unpacked = DirEntry::unpack(&blank);
    assert!(!unpacked.used);
    assert!(unpacked.name.is_empty());
    assert_eq!(unpacked.length, 0);
}

#[test]
fn fat_chain_alloc_and_free() {
    let mut dev = MemBlockDevice::new(100);
    let layout = Layout::compute(100).unwrap();
    let mut fat = FatCache::load(&mut dev, &layout).unwrap();
    let data_start = layout.data_start();
    for index in 0..data_start {
        fat.set(index, FAT_RESERVED);
    }
    let free_before = fat.count_free(data_start);

    let head = fat.alloc_chain(3, data_start).unwrap();
    assert_eq!(head, data_start);
    assert_eq!(fat.get(head), data_start + 1);
    assert_eq!(fat.get(data_start + 1), data_start + 2);
    assert_eq!(fat.get(data_start + 2), FAT_EOF);
    assert_eq!(fat.count_free(data_start), free_before - 3);

    fat.free_chain(head);
    assert_eq!(fat.count_free(data_start), free_before);
    assert_eq!(fat.get(head), FAT_FREE);

    // Asking for more than exists must not touch the table.
    assert!(fat.alloc_chain(free_before + 1, data_start).is_none());
    assert_eq!(fat.count_free(data_start), free_before);

    // The cache survives a flush/reload cycle.
    fat.set(data_start, FAT_EOF);
    fat.flush(&mut dev, &layout).unwrap();
    let reloaded = FatCache::load(&mut dev, &layout).unwrap();
    assert_eq!(reloaded.get(data_start), FAT_EOF);
    assert_eq!(reloaded.get(0), FAT_RESERVED);
}

#[test]
fn format_leaves_empty_filesystem() {
    let (mut state, mut dev) = formatted_mem(256);
    assert!(state.is_formatted());
    assert!(state.list(&mut dev).unwrap().is_empty());

    let usage = state.usage(&mut dev).unwrap();
    assert_eq!(usage.file_count, 0);
    assert_eq!(usage.used_blocks, 0);
    assert_eq!(
        usage.free_blocks,
        usage.total_blocks - usage.reserved_blocks
    );
}

#[test]
fn create_duplicate_and_delete() {
    let (mut state, mut dev) = formatted_mem(256);

    state.create(&mut dev, "foo").unwrap();
    assert!(matches!(
        state.create(&mut dev, "foo"),
        Err(FsError::AlreadyExists)
    ));
    assert!(matches!(
        state.create(&mut dev, ""),
        Err(FsError::InvalidName)
    ));
    assert!(matches!(
        state.create(&mut dev, &"x".repeat(32)),
        Err(FsError::InvalidName)
    ));

    let files = state.list(&mut dev).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "foo");
    assert_eq!(files[0].length, 0);

    state.delete(&mut dev, "foo").unwrap();
    assert!(matches!(
        state.delete(&mut dev, "foo"),
        Err(FsError::NotFound)
    ));
    assert!(state.list(&mut dev).unwrap().is_empty());
}

#[test]
fn directory_fills_up() {
    let (mut state, mut dev) = formatted_mem(256);
    for i in 0..DIR_ENTRIES {
        state.create(&mut dev, &format!("f{i}")).unwrap();
    }
    assert!(matches!(
        state.create(&mut dev, "straw"),
        Err(FsError::DirectoryFull)
    ));
    // Deleting frees the lowest slot for reuse.
    state.delete(&mut dev, "f0").unwrap();
    state.create(&mut dev, "straw").unwrap();
}

#[test]
fn write_and_read_back() {
    let (mut state, mut dev) = formatted_mem(256);
    state.create(&mut dev, "greeting").unwrap();

    state.write(&mut dev, "greeting", b"hello world!").unwrap();
    assert_eq!(state.read(&mut dev, "greeting").unwrap(), b"hello world!");

    // Overwrite with something shorter.
    state.write(&mut dev, "greeting", b"hi").unwrap();
    assert_eq!(state.read(&mut dev, "greeting").unwrap(), b"hi");

    // Truncate to nothing.
    state.write(&mut dev, "greeting", b"").unwrap();
    assert_eq!(state.read(&mut dev, "greeting").unwrap(), b"");
    assert_eq!(state.list(&mut dev).unwrap()[0].length, 0);

    assert!(matches!(
        state.write(&mut dev, "absent", b"data"),
        Err(FsError::NotFound)
    ));
    assert!(matches!(
        state.read(&mut dev, "absent"),
        Err(FsError::NotFound)
    ));
}

#[test]
fn multi_block_chain() {
    let (mut state, mut dev) = formatted_mem(256);
    state.create(&mut dev, "big").unwrap();

    let data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
    state.write(&mut dev, "big", &data).unwrap();
    assert_eq!(state.read(&mut dev, "big").unwrap(), data);

    // 300 bytes occupy exactly three linked blocks.
    let usage = state.usage(&mut dev).unwrap();
    assert_eq!(usage.used_blocks, 3);

    state.delete(&mut dev, "big").unwrap();
    let usage = state.usage(&mut dev).unwrap();
    assert_eq!(usage.used_blocks, 0);
}

#[test]
fn out_of_space_leaves_file_truncated() {
    // 36 blocks leave a single data block.
    let (mut state, mut dev) = formatted_mem(36);
    state.create(&mut dev, "f").unwrap();

    state.write(&mut dev, "f", &[7u8; 100]).unwrap();
    assert!(matches!(
        state.write(&mut dev, "f", &[9u8; 200]),
        Err(FsError::NoSpace)
    ));

    // The old chain was freed and the entry truncated before the error.
    assert_eq!(state.read(&mut dev, "f").unwrap(), b"");
    let usage = state.usage(&mut dev).unwrap();
    assert_eq!(usage.used_blocks, 0);
    assert_eq!(usage.free_blocks, 1);

    // The freed block is usable again.
    state.write(&mut dev, "f", &[1u8; 128]).unwrap();
    assert_eq!(state.read(&mut dev, "f").unwrap(), vec![1u8; 128]);
}

#[test]
fn adoption_picks_up_existing_filesystem() {
    let mut dev = MemBlockDevice::new(256);
    let mut state = FsState::new();
    assert!(!state.try_adopt(&mut dev).unwrap());
    assert!(matches!(
        state.create(&mut dev, "foo"),
        Err(FsError::NotFormatted)
    ));
    assert!(matches!(state.read(&mut dev, "foo"), Err(FsError::NotFormatted)));

    state.format(&mut dev).unwrap();
    state.create(&mut dev, "keep").unwrap();
    state.write(&mut dev, "keep", b"payload").unwrap();

    // A fresh service instance over the same blocks adopts the layout.
    let mut adopted = FsState::new();
    assert!(adopted.try_adopt(&mut dev).unwrap());
    assert_eq!(adopted.read(&mut dev, "keep").unwrap(), b"payload");
    let files = adopted.list(&mut dev).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "keep");
    assert_eq!(files[0].length, 7);
}

#[test]
fn disk_image_persists_sectors() {
    let backing = NamedTempFile::new().unwrap();
    let geometry = Geometry::new(4, 4).unwrap();

    {
        let mut image = DiskImage::open(backing.path(), geometry).unwrap();
        let mut block = [0u8; BLOCK_SIZE];
        block[..5].copy_from_slice(b"HELLO");
        image.write_sector(2, 3, &block);
        assert_eq!(image.read_sector(2, 3), block);
        image.flush().unwrap();
    }

    let on_disk = std::fs::metadata(backing.path()).unwrap().len();
    assert_eq!(on_disk, geometry.capacity_bytes());

    let image = DiskImage::open(backing.path(), geometry).unwrap();
    assert_eq!(&image.read_sector(2, 3)[..5], b"HELLO");
    assert_eq!(image.read_sector(0, 0), [0u8; BLOCK_SIZE]);
}

#[test]
fn disk_protocol_roundtrip() {
    let (addr, _backing) = start_disk(Geometry::new(4, 4).unwrap());
    let mut stream = TcpStream::connect(addr).unwrap();

    stream.write_all(b"I\n").unwrap();
    let mut geom = [0u8; 4];
    stream.read_exact(&mut geom).unwrap();
    assert_eq!(&geom, b"4 4\n");

    stream.write_all(b"W 0 0 5\nHELLO").unwrap();
    let mut status = [0u8; 1];
    stream.read_exact(&mut status).unwrap();
    assert_eq!(status[0], b'1');

    stream.write_all(b"R 0 0\n").unwrap();
    stream.read_exact(&mut status).unwrap();
    assert_eq!(status[0], b'1');
    let mut block = [0u8; BLOCK_SIZE];
    stream.read_exact(&mut block).unwrap();
    assert_eq!(&block[..5], b"HELLO");
    assert!(block[5..].iter().all(|&b| b == 0));

    // Out-of-range cylinder: one status byte, no payload.
    stream.write_all(b"R 4 0\n").unwrap();
    stream.read_exact(&mut status).unwrap();
    assert_eq!(status[0], b'0');

    // Invalid coordinates on W still consume the payload, so the stream
    // stays usable.
    stream.write_all(b"W 9 9 3\nabc").unwrap();
    stream.read_exact(&mut status).unwrap();
    assert_eq!(status[0], b'0');
    stream.write_all(b"I\n").unwrap();
    stream.read_exact(&mut geom).unwrap();
    assert_eq!(&geom, b"4 4\n");

    // An unframeable length gets '0' and the connection is dropped.
    stream.write_all(b"W 0 0 200\n").unwrap();
    stream.read_exact(&mut status).unwrap();
    assert_eq!(status[0], b'0');
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).unwrap(), 0);
}

#[test]
fn disk_client_blocks() {
    let (addr, _backing) = start_disk(Geometry::new(4, 8).unwrap());
    let mut client = DiskClient::connect(addr).unwrap();
    assert_eq!(client.geometry(), Geometry::new(4, 8).unwrap());
    assert_eq!(client.total_blocks(), 32);

    let mut block = [0u8; BLOCK_SIZE];
    block[..3].copy_from_slice(b"xyz");
    client.write_block(17, &block).unwrap();
    assert_eq!(client.read_block(17).unwrap(), block);
    assert_eq!(client.read_block(16).unwrap(), [0u8; BLOCK_SIZE]);
}

#[test]
fn fs_end_to_end() {
    let (disk_addr, _backing) = start_disk(Geometry::new(8, 32).unwrap());
    let fs_addr = start_fs(disk_addr);
    let mut client = FsClient::connect(fs_addr).unwrap();

    assert_eq!(client.format().unwrap(), 0);
    assert_eq!(client.create("foo").unwrap(), 0);
    assert_eq!(client.create("foo").unwrap(), 1);
    assert_eq!(client.list(false).unwrap(), vec!["foo".to_string()]);
    assert_eq!(client.list(true).unwrap(), vec!["foo 0".to_string()]);

    assert_eq!(client.write("foo", b"hello world!").unwrap(), 0);
    assert_eq!(client.read("foo").unwrap(), (0, b"hello world!".to_vec()));
    assert_eq!(client.list(true).unwrap(), vec!["foo 12".to_string()]);

    assert_eq!(client.delete("foo").unwrap(), 0);
    assert_eq!(client.read("foo").unwrap(), (1, Vec::new()));
    assert_eq!(client.delete("foo").unwrap(), 1);
    assert_eq!(client.write("foo", b"gone").unwrap(), 1);

    // Multi-block file through the whole stack.
    let data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
    assert_eq!(client.create("big").unwrap(), 0);
    assert_eq!(client.write("big", &data).unwrap(), 0);
    assert_eq!(client.read("big").unwrap(), (0, data.clone()));

    // A second filesystem service over the same disk adopts the state
    // a restart would find.
    let fs2_addr = start_fs(disk_addr);
    let mut client2 = FsClient::connect(fs2_addr).unwrap();
    assert_eq!(client2.list(true).unwrap(), vec!["big 300".to_string()]);
    assert_eq!(client2.read("big").unwrap(), (0, data));
}

#[test]
fn fs_unformatted_replies() {
    let (disk_addr, _backing) = start_disk(Geometry::new(8, 32).unwrap());
    let fs_addr = start_fs(disk_addr);
    let mut client = FsClient::connect(fs_addr).unwrap();

    assert_eq!(client.list(false).unwrap(), vec!["(unformatted)".to_string()]);
    assert_eq!(client.create("foo").unwrap(), 2);
    assert_eq!(client.delete("foo").unwrap(), 2);
    assert_eq!(client.write("foo", b"x").unwrap(), 2);
    assert_eq!(client.read("foo").unwrap(), (1, Vec::new()));
}

#[test]
fn fs_concurrent_creates() {
    let (disk_addr, _backing) = start_disk(Geometry::new(8, 32).unwrap());
    let fs_addr = start_fs(disk_addr);

    let mut first = FsClient::connect(fs_addr).unwrap();
    assert_eq!(first.format().unwrap(), 0);

    let mut handles = Vec::new();
    for worker in 0..4 {
        handles.push(thread::spawn(move || {
            let mut client = FsClient::connect(fs_addr).unwrap();
            for i in 0..4 {
                assert_eq!(client.create(&format!("w{worker}-{i}")).unwrap(), 0);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut names = first.list(false).unwrap();
    names.sort();
    assert_eq!(names.len(), 16);
    for worker in 0..4 {
        for i in 0..4 {
            assert!(names.contains(&format!("w{worker}-{i}")));
        }
    }
}
