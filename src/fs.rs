// SPDX-License-Identifier: MIT OR Apache-2.0

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, BufReader, Error, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::client::{BlockDevice, DiskClient};
use crate::consts::*;
use crate::wire::{read_line, read_payload, read_u32, read_u64, write_u32, write_u64};

// === Errors ===

#[derive(Debug)]
pub enum FsError {
    NotFormatted,
    NotFound,
    AlreadyExists,
    InvalidName,
    DirectoryFull,
    NoSpace,
    Io(io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFormatted => write!(f, "filesystem is not formatted"),
            FsError::NotFound => write!(f, "no such file"),
            FsError::AlreadyExists => write!(f, "file already exists"),
            FsError::InvalidName => write!(f, "invalid file name"),
            FsError::DirectoryFull => write!(f, "directory is full"),
            FsError::NoSpace => write!(f, "no free blocks"),
            FsError::Io(err) => write!(f, "disk error: {err}"),
        }
    }
}

impl std::error::Error for FsError {}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        FsError::Io(err)
    }
}

// === Layout ===

/// Where the metadata tables live, computed from the block count alone:
/// superblock at sector 0, FAT from sector 1, a fixed 64-entry directory
/// right after it, data area after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub total_blocks: u32,
    pub fat_start: u32,
    pub fat_sectors: u32,
    pub dir_start: u32,
    pub dir_sectors: u32,
    pub dir_entries: u32,
}

impl Layout {
    pub fn compute(total_blocks: u32) -> io::Result<Self> {
        let fat_bytes = total_blocks as u64 * 4;
        let fat_sectors = fat_bytes.div_ceil(BLOCK_SIZE as u64) as u32;
        let layout = Self {
            total_blocks,
            fat_start: FAT_START_SECTOR,
            fat_sectors,
            dir_start: FAT_START_SECTOR + fat_sectors,
            dir_sectors: DIR_SECTORS,
            dir_entries: DIR_ENTRIES,
        };
        if total_blocks <= layout.data_start() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("{total_blocks} blocks leave no room for data"),
            ));
        }
        Ok(layout)
    }

    /// First block usable for file data.
    pub fn data_start(&self) -> u32 {
        self.dir_start + self.dir_sectors
    }

    /// Sector and in-sector byte offset of a directory slot.
    fn dir_slot_location(&self, slot: u32) -> (u32, usize) {
        let sector = self.dir_start + slot / DIR_ENTRIES_PER_SECTOR as u32;
        let offset = (slot as usize % DIR_ENTRIES_PER_SECTOR) * DIR_ENTRY_SIZE;
        (sector, offset)
    }
}

// === Superblock ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub cylinders: u64,
    pub sectors: u64,
    pub layout: Layout,
}

impl Superblock {
    pub fn pack(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..SUPERBLOCK_MAGIC.len()].copy_from_slice(SUPERBLOCK_MAGIC);
        write_u64(&mut block, SUPER_CYLINDERS_OFFSET, self.cylinders);
        write_u64(&mut block, SUPER_SECTORS_OFFSET, self.sectors);
        write_u32(&mut block, SUPER_TOTAL_BLOCKS_OFFSET, self.layout.total_blocks);
        write_u32(&mut block, SUPER_FAT_START_OFFSET, self.layout.fat_start);
        write_u32(&mut block, SUPER_FAT_SECTORS_OFFSET, self.layout.fat_sectors);
        write_u32(&mut block, SUPER_DIR_START_OFFSET, self.layout.dir_start);
        write_u32(&mut block, SUPER_DIR_SECTORS_OFFSET, self.layout.dir_sectors);
        write_u32(&mut block, SUPER_DIR_ENTRIES_OFFSET, self.layout.dir_entries);
        block
    }

    pub fn parse(block: &[u8; BLOCK_SIZE]) -> io::Result<Self> {
        if &block[..SUPERBLOCK_MAGIC.len()] != SUPERBLOCK_MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "missing filesystem magic"));
        }
        Ok(Self {
            cylinders: read_u64(block, SUPER_CYLINDERS_OFFSET),
            sectors: read_u64(block, SUPER_SECTORS_OFFSET),
            layout: Layout {
                total_blocks: read_u32(block, SUPER_TOTAL_BLOCKS_OFFSET),
                fat_start: read_u32(block, SUPER_FAT_START_OFFSET),
                fat_sectors: read_u32(block, SUPER_FAT_SECTORS_OFFSET),
                dir_start: read_u32(block, SUPER_DIR_START_OFFSET),
                dir_sectors: read_u32(block, SUPER_DIR_SECTORS_OFFSET),
                dir_entries: read_u32(block, SUPER_DIR_ENTRIES_OFFSET),
            },
        })
    }
}

// === Directory entries ===

/// One 64-byte directory record: NUL-padded name, byte length, chain head,
/// used flag. An unused slot is all zeros.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub length: u32,
    pub first: u32,
    pub used: bool,
}

impl DirEntry {
    pub fn pack(&self, dst: &mut [u8]) {
        dst[..DIR_ENTRY_SIZE].fill(0);
        let name = self.name.as_bytes();
        let len = name.len().min(MAX_NAME - 1);
        dst[ENTRY_NAME_OFFSET..ENTRY_NAME_OFFSET + len].copy_from_slice(&name[..len]);
        write_u32(dst, ENTRY_LENGTH_OFFSET, self.length);
        write_u32(dst, ENTRY_FIRST_OFFSET, self.first);
        dst[ENTRY_USED_OFFSET] = self.used as u8;
    }

    pub fn unpack(src: &[u8]) -> Self {
        let raw_name = &src[ENTRY_NAME_OFFSET..ENTRY_NAME_OFFSET + MAX_NAME];
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(MAX_NAME);
        Self {
            name: String::from_utf8_lossy(&raw_name[..end]).into_owned(),
            length: read_u32(src, ENTRY_LENGTH_OFFSET),
            first: read_u32(src, ENTRY_FIRST_OFFSET),
            used: src[ENTRY_USED_OFFSET] != 0,
        }
    }
}

fn read_dir_entry<D: BlockDevice>(dev: &mut D, layout: &Layout, slot: u32) -> io::Result<DirEntry> {
    let (sector, offset) = layout.dir_slot_location(slot);
    let block = dev.read_block(sector)?;
    Ok(DirEntry::unpack(&block[offset..offset + DIR_ENTRY_SIZE]))
}

fn write_dir_entry<D: BlockDevice>(
    dev: &mut D,
    layout: &Layout,
    slot: u32,
    entry: &DirEntry,
) -> io::Result<()> {
    let (sector, offset) = layout.dir_slot_location(slot);
    let mut block = dev.read_block(sector)?;
    entry.pack(&mut block[offset..offset + DIR_ENTRY_SIZE]);
    dev.write_block(sector, &block)
}

fn find_by_name<D: BlockDevice>(
    dev: &mut D,
    layout: &Layout,
    name: &str,
) -> io::Result<Option<(u32, DirEntry)>> {
    for slot in 0..layout.dir_entries {
        let entry = read_dir_entry(dev, layout, slot)?;
        if entry.used && entry.name == name {
            return Ok(Some((slot, entry)));
        }
    }
    Ok(None)
}

fn find_free_slot<D: BlockDevice>(dev: &mut D, layout: &Layout) -> io::Result<Option<u32>> {
    for slot in 0..layout.dir_entries {
        if !read_dir_entry(dev, layout, slot)?.used {
            return Ok(Some(slot));
        }
    }
    Ok(None)
}

// === FAT cache ===

/// In-memory mirror of the on-disk FAT, 32 little-endian entries per
/// sector. Loaded lazily, flushed whole after every mutation.
pub struct FatCache {
    entries: Vec<u32>,
}

impl FatCache {
    pub fn load<D: BlockDevice>(dev: &mut D, layout: &Layout) -> io::Result<Self> {
        let mut entries = vec![0u32; layout.total_blocks as usize];
        let mut index = 0;
        for s in 0..layout.fat_sectors {
            let block = dev.read_block(layout.fat_start + s)?;
            for i in 0..FAT_ENTRIES_PER_SECTOR {
                if index == entries.len() {
                    break;
                }
                entries[index] = read_u32(&block, i * 4);
                index += 1;
            }
        }
        Ok(Self { entries })
    }

    pub fn flush<D: BlockDevice>(&self, dev: &mut D, layout: &Layout) -> io::Result<()> {
        let mut index = 0;
        for s in 0..layout.fat_sectors {
            let mut block = [0u8; BLOCK_SIZE];
            for i in 0..FAT_ENTRIES_PER_SECTOR {
                if index == self.entries.len() {
                    break;
                }
                write_u32(&mut block, i * 4, self.entries[index]);
                index += 1;
            }
            dev.write_block(layout.fat_start + s, &block)?;
        }
        Ok(())
    }

    pub fn get(&self, index: u32) -> u32 {
        self.entries[index as usize]
    }

    pub fn set(&mut self, index: u32, value: u32) {
        self.entries[index as usize] = value;
    }

    /// Marks every block of a chain FREE, following links until EOF.
    pub fn free_chain(&mut self, head: u32) {
        let mut current = head;
        while current != FAT_EOF {
            let next = self.get(current);
            self.set(current, FAT_FREE);
            current = next;
        }
    }

    /// Claims `count` FREE blocks scanning upward from `data_start` and
    /// links them in scan order, the last one marked EOF. Returns the
    /// chain head, or `None` (without touching the table) if the disk
    /// does not have that many free blocks.
    pub fn alloc_chain(&mut self, count: u32, data_start: u32) -> Option<u32> {
        let mut picks = Vec::with_capacity(count as usize);
        for index in data_start..self.entries.len() as u32 {
            if self.get(index) == FAT_FREE {
                picks.push(index);
                if picks.len() == count as usize {
                    break;
                }
            }
        }
        if picks.len() < count as usize {
            return None;
        }
        for pair in picks.windows(2) {
            self.set(pair[0], pair[1]);
        }
        self.set(picks[picks.len() - 1], FAT_EOF);
        Some(picks[0])
    }

    pub fn count_free(&self, data_start: u32) -> u32 {
        self.entries[data_start as usize..]
            .iter()
            .filter(|&&e| e == FAT_FREE)
            .count() as u32
    }
}

// === Reports ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageInfo {
    pub total_blocks: u32,
    pub reserved_blocks: u32,
    pub free_blocks: u32,
    pub used_blocks: u32,
    pub file_count: u32,
    pub usage_percentage: f32,
}

impl UsageInfo {
    pub fn to_json(&self) -> io::Result<String> {
        serde_json::to_string(self).map_err(|e| Error::new(ErrorKind::Other, e))
    }
}

// === Filesystem state ===

/// The mutable heart of the filesystem service: layout, FAT cache, and
/// the formatted flag. Every method that touches it runs inside the
/// service-wide metadata lock; the block device is the calling worker's
/// own connection.
pub struct FsState {
    layout: Option<Layout>,
    fat: Option<FatCache>,
    formatted: bool,
}

impl Default for FsState {
    fn default() -> Self {
        Self::new()
    }
}

impl FsState {
    pub fn new() -> Self {
        Self {
            layout: None,
            fat: None,
            formatted: false,
        }
    }

    pub fn is_formatted(&self) -> bool {
        self.formatted
    }

    fn layout(&self) -> FsResult<Layout> {
        if !self.formatted {
            return Err(FsError::NotFormatted);
        }
        self.layout.ok_or(FsError::NotFormatted)
    }

    fn fat(&mut self) -> FsResult<&mut FatCache> {
        self.fat.as_mut().ok_or(FsError::NotFormatted)
    }

    fn ensure_fat<D: BlockDevice>(&mut self, dev: &mut D, layout: &Layout) -> FsResult<()> {
        if self.fat.is_none() {
            self.fat = Some(FatCache::load(dev, layout)?);
        }
        Ok(())
    }

    /// Adopts an existing filesystem if sector 0 carries a valid
    /// superblock. Idempotent; racing adopters agree on the result.
    pub fn try_adopt<D: BlockDevice>(&mut self, dev: &mut D) -> io::Result<bool> {
        if self.formatted {
            return Ok(true);
        }
        let block = dev.read_block(SUPERBLOCK_SECTOR)?;
        match Superblock::parse(&block) {
            Ok(sb) => {
                self.layout = Some(sb.layout);
                self.formatted = true;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Formats the disk: superblock, zeroed FAT with the metadata span
    /// reserved, zeroed directory. Destroys whatever was there.
    pub fn format<D: BlockDevice>(&mut self, dev: &mut D) -> FsResult<()> {
        let geometry = dev.geometry();
        let layout = Layout::compute(dev.total_blocks())?;
        self.layout = None;
        self.fat = None;
        self.formatted = false;

        let superblock = Superblock {
            cylinders: geometry.cylinders as u64,
            sectors: geometry.sectors as u64,
            layout,
        };
        dev.write_block(SUPERBLOCK_SECTOR, &superblock.pack())?;

        let zero = [0u8; BLOCK_SIZE];
        for s in 0..layout.fat_sectors {
            dev.write_block(layout.fat_start + s, &zero)?;
        }

        let mut fat = FatCache::load(dev, &layout)?;
        for index in 0..layout.data_start().min(layout.total_blocks) {
            fat.set(index, FAT_RESERVED);
        }
        fat.flush(dev, &layout)?;

        for s in 0..layout.dir_sectors {
            dev.write_block(layout.dir_start + s, &zero)?;
        }

        self.layout = Some(layout);
        self.fat = Some(fat);
        self.formatted = true;
        Ok(())
    }

    pub fn create<D: BlockDevice>(&mut self, dev: &mut D, name: &str) -> FsResult<()> {
        if name.is_empty() || name.len() >= MAX_NAME {
            return Err(FsError::InvalidName);
        }
        let layout = self.layout()?;
        self.ensure_fat(dev, &layout)?;

        if find_by_name(dev, &layout, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let slot = find_free_slot(dev, &layout)?.ok_or(FsError::DirectoryFull)?;
        let entry = DirEntry {
            name: name.to_string(),
            length: 0,
            first: FAT_EOF,
            used: true,
        };
        write_dir_entry(dev, &layout, slot, &entry)?;
        Ok(())
    }

    pub fn delete<D: BlockDevice>(&mut self, dev: &mut D, name: &str) -> FsResult<()> {
        let layout = self.layout()?;
        self.ensure_fat(dev, &layout)?;

        let (slot, entry) = find_by_name(dev, &layout, name)?.ok_or(FsError::NotFound)?;
        if entry.first != FAT_EOF {
            self.fat()?.free_chain(entry.first);
        }
        self.fat()?.flush(dev, &layout)?;
        write_dir_entry(dev, &layout, slot, &DirEntry::default())?;
        Ok(())
    }

    /// Used entries in slot order.
    pub fn list<D: BlockDevice>(&mut self, dev: &mut D) -> FsResult<Vec<FileInfo>> {
        let layout = self.layout()?;
        let mut files = Vec::new();
        for slot in 0..layout.dir_entries {
            let entry = read_dir_entry(dev, &layout, slot)?;
            if entry.used {
                files.push(FileInfo {
                    name: entry.name,
                    length: entry.length,
                });
            }
        }
        Ok(files)
    }

    pub fn read<D: BlockDevice>(&mut self, dev: &mut D, name: &str) -> FsResult<Vec<u8>> {
        let layout = self.layout()?;
        self.ensure_fat(dev, &layout)?;

        let (_, entry) = find_by_name(dev, &layout, name)?.ok_or(FsError::NotFound)?;
        let mut data = Vec::with_capacity(entry.length as usize);
        let mut remaining = entry.length as usize;
        let mut current = entry.first;
        while remaining > 0 && current != FAT_EOF {
            let block = dev.read_block(current)?;
            let take = remaining.min(BLOCK_SIZE);
            data.extend_from_slice(&block[..take]);
            remaining -= take;
            current = self.fat()?.get(current);
        }
        Ok(data)
    }

    /// Replaces the file's contents. The old chain is freed first; if the
    /// new one cannot be allocated the file is left truncated (length 0,
    /// no chain) and that state is flushed before the error is reported.
    pub fn write<D: BlockDevice>(&mut self, dev: &mut D, name: &str, data: &[u8]) -> FsResult<()> {
        let layout = self.layout()?;
        self.ensure_fat(dev, &layout)?;

        let (slot, mut entry) = find_by_name(dev, &layout, name)?.ok_or(FsError::NotFound)?;
        if entry.first != FAT_EOF {
            self.fat()?.free_chain(entry.first);
        }
        entry.first = FAT_EOF;
        entry.length = 0;

        if data.is_empty() {
            self.fat()?.flush(dev, &layout)?;
            write_dir_entry(dev, &layout, slot, &entry)?;
            return Ok(());
        }

        let blocks = (data.len() as u64).div_ceil(BLOCK_SIZE as u64) as u32;
        let head = match self.fat()?.alloc_chain(blocks, layout.data_start()) {
            Some(head) => head,
            None => {
                self.fat()?.flush(dev, &layout)?;
                write_dir_entry(dev, &layout, slot, &entry)?;
                return Err(FsError::NoSpace);
            }
        };

        let mut current = head;
        for chunk in data.chunks(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            block[..chunk.len()].copy_from_slice(chunk);
            dev.write_block(current, &block)?;
            current = self.fat()?.get(current);
        }

        entry.first = head;
        entry.length = data.len() as u32;
        self.fat()?.flush(dev, &layout)?;
        write_dir_entry(dev, &layout, slot, &entry)?;
        Ok(())
    }

    pub fn usage<D: BlockDevice>(&mut self, dev: &mut D) -> FsResult<UsageInfo> {
        let layout = self.layout()?;
        self.ensure_fat(dev, &layout)?;

        let reserved = layout.data_start();
        let free = self.fat()?.count_free(reserved);
        let data_blocks = layout.total_blocks - reserved;
        let used = data_blocks - free;
        let file_count = self.list(dev)?.len() as u32;
        Ok(UsageInfo {
            total_blocks: layout.total_blocks,
            reserved_blocks: reserved,
            free_blocks: free,
            used_blocks: used,
            file_count,
            usage_percentage: if data_blocks == 0 {
                0.0
            } else {
                used as f32 / data_blocks as f32 * 100.0
            },
        })
    }
}

// === Service ===

fn lock_state(state: &Mutex<FsState>) -> io::Result<MutexGuard<'_, FsState>> {
    state
        .lock()
        .map_err(|_| Error::new(ErrorKind::Other, "filesystem state poisoned"))
}

/// TCP filesystem service. One detached worker per client; each worker
/// owns one connection to the disk service for its whole lifetime, and
/// every operation runs inside the single metadata lock.
pub struct FsServer {
    listener: TcpListener,
    disk_addr: SocketAddr,
    state: Arc<Mutex<FsState>>,
}

impl FsServer {
    pub fn bind<A: ToSocketAddrs, B: ToSocketAddrs>(addr: A, disk_addr: B) -> io::Result<Self> {
        let disk_addr = disk_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "disk address did not resolve"))?;
        Ok(Self {
            listener: TcpListener::bind(addr)?,
            disk_addr,
            state: Arc::new(Mutex::new(FsState::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(&self, stop: &AtomicBool) -> io::Result<()> {
        info!(
            "fs: listening on {}, disk at {}",
            self.local_addr()?,
            self.disk_addr
        );
        while !stop.load(Ordering::Relaxed) {
            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            debug!("fs: client {peer} connected");
            let disk_addr = self.disk_addr;
            let state = Arc::clone(&self.state);
            thread::spawn(move || match serve_client(stream, disk_addr, state) {
                Ok(()) => debug!("fs: client {peer} disconnected"),
                Err(err) => warn!("fs: client {peer} dropped: {err}"),
            });
        }
        info!("fs: shutting down");
        Ok(())
    }
}

fn serve_client(
    stream: TcpStream,
    disk_addr: SocketAddr,
    state: Arc<Mutex<FsState>>,
) -> io::Result<()> {
    let mut disk = DiskClient::connect(disk_addr)?;

    // Pick up a filesystem a previous run left behind. Failure to read
    // sector 0 is not fatal here; the first real operation will surface it.
    {
        let mut st = lock_state(&state)?;
        if let Err(err) = st.try_adopt(&mut disk) {
            debug!("fs: superblock probe failed: {err}");
        }
    }

    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    loop {
        let line = match read_line(&mut reader)? {
            Some(line) => line,
            None => return Ok(()),
        };
        let mut fields = line.split_whitespace();
        let command = match fields.next() {
            Some(command) => command,
            None => continue,
        };

        match command {
            "F" => {
                let result = lock_state(&state)?.format(&mut disk);
                let reply = match result {
                    Ok(()) => "0\n",
                    Err(err) => {
                        warn!("fs: format failed: {err}");
                        "2\n"
                    }
                };
                writer.write_all(reply.as_bytes())?;
            }
            "C" => {
                let name = fields.next().unwrap_or("");
                let result = lock_state(&state)?.create(&mut disk, name);
                writer.write_all(mutation_reply(result).as_bytes())?;
            }
            "D" => {
                let name = fields.next().unwrap_or("");
                let result = lock_state(&state)?.delete(&mut disk, name);
                writer.write_all(mutation_reply(result).as_bytes())?;
            }
            "L" => {
                let detail = match fields.next() {
                    Some("0") => false,
                    Some("1") => true,
                    _ => {
                        return Err(Error::new(ErrorKind::InvalidData, "bad list flag"));
                    }
                };
                let listing = {
                    let mut st = lock_state(&state)?;
                    if st.is_formatted() {
                        Some(st.list(&mut disk))
                    } else {
                        None
                    }
                };
                let text = match listing {
                    None => "(unformatted)\n".to_string(),
                    Some(Ok(files)) => render_listing(&files, detail),
                    // The directory scan died mid-listing; nothing
                    // consistent is left to send.
                    Some(Err(err)) => {
                        return Err(Error::new(ErrorKind::Other, err.to_string()));
                    }
                };
                writer.write_all(text.as_bytes())?;
            }
            "R" => {
                let name = fields.next().unwrap_or("");
                let result = lock_state(&state)?.read(&mut disk, name);
                match result {
                    Ok(data) => {
                        writer.write_all(format!("0 {} ", data.len()).as_bytes())?;
                        writer.write_all(&data)?;
                        writer.write_all(b"\n")?;
                    }
                    Err(FsError::NotFound) | Err(FsError::NotFormatted) => {
                        writer.write_all(b"1 0 \n")?;
                    }
                    Err(err) => {
                        warn!("fs: read {name:?} failed: {err}");
                        writer.write_all(b"2 0 \n")?;
                    }
                }
            }
            "W" => {
                let name = fields.next().unwrap_or("").to_string();
                let len: Option<usize> = fields.next().and_then(|f| f.parse().ok());
                let len = match len {
                    Some(len) => len,
                    None => {
                        writer.write_all(b"2\n")?;
                        continue;
                    }
                };
                // The payload is consumed whatever the outcome, keeping
                // the stream synchronized.
                let data = read_payload(&mut reader, len)?;
                let result = lock_state(&state)?.write(&mut disk, &name, &data);
                let reply = match result {
                    Ok(()) => "0\n",
                    Err(FsError::NotFound) => "1\n",
                    Err(err) => {
                        warn!("fs: write {name:?} failed: {err}");
                        "2\n"
                    }
                };
                writer.write_all(reply.as_bytes())?;
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown command {command:?}"),
                ));
            }
        }
    }
}

/// Reply codes shared by `C` and `D`: `1` for semantic failures, `2` for
/// everything the client cannot fix by changing the request.
fn mutation_reply(result: FsResult<()>) -> &'static str {
    match result {
        Ok(()) => "0\n",
        Err(FsError::NotFound)
        | Err(FsError::AlreadyExists)
        | Err(FsError::InvalidName) => "1\n",
        Err(err) => {
            warn!("fs: operation failed: {err}");
            "2\n"
        }
    }
}

fn render_listing(files: &[FileInfo], detail: bool) -> String {
    let mut text = String::new();
    for file in files {
        if detail {
            text.push_str(&format!("{} {}\n", file.name, file.length));
        } else {
            text.push_str(&format!("{}\n", file.name));
        }
    }
    text
}
