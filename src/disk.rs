// SPDX-License-Identifier: MIT OR Apache-2.0

use log::{debug, info, warn};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, BufReader, Error, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::consts::{BLOCK_SIZE, DISK_ERR, DISK_OK};
use crate::wire::{read_line, read_payload};

/// Disk geometry: cylinders by sectors-per-cylinder, 128-byte sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub cylinders: u32,
    pub sectors: u32,
}

impl Geometry {
    pub fn new(cylinders: u32, sectors: u32) -> io::Result<Self> {
        if cylinders == 0 || sectors == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "cylinders and sectors must both be > 0",
            ));
        }
        if cylinders as u64 * sectors as u64 > u32::MAX as u64 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "geometry exceeds the addressable block count",
            ));
        }
        Ok(Self { cylinders, sectors })
    }

    pub fn total_blocks(&self) -> u32 {
        self.cylinders * self.sectors
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.total_blocks() as u64 * BLOCK_SIZE as u64
    }

    pub fn contains(&self, cylinder: i64, sector: i64) -> bool {
        cylinder >= 0
            && cylinder < self.cylinders as i64
            && sector >= 0
            && sector < self.sectors as i64
    }

    /// Byte offset of sector `(c, s)` in the linear image.
    pub fn sector_offset(&self, cylinder: u32, sector: u32) -> usize {
        (cylinder as usize * self.sectors as usize + sector as usize) * BLOCK_SIZE
    }

    /// Splits a linear block index into `(cylinder, sector)`.
    pub fn split_index(&self, index: u32) -> (u32, u32) {
        (index / self.sectors, index % self.sectors)
    }
}

/// The disk image: a backing file of exactly `cylinders * sectors * 128`
/// bytes, memory-mapped shared so acknowledged writes reach the file
/// without an explicit flush.
pub struct DiskImage {
    geometry: Geometry,
    map: MmapMut,
    path: PathBuf,
}

impl DiskImage {
    /// Opens (creating if absent) the backing file and maps it. New
    /// sectors come into existence zeroed.
    pub fn open<P: AsRef<Path>>(path: P, geometry: Geometry) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        file.set_len(geometry.capacity_bytes())?;
        // Safety: the file stays open and at fixed length for the life of
        // the mapping; this process is the only writer.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            geometry,
            map,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_sector(&self, cylinder: u32, sector: u32) -> [u8; BLOCK_SIZE] {
        let offset = self.geometry.sector_offset(cylinder, sector);
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(&self.map[offset..offset + BLOCK_SIZE]);
        block
    }

    pub fn write_sector(&mut self, cylinder: u32, sector: u32, block: &[u8; BLOCK_SIZE]) {
        let offset = self.geometry.sector_offset(cylinder, sector);
        self.map[offset..offset + BLOCK_SIZE].copy_from_slice(block);
    }

    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }
}

/// Startup report for the disk service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub cylinders: u32,
    pub sectors: u32,
    pub block_size: usize,
    pub capacity_bytes: u64,
    pub track_time_us: u64,
    pub backing_file: String,
}

impl DiskInfo {
    pub fn to_json(&self) -> io::Result<String> {
        serde_json::to_string(self).map_err(|e| Error::new(ErrorKind::Other, e))
    }
}

/// The shared half of the service: the image plus the simulated arm.
/// One mutex serializes the seek, the arm update, and the sector access,
/// so the arm never skips and no two commands interleave mid-sector.
struct DiskUnit {
    image: DiskImage,
    head_cylinder: u32,
    track_time_us: u64,
}

impl DiskUnit {
    fn seek(&mut self, cylinder: u32) {
        let delta = self.head_cylinder.abs_diff(cylinder) as u64;
        let total_us = delta * self.track_time_us;
        if total_us > 0 {
            // Best effort; a partial sleep is good enough for simulation.
            thread::sleep(Duration::from_micros(total_us));
        }
        self.head_cylinder = cylinder;
    }

    fn seek_and_read(&mut self, cylinder: u32, sector: u32) -> [u8; BLOCK_SIZE] {
        self.seek(cylinder);
        self.image.read_sector(cylinder, sector)
    }

    fn seek_and_write(&mut self, cylinder: u32, sector: u32, block: &[u8; BLOCK_SIZE]) {
        self.seek(cylinder);
        self.image.write_sector(cylinder, sector, block);
    }
}

fn lock_unit(unit: &Mutex<DiskUnit>) -> io::Result<MutexGuard<'_, DiskUnit>> {
    unit.lock()
        .map_err(|_| Error::new(ErrorKind::Other, "disk state poisoned"))
}

/// TCP block-device service: one detached worker per connection, all
/// workers sharing a single arm.
pub struct DiskServer {
    listener: TcpListener,
    geometry: Geometry,
    unit: Arc<Mutex<DiskUnit>>,
    info: DiskInfo,
}

impl DiskServer {
    pub fn bind<A: ToSocketAddrs, P: AsRef<Path>>(
        addr: A,
        geometry: Geometry,
        track_time_us: u64,
        backing_file: P,
    ) -> io::Result<Self> {
        let image = DiskImage::open(backing_file, geometry)?;
        let info = DiskInfo {
            cylinders: geometry.cylinders,
            sectors: geometry.sectors,
            block_size: BLOCK_SIZE,
            capacity_bytes: geometry.capacity_bytes(),
            track_time_us,
            backing_file: image.path().display().to_string(),
        };
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            geometry,
            unit: Arc::new(Mutex::new(DiskUnit {
                image,
                head_cylinder: 0,
                track_time_us,
            })),
            info,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn info(&self) -> &DiskInfo {
        &self.info
    }

    /// Accept loop. Runs until `stop` is observed, which happens on the
    /// iteration after a signal interrupts `accept`. Existing workers are
    /// left to finish on their own.
    pub fn run(&self, stop: &AtomicBool) -> io::Result<()> {
        info!(
            "disk: listening on {} ({})",
            self.local_addr()?,
            self.info.to_json()?
        );
        while !stop.load(Ordering::Relaxed) {
            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            debug!("disk: client {peer} connected");
            let geometry = self.geometry;
            let unit = Arc::clone(&self.unit);
            thread::spawn(move || match serve_client(stream, geometry, unit) {
                Ok(()) => debug!("disk: client {peer} disconnected"),
                Err(err) => warn!("disk: client {peer} dropped: {err}"),
            });
        }
        info!("disk: shutting down");
        lock_unit(&self.unit)?.image.flush()
    }
}

fn parse_i64(field: Option<&str>) -> io::Result<i64> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "malformed command line"))
}

/// Per-connection command loop. Returning an error tears down only this
/// connection.
fn serve_client(
    stream: TcpStream,
    geometry: Geometry,
    unit: Arc<Mutex<DiskUnit>>,
) -> io::Result<()> {
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
            None => continue, // blank line
        };

        match command {
            "I" => {
                let reply = format!("{} {}\n", geometry.cylinders, geometry.sectors);
                writer.write_all(reply.as_bytes())?;
            }
            "R" => {
                let cylinder = parse_i64(fields.next())?;
                let sector = parse_i64(fields.next())?;
                if !geometry.contains(cylinder, sector) {
                    writer.write_all(&[DISK_ERR])?;
                    continue;
                }
                let block = lock_unit(&unit)?.seek_and_read(cylinder as u32, sector as u32);
                writer.write_all(&[DISK_OK])?;
                writer.write_all(&block)?;
            }
            "W" => {
                let cylinder = parse_i64(fields.next())?;
                let sector = parse_i64(fields.next())?;
                let len = parse_i64(fields.next())?;
                if len < 0 || len > BLOCK_SIZE as i64 {
                    // The payload framing is unknowable, so the stream
                    // cannot be resynchronized. Answer and hang up.
                    writer.write_all(&[DISK_ERR])?;
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        "write length out of range",
                    ));
                }
                let payload = read_payload(&mut reader, len as usize)?;
                if !geometry.contains(cylinder, sector) {
                    writer.write_all(&[DISK_ERR])?;
                    continue;
                }
                let mut block = [0u8; BLOCK_SIZE];
                block[..payload.len()].copy_from_slice(&payload);
                lock_unit(&unit)?.seek_and_write(cylinder as u32, sector as u32, &block);
                writer.write_all(&[DISK_OK])?;
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
