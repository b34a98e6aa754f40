// SPDX-License-Identifier: MIT OR Apache-2.0

use log::debug;
use std::io::{self, BufReader, Error, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::consts::{BLOCK_SIZE, DISK_OK};
use crate::disk::Geometry;
use crate::wire::{read_line, read_payload};

/// The seam between the filesystem core and its storage: a flat array of
/// 128-byte blocks addressed by linear index. Implemented over a socket by
/// [`DiskClient`] and in memory by [`MemBlockDevice`].
pub trait BlockDevice {
    fn geometry(&self) -> Geometry;

    fn read_block(&mut self, index: u32) -> io::Result<[u8; BLOCK_SIZE]>;

    fn write_block(&mut self, index: u32, block: &[u8; BLOCK_SIZE]) -> io::Result<()>;

    fn total_blocks(&self) -> u32 {
        self.geometry().total_blocks()
    }
}

/// One connection to the disk service. Geometry is learned with `I` at
/// connect time; afterwards only `R` and `W` are issued, always with full
/// 128-byte payloads. A `'0'` status is an error here: the caller only
/// addresses blocks it computed from the advertised geometry.
pub struct DiskClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    geometry: Geometry,
}

impl DiskClient {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        writer.write_all(b"I\n")?;
        let line = read_line(&mut reader)?.ok_or_else(|| {
            Error::new(ErrorKind::UnexpectedEof, "disk closed during handshake")
        })?;
        let geometry = parse_geometry(&line)?;
        debug!(
            "disk client: connected, geometry {}x{}",
            geometry.cylinders, geometry.sectors
        );
        Ok(Self {
            reader,
            writer,
            geometry,
        })
    }
}

fn parse_geometry(line: &str) -> io::Result<Geometry> {
    let mut fields = line.split_whitespace();
    let cylinders = fields.next().and_then(|f| f.parse().ok());
    let sectors = fields.next().and_then(|f| f.parse().ok());
    match (cylinders, sectors) {
        (Some(c), Some(s)) => Geometry::new(c, s),
        _ => Err(Error::new(
            ErrorKind::InvalidData,
            format!("bad geometry line {line:?}"),
        )),
    }
}

impl BlockDevice for DiskClient {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read_block(&mut self, index: u32) -> io::Result<[u8; BLOCK_SIZE]> {
        let (cylinder, sector) = self.geometry.split_index(index);
        let header = format!("R {cylinder} {sector}\n");
        self.writer.write_all(header.as_bytes())?;

        let mut status = [0u8; 1];
        self.reader.read_exact(&mut status)?;
        if status[0] != DISK_OK {
            return Err(Error::new(
                ErrorKind::Other,
                format!("disk rejected read of block {index}"),
            ));
        }
        let mut block = [0u8; BLOCK_SIZE];
        self.reader.read_exact(&mut block)?;
        Ok(block)
    }

    fn write_block(&mut self, index: u32, block: &[u8; BLOCK_SIZE]) -> io::Result<()> {
        let (cylinder, sector) = self.geometry.split_index(index);
        let header = format!("W {cylinder} {sector} {BLOCK_SIZE}\n");
        self.writer.write_all(header.as_bytes())?;
        self.writer.write_all(block)?;

        let mut status = [0u8; 1];
        self.reader.read_exact(&mut status)?;
        if status[0] != DISK_OK {
            return Err(Error::new(
                ErrorKind::Other,
                format!("disk rejected write of block {index}"),
            ));
        }
        Ok(())
    }
}

/// In-memory block store, for exercising the filesystem core without a
/// disk service.
pub struct MemBlockDevice {
    geometry: Geometry,
    data: Vec<u8>,
}

impl MemBlockDevice {
    pub fn new(total_blocks: u32) -> Self {
        Self {
            geometry: Geometry {
                cylinders: 1,
                sectors: total_blocks,
            },
            data: vec![0; total_blocks as usize * BLOCK_SIZE],
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read_block(&mut self, index: u32) -> io::Result<[u8; BLOCK_SIZE]> {
        let offset = index as usize * BLOCK_SIZE;
        if offset + BLOCK_SIZE > self.data.len() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("block {index} out of range"),
            ));
        }
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(&self.data[offset..offset + BLOCK_SIZE]);
        Ok(block)
    }

    fn write_block(&mut self, index: u32, block: &[u8; BLOCK_SIZE]) -> io::Result<()> {
        let offset = index as usize * BLOCK_SIZE;
        if offset + BLOCK_SIZE > self.data.len() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("block {index} out of range"),
            ));
        }
        self.data[offset..offset + BLOCK_SIZE].copy_from_slice(block);
        Ok(())
    }
}

/// Client for the filesystem wire protocol. Status codes are returned
/// as-is: `0` ok, `1` semantic failure, `2` resource failure.
pub struct FsClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

const LIST_END_TIMEOUT: Duration = Duration::from_millis(200);

impl FsClient {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let writer = stream.try_clone()?;
        let reader = BufReader::new(stream);
        Ok(Self { reader, writer })
    }

    pub fn format(&mut self) -> io::Result<u8> {
        self.status_command("F\n".to_string())
    }

    pub fn create(&mut self, name: &str) -> io::Result<u8> {
        self.status_command(format!("C {name}\n"))
    }

    pub fn delete(&mut self, name: &str) -> io::Result<u8> {
        self.status_command(format!("D {name}\n"))
    }

    /// Collects the listing. The reply has no terminator (the protocol
    /// ends it implicitly), so a short read timeout marks the end.
    pub fn list(&mut self, detail: bool) -> io::Result<Vec<String>> {
        let header = format!("L {}\n", detail as u8);
        self.writer.write_all(header.as_bytes())?;

        self.writer.set_read_timeout(Some(LIST_END_TIMEOUT))?;
        let mut lines = Vec::new();
        loop {
            match read_line(&mut self.reader) {
                Ok(Some(line)) => lines.push(line),
                Ok(None) => break,
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(err) => {
                    self.writer.set_read_timeout(None)?;
                    return Err(err);
                }
            }
        }
        self.writer.set_read_timeout(None)?;
        Ok(lines)
    }

    /// Returns `(status, data)`; `data` is empty unless the status is 0.
    pub fn read(&mut self, name: &str) -> io::Result<(u8, Vec<u8>)> {
        let header = format!("R {name}\n");
        self.writer.write_all(header.as_bytes())?;

        let status: u8 = self
            .read_token()?
            .parse()
            .map_err(|_| Error::new(ErrorKind::InvalidData, "bad read status"))?;
        let len: usize = self
            .read_token()?
            .parse()
            .map_err(|_| Error::new(ErrorKind::InvalidData, "bad read length"))?;
        let data = read_payload(&mut self.reader, len)?;
        let mut newline = [0u8; 1];
        self.reader.read_exact(&mut newline)?;
        if newline[0] != b'\n' {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "read reply missing terminator",
            ));
        }
        Ok((status, data))
    }

    pub fn write(&mut self, name: &str, data: &[u8]) -> io::Result<u8> {
        let header = format!("W {name} {}\n", data.len());
        self.writer.write_all(header.as_bytes())?;
        self.writer.write_all(data)?;
        self.read_status()
    }

    fn status_command(&mut self, line: String) -> io::Result<u8> {
        self.writer.write_all(line.as_bytes())?;
        self.read_status()
    }

    fn read_status(&mut self) -> io::Result<u8> {
        let line = read_line(&mut self.reader)?.ok_or_else(|| {
            Error::new(ErrorKind::UnexpectedEof, "server closed the connection")
        })?;
        line.trim()
            .parse()
            .map_err(|_| Error::new(ErrorKind::InvalidData, format!("bad status line {line:?}")))
    }

    /// Reads one space-terminated ASCII token from a mixed text/binary
    /// reply header.
    fn read_token(&mut self) -> io::Result<String> {
        let mut token = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            self.reader.read_exact(&mut byte)?;
            if byte[0] == b' ' {
                break;
            }
            token.push(byte[0]);
            if token.len() > 32 {
                return Err(Error::new(ErrorKind::InvalidData, "oversized reply token"));
            }
        }
        String::from_utf8(token).map_err(|e| Error::new(ErrorKind::InvalidData, e))
    }
}
