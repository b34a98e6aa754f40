// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{self, BufRead, Error, ErrorKind, Read};

use crate::consts::MAX_LINE;

/// Reads one `\n`-terminated command line, without the terminator.
/// Returns `None` on a clean EOF before any byte of a new line.
pub fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader
        .by_ref()
        .take(MAX_LINE as u64)
        .read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if n == MAX_LINE {
        return Err(Error::new(ErrorKind::InvalidData, "command line too long"));
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| Error::new(ErrorKind::InvalidData, e))
}

/// Reads a length-framed binary payload. The length field is authoritative;
/// payload bytes are never scanned for newlines.
pub fn read_payload<R: Read>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32(src: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        src[offset],
        src[offset + 1],
        src[offset + 2],
        src[offset + 3],
    ])
}

pub fn write_u32(dst: &mut [u8], offset: usize, value: u32) {
    dst[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn read_u64(src: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

pub fn write_u64(dst: &mut [u8], offset: usize, value: u64) {
    dst[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
