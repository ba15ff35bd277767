//! Length-prefixed segment file I/O.
//!
//! A segment is an append-only file of concatenated frames, each
//! `[u32 big-endian length][length bytes of data]` with no separator,
//! index or checksum. Reads use positional I/O so a shared descriptor
//! can serve concurrent readers without seek races.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::StoreError;
use crate::types::Offset;

/// Maximum size of a single message (64 MiB).
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Bytes of the length prefix in front of every message.
pub const FRAME_HEADER_SIZE: u64 = 4;

/// File name of the segment inside a stream directory.
pub const SEGMENT_FILE_NAME: &str = "data.seg";

/// On-disk footprint of a message of `data_len` bytes.
pub fn framed_len(data_len: usize) -> u64 {
    FRAME_HEADER_SIZE + data_len as u64
}

/// Write one framed message, returning the bytes it occupies on disk.
///
/// The caller is responsible for single-writer discipline and for syncing
/// the file once a batch is complete.
pub fn write_message<W: Write>(writer: &mut W, data: &[u8]) -> Result<u64, StoreError> {
    if data.len() as u64 > MAX_MESSAGE_SIZE {
        return Err(StoreError::MessageTooLarge {
            size: data.len() as u64,
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_u32::<BigEndian>(data.len() as u32)?;
    writer.write_all(data)?;
    Ok(framed_len(data.len()))
}

/// Read the frame starting at `pos`.
///
/// Returns `Ok(Some((data, end)))` where `end` is the position after the
/// frame, `Ok(None)` on a clean EOF or a truncated tail (short read on
/// either the prefix or the data), and `CorruptedSegment` when the length
/// prefix exceeds [`MAX_MESSAGE_SIZE`].
pub fn read_message_at(file: &File, pos: u64) -> Result<Option<(Vec<u8>, u64)>, StoreError> {
    let mut prefix = [0u8; FRAME_HEADER_SIZE as usize];
    if read_full_at(file, &mut prefix, pos)? < prefix.len() {
        return Ok(None);
    }
    let len = u32::from_be_bytes(prefix) as u64;
    if len > MAX_MESSAGE_SIZE {
        return Err(StoreError::CorruptedSegment {
            len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut data = vec![0u8; len as usize];
    if read_full_at(file, &mut data, pos + FRAME_HEADER_SIZE)? < data.len() {
        return Ok(None);
    }
    Ok(Some((data, pos + FRAME_HEADER_SIZE + len)))
}

/// Scan a segment from the beginning, returning the offset of the end of
/// the last whole frame.
///
/// Stops silently at EOF, a short read on the length prefix, an oversize
/// length, or a short read on the data; a partial tail is truncation, not
/// an error. Crash durability relies on this.
pub fn scan(file: &File) -> Result<Offset, StoreError> {
    let mut pos = 0u64;
    loop {
        match read_message_at(file, pos) {
            Ok(Some((_, end))) => pos = end,
            Ok(None) => break,
            Err(StoreError::CorruptedSegment { .. }) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(Offset::new(0, pos))
}

/// Read into `buf` starting at `pos`, stopping early only at EOF.
/// Returns the number of bytes read.
fn read_full_at(file: &File, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(&mut buf[filled..], pos + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
