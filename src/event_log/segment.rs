//! On-disk topic segment
//!
//! One file per topic, records appended back to back:
//!
//! ```text
//! ┌────────────┬─────────┬──────────────────────────────┐
//! │ offset     │ 8 bytes │ Record offset within topic   │
//! │ payload_len│ 4 bytes │ Payload size                 │
//! │ checksum   │ 4 bytes │ CRC32 of payload             │
//! ├────────────┴─────────┴──────────────────────────────┤
//! │ payload    │ payload_len bytes                      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! All integers little-endian.

use crc32fast::Hasher;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::core_types::LogOffset;

pub const SEGMENT_HEADER_SIZE: usize = 16;

#[inline]
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub offset: LogOffset,
    pub payload_len: u32,
    pub checksum: u32,
}

impl SegmentHeader {
    pub fn new(offset: LogOffset, payload: &[u8]) -> Self {
        Self {
            offset,
            payload_len: payload.len() as u32,
            checksum: crc32_checksum(payload),
        }
    }

    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SEGMENT_HEADER_SIZE]) -> Self {
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&buf[0..8]);
        Self {
            offset: u64::from_le_bytes(offset),
            payload_len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            checksum: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

pub struct SegmentWriter<W: Write> {
    writer: W,
}

impl<W: Write> SegmentWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Append one record and flush it to the OS.
    pub fn append(&mut self, offset: LogOffset, payload: &[u8]) -> io::Result<()> {
        let header = SegmentHeader::new(offset, payload);
        self.writer.write_all(&header.to_bytes())?;
        self.writer.write_all(payload)?;
        self.writer.flush()
    }
}

pub struct SegmentReader<R: Read> {
    reader: R,
}

impl<R: Read> SegmentReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Next record, `None` at a clean end of file.
    ///
    /// A short header or payload is reported as `UnexpectedEof` (torn write),
    /// a checksum mismatch as `InvalidData`.
    pub fn read_record(&mut self) -> io::Result<Option<(LogOffset, Vec<u8>)>> {
        let mut header_buf = [0u8; SEGMENT_HEADER_SIZE];
        let n = read_full(&mut self.reader, &mut header_buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n < SEGMENT_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "torn segment header",
            ));
        }

        let header = SegmentHeader::from_bytes(&header_buf);
        let mut payload = vec![0u8; header.payload_len as usize];
        self.reader.read_exact(&mut payload)?;

        if header.checksum != crc32_checksum(&payload) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("CRC32 checksum mismatch at offset={}", header.offset),
            ));
        }

        Ok(Some((header.offset, payload)))
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Load every intact record of a segment file. A damaged tail (torn write or
/// bad checksum) is cut off so appends continue from the last good record.
pub fn recover(path: &Path) -> io::Result<Vec<Vec<u8>>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = SegmentReader::new(io::BufReader::new(file));

    let mut records = Vec::new();
    loop {
        match reader.read_record() {
            Ok(Some((offset, payload))) if offset == records.len() as u64 => records.push(payload),
            Ok(Some((offset, _))) => {
                tracing::warn!(
                    path = %path.display(),
                    expected = records.len(),
                    found = offset,
                    "Segment offset gap, truncating"
                );
                break;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Damaged segment tail, truncating");
                break;
            }
        }
    }

    let keep = accepted_len(&records);
    if keep < file_len {
        fs::OpenOptions::new().write(true).open(path)?.set_len(keep)?;
    }
    Ok(records)
}

fn accepted_len(records: &[Vec<u8>]) -> u64 {
    records
        .iter()
        .map(|p| (SEGMENT_HEADER_SIZE + p.len()) as u64)
        .sum()
}

/// Read a persisted group watermark. Missing file → `None`.
pub fn read_watermark(path: &Path) -> io::Result<Option<LogOffset>> {
    match fs::read_to_string(path) {
        Ok(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replace the watermark file atomically (write temp, rename).
pub fn write_watermark(path: &Path, watermark: LogOffset) -> io::Result<()> {
    let tmp = path.with_extension("offset.tmp");
    fs::write(&tmp, watermark.to_string())?;
    fs::rename(&tmp, path)
}
