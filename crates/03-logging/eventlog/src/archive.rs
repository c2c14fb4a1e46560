//! Archive container: one stream per log source, deflate-compressed.
//!
//! ```text
//! [magic "SLX1"][u32 stream_count]
//! per stream:
//!   [u8 source_id][u64 entry_count][u64 first_ts][u64 last_ts]
//!   [u64 raw_len][u64 compressed_len][compressed bytes]
//! ```
//!
//! Each stream inflates to a sequence of staging records
//! `[u64 len][u8 source_id][u64 ts_us][payload…]` in submission order.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use memmap2::Mmap;

use crate::{LogError, LogResult};

pub const ARCHIVE_MAGIC: &[u8; 4] = b"SLX1";
/// Archive file extension, including the dot.
pub const ARCHIVE_EXT: &str = "slx";

/// One persisted log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub source_id: u8,
    pub time_stamp_us: u64,
    pub payload: Vec<u8>,
}

/// Per-source summary used for integrity verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceIndex {
    pub entry_count: u64,
    pub first_ts: u64,
    pub last_ts: u64,
}

/// A compressed stream ready to be appended to an archive file.
#[derive(Debug)]
pub struct CompressedStream {
    pub source_id: u8,
    pub index: SourceIndex,
    pub raw_len: u64,
    pub compressed: Vec<u8>,
}

/// Deflates one source's staging bytes into an archive stream.
pub fn compress_stream(source_id: u8, raw: &[u8]) -> LogResult<CompressedStream> {
    let index = scan_records(source_id, raw)?;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    let compressed = encoder.finish()?;
    Ok(CompressedStream {
        source_id,
        index,
        raw_len: raw.len() as u64,
        compressed,
    })
}

/// Walks staging records, validating framing and collecting the index.
pub fn scan_records(source_id: u8, raw: &[u8]) -> LogResult<SourceIndex> {
    let mut index = SourceIndex::default();
    let mut offset = 0usize;
    while offset < raw.len() {
        let (entry, next) = read_record(raw, offset)
            .ok_or_else(|| malformed(source_id, "truncated staging record"))?;
        if entry.source_id != source_id {
            return Err(malformed(source_id, "record source mismatch"));
        }
        if index.entry_count == 0 {
            index.first_ts = entry.time_stamp_us;
        }
        index.last_ts = entry.time_stamp_us;
        index.entry_count += 1;
        offset = next;
    }
    Ok(index)
}

/// Parses one staging record at `offset`; returns the entry and the offset
/// of the next record.
pub fn read_record(raw: &[u8], offset: usize) -> Option<(LogEntry, usize)> {
    let len_bytes = raw.get(offset..offset + 8)?;
    let len = u64::from_le_bytes(len_bytes.try_into().ok()?) as usize;
    if len < 9 {
        return None;
    }
    let body = raw.get(offset + 8..offset + 8 + len)?;
    let source_id = body[0];
    let time_stamp_us = u64::from_le_bytes(body[1..9].try_into().ok()?);
    let payload = body[9..].to_vec();
    Some((
        LogEntry {
            source_id,
            time_stamp_us,
            payload,
        },
        offset + 8 + len,
    ))
}

/// Serializes a [`LogEntry`] into its staging record bytes.
pub fn write_record(out: &mut Vec<u8>, source_id: u8, time_stamp_us: u64, payload: &[u8]) {
    let len = (1 + 8 + payload.len()) as u64;
    out.extend_from_slice(&len.to_le_bytes());
    out.push(source_id);
    out.extend_from_slice(&time_stamp_us.to_le_bytes());
    out.extend_from_slice(payload);
}

/// Writes a complete archive file from compressed streams.
pub fn write_archive(path: &Path, streams: &[CompressedStream]) -> LogResult<()> {
    let mut file = File::create(path)?;
    file.write_all(ARCHIVE_MAGIC)?;
    file.write_all(&(streams.len() as u32).to_le_bytes())?;
    for stream in streams {
        file.write_all(&[stream.source_id])?;
        file.write_all(&stream.index.entry_count.to_le_bytes())?;
        file.write_all(&stream.index.first_ts.to_le_bytes())?;
        file.write_all(&stream.index.last_ts.to_le_bytes())?;
        file.write_all(&stream.raw_len.to_le_bytes())?;
        file.write_all(&(stream.compressed.len() as u64).to_le_bytes())?;
        file.write_all(&stream.compressed)?;
    }
    file.sync_all()?;
    Ok(())
}

/// A decoded archive: every stream's entries, in stream order.
#[derive(Debug)]
pub struct Archive {
    pub streams: Vec<SourceStream>,
}

#[derive(Debug)]
pub struct SourceStream {
    pub source_id: u8,
    pub index: SourceIndex,
    pub entries: Vec<LogEntry>,
}

impl Archive {
    /// Reads and inflates an archive. With `memory_mapping` the file is
    /// mapped instead of read into an owned buffer; extraction prefers the
    /// mapping for multi-gigabyte session logs.
    pub fn open(path: &Path, memory_mapping: bool) -> LogResult<Self> {
        let bytes: ArchiveBytes = if memory_mapping {
            let file = File::open(path)?;
            // SAFETY: the mapping is read-only and dropped before this call
            // returns any borrow of it.
            ArchiveBytes::Mapped(unsafe { Mmap::map(&file)? })
        } else {
            ArchiveBytes::Owned(std::fs::read(path)?)
        };
        Self::parse(bytes.as_slice())
    }

    fn parse(raw: &[u8]) -> LogResult<Self> {
        let header = raw
            .get(0..8)
            .ok_or_else(|| malformed(0, "archive shorter than header"))?;
        if &header[0..4] != ARCHIVE_MAGIC {
            return Err(malformed(0, "bad archive magic"));
        }
        let stream_count = u32::from_le_bytes(header[4..8].try_into().expect("len checked"));

        let mut streams = Vec::with_capacity(stream_count as usize);
        let mut offset = 8usize;
        for _ in 0..stream_count {
            let head = raw
                .get(offset..offset + 41)
                .ok_or_else(|| malformed(0, "truncated stream header"))?;
            let source_id = head[0];
            let index = SourceIndex {
                entry_count: u64::from_le_bytes(head[1..9].try_into().expect("len checked")),
                first_ts: u64::from_le_bytes(head[9..17].try_into().expect("len checked")),
                last_ts: u64::from_le_bytes(head[17..25].try_into().expect("len checked")),
            };
            let raw_len = u64::from_le_bytes(head[25..33].try_into().expect("len checked")) as usize;
            let compressed_len =
                u64::from_le_bytes(head[33..41].try_into().expect("len checked")) as usize;
            offset += 41;

            let compressed = raw
                .get(offset..offset + compressed_len)
                .ok_or_else(|| malformed(source_id, "truncated stream body"))?;
            offset += compressed_len;

            let mut inflated = Vec::with_capacity(raw_len);
            DeflateDecoder::new(compressed).read_to_end(&mut inflated)?;
            if inflated.len() != raw_len {
                return Err(malformed(source_id, "inflated length mismatch"));
            }

            let mut entries = Vec::with_capacity(index.entry_count as usize);
            let mut record_offset = 0usize;
            while record_offset < inflated.len() {
                let (entry, next) = read_record(&inflated, record_offset)
                    .ok_or_else(|| malformed(source_id, "truncated archived record"))?;
                entries.push(entry);
                record_offset = next;
            }

            streams.push(SourceStream {
                source_id,
                index,
                entries,
            });
        }

        Ok(Self { streams })
    }

    pub fn stream(&self, source_id: u8) -> Option<&SourceStream> {
        self.streams.iter().find(|s| s.source_id == source_id)
    }
}

enum ArchiveBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl ArchiveBytes {
    fn as_slice(&self) -> &[u8] {
        match self {
            ArchiveBytes::Mapped(map) => map,
            ArchiveBytes::Owned(vec) => vec,
        }
    }
}

fn malformed(source_id: u8, what: &str) -> LogError {
    LogError::Malformed {
        source_id,
        reason: what.to_owned(),
    }
}
