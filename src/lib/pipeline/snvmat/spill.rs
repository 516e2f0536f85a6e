//! Sorted accumulator runs spilled to anonymous temp files

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::core::error::{Result, ScsnvError};
use crate::pipeline::snvmat::accumulator::{Counts, EntryKey};

/// Bytes per spilled entry: cell, site, UMI code and three channel counts.
pub const SPILL_RECORD_BYTES: usize = 4 + 4 + 8 + 4 * 3;

const SPILL_BUFFER_BYTES: usize = 1 << 16;

/// A sorted run on disk. The file is unlinked and vanishes when dropped.
#[derive(Debug)]
pub struct SpillRun {
    file: File,
    entries: usize,
}

/// Streams key-sorted entries into a new [`SpillRun`].
pub struct SpillWriter {
    writer: BufWriter<File>,
    entries: usize,
    buf: [u8; SPILL_RECORD_BYTES],
}

impl SpillWriter {
    pub fn create(spill_dir: Option<&Path>) -> Result<Self> {
        let file = match spill_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Self {
            writer: BufWriter::with_capacity(SPILL_BUFFER_BYTES, file),
            entries: 0,
            buf: [0u8; SPILL_RECORD_BYTES],
        })
    }

    pub fn push(&mut self, key: &EntryKey, counts: &Counts) -> Result<()> {
        encode_entry(key, counts, &mut self.buf);
        self.writer.write_all(&self.buf)?;
        self.entries += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<SpillRun> {
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| ScsnvError::Io(e.into_error()))?;
        file.flush()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(SpillRun {
            file,
            entries: self.entries,
        })
    }
}

impl SpillRun {
    /// Write `entries`, which must already be sorted by key.
    pub fn write(entries: &[(EntryKey, Counts)], spill_dir: Option<&Path>) -> Result<Self> {
        let mut writer = SpillWriter::create(spill_dir)?;
        for (key, counts) in entries {
            writer.push(key, counts)?;
        }
        let run = writer.finish()?;
        debug!(
            "Spilled run of {} entries ({} bytes)",
            run.len(),
            run.len() * SPILL_RECORD_BYTES
        );
        Ok(run)
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Stream the run back in key order.
    pub fn into_reader(self) -> SpillReader {
        SpillReader {
            reader: BufReader::with_capacity(SPILL_BUFFER_BYTES, self.file),
            remaining: self.entries,
        }
    }
}

pub struct SpillReader {
    reader: BufReader<File>,
    remaining: usize,
}

impl Iterator for SpillReader {
    type Item = Result<(EntryKey, Counts)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let mut buf = [0u8; SPILL_RECORD_BYTES];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => Some(Ok(decode_entry(&buf))),
            Err(e) => {
                self.remaining = 0;
                Some(Err(ScsnvError::Io(e)))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

fn encode_entry(key: &EntryKey, counts: &Counts, buf: &mut [u8; SPILL_RECORD_BYTES]) {
    buf[0..4].copy_from_slice(&key.cell.to_le_bytes());
    buf[4..8].copy_from_slice(&key.site.to_le_bytes());
    buf[8..16].copy_from_slice(&key.umi.to_le_bytes());
    for (i, count) in counts.iter().enumerate() {
        let start = 16 + 4 * i;
        buf[start..start + 4].copy_from_slice(&count.to_le_bytes());
    }
}

fn decode_entry(buf: &[u8; SPILL_RECORD_BYTES]) -> (EntryKey, Counts) {
    let u32_at = |start: usize| {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[start..start + 4]);
        u32::from_le_bytes(bytes)
    };
    let mut umi = [0u8; 8];
    umi.copy_from_slice(&buf[8..16]);
    (
        EntryKey {
            cell: u32_at(0),
            site: u32_at(4),
            umi: u64::from_le_bytes(umi),
        },
        [u32_at(16), u32_at(20), u32_at(24)],
    )
}
