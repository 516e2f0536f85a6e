use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use super::types::{MalformedRow, RecordStream, ShardSource};
use crate::core::io::{column_index, get_reader};
use crate::pipeline::snvmat::RawRecord;

/// Shards held in memory, mostly for tests and small inputs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShards {
    shards: Vec<Vec<RawRecord>>,
}

impl InMemoryShards {
    pub fn new(shards: Vec<Vec<RawRecord>>) -> Self {
        Self { shards }
    }

    /// Cut `records` into `shard_count` contiguous shards of near-equal size.
    pub fn split(records: Vec<RawRecord>, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let chunk = records.len().div_ceil(shard_count).max(1);
        let mut shards: Vec<Vec<RawRecord>> = records.chunks(chunk).map(|c| c.to_vec()).collect();
        shards.resize_with(shard_count, Vec::new);
        Self { shards }
    }

    pub fn total_records(&self) -> usize {
        self.shards.iter().map(Vec::len).sum()
    }
}

impl ShardSource for InMemoryShards {
    fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn open(&self, shard: usize, offset: u64) -> anyhow::Result<RecordStream<'_>> {
        let records = self
            .shards
            .get(shard)
            .ok_or_else(|| anyhow!("Shard {} out of range ({} shards)", shard, self.shards.len()))?;
        let start = usize::try_from(offset)?.min(records.len());
        Ok(Box::new(records[start..].iter().cloned().map(Ok)))
    }
}

/// One tab-separated file per shard (plain or gzip).
///
/// Required columns: `barcode`, `contig`, `position`, `allele`, `quality`.
/// Optional columns: `umi` (empty means absent) and `weight` (default 1).
#[derive(Debug, Clone)]
pub struct TsvShards {
    paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
struct TsvColumns {
    barcode: usize,
    contig: usize,
    position: usize,
    allele: usize,
    quality: usize,
    umi: Option<usize>,
    weight: Option<usize>,
}

impl TsvColumns {
    fn resolve(headers: &csv::StringRecord) -> anyhow::Result<Self> {
        Ok(Self {
            barcode: column_index(headers, "barcode")?,
            contig: column_index(headers, "contig")?,
            position: column_index(headers, "position")?,
            allele: column_index(headers, "allele")?,
            quality: column_index(headers, "quality")?,
            umi: column_index(headers, "umi").ok(),
            weight: column_index(headers, "weight").ok(),
        })
    }

    fn parse(&self, row: &csv::StringRecord) -> anyhow::Result<RawRecord> {
        let field = |idx: usize, name: &str| {
            row.get(idx)
                .ok_or_else(|| anyhow!("Missing '{}' field", name))
        };
        let position = field(self.position, "position")?
            .trim()
            .parse::<u64>()
            .context("Invalid position")?;
        let quality = field(self.quality, "quality")?
            .trim()
            .parse::<u8>()
            .context("Invalid quality")?;

        let mut record = RawRecord::new(
            field(self.barcode, "barcode")?,
            field(self.contig, "contig")?,
            position,
            field(self.allele, "allele")?,
            quality,
        );
        if let Some(umi) = self.umi.and_then(|idx| row.get(idx)) {
            if !umi.trim().is_empty() {
                record = record.with_umi(umi);
            }
        }
        if let Some(weight) = self.weight.and_then(|idx| row.get(idx)) {
            if !weight.trim().is_empty() {
                record = record.with_weight(weight.trim().parse::<u32>().context("Invalid weight")?);
            }
        }
        Ok(record)
    }
}

impl TsvShards {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            paths: paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect(),
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl ShardSource for TsvShards {
    fn shard_count(&self) -> usize {
        self.paths.len()
    }

    fn open(&self, shard: usize, offset: u64) -> anyhow::Result<RecordStream<'_>> {
        let path = self
            .paths
            .get(shard)
            .ok_or_else(|| anyhow!("Shard {} out of range ({} shards)", shard, self.paths.len()))?;
        let mut reader = get_reader(path, true)?;
        let headers = reader
            .headers()
            .with_context(|| format!("Failed to read header of {}", path.display()))?
            .clone();
        let columns = TsvColumns::resolve(&headers)
            .with_context(|| format!("Unexpected header in {}", path.display()))?;

        let skip = usize::try_from(offset)?;
        let stream = reader.into_records().skip(skip).map(move |row| {
            let row = row.with_context(|| format!("Failed to read {}", path.display()))?;
            columns.parse(&row).map_err(|err| {
                let line = row.position().map(|p| p.line()).unwrap_or_default();
                anyhow::Error::new(MalformedRow {
                    location: format!("{}:{}", path.display(), line),
                    reason: format!("{:#}", err),
                })
            })
        });
        Ok(Box::new(stream))
    }
}
