//! Record filtering primitives used across scSNV.
//!
//! This module exposes the [`RecordFilter`] trait along with the default
//! base-quality filter applied by the ingestor.

use crate::pipeline::snvmat::RawRecord;

/// A trait for filtering per-read records before they reach the ingestor.
///
/// Implementations return `true` if the record passes the filter.
pub trait RecordFilter: Send + Sync {
    fn filter_record(&self, record: &RawRecord) -> bool;
}

/// A straightforward record filter based on base quality.
pub struct DefaultRecordFilter {
    /// The observed base quality must be greater than or equal to this value to pass.
    min_base_quality: u8,
}

impl DefaultRecordFilter {
    pub fn new(min_base_quality: u8) -> Self {
        Self { min_base_quality }
    }
}

impl RecordFilter for DefaultRecordFilter {
    #[inline(always)]
    fn filter_record(&self, record: &RawRecord) -> bool {
        record.quality >= self.min_base_quality
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_quality(quality: u8) -> RawRecord {
        RawRecord::new("AAACCTGA", "chr1", 100, "A", quality)
    }

    #[test]
    fn rejects_low_quality_records() {
        let filter = DefaultRecordFilter::new(30);
        assert!(!filter.filter_record(&record_with_quality(10)));
    }

    #[test]
    fn accepts_records_at_threshold() {
        let filter = DefaultRecordFilter::new(20);
        assert!(filter.filter_record(&record_with_quality(20)));
        assert!(filter.filter_record(&record_with_quality(38)));
    }
}
