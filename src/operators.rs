//! Storage operator interface.
//!
//! The on-disk storage engine lives outside this crate; plan execution
//! talks to it through these traits. A store hands out one operator per
//! requested series id; operators yield their data in chunks, in the
//! temporal direction implied by `begin <=> end` (inclusive of `begin`,
//! exclusive of `end`).

use crate::error::Result;
use crate::types::{ParamId, Timestamp, TsDuration};

/// Outcome of one chunked read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadChunk {
    /// Number of elements written into the output buffers.
    pub written: usize,
    /// True when this is the last chunk; `written` may still be nonzero.
    pub done: bool,
}

impl ReadChunk {
    pub fn more(written: usize) -> Self {
        ReadChunk {
            written,
            done: false,
        }
    }

    pub fn last(written: usize) -> Self {
        ReadChunk {
            written,
            done: true,
        }
    }
}

/// Per-series stream of `(timestamp, value)` pairs.
pub trait RealValuedOperator {
    /// Fills `ts_buf`/`val_buf` (equal lengths) with the next chunk.
    fn read(&mut self, ts_buf: &mut [Timestamp], val_buf: &mut [f64]) -> Result<ReadChunk>;
}

/// Aggregate tuple computed by storage over a range or bucket.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AggregationResult {
    pub cnt: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    /// Timestamp of the first sample in the range/bucket.
    pub first_ts: Timestamp,
    /// Timestamp of the last sample in the range/bucket.
    pub last_ts: Timestamp,
}

impl AggregationResult {
    /// Folds another tuple into this one. Used when several series map to
    /// one group representative.
    pub fn combine(&mut self, other: &AggregationResult) {
        if other.cnt == 0 {
            return;
        }
        if self.cnt == 0 {
            *self = *other;
            return;
        }
        self.cnt += other.cnt;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.first_ts = self.first_ts.min(other.first_ts);
        self.last_ts = self.last_ts.max(other.last_ts);
    }
}

/// Per-series stream of aggregate tuples: a single tuple for whole-range
/// aggregation, one tuple per bucket for group-aggregation.
pub trait AggregateOperator {
    /// Fills `ts_buf`/`agg_buf` (equal lengths) with the next chunk.
    /// Timestamps are range starts (whole-range) or bucket starts.
    fn read(
        &mut self,
        ts_buf: &mut [Timestamp],
        agg_buf: &mut [AggregationResult],
    ) -> Result<ReadChunk>;
}

/// Factory interface implemented by the storage engine.
pub trait SeriesStore {
    /// One scan operator per id over `[begin, end)`.
    fn scan(
        &self,
        ids: &[ParamId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Box<dyn RealValuedOperator>>>;

    /// One whole-range aggregate operator per id.
    fn aggregate(
        &self,
        ids: &[ParamId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Box<dyn AggregateOperator>>>;

    /// One bucketed aggregate operator per id, one tuple per `step`-wide
    /// bucket.
    fn group_aggregate(
        &self,
        ids: &[ParamId],
        begin: Timestamp,
        end: Timestamp,
        step: TsDuration,
    ) -> Result<Vec<Box<dyn AggregateOperator>>>;
}
