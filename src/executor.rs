//! Plan execution: runs tier 1 against the storage engine and materializes
//! the per-series operator streams through the tier-2 operator into the
//! query driver.
//!
//! Samples are pushed into [`QueryProcessor::put`] honoring backpressure: a
//! false return stops the stream and completes the pipeline, which is not
//! an error. Storage errors are routed to every node via `set_error` and
//! returned to the caller.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use crate::error::{Error, Result};
use crate::operators::{AggregateOperator, AggregationResult, RealValuedOperator, SeriesStore};
use crate::queryplan::{
    AggregationFunction, QueryPlan, QueryPlanStage, StageOp, Tier1Operator, Tier2Operator,
};
use crate::queryprocessor::QueryProcessor;
use crate::telemetry;
use crate::types::{ParamId, Sample, Timestamp};

const READ_BATCH: usize = 1024;

impl AggregationFunction {
    /// Applies the function to a storage aggregate tuple.
    pub fn apply(&self, agg: &AggregationResult) -> f64 {
        match self {
            AggregationFunction::Cnt => agg.cnt as f64,
            AggregationFunction::Sum => agg.sum,
            AggregationFunction::Min => agg.min,
            AggregationFunction::Max => agg.max,
            AggregationFunction::Mean => agg.sum / agg.cnt as f64,
            AggregationFunction::MinTimestamp => agg.first_ts as f64,
            AggregationFunction::MaxTimestamp => agg.last_ts as f64,
        }
    }
}

/// Buffered pull cursor over a [`RealValuedOperator`].
struct ScanSource {
    op: Box<dyn RealValuedOperator>,
    out_id: ParamId,
    ts: Vec<Timestamp>,
    vals: Vec<f64>,
    len: usize,
    pos: usize,
    done: bool,
}

impl ScanSource {
    fn new(op: Box<dyn RealValuedOperator>, out_id: ParamId) -> Self {
        ScanSource {
            op,
            out_id,
            ts: vec![0; READ_BATCH],
            vals: vec![0.0; READ_BATCH],
            len: 0,
            pos: 0,
            // A zero id marks a missing series (join holes); nothing to read.
            done: out_id == 0,
        }
    }

    fn peek(&mut self) -> Result<Option<(Timestamp, f64)>> {
        while self.pos == self.len {
            if self.done {
                return Ok(None);
            }
            let chunk = self.op.read(&mut self.ts, &mut self.vals)?;
            self.len = chunk.written;
            self.pos = 0;
            self.done = chunk.done || chunk.written == 0;
        }
        Ok(Some((self.ts[self.pos], self.vals[self.pos])))
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}

/// Buffered pull cursor over an [`AggregateOperator`].
struct AggSource {
    op: Box<dyn AggregateOperator>,
    out_id: ParamId,
    ts: Vec<Timestamp>,
    aggs: Vec<AggregationResult>,
    len: usize,
    pos: usize,
    done: bool,
}

impl AggSource {
    fn new(op: Box<dyn AggregateOperator>, out_id: ParamId) -> Self {
        AggSource {
            op,
            out_id,
            ts: vec![0; READ_BATCH],
            aggs: vec![AggregationResult::default(); READ_BATCH],
            len: 0,
            pos: 0,
            done: out_id == 0,
        }
    }

    fn peek(&mut self) -> Result<Option<(Timestamp, AggregationResult)>> {
        while self.pos == self.len {
            if self.done {
                return Ok(None);
            }
            let chunk = self.op.read(&mut self.ts, &mut self.aggs)?;
            self.len = chunk.written;
            self.pos = 0;
            self.done = chunk.done || chunk.written == 0;
        }
        Ok(Some((self.ts[self.pos], self.aggs[self.pos])))
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}

/// Maps a timestamp into a direction-normalized merge key: ascending for
/// forward streams, descending for backward ones.
fn direction_key(forward: bool, ts: Timestamp) -> Timestamp {
    if forward {
        ts
    } else {
        Timestamp::MAX - ts
    }
}

/// Runs the plan to completion, driving every produced sample through the
/// processor. Returns `Ok` when the stream finished or was cancelled by
/// backpressure; storage and pipeline errors are forwarded via `set_error`
/// before being returned.
pub fn execute_plan(
    plan: &QueryPlan,
    store: &dyn SeriesStore,
    proc: &mut dyn QueryProcessor,
) -> Result<()> {
    let (t1, t2) = plan.two_tiers()?;
    match run_tiers(t1, t2, store, proc) {
        Ok(()) => {
            proc.stop();
            Ok(())
        }
        Err(status) => {
            proc.set_error(status.clone());
            Err(status)
        }
    }
}

fn run_tiers(
    t1: &QueryPlanStage,
    t2: &QueryPlanStage,
    store: &dyn SeriesStore,
    proc: &mut dyn QueryProcessor,
) -> Result<()> {
    if t1.ids.is_empty() {
        return Err(Error::NoData);
    }
    if !proc.start() {
        return Ok(());
    }
    let (begin, end) = t1.time_range;
    let forward = begin <= end;

    let t2op = match t2.op {
        StageOp::Tier2(op) => op,
        StageOp::Tier1(_) => return Err(Error::BadArg("malformed query plan".into())),
    };

    match t1.op {
        StageOp::Tier1(Tier1Operator::ScanRange) => {
            let ops = store.scan(&t1.ids, begin, end)?;
            if ops.len() != t1.ids.len() {
                return Err(Error::BadArg(
                    "storage returned a wrong number of scan operators".into(),
                ));
            }
            match t2op {
                Tier2Operator::ChainSeries => {
                    let sources = pair_scan_sources(ops, &t2.ids)?;
                    chain_series(sources, proc)
                }
                Tier2Operator::MergeTimeOrder => {
                    let sources = pair_scan_sources(ops, &t2.ids)?;
                    merge_scan(sources, forward, MergeOrder::TimeMajor, proc)
                }
                Tier2Operator::MergeSeriesOrder => {
                    let sources = pair_scan_sources(ops, &t2.ids)?;
                    merge_scan(sources, forward, MergeOrder::SeriesMajor, proc)
                }
                Tier2Operator::MergeJoinSeriesOrder => {
                    merge_join(ops, t2, forward, MergeOrder::SeriesMajor, proc)
                }
                Tier2Operator::MergeJoinTimeOrder => {
                    merge_join(ops, t2, forward, MergeOrder::TimeMajor, proc)
                }
                _ => Err(Error::BadArg(
                    "scan tier can't feed an aggregate materializer".into(),
                )),
            }
        }
        StageOp::Tier1(Tier1Operator::AggregateRange) => {
            let ops = store.aggregate(&t1.ids, begin, end)?;
            let sources = pair_agg_sources(ops, &t2.ids)?;
            match t2op {
                Tier2Operator::Aggregate => materialize_aggregate(sources, &t2.funcs, proc),
                Tier2Operator::AggregateCombine => {
                    combine_aggregate(sources, &t2.funcs, proc)
                }
                _ => Err(Error::BadArg(
                    "aggregate tier needs an aggregate materializer".into(),
                )),
            }
        }
        StageOp::Tier1(Tier1Operator::GroupAggregateRange) => {
            let ops = store.group_aggregate(&t1.ids, begin, end, t1.step)?;
            let sources = pair_agg_sources(ops, &t2.ids)?;
            match t2op {
                Tier2Operator::SeriesOrderAggregate => {
                    series_order_aggregate(sources, &t2.funcs, proc)
                }
                Tier2Operator::TimeOrderAggregate => {
                    time_order_aggregate(sources, &t2.funcs, forward, proc)
                }
                _ => Err(Error::BadArg(
                    "group-aggregate tier needs a bucket materializer".into(),
                )),
            }
        }
        StageOp::Tier2(_) => Err(Error::BadArg("malformed query plan".into())),
    }
}

fn pair_scan_sources(
    ops: Vec<Box<dyn RealValuedOperator>>,
    out_ids: &[ParamId],
) -> Result<Vec<ScanSource>> {
    if ops.len() != out_ids.len() {
        return Err(Error::BadArg(
            "plan output ids don't line up with storage operators".into(),
        ));
    }
    Ok(ops
        .into_iter()
        .zip(out_ids.iter())
        .map(|(op, &id)| ScanSource::new(op, id))
        .collect())
}

fn pair_agg_sources(
    ops: Vec<Box<dyn AggregateOperator>>,
    out_ids: &[ParamId],
) -> Result<Vec<AggSource>> {
    if ops.len() != out_ids.len() {
        return Err(Error::BadArg(
            "plan output ids don't line up with storage operators".into(),
        ));
    }
    Ok(ops
        .into_iter()
        .zip(out_ids.iter())
        .map(|(op, &id)| AggSource::new(op, id))
        .collect())
}

fn emit(proc: &mut dyn QueryProcessor, sample: Sample) -> bool {
    telemetry::record_sample_emitted();
    proc.put(sample)
}

/// Series-major output: drains each source fully before the next.
fn chain_series(mut sources: Vec<ScanSource>, proc: &mut dyn QueryProcessor) -> Result<()> {
    for source in sources.iter_mut() {
        while let Some((ts, value)) = source.peek()? {
            if !emit(proc, Sample::float(ts, source.out_id, value)) {
                return Ok(());
            }
            source.advance();
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MergeOrder {
    /// Key `(timestamp, id)`.
    TimeMajor,
    /// Key `(id, timestamp)`.
    SeriesMajor,
}

/// K-way merge over scan sources. Series order uses the *output* id as the
/// major key, which also interleaves correctly when a group-by maps many
/// storage series onto one representative.
fn merge_scan(
    mut sources: Vec<ScanSource>,
    forward: bool,
    order: MergeOrder,
    proc: &mut dyn QueryProcessor,
) -> Result<()> {
    let key_of = |order: MergeOrder, ts: Timestamp, id: ParamId, src: usize| match order {
        MergeOrder::TimeMajor => (direction_key(forward, ts), id, src as u64),
        MergeOrder::SeriesMajor => (id, direction_key(forward, ts), src as u64),
    };

    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (ix, source) in sources.iter_mut().enumerate() {
        if let Some((ts, _)) = source.peek()? {
            heap.push(Reverse(key_of(order, ts, source.out_id, ix)));
        }
    }
    while let Some(Reverse((_, _, src))) = heap.pop() {
        let source = &mut sources[src as usize];
        let (ts, value) = match source.peek()? {
            Some(pair) => pair,
            None => continue,
        };
        if !emit(proc, Sample::float(ts, source.out_id, value)) {
            return Ok(());
        }
        source.advance();
        if let Some((next_ts, _)) = source.peek()? {
            heap.push(Reverse(key_of(order, next_ts, source.out_id, src as usize)));
        }
    }
    Ok(())
}

/// Join materializer. Tier-1 operators arrive row-interleaved: operator
/// `row * cardinality + column` reads column `column` of row `row`. Every
/// emitted sample carries the row's first-column id, whose display name is
/// the pipe-joined metric list.
fn merge_join(
    ops: Vec<Box<dyn RealValuedOperator>>,
    t2: &QueryPlanStage,
    forward: bool,
    order: MergeOrder,
    proc: &mut dyn QueryProcessor,
) -> Result<()> {
    let cardinality = t2.join_cardinality;
    if cardinality < 2 || ops.len() != t2.ids.len() * cardinality {
        return Err(Error::BadArg(
            "join plan output ids don't line up with storage operators".into(),
        ));
    }
    let mut sources: Vec<ScanSource> = Vec::with_capacity(ops.len());
    for (ix, op) in ops.into_iter().enumerate() {
        let row = ix / cardinality;
        sources.push(ScanSource::new(op, t2.ids[row]));
    }

    match order {
        MergeOrder::SeriesMajor => {
            // Row by row; inside a row merge the columns by timestamp.
            for row_sources in sources.chunks_mut(cardinality) {
                let mut heap = BinaryHeap::with_capacity(cardinality);
                for (column, source) in row_sources.iter_mut().enumerate() {
                    if let Some((ts, _)) = source.peek()? {
                        heap.push(Reverse((direction_key(forward, ts), column)));
                    }
                }
                while let Some(Reverse((_, column))) = heap.pop() {
                    let source = &mut row_sources[column];
                    let (ts, value) = match source.peek()? {
                        Some(pair) => pair,
                        None => continue,
                    };
                    if !emit(proc, Sample::float(ts, source.out_id, value)) {
                        return Ok(());
                    }
                    source.advance();
                    if let Some((next_ts, _)) = source.peek()? {
                        heap.push(Reverse((direction_key(forward, next_ts), column)));
                    }
                }
            }
        }
        MergeOrder::TimeMajor => {
            // Global merge by (timestamp, row, column).
            let mut heap = BinaryHeap::with_capacity(sources.len());
            for (ix, source) in sources.iter_mut().enumerate() {
                if let Some((ts, _)) = source.peek()? {
                    heap.push(Reverse((direction_key(forward, ts), ix)));
                }
            }
            while let Some(Reverse((_, ix))) = heap.pop() {
                let source = &mut sources[ix];
                let (ts, value) = match source.peek()? {
                    Some(pair) => pair,
                    None => continue,
                };
                if !emit(proc, Sample::float(ts, source.out_id, value)) {
                    return Ok(());
                }
                source.advance();
                if let Some((next_ts, _)) = source.peek()? {
                    heap.push(Reverse((direction_key(forward, next_ts), ix)));
                }
            }
        }
    }
    Ok(())
}

/// Whole-range aggregation: one tuple per series, one output sample per
/// requested function, stamped with the tuple's first timestamp.
fn materialize_aggregate(
    mut sources: Vec<AggSource>,
    funcs: &[AggregationFunction],
    proc: &mut dyn QueryProcessor,
) -> Result<()> {
    for source in sources.iter_mut() {
        while let Some((_, tuple)) = source.peek()? {
            if tuple.cnt != 0 {
                for func in funcs {
                    let sample =
                        Sample::float(tuple.first_ts, source.out_id, func.apply(&tuple));
                    if !emit(proc, sample) {
                        return Ok(());
                    }
                }
            }
            source.advance();
        }
    }
    Ok(())
}

/// Group-by aggregation: folds the tuples of every series sharing a group
/// representative, then emits per function, representatives in ascending
/// id order.
fn combine_aggregate(
    mut sources: Vec<AggSource>,
    funcs: &[AggregationFunction],
    proc: &mut dyn QueryProcessor,
) -> Result<()> {
    let mut combined: BTreeMap<ParamId, AggregationResult> = BTreeMap::new();
    for source in sources.iter_mut() {
        while let Some((_, tuple)) = source.peek()? {
            combined.entry(source.out_id).or_default().combine(&tuple);
            source.advance();
        }
    }
    for (id, tuple) in combined {
        if tuple.cnt == 0 {
            continue;
        }
        for func in funcs {
            if !emit(proc, Sample::float(tuple.first_ts, id, func.apply(&tuple))) {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Bucketed aggregation in series order: drains each series' buckets in
/// turn, emitting `funcs.len()` samples per bucket.
fn series_order_aggregate(
    mut sources: Vec<AggSource>,
    funcs: &[AggregationFunction],
    proc: &mut dyn QueryProcessor,
) -> Result<()> {
    for source in sources.iter_mut() {
        while let Some((bucket_ts, tuple)) = source.peek()? {
            if tuple.cnt != 0 {
                for func in funcs {
                    let sample = Sample::float(bucket_ts, source.out_id, func.apply(&tuple));
                    if !emit(proc, sample) {
                        return Ok(());
                    }
                }
            }
            source.advance();
        }
    }
    Ok(())
}

/// Bucketed aggregation in time order: k-way merge of buckets by
/// `(bucket, id)`, emitting `funcs.len()` samples per bucket.
fn time_order_aggregate(
    mut sources: Vec<AggSource>,
    funcs: &[AggregationFunction],
    forward: bool,
    proc: &mut dyn QueryProcessor,
) -> Result<()> {
    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (ix, source) in sources.iter_mut().enumerate() {
        if let Some((ts, _)) = source.peek()? {
            heap.push(Reverse((direction_key(forward, ts), source.out_id, ix)));
        }
    }
    while let Some(Reverse((_, _, ix))) = heap.pop() {
        let source = &mut sources[ix];
        let (bucket_ts, tuple) = match source.peek()? {
            Some(pair) => pair,
            None => continue,
        };
        if tuple.cnt != 0 {
            for func in funcs {
                let sample = Sample::float(bucket_ts, source.out_id, func.apply(&tuple));
                if !emit(proc, sample) {
                    return Ok(());
                }
            }
        }
        source.advance();
        if let Some((next_ts, _)) = source.peek()? {
            heap.push(Reverse((direction_key(forward, next_ts), source.out_id, ix)));
        }
    }
    Ok(())
}
