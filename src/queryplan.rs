//! Two-tier query plans.
//!
//! A [`ReshapeRequest`] is the normalized, id-resolved form of a query. The
//! plan builder turns it into two stages: tier 1 names the per-series
//! storage operator to run, tier 2 names the materializer that folds the
//! per-series streams into one output sequence.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::seriesparser::SeriesMatcher;
use crate::types::{ParamId, Timestamp, TsDuration};

/// Output ordering of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    /// Lexicographic by `(timestamp, series)`.
    #[default]
    Time,
    /// Lexicographic by `(series, timestamp)`.
    Series,
}

/// Aggregation function applied over storage-level aggregate tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationFunction {
    Cnt,
    Sum,
    Min,
    Max,
    Mean,
    MinTimestamp,
    MaxTimestamp,
}

impl AggregationFunction {
    /// Parses a function name from a query. Unknown names are query errors.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "cnt" | "count" => Ok(AggregationFunction::Cnt),
            "sum" => Ok(AggregationFunction::Sum),
            "min" => Ok(AggregationFunction::Min),
            "max" => Ok(AggregationFunction::Max),
            "mean" | "avg" => Ok(AggregationFunction::Mean),
            "min_timestamp" => Ok(AggregationFunction::MinTimestamp),
            "max_timestamp" => Ok(AggregationFunction::MaxTimestamp),
            _ => Err(Error::QueryParsing(format!(
                "invalid aggregation function `{name}`"
            ))),
        }
    }

    /// Canonical name, used in display-name rewrites.
    pub fn name(&self) -> &'static str {
        match self {
            AggregationFunction::Cnt => "cnt",
            AggregationFunction::Sum => "sum",
            AggregationFunction::Min => "min",
            AggregationFunction::Max => "max",
            AggregationFunction::Mean => "mean",
            AggregationFunction::MinTimestamp => "min_timestamp",
            AggregationFunction::MaxTimestamp => "max_timestamp",
        }
    }
}

/// One column of series ids. SELECT and aggregates carry one column; JOIN
/// carries one per joined metric.
#[derive(Debug, Clone, Default)]
pub struct Column {
    pub ids: Vec<ParamId>,
}

/// What to read from storage.
#[derive(Debug, Clone, Default)]
pub struct SelectClause {
    pub begin: Timestamp,
    pub end: Timestamp,
    pub columns: Vec<Column>,
    /// Matcher resolving output ids to display names. When absent the
    /// caller falls back to the global catalog.
    pub matcher: Option<Arc<SeriesMatcher>>,
}

/// Storage-level aggregation settings.
#[derive(Debug, Clone, Default)]
pub struct AggregateClause {
    pub enabled: bool,
    /// Bucket width for group-aggregate queries; zero for whole-range
    /// aggregation.
    pub step: TsDuration,
    pub funcs: Vec<AggregationFunction>,
}

/// Tag-projection grouping settings.
#[derive(Debug, Clone, Default)]
pub struct GroupByClause {
    pub enabled: bool,
    /// Original series id -> group-representative id. Series without an
    /// entry are dropped from the output.
    pub transient_map: HashMap<ParamId, ParamId>,
    /// Matcher naming the group representatives.
    pub matcher: Option<Arc<SeriesMatcher>>,
}

/// Normalized, resolved representation of a query, consumed by the plan
/// builder and the executor.
#[derive(Debug, Clone, Default)]
pub struct ReshapeRequest {
    pub select: SelectClause,
    pub agg: AggregateClause,
    pub order_by: OrderBy,
    pub group_by: GroupByClause,
    /// Time-bucketing step for pipeline boundary markers; zero when the
    /// query has no group-by time clause.
    pub group_by_time: TsDuration,
}

/// Tier-1 operators produce per-series data streams from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier1Operator {
    ScanRange,
    AggregateRange,
    GroupAggregateRange,
}

/// Tier-2 operators merge, chain, or reduce tier-1 streams into a single
/// output sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier2Operator {
    ChainSeries,
    MergeTimeOrder,
    MergeSeriesOrder,
    Aggregate,
    AggregateCombine,
    SeriesOrderAggregate,
    TimeOrderAggregate,
    MergeJoinSeriesOrder,
    MergeJoinTimeOrder,
}

/// Operator slot of a plan stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOp {
    Tier1(Tier1Operator),
    Tier2(Tier2Operator),
}

/// One stage of a query plan.
#[derive(Debug, Clone)]
pub struct QueryPlanStage {
    pub op: StageOp,
    pub ids: Vec<ParamId>,
    pub time_range: (Timestamp, Timestamp),
    pub matcher: Option<Arc<SeriesMatcher>>,
    pub funcs: Vec<AggregationFunction>,
    /// Bucket width; nonzero only for group-aggregate tier 1.
    pub step: TsDuration,
    /// Number of joined columns; nonzero only for join tier 2.
    pub join_cardinality: usize,
}

impl QueryPlanStage {
    fn new(op: StageOp) -> Self {
        QueryPlanStage {
            op,
            ids: Vec::new(),
            time_range: (0, 0),
            matcher: None,
            funcs: Vec::new(),
            step: 0,
            join_cardinality: 0,
        }
    }

    pub fn tier(&self) -> u8 {
        match self.op {
            StageOp::Tier1(_) => 1,
            StageOp::Tier2(_) => 2,
        }
    }
}

/// An ordered two-stage execution plan.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    stages: Vec<QueryPlanStage>,
}

impl QueryPlan {
    /// Builds the plan for a resolved request. The request shape must be
    /// internally consistent (the parsers only produce consistent shapes);
    /// inconsistent shapes are programming errors and panic.
    pub fn new(req: &ReshapeRequest) -> Self {
        let stages = if req.agg.enabled && req.agg.step == 0 {
            create_aggregate(req)
        } else if req.agg.enabled {
            create_group_aggregate(req)
        } else if req.select.columns.len() > 1 {
            create_join(req)
        } else {
            create_scan(req)
        };
        QueryPlan { stages }
    }

    pub fn stages(&self) -> &[QueryPlanStage] {
        &self.stages
    }

    /// The tier-1 and tier-2 stages of this plan.
    pub fn two_tiers(&self) -> Result<(&QueryPlanStage, &QueryPlanStage)> {
        match self.stages.as_slice() {
            [t1, t2] if t1.tier() == 1 && t2.tier() == 2 => Ok((t1, t2)),
            _ => Err(Error::BadArg("malformed query plan".into())),
        }
    }
}

/// Rewrites a column through the group-by transient map. Returns the
/// surviving original ids (tier 1 input) paired positionally with their
/// group representatives (tier 2 output).
fn map_group_by_ids(
    column: &Column,
    transient_map: &HashMap<ParamId, ParamId>,
) -> (Vec<ParamId>, Vec<ParamId>) {
    let mut originals = Vec::new();
    let mut representatives = Vec::new();
    for &id in &column.ids {
        if let Some(&rep) = transient_map.get(&id) {
            originals.push(id);
            representatives.push(rep);
        }
    }
    (originals, representatives)
}

fn create_scan(req: &ReshapeRequest) -> Vec<QueryPlanStage> {
    assert!(
        !req.agg.enabled && req.select.columns.len() == 1,
        "scan request can't carry aggregation or multiple columns"
    );

    let (begin, end) = (req.select.begin, req.select.end);
    let column = &req.select.columns[0];

    let mut t1 = QueryPlanStage::new(StageOp::Tier1(Tier1Operator::ScanRange));
    t1.time_range = (begin, end);
    t1.matcher = req.select.matcher.clone();

    let mut t2;
    if req.group_by.enabled {
        let (originals, representatives) = map_group_by_ids(column, &req.group_by.transient_map);
        t1.ids = originals;
        let op = match req.order_by {
            OrderBy::Series => Tier2Operator::MergeSeriesOrder,
            OrderBy::Time => Tier2Operator::MergeTimeOrder,
        };
        t2 = QueryPlanStage::new(StageOp::Tier2(op));
        t2.ids = representatives;
        t2.matcher = req.group_by.matcher.clone();
    } else {
        t1.ids = column.ids.clone();
        let op = match req.order_by {
            OrderBy::Series => Tier2Operator::ChainSeries,
            OrderBy::Time => Tier2Operator::MergeTimeOrder,
        };
        t2 = QueryPlanStage::new(StageOp::Tier2(op));
        t2.ids = column.ids.clone();
        t2.matcher = req.select.matcher.clone();
    }
    t2.time_range = (begin, end);
    vec![t1, t2]
}

fn create_aggregate(req: &ReshapeRequest) -> Vec<QueryPlanStage> {
    assert!(
        req.order_by == OrderBy::Series,
        "aggregate request must be ordered by series"
    );

    let (begin, end) = (req.select.begin, req.select.end);
    let column = &req.select.columns[0];

    let mut t1 = QueryPlanStage::new(StageOp::Tier1(Tier1Operator::AggregateRange));
    t1.time_range = (begin, end);
    t1.matcher = req.select.matcher.clone();

    let mut t2;
    if req.group_by.enabled {
        let (originals, representatives) = map_group_by_ids(column, &req.group_by.transient_map);
        t1.ids = originals;
        t2 = QueryPlanStage::new(StageOp::Tier2(Tier2Operator::AggregateCombine));
        t2.ids = representatives;
        t2.matcher = req.group_by.matcher.clone();
    } else {
        t1.ids = column.ids.clone();
        t2 = QueryPlanStage::new(StageOp::Tier2(Tier2Operator::Aggregate));
        t2.ids = column.ids.clone();
        t2.matcher = req.select.matcher.clone();
    }
    t2.time_range = (begin, end);
    t2.funcs = req.agg.funcs.clone();
    vec![t1, t2]
}

fn create_group_aggregate(req: &ReshapeRequest) -> Vec<QueryPlanStage> {
    assert!(
        req.agg.enabled && req.agg.step != 0,
        "group-aggregate request must carry a nonzero step"
    );
    assert!(
        !req.group_by.enabled,
        "group-by is not supported in group-aggregate queries"
    );

    let (begin, end) = (req.select.begin, req.select.end);
    let column = &req.select.columns[0];

    let mut t1 = QueryPlanStage::new(StageOp::Tier1(Tier1Operator::GroupAggregateRange));
    t1.ids = column.ids.clone();
    t1.time_range = (begin, end);
    t1.matcher = req.select.matcher.clone();
    t1.step = req.agg.step;

    let op = match req.order_by {
        OrderBy::Series => Tier2Operator::SeriesOrderAggregate,
        OrderBy::Time => Tier2Operator::TimeOrderAggregate,
    };
    let mut t2 = QueryPlanStage::new(StageOp::Tier2(op));
    t2.ids = column.ids.clone();
    t2.time_range = (begin, end);
    t2.matcher = req.select.matcher.clone();
    t2.funcs = req.agg.funcs.clone();
    vec![t1, t2]
}

fn create_join(req: &ReshapeRequest) -> Vec<QueryPlanStage> {
    assert!(
        !req.agg.enabled && !req.group_by.enabled && req.select.columns.len() >= 2,
        "join request needs two or more plain columns"
    );

    let (begin, end) = (req.select.begin, req.select.end);
    let cardinality = req.select.columns.len();
    let rows = req.select.columns[0].ids.len();
    for column in &req.select.columns {
        assert!(
            column.ids.len() == rows,
            "join columns must have equal length"
        );
    }

    // Tier 1 reads rows in interleaved order: row 0 of every column, then
    // row 1, and so on.
    let mut interleaved = Vec::with_capacity(rows * cardinality);
    for row in 0..rows {
        for column in &req.select.columns {
            interleaved.push(column.ids[row]);
        }
    }

    let mut t1 = QueryPlanStage::new(StageOp::Tier1(Tier1Operator::ScanRange));
    t1.ids = interleaved;
    t1.time_range = (begin, end);
    t1.matcher = req.select.matcher.clone();

    let op = match req.order_by {
        OrderBy::Series => Tier2Operator::MergeJoinSeriesOrder,
        OrderBy::Time => Tier2Operator::MergeJoinTimeOrder,
    };
    let mut t2 = QueryPlanStage::new(StageOp::Tier2(op));
    // The join takes its output ids from the first column.
    t2.ids = req.select.columns[0].ids.clone();
    t2.time_range = (begin, end);
    t2.matcher = req.select.matcher.clone();
    t2.join_cardinality = cardinality;
    vec![t1, t2]
}
