#![doc = r#"
varve: query-processing core for a numeric time-series database

This crate turns declarative JSON queries against a named-series catalog
into ordered execution plans over storage-level operators, and streams the
results through a pipeline of grouping, sampling, and aggregation stages.
It provides:
- A canonicalizing series catalog with stable numeric ids and regex lookup
- A JSON query grammar with where-clause resolution against the catalog
- A two-tier plan builder (per-series operators, then a materializer)
- Streaming pipeline nodes: time bucketing, limiting, reservoir sampling,
  and piecewise aggregate approximation
- Query drivers wiring plans to pipelines with cooperative backpressure

The storage engine itself is external: plan execution consumes it through
the `SeriesStore` operator traits, and results leave through a
caller-supplied `Cursor`.
"#]
// Declare modules
pub mod datetime;
pub mod error;
pub mod executor;
pub mod operators;
pub mod pipeline;
pub mod queryparser;
pub mod queryplan;
pub mod queryprocessor;
pub mod seriesparser;
pub mod stringpool;
pub mod telemetry;
pub mod types;

/// Error type for query core operations.
pub use crate::error::{Error, Result};
/// Canonical-name catalog mapping series names to stable ids.
pub use crate::seriesparser::SeriesMatcher;
/// Series name canonicalization.
pub use crate::seriesparser::{canonical_name, to_normal_form};
/// Append-only arena backing the catalog.
pub use crate::stringpool::{StringPool, StringPoolOffset};
/// Parsed query document and kind dispatch.
pub use crate::queryparser::{QueryDoc, QueryKind};
/// Resolved query representation and the two-tier plan.
pub use crate::queryplan::{
    AggregationFunction, OrderBy, QueryPlan, ReshapeRequest, Tier1Operator, Tier2Operator,
};
/// Storage operator interface consumed by plan execution.
pub use crate::operators::{
    AggregateOperator, AggregationResult, ReadChunk, RealValuedOperator, SeriesStore,
};
/// Pipeline node interface and the caller-facing sink.
pub use crate::pipeline::{Cursor, Node, NodeKind, PipelineBuilder};
/// Query drivers and the end-to-end entry point.
pub use crate::queryprocessor::{
    execute_query, Direction, MetadataQueryProcessor, QueryProcessor, ScanQueryProcessor,
};
/// Plan execution against a storage engine.
pub use crate::executor::execute_plan;
/// Sample stream element types.
pub use crate::types::{ParamId, Payload, Sample, Timestamp, TsDuration, Value};
