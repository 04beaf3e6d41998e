//! Metrics instrumentation for the query core.
//!
//! This crate is a library; it never installs a recorder or prints
//! anything. Recording is a no-op until the embedding process installs a
//! `metrics` recorder, at which point the counters below start moving.

use ::metrics::{describe_counter, Unit};

// Counters are exposed as `<name>_total` by typical exporters.

pub const QUERIES_OK: &str = "varve_queries_ok";
pub const QUERIES_FAILED: &str = "varve_queries_failed";
pub const QUERY_PARSE_ERRORS: &str = "varve_query_parse_errors";
pub const SAMPLES_EMITTED: &str = "varve_samples_emitted";

#[inline]
pub fn record_query_ok() {
    ::metrics::counter!(QUERIES_OK).increment(1);
}

#[inline]
pub fn record_query_failed() {
    ::metrics::counter!(QUERIES_FAILED).increment(1);
}

#[inline]
pub fn record_query_parse_error() {
    ::metrics::counter!(QUERY_PARSE_ERRORS).increment(1);
}

#[inline]
pub fn record_sample_emitted() {
    ::metrics::counter!(SAMPLES_EMITTED).increment(1);
}

/// Registers descriptions for every metric this crate emits. Call once
/// after installing a recorder.
pub fn describe_all() {
    describe_counter!(
        QUERIES_OK,
        Unit::Count,
        "Queries that parsed, planned and ran to completion."
    );
    describe_counter!(
        QUERIES_FAILED,
        Unit::Count,
        "Queries that failed during plan execution (storage errors, no data)."
    );
    describe_counter!(
        QUERY_PARSE_ERRORS,
        Unit::Count,
        "Queries rejected by the grammar validator or the series resolver."
    );
    describe_counter!(
        SAMPLES_EMITTED,
        Unit::Count,
        "Samples produced by tier-2 materializers across all queries."
    );
}
