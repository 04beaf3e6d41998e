use thiserror::Error;

/// Status taxonomy of the query core.
///
/// User errors (malformed queries, bad series names) surface as `Err` values
/// through the parsing and planning APIs. Invariant violations (catalog
/// corruption, impossible plan shapes) are not represented here; they abort
/// via panic because they can never be caused by user input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    BadArg(String),

    #[error("bad data: {0}")]
    BadData(String),

    #[error("query parsing error: {0}")]
    QueryParsing(String),

    #[error("no data")]
    NoData,

    #[error("numeric overflow: {0}")]
    Overflow(String),
}

/// Result type for query core operations.
pub type Result<T> = std::result::Result<T, Error>;
