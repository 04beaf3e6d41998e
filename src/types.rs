/// Timestamp type: count of 10 ns intervals since the epoch.
///
/// The 10 ns unit keeps a u64 usable far past 2038 while still resolving
/// sub-microsecond events.
pub type Timestamp = u64;

/// Duration type, same 10 ns unit as [`Timestamp`]. Always non-negative.
pub type TsDuration = u64;

/// Stable numeric identity of a series within the catalog.
/// Zero means "no such series"; real ids are assigned monotonically
/// starting from one and never reused within a process.
pub type ParamId = u64;

/// Value type.
pub type Value = f64;

/// Number of 10 ns ticks in one second.
pub const TICKS_PER_SEC: u64 = 100_000_000;

/// Maximum length of a series name in bytes (canonical form).
pub const MAX_SERIES_NAME_LEN: usize = 1024;

/// Maximum number of tags in a series name.
pub const MAX_TAGS: usize = 32;

/// Payload carried by a sample flowing through the query pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    /// A real data point.
    Float(Value),
    /// Group-by bucket boundary marker. Buffering nodes drain on it.
    Empty,
    /// Internal non-data event; swallowed by the terminal node.
    Margin,
    /// Id-only sample, no value. Produced by metadata queries.
    ParamIdBit,
}

/// A single element of the sample stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub paramid: ParamId,
    pub payload: Payload,
}

impl Sample {
    /// A real data point.
    pub fn float(timestamp: Timestamp, paramid: ParamId, value: Value) -> Self {
        Sample {
            timestamp,
            paramid,
            payload: Payload::Float(value),
        }
    }

    /// A group-by boundary marker at the given bucket edge.
    pub fn empty_marker(timestamp: Timestamp) -> Self {
        Sample {
            timestamp,
            paramid: 0,
            payload: Payload::Empty,
        }
    }

    /// An internal margin event.
    pub fn margin(timestamp: Timestamp) -> Self {
        Sample {
            timestamp,
            paramid: 0,
            payload: Payload::Margin,
        }
    }

    /// An id-only sample (metadata query output).
    pub fn id_only(paramid: ParamId) -> Self {
        Sample {
            timestamp: 0,
            paramid,
            payload: Payload::ParamIdBit,
        }
    }

    /// The data value, if this sample carries one.
    pub fn value(&self) -> Option<Value> {
        match self.payload {
            Payload::Float(x) => Some(x),
            _ => None,
        }
    }

    /// True for `Empty` and `Margin` payloads.
    pub fn is_marker(&self) -> bool {
        matches!(self.payload, Payload::Empty | Payload::Margin)
    }

    /// Sort key used by buffering nodes: `(timestamp, paramid)` ascending.
    pub fn sort_key(&self) -> (Timestamp, ParamId) {
        (self.timestamp, self.paramid)
    }
}
