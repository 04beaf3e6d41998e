//! Append-only arena for canonical series names.
//!
//! Names are written into fixed-capacity chunks; every interned name is a
//! [`Bytes`] view into its chunk, so the backing storage never moves and a
//! view stays valid for the pool's lifetime. The pool only grows: readers
//! that observed `size() == S` may later rescan from their previous offset
//! to pick up names added after `S` without locking out writers.

use bytes::{Bytes, BytesMut};
use regex::Regex;
use std::sync::RwLock;

use crate::types::MAX_SERIES_NAME_LEN;

/// Capacity of one arena chunk.
pub const POOL_CHUNK_SIZE: usize = MAX_SERIES_NAME_LEN * 0x1000;

/// Resumable scan position for [`StringPool::regex_match`].
///
/// A default-constructed offset starts the scan from the beginning of the
/// pool. After a scan the offset points past the scanned region, so the next
/// call only visits names added in between.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StringPoolOffset {
    entries: usize,
}

#[derive(Debug, Default)]
struct PoolInner {
    /// Open chunk; filled front to back, replaced when exhausted.
    open: BytesMut,
    /// Every interned name, in insertion order.
    entries: Vec<Bytes>,
    /// Total interned bytes. Monotonically non-decreasing.
    total_bytes: usize,
}

/// Append-only pool of interned series names.
#[derive(Debug, Default)]
pub struct StringPool {
    inner: RwLock<PoolInner>,
}

impl StringPool {
    pub fn new() -> Self {
        StringPool::default()
    }

    /// Appends `name` to the arena and returns a stable view of it.
    /// Interning the empty string returns an empty view without touching
    /// the arena.
    pub fn add(&self, name: &str) -> Bytes {
        if name.is_empty() {
            return Bytes::new();
        }
        let mut inner = self.inner.write().expect("string pool lock");
        if inner.open.capacity() < name.len() {
            inner.open = BytesMut::with_capacity(POOL_CHUNK_SIZE.max(name.len()));
        }
        inner.open.extend_from_slice(name.as_bytes());
        let view = inner.open.split().freeze();
        inner.total_bytes += view.len();
        inner.entries.push(view.clone());
        view
    }

    /// Total number of interned bytes. Monotone.
    pub fn size(&self) -> usize {
        self.inner.read().expect("string pool lock").total_bytes
    }

    /// Number of interned names. Monotone.
    pub fn entry_count(&self) -> usize {
        self.inner.read().expect("string pool lock").entries.len()
    }

    /// Scans names from `offset` to the current end of the pool and returns
    /// every name matched by `re`. On return `offset` points past the
    /// scanned region. Callers anchor the pattern when a full-name match is
    /// intended.
    pub fn regex_match(&self, re: &Regex, offset: &mut StringPoolOffset) -> Vec<Bytes> {
        let snapshot: Vec<Bytes> = {
            let inner = self.inner.read().expect("string pool lock");
            inner.entries[offset.entries.min(inner.entries.len())..].to_vec()
        };
        offset.entries += snapshot.len();
        snapshot
            .into_iter()
            .filter(|name| match std::str::from_utf8(name) {
                Ok(text) => re.is_match(text),
                Err(_) => false,
            })
            .collect()
    }
}
