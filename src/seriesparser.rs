//! Series name canonicalization and the series catalog.
//!
//! A series name is a metric followed by `key=value` tags. The canonical
//! form collapses whitespace and sorts tags by key so that two spellings of
//! the same series compare byte-equal. [`SeriesMatcher`] maps canonical
//! names to stable numeric ids and back, and supports regex scans over the
//! interned namespace.

use bytes::Bytes;
use regex::Regex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::stringpool::StringPool;
use crate::types::{ParamId, MAX_SERIES_NAME_LEN, MAX_TAGS};

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-'
}

fn is_space(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Converts a series name to canonical form.
///
/// In canonical form the metric name is followed by `key=value` pairs in
/// lexicographical key order, all separated by exactly one space. Tokens are
/// drawn from `[A-Za-z0-9._-]`; a tag without `=`, an empty key or value, or
/// a name longer than [`MAX_SERIES_NAME_LEN`] is rejected with
/// [`Error::BadData`]. `out` must be at least as long as the input or the
/// call fails with [`Error::BadArg`].
///
/// Returns the number of bytes written and the sub-range of `out` holding
/// the tag string (empty when the name has no tags).
pub fn to_normal_form(input: &[u8], out: &mut [u8]) -> Result<(usize, Range<usize>)> {
    if input.len() > MAX_SERIES_NAME_LEN {
        return Err(Error::BadData(format!(
            "series name is too long ({} bytes, max {})",
            input.len(),
            MAX_SERIES_NAME_LEN
        )));
    }
    if out.len() < input.len() {
        return Err(Error::BadArg("output buffer is too small".into()));
    }

    let mut tokens = input
        .split(|&b| is_space(b))
        .filter(|token| !token.is_empty());

    let metric = tokens
        .next()
        .ok_or_else(|| Error::BadData("empty series name".into()))?;
    if !metric.iter().copied().all(is_token_byte) {
        return Err(Error::BadData(format!(
            "invalid metric name `{}`",
            String::from_utf8_lossy(metric)
        )));
    }

    let mut tags: Vec<(&[u8], &[u8])> = Vec::new();
    for token in tokens {
        let eq = token.iter().position(|&b| b == b'=').ok_or_else(|| {
            Error::BadData(format!(
                "tag `{}` has no value",
                String::from_utf8_lossy(token)
            ))
        })?;
        let (key, value) = (&token[..eq], &token[eq + 1..]);
        let key_ok = !key.is_empty() && key.iter().copied().all(is_token_byte);
        let value_ok = !value.is_empty() && value.iter().copied().all(is_token_byte);
        if !key_ok || !value_ok {
            return Err(Error::BadData(format!(
                "malformed tag `{}`",
                String::from_utf8_lossy(token)
            )));
        }
        tags.push((key, value));
        if tags.len() > MAX_TAGS {
            return Err(Error::BadData(format!(
                "too many tags (max {MAX_TAGS})"
            )));
        }
    }
    tags.sort_by(|a, b| a.0.cmp(b.0));

    let mut written = 0;
    out[written..written + metric.len()].copy_from_slice(metric);
    written += metric.len();
    let keystr_begin = if tags.is_empty() {
        written
    } else {
        written + 1
    };
    for (key, value) in &tags {
        out[written] = b' ';
        written += 1;
        out[written..written + key.len()].copy_from_slice(key);
        written += key.len();
        out[written] = b'=';
        written += 1;
        out[written..written + value.len()].copy_from_slice(value);
        written += value.len();
    }
    Ok((written, keystr_begin..written))
}

/// Allocating convenience wrapper over [`to_normal_form`].
pub fn canonical_name(input: &str) -> Result<String> {
    let mut buf = vec![0u8; input.len()];
    let (written, _) = to_normal_form(input.as_bytes(), &mut buf)?;
    buf.truncate(written);
    String::from_utf8(buf).map_err(|_| Error::BadData("series name is not valid UTF-8".into()))
}

#[derive(Debug, Default)]
struct MatcherInner {
    /// Canonical name -> id.
    table: HashMap<Bytes, ParamId>,
    /// id -> canonical name.
    by_id: HashMap<ParamId, Bytes>,
    /// Ids in insertion order.
    insertion: Vec<ParamId>,
    /// Names added since the last [`SeriesMatcher::pull_new_names`].
    recent: Vec<(Bytes, ParamId)>,
    next_id: ParamId,
}

/// Two-way mapping between canonical series names and [`ParamId`]s, backed
/// by a [`StringPool`]. Shared across all queries of a database instance;
/// all operations take `&self`.
#[derive(Debug)]
pub struct SeriesMatcher {
    pool: StringPool,
    inner: RwLock<MatcherInner>,
}

impl SeriesMatcher {
    /// Creates a matcher whose first assigned id is `starting_id`.
    ///
    /// # Panics
    /// `starting_id` must be nonzero; zero is the "no such series" sentinel.
    pub fn new(starting_id: ParamId) -> Self {
        assert!(starting_id != 0, "series id counter can't start at zero");
        SeriesMatcher {
            pool: StringPool::new(),
            inner: RwLock::new(MatcherInner {
                next_id: starting_id,
                ..MatcherInner::default()
            }),
        }
    }

    /// The backing string pool (for offset-resumable scans).
    pub fn pool(&self) -> &StringPool {
        &self.pool
    }

    /// Canonicalizes `name`, interns it, and assigns the next id.
    /// Adding an existing name returns its id without changing the catalog.
    pub fn add(&self, name: &str) -> Result<ParamId> {
        let canonical = canonical_name(name)?;
        let mut inner = self.inner.write().expect("series matcher lock");
        if let Some(&id) = inner.table.get(canonical.as_bytes()) {
            return Ok(id);
        }
        let view = self.pool.add(&canonical);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.table.insert(view.clone(), id);
        inner.by_id.insert(id, view.clone());
        inner.insertion.push(id);
        inner.recent.push((view, id));
        Ok(id)
    }

    /// Canonicalizes `name` and looks it up. Returns 0 when the name is
    /// absent or can't be canonicalized.
    pub fn match_name(&self, name: &str) -> ParamId {
        let canonical = match canonical_name(name) {
            Ok(c) => c,
            Err(_) => return 0,
        };
        let inner = self.inner.read().expect("series matcher lock");
        inner
            .table
            .get(canonical.as_bytes())
            .copied()
            .unwrap_or(0)
    }

    /// Reverse lookup. `None` for an id this matcher never issued, which at
    /// the call sites of the query core means the catalog is corrupted and
    /// is treated as fatal.
    pub fn id2str(&self, id: ParamId) -> Option<Bytes> {
        let inner = self.inner.read().expect("series matcher lock");
        inner.by_id.get(&id).cloned()
    }

    /// Scans the interned namespace and returns every `(name, id)` whose
    /// name matches `pattern`, ordered by name bytes (metric, then tags).
    /// Patterns are matched as-is; anchor with `^...$` for full-name
    /// semantics. A pattern that fails to compile is a query error.
    pub fn regex_match(&self, pattern: &str) -> Result<Vec<(Bytes, ParamId)>> {
        let re = Regex::new(pattern)
            .map_err(|e| Error::QueryParsing(format!("invalid series pattern: {e}")))?;
        let inner = self.inner.read().expect("series matcher lock");
        let mut results: Vec<(Bytes, ParamId)> = inner
            .table
            .iter()
            .filter(|(name, _)| match std::str::from_utf8(name) {
                Ok(text) => re.is_match(text),
                Err(_) => false,
            })
            .map(|(name, &id)| (name.clone(), id))
            .collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    /// All ids in insertion order.
    pub fn get_all_ids(&self) -> Vec<ParamId> {
        self.inner
            .read()
            .expect("series matcher lock")
            .insertion
            .clone()
    }

    /// Loads a known `name -> id` mapping without advancing the id counter.
    /// Used when restoring the catalog from external storage and when
    /// building per-query display-name matchers; `name` is interned as-is.
    pub fn restore(&self, name: &str, id: ParamId) {
        if name.is_empty() {
            return;
        }
        let mut inner = self.inner.write().expect("series matcher lock");
        if inner.table.contains_key(name.as_bytes()) {
            return;
        }
        let view = self.pool.add(name);
        inner.table.insert(view.clone(), id);
        inner.by_id.insert(id, view);
        inner.insertion.push(id);
    }

    /// Drains the list of names added since the previous call. The ingest
    /// controller uses this to sync new series to external storage.
    pub fn pull_new_names(&self) -> Vec<(Bytes, ParamId)> {
        let mut inner = self.inner.write().expect("series matcher lock");
        std::mem::take(&mut inner.recent)
    }
}

impl Default for SeriesMatcher {
    fn default() -> Self {
        SeriesMatcher::new(1)
    }
}
