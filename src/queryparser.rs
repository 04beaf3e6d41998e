//! JSON query grammar: validation, sub-clause parsing, and series
//! resolution.
//!
//! A query is a JSON object whose top-level keys form a set. Exactly one of
//! `select`, `aggregate`, `join`, `group-aggregate` picks the query kind;
//! the remaining clauses (`range`, `where`, `order-by`, `group-by`,
//! `limit`, `offset`, `output`) refine it. Every violation of the grammar
//! surfaces as [`Error::QueryParsing`] before anything executes.

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::datetime;
use crate::error::{Error, Result};
use crate::pipeline::{Cursor, Limiter, NodeStage, PipelineBuilder};
use crate::pipeline::Node;
use crate::queryplan::{
    AggregateClause, AggregationFunction, Column, GroupByClause, OrderBy, ReshapeRequest,
    SelectClause,
};
use crate::seriesparser::SeriesMatcher;
use crate::types::{ParamId, Timestamp, TsDuration};

const META_QUERY_PREFIX: &str = "meta:names";

/// Statements that pick the query kind; at most one may appear.
const KIND_STMTS: &[&str] = &["select", "aggregate", "join", "group-aggregate"];

/// Every statement the grammar knows about.
const ALLOWED_STMTS: &[&str] = &[
    "select",
    "aggregate",
    "join",
    "group-aggregate",
    "output",
    "order-by",
    "group-by",
    "limit",
    "offset",
    "range",
    "where",
];

/// Kind of a validated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Series-name listing; returns ids only.
    SelectMeta,
    /// Raw sample scan of one metric.
    Select,
    /// One function over the whole range.
    Aggregate,
    /// Per-bucket aggregates.
    GroupAggregate,
    /// N metrics aligned by shared tags.
    Join,
}

/// A parsed query document. Unlike a plain JSON map this keeps duplicate
/// top-level keys, so the validator can reject them.
#[derive(Debug)]
pub struct QueryDoc {
    pairs: Vec<(String, Json)>,
}

impl QueryDoc {
    /// Parses the query text. The document must be a JSON object.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::QueryParsing(format!("invalid JSON: {e}")))
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }
}

impl<'de> Deserialize<'de> for QueryDoc {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PairsVisitor;

        impl<'de> Visitor<'de> for PairsVisitor {
            type Value = QueryDoc;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut pairs = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, Json>()? {
                    pairs.push((key, value));
                }
                Ok(QueryDoc { pairs })
            }
        }

        deserializer.deserialize_map(PairsVisitor)
    }
}

/// Checks the top-level key set: only known statements, no duplicates, at
/// most one kind statement.
pub fn validate_query(doc: &QueryDoc) -> Result<()> {
    let mut seen: Vec<&str> = Vec::new();
    for keyword in doc.keys() {
        if !ALLOWED_STMTS.contains(&keyword) {
            return Err(Error::QueryParsing(format!(
                "unexpected `{keyword}` statement"
            )));
        }
        if seen.contains(&keyword) {
            return Err(Error::QueryParsing(format!(
                "duplicate `{keyword}` statement"
            )));
        }
        if KIND_STMTS.contains(&keyword) {
            for prior in &seen {
                if KIND_STMTS.contains(prior) {
                    return Err(Error::QueryParsing(format!(
                        "statement `{keyword}` can't be used with `{prior}`"
                    )));
                }
            }
        }
        seen.push(keyword);
    }
    Ok(())
}

fn is_meta_query(name: &str) -> bool {
    name.starts_with(META_QUERY_PREFIX)
}

/// Determines the query kind from the kind statement.
pub fn parse_query_kind(doc: &QueryDoc) -> Result<QueryKind> {
    for key in doc.keys() {
        match key {
            "select" => {
                let series = parse_select_stmt(doc)?;
                if is_meta_query(&series) {
                    return Ok(QueryKind::SelectMeta);
                }
                return Ok(QueryKind::Select);
            }
            "aggregate" => return Ok(QueryKind::Aggregate),
            "join" => return Ok(QueryKind::Join),
            "group-aggregate" => return Ok(QueryKind::GroupAggregate),
            _ => {}
        }
    }
    Err(Error::QueryParsing(
        "query must contain a `select`, `aggregate`, `join` or `group-aggregate` statement".into(),
    ))
}

fn json_scalar_to_string(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `{ "select": "metric" }`
fn parse_select_stmt(doc: &QueryDoc) -> Result<String> {
    match doc.get("select") {
        Some(Json::String(name)) if !name.is_empty() => Ok(name.clone()),
        _ => Err(Error::QueryParsing(
            "`select` must name a metric".into(),
        )),
    }
}

/// `{ "join": [ "metric1", "metric2", ... ] }`
fn parse_join_stmt(doc: &QueryDoc) -> Result<Vec<String>> {
    let join = doc
        .get("join")
        .ok_or_else(|| Error::QueryParsing("`join` statement expected".into()))?;
    let items = match join {
        Json::Array(items) => items,
        _ => {
            return Err(Error::QueryParsing(
                "`join` must be a list of metric names".into(),
            ))
        }
    };
    let mut metrics = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Json::String(name) if !name.is_empty() => metrics.push(name.clone()),
            _ => {
                return Err(Error::QueryParsing(
                    "`join` must be a list of metric names".into(),
                ))
            }
        }
    }
    if metrics.is_empty() {
        return Err(Error::QueryParsing("`join` metric list is empty".into()));
    }
    Ok(metrics)
}

/// `{ "aggregate": { "metric": "func" } }`
fn parse_aggregate_stmt(doc: &QueryDoc) -> Result<(String, AggregationFunction)> {
    let aggregate = doc
        .get("aggregate")
        .ok_or_else(|| Error::QueryParsing("`aggregate` statement expected".into()))?;
    let map = match aggregate {
        Json::Object(map) if map.len() == 1 => map,
        _ => {
            return Err(Error::QueryParsing(
                "`aggregate` must map one metric to one function".into(),
            ))
        }
    };
    // Exactly one entry, checked above.
    let (metric, func_name) = map.iter().next().expect("non-empty aggregate map");
    let func_name = func_name.as_str().ok_or_else(|| {
        Error::QueryParsing("aggregation function must be a string".into())
    })?;
    let func = AggregationFunction::from_name(func_name)?;
    Ok((metric.clone(), func))
}

/// Fields of a parsed `group-aggregate` statement.
#[derive(Debug, Clone)]
struct GroupAggregate {
    metric: String,
    funcs: Vec<AggregationFunction>,
    step: TsDuration,
}

/// `{ "group-aggregate": { "step": "30s", "metric": "name",
///    "func": ["cnt", "avg"] } }`
fn parse_group_aggregate_stmt(doc: &QueryDoc) -> Result<GroupAggregate> {
    let stmt = doc
        .get("group-aggregate")
        .ok_or_else(|| Error::QueryParsing("`group-aggregate` statement expected".into()))?;
    let map = match stmt {
        Json::Object(map) => map,
        _ => {
            return Err(Error::QueryParsing(
                "`group-aggregate` must be an object".into(),
            ))
        }
    };

    let mut step = None;
    let mut metric = None;
    let mut funcs = Vec::new();
    for (field, value) in map {
        match field.as_str() {
            "step" => {
                let text = value.as_str().ok_or_else(|| {
                    Error::QueryParsing("`step` must be a duration string".into())
                })?;
                step = Some(datetime::parse_duration(text)?);
            }
            "metric" => {
                let name = value.as_str().ok_or_else(|| {
                    Error::QueryParsing("`metric` must be a string".into())
                })?;
                metric = Some(name.to_string());
            }
            "func" => {
                let names: Vec<&str> = match value {
                    Json::String(one) => vec![one.as_str()],
                    Json::Array(items) => items
                        .iter()
                        .map(|item| {
                            item.as_str().ok_or_else(|| {
                                Error::QueryParsing(
                                    "`func` must be a function name or a list of names".into(),
                                )
                            })
                        })
                        .collect::<Result<_>>()?,
                    _ => {
                        return Err(Error::QueryParsing(
                            "`func` must be a function name or a list of names".into(),
                        ))
                    }
                };
                for name in names {
                    funcs.push(AggregationFunction::from_name(name)?);
                }
            }
            other => {
                return Err(Error::QueryParsing(format!(
                    "unexpected `{other}` field in `group-aggregate` statement"
                )))
            }
        }
    }

    let step = step.ok_or_else(|| {
        Error::QueryParsing("`group-aggregate` statement requires a `step` field".into())
    })?;
    if step == 0 {
        return Err(Error::QueryParsing("`step` can't be zero".into()));
    }
    let metric = metric.ok_or_else(|| {
        Error::QueryParsing("`group-aggregate` statement requires a `metric` field".into())
    })?;
    if funcs.is_empty() {
        return Err(Error::QueryParsing(
            "`group-aggregate` statement requires a `func` field".into(),
        ));
    }
    Ok(GroupAggregate {
        metric,
        funcs,
        step,
    })
}

/// `{ "order-by": "time" | "series" }`; defaults to time ordering.
fn parse_orderby(doc: &QueryDoc) -> Result<OrderBy> {
    match doc.get("order-by") {
        None => Ok(OrderBy::Time),
        Some(Json::String(s)) if s == "time" => Ok(OrderBy::Time),
        Some(Json::String(s)) if s == "series" => Ok(OrderBy::Series),
        Some(_) => Err(Error::QueryParsing(
            "`order-by` must be \"time\" or \"series\"".into(),
        )),
    }
}

/// Parsed `group-by` statement: tag projection and/or a time-bucketing
/// step for the pipeline.
#[derive(Debug, Clone, Default)]
struct GroupBy {
    tags: Vec<String>,
    time_step: TsDuration,
}

/// `{ "group-by": "tag" }`, `{ "group-by": ["tag1", "tag2"] }`, or
/// `{ "group-by": { "time": "1s", "tag": [...] } }`.
fn parse_groupby(doc: &QueryDoc) -> Result<GroupBy> {
    let mut result = GroupBy::default();
    let stmt = match doc.get("group-by") {
        None => return Ok(result),
        Some(v) => v,
    };
    let tag_list = |value: &Json| -> Result<Vec<String>> {
        match value {
            Json::String(one) => Ok(vec![one.clone()]),
            Json::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        Error::QueryParsing("`group-by` tags must be strings".into())
                    })
                })
                .collect(),
            _ => Err(Error::QueryParsing(
                "`group-by` tags must be strings".into(),
            )),
        }
    };
    match stmt {
        Json::String(_) | Json::Array(_) => {
            result.tags = tag_list(stmt)?;
        }
        Json::Object(map) => {
            for (field, value) in map {
                match field.as_str() {
                    "time" => {
                        let text = value.as_str().ok_or_else(|| {
                            Error::QueryParsing(
                                "`group-by` `time` must be a duration string".into(),
                            )
                        })?;
                        result.time_step = datetime::parse_duration(text)?;
                    }
                    "tag" => result.tags = tag_list(value)?,
                    other => {
                        return Err(Error::QueryParsing(format!(
                            "unexpected `{other}` field in `group-by` statement"
                        )))
                    }
                }
            }
        }
        _ => {
            return Err(Error::QueryParsing(
                "`group-by` must be a tag list or an object".into(),
            ))
        }
    }
    Ok(result)
}

/// `{ "limit": 10, "offset": 200 }`. Offset skips, limit caps.
fn parse_limit_offset(doc: &QueryDoc) -> Result<(u64, u64)> {
    let read = |key: &str| -> Result<u64> {
        match doc.get(key) {
            None => Ok(0),
            Some(value) => value.as_u64().ok_or_else(|| {
                Error::QueryParsing(format!("`{key}` must be a non-negative integer"))
            }),
        }
    };
    Ok((read("limit")?, read("offset")?))
}

/// `{ "range": { "from": ..., "to": ... } }`; both bounds required,
/// ISO-8601. `from > to` requests a backward scan.
fn parse_range_timestamps(doc: &QueryDoc) -> Result<(Timestamp, Timestamp)> {
    let range = doc
        .get("range")
        .ok_or_else(|| Error::QueryParsing("`range` statement expected".into()))?;
    let map = match range {
        Json::Object(map) => map,
        _ => return Err(Error::QueryParsing("`range` must be an object".into())),
    };
    let bound = |key: &str| -> Result<Timestamp> {
        let value = map.get(key).ok_or_else(|| {
            Error::QueryParsing(format!("can't find `{key}` tag inside the query range"))
        })?;
        let text = value
            .as_str()
            .ok_or_else(|| Error::QueryParsing(format!("range `{key}` must be a string")))?;
        datetime::from_iso_string(text)
    };
    Ok((bound("from")?, bound("to")?))
}

/// Where-clause resolver: translates metric+tag predicates into series ids
/// by scanning the catalog.
#[derive(Debug, Default)]
pub struct SeriesSelector {
    metrics: Vec<String>,
    tags: BTreeMap<String, Vec<String>>,
}

impl SeriesSelector {
    /// Matches the whole catalog.
    pub fn all() -> Self {
        SeriesSelector::default()
    }

    /// Matches every series of the given metrics.
    pub fn for_metrics(metrics: Vec<String>) -> Self {
        SeriesSelector {
            metrics,
            tags: BTreeMap::new(),
        }
    }

    /// Restricts one tag to a single value. Each tag may appear once.
    pub fn add_tag(&mut self, name: String, value: String) -> Result<()> {
        self.add_tags(name, vec![value])
    }

    /// Restricts one tag to a set of values (OR'd). Each tag may appear
    /// once.
    pub fn add_tags(&mut self, name: String, values: Vec<String>) -> Result<()> {
        if self.metrics.is_empty() {
            return Err(Error::BadArg("metric is not set".into()));
        }
        if self.tags.contains_key(&name) {
            return Err(Error::BadArg(format!("duplicate tag `{name}`")));
        }
        self.tags.insert(name, values);
        Ok(())
    }

    /// Resolves the predicate against the catalog.
    ///
    /// With one metric the result is ordered by canonical name. With k > 1
    /// metrics the result interleaves per series: for every series of the
    /// first metric, its id is followed by the ids of the same tag
    /// combination under each remaining metric (0 when the combination does
    /// not exist), so `len % k == 0`.
    pub fn extract_ids(&self, matcher: &SeriesMatcher) -> Result<Vec<ParamId>> {
        let first_metric = match self.metrics.first() {
            None => return Ok(matcher.get_all_ids()),
            Some(metric) => metric,
        };

        let pattern = self.build_pattern(first_metric);
        let matches = matcher.regex_match(&pattern)?;
        if self.metrics.len() == 1 {
            return Ok(matches.into_iter().map(|(_, id)| id).collect());
        }

        let mut ids = Vec::with_capacity(matches.len() * self.metrics.len());
        for (name, id) in matches {
            let name = String::from_utf8_lossy(&name).into_owned();
            ids.push(id);
            let tags = &name[first_metric.len()..];
            for metric in &self.metrics[1..] {
                let alt_name = format!("{metric}{tags}");
                // A zero here means the metric has no series with this tag
                // combination; join rows keep the hole.
                ids.push(matcher.match_name(&alt_name));
            }
        }
        Ok(ids)
    }

    fn build_pattern(&self, metric: &str) -> String {
        let mut pattern = format!("^{}", regex::escape(metric));
        if self.tags.is_empty() {
            pattern.push_str(r"(?:\s[\w\.\-]+=[\w\.\-]+)*$");
            return pattern;
        }
        for (key, values) in &self.tags {
            pattern.push_str("(?:");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    pattern.push('|');
                }
                pattern.push_str(r"(?:\s[\w\.\-]+=[\w\.\-]+)*\s");
                pattern.push_str(&regex::escape(key));
                pattern.push('=');
                pattern.push_str(&regex::escape(value));
                pattern.push_str(r"(?:\s[\w\.\-]+=[\w\.\-]+)*");
            }
            pattern.push(')');
        }
        pattern.push('$');
        pattern
    }
}

/// Resolves the `where` clause (or its absence) to a list of series ids.
fn parse_where_clause(
    doc: &QueryDoc,
    metrics: &[String],
    matcher: &SeriesMatcher,
) -> Result<Vec<ParamId>> {
    let selector = match doc.get("where") {
        Some(where_stmt) => {
            if metrics.is_empty() {
                return Err(Error::QueryParsing(
                    "`where` statement requires a metric".into(),
                ));
            }
            let map = match where_stmt {
                Json::Object(map) => map,
                _ => {
                    return Err(Error::QueryParsing(
                        "`where` must map tags to values".into(),
                    ))
                }
            };
            let mut selector = SeriesSelector::for_metrics(metrics.to_vec());
            for (tag, values) in map {
                let values: Vec<String> = match values {
                    Json::Array(items) => items
                        .iter()
                        .map(|item| {
                            json_scalar_to_string(item).ok_or_else(|| {
                                Error::QueryParsing(format!(
                                    "invalid value for tag `{tag}` in `where` statement"
                                ))
                            })
                        })
                        .collect::<Result<_>>()?,
                    scalar => vec![json_scalar_to_string(scalar).ok_or_else(|| {
                        Error::QueryParsing(format!(
                            "invalid value for tag `{tag}` in `where` statement"
                        ))
                    })?],
                };
                if values.is_empty() {
                    return Err(Error::QueryParsing(format!(
                        "empty value list for tag `{tag}` in `where` statement"
                    )));
                }
                selector
                    .add_tags(tag.clone(), values)
                    .map_err(|e| Error::QueryParsing(e.to_string()))?;
            }
            selector
        }
        None if !metrics.is_empty() => SeriesSelector::for_metrics(metrics.to_vec()),
        None => SeriesSelector::all(),
    };
    selector.extract_ids(matcher)
}

/// Projects series onto a subset of their tags. Series of the metric that
/// carry every projection tag are mapped to a synthetic representative
/// series named by those tags alone; the rest stay unmapped and are
/// dropped by the plan builder.
#[derive(Debug)]
pub struct GroupByTag {
    mapping: HashMap<ParamId, ParamId>,
    local_matcher: Arc<SeriesMatcher>,
}

impl GroupByTag {
    pub fn new(matcher: &SeriesMatcher, metric: &str, tags: &[String]) -> Result<Self> {
        let pattern = format!(
            r"^{}(?:\s[\w\.\-]+=[\w\.\-]+)*$",
            regex::escape(metric)
        );
        let series = matcher.regex_match(&pattern)?;
        let local_matcher = SeriesMatcher::new(1);
        let mut mapping = HashMap::new();
        for (name, id) in series {
            let name = String::from_utf8_lossy(&name).into_owned();
            let series_tags: HashMap<&str, &str> = name[metric.len()..]
                .split_ascii_whitespace()
                .filter_map(|pair| pair.split_once('='))
                .collect();
            let mut projected = String::from(metric);
            let mut complete = true;
            for tag in tags {
                match series_tags.get(tag.as_str()) {
                    Some(value) => {
                        projected.push(' ');
                        projected.push_str(tag);
                        projected.push('=');
                        projected.push_str(value);
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                let representative = local_matcher.add(&projected)?;
                mapping.insert(id, representative);
            }
        }
        Ok(GroupByTag {
            mapping,
            local_matcher: Arc::new(local_matcher),
        })
    }

    pub fn mapping(&self) -> &HashMap<ParamId, ParamId> {
        &self.mapping
    }

    pub fn matcher(&self) -> Arc<SeriesMatcher> {
        self.local_matcher.clone()
    }
}

fn apply_group_by_tag(req: &mut ReshapeRequest, group_by_tag: Option<GroupByTag>) {
    if let Some(group_by) = group_by_tag {
        req.group_by.enabled = true;
        req.group_by.transient_map = group_by.mapping().clone();
        req.group_by.matcher = Some(group_by.matcher());
        req.select.matcher = Some(group_by.matcher());
    }
}

/// Parses a meta query (`"select": "meta:names[:metric]"`) down to the
/// matching id list.
pub fn parse_select_meta_query(doc: &QueryDoc, matcher: &SeriesMatcher) -> Result<Vec<ParamId>> {
    validate_query(doc)?;
    let name = parse_select_stmt(doc)?;
    let suffix = name
        .strip_prefix(META_QUERY_PREFIX)
        .ok_or_else(|| Error::QueryParsing(format!("`{name}` is not a meta query")))?;
    let metrics: Vec<String> = if suffix.is_empty() {
        Vec::new()
    } else {
        match suffix.strip_prefix(':') {
            Some(metric) if !metric.is_empty() => vec![metric.to_string()],
            _ => {
                return Err(Error::QueryParsing(format!(
                    "invalid meta query `{name}`"
                )))
            }
        }
    };
    parse_where_clause(doc, &metrics, matcher)
}

/// Parses a SELECT query into a resolved request.
pub fn parse_select_query(doc: &QueryDoc, matcher: &SeriesMatcher) -> Result<ReshapeRequest> {
    validate_query(doc)?;

    let metric = parse_select_stmt(doc)?;
    let group_by = parse_groupby(doc)?;
    let group_by_tag = if group_by.tags.is_empty() {
        None
    } else {
        Some(GroupByTag::new(matcher, &metric, &group_by.tags)?)
    };
    let order_by = parse_orderby(doc)?;
    let ids = parse_where_clause(doc, std::slice::from_ref(&metric), matcher)?;
    let (begin, end) = parse_range_timestamps(doc)?;

    let mut req = ReshapeRequest {
        select: SelectClause {
            begin,
            end,
            columns: vec![Column { ids }],
            matcher: None,
        },
        agg: AggregateClause::default(),
        order_by,
        group_by: GroupByClause::default(),
        group_by_time: group_by.time_step,
    };
    apply_group_by_tag(&mut req, group_by_tag);
    Ok(req)
}

/// Parses an AGGREGATE query. Aggregates are always series-ordered; an
/// explicit `order-by` is rejected.
pub fn parse_aggregate_query(doc: &QueryDoc, matcher: &SeriesMatcher) -> Result<ReshapeRequest> {
    validate_query(doc)?;

    let (metric, func) = parse_aggregate_stmt(doc)?;
    let group_by = parse_groupby(doc)?;
    let group_by_tag = if group_by.tags.is_empty() {
        None
    } else {
        Some(GroupByTag::new(matcher, &metric, &group_by.tags)?)
    };
    if doc.get("order-by").is_some() {
        return Err(Error::QueryParsing(
            "unexpected `order-by` statement in `aggregate` query".into(),
        ));
    }
    let ids = parse_where_clause(doc, std::slice::from_ref(&metric), matcher)?;
    let (begin, end) = parse_range_timestamps(doc)?;

    let mut req = ReshapeRequest {
        select: SelectClause {
            begin,
            end,
            columns: vec![Column { ids }],
            matcher: None,
        },
        agg: AggregateClause {
            enabled: true,
            step: 0,
            funcs: vec![func],
        },
        order_by: OrderBy::Series,
        group_by: GroupByClause::default(),
        group_by_time: group_by.time_step,
    };
    apply_group_by_tag(&mut req, group_by_tag);
    Ok(req)
}

/// Builds the display-name matcher of a group-aggregate query: every id is
/// renamed to `metric:f1|metric:f2 <original tags>`.
fn init_matcher_in_group_aggregate(
    req: &mut ReshapeRequest,
    global_matcher: &SeriesMatcher,
    metric: &str,
    funcs: &[AggregationFunction],
) -> Result<()> {
    let ids = &req.select.columns[0].ids;
    let matcher = SeriesMatcher::new(1);
    for &id in ids {
        let name = match global_matcher.id2str(id) {
            Some(name) => name,
            None => panic!("series catalog is corrupted: no name for id {id}"),
        };
        let name = String::from_utf8_lossy(&name).into_owned();
        if !name.starts_with(metric) {
            return Err(Error::BadData(format!(
                "series `{name}` does not belong to metric `{metric}`"
            )));
        }
        let tags = &name[metric.len()..];
        let heading = funcs
            .iter()
            .map(|func| format!("{metric}:{}", func.name()))
            .collect::<Vec<_>>()
            .join("|");
        matcher.restore(&format!("{heading}{tags}"), id);
    }
    req.select.matcher = Some(Arc::new(matcher));
    Ok(())
}

/// Parses a GROUP_AGGREGATE query.
pub fn parse_group_aggregate_query(
    doc: &QueryDoc,
    matcher: &SeriesMatcher,
) -> Result<ReshapeRequest> {
    validate_query(doc)?;

    let stmt = parse_group_aggregate_stmt(doc)?;
    let group_by = parse_groupby(doc)?;
    if !group_by.tags.is_empty() {
        return Err(Error::QueryParsing(
            "`group-by` tags are not supported in `group-aggregate` queries".into(),
        ));
    }
    let order_by = parse_orderby(doc)?;
    let ids = parse_where_clause(doc, std::slice::from_ref(&stmt.metric), matcher)?;
    let (begin, end) = parse_range_timestamps(doc)?;

    let mut req = ReshapeRequest {
        select: SelectClause {
            begin,
            end,
            columns: vec![Column { ids }],
            matcher: None,
        },
        agg: AggregateClause {
            enabled: true,
            step: stmt.step,
            funcs: stmt.funcs.clone(),
        },
        order_by,
        group_by: GroupByClause::default(),
        group_by_time: group_by.time_step,
    };
    init_matcher_in_group_aggregate(&mut req, matcher, &stmt.metric, &stmt.funcs)?;
    Ok(req)
}

/// Builds the display-name matcher of a join query: every row is renamed
/// to `metric1|metric2|... <original tags>` under its first-column id.
fn init_matcher_in_join_query(
    req: &mut ReshapeRequest,
    global_matcher: &SeriesMatcher,
    metrics: &[String],
) -> Result<()> {
    if req.select.columns.len() < 2 || req.select.columns.len() != metrics.len() {
        return Err(Error::BadArg(
            "join request must carry one column per metric".into(),
        ));
    }
    let first_metric = &metrics[0];
    let heading = metrics.join("|");
    let matcher = SeriesMatcher::new(1);
    for &id in &req.select.columns[0].ids {
        let name = match global_matcher.id2str(id) {
            Some(name) => name,
            None => panic!("series catalog is corrupted: no name for id {id}"),
        };
        let name = String::from_utf8_lossy(&name).into_owned();
        if !name.starts_with(first_metric.as_str()) {
            return Err(Error::BadData(format!(
                "series `{name}` does not belong to metric `{first_metric}`"
            )));
        }
        let tags = &name[first_metric.len()..];
        matcher.restore(&format!("{heading}{tags}"), id);
    }
    req.select.matcher = Some(Arc::new(matcher));
    Ok(())
}

/// Parses a JOIN query. The resolved id list interleaves metrics per
/// series; it is split into one column per metric here.
pub fn parse_join_query(doc: &QueryDoc, matcher: &SeriesMatcher) -> Result<ReshapeRequest> {
    validate_query(doc)?;

    let metrics = parse_join_stmt(doc)?;
    if metrics.len() < 2 {
        return Err(Error::QueryParsing(
            "`join` requires at least two metrics".into(),
        ));
    }
    let order_by = parse_orderby(doc)?;
    let group_by = parse_groupby(doc)?;
    if !group_by.tags.is_empty() {
        return Err(Error::QueryParsing(
            "`group-by` tags are not supported in `join` queries".into(),
        ));
    }
    let ids = parse_where_clause(doc, &metrics, matcher)?;
    let (begin, end) = parse_range_timestamps(doc)?;

    let cardinality = metrics.len();
    assert!(
        ids.len() % cardinality == 0,
        "where-clause resolution must yield whole join rows"
    );
    let rows = ids.len() / cardinality;
    let mut columns = vec![Column::default(); cardinality];
    for row in 0..rows {
        for (column_ix, column) in columns.iter_mut().enumerate() {
            column.ids.push(ids[row * cardinality + column_ix]);
        }
    }

    let mut req = ReshapeRequest {
        select: SelectClause {
            begin,
            end,
            columns,
            matcher: None,
        },
        agg: AggregateClause::default(),
        order_by,
        group_by: GroupByClause::default(),
        group_by_time: group_by.time_step,
    };
    init_matcher_in_join_query(&mut req, matcher, &metrics)?;
    Ok(req)
}

/// Builds the per-query transform chain from `limit`/`offset`, terminated
/// at the caller's cursor. Stages come back tail-first for topology
/// validation.
pub fn parse_processing_topology(
    doc: &QueryDoc,
    cursor: Box<dyn Cursor>,
) -> Result<(Box<dyn Node>, Vec<NodeStage>)> {
    let (limit, offset) = parse_limit_offset(doc)?;
    let mut builder = PipelineBuilder::terminal(cursor);
    if limit != 0 || offset != 0 {
        let effective_limit = if limit == 0 { u64::MAX } else { limit };
        builder = builder.wrap(|next| Limiter::new(effective_limit, offset, next));
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::NodeKind;
    use crate::types::Sample;

    fn doc(text: &str) -> QueryDoc {
        QueryDoc::parse(text).unwrap()
    }

    fn test_matcher() -> SeriesMatcher {
        let matcher = SeriesMatcher::new(1);
        matcher.add("cpu host=a").unwrap();
        matcher.add("cpu host=b").unwrap();
        matcher.add("mem host=a").unwrap();
        matcher
    }

    struct NullCursor;

    impl Cursor for NullCursor {
        fn put(&mut self, _sample: Sample) -> bool {
            true
        }
        fn complete(&mut self) {}
        fn set_error(&mut self, _status: Error) {}
    }

    #[test]
    fn kind_dispatch() {
        let m = |text| parse_query_kind(&doc(text)).unwrap();
        assert_eq!(m(r#"{"select": "cpu"}"#), QueryKind::Select);
        assert_eq!(m(r#"{"select": "meta:names"}"#), QueryKind::SelectMeta);
        assert_eq!(m(r#"{"aggregate": {"cpu": "max"}}"#), QueryKind::Aggregate);
        assert_eq!(m(r#"{"join": ["cpu", "mem"]}"#), QueryKind::Join);
        assert_eq!(
            m(r#"{"group-aggregate": {}}"#),
            QueryKind::GroupAggregate
        );
    }

    #[test]
    fn unknown_statement_is_rejected() {
        let q = doc(r#"{"select": "cpu", "explain": true}"#);
        assert!(matches!(
            validate_query(&q),
            Err(Error::QueryParsing(_))
        ));
    }

    #[test]
    fn duplicate_statement_is_rejected() {
        let q = doc(r#"{"select": "cpu", "select": "mem"}"#);
        assert!(matches!(
            validate_query(&q),
            Err(Error::QueryParsing(_))
        ));
    }

    #[test]
    fn mutually_exclusive_kinds_are_rejected() {
        let q = doc(r#"{"select": "cpu", "aggregate": {"cpu": "max"}}"#);
        assert!(matches!(
            validate_query(&q),
            Err(Error::QueryParsing(_))
        ));
    }

    #[test]
    fn select_query_resolves_ids_and_range() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"select": "cpu",
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        let req = parse_select_query(&q, &matcher).unwrap();
        assert_eq!(req.select.columns.len(), 1);
        assert_eq!(req.select.columns[0].ids, vec![1, 2]);
        assert_eq!(req.order_by, OrderBy::Time);
        assert!(req.select.begin < req.select.end);
        assert!(!req.agg.enabled);
        assert!(!req.group_by.enabled);
    }

    #[test]
    fn select_query_requires_a_range() {
        let matcher = test_matcher();
        let q = doc(r#"{"select": "cpu"}"#);
        assert!(matches!(
            parse_select_query(&q, &matcher),
            Err(Error::QueryParsing(_))
        ));
    }

    #[test]
    fn backward_range_is_allowed() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"select": "cpu",
                "range": {"from": "20150102T000000", "to": "20150101T000000"}}"#,
        );
        let req = parse_select_query(&q, &matcher).unwrap();
        assert!(req.select.begin > req.select.end);
    }

    #[test]
    fn where_clause_narrows_the_id_set() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"select": "cpu",
                "where": {"host": "b"},
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        let req = parse_select_query(&q, &matcher).unwrap();
        assert_eq!(req.select.columns[0].ids, vec![2]);
    }

    #[test]
    fn where_values_are_or_combined() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"select": "cpu",
                "where": {"host": ["a", "b"]},
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        let req = parse_select_query(&q, &matcher).unwrap();
        assert_eq!(req.select.columns[0].ids, vec![1, 2]);
    }

    #[test]
    fn aggregate_query_is_series_ordered() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"aggregate": {"cpu": "max"},
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        let req = parse_aggregate_query(&q, &matcher).unwrap();
        assert!(req.agg.enabled);
        assert_eq!(req.agg.step, 0);
        assert_eq!(req.agg.funcs, vec![AggregationFunction::Max]);
        assert_eq!(req.order_by, OrderBy::Series);
    }

    #[test]
    fn aggregate_query_rejects_order_by() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"aggregate": {"cpu": "max"}, "order-by": "time",
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        assert!(matches!(
            parse_aggregate_query(&q, &matcher),
            Err(Error::QueryParsing(_))
        ));
    }

    #[test]
    fn aggregate_query_rejects_unknown_function() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"aggregate": {"cpu": "p99"},
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        assert!(matches!(
            parse_aggregate_query(&q, &matcher),
            Err(Error::QueryParsing(_))
        ));
    }

    #[test]
    fn group_aggregate_query_parses_step_and_functions() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"group-aggregate": {"step": "1s", "metric": "cpu", "func": ["min", "max"]},
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        let req = parse_group_aggregate_query(&q, &matcher).unwrap();
        assert!(req.agg.enabled);
        assert_eq!(req.agg.step, 100_000_000);
        assert_eq!(
            req.agg.funcs,
            vec![AggregationFunction::Min, AggregationFunction::Max]
        );

        // Display names carry the pipe-joined function list.
        let display = req.select.matcher.unwrap();
        let name = display.id2str(1).unwrap();
        assert_eq!(&name[..], b"cpu:min|cpu:max host=a");
    }

    #[test]
    fn group_aggregate_rejects_zero_step() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"group-aggregate": {"step": "5ns", "metric": "cpu", "func": "max"},
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        assert!(matches!(
            parse_group_aggregate_query(&q, &matcher),
            Err(Error::QueryParsing(_))
        ));
    }

    #[test]
    fn group_aggregate_requires_all_fields() {
        let matcher = test_matcher();
        for body in [
            r#"{"metric": "cpu", "func": "max"}"#,
            r#"{"step": "1s", "func": "max"}"#,
            r#"{"step": "1s", "metric": "cpu"}"#,
        ] {
            let q = doc(&format!(
                r#"{{"group-aggregate": {body},
                    "range": {{"from": "20150101T000000", "to": "20150102T000000"}}}}"#
            ));
            assert!(
                parse_group_aggregate_query(&q, &matcher).is_err(),
                "incomplete statement {body} must be rejected"
            );
        }
    }

    #[test]
    fn join_query_builds_columns_with_missing_holes() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"join": ["cpu", "mem"],
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        let req = parse_join_query(&q, &matcher).unwrap();
        assert_eq!(req.select.columns.len(), 2);
        // cpu host=a, cpu host=b
        assert_eq!(req.select.columns[0].ids, vec![1, 2]);
        // mem host=a exists, mem host=b does not
        assert_eq!(req.select.columns[1].ids, vec![3, 0]);

        let display = req.select.matcher.unwrap();
        assert_eq!(&display.id2str(1).unwrap()[..], b"cpu|mem host=a");
    }

    #[test]
    fn join_requires_two_metrics() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"join": ["cpu"],
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        assert!(matches!(
            parse_join_query(&q, &matcher),
            Err(Error::QueryParsing(_))
        ));
    }

    #[test]
    fn meta_query_lists_all_series() {
        let matcher = test_matcher();
        let q = doc(r#"{"select": "meta:names"}"#);
        let ids = parse_select_meta_query(&q, &matcher).unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn meta_query_with_metric_filters() {
        let matcher = test_matcher();
        let q = doc(r#"{"select": "meta:names:cpu"}"#);
        let ids = parse_select_meta_query(&q, &matcher).unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn meta_query_with_bad_suffix_is_rejected() {
        let matcher = test_matcher();
        let q = doc(r#"{"select": "meta:namesx"}"#);
        assert!(parse_select_meta_query(&q, &matcher).is_err());
    }

    #[test]
    fn group_by_tag_projects_series() {
        let matcher = SeriesMatcher::new(1);
        matcher.add("cpu host=a region=eu").unwrap();
        matcher.add("cpu host=b region=eu").unwrap();
        matcher.add("cpu host=c region=us").unwrap();
        matcher.add("cpu host=d").unwrap();

        let group_by =
            GroupByTag::new(&matcher, "cpu", &["region".to_string()]).unwrap();
        let mapping = group_by.mapping();
        // host=d has no region tag and stays unmapped.
        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping[&1], mapping[&2]);
        assert_ne!(mapping[&1], mapping[&3]);

        let local = group_by.matcher();
        let eu = local.id2str(mapping[&1]).unwrap();
        assert_eq!(&eu[..], b"cpu region=eu");
    }

    #[test]
    fn select_with_group_by_tag_fills_the_transient_map() {
        let matcher = SeriesMatcher::new(1);
        matcher.add("cpu host=a region=eu").unwrap();
        matcher.add("cpu host=b region=us").unwrap();
        let q = doc(
            r#"{"select": "cpu", "group-by": ["region"],
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        let req = parse_select_query(&q, &matcher).unwrap();
        assert!(req.group_by.enabled);
        assert_eq!(req.group_by.transient_map.len(), 2);
        assert!(req.group_by.matcher.is_some());
    }

    #[test]
    fn group_by_time_sets_the_pipeline_step() {
        let matcher = test_matcher();
        let q = doc(
            r#"{"select": "cpu", "group-by": {"time": "1s"},
                "range": {"from": "20150101T000000", "to": "20150102T000000"}}"#,
        );
        let req = parse_select_query(&q, &matcher).unwrap();
        assert_eq!(req.group_by_time, 100_000_000);
        assert!(!req.group_by.enabled);
    }

    #[test]
    fn limit_and_offset_build_a_limiter() {
        let q = doc(r#"{"select": "cpu", "limit": 10, "offset": 5}"#);
        let (_, stages) = parse_processing_topology(&q, Box::new(NullCursor)).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[1].kind, NodeKind::Limiter);
    }

    #[test]
    fn bare_query_has_only_a_terminal() {
        let q = doc(r#"{"select": "cpu"}"#);
        let (_, stages) = parse_processing_topology(&q, Box::new(NullCursor)).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].kind, NodeKind::Terminal);
    }

    #[test]
    fn negative_limit_is_rejected() {
        let q = doc(r#"{"select": "cpu", "limit": -1}"#);
        assert!(matches!(
            parse_limit_offset(&q),
            Err(Error::QueryParsing(_))
        ));
    }

    #[test]
    fn selector_duplicate_tag_is_rejected() {
        let mut selector = SeriesSelector::for_metrics(vec!["cpu".into()]);
        selector.add_tag("host".into(), "a".into()).unwrap();
        assert!(selector.add_tag("host".into(), "b".into()).is_err());
    }

    #[test]
    fn selector_without_metric_returns_all_ids() {
        let matcher = test_matcher();
        let ids = SeriesSelector::all().extract_ids(&matcher).unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn multi_metric_selector_interleaves_rows() {
        let matcher = test_matcher();
        let selector = SeriesSelector::for_metrics(vec!["cpu".into(), "mem".into()]);
        let ids = selector.extract_ids(&matcher).unwrap();
        // (cpu host=a, mem host=a), (cpu host=b, <missing>)
        assert_eq!(ids, vec![1, 3, 2, 0]);
    }
}
