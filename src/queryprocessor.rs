//! Query drivers: own the head of the pipeline, validate its topology
//! before any sample flows, and route samples from plan execution through
//! the group-by statement into the node chain.

use crate::error::{Error, Result};
use crate::executor::execute_plan;
use crate::operators::SeriesStore;
use crate::pipeline::{Cursor, GroupByTime, Node, NodeStage, GROUP_BY_REQUIRED, TERMINAL};
use crate::queryparser::{
    parse_aggregate_query, parse_group_aggregate_query, parse_join_query, parse_processing_topology,
    parse_query_kind, parse_select_meta_query, parse_select_query, QueryDoc, QueryKind,
};
use crate::queryplan::QueryPlan;
use crate::seriesparser::SeriesMatcher;
use crate::telemetry;
use crate::types::{ParamId, Sample, Timestamp};

/// Temporal direction of a query, derived from its range bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Driver interface: plan execution pushes samples in, the driver routes
/// them through the pipeline to the caller's cursor.
pub trait QueryProcessor {
    /// Smaller range bound.
    fn lowerbound(&self) -> Timestamp;
    /// Larger range bound.
    fn upperbound(&self) -> Timestamp;
    fn direction(&self) -> Direction;
    /// Called before the first sample. False cancels the query.
    fn start(&mut self) -> bool;
    /// Processes one sample. False means "halt the stream".
    fn put(&mut self, sample: Sample) -> bool;
    /// Completes the pipeline after the last sample.
    fn stop(&mut self);
    /// Forwards a failure to every node; the stream is abandoned.
    fn set_error(&mut self, status: Error);
}

/// Checks the pipeline assembly rules on the tail-first stage list:
/// every terminal node must sit at the tail, and a chain that requires
/// group-by markers needs a time step to produce them.
fn validate_topology(stages: &[NodeStage], has_group_by: bool) -> Result<()> {
    if stages.is_empty() {
        return Err(Error::BadArg("pipeline must contain at least one node".into()));
    }
    let mut transforms_below = 0;
    for stage in stages {
        if stage.requirements & TERMINAL != 0 {
            if transforms_below != 0 {
                return Err(Error::BadArg(
                    "terminal node must sit at the tail of the pipeline".into(),
                ));
            }
        } else {
            transforms_below += 1;
        }
    }
    if !has_group_by
        && stages
            .iter()
            .any(|stage| stage.requirements & GROUP_BY_REQUIRED != 0)
    {
        return Err(Error::QueryParsing(
            "query requires a group-by time step".into(),
        ));
    }
    Ok(())
}

/// Driver for data queries (select, aggregates, join). Samples pass
/// through the group-by statement, which injects bucket boundary markers,
/// then down the node chain.
pub struct ScanQueryProcessor {
    lowerbound: Timestamp,
    upperbound: Timestamp,
    direction: Direction,
    group_by: GroupByTime,
    root: Box<dyn Node>,
}

impl ScanQueryProcessor {
    pub fn new(
        root: Box<dyn Node>,
        stages: &[NodeStage],
        begin: Timestamp,
        end: Timestamp,
        group_by: GroupByTime,
    ) -> Result<Self> {
        validate_topology(stages, !group_by.is_empty())?;
        Ok(ScanQueryProcessor {
            lowerbound: begin.min(end),
            upperbound: begin.max(end),
            direction: if begin > end {
                Direction::Backward
            } else {
                Direction::Forward
            },
            group_by,
            root,
        })
    }
}

impl QueryProcessor for ScanQueryProcessor {
    fn lowerbound(&self) -> Timestamp {
        self.lowerbound
    }

    fn upperbound(&self) -> Timestamp {
        self.upperbound
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn start(&mut self) -> bool {
        true
    }

    fn put(&mut self, sample: Sample) -> bool {
        self.group_by.put(sample, self.root.as_mut())
    }

    fn stop(&mut self) {
        self.root.complete();
    }

    fn set_error(&mut self, status: Error) {
        self.root.set_error(status);
    }
}

/// Driver for `meta:names` queries: `start` emits one id-only sample per
/// filtered id and completes; no storage is involved.
pub struct MetadataQueryProcessor {
    ids: Vec<ParamId>,
    root: Box<dyn Node>,
    completed: bool,
}

impl MetadataQueryProcessor {
    pub fn new(ids: Vec<ParamId>, root: Box<dyn Node>, stages: &[NodeStage]) -> Result<Self> {
        validate_topology(stages, false)?;
        Ok(MetadataQueryProcessor {
            ids,
            root,
            completed: false,
        })
    }
}

impl QueryProcessor for MetadataQueryProcessor {
    fn lowerbound(&self) -> Timestamp {
        Timestamp::MAX
    }

    fn upperbound(&self) -> Timestamp {
        Timestamp::MAX
    }

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn start(&mut self) -> bool {
        for ix in 0..self.ids.len() {
            let id = self.ids[ix];
            if !self.root.put(Sample::id_only(id)) {
                break;
            }
        }
        self.stop();
        true
    }

    fn put(&mut self, _sample: Sample) -> bool {
        false
    }

    fn stop(&mut self) {
        if !self.completed {
            self.completed = true;
            self.root.complete();
        }
    }

    fn set_error(&mut self, status: Error) {
        self.root.set_error(status);
    }
}

/// Parses, plans, and runs one query end to end: resolves it against the
/// catalog, builds the two-tier plan and the transform pipeline, then
/// streams storage samples into the caller's cursor.
pub fn execute_query(
    query: &str,
    matcher: &SeriesMatcher,
    store: &dyn SeriesStore,
    cursor: Box<dyn Cursor>,
) -> Result<()> {
    let outcome = run_query(query, matcher, store, cursor);
    match &outcome {
        Ok(()) => telemetry::record_query_ok(),
        Err(Error::QueryParsing(_)) => telemetry::record_query_parse_error(),
        Err(_) => telemetry::record_query_failed(),
    }
    outcome
}

fn run_query(
    query: &str,
    matcher: &SeriesMatcher,
    store: &dyn SeriesStore,
    cursor: Box<dyn Cursor>,
) -> Result<()> {
    let doc = QueryDoc::parse(query)?;
    let kind = parse_query_kind(&doc)?;

    if kind == QueryKind::SelectMeta {
        let ids = parse_select_meta_query(&doc, matcher)?;
        let (root, stages) = parse_processing_topology(&doc, cursor)?;
        let mut proc = MetadataQueryProcessor::new(ids, root, &stages)?;
        proc.start();
        return Ok(());
    }

    let req = match kind {
        QueryKind::Select => parse_select_query(&doc, matcher)?,
        QueryKind::Aggregate => parse_aggregate_query(&doc, matcher)?,
        QueryKind::GroupAggregate => parse_group_aggregate_query(&doc, matcher)?,
        QueryKind::Join => parse_join_query(&doc, matcher)?,
        QueryKind::SelectMeta => unreachable!("meta queries are handled above"),
    };
    let plan = QueryPlan::new(&req);
    let (root, stages) = parse_processing_topology(&doc, cursor)?;
    let mut proc = ScanQueryProcessor::new(
        root,
        &stages,
        req.select.begin,
        req.select.end,
        GroupByTime::new(req.group_by_time),
    )?;
    execute_plan(&plan, store, &mut proc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{NodeKind, PipelineBuilder, TerminalNode};
    use crate::types::Payload;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct SinkState {
        samples: Vec<Sample>,
        completed: u32,
        error: Option<Error>,
    }

    #[derive(Clone)]
    struct Sink(Rc<RefCell<SinkState>>);

    impl Sink {
        fn new() -> (Self, Rc<RefCell<SinkState>>) {
            let state = Rc::new(RefCell::new(SinkState::default()));
            (Sink(state.clone()), state)
        }
    }

    impl Cursor for Sink {
        fn put(&mut self, sample: Sample) -> bool {
            self.0.borrow_mut().samples.push(sample);
            true
        }

        fn complete(&mut self) {
            self.0.borrow_mut().completed += 1;
        }

        fn set_error(&mut self, status: Error) {
            self.0.borrow_mut().error = Some(status);
        }
    }

    fn terminal_only(cursor: Box<dyn Cursor>) -> (Box<dyn Node>, Vec<NodeStage>) {
        PipelineBuilder::terminal(cursor).build()
    }

    #[test]
    fn direction_derives_from_range_bounds() {
        let (sink, _) = Sink::new();
        let (root, stages) = terminal_only(Box::new(sink));
        let proc =
            ScanQueryProcessor::new(root, &stages, 100, 50, GroupByTime::new(0)).unwrap();
        assert_eq!(proc.direction(), Direction::Backward);
        assert_eq!(proc.lowerbound(), 50);
        assert_eq!(proc.upperbound(), 100);
    }

    #[test]
    fn group_by_required_without_step_is_rejected() {
        let (sink, _) = Sink::new();
        let (root, stages) = PipelineBuilder::terminal(Box::new(sink))
            .wrap(crate::pipeline::MeanPaa::new)
            .build();
        let result = ScanQueryProcessor::new(root, &stages, 0, 10, GroupByTime::new(0));
        assert!(matches!(result, Err(Error::QueryParsing(_))));
    }

    #[test]
    fn group_by_required_with_step_is_accepted() {
        let (sink, _) = Sink::new();
        let (root, stages) = PipelineBuilder::terminal(Box::new(sink))
            .wrap(crate::pipeline::MeanPaa::new)
            .build();
        assert!(ScanQueryProcessor::new(root, &stages, 0, 10, GroupByTime::new(5)).is_ok());
    }

    #[test]
    fn terminal_above_a_transform_is_rejected() {
        let (sink, _) = Sink::new();
        let (inner_sink, _) = Sink::new();
        // terminal <- limiter <- terminal: the outer terminal is not at
        // the tail.
        let (root, stages) = PipelineBuilder::terminal(Box::new(sink))
            .wrap(|next| crate::pipeline::Limiter::new(10, 0, next))
            .wrap(|next| {
                drop(next);
                TerminalNode::new(Box::new(inner_sink))
            })
            .build();
        assert_eq!(stages[2].kind, NodeKind::Terminal);
        let result = ScanQueryProcessor::new(root, &stages, 0, 10, GroupByTime::new(0));
        assert!(matches!(result, Err(Error::BadArg(_))));
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        let (sink, _) = Sink::new();
        let (root, _) = terminal_only(Box::new(sink));
        let result = ScanQueryProcessor::new(root, &[], 0, 10, GroupByTime::new(0));
        assert!(matches!(result, Err(Error::BadArg(_))));
    }

    #[test]
    fn scan_processor_injects_markers_and_completes() {
        let (sink, state) = Sink::new();
        let (root, stages) = terminal_only(Box::new(sink));
        let mut proc =
            ScanQueryProcessor::new(root, &stages, 0, 100, GroupByTime::new(10)).unwrap();
        assert!(proc.start());
        assert!(proc.put(Sample::float(5, 1, 1.0)));
        assert!(proc.put(Sample::float(25, 1, 2.0)));
        proc.stop();

        let state = state.borrow();
        let markers = state
            .samples
            .iter()
            .filter(|s| s.payload == Payload::Empty)
            .count();
        assert_eq!(markers, 2);
        assert_eq!(state.completed, 1);
    }

    #[test]
    fn set_error_reaches_the_cursor() {
        let (sink, state) = Sink::new();
        let (root, stages) = terminal_only(Box::new(sink));
        let mut proc =
            ScanQueryProcessor::new(root, &stages, 0, 100, GroupByTime::new(0)).unwrap();
        proc.set_error(Error::NoData);
        assert_eq!(state.borrow().error, Some(Error::NoData));
        // Samples after the failure are discarded.
        assert!(!proc.put(Sample::float(1, 1, 1.0)));
    }

    #[test]
    fn metadata_processor_emits_ids_then_completes() {
        let (sink, state) = Sink::new();
        let (root, stages) = terminal_only(Box::new(sink));
        let mut proc = MetadataQueryProcessor::new(vec![3, 1, 7], root, &stages).unwrap();
        assert!(proc.start());
        proc.stop();

        let state = state.borrow();
        let ids: Vec<ParamId> = state.samples.iter().map(|s| s.paramid).collect();
        assert_eq!(ids, vec![3, 1, 7]);
        assert!(state
            .samples
            .iter()
            .all(|s| s.payload == Payload::ParamIdBit));
        assert_eq!(state.completed, 1, "stop after start must not re-complete");
        assert!(!proc.put(Sample::float(1, 1, 1.0)), "put is a no-op");
    }
}
