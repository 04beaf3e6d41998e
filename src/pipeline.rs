//! Streaming transform pipeline.
//!
//! Samples flow through a chain of nodes built tail-first: the terminal
//! sink wraps the caller's cursor, and every transform wraps its
//! downstream. `put` returning false is backpressure; it unwinds to the
//! driver, which completes the remaining nodes. `Empty` markers divide the
//! stream into flush intervals; buffering nodes drain on every marker.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use crate::error::Error;
use crate::types::{ParamId, Payload, Sample, Timestamp, TsDuration};

/// Requirement bit: the node is a sink and must sit at the pipeline tail.
pub const TERMINAL: u32 = 1 << 0;
/// Requirement bit: the node buffers per flush interval and the query must
/// carry a group-by time step to produce the markers it drains on.
pub const GROUP_BY_REQUIRED: u32 = 1 << 1;

/// Discriminates node implementations without downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Terminal,
    Limiter,
    RandomSampler,
    MeanPaa,
    MedianPaa,
    MaxPaa,
}

/// A pipeline stage. Nodes own their downstream and preserve stream order,
/// except where documented (the sampler re-sorts within a flush interval,
/// PAA collapses one).
pub trait Node {
    /// Processes one sample. False means "halt the stream".
    fn put(&mut self, sample: Sample) -> bool;
    /// Final flush; propagates to the downstream node.
    fn complete(&mut self);
    /// Propagates a failure; subsequent samples are discarded.
    fn set_error(&mut self, status: Error);
    /// Capability bits ([`TERMINAL`], [`GROUP_BY_REQUIRED`]).
    fn requirements(&self) -> u32;
    fn kind(&self) -> NodeKind;
}

/// External sink supplied by the caller. Returning false from `put`
/// cancels the query cooperatively.
pub trait Cursor {
    fn put(&mut self, sample: Sample) -> bool;
    fn complete(&mut self);
    fn set_error(&mut self, status: Error);
}

/// Kind and requirement bits of one assembled node, recorded tail-first.
#[derive(Debug, Clone, Copy)]
pub struct NodeStage {
    pub kind: NodeKind,
    pub requirements: u32,
}

/// Assembles a node chain tail-first and records each node's capabilities
/// so the driver can validate the topology before any sample flows.
pub struct PipelineBuilder {
    head: Box<dyn Node>,
    stages: Vec<NodeStage>,
}

impl PipelineBuilder {
    /// Starts a chain at the terminal sink.
    pub fn terminal(cursor: Box<dyn Cursor>) -> Self {
        let node = TerminalNode::new(cursor);
        let stage = NodeStage {
            kind: node.kind(),
            requirements: node.requirements(),
        };
        PipelineBuilder {
            head: Box::new(node),
            stages: vec![stage],
        }
    }

    /// Wraps the current head in a new transform node.
    pub fn wrap<N, F>(mut self, build: F) -> Self
    where
        N: Node + 'static,
        F: FnOnce(Box<dyn Node>) -> N,
    {
        let node = build(self.head);
        self.stages.push(NodeStage {
            kind: node.kind(),
            requirements: node.requirements(),
        });
        self.head = Box::new(node);
        self
    }

    /// Finishes assembly. Stages are ordered tail to head.
    pub fn build(self) -> (Box<dyn Node>, Vec<NodeStage>) {
        (self.head, self.stages)
    }
}

/// Forwards non-`Margin` samples to the external cursor; `Margin` events
/// are internal and swallowed here.
pub struct TerminalNode {
    cursor: Box<dyn Cursor>,
    failed: bool,
}

impl TerminalNode {
    pub fn new(cursor: Box<dyn Cursor>) -> Self {
        TerminalNode {
            cursor,
            failed: false,
        }
    }
}

impl Node for TerminalNode {
    fn put(&mut self, sample: Sample) -> bool {
        if self.failed {
            return false;
        }
        if sample.payload == Payload::Margin {
            return true;
        }
        self.cursor.put(sample)
    }

    fn complete(&mut self) {
        self.cursor.complete();
    }

    fn set_error(&mut self, status: Error) {
        self.failed = true;
        self.cursor.set_error(status);
    }

    fn requirements(&self) -> u32 {
        TERMINAL
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Terminal
    }
}

/// Skips the first `offset` data samples, passes up to `limit` more, then
/// reports backpressure to stop the upstream. Markers pass through without
/// being counted so that downstream flush semantics survive limiting.
pub struct Limiter {
    limit: u64,
    offset: u64,
    counter: u64,
    next: Box<dyn Node>,
}

impl Limiter {
    pub fn new(limit: u64, offset: u64, next: Box<dyn Node>) -> Self {
        Limiter {
            limit,
            offset,
            counter: 0,
            next,
        }
    }
}

impl Node for Limiter {
    fn put(&mut self, sample: Sample) -> bool {
        if sample.is_marker() {
            return self.next.put(sample);
        }
        self.counter += 1;
        if self.counter <= self.offset {
            return true;
        }
        if self.counter > self.offset.saturating_add(self.limit) {
            return false;
        }
        self.next.put(sample)
    }

    fn complete(&mut self) {
        self.next.complete();
    }

    fn set_error(&mut self, status: Error) {
        self.next.set_error(status);
    }

    fn requirements(&self) -> u32 {
        0
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Limiter
    }
}

/// Reservoir sampler of fixed capacity (Algorithm R).
///
/// Up to `capacity` samples are buffered directly; after that the k-th
/// incoming sample replaces a uniformly drawn slot with probability
/// `capacity / k`. On every `Empty` marker and on `complete`
/// the reservoir is stable-sorted by `(timestamp, paramid)` and drained
/// downstream.
pub struct RandomSamplingNode<R: Rng = StdRng> {
    capacity: usize,
    seen: u64,
    reservoir: Vec<Sample>,
    rng: R,
    next: Box<dyn Node>,
}

impl RandomSamplingNode<StdRng> {
    pub fn new(capacity: usize, next: Box<dyn Node>) -> Self {
        RandomSamplingNode::with_rng(capacity, StdRng::from_entropy(), next)
    }
}

impl<R: Rng> RandomSamplingNode<R> {
    pub fn with_rng(capacity: usize, rng: R, next: Box<dyn Node>) -> Self {
        RandomSamplingNode {
            capacity,
            seen: 0,
            reservoir: Vec::with_capacity(capacity),
            rng,
            next,
        }
    }

    fn flush(&mut self) -> bool {
        self.reservoir.sort_by_key(Sample::sort_key);
        for sample in self.reservoir.drain(..) {
            if !self.next.put(sample) {
                return false;
            }
        }
        self.seen = 0;
        true
    }
}

impl<R: Rng> Node for RandomSamplingNode<R> {
    fn put(&mut self, sample: Sample) -> bool {
        match sample.payload {
            Payload::Empty => {
                if !self.flush() {
                    return false;
                }
                self.next.put(sample)
            }
            Payload::Margin => self.next.put(sample),
            _ => {
                if self.reservoir.len() < self.capacity {
                    self.reservoir.push(sample);
                } else {
                    // Algorithm R: the (k+1)-th sample replaces a uniformly
                    // drawn slot with probability capacity/(k+1).
                    let slot = self.rng.gen_range(0..=self.seen);
                    if slot < self.capacity as u64 {
                        self.reservoir[slot as usize] = sample;
                    }
                }
                self.seen += 1;
                true
            }
        }
    }

    fn complete(&mut self) {
        self.flush();
        self.next.complete();
    }

    fn set_error(&mut self, status: Error) {
        self.next.set_error(status);
    }

    fn requirements(&self) -> u32 {
        0
    }

    fn kind(&self) -> NodeKind {
        NodeKind::RandomSampler
    }
}

/// Accumulator state of a PAA node, one per series per flush interval.
pub trait PaaCounter: Default {
    const KIND: NodeKind;
    fn reset(&mut self);
    fn add(&mut self, value: f64);
    fn value(&self) -> f64;
    fn ready(&self) -> bool;
}

/// Running mean.
#[derive(Debug, Default, Clone)]
pub struct MeanCounter {
    sum: f64,
    count: u64,
}

impl PaaCounter for MeanCounter {
    const KIND: NodeKind = NodeKind::MeanPaa;

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn value(&self) -> f64 {
        self.sum / self.count as f64
    }

    fn ready(&self) -> bool {
        self.count != 0
    }
}

/// Median via partial selection. For two values the mean of both; for
/// larger even sizes the upper middle element.
#[derive(Debug, Default, Clone)]
pub struct MedianCounter {
    acc: Vec<f64>,
}

impl PaaCounter for MedianCounter {
    const KIND: NodeKind = NodeKind::MedianPaa;

    fn reset(&mut self) {
        self.acc.clear();
    }

    fn add(&mut self, value: f64) {
        self.acc.push(value);
    }

    fn value(&self) -> f64 {
        assert!(!self.acc.is_empty(), "median of an empty interval");
        if self.acc.len() == 1 {
            return self.acc[0];
        }
        if self.acc.len() == 2 {
            return (self.acc[0] + self.acc[1]) / 2.0;
        }
        let mut scratch = self.acc.clone();
        let middle = scratch.len() / 2;
        let (_, value, _) = scratch.select_nth_unstable_by(middle, f64::total_cmp);
        *value
    }

    fn ready(&self) -> bool {
        !self.acc.is_empty()
    }
}

/// Running maximum.
#[derive(Debug, Default, Clone)]
pub struct MaxCounter {
    max: f64,
    count: u64,
}

impl PaaCounter for MaxCounter {
    const KIND: NodeKind = NodeKind::MaxPaa;

    fn reset(&mut self) {
        self.max = 0.0;
        self.count = 0;
    }

    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.max = value;
        } else {
            self.max = self.max.max(value);
        }
        self.count += 1;
    }

    fn value(&self) -> f64 {
        self.max
    }

    fn ready(&self) -> bool {
        self.count != 0
    }
}

/// Piecewise aggregate approximation: buffers samples per series between
/// `Empty` markers and emits one aggregated sample per series on flush,
/// stamped with the marker's timestamp. `complete` flushes trailing state
/// with the last observed timestamp. Requires a group-by time step.
pub struct Paa<C: PaaCounter> {
    counters: BTreeMap<ParamId, C>,
    last_ts: Timestamp,
    next: Box<dyn Node>,
}

/// PAA over the running mean of every interval.
pub type MeanPaa = Paa<MeanCounter>;
/// PAA over the median of every interval.
pub type MedianPaa = Paa<MedianCounter>;
/// PAA over the maximum of every interval.
pub type MaxPaa = Paa<MaxCounter>;

impl<C: PaaCounter> Paa<C> {
    pub fn new(next: Box<dyn Node>) -> Self {
        Paa {
            counters: BTreeMap::new(),
            last_ts: 0,
            next,
        }
    }

    fn flush(&mut self, timestamp: Timestamp) -> bool {
        for (&id, counter) in self.counters.iter_mut() {
            if counter.ready() {
                let sample = Sample::float(timestamp, id, counter.value());
                counter.reset();
                if !self.next.put(sample) {
                    return false;
                }
            }
        }
        true
    }
}

impl<C: PaaCounter> Node for Paa<C> {
    fn put(&mut self, sample: Sample) -> bool {
        match sample.payload {
            Payload::Empty => {
                if !self.flush(sample.timestamp) {
                    return false;
                }
                self.next.put(sample)
            }
            Payload::Margin => self.next.put(sample),
            Payload::Float(value) => {
                self.counters.entry(sample.paramid).or_default().add(value);
                self.last_ts = sample.timestamp;
                true
            }
            Payload::ParamIdBit => self.next.put(sample),
        }
    }

    fn complete(&mut self) {
        let last_ts = self.last_ts;
        self.flush(last_ts);
        self.next.complete();
    }

    fn set_error(&mut self, status: Error) {
        self.next.set_error(status);
    }

    fn requirements(&self) -> u32 {
        GROUP_BY_REQUIRED
    }

    fn kind(&self) -> NodeKind {
        C::KIND
    }
}

/// Injects `Empty` markers at bucket boundaries. Owned by the query driver,
/// which routes every sample through it ahead of the node chain; an empty
/// statement (step 0) passes samples through untouched.
#[derive(Debug, Clone)]
pub struct GroupByTime {
    step: TsDuration,
    first_hit: bool,
    lowerbound: Timestamp,
    upperbound: Timestamp,
}

impl GroupByTime {
    pub fn new(step: TsDuration) -> Self {
        GroupByTime {
            step,
            first_hit: true,
            lowerbound: 0,
            upperbound: 0,
        }
    }

    /// True when no time bucketing was requested.
    pub fn is_empty(&self) -> bool {
        self.step == 0
    }

    /// Routes one sample, emitting a marker for every bucket boundary the
    /// stream crossed since the previous sample, in either temporal
    /// direction.
    pub fn put(&mut self, sample: Sample, next: &mut dyn Node) -> bool {
        if self.step != 0 {
            let ts = sample.timestamp;
            if self.first_hit {
                self.first_hit = false;
                let aligned = ts / self.step * self.step;
                self.lowerbound = aligned;
                self.upperbound = aligned.saturating_add(self.step);
            }
            while ts >= self.upperbound {
                // Forward direction
                if !next.put(Sample::empty_marker(self.upperbound)) {
                    return false;
                }
                self.lowerbound = self.lowerbound.saturating_add(self.step);
                self.upperbound = self.upperbound.saturating_add(self.step);
            }
            while ts < self.lowerbound {
                // Backward direction
                if !next.put(Sample::empty_marker(self.lowerbound)) {
                    return false;
                }
                self.lowerbound = self.lowerbound.saturating_sub(self.step);
                self.upperbound = self.upperbound.saturating_sub(self.step);
            }
        }
        next.put(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Collects everything that reaches the cursor.
    #[derive(Default)]
    struct SinkState {
        samples: Vec<Sample>,
        completed: u32,
        error: Option<Error>,
        deny_after: Option<usize>,
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
            let mut state = self.0.borrow_mut();
            if let Some(cap) = state.deny_after {
                if state.samples.len() >= cap {
                    return false;
                }
            }
            state.samples.push(sample);
            true
        }

        fn complete(&mut self) {
            self.0.borrow_mut().completed += 1;
        }

        fn set_error(&mut self, status: Error) {
            self.0.borrow_mut().error = Some(status);
        }
    }

    fn data(state: &Rc<RefCell<SinkState>>) -> Vec<(Timestamp, ParamId, f64)> {
        state
            .borrow()
            .samples
            .iter()
            .filter_map(|s| s.value().map(|v| (s.timestamp, s.paramid, v)))
            .collect()
    }

    #[test]
    fn terminal_swallows_margins_and_forwards_markers() {
        let (sink, state) = Sink::new();
        let mut node = TerminalNode::new(Box::new(sink));
        assert!(node.put(Sample::margin(1)));
        assert!(node.put(Sample::empty_marker(2)));
        assert!(node.put(Sample::float(3, 1, 1.0)));
        assert_eq!(state.borrow().samples.len(), 2);
    }

    #[test]
    fn terminal_discards_after_error() {
        let (sink, state) = Sink::new();
        let mut node = TerminalNode::new(Box::new(sink));
        node.set_error(Error::NoData);
        assert!(!node.put(Sample::float(1, 1, 1.0)));
        assert_eq!(state.borrow().error, Some(Error::NoData));
        assert!(state.borrow().samples.is_empty());
    }

    #[test]
    fn limiter_skips_offset_then_caps() {
        let (sink, state) = Sink::new();
        let terminal = Box::new(TerminalNode::new(Box::new(sink)));
        let mut limiter = Limiter::new(2, 1, terminal);

        assert!(limiter.put(Sample::float(1, 1, 1.0))); // skipped
        assert!(limiter.put(Sample::float(2, 1, 2.0)));
        assert!(limiter.put(Sample::float(3, 1, 3.0)));
        assert!(!limiter.put(Sample::float(4, 1, 4.0)));

        let values: Vec<f64> = data(&state).iter().map(|&(_, _, v)| v).collect();
        assert_eq!(values, vec![2.0, 3.0]);
    }

    #[test]
    fn limiter_passes_markers_uncounted() {
        let (sink, state) = Sink::new();
        let terminal = Box::new(TerminalNode::new(Box::new(sink)));
        let mut limiter = Limiter::new(1, 0, terminal);
        assert!(limiter.put(Sample::empty_marker(5)));
        assert!(limiter.put(Sample::float(6, 1, 1.0)));
        assert!(limiter.put(Sample::empty_marker(7)));
        assert_eq!(state.borrow().samples.len(), 3);
    }

    #[test]
    fn reservoir_smaller_than_capacity_keeps_everything() {
        let (sink, state) = Sink::new();
        let terminal = Box::new(TerminalNode::new(Box::new(sink)));
        let rng = ChaCha8Rng::seed_from_u64(7);
        let mut node = RandomSamplingNode::with_rng(10, rng, terminal);

        node.put(Sample::float(3, 1, 3.0));
        node.put(Sample::float(1, 1, 1.0));
        node.put(Sample::float(2, 1, 2.0));
        node.complete();

        let out = data(&state);
        assert_eq!(
            out,
            vec![(1, 1, 1.0), (2, 1, 2.0), (3, 1, 3.0)],
            "flush must sort by (timestamp, paramid)"
        );
        assert_eq!(state.borrow().completed, 1);
    }

    #[test]
    fn reservoir_emits_capacity_samples_from_input_multiset() {
        let (sink, state) = Sink::new();
        let terminal = Box::new(TerminalNode::new(Box::new(sink)));
        let rng = ChaCha8Rng::seed_from_u64(42);
        let mut node = RandomSamplingNode::with_rng(3, rng, terminal);

        let input = [(1, 10.0), (2, 20.0), (3, 30.0), (4, 40.0)];
        for (ts, v) in input {
            assert!(node.put(Sample::float(ts, 1, v)));
        }
        assert!(node.put(Sample::empty_marker(5)));

        let out = data(&state);
        assert_eq!(out.len(), 3);
        let mut prev = (0, 0);
        for &(ts, id, v) in &out {
            assert!((ts, id) > prev, "output must be (ts, id) ordered");
            prev = (ts, id);
            assert!(input.contains(&(ts, v)), "sample must come from the input");
        }
        // The marker itself is forwarded after the flush.
        assert_eq!(state.borrow().samples.len(), 4);
    }

    #[test]
    fn reservoir_flushes_per_interval() {
        let (sink, state) = Sink::new();
        let terminal = Box::new(TerminalNode::new(Box::new(sink)));
        let rng = ChaCha8Rng::seed_from_u64(1);
        let mut node = RandomSamplingNode::with_rng(8, rng, terminal);

        node.put(Sample::float(1, 1, 1.0));
        node.put(Sample::empty_marker(10));
        node.put(Sample::float(11, 1, 2.0));
        node.put(Sample::empty_marker(20));
        node.complete();

        assert_eq!(data(&state).len(), 2);
    }

    #[test]
    fn mean_paa_averages_each_interval_per_series() {
        let (sink, state) = Sink::new();
        let terminal = Box::new(TerminalNode::new(Box::new(sink)));
        let mut node = MeanPaa::new(terminal);

        node.put(Sample::float(1, 1, 1.0));
        node.put(Sample::float(2, 1, 2.0));
        node.put(Sample::float(3, 2, 10.0));
        node.put(Sample::empty_marker(100));
        node.put(Sample::float(101, 1, 7.0));
        node.complete();

        let out = data(&state);
        assert_eq!(out, vec![(100, 1, 1.5), (100, 2, 10.0), (101, 1, 7.0)]);
    }

    #[test]
    fn max_paa_tracks_negative_maxima() {
        let (sink, state) = Sink::new();
        let terminal = Box::new(TerminalNode::new(Box::new(sink)));
        let mut node = MaxPaa::new(terminal);
        node.put(Sample::float(1, 1, -5.0));
        node.put(Sample::float(2, 1, -2.0));
        node.put(Sample::float(3, 1, -9.0));
        node.put(Sample::empty_marker(10));
        assert_eq!(data(&state), vec![(10, 1, -2.0)]);
    }

    #[test]
    fn median_counter_selection() {
        let mut c = MedianCounter::default();
        c.add(5.0);
        assert_eq!(c.value(), 5.0);
        c.add(1.0);
        assert_eq!(c.value(), 3.0, "two values average");
        c.add(9.0);
        assert_eq!(c.value(), 5.0, "odd count takes the middle");
        c.add(7.0);
        assert_eq!(c.value(), 7.0, "larger even count takes the upper middle");
        c.reset();
        assert!(!c.ready());
    }

    #[test]
    fn group_by_time_emits_forward_markers_per_bucket() {
        let (sink, state) = Sink::new();
        let mut terminal = TerminalNode::new(Box::new(sink));
        let mut groupby = GroupByTime::new(10);

        for ts in [12, 15, 23, 55] {
            assert!(groupby.put(Sample::float(ts, 1, ts as f64), &mut terminal));
        }

        let markers: Vec<Timestamp> = state
            .borrow()
            .samples
            .iter()
            .filter(|s| s.payload == Payload::Empty)
            .map(|s| s.timestamp)
            .collect();
        // First sample aligns to [10, 20); crossings at 20, 30, 40, 50.
        assert_eq!(markers, vec![20, 30, 40, 50]);
    }

    #[test]
    fn group_by_time_marker_count_matches_span() {
        let step = 7;
        let (first, last) = (3u64, 95u64);
        let (sink, state) = Sink::new();
        let mut terminal = TerminalNode::new(Box::new(sink));
        let mut groupby = GroupByTime::new(step);
        for ts in first..=last {
            groupby.put(Sample::float(ts, 1, 0.0), &mut terminal);
        }
        let markers = state
            .borrow()
            .samples
            .iter()
            .filter(|s| s.payload == Payload::Empty)
            .count() as u64;
        assert_eq!(markers, (last - first) / step);
    }

    #[test]
    fn group_by_time_handles_backward_streams() {
        let (sink, state) = Sink::new();
        let mut terminal = TerminalNode::new(Box::new(sink));
        let mut groupby = GroupByTime::new(10);

        for ts in [55, 48, 31] {
            assert!(groupby.put(Sample::float(ts, 1, 0.0), &mut terminal));
        }
        let markers: Vec<Timestamp> = state
            .borrow()
            .samples
            .iter()
            .filter(|s| s.payload == Payload::Empty)
            .map(|s| s.timestamp)
            .collect();
        // First sample aligns to [50, 60); crossings down at 50 and 40.
        assert_eq!(markers, vec![50, 40]);
    }

    #[test]
    fn empty_group_by_passes_samples_through() {
        let (sink, state) = Sink::new();
        let mut terminal = TerminalNode::new(Box::new(sink));
        let mut groupby = GroupByTime::new(0);
        assert!(groupby.is_empty());
        groupby.put(Sample::float(1, 1, 1.0), &mut terminal);
        assert_eq!(state.borrow().samples.len(), 1);
    }

    #[test]
    fn backpressure_unwinds_through_the_chain() {
        let (sink, state) = Sink::new();
        state.borrow_mut().deny_after = Some(1);
        let terminal = Box::new(TerminalNode::new(Box::new(sink)));
        let mut limiter = Limiter::new(100, 0, terminal);
        assert!(limiter.put(Sample::float(1, 1, 1.0)));
        assert!(!limiter.put(Sample::float(2, 1, 2.0)));
    }

    #[test]
    fn pipeline_builder_records_stages_tail_first() {
        let (sink, _) = Sink::new();
        let (head, stages) = PipelineBuilder::terminal(Box::new(sink))
            .wrap(|next| Limiter::new(10, 0, next))
            .build();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].kind, NodeKind::Terminal);
        assert_eq!(stages[0].requirements & TERMINAL, TERMINAL);
        assert_eq!(stages[1].kind, NodeKind::Limiter);
        drop(head);
    }
}
