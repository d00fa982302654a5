//! Tick semantics of networks: update order, delay refresh and synaptic
//! transmission.

use anyhow::Result;
use ndarray::{arr1, IxDyn};
use neurodyn_connect::Connector;
use neurodyn_core::{ContextConfig, DynError, Initializer, Mode, SharedContext, Tensor, Variable};
use neurodyn_delay::{DelayInit, DelayRegistry, DelaySteps, NormalizedSteps};
use proptest::prelude::*;
use neurodyn_dyn::{
    Child, DeltaSynapse, DeltaSynapseParams, DynamicalSystem, Geometry, Network, NeuronGroup, NodeBase, NodeKind,
    SpikeTimeGroup,
};
use std::cell::RefCell;
use std::rc::Rc;

type Log = Rc<RefCell<Vec<String>>>;

/// Records its name when updated
struct Recorder {
    base: NodeBase,
    kind: NodeKind,
    log: Log,
}

impl Recorder {
    fn new(name: &str, kind: NodeKind, log: &Log, delays: &DelayRegistry) -> Result<Self> {
        Ok(Self {
            base: NodeBase::new("Recorder", Some(name), Mode::NonBatching, delays)?,
            kind,
            log: log.clone(),
        })
    }
}

impl DynamicalSystem for Recorder {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn update(&mut self, _ctx: &SharedContext, _input: Option<&Tensor>) -> neurodyn_core::Result<Option<Tensor>> {
        self.log.borrow_mut().push(self.base.name().to_string());
        Ok(None)
    }
}

/// Neuron-like group that records and clears its input every tick
struct InputRecorder {
    base: NodeBase,
    geometry: Geometry,
    spike: Variable,
    input: Variable,
    seen: Vec<Tensor>,
}

impl InputRecorder {
    fn new(num: usize, name: &str, delays: &DelayRegistry) -> Result<Self> {
        Ok(Self {
            base: NodeBase::new("InputRecorder", Some(name), Mode::NonBatching, delays)?,
            geometry: Geometry::new(&[num], false)?,
            spike: Variable::zeros(&[num]),
            input: Variable::zeros(&[num]),
            seen: Vec::new(),
        })
    }
}

impl DynamicalSystem for InputRecorder {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Neuron
    }

    fn update(&mut self, _ctx: &SharedContext, _input: Option<&Tensor>) -> neurodyn_core::Result<Option<Tensor>> {
        self.seen.push(self.input.get());
        self.input.fill(0.0);
        Ok(None)
    }
}

impl NeuronGroup for InputRecorder {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn variables(&self) -> Vec<(&'static str, Variable)> {
        vec![("spike", self.spike.clone()), ("input", self.input.clone())]
    }
}

/// Sets its variable to the tick index; owns a one-step delay on it
struct Writer {
    base: NodeBase,
    x: Variable,
}

impl DynamicalSystem for Writer {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Neuron
    }

    fn update(&mut self, ctx: &SharedContext, _input: Option<&Tensor>) -> neurodyn_core::Result<Option<Tensor>> {
        self.x.fill(ctx.i() as f64);
        Ok(None)
    }
}

/// Reads the writer's delayed variable
struct Reader {
    base: NodeBase,
    steps: NormalizedSteps,
    reads: Vec<f64>,
    rows: Vec<Tensor>,
}

impl Reader {
    fn new(name: &str, steps: &DelaySteps, x: &Variable, delays: &DelayRegistry) -> Result<Self> {
        let mut reader = Self {
            base: NodeBase::new("Reader", Some(name), Mode::NonBatching, delays)?,
            steps: NormalizedSteps::None,
            reads: Vec::new(),
            rows: Vec::new(),
        };
        reader.steps = reader.register_delay("writer.x", steps, x, DelayInit::Zeros)?;
        Ok(reader)
    }
}

fn writer(num: usize, delays: &DelayRegistry) -> Result<Writer> {
    Ok(Writer {
        base: NodeBase::new("Writer", Some("writer"), Mode::NonBatching, delays)?,
        x: Variable::zeros(&[num]),
    })
}

impl DynamicalSystem for Reader {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Synapse
    }

    fn update(&mut self, _ctx: &SharedContext, _input: Option<&Tensor>) -> neurodyn_core::Result<Option<Tensor>> {
        let value = self.get_delay_data("writer.x", &self.steps, &[])?;
        self.reads.push(value.sum());
        self.rows.push(value);
        Ok(None)
    }
}

fn context(dt: f64) -> Result<SharedContext> {
    let config = ContextConfig::from_json(&format!(r#"{{"dt": {}, "t0": 0.0}}"#, dt))?;
    Ok(SharedContext::from_config(&config)?)
}

#[test]
fn test_synapses_update_before_neurons() -> Result<()> {
    let delays = DelayRegistry::new();
    let log = Log::default();
    let mut net = Network::new(
        vec![
            Child::node(Recorder::new("neuron", NodeKind::Neuron, &log, &delays)?),
            Child::node(Recorder::new("other", NodeKind::Other, &log, &delays)?),
            Child::node(Recorder::new("synapse", NodeKind::Synapse, &log, &delays)?),
        ],
        Some("net"),
        Mode::NonBatching,
        &delays,
    )?;
    let ctx = context(0.1)?;
    net.update(&ctx, None)?;
    net.update(&ctx, None)?;
    assert_eq!(
        *log.borrow(),
        vec!["synapse", "neuron", "other", "synapse", "neuron", "other"]
    );
    Ok(())
}

#[test]
fn test_delays_refresh_after_all_reads() -> Result<()> {
    let delays = DelayRegistry::new();
    let mut writer = writer(1, &delays)?;
    let x = writer.x.clone();
    writer.register_delay("writer.x", &DelaySteps::Homo(1), &x, DelayInit::Zeros)?;
    let reader = Reader::new("reader", &DelaySteps::Homo(1), &x, &delays)?;

    let mut net = Network::new(
        vec![Child::node(writer), Child::node(reader)],
        None,
        Mode::NonBatching,
        &delays,
    )?;
    let mut ctx = context(0.1)?;
    for i in 0..5 {
        ctx.tick(i);
        net.update(&ctx, None)?;
    }
    let reader: &Reader = net.child("reader")?;
    assert_eq!(reader.reads, vec![0.0, 0.0, 0.0, 1.0, 2.0]);
    Ok(())
}

fn run_transmission(delay_step: Option<i64>, ticks: u64) -> Result<Vec<Tensor>> {
    let delays = DelayRegistry::new();
    let pre = SpikeTimeGroup::new(3, vec![1], vec![0.5], Some("pre"), Mode::NonBatching, &delays)?;
    let post = InputRecorder::new(3, "post", &delays)?;
    let params = DeltaSynapseParams {
        weight: Initializer::Constant(0.25),
        delay_step,
        ..Default::default()
    };
    let syn = DeltaSynapse::new(&pre, &post, Connector::OneToOne, params, Some("syn"), Mode::NonBatching, &delays)?;
    let mut net = Network::new(
        vec![Child::node(pre), Child::node(post), Child::node(syn)],
        Some("net"),
        Mode::NonBatching,
        &delays,
    )?;
    let mut ctx = context(0.1)?;
    for i in 0..ticks {
        ctx.tick(i);
        net.update(&ctx, None)?;
    }
    let post: &InputRecorder = net.child("post")?;
    Ok(post.seen.clone())
}

#[test]
fn test_spike_reaches_post_one_tick_later() -> Result<()> {
    let seen = run_transmission(None, 10)?;
    let bump = arr1(&[0.0, 0.25, 0.0]).into_dyn();
    for (tick, input) in seen.iter().enumerate() {
        if tick == 6 {
            assert_eq!(*input, bump);
        } else {
            assert_eq!(input.sum(), 0.0, "unexpected input at tick {}", tick);
        }
    }
    Ok(())
}

#[test]
fn test_delayed_spike_arrives_later() -> Result<()> {
    let seen = run_transmission(Some(2), 12)?;
    let arrivals: Vec<usize> = seen
        .iter()
        .enumerate()
        .filter(|(_, input)| input.sum() > 0.0)
        .map(|(tick, _)| tick)
        .collect();
    assert_eq!(arrivals, vec![8]);
    assert_eq!(seen[8], arr1(&[0.0, 0.25, 0.0]).into_dyn());
    Ok(())
}

#[test]
fn test_duplicate_children_rejected() -> Result<()> {
    let delays = DelayRegistry::new();
    let log = Log::default();
    let result = Network::new(
        vec![
            Child::node(Recorder::new("a", NodeKind::Neuron, &log, &delays)?),
            Child::node(Recorder::new("a", NodeKind::Synapse, &log, &delays)?),
        ],
        None,
        Mode::NonBatching,
        &delays,
    );
    assert!(matches!(result, Err(DynError::DuplicateNameError { .. })));
    Ok(())
}

#[test]
fn test_pass_through_and_growth() -> Result<()> {
    let delays = DelayRegistry::new();
    let log = Log::default();
    let mut node = Recorder::new("node", NodeKind::Other, &log, &delays)?;
    let target = Variable::new(arr1(&[1.0, 2.0]).into_dyn());

    let steps = node.register_delay("pass", &DelaySteps::None, &target, DelayInit::Zeros)?;
    target.fill(7.0);
    assert_eq!(node.get_delay_data("pass", &steps, &[])?, Tensor::from_elem(IxDyn(&[2]), 7.0));

    let three = node.register_delay("hist", &DelaySteps::Homo(3), &target, DelayInit::Zeros)?;
    for k in 1..=4 {
        target.fill(k as f64);
        node.base().update_local_delays()?;
    }
    // buffer holds 4, 3, 2, 1 at lags 0..=3
    assert_eq!(node.get_delay_data("hist", &three, &[])?.sum(), 2.0);

    let five = node.register_delay("hist", &DelaySteps::Homo(5), &target, DelayInit::Zeros)?;
    assert_eq!(delays.capacity("hist"), Some(6));
    assert_eq!(node.get_delay_data("hist", &three, &[])?.sum(), 2.0);
    assert_eq!(node.get_delay_data("hist", &five, &[])?.sum(), 0.0);

    node.register_delay("hist", &DelaySteps::Homo(2), &target, DelayInit::Zeros)?;
    assert_eq!(delays.capacity("hist"), Some(6));
    Ok(())
}

#[test]
fn test_removed_child_releases_delays() -> Result<()> {
    let delays = DelayRegistry::new();
    let pre = SpikeTimeGroup::new(2, vec![0], vec![0.1], Some("pre"), Mode::NonBatching, &delays)?;
    let post = InputRecorder::new(2, "post", &delays)?;
    let params = DeltaSynapseParams {
        delay_step: Some(3),
        ..Default::default()
    };
    let syn = DeltaSynapse::new(&pre, &post, Connector::OneToOne, params, Some("syn"), Mode::NonBatching, &delays)?;
    let mut net = Network::new(
        vec![Child::node(pre), Child::node(post), Child::node(syn)],
        None,
        Mode::NonBatching,
        &delays,
    )?;
    assert!(delays.contains("pre.spike"));
    assert!(net.remove("syn"));
    assert!(!delays.contains("pre.spike"));
    net.update(&context(0.1)?, None)?;
    Ok(())
}

#[test]
fn test_per_element_lags_through_network() -> Result<()> {
    let delays = DelayRegistry::new();
    let writer = writer(3, &delays)?;
    let lags = DelaySteps::Generated {
        init: Initializer::Tensor(arr1(&[0.0, 1.0, 2.0]).into_dyn()),
        seed: None,
    };
    let reader = Reader::new("reader", &lags, &writer.x, &delays)?;
    assert_eq!(reader.steps, NormalizedSteps::Heter(arr1(&[0, 1, 2])));
    assert_eq!(delays.capacity("writer.x"), Some(3));

    let mut net = Network::new(vec![Child::node(writer), Child::node(reader)], None, Mode::NonBatching, &delays)?;
    let mut ctx = context(0.1)?;
    for i in 0..5 {
        ctx.tick(i);
        net.update(&ctx, None)?;
    }
    // element k sees the value written k + 1 ticks earlier
    let reader: &Reader = net.child("reader")?;
    let expected = [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 1.0, 0.0], [3.0, 2.0, 1.0]];
    for (row, want) in reader.rows.iter().zip(expected) {
        assert_eq!(*row, arr1(&want).into_dyn());
    }
    Ok(())
}

#[test]
fn test_shared_spike_delay_outlives_one_synapse() -> Result<()> {
    let delays = DelayRegistry::new();
    let pre = SpikeTimeGroup::new(3, vec![1], vec![0.5], Some("pre"), Mode::NonBatching, &delays)?;
    let post = InputRecorder::new(3, "post", &delays)?;
    let short = DeltaSynapseParams {
        weight: Initializer::Constant(0.25),
        delay_step: Some(1),
        ..Default::default()
    };
    let long = DeltaSynapseParams {
        weight: Initializer::Constant(0.5),
        delay_step: Some(3),
        ..Default::default()
    };
    let a = DeltaSynapse::new(&pre, &post, Connector::OneToOne, short, Some("a"), Mode::NonBatching, &delays)?;
    let b = DeltaSynapse::new(&pre, &post, Connector::OneToOne, long, Some("b"), Mode::NonBatching, &delays)?;
    assert_eq!(delays.holders("pre.spike"), 2);
    assert_eq!(delays.capacity("pre.spike"), Some(4));

    let mut net = Network::new(
        vec![Child::node(pre), Child::node(post), Child::node(a), Child::node(b)],
        None,
        Mode::NonBatching,
        &delays,
    )?;
    let mut ctx = context(0.1)?;
    ctx.tick(0);
    net.update(&ctx, None)?;

    assert!(net.remove("a"));
    assert_eq!(delays.holders("pre.spike"), 1);
    for i in 1..12 {
        ctx.tick(i);
        net.update(&ctx, None)?;
    }
    let post: &InputRecorder = net.child("post")?;
    let arrivals: Vec<usize> = post
        .seen
        .iter()
        .enumerate()
        .filter(|(_, input)| input.sum() > 0.0)
        .map(|(tick, _)| tick)
        .collect();
    assert_eq!(arrivals, vec![9]);
    assert_eq!(post.seen[9], arr1(&[0.0, 0.5, 0.0]).into_dyn());

    assert!(net.remove("b"));
    assert!(!delays.contains("pre.spike"));
    Ok(())
}

#[test]
fn test_nested_holders_refresh_once_per_tick() -> Result<()> {
    let delays = DelayRegistry::new();
    let writer = writer(1, &delays)?;
    let x = writer.x.clone();
    let inner_reader = Reader::new("a", &DelaySteps::Homo(1), &x, &delays)?;
    let outer_reader = Reader::new("b", &DelaySteps::Homo(2), &x, &delays)?;
    let inner = Network::new(vec![Child::node(inner_reader)], Some("inner"), Mode::NonBatching, &delays)?;
    let mut net = Network::new(
        vec![Child::node(writer), Child::node(inner), Child::node(outer_reader)],
        Some("outer"),
        Mode::NonBatching,
        &delays,
    )?;

    let mut ctx = context(0.1)?;
    for i in 0..6 {
        ctx.tick(i);
        net.update(&ctx, None)?;
    }
    let b: &Reader = net.child("b")?;
    assert_eq!(b.reads, vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0]);

    // with the inner holder gone the outer network takes over the refresh
    assert!(net.child_mut::<Network>("inner")?.remove("a"));
    assert_eq!(delays.holders("writer.x"), 1);
    for i in 6..8 {
        ctx.tick(i);
        net.update(&ctx, None)?;
    }
    let b: &Reader = net.child("b")?;
    assert_eq!(&b.reads[6..], &[3.0, 4.0]);
    Ok(())
}

fn kind_of(code: u8) -> NodeKind {
    match code {
        0 => NodeKind::Synapse,
        1 => NodeKind::Neuron,
        _ => NodeKind::Other,
    }
}

proptest! {
    #[test]
    fn prop_update_order_ignores_insertion_order(codes in proptest::collection::vec(0u8..3, 1..10)) {
        let delays = DelayRegistry::new();
        let log = Log::default();
        let children = codes
            .iter()
            .enumerate()
            .map(|(i, &c)| Recorder::new(&format!("p{}", i), kind_of(c), &log, &delays).map(Child::node))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let mut net = Network::new(children, None, Mode::NonBatching, &delays).unwrap();
        net.update(&SharedContext::new(), None).unwrap();

        let mut expected: Vec<(u8, usize)> = codes.iter().enumerate().map(|(i, &c)| (c.min(2), i)).collect();
        expected.sort();
        let expected: Vec<String> = expected.into_iter().map(|(_, i)| format!("p{}", i)).collect();
        prop_assert_eq!(log.borrow().clone(), expected);
    }
}
