//! Composite nodes: containers, networks and sequential pipelines.

use crate::base::{DynamicalSystem, Node, NodeBase, NodeKind};
use log::{debug, trace, warn};
use neurodyn_core::{DynError, Mode, Result, SharedContext, Tensor};
use neurodyn_delay::DelayRegistry;
use std::fmt;
use std::ops::Range;

/// Box a node for insertion into a composite.
pub fn boxed<T: DynamicalSystem>(node: T) -> Box<Node> {
    Box::new(node)
}

/// Children handed to a composite at construction
pub enum Child {
    /// Keyed by the node's own name
    Node(Box<Node>),
    /// Keyed by the given name
    Named(String, Box<Node>),
    /// Each member keyed by its own name
    List(Vec<Box<Node>>),
    Map(Vec<(String, Box<Node>)>),
}

impl Child {
    pub fn node<T: DynamicalSystem>(node: T) -> Self {
        Self::Node(Box::new(node))
    }

    pub fn named<T: DynamicalSystem>(name: impl Into<String>, node: T) -> Self {
        Self::Named(name.into(), Box::new(node))
    }

    fn into_entries(self) -> Vec<(String, Box<Node>)> {
        match self {
            Self::Node(node) => vec![(node.name().to_string(), node)],
            Self::Named(name, node) => vec![(name, node)],
            Self::List(nodes) => nodes
                .into_iter()
                .map(|node| (node.name().to_string(), node))
                .collect(),
            Self::Map(entries) => entries,
        }
    }
}

// ============================================================================
// CHILD MAP
// ============================================================================

/// Named children of a composite, in insertion order.
#[derive(Default)]
pub struct ChildMap {
    entries: Vec<(String, Box<Node>)>,
}

impl fmt::Debug for ChildMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ChildMap {
    /// Insert after checking the name, the mode and the delay registry
    /// against `owner`.
    pub fn insert(&mut self, owner: &NodeBase, name: String, node: Box<Node>) -> Result<()> {
        if self.contains(&name) {
            return Err(DynError::DuplicateNameError {
                container: owner.name().to_string(),
                name,
            });
        }
        owner.check_child(&name, node.base())?;
        debug!("{} adds child `{}`", owner.name(), name);
        self.entries.push((name, node));
        Ok(())
    }

    pub fn extend(&mut self, owner: &NodeBase, children: Vec<Child>) -> Result<()> {
        for child in children {
            for (name, node) in child.into_entries() {
                self.insert(owner, name, node)?;
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node.as_mut())
    }

    /// Typed access to a child.
    pub fn get_as<T: DynamicalSystem>(&self, name: &str) -> Result<&T> {
        let node = self
            .get(name)
            .ok_or_else(|| DynError::ModelBuildError(format!("no child named `{}`", name)))?;
        node.downcast_ref::<T>().ok_or_else(|| {
            DynError::TypeMismatchError(format!("child `{}` is not a {}", name, std::any::type_name::<T>()))
        })
    }

    pub fn get_as_mut<T: DynamicalSystem>(&mut self, name: &str) -> Result<&mut T> {
        let node = self
            .get_mut(name)
            .ok_or_else(|| DynError::ModelBuildError(format!("no child named `{}`", name)))?;
        node.downcast_mut::<T>().ok_or_else(|| {
            DynError::TypeMismatchError(format!("child `{}` is not a {}", name, std::any::type_name::<T>()))
        })
    }

    /// Detach a child without tearing it down.
    pub fn take(&mut self, name: &str) -> Option<Box<Node>> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    /// Detach and tear down a child. Returns `false` for unknown names.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.take(name) {
            Some(mut node) => {
                node.teardown();
                true
            }
            None => {
                warn!("no child named `{}` to remove", name);
                false
            }
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.entries.iter().map(|(_, node)| node.as_ref())
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.entries.iter_mut().map(|(_, node)| node.as_mut())
    }

    fn delay_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for node in self.nodes() {
            node.collect_local_delays(&mut keys);
        }
        keys.sort();
        keys.dedup();
        keys
    }

    /// Keys held below this map that no nested network refreshes.
    fn refresh_keys(&self) -> Vec<String> {
        let mut nested = Vec::new();
        for node in self.nodes() {
            node.collect_refreshed_delays(&mut nested);
        }
        let mut keys = self.delay_keys();
        keys.retain(|key| !nested.contains(key));
        keys
    }

    fn reset_all(&mut self, owner: &str, batch_size: Option<usize>, kinds: &[Option<NodeKind>]) -> Result<()> {
        if self.entries.is_empty() {
            return Err(DynError::NotImplementedError(format!(
                "{} has no children to reset; subclass must implement `reset_state`",
                owner
            )));
        }
        for kind in kinds {
            for node in self.nodes_mut().filter(|node| phase_matches(node.kind(), *kind)) {
                node.reset_state(batch_size)?;
            }
        }
        Ok(())
    }
}

/// `None` stands for every kind other than neurons and synapses.
fn phase_matches(kind: NodeKind, phase: Option<NodeKind>) -> bool {
    match phase {
        Some(phase) => kind == phase,
        None => !matches!(kind, NodeKind::Neuron | NodeKind::Synapse),
    }
}

// ============================================================================
// CONTAINER
// ============================================================================

/// Composite whose children run in a single pass, in insertion order.
#[derive(Debug)]
pub struct Container {
    base: NodeBase,
    children: ChildMap,
}

impl Container {
    pub fn new(children: Vec<Child>, name: Option<&str>, mode: Mode, delays: &DelayRegistry) -> Result<Self> {
        let base = NodeBase::new("Container", name, mode, delays)?;
        let mut map = ChildMap::default();
        map.extend(&base, children)?;
        Ok(Self { base, children: map })
    }

    pub fn add(&mut self, child: Child) -> Result<()> {
        self.children.extend(&self.base, vec![child])
    }

    pub fn get_child(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    pub fn get_child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.get_mut(name)
    }

    pub fn child<T: DynamicalSystem>(&self, name: &str) -> Result<&T> {
        self.children.get_as(name)
    }

    pub fn child_mut<T: DynamicalSystem>(&mut self, name: &str) -> Result<&mut T> {
        self.children.get_as_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.children.remove(name)
    }

    pub fn child_map(&self) -> &ChildMap {
        &self.children
    }
}

impl DynamicalSystem for Container {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Container
    }

    fn update(&mut self, ctx: &SharedContext, _input: Option<&Tensor>) -> Result<Option<Tensor>> {
        for node in self.children.nodes_mut() {
            node.update(ctx, None)?;
        }
        Ok(None)
    }

    fn reset_state(&mut self, batch_size: Option<usize>) -> Result<()> {
        self.children.reset_all(self.base.name(), batch_size, &[Some(NodeKind::Neuron), Some(NodeKind::Synapse), None])?;
        self.base.delays().reset(&self.children.delay_keys())
    }

    fn children(&self) -> Vec<&Node> {
        self.children.nodes().collect()
    }

    fn children_mut(&mut self) -> Vec<&mut Node> {
        self.children.nodes_mut().collect()
    }
}

// ============================================================================
// NETWORK
// ============================================================================

const UPDATE_ORDER: [Option<NodeKind>; 3] = [Some(NodeKind::Synapse), Some(NodeKind::Neuron), None];
const RESET_ORDER: [Option<NodeKind>; 3] = [Some(NodeKind::Neuron), Some(NodeKind::Synapse), None];

/// Composite of neurons, synapses and other nodes.
///
/// Each tick runs every synapse, then every neuron group, then everything
/// else, and finally pushes the current value of every delay buffer its
/// children own. Synaptic effects computed in a tick are therefore seen by
/// the neurons in the same tick, and delay buffers are written only after
/// all readers are done.
#[derive(Debug)]
pub struct Network {
    base: NodeBase,
    children: ChildMap,
}

impl Network {
    pub fn new(children: Vec<Child>, name: Option<&str>, mode: Mode, delays: &DelayRegistry) -> Result<Self> {
        let base = NodeBase::new("Network", name, mode, delays)?;
        let mut map = ChildMap::default();
        map.extend(&base, children)?;
        Ok(Self { base, children: map })
    }

    pub fn add(&mut self, child: Child) -> Result<()> {
        self.children.extend(&self.base, vec![child])
    }

    pub fn get_child(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    pub fn get_child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.get_mut(name)
    }

    pub fn child<T: DynamicalSystem>(&self, name: &str) -> Result<&T> {
        self.children.get_as(name)
    }

    pub fn child_mut<T: DynamicalSystem>(&mut self, name: &str) -> Result<&mut T> {
        self.children.get_as_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.children.remove(name)
    }

    pub fn child_map(&self) -> &ChildMap {
        &self.children
    }
}

impl DynamicalSystem for Network {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Container
    }

    fn update(&mut self, ctx: &SharedContext, _input: Option<&Tensor>) -> Result<Option<Tensor>> {
        for phase in UPDATE_ORDER {
            for node in self.children.nodes_mut().filter(|node| phase_matches(node.kind(), phase)) {
                trace!("{}: updating {} at i={}", self.base.name(), node.name(), ctx.i());
                node.update(ctx, None)?;
            }
        }
        self.base.delays().refresh(&self.children.refresh_keys())?;
        Ok(None)
    }

    fn reset_state(&mut self, batch_size: Option<usize>) -> Result<()> {
        self.children.reset_all(self.base.name(), batch_size, &RESET_ORDER)?;
        self.base.delays().reset(&self.children.delay_keys())
    }

    fn children(&self) -> Vec<&Node> {
        self.children.nodes().collect()
    }

    fn children_mut(&mut self) -> Vec<&mut Node> {
        self.children.nodes_mut().collect()
    }

    /// A network refreshes its children's delays itself; a parent only
    /// handles the ones the network holds.
    fn collect_local_delays(&self, out: &mut Vec<String>) {
        out.extend(self.base.local_delays().iter().cloned());
    }

    fn collect_refreshed_delays(&self, out: &mut Vec<String>) {
        out.extend(self.children.refresh_keys());
        for node in self.children.nodes() {
            node.collect_refreshed_delays(out);
        }
    }
}

// ============================================================================
// SEQUENTIAL
// ============================================================================

pub type LayerFn = Box<dyn FnMut(&SharedContext, &Tensor) -> Result<Tensor>>;

/// Stateless pipeline stage
pub struct FnLayer {
    name: String,
    f: LayerFn,
}

impl FnLayer {
    pub fn new(name: impl Into<String>, f: impl FnMut(&SharedContext, &Tensor) -> Result<Tensor> + 'static) -> Self {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&mut self, ctx: &SharedContext, x: &Tensor) -> Result<Tensor> {
        (self.f)(ctx, x)
    }
}

/// Stage of a [`Sequential`] pipeline
pub enum Layer {
    System(Box<Node>),
    Function(FnLayer),
}

impl Layer {
    pub fn system<T: DynamicalSystem>(node: T) -> Self {
        Self::System(Box::new(node))
    }

    pub fn function(
        name: impl Into<String>,
        f: impl FnMut(&SharedContext, &Tensor) -> Result<Tensor> + 'static,
    ) -> Self {
        Self::Function(FnLayer::new(name, f))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::System(node) => node.name(),
            Self::Function(f) => f.name(),
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Self::System(node) => Some(node.as_ref()),
            Self::Function(_) => None,
        }
    }

    fn call(&mut self, ctx: &SharedContext, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::System(node) => node.update(ctx, Some(x))?.ok_or_else(|| {
                DynError::ModelBuildError(format!("layer `{}` produced no output", node.name()))
            }),
            Self::Function(f) => f.call(ctx, x),
        }
    }

    fn teardown(&mut self) {
        if let Self::System(node) = self {
            node.teardown();
        }
    }
}

/// Feed-forward pipeline: each layer's output is the next layer's input.
pub struct Sequential {
    base: NodeBase,
    layers: Vec<(String, Layer)>,
}

impl fmt::Debug for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequential")
            .field("name", &self.base.name())
            .field("layers", &self.layer_names())
            .finish()
    }
}

impl Sequential {
    pub fn new(layers: Vec<Layer>, name: Option<&str>, mode: Mode, delays: &DelayRegistry) -> Result<Self> {
        let named = layers
            .into_iter()
            .map(|layer| (layer.name().to_string(), layer))
            .collect();
        Self::from_named(named, name, mode, delays)
    }

    pub fn from_named(
        layers: Vec<(String, Layer)>,
        name: Option<&str>,
        mode: Mode,
        delays: &DelayRegistry,
    ) -> Result<Self> {
        let base = NodeBase::new("Sequential", name, mode, delays)?;
        let mut seq = Self {
            base,
            layers: Vec::with_capacity(layers.len()),
        };
        for (name, layer) in layers {
            seq.push_named(name, layer)?;
        }
        Ok(seq)
    }

    pub fn push(&mut self, layer: Layer) -> Result<()> {
        self.push_named(layer.name().to_string(), layer)
    }

    pub fn push_named(&mut self, name: String, layer: Layer) -> Result<()> {
        if self.layers.iter().any(|(n, _)| *n == name) {
            return Err(DynError::DuplicateNameError {
                container: self.base.name().to_string(),
                name,
            });
        }
        if let Layer::System(node) = &layer {
            self.base.check_child(&name, node.base())?;
        }
        self.layers.push((name, layer));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index).map(|(_, l)| l)
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.layers.get_mut(index).map(|(_, l)| l)
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|(n, _)| n == name).map(|(_, l)| l)
    }

    /// Typed access to a stateful layer.
    pub fn node<T: DynamicalSystem>(&self, name: &str) -> Result<&T> {
        self.layer_by_name(name)
            .and_then(Layer::as_node)
            .and_then(|node| node.downcast_ref::<T>())
            .ok_or_else(|| DynError::TypeMismatchError(format!("no {} layer named `{}`", std::any::type_name::<T>(), name)))
    }

    /// Keep only the layers in `range`, tearing down the rest.
    pub fn into_slice(self, range: Range<usize>) -> Result<Sequential> {
        if range.start > range.end || range.end > self.layers.len() {
            return Err(DynError::invalid_parameter(
                "range",
                format!("{:?} out of bounds for {} layers", range, self.layers.len()),
            ));
        }
        let indices: Vec<usize> = range.collect();
        self.into_select(&indices)
    }

    /// Keep the layers at `indices`, in that order, tearing down the rest.
    pub fn into_select(mut self, indices: &[usize]) -> Result<Sequential> {
        if let Some(i) = indices.iter().find(|&&i| i >= self.layers.len()) {
            return Err(DynError::invalid_parameter(
                "index",
                format!("{} out of bounds for {} layers", i, self.layers.len()),
            ));
        }
        let mut slots: Vec<Option<(String, Layer)>> = self.layers.drain(..).map(Some).collect();
        let mut picked = Vec::with_capacity(indices.len());
        for &i in indices {
            let entry = slots[i].take().ok_or_else(|| {
                DynError::invalid_parameter("index", format!("{} selected more than once", i))
            })?;
            picked.push(entry);
        }
        for (_, mut rest) in slots.into_iter().flatten() {
            rest.teardown();
        }
        Sequential::from_named(picked, None, self.base.mode(), self.base.delays())
    }

    /// Move the layers from `at` onwards into a new pipeline.
    pub fn split_off(&mut self, at: usize) -> Result<Sequential> {
        if at > self.layers.len() {
            return Err(DynError::invalid_parameter(
                "at",
                format!("{} out of bounds for {} layers", at, self.layers.len()),
            ));
        }
        let tail = self.layers.split_off(at);
        Sequential::from_named(tail, None, self.base.mode(), self.base.delays())
    }
}

impl DynamicalSystem for Sequential {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Container
    }

    fn update(&mut self, ctx: &SharedContext, input: Option<&Tensor>) -> Result<Option<Tensor>> {
        let mut x = input
            .ok_or_else(|| DynError::invalid_parameter("input", format!("{} needs an input", self.base.name())))?
            .clone();
        for (_, layer) in self.layers.iter_mut() {
            x = layer.call(ctx, &x)?;
        }
        Ok(Some(x))
    }

    fn reset_state(&mut self, batch_size: Option<usize>) -> Result<()> {
        if self.layers.is_empty() {
            return Err(DynError::NotImplementedError(format!(
                "{} has no layers to reset",
                self.base.name()
            )));
        }
        for (_, layer) in self.layers.iter_mut() {
            if let Layer::System(node) = layer {
                node.reset_state(batch_size)?;
            }
        }
        Ok(())
    }

    fn children(&self) -> Vec<&Node> {
        self.layers.iter().filter_map(|(_, l)| l.as_node()).collect()
    }

    fn children_mut(&mut self) -> Vec<&mut Node> {
        self.layers
            .iter_mut()
            .filter_map(|(_, l)| match l {
                Layer::System(node) => Some(node.as_mut()),
                Layer::Function(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    /// Stateless node that scales its input
    struct Gain {
        base: NodeBase,
        gain: f64,
    }

    impl Gain {
        fn new(name: &str, gain: f64, registry: &DelayRegistry) -> Self {
            Self {
                base: NodeBase::new("Gain", Some(name), Mode::NonBatching, registry).unwrap(),
                gain,
            }
        }
    }

    impl DynamicalSystem for Gain {
        fn base(&self) -> &NodeBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut NodeBase {
            &mut self.base
        }

        fn update(&mut self, _ctx: &SharedContext, input: Option<&Tensor>) -> Result<Option<Tensor>> {
            Ok(input.map(|x| x * self.gain))
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let registry = DelayRegistry::new();
        let result = Container::new(
            vec![
                Child::node(Gain::new("a", 1.0, &registry)),
                Child::named("a", Gain::new("b", 1.0, &registry)),
            ],
            None,
            Mode::NonBatching,
            &registry,
        );
        assert!(matches!(result, Err(DynError::DuplicateNameError { .. })));

        let result = Network::new(
            vec![Child::List(vec![
                boxed(Gain::new("x", 1.0, &registry)),
                boxed(Gain::new("x", 2.0, &registry)),
            ])],
            None,
            Mode::NonBatching,
            &registry,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_children_keyed_by_name() {
        let registry = DelayRegistry::new();
        let container = Container::new(
            vec![
                Child::List(vec![boxed(Gain::new("g1", 1.0, &registry)), boxed(Gain::new("g2", 2.0, &registry))]),
                Child::Map(vec![("third".to_string(), boxed(Gain::new("g3", 3.0, &registry)))]),
            ],
            Some("box"),
            Mode::NonBatching,
            &registry,
        )
        .unwrap();
        assert_eq!(container.child_map().names(), vec!["g1", "g2", "third"]);
        assert_eq!(container.child::<Gain>("third").unwrap().gain, 3.0);
        assert!(container.get_child("g3").is_none());
    }

    #[test]
    fn test_mode_and_registry_checks() {
        let registry = DelayRegistry::new();
        let other = DelayRegistry::new();
        let result = Container::new(
            vec![Child::node(Gain::new("g", 1.0, &other))],
            None,
            Mode::NonBatching,
            &registry,
        );
        assert!(matches!(result, Err(DynError::ModelBuildError(_))));

        let mut seq = Sequential::new(vec![], None, Mode::NonBatching, &registry).unwrap();
        assert!(matches!(
            seq.push(Layer::system(Gain::new("g", 1.0, &other))),
            Err(DynError::ModelBuildError(_))
        ));
        assert!(seq.is_empty());
        seq.push(Layer::system(Gain::new("g", 1.0, &registry))).unwrap();

        let mut container = Container::new(vec![], None, Mode::Batching, &registry).unwrap();
        assert!(matches!(
            container.add(Child::node(Gain::new("g", 1.0, &registry))),
            Err(DynError::ModeMismatchError { .. })
        ));
    }

    #[test]
    fn test_empty_container_reset_fails() {
        let registry = DelayRegistry::new();
        let mut container = Container::new(vec![], None, Mode::NonBatching, &registry).unwrap();
        assert!(matches!(container.reset_state(None), Err(DynError::NotImplementedError(_))));
    }

    #[test]
    fn test_sequential_pipeline() {
        let registry = DelayRegistry::new();
        let mut seq = Sequential::new(
            vec![
                Layer::system(Gain::new("double", 2.0, &registry)),
                Layer::function("shift", |_, x| Ok(x + 1.0)),
                Layer::system(Gain::new("triple", 3.0, &registry)),
            ],
            None,
            Mode::NonBatching,
            &registry,
        )
        .unwrap();
        let ctx = SharedContext::new();
        let out = seq.update(&ctx, Some(&arr1(&[1.0, 2.0]).into_dyn())).unwrap().unwrap();
        assert_eq!(out, arr1(&[9.0, 15.0]).into_dyn());
        assert!(seq.update(&ctx, None).is_err());
        assert_eq!(seq.children().len(), 2);
        assert_eq!(seq.node::<Gain>("triple").unwrap().gain, 3.0);

        let tail = seq.split_off(1).unwrap();
        assert_eq!(seq.layer_names(), vec!["double"]);
        assert_eq!(tail.layer_names(), vec!["shift", "triple"]);

        let picked = tail.into_select(&[1]).unwrap();
        assert_eq!(picked.layer_names(), vec!["triple"]);
        assert!(picked.into_slice(0..2).is_err());
    }

    #[test]
    fn test_remove_tears_down() {
        let registry = DelayRegistry::new();
        let target = neurodyn_core::Variable::zeros(&[2]);
        let mut owner = Gain::new("owner", 1.0, &registry);
        owner
            .register_delay("owner.x", &neurodyn_delay::DelaySteps::Homo(2), &target, neurodyn_delay::DelayInit::Zeros)
            .unwrap();
        let mut net = Network::new(vec![Child::node(owner)], None, Mode::NonBatching, &registry).unwrap();
        assert!(registry.contains("owner.x"));
        assert!(net.remove("owner"));
        assert!(!registry.contains("owner.x"));
        assert!(!net.remove("owner"));
    }
}
