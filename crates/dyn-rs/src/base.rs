//! Node abstraction shared by every dynamical system.

use log::debug;
use neurodyn_core::{unique_name, DynError, Mode, NodeId, Result, SharedContext, Tensor, Variable};
use neurodyn_delay::{DelayInit, DelayRegistry, DelaySteps, NormalizedSteps};
use std::any::Any;

/// Trait object of any dynamical system
pub type Node = dyn DynamicalSystem;

/// Role of a node in a network's update order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Neuron,
    Synapse,
    Channel,
    Container,
    Other,
}

/// Upcasting and downcasting helpers, implemented for every
/// [`DynamicalSystem`].
pub trait AsNode {
    fn as_node(&self) -> &Node;
    fn as_node_mut(&mut self) -> &mut Node;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: DynamicalSystem> AsNode for T {
    fn as_node(&self) -> &Node {
        self
    }

    fn as_node_mut(&mut self) -> &mut Node {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A stateful unit advanced once per tick.
///
/// `update` reads the shared context and may only touch its own state, the
/// delay buffers it registered, and the shared variables it was handed at
/// construction. Composite nodes decide the order in which their children
/// run.
pub trait DynamicalSystem: AsNode + 'static {
    fn base(&self) -> &NodeBase;

    fn base_mut(&mut self) -> &mut NodeBase;

    fn kind(&self) -> NodeKind {
        NodeKind::Other
    }

    /// Advance by one tick.
    fn update(&mut self, _ctx: &SharedContext, _input: Option<&Tensor>) -> Result<Option<Tensor>> {
        Err(DynError::NotImplementedError(format!(
            "subclass must implement `update` ({})",
            self.name()
        )))
    }

    /// Reinitialize owned state. `None` gives unbatched shapes.
    fn reset_state(&mut self, _batch_size: Option<usize>) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self, batch_size: Option<usize>) -> Result<()> {
        self.reset_state(batch_size)
    }

    fn children(&self) -> Vec<&Node> {
        Vec::new()
    }

    fn children_mut(&mut self) -> Vec<&mut Node> {
        Vec::new()
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn id(&self) -> NodeId {
        self.base().id()
    }

    fn mode(&self) -> Mode {
        self.base().mode()
    }

    fn register_delay(
        &mut self,
        key: &str,
        steps: &DelaySteps,
        target: &Variable,
        init: DelayInit,
    ) -> Result<NormalizedSteps> {
        self.base_mut().register_delay(key, steps, target, init)
    }

    fn get_delay_data(&self, key: &str, steps: &NormalizedSteps, indices: &[usize]) -> Result<Tensor> {
        self.base().get_delay_data(key, steps, indices)
    }

    /// Delay keys a parent network refreshes after each tick on behalf of
    /// this node.
    fn collect_local_delays(&self, out: &mut Vec<String>) {
        out.extend(self.base().local_delays().iter().cloned());
        for child in self.children() {
            child.collect_local_delays(out);
        }
    }

    /// Delay keys some network inside this node already refreshes.
    fn collect_refreshed_delays(&self, out: &mut Vec<String>) {
        for child in self.children() {
            child.collect_refreshed_delays(out);
        }
    }

    /// Release owned delay buffers, children first.
    fn teardown(&mut self) {
        for child in self.children_mut() {
            child.teardown();
        }
        self.base_mut().release_delays();
    }
}

impl dyn DynamicalSystem {
    pub fn is<T: DynamicalSystem>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: DynamicalSystem>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: DynamicalSystem>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Identity, mode and delay bookkeeping embedded in every node.
#[derive(Debug)]
pub struct NodeBase {
    id: NodeId,
    name: String,
    mode: Mode,
    delays: DelayRegistry,
    local_delays: Vec<String>,
}

impl NodeBase {
    /// `type_name` names the node when `name` is `None`.
    pub fn new(type_name: &str, name: Option<&str>, mode: Mode, delays: &DelayRegistry) -> Result<Self> {
        let id = NodeId::next();
        let name = match name {
            Some("") => {
                return Err(DynError::ModelBuildError(format!(
                    "{} name must not be empty",
                    type_name
                )))
            }
            Some(name) => name.to_string(),
            None => unique_name(type_name, id),
        };
        Ok(Self {
            id,
            name,
            mode,
            delays: delays.clone(),
            local_delays: Vec::new(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn delays(&self) -> &DelayRegistry {
        &self.delays
    }

    /// Keys this node holds in the registry
    pub fn local_delays(&self) -> &[String] {
        &self.local_delays
    }

    pub fn register_delay(
        &mut self,
        key: &str,
        steps: &DelaySteps,
        target: &Variable,
        init: DelayInit,
    ) -> Result<NormalizedSteps> {
        let (normalized, outcome) = self.delays.register(self.id, key, steps, target, init)?;
        if !self.local_delays.iter().any(|k| k == key) {
            debug!("{} holds delay `{}` ({:?})", self.name, key, outcome);
            self.local_delays.push(key.to_string());
        }
        Ok(normalized)
    }

    pub fn get_delay_data(&self, key: &str, steps: &NormalizedSteps, indices: &[usize]) -> Result<Tensor> {
        self.delays.retrieve(key, steps, indices)
    }

    pub fn update_local_delays(&self) -> Result<()> {
        self.delays.refresh(&self.local_delays)
    }

    pub fn reset_local_delays(&self) -> Result<()> {
        self.delays.reset(&self.local_delays)
    }

    pub fn release_delays(&mut self) {
        if !self.local_delays.is_empty() {
            debug!("{} releases {} delay(s)", self.name, self.local_delays.len());
            self.delays.release(self.id, &self.local_delays);
            self.local_delays.clear();
        }
    }

    /// Error unless `child` may live inside this node under `child_name`:
    /// its mode must be compatible and it must share this node's delay
    /// registry.
    pub fn check_child(&self, child_name: &str, child: &NodeBase) -> Result<()> {
        self.check_child_mode(child_name, child.mode)?;
        if !child.delays.same_as(&self.delays) {
            return Err(DynError::ModelBuildError(format!(
                "{} was built against a different delay registry than {}",
                child_name, self.name
            )));
        }
        Ok(())
    }

    /// Error unless a node of `child` mode may live inside this node.
    pub fn check_child_mode(&self, child_name: &str, child: Mode) -> Result<()> {
        if child.is_compatible_with(self.mode) {
            Ok(())
        } else {
            Err(DynError::ModeMismatchError {
                node: child_name.to_string(),
                mode: child,
                container: self.name.clone(),
                container_mode: self.mode,
            })
        }
    }
}

impl Drop for NodeBase {
    fn drop(&mut self) {
        self.release_delays();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, IxDyn};

    struct Leaf {
        base: NodeBase,
    }

    impl DynamicalSystem for Leaf {
        fn base(&self) -> &NodeBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut NodeBase {
            &mut self.base
        }
    }

    fn leaf(name: Option<&str>, registry: &DelayRegistry) -> Leaf {
        Leaf {
            base: NodeBase::new("Leaf", name, Mode::NonBatching, registry).unwrap(),
        }
    }

    #[test]
    fn test_default_update_is_not_implemented() {
        let registry = DelayRegistry::new();
        let mut node = leaf(None, &registry);
        let ctx = SharedContext::new();
        assert!(matches!(node.update(&ctx, None), Err(DynError::NotImplementedError(_))));
        assert!(node.reset_state(Some(4)).is_ok());
    }

    #[test]
    fn test_generated_names_are_unique() {
        let registry = DelayRegistry::new();
        let a = leaf(None, &registry);
        let b = leaf(None, &registry);
        assert!(a.name().starts_with("Leaf"));
        assert_ne!(a.name(), b.name());
        assert!(NodeBase::new("Leaf", Some(""), Mode::NonBatching, &registry).is_err());
    }

    #[test]
    fn test_delay_ownership_and_teardown() {
        let registry = DelayRegistry::new();
        let target = Variable::new(arr1(&[1.0, 2.0]).into_dyn());
        let mut owner = leaf(Some("owner"), &registry);
        let mut reader = leaf(Some("reader"), &registry);

        let steps = owner
            .register_delay("x", &DelaySteps::Homo(2), &target, DelayInit::Zeros)
            .unwrap();
        reader
            .register_delay("x", &DelaySteps::Homo(1), &target, DelayInit::Zeros)
            .unwrap();
        assert_eq!(owner.base().local_delays(), &["x".to_string()]);
        assert_eq!(reader.base().local_delays(), &["x".to_string()]);
        assert_eq!(registry.holders("x"), 2);

        target.fill(5.0);
        owner.base().update_local_delays().unwrap();
        let old = reader.get_delay_data("x", &steps, &[]).unwrap();
        assert_eq!(old, Tensor::zeros(IxDyn(&[2])));
        let last = reader.get_delay_data("x", &NormalizedSteps::Homo(1), &[1]).unwrap();
        assert_eq!(last, arr1(&[2.0]).into_dyn());

        owner.teardown();
        assert!(registry.contains("x"));
        assert_eq!(reader.get_delay_data("x", &steps, &[]).unwrap(), Tensor::zeros(IxDyn(&[2])));
        reader.teardown();
        assert!(!registry.contains("x"));
    }

    #[test]
    fn test_drop_releases_delays() {
        let registry = DelayRegistry::new();
        let target = Variable::zeros(&[3]);
        {
            let mut node = leaf(None, &registry);
            node.register_delay("y", &DelaySteps::Homo(1), &target, DelayInit::Zeros)
                .unwrap();
            assert!(registry.contains("y"));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_downcast() {
        let registry = DelayRegistry::new();
        let node: Box<Node> = Box::new(leaf(None, &registry));
        assert!(node.is::<Leaf>());
        assert!(node.downcast_ref::<Leaf>().is_some());
    }
}
