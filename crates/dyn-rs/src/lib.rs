//! # Neurodyn Dyn
//!
//! Composable neural dynamical systems.
//!
//! ## Building blocks
//!
//! 1. **Nodes**: every stateful unit implements [`DynamicalSystem`] and
//!    embeds a [`NodeBase`] (identity, mode, delay bookkeeping)
//! 2. **Composites**: [`Container`], [`Network`] and [`Sequential`] own
//!    named children and decide their update order
//! 3. **Neuron groups**: [`CondNeuGroup`] with pluggable [`Channel`]s,
//!    [`Lif`], [`SpikeTimeGroup`], [`OuProcess`]
//! 4. **Synapses**: [`DeltaSynapse`], [`ExpSynapse`] built on
//!    [`TwoEndConn`] with output, STP and LTP components
//!
//! ## Tick semantics
//!
//! The driver owns a [`SharedContext`](neurodyn_core::SharedContext) and a
//! [`DelayRegistry`](neurodyn_delay::DelayRegistry). Per tick it calls
//! `ctx.tick(i)` and then `update` on the root node. A [`Network`] runs
//! synapses, then neurons, then everything else, and finally records the
//! current value of every delay buffer its children own.
//!
//! ```ignore
//! let delays = DelayRegistry::new();
//! let pre = SpikeTimeGroup::new(4, vec![0], vec![0.5], Some("pre"), Mode::NonBatching, &delays)?;
//! let post = Lif::new(&[4], LifParams::default(), Some("post"), Mode::NonBatching, &delays)?;
//! let syn = DeltaSynapse::new(&pre, &post, Connector::OneToOne, Default::default(), None, Mode::NonBatching, &delays)?;
//! let mut net = Network::new(
//!     vec![Child::node(pre), Child::node(post), Child::node(syn)],
//!     Some("net"),
//!     Mode::NonBatching,
//!     &delays,
//! )?;
//! let mut ctx = SharedContext::new();
//! for i in 0..100 {
//!     ctx.tick(i);
//!     net.update(&ctx, None)?;
//! }
//! ```

pub mod base;
pub mod channels;
pub mod container;
pub mod neurons;
pub mod synapses;

pub use base::{AsNode, DynamicalSystem, Node, NodeBase, NodeKind};
pub use channels::{Channel, GatedChannel, LeakChannel};
pub use container::{boxed, Child, ChildMap, Container, FnLayer, Layer, Network, Sequential};
pub use neurons::{
    CondNeuGroup, CondNeuGroupParams, Geometry, GroupRef, GroupType, Lif, LifParams, NeuronGroup, OuParams,
    OuProcess, SpikeTimeGroup, COND_NEU_GROUP, NEU_GROUP,
};
pub use synapses::{
    CobaOutput, CompMethod, ConnInput, ConnMask, ConnSpec, CubaOutput, DeltaSynapse, DeltaSynapseParams,
    ExpSynapse, ExpSynapseParams, MasterSlot, SparseFormat, StdpParams, StpParams, SynComponent, SynConn, SynLtp,
    SynOutput, SynStp, TraceStdp, TsodyksMarkram, TwoEndConn, Weight,
};
