//! Neuron groups: geometry, group typing and the standard models.

use crate::base::{DynamicalSystem, NodeBase, NodeKind};
use crate::channels::Channel;
use log::{debug, trace, warn};
use ndarray::{Axis, Zip};
use neurodyn_core::{
    batch_shape, size2num, to_size, variable, DynError, Initializer, Mode, NodeId, Result, Shape,
    SharedContext, Tensor, Time, Variable, Voltage,
};
use neurodyn_delay::DelayRegistry;
use neurodyn_integrators::{Drift, IntegrationMethod, Integral};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

// ============================================================================
// GEOMETRY
// ============================================================================

/// Shape of a group of elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    size: Shape,
    keep_size: bool,
}

impl Geometry {
    pub fn new(size: &[usize], keep_size: bool) -> Result<Self> {
        Ok(Self {
            size: to_size(size)?,
            keep_size,
        })
    }

    pub fn size(&self) -> &[usize] {
        &self.size
    }

    /// Number of elements
    pub fn num(&self) -> usize {
        size2num(&self.size)
    }

    /// Shape of per-element state: the full size when `keep_size`, flat
    /// otherwise.
    pub fn varshape(&self) -> Shape {
        if self.keep_size {
            self.size.clone()
        } else {
            vec![self.num()]
        }
    }

    pub fn batch_shape(&self, batch_size: Option<usize>) -> Shape {
        batch_shape(&self.varshape(), batch_size)
    }
}

// ============================================================================
// GROUP TYPES
// ============================================================================

/// Nominal type tag of a neuron group, used to check which channels a group
/// may host.
#[derive(Debug, PartialEq, Eq)]
pub struct GroupType {
    pub name: &'static str,
    pub parent: Option<&'static GroupType>,
}

impl GroupType {
    /// `true` if `self` is `other` or derives from it.
    pub fn is_subtype_of(&self, other: &GroupType) -> bool {
        let mut current = Some(self);
        while let Some(t) = current {
            if t.name == other.name {
                return true;
            }
            current = t.parent;
        }
        false
    }
}

pub static NEU_GROUP: GroupType = GroupType {
    name: "NeuGroup",
    parent: None,
};

pub static COND_NEU_GROUP: GroupType = GroupType {
    name: "CondNeuGroup",
    parent: Some(&NEU_GROUP),
};

/// A population of neurons with named state variables.
pub trait NeuronGroup: DynamicalSystem {
    fn geometry(&self) -> &Geometry;

    fn group_type(&self) -> &'static GroupType {
        &NEU_GROUP
    }

    /// Shared handles to the group's state, by name
    fn variables(&self) -> Vec<(&'static str, Variable)>;

    fn num(&self) -> usize {
        self.geometry().num()
    }

    fn varshape(&self) -> Shape {
        self.geometry().varshape()
    }
}

/// Reference to a neuron group held by synapses: identity plus shared
/// variable handles, never a copy of the state.
#[derive(Debug, Clone)]
pub struct GroupRef {
    pub id: NodeId,
    pub name: String,
    pub group_type: &'static GroupType,
    pub geometry: Geometry,
    vars: Vec<(&'static str, Variable)>,
}

impl GroupRef {
    pub fn of<G: NeuronGroup + ?Sized>(group: &G) -> Self {
        Self {
            id: group.id(),
            name: group.name().to_string(),
            group_type: group.group_type(),
            geometry: group.geometry().clone(),
            vars: group.variables(),
        }
    }

    pub fn num(&self) -> usize {
        self.geometry.num()
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.iter().any(|(n, _)| *n == name)
    }

    pub fn var(&self, name: &str) -> Result<&Variable> {
        self.vars
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| {
                DynError::ModelBuildError(format!("{} does not have the variable `{}`", self.name, name))
            })
    }
}

/// Add driver input into `input`; `x` must broadcast to its shape.
fn add_input(input: &Variable, x: &Tensor, group: &str) -> Result<()> {
    let mut acc = input.value_mut();
    let x = x
        .broadcast(acc.raw_dim())
        .ok_or_else(|| DynError::shape(format!("{} input", group), acc.shape(), x.shape()))?;
    *acc += &x;
    Ok(())
}

pub(crate) fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn threshold_crossing(v_new: &Tensor, v_old: &Tensor, v_th: Voltage) -> Tensor {
    Zip::from(v_new)
        .and(v_old)
        .map_collect(|&new, &old| if new >= v_th && old < v_th { 1.0 } else { 0.0 })
}

// ============================================================================
// CONDUCTANCE-BASED NEURON GROUP
// ============================================================================

/// Parameters of a conductance-based group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondNeuGroupParams {
    pub c: f64,                  // Membrane capacitance (uF/cm^2)
    pub a: f64,                  // Membrane area (cm^2)
    pub v_th: Voltage,           // Spike detection threshold (mV)
    pub v_initializer: Initializer,
    pub noise: Option<f64>,      // Voltage noise intensity
    pub method: IntegrationMethod,
    pub keep_size: bool,
    pub seed: Option<u64>,
}

impl Default for CondNeuGroupParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            a: 1e-3,
            v_th: 0.0,
            v_initializer: Initializer::Uniform { min: -70.0, max: -60.0 },
            noise: None,
            method: IntegrationMethod::ExponentialEuler,
            keep_size: false,
            seed: None,
        }
    }
}

/// Membrane potential integration for [`CondNeuGroup`].
///
/// ```text
/// C dV/dt = input * (1e-3 / A) + sum_k I_k(V)
/// ```
fn integrate_membrane(
    integral: &mut Integral,
    channels: &[(String, Box<dyn Channel>)],
    params: &CondNeuGroupParams,
    input: &Tensor,
    v: &Tensor,
    t: Time,
    dt: Time,
) -> Result<Tensor> {
    let scale = 1e-3 / params.a;
    let c = params.c;
    let drift = |v: &Tensor, _t: Time| {
        let mut current = input * scale;
        for (_, channel) in channels {
            current += &channel.current(v);
        }
        current / c
    };
    match params.noise {
        Some(noise) => {
            let diffusion = |v: &Tensor, _t: Time| Tensor::from_elem(v.raw_dim(), noise / c);
            integral.step(&drift, Some(&diffusion as &Drift<'_>), v, t, dt)
        }
        None => integral.step(&drift, None, v, t, dt),
    }
}

/// Conductance-based neuron group hosting ion channels.
pub struct CondNeuGroup {
    base: NodeBase,
    geometry: Geometry,
    params: CondNeuGroupParams,
    group_type: &'static GroupType,
    pub v: Variable,
    pub spike: Variable,
    pub input: Variable,
    channels: Vec<(String, Box<dyn Channel>)>,
    integral: Integral,
    rng: StdRng,
}

impl CondNeuGroup {
    pub fn new(
        size: &[usize],
        params: CondNeuGroupParams,
        name: Option<&str>,
        mode: Mode,
        delays: &DelayRegistry,
    ) -> Result<Self> {
        let base = NodeBase::new("CondNeuGroup", name, mode, delays)?;
        let geometry = Geometry::new(size, params.keep_size)?;
        let integral = match params.noise {
            None => Integral::ode(params.method)?,
            Some(_) if params.method.supports_sde() => Integral::sde(params.method, params.seed)?,
            Some(_) => {
                warn!(
                    "{}: `{}` cannot integrate voltage noise, using Euler-Maruyama",
                    base.name(),
                    params.method
                );
                Integral::sde(IntegrationMethod::Euler, params.seed)?
            }
        };
        let mut rng = rng_from(params.seed);
        let shape = geometry.batch_shape(mode.initial_batch_size());
        let v = Variable::new(params.v_initializer.generate(&shape, &mut rng)?);
        Ok(Self {
            base,
            geometry,
            params,
            group_type: &COND_NEU_GROUP,
            v,
            spike: Variable::zeros(&shape),
            input: Variable::zeros(&shape),
            channels: Vec::new(),
            integral,
            rng,
        })
    }

    /// Tag this group with a subtype of `CondNeuGroup`.
    pub fn with_group_type(mut self, group_type: &'static GroupType) -> Result<Self> {
        if !group_type.is_subtype_of(&COND_NEU_GROUP) {
            return Err(DynError::TypeMismatchError(format!(
                "{} must derive from {}",
                group_type.name, COND_NEU_GROUP.name
            )));
        }
        self.group_type = group_type;
        Ok(self)
    }

    pub fn params(&self) -> &CondNeuGroupParams {
        &self.params
    }

    /// Attach a channel. Its master type must be this group's type or one
    /// of its ancestors.
    pub fn add_channel(&mut self, name: Option<&str>, mut channel: Box<dyn Channel>) -> Result<()> {
        let name = name.unwrap_or_else(|| channel.name()).to_string();
        let master = channel.master_type();
        if !self.group_type.is_subtype_of(master) {
            return Err(DynError::TypeMismatchError(format!(
                "channel `{}` requires a master of type {}, but {} is a {}",
                name,
                master.name,
                self.name(),
                self.group_type.name
            )));
        }
        if self.channels.iter().any(|(n, _)| *n == name) {
            return Err(DynError::DuplicateNameError {
                container: self.name().to_string(),
                name,
            });
        }
        if channel.num() != self.geometry.num() {
            return Err(DynError::ModelBuildError(format!(
                "channel `{}` has {} elements but {} has {}",
                name,
                channel.num(),
                self.name(),
                self.geometry.num()
            )));
        }
        self.base.check_child(&name, channel.base())?;
        let v = self.v.get();
        let batch_size = (v.ndim() > self.geometry.varshape().len()).then(|| v.shape()[0]);
        channel.reset_with_voltage(&v, batch_size)?;
        debug!("{} attached channel `{}`", self.name(), name);
        self.channels.push((name, channel));
        Ok(())
    }

    pub fn channel(&self, name: &str) -> Option<&dyn Channel> {
        self.channels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.as_ref())
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|(n, _)| n.as_str()).collect()
    }
}

impl DynamicalSystem for CondNeuGroup {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Neuron
    }

    fn update(&mut self, ctx: &SharedContext, input: Option<&Tensor>) -> Result<Option<Tensor>> {
        if let Some(x) = input {
            add_input(&self.input, x, self.base.name())?;
        }
        let (t, dt) = (ctx.t(), ctx.dt());
        let v_old = self.v.get();
        let current = self.input.get();
        let v_new = integrate_membrane(
            &mut self.integral,
            &self.channels,
            &self.params,
            &current,
            &v_old,
            t,
            dt,
        )?;

        for (_, channel) in self.channels.iter_mut() {
            channel.update(ctx, Some(&v_old))?;
        }

        self.spike.set(threshold_crossing(&v_new, &v_old, self.params.v_th))?;
        self.input.fill(0.0);
        self.v.set(v_new)?;
        trace!("{} updated at t={}", self.name(), t);
        Ok(None)
    }

    fn reset_state(&mut self, batch_size: Option<usize>) -> Result<()> {
        let varshape = self.geometry.varshape();
        let v = variable(&self.params.v_initializer, batch_size, &varshape, &mut self.rng)?;
        let shape = batch_shape(&varshape, batch_size);
        self.spike.replace(Tensor::zeros(ndarray::IxDyn(&shape)));
        self.input.replace(Tensor::zeros(ndarray::IxDyn(&shape)));
        for (_, channel) in self.channels.iter_mut() {
            channel.reset_with_voltage(&v, batch_size)?;
        }
        self.v.replace(v);
        Ok(())
    }

    fn children(&self) -> Vec<&crate::base::Node> {
        self.channels.iter().map(|(_, c)| c.as_node()).collect()
    }

    fn children_mut(&mut self) -> Vec<&mut crate::base::Node> {
        self.channels.iter_mut().map(|(_, c)| c.as_node_mut()).collect()
    }
}

impl NeuronGroup for CondNeuGroup {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn group_type(&self) -> &'static GroupType {
        self.group_type
    }

    fn variables(&self) -> Vec<(&'static str, Variable)> {
        vec![
            ("V", self.v.clone()),
            ("spike", self.spike.clone()),
            ("input", self.input.clone()),
        ]
    }
}

// ============================================================================
// LEAKY INTEGRATE-AND-FIRE
// ============================================================================

/// Leaky integrate-and-fire parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifParams {
    pub v_rest: Voltage,        // Resting potential (mV)
    pub v_reset: Voltage,       // Reset potential (mV)
    pub v_th: Voltage,          // Spike threshold (mV)
    pub r: f64,                 // Membrane resistance
    pub tau: Time,              // Membrane time constant (ms)
    pub tau_ref: Option<Time>,  // Refractory period (ms)
    pub v_initializer: Initializer,
    pub method: IntegrationMethod,
    pub keep_size: bool,
}

impl Default for LifParams {
    fn default() -> Self {
        Self {
            v_rest: 0.0,
            v_reset: -5.0,
            v_th: 20.0,
            r: 1.0,
            tau: 10.0,
            tau_ref: None,
            v_initializer: Initializer::zeros(),
            method: IntegrationMethod::ExponentialEuler,
            keep_size: false,
        }
    }
}

/// Leaky integrate-and-fire group
pub struct Lif {
    base: NodeBase,
    geometry: Geometry,
    params: LifParams,
    pub v: Variable,
    pub spike: Variable,
    pub input: Variable,
    pub t_last_spike: Variable,
    pub refractory: Variable,
    integral: Integral,
    rng: StdRng,
}

const NEVER_SPIKED: Time = -1e7;

impl Lif {
    pub fn new(size: &[usize], params: LifParams, name: Option<&str>, mode: Mode, delays: &DelayRegistry) -> Result<Self> {
        let base = NodeBase::new("LIF", name, mode, delays)?;
        let geometry = Geometry::new(size, params.keep_size)?;
        if params.tau <= 0.0 {
            return Err(DynError::invalid_parameter("tau", format!("{} (expected > 0)", params.tau)));
        }
        let integral = Integral::ode(params.method)?;
        let mut rng = StdRng::from_entropy();
        let shape = geometry.batch_shape(mode.initial_batch_size());
        let v = Variable::new(params.v_initializer.generate(&shape, &mut rng)?);
        Ok(Self {
            base,
            geometry,
            params,
            v,
            spike: Variable::zeros(&shape),
            input: Variable::zeros(&shape),
            t_last_spike: Variable::new(Tensor::from_elem(ndarray::IxDyn(&shape), NEVER_SPIKED)),
            refractory: Variable::zeros(&shape),
            integral,
            rng,
        })
    }

    pub fn params(&self) -> &LifParams {
        &self.params
    }
}

impl DynamicalSystem for Lif {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Neuron
    }

    fn update(&mut self, ctx: &SharedContext, input: Option<&Tensor>) -> Result<Option<Tensor>> {
        if let Some(x) = input {
            add_input(&self.input, x, self.base.name())?;
        }
        let (t, dt) = (ctx.t(), ctx.dt());
        let p = &self.params;
        let current = self.input.get();
        let drift = |v: &Tensor, _t: Time| (-v + p.v_rest + &(&current * p.r)) / p.tau;
        let v_old = self.v.get();
        let mut v = self.integral.step(&drift, None, &v_old, t, dt)?;

        if let Some(tau_ref) = p.tau_ref {
            let refractory = self.t_last_spike.value().mapv(|last| if t - last <= tau_ref { 1.0 } else { 0.0 });
            Zip::from(&mut v)
                .and(&v_old)
                .and(&refractory)
                .for_each(|v, &old, &r| {
                    if r > 0.0 {
                        *v = old;
                    }
                });
            self.refractory.set(refractory)?;
        }

        let spike = v.mapv(|x| if x >= p.v_th { 1.0 } else { 0.0 });
        Zip::from(&mut v).and(&spike).for_each(|v, &s| {
            if s > 0.0 {
                *v = p.v_reset;
            }
        });
        {
            let mut last = self.t_last_spike.value_mut();
            Zip::from(&mut *last).and(&spike).for_each(|last, &s| {
                if s > 0.0 {
                    *last = t;
                }
            });
        }
        self.spike.set(spike)?;
        self.v.set(v)?;
        self.input.fill(0.0);
        Ok(None)
    }

    fn reset_state(&mut self, batch_size: Option<usize>) -> Result<()> {
        let varshape = self.geometry.varshape();
        let shape = batch_shape(&varshape, batch_size);
        self.v.replace(variable(&self.params.v_initializer, batch_size, &varshape, &mut self.rng)?);
        self.spike.replace(Tensor::zeros(ndarray::IxDyn(&shape)));
        self.input.replace(Tensor::zeros(ndarray::IxDyn(&shape)));
        self.refractory.replace(Tensor::zeros(ndarray::IxDyn(&shape)));
        self.t_last_spike
            .replace(Tensor::from_elem(ndarray::IxDyn(&shape), NEVER_SPIKED));
        Ok(())
    }
}

impl NeuronGroup for Lif {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn variables(&self) -> Vec<(&'static str, Variable)> {
        vec![
            ("V", self.v.clone()),
            ("spike", self.spike.clone()),
            ("input", self.input.clone()),
            ("t_last_spike", self.t_last_spike.clone()),
            ("refractory", self.refractory.clone()),
        ]
    }
}

// ============================================================================
// SPIKE TIME GENERATOR
// ============================================================================

/// Emits spikes for neuron `indices[k]` at `times[k]`.
pub struct SpikeTimeGroup {
    base: NodeBase,
    geometry: Geometry,
    indices: Vec<usize>,
    times: Vec<Time>,
    cursor: usize,
    pub spike: Variable,
}

impl SpikeTimeGroup {
    pub fn new(
        num: usize,
        indices: Vec<usize>,
        times: Vec<Time>,
        name: Option<&str>,
        mode: Mode,
        delays: &DelayRegistry,
    ) -> Result<Self> {
        let base = NodeBase::new("SpikeTimeGroup", name, mode, delays)?;
        let geometry = Geometry::new(&[num], false)?;
        if indices.len() != times.len() {
            return Err(DynError::ModelBuildError(format!(
                "{}: got {} indices but {} times",
                base.name(),
                indices.len(),
                times.len()
            )));
        }
        if let Some(i) = indices.iter().find(|&&i| i >= num) {
            return Err(DynError::ModelBuildError(format!(
                "{}: index {} out of range for {} neurons",
                base.name(),
                i,
                num
            )));
        }
        let mut events: Vec<(Time, usize)> = times.into_iter().zip(indices).collect();
        events.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (times, indices) = events.into_iter().unzip();
        let shape = geometry.batch_shape(mode.initial_batch_size());
        Ok(Self {
            base,
            geometry,
            indices,
            times,
            cursor: 0,
            spike: Variable::zeros(&shape),
        })
    }
}

impl DynamicalSystem for SpikeTimeGroup {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Neuron
    }

    fn update(&mut self, ctx: &SharedContext, _input: Option<&Tensor>) -> Result<Option<Tensor>> {
        // tolerate rounding in t = t0 + i * dt
        let horizon = ctx.t() + 1e-6 * ctx.dt();
        let mut spike = self.spike.value_mut();
        spike.fill(0.0);
        let last_axis = Axis(spike.ndim() - 1);
        while self.cursor < self.times.len() && self.times[self.cursor] <= horizon {
            spike.index_axis_mut(last_axis, self.indices[self.cursor]).fill(1.0);
            self.cursor += 1;
        }
        Ok(None)
    }

    fn reset_state(&mut self, batch_size: Option<usize>) -> Result<()> {
        self.cursor = 0;
        self.spike
            .replace(Tensor::zeros(ndarray::IxDyn(&self.geometry.batch_shape(batch_size))));
        Ok(())
    }
}

impl NeuronGroup for SpikeTimeGroup {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn variables(&self) -> Vec<(&'static str, Variable)> {
        vec![("spike", self.spike.clone())]
    }
}

// ============================================================================
// ORNSTEIN-UHLENBECK NOISE
// ============================================================================

/// Ornstein-Uhlenbeck process parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuParams {
    pub mean: f64,
    pub sigma: f64,
    pub tau: Time,  // Time constant (ms)
    pub method: IntegrationMethod,
    pub keep_size: bool,
    pub seed: Option<u64>,
}

impl Default for OuParams {
    fn default() -> Self {
        Self {
            mean: 0.0,
            sigma: 1.0,
            tau: 10.0,
            method: IntegrationMethod::Euler,
            keep_size: false,
            seed: None,
        }
    }
}

/// `dx = (mean - x) / tau dt + sigma dW`
pub struct OuProcess {
    base: NodeBase,
    geometry: Geometry,
    params: OuParams,
    pub x: Variable,
    integral: Integral,
}

impl OuProcess {
    pub fn new(size: &[usize], params: OuParams, name: Option<&str>, mode: Mode, delays: &DelayRegistry) -> Result<Self> {
        let base = NodeBase::new("OUProcess", name, mode, delays)?;
        let geometry = Geometry::new(size, params.keep_size)?;
        let integral = Integral::sde(params.method, params.seed)?;
        let shape = geometry.batch_shape(mode.initial_batch_size());
        let x = Variable::new(Tensor::from_elem(ndarray::IxDyn(&shape), params.mean));
        Ok(Self {
            base,
            geometry,
            params,
            x,
            integral,
        })
    }
}

impl DynamicalSystem for OuProcess {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Neuron
    }

    fn update(&mut self, ctx: &SharedContext, _input: Option<&Tensor>) -> Result<Option<Tensor>> {
        let p = &self.params;
        let f = |x: &Tensor, _t: Time| x.mapv(|x| (p.mean - x) / p.tau);
        let g = |x: &Tensor, _t: Time| Tensor::from_elem(x.raw_dim(), p.sigma);
        let x = self.integral.step(&f, Some(&g as &Drift<'_>), &self.x.get(), ctx.t(), ctx.dt())?;
        self.x.set(x.clone())?;
        Ok(Some(x))
    }

    fn reset_state(&mut self, batch_size: Option<usize>) -> Result<()> {
        let shape = self.geometry.batch_shape(batch_size);
        self.x
            .replace(Tensor::from_elem(ndarray::IxDyn(&shape), self.params.mean));
        Ok(())
    }
}

impl NeuronGroup for OuProcess {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn variables(&self) -> Vec<(&'static str, Variable)> {
        vec![("x", self.x.clone())]
    }
}
