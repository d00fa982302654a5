//! # Neurodyn Core
//!
//! Shared types and utilities for composing neural dynamical systems.
//!
//! ## Contents
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`DynError`] | Error type shared by every neurodyn crate |
//! | [`Mode`] | Computation mode tag (non-batching, batching, training) |
//! | [`Variable`] | Shared mutable state tensor |
//! | [`Initializer`] / [`Param`] | Parameter and state initialization |
//! | [`SharedContext`] | Per-tick time, step size, iteration and named scalars |
//! | [`IonChannel`] | Hodgkin-Huxley style channel descriptions |
//! | [`TimeSeries`] | Recorded trajectories |

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum DynError {
    #[error("Model build error: {0}")]
    ModelBuildError(String),

    #[error("Duplicate name `{name}` in {container}")]
    DuplicateNameError { container: String, name: String },

    #[error("Not implemented: {0}")]
    NotImplementedError(String),

    #[error("Delay `{0}` is not defined in delay variables")]
    UnknownDelayError(String),

    #[error("Invalid delay steps for `{key}`: {reason}")]
    DelayStepError { key: String, reason: String },

    #[error("Shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeError {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Type mismatch: {0}")]
    TypeMismatchError(String),

    #[error("Mode mismatch: {node} runs in {mode} mode but {container} is {container_mode}")]
    ModeMismatchError {
        node: String,
        mode: Mode,
        container: String,
        container_mode: Mode,
    },

    #[error("Shared data `{0}` not found")]
    MissingSharedError(String),

    #[error("Invalid parameter {parameter}: {reason}")]
    InvalidParameterError { parameter: String, reason: String },

    #[error("Numerical error: {0}")]
    NumericalError(String),

    #[error("Config error: {0}")]
    ConfigError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DynError {
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameterError {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    pub fn shape(context: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeError {
            context: context.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DynError>;

/// Time point (ms)
pub type Time = f64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current (uA/cm^2 for conductance-based groups)
pub type Current = f64;

/// Conductance (mS/cm^2)
pub type Conductance = f64;

/// Dense n-dimensional state or parameter data
pub type Tensor = ArrayD<f64>;

/// Geometry of a group of elements
pub type Shape = Vec<usize>;

// ============================================================================
// COMPUTATION MODES
// ============================================================================

/// Batch size a batching node starts with before its first `reset_state`.
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// Computation mode attached to every node at construction.
///
/// `Training` is a refinement of `Batching`: training nodes carry a leading
/// batch axis and additionally mark their parameters trainable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    NonBatching,
    Batching,
    Training,
}

impl Mode {
    pub fn is_batching(&self) -> bool {
        matches!(self, Self::Batching | Self::Training)
    }

    pub fn is_training(&self) -> bool {
        matches!(self, Self::Training)
    }

    /// `true` when a value of this mode may stand in wherever `other` is
    /// expected.
    pub fn is_a(&self, other: Mode) -> bool {
        match (self, other) {
            (a, b) if *a == b => true,
            (Self::Training, Self::Batching) => true,
            _ => false,
        }
    }

    /// A node of this mode can live inside a container of `container` mode.
    pub fn is_compatible_with(&self, container: Mode) -> bool {
        container.is_a(*self)
    }

    /// Batch size used for state created at construction time.
    pub fn initial_batch_size(&self) -> Option<usize> {
        if self.is_batching() {
            Some(DEFAULT_BATCH_SIZE)
        } else {
            None
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonBatching => write!(f, "non-batching"),
            Self::Batching => write!(f, "batching"),
            Self::Training => write!(f, "training"),
        }
    }
}

// ============================================================================
// NODE IDENTITY
// ============================================================================

/// Process-unique node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

impl NodeId {
    pub fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default name for an unnamed node, e.g. `CondNeuGroup12`.
pub fn unique_name(type_name: &str, id: NodeId) -> String {
    format!("{}{}", type_name, id.0)
}

// ============================================================================
// GEOMETRY HELPERS
// ============================================================================

/// Validate a group size.
pub fn to_size(size: &[usize]) -> Result<Shape> {
    if size.is_empty() {
        return Err(DynError::ModelBuildError(
            "size must be an int or a non-empty sequence of ints, but we got an empty sequence".into(),
        ));
    }
    if size.contains(&0) {
        return Err(DynError::ModelBuildError(format!(
            "size must not contain zero-length axes, but we got {:?}",
            size
        )));
    }
    Ok(size.to_vec())
}

/// Flattened number of elements of a geometry.
pub fn size2num(size: &[usize]) -> usize {
    size.iter().product()
}

/// Prepend an optional batch axis to a variable shape.
pub fn batch_shape(varshape: &[usize], batch_size: Option<usize>) -> Shape {
    match batch_size {
        Some(b) => std::iter::once(b).chain(varshape.iter().copied()).collect(),
        None => varshape.to_vec(),
    }
}

// ============================================================================
// VARIABLES
// ============================================================================

/// Shared mutable state tensor.
///
/// Clones are handles to the same storage, so a delay buffer or a synapse can
/// observe a neuron group's state without copying it. Reassigning the value
/// keeps every handle pointing at the new data.
#[derive(Debug, Clone)]
pub struct Variable {
    value: Rc<RefCell<Tensor>>,
}

impl Variable {
    pub fn new(value: Tensor) -> Self {
        Self {
            value: Rc::new(RefCell::new(value)),
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::new(Tensor::zeros(IxDyn(shape)))
    }

    pub fn value(&self) -> Ref<'_, Tensor> {
        self.value.borrow()
    }

    pub fn value_mut(&self) -> RefMut<'_, Tensor> {
        self.value.borrow_mut()
    }

    /// Owned copy of the current value
    pub fn get(&self) -> Tensor {
        self.value.borrow().clone()
    }

    /// In-place replacement keeping the shape.
    pub fn set(&self, value: Tensor) -> Result<()> {
        let current = self.shape();
        if value.shape() != current.as_slice() {
            return Err(DynError::shape("variable assignment", &current, value.shape()));
        }
        *self.value.borrow_mut() = value;
        Ok(())
    }

    /// Replacement that may change the shape (used when resetting with a new
    /// batch size).
    pub fn replace(&self, value: Tensor) {
        *self.value.borrow_mut() = value;
    }

    pub fn fill(&self, x: f64) {
        self.value.borrow_mut().fill(x);
    }

    pub fn shape(&self) -> Shape {
        self.value.borrow().shape().to_vec()
    }

    pub fn len(&self) -> usize {
        self.value.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.borrow().is_empty()
    }

    /// Whether two handles share the same storage
    pub fn ptr_eq(&self, other: &Variable) -> bool {
        Rc::ptr_eq(&self.value, &other.value)
    }
}

// ============================================================================
// INITIALIZERS
// ============================================================================

/// Sample from the standard normal distribution (Box-Muller).
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Initialization rule for parameters and state variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    Constant(f64),
    Uniform { min: f64, max: f64 },
    Normal { mean: f64, std: f64 },
    Lognormal { mu: f64, sigma: f64 },
    /// Explicit data, broadcast to the requested shape
    Tensor(Tensor),
}

impl Default for Initializer {
    fn default() -> Self {
        Self::Constant(0.0)
    }
}

impl Initializer {
    pub fn zeros() -> Self {
        Self::Constant(0.0)
    }

    pub fn generate<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Result<Tensor> {
        let dim = IxDyn(shape);
        let data = match self {
            Self::Constant(c) => Tensor::from_elem(dim, *c),
            Self::Uniform { min, max } => {
                if max < min {
                    return Err(DynError::invalid_parameter(
                        "Uniform",
                        format!("max ({}) must not be below min ({})", max, min),
                    ));
                }
                Tensor::from_shape_fn(dim, |_| min + (max - min) * rng.gen::<f64>())
            }
            Self::Normal { mean, std } => {
                Tensor::from_shape_fn(dim, |_| mean + std * standard_normal(&mut *rng))
            }
            Self::Lognormal { mu, sigma } => {
                Tensor::from_shape_fn(dim, |_| (mu + sigma * standard_normal(&mut *rng)).exp())
            }
            Self::Tensor(t) => t
                .broadcast(dim)
                .ok_or_else(|| DynError::shape("initializer broadcast", shape, t.shape()))?
                .to_owned(),
        };
        Ok(data)
    }
}

/// Parameter value: a scalar stays a scalar, anything else becomes a tensor
/// of the requested shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Param {
    Scalar(f64),
    Tensor(Tensor),
}

impl Param {
    pub fn ndim(&self) -> usize {
        match self {
            Self::Scalar(_) => 0,
            Self::Tensor(t) => t.ndim(),
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Tensor(t) if t.ndim() == 0 => t.iter().next().copied(),
            Self::Tensor(_) => None,
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Self::Scalar(_) => Vec::new(),
            Self::Tensor(t) => t.shape().to_vec(),
        }
    }

    /// Materialize at `shape`.
    pub fn to_tensor(&self, shape: &[usize]) -> Result<Tensor> {
        match self {
            Self::Scalar(v) => Ok(Tensor::from_elem(IxDyn(shape), *v)),
            Self::Tensor(t) => Ok(t
                .broadcast(IxDyn(shape))
                .ok_or_else(|| DynError::shape("parameter broadcast", shape, t.shape()))?
                .to_owned()),
        }
    }
}

/// Build a parameter of `shape` from an initializer.
pub fn parameter<R: Rng + ?Sized>(init: &Initializer, shape: &[usize], rng: &mut R) -> Result<Param> {
    match init {
        Initializer::Constant(c) => Ok(Param::Scalar(*c)),
        other => Ok(Param::Tensor(other.generate(shape, rng)?)),
    }
}

/// Build state data for `varshape` with an optional leading batch axis.
pub fn variable<R: Rng + ?Sized>(
    init: &Initializer,
    batch_size: Option<usize>,
    varshape: &[usize],
    rng: &mut R,
) -> Result<Tensor> {
    init.generate(&batch_shape(varshape, batch_size), rng)
}

/// Parse a model parameter struct from JSON.
pub fn params_from_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

// ============================================================================
// SHARED CONTEXT
// ============================================================================

/// Step size used when neither the context nor the configuration sets one.
pub const DEFAULT_DT: Time = 0.1;

// 0 means "unset"; a zero step size is never valid.
static GLOBAL_DT_BITS: AtomicU64 = AtomicU64::new(0);

/// Process-wide default step size.
pub fn get_dt() -> Time {
    match GLOBAL_DT_BITS.load(Ordering::Relaxed) {
        0 => DEFAULT_DT,
        bits => f64::from_bits(bits),
    }
}

/// Set the process-wide default step size.
pub fn set_dt(dt: Time) -> Result<()> {
    validate_dt(dt)?;
    GLOBAL_DT_BITS.store(dt.to_bits(), Ordering::Relaxed);
    Ok(())
}

fn validate_dt(dt: Time) -> Result<()> {
    if !(dt.is_finite() && dt > 0.0) {
        return Err(DynError::invalid_parameter("dt", format!("{} (expected > 0)", dt)));
    }
    Ok(())
}

/// Run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Integration step (ms); `None` falls back to the process default
    pub dt: Option<Time>,
    /// Time of tick 0 (ms)
    pub t0: Time,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { dt: None, t0: 0.0 }
    }
}

impl ContextConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(dt) = self.dt {
            validate_dt(dt)?;
        }
        if !self.t0.is_finite() {
            return Err(DynError::invalid_parameter("t0", format!("{} (expected finite)", self.t0)));
        }
        Ok(())
    }
}

/// Data shared by every node during one update pass.
///
/// The driver advances the context once per tick before calling `update` on
/// the root node; nodes only read it. Call [`SharedContext::clear`] between
/// independent runs so named scalars do not leak across them.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    t: Time,
    t0: Time,
    dt: Option<Time>,
    i: u64,
    arguments: HashMap<String, f64>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ContextConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            t: config.t0,
            t0: config.t0,
            dt: config.dt,
            ..Self::default()
        })
    }

    /// Current time
    pub fn t(&self) -> Time {
        self.t
    }

    /// Current iteration index
    pub fn i(&self) -> u64 {
        self.i
    }

    /// Step size, falling back to the process default
    pub fn dt(&self) -> Time {
        self.dt.unwrap_or_else(get_dt)
    }

    pub fn set_dt(&mut self, dt: Time) -> Result<()> {
        validate_dt(dt)?;
        self.dt = Some(dt);
        Ok(())
    }

    pub fn set_time(&mut self, t: Time) {
        self.t = t;
    }

    pub fn set_index(&mut self, i: u64) {
        self.i = i;
    }

    /// Move to iteration `i` with `t = t0 + i * dt`.
    pub fn tick(&mut self, i: u64) {
        self.i = i;
        self.t = self.t0 + i as f64 * self.dt();
    }

    /// Look up a shared value; `t`, `dt` and `i` are always defined.
    pub fn load(&self, key: &str) -> Result<f64> {
        match key {
            "t" => Ok(self.t),
            "dt" => Ok(self.dt()),
            "i" => Ok(self.i as f64),
            _ => self
                .arguments
                .get(key)
                .copied()
                .ok_or_else(|| DynError::MissingSharedError(key.to_string())),
        }
    }

    pub fn load_or(&self, key: &str, default: f64) -> f64 {
        self.load(key).unwrap_or(default)
    }

    pub fn save(&mut self, key: impl Into<String>, value: f64) {
        self.arguments.insert(key.into(), value);
    }

    /// Copy of the named scalars
    pub fn shared_args(&self) -> HashMap<String, f64> {
        self.arguments.clone()
    }

    /// Remove the given named scalars, or all of them when `keys` is empty.
    pub fn clear_shared(&mut self, keys: &[&str]) {
        if keys.is_empty() {
            self.arguments.clear();
        } else {
            for key in keys {
                self.arguments.remove(*key);
            }
        }
    }

    /// Forget everything recorded in this context.
    pub fn clear(&mut self) {
        self.arguments.clear();
        self.dt = None;
        self.i = 0;
        self.t = self.t0;
    }
}

// ============================================================================
// ION CHANNEL DESCRIPTIONS
// ============================================================================

/// Ion channel model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IonChannel {
    /// Channel name
    pub name: String,
    /// Maximum conductance (mS/cm^2)
    pub g_max: Conductance,
    /// Reversal potential (mV)
    pub e_rev: Voltage,
    /// Gate variables
    pub gates: Vec<GateVariable>,
}

impl IonChannel {
    /// Hodgkin-Huxley sodium channel (m^3 h)
    pub fn hh_sodium() -> Self {
        Self {
            name: "INa".into(),
            g_max: 120.0,
            e_rev: 50.0,
            gates: vec![
                GateVariable {
                    name: "m".into(),
                    power: 3,
                    alpha: RateFunction::HodgkinHuxley { a: -0.1, b: 40.0, c: -10.0 },
                    beta: RateFunction::Exponential { a: 4.0, b: 65.0, c: -18.0 },
                },
                GateVariable {
                    name: "h".into(),
                    power: 1,
                    alpha: RateFunction::Exponential { a: 0.07, b: 65.0, c: -20.0 },
                    beta: RateFunction::Sigmoid { a: 1.0, b: 35.0, c: -10.0 },
                },
            ],
        }
    }

    /// Hodgkin-Huxley delayed-rectifier potassium channel (n^4)
    pub fn hh_potassium() -> Self {
        Self {
            name: "IK".into(),
            g_max: 36.0,
            e_rev: -77.0,
            gates: vec![GateVariable {
                name: "n".into(),
                power: 4,
                alpha: RateFunction::HodgkinHuxley { a: -0.01, b: 55.0, c: -10.0 },
                beta: RateFunction::Exponential { a: 0.125, b: 65.0, c: -80.0 },
            }],
        }
    }
}

/// Gate variable (e.g., m, h, n in Hodgkin-Huxley)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVariable {
    /// Variable name
    pub name: String,
    /// Power (exponent in gating)
    pub power: u32,
    /// Opening rate
    pub alpha: RateFunction,
    /// Closing rate
    pub beta: RateFunction,
}

impl GateVariable {
    /// Steady-state open fraction at `v`
    pub fn steady_state(&self, v: Voltage) -> f64 {
        let a = self.alpha.eval(v);
        a / (a + self.beta.eval(v))
    }

    /// dx/dt = phi * (alpha (1 - x) - beta x)
    pub fn derivative(&self, x: f64, v: Voltage, phi: f64) -> f64 {
        phi * (self.alpha.eval(v) * (1.0 - x) - self.beta.eval(v) * x)
    }
}

/// Rate function type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RateFunction {
    /// Standard HH form: A*(V+B)/(exp((V+B)/C)-1)
    HodgkinHuxley { a: f64, b: f64, c: f64 },
    /// Exponential: A*exp((V+B)/C)
    Exponential { a: f64, b: f64, c: f64 },
    /// Sigmoid: A/(1+exp((V+B)/C))
    Sigmoid { a: f64, b: f64, c: f64 },
    /// Linear: A*(V+B)
    Linear { a: f64, b: f64 },
    /// Constant
    Constant(f64),
}

impl RateFunction {
    /// Evaluate rate at given voltage
    pub fn eval(&self, v: Voltage) -> f64 {
        match self {
            Self::HodgkinHuxley { a, b, c } => {
                let x = (v + b) / c;
                if x.abs() < 1e-6 {
                    // removable singularity at V = -B
                    a * c
                } else {
                    a * (v + b) / (x.exp() - 1.0)
                }
            }
            Self::Exponential { a, b, c } => a * ((v + b) / c).exp(),
            Self::Sigmoid { a, b, c } => a / (1.0 + ((v + b) / c).exp()),
            Self::Linear { a, b } => a * (v + b),
            Self::Constant(c) => *c,
        }
    }
}

// ============================================================================
// RECORDING
// ============================================================================

/// Time series data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
    /// Units
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    /// Record element `index` (flat, row-major) of a variable at the
    /// context's current time.
    pub fn record(&mut self, ctx: &SharedContext, var: &Variable, index: usize) -> Result<()> {
        let value = var.value();
        let v = value.iter().nth(index).copied().ok_or_else(|| {
            DynError::invalid_parameter(
                "index",
                format!("{} out of range for `{}` with {} elements", index, self.name, value.len()),
            )
        })?;
        self.push(ctx.t(), v);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}
