//! # Delay Buffers
//!
//! Fixed-capacity circular histories ("length delays") of state tensors,
//! and the keyed registry through which nodes share them.
//!
//! A buffer registered under a key mirrors one target [`Variable`]. Every
//! consumer of the same delayed signal registers against the same key and
//! reuses the one buffer; the registry grows it when a consumer needs a
//! longer history and never shrinks it.
//!
//! ```text
//! lag:     0        1        2   ...   max
//!        newest                        oldest
//! ```

use log::{debug, trace, warn};
use ndarray::{Array1, ArrayD, ArrayViewD, Axis, IxDyn};
use neurodyn_core::{DynError, Initializer, NodeId, Result, Shape, Tensor, Variable};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

// ============================================================================
// DELAY STEPS
// ============================================================================

/// Step tensor as supplied by a caller, before dtype validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepTensor {
    Int(ArrayD<i64>),
    Float(ArrayD<f64>),
}

/// Requested delay length, in steps
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum DelaySteps {
    /// No delay: reads go straight to the target
    #[default]
    None,
    /// Same delay for every element
    Homo(i64),
    /// One delay per element along the target's leading axis
    Heter(StepTensor),
    /// Per-element delays drawn from an initializer over the target's
    /// leading axis; every drawn value must be a non-negative integer
    Generated { init: Initializer, seed: Option<u64> },
}

impl From<i64> for DelaySteps {
    fn from(steps: i64) -> Self {
        Self::Homo(steps)
    }
}

impl From<Option<i64>> for DelaySteps {
    fn from(steps: Option<i64>) -> Self {
        steps.map_or(Self::None, Self::Homo)
    }
}

/// Validated delay specification returned by registration and used for
/// later reads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NormalizedSteps {
    #[default]
    None,
    Homo(usize),
    Heter(Array1<usize>),
}

impl NormalizedSteps {
    /// Longest lag this specification reads.
    pub fn max_step(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Homo(s) => *s,
            Self::Heter(steps) => steps.iter().copied().max().unwrap_or(0),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

fn step_error(key: &str, reason: impl Into<String>) -> DynError {
    DynError::DelayStepError {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn non_negative(key: &str, step: i64) -> Result<usize> {
    usize::try_from(step).map_err(|_| step_error(key, format!("delay steps must be non-negative, got {}", step)))
}

fn leading_axis(key: &str, target_shape: &[usize]) -> Result<usize> {
    target_shape
        .first()
        .copied()
        .ok_or_else(|| step_error(key, "heterogeneous delay steps need a target with at least one axis"))
}

fn heter_steps(key: &str, steps: &ArrayD<i64>, target_shape: &[usize]) -> Result<NormalizedSteps> {
    if steps.ndim() == 0 {
        let step = steps.iter().next().copied().unwrap_or(0);
        return Ok(NormalizedSteps::Homo(non_negative(key, step)?));
    }
    if steps.ndim() != 1 {
        return Err(step_error(
            key,
            format!("heterogeneous delay steps must be one-dimensional, got shape {:?}", steps.shape()),
        ));
    }
    let leading = leading_axis(key, target_shape)?;
    if steps.len() != leading {
        return Err(step_error(
            key,
            format!("shape is mismatched: {} != {}", leading, steps.len()),
        ));
    }
    let steps = steps
        .iter()
        .map(|&s| non_negative(key, s))
        .collect::<Result<Vec<_>>>()?;
    Ok(NormalizedSteps::Heter(Array1::from(steps)))
}

fn generated_steps(key: &str, init: &Initializer, seed: Option<u64>, target_shape: &[usize]) -> Result<ArrayD<i64>> {
    let leading = leading_axis(key, target_shape)?;
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let values = init.generate(&[leading], &mut rng)?;
    values
        .iter()
        .map(|&v| {
            if v.is_finite() && v.fract() == 0.0 {
                Ok(v as i64)
            } else {
                Err(step_error(key, format!("generated delay step {} is not an integer", v)))
            }
        })
        .collect::<Result<Vec<_>>>()
        .map(|steps| Array1::from(steps).into_dyn())
}

/// Validate `steps` against the shape of the delay target.
pub fn normalize_steps(key: &str, steps: &DelaySteps, target_shape: &[usize]) -> Result<NormalizedSteps> {
    match steps {
        DelaySteps::None => Ok(NormalizedSteps::None),
        DelaySteps::Homo(step) => Ok(NormalizedSteps::Homo(non_negative(key, *step)?)),
        DelaySteps::Heter(StepTensor::Float(_)) => Err(step_error(
            key,
            "only integer delay steps are supported; divide a delay time by dt first",
        )),
        DelaySteps::Heter(StepTensor::Int(steps)) => heter_steps(key, steps, target_shape),
        DelaySteps::Generated { init, seed } => {
            let steps = generated_steps(key, init, *seed, target_shape)?;
            heter_steps(key, &steps, target_shape)
        }
    }
}

// ============================================================================
// LENGTH DELAY
// ============================================================================

/// Initial content of the history slots that precede the first write
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum DelayInit {
    #[default]
    Zeros,
    Value(f64),
    /// Broadcast to the target shape
    Tensor(Tensor),
}

impl DelayInit {
    fn fill(&self, shape: &[usize]) -> Result<Tensor> {
        match self {
            Self::Zeros => Ok(Tensor::zeros(IxDyn(shape))),
            Self::Value(v) => Ok(Tensor::from_elem(IxDyn(shape), *v)),
            Self::Tensor(t) => Ok(t
                .broadcast(IxDyn(shape))
                .ok_or_else(|| DynError::shape("initial delay data", shape, t.shape()))?
                .to_owned()),
        }
    }
}

/// Circular history of a tensor over the last `max_delay_step + 1` ticks.
#[derive(Debug, Clone)]
pub struct LengthDelay {
    data: Vec<Tensor>,
    head: usize,
    init: DelayInit,
}

impl LengthDelay {
    /// Lag 0 holds `target`; every older lag holds the initial fill.
    pub fn new(target: &Tensor, max_delay_step: usize, init: DelayInit) -> Result<Self> {
        let fill = init.fill(target.shape())?;
        let mut data = vec![fill; max_delay_step + 1];
        data[0] = target.clone();
        Ok(Self { data, head: 0, init })
    }

    pub fn num_delay_step(&self) -> usize {
        self.data.len()
    }

    pub fn max_delay_step(&self) -> usize {
        self.data.len() - 1
    }

    pub fn shape(&self) -> Shape {
        self.data[self.head].shape().to_vec()
    }

    fn slot(&self, lag: usize) -> usize {
        let n = self.data.len();
        (self.head + n - lag) % n
    }

    fn check_lag(&self, lag: usize) -> Result<()> {
        if lag > self.max_delay_step() {
            return Err(DynError::invalid_parameter(
                "delay step",
                format!("{} exceeds the buffer's maximum of {}", lag, self.max_delay_step()),
            ));
        }
        Ok(())
    }

    /// Push the newest value.
    pub fn update(&mut self, value: Tensor) -> Result<()> {
        let shape = self.shape();
        if value.shape() != shape.as_slice() {
            return Err(DynError::shape("delay update", &shape, value.shape()));
        }
        self.head = (self.head + 1) % self.data.len();
        self.data[self.head] = value;
        Ok(())
    }

    /// Value held `lag` updates ago.
    pub fn retrieve(&self, lag: usize) -> Result<Tensor> {
        self.check_lag(lag)?;
        Ok(self.data[self.slot(lag)].clone())
    }

    /// Rows `indices` (leading axis) of the value held `lag` updates ago.
    pub fn retrieve_at(&self, lag: usize, indices: &[usize]) -> Result<Tensor> {
        self.check_lag(lag)?;
        let data = &self.data[self.slot(lag)];
        check_indices(data, indices)?;
        Ok(data.select(Axis(0), indices))
    }

    /// Row `indices[j]` of the value held `lags[j]` updates ago, for each `j`.
    pub fn retrieve_heter(&self, lags: &Array1<usize>, indices: &[usize]) -> Result<Tensor> {
        if lags.len() != indices.len() {
            return Err(DynError::shape("heterogeneous delay read", &[lags.len()], &[indices.len()]));
        }
        let newest = &self.data[self.head];
        check_indices(newest, indices)?;
        if indices.is_empty() {
            let mut shape = vec![0];
            shape.extend_from_slice(&newest.shape()[1..]);
            return Ok(Tensor::zeros(IxDyn(&shape)));
        }
        let rows = lags
            .iter()
            .zip(indices)
            .map(|(&lag, &i)| {
                self.check_lag(lag)?;
                Ok(self.data[self.slot(lag)].index_axis(Axis(0), i))
            })
            .collect::<Result<Vec<ArrayViewD<'_, f64>>>>()?;
        ndarray::stack(Axis(0), &rows).map_err(|e| DynError::NumericalError(e.to_string()))
    }

    /// Extend capacity to `max_delay_step`, keeping the recorded history.
    /// Returns `false` when the buffer is already long enough.
    pub fn grow(&mut self, max_delay_step: usize) -> Result<bool> {
        if max_delay_step <= self.max_delay_step() {
            return Ok(false);
        }
        let n = max_delay_step + 1;
        let mut data = vec![self.init.fill(&self.shape())?; n];
        for lag in 0..self.data.len() {
            data[(n - lag) % n] = self.data[self.slot(lag)].clone();
        }
        self.data = data;
        self.head = 0;
        Ok(true)
    }

    /// Restart the history from `target`; the shape may differ from before.
    pub fn reset(&mut self, target: &Tensor) -> Result<()> {
        let fill = self.init.fill(target.shape())?;
        for slot in self.data.iter_mut() {
            *slot = fill.clone();
        }
        self.head = 0;
        self.data[0] = target.clone();
        Ok(())
    }
}

fn check_indices(data: &Tensor, indices: &[usize]) -> Result<()> {
    let rows = data.shape().first().copied().unwrap_or(0);
    match indices.iter().find(|&&i| i >= rows) {
        Some(i) => Err(DynError::invalid_parameter(
            "indices",
            format!("index {} out of range for leading axis of length {}", i, rows),
        )),
        None => Ok(()),
    }
}

// ============================================================================
// DELAY REGISTRY
// ============================================================================

#[derive(Debug)]
struct DelayEntry {
    /// `None` while every registration asked for zero delay
    buffer: Option<LengthDelay>,
    target: Variable,
    /// Nodes that registered against the key
    holders: BTreeSet<NodeId>,
}

/// Outcome of [`DelayRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// No buffer exists; reads return the target directly
    PassThrough,
    Created,
    Grown { from: usize, to: usize },
    /// An existing buffer already covers the request
    Reused,
}

/// Delay buffers keyed by name, shared by every node built against the same
/// registry.
///
/// Cloning yields another handle to the same store. Create one registry per
/// simulation and pass it to each node at construction.
///
/// An entry lives as long as at least one node holds it: every
/// registration adds the caller to the key's holders and [`release`]
/// removes it again.
///
/// [`release`]: DelayRegistry::release
#[derive(Debug, Clone, Default)]
pub struct DelayRegistry {
    entries: Rc<RefCell<HashMap<String, DelayEntry>>>,
}

impl DelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare on behalf of `holder` that `target`'s last `steps` values
    /// must be retained under `key`.
    pub fn register(
        &self,
        holder: NodeId,
        key: &str,
        steps: &DelaySteps,
        target: &Variable,
        init: DelayInit,
    ) -> Result<(NormalizedSteps, Registration)> {
        let normalized = normalize_steps(key, steps, &target.shape())?;
        let max = normalized.max_step();
        let mut entries = self.entries.borrow_mut();

        let outcome = match entries.get_mut(key) {
            None => {
                let buffer = if max == 0 {
                    None
                } else {
                    Some(LengthDelay::new(&target.value(), max, init)?)
                };
                let outcome = if buffer.is_some() { Registration::Created } else { Registration::PassThrough };
                entries.insert(
                    key.to_string(),
                    DelayEntry {
                        buffer,
                        target: target.clone(),
                        holders: BTreeSet::from([holder]),
                    },
                );
                outcome
            }
            Some(entry) => {
                if !entry.target.ptr_eq(target) {
                    return Err(DynError::ModelBuildError(format!(
                        "delay `{}` is already registered for a different target variable",
                        key
                    )));
                }
                let outcome = match entry.buffer.as_mut() {
                    None if max == 0 => Registration::PassThrough,
                    None => {
                        entry.buffer = Some(LengthDelay::new(&target.value(), max, init)?);
                        Registration::Created
                    }
                    Some(buffer) => {
                        let current = buffer.max_delay_step();
                        if max > current {
                            buffer.grow(max)?;
                            Registration::Grown { from: current, to: max }
                        } else {
                            if normalized.is_none() {
                                warn!("delay `{}` keeps its {}-step buffer for a pass-through registration", key, current);
                            } else if max < current {
                                warn!("delay `{}` cannot shrink from {} to {} steps", key, current, max);
                            }
                            Registration::Reused
                        }
                    }
                };
                entry.holders.insert(holder);
                outcome
            }
        };
        debug!("delay `{}` registered: {:?} ({:?})", key, outcome, normalized);
        Ok((normalized, outcome))
    }

    /// Read delayed data. Empty `indices` means every element; for
    /// heterogeneous steps that pairs element `k` with its own lag.
    pub fn retrieve(&self, key: &str, steps: &NormalizedSteps, indices: &[usize]) -> Result<Tensor> {
        let entries = self.entries.borrow();
        let entry = entries
            .get(key)
            .ok_or_else(|| DynError::UnknownDelayError(key.to_string()))?;

        if steps.max_step() == 0 {
            let value = entry.target.value();
            return if indices.is_empty() {
                Ok(value.clone())
            } else {
                check_indices(&value, indices)?;
                Ok(value.select(Axis(0), indices))
            };
        }

        let buffer = entry
            .buffer
            .as_ref()
            .ok_or_else(|| step_error(key, "no delay buffer has been registered for this key"))?;
        match steps {
            NormalizedSteps::None => Ok(entry.target.get()),
            NormalizedSteps::Homo(lag) if indices.is_empty() => buffer.retrieve(*lag),
            NormalizedSteps::Homo(lag) => buffer.retrieve_at(*lag, indices),
            NormalizedSteps::Heter(lags) if indices.is_empty() => {
                let all: Vec<usize> = (0..lags.len()).collect();
                buffer.retrieve_heter(lags, &all)
            }
            NormalizedSteps::Heter(lags) => buffer.retrieve_heter(lags, indices),
        }
    }

    /// Live value of the target registered under `key`
    pub fn target_value(&self, key: &str) -> Result<Tensor> {
        let entries = self.entries.borrow();
        entries
            .get(key)
            .map(|entry| entry.target.get())
            .ok_or_else(|| DynError::UnknownDelayError(key.to_string()))
    }

    /// Push every listed buffer's current target value.
    pub fn refresh<S: AsRef<str>>(&self, keys: &[S]) -> Result<()> {
        let mut entries = self.entries.borrow_mut();
        for key in keys {
            let key = key.as_ref();
            let entry = entries
                .get_mut(key)
                .ok_or_else(|| DynError::UnknownDelayError(key.to_string()))?;
            if let Some(buffer) = entry.buffer.as_mut() {
                trace!("refreshing delay `{}`", key);
                buffer.update(entry.target.get())?;
            }
        }
        Ok(())
    }

    /// Restart every listed buffer from its target's current value.
    pub fn reset<S: AsRef<str>>(&self, keys: &[S]) -> Result<()> {
        let mut entries = self.entries.borrow_mut();
        for key in keys {
            let key = key.as_ref();
            let entry = entries
                .get_mut(key)
                .ok_or_else(|| DynError::UnknownDelayError(key.to_string()))?;
            if let Some(buffer) = entry.buffer.as_mut() {
                buffer.reset(&entry.target.value())?;
            }
        }
        Ok(())
    }

    /// Withdraw `holder` from the listed entries and drop the entries no
    /// node holds any more. Unknown keys are ignored.
    pub fn release<S: AsRef<str>>(&self, holder: NodeId, keys: &[S]) {
        let mut entries = self.entries.borrow_mut();
        for key in keys {
            let key = key.as_ref();
            let Some(entry) = entries.get_mut(key) else {
                continue;
            };
            entry.holders.remove(&holder);
            if entry.holders.is_empty() {
                entries.remove(key);
                debug!("delay `{}` released", key);
            } else {
                trace!("delay `{}` still held by {} node(s)", key, entry.holders.len());
            }
        }
    }

    /// Number of nodes holding `key`
    pub fn holders(&self, key: &str) -> usize {
        self.entries.borrow().get(key).map_or(0, |entry| entry.holders.len())
    }

    /// Whether both handles refer to the same store
    pub fn same_as(&self, other: &DelayRegistry) -> bool {
        Rc::ptr_eq(&self.entries, &other.entries)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.borrow().contains_key(key)
    }

    /// Number of history slots of the buffer under `key`; `None` for unknown
    /// or pass-through keys.
    pub fn capacity(&self, key: &str) -> Option<usize> {
        self.entries
            .borrow()
            .get(key)
            .and_then(|entry| entry.buffer.as_ref().map(LengthDelay::num_delay_step))
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.borrow().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}
