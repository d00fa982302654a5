//! Synaptic connections between neuron groups and their pluggable
//! components (output, short-term and long-term plasticity).

use crate::base::{DynamicalSystem, NodeBase, NodeKind};
use crate::neurons::{rng_from, GroupRef, NeuronGroup};
use log::{debug, trace};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Ix1, Ix2, IxDyn, Zip};
use neurodyn_connect::{event_csr_matvec, ConnKind, ConnRepr, Connectivity, Connector, Csr, EdgeValues};
use neurodyn_core::{
    batch_shape, parameter, DynError, Initializer, Mode, NodeId, Param, Result, SharedContext, Tensor, Time,
    Variable, Voltage,
};
use neurodyn_delay::{DelayInit, DelayRegistry, DelaySteps, NormalizedSteps};
use neurodyn_integrators::{IntegrationMethod, Integral};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// CONNECTION SPECIFICATION
// ============================================================================

/// Connectivity as handed to a synapse constructor
#[derive(Debug, Clone)]
pub enum ConnInput {
    Connector(Connector),
    Built(Connectivity),
    /// Dense boolean mask of shape (pre.num, post.num)
    Matrix(Array2<bool>),
    Ij { pre: Vec<usize>, post: Vec<usize> },
    /// Specification resolved by the caller later
    Named(String),
    None,
}

impl From<Connector> for ConnInput {
    fn from(connector: Connector) -> Self {
        Self::Connector(connector)
    }
}

impl From<Connectivity> for ConnInput {
    fn from(conn: Connectivity) -> Self {
        Self::Built(conn)
    }
}

impl From<Array2<bool>> for ConnInput {
    fn from(mat: Array2<bool>) -> Self {
        Self::Matrix(mat)
    }
}

/// Normalized connectivity of a synapse
#[derive(Debug, Clone, PartialEq)]
pub enum ConnSpec {
    Built(Connectivity),
    Named(String),
    None,
}

impl ConnInput {
    fn resolve(self, owner: &str, pre: &GroupRef, post: &GroupRef) -> Result<ConnSpec> {
        let (pre_num, post_num) = (pre.num(), post.num());
        let spec = match self {
            Self::Connector(connector) => ConnSpec::Built(connector.build(pre_num, post_num)?),
            Self::Built(conn) => {
                if (conn.pre_num(), conn.post_num()) != (pre_num, post_num) {
                    return Err(DynError::ModelBuildError(format!(
                        "{}: connectivity was built for ({}, {}), but (pre.num, post.num) = ({}, {})",
                        owner,
                        conn.pre_num(),
                        conn.post_num(),
                        pre_num,
                        post_num
                    )));
                }
                ConnSpec::Built(conn)
            }
            Self::Matrix(mat) => {
                if mat.dim() != (pre_num, post_num) {
                    return Err(DynError::ModelBuildError(format!(
                        "{}: a connection matrix must have shape (pre.num, post.num) = ({}, {}), got {:?}",
                        owner,
                        pre_num,
                        post_num,
                        mat.shape()
                    )));
                }
                ConnSpec::Built(Connector::Matrix(mat).build(pre_num, post_num)?)
            }
            Self::Ij { pre, post } => ConnSpec::Built(Connector::Ij { pre, post }.build(pre_num, post_num)?),
            Self::Named(name) => ConnSpec::Named(name),
            Self::None => ConnSpec::None,
        };
        Ok(spec)
    }
}

/// How sparse connectivity is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompMethod {
    #[default]
    Sparse,
    Dense,
}

impl FromStr for CompMethod {
    type Err = DynError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sparse" => Ok(Self::Sparse),
            "dense" => Ok(Self::Dense),
            other => Err(DynError::invalid_parameter(
                "comp_method",
                format!("must be `sparse` or `dense`, got `{}`", other),
            )),
        }
    }
}

/// Storage of sparse connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SparseFormat {
    #[default]
    Csr,
    Ij,
}

impl FromStr for SparseFormat {
    type Err = DynError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "csr" => Ok(Self::Csr),
            "ij" => Ok(Self::Ij),
            other => Err(DynError::invalid_parameter(
                "sparse_format",
                format!("must be `csr` or `ij`, got `{}`", other),
            )),
        }
    }
}

/// Connectivity structure paired with a weight parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ConnMask {
    /// One-to-one and all-to-all need no structure
    None,
    Csr(Csr),
    Ij { pre_ids: Vec<usize>, post_ids: Vec<usize> },
    /// 0/1 matrix of shape (pre, post)
    Dense(Array2<f64>),
}

/// Synaptic weights
#[derive(Debug, Clone, PartialEq)]
pub struct Weight {
    pub value: Param,
    /// Set when the owning synapse runs in training mode
    pub trainable: bool,
}

// ============================================================================
// SYNAPTIC CONNECTION
// ============================================================================

/// Pre and post group references plus normalized connectivity.
#[derive(Debug, Clone)]
pub struct SynConn {
    owner: NodeId,
    owner_name: String,
    mode: Mode,
    pub pre: GroupRef,
    pub post: GroupRef,
    conn: ConnSpec,
}

impl SynConn {
    pub fn new(owner: &NodeBase, pre: GroupRef, post: GroupRef, conn: ConnInput) -> Result<Self> {
        for group in [&pre, &post] {
            if group.geometry.varshape().len() != 1 {
                return Err(DynError::ModelBuildError(format!(
                    "{}: {} must have a flat variable shape to be connected",
                    owner.name(),
                    group.name
                )));
            }
        }
        let conn = conn.resolve(owner.name(), &pre, &post)?;
        if let ConnSpec::Built(c) = &conn {
            debug!("{} connects {} -> {} with {} synapses", owner.name(), pre.name, post.name, c.nnz());
        }
        Ok(Self {
            owner: owner.id(),
            owner_name: owner.name().to_string(),
            mode: owner.mode(),
            pre,
            post,
            conn,
        })
    }

    pub fn owner_id(&self) -> NodeId {
        self.owner
    }

    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn conn_spec(&self) -> &ConnSpec {
        &self.conn
    }

    pub fn connectivity(&self) -> Result<&Connectivity> {
        match &self.conn {
            ConnSpec::Built(conn) => Ok(conn),
            ConnSpec::Named(name) => Err(DynError::ModelBuildError(format!(
                "{}: connection `{}` has not been resolved",
                self.owner_name, name
            ))),
            ConnSpec::None => Err(DynError::ModelBuildError(format!(
                "must provide a connection to initialize {}",
                self.owner_name
            ))),
        }
    }

    fn check_attrs(&self, side: &str, group: &GroupRef, attrs: &[&str]) -> Result<()> {
        match attrs.iter().find(|attr| !group.has_var(attr)) {
            Some(attr) => Err(DynError::ModelBuildError(format!(
                "{} needs the {} group {} to have the variable `{}`",
                self.owner_name, side, group.name, attr
            ))),
            None => Ok(()),
        }
    }

    pub fn check_pre_attrs(&self, attrs: &[&str]) -> Result<()> {
        self.check_attrs("pre", &self.pre, attrs)
    }

    pub fn check_post_attrs(&self, attrs: &[&str]) -> Result<()> {
        self.check_attrs("post", &self.post, attrs)
    }

    /// Allocate weights shaped to the connectivity representation:
    /// `(pre,)` for one-to-one, `(pre, post)` for all-to-all and dense,
    /// `(nnz,)` for sparse.
    pub fn init_weights<R: Rng + ?Sized>(
        &self,
        init: &Initializer,
        comp_method: CompMethod,
        sparse_format: SparseFormat,
        rng: &mut R,
    ) -> Result<(Weight, ConnMask)> {
        let conn = self.connectivity()?;
        let (pre, post) = (self.pre.num(), self.post.num());
        let (mut value, mask) = match conn.kind() {
            ConnKind::OneToOne => (parameter(init, &[pre], rng)?, ConnMask::None),
            ConnKind::AllToAll { .. } => (parameter(init, &[pre, post], rng)?, ConnMask::None),
            ConnKind::Sparse => match comp_method {
                CompMethod::Sparse => {
                    let mask = match sparse_format {
                        SparseFormat::Csr => ConnMask::Csr(conn.require(ConnRepr::Pre2Post)?.into_csr()?),
                        SparseFormat::Ij => ConnMask::Ij {
                            pre_ids: conn.require(ConnRepr::PreIds)?.into_ids()?,
                            post_ids: conn.require(ConnRepr::PostIds)?.into_ids()?,
                        },
                    };
                    (parameter(init, &[conn.nnz()], rng)?, mask)
                }
                CompMethod::Dense => {
                    let mat = conn.require(ConnRepr::ConnMat)?.into_mat()?;
                    let mask = mat.mapv(|c| if c { 1.0 } else { 0.0 });
                    (parameter(init, &[pre, post], rng)?, ConnMask::Dense(mask))
                }
            },
        };
        if let (ConnKind::AllToAll { include_self: false }, Param::Tensor(w)) = (conn.kind(), &mut value) {
            for i in 0..pre.min(post) {
                w[[i, i].as_slice()] = 0.0;
            }
        }
        Ok((
            Weight {
                value,
                trainable: self.mode.is_training(),
            },
            mask,
        ))
    }

    /// Shape a tensor weight takes for `mask`.
    pub fn weight_shape(&self, mask: &ConnMask) -> Result<Vec<usize>> {
        let (pre, post) = (self.pre.num(), self.post.num());
        Ok(match (self.connectivity()?.kind(), mask) {
            (ConnKind::OneToOne, _) => vec![pre],
            (ConnKind::AllToAll { .. }, _) | (_, ConnMask::Dense(_)) => vec![pre, post],
            (ConnKind::Sparse, _) => vec![self.connectivity()?.nnz()],
        })
    }

    // ------------------------------------------------------------------------
    // Aggregation kernels
    //
    // `syn_value` holds one value per pre neuron along its last axis; any
    // leading axes are batch axes and are kept.
    // ------------------------------------------------------------------------

    pub fn syn2post_with_all2all(&self, syn_value: &Tensor, weight: &Param) -> Result<Tensor> {
        let (pre, post) = (self.pre.num(), self.post.num());
        let include_self = match self.connectivity()?.kind() {
            ConnKind::AllToAll { include_self } => include_self,
            _ => true,
        };
        match weight_view(weight) {
            WeightView::Scalar(w) => map_rows(syn_value, pre, post, |row| {
                let total = row.sum();
                Ok(Array1::from_shape_fn(post, |j| {
                    let own = if !include_self && j < pre { row[j] } else { 0.0 };
                    w * (total - own)
                }))
            }),
            WeightView::Tensor(w) => {
                let w = as_matrix(w, pre, post, "all-to-all weights")?;
                map_rows(syn_value, pre, post, |row| Ok(row.dot(&w)))
            }
        }
    }

    pub fn syn2post_with_one2one(&self, syn_value: &Tensor, weight: &Param) -> Result<Tensor> {
        let n = self.pre.num();
        check_last_axis(syn_value, n)?;
        match weight_view(weight) {
            WeightView::Scalar(w) => Ok(syn_value * w),
            WeightView::Tensor(w) => {
                if w.shape() != [n] {
                    return Err(DynError::shape("one-to-one weights", &[n], w.shape()));
                }
                Ok(syn_value * w)
            }
        }
    }

    pub fn syn2post_with_dense(&self, syn_value: &Tensor, weight: &Param, conn_mat: &Array2<f64>) -> Result<Tensor> {
        let (pre, post) = (self.pre.num(), self.post.num());
        if conn_mat.dim() != (pre, post) {
            return Err(DynError::shape("connection matrix", &[pre, post], conn_mat.shape()));
        }
        match weight_view(weight) {
            WeightView::Scalar(w) => map_rows(syn_value, pre, post, |row| Ok((&row * w).dot(conn_mat))),
            WeightView::Tensor(w) => {
                let masked = &as_matrix(w, pre, post, "dense weights")? * conn_mat;
                map_rows(syn_value, pre, post, |row| Ok(row.dot(&masked)))
            }
        }
    }

    /// Sparse aggregation over a pre-to-post CSR structure with one weight
    /// per edge. Rows made only of 0/1 values take the event-driven path.
    pub fn syn2post_with_csr(&self, syn_value: &Tensor, weight: &Param, csr: &Csr) -> Result<Tensor> {
        let (pre, post) = (self.pre.num(), self.post.num());
        if csr.num_rows() != pre {
            return Err(DynError::shape("pre2post rows", &[pre], &[csr.num_rows()]));
        }
        let values = edge_values(weight, csr.nnz())?;
        map_rows(syn_value, pre, post, |row| {
            if row.iter().all(|&v| v == 0.0 || v == 1.0) {
                return event_csr_matvec(values, csr, row, (pre, post), true);
            }
            let mut out = Array1::zeros(post);
            for (i, &v) in row.iter().enumerate() {
                if v == 0.0 {
                    continue;
                }
                for k in csr.indptr[i]..csr.indptr[i + 1] {
                    out[csr.indices[k]] += edge_value(values, k) * v;
                }
            }
            Ok(out)
        })
    }

    pub fn syn2post_with_ij(
        &self,
        syn_value: &Tensor,
        weight: &Param,
        pre_ids: &[usize],
        post_ids: &[usize],
    ) -> Result<Tensor> {
        let (pre, post) = (self.pre.num(), self.post.num());
        if pre_ids.len() != post_ids.len() {
            return Err(DynError::shape("post ids", &[pre_ids.len()], &[post_ids.len()]));
        }
        if pre_ids.iter().any(|&i| i >= pre) || post_ids.iter().any(|&j| j >= post) {
            return Err(DynError::ModelBuildError(format!(
                "{}: edge ids out of range for ({}, {}) neurons",
                self.owner_name, pre, post
            )));
        }
        let values = edge_values(weight, pre_ids.len())?;
        map_rows(syn_value, pre, post, |row| {
            let mut out = Array1::zeros(post);
            for (k, (&i, &j)) in pre_ids.iter().zip(post_ids).enumerate() {
                out[j] += edge_value(values, k) * row[i];
            }
            Ok(out)
        })
    }

    /// Aggregate per-pre values into per-post totals with whichever kernel
    /// matches the connectivity and `mask`.
    pub fn syn2post(&self, syn_value: &Tensor, weight: &Param, mask: &ConnMask) -> Result<Tensor> {
        match (self.connectivity()?.kind(), mask) {
            (ConnKind::OneToOne, _) => self.syn2post_with_one2one(syn_value, weight),
            (ConnKind::AllToAll { .. }, _) => self.syn2post_with_all2all(syn_value, weight),
            (ConnKind::Sparse, ConnMask::Csr(csr)) => self.syn2post_with_csr(syn_value, weight, csr),
            (ConnKind::Sparse, ConnMask::Ij { pre_ids, post_ids }) => {
                self.syn2post_with_ij(syn_value, weight, pre_ids, post_ids)
            }
            (ConnKind::Sparse, ConnMask::Dense(mat)) => self.syn2post_with_dense(syn_value, weight, mat),
            (ConnKind::Sparse, ConnMask::None) => Err(DynError::ModelBuildError(format!(
                "{}: sparse connectivity needs a connection mask",
                self.owner_name
            ))),
        }
    }
}

enum WeightView<'a> {
    Scalar(f64),
    Tensor(&'a Tensor),
}

fn weight_view(weight: &Param) -> WeightView<'_> {
    match weight {
        Param::Tensor(t) if t.ndim() > 0 => WeightView::Tensor(t),
        _ => WeightView::Scalar(weight.as_scalar().unwrap_or_default()),
    }
}

fn edge_values(weight: &Param, nnz: usize) -> Result<EdgeValues<'_>> {
    match weight_view(weight) {
        WeightView::Scalar(w) => Ok(EdgeValues::Scalar(w)),
        WeightView::Tensor(w) => {
            let w = w
                .view()
                .into_dimensionality::<Ix1>()
                .map_err(|_| DynError::shape("sparse weights", &[nnz], w.shape()))?;
            if w.len() != nnz {
                return Err(DynError::shape("sparse weights", &[nnz], &[w.len()]));
            }
            Ok(EdgeValues::PerEdge(w))
        }
    }
}

fn edge_value(values: EdgeValues<'_>, k: usize) -> f64 {
    match values {
        EdgeValues::Scalar(w) => w,
        EdgeValues::PerEdge(w) => w[k],
    }
}

fn as_matrix<'a>(w: &'a Tensor, rows: usize, cols: usize, context: &str) -> Result<ArrayView2<'a, f64>> {
    let m = w
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| DynError::shape(context, &[rows, cols], w.shape()))?;
    if m.dim() != (rows, cols) {
        return Err(DynError::shape(context, &[rows, cols], w.shape()));
    }
    Ok(m)
}

fn check_last_axis(x: &Tensor, n: usize) -> Result<()> {
    match x.shape().last() {
        Some(&last) if last == n => Ok(()),
        _ => Err(DynError::shape("synaptic values (last axis)", &[n], x.shape())),
    }
}

/// Apply `f` to every lane along the last axis, mapping `n_in` values to
/// `n_out`.
fn map_rows<F>(x: &Tensor, n_in: usize, n_out: usize, mut f: F) -> Result<Tensor>
where
    F: FnMut(ArrayView1<'_, f64>) -> Result<Array1<f64>>,
{
    check_last_axis(x, n_in)?;
    let last = Axis(x.ndim() - 1);
    let mut shape = x.shape().to_vec();
    shape[last.index()] = n_out;
    let mut out = Tensor::zeros(IxDyn(&shape));
    for (row, mut target) in x.lanes(last).into_iter().zip(out.lanes_mut(last)) {
        target.assign(&f(row)?);
    }
    Ok(out)
}

/// Add `delta` into the variable, requiring identical shapes.
fn accumulate(target: &Variable, delta: &Tensor, context: &str) -> Result<()> {
    let mut acc = target.value_mut();
    if acc.shape() != delta.shape() {
        return Err(DynError::shape(context, acc.shape(), delta.shape()));
    }
    *acc += delta;
    Ok(())
}

// ============================================================================
// COMPONENTS
// ============================================================================

/// Records the one synapse a component belongs to.
#[derive(Debug, Clone, Default)]
pub struct MasterSlot {
    master: Option<(NodeId, String)>,
}

impl MasterSlot {
    /// Bind to `conn`'s owner. Rebinding to the same owner is allowed.
    pub fn bind(&mut self, conn: &SynConn, component: &str) -> Result<()> {
        match &self.master {
            Some((id, name)) if *id != conn.owner_id() => Err(DynError::ModelBuildError(format!(
                "{} is already bound to {}, cannot bind it to {}",
                component,
                name,
                conn.owner_name()
            ))),
            _ => {
                self.master = Some((conn.owner_id(), conn.owner_name().to_string()));
                Ok(())
            }
        }
    }

    pub fn id(&self) -> Option<NodeId> {
        self.master.as_ref().map(|(id, _)| *id)
    }

    pub fn name(&self) -> Option<&str> {
        self.master.as_ref().map(|(_, name)| name.as_str())
    }
}

/// Sub-component of a synapse, bound to exactly one master.
pub trait SynComponent: fmt::Debug {
    fn slot(&self) -> &MasterSlot;

    fn slot_mut(&mut self) -> &mut MasterSlot;

    fn component_name(&self) -> &'static str;

    /// Size internal state against the master's groups.
    fn bind(&mut self, _conn: &SynConn) -> Result<()> {
        Ok(())
    }

    fn reset_state(&mut self, _batch_size: Option<usize>) -> Result<()> {
        Ok(())
    }

    fn register_master(&mut self, conn: &SynConn) -> Result<()> {
        let name = self.component_name();
        self.slot_mut().bind(conn, name)?;
        self.bind(conn)
    }

    fn master(&self) -> Option<&str> {
        self.slot().name()
    }

    fn ensure_bound(&self) -> Result<()> {
        match self.slot().id() {
            Some(_) => Ok(()),
            None => Err(DynError::ModelBuildError(format!(
                "{} is not attached to a synapse",
                self.component_name()
            ))),
        }
    }
}

/// Converts synaptic conductance into the quantity delivered to the post
/// group.
pub trait SynOutput: SynComponent {
    fn filter(&self, g: &Tensor) -> Result<Tensor>;
}

/// Short-term plasticity acting on per-pre values.
pub trait SynStp: SynComponent {
    fn update(&mut self, ctx: &SharedContext, pre_spike: &Tensor) -> Result<()>;

    fn filter(&self, g: &Tensor) -> Result<Tensor>;
}

/// Long-term plasticity updating the weights in place.
pub trait SynLtp: SynComponent {
    fn update(&mut self, ctx: &SharedContext, pre_spike: &Tensor, post_spike: &Tensor, weight: &mut Tensor) -> Result<()>;
}

/// Current-based output: the conductance is delivered as is.
#[derive(Debug, Clone, Default)]
pub struct CubaOutput {
    slot: MasterSlot,
}

impl CubaOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SynComponent for CubaOutput {
    fn slot(&self) -> &MasterSlot {
        &self.slot
    }

    fn slot_mut(&mut self) -> &mut MasterSlot {
        &mut self.slot
    }

    fn component_name(&self) -> &'static str {
        "CUBA"
    }
}

impl SynOutput for CubaOutput {
    fn filter(&self, g: &Tensor) -> Result<Tensor> {
        Ok(g.clone())
    }
}

/// Conductance-based output `g (E - V_post)`
#[derive(Debug, Clone)]
pub struct CobaOutput {
    /// Reversal potential (mV)
    pub e: Voltage,
    slot: MasterSlot,
    v: Option<Variable>,
}

impl CobaOutput {
    pub fn new(e: Voltage) -> Self {
        Self {
            e,
            slot: MasterSlot::default(),
            v: None,
        }
    }
}

impl SynComponent for CobaOutput {
    fn slot(&self) -> &MasterSlot {
        &self.slot
    }

    fn slot_mut(&mut self) -> &mut MasterSlot {
        &mut self.slot
    }

    fn component_name(&self) -> &'static str {
        "COBA"
    }

    fn bind(&mut self, conn: &SynConn) -> Result<()> {
        conn.check_post_attrs(&["V"])?;
        self.v = Some(conn.post.var("V")?.clone());
        Ok(())
    }
}

impl SynOutput for CobaOutput {
    fn filter(&self, g: &Tensor) -> Result<Tensor> {
        let v = self
            .v
            .as_ref()
            .ok_or_else(|| DynError::ModelBuildError("COBA output is not attached to a synapse".to_string()))?;
        let v = v.value();
        if v.shape() != g.shape() {
            return Err(DynError::shape("COBA conductance", v.shape(), g.shape()));
        }
        let e = self.e;
        Ok(Zip::from(g).and(&*v).map_collect(|&g, &v| g * (e - v)))
    }
}

/// Tsodyks-Markram parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StpParams {
    pub u0: f64,     // Release increment U
    pub tau_f: Time, // Facilitation time constant (ms)
    pub tau_d: Time, // Depression time constant (ms)
}

impl Default for StpParams {
    fn default() -> Self {
        Self {
            u0: 0.15,
            tau_f: 1500.0,
            tau_d: 200.0,
        }
    }
}

/// Tsodyks-Markram short-term plasticity.
///
/// Between spikes `u` relaxes to 0 with `tau_f` and `x` recovers to 1 with
/// `tau_d`. On a spike `u += U (1 - u)`, the released fraction `u x` is the
/// efficacy, and `x -= u x`.
#[derive(Debug, Clone)]
pub struct TsodyksMarkram {
    pub params: StpParams,
    pub u: Variable,
    pub x: Variable,
    efficacy: Tensor,
    num: usize,
    slot: MasterSlot,
}

impl TsodyksMarkram {
    pub fn new(params: StpParams) -> Self {
        Self {
            params,
            u: Variable::zeros(&[0]),
            x: Variable::zeros(&[0]),
            efficacy: Tensor::zeros(IxDyn(&[0])),
            num: 0,
            slot: MasterSlot::default(),
        }
    }
}

impl Default for TsodyksMarkram {
    fn default() -> Self {
        Self::new(StpParams::default())
    }
}

impl SynComponent for TsodyksMarkram {
    fn slot(&self) -> &MasterSlot {
        &self.slot
    }

    fn slot_mut(&mut self) -> &mut MasterSlot {
        &mut self.slot
    }

    fn component_name(&self) -> &'static str {
        "STP"
    }

    fn bind(&mut self, conn: &SynConn) -> Result<()> {
        self.num = conn.pre.num();
        self.reset_state(conn.mode().initial_batch_size())
    }

    fn reset_state(&mut self, batch_size: Option<usize>) -> Result<()> {
        let shape = batch_shape(&[self.num], batch_size);
        self.u.replace(Tensor::zeros(IxDyn(&shape)));
        self.x.replace(Tensor::ones(IxDyn(&shape)));
        self.efficacy = Tensor::zeros(IxDyn(&shape));
        Ok(())
    }
}

impl SynStp for TsodyksMarkram {
    fn update(&mut self, ctx: &SharedContext, pre_spike: &Tensor) -> Result<()> {
        self.ensure_bound()?;
        let mut u = self.u.value_mut();
        let mut x = self.x.value_mut();
        if pre_spike.shape() != u.shape() {
            return Err(DynError::shape("STP pre spikes", u.shape(), pre_spike.shape()));
        }
        let dt = ctx.dt();
        let decay_u = (-dt / self.params.tau_f).exp();
        let decay_x = (-dt / self.params.tau_d).exp();
        let u0 = self.params.u0;
        self.efficacy = Zip::from(&mut *u)
            .and(&mut *x)
            .and(pre_spike)
            .map_collect(|u, x, &s| {
                *u *= decay_u;
                *x = 1.0 - (1.0 - *x) * decay_x;
                if s > 0.0 {
                    *u += u0 * (1.0 - *u);
                    let released = *u * *x;
                    *x -= released;
                    released
                } else {
                    0.0
                }
            });
        Ok(())
    }

    fn filter(&self, g: &Tensor) -> Result<Tensor> {
        if g.shape() != self.efficacy.shape() {
            return Err(DynError::shape("STP values", self.efficacy.shape(), g.shape()));
        }
        Ok(g * &self.efficacy)
    }
}

/// Pair-based STDP parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdpParams {
    pub tau_pre: Time,  // Pre trace time constant (ms)
    pub tau_post: Time, // Post trace time constant (ms)
    pub a_plus: f64,    // Potentiation amplitude
    pub a_minus: f64,   // Depression amplitude
    pub w_min: f64,
    pub w_max: f64,
}

impl Default for StdpParams {
    fn default() -> Self {
        Self {
            tau_pre: 20.0,
            tau_post: 20.0,
            a_plus: 0.01,
            a_minus: 0.0105,
            w_min: 0.0,
            w_max: 1.0,
        }
    }
}

/// Trace-based pair STDP on one-to-one or `(pre, post)` weights.
///
/// A post spike potentiates by `a_plus * pre_trace`, a pre spike depresses
/// by `a_minus * post_trace`; traces are read before this tick's spikes are
/// added to them.
#[derive(Debug, Clone)]
pub struct TraceStdp {
    pub params: StdpParams,
    pre_trace: Array1<f64>,
    post_trace: Array1<f64>,
    one_to_one: bool,
    slot: MasterSlot,
}

impl TraceStdp {
    pub fn new(params: StdpParams) -> Self {
        Self {
            params,
            pre_trace: Array1::zeros(0),
            post_trace: Array1::zeros(0),
            one_to_one: false,
            slot: MasterSlot::default(),
        }
    }

    pub fn pre_trace(&self) -> &Array1<f64> {
        &self.pre_trace
    }

    pub fn post_trace(&self) -> &Array1<f64> {
        &self.post_trace
    }
}

impl Default for TraceStdp {
    fn default() -> Self {
        Self::new(StdpParams::default())
    }
}

fn spikes_1d<'a>(spike: &'a Tensor, context: &str) -> Result<ArrayView1<'a, f64>> {
    spike.view().into_dimensionality::<Ix1>().map_err(|_| {
        DynError::invalid_parameter(context, format!("STDP needs unbatched spikes, got shape {:?}", spike.shape()))
    })
}

impl SynComponent for TraceStdp {
    fn slot(&self) -> &MasterSlot {
        &self.slot
    }

    fn slot_mut(&mut self) -> &mut MasterSlot {
        &mut self.slot
    }

    fn component_name(&self) -> &'static str {
        "STDP"
    }

    fn bind(&mut self, conn: &SynConn) -> Result<()> {
        conn.check_post_attrs(&["spike"])?;
        self.one_to_one = conn.connectivity()?.kind() == ConnKind::OneToOne;
        self.pre_trace = Array1::zeros(conn.pre.num());
        self.post_trace = Array1::zeros(conn.post.num());
        Ok(())
    }

    fn reset_state(&mut self, _batch_size: Option<usize>) -> Result<()> {
        self.pre_trace.fill(0.0);
        self.post_trace.fill(0.0);
        Ok(())
    }
}

impl SynLtp for TraceStdp {
    fn update(&mut self, ctx: &SharedContext, pre_spike: &Tensor, post_spike: &Tensor, weight: &mut Tensor) -> Result<()> {
        self.ensure_bound()?;
        let pre = spikes_1d(pre_spike, "pre_spike")?;
        let post = spikes_1d(post_spike, "post_spike")?;
        if pre.len() != self.pre_trace.len() || post.len() != self.post_trace.len() {
            return Err(DynError::shape(
                "STDP spikes",
                &[self.pre_trace.len(), self.post_trace.len()],
                &[pre.len(), post.len()],
            ));
        }
        let p = &self.params;
        let dt = ctx.dt();
        self.pre_trace *= (-dt / p.tau_pre).exp();
        self.post_trace *= (-dt / p.tau_post).exp();

        if self.one_to_one {
            if weight.shape() != [pre.len()] {
                return Err(DynError::shape("one-to-one STDP weights", &[pre.len()], weight.shape()));
            }
            for (k, w) in weight.iter_mut().enumerate() {
                let dw = p.a_plus * self.pre_trace[k] * post[k] - p.a_minus * self.post_trace[k] * pre[k];
                *w = (*w + dw).clamp(p.w_min, p.w_max);
            }
        } else {
            let (rows, cols) = (pre.len(), post.len());
            let mut w = weight
                .view_mut()
                .into_dimensionality::<Ix2>()
                .map_err(|_| DynError::shape("STDP weights", &[rows, cols], &[]))?;
            if w.dim() != (rows, cols) {
                return Err(DynError::shape("STDP weights", &[rows, cols], w.shape()));
            }
            for ((i, j), w) in w.indexed_iter_mut() {
                let dw = p.a_plus * self.pre_trace[i] * post[j] - p.a_minus * self.post_trace[j] * pre[i];
                *w = (*w + dw).clamp(p.w_min, p.w_max);
            }
        }

        self.pre_trace += &pre;
        self.post_trace += &post;
        Ok(())
    }
}

/// Synaptic connection with its output and optional plasticity components.
#[derive(Debug)]
pub struct TwoEndConn {
    syn: SynConn,
    output: Box<dyn SynOutput>,
    stp: Option<Box<dyn SynStp>>,
    ltp: Option<Box<dyn SynLtp>>,
}

impl TwoEndConn {
    /// Connection with a current-based output and no plasticity.
    pub fn new(owner: &NodeBase, pre: GroupRef, post: GroupRef, conn: ConnInput) -> Result<Self> {
        let syn = SynConn::new(owner, pre, post, conn)?;
        let mut output: Box<dyn SynOutput> = Box::new(CubaOutput::new());
        output.register_master(&syn)?;
        Ok(Self {
            syn,
            output,
            stp: None,
            ltp: None,
        })
    }

    pub fn syn(&self) -> &SynConn {
        &self.syn
    }

    pub fn output(&self) -> &dyn SynOutput {
        self.output.as_ref()
    }

    pub fn stp(&self) -> Option<&dyn SynStp> {
        self.stp.as_deref()
    }

    pub fn ltp(&self) -> Option<&dyn SynLtp> {
        self.ltp.as_deref()
    }

    pub fn set_output(&mut self, mut output: Box<dyn SynOutput>) -> Result<()> {
        output.register_master(&self.syn)?;
        self.output = output;
        Ok(())
    }

    pub fn set_stp(&mut self, mut stp: Box<dyn SynStp>) -> Result<()> {
        stp.register_master(&self.syn)?;
        self.stp = Some(stp);
        Ok(())
    }

    pub fn set_ltp(&mut self, mut ltp: Box<dyn SynLtp>) -> Result<()> {
        ltp.register_master(&self.syn)?;
        self.ltp = Some(ltp);
        Ok(())
    }

    /// Per-pre values after short-term plasticity.
    pub fn pre_values(&mut self, ctx: &SharedContext, pre_spike: &Tensor) -> Result<Tensor> {
        match self.stp.as_mut() {
            Some(stp) => {
                stp.update(ctx, pre_spike)?;
                stp.filter(pre_spike)
            }
            None => Ok(pre_spike.clone()),
        }
    }

    pub fn apply_ltp(&mut self, ctx: &SharedContext, pre_spike: &Tensor, weight: &mut Weight) -> Result<()> {
        let Some(ltp) = self.ltp.as_mut() else {
            return Ok(());
        };
        let post_spike = self.syn.post.var("spike")?.get();
        match &mut weight.value {
            Param::Tensor(w) => ltp.update(ctx, pre_spike, &post_spike, w),
            Param::Scalar(_) => Err(DynError::ModelBuildError(format!(
                "{}: plastic weights must be stored per synapse",
                self.syn.owner_name()
            ))),
        }
    }

    pub fn reset_components(&mut self, batch_size: Option<usize>) -> Result<()> {
        self.output.reset_state(batch_size)?;
        if let Some(stp) = self.stp.as_mut() {
            stp.reset_state(batch_size)?;
        }
        if let Some(ltp) = self.ltp.as_mut() {
            ltp.reset_state(batch_size)?;
        }
        Ok(())
    }
}

/// Pre spikes read straight from the group or through a delay buffer.
#[derive(Debug)]
struct PreSpikes {
    key: String,
    steps: NormalizedSteps,
    spike: Variable,
}

impl PreSpikes {
    fn register(base: &mut NodeBase, pre: &GroupRef, delay_step: Option<i64>) -> Result<Self> {
        let spike = pre.var("spike")?.clone();
        let key = format!("{}.spike", pre.name);
        let steps = match delay_step {
            Some(steps) => base.register_delay(&key, &DelaySteps::Homo(steps), &spike, DelayInit::Zeros)?,
            None => NormalizedSteps::None,
        };
        Ok(Self { key, steps, spike })
    }

    fn read(&self, base: &NodeBase) -> Result<Tensor> {
        if self.steps.max_step() == 0 {
            Ok(self.spike.get())
        } else {
            base.get_delay_data(&self.key, &self.steps, &[])
        }
    }
}

fn materialize_weight(conn: &TwoEndConn, weight: &mut Weight, mask: &ConnMask) -> Result<()> {
    if let Param::Scalar(w) = weight.value {
        let shape = conn.syn().weight_shape(mask)?;
        weight.value = Param::Tensor(Tensor::from_elem(IxDyn(&shape), w));
    }
    Ok(())
}

// ============================================================================
// DELTA SYNAPSE
// ============================================================================

/// Delta synapse parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaSynapseParams {
    pub weight: Initializer,        // Bump delivered per presynaptic spike
    pub delay_step: Option<i64>,    // Homogeneous delay (steps)
    pub comp_method: CompMethod,
    pub sparse_format: SparseFormat,
    pub post_var: String,           // Post variable receiving the bump
    pub seed: Option<u64>,
}

impl Default for DeltaSynapseParams {
    fn default() -> Self {
        Self {
            weight: Initializer::Constant(1.0),
            delay_step: None,
            comp_method: CompMethod::Sparse,
            sparse_format: SparseFormat::Csr,
            post_var: "input".to_string(),
            seed: None,
        }
    }
}

/// Adds the weight to the post variable once per presynaptic spike.
pub struct DeltaSynapse {
    base: NodeBase,
    conn: TwoEndConn,
    params: DeltaSynapseParams,
    pub weight: Weight,
    mask: ConnMask,
    pre_spike: PreSpikes,
    target: Variable,
}

impl DeltaSynapse {
    pub fn new<P, Q>(
        pre: &P,
        post: &Q,
        conn: impl Into<ConnInput>,
        params: DeltaSynapseParams,
        name: Option<&str>,
        mode: Mode,
        delays: &DelayRegistry,
    ) -> Result<Self>
    where
        P: NeuronGroup + ?Sized,
        Q: NeuronGroup + ?Sized,
    {
        let mut base = NodeBase::new("DeltaSynapse", name, mode, delays)?;
        let conn = TwoEndConn::new(&base, GroupRef::of(pre), GroupRef::of(post), conn.into())?;
        conn.syn().check_pre_attrs(&["spike"])?;
        conn.syn().check_post_attrs(&[params.post_var.as_str()])?;
        let mut rng = rng_from(params.seed);
        let (weight, mask) =
            conn.syn()
                .init_weights(&params.weight, params.comp_method, params.sparse_format, &mut rng)?;
        let pre_spike = PreSpikes::register(&mut base, &conn.syn().pre, params.delay_step)?;
        let target = conn.syn().post.var(&params.post_var)?.clone();
        Ok(Self {
            base,
            conn,
            params,
            weight,
            mask,
            pre_spike,
            target,
        })
    }

    pub fn with_output(mut self, output: Box<dyn SynOutput>) -> Result<Self> {
        self.conn.set_output(output)?;
        Ok(self)
    }

    pub fn with_stp(mut self, stp: Box<dyn SynStp>) -> Result<Self> {
        self.conn.set_stp(stp)?;
        Ok(self)
    }

    /// Attach long-term plasticity; scalar weights become per-synapse.
    pub fn with_ltp(mut self, ltp: Box<dyn SynLtp>) -> Result<Self> {
        self.conn.set_ltp(ltp)?;
        materialize_weight(&self.conn, &mut self.weight, &self.mask)?;
        Ok(self)
    }

    pub fn conn(&self) -> &TwoEndConn {
        &self.conn
    }

    pub fn mask(&self) -> &ConnMask {
        &self.mask
    }

    pub fn params(&self) -> &DeltaSynapseParams {
        &self.params
    }
}

impl DynamicalSystem for DeltaSynapse {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Synapse
    }

    fn update(&mut self, ctx: &SharedContext, _input: Option<&Tensor>) -> Result<Option<Tensor>> {
        let spikes = self.pre_spike.read(&self.base)?;
        let syn_value = self.conn.pre_values(ctx, &spikes)?;
        let post_vs = self.conn.syn().syn2post(&syn_value, &self.weight.value, &self.mask)?;
        let out = self.conn.output().filter(&post_vs)?;
        accumulate(&self.target, &out, self.base.name())?;
        self.conn.apply_ltp(ctx, &spikes, &mut self.weight)?;
        trace!("{} delivered {:.3} at t={}", self.base.name(), out.sum(), ctx.t());
        Ok(None)
    }

    fn reset_state(&mut self, batch_size: Option<usize>) -> Result<()> {
        self.conn.reset_components(batch_size)
    }
}

// ============================================================================
// EXPONENTIAL SYNAPSE
// ============================================================================

/// Exponential synapse parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpSynapseParams {
    pub weight: Initializer,        // Conductance jump per spike
    pub tau: Time,                  // Decay time constant (ms)
    pub delay_step: Option<i64>,    // Homogeneous delay (steps)
    pub comp_method: CompMethod,
    pub sparse_format: SparseFormat,
    pub method: IntegrationMethod,
    pub post_var: String,
    pub seed: Option<u64>,
}

impl Default for ExpSynapseParams {
    fn default() -> Self {
        Self {
            weight: Initializer::Constant(1.0),
            tau: 8.0,
            delay_step: None,
            comp_method: CompMethod::Sparse,
            sparse_format: SparseFormat::Csr,
            method: IntegrationMethod::ExponentialEuler,
            post_var: "input".to_string(),
            seed: None,
        }
    }
}

/// Post-synaptic conductance `g` with `dg/dt = -g / tau`, jumping by the
/// aggregated weight on every presynaptic spike.
pub struct ExpSynapse {
    base: NodeBase,
    conn: TwoEndConn,
    params: ExpSynapseParams,
    pub weight: Weight,
    mask: ConnMask,
    pre_spike: PreSpikes,
    target: Variable,
    pub g: Variable,
    integral: Integral,
}

impl ExpSynapse {
    pub fn new<P, Q>(
        pre: &P,
        post: &Q,
        conn: impl Into<ConnInput>,
        params: ExpSynapseParams,
        name: Option<&str>,
        mode: Mode,
        delays: &DelayRegistry,
    ) -> Result<Self>
    where
        P: NeuronGroup + ?Sized,
        Q: NeuronGroup + ?Sized,
    {
        if params.tau <= 0.0 {
            return Err(DynError::invalid_parameter("tau", format!("{} (expected > 0)", params.tau)));
        }
        let mut base = NodeBase::new("ExpSynapse", name, mode, delays)?;
        let conn = TwoEndConn::new(&base, GroupRef::of(pre), GroupRef::of(post), conn.into())?;
        conn.syn().check_pre_attrs(&["spike"])?;
        conn.syn().check_post_attrs(&[params.post_var.as_str()])?;
        let mut rng = rng_from(params.seed);
        let (weight, mask) =
            conn.syn()
                .init_weights(&params.weight, params.comp_method, params.sparse_format, &mut rng)?;
        let pre_spike = PreSpikes::register(&mut base, &conn.syn().pre, params.delay_step)?;
        let target = conn.syn().post.var(&params.post_var)?.clone();
        let g = Variable::zeros(&batch_shape(&[conn.syn().post.num()], mode.initial_batch_size()));
        let integral = Integral::ode(params.method)?;
        Ok(Self {
            base,
            conn,
            params,
            weight,
            mask,
            pre_spike,
            target,
            g,
            integral,
        })
    }

    pub fn with_output(mut self, output: Box<dyn SynOutput>) -> Result<Self> {
        self.conn.set_output(output)?;
        Ok(self)
    }

    pub fn with_stp(mut self, stp: Box<dyn SynStp>) -> Result<Self> {
        self.conn.set_stp(stp)?;
        Ok(self)
    }

    pub fn with_ltp(mut self, ltp: Box<dyn SynLtp>) -> Result<Self> {
        self.conn.set_ltp(ltp)?;
        materialize_weight(&self.conn, &mut self.weight, &self.mask)?;
        Ok(self)
    }

    pub fn conn(&self) -> &TwoEndConn {
        &self.conn
    }

    pub fn params(&self) -> &ExpSynapseParams {
        &self.params
    }
}

impl DynamicalSystem for ExpSynapse {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Synapse
    }

    fn update(&mut self, ctx: &SharedContext, _input: Option<&Tensor>) -> Result<Option<Tensor>> {
        let spikes = self.pre_spike.read(&self.base)?;
        let syn_value = self.conn.pre_values(ctx, &spikes)?;
        let post_vs = self.conn.syn().syn2post(&syn_value, &self.weight.value, &self.mask)?;

        let tau = self.params.tau;
        let decay = |g: &Tensor, _t: Time| g.mapv(|g| -g / tau);
        let g = self.integral.step(&decay, None, &self.g.get(), ctx.t(), ctx.dt())?;
        if g.shape() != post_vs.shape() {
            return Err(DynError::shape(self.base.name(), g.shape(), post_vs.shape()));
        }
        self.g.set(g + &post_vs)?;

        let out = self.conn.output().filter(&self.g.value())?;
        accumulate(&self.target, &out, self.base.name())?;
        self.conn.apply_ltp(ctx, &spikes, &mut self.weight)?;
        Ok(None)
    }

    fn reset_state(&mut self, batch_size: Option<usize>) -> Result<()> {
        let shape = batch_shape(&[self.conn.syn().post.num()], batch_size);
        self.g.replace(Tensor::zeros(IxDyn(&shape)));
        self.conn.reset_components(batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neurons::{Lif, LifParams, SpikeTimeGroup};
    use ndarray::{arr1, arr2};

    fn lif(num: usize, name: &str, registry: &DelayRegistry) -> Lif {
        Lif::new(&[num], LifParams::default(), Some(name), Mode::NonBatching, registry).unwrap()
    }

    fn syn_conn(pre: &Lif, post: &Lif, conn: ConnInput, mode: Mode, registry: &DelayRegistry) -> SynConn {
        let owner = NodeBase::new("Syn", None, mode, registry).unwrap();
        SynConn::new(&owner, GroupRef::of(pre), GroupRef::of(post), conn).unwrap()
    }

    #[test]
    fn test_conn_normalization() {
        let registry = DelayRegistry::new();
        let (pre, post) = (lif(3, "pre", &registry), lif(2, "post", &registry));
        let owner = NodeBase::new("Syn", Some("syn"), Mode::NonBatching, &registry).unwrap();

        let bad = ConnInput::Matrix(Array2::from_elem((2, 2), true));
        assert!(matches!(
            SynConn::new(&owner, GroupRef::of(&pre), GroupRef::of(&post), bad),
            Err(DynError::ModelBuildError(_))
        ));

        let ij = ConnInput::Ij {
            pre: vec![0, 2],
            post: vec![1, 0],
        };
        let syn = SynConn::new(&owner, GroupRef::of(&pre), GroupRef::of(&post), ij).unwrap();
        assert_eq!(syn.connectivity().unwrap().nnz(), 2);

        let named = SynConn::new(
            &owner,
            GroupRef::of(&pre),
            GroupRef::of(&post),
            ConnInput::Named("fixed_prob".to_string()),
        )
        .unwrap();
        let mut rng = rng_from(Some(0));
        assert!(named
            .init_weights(&Initializer::Constant(1.0), CompMethod::Sparse, SparseFormat::Csr, &mut rng)
            .is_err());
        assert!(syn.check_post_attrs(&["V", "input"]).is_ok());
        assert!(syn.check_pre_attrs(&["g"]).is_err());
    }

    #[test]
    fn test_init_weights_shapes() {
        let registry = DelayRegistry::new();
        let (pre, post) = (lif(3, "pre", &registry), lif(3, "post", &registry));
        let mut rng = rng_from(Some(1));
        let uniform = Initializer::Uniform { min: 0.0, max: 1.0 };

        let one = syn_conn(&pre, &post, Connector::OneToOne.into(), Mode::NonBatching, &registry);
        let (w, mask) = one.init_weights(&uniform, CompMethod::Sparse, SparseFormat::Csr, &mut rng).unwrap();
        assert_eq!(w.value.shape(), vec![3]);
        assert_eq!(mask, ConnMask::None);
        assert!(!w.trainable);

        let all = syn_conn(
            &pre,
            &post,
            Connector::AllToAll { include_self: false }.into(),
            Mode::Training,
            &registry,
        );
        let (w, _) = all.init_weights(&uniform, CompMethod::Sparse, SparseFormat::Csr, &mut rng).unwrap();
        assert_eq!(w.value.shape(), vec![3, 3]);
        assert!(w.trainable);
        if let Param::Tensor(t) = &w.value {
            assert_eq!(t[[1, 1].as_slice()], 0.0);
        }

        let mat = arr2(&[[true, false, true], [false, false, true], [true, false, false]]);
        let sparse = syn_conn(&pre, &post, ConnInput::Matrix(mat), Mode::NonBatching, &registry);
        let (w, mask) = sparse.init_weights(&uniform, CompMethod::Sparse, SparseFormat::Csr, &mut rng).unwrap();
        assert_eq!(w.value.shape(), vec![4]);
        assert!(matches!(mask, ConnMask::Csr(_)));
        let (_, mask) = sparse.init_weights(&uniform, CompMethod::Sparse, SparseFormat::Ij, &mut rng).unwrap();
        assert!(matches!(mask, ConnMask::Ij { .. }));
        let (w, mask) = sparse.init_weights(&uniform, CompMethod::Dense, SparseFormat::Csr, &mut rng).unwrap();
        assert_eq!(w.value.shape(), vec![3, 3]);
        assert!(matches!(mask, ConnMask::Dense(_)));

        let (w, _) = sparse
            .init_weights(&Initializer::Constant(0.5), CompMethod::Sparse, SparseFormat::Csr, &mut rng)
            .unwrap();
        assert_eq!(w.value, Param::Scalar(0.5));

        assert!("dense".parse::<CompMethod>().is_ok());
        assert!("coo".parse::<SparseFormat>().is_err());
    }

    #[test]
    fn test_all2all_kernel() {
        let registry = DelayRegistry::new();
        let (pre, post) = (lif(3, "pre", &registry), lif(3, "post", &registry));
        let x = arr1(&[1.0, 2.0, 4.0]).into_dyn();

        let with_self = syn_conn(
            &pre,
            &post,
            Connector::AllToAll { include_self: true }.into(),
            Mode::NonBatching,
            &registry,
        );
        let out = with_self.syn2post_with_all2all(&x, &Param::Scalar(0.5)).unwrap();
        assert_eq!(out, arr1(&[3.5, 3.5, 3.5]).into_dyn());

        let without_self = syn_conn(
            &pre,
            &post,
            Connector::AllToAll { include_self: false }.into(),
            Mode::NonBatching,
            &registry,
        );
        let out = without_self.syn2post_with_all2all(&x, &Param::Scalar(1.0)).unwrap();
        assert_eq!(out, arr1(&[6.0, 5.0, 3.0]).into_dyn());

        let w = Param::Tensor(arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 2.0]]).into_dyn());
        let batched = arr2(&[[1.0, 2.0, 4.0], [1.0, 1.0, 1.0]]).into_dyn();
        let out = with_self.syn2post_with_all2all(&batched, &w).unwrap();
        assert_eq!(out, arr2(&[[1.0, 2.0, 8.0], [1.0, 1.0, 2.0]]).into_dyn());
    }

    #[test]
    fn test_dense_and_sparse_kernels_agree() {
        let registry = DelayRegistry::new();
        let (pre, post) = (lif(3, "pre", &registry), lif(2, "post", &registry));
        let mat = arr2(&[[true, false], [true, true], [false, true]]);
        let syn = syn_conn(&pre, &post, ConnInput::Matrix(mat.clone()), Mode::NonBatching, &registry);
        let conn = syn.connectivity().unwrap();
        let csr = conn.pre2post();
        let dense = mat.mapv(|c| if c { 1.0 } else { 0.0 });

        let w = Param::Scalar(2.0);
        for x in [arr1(&[1.0, 0.0, 1.0]), arr1(&[0.5, 2.0, 0.0])] {
            let x = x.into_dyn();
            let by_dense = syn.syn2post_with_dense(&x, &w, &dense).unwrap();
            let by_csr = syn.syn2post_with_csr(&x, &w, &csr).unwrap();
            let by_ij = syn
                .syn2post_with_ij(&x, &w, conn.pre_ids(), conn.post_ids())
                .unwrap();
            assert_eq!(by_dense, by_csr);
            assert_eq!(by_dense, by_ij);
        }

        let per_edge = Param::Tensor(arr1(&[1.0, 2.0, 3.0, 4.0]).into_dyn());
        let x = arr1(&[1.0, 1.0, 1.0]).into_dyn();
        let out = syn.syn2post_with_csr(&x, &per_edge, &csr).unwrap();
        assert_eq!(out, arr1(&[3.0, 7.0]).into_dyn());
        let short = Param::Tensor(arr1(&[1.0]).into_dyn());
        assert!(syn.syn2post_with_csr(&x, &short, &csr).is_err());
    }

    #[test]
    fn test_one2one_kernel() {
        let registry = DelayRegistry::new();
        let (pre, post) = (lif(2, "pre", &registry), lif(2, "post", &registry));
        let syn = syn_conn(&pre, &post, Connector::OneToOne.into(), Mode::NonBatching, &registry);
        let x = arr2(&[[1.0, 0.0], [1.0, 1.0]]).into_dyn();
        let w = Param::Tensor(arr1(&[0.5, 3.0]).into_dyn());
        let out = syn.syn2post_with_one2one(&x, &w).unwrap();
        assert_eq!(out, arr2(&[[0.5, 0.0], [0.5, 3.0]]).into_dyn());
        assert!(syn.syn2post_with_one2one(&arr1(&[1.0]).into_dyn(), &w).is_err());
    }

    #[test]
    fn test_component_has_single_master() {
        let registry = DelayRegistry::new();
        let (pre, post) = (lif(2, "pre", &registry), lif(2, "post", &registry));
        let a = syn_conn(&pre, &post, Connector::OneToOne.into(), Mode::NonBatching, &registry);
        let b = syn_conn(&pre, &post, Connector::OneToOne.into(), Mode::NonBatching, &registry);
        let mut stp = TsodyksMarkram::default();
        stp.register_master(&a).unwrap();
        stp.register_master(&a).unwrap();
        assert_eq!(stp.master(), Some(a.owner_name()));
        assert!(matches!(stp.register_master(&b), Err(DynError::ModelBuildError(_))));
    }

    #[test]
    fn test_tsodyks_markram() {
        let registry = DelayRegistry::new();
        let (pre, post) = (lif(1, "pre", &registry), lif(1, "post", &registry));
        let syn = syn_conn(&pre, &post, Connector::OneToOne.into(), Mode::NonBatching, &registry);
        // strongly depressing: large U, fast facilitation decay
        let mut stp = TsodyksMarkram::new(StpParams {
            u0: 0.5,
            tau_f: 1.0,
            tau_d: 200.0,
        });
        let ctx = SharedContext::new();
        let spike = arr1(&[1.0]).into_dyn();
        assert!(stp.update(&ctx, &spike).is_err());

        stp.register_master(&syn).unwrap();
        stp.update(&ctx, &spike).unwrap();
        let first = stp.filter(&spike).unwrap()[[0].as_slice()];
        assert!((first - 0.5).abs() < 1e-12);

        stp.update(&ctx, &spike).unwrap();
        let second = stp.filter(&spike).unwrap()[[0].as_slice()];
        assert!(second < first);
        assert_eq!(stp.filter(&arr1(&[0.0]).into_dyn()).unwrap().sum(), 0.0);
    }

    #[test]
    fn test_stdp_direction() {
        let registry = DelayRegistry::new();
        let (pre, post) = (lif(1, "pre", &registry), lif(1, "post", &registry));
        let syn = syn_conn(
            &pre,
            &post,
            Connector::AllToAll { include_self: true }.into(),
            Mode::NonBatching,
            &registry,
        );
        let ctx = SharedContext::new();
        let (on, off) = (arr1(&[1.0]).into_dyn(), arr1(&[0.0]).into_dyn());

        let mut stdp = TraceStdp::default();
        stdp.register_master(&syn).unwrap();
        let mut w = Tensor::from_elem(IxDyn(&[1, 1]), 0.5);
        stdp.update(&ctx, &on, &off, &mut w).unwrap();
        stdp.update(&ctx, &off, &on, &mut w).unwrap();
        assert!(w.sum() > 0.5);

        let mut stdp = TraceStdp::default();
        stdp.register_master(&syn).unwrap();
        let mut w = Tensor::from_elem(IxDyn(&[1, 1]), 0.5);
        stdp.update(&ctx, &off, &on, &mut w).unwrap();
        stdp.update(&ctx, &on, &off, &mut w).unwrap();
        assert!(w.sum() < 0.5);

        let mut wrong = Tensor::zeros(IxDyn(&[2]));
        assert!(stdp.update(&ctx, &on, &off, &mut wrong).is_err());
    }

    #[test]
    fn test_delta_synapse_delivers_bump() {
        let registry = DelayRegistry::new();
        let pre = SpikeTimeGroup::new(2, vec![1], vec![0.0], Some("pre"), Mode::NonBatching, &registry).unwrap();
        let post = lif(2, "post", &registry);
        let params = DeltaSynapseParams {
            weight: Initializer::Constant(0.7),
            ..Default::default()
        };
        let mut syn = DeltaSynapse::new(&pre, &post, Connector::OneToOne, params, None, Mode::NonBatching, &registry)
            .unwrap();
        let mut pre = pre;
        let mut ctx = SharedContext::new();
        ctx.tick(0);
        pre.update(&ctx, None).unwrap();
        syn.update(&ctx, None).unwrap();
        assert_eq!(post.input.get(), arr1(&[0.0, 0.7]).into_dyn());
    }

    #[test]
    fn test_exp_synapse_decays() {
        let registry = DelayRegistry::new();
        let pre = SpikeTimeGroup::new(1, vec![0], vec![0.0], Some("pre"), Mode::NonBatching, &registry).unwrap();
        let post = lif(1, "post", &registry);
        let params = ExpSynapseParams {
            weight: Initializer::Constant(1.0),
            tau: 5.0,
            ..Default::default()
        };
        let mut syn = ExpSynapse::new(&pre, &post, Connector::AllToAll { include_self: true }, params, None, Mode::NonBatching, &registry)
            .unwrap()
            .with_output(Box::new(CobaOutput::new(0.0)))
            .unwrap();
        let mut pre = pre;
        let mut ctx = SharedContext::new();
        ctx.set_dt(0.1).unwrap();
        ctx.tick(0);
        pre.update(&ctx, None).unwrap();
        syn.update(&ctx, None).unwrap();
        assert!((syn.g.get().sum() - 1.0).abs() < 1e-12);

        pre.update(&ctx, None).unwrap();
        syn.update(&ctx, None).unwrap();
        let expected = (-0.1f64 / 5.0).exp();
        assert!((syn.g.get().sum() - expected).abs() < 1e-8);

        syn.reset_state(Some(3)).unwrap();
        assert_eq!(syn.g.shape(), vec![3, 1]);
    }
}
