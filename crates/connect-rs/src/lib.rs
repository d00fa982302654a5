//! # Connectivity
//!
//! Builders for pre-to-post synaptic connectivity and the sparse kernels
//! that consume it.
//!
//! A [`Connector`] describes a rule; [`Connector::build`] validates it
//! against the two population sizes and yields a [`Connectivity`], from
//! which a synapse requests the representations it works with
//! (`conn_mat`, `pre_ids`, `post_ids`, `pre2post`, `post2pre`).
//!
//! Edges are always ordered by pre index, then post index, so per-edge
//! data lines up across the `ij` and `pre2post` representations.

use log::debug;
use ndarray::{Array1, Array2, ArrayView1};
use neurodyn_core::{DynError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// CONNECTORS
// ============================================================================

/// Connectivity rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Connector {
    /// Pre `i` projects to post `i`
    OneToOne,

    /// Every pre projects to every post
    AllToAll { include_self: bool },

    /// Bernoulli (fixed probability)
    FixedProb {
        prob: f64,
        include_self: bool,
        seed: Option<u64>,
    },

    /// Dense boolean mask of shape (pre, post)
    Matrix(Array2<bool>),

    /// Explicit edge list
    Ij { pre: Vec<usize>, post: Vec<usize> },
}

impl Default for Connector {
    fn default() -> Self {
        Self::AllToAll { include_self: true }
    }
}

/// Structural family of a built connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnKind {
    OneToOne,
    AllToAll { include_self: bool },
    /// Arbitrary edge list
    Sparse,
}

impl Connector {
    pub fn build(&self, pre_num: usize, post_num: usize) -> Result<Connectivity> {
        let conn = match self {
            Self::OneToOne => {
                if pre_num != post_num {
                    return Err(DynError::ModelBuildError(format!(
                        "one-to-one connection requires equal population sizes, got {} and {}",
                        pre_num, post_num
                    )));
                }
                let ids: Vec<usize> = (0..pre_num).collect();
                Connectivity::new(ConnKind::OneToOne, pre_num, post_num, ids.clone(), ids)
            }

            Self::AllToAll { include_self } => {
                let (pre, post) = dense_edges(pre_num, post_num, |i, j| *include_self || i != j);
                let kind = ConnKind::AllToAll {
                    include_self: *include_self,
                };
                Connectivity::new(kind, pre_num, post_num, pre, post)
            }

            Self::FixedProb {
                prob,
                include_self,
                seed,
            } => {
                if !(0.0..=1.0).contains(prob) {
                    return Err(DynError::invalid_parameter(
                        "prob",
                        format!("{} (expected a probability in [0, 1])", prob),
                    ));
                }
                let mut rng = match seed {
                    Some(seed) => StdRng::seed_from_u64(*seed),
                    None => StdRng::from_entropy(),
                };
                let (pre, post) = dense_edges(pre_num, post_num, |i, j| {
                    (*include_self || i != j) && rng.gen::<f64>() < *prob
                });
                Connectivity::new(ConnKind::Sparse, pre_num, post_num, pre, post)
            }

            Self::Matrix(mat) => {
                if mat.dim() != (pre_num, post_num) {
                    return Err(DynError::shape(
                        "connection matrix",
                        &[pre_num, post_num],
                        mat.shape(),
                    ));
                }
                let (pre, post) = dense_edges(pre_num, post_num, |i, j| mat[[i, j]]);
                Connectivity::new(ConnKind::Sparse, pre_num, post_num, pre, post)
            }

            Self::Ij { pre, post } => {
                if pre.len() != post.len() {
                    return Err(DynError::shape("ij connection", &[pre.len()], &[post.len()]));
                }
                check_range("pre", pre, pre_num)?;
                check_range("post", post, post_num)?;
                let mut edges: Vec<(usize, usize)> = pre.iter().copied().zip(post.iter().copied()).collect();
                edges.sort_unstable();
                let (pre, post) = edges.into_iter().unzip();
                Connectivity::new(ConnKind::Sparse, pre_num, post_num, pre, post)
            }
        };
        debug!(
            "built {:?} connectivity {}x{} with {} edges",
            conn.kind,
            pre_num,
            post_num,
            conn.nnz()
        );
        Ok(conn)
    }
}

fn dense_edges(
    pre_num: usize,
    post_num: usize,
    mut keep: impl FnMut(usize, usize) -> bool,
) -> (Vec<usize>, Vec<usize>) {
    let mut pre = Vec::new();
    let mut post = Vec::new();
    for i in 0..pre_num {
        for j in 0..post_num {
            if keep(i, j) {
                pre.push(i);
                post.push(j);
            }
        }
    }
    (pre, post)
}

fn check_range(side: &str, ids: &[usize], num: usize) -> Result<()> {
    match ids.iter().find(|&&i| i >= num) {
        Some(i) => Err(DynError::ModelBuildError(format!(
            "{} index {} is out of range for a population of {}",
            side, i, num
        ))),
        None => Ok(()),
    }
}

// ============================================================================
// REPRESENTATIONS
// ============================================================================

/// Compressed sparse rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Csr {
    pub indices: Vec<usize>,
    pub indptr: Vec<usize>,
}

impl Csr {
    /// Build from row ids sorted ascending and their column ids.
    fn from_sorted(rows: usize, row_ids: &[usize], col_ids: &[usize]) -> Self {
        let mut indptr = vec![0; rows + 1];
        for &r in row_ids {
            indptr[r + 1] += 1;
        }
        for r in 0..rows {
            indptr[r + 1] += indptr[r];
        }
        Self {
            indices: col_ids.to_vec(),
            indptr,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Column ids of row `i`
    pub fn row(&self, i: usize) -> &[usize] {
        &self.indices[self.indptr[i]..self.indptr[i + 1]]
    }
}

/// Named connectivity representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnRepr {
    ConnMat,
    PreIds,
    PostIds,
    Pre2Post,
    Post2Pre,
}

impl fmt::Display for ConnRepr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnMat => "conn_mat",
            Self::PreIds => "pre_ids",
            Self::PostIds => "post_ids",
            Self::Pre2Post => "pre2post",
            Self::Post2Pre => "post2pre",
        };
        f.write_str(name)
    }
}

impl FromStr for ConnRepr {
    type Err = DynError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conn_mat" => Ok(Self::ConnMat),
            "pre_ids" => Ok(Self::PreIds),
            "post_ids" => Ok(Self::PostIds),
            "pre2post" => Ok(Self::Pre2Post),
            "post2pre" => Ok(Self::Post2Pre),
            other => Err(DynError::invalid_parameter(
                "connection representation",
                format!("unknown representation `{}`", other),
            )),
        }
    }
}

/// Artifact returned by [`Connectivity::require`]
#[derive(Debug, Clone, PartialEq)]
pub enum ConnArtifact {
    Mat(Array2<bool>),
    Ids(Vec<usize>),
    Csr(Csr),
}

impl ConnArtifact {
    fn unexpected(&self, wanted: &str) -> DynError {
        let got = match self {
            Self::Mat(_) => "a matrix",
            Self::Ids(_) => "an id list",
            Self::Csr(_) => "a CSR structure",
        };
        DynError::TypeMismatchError(format!("expected {}, got {}", wanted, got))
    }

    pub fn into_mat(self) -> Result<Array2<bool>> {
        match self {
            Self::Mat(mat) => Ok(mat),
            other => Err(other.unexpected("a matrix")),
        }
    }

    pub fn into_ids(self) -> Result<Vec<usize>> {
        match self {
            Self::Ids(ids) => Ok(ids),
            other => Err(other.unexpected("an id list")),
        }
    }

    pub fn into_csr(self) -> Result<Csr> {
        match self {
            Self::Csr(csr) => Ok(csr),
            other => Err(other.unexpected("a CSR structure")),
        }
    }
}

/// Validated connectivity between populations of `pre_num` and `post_num`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connectivity {
    kind: ConnKind,
    pre_num: usize,
    post_num: usize,
    pre_ids: Vec<usize>,
    post_ids: Vec<usize>,
}

impl Connectivity {
    fn new(kind: ConnKind, pre_num: usize, post_num: usize, pre_ids: Vec<usize>, post_ids: Vec<usize>) -> Self {
        Self {
            kind,
            pre_num,
            post_num,
            pre_ids,
            post_ids,
        }
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    pub fn pre_num(&self) -> usize {
        self.pre_num
    }

    pub fn post_num(&self) -> usize {
        self.post_num
    }

    /// Number of edges
    pub fn nnz(&self) -> usize {
        self.pre_ids.len()
    }

    pub fn pre_ids(&self) -> &[usize] {
        &self.pre_ids
    }

    pub fn post_ids(&self) -> &[usize] {
        &self.post_ids
    }

    pub fn conn_mat(&self) -> Array2<bool> {
        let mut mat = Array2::from_elem((self.pre_num, self.post_num), false);
        for (&i, &j) in self.pre_ids.iter().zip(&self.post_ids) {
            mat[[i, j]] = true;
        }
        mat
    }

    /// Rows are pre neurons, column ids are post neurons.
    pub fn pre2post(&self) -> Csr {
        Csr::from_sorted(self.pre_num, &self.pre_ids, &self.post_ids)
    }

    /// Rows are post neurons, column ids are pre neurons.
    pub fn post2pre(&self) -> Csr {
        let mut edges: Vec<(usize, usize)> = self
            .post_ids
            .iter()
            .copied()
            .zip(self.pre_ids.iter().copied())
            .collect();
        edges.sort_unstable();
        let (post, pre): (Vec<usize>, Vec<usize>) = edges.into_iter().unzip();
        Csr::from_sorted(self.post_num, &post, &pre)
    }

    pub fn require(&self, repr: ConnRepr) -> Result<ConnArtifact> {
        Ok(match repr {
            ConnRepr::ConnMat => ConnArtifact::Mat(self.conn_mat()),
            ConnRepr::PreIds => ConnArtifact::Ids(self.pre_ids.clone()),
            ConnRepr::PostIds => ConnArtifact::Ids(self.post_ids.clone()),
            ConnRepr::Pre2Post => ConnArtifact::Csr(self.pre2post()),
            ConnRepr::Post2Pre => ConnArtifact::Csr(self.post2pre()),
        })
    }

    pub fn require_many(&self, reprs: &[ConnRepr]) -> Result<Vec<ConnArtifact>> {
        reprs.iter().map(|&r| self.require(r)).collect()
    }

    /// Same as [`Connectivity::require`], by representation name.
    pub fn require_named(&self, name: &str) -> Result<ConnArtifact> {
        self.require(name.parse()?)
    }
}

// ============================================================================
// EVENT-DRIVEN KERNELS
// ============================================================================

/// Edge values of a sparse matrix
#[derive(Debug, Clone, Copy)]
pub enum EdgeValues<'a> {
    /// Same value on every edge
    Scalar(f64),
    /// One value per edge, in CSR order
    PerEdge(ArrayView1<'a, f64>),
}

/// Product of a CSR matrix of `shape` with a vector of events, counting
/// only nonzero events.
///
/// With `transpose` the events are indexed by row (pre) and the result by
/// column (post); this is the usual spike propagation direction.
pub fn event_csr_matvec(
    values: EdgeValues<'_>,
    csr: &Csr,
    events: ArrayView1<'_, f64>,
    shape: (usize, usize),
    transpose: bool,
) -> Result<Array1<f64>> {
    let (rows, cols) = shape;
    if csr.num_rows() != rows {
        return Err(DynError::shape("csr rows", &[rows], &[csr.num_rows()]));
    }
    if let EdgeValues::PerEdge(v) = &values {
        if v.len() != csr.nnz() {
            return Err(DynError::shape("csr values", &[csr.nnz()], &[v.len()]));
        }
    }
    let expected_events = if transpose { rows } else { cols };
    if events.len() != expected_events {
        return Err(DynError::shape("events", &[expected_events], &[events.len()]));
    }
    check_range("column", &csr.indices, cols)?;

    let value = |k: usize| match &values {
        EdgeValues::Scalar(v) => *v,
        EdgeValues::PerEdge(v) => v[k],
    };

    if transpose {
        let mut out = Array1::zeros(cols);
        for (i, &e) in events.iter().enumerate() {
            if e == 0.0 {
                continue;
            }
            for k in csr.indptr[i]..csr.indptr[i + 1] {
                out[csr.indices[k]] += value(k);
            }
        }
        Ok(out)
    } else {
        let out = Array1::from_shape_fn(rows, |i| {
            (csr.indptr[i]..csr.indptr[i + 1])
                .filter(|&k| events[csr.indices[k]] != 0.0)
                .map(value)
                .sum::<f64>()
        });
        Ok(out)
    }
}
