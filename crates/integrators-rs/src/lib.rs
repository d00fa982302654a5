//! # Integrators
//!
//! One-step numerical integrators for tensor-valued ODEs and SDEs.
//!
//! A node that needs continuous-time dynamics picks an [`IntegrationMethod`]
//! by name and obtains an [`Integral`]; each tick it hands over its drift
//! (and, for stochastic systems, its diffusion) and receives the next state.
//!
//! | Method | Kind | Order |
//! |--------|------|-------|
//! | `euler` | ODE / SDE (Euler-Maruyama) | 1 |
//! | `exp_euler` | ODE | 1, exact for linear equations |
//! | `rk2` | ODE | 2 |
//! | `heun` | ODE | 2 |
//! | `rk4` | ODE | 4 |
//! | `milstein` | SDE | 1 (strong) |

use log::debug;
use ndarray::Zip;
use neurodyn_core::{standard_normal, DynError, Result, Tensor, Time};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Right-hand side `f(y, t)`
pub type Drift<'a> = dyn Fn(&Tensor, Time) -> Tensor + 'a;

/// Integration methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IntegrationMethod {
    Euler,
    /// Element-wise linearization; exact for linear ODEs
    #[default]
    ExponentialEuler,
    RungeKutta2,
    Heun,
    RungeKutta4,
    /// For SDEs
    Milstein,
}

impl IntegrationMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Euler => "euler",
            Self::ExponentialEuler => "exp_euler",
            Self::RungeKutta2 => "rk2",
            Self::Heun => "heun",
            Self::RungeKutta4 => "rk4",
            Self::Milstein => "milstein",
        }
    }

    pub fn supports_ode(&self) -> bool {
        !matches!(self, Self::Milstein)
    }

    pub fn supports_sde(&self) -> bool {
        matches!(self, Self::Euler | Self::Milstein)
    }
}

impl fmt::Display for IntegrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IntegrationMethod {
    type Err = DynError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "euler" => Ok(Self::Euler),
            "exp_auto" | "exp_euler" | "exponential_euler" => Ok(Self::ExponentialEuler),
            "rk2" => Ok(Self::RungeKutta2),
            "heun" => Ok(Self::Heun),
            "rk4" => Ok(Self::RungeKutta4),
            "milstein" => Ok(Self::Milstein),
            other => Err(DynError::invalid_parameter(
                "method",
                format!("unknown integration method `{}`", other),
            )),
        }
    }
}

fn checked(method: IntegrationMethod, y: &Tensor, out: Tensor) -> Result<Tensor> {
    if out.shape() != y.shape() {
        return Err(DynError::shape(format!("{} derivative", method), y.shape(), out.shape()));
    }
    Ok(out)
}

fn ensure_finite(method: IntegrationMethod, y: Tensor) -> Result<Tensor> {
    if y.iter().all(|x| x.is_finite()) {
        Ok(y)
    } else {
        Err(DynError::NumericalError(format!("{} step produced a non-finite state", method)))
    }
}

// ============================================================================
// ODE INTEGRATORS
// ============================================================================

/// Deterministic one-step integrator
pub trait OdeIntegrator: fmt::Debug {
    fn method(&self) -> IntegrationMethod;

    /// State after one step of size `dt` from `(y, t)`.
    fn step(&mut self, f: &Drift<'_>, y: &Tensor, t: Time, dt: Time) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Euler;

impl OdeIntegrator for Euler {
    fn method(&self) -> IntegrationMethod {
        IntegrationMethod::Euler
    }

    fn step(&mut self, f: &Drift<'_>, y: &Tensor, t: Time, dt: Time) -> Result<Tensor> {
        let k1 = checked(self.method(), y, f(y, t))?;
        ensure_finite(self.method(), y + &(k1 * dt))
    }
}

/// Explicit midpoint method
#[derive(Debug, Clone, Copy, Default)]
pub struct RungeKutta2;

impl OdeIntegrator for RungeKutta2 {
    fn method(&self) -> IntegrationMethod {
        IntegrationMethod::RungeKutta2
    }

    fn step(&mut self, f: &Drift<'_>, y: &Tensor, t: Time, dt: Time) -> Result<Tensor> {
        let k1 = checked(self.method(), y, f(y, t))?;
        let k2 = checked(self.method(), y, f(&(y + &(&k1 * (dt / 2.0))), t + dt / 2.0))?;
        ensure_finite(self.method(), y + &(k2 * dt))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Heun;

impl OdeIntegrator for Heun {
    fn method(&self) -> IntegrationMethod {
        IntegrationMethod::Heun
    }

    fn step(&mut self, f: &Drift<'_>, y: &Tensor, t: Time, dt: Time) -> Result<Tensor> {
        let k1 = checked(self.method(), y, f(y, t))?;
        let k2 = checked(self.method(), y, f(&(y + &(&k1 * dt)), t + dt))?;
        ensure_finite(self.method(), y + &((k1 + k2) * (dt / 2.0)))
    }
}

/// Classical fourth-order Runge-Kutta
#[derive(Debug, Clone, Copy, Default)]
pub struct RungeKutta4;

impl OdeIntegrator for RungeKutta4 {
    fn method(&self) -> IntegrationMethod {
        IntegrationMethod::RungeKutta4
    }

    fn step(&mut self, f: &Drift<'_>, y: &Tensor, t: Time, dt: Time) -> Result<Tensor> {
        let m = self.method();
        let half = dt / 2.0;
        let k1 = checked(m, y, f(y, t))?;
        let k2 = checked(m, y, f(&(y + &(&k1 * half)), t + half))?;
        let k3 = checked(m, y, f(&(y + &(&k2 * half)), t + half))?;
        let k4 = checked(m, y, f(&(y + &(&k3 * dt)), t + dt))?;
        let incr = (k1 + &(k2 * 2.0) + &(k3 * 2.0) + &k4) * (dt / 6.0);
        ensure_finite(m, y + &incr)
    }
}

/// Exponential Euler with a finite-difference diagonal Jacobian.
///
/// Each element is linearized around the current state,
/// `dy/dt ≈ f0 + a (y' - y)`, and the linear equation is solved exactly
/// over the step. Elements are assumed independent of each other, which
/// holds for the per-neuron equations of a group.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialEuler {
    /// Relative perturbation of the finite difference
    pub eps: f64,
}

impl Default for ExponentialEuler {
    fn default() -> Self {
        Self { eps: 1e-7 }
    }
}

impl OdeIntegrator for ExponentialEuler {
    fn method(&self) -> IntegrationMethod {
        IntegrationMethod::ExponentialEuler
    }

    fn step(&mut self, f: &Drift<'_>, y: &Tensor, t: Time, dt: Time) -> Result<Tensor> {
        let m = self.method();
        let f0 = checked(m, y, f(y, t))?;
        let h = y.mapv(|v| self.eps * (1.0 + v.abs()));
        let fh = checked(m, y, f(&(y + &h), t))?;

        let mut next = y.clone();
        Zip::from(&mut next)
            .and(&f0)
            .and(&fh)
            .and(&h)
            .for_each(|y, &f0, &fh, &h| {
                let a = (fh - f0) / h;
                let adt = a * dt;
                *y += if adt.abs() < 1e-10 {
                    dt * f0
                } else {
                    adt.exp_m1() / a * f0
                };
            });
        ensure_finite(m, next)
    }
}

// ============================================================================
// SDE INTEGRATORS
// ============================================================================

/// Stochastic one-step integrator (Ito, diagonal noise)
pub trait SdeIntegrator: fmt::Debug {
    fn method(&self) -> IntegrationMethod;

    fn step(&mut self, f: &Drift<'_>, g: &Drift<'_>, y: &Tensor, t: Time, dt: Time) -> Result<Tensor>;
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

#[derive(Debug, Clone)]
pub struct EulerMaruyama {
    rng: StdRng,
}

impl EulerMaruyama {
    pub fn new(seed: Option<u64>) -> Self {
        Self { rng: rng_from(seed) }
    }
}

impl SdeIntegrator for EulerMaruyama {
    fn method(&self) -> IntegrationMethod {
        IntegrationMethod::Euler
    }

    fn step(&mut self, f: &Drift<'_>, g: &Drift<'_>, y: &Tensor, t: Time, dt: Time) -> Result<Tensor> {
        let m = self.method();
        let drift = checked(m, y, f(y, t))?;
        let diffusion = checked(m, y, g(y, t))?;
        let sqrt_dt = dt.sqrt();
        let rng = &mut self.rng;
        let dw = y.mapv(|_| standard_normal(&mut *rng) * sqrt_dt);
        ensure_finite(m, y + &(drift * dt) + &(diffusion * &dw))
    }
}

/// Derivative-free Milstein scheme
#[derive(Debug, Clone)]
pub struct Milstein {
    rng: StdRng,
}

impl Milstein {
    pub fn new(seed: Option<u64>) -> Self {
        Self { rng: rng_from(seed) }
    }
}

impl SdeIntegrator for Milstein {
    fn method(&self) -> IntegrationMethod {
        IntegrationMethod::Milstein
    }

    fn step(&mut self, f: &Drift<'_>, g: &Drift<'_>, y: &Tensor, t: Time, dt: Time) -> Result<Tensor> {
        let m = self.method();
        let drift = checked(m, y, f(y, t))?;
        let diffusion = checked(m, y, g(y, t))?;
        let sqrt_dt = dt.sqrt();
        let rng = &mut self.rng;
        let dw = y.mapv(|_| standard_normal(&mut *rng) * sqrt_dt);

        let support = y + &(&drift * dt) + &(&diffusion * sqrt_dt);
        let g_support = checked(m, y, g(&support, t))?;
        let correction = (&g_support - &diffusion) * (0.5 / sqrt_dt) * &dw.mapv(|w| w * w - dt);

        ensure_finite(m, y + &(drift * dt) + &(diffusion * &dw) + &correction)
    }
}

// ============================================================================
// FACTORIES
// ============================================================================

/// Deterministic integrator for `method`.
pub fn odeint(method: IntegrationMethod) -> Result<Box<dyn OdeIntegrator>> {
    debug!("creating ODE integrator `{}`", method);
    match method {
        IntegrationMethod::Euler => Ok(Box::new(Euler)),
        IntegrationMethod::ExponentialEuler => Ok(Box::new(ExponentialEuler::default())),
        IntegrationMethod::RungeKutta2 => Ok(Box::new(RungeKutta2)),
        IntegrationMethod::Heun => Ok(Box::new(Heun)),
        IntegrationMethod::RungeKutta4 => Ok(Box::new(RungeKutta4)),
        IntegrationMethod::Milstein => Err(DynError::invalid_parameter(
            "method",
            "`milstein` integrates stochastic equations only",
        )),
    }
}

/// Stochastic integrator for `method`; `seed` makes the noise reproducible.
pub fn sdeint(method: IntegrationMethod, seed: Option<u64>) -> Result<Box<dyn SdeIntegrator>> {
    debug!("creating SDE integrator `{}`", method);
    match method {
        IntegrationMethod::Euler => Ok(Box::new(EulerMaruyama::new(seed))),
        IntegrationMethod::Milstein => Ok(Box::new(Milstein::new(seed))),
        other => Err(DynError::invalid_parameter(
            "method",
            format!("`{}` does not support stochastic equations; use `euler` or `milstein`", other),
        )),
    }
}

/// Integrator bound to a node, deterministic or stochastic.
#[derive(Debug)]
pub enum Integral {
    Ode(Box<dyn OdeIntegrator>),
    Sde(Box<dyn SdeIntegrator>),
}

impl Integral {
    pub fn ode(method: IntegrationMethod) -> Result<Self> {
        odeint(method).map(Self::Ode)
    }

    pub fn sde(method: IntegrationMethod, seed: Option<u64>) -> Result<Self> {
        sdeint(method, seed).map(Self::Sde)
    }

    pub fn method(&self) -> IntegrationMethod {
        match self {
            Self::Ode(i) => i.method(),
            Self::Sde(i) => i.method(),
        }
    }

    pub fn is_stochastic(&self) -> bool {
        matches!(self, Self::Sde(_))
    }

    /// Advance `y` by one step. A stochastic integral needs `g`; a
    /// deterministic one rejects it.
    pub fn step(
        &mut self,
        f: &Drift<'_>,
        g: Option<&Drift<'_>>,
        y: &Tensor,
        t: Time,
        dt: Time,
    ) -> Result<Tensor> {
        match (self, g) {
            (Self::Ode(i), None) => i.step(f, y, t, dt),
            (Self::Sde(i), Some(g)) => i.step(f, g, y, t, dt),
            (Self::Ode(i), Some(_)) => Err(DynError::invalid_parameter(
                "diffusion",
                format!("deterministic integrator `{}` got a diffusion term", i.method()),
            )),
            (Self::Sde(i), None) => Err(DynError::invalid_parameter(
                "diffusion",
                format!("stochastic integrator `{}` needs a diffusion term", i.method()),
            )),
        }
    }
}
