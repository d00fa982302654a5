//! Ion channels hosted by conductance-based neuron groups.

use crate::base::{DynamicalSystem, NodeBase, NodeKind};
use crate::neurons::{GroupType, COND_NEU_GROUP};
use ndarray::Zip;
use neurodyn_core::{
    batch_shape, Conductance, DynError, IonChannel, Mode, Result, Shape, SharedContext, Tensor, Time, Variable,
    Voltage,
};
use neurodyn_delay::DelayRegistry;
use neurodyn_integrators::{IntegrationMethod, Integral};

/// A membrane current source.
///
/// `update` receives the membrane potential of the previous step as its
/// input; `current` is evaluated at whatever potential the host's
/// integrator asks for.
pub trait Channel: DynamicalSystem {
    /// Neuron group type this channel can be attached to
    fn master_type(&self) -> &'static GroupType {
        &COND_NEU_GROUP
    }

    /// Number of elements (must match the host group)
    fn num(&self) -> usize;

    /// Membrane current (uA/cm^2) at potential `v`
    fn current(&self, v: &Tensor) -> Tensor;

    /// Reinitialize state consistently with the host's reset potential.
    fn reset_with_voltage(&mut self, v: &Tensor, batch_size: Option<usize>) -> Result<()>;
}

fn voltage_input<'a>(name: &str, input: Option<&'a Tensor>) -> Result<&'a Tensor> {
    input.ok_or_else(|| {
        DynError::invalid_parameter("input", format!("channel `{}` is updated with the membrane potential", name))
    })
}

// ============================================================================
// LEAK
// ============================================================================

/// Ohmic leak current `g (E - V)`
pub struct LeakChannel {
    base: NodeBase,
    num: usize,
    pub g_max: Conductance,
    pub e: Voltage,
}

impl LeakChannel {
    pub fn new(
        num: usize,
        g_max: Conductance,
        e: Voltage,
        name: Option<&str>,
        mode: Mode,
        delays: &DelayRegistry,
    ) -> Result<Self> {
        Ok(Self {
            base: NodeBase::new("IL", name, mode, delays)?,
            num,
            g_max,
            e,
        })
    }
}

impl DynamicalSystem for LeakChannel {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Channel
    }

    fn update(&mut self, _ctx: &SharedContext, input: Option<&Tensor>) -> Result<Option<Tensor>> {
        voltage_input(self.name(), input)?;
        Ok(None)
    }
}

impl Channel for LeakChannel {
    fn num(&self) -> usize {
        self.num
    }

    fn current(&self, v: &Tensor) -> Tensor {
        v.mapv(|v| self.g_max * (self.e - v))
    }

    fn reset_with_voltage(&mut self, _v: &Tensor, _batch_size: Option<usize>) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// GATED CHANNELS
// ============================================================================

/// Voltage-gated channel `g * prod_k x_k^p_k * (E - V)` with gates
/// following `dx/dt = phi (alpha (1 - x) - beta x)`.
pub struct GatedChannel {
    base: NodeBase,
    num: usize,
    spec: IonChannel,
    /// Temperature factor
    pub phi: f64,
    /// Potential (mV) the gates settle at on a standalone reset
    pub v_rest: Voltage,
    gates: Vec<Variable>,
    /// Per-sample shape of the last potential seen
    varshape: Shape,
    master: &'static GroupType,
    integral: Integral,
}

impl GatedChannel {
    pub fn new(
        num: usize,
        spec: IonChannel,
        name: Option<&str>,
        mode: Mode,
        delays: &DelayRegistry,
    ) -> Result<Self> {
        if spec.gates.is_empty() {
            return Err(DynError::ModelBuildError(format!("channel `{}` has no gates", spec.name)));
        }
        let base = NodeBase::new(&spec.name, name, mode, delays)?;
        let shape = batch_shape(&[num], mode.initial_batch_size());
        let gates = spec.gates.iter().map(|_| Variable::zeros(&shape)).collect();
        Ok(Self {
            base,
            num,
            spec,
            phi: 1.0,
            v_rest: -65.0,
            gates,
            varshape: vec![num],
            master: &COND_NEU_GROUP,
            integral: Integral::ode(IntegrationMethod::ExponentialEuler)?,
        })
    }

    /// Restrict attachment to groups of type `master` (or its subtypes).
    pub fn with_master_type(mut self, master: &'static GroupType) -> Self {
        self.master = master;
        self
    }

    pub fn with_resting_potential(mut self, v_rest: Voltage) -> Self {
        self.v_rest = v_rest;
        self
    }

    pub fn with_method(mut self, method: IntegrationMethod) -> Result<Self> {
        self.integral = Integral::ode(method)?;
        Ok(self)
    }

    pub fn spec(&self) -> &IonChannel {
        &self.spec
    }

    /// Gate variable by name (`m`, `h`, `n`, ...)
    pub fn gate(&self, name: &str) -> Option<&Variable> {
        self.spec
            .gates
            .iter()
            .position(|g| g.name == name)
            .map(|i| &self.gates[i])
    }

    fn open_fraction(&self) -> Tensor {
        let mut open = Tensor::ones(self.gates[0].value().raw_dim());
        for (gate, x) in self.spec.gates.iter().zip(&self.gates) {
            let power = gate.power as i32;
            Zip::from(&mut open)
                .and(&*x.value())
                .for_each(|o, &x| *o *= x.powi(power));
        }
        open
    }
}

impl DynamicalSystem for GatedChannel {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Channel
    }

    fn update(&mut self, ctx: &SharedContext, input: Option<&Tensor>) -> Result<Option<Tensor>> {
        let v = voltage_input(self.base.name(), input)?;
        let phi = self.phi;
        for (gate, x) in self.spec.gates.iter().zip(&self.gates) {
            let drift = |x: &Tensor, _t: Time| {
                Zip::from(x)
                    .and(v)
                    .map_collect(|&x, &v| gate.derivative(x, v, phi))
            };
            let next = self.integral.step(&drift, None, &x.get(), ctx.t(), ctx.dt())?;
            x.set(next)?;
        }
        Ok(None)
    }

    /// Without a host potential the gates settle at their steady state for
    /// `v_rest`, over the shape of the host's last reset.
    fn reset_state(&mut self, batch_size: Option<usize>) -> Result<()> {
        let shape = batch_shape(&self.varshape, batch_size);
        let v = Tensor::from_elem(ndarray::IxDyn(&shape), self.v_rest);
        self.reset_with_voltage(&v, batch_size)
    }
}

impl Channel for GatedChannel {
    fn master_type(&self) -> &'static GroupType {
        self.master
    }

    fn num(&self) -> usize {
        self.num
    }

    fn current(&self, v: &Tensor) -> Tensor {
        let g = self.spec.g_max;
        let e = self.spec.e_rev;
        let mut i = self.open_fraction();
        Zip::from(&mut i).and(v).for_each(|i, &v| *i *= g * (e - v));
        i
    }

    fn reset_with_voltage(&mut self, v: &Tensor, batch_size: Option<usize>) -> Result<()> {
        let varshape = match batch_size {
            Some(_) => v.shape().get(1..).unwrap_or_default().to_vec(),
            None => v.shape().to_vec(),
        };
        if varshape.iter().product::<usize>() != self.num {
            return Err(DynError::shape(self.base.name(), &[self.num], &varshape));
        }
        self.varshape = varshape;
        for (gate, x) in self.spec.gates.iter().zip(&self.gates) {
            x.replace(v.mapv(|v| gate.steady_state(v)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neurons::{CondNeuGroup, CondNeuGroupParams, NeuronGroup, NEU_GROUP};
    use ndarray::IxDyn;
    use neurodyn_core::Initializer;

    static SPECIAL_GROUP: GroupType = GroupType {
        name: "SpecialGroup",
        parent: Some(&COND_NEU_GROUP),
    };

    #[test]
    fn test_leak_current() {
        let registry = DelayRegistry::new();
        let leak = LeakChannel::new(2, 0.3, -54.387, None, Mode::NonBatching, &registry).unwrap();
        let i = leak.current(&Tensor::from_elem(IxDyn(&[2]), -54.387));
        assert!(i.iter().all(|x| x.abs() < 1e-12));
    }

    #[test]
    fn test_gates_start_at_steady_state() {
        let registry = DelayRegistry::new();
        let mut na = GatedChannel::new(3, IonChannel::hh_sodium(), None, Mode::NonBatching, &registry).unwrap();
        let v = Tensor::from_elem(IxDyn(&[3]), -65.0);
        na.reset_with_voltage(&v, None).unwrap();
        let m = na.gate("m").unwrap().get();

        let mut ctx = SharedContext::new();
        ctx.set_dt(0.01).unwrap();
        na.update(&ctx, Some(&v)).unwrap();
        let drift = (&na.gate("m").unwrap().get() - &m).mapv(f64::abs).sum();
        assert!(drift < 1e-9);
        assert!(na.update(&ctx, None).is_err());
    }

    #[test]
    fn test_standalone_reset_settles_at_rest() {
        let registry = DelayRegistry::new();
        let mut k = GatedChannel::new(6, IonChannel::hh_potassium(), None, Mode::NonBatching, &registry)
            .unwrap()
            .with_resting_potential(-70.0);
        let n_rest = k.spec().gates[0].steady_state(-70.0);

        k.reset_state(None).unwrap();
        let n = k.gate("n").unwrap().get();
        assert_eq!(n.shape(), &[6]);
        assert!(n.iter().all(|&x| (x - n_rest).abs() < 1e-12));

        // a 2 x 3 host potential is remembered for later resets
        let v = Tensor::from_elem(IxDyn(&[2, 3]), -65.0);
        k.reset_with_voltage(&v, None).unwrap();
        k.reset_state(Some(4)).unwrap();
        let n = k.gate("n").unwrap().get();
        assert_eq!(n.shape(), &[4, 2, 3]);
        assert!(n.iter().all(|&x| (x - n_rest).abs() < 1e-12));

        assert!(k.reset_with_voltage(&Tensor::zeros(IxDyn(&[5])), None).is_err());
    }

    #[test]
    fn test_master_type_check() {
        let registry = DelayRegistry::new();
        let params = CondNeuGroupParams {
            v_initializer: Initializer::Constant(-65.0),
            ..Default::default()
        };
        let mut group = CondNeuGroup::new(&[4], params, Some("plain"), Mode::NonBatching, &registry).unwrap();

        let special = GatedChannel::new(4, IonChannel::hh_potassium(), None, Mode::NonBatching, &registry)
            .unwrap()
            .with_master_type(&SPECIAL_GROUP);
        assert!(matches!(
            group.add_channel(Some("IK"), Box::new(special)),
            Err(DynError::TypeMismatchError(_))
        ));

        let generic = GatedChannel::new(4, IonChannel::hh_potassium(), None, Mode::NonBatching, &registry)
            .unwrap()
            .with_master_type(&NEU_GROUP);
        group.add_channel(Some("IK"), Box::new(generic)).unwrap();
        assert!(group.channel("IK").is_some());

        let mut special_group = CondNeuGroup::new(&[4], CondNeuGroupParams::default(), None, Mode::NonBatching, &registry)
            .unwrap()
            .with_group_type(&SPECIAL_GROUP)
            .unwrap();
        let special = GatedChannel::new(4, IonChannel::hh_potassium(), None, Mode::NonBatching, &registry)
            .unwrap()
            .with_master_type(&SPECIAL_GROUP);
        special_group.add_channel(Some("IK"), Box::new(special)).unwrap();
        assert_eq!(special_group.group_type().name, "SpecialGroup");
        assert!(special_group.channel("IK").is_some());
    }

    #[test]
    fn test_channel_size_and_mode_checks() {
        let registry = DelayRegistry::new();
        let mut group = CondNeuGroup::new(&[4], CondNeuGroupParams::default(), None, Mode::NonBatching, &registry).unwrap();
        let wrong_size = LeakChannel::new(3, 0.3, -54.387, None, Mode::NonBatching, &registry).unwrap();
        assert!(group.add_channel(None, Box::new(wrong_size)).is_err());

        let batching = LeakChannel::new(4, 0.3, -54.387, None, Mode::Batching, &registry).unwrap();
        assert!(matches!(
            group.add_channel(None, Box::new(batching)),
            Err(DynError::ModeMismatchError { .. })
        ));
    }
}
