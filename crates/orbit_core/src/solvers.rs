use crate::config::{IntegrationMethod, IntegratorConfig};
use crate::error::{EvolutionError, EvolutionResult};
use crate::rule::SystemKind;
use crate::traits::{DynamicalSystem, Scalar, Steppable};

fn lit<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// Classic Runge-Kutta 4th Order Solver
#[derive(Clone)]
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::zero();
        Self {
            k1: vec![z; dim],
            k2: vec![z; dim],
            k3: vec![z; dim],
            k4: vec![z; dim],
            tmp: vec![z; dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let half = lit::<T>(0.5);
        let two = lit::<T>(2.0);
        let sixth = lit::<T>(1.0 / 6.0);
        let t0 = *t;

        system.apply(t0, state, &mut self.k1);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * half * self.k1[i];
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * half * self.k2[i];
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

// Tsitouras 5(4) tableau.
const TSIT5_C: [f64; 6] = [0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0];
const TSIT5_A: [[f64; 6]; 6] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [0.161, 0.0, 0.0, 0.0, 0.0, 0.0],
    [-0.008480655492356989, 0.335480655492357, 0.0, 0.0, 0.0, 0.0],
    [2.897153057105493, -6.359448489975075, 4.3622954328695815, 0.0, 0.0, 0.0],
    [
        5.325864828439257,
        -11.748883564062828,
        7.4955393428898365,
        -0.09249506636175525,
        0.0,
        0.0,
    ],
    [
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.028269050394068383,
        0.0,
    ],
];
const TSIT5_B: [f64; 6] = [
    0.09646076681806523,
    0.01,
    0.4798896504144996,
    1.379008574103742,
    -3.290069515436099,
    2.324710524099774,
];
// b - b_hat; the seventh weight multiplies f(t + dt, y_new).
const TSIT5_BTILDE: [f64; 7] = [
    -0.00178001105222577714,
    -0.0008164344596567469,
    0.007880878010261995,
    -0.1447110071732629,
    0.5823571654525552,
    -0.45808210592918697,
    1.0 / 66.0,
];

/// Stage storage shared by the fixed and adaptive Tsit5 drivers.
#[derive(Clone)]
struct Tsit5Stages<T: Scalar> {
    k: [Vec<T>; 6],
    tmp: Vec<T>,
}

impl<T: Scalar> Tsit5Stages<T> {
    fn new(dim: usize) -> Self {
        let z = T::zero();
        Self {
            k: std::array::from_fn(|_| vec![z; dim]),
            tmp: vec![z; dim],
        }
    }

    /// Evaluates the six stages at `(t0, y)` and writes the 5th order
    /// solution into `y_new`.
    fn evaluate(&mut self, system: &impl DynamicalSystem<T>, t0: T, y: &[T], dt: T, y_new: &mut [T]) {
        let n = y.len();
        system.apply(t0, y, &mut self.k[0]);
        for stage in 1..6 {
            for i in 0..n {
                let mut acc = T::zero();
                for j in 0..stage {
                    acc = acc + lit::<T>(TSIT5_A[stage][j]) * self.k[j][i];
                }
                self.tmp[i] = y[i] + dt * acc;
            }
            system.apply(t0 + lit::<T>(TSIT5_C[stage]) * dt, &self.tmp, &mut self.k[stage]);
        }
        for i in 0..n {
            let mut acc = T::zero();
            for (j, b) in TSIT5_B.iter().enumerate() {
                acc = acc + lit::<T>(*b) * self.k[j][i];
            }
            y_new[i] = y[i] + dt * acc;
        }
    }
}

/// Tsitouras 5/4 Solver, fixed step.
#[derive(Clone)]
pub struct Tsit5<T: Scalar> {
    stages: Tsit5Stages<T>,
    y_new: Vec<T>,
}

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            stages: Tsit5Stages::new(dim),
            y_new: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for Tsit5<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        self.stages.evaluate(system, *t, state, dt, &mut self.y_new);
        state.copy_from_slice(&self.y_new);
        *t = *t + dt;
    }
}

/// Discrete Map Stepper
/// Evaluates x_{n+1} = f(x_n) and advances t by dt (normally 1).
#[derive(Clone)]
pub struct DiscreteMap<T: Scalar> {
    tmp: Vec<T>,
}

impl<T: Scalar> DiscreteMap<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for DiscreteMap<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        system.apply(*t, state, &mut self.tmp);
        state.copy_from_slice(&self.tmp);
        *t = *t + dt;
    }
}

/// Contract between a handle and its numerical backend.
pub trait IntegrationBackend {
    /// Performs one accepted step from `t` that never passes `t_limit` and
    /// returns the time reached. `state` is updated in place.
    fn integrate(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: f64,
        state: &mut [f64],
        t_limit: f64,
    ) -> EvolutionResult<f64>;
}

// Relative slack under which a step is stretched to land on t_limit instead
// of leaving a sliver.
const LANDING_SLACK: f64 = 1e-10;

/// Picks the step that reaches `t_limit` when `dt` would overshoot it.
/// Returns `(dt, landed)`.
fn clip_step(t: f64, dt: f64, t_limit: f64) -> (f64, bool) {
    if !t_limit.is_finite() {
        return (dt, false);
    }
    let remaining = t_limit - t;
    if dt >= remaining - LANDING_SLACK * remaining.abs().max(1.0) {
        (remaining, true)
    } else {
        (dt, false)
    }
}

#[derive(Clone)]
pub enum FixedStepper {
    Rk4(RK4<f64>),
    Tsit5(Tsit5<f64>),
}

/// Fixed-step continuous integration with the final step clipped to the limit.
#[derive(Clone)]
pub struct FixedStep {
    stepper: FixedStepper,
    dt: f64,
}

impl FixedStep {
    pub fn new(method: IntegrationMethod, dim: usize, dt: f64) -> Self {
        let stepper = match method {
            IntegrationMethod::Rk4 => FixedStepper::Rk4(RK4::new(dim)),
            IntegrationMethod::Tsit5 => FixedStepper::Tsit5(Tsit5::new(dim)),
        };
        Self { stepper, dt }
    }
}

impl IntegrationBackend for FixedStep {
    fn integrate(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: f64,
        state: &mut [f64],
        t_limit: f64,
    ) -> EvolutionResult<f64> {
        if t >= t_limit {
            return Ok(t);
        }
        let (dt, landed) = clip_step(t, self.dt, t_limit);
        let mut t_new = t;
        match &mut self.stepper {
            FixedStepper::Rk4(s) => s.step(system, &mut t_new, state, dt),
            FixedStepper::Tsit5(s) => s.step(system, &mut t_new, state, dt),
        }
        Ok(if landed { t_limit } else { t_new })
    }
}

const SAFETY: f64 = 0.9;
const FAC_MIN: f64 = 0.2;
const FAC_MAX: f64 = 10.0;

/// Tsit5 with embedded error estimation and step-size control.
#[derive(Clone)]
pub struct AdaptiveTsit5 {
    stages: Tsit5Stages<f64>,
    k7: Vec<f64>,
    y_new: Vec<f64>,
    dt: f64,
    abstol: f64,
    reltol: f64,
    dtmin: f64,
    dtmax: f64,
    max_rejections: usize,
}

impl AdaptiveTsit5 {
    pub fn new(dim: usize, config: &IntegratorConfig) -> Self {
        Self {
            stages: Tsit5Stages::new(dim),
            k7: vec![0.0; dim],
            y_new: vec![0.0; dim],
            dt: config.dt,
            abstol: config.abstol,
            reltol: config.reltol,
            dtmin: config.dtmin,
            dtmax: config.dtmax.unwrap_or(f64::INFINITY),
            max_rejections: config.max_rejections,
        }
    }

    /// Step size the controller will try next.
    pub fn suggested_dt(&self) -> f64 {
        self.dt
    }

    fn error_norm(&self, y: &[f64], dt: f64) -> f64 {
        let n = y.len();
        if n == 0 {
            return 0.0;
        }
        let mut sum = 0.0;
        for i in 0..n {
            let mut e = TSIT5_BTILDE[6] * self.k7[i];
            for j in 0..6 {
                e += TSIT5_BTILDE[j] * self.stages.k[j][i];
            }
            let scale = self.abstol + self.reltol * y[i].abs().max(self.y_new[i].abs());
            let w = dt * e / scale;
            sum += w * w;
        }
        (sum / n as f64).sqrt()
    }
}

impl IntegrationBackend for AdaptiveTsit5 {
    fn integrate(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: f64,
        state: &mut [f64],
        t_limit: f64,
    ) -> EvolutionResult<f64> {
        if t >= t_limit {
            return Ok(t);
        }
        let mut rejections = 0usize;
        loop {
            if self.dt < self.dtmin {
                tracing::warn!(t, dt = self.dt, rejections, "step size underflow");
                return Err(EvolutionError::IntegrationFailure {
                    time: t,
                    dt: self.dt,
                });
            }
            let (dt, landed) = clip_step(t, self.dt.min(self.dtmax), t_limit);
            self.stages.evaluate(system, t, state, dt, &mut self.y_new);
            system.apply(t + dt, &self.y_new, &mut self.k7);
            let err = self.error_norm(state, dt);

            if err.is_finite() && err <= 1.0 {
                let growth = if err == 0.0 {
                    FAC_MAX
                } else {
                    (SAFETY * err.powf(-0.2)).clamp(FAC_MIN, FAC_MAX)
                };
                let proposed = (dt * growth).min(self.dtmax);
                // A short landing step says nothing about the usable step size.
                self.dt = if landed { self.dt.max(proposed) } else { proposed };
                state.copy_from_slice(&self.y_new);
                return Ok(if landed { t_limit } else { t + dt });
            }

            rejections += 1;
            let shrink = if err.is_finite() {
                (SAFETY * err.powf(-0.2)).clamp(FAC_MIN, 1.0)
            } else {
                FAC_MIN
            };
            self.dt = dt * shrink;
            tracing::trace!(t, dt, err, next_dt = self.dt, "rejected trial step");
            if rejections >= self.max_rejections {
                tracing::warn!(t, dt = self.dt, rejections, "too many rejected steps");
                return Err(EvolutionError::IntegrationFailure {
                    time: t,
                    dt: self.dt,
                });
            }
        }
    }
}

impl IntegrationBackend for DiscreteMap<f64> {
    /// One iteration; `t_limit` does not apply to maps.
    fn integrate(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: f64,
        state: &mut [f64],
        _t_limit: f64,
    ) -> EvolutionResult<f64> {
        let mut t_new = t;
        self.step(system, &mut t_new, state, 1.0);
        Ok(t_new)
    }
}

/// Backend a handle owns, chosen from its kind and config at construction.
#[derive(Clone)]
pub(crate) enum Backend {
    Discrete(DiscreteMap<f64>),
    Fixed(FixedStep),
    Adaptive(AdaptiveTsit5),
}

impl Backend {
    pub(crate) fn build(kind: SystemKind, dim: usize, config: Option<&IntegratorConfig>) -> Self {
        match (kind, config) {
            (SystemKind::Flow, Some(config)) if config.adaptive => {
                Backend::Adaptive(AdaptiveTsit5::new(dim, config))
            }
            (SystemKind::Flow, Some(config)) => {
                Backend::Fixed(FixedStep::new(config.method, dim, config.dt))
            }
            _ => Backend::Discrete(DiscreteMap::new(dim)),
        }
    }
}

impl IntegrationBackend for Backend {
    fn integrate(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: f64,
        state: &mut [f64],
        t_limit: f64,
    ) -> EvolutionResult<f64> {
        match self {
            Backend::Discrete(b) => b.integrate(system, t, state, t_limit),
            Backend::Fixed(b) => b.integrate(system, t, state, t_limit),
            Backend::Adaptive(b) => b.integrate(system, t, state, t_limit),
        }
    }
}
