use crate::{
    autodiff::{Dual, TangentSystem},
    handle::DynamicalSystemHandle,
    rule::SystemKind,
    solvers::{DiscreteMap, Tsit5, RK4},
    traits::{DynamicalSystem, Steppable},
};
use anyhow::{anyhow, bail, Context, Result};
use nalgebra::linalg::QR;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LyapunovStepper {
    Rk4,
    Tsit5,
    Discrete,
}

impl LyapunovStepper {
    fn build(self, dim: usize) -> InternalStepper {
        match self {
            LyapunovStepper::Rk4 => InternalStepper::Rk4(RK4::new(dim)),
            LyapunovStepper::Tsit5 => InternalStepper::Tsit5(Tsit5::new(dim)),
            LyapunovStepper::Discrete => InternalStepper::Discrete(DiscreteMap::new(dim)),
        }
    }
}

enum InternalStepper {
    Rk4(RK4<f64>),
    Tsit5(Tsit5<f64>),
    Discrete(DiscreteMap<f64>),
}

impl InternalStepper {
    fn step(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) {
        match self {
            InternalStepper::Rk4(s) => s.step(system, t, state, dt),
            InternalStepper::Tsit5(s) => s.step(system, t, state, dt),
            InternalStepper::Discrete(s) => s.step(system, t, state, dt),
        }
    }
}

/// Full Lyapunov spectrum by evolving the tangent matrix alongside the state
/// and re-orthonormalizing it every `qr_stride` steps.
///
/// The first `transient_steps` evolve the state alone. Exponents come back in
/// the order of the QR diagonal, which is descending for a converged run.
#[allow(clippy::too_many_arguments)]
pub fn lyapunov_spectrum<S>(
    system: S,
    solver: LyapunovStepper,
    initial_state: &[f64],
    initial_time: f64,
    steps: usize,
    dt: f64,
    qr_stride: usize,
    transient_steps: usize,
) -> Result<Vec<f64>>
where
    S: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    if initial_state.is_empty() {
        bail!("Initial state must have positive dimension.");
    }
    let dim = initial_state.len();
    if DynamicalSystem::<f64>::dimension(&system) != dim {
        bail!(
            "Initial state dimension mismatch. Expected {}, got {}.",
            DynamicalSystem::<f64>::dimension(&system),
            dim
        );
    }
    if steps == 0 {
        bail!("Lyapunov computation requires at least one integration step.");
    }
    if !(dt.is_finite() && dt > 0.0) {
        bail!("Step size dt must be positive.");
    }
    if qr_stride == 0 {
        bail!("qr_stride must be at least 1.");
    }

    let mut t = initial_time;
    let mut base_state = initial_state.to_vec();
    if transient_steps > 0 {
        let mut stepper = solver.build(dim);
        for _ in 0..transient_steps {
            stepper.step(&system, &mut t, &mut base_state, dt);
        }
        ensure_finite(&base_state, t).context("Transient diverged.")?;
    }

    let aug_dim = dim + dim * dim;
    let mut augmented_state = vec![0.0; aug_dim];
    augmented_state[..dim].copy_from_slice(&base_state);
    for i in 0..dim {
        augmented_state[dim + i * dim + i] = 1.0;
    }

    let tangent_system = TangentSystem::new(system, dim);
    let mut stepper = solver.build(aug_dim);
    let mut accum = vec![0.0; dim];
    let mut since_last_qr = 0usize;

    for steps_done in 1..=steps {
        stepper.step(&tangent_system, &mut t, &mut augmented_state, dt);
        since_last_qr += 1;

        if since_last_qr == qr_stride || steps_done == steps {
            ensure_finite(&augmented_state[..dim], t)?;
            apply_qr(&mut augmented_state[dim..], dim, &mut accum)?;
            since_last_qr = 0;
        }
    }

    let total_time = steps as f64 * dt;
    for value in &mut accum {
        *value /= total_time;
    }
    tracing::debug!(dimension = dim, steps, exponents = ?accum, "lyapunov spectrum");
    Ok(accum)
}

fn ensure_finite(state: &[f64], t: f64) -> Result<()> {
    if state.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(anyhow!("State became non-finite at t = {t}."))
    }
}

fn apply_qr(phi_slice: &mut [f64], dim: usize, accum: &mut [f64]) -> Result<()> {
    if phi_slice.len() != dim * dim {
        bail!("Tangent matrix slice has incorrect size.");
    }
    let matrix = DMatrix::from_row_slice(dim, dim, phi_slice);
    let qr = QR::new(matrix);
    let (q, r) = qr.unpack();
    for i in 0..dim {
        let diag = r[(i, i)].abs();
        if diag <= f64::EPSILON {
            return Err(anyhow!(
                "Encountered near-singular R matrix during orthonormalization."
            ));
        }
        accum[i] += diag.ln();
    }
    // nalgebra is column-major; the tangent block is row-major.
    for i in 0..dim {
        for j in 0..dim {
            phi_slice[i * dim + j] = q[(i, j)];
        }
    }
    Ok(())
}

/// Kaplan-Yorke (Lyapunov) dimension of a spectrum.
pub fn kaplan_yorke(exponents: &[f64]) -> f64 {
    if exponents.is_empty() {
        return 0.0;
    }
    let mut sorted = exponents.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut partial = 0.0;
    let mut k = 0usize;
    for (idx, &lambda) in sorted.iter().enumerate() {
        let new_sum = partial + lambda;
        if new_sum >= 0.0 {
            partial = new_sum;
            k = idx + 1;
        } else {
            if lambda.abs() <= f64::EPSILON {
                return k as f64;
            }
            return k as f64 + partial / lambda.abs();
        }
    }

    k as f64
}

/// Largest Lyapunov exponent from two nearby trajectories (Benettin).
///
/// Runs `handle` through `transient`, then follows it together with a copy
/// displaced by `d0`. Every `renormalization_interval` the separation is
/// logged and pulled back to `d0` along its current direction. Time spans are
/// iterations for maps. `handle` ends at the end of the run.
pub fn largest_lyapunov<P: Clone>(
    handle: &mut DynamicalSystemHandle<P>,
    total: f64,
    d0: f64,
    renormalization_interval: f64,
    transient: f64,
) -> Result<f64> {
    if !(total.is_finite() && total > 0.0) {
        bail!("Total time must be positive.");
    }
    if !(d0.is_finite() && d0 > 0.0) {
        bail!("Initial separation d0 must be positive.");
    }
    if !(renormalization_interval.is_finite() && renormalization_interval > 0.0) {
        bail!("Renormalization interval must be positive.");
    }
    if !(transient.is_finite() && transient >= 0.0) {
        bail!("Transient must be non-negative.");
    }
    if handle.kind() == SystemKind::Map
        && [total, renormalization_interval, transient]
            .iter()
            .any(|v| v.fract() != 0.0)
    {
        bail!("Map spans must be whole numbers of iterations.");
    }

    let t_transient_end = handle.current_time() + transient;
    handle
        .step_until(t_transient_end)
        .context("Reference trajectory failed during the transient.")?;

    let dim = handle.dimension();
    let offset = d0 / (dim as f64).sqrt();
    let displaced: Vec<f64> = handle.current_state().iter().map(|x| x + offset).collect();
    let mut shadow = handle.clone();
    shadow.set_state(&displaced)?;

    let t_start = handle.current_time();
    let t_end = t_start + total;
    let mut log_sum = 0.0;
    let mut k = 1usize;
    loop {
        let target = (t_start + k as f64 * renormalization_interval).min(t_end);
        handle
            .step_until(target)
            .context("Reference trajectory failed.")?;
        shadow
            .step_until(target)
            .context("Displaced trajectory failed.")?;

        let reference = handle.state_slice();
        let separation: Vec<f64> = shadow
            .state_slice()
            .iter()
            .zip(reference)
            .map(|(s, r)| s - r)
            .collect();
        let distance = separation.iter().map(|v| v * v).sum::<f64>().sqrt();
        if distance <= 0.0 {
            bail!(
                "Trajectories collapsed onto each other at t = {}.",
                handle.current_time()
            );
        }
        log_sum += (distance / d0).ln();

        if handle.current_time() >= t_end {
            break;
        }
        let scale = d0 / distance;
        let renormalized: Vec<f64> = reference
            .iter()
            .zip(&separation)
            .map(|(r, s)| r + s * scale)
            .collect();
        shadow.set_state(&renormalized)?;
        k += 1;
    }

    let elapsed = handle.current_time() - t_start;
    let lambda = log_sum / elapsed;
    tracing::debug!(lambda, elapsed, renormalizations = k, "largest lyapunov exponent");
    Ok(lambda)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IntegrationMethod, IntegratorConfig};
    use crate::rule::EvolutionRule;
    use crate::systems::Henon;
    use crate::traits::Scalar;

    /// `x' = rate * x` (or `x -> rate * x` as a map).
    #[derive(Clone, Copy)]
    struct Linear {
        rate: f64,
    }

    impl<T: Scalar> DynamicalSystem<T> for Linear {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
            out[0] = T::from_f64(self.rate).unwrap() * x[0];
        }
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains(needle), "{needle:?} not in {message:?}");
    }

    #[test]
    fn lyapunov_spectrum_rejects_invalid_inputs() {
        let system = Linear { rate: 1.0 };
        assert_err_contains(
            lyapunov_spectrum(system, LyapunovStepper::Rk4, &[], 0.0, 10, 0.1, 1, 0),
            "Initial state",
        );
        assert_err_contains(
            lyapunov_spectrum(system, LyapunovStepper::Rk4, &[1.0, 2.0], 0.0, 10, 0.1, 1, 0),
            "dimension mismatch",
        );
        assert_err_contains(
            lyapunov_spectrum(system, LyapunovStepper::Rk4, &[1.0], 0.0, 0, 0.1, 1, 0),
            "at least one integration step",
        );
        assert_err_contains(
            lyapunov_spectrum(system, LyapunovStepper::Rk4, &[1.0], 0.0, 10, 0.0, 1, 0),
            "dt must be positive",
        );
        assert_err_contains(
            lyapunov_spectrum(system, LyapunovStepper::Rk4, &[1.0], 0.0, 10, 0.1, 0, 0),
            "qr_stride",
        );
    }

    #[test]
    fn discrete_linear_map_matches_log_growth() {
        let system = Linear { rate: 2.0 };
        let exponents =
            lyapunov_spectrum(system, LyapunovStepper::Discrete, &[1.0], 0.0, 8, 1.0, 1, 3)
                .expect("lyapunov exponents should compute");
        assert!((exponents[0] - 2.0_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn continuous_linear_rate_is_recovered() {
        let system = Linear { rate: -1.0 };
        let exponents =
            lyapunov_spectrum(system, LyapunovStepper::Rk4, &[1.0], 0.0, 100, 0.05, 1, 0)
                .expect("lyapunov exponents should compute");
        assert!((exponents[0] + 1.0).abs() < 1e-2);

        let exponents =
            lyapunov_spectrum(system, LyapunovStepper::Tsit5, &[1.0], 0.0, 100, 0.05, 5, 10)
                .expect("lyapunov exponents should compute");
        assert!((exponents[0] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn henon_spectrum() {
        let henon = Henon::default();
        let exponents = lyapunov_spectrum(
            henon,
            LyapunovStepper::Discrete,
            &[0.0, 0.0],
            0.0,
            20_000,
            1.0,
            1,
            100,
        )
        .expect("henon spectrum should compute");
        assert!((exponents[0] - 0.42).abs() < 0.01, "{exponents:?}");
        assert!((exponents[1] + 1.62).abs() < 0.01, "{exponents:?}");
        // |det J| = b at every point.
        assert!((exponents[0] + exponents[1] - 0.3f64.ln()).abs() < 1e-9);
        let dim = kaplan_yorke(&exponents);
        assert!((dim - 1.26).abs() < 0.02, "{dim}");
    }

    #[test]
    fn apply_qr_leaves_orthonormal_rows_and_logs_volume() {
        let dim = 3;
        let mut phi = vec![2.0, 1.0, 0.0, 0.5, 3.0, 1.0, 0.0, 1.0, 4.0];
        let det = DMatrix::from_row_slice(dim, dim, &phi).determinant();
        let mut accum = vec![0.0; dim];

        apply_qr(&mut phi, dim, &mut accum).unwrap();

        let q = DMatrix::from_row_slice(dim, dim, &phi);
        let identity = q.transpose() * &q;
        assert!((identity - DMatrix::identity(dim, dim)).norm() < 1e-12);
        // Product of |R_ii| is |det|.
        assert!((accum.iter().sum::<f64>() - det.abs().ln()).abs() < 1e-12);
    }

    #[test]
    fn apply_qr_rejects_near_singular_matrix() {
        let dim = 2;
        let mut phi = vec![0.0; dim * dim];
        let mut accum = vec![0.0; dim];

        assert_err_contains(
            apply_qr(&mut phi, dim, &mut accum),
            "near-singular R matrix",
        );
    }

    #[test]
    fn kaplan_yorke_handles_empty_and_partial_sum() {
        assert_eq!(kaplan_yorke(&[]), 0.0);
        let result = kaplan_yorke(&[0.1, 0.0, -1.0]);
        assert!((result - 2.1).abs() < 1e-12);
    }

    #[test]
    fn largest_lyapunov_of_henon() {
        let mut ds =
            DynamicalSystemHandle::from_system(SystemKind::Map, Henon::default(), vec![0.0, 0.0], None)
                .unwrap();
        let lambda = largest_lyapunov(&mut ds, 20_000.0, 1e-9, 1.0, 100.0).unwrap();
        assert!((lambda - 0.42).abs() < 0.02, "{lambda}");
        assert_eq!(ds.current_time(), 20_100.0);
    }

    #[test]
    fn largest_lyapunov_of_linear_decay() {
        let rule = EvolutionRule::flow(|x: &[f64], _p: &(), _t| vec![-x[0]]);
        let mut ds = DynamicalSystemHandle::continuous(
            rule,
            vec![1.0],
            (),
            IntegratorConfig::fixed(IntegrationMethod::Rk4, 0.01),
        )
        .unwrap();
        let lambda = largest_lyapunov(&mut ds, 10.0, 1e-6, 0.5, 0.0).unwrap();
        assert!((lambda + 1.0).abs() < 1e-6, "{lambda}");
        assert!((ds.current_time() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn largest_lyapunov_validates_spans() {
        let mut ds =
            DynamicalSystemHandle::from_system(SystemKind::Map, Henon::default(), vec![0.0, 0.0], None)
                .unwrap();
        assert_err_contains(largest_lyapunov(&mut ds, 0.0, 1e-9, 1.0, 0.0), "Total time");
        assert_err_contains(largest_lyapunov(&mut ds, 10.0, -1.0, 1.0, 0.0), "d0");
        assert_err_contains(largest_lyapunov(&mut ds, 10.0, 1e-9, 0.5, 0.0), "whole numbers");
        assert_eq!(ds.current_time(), 0.0);
    }
}
