//! Fixed points of maps and equilibria of flows by damped Newton iteration.

use crate::{
    autodiff::{jacobian, Dual},
    rule::SystemKind,
    traits::DynamicalSystem,
};
use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedPointResult {
    pub state: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
    /// Jacobian of the rule itself (not of the residual), row-major.
    pub jacobian: Vec<f64>,
    pub eigenvalues: Vec<Complex<f64>>,
    /// `Re λ < 0` for every eigenvalue of a flow, `|λ| < 1` for a map.
    pub stable: bool,
}

/// Solves `f(x) = 0` for flows or `f(x) = x` for maps starting at `guess`.
pub fn find_fixed_point<S>(
    system: &S,
    kind: SystemKind,
    guess: &[f64],
    settings: NewtonSettings,
) -> Result<FixedPointResult>
where
    S: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    let dim = DynamicalSystem::<f64>::dimension(system);
    if dim == 0 {
        bail!("System has zero dimension.");
    }
    if guess.len() != dim {
        bail!(
            "Initial guess dimension mismatch. Expected {}, got {}.",
            dim,
            guess.len()
        );
    }
    if settings.max_steps == 0 {
        bail!("max_steps must be greater than zero.");
    }
    if !(settings.damping > 0.0 && settings.damping <= 1.0) {
        bail!("damping must be in (0, 1].");
    }
    if settings.tolerance <= 0.0 {
        bail!("tolerance must be positive.");
    }

    let mut state = guess.to_vec();
    let mut residual = vec![0.0; dim];
    evaluate_residual(system, kind, &state, &mut residual);
    let mut residual_norm = l2_norm(&residual);
    let mut iterations = 0usize;

    while residual_norm > settings.tolerance {
        if !residual_norm.is_finite() {
            bail!("Residual became non-finite after {iterations} Newton steps.");
        }
        if iterations >= settings.max_steps {
            bail!(
                "Newton solver failed to converge in {} steps (‖f(x)‖ = {}).",
                settings.max_steps,
                residual_norm
            );
        }

        let jac = residual_jacobian(system, kind, &state);
        let delta = solve_linear_system(dim, &jac, &residual)
            .context("Failed to solve linear system during Newton iteration.")?;

        for (x, dx) in state.iter_mut().zip(&delta) {
            *x -= settings.damping * dx;
        }

        iterations += 1;
        evaluate_residual(system, kind, &state, &mut residual);
        residual_norm = l2_norm(&residual);
        tracing::trace!(iterations, residual_norm, "newton step");
    }

    let jac = jacobian(system, 0.0, &state);
    let eigenvalues: Vec<Complex<f64>> = DMatrix::from_row_slice(dim, dim, &jac)
        .complex_eigenvalues()
        .iter()
        .copied()
        .collect();
    let stable = match kind {
        SystemKind::Flow => eigenvalues.iter().all(|l| l.re < 0.0),
        SystemKind::Map => eigenvalues.iter().all(|l| l.norm() < 1.0),
    };
    tracing::debug!(iterations, residual_norm, stable, "fixed point converged");

    Ok(FixedPointResult {
        state,
        residual_norm,
        iterations,
        jacobian: jac,
        eigenvalues,
        stable,
    })
}

fn evaluate_residual<S>(system: &S, kind: SystemKind, state: &[f64], out: &mut [f64])
where
    S: DynamicalSystem<f64> + ?Sized,
{
    system.apply(0.0, state, out);
    if kind == SystemKind::Map {
        for (o, x) in out.iter_mut().zip(state) {
            *o -= x;
        }
    }
}

fn residual_jacobian<S>(system: &S, kind: SystemKind, state: &[f64]) -> Vec<f64>
where
    S: DynamicalSystem<Dual> + ?Sized,
{
    let dim = state.len();
    let mut jac = jacobian(system, 0.0, state);
    if kind == SystemKind::Map {
        for i in 0..dim {
            jac[i * dim + i] -= 1.0;
        }
    }
    jac
}

fn solve_linear_system(dim: usize, jacobian: &[f64], residual: &[f64]) -> Result<Vec<f64>> {
    let j_matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let rhs = DVector::from_column_slice(residual);
    j_matrix
        .lu()
        .solve(&rhs)
        .map(|v| v.iter().cloned().collect())
        .ok_or_else(|| anyhow!("Jacobian is singular."))
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}
