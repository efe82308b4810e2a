use crate::error::{EvolutionError, EvolutionResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationMethod {
    Rk4,
    Tsit5,
}

/// Integration settings for continuous-time handles.
///
/// With `adaptive = false`, `dt` is the fixed step. With `adaptive = true`
/// (Tsit5 only), `dt` is the first trial step and the controller keeps the
/// local error under `abstol + reltol * |y|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorConfig {
    pub method: IntegrationMethod,
    pub dt: f64,
    pub adaptive: bool,
    pub abstol: f64,
    pub reltol: f64,
    pub dtmin: f64,
    pub dtmax: Option<f64>,
    /// Consecutive rejected trial steps allowed before giving up.
    pub max_rejections: usize,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::Tsit5,
            dt: 0.01,
            adaptive: true,
            abstol: 1e-6,
            reltol: 1e-3,
            dtmin: 1e-12,
            dtmax: None,
            max_rejections: 50,
        }
    }
}

impl IntegratorConfig {
    pub fn fixed(method: IntegrationMethod, dt: f64) -> Self {
        Self {
            method,
            dt,
            adaptive: false,
            ..Self::default()
        }
    }

    pub fn adaptive(abstol: f64, reltol: f64) -> Self {
        Self {
            abstol,
            reltol,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> EvolutionResult<()> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(EvolutionError::config("dt must be positive and finite"));
        }
        if !self.adaptive {
            return Ok(());
        }
        if self.method == IntegrationMethod::Rk4 {
            return Err(EvolutionError::config(
                "adaptive stepping requires an embedded method (Tsit5)",
            ));
        }
        if !(self.abstol.is_finite() && self.abstol > 0.0) {
            return Err(EvolutionError::config("abstol must be positive"));
        }
        if !(self.reltol.is_finite() && self.reltol >= 0.0) {
            return Err(EvolutionError::config("reltol must be non-negative"));
        }
        if !(self.dtmin.is_finite() && self.dtmin > 0.0) {
            return Err(EvolutionError::config("dtmin must be positive"));
        }
        if let Some(dtmax) = self.dtmax {
            if !(dtmax > 0.0) || dtmax < self.dtmin {
                return Err(EvolutionError::config("dtmax must be positive and >= dtmin"));
            }
        }
        if self.dt < self.dtmin {
            return Err(EvolutionError::config("initial dt must be >= dtmin"));
        }
        if self.max_rejections == 0 {
            return Err(EvolutionError::config("max_rejections must be at least 1"));
        }
        Ok(())
    }
}
