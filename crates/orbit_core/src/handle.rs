//! The dynamical system handle: one concrete instance of a system and the only
//! place its state and time change.

use crate::config::IntegratorConfig;
use crate::error::{EvolutionError, EvolutionResult};
use crate::params::{ParamKey, ParameterSet};
use crate::rule::{EvolutionRule, RuleForm, SystemKind};
use crate::solvers::{Backend, IntegrationBackend};
use crate::traits::DynamicalSystem;
use crate::trajectory::{self, Trajectory, TrajectoryError, TrajectoryOptions};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    /// A step produced a non-finite state. Terminal.
    Diverged,
}

/// Rule + state + parameters + time (+ backend for flows).
///
/// Not meant to be shared across threads while stepping; clone it (the rule is
/// reference counted) to run independent copies in parallel.
#[derive(Clone)]
pub struct DynamicalSystemHandle<P> {
    rule: EvolutionRule<P>,
    params: P,
    state: Vec<f64>,
    scratch: Vec<f64>,
    time: f64,
    config: Option<IntegratorConfig>,
    backend: Backend,
    status: Status,
}

impl<P> DynamicalSystemHandle<P> {
    /// Builds a handle at `t = 0`.
    ///
    /// Maps take no `config`; flows require one. Out-of-place rules are
    /// evaluated once on `initial_state` to check their output length.
    pub fn new(
        rule: EvolutionRule<P>,
        initial_state: Vec<f64>,
        params: P,
        config: Option<IntegratorConfig>,
    ) -> EvolutionResult<Self> {
        let dim = initial_state.len();
        if dim == 0 {
            return Err(EvolutionError::dimension(
                "initial state must have positive dimension",
            ));
        }

        match (rule.kind(), config.as_ref()) {
            (SystemKind::Map, Some(_)) => {
                return Err(EvolutionError::config(
                    "integration config supplied for a discrete-time rule",
                ));
            }
            (SystemKind::Flow, None) => {
                return Err(EvolutionError::config(
                    "continuous-time rule requires an integration config",
                ));
            }
            (SystemKind::Flow, Some(config)) => config.validate()?,
            (SystemKind::Map, None) => {}
        }

        if let RuleForm::OutOfPlace(f) = rule.form() {
            let probe = f(&initial_state, &params, 0.0);
            if probe.len() != dim {
                return Err(EvolutionError::dimension(format!(
                    "rule returned {} components for a {dim}-dimensional state",
                    probe.len()
                )));
            }
        }

        let backend = Backend::build(rule.kind(), dim, config.as_ref());
        tracing::debug!(
            kind = ?rule.kind(),
            dimension = dim,
            in_place = rule.is_in_place(),
            adaptive = config.map(|c| c.adaptive).unwrap_or(false),
            "constructed dynamical system handle"
        );

        Ok(Self {
            rule,
            params,
            scratch: vec![0.0; dim],
            state: initial_state,
            time: 0.0,
            config,
            backend,
            status: Status::Running,
        })
    }

    pub fn discrete(
        rule: EvolutionRule<P>,
        initial_state: Vec<f64>,
        params: P,
    ) -> EvolutionResult<Self> {
        Self::new(rule, initial_state, params, None)
    }

    pub fn continuous(
        rule: EvolutionRule<P>,
        initial_state: Vec<f64>,
        params: P,
        config: IntegratorConfig,
    ) -> EvolutionResult<Self> {
        Self::new(rule, initial_state, params, Some(config))
    }

    /// Advances one iteration (maps) or one integration step (flows).
    pub fn step(&mut self) -> EvolutionResult<()> {
        self.advance(f64::INFINITY)
    }

    pub fn step_n(&mut self, n: usize) -> EvolutionResult<()> {
        for _ in 0..n {
            self.step()?;
        }
        Ok(())
    }

    /// Steps until `current_time() >= t`. Flows clip the last step so the
    /// handle lands exactly on `t`; maps stop at the first integer time at
    /// or past `t`.
    pub fn step_until(&mut self, t: f64) -> EvolutionResult<()> {
        if !t.is_finite() {
            return Err(EvolutionError::config("stop time must be finite"));
        }
        while self.time < t {
            self.advance(t)?;
        }
        Ok(())
    }

    fn advance(&mut self, t_limit: f64) -> EvolutionResult<()> {
        if self.status == Status::Diverged {
            return Err(EvolutionError::Diverged { time: self.time });
        }

        let dim = self.state.len();
        self.scratch.copy_from_slice(&self.state);
        let system = self.rule.bind(&self.params, dim);
        let t_new = self
            .backend
            .integrate(&system, self.time, &mut self.scratch, t_limit)?;

        if self.scratch.iter().any(|v| !v.is_finite()) {
            self.status = Status::Diverged;
            tracing::warn!(time = self.time, "non-finite state produced; handle diverged");
            return Err(EvolutionError::Diverged { time: self.time });
        }

        debug_assert!(t_new >= self.time);
        std::mem::swap(&mut self.state, &mut self.scratch);
        self.time = t_new;
        tracing::trace!(t = self.time, "step");
        Ok(())
    }

    /// Owned copy of the current state.
    pub fn current_state(&self) -> Vec<f64> {
        self.state.clone()
    }

    pub fn current_time(&self) -> f64 {
        self.time
    }

    /// Replaces the state without touching time or parameters.
    pub fn set_state(&mut self, state: &[f64]) -> EvolutionResult<()> {
        if self.status == Status::Diverged {
            return Err(EvolutionError::Diverged { time: self.time });
        }
        if state.len() != self.state.len() {
            return Err(EvolutionError::dimension(format!(
                "expected a {}-dimensional state, got {}",
                self.state.len(),
                state.len()
            )));
        }
        if state.iter().any(|v| !v.is_finite()) {
            return Err(EvolutionError::config("state must be finite"));
        }
        self.state.copy_from_slice(state);
        Ok(())
    }

    pub(crate) fn state_slice(&self) -> &[f64] {
        &self.state
    }

    pub fn dimension(&self) -> usize {
        self.state.len()
    }

    pub fn kind(&self) -> SystemKind {
        self.rule.kind()
    }

    pub fn rule(&self) -> &EvolutionRule<P> {
        &self.rule
    }

    pub fn parameters(&self) -> &P {
        &self.params
    }

    pub fn config(&self) -> Option<&IntegratorConfig> {
        self.config.as_ref()
    }

    pub fn is_diverged(&self) -> bool {
        self.status == Status::Diverged
    }

    /// Records a trajectory; see [`trajectory::trajectory`].
    pub fn trajectory(
        &mut self,
        horizon: f64,
        options: &TrajectoryOptions,
    ) -> Result<Trajectory, TrajectoryError> {
        trajectory::trajectory(self, horizon, options)
    }
}

impl<P: ParameterSet> DynamicalSystemHandle<P> {
    /// Replaces one parameter. State and time are left as they are.
    pub fn set_parameter(&mut self, key: impl Into<ParamKey>, value: f64) -> EvolutionResult<()> {
        let key = key.into();
        self.params.set_parameter(&key, value)?;
        tracing::debug!(%key, value, "parameter updated");
        Ok(())
    }
}

impl<P> DynamicalSystemHandle<P>
where
    P: DynamicalSystem<f64> + 'static,
{
    /// Handle whose parameter container is the system itself.
    pub fn from_system(
        kind: SystemKind,
        system: P,
        initial_state: Vec<f64>,
        config: Option<IntegratorConfig>,
    ) -> EvolutionResult<Self> {
        if system.dimension() != initial_state.len() {
            return Err(EvolutionError::dimension(format!(
                "system has dimension {} but the initial state has {}",
                system.dimension(),
                initial_state.len()
            )));
        }
        Self::new(EvolutionRule::from_system(kind), initial_state, system, config)
    }
}

impl<P> fmt::Debug for DynamicalSystemHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicalSystemHandle")
            .field("rule", &self.rule)
            .field("state", &self.state)
            .field("time", &self.time)
            .field("config", &self.config)
            .field("status", &self.status)
            .finish()
    }
}
