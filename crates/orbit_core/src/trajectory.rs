//! Trajectory recording on top of [`DynamicalSystemHandle`].
//!
//! A recording is just a sequence of `step_until` calls: after it returns the
//! handle sits on the last recorded point.
//!
//! On a failed step the recorder returns the samples gathered so far inside
//! [`TrajectoryError::partial`]. That prefix is consistent (every point was a
//! committed handle state) but stops early; callers decide whether it is
//! usable.

use crate::error::{EvolutionError, EvolutionResult};
use crate::handle::DynamicalSystemHandle;
use crate::rule::SystemKind;
use crate::state_space_set::StateSpaceSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Tolerance on (horizon - transient) / interval before flooring, so that
// e.g. 10.0 / 0.1 counts 100 intervals.
const COUNT_SLACK: f64 = 1e-9;
const MAX_PREALLOCATED_SAMPLES: usize = 1 << 16;

/// Warm-up and sampling settings. Units are iterations for maps and time for
/// flows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryOptions {
    pub transient: f64,
    pub sampling_interval: f64,
}

impl Default for TrajectoryOptions {
    fn default() -> Self {
        Self {
            transient: 0.0,
            sampling_interval: 1.0,
        }
    }
}

impl TrajectoryOptions {
    pub fn with_transient(mut self, transient: f64) -> Self {
        self.transient = transient;
        self
    }

    pub fn with_sampling_interval(mut self, interval: f64) -> Self {
        self.sampling_interval = interval;
        self
    }

    /// Number of samples a recording over `horizon` produces:
    /// `floor((horizon - transient) / interval) + 1`.
    pub fn sample_count(&self, kind: SystemKind, horizon: f64) -> EvolutionResult<usize> {
        let Self {
            transient,
            sampling_interval: interval,
        } = *self;
        if !(horizon.is_finite() && horizon >= 0.0) {
            return Err(EvolutionError::config(
                "horizon must be finite and non-negative",
            ));
        }
        if !(transient.is_finite() && transient >= 0.0) {
            return Err(EvolutionError::config(
                "transient must be finite and non-negative",
            ));
        }
        if transient > horizon {
            return Err(EvolutionError::config("transient exceeds the horizon"));
        }
        if !(interval.is_finite() && interval > 0.0) {
            return Err(EvolutionError::config("sampling interval must be positive"));
        }
        if kind == SystemKind::Map
            && [horizon, transient, interval].iter().any(|v| v.fract() != 0.0)
        {
            return Err(EvolutionError::config(
                "map trajectories take whole numbers of iterations",
            ));
        }
        let span = (horizon - transient) / interval;
        let intervals = (span + COUNT_SLACK * span.max(1.0)).floor();
        Ok(intervals as usize + 1)
    }
}

/// Sampled states with their times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub states: StateSpaceSet,
    pub times: Vec<f64>,
}

impl Trajectory {
    fn empty(dimension: usize, capacity: usize) -> Self {
        Self {
            states: StateSpaceSet::with_capacity(dimension, capacity),
            times: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &[f64])> {
        self.times.iter().copied().zip(self.states.iter())
    }
}

/// A recording that stopped before the horizon.
#[derive(Error, Debug)]
#[error("trajectory stopped after sample {last_index:?}: {error}")]
pub struct TrajectoryError {
    #[source]
    pub error: EvolutionError,
    /// Index of the last recorded sample; `None` when nothing was recorded.
    pub last_index: Option<usize>,
    pub last_time: Option<f64>,
    /// The samples recorded before the failure.
    pub partial: Trajectory,
}

impl TrajectoryError {
    fn before_recording(error: EvolutionError, dimension: usize) -> Self {
        Self {
            error,
            last_index: None,
            last_time: None,
            partial: Trajectory::empty(dimension, 0),
        }
    }

    fn interrupted(error: EvolutionError, partial: Trajectory) -> Self {
        Self {
            error,
            last_index: partial.len().checked_sub(1),
            last_time: partial.times.last().copied(),
            partial,
        }
    }

    pub fn into_partial(self) -> Trajectory {
        self.partial
    }
}

/// Evolves `handle` for `horizon` (measured from its current time), skipping
/// the first `options.transient` and recording every
/// `options.sampling_interval`.
///
/// Sample `k` sits at `t0 + transient + k * interval`. For maps with the
/// defaults, `horizon = N` yields `N + 1` samples including the current state.
pub fn trajectory<P>(
    handle: &mut DynamicalSystemHandle<P>,
    horizon: f64,
    options: &TrajectoryOptions,
) -> Result<Trajectory, TrajectoryError> {
    let dim = handle.dimension();
    let count = options
        .sample_count(handle.kind(), horizon)
        .map_err(|e| TrajectoryError::before_recording(e, dim))?;
    if handle.is_diverged() {
        return Err(TrajectoryError::before_recording(
            EvolutionError::Diverged {
                time: handle.current_time(),
            },
            dim,
        ));
    }

    let t_first = handle.current_time() + options.transient;
    handle
        .step_until(t_first)
        .map_err(|e| TrajectoryError::before_recording(e, dim))?;

    let mut recorded = Trajectory::empty(dim, count.min(MAX_PREALLOCATED_SAMPLES));
    for k in 0..count {
        if k > 0 {
            let target = t_first + k as f64 * options.sampling_interval;
            if let Err(e) = handle.step_until(target) {
                tracing::warn!(
                    recorded = recorded.len(),
                    requested = count,
                    error = %e,
                    "trajectory interrupted"
                );
                return Err(TrajectoryError::interrupted(e, recorded));
            }
        }
        recorded.states.push(handle.state_slice());
        recorded.times.push(handle.current_time());
    }

    tracing::debug!(
        samples = recorded.len(),
        t_end = handle.current_time(),
        "trajectory recorded"
    );
    Ok(recorded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IntegrationMethod, IntegratorConfig};
    use crate::rule::EvolutionRule;

    fn counter() -> DynamicalSystemHandle<()> {
        let rule = EvolutionRule::map(|x: &[f64], _p: &(), _t| vec![x[0] + 1.0]);
        DynamicalSystemHandle::discrete(rule, vec![0.0], ()).unwrap()
    }

    fn rotation(dt: f64) -> DynamicalSystemHandle<()> {
        let rule = EvolutionRule::flow(|x: &[f64], _p: &(), _t| vec![x[1], -x[0]]);
        DynamicalSystemHandle::continuous(
            rule,
            vec![1.0, 0.0],
            (),
            IntegratorConfig::fixed(IntegrationMethod::Rk4, dt),
        )
        .unwrap()
    }

    #[test]
    fn map_trajectory_includes_initial_state() {
        let mut ds = counter();
        let tr = trajectory(&mut ds, 10.0, &TrajectoryOptions::default()).unwrap();
        assert_eq!(tr.len(), 11);
        assert_eq!(tr.states.column(0).unwrap(), (0..=10).map(f64::from).collect::<Vec<_>>());
        assert_eq!(tr.times, (0..=10).map(f64::from).collect::<Vec<_>>());
        assert_eq!(ds.current_time(), 10.0);
        assert_eq!(ds.current_state(), vec![10.0]);
    }

    #[test]
    fn map_transient_and_subsampling() {
        let mut ds = counter();
        let options = TrajectoryOptions::default()
            .with_transient(3.0)
            .with_sampling_interval(2.0);
        let tr = trajectory(&mut ds, 10.0, &options).unwrap();
        // floor((10 - 3) / 2) + 1
        assert_eq!(tr.len(), 4);
        assert_eq!(tr.times, vec![3.0, 5.0, 7.0, 9.0]);
        assert_eq!(tr.states.column(0).unwrap(), vec![3.0, 5.0, 7.0, 9.0]);
        assert_eq!(ds.current_time(), 9.0);
    }

    #[test]
    fn flow_samples_land_on_grid() {
        let mut ds = rotation(0.03);
        let options = TrajectoryOptions::default()
            .with_transient(0.5)
            .with_sampling_interval(0.1);
        let tr = trajectory(&mut ds, 10.5, &options).unwrap();
        assert_eq!(tr.len(), 101);
        for (k, (t, x)) in tr.iter().enumerate() {
            let expected = 0.5 + k as f64 * 0.1;
            assert!((t - expected).abs() < 1e-12);
            assert!((x[0] - t.cos()).abs() < 1e-5);
        }
        assert!(tr.times.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(ds.current_time(), *tr.times.last().unwrap());
    }

    #[test]
    fn trajectory_continues_from_current_time() {
        let mut ds = counter();
        ds.step_n(4).unwrap();
        let tr = trajectory(&mut ds, 2.0, &TrajectoryOptions::default()).unwrap();
        assert_eq!(tr.times, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn invalid_options_fail_before_stepping() {
        let mut ds = counter();
        let cases = [
            (5.0, TrajectoryOptions::default().with_transient(6.0)),
            (5.0, TrajectoryOptions::default().with_sampling_interval(0.0)),
            (5.0, TrajectoryOptions::default().with_sampling_interval(0.5)),
            (-1.0, TrajectoryOptions::default()),
            (f64::NAN, TrajectoryOptions::default()),
        ];
        for (horizon, options) in cases {
            let err = trajectory(&mut ds, horizon, &options).unwrap_err();
            assert!(matches!(err.error, EvolutionError::Config { .. }));
            assert!(err.partial.is_empty());
            assert_eq!(err.last_index, None);
        }
        assert_eq!(ds.current_time(), 0.0);
    }

    #[test]
    fn nan_on_third_step_keeps_prefix() {
        let rule = EvolutionRule::map(|x: &[f64], _p: &(), t: f64| {
            if t >= 2.0 {
                vec![f64::NAN]
            } else {
                vec![x[0] * 2.0]
            }
        });
        let mut ds = DynamicalSystemHandle::discrete(rule, vec![1.0], ()).unwrap();
        let err = trajectory(&mut ds, 10.0, &TrajectoryOptions::default()).unwrap_err();
        assert_eq!(err.error, EvolutionError::Diverged { time: 2.0 });
        assert_eq!(err.last_index, Some(2));
        assert_eq!(err.last_time, Some(2.0));
        assert_eq!(err.partial.states.column(0).unwrap(), vec![1.0, 2.0, 4.0]);
        assert!(ds.is_diverged());
        assert!(err.to_string().contains("Some(2)"));
    }

    #[test]
    fn divergence_in_transient_records_nothing() {
        let rule = EvolutionRule::map(|_x: &[f64], _p: &(), _t| vec![f64::INFINITY]);
        let mut ds = DynamicalSystemHandle::discrete(rule, vec![1.0], ()).unwrap();
        let options = TrajectoryOptions::default().with_transient(2.0);
        let err = trajectory(&mut ds, 5.0, &options).unwrap_err();
        assert_eq!(err.last_index, None);
        assert!(err.into_partial().is_empty());
    }

    #[test]
    fn step_size_underflow_keeps_prefix_without_diverging() {
        // x' = x^2 from x(0) = 1 blows up at t = 1.
        let rule = EvolutionRule::flow(|x: &[f64], _p: &(), _t| vec![x[0] * x[0]]);
        let config = IntegratorConfig {
            dtmin: 1e-6,
            ..IntegratorConfig::adaptive(1e-8, 1e-8)
        };
        let mut ds = DynamicalSystemHandle::continuous(rule, vec![1.0], (), config).unwrap();
        let options = TrajectoryOptions::default().with_sampling_interval(0.1);
        let err = trajectory(&mut ds, 2.0, &options).unwrap_err();

        match err.error {
            EvolutionError::IntegrationFailure { time, .. } => {
                assert!(time > 0.9 && time < 1.0);
            }
            ref other => panic!("expected integration failure, got {other:?}"),
        }
        assert_eq!(err.last_index, Some(9));
        assert_eq!(err.partial.len(), 10);
        for (k, (t, x)) in err.partial.iter().enumerate() {
            let expected = k as f64 * 0.1;
            assert!((t - expected).abs() < 1e-12);
            assert!((x[0] - 1.0 / (1.0 - t)).abs() < 1e-5 * x[0]);
        }

        assert!(!ds.is_diverged());
        assert!(ds.current_time() > 0.9 && ds.current_time() < 1.0);
        assert!(ds.current_state()[0].is_finite());
    }

    #[test]
    fn diverged_handle_refuses_to_record() {
        let rule = EvolutionRule::map(|_x: &[f64], _p: &(), _t| vec![f64::NAN]);
        let mut ds = DynamicalSystemHandle::discrete(rule, vec![1.0], ()).unwrap();
        assert!(ds.step().is_err());
        let err = ds.trajectory(3.0, &TrajectoryOptions::default()).unwrap_err();
        assert!(matches!(err.error, EvolutionError::Diverged { .. }));
        assert!(err.partial.is_empty());
    }
}
