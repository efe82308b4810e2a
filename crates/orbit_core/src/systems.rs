//! Textbook systems, generic over [`Scalar`] so they can also be evaluated on
//! dual numbers. Each struct is its own parameter container.

use crate::error::{EvolutionError, EvolutionResult};
use crate::params::{ParamKey, ParameterSet};
use crate::traits::{DynamicalSystem, Scalar};
use serde::{Deserialize, Serialize};

fn lit<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// Writes `value` into the field whose name or position matches `key`.
fn set_named(fields: &mut [(&str, &mut f64)], key: &ParamKey, value: f64) -> EvolutionResult<()> {
    let slot = match key {
        ParamKey::Index(i) => fields.get_mut(*i),
        ParamKey::Name(name) => fields.iter_mut().find(|(n, _)| *n == name.as_str()),
    };
    match slot {
        Some((_, field)) => {
            **field = value;
            Ok(())
        }
        None => Err(EvolutionError::unknown_parameter(key.to_string())),
    }
}

/// Henon map: `(x, y) -> (1 - a x^2 + y, b x)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Henon {
    pub a: f64,
    pub b: f64,
}

impl Default for Henon {
    fn default() -> Self {
        Self { a: 1.4, b: 0.3 }
    }
}

impl Henon {
    /// The fixed point on the attractor side, `x* = (b - 1 + sqrt((1 - b)^2 + 4a)) / 2a`.
    pub fn fixed_point(&self) -> [f64; 2] {
        let x = (self.b - 1.0 + ((1.0 - self.b).powi(2) + 4.0 * self.a).sqrt()) / (2.0 * self.a);
        [x, self.b * x]
    }
}

impl<T: Scalar> DynamicalSystem<T> for Henon {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let a = lit::<T>(self.a);
        let b = lit::<T>(self.b);
        out[0] = T::one() - a * x[0] * x[0] + x[1];
        out[1] = b * x[0];
    }
}

impl ParameterSet for Henon {
    fn set_parameter(&mut self, key: &ParamKey, value: f64) -> EvolutionResult<()> {
        set_named(&mut [("a", &mut self.a), ("b", &mut self.b)], key, value)
    }
}

/// Lorenz-96 with `n` sites on a ring:
/// `dx_i/dt = (x_{i+1} - x_{i-2}) x_{i-1} - x_i + F`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Lorenz96Fields")]
pub struct Lorenz96 {
    n: usize,
    pub forcing: f64,
}

#[derive(Deserialize)]
struct Lorenz96Fields {
    n: usize,
    forcing: f64,
}

impl TryFrom<Lorenz96Fields> for Lorenz96 {
    type Error = EvolutionError;

    fn try_from(fields: Lorenz96Fields) -> EvolutionResult<Self> {
        Self::new(fields.n, fields.forcing)
    }
}

impl Lorenz96 {
    pub fn new(n: usize, forcing: f64) -> EvolutionResult<Self> {
        if n < 4 {
            return Err(EvolutionError::dimension(
                "Lorenz-96 needs at least 4 sites",
            ));
        }
        Ok(Self { n, forcing })
    }

    pub fn sites(&self) -> usize {
        self.n
    }
}

impl<T: Scalar> DynamicalSystem<T> for Lorenz96 {
    fn dimension(&self) -> usize {
        self.n
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let n = self.n;
        let f = lit::<T>(self.forcing);
        for i in 0..n {
            let next = x[(i + 1) % n];
            let prev = x[(i + n - 1) % n];
            let prev2 = x[(i + n - 2) % n];
            out[i] = (next - prev2) * prev - x[i] + f;
        }
    }
}

impl ParameterSet for Lorenz96 {
    fn set_parameter(&mut self, key: &ParamKey, value: f64) -> EvolutionResult<()> {
        set_named(&mut [("F", &mut self.forcing)], key, value)
    }
}

/// Van der Pol oscillator: `x' = y`, `y' = mu (1 - x^2) y - x`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VanDerPol {
    pub mu: f64,
}

impl Default for VanDerPol {
    fn default() -> Self {
        Self { mu: 1.0 }
    }
}

impl<T: Scalar> DynamicalSystem<T> for VanDerPol {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let mu = lit::<T>(self.mu);
        out[0] = x[1];
        out[1] = mu * (T::one() - x[0] * x[0]) * x[1] - x[0];
    }
}

impl ParameterSet for VanDerPol {
    fn set_parameter(&mut self, key: &ParamKey, value: f64) -> EvolutionResult<()> {
        set_named(&mut [("mu", &mut self.mu)], key, value)
    }
}

/// Roessler system: `x' = -y - z`, `y' = x + a y`, `z' = b + z (x - c)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roessler {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Default for Roessler {
    fn default() -> Self {
        Self {
            a: 0.2,
            b: 0.2,
            c: 5.7,
        }
    }
}

impl<T: Scalar> DynamicalSystem<T> for Roessler {
    fn dimension(&self) -> usize {
        3
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let a = lit::<T>(self.a);
        let b = lit::<T>(self.b);
        let c = lit::<T>(self.c);
        out[0] = -x[1] - x[2];
        out[1] = x[0] + a * x[1];
        out[2] = b + x[2] * (x[0] - c);
    }
}

impl ParameterSet for Roessler {
    fn set_parameter(&mut self, key: &ParamKey, value: f64) -> EvolutionResult<()> {
        set_named(
            &mut [("a", &mut self.a), ("b", &mut self.b), ("c", &mut self.c)],
            key,
            value,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntegratorConfig;
    use crate::handle::DynamicalSystemHandle;
    use crate::rule::SystemKind;

    #[test]
    fn henon_fixed_point_is_invariant() {
        let henon = Henon::default();
        let fp = henon.fixed_point();
        let mut ds =
            DynamicalSystemHandle::from_system(SystemKind::Map, henon, fp.to_vec(), None).unwrap();
        ds.step_n(20).unwrap();
        let x = ds.current_state();
        // The point is a saddle, so roundoff grows; 20 iterations stay close.
        assert!((x[0] - fp[0]).abs() < 1e-6);
        assert!((x[1] - fp[1]).abs() < 1e-6);
    }

    #[test]
    fn lorenz96_equilibrium_at_forcing() {
        let system = Lorenz96::new(5, 8.0).unwrap();
        let mut out = [0.0; 5];
        DynamicalSystem::<f64>::apply(&system, 0.0, &[8.0; 5], &mut out);
        assert!(out.iter().all(|v| v.abs() < 1e-12));
        assert!(Lorenz96::new(3, 8.0).is_err());
    }

    #[test]
    fn van_der_pol_settles_on_limit_cycle() {
        let mut ds = DynamicalSystemHandle::from_system(
            SystemKind::Flow,
            VanDerPol::default(),
            vec![0.1, 0.0],
            Some(IntegratorConfig::adaptive(1e-8, 1e-8)),
        )
        .unwrap();
        ds.step_until(50.0).unwrap();
        let tr = ds
            .trajectory(20.0, &crate::trajectory::TrajectoryOptions::default().with_sampling_interval(0.01))
            .unwrap();
        let amplitude = tr.states.maxima()[0];
        // Limit cycle amplitude for mu = 1 is about 2.009.
        assert!((amplitude - 2.009).abs() < 0.02);
    }

    #[test]
    fn roessler_stays_bounded() {
        let mut ds = DynamicalSystemHandle::from_system(
            SystemKind::Flow,
            Roessler::default(),
            vec![1.0, 1.0, 0.0],
            Some(IntegratorConfig::default()),
        )
        .unwrap();
        let tr = ds
            .trajectory(200.0, &crate::trajectory::TrajectoryOptions::default().with_transient(50.0))
            .unwrap();
        assert_eq!(tr.len(), 151);
        assert!(tr.states.maxima()[0] < 15.0);
        assert!(tr.states.minima()[0] > -15.0);
    }

    #[test]
    fn named_parameters_on_typed_systems() {
        let mut ds = DynamicalSystemHandle::from_system(
            SystemKind::Map,
            Henon::default(),
            vec![0.0, 0.0],
            None,
        )
        .unwrap();
        ds.set_parameter("a", 1.2).unwrap();
        ds.set_parameter(1usize, 0.2).unwrap();
        assert_eq!(ds.parameters(), &Henon { a: 1.2, b: 0.2 });
        assert!(ds.set_parameter("mu", 0.0).is_err());

        let mut l96 = Lorenz96::new(6, 8.0).unwrap();
        l96.set_parameter(&"F".into(), 4.0).unwrap();
        assert_eq!(l96.forcing, 4.0);
        assert!(l96.set_parameter(&ParamKey::Index(1), 4.0).is_err());
    }

    #[test]
    fn lorenz96_deserialize_checks_sites() {
        let l96: Lorenz96 = serde_json::from_str(r#"{"n":5,"forcing":8.0}"#).unwrap();
        assert_eq!(l96.sites(), 5);
        assert_eq!(serde_json::to_string(&l96).unwrap(), r#"{"n":5,"forcing":8.0}"#);

        let err = serde_json::from_str::<Lorenz96>(r#"{"n":1,"forcing":8.0}"#).unwrap_err();
        assert!(err.to_string().contains("at least 4 sites"));
    }

    #[test]
    fn from_system_checks_dimension() {
        let err = DynamicalSystemHandle::from_system(
            SystemKind::Flow,
            Roessler::default(),
            vec![1.0, 1.0],
            Some(IntegratorConfig::default()),
        )
        .unwrap_err();
        assert!(matches!(err, EvolutionError::Dimension { .. }));
    }
}
