use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// Numeric type a rule can be evaluated on.
/// Implemented for `f64` and for [`Dual`](crate::autodiff::Dual), so the same
/// system drives both plain stepping and tangent-space evolution.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A dynamical system in in-place form: a vector field (flow) or an update
/// rule (map) of fixed dimension.
pub trait DynamicalSystem<T: Scalar> {
    /// Dimension of the state space.
    fn dimension(&self) -> usize;

    /// Writes `dx/dt` (flows) or `x_{n+1}` (maps) for state `x` at time `t`
    /// into `out`. `out` never aliases `x`.
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// Fixed-size stepping of a [`DynamicalSystem`].
pub trait Steppable<T: Scalar> {
    /// Advances `state` by one step of size `dt` and moves `t` forward by `dt`.
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T);
}
