//! Evolution rules: the user-supplied function plus its time domain.

use crate::traits::DynamicalSystem;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Whether time advances by iteration (map) or by integration (flow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemKind {
    Flow,
    Map,
}

pub type OutOfPlaceFn<P> = Arc<dyn Fn(&[f64], &P, f64) -> Vec<f64> + Send + Sync>;
pub type InPlaceFn<P> = Arc<dyn Fn(&mut [f64], &[f64], &P, f64) + Send + Sync>;

/// The two call forms a rule can take. Chosen once at construction.
pub enum RuleForm<P> {
    /// `rule(state, params, t) -> new_state`
    OutOfPlace(OutOfPlaceFn<P>),
    /// `rule(out, state, params, t)`
    InPlace(InPlaceFn<P>),
}

impl<P> Clone for RuleForm<P> {
    fn clone(&self) -> Self {
        match self {
            RuleForm::OutOfPlace(f) => RuleForm::OutOfPlace(Arc::clone(f)),
            RuleForm::InPlace(f) => RuleForm::InPlace(Arc::clone(f)),
        }
    }
}

/// A dynamic rule tagged with its time domain.
///
/// For maps the rule returns `x_{n+1}`; for flows it returns `dx/dt`.
pub struct EvolutionRule<P> {
    kind: SystemKind,
    form: RuleForm<P>,
}

impl<P> Clone for EvolutionRule<P> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            form: self.form.clone(),
        }
    }
}

impl<P> fmt::Debug for EvolutionRule<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let form = match self.form {
            RuleForm::OutOfPlace(_) => "OutOfPlace",
            RuleForm::InPlace(_) => "InPlace",
        };
        f.debug_struct("EvolutionRule")
            .field("kind", &self.kind)
            .field("form", &form)
            .finish()
    }
}

impl<P> EvolutionRule<P> {
    pub fn out_of_place<F>(kind: SystemKind, f: F) -> Self
    where
        F: Fn(&[f64], &P, f64) -> Vec<f64> + Send + Sync + 'static,
    {
        Self {
            kind,
            form: RuleForm::OutOfPlace(Arc::new(f)),
        }
    }

    pub fn in_place<F>(kind: SystemKind, f: F) -> Self
    where
        F: Fn(&mut [f64], &[f64], &P, f64) + Send + Sync + 'static,
    {
        Self {
            kind,
            form: RuleForm::InPlace(Arc::new(f)),
        }
    }

    pub fn map<F>(f: F) -> Self
    where
        F: Fn(&[f64], &P, f64) -> Vec<f64> + Send + Sync + 'static,
    {
        Self::out_of_place(SystemKind::Map, f)
    }

    pub fn flow<F>(f: F) -> Self
    where
        F: Fn(&[f64], &P, f64) -> Vec<f64> + Send + Sync + 'static,
    {
        Self::out_of_place(SystemKind::Flow, f)
    }

    pub fn kind(&self) -> SystemKind {
        self.kind
    }

    pub fn form(&self) -> &RuleForm<P> {
        &self.form
    }

    pub fn is_in_place(&self) -> bool {
        matches!(self.form, RuleForm::InPlace(_))
    }

    pub(crate) fn bind<'a>(&'a self, params: &'a P, dimension: usize) -> BoundRule<'a, P> {
        BoundRule {
            form: &self.form,
            params,
            dimension,
        }
    }
}

impl<P> EvolutionRule<P>
where
    P: DynamicalSystem<f64> + 'static,
{
    /// Rule that evaluates the parameter container itself as the system.
    /// Lets a typed system struct (see [`crate::systems`]) serve as both the
    /// dynamics and the parameter set.
    pub fn from_system(kind: SystemKind) -> Self {
        Self::in_place(kind, |out: &mut [f64], x: &[f64], p: &P, t: f64| {
            p.apply(t, x, out)
        })
    }
}

/// A rule with its parameters attached, viewed as a [`DynamicalSystem`] so the
/// generic steppers can drive it.
pub(crate) struct BoundRule<'a, P> {
    form: &'a RuleForm<P>,
    params: &'a P,
    dimension: usize,
}

impl<P> DynamicalSystem<f64> for BoundRule<'_, P> {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        match self.form {
            RuleForm::InPlace(f) => f(out, x, self.params, t),
            RuleForm::OutOfPlace(f) => {
                let next = f(x, self.params, t);
                if next.len() == out.len() {
                    out.copy_from_slice(&next);
                } else {
                    // Arity drift after construction surfaces as divergence.
                    out.fill(f64::NAN);
                }
            }
        }
    }
}
