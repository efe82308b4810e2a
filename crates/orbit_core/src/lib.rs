//! The `orbit_core` crate evolves user-supplied dynamical systems: discrete maps
//! iterated one step at a time and continuous flows integrated numerically.
//!
//! Key components:
//! - **Handle**: `DynamicalSystemHandle` owns rule, state, parameters and time; `step` is the only mutation path.
//! - **Trajectory**: recording with transient and sampling interval into a `StateSpaceSet`.
//! - **Solvers**: RK4, Tsit5 (fixed and adaptive) and the discrete iterator behind one backend contract.
//! - **Equation Engine**: string-defined rules compiled to bytecode for a small stack VM.
//! - **Autodiff**: dual numbers and `TangentSystem` for Jacobian-based analysis.
//! - **Analysis**: Lyapunov spectrum, largest Lyapunov exponent and fixed points.

pub mod analysis;
pub mod autodiff;
pub mod config;
pub mod equation_engine;
pub mod error;
pub mod fixed_point;
pub mod handle;
pub mod params;
pub mod rule;
pub mod solvers;
pub mod state_space_set;
pub mod systems;
pub mod traits;
pub mod trajectory;

pub use config::{IntegrationMethod, IntegratorConfig};
pub use error::{EvolutionError, EvolutionResult};
pub use handle::DynamicalSystemHandle;
pub use params::{ParamKey, ParameterSet, Parameters};
pub use rule::{EvolutionRule, RuleForm, SystemKind};
pub use state_space_set::StateSpaceSet;
pub use traits::{DynamicalSystem, Scalar, Steppable};
pub use trajectory::{trajectory, Trajectory, TrajectoryError, TrajectoryOptions};
