pub mod autodiff;
pub mod component;
pub mod equation_engine;
pub mod error;
pub mod expression;
pub mod finite_difference;
pub mod jacobian;
pub mod restore;
/// The `mdo_core` crate provides the component layer of an MDO model: named
/// variables, residual evaluation, and partial derivatives for solvers.
///
/// Key components:
/// - **Variables**: `VariableRegistry` (params, outputs, states) and flat `VariableVector` storage.
/// - **Component**: `Component<M>` wrapping a user `Model`, with residual and linear operations.
/// - **Finite Difference**: Jacobian approximation with exact restoration of every perturbed value.
/// - **Jacobian**: dense blocks applied in forward or reverse mode.
/// - **Expressions**: equation-defined components differentiated with Dual numbers.
pub mod traits;
pub mod variables;
pub mod vector;

pub use component::{Component, ExplicitFn, Lifecycle, Model};
pub use error::{ComponentError, ErrorCategory, Result};
pub use expression::{expression_component, ExprModel};
pub use finite_difference::{FdForm, FdOverrides, FdSettings, StepType};
pub use jacobian::{Jacobian, LinearMode};
pub use variables::{VarKind, VarOptions, VarValue, VariableMetadata, VariableRegistry};
pub use vector::{VariableVector, Vectors};
