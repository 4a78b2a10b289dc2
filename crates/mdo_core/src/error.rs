use thiserror::Error;

use crate::variables::VarKind;

/// Result type alias using [`ComponentError`].
pub type Result<T> = std::result::Result<T, ComponentError>;

/// Coarse classification of a [`ComponentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing or inconsistent setup: shapes, step sizes, Jacobians.
    Configuration,
    /// Operation not allowed in the component's current lifecycle state.
    State,
    /// Non-finite values produced while differentiating.
    Numerical,
    /// A user-supplied behavior failed.
    Evaluation,
}

/// Every variant carries the path of the component that raised it.
#[derive(Error, Debug)]
pub enum ComponentError {
    // ============ Configuration ============
    #[error("{component}: Shape of {kind} '{variable}' must be specified because 'value' is not set")]
    MissingShape {
        component: String,
        variable: String,
        kind: VarKind,
    },

    #[error("{component}: {kind} '{variable}' has {actual} values but shape {shape:?} requires {expected}")]
    ShapeMismatch {
        component: String,
        variable: String,
        kind: VarKind,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("{component}: finite difference step size must be positive and finite (got {step_size})")]
    InvalidStepSize { component: String, step_size: f64 },

    #[error("No derivatives defined for component '{component}'")]
    MissingJacobian { component: String },

    #[error("{component}: Jacobian block ('{output}', '{input}') is {rows}x{cols}, expected {expected_rows}x{expected_cols}")]
    BlockShape {
        component: String,
        output: String,
        input: String,
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },

    #[error("{component}: {message}")]
    VectorLayout { component: String, message: String },

    #[error("{component}: invalid expression '{expression}': {message}")]
    Expression {
        component: String,
        expression: String,
        message: String,
    },

    // ============ State ============
    #[error("{component}: variable '{variable}' already exists")]
    DuplicateVariable { component: String, variable: String },

    #[error("{component}: can't add variable '{variable}' because setup has already been called")]
    AlreadyFinalized { component: String, variable: String },

    #[error("{component}: variables have already been set up")]
    SetupRepeated { component: String },

    #[error("{component}: {operation} requires variables to be set up first")]
    NotFinalized {
        component: String,
        operation: &'static str,
    },

    // ============ Numerical ============
    #[error("{component}: non-finite derivative d({output})/d({input}[{index}]) = {value}")]
    NonFiniteDerivative {
        component: String,
        output: String,
        input: String,
        index: usize,
        value: f64,
    },

    // ============ Evaluation ============
    #[error("{component}: {operation} failed: {source}")]
    Evaluation {
        component: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{component}: evaluation with '{input}[{index}]' perturbed failed: {source}")]
    PerturbedEvaluation {
        component: String,
        input: String,
        index: usize,
        #[source]
        source: Box<ComponentError>,
    },
}

impl ComponentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingShape { .. }
            | Self::ShapeMismatch { .. }
            | Self::InvalidStepSize { .. }
            | Self::MissingJacobian { .. }
            | Self::BlockShape { .. }
            | Self::VectorLayout { .. }
            | Self::Expression { .. } => ErrorCategory::Configuration,
            Self::DuplicateVariable { .. }
            | Self::AlreadyFinalized { .. }
            | Self::SetupRepeated { .. }
            | Self::NotFinalized { .. } => ErrorCategory::State,
            Self::NonFiniteDerivative { .. } => ErrorCategory::Numerical,
            Self::Evaluation { .. } => ErrorCategory::Evaluation,
            Self::PerturbedEvaluation { source, .. } => source.category(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    pub fn is_state(&self) -> bool {
        self.category() == ErrorCategory::State
    }

    /// Wrap a failure of a user-supplied hook.
    pub fn evaluation(
        component: impl Into<String>,
        operation: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self::Evaluation {
            component: component.into(),
            operation,
            source,
        }
    }
}
