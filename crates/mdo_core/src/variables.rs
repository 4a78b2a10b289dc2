use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ComponentError, Result};

/// Separator between the component path and a variable's local name.
pub const PATH_SEPARATOR: &str = ":";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    Param,
    Output,
    State,
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VarKind::Param => "param",
            VarKind::Output => "output",
            VarKind::State => "state",
        };
        f.write_str(label)
    }
}

/// Numeric value of a variable. Arrays are stored flat in row-major order;
/// the accompanying shape lives in [`VariableMetadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Scalar(f64),
    Array(Vec<f64>),
}

impl VarValue {
    pub fn len(&self) -> usize {
        match self {
            VarValue::Scalar(_) => 1,
            VarValue::Array(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[f64] {
        match self {
            VarValue::Scalar(value) => std::slice::from_ref(value),
            VarValue::Array(values) => values,
        }
    }

    fn default_shape(&self) -> Vec<usize> {
        match self {
            VarValue::Scalar(_) => vec![1],
            VarValue::Array(values) => vec![values.len()],
        }
    }
}

impl From<f64> for VarValue {
    fn from(value: f64) -> Self {
        VarValue::Scalar(value)
    }
}

impl From<Vec<f64>> for VarValue {
    fn from(values: Vec<f64>) -> Self {
        VarValue::Array(values)
    }
}

impl From<&[f64]> for VarValue {
    fn from(values: &[f64]) -> Self {
        VarValue::Array(values.to_vec())
    }
}

/// A shape denotes a single value when it is `[]` or `[1]`.
fn is_scalar_shape(shape: &[usize]) -> bool {
    shape.is_empty() || shape == [1]
}

fn shape_size(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Options accepted by the `declare_*` calls.
#[derive(Debug, Clone, Default)]
pub struct VarOptions {
    pub value: Option<VarValue>,
    pub shape: Option<Vec<usize>>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl VarOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, value: impl Into<VarValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    /// Attach an opaque annotation (units, bounds, ...).
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Catalog entry for one declared variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMetadata {
    /// Path-qualified once the registry is finalized, local before that.
    pub name: String,
    pub relative_name: String,
    pub kind: VarKind,
    pub value: VarValue,
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl VariableMetadata {
    pub fn size(&self) -> usize {
        self.value.len()
    }

    pub fn is_state(&self) -> bool {
        self.kind == VarKind::State
    }
}

/// Ordered catalog with a name index. Declaration order defines vector layout.
#[derive(Debug, Clone, Default)]
struct Catalog {
    entries: Vec<VariableMetadata>,
    index: HashMap<String, usize>,
}

impl Catalog {
    fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<&VariableMetadata> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    fn push(&mut self, meta: VariableMetadata) {
        self.index.insert(meta.name.clone(), self.entries.len());
        self.entries.push(meta);
    }

    fn rekey(&mut self, prefix: &str) {
        self.index.clear();
        for (i, meta) in self.entries.iter_mut().enumerate() {
            meta.name = qualified_name(prefix, &meta.relative_name);
            self.index.insert(meta.name.clone(), i);
        }
    }
}

/// `prefix:local`, or `local` when the prefix is empty.
pub fn qualified_name(prefix: &str, local: &str) -> String {
    if prefix.is_empty() {
        local.to_string()
    } else {
        [prefix, local].join(PATH_SEPARATOR)
    }
}

/// Params, outputs and states declared by one component.
///
/// Entries are declared under local names; `finalize` rekeys them with the
/// component path once and locks the catalog.
#[derive(Debug, Clone)]
pub struct VariableRegistry {
    pathname: String,
    params: Catalog,
    unknowns: Catalog,
    finalized: bool,
}

impl VariableRegistry {
    /// `owner` names the component in error messages until `finalize`
    /// assigns its path.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            pathname: owner.into(),
            params: Catalog::default(),
            unknowns: Catalog::default(),
            finalized: false,
        }
    }

    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_empty(&self) -> bool {
        self.params.entries.is_empty() && self.unknowns.entries.is_empty()
    }

    pub fn declare_param(&mut self, name: &str, options: VarOptions) -> Result<()> {
        let meta = self.build(name, VarKind::Param, options)?;
        self.params.push(meta);
        Ok(())
    }

    pub fn declare_output(&mut self, name: &str, options: VarOptions) -> Result<()> {
        let meta = self.build(name, VarKind::Output, options)?;
        self.unknowns.push(meta);
        Ok(())
    }

    pub fn declare_state(&mut self, name: &str, options: VarOptions) -> Result<()> {
        let meta = self.build(name, VarKind::State, options)?;
        self.unknowns.push(meta);
        Ok(())
    }

    fn build(&self, name: &str, kind: VarKind, options: VarOptions) -> Result<VariableMetadata> {
        let VarOptions {
            value,
            shape,
            extra,
        } = options;

        if value.is_none() && shape.is_none() {
            return Err(ComponentError::MissingShape {
                component: self.pathname.clone(),
                variable: name.to_string(),
                kind,
            });
        }
        self.check_name(name)?;

        let (value, shape) = match (value, shape) {
            (Some(value), Some(shape)) => {
                let expected = shape_size(&shape);
                if expected != value.len() {
                    return Err(ComponentError::ShapeMismatch {
                        component: self.pathname.clone(),
                        variable: name.to_string(),
                        kind,
                        shape,
                        expected,
                        actual: value.len(),
                    });
                }
                (value, shape)
            }
            (Some(value), None) => {
                let shape = value.default_shape();
                (value, shape)
            }
            (None, shape) => {
                let shape = shape.unwrap_or_default();
                (initial_value(&shape), shape)
            }
        };

        Ok(VariableMetadata {
            name: name.to_string(),
            relative_name: name.to_string(),
            kind,
            value,
            shape,
            extra,
        })
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.finalized {
            return Err(ComponentError::AlreadyFinalized {
                component: self.pathname.clone(),
                variable: name.to_string(),
            });
        }
        if self.params.contains(name) || self.unknowns.contains(name) {
            return Err(ComponentError::DuplicateVariable {
                component: self.pathname.clone(),
                variable: name.to_string(),
            });
        }
        Ok(())
    }

    /// Rekey every variable with `prefix` and lock the registry.
    pub fn finalize(&mut self, prefix: &str) -> Result<()> {
        if self.finalized {
            return Err(ComponentError::SetupRepeated {
                component: self.pathname.clone(),
            });
        }
        if !prefix.is_empty() {
            self.pathname = prefix.to_string();
        }
        self.params.rekey(prefix);
        self.unknowns.rekey(prefix);
        self.finalized = true;

        debug!(
            component = %self.pathname,
            params = self.params.entries.len(),
            unknowns = self.unknowns.entries.len(),
            "variables finalized"
        );
        Ok(())
    }

    pub fn params(&self) -> &[VariableMetadata] {
        &self.params.entries
    }

    /// Outputs and states, in declaration order.
    pub fn unknowns(&self) -> &[VariableMetadata] {
        &self.unknowns.entries
    }

    /// Relative names of the declared states.
    pub fn states(&self) -> Vec<String> {
        self.unknowns
            .entries
            .iter()
            .filter(|meta| meta.is_state())
            .map(|meta| meta.relative_name.clone())
            .collect()
    }

    /// Look up by current key (local before finalization, qualified after).
    pub fn get(&self, key: &str) -> Option<&VariableMetadata> {
        self.params.get(key).or_else(|| self.unknowns.get(key))
    }
}

fn initial_value(shape: &[usize]) -> VarValue {
    if is_scalar_shape(shape) {
        VarValue::Scalar(0.0)
    } else {
        VarValue::Array(vec![0.0; shape_size(shape)])
    }
}
