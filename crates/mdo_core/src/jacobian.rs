use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ComponentError, Result};
use crate::vector::VariableVector;

/// Direction of linear sensitivity propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearMode {
    /// Input perturbations to residual sensitivities: `dr += J dx`.
    Forward,
    /// Residual sensitivities back to inputs: `dx += Jᵀ dr`.
    Reverse,
}

/// Partial derivatives of outputs with respect to inputs, one dense block per
/// `(output, input)` pair. Absent pairs are zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Jacobian {
    blocks: BTreeMap<(String, String), DMatrix<f64>>,
}

impl Jacobian {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        output: impl Into<String>,
        input: impl Into<String>,
        block: DMatrix<f64>,
    ) -> Option<DMatrix<f64>> {
        self.blocks.insert((output.into(), input.into()), block)
    }

    pub fn get(&self, output: &str, input: &str) -> Option<&DMatrix<f64>> {
        self.blocks.get(&(output.to_string(), input.to_string()))
    }

    pub fn get_mut(&mut self, output: &str, input: &str) -> Option<&mut DMatrix<f64>> {
        self.blocks.get_mut(&(output.to_string(), input.to_string()))
    }

    /// Blocks ordered by `(output, input)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &DMatrix<f64>)> {
        self.blocks
            .iter()
            .map(|((output, input), block)| (output.as_str(), input.as_str(), block))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Which perturbation vector holds an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Params,
    /// States live in the unknown vector.
    Unknowns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    FoundIn(Source),
    NotFound,
}

/// Params take precedence over unknowns; an input in neither is not part of
/// the current linear system.
pub fn locate_operand(
    input: &str,
    dparams: &VariableVector,
    dunknowns: &VariableVector,
) -> Operand {
    if dparams.contains(input) {
        Operand::FoundIn(Source::Params)
    } else if dunknowns.contains(input) {
        Operand::FoundIn(Source::Unknowns)
    } else {
        Operand::NotFound
    }
}

/// Multiply the perturbation vectors by `jacobian` (forward) or its
/// transpose (reverse). Results accumulate into `dresids` (forward) or into
/// `dparams`/`dunknowns` (reverse).
pub fn apply_jacobian(
    component: &str,
    jacobian: &Jacobian,
    dparams: &mut VariableVector,
    dunknowns: &mut VariableVector,
    dresids: &mut VariableVector,
    mode: LinearMode,
) -> Result<()> {
    for (output, input, block) in jacobian.iter() {
        let source = match locate_operand(input, dparams, dunknowns) {
            Operand::FoundIn(source) => source,
            Operand::NotFound => {
                trace!(component, output, input, "input not in linear system, skipping block");
                continue;
            }
        };
        let Some(out_size) = dresids.size_of(output) else {
            trace!(component, output, input, "output not in linear system, skipping block");
            continue;
        };

        let operand = match source {
            Source::Params => &mut *dparams,
            Source::Unknowns => &mut *dunknowns,
        };
        let in_size = operand.size_of(input).unwrap_or_default();
        if block.nrows() != out_size || block.ncols() != in_size {
            return Err(ComponentError::BlockShape {
                component: component.to_string(),
                output: output.to_string(),
                input: input.to_string(),
                rows: block.nrows(),
                cols: block.ncols(),
                expected_rows: out_size,
                expected_cols: in_size,
            });
        }

        match mode {
            LinearMode::Forward => {
                let x = flat_column(operand, input);
                let product = block * x;
                accumulate(dresids, output, &product);
            }
            LinearMode::Reverse => {
                let r = flat_column(dresids, output);
                let product = block.tr_mul(&r);
                accumulate(operand, input, &product);
            }
        }
    }
    Ok(())
}

fn flat_column(vector: &VariableVector, name: &str) -> DVector<f64> {
    DVector::from_column_slice(vector.flat(name).unwrap_or_default())
}

fn accumulate(vector: &mut VariableVector, name: &str, values: &DVector<f64>) {
    if let Some(target) = vector.flat_mut(name) {
        for (t, v) in target.iter_mut().zip(values.iter()) {
            *t += v;
        }
    }
}
