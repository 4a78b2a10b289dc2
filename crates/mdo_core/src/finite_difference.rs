use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{ComponentError, Result};
use crate::jacobian::{Jacobian, Source};
use crate::restore::{Perturbation, Restore};
use crate::vector::VariableVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FdForm {
    Forward,
    Backward,
    Central,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Absolute,
    /// Step scales with the magnitude of the perturbed value.
    Relative,
}

/// Component-level finite difference defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FdSettings {
    pub step_size: f64,
    pub form: FdForm,
    pub step_type: StepType,
}

impl Default for FdSettings {
    fn default() -> Self {
        Self {
            step_size: 1.0e-6,
            form: FdForm::Forward,
            step_type: StepType::Absolute,
        }
    }
}

/// Per-call overrides; `None` falls back to the component's [`FdSettings`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FdOverrides {
    pub step_size: Option<f64>,
    pub form: Option<FdForm>,
    pub step_type: Option<StepType>,
}

impl FdOverrides {
    pub fn step_size(mut self, step_size: f64) -> Self {
        self.step_size = Some(step_size);
        self
    }

    pub fn form(mut self, form: FdForm) -> Self {
        self.form = Some(form);
        self
    }

    pub fn step_type(mut self, step_type: StepType) -> Self {
        self.step_type = Some(step_type);
        self
    }
}

impl FdSettings {
    /// Call arguments take precedence over the stored defaults.
    pub fn resolve(&self, overrides: FdOverrides) -> FdSettings {
        FdSettings {
            step_size: overrides.step_size.unwrap_or(self.step_size),
            form: overrides.form.unwrap_or(self.form),
            step_type: overrides.step_type.unwrap_or(self.step_type),
        }
    }

    /// Step for an input currently at `value`.
    pub fn step_for(&self, value: f64) -> f64 {
        match self.step_type {
            StepType::Absolute => self.step_size,
            StepType::Relative => {
                let step = value.abs() * self.step_size;
                if step < self.step_size {
                    self.step_size
                } else {
                    step
                }
            }
        }
    }

    fn validate(&self, component: &str) -> Result<()> {
        if !self.step_size.is_finite() || self.step_size <= 0.0 {
            return Err(ComponentError::InvalidStepSize {
                component: component.to_string(),
                step_size: self.step_size,
            });
        }
        Ok(())
    }
}

/// Approximate d(resids)/d(inputs) for every param in `params` and every
/// state in `states`.
///
/// `evaluate` computes residuals into its third argument. `params`,
/// `unknowns` and `resids` hold their original values when this returns,
/// successfully or not.
pub fn approximate_jacobian<F>(
    component: &str,
    states: &[String],
    settings: FdSettings,
    params: &mut VariableVector,
    unknowns: &mut VariableVector,
    resids: &mut VariableVector,
    mut evaluate: F,
) -> Result<Jacobian>
where
    F: FnMut(&VariableVector, &mut VariableVector, &mut VariableVector) -> Result<()>,
{
    settings.validate(component)?;

    let mut params = Restore::new(params);
    let mut unknowns = Restore::new(unknowns);
    let mut resids = Restore::new(resids);

    let inputs: Vec<(String, Source)> = params
        .names()
        .map(|name| (name.to_string(), Source::Params))
        .chain(
            states
                .iter()
                .filter(|name| unknowns.contains(name))
                .map(|name| (name.clone(), Source::Unknowns)),
        )
        .collect();
    let outputs: Vec<(String, usize)> = unknowns
        .names()
        .filter_map(|name| resids.size_of(name).map(|size| (name.to_string(), size)))
        .collect();

    debug!(
        component,
        form = ?settings.form,
        step_type = ?settings.step_type,
        step_size = settings.step_size,
        inputs = inputs.len(),
        "finite difference pass"
    );

    let baseline = match settings.form {
        FdForm::Central => None,
        FdForm::Forward | FdForm::Backward => {
            let mut guard = Restore::new(&mut *resids);
            evaluate(&*params, &mut *unknowns, &mut *guard)?;
            Some(guard.as_vector().clone())
        }
    };

    let mut jacobian = Jacobian::new();
    for (input, source) in &inputs {
        let vector: &VariableVector = match source {
            Source::Params => &*params,
            Source::Unknowns => &*unknowns,
        };
        let (Some(offset), Some(size)) = (vector.offset_of(input), vector.size_of(input)) else {
            continue;
        };
        trace!(component, input = input.as_str(), size, "perturbing input");

        for (output, out_size) in &outputs {
            jacobian.insert(output.clone(), input.clone(), DMatrix::zeros(*out_size, size));
        }

        for idx in 0..size {
            let position = offset + idx;
            let current = match source {
                Source::Params => params.as_vector()[position],
                Source::Unknowns => unknowns.as_vector()[position],
            };
            let step = settings.step_for(current);

            let target = Target {
                component,
                input: input.as_str(),
                source: *source,
                position,
                index: idx,
            };
            let mut probe = |delta: f64| {
                evaluate_perturbed(
                    &mut *params,
                    &mut *unknowns,
                    &mut *resids,
                    &target,
                    delta,
                    &mut evaluate,
                )
            };

            let column = match (settings.form, &baseline) {
                (FdForm::Forward, Some(base)) => (probe(step)? - base) / step,
                (FdForm::Backward, Some(base)) => (probe(-step)? - base) / (-step),
                _ => {
                    let plus = probe(step)?;
                    let minus = probe(-step)?;
                    (plus - minus) / (2.0 * step)
                }
            };

            for (output, _) in &outputs {
                let Some(range_start) = resids.offset_of(output) else {
                    continue;
                };
                let Some(block) = jacobian.get_mut(output, input) else {
                    continue;
                };
                for row in 0..block.nrows() {
                    let value = column[range_start + row];
                    if !value.is_finite() {
                        return Err(ComponentError::NonFiniteDerivative {
                            component: component.to_string(),
                            output: output.clone(),
                            input: input.clone(),
                            index: idx,
                            value,
                        });
                    }
                    block[(row, idx)] = value;
                }
            }
        }
    }

    Ok(jacobian)
}

/// One flattened entry of an input being perturbed.
struct Target<'a> {
    component: &'a str,
    input: &'a str,
    source: Source,
    /// Offset into the whole vector.
    position: usize,
    /// Offset within `input`.
    index: usize,
}

/// Evaluate residuals with one scalar shifted by `delta`. Both the shift and
/// the residual buffer are undone before returning.
fn evaluate_perturbed<F>(
    params: &mut VariableVector,
    unknowns: &mut VariableVector,
    resids: &mut VariableVector,
    target: &Target<'_>,
    delta: f64,
    evaluate: &mut F,
) -> Result<DVector<f64>>
where
    F: FnMut(&VariableVector, &mut VariableVector, &mut VariableVector) -> Result<()>,
{
    let mut resids = Restore::new(resids);
    let outcome = match target.source {
        Source::Params => {
            let perturbed = Perturbation::new(params, target.position, delta);
            evaluate(&*perturbed, unknowns, &mut *resids)
        }
        Source::Unknowns => {
            let mut perturbed = Perturbation::new(unknowns, target.position, delta);
            evaluate(params, &mut *perturbed, &mut *resids)
        }
    };
    outcome.map_err(|source| ComponentError::PerturbedEvaluation {
        component: target.component.to_string(),
        input: target.input.to_string(),
        index: target.index,
        source: Box::new(source),
    })?;
    Ok(resids.as_vector().clone())
}
