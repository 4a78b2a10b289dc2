use std::collections::HashSet;

use anyhow::anyhow;
use nalgebra::DMatrix;

use crate::autodiff::Dual;
use crate::component::{Component, Model};
use crate::equation_engine::{parse, Bytecode, Compiler, Expr, VM};
use crate::error::{ComponentError, Result};
use crate::jacobian::Jacobian;
use crate::variables::VarOptions;
use crate::vector::VariableVector;

struct Equation {
    output: String,
    source: String,
    code: Bytecode,
    /// Indices into `ExprModel::inputs` read by this equation.
    referenced: Vec<usize>,
}

/// Equations compiled once to bytecode, run on `f64` for values and on
/// [`Dual`] numbers with one input seeded for derivatives.
pub struct ExprModel {
    inputs: Vec<String>,
    equations: Vec<Equation>,
}

impl ExprModel {
    pub fn new(component: &str, equations: &[&str]) -> Result<Self> {
        let error = |expression: &str, message: String| ComponentError::Expression {
            component: component.to_string(),
            expression: expression.to_string(),
            message,
        };

        let mut parsed = Vec::with_capacity(equations.len());
        let mut outputs = HashSet::new();
        for text in equations.iter().copied() {
            let (lhs, rhs) = text
                .split_once('=')
                .ok_or_else(|| error(text, "expected '<output> = <expression>'".to_string()))?;
            let output = match parse(lhs).map_err(|e| error(text, e))? {
                Expr::Variable(name) => name,
                _ => return Err(error(text, "left-hand side must be a name".to_string())),
            };
            if !outputs.insert(output.clone()) {
                return Err(error(text, format!("output '{output}' is defined twice")));
            }
            let expr = parse(rhs).map_err(|e| error(text, e))?;
            parsed.push((text.trim().to_string(), output, expr));
        }

        let mut inputs: Vec<String> = Vec::new();
        for (text, _, expr) in &parsed {
            for name in expr.variables() {
                if outputs.contains(&name) {
                    return Err(error(
                        text.as_str(),
                        format!("output '{name}' cannot be used as an input"),
                    ));
                }
                if !inputs.contains(&name) {
                    inputs.push(name);
                }
            }
        }

        let compiler = Compiler::new(&inputs);
        let mut compiled = Vec::with_capacity(parsed.len());
        for (source, output, expr) in parsed {
            let code = compiler.compile(&expr).map_err(|e| error(source.as_str(), e))?;
            let referenced = expr
                .variables()
                .iter()
                .filter_map(|name| inputs.iter().position(|input| input == name))
                .collect();
            compiled.push(Equation {
                output,
                source,
                code,
                referenced,
            });
        }

        Ok(Self {
            inputs,
            equations: compiled,
        })
    }

    /// Param names in order of first use.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.equations.iter().map(|eq| eq.output.as_str())
    }

    fn input_values(&self, params: &VariableVector) -> anyhow::Result<Vec<f64>> {
        self.inputs
            .iter()
            .map(|name| {
                params
                    .scalar(name)
                    .ok_or_else(|| anyhow!("param '{name}' is not in the param vector"))
            })
            .collect()
    }
}

impl Model for ExprModel {
    fn solve_nonlinear(
        &mut self,
        params: &VariableVector,
        unknowns: &mut VariableVector,
        _resids: &mut VariableVector,
    ) -> anyhow::Result<()> {
        let values = self.input_values(params)?;
        let mut stack = Vec::new();
        for eq in &self.equations {
            let value = VM::execute(&eq.code, values.as_slice(), &mut stack)
                .ok_or_else(|| anyhow!("could not evaluate '{}'", eq.source))?;
            if !unknowns.set(&eq.output, &[value]) {
                return Err(anyhow!("output '{}' is not in the unknown vector", eq.output));
            }
        }
        Ok(())
    }

    fn jacobian(
        &mut self,
        params: &VariableVector,
        _unknowns: &VariableVector,
        _resids: &VariableVector,
    ) -> Option<anyhow::Result<Jacobian>> {
        Some(self.dual_jacobian(params))
    }
}

impl ExprModel {
    fn dual_jacobian(&self, params: &VariableVector) -> anyhow::Result<Jacobian> {
        let values = self.input_values(params)?;
        let mut duals: Vec<Dual> = values.iter().copied().map(Dual::constant).collect();
        let mut stack = Vec::new();
        let mut jacobian = Jacobian::new();

        for (seed, input) in self.inputs.iter().enumerate() {
            duals[seed] = Dual::variable(values[seed]);
            for eq in self.equations.iter().filter(|eq| eq.referenced.contains(&seed)) {
                let result = VM::execute(&eq.code, duals.as_slice(), &mut stack)
                    .ok_or_else(|| anyhow!("could not differentiate '{}'", eq.source))?;
                // resid = old - new
                jacobian.insert(
                    eq.output.as_str(),
                    input.as_str(),
                    DMatrix::from_element(1, 1, -result.eps),
                );
            }
            duals[seed] = Dual::constant(values[seed]);
        }
        Ok(jacobian)
    }
}

/// Build a component whose params and outputs are the names used in
/// `equations`. Every variable is a scalar starting at `0.0`.
pub fn expression_component(name: &str, equations: &[&str]) -> Result<Component<ExprModel>> {
    let model = ExprModel::new(name, equations)?;
    let inputs = model.inputs().to_vec();
    let outputs: Vec<String> = model.outputs().map(str::to_string).collect();

    let mut component = Component::new(name, model);
    for input in &inputs {
        component.declare_param(input, VarOptions::new().value(0.0))?;
    }
    for output in &outputs {
        component.declare_output(output, VarOptions::new().value(0.0))?;
    }
    Ok(component)
}
