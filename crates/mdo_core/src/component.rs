use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ComponentError, Result};
use crate::finite_difference::{approximate_jacobian, FdOverrides, FdSettings};
use crate::jacobian::{apply_jacobian, Jacobian, LinearMode};
use crate::restore::Restore;
use crate::variables::{VarOptions, VariableMetadata, VariableRegistry};
use crate::vector::{VariableVector, Vectors};

/// User-supplied behavior of a component.
///
/// Hooks returning `Option` select the built-in behavior when they return
/// `None`.
pub trait Model {
    /// Overwrite `unknowns` with outputs computed from `params`.
    fn solve_nonlinear(
        &mut self,
        _params: &VariableVector,
        _unknowns: &mut VariableVector,
        _resids: &mut VariableVector,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Implicit components write their residuals here. `None` derives the
    /// residual from `solve_nonlinear`.
    fn apply_nonlinear(
        &mut self,
        _params: &VariableVector,
        _unknowns: &VariableVector,
        _resids: &mut VariableVector,
    ) -> Option<anyhow::Result<()>> {
        None
    }

    /// Analytic partial derivatives. `None` falls back to finite differences.
    fn jacobian(
        &mut self,
        _params: &VariableVector,
        _unknowns: &VariableVector,
        _resids: &VariableVector,
    ) -> Option<anyhow::Result<Jacobian>> {
        None
    }

    /// Custom linear operator. `None` multiplies by the cached Jacobian.
    #[allow(clippy::too_many_arguments)]
    fn apply_linear(
        &mut self,
        _params: &VariableVector,
        _unknowns: &VariableVector,
        _dparams: &mut VariableVector,
        _dunknowns: &mut VariableVector,
        _dresids: &mut VariableVector,
        _mode: LinearMode,
    ) -> Option<anyhow::Result<()>> {
        None
    }
}

/// Explicit model backed by a closure that writes unknowns from params.
pub struct ExplicitFn<F>(pub F);

impl<F> Model for ExplicitFn<F>
where
    F: FnMut(&VariableVector, &mut VariableVector) -> anyhow::Result<()>,
{
    fn solve_nonlinear(
        &mut self,
        params: &VariableVector,
        unknowns: &mut VariableVector,
        _resids: &mut VariableVector,
    ) -> anyhow::Result<()> {
        (self.0)(params, unknowns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Unconfigured,
    Registered,
    Finalized,
    NonlinearEvaluated,
    JacobianComputed,
    LinearApplied,
}

pub struct Component<M> {
    name: String,
    registry: VariableRegistry,
    fd_options: FdSettings,
    jacobian_cache: Option<Jacobian>,
    lifecycle: Lifecycle,
    model: M,
}

impl<M: Model> Component<M> {
    pub fn new(name: impl Into<String>, model: M) -> Self {
        let name = name.into();
        Self {
            registry: VariableRegistry::new(name.clone()),
            name,
            fd_options: FdSettings::default(),
            jacobian_cache: None,
            lifecycle: Lifecycle::Unconfigured,
            model,
        }
    }

    pub fn with_fd_options(mut self, fd_options: FdSettings) -> Self {
        self.fd_options = fd_options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path assigned at setup, or the name before that.
    pub fn pathname(&self) -> &str {
        self.registry.pathname()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn variables(&self) -> &VariableRegistry {
        &self.registry
    }

    pub fn params(&self) -> &[VariableMetadata] {
        self.registry.params()
    }

    pub fn unknowns(&self) -> &[VariableMetadata] {
        self.registry.unknowns()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn fd_options(&self) -> &FdSettings {
        &self.fd_options
    }

    pub fn fd_options_mut(&mut self) -> &mut FdSettings {
        &mut self.fd_options
    }

    pub fn jacobian_cache(&self) -> Option<&Jacobian> {
        self.jacobian_cache.as_ref()
    }

    pub fn declare_param(&mut self, name: &str, options: VarOptions) -> Result<()> {
        self.registry.declare_param(name, options)?;
        self.lifecycle = Lifecycle::Registered;
        Ok(())
    }

    pub fn declare_output(&mut self, name: &str, options: VarOptions) -> Result<()> {
        self.registry.declare_output(name, options)?;
        self.lifecycle = Lifecycle::Registered;
        Ok(())
    }

    pub fn declare_state(&mut self, name: &str, options: VarOptions) -> Result<()> {
        self.registry.declare_state(name, options)?;
        self.lifecycle = Lifecycle::Registered;
        Ok(())
    }

    /// Qualify every variable with `pathname` and lock the declarations.
    pub fn setup_variables(&mut self, pathname: &str) -> Result<()> {
        self.registry.finalize(pathname)?;
        self.lifecycle = Lifecycle::Finalized;
        Ok(())
    }

    fn require_finalized(&self, operation: &'static str) -> Result<()> {
        if self.registry.is_finalized() {
            Ok(())
        } else {
            Err(ComponentError::NotFinalized {
                component: self.pathname().to_string(),
                operation,
            })
        }
    }

    /// Params and unknowns at their declared values, residuals zeroed.
    pub fn create_vectors(&self) -> Result<Vectors> {
        self.require_finalized("create_vectors")?;
        Ok(Vectors {
            params: VariableVector::from_metadata(self.registry.params()),
            unknowns: VariableVector::from_metadata(self.registry.unknowns()),
            resids: VariableVector::zeros(self.registry.unknowns()),
        })
    }

    /// Zeroed `dparams`, `dunknowns` and `dresids`.
    pub fn create_linear_vectors(&self) -> Result<Vectors> {
        self.require_finalized("create_linear_vectors")?;
        Ok(Vectors {
            params: VariableVector::zeros(self.registry.params()),
            unknowns: VariableVector::zeros(self.registry.unknowns()),
            resids: VariableVector::zeros(self.registry.unknowns()),
        })
    }

    /// Drop the cached Jacobian; it no longer describes the current point.
    fn invalidate_jacobian(&mut self) {
        self.jacobian_cache = None;
        if matches!(
            self.lifecycle,
            Lifecycle::JacobianComputed | Lifecycle::LinearApplied
        ) {
            self.lifecycle = Lifecycle::NonlinearEvaluated;
        }
    }

    fn check_layout(&self, unknowns: &VariableVector, resids: &VariableVector) -> Result<()> {
        if unknowns.same_layout(resids) {
            Ok(())
        } else {
            Err(ComponentError::VectorLayout {
                component: self.pathname().to_string(),
                message: "residual vector must share the unknown vector's layout".to_string(),
            })
        }
    }

    /// Run the model's solve behavior, advancing the unknowns.
    pub fn solve_nonlinear(
        &mut self,
        params: &VariableVector,
        unknowns: &mut VariableVector,
        resids: &mut VariableVector,
    ) -> Result<()> {
        self.require_finalized("solve_nonlinear")?;
        self.invalidate_jacobian();
        self.model
            .solve_nonlinear(params, unknowns, resids)
            .map_err(|e| ComponentError::evaluation(self.registry.pathname(), "solve_nonlinear", e))?;
        self.lifecycle = Lifecycle::NonlinearEvaluated;
        Ok(())
    }

    /// Evaluate residuals. Explicit components leave `unknowns` untouched.
    pub fn apply_nonlinear(
        &mut self,
        params: &VariableVector,
        unknowns: &mut VariableVector,
        resids: &mut VariableVector,
    ) -> Result<()> {
        self.require_finalized("apply_nonlinear")?;
        self.check_layout(unknowns, resids)?;
        self.invalidate_jacobian();
        evaluate_residuals(
            &mut self.model,
            self.registry.pathname(),
            params,
            unknowns,
            resids,
        )?;
        debug!(component = self.registry.pathname(), "residuals evaluated");
        self.lifecycle = Lifecycle::NonlinearEvaluated;
        Ok(())
    }

    /// Finite-difference Jacobian of the residuals with respect to every
    /// param and state. The vectors are returned unchanged.
    pub fn fd_jacobian(
        &mut self,
        params: &mut VariableVector,
        unknowns: &mut VariableVector,
        resids: &mut VariableVector,
        overrides: FdOverrides,
    ) -> Result<Jacobian> {
        self.require_finalized("fd_jacobian")?;
        self.check_layout(unknowns, resids)?;
        let settings = self.fd_options.resolve(overrides);
        let states = self.registry.states();
        let component = self.registry.pathname();
        let model = &mut self.model;

        approximate_jacobian(
            component,
            &states,
            settings,
            params,
            unknowns,
            resids,
            |p, u, r| evaluate_residuals(&mut *model, component, p, u, r),
        )
    }

    /// Rebuild the cached Jacobian, preferring the model's analytic one.
    pub fn linearize(
        &mut self,
        params: &mut VariableVector,
        unknowns: &mut VariableVector,
        resids: &mut VariableVector,
    ) -> Result<&Jacobian> {
        self.require_finalized("linearize")?;
        self.invalidate_jacobian();
        let jacobian = match self.model.jacobian(params, unknowns, resids) {
            Some(result) => result
                .map_err(|e| ComponentError::evaluation(self.registry.pathname(), "jacobian", e))?,
            None => self.fd_jacobian(params, unknowns, resids, FdOverrides::default())?,
        };
        debug!(
            component = self.registry.pathname(),
            blocks = jacobian.len(),
            "jacobian cached"
        );
        self.lifecycle = Lifecycle::JacobianComputed;
        Ok(self.jacobian_cache.insert(jacobian))
    }

    /// Replace the cached Jacobian with externally computed derivatives.
    pub fn set_jacobian(&mut self, jacobian: Jacobian) {
        self.jacobian_cache = Some(jacobian);
        self.lifecycle = Lifecycle::JacobianComputed;
    }

    /// Multiply by the Jacobian (forward) or its transpose (reverse).
    #[allow(clippy::too_many_arguments)]
    pub fn apply_linear(
        &mut self,
        params: &VariableVector,
        unknowns: &VariableVector,
        dparams: &mut VariableVector,
        dunknowns: &mut VariableVector,
        dresids: &mut VariableVector,
        mode: LinearMode,
    ) -> Result<()> {
        let custom = self
            .model
            .apply_linear(params, unknowns, dparams, dunknowns, dresids, mode);
        match custom {
            Some(result) => result
                .map_err(|e| ComponentError::evaluation(self.registry.pathname(), "apply_linear", e))?,
            None => {
                let jacobian =
                    self.jacobian_cache
                        .as_ref()
                        .ok_or_else(|| ComponentError::MissingJacobian {
                            component: self.registry.pathname().to_string(),
                        })?;
                apply_jacobian(
                    self.registry.pathname(),
                    jacobian,
                    dparams,
                    dunknowns,
                    dresids,
                    mode,
                )?;
            }
        }
        debug!(component = self.registry.pathname(), ?mode, "linear operator applied");
        self.lifecycle = Lifecycle::LinearApplied;
        Ok(())
    }
}

/// Residuals from the implicit hook, or `old unknowns - new unknowns` around
/// `solve_nonlinear` with the unknowns put back afterwards.
fn evaluate_residuals<M: Model>(
    model: &mut M,
    component: &str,
    params: &VariableVector,
    unknowns: &mut VariableVector,
    resids: &mut VariableVector,
) -> Result<()> {
    if let Some(result) = model.apply_nonlinear(params, unknowns, resids) {
        return result.map_err(|e| ComponentError::evaluation(component, "apply_nonlinear", e));
    }

    let mut unknowns = Restore::new(unknowns);
    model
        .solve_nonlinear(params, &mut *unknowns, resids)
        .map_err(|e| ComponentError::evaluation(component, "solve_nonlinear", e))?;
    let residual = unknowns.saved() - unknowns.as_vector();
    resids.as_vector_mut().copy_from(&residual);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::finite_difference::{FdForm, StepType};
    use anyhow::{anyhow, bail};
    use nalgebra::DMatrix;

    type SolveFn = fn(&VariableVector, &mut VariableVector) -> anyhow::Result<()>;
    type Squarer = ExplicitFn<SolveFn>;

    fn square(p: &VariableVector, u: &mut VariableVector) -> anyhow::Result<()> {
        let x = p.scalar("x").ok_or_else(|| anyhow!("missing x"))?;
        u.set("y", &[x * x]);
        Ok(())
    }

    /// Param `x` (default 0.0), output `y`, `y = x^2`.
    fn squarer(x: f64) -> (Component<Squarer>, Vectors) {
        let model: Squarer = ExplicitFn(square);
        let mut comp = Component::new("sq", model);
        comp.declare_param("x", VarOptions::new().shape([1])).unwrap();
        comp.declare_output("y", VarOptions::new().shape([1])).unwrap();
        comp.setup_variables("model:sq").unwrap();
        let mut vectors = comp.create_vectors().unwrap();
        vectors.params.set("x", &[x]);
        (comp, vectors)
    }

    /// Implicit residual `r(s) = a*s^2 - b`, `r(z) = z - 2*a`.
    struct Quadratic;

    impl Model for Quadratic {
        fn apply_nonlinear(
            &mut self,
            params: &VariableVector,
            unknowns: &VariableVector,
            resids: &mut VariableVector,
        ) -> Option<anyhow::Result<()>> {
            let a = params.scalar("a")?;
            let b = params.scalar("b")?;
            let s = unknowns.scalar("s")?;
            let z = unknowns.scalar("z")?;
            resids.set("s", &[a * s * s - b]);
            resids.set("z", &[z - 2.0 * a]);
            Some(Ok(()))
        }
    }

    fn quadratic() -> (Component<Quadratic>, Vectors) {
        let mut comp = Component::new("quad", Quadratic);
        comp.declare_param("a", VarOptions::new().value(2.0)).unwrap();
        comp.declare_param("b", VarOptions::new().value(8.0)).unwrap();
        comp.declare_output("z", VarOptions::new().value(0.0)).unwrap();
        comp.declare_state("s", VarOptions::new().value(3.0)).unwrap();
        comp.setup_variables("quad").unwrap();
        let vectors = comp.create_vectors().unwrap();
        (comp, vectors)
    }

    #[test]
    fn lifecycle_progresses_through_setup_and_derivatives() {
        let mut comp = Component::new("sq", ExplicitFn(square));
        assert_eq!(comp.lifecycle(), Lifecycle::Unconfigured);
        comp.declare_param("x", VarOptions::new().value(3.0)).unwrap();
        comp.declare_output("y", VarOptions::new().value(0.0)).unwrap();
        assert_eq!(comp.lifecycle(), Lifecycle::Registered);

        let err = comp.create_vectors().expect_err("vectors before setup");
        assert!(err.is_state());

        comp.setup_variables("root:sq").unwrap();
        assert_eq!(comp.lifecycle(), Lifecycle::Finalized);
        assert_eq!(comp.pathname(), "root:sq");
        assert_eq!(comp.name(), "sq");
        assert!(comp.declare_param("w", VarOptions::new().value(1.0)).unwrap_err().is_state());

        let mut v = comp.create_vectors().unwrap();
        comp.apply_nonlinear(&v.params, &mut v.unknowns, &mut v.resids).unwrap();
        assert_eq!(comp.lifecycle(), Lifecycle::NonlinearEvaluated);

        comp.linearize(&mut v.params, &mut v.unknowns, &mut v.resids).unwrap();
        assert_eq!(comp.lifecycle(), Lifecycle::JacobianComputed);

        let mut d = comp.create_linear_vectors().unwrap();
        comp.apply_linear(
            &v.params,
            &v.unknowns,
            &mut d.params,
            &mut d.unknowns,
            &mut d.resids,
            LinearMode::Forward,
        )
        .unwrap();
        assert_eq!(comp.lifecycle(), Lifecycle::LinearApplied);

        comp.apply_nonlinear(&v.params, &mut v.unknowns, &mut v.resids).unwrap();
        assert!(comp.jacobian_cache().is_none());
    }

    #[test]
    fn explicit_residual_is_old_minus_new_and_unknowns_are_kept() {
        let (mut comp, mut v) = squarer(3.0);
        v.unknowns.set("y", &[4.0]);
        let before = v.unknowns.clone();

        comp.apply_nonlinear(&v.params, &mut v.unknowns, &mut v.resids).unwrap();

        assert_eq!(v.resids.flat("y"), Some(&[4.0 - 9.0][..]));
        assert_eq!(v.unknowns, before);
    }

    #[test_log::test]
    fn failing_solve_leaves_unknowns_untouched() {
        let mut comp = Component::new(
            "bad",
            ExplicitFn(|_: &VariableVector, u: &mut VariableVector| -> anyhow::Result<()> {
                u.set("y", &[123.0]);
                bail!("did not converge")
            }),
        );
        comp.declare_output("y", VarOptions::new().value(1.0)).unwrap();
        comp.setup_variables("").unwrap();
        let mut v = comp.create_vectors().unwrap();
        let before = v.unknowns.clone();

        let err = comp
            .apply_nonlinear(&v.params, &mut v.unknowns, &mut v.resids)
            .expect_err("expected failure");
        assert_eq!(err.category(), ErrorCategory::Evaluation);
        assert!(format!("{err}").contains("bad: solve_nonlinear failed: did not converge"));
        assert_eq!(v.unknowns, before);
    }

    #[test]
    fn solve_nonlinear_advances_unknowns() {
        let (mut comp, mut v) = squarer(3.0);
        comp.solve_nonlinear(&v.params, &mut v.unknowns, &mut v.resids).unwrap();
        assert_eq!(v.unknowns.scalar("y"), Some(9.0));
    }

    #[test]
    fn forward_and_central_differences_of_square() {
        // The residual is old - new, so its x-derivative is -dy/dx.
        let (mut comp, mut v) = squarer(3.0);
        let forward = comp
            .fd_jacobian(
                &mut v.params,
                &mut v.unknowns,
                &mut v.resids,
                FdOverrides::default().step_size(1e-6).form(FdForm::Forward),
            )
            .unwrap();
        let dy_dx = -forward.get("y", "x").unwrap()[(0, 0)];
        assert!((dy_dx - 6.0).abs() < 1e-3);

        let central = comp
            .fd_jacobian(
                &mut v.params,
                &mut v.unknowns,
                &mut v.resids,
                FdOverrides::default().step_size(1e-6).form(FdForm::Central),
            )
            .unwrap();
        let dy_dx = -central.get("y", "x").unwrap()[(0, 0)];
        assert!((dy_dx - 6.0).abs() < 1e-6);
    }

    #[test]
    fn fd_uses_component_defaults_unless_overridden() {
        let (comp, mut v) = squarer(3.0);
        let mut comp = comp.with_fd_options(FdSettings {
            step_size: 0.5,
            form: FdForm::Forward,
            ..FdSettings::default()
        });
        let coarse = comp
            .fd_jacobian(&mut v.params, &mut v.unknowns, &mut v.resids, FdOverrides::default())
            .unwrap();
        // ((3.5)^2 - 9) / 0.5 = 6.5
        assert!((coarse.get("y", "x").unwrap()[(0, 0)] + 6.5).abs() < 1e-12);

        comp.fd_options_mut().form = FdForm::Backward;
        let backward = comp
            .fd_jacobian(&mut v.params, &mut v.unknowns, &mut v.resids, FdOverrides::default())
            .unwrap();
        assert!((backward.get("y", "x").unwrap()[(0, 0)] + 5.5).abs() < 1e-12);
    }

    #[test_log::test]
    fn implicit_states_are_perturbed_in_unknowns() {
        let (mut comp, mut v) = quadratic();
        let before = v.clone();

        let jac = comp
            .fd_jacobian(
                &mut v.params,
                &mut v.unknowns,
                &mut v.resids,
                FdOverrides::default().form(FdForm::Central).step_size(1e-4),
            )
            .unwrap();

        assert_eq!(v, before);
        // dr_s/ds = 2 a s = 12, dr_s/da = s^2 = 9, dr_s/db = -1
        assert!((jac.get("s", "s").unwrap()[(0, 0)] - 12.0).abs() < 1e-6);
        assert!((jac.get("s", "a").unwrap()[(0, 0)] - 9.0).abs() < 1e-6);
        assert!((jac.get("s", "b").unwrap()[(0, 0)] + 1.0).abs() < 1e-6);
        assert!((jac.get("z", "a").unwrap()[(0, 0)] + 2.0).abs() < 1e-6);
        assert!(jac.get("z", "z").is_none());
        assert_eq!(jac.get("z", "s").unwrap()[(0, 0)], 0.0);
    }

    #[test]
    fn implicit_residuals_come_from_the_hook() {
        let (mut comp, mut v) = quadratic();
        comp.apply_nonlinear(&v.params, &mut v.unknowns, &mut v.resids).unwrap();
        assert_eq!(v.resids.scalar("s"), Some(2.0 * 9.0 - 8.0));
        assert_eq!(v.resids.scalar("z"), Some(-4.0));
    }

    #[test]
    fn apply_linear_with_cached_jacobian() {
        let (mut comp, v) = squarer(3.0);
        let mut jac = Jacobian::new();
        jac.insert("y", "x", DMatrix::from_element(1, 1, 2.0));
        comp.set_jacobian(jac);

        let mut d = comp.create_linear_vectors().unwrap();
        d.params.set("x", &[1.0]);
        comp.apply_linear(
            &v.params,
            &v.unknowns,
            &mut d.params,
            &mut d.unknowns,
            &mut d.resids,
            LinearMode::Forward,
        )
        .unwrap();
        assert_eq!(d.resids.flat("y"), Some(&[2.0][..]));

        let mut d = comp.create_linear_vectors().unwrap();
        d.resids.set("y", &[1.0]);
        comp.apply_linear(
            &v.params,
            &v.unknowns,
            &mut d.params,
            &mut d.unknowns,
            &mut d.resids,
            LinearMode::Reverse,
        )
        .unwrap();
        assert_eq!(d.params.flat("x"), Some(&[2.0][..]));
    }

    #[test]
    fn apply_linear_without_jacobian_is_configuration_error() {
        let (mut comp, v) = squarer(3.0);
        let mut d = comp.create_linear_vectors().unwrap();
        let err = comp
            .apply_linear(
                &v.params,
                &v.unknowns,
                &mut d.params,
                &mut d.unknowns,
                &mut d.resids,
                LinearMode::Reverse,
            )
            .expect_err("expected missing jacobian");
        assert!(err.is_configuration());
        assert_eq!(format!("{err}"), "No derivatives defined for component 'model:sq'");
    }

    #[test]
    fn linearize_caches_finite_difference_jacobian() {
        let (mut comp, mut v) = squarer(2.0);
        let jac = comp
            .linearize(&mut v.params, &mut v.unknowns, &mut v.resids)
            .unwrap();
        assert!((jac.get("y", "x").unwrap()[(0, 0)] + 4.0).abs() < 1e-4);
        assert!(comp.jacobian_cache().is_some());
    }

    struct Analytic {
        calls: usize,
    }

    impl Model for Analytic {
        fn solve_nonlinear(
            &mut self,
            params: &VariableVector,
            unknowns: &mut VariableVector,
            _resids: &mut VariableVector,
        ) -> anyhow::Result<()> {
            square(params, unknowns)
        }

        fn jacobian(
            &mut self,
            params: &VariableVector,
            _unknowns: &VariableVector,
            _resids: &VariableVector,
        ) -> Option<anyhow::Result<Jacobian>> {
            self.calls += 1;
            let x = params.scalar("x")?;
            let mut jac = Jacobian::new();
            jac.insert("y", "x", DMatrix::from_element(1, 1, -2.0 * x));
            Some(Ok(jac))
        }
    }

    #[test_log::test]
    fn linearize_prefers_analytic_jacobian() {
        let mut comp = Component::new("an", Analytic { calls: 0 });
        comp.declare_param("x", VarOptions::new().value(5.0)).unwrap();
        comp.declare_output("y", VarOptions::new().value(0.0)).unwrap();
        comp.setup_variables("an").unwrap();
        let mut v = comp.create_vectors().unwrap();

        let jac = comp
            .linearize(&mut v.params, &mut v.unknowns, &mut v.resids)
            .unwrap();
        assert_eq!(jac.get("y", "x").unwrap()[(0, 0)], -10.0);
        assert_eq!(comp.model().calls, 1);

        let fd = comp
            .fd_jacobian(
                &mut v.params,
                &mut v.unknowns,
                &mut v.resids,
                FdOverrides::default().form(FdForm::Central),
            )
            .unwrap();
        assert!((fd.get("y", "x").unwrap()[(0, 0)] + 10.0).abs() < 1e-6);
    }

    struct Doubler;

    impl Model for Doubler {
        fn apply_linear(
            &mut self,
            _params: &VariableVector,
            _unknowns: &VariableVector,
            dparams: &mut VariableVector,
            _dunknowns: &mut VariableVector,
            dresids: &mut VariableVector,
            mode: LinearMode,
        ) -> Option<anyhow::Result<()>> {
            let result = match mode {
                LinearMode::Forward => {
                    let dx = dparams.scalar("x").unwrap_or_default();
                    dresids.set("y", &[3.0 * dx]);
                    Ok(())
                }
                LinearMode::Reverse => Err(anyhow!("reverse mode not supported")),
            };
            Some(result)
        }
    }

    #[test]
    fn custom_apply_linear_bypasses_cache() {
        let mut comp = Component::new("dbl", Doubler);
        comp.declare_param("x", VarOptions::new().value(0.0)).unwrap();
        comp.declare_output("y", VarOptions::new().value(0.0)).unwrap();
        comp.setup_variables("dbl").unwrap();
        let v = comp.create_vectors().unwrap();
        let mut d = comp.create_linear_vectors().unwrap();
        d.params.set("x", &[2.0]);

        comp.apply_linear(
            &v.params,
            &v.unknowns,
            &mut d.params,
            &mut d.unknowns,
            &mut d.resids,
            LinearMode::Forward,
        )
        .unwrap();
        assert_eq!(d.resids.scalar("y"), Some(6.0));

        let err = comp
            .apply_linear(
                &v.params,
                &v.unknowns,
                &mut d.params,
                &mut d.unknowns,
                &mut d.resids,
                LinearMode::Reverse,
            )
            .expect_err("expected hook failure");
        assert_eq!(err.category(), ErrorCategory::Evaluation);
    }

    #[test]
    fn failed_linearize_discards_previous_jacobian() {
        let mut comp = Component::new(
            "stale",
            ExplicitFn(|p: &VariableVector, u: &mut VariableVector| -> anyhow::Result<()> {
                let x = p.scalar("x").unwrap_or_default();
                if x > 10.0 {
                    bail!("diverged at x = {x}");
                }
                u.set("y", &[x * x]);
                Ok(())
            }),
        );
        comp.declare_param("x", VarOptions::new().value(1.0)).unwrap();
        comp.declare_output("y", VarOptions::new().value(0.0)).unwrap();
        comp.setup_variables("stale").unwrap();
        let mut v = comp.create_vectors().unwrap();

        let mut jac = Jacobian::new();
        jac.insert("y", "x", DMatrix::from_element(1, 1, 42.0));
        comp.set_jacobian(jac);

        v.params.set("x", &[20.0]);
        let err = comp
            .linearize(&mut v.params, &mut v.unknowns, &mut v.resids)
            .expect_err("expected failed linearization");
        assert_eq!(err.category(), ErrorCategory::Evaluation);
        assert!(comp.jacobian_cache().is_none());
        assert_eq!(comp.lifecycle(), Lifecycle::NonlinearEvaluated);

        let mut d = comp.create_linear_vectors().unwrap();
        d.params.set("x", &[1.0]);
        let err = comp
            .apply_linear(
                &v.params,
                &v.unknowns,
                &mut d.params,
                &mut d.unknowns,
                &mut d.resids,
                LinearMode::Forward,
            )
            .expect_err("stale jacobian must not be applied");
        assert!(err.is_configuration());
        assert_eq!(d.resids.scalar("y"), Some(0.0));
    }

    #[test]
    fn fd_failure_names_perturbed_entry() {
        let mut comp = Component::new(
            "bad",
            ExplicitFn(|p: &VariableVector, u: &mut VariableVector| -> anyhow::Result<()> {
                let z = p.flat("z").unwrap_or_default();
                if z.get(1).copied().unwrap_or_default() != 0.0 {
                    bail!("diverged");
                }
                u.set("y", &[z.iter().sum::<f64>()]);
                Ok(())
            }),
        );
        comp.declare_param("z", VarOptions::new().shape([2])).unwrap();
        comp.declare_output("y", VarOptions::new().value(0.0)).unwrap();
        comp.setup_variables("root:bad").unwrap();
        let mut v = comp.create_vectors().unwrap();

        let err = comp
            .fd_jacobian(&mut v.params, &mut v.unknowns, &mut v.resids, FdOverrides::default())
            .expect_err("expected failure on z[1]");
        let message = format!("{err}");
        assert!(
            message.starts_with("root:bad: evaluation with 'z[1]' perturbed failed"),
            "{message}"
        );
        assert!(message.contains("diverged"));
        assert_eq!(err.category(), ErrorCategory::Evaluation);
    }

    #[test]
    fn relative_steps_scale_with_large_inputs() {
        // Forward: ((x + h)^2 - x^2) / h = 2x + h, with h = 1e-6 * |x| = 1e-3.
        let (mut comp, mut v) = squarer(1000.0);
        let forward = comp
            .fd_jacobian(
                &mut v.params,
                &mut v.unknowns,
                &mut v.resids,
                FdOverrides::default()
                    .step_type(StepType::Relative)
                    .form(FdForm::Forward),
            )
            .unwrap();
        let dy_dx = -forward.get("y", "x").unwrap()[(0, 0)];
        assert!((dy_dx - 2000.001).abs() < 1e-5, "{dy_dx}");

        let backward = comp
            .fd_jacobian(
                &mut v.params,
                &mut v.unknowns,
                &mut v.resids,
                FdOverrides::default()
                    .step_type(StepType::Relative)
                    .form(FdForm::Backward),
            )
            .unwrap();
        let dy_dx = -backward.get("y", "x").unwrap()[(0, 0)];
        assert!((dy_dx - 1999.999).abs() < 1e-5, "{dy_dx}");

        let absolute = comp
            .fd_jacobian(
                &mut v.params,
                &mut v.unknowns,
                &mut v.resids,
                FdOverrides::default().form(FdForm::Forward),
            )
            .unwrap();
        let dy_dx = -absolute.get("y", "x").unwrap()[(0, 0)];
        assert!((dy_dx - 2000.001).abs() > 2e-4);
    }

    #[test]
    fn mismatched_residual_layout_is_rejected() {
        let (mut comp, mut v) = squarer(1.0);
        let mut resids = v.params.clone();
        let err = comp
            .apply_nonlinear(&v.params, &mut v.unknowns, &mut resids)
            .expect_err("expected layout error");
        assert!(err.is_configuration());
    }
}
