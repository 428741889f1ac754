//! Symbolic vector fields with lazily derived Jacobian and divergence.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Index;

use log::debug;
use once_cell::unsync::OnceCell;

use crate::error::{Result, SymfieldError};
use crate::expr::Expr;
use crate::graph::{CompileOptions, Program};
use crate::vector::{render_table, Vector, VectorFunction};

/// Name of the single output axis of a divergence field.
pub const DIVERGENCE_AXIS: &str = "div";

/// Name of the Jacobian entry for `output` differentiated by `input`.
pub fn jacobian_axis(output: &str, input: &str) -> String {
    format!("d{}_d{}", output, input)
}

/// One variable per input axis, handed to a field's coordinate function.
#[derive(Debug, Clone)]
pub struct Axes(BTreeMap<String, Expr>);

impl Axes {
    fn new(names: &BTreeSet<String>) -> Self {
        Axes(names.iter().map(|n| (n.clone(), Expr::variable(n.as_str()))).collect())
    }

    pub fn get(&self, axis: &str) -> Option<&Expr> {
        self.0.get(axis)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl Index<&str> for Axes {
    type Output = Expr;

    /// Panics if `axis` was not declared as an input axis.
    fn index(&self, axis: &str) -> &Expr {
        match self.0.get(axis) {
            Some(expr) => expr,
            None => panic!("'{}' is not an input axis of this field", axis),
        }
    }
}

/// A compiled map from named input axes to named output axes.
#[derive(Debug)]
pub struct VectorField {
    input_axes: BTreeSet<String>,
    output_axes: BTreeSet<String>,
    program: Program,
    jacobian: OnceCell<Box<VectorField>>,
    divergence: OnceCell<Box<VectorField>>,
}

impl VectorField {
    /// Builds a field by calling `coordinates` once with a variable per input axis.
    pub fn new<I, A, F, O, S>(input_axes: I, coordinates: F) -> Result<Self>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
        F: FnOnce(&Axes) -> O,
        O: IntoIterator<Item = (S, Expr)>,
        S: Into<String>,
    {
        VectorField::with_options(input_axes, coordinates, CompileOptions::default())
    }

    pub fn with_options<I, A, F, O, S>(input_axes: I, coordinates: F, options: CompileOptions) -> Result<Self>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
        F: FnOnce(&Axes) -> O,
        O: IntoIterator<Item = (S, Expr)>,
        S: Into<String>,
    {
        let input_axes: BTreeSet<String> = input_axes.into_iter().map(Into::into).collect();
        let outputs = coordinates(&Axes::new(&input_axes));
        VectorField::from_expressions(input_axes, outputs, options)
    }

    /// Builds a field from ready-made output expressions.
    ///
    /// Every variable the expressions use must be one of `input_axes`.
    pub fn from_expressions<I, A, O, S>(input_axes: I, outputs: O, options: CompileOptions) -> Result<Self>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
        O: IntoIterator<Item = (S, Expr)>,
        S: Into<String>,
    {
        let input_axes: BTreeSet<String> = input_axes.into_iter().map(Into::into).collect();
        let outputs: BTreeMap<String, Expr> = outputs.into_iter().map(|(k, e)| (k.into(), e)).collect();
        for (axis, expr) in &outputs {
            if let Some(name) = expr.free_variables().into_iter().find(|n| !input_axes.contains(n)) {
                return Err(SymfieldError::malformed(format!(
                    "output '{}' uses '{}', which is not an input axis",
                    axis, name
                )));
            }
        }

        let output_axes = outputs.keys().cloned().collect();
        let program = Program::with_options(outputs, options)?;
        Ok(VectorField {
            input_axes,
            output_axes,
            program,
            jacobian: OnceCell::new(),
            divergence: OnceCell::new(),
        })
    }

    pub fn input_axes(&self) -> &BTreeSet<String> {
        &self.input_axes
    }

    pub fn output_axes(&self) -> &BTreeSet<String> {
        &self.output_axes
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn expression(&self, axis: &str) -> Option<&Expr> {
        self.program.expression(axis)
    }

    /// Evaluates the field. Input axes absent from `state` are not defaulted: if an
    /// output depends on one, the call fails with an unbound variable.
    pub fn call(&self, state: &Vector) -> Result<Vector> {
        let bindings = state.iter().filter(|(axis, _)| self.input_axes.contains(*axis));
        Ok(self.program.call(bindings)?.into())
    }

    /// Partial derivatives of every output by every input, keyed `d{out}_d{in}`.
    /// Built on first access.
    pub fn jacobian(&self) -> Result<&VectorField> {
        self.jacobian
            .get_or_try_init(|| -> Result<Box<VectorField>> {
                let entries: Vec<(String, Expr)> = self
                    .program
                    .expressions()
                    .iter()
                    .flat_map(|(output, expr)| {
                        self.input_axes
                            .iter()
                            .map(move |input| (jacobian_axis(output, input), expr.differentiate(input)))
                    })
                    .collect();
                debug!(
                    "building jacobian: {} entr{}",
                    entries.len(),
                    if entries.len() == 1 { "y" } else { "ies" }
                );
                let field = VectorField::from_expressions(self.input_axes.clone(), entries, self.program.options())?;
                Ok(Box::new(field))
            })
            .map(|field| &**field)
    }

    /// Trace of the Jacobian as a single-output field on [`DIVERGENCE_AXIS`].
    /// Defined only when the input and output axes coincide.
    pub fn divergence(&self) -> Result<&VectorField> {
        if self.input_axes != self.output_axes {
            return Err(SymfieldError::Domain {
                inputs: self.input_axes.clone(),
                outputs: self.output_axes.clone(),
            });
        }
        self.divergence
            .get_or_try_init(|| -> Result<Box<VectorField>> {
                let jacobian = self.jacobian()?;
                let diagonal = self
                    .input_axes
                    .iter()
                    .map(|axis| {
                        let entry = jacobian_axis(axis, axis);
                        jacobian
                            .expression(&entry)
                            .cloned()
                            .ok_or_else(|| SymfieldError::malformed(format!("jacobian has no entry '{}'", entry)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                debug!("building divergence over {} axes", diagonal.len());
                let field = VectorField::from_expressions(
                    self.input_axes.clone(),
                    [(DIVERGENCE_AXIS, Expr::sum(diagonal))],
                    self.program.options(),
                )?;
                Ok(Box::new(field))
            })
            .map(|field| &**field)
    }
}

impl VectorFunction for VectorField {
    fn apply(&self, state: &Vector) -> Result<Vector> {
        self.call(state)
    }
}

impl fmt::Display for VectorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_table(
            f,
            "function",
            self.program.expressions().iter().map(|(axis, e)| (axis.as_str(), e.to_string())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn point(pairs: &[(&str, f64)]) -> Vector {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn linear_field() -> VectorField {
        VectorField::new(["x", "y"], |a| {
            [("u", 10.0 * &a["x"] * &a["y"] + &a["y"]), ("v", -&a["x"] - 1.0)]
        })
        .unwrap()
    }

    fn quadratic_field() -> VectorField {
        VectorField::new(["x", "y"], |a| {
            let (x, y) = (&a["x"], &a["y"]);
            [("x", x.powi(2) * y), ("y", x * y.powi(2))]
        })
        .unwrap()
    }

    #[test]
    fn test_call_evaluates_every_output() {
        let out = linear_field().call(&point(&[("x", 1.0), ("y", 2.0)])).unwrap();
        assert_eq!(out, point(&[("u", 22.0), ("v", -2.0)]));
    }

    #[test]
    fn test_jacobian_values() {
        let field = linear_field();
        let jacobian = field.jacobian().unwrap();
        let names: Vec<&str> = jacobian.output_axes().iter().map(String::as_str).collect();
        assert_eq!(names, ["du_dx", "du_dy", "dv_dx", "dv_dy"]);
        let j = jacobian.call(&point(&[("x", 1.0), ("y", 2.0)])).unwrap();
        assert_eq!(j.get("du_dx"), 20.0);
        assert_eq!(j.get("du_dy"), 11.0);
        assert_eq!(j.get("dv_dx"), -1.0);
        assert_eq!(j.get("dv_dy"), 0.0);
    }

    #[test]
    fn test_jacobian_is_memoized() {
        let field = linear_field();
        let first = field.jacobian().unwrap();
        let second = field.jacobian().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_divergence_is_memoized() {
        let field = quadratic_field();
        assert!(field.divergence.get().is_none());
        let first = field.divergence().unwrap();
        // building the divergence fills the jacobian cell it reads from
        let cached = field.jacobian.get().map(|j| &**j as *const VectorField);
        let second = field.divergence().unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(cached, Some(field.jacobian().unwrap() as *const VectorField));
    }

    #[test]
    fn test_domain_error_does_not_stick() {
        let field = linear_field();
        for _ in 0..2 {
            assert!(matches!(field.divergence(), Err(SymfieldError::Domain { .. })));
        }
        assert!(field.divergence.get().is_none());
        assert!(field.jacobian.get().is_none());
        let jacobian = field.jacobian().unwrap();
        assert!(std::ptr::eq(jacobian, field.jacobian().unwrap()));
        assert_eq!(field.call(&point(&[("x", 1.0), ("y", 2.0)])).unwrap().get("u"), 22.0);
    }

    #[test]
    fn test_missing_input_axis_is_not_defaulted() {
        let err = linear_field().call(&point(&[("x", 1.0)])).unwrap_err();
        assert_eq!(err, SymfieldError::unbound("y"));
    }

    #[test]
    fn test_extra_state_axes_are_ignored() {
        let out = linear_field()
            .call(&point(&[("x", 1.0), ("y", 2.0), ("t", 7.0)]))
            .unwrap();
        assert_eq!(out.get("u"), 22.0);
    }

    #[test]
    fn test_divergence_of_identity_is_three() {
        let field = VectorField::new(["x", "y", "z"], |a| {
            a.names().map(|n| (n.to_string(), a[n].clone())).collect::<Vec<_>>()
        })
        .unwrap();
        let div = field.divergence().unwrap();
        assert_eq!(div.expression(DIVERGENCE_AXIS), Some(&Expr::constant(3.0)));
        for p in [(0.0, 0.0, 0.0), (1.5, -2.0, 8.0)] {
            let out = div.call(&point(&[("x", p.0), ("y", p.1), ("z", p.2)])).unwrap();
            assert_eq!(out.get(DIVERGENCE_AXIS), 3.0);
        }
    }

    #[test]
    fn test_divergence_rejects_mismatched_axes() {
        let field = VectorField::new(["x", "y"], |a| {
            [("u", a["x"].clone()), ("v", a["y"].clone()), ("w", &a["x"] + &a["y"])]
        })
        .unwrap();
        let err = field.divergence().unwrap_err();
        assert!(matches!(err, SymfieldError::Domain { .. }));
    }

    #[test]
    fn test_gradient_of_divergence() {
        let field = quadratic_field();
        let div = field.divergence().unwrap();
        let p = point(&[("x", 2.0), ("y", 3.0)]);
        // div = 2xy + 2xy
        assert_eq!(div.call(&p).unwrap().get(DIVERGENCE_AXIS), 24.0);
        let grad = div.jacobian().unwrap().call(&p).unwrap();
        assert_eq!(grad.get("ddiv_dx"), 12.0);
        assert_eq!(grad.get("ddiv_dy"), 8.0);
    }

    #[test]
    fn test_undeclared_variable_is_rejected() {
        let err = VectorField::new(["x"], |a| [("u", &a["x"] + Expr::variable("q"))]).unwrap_err();
        assert!(matches!(err, SymfieldError::MalformedExpression { .. }));
    }

    #[test]
    fn test_derived_fields_inherit_options() {
        let options = CompileOptions::default().with_deduplicate(false);
        let field = VectorField::with_options(["x"], |a| [("x", a["x"].powi(3))], options).unwrap();
        assert_eq!(field.jacobian().unwrap().program().options(), options);
        assert_eq!(field.divergence().unwrap().program().options(), options);
    }

    #[test]
    fn test_jacobian_matches_central_differences() {
        let field = VectorField::new(["x", "y"], |a| {
            let (x, y) = (&a["x"], &a["y"]);
            [
                ("u", x.powi(2) * y + (x * y).sigmoid()),
                ("v", x / (y.powi(2) + 1.0) - x.powi(3)),
            ]
        })
        .unwrap();
        let jacobian = field.jacobian().unwrap();

        let mut rng = StdRng::seed_from_u64(17);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let h = 1e-5;
        for _ in 0..25 {
            let p = point(&[("x", normal.sample(&mut rng)), ("y", normal.sample(&mut rng))]);
            let symbolic = jacobian.call(&p).unwrap();
            for input in ["x", "y"] {
                let step = point(&[(input, h)]);
                let ahead = field.call(&(&p + &step)).unwrap();
                let behind = field.call(&(&p - &step)).unwrap();
                for output in ["u", "v"] {
                    let numeric = (ahead.get(output) - behind.get(output)) / (2.0 * h);
                    let exact = symbolic.get(&jacobian_axis(output, input));
                    assert!(
                        (numeric - exact).abs() <= 1e-6 * (1.0 + exact.abs()),
                        "{}: {} vs {}",
                        jacobian_axis(output, input),
                        numeric,
                        exact
                    );
                }
            }
        }
    }

    #[test]
    fn test_display_lists_functions() {
        let text = linear_field().to_string();
        assert!(text.starts_with("axis | function"));
        assert!(text.contains("v    | "));
    }
}
