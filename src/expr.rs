//! Expression nodes: the builder-side representation of a symbolic expression.
//!
//! An [`Expr`] is a cheap, reference-counted handle to an immutable node. Composing
//! handles with the arithmetic operators builds an expression graph in which
//! subexpressions may be shared by several parents. Compilation into an evaluation
//! plan happens later in [`crate::graph::Program`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

use crate::error::{Result, SymfieldError};

/// Operator (or leaf) carried by a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Variable(String),
    Constant(f64),
    Add,
    Multiply,
    Negate,
    Reciprocal,
    Sigmoid,
    /// Fixed integer exponent; the base is the single operand.
    Power(i32),
}

impl NodeKind {
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Variable(_) | NodeKind::Constant(_))
    }

    /// Number of operands the kind requires, `None` for the n-ary sum and product.
    pub fn arity(&self) -> Option<usize> {
        match self {
            NodeKind::Variable(_) | NodeKind::Constant(_) => Some(0),
            NodeKind::Add | NodeKind::Multiply => None,
            NodeKind::Negate | NodeKind::Reciprocal | NodeKind::Sigmoid | NodeKind::Power(_) => Some(1),
        }
    }

    /// Computes the node's value from the values of its operands.
    ///
    /// Variables have no rule of their own (their value is bound from outside), so
    /// they yield `None`.
    pub fn apply(&self, args: &[f64]) -> Option<f64> {
        let value = match self {
            NodeKind::Variable(_) => return None,
            NodeKind::Constant(v) => *v,
            NodeKind::Add => args.iter().sum(),
            NodeKind::Multiply => args.iter().product(),
            NodeKind::Negate => -first(args),
            NodeKind::Reciprocal => 1.0 / first(args),
            NodeKind::Sigmoid => sigmoid(first(args)),
            NodeKind::Power(n) => first(args).powi(*n),
        };
        Some(value)
    }
}

fn first(args: &[f64]) -> f64 {
    args.first().copied().unwrap_or(f64::NAN)
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug)]
struct ExprNode {
    kind: NodeKind,
    operands: Vec<Expr>,
}

/// Shared handle to an expression node.
///
/// Equality (`==`) is structural: same kind, same auxiliary scalar and pairwise-equal
/// operands. Two handles to the same allocation are equal without recursing, see
/// [`Expr::ptr_eq`] for pure reference identity.
#[derive(Debug, Clone)]
pub struct Expr(Rc<ExprNode>);

impl Expr {
    /// Builds a node after checking the operand count against the kind.
    pub fn new(kind: NodeKind, operands: Vec<Expr>) -> Result<Expr> {
        match kind.arity() {
            Some(n) if n != operands.len() => {
                return Err(SymfieldError::malformed(format!(
                    "{:?} takes {} operand(s), got {}",
                    kind,
                    n,
                    operands.len()
                )));
            }
            _ => {}
        }
        Ok(Expr::from_parts(kind, operands))
    }

    pub(crate) fn from_parts(kind: NodeKind, operands: Vec<Expr>) -> Expr {
        Expr(Rc::new(ExprNode { kind, operands }))
    }

    pub fn variable(name: impl Into<String>) -> Expr {
        Expr::from_parts(NodeKind::Variable(name.into()), Vec::new())
    }

    pub fn constant(value: f64) -> Expr {
        Expr::from_parts(NodeKind::Constant(value), Vec::new())
    }

    /// N-ary sum. An empty sum is allowed and optimizes away.
    pub fn sum(terms: Vec<Expr>) -> Expr {
        Expr::from_parts(NodeKind::Add, terms)
    }

    /// N-ary product.
    pub fn product(factors: Vec<Expr>) -> Expr {
        Expr::from_parts(NodeKind::Multiply, factors)
    }

    pub fn negate(&self) -> Expr {
        Expr::from_parts(NodeKind::Negate, vec![self.clone()])
    }

    pub fn reciprocal(&self) -> Expr {
        Expr::from_parts(NodeKind::Reciprocal, vec![self.clone()])
    }

    pub fn sigmoid(&self) -> Expr {
        Expr::from_parts(NodeKind::Sigmoid, vec![self.clone()])
    }

    pub fn powi(&self, exponent: i32) -> Expr {
        Expr::from_parts(NodeKind::Power(exponent), vec![self.clone()])
    }

    /// Power with a floating exponent, which must hold an integer value.
    pub fn powf(&self, exponent: f64) -> Result<Expr> {
        if exponent.fract() != 0.0 || !exponent.is_finite() || exponent.abs() > i32::MAX as f64 {
            return Err(SymfieldError::malformed(format!(
                "power exponent must be an integer, got {}",
                exponent
            )));
        }
        Ok(self.powi(exponent as i32))
    }

    pub fn kind(&self) -> &NodeKind {
        &self.0.kind
    }

    pub fn operands(&self) -> &[Expr] {
        &self.0.operands
    }

    pub fn is_leaf(&self) -> bool {
        self.0.kind.is_leaf()
    }

    pub fn variable_name(&self) -> Option<&str> {
        match &self.0.kind {
            NodeKind::Variable(name) => Some(name),
            _ => None,
        }
    }

    pub fn constant_value(&self) -> Option<f64> {
        match self.0.kind {
            NodeKind::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_constant(&self, value: f64) -> bool {
        self.constant_value() == Some(value)
    }

    /// Reference identity: both handles point at the same node.
    pub fn ptr_eq(a: &Expr, b: &Expr) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn addr(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }

    /// Longest path to a leaf, counting leaves as depth 1.
    pub fn depth(&self) -> usize {
        fn visit(expr: &Expr, memo: &mut HashMap<*const (), usize>) -> usize {
            if let Some(&d) = memo.get(&expr.addr()) {
                return d;
            }
            let d = 1 + expr.operands().iter().map(|o| visit(o, memo)).max().unwrap_or(0);
            memo.insert(expr.addr(), d);
            d
        }
        visit(self, &mut HashMap::new())
    }

    /// Names of every variable reachable from this node, sorted and deduplicated.
    pub fn free_variables(&self) -> Vec<String> {
        fn visit(expr: &Expr, seen: &mut HashSet<*const ()>, names: &mut Vec<String>) {
            if !seen.insert(expr.addr()) {
                return;
            }
            if let Some(name) = expr.variable_name() {
                names.push(name.to_string());
            }
            for operand in expr.operands() {
                visit(operand, seen, names);
            }
        }
        let mut names = Vec::new();
        visit(self, &mut HashSet::new(), &mut names);
        names.sort();
        names.dedup();
        names
    }

    /// Direct tree evaluation without compiling a program.
    ///
    /// Shared subexpressions are evaluated once. Fails on a variable missing from
    /// `bindings`.
    pub fn eval(&self, bindings: &HashMap<String, f64>) -> Result<f64> {
        fn visit(expr: &Expr, bindings: &HashMap<String, f64>, memo: &mut HashMap<*const (), f64>) -> Result<f64> {
            if let Some(&v) = memo.get(&expr.addr()) {
                return Ok(v);
            }
            let value = match expr.kind() {
                NodeKind::Variable(name) => *bindings.get(name).ok_or_else(|| SymfieldError::unbound(name.as_str()))?,
                kind => {
                    let args = expr
                        .operands()
                        .iter()
                        .map(|o| visit(o, bindings, memo))
                        .collect::<Result<Vec<_>>>()?;
                    kind.apply(&args).unwrap_or(f64::NAN)
                }
            };
            memo.insert(expr.addr(), value);
            Ok(value)
        }
        visit(self, bindings, &mut HashMap::new())
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        if Expr::ptr_eq(self, other) {
            return true;
        }
        self.kind() == other.kind()
            && self.operands().len() == other.operands().len()
            && self.operands().iter().zip(other.operands()).all(|(a, b)| a == b)
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::constant(value)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::constant(value as f64)
    }
}

impl From<&Expr> for Expr {
    fn from(value: &Expr) -> Self {
        value.clone()
    }
}

// Operator sugar. Sums and products keep growing n-ary when the left side is already
// one; two constants fold immediately.

fn add_exprs(a: Expr, b: Expr) -> Expr {
    match (a.kind(), b.kind()) {
        (NodeKind::Constant(x), NodeKind::Constant(y)) => Expr::constant(x + y),
        (NodeKind::Add, _) => {
            let mut terms = a.operands().to_vec();
            terms.push(b);
            Expr::sum(terms)
        }
        _ => Expr::sum(vec![a, b]),
    }
}

fn mul_exprs(a: Expr, b: Expr) -> Expr {
    match (a.kind(), b.kind()) {
        (NodeKind::Constant(x), NodeKind::Constant(y)) => Expr::constant(x * y),
        (NodeKind::Multiply, _) => {
            let mut factors = a.operands().to_vec();
            factors.push(b);
            Expr::product(factors)
        }
        _ => Expr::product(vec![a, b]),
    }
}

fn neg_expr(a: Expr) -> Expr {
    match a.kind() {
        NodeKind::Constant(x) => Expr::constant(-x),
        _ => a.negate(),
    }
}

fn recip_expr(a: Expr) -> Expr {
    match a.kind() {
        NodeKind::Constant(x) if *x != 0.0 => Expr::constant(1.0 / x),
        _ => a.reciprocal(),
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $body:expr) => {
        impl<R: Into<Expr>> $trait<R> for Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                let f: fn(Expr, Expr) -> Expr = $body;
                f(self, rhs.into())
            }
        }

        impl<R: Into<Expr>> $trait<R> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                let f: fn(Expr, Expr) -> Expr = $body;
                f(self.clone(), rhs.into())
            }
        }

        impl $trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                let f: fn(Expr, Expr) -> Expr = $body;
                f(Expr::constant(self), rhs)
            }
        }

        impl $trait<&Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                let f: fn(Expr, Expr) -> Expr = $body;
                f(Expr::constant(self), rhs.clone())
            }
        }
    };
}

impl_binary_op!(Add, add, add_exprs);
impl_binary_op!(Sub, sub, |a, b| add_exprs(a, neg_expr(b)));
impl_binary_op!(Mul, mul, mul_exprs);
impl_binary_op!(Div, div, |a, b| mul_exprs(a, recip_expr(b)));

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        neg_expr(self)
    }
}

impl Neg for &Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        neg_expr(self.clone())
    }
}

fn join(f: &mut fmt::Formatter<'_>, operands: &[Expr], sep: &str) -> fmt::Result {
    for (i, operand) in operands.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", operand)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            NodeKind::Variable(name) => write!(f, "{}", name),
            NodeKind::Constant(v) => write!(f, "{}", v),
            NodeKind::Add if self.operands().is_empty() => write!(f, "0"),
            NodeKind::Multiply if self.operands().is_empty() => write!(f, "1"),
            NodeKind::Add => {
                write!(f, "(")?;
                join(f, self.operands(), "+")?;
                write!(f, ")")
            }
            NodeKind::Multiply => {
                write!(f, "(")?;
                join(f, self.operands(), "*")?;
                write!(f, ")")
            }
            NodeKind::Negate => write!(f, "(-{})", self.operands()[0]),
            NodeKind::Reciprocal => write!(f, "(1/{})", self.operands()[0]),
            NodeKind::Sigmoid => write!(f, "sigmoid({})", self.operands()[0]),
            NodeKind::Power(n) => write!(f, "({}^{})", self.operands()[0], n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_variables_compare_by_name() {
        let a = Expr::variable("x");
        let b = Expr::variable("x");
        assert!(!Expr::ptr_eq(&a, &b));
        assert_eq!(a, b);
        assert_ne!(a, Expr::variable("y"));
    }

    #[test]
    fn test_constants_compare_by_value() {
        assert_eq!(Expr::constant(2.0), Expr::constant(2.0));
        assert_ne!(Expr::constant(2.0), Expr::constant(3.0));
        assert_ne!(Expr::constant(2.0), Expr::variable("2"));
    }

    #[test]
    fn test_structural_equality_is_ordered() {
        let x = Expr::variable("x");
        let y = Expr::variable("y");
        assert_eq!(&x + &y, Expr::variable("x") + Expr::variable("y"));
        assert_ne!(&x + &y, &y + &x);
        assert_ne!(x.powi(2), x.powi(3));
    }

    #[test]
    fn test_operator_chain_stays_n_ary() {
        let x = Expr::variable("x");
        let sum = &x + 1.0 + &x + 2.0;
        assert_eq!(sum.kind(), &NodeKind::Add);
        assert_eq!(sum.operands().len(), 4);

        let product = 10.0 * &x * &x;
        assert_eq!(product.kind(), &NodeKind::Multiply);
        assert_eq!(product.operands().len(), 3);
    }

    #[test]
    fn test_constant_operands_fold() {
        let c = Expr::constant(2.0) * 3.0 - 1.0;
        assert_eq!(c.constant_value(), Some(5.0));
        assert_eq!((-Expr::constant(4.0)).constant_value(), Some(-4.0));
        assert_eq!((1.0 / Expr::constant(4.0)).constant_value(), Some(1.0 / 4.0));
    }

    #[test]
    fn test_depth_of_leaves_and_trees() {
        let x = Expr::variable("x");
        assert_eq!(x.depth(), 1);
        assert_eq!((&x + 1.0).depth(), 2);
        assert_eq!((&x * &x + 1.0).negate().depth(), 4);
    }

    #[test]
    fn test_eval_tree() {
        let x = Expr::variable("x");
        let y = Expr::variable("y");
        let e = 10.0 * &x * &y + &y;
        assert_eq!(e.eval(&bind(&[("x", 1.0), ("y", 2.0)])).unwrap(), 22.0);

        let s = x.sigmoid();
        assert!((s.eval(&bind(&[("x", 0.0)])).unwrap() - 0.5).abs() < 1e-12);

        let r = (&x / &y).powi(-2);
        assert!((r.eval(&bind(&[("x", 1.0), ("y", 2.0)])).unwrap() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_eval_reports_unbound_variable() {
        let e = Expr::variable("x") + Expr::variable("z");
        let err = e.eval(&bind(&[("x", 1.0)])).unwrap_err();
        assert_eq!(err, SymfieldError::unbound("z"));
    }

    #[test]
    fn test_new_checks_arity() {
        let x = Expr::variable("x");
        assert!(Expr::new(NodeKind::Negate, vec![]).is_err());
        assert!(Expr::new(NodeKind::Power(2), vec![x.clone(), x.clone()]).is_err());
        assert!(Expr::new(NodeKind::Constant(1.0), vec![x.clone()]).is_err());
        assert!(Expr::new(NodeKind::Add, vec![]).is_ok());
        assert!(Expr::new(NodeKind::Sigmoid, vec![x]).is_ok());
    }

    #[test]
    fn test_powf_rejects_fractional_exponent() {
        let x = Expr::variable("x");
        assert_eq!(x.powf(3.0).unwrap(), x.powi(3));
        assert!(matches!(x.powf(0.5), Err(SymfieldError::MalformedExpression { .. })));
        assert!(x.powf(f64::NAN).is_err());
    }

    #[test]
    fn test_free_variables() {
        let x = Expr::variable("x");
        let e = &x * Expr::variable("y") + x.sigmoid() + 3.0;
        assert_eq!(e.free_variables(), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_display() {
        let x = Expr::variable("x");
        let y = Expr::variable("y");
        assert_eq!((&x + &y).to_string(), "(x+y)");
        assert_eq!((2.0 * &x).to_string(), "(2*x)");
        assert_eq!((-&x).to_string(), "(-x)");
        assert_eq!((1.0 / &x).to_string(), "(1*(1/x))");
        assert_eq!(x.powi(3).sigmoid().to_string(), "sigmoid((x^3))");
    }
}
