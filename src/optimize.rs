//! Algebraic simplification.
//!
//! Simplification runs bottom-up. A result of `None` means the node was eliminated:
//! it stands for zero and contributes nothing to an enclosing sum.

use std::collections::HashMap;

use crate::expr::{sigmoid, Expr, NodeKind};

impl Expr {
    /// Simplifies the expression, or returns `None` when it reduces to zero.
    ///
    /// Applies constant folding, additive and multiplicative identities, flattening
    /// of nested sums and products, like-term collapsing (`x + x` to `2*x`, `x * x`
    /// to `x^2`) and sign normalization. Never fails; a degenerate expression such
    /// as `0 * x` silently becomes `None`.
    pub fn optimize(&self) -> Option<Expr> {
        Optimizer::default().run(self)
    }

    /// Like [`Expr::optimize`], with an eliminated result turned into `Constant(0)`.
    pub fn optimized(&self) -> Expr {
        self.optimize().unwrap_or_else(|| Expr::constant(0.0))
    }
}

#[derive(Default)]
struct Optimizer {
    memo: HashMap<*const (), Option<Expr>>,
}

impl Optimizer {
    fn run(&mut self, expr: &Expr) -> Option<Expr> {
        if let Some(done) = self.memo.get(&expr.addr()) {
            return done.clone();
        }
        let result = self.simplify(expr);
        self.memo.insert(expr.addr(), result.clone());
        result
    }

    fn simplify(&mut self, expr: &Expr) -> Option<Expr> {
        match expr.kind() {
            NodeKind::Variable(_) | NodeKind::Constant(_) => Some(expr.clone()),
            NodeKind::Add => {
                let terms: Vec<Expr> = expr.operands().iter().filter_map(|o| self.run(o)).collect();
                self.build_sum(terms)
            }
            NodeKind::Multiply => {
                let mut factors = Vec::with_capacity(expr.operands().len());
                for operand in expr.operands() {
                    // a zero factor annihilates the product, siblings are not visited
                    factors.push(self.run(operand)?);
                }
                self.build_product(factors)
            }
            NodeKind::Negate => self.run(&expr.operands()[0]).map(negated),
            NodeKind::Reciprocal => Some(reciprocal(self.run(&expr.operands()[0]))),
            NodeKind::Sigmoid => Some(match self.run(&expr.operands()[0]) {
                None => Expr::constant(0.5),
                Some(inner) => match inner.constant_value() {
                    Some(c) => Expr::constant(sigmoid(c)),
                    None => inner.sigmoid(),
                },
            }),
            NodeKind::Power(n) => power(self.run(&expr.operands()[0]), *n),
        }
    }

    /// Sum of already simplified terms.
    fn build_sum(&mut self, terms: Vec<Expr>) -> Option<Expr> {
        let mut constant = 0.0;
        // (base, coefficient) in first-appearance order
        let mut groups: Vec<(Expr, f64)> = Vec::new();

        let mut pending: Vec<Expr> = terms.into_iter().rev().collect();
        while let Some(term) = pending.pop() {
            match term.kind() {
                NodeKind::Add => pending.extend(term.operands().iter().rev().cloned()),
                NodeKind::Constant(c) => constant += c,
                _ => {
                    let (coefficient, base) = split_coefficient(&term);
                    match groups.iter_mut().find(|(b, _)| *b == base) {
                        Some((_, total)) => *total += coefficient,
                        None => groups.push((base, coefficient)),
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(groups.len() + 1);
        for (base, coefficient) in groups {
            if coefficient == 0.0 {
                continue;
            }
            if coefficient == 1.0 {
                out.push(base);
            } else if coefficient == -1.0 {
                out.push(negated(base));
            } else if let Some(scaled) = self.build_product(vec![Expr::constant(coefficient), base]) {
                out.push(scaled);
            }
        }
        if constant != 0.0 {
            out.push(Expr::constant(constant));
        }

        match out.len() {
            0 => None,
            1 => out.pop(),
            _ => Some(Expr::sum(out)),
        }
    }

    /// Product of already simplified factors.
    fn build_product(&mut self, factors: Vec<Expr>) -> Option<Expr> {
        let mut constant = 1.0;
        let mut sign_flips = 0usize;
        // (base, exponent) in first-appearance order
        let mut groups: Vec<(Expr, i32)> = Vec::new();

        let mut pending: Vec<Expr> = factors.into_iter().rev().collect();
        while let Some(factor) = pending.pop() {
            match factor.kind() {
                NodeKind::Constant(c) => {
                    if *c == 0.0 {
                        return None;
                    }
                    constant *= c;
                }
                NodeKind::Negate => {
                    sign_flips += 1;
                    pending.push(factor.operands()[0].clone());
                }
                NodeKind::Multiply => pending.extend(factor.operands().iter().rev().cloned()),
                _ => {
                    // Only same-sign exponents merge, so `x * (1/x)` keeps its value at
                    // zero. A merge that would overflow starts a new group instead.
                    let (base, exponent) = split_exponent(&factor);
                    let merged = groups
                        .iter_mut()
                        .filter(|(b, total)| *b == base && (*total > 0) == (exponent > 0))
                        .find_map(|(_, total)| total.checked_add(exponent).map(|sum| (total, sum)));
                    match merged {
                        Some((total, sum)) => *total = sum,
                        None => groups.push((base, exponent)),
                    }
                }
            }
        }

        if constant < 0.0 {
            constant = -constant;
            sign_flips += 1;
        }

        let mut out = Vec::with_capacity(groups.len() + 1);
        if constant != 1.0 {
            out.push(Expr::constant(constant));
        }
        for (base, exponent) in groups {
            match exponent {
                0 => {}
                1 => out.push(base),
                -1 => out.push(base.reciprocal()),
                n => out.push(base.powi(n)),
            }
        }

        let magnitude = match out.len() {
            0 => Expr::constant(constant),
            1 => out.remove(0),
            _ => Expr::product(out),
        };
        Some(if sign_flips % 2 == 1 { negated(magnitude) } else { magnitude })
    }
}

/// Splits a simplified sum term into `coefficient * base`.
fn split_coefficient(term: &Expr) -> (f64, Expr) {
    match term.kind() {
        NodeKind::Negate => {
            let (c, base) = split_coefficient(&term.operands()[0]);
            (-c, base)
        }
        NodeKind::Multiply => {
            let operands = term.operands();
            match operands.iter().position(|o| o.constant_value().is_some()) {
                Some(i) => {
                    let c = operands[i].constant_value().unwrap_or(1.0);
                    let rest: Vec<Expr> = operands
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, o)| o.clone())
                        .collect();
                    let base = if rest.len() == 1 { rest[0].clone() } else { Expr::product(rest) };
                    (c, base)
                }
                None => (1.0, term.clone()),
            }
        }
        _ => (1.0, term.clone()),
    }
}

/// Splits a simplified product factor into `base ^ exponent`.
fn split_exponent(factor: &Expr) -> (Expr, i32) {
    match factor.kind() {
        NodeKind::Power(n) => (factor.operands()[0].clone(), *n),
        NodeKind::Reciprocal => (factor.operands()[0].clone(), -1),
        _ => (factor.clone(), 1),
    }
}

fn negated(inner: Expr) -> Expr {
    match inner.kind() {
        NodeKind::Constant(c) => Expr::constant(-c),
        NodeKind::Negate => inner.operands()[0].clone(),
        _ => inner.negate(),
    }
}

fn reciprocal(inner: Option<Expr>) -> Expr {
    // 1/0 is kept as written; compiling it is rejected as malformed.
    let inner = match inner {
        None => return Expr::constant(0.0).reciprocal(),
        Some(inner) => inner,
    };
    match inner.kind() {
        NodeKind::Constant(c) if *c != 0.0 => Expr::constant(1.0 / c),
        NodeKind::Power(n) => match n.checked_neg() {
            Some(m) => power(Some(inner.operands()[0].clone()), m).unwrap_or_else(|| inner.clone()),
            None => inner.reciprocal(),
        },
        NodeKind::Reciprocal => inner.operands()[0].clone(),
        NodeKind::Negate => negated(reciprocal(Some(inner.operands()[0].clone()))),
        _ => inner.reciprocal(),
    }
}

fn power(base: Option<Expr>, n: i32) -> Option<Expr> {
    if n == 0 {
        return Some(Expr::constant(1.0));
    }
    let base = match base {
        None if n > 0 => return None,
        None => return Some(Expr::constant(0.0).powi(n)),
        Some(base) => base,
    };
    if n == 1 {
        return Some(base);
    }
    Some(match base.kind() {
        NodeKind::Constant(c) if *c != 0.0 || n > 0 => Expr::constant(c.powi(n)),
        NodeKind::Power(m) => match m.checked_mul(n) {
            Some(mn) => return power(Some(base.operands()[0].clone()), mn),
            None => base.powi(n),
        },
        NodeKind::Reciprocal => match n.checked_neg() {
            Some(m) => return power(Some(base.operands()[0].clone()), m),
            None => base.powi(n),
        },
        NodeKind::Negate => {
            let magnitude = power(Some(base.operands()[0].clone()), n)?;
            if n % 2 == 0 {
                magnitude
            } else {
                negated(magnitude)
            }
        }
        _ => base.powi(n),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn vars() -> (Expr, Expr) {
        (Expr::variable("x"), Expr::variable("y"))
    }

    fn at(expr: &Expr, x: f64, y: f64) -> f64 {
        let bindings = [("x".to_string(), x), ("y".to_string(), y)].into_iter().collect();
        expr.eval(&bindings).unwrap()
    }

    #[test]
    fn test_leaves_optimize_to_themselves() {
        let x = Expr::variable("x");
        assert!(Expr::ptr_eq(&x.optimize().unwrap(), &x));
        assert_eq!(Expr::constant(0.0).optimize(), Some(Expr::constant(0.0)));
    }

    #[test]
    fn test_constant_folding() {
        let e = Expr::sum(vec![Expr::constant(1.0), Expr::constant(2.5)]);
        assert_eq!(e.optimize(), Some(Expr::constant(3.5)));
        let p = Expr::product(vec![Expr::constant(2.0), Expr::constant(4.0)]);
        assert_eq!(p.optimize(), Some(Expr::constant(8.0)));
    }

    #[test]
    fn test_additive_identity() {
        let (x, _) = vars();
        let e = Expr::sum(vec![Expr::constant(0.0), x.clone(), Expr::constant(0.0)]);
        assert_eq!(e.optimize(), Some(x));
        assert_eq!(Expr::sum(vec![]).optimize(), None);
        assert_eq!(Expr::sum(vec![Expr::constant(0.0)]).optimize(), None);
    }

    #[test]
    fn test_multiplicative_identity_and_annihilator() {
        let (x, y) = vars();
        let e = Expr::product(vec![Expr::constant(1.0), x.clone()]);
        assert_eq!(e.optimize(), Some(x.clone()));
        let zero = Expr::product(vec![x.clone(), Expr::constant(0.0), y]);
        assert_eq!(zero.optimize(), None);
        assert_eq!(zero.optimized(), Expr::constant(0.0));
        // a product of ones is one, not zero
        let ones = Expr::product(vec![Expr::constant(1.0), Expr::constant(1.0)]);
        assert_eq!(ones.optimize(), Some(Expr::constant(1.0)));
    }

    #[test]
    fn test_eliminated_factor_annihilates() {
        let (x, y) = vars();
        // d/dy of x is an eliminated zero inside the product
        let e = Expr::product(vec![x.differentiate("y"), y.sigmoid()]);
        assert_eq!(e.optimize(), None);
    }

    #[test]
    fn test_like_terms_in_sum() {
        let (x, y) = vars();
        let e = Expr::sum(vec![x.clone(), y.clone(), x.clone()]);
        let expected = Expr::sum(vec![Expr::product(vec![Expr::constant(2.0), x.clone()]), y.clone()]);
        assert_eq!(e.optimize(), Some(expected));
        // opposite terms cancel
        assert_eq!((&x - &x).optimize(), None);
    }

    #[test]
    fn test_like_factors_in_product() {
        let (x, y) = vars();
        let e = Expr::product(vec![x.clone(), y.clone(), x.clone()]);
        assert_eq!(e.optimize(), Some(Expr::product(vec![x.powi(2), y.clone()])));
        let merged = Expr::product(vec![x.powi(2), x.clone()]);
        assert_eq!(merged.optimize(), Some(x.powi(3)));
        let merged = Expr::product(vec![x.reciprocal(), x.powi(-2)]);
        assert_eq!(merged.optimize(), Some(x.powi(-3)));
    }

    #[test]
    fn test_base_and_reciprocal_do_not_cancel() {
        let x = Expr::variable("x");
        let e = Expr::product(vec![x.clone(), x.reciprocal()]);
        let optimized = e.optimize().unwrap();
        assert_eq!(optimized, e);
        assert!(at(&optimized, 0.0, 0.0).is_nan());
        assert_eq!(at(&optimized, 4.0, 0.0), 1.0);
    }

    #[test]
    fn test_exponent_overflow_keeps_factors_apart() {
        let x = Expr::variable("x");
        let high = Expr::product(vec![x.powi(i32::MAX), x.clone()]);
        assert_eq!(high.optimize(), Some(high.clone()));

        let low = Expr::product(vec![x.powi(-i32::MAX), x.reciprocal(), x.reciprocal()]);
        let optimized = low.optimize().unwrap();
        assert_eq!(optimized, Expr::product(vec![x.powi(i32::MIN), x.reciprocal()]));
        assert_eq!(optimized.optimized(), optimized);

        // (x^MIN)^-1 and 1/(x^MIN) have no representable exponent
        assert_eq!(x.powi(i32::MIN).reciprocal().optimize(), Some(x.powi(i32::MIN).reciprocal()));
        assert_eq!(x.powi(65536).powi(65536).optimize(), Some(x.powi(65536).powi(65536)));

        let text = "field f(x) { u = x^2147483647 * x }";
        let field = crate::parse_source(text).unwrap().field("f").unwrap().build(Default::default()).unwrap();
        assert!(field.expression("u").is_some());
        let d = field.jacobian().unwrap();
        assert!(d.expression("du_dx").is_some());
    }

    #[test]
    fn test_flattening_exposes_duplicates() {
        let (x, y) = vars();
        let nested = Expr::product(vec![
            Expr::product(vec![x.clone(), y.clone()]),
            Expr::product(vec![y.clone(), Expr::constant(3.0)]),
        ]);
        assert_eq!(nested.optimize(), Some(Expr::product(vec![Expr::constant(3.0), x.clone(), y.powi(2)])));

        let sums = Expr::sum(vec![Expr::sum(vec![x.clone(), Expr::constant(1.0)]), Expr::sum(vec![x.clone(), Expr::constant(2.0)])]);
        assert_eq!(
            sums.optimize(),
            Some(Expr::sum(vec![Expr::product(vec![Expr::constant(2.0), x.clone()]), Expr::constant(3.0)]))
        );
    }

    #[test]
    fn test_negation_propagation() {
        let (x, y) = vars();
        let one_flip = Expr::product(vec![x.negate(), y.clone()]);
        assert_eq!(one_flip.optimize(), Some(Expr::product(vec![x.clone(), y.clone()]).negate()));
        let two_flips = Expr::product(vec![x.negate(), y.negate()]);
        assert_eq!(two_flips.optimize(), Some(Expr::product(vec![x.clone(), y.clone()])));
        let negative_constant = Expr::product(vec![Expr::constant(-2.0), x.clone()]);
        assert_eq!(negative_constant.optimize(), Some(Expr::product(vec![Expr::constant(2.0), x.clone()]).negate()));
        assert_eq!(x.negate().negate().optimize(), Some(x.clone()));
        assert_eq!(Expr::constant(3.0).negate().optimize(), Some(Expr::constant(-3.0)));
    }

    #[test]
    fn test_reciprocal_rules() {
        let (x, _) = vars();
        assert_eq!(Expr::constant(4.0).reciprocal().optimize(), Some(Expr::constant(0.25)));
        assert_eq!(x.powi(2).reciprocal().optimize(), Some(x.powi(-2)));
        assert_eq!(x.reciprocal().reciprocal().optimize(), Some(x.clone()));
        // 1/0 survives simplification untouched
        let zero = Expr::product(vec![Expr::constant(0.0), x.clone()]).reciprocal();
        assert_eq!(zero.optimize(), Some(Expr::constant(0.0).reciprocal()));
    }

    #[test]
    fn test_power_rules() {
        let (x, _) = vars();
        assert_eq!(x.powi(1).optimize(), Some(x.clone()));
        assert_eq!(x.powi(0).optimize(), Some(Expr::constant(1.0)));
        assert_eq!(Expr::constant(3.0).powi(2).optimize(), Some(Expr::constant(9.0)));
        assert_eq!(x.powi(2).powi(3).optimize(), Some(x.powi(6)));
        assert_eq!(x.negate().powi(2).optimize(), Some(x.powi(2)));
        assert_eq!(x.negate().powi(3).optimize(), Some(x.powi(3).negate()));
    }

    #[test]
    fn test_sigmoid_rules() {
        let (x, _) = vars();
        assert_eq!(Expr::constant(0.0).sigmoid().optimize(), Some(Expr::constant(0.5)));
        assert_eq!(Expr::sum(vec![]).sigmoid().optimize(), Some(Expr::constant(0.5)));
        assert_eq!(Expr::sum(vec![x.clone(), Expr::constant(0.0)]).sigmoid().optimize(), Some(x.sigmoid()));
    }

    fn sample_expressions() -> Vec<Expr> {
        let (x, y) = vars();
        vec![
            10.0 * &x * &y + &y,
            -&x - 1.0,
            x.powi(2) * &y + &x * y.powi(2),
            (&x + &y) * (&x - &y) / (&x * &x + 1.0),
            (&x * &y).sigmoid() * (2.0 - &x) - (&y).sigmoid(),
            (x.powi(2) * &y).differentiate("x"),
            ((&x + 1.0).reciprocal() * &y).differentiate("x"),
            (&x * &y).sigmoid().differentiate("y").differentiate("x"),
            &x * &x * &x - 3.0 * x.powi(3) + 2.0 * &x * x.powi(2),
        ]
    }

    #[test]
    fn test_optimization_preserves_value() {
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(0.0, 2.0).unwrap();
        for expr in sample_expressions() {
            let once = expr.optimized();
            let twice = once.optimized();
            for _ in 0..20 {
                let (x, y) = (normal.sample(&mut rng), normal.sample(&mut rng));
                let original = at(&expr, x, y);
                let simplified = at(&once, x, y);
                let tolerance = 1e-9 * original.abs().max(1.0);
                assert!((original - simplified).abs() < tolerance, "{} vs {} at ({}, {})", expr, once, x, y);
                assert_eq!(simplified.to_bits(), at(&twice, x, y).to_bits());
            }
        }
    }

    #[test]
    fn test_optimization_is_idempotent_structurally() {
        for expr in sample_expressions() {
            let once = expr.optimized();
            assert_eq!(once.optimized(), once, "{}", expr);
        }
    }
}
