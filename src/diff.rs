//! Analytic differentiation.

use std::collections::HashMap;

use crate::expr::{Expr, NodeKind};

impl Expr {
    /// Partial derivative with respect to the variable called `variable`.
    ///
    /// The result is unsimplified; run it through [`Expr::optimize`] before display.
    /// Subexpressions shared in the input stay shared in the derivative.
    pub fn differentiate(&self, variable: &str) -> Expr {
        Differentiator {
            variable,
            memo: HashMap::new(),
        }
        .run(self)
    }
}

struct Differentiator<'a> {
    variable: &'a str,
    memo: HashMap<*const (), Expr>,
}

impl Differentiator<'_> {
    fn run(&mut self, expr: &Expr) -> Expr {
        if let Some(d) = self.memo.get(&expr.addr()) {
            return d.clone();
        }
        let d = self.rule(expr);
        self.memo.insert(expr.addr(), d.clone());
        d
    }

    fn rule(&mut self, expr: &Expr) -> Expr {
        let operands = expr.operands();
        match expr.kind() {
            NodeKind::Variable(name) => Expr::constant(if name == self.variable { 1.0 } else { 0.0 }),
            NodeKind::Constant(_) => Expr::constant(0.0),
            NodeKind::Add => Expr::sum(operands.iter().map(|o| self.run(o)).collect()),
            NodeKind::Multiply => {
                // Product rule over all factors: one term per factor, with that factor
                // replaced by its derivative.
                let terms = (0..operands.len())
                    .map(|i| {
                        let factors = operands
                            .iter()
                            .enumerate()
                            .map(|(j, o)| if i == j { self.run(o) } else { o.clone() })
                            .collect();
                        Expr::product(factors)
                    })
                    .collect();
                Expr::sum(terms)
            }
            NodeKind::Negate => self.run(&operands[0]).negate(),
            NodeKind::Reciprocal => {
                // d(1/u) = -(1/u^2) * du
                let u = &operands[0];
                Expr::product(vec![u.powi(2).reciprocal().negate(), self.run(u)])
            }
            NodeKind::Power(n) => {
                let u = &operands[0];
                let lowered = match n.checked_sub(1) {
                    Some(m) => u.powi(m),
                    None => Expr::product(vec![expr.clone(), u.reciprocal()]),
                };
                Expr::product(vec![Expr::constant(*n as f64), lowered, self.run(u)])
            }
            NodeKind::Sigmoid => {
                // d(s(u)) = s(u) * (1 - s(u)) * du, reusing this node for s(u)
                let u = &operands[0];
                Expr::product(vec![
                    expr.clone(),
                    Expr::sum(vec![Expr::constant(1.0), expr.negate()]),
                    self.run(u),
                ])
            }
        }
    }
}
