use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, SymfieldError};
use crate::expr::Expr;
use crate::field::VectorField;
use crate::graph::CompileOptions;

/// Expressions on the right-hand side of an output definition
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Numeric literal (e.g., 5.0, 1e-3)
    Number(f64),
    /// Input axis reference (e.g., x, y)
    Identifier(String),
    /// Binary operation (e.g., x + y, x / y)
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    /// Unary operation (e.g., -x)
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expression>,
    },
    /// Integer power (e.g., x ^ 2, y ** -1)
    Power { base: Box<Expression>, exponent: i32 },
    /// Function call (e.g., sigmoid(x))
    Call { name: String, args: Vec<Expression> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add, // +
    Sub, // -
    Mul, // *
    Div, // /
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Neg, // -
}

/// One `axis = expression` statement
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub axis: String,
    pub value: Expression,
    pub line: usize,
}

/// `field name(inputs...) { definitions... }`
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<Definition>,
}

/// The root of the AST: every field in a source file, in order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldFile {
    pub fields: Vec<FieldDef>,
}

impl FieldFile {
    pub fn new() -> Self {
        FieldFile { fields: Vec::new() }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

impl Expression {
    /// Builds the symbolic expression, resolving identifiers through `axes`.
    pub fn lower(&self, axes: &HashMap<String, Expr>) -> Result<Expr> {
        let expr = match self {
            Expression::Number(n) => Expr::constant(*n),
            Expression::Identifier(name) => axes
                .get(name)
                .cloned()
                .ok_or_else(|| SymfieldError::malformed(format!("'{}' is not an input axis", name)))?,
            Expression::BinaryOp { left, op, right } => {
                let (left, right) = (left.lower(axes)?, right.lower(axes)?);
                match op {
                    BinaryOperator::Add => left + right,
                    BinaryOperator::Sub => left - right,
                    BinaryOperator::Mul => left * right,
                    BinaryOperator::Div => left / right,
                }
            }
            Expression::UnaryOp {
                op: UnaryOperator::Neg,
                expr,
            } => -expr.lower(axes)?,
            Expression::Power { base, exponent } => base.lower(axes)?.powi(*exponent),
            Expression::Call { name, args } => match (name.as_str(), args.as_slice()) {
                ("sigmoid", [arg]) => arg.lower(axes)?.sigmoid(),
                _ => {
                    return Err(SymfieldError::malformed(format!(
                        "no function '{}' taking {} argument(s)",
                        name,
                        args.len()
                    )))
                }
            },
        };
        Ok(expr)
    }
}

impl FieldDef {
    /// Compiles the definition into a vector field over its declared inputs.
    pub fn build(&self, options: CompileOptions) -> Result<VectorField> {
        let axes: HashMap<String, Expr> = self
            .inputs
            .iter()
            .map(|name| (name.clone(), Expr::variable(name.as_str())))
            .collect();
        let outputs = self
            .outputs
            .iter()
            .map(|d| Ok((d.axis.clone(), d.value.lower(&axes)?)))
            .collect::<Result<Vec<_>>>()?;
        VectorField::from_expressions(self.inputs.iter().cloned(), outputs, options)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expression::Number(n) => write!(f, "{}", n),
            Expression::Identifier(name) => write!(f, "{}", name),
            Expression::BinaryOp { left, op, right } => write!(f, "({} {} {})", left, op, right),
            Expression::UnaryOp { op, expr } => write!(f, "({}{})", op, expr),
            Expression::Power { base, exponent } => write!(f, "({} ^ {})", base, exponent),
            Expression::Call { name, args } => {
                let args_str = args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ");
                write!(f, "{}({})", name, args_str)
            }
        }
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BinaryOperator::Add => write!(f, "+"),
            BinaryOperator::Sub => write!(f, "-"),
            BinaryOperator::Mul => write!(f, "*"),
            BinaryOperator::Div => write!(f, "/"),
        }
    }
}

impl fmt::Display for UnaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UnaryOperator::Neg => write!(f, "-"),
        }
    }
}

impl fmt::Display for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "field {}({}) {{", self.name, self.inputs.join(", "))?;
        for d in &self.outputs {
            writeln!(f, "    {} = {};", d.axis, d.value)?;
        }
        write!(f, "}}")
    }
}
