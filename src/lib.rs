// symfield: symbolic expressions compiled into layered multi-output programs,
// wrapped as vector fields with derived Jacobians and divergences.

pub mod error;
pub mod expr;
pub mod diff;
pub mod optimize;
pub mod graph;
pub mod vector;
pub mod field;
pub mod token;
pub mod lexer;
pub mod ast;
pub mod parser;

pub use error::{Result, SymfieldError};
pub use expr::{Expr, NodeKind};
pub use graph::{CompileOptions, Node, NodeId, Program};
pub use vector::{Vector, VectorFunction};
pub use field::{jacobian_axis, Axes, VectorField, DIVERGENCE_AXIS};
pub use lexer::Lexer;
pub use token::{Token, TokenType};
pub use ast::{BinaryOperator, Definition, Expression, FieldDef, FieldFile, UnaryOperator};
pub use parser::{parse_source, Parser};
