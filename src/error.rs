use std::collections::BTreeSet;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SymfieldError {
    #[error("Unbound variable '{name}': every free variable of a program must be bound")]
    UnboundVariable { name: String },

    #[error("Divergence undefined: output axes {outputs:?} don't match input axes {inputs:?}")]
    Domain {
        inputs: BTreeSet<String>,
        outputs: BTreeSet<String>,
    },

    #[error("Malformed expression: {message}")]
    MalformedExpression { message: String },

    #[error("Lexical error at line {line}, column {column}: {message}")]
    LexError {
        message: String,
        line: usize,
        column: usize,
    },

    #[error("Parse error at line {line}, column {column}: {message}")]
    ParseError {
        message: String,
        line: usize,
        column: usize,
    },

    #[error("Unexpected character '{ch}' at line {line}, column {column}")]
    UnexpectedCharacter {
        ch: char,
        line: usize,
        column: usize,
    },

    #[error("Invalid number format at line {line}, column {column}")]
    InvalidNumber { line: usize, column: usize },
}

pub type Result<T> = std::result::Result<T, SymfieldError>;

impl SymfieldError {
    pub fn unbound(name: impl Into<String>) -> Self {
        SymfieldError::UnboundVariable { name: name.into() }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        SymfieldError::MalformedExpression {
            message: message.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>, line: usize, column: usize) -> Self {
        SymfieldError::ParseError {
            message: message.into(),
            line,
            column,
        }
    }

    pub fn unexpected_char(ch: char, line: usize, column: usize) -> Self {
        SymfieldError::UnexpectedCharacter { ch, line, column }
    }
}
