use std::fmt;

/// Token types of the field-definition language
#[derive(Debug, Clone, PartialEq)]
pub enum TokenType {
    // Keywords
    Field, // field

    // Identifiers and Literals
    Identifier(String),
    Number(f64),

    // Operators
    Plus,   // +
    Minus,  // -
    Star,   // *
    Slash,  // /
    Power,  // ^ or **
    Assign, // =

    // Delimiters
    LParen,    // (
    RParen,    // )
    LBrace,    // {
    RBrace,    // }
    Comma,     // ,
    Semicolon, // ;

    // Special
    Newline,
    Eof,
}

/// A token with its type and position information
#[derive(Debug, Clone)]
pub struct Token {
    pub token_type: TokenType,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn new(token_type: TokenType, line: usize, column: usize) -> Self {
        Self {
            token_type,
            line,
            column,
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenType::Field => write!(f, "field"),
            TokenType::Identifier(name) => write!(f, "identifier({})", name),
            TokenType::Number(n) => write!(f, "number({})", n),
            TokenType::Plus => write!(f, "'+'"),
            TokenType::Minus => write!(f, "'-'"),
            TokenType::Star => write!(f, "'*'"),
            TokenType::Slash => write!(f, "'/'"),
            TokenType::Power => write!(f, "'^'"),
            TokenType::Assign => write!(f, "'='"),
            TokenType::LParen => write!(f, "'('"),
            TokenType::RParen => write!(f, "')'"),
            TokenType::LBrace => write!(f, "'{{'"),
            TokenType::RBrace => write!(f, "'}}'"),
            TokenType::Comma => write!(f, "','"),
            TokenType::Semicolon => write!(f, "';'"),
            TokenType::Newline => write!(f, "end of line"),
            TokenType::Eof => write!(f, "end of input"),
        }
    }
}
