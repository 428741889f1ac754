use crate::error::{Result, SymfieldError};
use crate::token::{Token, TokenType};

/// Converts field-definition source into a stream of tokens.
///
/// Newlines are kept as tokens because they may end a statement.
pub struct Lexer {
    source: Vec<char>,
    current: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            current: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();
            if self.is_at_end() {
                break;
            }
            if let Some(token) = self.next_token()? {
                tokens.push(token);
            }
        }

        tokens.push(Token::new(TokenType::Eof, self.line, self.column));
        Ok(tokens)
    }

    /// Returns `None` after consuming a comment.
    fn next_token(&mut self) -> Result<Option<Token>> {
        let start_line = self.line;
        let start_column = self.column;

        let ch = self.advance();

        let token_type = match ch {
            '\n' => {
                self.line += 1;
                self.column = 1;
                TokenType::Newline
            }
            '+' => TokenType::Plus,
            '-' => TokenType::Minus,
            '*' => {
                if self.peek() == '*' {
                    self.advance();
                    TokenType::Power
                } else {
                    TokenType::Star
                }
            }
            '/' => {
                if self.peek() == '/' {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                    return Ok(None);
                }
                TokenType::Slash
            }
            '^' => TokenType::Power,
            '=' => TokenType::Assign,
            '(' => TokenType::LParen,
            ')' => TokenType::RParen,
            '{' => TokenType::LBrace,
            '}' => TokenType::RBrace,
            ',' => TokenType::Comma,
            ';' => TokenType::Semicolon,
            _ if ch.is_alphabetic() || ch == '_' => {
                let identifier = self.read_identifier(ch);
                match identifier.as_str() {
                    "field" => TokenType::Field,
                    _ => TokenType::Identifier(identifier),
                }
            }
            _ if ch.is_ascii_digit() || (ch == '.' && self.peek().is_ascii_digit()) => {
                TokenType::Number(self.read_number(ch, start_line, start_column)?)
            }
            _ => return Err(SymfieldError::unexpected_char(ch, start_line, start_column)),
        };

        Ok(Some(Token::new(token_type, start_line, start_column)))
    }

    fn read_identifier(&mut self, first: char) -> String {
        let mut identifier = String::from(first);

        while !self.is_at_end() {
            let ch = self.peek();
            if ch.is_alphanumeric() || ch == '_' {
                identifier.push(self.advance());
            } else {
                break;
            }
        }

        identifier
    }

    fn read_number(&mut self, first: char, line: usize, column: usize) -> Result<f64> {
        let mut number = String::from(first);

        while self.peek().is_ascii_digit() {
            number.push(self.advance());
        }

        if first != '.' && self.peek() == '.' && self.peek_next().is_ascii_digit() {
            number.push(self.advance());
            while self.peek().is_ascii_digit() {
                number.push(self.advance());
            }
        }

        // scientific notation: 1e-3, 2.5E+4
        if matches!(self.peek(), 'e' | 'E') {
            number.push(self.advance());
            if matches!(self.peek(), '+' | '-') {
                number.push(self.advance());
            }
            if !self.peek().is_ascii_digit() {
                return Err(SymfieldError::LexError {
                    message: format!("exponent of '{}' has no digits", number),
                    line,
                    column,
                });
            }
            while self.peek().is_ascii_digit() {
                number.push(self.advance());
            }
        }

        number
            .parse::<f64>()
            .map_err(|_| SymfieldError::InvalidNumber { line, column })
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), ' ' | '\t' | '\r') {
            self.advance();
        }
    }

    fn advance(&mut self) -> char {
        let ch = self.source[self.current];
        self.current += 1;
        if ch != '\n' {
            self.column += 1;
        }
        ch
    }

    fn peek(&self) -> char {
        self.source.get(self.current).copied().unwrap_or('\0')
    }

    fn peek_next(&self) -> char {
        self.source.get(self.current + 1).copied().unwrap_or('\0')
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }
}
