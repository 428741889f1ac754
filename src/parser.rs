use crate::ast::*;
use crate::error::{Result, SymfieldError};
use crate::lexer::Lexer;
use crate::token::{Token, TokenType};

/// Lexes and parses a complete source file.
pub fn parse_source(source: &str) -> Result<FieldFile> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse()
}

/// Parser for the field-definition language
/// Converts a stream of tokens into a [`FieldFile`]
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    /// Input axes of the field being parsed
    scope: Vec<String>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            current: 0,
            scope: Vec::new(),
        }
    }

    /// Parse every field in the token stream
    pub fn parse(&mut self) -> Result<FieldFile> {
        let mut file = FieldFile::new();

        self.skip_newlines();
        while !self.is_at_end() {
            let field = self.parse_field()?;
            if file.field(&field.name).is_some() {
                return Err(self.error_at_previous(format!("Field '{}' is defined twice", field.name)));
            }
            file.fields.push(field);
            self.skip_newlines();
        }

        Ok(file)
    }

    /// field name(x, y) { u = ...; v = ... }
    fn parse_field(&mut self) -> Result<FieldDef> {
        self.consume(TokenType::Field, "Expected 'field'")?;
        let name = self.parse_identifier("Expected field name")?;
        self.consume(TokenType::LParen, "Expected '(' after field name")?;

        let mut inputs: Vec<String> = Vec::new();
        if !self.check(&TokenType::RParen) {
            loop {
                let axis = self.parse_identifier("Expected input axis name")?;
                if inputs.contains(&axis) {
                    return Err(self.error_at_previous(format!("Input axis '{}' is declared twice", axis)));
                }
                inputs.push(axis);
                if !self.check(&TokenType::Comma) {
                    break;
                }
                self.advance();
            }
        }
        self.consume(TokenType::RParen, "Expected ')' after input axes")?;
        self.skip_newlines();
        self.consume(TokenType::LBrace, "Expected '{' to open field body")?;

        self.scope = inputs.clone();
        let mut outputs: Vec<Definition> = Vec::new();
        loop {
            self.skip_separators();
            if self.check(&TokenType::RBrace) {
                break;
            }
            let definition = self.parse_definition()?;
            if outputs.iter().any(|d| d.axis == definition.axis) {
                return Err(SymfieldError::parse_error(
                    format!("Output axis '{}' is defined twice", definition.axis),
                    definition.line,
                    1,
                ));
            }
            outputs.push(definition);
        }
        self.consume(TokenType::RBrace, "Expected '}' to close field body")?;
        self.scope.clear();

        Ok(FieldDef { name, inputs, outputs })
    }

    /// axis = expression, ended by ';', a newline or the closing brace
    fn parse_definition(&mut self) -> Result<Definition> {
        let line = self.peek().line;
        let axis = self.parse_identifier("Expected output axis name")?;
        self.consume(TokenType::Assign, "Expected '=' after output axis name")?;
        let value = self.parse_expression()?;

        match self.peek().token_type {
            TokenType::Semicolon | TokenType::Newline | TokenType::RBrace => {}
            ref other => {
                return Err(self.error_here(format!("Expected ';' or end of line, found {}", other)));
            }
        }

        Ok(Definition { axis, value, line })
    }

    fn parse_expression(&mut self) -> Result<Expression> {
        self.parse_term()
    }

    fn parse_term(&mut self) -> Result<Expression> {
        let mut expr = self.parse_factor()?;

        while let Some(op) = self.match_term() {
            let right = self.parse_factor()?;
            expr = Expression::BinaryOp {
                left: Box::new(expr),
                op,
                right: Box::new(right),
            };
        }

        Ok(expr)
    }

    fn parse_factor(&mut self) -> Result<Expression> {
        let mut expr = self.parse_unary()?;

        while let Some(op) = self.match_factor() {
            let right = self.parse_unary()?;
            expr = Expression::BinaryOp {
                left: Box::new(expr),
                op,
                right: Box::new(right),
            };
        }

        Ok(expr)
    }

    /// Unary minus binds looser than `^`, so `-x^2` is `-(x^2)`.
    fn parse_unary(&mut self) -> Result<Expression> {
        match self.peek().token_type {
            TokenType::Minus => {
                self.advance();
                let expr = self.parse_unary()?;
                Ok(Expression::UnaryOp {
                    op: UnaryOperator::Neg,
                    expr: Box::new(expr),
                })
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expression> {
        let mut expr = self.parse_postfix()?;

        while self.check(&TokenType::Power) {
            self.advance();
            let exponent = self.parse_exponent()?;
            expr = Expression::Power {
                base: Box::new(expr),
                exponent,
            };
        }

        Ok(expr)
    }

    /// Exponents are integer literals, optionally negated.
    fn parse_exponent(&mut self) -> Result<i32> {
        let negative = self.check(&TokenType::Minus);
        if negative {
            self.advance();
        }
        let token = self.peek();
        match token.token_type {
            TokenType::Number(n) if n.fract() == 0.0 && n <= i32::MAX as f64 => {
                self.advance();
                let n = n as i32;
                Ok(if negative { -n } else { n })
            }
            TokenType::Number(n) => Err(SymfieldError::parse_error(
                format!("Exponent must be an integer, found {}", n),
                token.line,
                token.column,
            )),
            _ => Err(SymfieldError::parse_error(
                "Exponent must be an integer literal",
                token.line,
                token.column,
            )),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expression> {
        let start = self.peek();
        let expr = self.parse_primary()?;

        let name = match (&start.token_type, expr) {
            (TokenType::Identifier(_), Expression::Identifier(name)) if self.check(&TokenType::LParen) => name,
            (_, expr) => return Ok(expr),
        };
        self.advance();

        let mut args = Vec::new();
        if !self.check(&TokenType::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.check(&TokenType::Comma) {
                    break;
                }
                self.advance();
            }
        }
        self.consume(TokenType::RParen, "Expected ')' after arguments")?;

        match (name.as_str(), args.len()) {
            ("sigmoid", 1) => Ok(Expression::Call { name, args }),
            ("sigmoid", n) => Err(SymfieldError::parse_error(
                format!("sigmoid takes 1 argument, got {}", n),
                start.line,
                start.column,
            )),
            _ => Err(SymfieldError::parse_error(
                format!("Unknown function '{}'", name),
                start.line,
                start.column,
            )),
        }
    }

    fn parse_primary(&mut self) -> Result<Expression> {
        let token = self.peek();
        match token.token_type {
            TokenType::Number(n) => {
                self.advance();
                Ok(Expression::Number(n))
            }
            TokenType::Identifier(name) => {
                self.advance();
                // a name directly followed by '(' is a function, checked by the caller
                if !self.check(&TokenType::LParen) && !self.scope.contains(&name) {
                    return Err(SymfieldError::parse_error(
                        format!("'{}' is not an input axis of this field", name),
                        token.line,
                        token.column,
                    ));
                }
                Ok(Expression::Identifier(name))
            }
            TokenType::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.consume(TokenType::RParen, "Expected ')'")?;
                Ok(expr)
            }
            other => Err(SymfieldError::parse_error(
                format!("Unexpected token: {}", other),
                token.line,
                token.column,
            )),
        }
    }

    // Helper methods

    fn match_term(&mut self) -> Option<BinaryOperator> {
        let op = match self.peek().token_type {
            TokenType::Plus => BinaryOperator::Add,
            TokenType::Minus => BinaryOperator::Sub,
            _ => return None,
        };
        self.advance();
        // an operator at the end of a line continues the expression
        self.skip_newlines();
        Some(op)
    }

    fn match_factor(&mut self) -> Option<BinaryOperator> {
        let op = match self.peek().token_type {
            TokenType::Star => BinaryOperator::Mul,
            TokenType::Slash => BinaryOperator::Div,
            _ => return None,
        };
        self.advance();
        self.skip_newlines();
        Some(op)
    }

    fn parse_identifier(&mut self, message: &str) -> Result<String> {
        match self.peek().token_type {
            TokenType::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error_here(message)),
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenType::Newline) {
            self.advance();
        }
    }

    fn skip_separators(&mut self) {
        while self.check(&TokenType::Newline) || self.check(&TokenType::Semicolon) {
            self.advance();
        }
    }

    fn check(&self, token_type: &TokenType) -> bool {
        std::mem::discriminant(&self.peek().token_type) == std::mem::discriminant(token_type)
    }

    fn consume(&mut self, token_type: TokenType, message: &str) -> Result<()> {
        if self.check(&token_type) {
            self.advance();
            Ok(())
        } else {
            Err(self.error_here(format!("{}, found {}", message, self.peek().token_type)))
        }
    }

    fn error_here(&self, message: impl Into<String>) -> SymfieldError {
        let token = self.peek();
        SymfieldError::parse_error(message, token.line, token.column)
    }

    fn error_at_previous(&self, message: impl Into<String>) -> SymfieldError {
        let token = self
            .tokens
            .get(self.current.saturating_sub(1))
            .cloned()
            .unwrap_or_else(|| Token::new(TokenType::Eof, 0, 0));
        SymfieldError::parse_error(message, token.line, token.column)
    }

    fn peek(&self) -> Token {
        self.tokens
            .get(self.current)
            .cloned()
            .unwrap_or_else(|| Token::new(TokenType::Eof, 0, 0))
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.current += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek().token_type, TokenType::Eof)
    }
}
