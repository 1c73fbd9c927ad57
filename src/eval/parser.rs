//! Recursive-descent parser for callback expressions
//!
//! ```text
//! program    := ["lambda" [ident ("," ident)*] ":"] statement (";" statement)* [";"]
//! statement  := or
//! or         := and ("or" and)*
//! and        := not ("and" not)*
//! not        := "not" not | comparison
//! comparison := additive (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "not in") additive)*
//! additive   := term (("+" | "-") term)*
//! term       := unary (("*" | "/" | "%") unary)*
//! unary      := "-" unary | postfix
//! postfix    := primary ("(" args ")" | "[" or "]" | "." ident)*
//! primary    := literal | ident | "(" or ")" | "[" items "]" | "{" pairs "}"
//! ```

use serde_json::Value;

use super::lexer::{Token, TokenKind};
use super::EvalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident { name: String, column: usize },
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Field { target: Box<Expr>, name: String, column: usize },
    Index { target: Box<Expr>, index: Box<Expr>, column: usize },
    Call { callee: Box<Expr>, args: Vec<Expr>, column: usize },
    Neg { operand: Box<Expr>, column: usize },
    Not(Box<Expr>),
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr>, column: usize },
    Logical { op: LogicalOp, left: Box<Expr>, right: Box<Expr> },
}

impl Expr {
    /// Source column of the node, when it records one
    pub fn column(&self) -> Option<usize> {
        match self {
            Expr::Ident { column, .. }
            | Expr::Field { column, .. }
            | Expr::Index { column, .. }
            | Expr::Call { column, .. }
            | Expr::Neg { column, .. }
            | Expr::Binary { column, .. } => Some(*column),
            _ => None,
        }
    }
}

/// A parsed expression source
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Parameter names of a leading `lambda`; each is bound to the context table
    pub params: Vec<String>,
    pub statements: Vec<Expr>,
}

/// Bound on nested sub-expressions plus chained operators along one parse path
pub const MAX_NESTING: usize = 128;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0, depth: 0 }
    }

    pub fn parse_program(mut self) -> Result<Program, EvalError> {
        let mut params = Vec::new();
        if self.check(&TokenKind::Lambda) {
            self.advance();
            while !self.check(&TokenKind::Colon) {
                params.push(self.expect_ident()?);
                if !self.check(&TokenKind::Colon) {
                    self.expect(TokenKind::Comma, "',' or ':' in lambda parameters")?;
                }
            }
            self.advance();
        }

        let mut statements = Vec::new();
        while !self.is_at_end() {
            if self.check(&TokenKind::Semicolon) {
                self.advance();
                continue;
            }
            statements.push(self.parse_or()?);
            if !self.is_at_end() {
                self.expect(TokenKind::Semicolon, "';' between statements")?;
            }
        }

        if statements.is_empty() {
            return Err(EvalError::syntax("empty expression", self.current().column));
        }
        Ok(Program { params, statements })
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        self.descend()?;
        let mut links = 1;
        let mut left = self.parse_and()?;
        while self.check(&TokenKind::Or) {
            self.descend()?;
            links += 1;
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.ascend(links);
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut links = 0;
        let mut left = self.parse_not()?;
        while self.check(&TokenKind::And) {
            self.descend()?;
            links += 1;
            self.advance();
            let right = self.parse_not()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.ascend(links);
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if self.check(&TokenKind::Not) {
            self.descend()?;
            self.advance();
            let operand = self.parse_not()?;
            self.ascend(1);
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let mut links = 0;
        let mut left = self.parse_additive()?;
        loop {
            let column = self.current().column;
            let op = match self.current().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::Ne => BinaryOp::Ne,
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                TokenKind::In => BinaryOp::In,
                TokenKind::Not if self.peek_kind() == Some(&TokenKind::In) => {
                    self.advance();
                    BinaryOp::NotIn
                }
                _ => {
                    self.ascend(links);
                    return Ok(left);
                }
            };
            self.descend()?;
            links += 1;
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                column,
            };
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut links = 0;
        let mut left = self.parse_term()?;
        loop {
            let column = self.current().column;
            let op = match self.current().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => {
                    self.ascend(links);
                    return Ok(left);
                }
            };
            self.descend()?;
            links += 1;
            self.advance();
            let right = self.parse_term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                column,
            };
        }
    }

    fn parse_term(&mut self) -> Result<Expr, EvalError> {
        let mut links = 0;
        let mut left = self.parse_unary()?;
        loop {
            let column = self.current().column;
            let op = match self.current().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => {
                    self.ascend(links);
                    return Ok(left);
                }
            };
            self.descend()?;
            links += 1;
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                column,
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.check(&TokenKind::Minus) {
            let column = self.current().column;
            self.descend()?;
            self.advance();
            let operand = self.parse_unary()?;
            self.ascend(1);
            return Ok(Expr::Neg {
                operand: Box::new(operand),
                column,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvalError> {
        let mut links = 0;
        let mut expr = self.parse_primary()?;
        loop {
            let column = self.current().column;
            if matches!(
                self.current().kind,
                TokenKind::LParen | TokenKind::LBracket | TokenKind::Dot
            ) {
                self.descend()?;
                links += 1;
            }
            match self.current().kind {
                TokenKind::LParen => {
                    self.advance();
                    let args = self.parse_sequence(TokenKind::RParen)?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        column,
                    };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_or()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                        column,
                    };
                }
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_ident()?;
                    expr = Expr::Field {
                        target: Box::new(expr),
                        name,
                        column,
                    };
                }
                _ => {
                    self.ascend(links);
                    return Ok(expr);
                }
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        let token = self.current().clone();
        let expr = match token.kind {
            TokenKind::Int(n) => Expr::Literal(Value::from(n)),
            TokenKind::Float(f) => Expr::Literal(Value::from(f)),
            TokenKind::Str(s) => Expr::Literal(Value::String(s)),
            TokenKind::True => Expr::Literal(Value::Bool(true)),
            TokenKind::False => Expr::Literal(Value::Bool(false)),
            TokenKind::Null => Expr::Literal(Value::Null),
            TokenKind::Ident(name) => Expr::Ident {
                name,
                column: token.column,
            },
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen, "')'")?;
                return Ok(inner);
            }
            TokenKind::LBracket => {
                self.advance();
                return Ok(Expr::List(self.parse_sequence(TokenKind::RBracket)?));
            }
            TokenKind::LBrace => {
                self.advance();
                return self.parse_object();
            }
            TokenKind::Eof => return Err(EvalError::syntax("unexpected end of expression", token.column)),
            other => return Err(EvalError::syntax(format!("unexpected token {:?}", other), token.column)),
        };
        self.advance();
        Ok(expr)
    }

    /// Comma-separated expressions up to `close`, trailing comma allowed
    fn parse_sequence(&mut self, close: TokenKind) -> Result<Vec<Expr>, EvalError> {
        let mut items = Vec::new();
        while !self.check(&close) {
            items.push(self.parse_or()?);
            if !self.check(&close) {
                self.expect(TokenKind::Comma, "','")?;
            }
        }
        self.advance();
        Ok(items)
    }

    fn parse_object(&mut self) -> Result<Expr, EvalError> {
        let mut pairs = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let token = self.current().clone();
            let key = match token.kind {
                TokenKind::Str(s) | TokenKind::Ident(s) => s,
                _ => return Err(EvalError::syntax("object keys must be strings or names", token.column)),
            };
            self.advance();
            self.expect(TokenKind::Colon, "':' after object key")?;
            pairs.push((key, self.parse_or()?));
            if !self.check(&TokenKind::RBrace) {
                self.expect(TokenKind::Comma, "','")?;
            }
        }
        self.advance();
        Ok(Expr::Object(pairs))
    }

    // ---- nesting ----

    /// Errors are final, so a failed parse never needs to unwind the counter
    fn descend(&mut self) -> Result<(), EvalError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(EvalError::syntax("expression nested too deeply", self.current().column));
        }
        Ok(())
    }

    fn ascend(&mut self, levels: usize) {
        self.depth -= levels;
    }

    // ---- token helpers ----

    fn current(&self) -> &Token {
        // The token list always ends with Eof and `advance` never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos + 1).map(|t| &t.kind)
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.pos += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current().kind) == std::mem::discriminant(kind)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), EvalError> {
        if self.check(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(EvalError::syntax(format!("expected {}", what), self.current().column))
        }
    }

    fn expect_ident(&mut self) -> Result<String, EvalError> {
        match &self.current().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(EvalError::syntax("expected a name", self.current().column)),
        }
    }
}
