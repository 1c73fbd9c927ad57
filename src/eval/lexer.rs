//! Tokenizer for callback expressions

use std::iter::Peekable;
use std::str::Chars;

use super::EvalError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,

    // Keywords
    And,
    Or,
    Not,
    In,
    Lambda,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,

    Eof,
}

/// A token and the 1-based column it starts at
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub column: usize,
}

pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            column: 1,
        }
    }

    /// Tokenize the whole source; the last token is always `Eof`
    pub fn tokenize(mut self) -> Result<Vec<Token>, EvalError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                return Ok(tokens);
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.column += 1;
        Some(c)
    }

    /// Consume `next` if it follows, yielding `double`, else `single`
    fn pair(&mut self, next: char, double: TokenKind, single: TokenKind) -> TokenKind {
        if self.peek() == Some(next) {
            self.advance();
            double
        } else {
            single
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else if c == '#' {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, EvalError> {
        self.skip_whitespace_and_comments();
        let column = self.column;

        let Some(c) = self.advance() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                column,
            });
        };

        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '.' => TokenKind::Dot,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '<' => self.pair('=', TokenKind::Le, TokenKind::Lt),
            '>' => self.pair('=', TokenKind::Ge, TokenKind::Gt),
            '=' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::EqEq
                } else {
                    return Err(EvalError::syntax("'=' is not supported, use set(name, value)", column));
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::Ne
                } else {
                    TokenKind::Not
                }
            }
            '&' if self.peek() == Some('&') => {
                self.advance();
                TokenKind::And
            }
            '|' if self.peek() == Some('|') => {
                self.advance();
                TokenKind::Or
            }
            '"' | '\'' => self.scan_string(c, column)?,
            c if c.is_ascii_digit() => self.scan_number(c, column)?,
            c if c.is_alphabetic() || c == '_' => self.scan_identifier(c),
            other => {
                return Err(EvalError::syntax(format!("unexpected character '{}'", other), column));
            }
        };

        Ok(Token { kind, column })
    }

    fn scan_identifier(&mut self, first: char) -> TokenKind {
        let mut ident = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                ident.push(c);
                self.advance();
            } else {
                break;
            }
        }

        match ident.as_str() {
            "true" | "True" => TokenKind::True,
            "false" | "False" => TokenKind::False,
            "null" | "None" => TokenKind::Null,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "in" => TokenKind::In,
            "lambda" => TokenKind::Lambda,
            _ => TokenKind::Ident(ident),
        }
    }

    fn scan_number(&mut self, first: char, column: usize) -> Result<TokenKind, EvalError> {
        let mut text = String::from(first);
        let mut is_float = false;

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    text.push(c);
                }
                self.advance();
            } else if c == '.' && !is_float {
                // `1.foo` is not a float; only take the dot when a digit follows
                let mut lookahead = self.chars.clone();
                lookahead.next();
                if !lookahead.peek().map_or(false, |d| d.is_ascii_digit()) {
                    break;
                }
                is_float = true;
                text.push(c);
                self.advance();
            } else if c == 'e' || c == 'E' {
                is_float = true;
                text.push(c);
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.peek() {
                    text.push(sign);
                    self.advance();
                }
            } else {
                break;
            }
        }

        if !is_float {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(TokenKind::Int(n));
            }
        }
        text.parse::<f64>()
            .map(TokenKind::Float)
            .map_err(|_| EvalError::syntax(format!("invalid number '{}'", text), column))
    }

    fn scan_string(&mut self, quote: char, column: usize) -> Result<TokenKind, EvalError> {
        let mut value = String::new();
        loop {
            match self.advance() {
                None => return Err(EvalError::syntax("unterminated string", column)),
                Some(c) if c == quote => break,
                Some('\\') => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some('\'') => value.push('\''),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => return Err(EvalError::syntax("unterminated string", column)),
                },
                Some(c) => value.push(c),
            }
        }
        Ok(TokenKind::Str(value))
    }
}
