//! Handwritten lexer for the s-expression surface syntax

use crate::ast::Span;
use std::iter::Peekable;
use std::str::Chars;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Bool(bool),

    /// Any identifier, keyword or operator name
    Symbol(String),

    // Delimiters; brackets are interchangeable with parentheses
    LParen,
    RParen,
    LBracket,
    RBracket,

    Eof,
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("unexpected character: {0}")]
    UnexpectedChar(char, Span),
    #[error("unterminated block comment")]
    UnterminatedComment(Span),
    #[error("invalid number: {0}")]
    InvalidNumber(String, Span),
    #[error("invalid literal: {0} (expected #t or #f)")]
    InvalidHash(String, Span),
}

impl LexError {
    /// Get the source span where this error occurred
    pub fn span(&self) -> Span {
        match self {
            LexError::UnexpectedChar(_, span)
            | LexError::UnterminatedComment(span)
            | LexError::InvalidNumber(_, span)
            | LexError::InvalidHash(_, span) => *span,
        }
    }
}

pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            pos: 0,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<SpannedToken>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let is_eof = tok.token == Token::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.chars.clone();
        chars.next();
        chars.next()
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.advance() {
            if c == '\n' {
                break;
            }
        }
    }

    /// `#| ... |#`, nesting
    fn skip_block_comment(&mut self, start: usize) -> Result<(), LexError> {
        let mut depth = 1;
        while depth > 0 {
            match self.advance() {
                Some('#') if self.peek() == Some('|') => {
                    self.advance();
                    depth += 1;
                }
                Some('|') if self.peek() == Some('#') => {
                    self.advance();
                    depth -= 1;
                }
                Some(_) => {}
                None => return Err(LexError::UnterminatedComment(Span::new(start, self.pos))),
            }
        }
        Ok(())
    }

    fn next_token(&mut self) -> Result<SpannedToken, LexError> {
        loop {
            self.skip_whitespace();
            let start = self.pos;

            match self.peek() {
                Some(';') => self.skip_line_comment(),
                Some('#') if self.peek_second() == Some('|') => {
                    self.advance();
                    self.advance();
                    self.skip_block_comment(start)?;
                }
                _ => break,
            }
        }

        let start = self.pos;

        let Some(c) = self.advance() else {
            return Ok(SpannedToken {
                token: Token::Eof,
                span: Span::new(start, start),
            });
        };

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,

            '#' => self.lex_hash(start)?,

            c if c.is_ascii_digit() => self.lex_number(c, start)?,
            '-' | '+' if self.peek().map_or(false, |d| d.is_ascii_digit()) => {
                self.lex_number(c, start)?
            }

            c if is_symbol_char(c) => self.lex_symbol(c),

            _ => return Err(LexError::UnexpectedChar(c, Span::new(start, self.pos))),
        };

        Ok(SpannedToken {
            token,
            span: Span::new(start, self.pos),
        })
    }

    fn take_word(&mut self, first: char) -> String {
        let mut s = String::new();
        s.push(first);
        while let Some(c) = self.peek() {
            if is_symbol_char(c) {
                s.push(c);
                self.advance();
            } else {
                break;
            }
        }
        s
    }

    fn lex_hash(&mut self, start: usize) -> Result<Token, LexError> {
        let word = match self.peek() {
            Some(c) if is_symbol_char(c) => {
                self.advance();
                self.take_word(c)
            }
            _ => String::new(),
        };
        match word.as_str() {
            "t" | "true" => Ok(Token::Bool(true)),
            "f" | "false" => Ok(Token::Bool(false)),
            _ => Err(LexError::InvalidHash(
                format!("#{}", word),
                Span::new(start, self.pos),
            )),
        }
    }

    fn lex_number(&mut self, first: char, start: usize) -> Result<Token, LexError> {
        // A trailing symbol character makes the whole word invalid: `12abc`
        let s = self.take_word(first);
        let n: i64 = s
            .parse()
            .map_err(|_| LexError::InvalidNumber(s.clone(), Span::new(start, self.pos)))?;
        Ok(Token::Int(n))
    }

    fn lex_symbol(&mut self, first: char) -> Token {
        Token::Symbol(self.take_word(first))
    }
}

/// Characters that may appear in a symbol. `#` is excluded so generated
/// names can never be written in source.
fn is_symbol_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '[' | ']' | ';' | '"' | '\'' | '`' | ',' | '#' | '|')
}
