//! Recursive descent reader for the surface language
//!
//! Parsing happens in two steps: tokens are read into [`Datum`] trees
//! (plain s-expressions with spans), which are then checked and turned into
//! [`Expr`] nodes. Only the fixed set of node kinds is accepted; any other
//! special form is rejected as malformed.
//!
//! ```text
//! program    ::= (definition | expr)*        ; at most one expr
//! definition ::= (define (name param*) expr)
//!              | (define name (lambda (param*) expr))
//! expr       ::= int | #t | #f | name
//!              | (lambda (param*) expr)
//!              | (if expr expr expr)
//!              | (op expr*)                    ; + - * / % = < > <= >= not zero? add1 sub1
//!              | (expr expr*)
//! ```

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::ast::{Expr, Literal, Name, PrimOp, Program, Span, RESERVED_NAMES};
use crate::codegen::{CompileError, Stage};
use crate::lexer::{Lexer, SpannedToken, Token};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unexpected token: expected {expected}, found {found:?}")]
    UnexpectedToken {
        expected: String,
        found: Token,
        span: Span,
    },

    #[error("unexpected end of file: expected {expected}")]
    UnexpectedEof { expected: String, last_span: Span },

    #[error("mismatched delimiter: `{open}` closed by `{close}`")]
    MismatchedDelimiter { open: char, close: char, span: Span },
}

impl ParseError {
    /// Get the span associated with this error
    pub fn span(&self) -> Span {
        match self {
            ParseError::UnexpectedToken { span, .. } => *span,
            ParseError::UnexpectedEof { last_span, .. } => *last_span,
            ParseError::MismatchedDelimiter { span, .. } => *span,
        }
    }
}

/// Special forms the language deliberately does not have
const UNSUPPORTED_FORMS: &[&str] = &[
    "let",
    "let*",
    "letrec",
    "letrec*",
    "set!",
    "quote",
    "quasiquote",
    "begin",
    "cond",
    "case",
    "and",
    "or",
    "when",
    "unless",
    "do",
    "while",
    "call/cc",
    "call-with-current-continuation",
    "let/cc",
    "define-syntax",
    "let-syntax",
    "continuation",
    "continue",
    "let-flag",
];

const KEYWORDS: &[&str] = &["lambda", "λ", "if", "define"];

// ============================================================================
// Data
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum DatumKind {
    Int(i64),
    Bool(bool),
    Symbol(String),
    List(Vec<Datum>),
}

/// One s-expression as written
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    pub kind: DatumKind,
    pub span: Span,
}

impl Datum {
    fn symbol(&self) -> Option<&str> {
        match &self.kind {
            DatumKind::Symbol(s) => Some(s),
            _ => None,
        }
    }

    fn list(&self) -> Option<&[Datum]> {
        match &self.kind {
            DatumKind::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatumKind::Int(n) => write!(f, "{}", n),
            DatumKind::Bool(b) => write!(f, "{}", Literal::Bool(*b)),
            DatumKind::Symbol(s) => write!(f, "{}", s),
            DatumKind::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

pub struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<SpannedToken>) -> Self {
        Self { tokens, pos: 0 }
    }

    /// Read every datum up to end of input
    pub fn parse_data(&mut self) -> Result<Vec<Datum>, ParseError> {
        let mut data = Vec::new();
        while !self.is_at_end() {
            data.push(self.parse_datum()?);
        }
        Ok(data)
    }

    fn parse_datum(&mut self) -> Result<Datum, ParseError> {
        let SpannedToken { token, span } = self.advance().clone();
        let kind = match token {
            Token::Int(n) => DatumKind::Int(n),
            Token::Bool(b) => DatumKind::Bool(b),
            Token::Symbol(s) => DatumKind::Symbol(s),
            Token::LParen => return self.parse_list(span, '(', ')'),
            Token::LBracket => return self.parse_list(span, '[', ']'),
            Token::Eof => return Err(self.unexpected_eof("an expression")),
            found @ (Token::RParen | Token::RBracket) => {
                return Err(ParseError::UnexpectedToken {
                    expected: "an expression".to_string(),
                    found,
                    span,
                })
            }
        };
        Ok(Datum { kind, span })
    }

    fn parse_list(&mut self, start: Span, open: char, close: char) -> Result<Datum, ParseError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Token::Eof => return Err(self.unexpected_eof(&format!("`{}`", close))),
                Token::RParen | Token::RBracket => {
                    let end = self.advance().clone();
                    let found = if end.token == Token::RParen { ')' } else { ']' };
                    if found != close {
                        return Err(ParseError::MismatchedDelimiter {
                            open,
                            close: found,
                            span: start.merge(&end.span),
                        });
                    }
                    return Ok(Datum {
                        kind: DatumKind::List(items),
                        span: start.merge(&end.span),
                    });
                }
                _ => items.push(self.parse_datum()?),
            }
        }
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn current_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.span)
            .unwrap_or_default()
    }

    fn advance(&mut self) -> &SpannedToken {
        if !self.is_at_end() {
            self.pos += 1;
            &self.tokens[self.pos - 1]
        } else {
            &self.tokens[self.tokens.len() - 1]
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn unexpected_eof(&self, expected: &str) -> ParseError {
        ParseError::UnexpectedEof {
            expected: expected.to_string(),
            last_span: self.current_span(),
        }
    }
}

// ============================================================================
// Data -> expressions
// ============================================================================

fn malformed(reason: impl Into<String>, datum: &Datum) -> CompileError {
    CompileError::MalformedExpression {
        stage: Stage::Syntax,
        reason: reason.into(),
        form: datum.to_string(),
        span: Some(datum.span),
    }
}

fn is_definition(datum: &Datum) -> bool {
    datum
        .list()
        .and_then(|items| items.first())
        .and_then(Datum::symbol)
        == Some("define")
}

/// Turn top-level data into a program
pub fn program_from_data(data: &[Datum]) -> Result<Program, CompileError> {
    let mut definitions = Vec::new();
    let mut names = BTreeSet::new();
    let mut main: Option<Expr> = None;

    for datum in data {
        if is_definition(datum) {
            let def = definition_from_datum(datum)?;
            if let Expr::Define { name, .. } = &def {
                if !names.insert(name.clone()) {
                    return Err(malformed(format!("duplicate definition of `{}`", name), datum));
                }
            }
            definitions.push(def);
        } else {
            if main.is_some() {
                return Err(malformed("more than one top-level expression", datum));
            }
            main = Some(expr_from_datum(datum)?);
        }
    }

    Ok(Program::new(definitions, main))
}

fn definition_from_datum(datum: &Datum) -> Result<Expr, CompileError> {
    let items = datum.list().unwrap_or_default();
    let [_, target, value] = items else {
        return Err(malformed("expected (define (name param ...) body)", datum));
    };

    match &target.kind {
        // (define (f x y) body)
        DatumKind::List(signature) => {
            let Some((name, params)) = signature.split_first() else {
                return Err(malformed("definition needs a name", target));
            };
            let name = binder(name)?;
            let params = parameters(params, target)?;
            Ok(Expr::define(name, params, expr_from_datum(value)?))
        }
        // (define f (lambda (x y) body))
        DatumKind::Symbol(_) => {
            let name = binder(target)?;
            match expr_from_datum(value)? {
                Expr::Lam { params, body } => Ok(Expr::Define { name, params, body }),
                _ => Err(malformed("only functions can be defined", datum)),
            }
        }
        _ => Err(malformed("expected (define (name param ...) body)", datum)),
    }
}

/// A name being bound: a plain symbol that is not reserved
fn binder(datum: &Datum) -> Result<Name, CompileError> {
    let Some(name) = datum.symbol() else {
        return Err(malformed("expected a name", datum));
    };
    if RESERVED_NAMES.contains(&name) {
        return Err(malformed(format!("`{}` is reserved by the runtime", name), datum));
    }
    if KEYWORDS.contains(&name) || UNSUPPORTED_FORMS.contains(&name) {
        return Err(malformed(format!("`{}` is a keyword", name), datum));
    }
    if PrimOp::from_symbol(name).is_some() {
        return Err(malformed(format!("`{}` is a primitive operator", name), datum));
    }
    Ok(name.to_string())
}

fn parameters(params: &[Datum], whole: &Datum) -> Result<Vec<Name>, CompileError> {
    let mut seen = BTreeSet::new();
    let mut names = Vec::with_capacity(params.len());
    for param in params {
        let name = binder(param)?;
        if !seen.insert(name.clone()) {
            return Err(malformed(format!("duplicate parameter `{}`", name), whole));
        }
        names.push(name);
    }
    Ok(names)
}

pub fn expr_from_datum(datum: &Datum) -> Result<Expr, CompileError> {
    match &datum.kind {
        DatumKind::Int(n) => Ok(Expr::int(*n)),
        DatumKind::Bool(b) => Ok(Expr::bool(*b)),
        DatumKind::Symbol(name) => {
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(malformed(format!("`{}` is reserved by the runtime", name), datum));
            }
            if KEYWORDS.contains(&name.as_str()) || UNSUPPORTED_FORMS.contains(&name.as_str()) {
                return Err(malformed(format!("keyword `{}` used as a value", name), datum));
            }
            if PrimOp::from_symbol(name).is_some() {
                return Err(malformed(
                    format!("primitive operator `{}` can only be applied", name),
                    datum,
                ));
            }
            Ok(Expr::var(name.clone()))
        }
        DatumKind::List(items) => list_from_data(items, datum),
    }
}

fn list_from_data(items: &[Datum], datum: &Datum) -> Result<Expr, CompileError> {
    let Some((head, rest)) = items.split_first() else {
        return Err(malformed("empty application", datum));
    };

    match head.symbol() {
        Some("lambda" | "λ") => {
            let [params, body] = rest else {
                return Err(malformed("expected (lambda (param ...) body)", datum));
            };
            let Some(param_list) = params.list() else {
                return Err(malformed("expected a parameter list", params));
            };
            Ok(Expr::lam(parameters(param_list, params)?, expr_from_datum(body)?))
        }
        Some("if") => {
            let [test, then_branch, else_branch] = rest else {
                return Err(malformed("expected (if test then else)", datum));
            };
            Ok(Expr::conditional(
                expr_from_datum(test)?,
                expr_from_datum(then_branch)?,
                expr_from_datum(else_branch)?,
            ))
        }
        Some("define") => Err(malformed("definition below top level", datum)),
        Some(form) if UNSUPPORTED_FORMS.contains(&form) => {
            Err(malformed(format!("unsupported form `{}`", form), datum))
        }
        Some(symbol) => match PrimOp::from_symbol(symbol) {
            Some(op) => {
                if rest.len() != op.arity() {
                    return Err(malformed(
                        format!("`{}` takes {} operand(s), got {}", op, op.arity(), rest.len()),
                        datum,
                    ));
                }
                let args = rest.iter().map(expr_from_datum).collect::<Result<Vec<_>, _>>()?;
                Ok(Expr::op(op, args))
            }
            None => application(head, rest),
        },
        None => application(head, rest),
    }
}

fn application(head: &Datum, rest: &[Datum]) -> Result<Expr, CompileError> {
    let func = expr_from_datum(head)?;
    let args = rest.iter().map(expr_from_datum).collect::<Result<Vec<_>, _>>()?;
    Ok(Expr::app(func, args))
}

/// Read source text into a surface program
pub fn parse_program(source: &str) -> Result<Program, CompileError> {
    let tokens = Lexer::new(source).tokenize()?;
    let data = Parser::new(tokens).parse_data()?;
    program_from_data(&data)
}

/// Read a single expression
pub fn parse_expr(source: &str) -> Result<Expr, CompileError> {
    let tokens = Lexer::new(source).tokenize()?;
    let data = Parser::new(tokens).parse_data()?;
    match data.as_slice() {
        [datum] => expr_from_datum(datum),
        [] => Err(ParseError::UnexpectedEof {
            expected: "an expression".to_string(),
            last_span: Span::new(source.len(), source.len()),
        }
        .into()),
        [_, extra, ..] => Err(malformed("more than one expression", extra)),
    }
}
