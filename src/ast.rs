//! Expression tree shared by the surface language and every compiler stage
//!
//! One closed enum covers all stages. Stage-specific forms are tagged so a
//! pass can tell what it is looking at:
//! - `If` carries an [`IfForm`] saying whether its test is statically trivial,
//!   may need evaluation, or has already been CPS-converted.
//! - `Cont` / `ContApp` only exist between CPS conversion and continuation
//!   abstraction.
//! - `LetFlag` / `LetRec` are only introduced by trampoline insertion.
//!
//! Every pass is written against [`Expr::walk`], which knows how to take a node
//! apart and put it back together.

use std::collections::BTreeMap;
use std::fmt;

pub type Name = String;

/// Runtime dispatcher every continuation invocation is routed through
pub const APPLY_K: &str = "apply-k";
/// Runtime driver that forces suspensions until a completion flag is set
pub const TRAMPOLINE: &str = "trampoline";
/// Runtime constructor for the final continuation of one activation
pub const FINAL_K: &str = "final-k";

/// Names the runtime owns. The reader refuses to bind them.
pub const RESERVED_NAMES: [&str; 3] = [APPLY_K, TRAMPOLINE, FINAL_K];

// ============================================================================
// Source locations
// ============================================================================

/// Byte range in the source text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(&self, other: &Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// 1-indexed line and column (columns count characters)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Maps byte offsets back to lines for diagnostics.
#[derive(Debug, Clone)]
pub struct SourceMap {
    source: String,
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            source: source.to_string(),
            line_starts,
        }
    }

    pub fn position(&self, offset: usize) -> Position {
        let offset = offset.min(self.source.len());
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        let line_start = self.line_starts[line_idx];
        Position {
            line: line_idx + 1,
            column: self.source[line_start..offset].chars().count() + 1,
        }
    }

    /// Text of a 1-indexed line without its newline
    pub fn line(&self, line: usize) -> Option<&str> {
        let start = *self.line_starts.get(line.checked_sub(1)?)?;
        let end = self
            .line_starts
            .get(line)
            .map(|next| next - 1)
            .unwrap_or(self.source.len());
        Some(self.source[start..end].trim_end_matches('\r'))
    }
}

// ============================================================================
// Literals and trivial operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Literal {
    Bool(bool),
    Int(i64),
}

/// The fixed set of trivial operators. Applying one never needs a
/// continuation: operands are values and the result is a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
    Not,
    IsZero,
    Add1,
    Sub1,
}

impl PrimOp {
    pub const ALL: [PrimOp; 14] = [
        PrimOp::Add,
        PrimOp::Sub,
        PrimOp::Mul,
        PrimOp::Div,
        PrimOp::Mod,
        PrimOp::Eq,
        PrimOp::Lt,
        PrimOp::Gt,
        PrimOp::Le,
        PrimOp::Ge,
        PrimOp::Not,
        PrimOp::IsZero,
        PrimOp::Add1,
        PrimOp::Sub1,
    ];

    /// Trivial-operator membership test
    pub fn from_symbol(symbol: &str) -> Option<PrimOp> {
        PrimOp::ALL.into_iter().find(|op| op.symbol() == symbol)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            PrimOp::Add => "+",
            PrimOp::Sub => "-",
            PrimOp::Mul => "*",
            PrimOp::Div => "/",
            PrimOp::Mod => "%",
            PrimOp::Eq => "=",
            PrimOp::Lt => "<",
            PrimOp::Gt => ">",
            PrimOp::Le => "<=",
            PrimOp::Ge => ">=",
            PrimOp::Not => "not",
            PrimOp::IsZero => "zero?",
            PrimOp::Add1 => "add1",
            PrimOp::Sub1 => "sub1",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            PrimOp::Not | PrimOp::IsZero | PrimOp::Add1 | PrimOp::Sub1 => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for PrimOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// Which stage a conditional belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfForm {
    /// Atomic test, trivial branches
    Trivial,
    /// Test or a branch requires evaluation
    Serious,
    /// Output of CPS conversion
    Converted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Literal),
    Var(Name),
    Op {
        op: PrimOp,
        args: Vec<Expr>,
    },
    If {
        form: IfForm,
        test: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    Lam {
        params: Vec<Name>,
        body: Box<Expr>,
    },
    /// Named top-level abstraction
    Define {
        name: Name,
        params: Vec<Name>,
        body: Box<Expr>,
    },
    /// Reified rest of the computation, binding exactly one value
    Cont {
        param: Name,
        body: Box<Expr>,
    },
    ContApp {
        cont: Box<Expr>,
        arg: Box<Expr>,
    },
    /// After CPS conversion the last argument is the continuation
    App {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Allocates an unset completion flag private to this activation
    LetFlag {
        flag: Name,
        body: Box<Expr>,
    },
    /// Local functions visible to each other and to `body`
    LetRec {
        bindings: Vec<(Name, Expr)>,
        body: Box<Expr>,
    },
}

impl Expr {
    pub fn int(n: i64) -> Expr {
        Expr::Lit(Literal::Int(n))
    }

    pub fn bool(b: bool) -> Expr {
        Expr::Lit(Literal::Bool(b))
    }

    pub fn var(name: impl Into<Name>) -> Expr {
        Expr::Var(name.into())
    }

    pub fn op(op: PrimOp, args: Vec<Expr>) -> Expr {
        Expr::Op { op, args }
    }

    pub fn lam(params: Vec<Name>, body: Expr) -> Expr {
        Expr::Lam {
            params,
            body: Box::new(body),
        }
    }

    pub fn app(func: Expr, args: Vec<Expr>) -> Expr {
        Expr::App {
            func: Box::new(func),
            args,
        }
    }

    pub fn define(name: impl Into<Name>, params: Vec<Name>, body: Expr) -> Expr {
        Expr::Define {
            name: name.into(),
            params,
            body: Box::new(body),
        }
    }

    /// Build a surface conditional, classifying it as trivial when the test
    /// is an atom and neither branch needs evaluation.
    pub fn conditional(test: Expr, then_branch: Expr, else_branch: Expr) -> Expr {
        let form = if test.is_atomic()
            && then_branch.is_value_form()
            && else_branch.is_value_form()
        {
            IfForm::Trivial
        } else {
            IfForm::Serious
        };
        Expr::If {
            form,
            test: Box::new(test),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        }
    }

    /// Literal or variable
    pub fn is_atomic(&self) -> bool {
        matches!(self, Expr::Lit(_) | Expr::Var(_))
    }

    // Mirrors `cps::is_trivial` for surface forms; kept here so the smart
    // constructor does not depend on the codegen layer.
    fn is_value_form(&self) -> bool {
        match self {
            Expr::Lit(_) | Expr::Var(_) | Expr::Lam { .. } => true,
            Expr::Op { args, .. } => args.iter().all(Expr::is_value_form),
            Expr::If { form, .. } => *form == IfForm::Trivial,
            _ => false,
        }
    }

    /// Short name of the node kind, for diagnostics and logging
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Lit(_) => "literal",
            Expr::Var(_) => "variable",
            Expr::Op { .. } => "operation",
            Expr::If { form: IfForm::Trivial, .. } => "trivial conditional",
            Expr::If { form: IfForm::Serious, .. } => "serious conditional",
            Expr::If { form: IfForm::Converted, .. } => "converted conditional",
            Expr::Lam { .. } => "abstraction",
            Expr::Define { .. } => "definition",
            Expr::Cont { .. } => "continuation",
            Expr::ContApp { .. } => "continuation application",
            Expr::App { .. } => "application",
            Expr::LetFlag { .. } => "completion flag",
            Expr::LetRec { .. } => "local function group",
        }
    }
}

// ============================================================================
// Walk
// ============================================================================

/// Everything about a node except its child expressions.
///
/// `Expr::into_parts` and `Shape::rebuild` are inverses; a pass may also
/// rebuild children under a different shape to change the node kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Lit(Literal),
    Var(Name),
    Op(PrimOp),
    If(IfForm),
    Lam(Vec<Name>),
    Define { name: Name, params: Vec<Name> },
    Cont(Name),
    ContApp,
    App,
    LetFlag(Name),
    LetRec(Vec<Name>),
}

fn next_child(children: &mut std::vec::IntoIter<Expr>) -> Box<Expr> {
    Box::new(children.next().expect("walk preserves the number of children"))
}

impl Shape {
    /// Reassemble a node from its children, given in walk order.
    ///
    /// Panics if fewer children are given than `into_parts` produced.
    pub fn rebuild(self, children: Vec<Expr>) -> Expr {
        let mut children = children.into_iter();
        match self {
            Shape::Lit(lit) => Expr::Lit(lit),
            Shape::Var(name) => Expr::Var(name),
            Shape::Op(op) => Expr::Op {
                op,
                args: children.collect(),
            },
            Shape::If(form) => Expr::If {
                form,
                test: next_child(&mut children),
                then_branch: next_child(&mut children),
                else_branch: next_child(&mut children),
            },
            Shape::Lam(params) => Expr::Lam {
                params,
                body: next_child(&mut children),
            },
            Shape::Define { name, params } => Expr::Define {
                name,
                params,
                body: next_child(&mut children),
            },
            Shape::Cont(param) => Expr::Cont {
                param,
                body: next_child(&mut children),
            },
            Shape::ContApp => Expr::ContApp {
                cont: next_child(&mut children),
                arg: next_child(&mut children),
            },
            Shape::App => {
                let func = next_child(&mut children);
                Expr::App {
                    func,
                    args: children.collect(),
                }
            }
            Shape::LetFlag(flag) => Expr::LetFlag {
                flag,
                body: next_child(&mut children),
            },
            Shape::LetRec(names) => {
                let bindings = names
                    .into_iter()
                    .map(|name| (name, *next_child(&mut children)))
                    .collect();
                Expr::LetRec {
                    bindings,
                    body: next_child(&mut children),
                }
            }
        }
    }
}

impl Expr {
    /// Take a node apart into its shape and its children in walk order.
    ///
    /// Walk order is fixed per kind: a conditional yields test, then branch,
    /// else branch; an application yields the operator before the operands;
    /// a local function group yields each bound function before its body.
    pub fn into_parts(self) -> (Shape, Vec<Expr>) {
        match self {
            Expr::Lit(lit) => (Shape::Lit(lit), vec![]),
            Expr::Var(name) => (Shape::Var(name), vec![]),
            Expr::Op { op, args } => (Shape::Op(op), args),
            Expr::If {
                form,
                test,
                then_branch,
                else_branch,
            } => (Shape::If(form), vec![*test, *then_branch, *else_branch]),
            Expr::Lam { params, body } => (Shape::Lam(params), vec![*body]),
            Expr::Define { name, params, body } => (Shape::Define { name, params }, vec![*body]),
            Expr::Cont { param, body } => (Shape::Cont(param), vec![*body]),
            Expr::ContApp { cont, arg } => (Shape::ContApp, vec![*cont, *arg]),
            Expr::App { func, args } => {
                let mut children = Vec::with_capacity(args.len() + 1);
                children.push(*func);
                children.extend(args);
                (Shape::App, children)
            }
            Expr::LetFlag { flag, body } => (Shape::LetFlag(flag), vec![*body]),
            Expr::LetRec { bindings, body } => {
                let (names, mut children): (Vec<_>, Vec<_>) = bindings.into_iter().unzip();
                children.push(*body);
                (Shape::LetRec(names), children)
            }
        }
    }

    /// Borrowed children in walk order
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Lit(_) | Expr::Var(_) => vec![],
            Expr::Op { args, .. } => args.iter().collect(),
            Expr::If {
                test,
                then_branch,
                else_branch,
                ..
            } => vec![test, then_branch, else_branch],
            Expr::Lam { body, .. }
            | Expr::Define { body, .. }
            | Expr::Cont { body, .. }
            | Expr::LetFlag { body, .. } => vec![body],
            Expr::ContApp { cont, arg } => vec![cont, arg],
            Expr::App { func, args } => std::iter::once(&**func).chain(args).collect(),
            Expr::LetRec { bindings, body } => bindings
                .iter()
                .map(|(_, value)| value)
                .chain(std::iter::once(&**body))
                .collect(),
        }
    }

    /// Transform every child with `visit`, then hand the node's shape and the
    /// transformed children to `rebuild`.
    pub fn walk<E>(
        self,
        visit: impl FnMut(Expr) -> Result<Expr, E>,
        rebuild: impl FnOnce(Shape, Vec<Expr>) -> Result<Expr, E>,
    ) -> Result<Expr, E> {
        let (shape, children) = self.into_parts();
        let children = children.into_iter().map(visit).collect::<Result<Vec<_>, E>>()?;
        rebuild(shape, children)
    }

    /// Infallible walk that keeps every node's shape
    pub fn map_children(self, mut visit: impl FnMut(Expr) -> Expr) -> Expr {
        let (shape, children) = self.into_parts();
        shape.rebuild(children.into_iter().map(&mut visit).collect())
    }

    /// Does any node in this tree (including the root) satisfy `pred`?
    pub fn any(&self, pred: &impl Fn(&Expr) -> bool) -> bool {
        pred(self) || self.children().into_iter().any(|child| child.any(pred))
    }

    /// Number of nodes in this tree satisfying `pred`
    pub fn count(&self, pred: &impl Fn(&Expr) -> bool) -> usize {
        usize::from(pred(self))
            + self
                .children()
                .into_iter()
                .map(|child| child.count(pred))
                .sum::<usize>()
    }
}

// ============================================================================
// Programs
// ============================================================================

/// A compilation unit: top-level definitions plus an optional expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    /// `Expr::Define` nodes in source order
    pub definitions: Vec<Expr>,
    /// Top-level expression; only present before CPS conversion
    pub main: Option<Expr>,
    /// Definition synthesised from `main` during CPS conversion
    pub entry: Option<Name>,
    /// Public definition name -> worker name assigned during CPS conversion
    pub workers: BTreeMap<Name, Name>,
}

impl Program {
    pub fn new(definitions: Vec<Expr>, main: Option<Expr>) -> Self {
        Program {
            definitions,
            main,
            ..Default::default()
        }
    }

    /// A program consisting of a single expression
    pub fn expression(main: Expr) -> Self {
        Program::new(vec![], Some(main))
    }

    pub fn definition(&self, name: &str) -> Option<&Expr> {
        self.definitions
            .iter()
            .find(|def| matches!(def, Expr::Define { name: n, .. } if n == name))
    }
}

// ============================================================================
// Fresh names
// ============================================================================

/// Deterministic source of fresh identifiers.
///
/// Fresh names have the form `hint#n`. The reader never produces an
/// identifier containing `#`, so they cannot collide with user names.
/// The counter is wider than the start value so any start leaves room for
/// every name a compilation can ask for.
#[derive(Debug, Clone, Default)]
pub struct NameGen {
    next: u64,
}

impl NameGen {
    pub fn new() -> Self {
        NameGen { next: 0 }
    }

    pub fn starting_at(first: u32) -> Self {
        NameGen {
            next: u64::from(first),
        }
    }

    /// A name never returned before by this generator. Any `#n` suffix on
    /// `hint` is dropped so renaming a fresh name stays readable.
    pub fn fresh(&mut self, hint: &str) -> Name {
        let base = hint.split('#').next().unwrap_or(hint);
        let name = format!("{}#{}", base, self.next);
        self.next += 1;
        name
    }

    /// The counter value the next fresh name will carry
    pub fn peek(&self) -> u64 {
        self.next
    }

    /// Reset between independent compilations
    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// True for names produced by [`NameGen`]; source symbols cannot contain `#`
pub fn is_fresh_name(name: &str) -> bool {
    name.contains('#')
}
