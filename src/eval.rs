//! Defunctionalized interpreter for source and compiled programs
//!
//! The interpreter keeps its continuation as an explicit stack of frames, so
//! evaluation depth is an observable number rather than native recursion.
//! Frames are pushed only to evaluate operands and tests; calls in tail
//! position push nothing unless [`EvalOptions::tail_calls`] is off, in which
//! case every call behaves like a naive direct-style translation and leaves
//! a return frame behind.
//!
//! The runtime side of the compiler lives here too:
//! - `trampoline v flag` forces suspensions until `flag` is set
//! - `apply-k k v` sets the flag when `k` is the final continuation, and
//!   otherwise calls `k` with `v`
//! - `final-k flag` builds the final continuation for one activation
//!
//! Any stage of the pipeline can be run: programs with a top-level
//! expression are evaluated directly, and a CPS entry definition is called
//! with a final continuation under a driver frame.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::ast::{Expr, Literal, Name, PrimOp, Program, APPLY_K, FINAL_K, TRAMPOLINE};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("unbound variable: {0}")]
    UnboundVariable(String),
    #[error("type error: {0}")]
    TypeError(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow in `{0}`")]
    IntegerOverflow(PrimOp),
    #[error("{name} expects {expected} argument(s), got {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("not a procedure: {0}")]
    NotCallable(String),
    /// The driver was handed something other than a suspension while its
    /// completion flag was still unset
    #[error("trampoline: {0}")]
    Driver(String),
    #[error("stack overflow: more than {0} frames")]
    StackOverflow(usize),
    #[error("cannot evaluate {0}")]
    Unsupported(String),
}

// ============================================================================
// Code
// ============================================================================

/// Evaluation form of an expression. Subtrees are shared so closures and
/// frames clone in constant time.
#[derive(Debug)]
pub enum Code {
    Const(Value),
    Var(Name),
    Op {
        op: PrimOp,
        args: Vec<Rc<Code>>,
    },
    If {
        test: Rc<Code>,
        then_branch: Rc<Code>,
        else_branch: Rc<Code>,
    },
    Lam {
        params: Rc<[Name]>,
        body: Rc<Code>,
    },
    /// Operator first, then operands
    App {
        parts: Vec<Rc<Code>>,
    },
    /// Continuation, then argument
    ContApp {
        parts: Vec<Rc<Code>>,
    },
    LetFlag {
        flag: Name,
        body: Rc<Code>,
    },
    LetRec {
        bindings: Vec<(Name, Rc<[Name]>, Rc<Code>)>,
        body: Rc<Code>,
    },
}

impl Code {
    pub fn lower(expr: &Expr) -> Result<Rc<Code>, EvalError> {
        let code = match expr {
            Expr::Lit(Literal::Int(n)) => Code::Const(Value::Int(*n)),
            Expr::Lit(Literal::Bool(b)) => Code::Const(Value::Bool(*b)),
            Expr::Var(name) => Code::Var(name.clone()),
            Expr::Op { op, args } => Code::Op {
                op: *op,
                args: lower_all(args.iter())?,
            },
            Expr::If {
                test,
                then_branch,
                else_branch,
                ..
            } => Code::If {
                test: Code::lower(test)?,
                then_branch: Code::lower(then_branch)?,
                else_branch: Code::lower(else_branch)?,
            },
            Expr::Lam { params, body } => Code::Lam {
                params: params.as_slice().into(),
                body: Code::lower(body)?,
            },
            Expr::Cont { param, body } => Code::Lam {
                params: Rc::from(vec![param.clone()]),
                body: Code::lower(body)?,
            },
            Expr::App { func, args } => Code::App {
                parts: lower_all(std::iter::once(&**func).chain(args))?,
            },
            Expr::ContApp { cont, arg } => Code::ContApp {
                parts: vec![Code::lower(cont)?, Code::lower(arg)?],
            },
            Expr::LetFlag { flag, body } => Code::LetFlag {
                flag: flag.clone(),
                body: Code::lower(body)?,
            },
            Expr::LetRec { bindings, body } => Code::LetRec {
                bindings: bindings
                    .iter()
                    .map(|(name, value)| match value {
                        Expr::Lam { params, body } => {
                            Ok((name.clone(), params.as_slice().into(), Code::lower(body)?))
                        }
                        other => Err(EvalError::Unsupported(format!(
                            "local function `{}` bound to {}",
                            name, other
                        ))),
                    })
                    .collect::<Result<Vec<(Name, Rc<[Name]>, Rc<Code>)>, EvalError>>()?,
                body: Code::lower(body)?,
            },
            Expr::Define { .. } => {
                return Err(EvalError::Unsupported(format!("nested definition {}", expr)))
            }
        };
        Ok(Rc::new(code))
    }

    /// Subexpressions evaluated left to right before the node combines them
    fn operands(&self) -> &[Rc<Code>] {
        match self {
            Code::Op { args, .. } => args,
            Code::App { parts } | Code::ContApp { parts } => parts,
            _ => &[],
        }
    }
}

fn lower_all<'e>(exprs: impl Iterator<Item = &'e Expr>) -> Result<Vec<Rc<Code>>, EvalError> {
    exprs.map(Code::lower).collect()
}

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Trampoline,
    ApplyK,
    FinalK,
}

impl Builtin {
    pub const ALL: [Builtin; 3] = [Builtin::Trampoline, Builtin::ApplyK, Builtin::FinalK];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Trampoline => TRAMPOLINE,
            Builtin::ApplyK => APPLY_K,
            Builtin::FinalK => FINAL_K,
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::Trampoline | Builtin::ApplyK => 2,
            Builtin::FinalK => 1,
        }
    }
}

pub struct Closure {
    pub name: Option<Name>,
    pub params: Rc<[Name]>,
    pub body: Rc<Code>,
    pub env: Env,
}

impl Closure {
    fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => "anonymous procedure".to_string(),
        }
    }
}

// Environments are cyclic through local function groups
impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Runtime values
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Closure(Rc<Closure>),
    /// Completion flag of one trampolined activation
    Flag(Rc<Cell<bool>>),
    /// Final continuation: resuming it sets the flag it carries
    FinalCont(Rc<Cell<bool>>),
    Builtin(Builtin),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Bool(_) => "boolean",
            Value::Closure(_) => "procedure",
            Value::Flag(_) => "flag",
            Value::FinalCont(_) => "final continuation",
            Value::Builtin(_) => "builtin",
        }
    }

    /// A zero-argument procedure
    pub fn is_suspension(&self) -> bool {
        matches!(self, Value::Closure(c) if c.params.is_empty())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Flag(a), Value::Flag(b)) | (Value::FinalCont(a), Value::FinalCont(b)) => {
                Rc::ptr_eq(a, b)
            }
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", Literal::Bool(*b)),
            Value::Closure(c) => match &c.name {
                Some(name) => write!(f, "#<procedure {}>", name),
                None => write!(f, "#<procedure>"),
            },
            Value::Flag(flag) => {
                write!(f, "#<flag {}>", if flag.get() { "set" } else { "unset" })
            }
            Value::FinalCont(_) => write!(f, "#<final-continuation>"),
            Value::Builtin(b) => write!(f, "#<builtin {}>", b.name()),
        }
    }
}

/// Environment mapping names to values
pub type Env = Rc<RefCell<EnvInner>>;

#[derive(Debug, Clone, Default)]
pub struct EnvInner {
    bindings: HashMap<String, Value>,
    parent: Option<Env>,
}

impl EnvInner {
    pub fn new() -> Env {
        Rc::new(RefCell::new(EnvInner::default()))
    }

    pub fn with_parent(parent: &Env) -> Env {
        Rc::new(RefCell::new(EnvInner {
            bindings: HashMap::new(),
            parent: Some(parent.clone()),
        }))
    }

    pub fn define(&mut self, name: String, value: Value) {
        self.bindings.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.bindings.get(name) {
            Some(value.clone())
        } else if let Some(parent) = &self.parent {
            parent.borrow().get(name)
        } else {
            None
        }
    }

    /// Every name visible from this scope, innermost first
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        if let Some(parent) = &self.parent {
            names.extend(parent.borrow().names());
        }
        names
    }
}

// ============================================================================
// Machine
// ============================================================================

/// A single continuation frame: what to do with the next value
#[derive(Debug)]
enum Frame {
    /// Evaluating the operands of an operation or application
    Collect {
        code: Rc<Code>,
        env: Env,
        done: Vec<Value>,
    },
    /// Waiting for a conditional's test
    Branch { code: Rc<Code>, env: Env },
    /// A running trampoline
    Drive { flag: Rc<Cell<bool>>, bounces: u64 },
    /// Left by a call when tail calls are disabled
    Return,
}

enum State {
    Eval { code: Rc<Code>, env: Env },
    Call { func: Value, args: Vec<Value> },
    Apply { value: Value },
}

pub const DEFAULT_STACK_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Frames allowed on the machine stack before giving up
    pub stack_limit: usize,
    /// Calls in tail position reuse the caller's frame
    pub tail_calls: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            stack_limit: DEFAULT_STACK_LIMIT,
            tail_calls: true,
        }
    }
}

/// Counters accumulated across every run of one interpreter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    pub steps: u64,
    /// Deepest machine stack seen
    pub max_depth: usize,
    /// Suspensions forced by trampolines
    pub bounces: u64,
}

/// The interpreter
pub struct Interpreter {
    /// Global environment
    global_env: Env,
    /// Scopes of local function groups, which their closures keep alive
    groups: Vec<Weak<RefCell<EnvInner>>>,
    options: EvalOptions,
    stats: EvalStats,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_options(EvalOptions::default())
    }

    pub fn with_options(options: EvalOptions) -> Self {
        let global_env = EnvInner::new();
        {
            let mut env = global_env.borrow_mut();
            for builtin in Builtin::ALL {
                env.define(builtin.name().into(), Value::Builtin(builtin));
            }
        }
        Self {
            global_env,
            groups: Vec::new(),
            options,
            stats: EvalStats::default(),
        }
    }

    /// Drop the bindings of `scope`, releasing closures that capture it
    fn release(scope: &Env) {
        let bindings = std::mem::take(&mut scope.borrow_mut().bindings);
        drop(bindings);
    }

    pub fn stats(&self) -> EvalStats {
        self.stats
    }

    /// Names bound in the global environment
    pub fn global_names(&self) -> Vec<String> {
        self.global_env.borrow().names()
    }

    /// Bind every definition of `program` as a global procedure
    pub fn load_definitions(&mut self, program: &Program) -> Result<(), EvalError> {
        for def in &program.definitions {
            let Expr::Define { name, params, body } = def else {
                return Err(EvalError::Unsupported(format!("top-level form {}", def)));
            };
            let closure = Closure {
                name: Some(name.clone()),
                params: params.as_slice().into(),
                body: Code::lower(body)?,
                env: self.global_env.clone(),
            };
            self.global_env
                .borrow_mut()
                .define(name.clone(), Value::Closure(Rc::new(closure)));
        }
        Ok(())
    }

    /// Run a program of any stage.
    ///
    /// Returns the value of the top-level expression or entry definition, or
    /// `None` when the program only defines procedures.
    pub fn run_program(&mut self, program: &Program) -> Result<Option<Value>, EvalError> {
        self.load_definitions(program)?;

        if let Some(main) = &program.main {
            return self.eval_expr(main).map(Some);
        }
        let Some(entry) = &program.entry else {
            return Ok(None);
        };

        let func = self.lookup_global(entry)?;
        let arity = match &func {
            Value::Closure(closure) => closure.params.len(),
            other => return Err(EvalError::NotCallable(other.to_string())),
        };
        debug!(target: "trampc::eval", entry = %entry, arity, "running entry definition");

        let value = match arity {
            // Trampolined: the entry point drives itself
            0 => self.call_value(func, vec![])?,
            // CPS stages: supply the final continuation and drive from outside
            1 => {
                let flag = Rc::new(Cell::new(false));
                let cont = vec![Frame::Drive {
                    flag: flag.clone(),
                    bounces: 0,
                }];
                let state = State::Call {
                    func,
                    args: vec![Value::FinalCont(flag)],
                };
                self.execute(state, cont)?
            }
            n => {
                return Err(EvalError::ArityMismatch {
                    name: entry.clone(),
                    expected: n,
                    found: 0,
                })
            }
        };
        debug!(target: "trampc::eval", stats = ?self.stats, "program finished");
        Ok(Some(value))
    }

    pub fn lookup_global(&self, name: &str) -> Result<Value, EvalError> {
        let value = self.global_env.borrow().get(name);
        value.ok_or_else(|| EvalError::UnboundVariable(name.to_string()))
    }

    /// Call a global procedure with `args`
    pub fn call_global(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        let func = self.lookup_global(name)?;
        self.call_value(func, args)
    }

    pub fn call_value(&mut self, func: Value, args: Vec<Value>) -> Result<Value, EvalError> {
        self.execute(State::Call { func, args }, Vec::new())
    }

    /// Evaluate an expression in the global environment
    pub fn eval_expr(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        let code = Code::lower(expr)?;
        let env = self.global_env.clone();
        self.execute(State::Eval { code, env }, Vec::new())
    }

    /// Run the machine until the stack is empty or an error occurs
    fn execute(&mut self, mut state: State, mut cont: Vec<Frame>) -> Result<Value, EvalError> {
        loop {
            self.stats.steps += 1;
            let depth = cont.len();
            self.stats.max_depth = self.stats.max_depth.max(depth);
            if depth > self.options.stack_limit {
                return Err(EvalError::StackOverflow(self.options.stack_limit));
            }

            state = match state {
                State::Eval { code, env } => self.step_eval(&code, env, &mut cont)?,
                State::Call { func, args } => self.apply(func, args, &mut cont)?,
                State::Apply { value } => match cont.pop() {
                    Some(frame) => self.step_apply(frame, value, &mut cont)?,
                    None => return Ok(value),
                },
            };
        }
    }

    fn step_eval(&mut self, code: &Rc<Code>, env: Env, cont: &mut Vec<Frame>) -> Result<State, EvalError> {
        match code.as_ref() {
            Code::Const(value) => Ok(State::Apply {
                value: value.clone(),
            }),

            Code::Var(name) => {
                let value = env.borrow().get(name);
                match value {
                    Some(value) => Ok(State::Apply { value }),
                    None => Err(EvalError::UnboundVariable(name.clone())),
                }
            }

            Code::Op { .. } | Code::App { .. } | Code::ContApp { .. } => {
                let Some(first) = code.operands().first().cloned() else {
                    return self.combine(code, Vec::new(), cont);
                };
                cont.push(Frame::Collect {
                    code: code.clone(),
                    env: env.clone(),
                    done: Vec::with_capacity(code.operands().len()),
                });
                Ok(State::Eval { code: first, env })
            }

            Code::If { test, .. } => {
                cont.push(Frame::Branch {
                    code: code.clone(),
                    env: env.clone(),
                });
                Ok(State::Eval {
                    code: test.clone(),
                    env,
                })
            }

            Code::Lam { params, body } => Ok(State::Apply {
                value: Value::Closure(Rc::new(Closure {
                    name: None,
                    params: params.clone(),
                    body: body.clone(),
                    env,
                })),
            }),

            Code::LetFlag { flag, body } => {
                let scope = EnvInner::with_parent(&env);
                scope
                    .borrow_mut()
                    .define(flag.clone(), Value::Flag(Rc::new(Cell::new(false))));
                Ok(State::Eval {
                    code: body.clone(),
                    env: scope,
                })
            }

            Code::LetRec { bindings, body } => {
                let scope = EnvInner::with_parent(&env);
                self.groups.retain(|group| group.strong_count() > 0);
                self.groups.push(Rc::downgrade(&scope));
                for (name, params, fbody) in bindings {
                    let closure = Closure {
                        name: Some(name.clone()),
                        params: params.clone(),
                        body: fbody.clone(),
                        env: scope.clone(),
                    };
                    scope
                        .borrow_mut()
                        .define(name.clone(), Value::Closure(Rc::new(closure)));
                }
                Ok(State::Eval {
                    code: body.clone(),
                    env: scope,
                })
            }
        }
    }

    fn step_apply(&mut self, frame: Frame, value: Value, cont: &mut Vec<Frame>) -> Result<State, EvalError> {
        match frame {
            Frame::Collect { code, env, mut done } => {
                done.push(value);
                let next = code.operands().get(done.len()).cloned();
                match next {
                    Some(next) => {
                        cont.push(Frame::Collect {
                            code,
                            env: env.clone(),
                            done,
                        });
                        Ok(State::Eval { code: next, env })
                    }
                    None => self.combine(&code, done, cont),
                }
            }

            Frame::Branch { code, env } => {
                let Code::If {
                    then_branch,
                    else_branch,
                    ..
                } = code.as_ref()
                else {
                    return Err(EvalError::Unsupported("branch frame without a conditional".into()));
                };
                match value {
                    Value::Bool(true) => Ok(State::Eval {
                        code: then_branch.clone(),
                        env,
                    }),
                    Value::Bool(false) => Ok(State::Eval {
                        code: else_branch.clone(),
                        env,
                    }),
                    other => Err(EvalError::TypeError(format!(
                        "conditional test must be a boolean, got {} {}",
                        other.type_name(),
                        other
                    ))),
                }
            }

            Frame::Drive { flag, bounces } => {
                if flag.get() {
                    debug!(target: "trampc::eval", bounces, "trampoline finished");
                    return Ok(State::Apply { value });
                }
                match value {
                    Value::Closure(closure) if closure.params.is_empty() => {
                        self.stats.bounces += 1;
                        cont.push(Frame::Drive {
                            flag,
                            bounces: bounces + 1,
                        });
                        Ok(State::Eval {
                            code: closure.body.clone(),
                            env: closure.env.clone(),
                        })
                    }
                    other => Err(EvalError::Driver(format!(
                        "expected a suspension before completion, got {}",
                        other
                    ))),
                }
            }

            Frame::Return => Ok(State::Apply { value }),
        }
    }

    /// All operands of `code` are evaluated; produce its result
    fn combine(&mut self, code: &Code, values: Vec<Value>, cont: &mut Vec<Frame>) -> Result<State, EvalError> {
        match code {
            Code::Op { op, .. } => Ok(State::Apply {
                value: apply_primop(*op, &values)?,
            }),
            Code::App { .. } => {
                let mut values = values.into_iter();
                match values.next() {
                    Some(func) => Ok(State::Call {
                        func,
                        args: values.collect(),
                    }),
                    None => Err(EvalError::Unsupported("empty application".into())),
                }
            }
            Code::ContApp { .. } => {
                let [k, value] = <[Value; 2]>::try_from(values)
                    .map_err(|_| EvalError::Unsupported("continuation application".into()))?;
                self.resume(k, value, cont)
            }
            _ => Err(EvalError::Unsupported("combining a form without operands".into())),
        }
    }

    fn apply(&mut self, func: Value, args: Vec<Value>, cont: &mut Vec<Frame>) -> Result<State, EvalError> {
        match func {
            Value::Closure(closure) => {
                if closure.params.len() != args.len() {
                    return Err(EvalError::ArityMismatch {
                        name: closure.label(),
                        expected: closure.params.len(),
                        found: args.len(),
                    });
                }
                let scope = EnvInner::with_parent(&closure.env);
                {
                    let mut scope = scope.borrow_mut();
                    for (param, arg) in closure.params.iter().zip(args) {
                        scope.define(param.clone(), arg);
                    }
                }
                if !self.options.tail_calls {
                    cont.push(Frame::Return);
                }
                Ok(State::Eval {
                    code: closure.body.clone(),
                    env: scope,
                })
            }
            Value::Builtin(builtin) => self.apply_builtin(builtin, args, cont),
            Value::FinalCont(flag) => {
                let [value] = <[Value; 1]>::try_from(args).map_err(|args| EvalError::ArityMismatch {
                    name: "final continuation".into(),
                    expected: 1,
                    found: args.len(),
                })?;
                flag.set(true);
                Ok(State::Apply { value })
            }
            other => Err(EvalError::NotCallable(format!("{} {}", other.type_name(), other))),
        }
    }

    fn apply_builtin(&mut self, builtin: Builtin, args: Vec<Value>, cont: &mut Vec<Frame>) -> Result<State, EvalError> {
        if args.len() != builtin.arity() {
            return Err(EvalError::ArityMismatch {
                name: builtin.name().into(),
                expected: builtin.arity(),
                found: args.len(),
            });
        }
        let mut args = args.into_iter();
        let mut next = || args.next().ok_or_else(|| EvalError::Unsupported(builtin.name().into()));

        match builtin {
            Builtin::Trampoline => {
                let start = next()?;
                let Value::Flag(flag) = next()? else {
                    return Err(EvalError::TypeError(format!(
                        "{} expects a completion flag",
                        TRAMPOLINE
                    )));
                };
                trace!(target: "trampc::eval", depth = cont.len(), "trampoline started");
                cont.push(Frame::Drive { flag, bounces: 0 });
                Ok(State::Apply { value: start })
            }
            Builtin::ApplyK => {
                let k = next()?;
                let value = next()?;
                self.resume(k, value, cont)
            }
            Builtin::FinalK => match next()? {
                Value::Flag(flag) => Ok(State::Apply {
                    value: Value::FinalCont(flag),
                }),
                other => Err(EvalError::TypeError(format!(
                    "{} expects a completion flag, got {}",
                    FINAL_K, other
                ))),
            },
        }
    }

    /// Deliver `value` to a continuation
    fn resume(&mut self, k: Value, value: Value, cont: &mut Vec<Frame>) -> Result<State, EvalError> {
        match k {
            Value::FinalCont(flag) => {
                flag.set(true);
                Ok(State::Apply { value })
            }
            k => self.apply(k, vec![value], cont),
        }
    }
}

fn int(op: PrimOp, value: &Value) -> Result<i64, EvalError> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(EvalError::TypeError(format!(
            "`{}` expects an integer, got {} {}",
            op,
            other.type_name(),
            other
        ))),
    }
}

fn boolean(op: PrimOp, value: &Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(EvalError::TypeError(format!(
            "`{}` expects a boolean, got {} {}",
            op,
            other.type_name(),
            other
        ))),
    }
}

// Closures in a local function group and the global procedures capture the
// environment that binds them. Those cycles are cut when the machine goes away.
impl Drop for Interpreter {
    fn drop(&mut self) {
        for scope in self.groups.drain(..).filter_map(|group| group.upgrade()) {
            Self::release(&scope);
        }
        Self::release(&self.global_env);
    }
}

/// Apply a trivial operator. Arithmetic is checked; division truncates
/// toward zero and `%` takes the sign of the dividend.
pub fn apply_primop(op: PrimOp, args: &[Value]) -> Result<Value, EvalError> {
    if args.len() != op.arity() {
        return Err(EvalError::ArityMismatch {
            name: op.symbol().into(),
            expected: op.arity(),
            found: args.len(),
        });
    }
    let overflow = move || EvalError::IntegerOverflow(op);
    let ints = || -> Result<(i64, i64), EvalError> { Ok((int(op, &args[0])?, int(op, &args[1])?)) };

    let value = match op {
        PrimOp::Add => {
            let (a, b) = ints()?;
            Value::Int(a.checked_add(b).ok_or_else(overflow)?)
        }
        PrimOp::Sub => {
            let (a, b) = ints()?;
            Value::Int(a.checked_sub(b).ok_or_else(overflow)?)
        }
        PrimOp::Mul => {
            let (a, b) = ints()?;
            Value::Int(a.checked_mul(b).ok_or_else(overflow)?)
        }
        PrimOp::Div | PrimOp::Mod => {
            let (a, b) = ints()?;
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            let result = if op == PrimOp::Div {
                a.checked_div(b)
            } else {
                a.checked_rem(b)
            };
            Value::Int(result.ok_or_else(overflow)?)
        }
        PrimOp::Eq => match (&args[0], &args[1]) {
            (Value::Int(a), Value::Int(b)) => Value::Bool(a == b),
            (Value::Bool(a), Value::Bool(b)) => Value::Bool(a == b),
            (a, b) => {
                return Err(EvalError::TypeError(format!(
                    "`=` compares two integers or two booleans, got {} and {}",
                    a.type_name(),
                    b.type_name()
                )))
            }
        },
        PrimOp::Lt | PrimOp::Gt | PrimOp::Le | PrimOp::Ge => {
            let (a, b) = ints()?;
            Value::Bool(match op {
                PrimOp::Lt => a < b,
                PrimOp::Gt => a > b,
                PrimOp::Le => a <= b,
                _ => a >= b,
            })
        }
        PrimOp::Not => Value::Bool(!boolean(op, &args[0])?),
        PrimOp::IsZero => Value::Bool(int(op, &args[0])? == 0),
        PrimOp::Add1 => Value::Int(int(op, &args[0])?.checked_add(1).ok_or_else(overflow)?),
        PrimOp::Sub1 => Value::Int(int(op, &args[0])?.checked_sub(1).ok_or_else(overflow)?),
    };
    Ok(value)
}

/// Run a program with a fresh interpreter
pub fn run_program(program: &Program) -> Result<Option<Value>, EvalError> {
    Interpreter::new().run_program(program)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: Expr) -> Result<Value, EvalError> {
        Interpreter::new().eval_expr(&expr)
    }

    fn countdown_def() -> Expr {
        Expr::define(
            "countdown",
            vec!["n".into()],
            Expr::conditional(
                Expr::op(PrimOp::IsZero, vec![Expr::var("n")]),
                Expr::int(0),
                Expr::app(
                    Expr::var("countdown"),
                    vec![Expr::op(PrimOp::Sub1, vec![Expr::var("n")])],
                ),
            ),
        )
    }

    #[test]
    fn test_primops() {
        let add = Expr::op(PrimOp::Add, vec![Expr::int(2), Expr::int(3)]);
        assert_eq!(eval(add), Ok(Value::Int(5)));
        assert_eq!(
            apply_primop(PrimOp::Mod, &[Value::Int(-7), Value::Int(2)]),
            Ok(Value::Int(-1))
        );
        assert_eq!(
            apply_primop(PrimOp::Le, &[Value::Int(2), Value::Int(2)]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            apply_primop(PrimOp::Not, &[Value::Bool(true)]),
            Ok(Value::Bool(false))
        );
    }

    #[test]
    fn test_arithmetic_errors() {
        assert_eq!(
            apply_primop(PrimOp::Div, &[Value::Int(1), Value::Int(0)]),
            Err(EvalError::DivisionByZero)
        );
        assert_eq!(
            apply_primop(PrimOp::Add1, &[Value::Int(i64::MAX)]),
            Err(EvalError::IntegerOverflow(PrimOp::Add1))
        );
        assert_eq!(
            apply_primop(PrimOp::Div, &[Value::Int(i64::MIN), Value::Int(-1)]),
            Err(EvalError::IntegerOverflow(PrimOp::Div))
        );
        assert!(matches!(
            apply_primop(PrimOp::Add, &[Value::Int(1), Value::Bool(true)]),
            Err(EvalError::TypeError(_))
        ));
    }

    #[test]
    fn test_conditional_requires_boolean() {
        let expr = Expr::conditional(Expr::int(0), Expr::int(1), Expr::int(2));
        assert!(matches!(eval(expr), Err(EvalError::TypeError(_))));
    }

    #[test]
    fn test_closure_application_and_arity() {
        let id = Expr::lam(vec!["x".into()], Expr::var("x"));
        assert_eq!(
            eval(Expr::app(id.clone(), vec![Expr::int(9)])),
            Ok(Value::Int(9))
        );
        assert_eq!(
            eval(Expr::app(id, vec![])),
            Err(EvalError::ArityMismatch {
                name: "anonymous procedure".into(),
                expected: 1,
                found: 0
            })
        );
        assert!(matches!(
            eval(Expr::app(Expr::int(1), vec![])),
            Err(EvalError::NotCallable(_))
        ));
        assert_eq!(
            eval(Expr::var("nope")),
            Err(EvalError::UnboundVariable("nope".into()))
        );
    }

    #[test]
    fn test_direct_tail_calls_keep_stack_flat() {
        let program = Program::new(
            vec![countdown_def()],
            Some(Expr::app(Expr::var("countdown"), vec![Expr::int(10_000)])),
        );
        let mut interp = Interpreter::new();
        assert_eq!(interp.run_program(&program), Ok(Some(Value::Int(0))));
        assert!(interp.stats().max_depth < 8);
    }

    #[test]
    fn test_dropping_interpreter_frees_function_groups() {
        // (letrec ((f (lambda (x) x))) f)
        let expr = Expr::LetRec {
            bindings: vec![("f".into(), Expr::lam(vec!["x".into()], Expr::var("x")))],
            body: Box::new(Expr::var("f")),
        };
        let mut interp = Interpreter::new();
        let Ok(Value::Closure(f)) = interp.eval_expr(&expr) else {
            panic!("expected a procedure");
        };
        let group = Rc::downgrade(&f.env);
        drop(f);
        // The group keeps itself alive while the machine runs
        assert!(group.upgrade().is_some());
        drop(interp);
        assert!(group.upgrade().is_none());
    }

    #[test]
    fn test_naive_calls_overflow() {
        let program = Program::new(
            vec![countdown_def()],
            Some(Expr::app(Expr::var("countdown"), vec![Expr::int(10_000)])),
        );
        let mut interp = Interpreter::with_options(EvalOptions {
            stack_limit: 1_000,
            tail_calls: false,
        });
        assert_eq!(interp.run_program(&program), Err(EvalError::StackOverflow(1_000)));
    }

    #[test]
    fn test_runtime_primitives() {
        // (let-flag (done) (apply-k (final-k done) 42))
        let expr = Expr::LetFlag {
            flag: "done".into(),
            body: Box::new(Expr::app(
                Expr::var(APPLY_K),
                vec![
                    Expr::app(Expr::var(FINAL_K), vec![Expr::var("done")]),
                    Expr::int(42),
                ],
            )),
        };
        assert_eq!(eval(expr), Ok(Value::Int(42)));

        // apply-k on an ordinary continuation calls it
        let expr = Expr::app(
            Expr::var(APPLY_K),
            vec![
                Expr::lam(vec!["v".into()], Expr::op(PrimOp::Add1, vec![Expr::var("v")])),
                Expr::int(1),
            ],
        );
        assert_eq!(eval(expr), Ok(Value::Int(2)));
    }

    #[test]
    fn test_trampoline_forces_until_flag_set() {
        // (let-flag (done)
        //   (letrec ((f (lambda (n k) (lambda () (if (zero? n) (apply-k k 7) (f (sub1 n) k))))))
        //     (trampoline (f 3 (final-k done)) done)))
        let body = Expr::conditional(
            Expr::op(PrimOp::IsZero, vec![Expr::var("n")]),
            Expr::app(Expr::var(APPLY_K), vec![Expr::var("k"), Expr::int(7)]),
            Expr::app(
                Expr::var("f"),
                vec![Expr::op(PrimOp::Sub1, vec![Expr::var("n")]), Expr::var("k")],
            ),
        );
        let expr = Expr::LetFlag {
            flag: "done".into(),
            body: Box::new(Expr::LetRec {
                bindings: vec![(
                    "f".into(),
                    Expr::lam(vec!["n".into(), "k".into()], Expr::lam(vec![], body)),
                )],
                body: Box::new(Expr::app(
                    Expr::var(TRAMPOLINE),
                    vec![
                        Expr::app(
                            Expr::var("f"),
                            vec![
                                Expr::int(3),
                                Expr::app(Expr::var(FINAL_K), vec![Expr::var("done")]),
                            ],
                        ),
                        Expr::var("done"),
                    ],
                )),
            }),
        };
        let mut interp = Interpreter::new();
        assert_eq!(interp.eval_expr(&expr), Ok(Value::Int(7)));
        assert_eq!(interp.stats().bounces, 4);
    }

    #[test]
    fn test_driver_rejects_non_suspension() {
        let expr = Expr::LetFlag {
            flag: "done".into(),
            body: Box::new(Expr::app(
                Expr::var(TRAMPOLINE),
                vec![Expr::int(5), Expr::var("done")],
            )),
        };
        assert!(matches!(eval(expr), Err(EvalError::Driver(_))));
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Bool(true).to_string(), "#t");
        assert_eq!(Value::Int(-4).to_string(), "-4");
        assert_eq!(Value::Builtin(Builtin::ApplyK).to_string(), "#<builtin apply-k>");
    }

    #[test]
    fn test_program_without_expression() {
        let program = Program::new(vec![countdown_def()], None);
        let mut interp = Interpreter::new();
        assert_eq!(interp.run_program(&program), Ok(None));
        assert_eq!(
            interp.call_global("countdown", vec![Value::Int(5)]),
            Ok(Value::Int(0))
        );
        assert!(interp.global_names().contains(&"countdown".to_string()));
    }
}
