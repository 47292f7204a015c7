//! trampc compiler pipeline: surface program → CPS → abstracted continuations
//! → thunks → trampolines
//!
//! 1. CPS conversion: every serious computation hands its result to an
//!    explicit continuation (`cps_transform`)
//! 2. Continuation abstraction: continuations become ordinary one-parameter
//!    functions invoked through `apply-k` (`abstraction`)
//! 3. Thunkification: function bodies return zero-argument suspensions
//!    (`thunk`)
//! 4. Trampoline insertion: each definition drives its suspensions in a loop
//!    guarded by a private completion flag (`trampoline`)
//!
//! Every pass consumes its input tree and returns a new one.

pub mod abstraction;
pub mod cps_transform;
pub mod rename;
pub mod thunk;
pub mod trampoline;

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::ast::{Expr, NameGen, Program, Span};
use crate::emit::emit_program;
use crate::lexer::LexError;
use crate::parser::ParseError;

pub use abstraction::abstract_continuations;
pub use cps_transform::{cps_transform, is_trivial, CpsConverter};
pub use thunk::thunkify_program;
pub use trampoline::insert_trampolines;

/// Compiler stages, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Syntax,
    Cps,
    Abstraction,
    Thunk,
    Trampoline,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Syntax,
        Stage::Cps,
        Stage::Abstraction,
        Stage::Thunk,
        Stage::Trampoline,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Syntax => "syntax",
            Stage::Cps => "cps",
            Stage::Abstraction => "continuation abstraction",
            Stage::Thunk => "thunkification",
            Stage::Trampoline => "trampoline insertion",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// A node the examining stage does not recognise
    #[error("malformed expression during {stage}: {reason}: {form}")]
    MalformedExpression {
        stage: Stage,
        reason: String,
        form: String,
        span: Option<Span>,
    },
    /// A shape an earlier stage should never have produced
    #[error("internal invariant violated during {stage}: {detail}: {form}")]
    InvariantViolation {
        stage: Stage,
        detail: String,
        form: String,
    },
}

impl CompileError {
    pub fn malformed(stage: Stage, reason: impl Into<String>, expr: &Expr) -> Self {
        CompileError::MalformedExpression {
            stage,
            reason: reason.into(),
            form: expr.to_string(),
            span: None,
        }
    }

    pub fn invariant(stage: Stage, detail: impl Into<String>, expr: &Expr) -> Self {
        CompileError::InvariantViolation {
            stage,
            detail: detail.into(),
            form: expr.to_string(),
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            CompileError::Lex(e) => Some(e.span()),
            CompileError::Parse(e) => Some(e.span()),
            CompileError::MalformedExpression { span, .. } => *span,
            CompileError::InvariantViolation { .. } => None,
        }
    }
}

/// Knobs for one compilation
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Last stage to run; earlier stages let callers inspect intermediate trees
    pub stop_after: Stage,
    /// First value of the fresh-name counter
    pub first_fresh: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            stop_after: Stage::Trampoline,
            first_fresh: 0,
        }
    }
}

impl CompileOptions {
    pub fn stop_after(mut self, stage: Stage) -> Self {
        self.stop_after = stage;
        self
    }
}

/// Run the pipeline with a fresh name generator.
pub fn compile(program: Program, options: &CompileOptions) -> Result<Program, CompileError> {
    let mut names = NameGen::starting_at(options.first_fresh);
    compile_with(program, options, &mut names)
}

/// Run the pipeline drawing fresh names from `names`.
pub fn compile_with(
    program: Program,
    options: &CompileOptions,
    names: &mut NameGen,
) -> Result<Program, CompileError> {
    let mut program = program;
    debug!(
        target: "trampc::pipeline",
        definitions = program.definitions.len(),
        has_main = program.main.is_some(),
        stop_after = %options.stop_after,
        "compiling"
    );

    for stage in Stage::ALL {
        if stage > options.stop_after {
            break;
        }
        program = match stage {
            Stage::Syntax => program,
            Stage::Cps => cps_transform(program, names)?,
            Stage::Abstraction => abstract_continuations(program)?,
            Stage::Thunk => thunkify_program(program)?,
            Stage::Trampoline => insert_trampolines(program, names)?,
        };
        debug!(target: "trampc::pipeline", %stage, fresh_names = names.peek(), "stage complete");
        tracing::trace!(target: "trampc::pipeline", %stage, "\n{}", emit_program(&program));
    }

    Ok(program)
}
