//! Thunkification
//!
//! Delays every function body behind a zero-argument abstraction. Calling a
//! thunkified function does no work beyond building the suspension; the
//! trampoline forces it later, so CPS tail calls stop growing the native
//! stack.
//!
//! Operands, conditional tests and applications keep their shape: only the
//! bodies of abstractions and definitions are wrapped.

use tracing::debug;

use super::{CompileError, Stage};
use crate::ast::{Expr, Program, Shape};

/// Wrap `body` in a suspension
pub fn suspend(body: Expr) -> Expr {
    Expr::lam(vec![], body)
}

/// Is this a zero-argument abstraction?
pub fn is_suspension(expr: &Expr) -> bool {
    matches!(expr, Expr::Lam { params, .. } if params.is_empty())
}

pub fn thunkify_program(program: Program) -> Result<Program, CompileError> {
    let definitions = program
        .definitions
        .into_iter()
        .map(thunkify_definition)
        .collect::<Result<Vec<_>, _>>()?;
    let main = program.main.map(thunkify).transpose()?;

    debug!(target: "trampc::thunk", definitions = definitions.len(), "thunkified");
    Ok(Program {
        definitions,
        main,
        ..program
    })
}

fn thunkify_definition(def: Expr) -> Result<Expr, CompileError> {
    match def {
        Expr::Define { name, params, body } => Ok(Expr::Define {
            name,
            params,
            body: Box::new(suspend(thunkify(*body)?)),
        }),
        other => Err(CompileError::malformed(
            Stage::Thunk,
            "expected a top-level definition",
            &other,
        )),
    }
}

pub fn thunkify(expr: Expr) -> Result<Expr, CompileError> {
    match &expr {
        Expr::Cont { .. } | Expr::ContApp { .. } => {
            return Err(CompileError::invariant(
                Stage::Thunk,
                "continuation survived abstraction",
                &expr,
            ))
        }
        Expr::Define { .. } => {
            return Err(CompileError::malformed(Stage::Thunk, "definition below top level", &expr))
        }
        Expr::LetFlag { .. } | Expr::LetRec { .. } => {
            return Err(CompileError::malformed(
                Stage::Thunk,
                "form not valid before trampoline insertion",
                &expr,
            ))
        }
        _ => {}
    }

    expr.walk(thunkify, |shape, children| {
        Ok(match shape {
            Shape::Lam(params) => Shape::Lam(params).rebuild(children.into_iter().map(suspend).collect()),
            shape => shape.rebuild(children),
        })
    })
}
