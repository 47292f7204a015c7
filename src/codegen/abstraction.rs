//! Continuation abstraction
//!
//! After CPS conversion continuations are still special nodes. This pass
//! turns them into ordinary functions so later stages see only abstractions
//! and applications:
//!
//! - `continuation (p) body` → `lambda (p) body`
//! - `continue k v` → `apply-k k v`
//!
//! Invoking a continuation through the runtime's `apply-k` gives the
//! trampoline one place to notice the final continuation.

use tracing::debug;

use super::{CompileError, Stage};
use crate::ast::{Expr, Program, Shape, APPLY_K};

/// Abstract every continuation in a program's definitions
pub fn abstract_continuations(program: Program) -> Result<Program, CompileError> {
    let mut rewritten = 0usize;
    let definitions = program
        .definitions
        .into_iter()
        .map(|def| {
            rewritten += def.count(&|e| matches!(e, Expr::Cont { .. } | Expr::ContApp { .. }));
            abstract_definition(def)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let main = program.main.map(abstract_expr).transpose()?;

    debug!(target: "trampc::abstraction", rewritten, "abstracted continuations");
    Ok(Program {
        definitions,
        main,
        ..program
    })
}

fn abstract_definition(def: Expr) -> Result<Expr, CompileError> {
    match def {
        Expr::Define { name, params, body } => Ok(Expr::Define {
            name,
            params,
            body: Box::new(abstract_expr(*body)?),
        }),
        other => Err(CompileError::malformed(
            Stage::Abstraction,
            "expected a top-level definition",
            &other,
        )),
    }
}

/// Rewrite continuations and continuation applications bottom-up.
pub fn abstract_expr(expr: Expr) -> Result<Expr, CompileError> {
    if let Expr::Define { .. } | Expr::LetFlag { .. } | Expr::LetRec { .. } = expr {
        return Err(CompileError::malformed(
            Stage::Abstraction,
            "form not valid before trampoline insertion",
            &expr,
        ));
    }

    expr.walk(abstract_expr, |shape, children| {
        Ok(match shape {
            Shape::Cont(param) => Shape::Lam(vec![param]).rebuild(children),
            // children are [cont, arg]
            Shape::ContApp => Expr::app(Expr::var(APPLY_K), children),
            shape => shape.rebuild(children),
        })
    })
}
