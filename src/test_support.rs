//! Test support for exercising the compiler pipeline end to end.
//!
//! Helpers return `Result<_, String>` so tests can `unwrap()` with a readable
//! message, and cover:
//! - Parsing and compiling to any stage
//! - Running a program before and after compilation
//! - Structural queries over compiled trees

use crate::ast::{Expr, Program};
use crate::codegen::{compile, CompileOptions, Stage};
use crate::eval::{EvalOptions, EvalStats, Interpreter, Value};
use crate::parser;

// ============================================================================
// Pipeline Inspection
// ============================================================================

/// Parse a program and return the surface tree
pub fn parse_program(input: &str) -> Result<Program, String> {
    parser::parse_program(input).map_err(|e| format!("Parse error: {}", e))
}

/// Parse a single expression
pub fn parse_expr(input: &str) -> Result<Expr, String> {
    parser::parse_expr(input).map_err(|e| format!("Parse error: {}", e))
}

/// Parse and run the pipeline up to and including `stage`
pub fn compile_to(input: &str, stage: Stage) -> Result<Program, String> {
    let program = parse_program(input)?;
    compile(program, &CompileOptions::default().stop_after(stage))
        .map_err(|e| format!("Compile error: {}", e))
}

/// Parse and run the whole pipeline
pub fn compile_source(input: &str) -> Result<Program, String> {
    compile_to(input, Stage::Trampoline)
}

/// Look up a definition by public name
pub fn definition<'p>(program: &'p Program, name: &str) -> Result<&'p Expr, String> {
    program
        .definition(name)
        .ok_or_else(|| format!("no definition named `{}`", name))
}

// ============================================================================
// Evaluation
// ============================================================================

fn run(program: &Program, options: EvalOptions) -> Result<(Value, EvalStats), String> {
    let mut interp = Interpreter::with_options(options);
    let value = interp
        .run_program(program)
        .map_err(|e| format!("Runtime error: {}", e))?
        .ok_or_else(|| "program has no expression to evaluate".to_string())?;
    Ok((value, interp.stats()))
}

/// Evaluate the surface program directly
pub fn run_direct(input: &str) -> Result<Value, String> {
    run(&parse_program(input)?, EvalOptions::default()).map(|(v, _)| v)
}

/// Compile fully and run the trampolined program
pub fn run_compiled(input: &str) -> Result<Value, String> {
    run(&compile_source(input)?, EvalOptions::default()).map(|(v, _)| v)
}

/// Run the output of `stage`
pub fn run_stage(input: &str, stage: Stage) -> Result<Value, String> {
    run(&compile_to(input, stage)?, EvalOptions::default()).map(|(v, _)| v)
}

/// Compile fully and run with the given machine options, returning stats
pub fn run_compiled_with(input: &str, options: EvalOptions) -> Result<(Value, EvalStats), String> {
    run(&compile_source(input)?, options)
}

/// Run the surface program with the given machine options, returning stats
pub fn run_direct_with(input: &str, options: EvalOptions) -> Result<(Value, EvalStats), String> {
    run(&parse_program(input)?, options)
}

/// Machine options that mimic a naive direct-style translation: every call
/// holds a frame until it returns.
pub fn naive_calls(stack_limit: usize) -> EvalOptions {
    EvalOptions {
        stack_limit,
        tail_calls: false,
    }
}

/// Assert that the compiled program computes what the source computes.
/// Runtime errors count as results and must match too.
pub fn assert_same_result(input: &str) {
    let direct = run_direct(input);
    let compiled = run_compiled(input);
    assert_eq!(direct, compiled, "compiled program disagrees with source:\n{}", input);
}

// ============================================================================
// Structural queries
// ============================================================================

/// Number of nodes in all definitions matching `pred`
pub fn count_nodes(program: &Program, pred: impl Fn(&Expr) -> bool) -> usize {
    program
        .definitions
        .iter()
        .chain(program.main.iter())
        .map(|def| def.count(&pred))
        .sum()
}

/// True if every non-suspension abstraction and every definition has a
/// suspension as its body
pub fn bodies_are_suspended(expr: &Expr) -> bool {
    let is_suspension = |e: &Expr| matches!(e, Expr::Lam { params, .. } if params.is_empty());
    !expr.any(&|e| match e {
        Expr::Lam { params, body } if !params.is_empty() => !is_suspension(body.as_ref()),
        Expr::Define { body, .. } => !is_suspension(body.as_ref()),
        _ => false,
    })
}
