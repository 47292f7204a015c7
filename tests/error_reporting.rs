//! Diagnostics as the user sees them: formatted reports from the library
//! and exit codes and output from the `trampc` binary.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use trampc::errors::{format_compile_error, format_eval_error, ErrorConfig};
use trampc::eval::{EvalError, Interpreter};
use trampc::{compile, parse_program, CompileError, CompileOptions};

fn plain() -> ErrorConfig {
    ErrorConfig::new(false)
}

fn compile_report(source: &str) -> String {
    let err = parse_program(source)
        .and_then(|program| compile(program, &CompileOptions::default()))
        .unwrap_err();
    format_compile_error(&err, source, &plain())
}

// ============================================================================
// Library reports
// ============================================================================

#[test]
fn lex_error_points_at_character() {
    let report = compile_report("(+ 1 \"two\")");
    assert!(report.starts_with("-- SYNTAX ERROR"), "{}", report);
    assert!(report.contains("<input>:1:6"), "{}", report);
    assert!(report.contains("unexpected character"));
}

#[test]
fn unbalanced_input_reports_end_of_file() {
    let report = compile_report("(define (f x)\n  (+ x 1)");
    assert!(report.starts_with("-- SYNTAX ERROR"), "{}", report);
    assert!(report.contains("unexpected end of file"), "{}", report);
}

#[test]
fn mismatched_delimiter_is_reported() {
    let err = parse_program("(add1 1]").unwrap_err();
    assert!(matches!(err, CompileError::Parse(_)));
    assert!(err.to_string().contains("mismatched delimiter"));
}

#[test]
fn unsupported_form_shows_snippet() {
    let source = "(define (f n)\n  (begin n))";
    let report = compile_report(source);
    assert!(report.starts_with("-- MALFORMED EXPRESSION"), "{}", report);
    assert!(report.contains("2 |   (begin n))"), "{}", report);
    assert!(report.contains("begin"));
}

#[test]
fn reserved_runtime_names_cannot_be_bound() {
    let report = compile_report("(define (trampoline x) x)");
    assert!(report.contains("reserved"), "{}", report);
}

#[test]
fn filename_appears_in_location() {
    let source = "(if 1)";
    let err = parse_program(source).unwrap_err();
    let report = format_compile_error(&err, source, &plain().with_filename("prog.scm"));
    assert!(report.contains("prog.scm:1:1"), "{}", report);
}

#[test]
fn unbound_name_suggests_definition() {
    let program = compile(
        parse_program("(define (countdown n) (if (zero? n) 0 (countdown (sub1 n))))\n(countdwn 3)")
            .unwrap(),
        &CompileOptions::default(),
    )
    .unwrap();
    let mut interp = Interpreter::new();
    let err = interp.run_program(&program).unwrap_err();
    assert_eq!(err, EvalError::UnboundVariable("countdwn".into()));

    let report = format_eval_error(&err, ["countdown", "main"], &plain());
    assert!(report.starts_with("-- RUNTIME ERROR"));
    assert!(report.contains("Did you mean countdown?"), "{}", report);
}

#[test]
fn type_errors_survive_compilation() {
    let source = "(if 3 1 2)";
    let program = compile(parse_program(source).unwrap(), &CompileOptions::default()).unwrap();
    let err = Interpreter::new().run_program(&program).unwrap_err();
    assert!(matches!(err, EvalError::TypeError(_)), "{:?}", err);
}

// ============================================================================
// Binary
// ============================================================================

fn write_source(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("trampc-tests-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn trampc(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_trampc"))
        .args(args)
        .env("TRAMPC_LOG", "off")
        .output()
        .unwrap()
}

#[test]
fn binary_emits_trampolined_program() {
    let path = write_source(
        "emit.scm",
        "(define (loop n) (if (zero? n) 0 (loop (sub1 n))))\n(loop 5)\n",
    );
    let out = trampc(&[path.to_str().unwrap()]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("(trampoline "), "{}", stdout);
    assert!(stdout.contains("let-flag"), "{}", stdout);
}

#[test]
fn binary_runs_program() {
    let path = write_source(
        "run.scm",
        "(define (loop n acc) (if (zero? n) acc (loop (sub1 n) (+ acc 2))))\n(loop 50000 0)\n",
    );
    let out = trampc(&["--run", path.to_str().unwrap()]);
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "100000");
}

#[test]
fn binary_stops_after_requested_stage() {
    let path = write_source("stage.scm", "(define (f x) (add1 (f x)))\n");
    let out = trampc(&["--emit", "cps", path.to_str().unwrap()]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("continue"), "{}", stdout);
    assert!(!stdout.contains("trampoline"), "{}", stdout);
}

#[test]
fn binary_check_prints_nothing_on_success() {
    let path = write_source("check.scm", "(define (id x) x)\n(id 1)\n");
    let out = trampc(&["--check", path.to_str().unwrap()]);
    assert!(out.status.success());
    assert!(out.stdout.is_empty());
}

#[test]
fn binary_fails_on_malformed_input() {
    let path = write_source("bad.scm", "(let ((x 1)) x)\n");
    let out = trampc(&["--no-color", path.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(out.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("MALFORMED EXPRESSION"), "{}", stderr);
    assert!(stderr.contains("bad.scm:1:1"), "{}", stderr);
}

#[test]
fn binary_reports_missing_file() {
    let out = trampc(&["/nonexistent/trampc/input.scm"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("cannot read"));
}
