//! End-to-end checks of the four reference scenarios plus the shape of each
//! stage's output on small programs.

use trampc::ast::{Expr, IfForm, APPLY_K, TRAMPOLINE};
use trampc::codegen::Stage;
use trampc::eval::Value;
use trampc::test_support::{
    compile_source, compile_to, count_nodes, definition, run_compiled, run_direct, run_stage,
};
use trampc::{compile, emit_program, parse_program, CompileError, CompileOptions};

const COUNTDOWN: &str = r#"
(define (countdown n)
  (if (zero? n)
      0
      (countdown (sub1 n))))

(countdown 100000)
"#;

fn count_conts(program: &trampc::Program) -> usize {
    count_nodes(program, |e| matches!(e, Expr::Cont { .. }))
}

// ============================================================================
// Scenario 1: deep tail recursion
// ============================================================================

#[test]
fn countdown_100k_returns_terminal_value() {
    assert_eq!(run_compiled(COUNTDOWN).unwrap(), Value::Int(0));
}

#[test]
fn countdown_is_wrapped_in_a_driver() {
    let program = compile_source(COUNTDOWN).unwrap();
    let def = definition(&program, "countdown").unwrap();
    let Expr::Define { params, body, .. } = def else {
        panic!("expected a definition");
    };
    assert_eq!(params, &vec!["n".to_string()]);
    let Expr::LetFlag { body, .. } = body.as_ref() else {
        panic!("expected a completion flag, got {}", body);
    };
    let Expr::LetRec { body, .. } = body.as_ref() else {
        panic!("expected a worker group");
    };
    assert!(matches!(
        body.as_ref(),
        Expr::App { func, .. } if **func == Expr::var(TRAMPOLINE)
    ));
}

// ============================================================================
// Scenario 2: trivial test
// ============================================================================

#[test]
fn trivial_test_introduces_no_continuation() {
    let program = compile_to("(if #t 1 2)", Stage::Cps).unwrap();
    assert_eq!(count_conts(&program), 0);
    assert!(program.main.is_none());
    assert_eq!(run_compiled("(if #t 1 2)").unwrap(), Value::Int(1));
}

#[test]
fn trivial_test_keeps_converted_conditional() {
    let program = compile_to("(if #t 1 2)", Stage::Cps).unwrap();
    let converted = count_nodes(&program, |e| {
        matches!(e, Expr::If { form: IfForm::Converted, .. })
    });
    assert_eq!(converted, 1);
}

// ============================================================================
// Scenario 3: serious test
// ============================================================================

#[test]
fn serious_test_binds_exactly_one_variable() {
    let source = "(if (f 1) 10 20)\n(define (f x) (= x 1))";
    let program = compile_to(source, Stage::Cps).unwrap();
    assert_eq!(count_conts(&program), 1);
    assert_eq!(run_compiled(source).unwrap(), Value::Int(10));
}

#[test]
fn compound_primitive_test_is_bound_once() {
    let source = "(if (= (+ 1 2) 3) 10 20)";
    let program = compile_to(source, Stage::Cps).unwrap();
    assert_eq!(count_conts(&program), 1);
    assert_eq!(run_direct(source).unwrap(), Value::Int(10));
    assert_eq!(run_compiled(source).unwrap(), Value::Int(10));
}

// ============================================================================
// Scenario 4: unrecognized form
// ============================================================================

#[test]
fn unrecognized_form_is_malformed_and_produces_nothing() {
    let result = parse_program("(call/cc (lambda (k) (k 1)))")
        .and_then(|program| compile(program, &CompileOptions::default()));
    match result {
        Err(CompileError::MalformedExpression { stage, reason, .. }) => {
            assert_eq!(stage, Stage::Syntax);
            assert!(reason.contains("call/cc"), "reason: {}", reason);
        }
        other => panic!("expected a malformed expression, got {:?}", other),
    }
}

#[test]
fn stage_forms_are_not_accepted_as_source() {
    for source in ["(continue k 1)", "(let-flag (d) d)", "(continuation (x) x)"] {
        assert!(
            matches!(parse_program(source), Err(CompileError::MalformedExpression { .. })),
            "accepted {}",
            source
        );
    }
}

// ============================================================================
// Stage boundaries
// ============================================================================

#[test]
fn every_stage_preserves_the_answer() {
    let source = r#"
(define (fact n) (if (zero? n) 1 (* n (fact (sub1 n)))))
(fact 10)
"#;
    for stage in Stage::ALL {
        assert_eq!(
            run_stage(source, stage).unwrap(),
            Value::Int(3_628_800),
            "stage {}",
            stage
        );
    }
}

#[test]
fn abstraction_removes_continuation_nodes() {
    let source = "(define (f x) (add1 (g x)))\n(define (g y) (* y 2))\n(f 4)";
    assert!(count_conts(&compile_to(source, Stage::Cps).unwrap()) > 0);

    let abstracted = compile_to(source, Stage::Abstraction).unwrap();
    assert_eq!(count_conts(&abstracted), 0);
    assert_eq!(
        count_nodes(&abstracted, |e| matches!(e, Expr::ContApp { .. })),
        0
    );
    assert!(count_nodes(&abstracted, |e| *e == Expr::var(APPLY_K)) > 0);
}

#[test]
fn emitted_program_is_deterministic() {
    let first = emit_program(&compile_source(COUNTDOWN).unwrap());
    let second = emit_program(&compile_source(COUNTDOWN).unwrap());
    assert_eq!(first, second);
    assert!(first.contains("(trampoline "));
    // The entry takes the first fresh name
    assert!(first.contains("(define (main#0)"), "{}", first);
    assert!(first.contains("countdown#1"));
}

#[test]
fn fresh_counter_start_is_configurable() {
    let program = parse_program(COUNTDOWN).unwrap();
    let options = CompileOptions {
        first_fresh: 100,
        ..CompileOptions::default()
    };
    let text = emit_program(&compile(program, &options).unwrap());
    assert!(text.contains("main#100"), "{}", text);
    assert!(text.contains("countdown#101"));
    assert!(!text.contains("#0"));
}

// ============================================================================
// Evaluation order and output size
// ============================================================================

#[test]
fn runtime_error_order_survives_compilation() {
    let source = r#"
(define (f x) (+ 9223372036854775807 x))
(+ (/ 1 0) (f 1))
"#;
    let direct = run_direct(source).unwrap_err();
    assert!(direct.contains("division by zero"), "{}", direct);
    assert_eq!(run_compiled(source).unwrap_err(), direct);
}

#[test]
fn failing_operand_stops_a_diverging_call() {
    // The source fails before the loop starts; the compiled program must too
    let source = r#"
(define (spin n) (spin n))
(- (% 5 0) (spin 1))
"#;
    let direct = run_direct(source).unwrap_err();
    assert_eq!(run_compiled(source).unwrap_err(), direct);
}

#[test]
fn conditionals_as_operands_compile_to_linear_size() {
    let nodes = |n: usize| {
        let params: Vec<String> = (0..n).map(|i| format!("a{}", i)).collect();
        let ifs = vec!["(if (zero? x) 1 2)"; n].join(" ");
        let source = format!(
            "(define (h {}) 0)\n(define (g x) (h {}))",
            params.join(" "),
            ifs
        );
        count_nodes(&compile_source(&source).unwrap(), |_| true)
    };
    let (small, large) = (nodes(8), nodes(32));
    assert!(large <= 4 * small, "8 conditionals: {} nodes, 32: {} nodes", small, large);
}

#[test]
fn conditional_operands_keep_their_values() {
    let source = r#"
(define (h a b c) (+ a (+ (* 10 b) (* 100 c))))
(define (g x) (h (if (zero? x) 1 2) (if (< x 5) 3 4) (if (= x 7) 5 6)))
(g 7)
"#;
    assert_eq!(run_direct(source).unwrap(), Value::Int(2 + 40 + 500));
    assert_eq!(run_compiled(source).unwrap(), Value::Int(542));
}
