//! Property-based tests for the compiler pipeline
//!
//! Programs are generated as source text over a fixed set of helper
//! definitions, so every generated program is closed and well typed. The
//! properties checked are:
//! - The trampolined program computes what the source computes
//! - Every intermediate stage computes the same answer
//! - Continuation abstraction is idempotent
//! - Thunkified bodies are always suspended
//! - Compilation is deterministic
//! - Output size stays linear in the number of conditional operands

use proptest::prelude::*;

use trampc::ast::Expr;
use trampc::codegen::abstraction::abstract_continuations;
use trampc::codegen::{is_trivial, Stage};
use trampc::test_support::{
    bodies_are_suspended, compile_source, compile_to, parse_program, run_compiled, run_direct,
    run_stage,
};

const PRELUDE: &str = r#"
(define (double n) (* 2 n))
(define (sum n) (if (zero? n) 0 (+ n (sum (sub1 n)))))
(define (twice f x) (f (f x)))
(define (count-to i n) (if (>= i n) i (count-to (add1 i) n)))
(define (pick c a b) (if c a b))
"#;

fn with_prelude(main: &str) -> String {
    format!("{}\n{}", PRELUDE, main)
}

/// Boolean expressions over integer subterms
fn bool_expr(int: BoxedStrategy<String>) -> impl Strategy<Value = String> {
    prop_oneof![
        Just("#t".to_string()),
        Just("#f".to_string()),
        (int.clone(), int.clone()).prop_map(|(a, b)| format!("(< {} {})", a, b)),
        (int.clone(), int.clone()).prop_map(|(a, b)| format!("(= {} {})", a, b)),
        int.clone().prop_map(|a| format!("(zero? {})", a)),
        int.prop_map(|a| format!("(not (zero? {}))", a)),
    ]
}

/// Integer expressions mixing primitives, conditionals, calls to the
/// prelude, and immediately applied lambdas. Division, remainder and a
/// large literal make runtime errors possible in any operand position.
fn int_expr() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![
        8 => (-20i64..20).prop_map(|n| n.to_string()),
        1 => Just(i64::MAX.to_string()),
    ];
    leaf.prop_recursive(4, 48, 3, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("(+ {} {})", a, b)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("(- {} {})", a, b)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("(* {} {})", a, b)),
            (inner.clone(), -2i64..3).prop_map(|(a, d)| format!("(/ {} {})", a, d)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("(% {} {})", a, b)),
            (inner.clone(), -1i64..2, inner.clone())
                .prop_map(|(a, d, b)| format!("(+ (/ {} {}) (double {}))", a, d, b)),
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| format!("(- (% {} {}) (sum 3))", a, b)),
            inner.clone().prop_map(|a| format!("(add1 {})", a)),
            inner.clone().prop_map(|a| format!("(sub1 {})", a)),
            (bool_expr(inner.clone()), inner.clone(), inner.clone())
                .prop_map(|(t, a, b)| format!("(if {} {} {})", t, a, b)),
            (bool_expr(inner.clone()), inner.clone(), inner.clone())
                .prop_map(|(t, a, b)| format!("(pick {} {} {})", t, a, b)),
            inner.clone().prop_map(|a| format!("(double {})", a)),
            (0i64..40).prop_map(|n| format!("(sum {})", n)),
            (inner.clone(), 0i64..200).prop_map(|(a, n)| format!("(+ {} (count-to 0 {}))", a, n)),
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| format!("((lambda (y) (- y {})) {})", a, b)),
            inner.clone().prop_map(|a| format!("(twice (lambda (z) (add1 z)) {})", a)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| {
                format!("(twice (lambda (z) (* z {})) {})", a, b)
            }),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn compiled_program_agrees_with_source(main in int_expr()) {
        let source = with_prelude(&main);
        prop_assert_eq!(run_direct(&source), run_compiled(&source), "source: {}", main);
    }

    #[test]
    fn every_stage_agrees_with_source(main in int_expr()) {
        let source = with_prelude(&main);
        let expected = run_direct(&source);
        for stage in Stage::ALL {
            prop_assert_eq!(&run_stage(&source, stage), &expected, "stage {}: {}", stage, main);
        }
    }

    #[test]
    fn abstraction_is_idempotent(main in int_expr()) {
        let once = compile_to(&with_prelude(&main), Stage::Abstraction).unwrap();
        let twice = abstract_continuations(once.clone()).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn thunkified_bodies_are_suspended(main in int_expr()) {
        let program = compile_to(&with_prelude(&main), Stage::Thunk).unwrap();
        for def in &program.definitions {
            prop_assert!(bodies_are_suspended(def), "unsuspended body in {}", def);
        }
    }

    #[test]
    fn compilation_is_deterministic(main in int_expr()) {
        let source = with_prelude(&main);
        prop_assert_eq!(compile_source(&source).unwrap(), compile_source(&source).unwrap());
    }

    #[test]
    fn trivial_classification_is_total(main in int_expr()) {
        // Every node of every stage's tree can be classified
        for stage in Stage::ALL {
            let program = compile_to(&with_prelude(&main), stage).unwrap();
            for def in program.definitions.iter().chain(program.main.iter()) {
                let apps = def.count(&|e: &Expr| matches!(e, Expr::App { .. }));
                let serious = def.count(&|e: &Expr| !is_trivial(e));
                prop_assert!(serious >= apps);
            }
        }
    }
}

#[test]
fn generated_programs_parse() {
    let program = parse_program(&with_prelude("(twice (lambda (z) (add1 z)) 3)")).unwrap();
    assert_eq!(program.definitions.len(), 5);
    assert!(program.main.is_some());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn conditional_operands_do_not_blow_up_output(n in 1usize..24) {
        let size = |count: usize| {
            let params: Vec<String> = (0..count).map(|i| format!("a{}", i)).collect();
            let args = vec!["(if (zero? x) 1 2)"; count].join(" ");
            let source = format!(
                "(define (h {}) 0)\n(define (g x) (h {}))",
                params.join(" "),
                args
            );
            compile_source(&source)
                .unwrap()
                .definitions
                .iter()
                .map(|d| d.count(&|_: &Expr| true))
                .sum::<usize>()
        };
        prop_assert!(size(2 * n) <= 2 * size(n) + 1, "{} vs {}", size(2 * n), size(n));
    }
}
