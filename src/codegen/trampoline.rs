//! Trampoline insertion
//!
//! Turns each thunkified CPS definition back into a value-returning entry
//! point:
//!
//! ```text
//! (define (f x)
//!   (let-flag (done)
//!     (letrec ((f#0 (lambda (x k) (lambda () ...)))
//!              (g#1 (lambda (y k) (lambda () ...))))
//!       (trampoline (f#0 x (final-k done)) done))))
//! ```
//!
//! The worker group holds every worker the definition can reach, so tail
//! calls between definitions stay inside one driver loop. Each activation of
//! the entry point allocates its own flag.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use super::rename::free_vars;
use super::thunk::is_suspension;
use super::{CompileError, Stage};
use crate::ast::{Expr, Name, NameGen, Program, FINAL_K, TRAMPOLINE};

/// A thunkified definition split into what the rewrite needs
struct Worker {
    public: Name,
    worker: Name,
    params: Vec<Name>,
    lam: Expr,
    calls: BTreeSet<Name>,
}

pub fn insert_trampolines(program: Program, names: &mut NameGen) -> Result<Program, CompileError> {
    let Program {
        definitions,
        main,
        entry,
        workers,
    } = program;

    if let Some(main) = main {
        return Err(CompileError::invariant(
            Stage::Trampoline,
            "top-level expression was not converted to an entry definition",
            &main,
        ));
    }

    let worker_names: BTreeSet<&Name> = workers.values().collect();
    let mut group = Vec::with_capacity(definitions.len());
    for def in definitions {
        group.push(split_definition(def, &workers, &worker_names)?);
    }

    let by_worker: BTreeMap<&str, usize> = group
        .iter()
        .enumerate()
        .map(|(idx, w)| (w.worker.as_str(), idx))
        .collect();

    let mut definitions = Vec::with_capacity(group.len());
    for (idx, def) in group.iter().enumerate() {
        let reachable = reachable_from(idx, &group, &by_worker);
        let bindings = reachable
            .iter()
            .map(|&i| (group[i].worker.clone(), group[i].lam.clone()))
            .collect::<Vec<_>>();

        let done = names.fresh("done");
        debug!(
            target: "trampc::trampoline",
            definition = %def.public,
            worker = %def.worker,
            group = bindings.len(),
            flag = %done,
            "inserted trampoline"
        );

        let mut call_args: Vec<Expr> = def.params.iter().cloned().map(Expr::Var).collect();
        call_args.push(Expr::app(Expr::var(FINAL_K), vec![Expr::Var(done.clone())]));
        let drive = Expr::app(
            Expr::var(TRAMPOLINE),
            vec![
                Expr::app(Expr::Var(def.worker.clone()), call_args),
                Expr::Var(done.clone()),
            ],
        );

        definitions.push(Expr::Define {
            name: def.public.clone(),
            params: def.params.clone(),
            body: Box::new(Expr::LetFlag {
                flag: done,
                body: Box::new(Expr::LetRec {
                    bindings,
                    body: Box::new(drive),
                }),
            }),
        });
    }

    Ok(Program {
        definitions,
        main: None,
        entry,
        workers,
    })
}

fn split_definition(
    def: Expr,
    workers: &BTreeMap<Name, Name>,
    worker_names: &BTreeSet<&Name>,
) -> Result<Worker, CompileError> {
    if def.any(&|e| matches!(e, Expr::Cont { .. } | Expr::ContApp { .. })) {
        return Err(CompileError::invariant(
            Stage::Trampoline,
            "continuation survived abstraction",
            &def,
        ));
    }

    let (name, mut params, body) = match def {
        Expr::Define { name, params, body } => (name, params, body),
        other => {
            return Err(CompileError::malformed(
                Stage::Trampoline,
                "expected a top-level definition",
                &other,
            ))
        }
    };

    if !is_suspension(&body) {
        return Err(CompileError::invariant(
            Stage::Trampoline,
            "definition body is not a suspension",
            &body,
        ));
    }
    let Some(worker) = workers.get(&name).cloned() else {
        return Err(CompileError::invariant(
            Stage::Trampoline,
            format!("no worker recorded for `{}`", name),
            &body,
        ));
    };

    let lam = Expr::Lam {
        params: params.clone(),
        body,
    };
    if params.pop().is_none() {
        return Err(CompileError::invariant(
            Stage::Trampoline,
            "definition has no continuation parameter",
            &lam,
        ));
    }

    let calls = free_vars(&lam)
        .into_iter()
        .filter(|var| worker_names.contains(var))
        .collect();

    Ok(Worker {
        public: name,
        worker,
        params,
        lam,
        calls,
    })
}

/// Indices of every worker reachable from `start`, in program order
fn reachable_from(start: usize, group: &[Worker], by_worker: &BTreeMap<&str, usize>) -> Vec<usize> {
    let mut seen = BTreeSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(idx) = queue.pop_front() {
        for callee in &group[idx].calls {
            if let Some(&next) = by_worker.get(callee.as_str()) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }
    seen.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::APPLY_K;
    use crate::codegen::thunk::suspend;

    fn thunked(name: &str, params: &[&str], body: Expr) -> Expr {
        Expr::define(
            name,
            params.iter().map(|p| p.to_string()).collect(),
            suspend(body),
        )
    }

    fn program(definitions: Vec<Expr>, workers: &[(&str, &str)]) -> Program {
        Program {
            definitions,
            workers: workers
                .iter()
                .map(|(p, w)| (p.to_string(), w.to_string()))
                .collect(),
            ..Program::default()
        }
    }

    fn group_names(def: &Expr) -> Vec<Name> {
        let mut names = Vec::new();
        if let Expr::Define { body, .. } = def {
            if let Expr::LetFlag { body, .. } = body.as_ref() {
                if let Expr::LetRec { bindings, .. } = body.as_ref() {
                    names = bindings.iter().map(|(n, _)| n.clone()).collect();
                }
            }
        }
        names
    }

    #[test]
    fn test_wraps_definition_in_flag_and_driver() {
        let def = thunked(
            "id",
            &["x", "k#1"],
            Expr::app(Expr::var(APPLY_K), vec![Expr::var("k#1"), Expr::var("x")]),
        );
        let out = insert_trampolines(program(vec![def], &[("id", "id#0")]), &mut NameGen::starting_at(2)).unwrap();

        let expected = Expr::define(
            "id",
            vec!["x".into()],
            Expr::LetFlag {
                flag: "done#2".into(),
                body: Box::new(Expr::LetRec {
                    bindings: vec![(
                        "id#0".into(),
                        Expr::lam(
                            vec!["x".into(), "k#1".into()],
                            suspend(Expr::app(
                                Expr::var(APPLY_K),
                                vec![Expr::var("k#1"), Expr::var("x")],
                            )),
                        ),
                    )],
                    body: Box::new(Expr::app(
                        Expr::var(TRAMPOLINE),
                        vec![
                            Expr::app(
                                Expr::var("id#0"),
                                vec![
                                    Expr::var("x"),
                                    Expr::app(Expr::var(FINAL_K), vec![Expr::var("done#2")]),
                                ],
                            ),
                            Expr::var("done#2"),
                        ],
                    )),
                }),
            },
        );
        assert_eq!(out.definitions, vec![expected]);
    }

    #[test]
    fn test_group_contains_reachable_workers_only() {
        let even = thunked(
            "even?",
            &["n", "k"],
            Expr::app(Expr::var("odd?#1"), vec![Expr::var("n"), Expr::var("k")]),
        );
        let odd = thunked(
            "odd?",
            &["n", "k"],
            Expr::app(Expr::var("even?#0"), vec![Expr::var("n"), Expr::var("k")]),
        );
        let other = thunked(
            "main",
            &["k"],
            Expr::app(Expr::var("even?#0"), vec![Expr::int(4), Expr::var("k")]),
        );
        let out = insert_trampolines(
            program(
                vec![even, odd, other],
                &[("even?", "even?#0"), ("odd?", "odd?#1"), ("main", "main#2")],
            ),
            &mut NameGen::starting_at(10),
        )
        .unwrap();

        assert_eq!(group_names(&out.definitions[0]), vec!["even?#0", "odd?#1"]);
        assert_eq!(group_names(&out.definitions[1]), vec!["even?#0", "odd?#1"]);
        assert_eq!(
            group_names(&out.definitions[2]),
            vec!["even?#0", "odd?#1", "main#2"]
        );
    }

    #[test]
    fn test_flags_are_distinct_per_definition() {
        let defs = vec![
            thunked("a", &["k"], Expr::int(1)),
            thunked("b", &["k"], Expr::int(2)),
        ];
        let out = insert_trampolines(program(defs, &[("a", "a#0"), ("b", "b#1")]), &mut NameGen::new()).unwrap();
        let flags: Vec<_> = out
            .definitions
            .iter()
            .filter_map(|d| match d {
                Expr::Define { body, .. } => match body.as_ref() {
                    Expr::LetFlag { flag, .. } => Some(flag.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec!["done#0", "done#1"]);
    }

    #[test]
    fn test_unsuspended_body_is_rejected() {
        let def = Expr::define("f", vec!["k".into()], Expr::int(1));
        let err = insert_trampolines(program(vec![def], &[("f", "f#0")]), &mut NameGen::new()).unwrap_err();
        assert!(matches!(
            err,
            CompileError::InvariantViolation {
                stage: Stage::Trampoline,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_worker_is_rejected() {
        let def = thunked("f", &["k"], Expr::int(1));
        let err = insert_trampolines(program(vec![def], &[]), &mut NameGen::new()).unwrap_err();
        assert!(err.to_string().contains("no worker recorded for `f`"));
    }
}
