//! CPS Transformation Pass
//!
//! Rewrites every serious computation so that it delivers its result to an
//! explicit continuation. Trivial computations stay in direct style and are
//! passed inline.
//!
//! ## Transformation Rules
//!
//! 1. Definition: add continuation parameter
//!    `define f(x, y) = body` → `define f(x, y, k) = [[body]]_k`
//!    with `f` (and every sibling definition) renamed to its worker first
//!
//! 2. Trivial expression in tail position: resume the continuation
//!    `v` → `continue k v`
//!
//! 3. Conditional with an atomic test: convert both branches under `k`
//!    `if t a b` → `if t [[a]]_k [[b]]_k`
//!
//! 4. Conditional with any other test: evaluate the test once, then dispatch
//!    `if e a b` → `[[e]]_{continuation s -> if s [[a]]_k [[b]]_k}`
//!
//! 5. Application: bind serious operator/operands left to right, append `k`
//!    `f (g x) y` → `[[g x]]_{continuation s -> f s y k}`
//!
//! 6. Abstraction: add continuation parameter
//!    `lambda (x) body` → `lambda (x k) [[body]]_k`

use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::rename::rename_free;
use super::{CompileError, Stage};
use crate::ast::{Expr, IfForm, Name, NameGen, Program, Shape};

/// Is `expr` a value (or computes one without needing a continuation)?
///
/// Total over every node kind.
pub fn is_trivial(expr: &Expr) -> bool {
    match expr {
        Expr::Lit(_) | Expr::Var(_) | Expr::Lam { .. } | Expr::Cont { .. } => true,
        Expr::Op { args, .. } => args.iter().all(is_trivial),
        Expr::If { form, .. } => matches!(form, IfForm::Trivial | IfForm::Converted),
        Expr::App { .. }
        | Expr::ContApp { .. }
        | Expr::Define { .. }
        | Expr::LetFlag { .. }
        | Expr::LetRec { .. } => false,
    }
}

/// Trivial expressions whose evaluation cannot raise a runtime error
fn is_inert(expr: &Expr) -> bool {
    matches!(expr, Expr::Lit(_) | Expr::Var(_) | Expr::Lam { .. })
}

/// CPS transformation context
pub struct CpsConverter<'a> {
    /// Fresh continuation and result variables
    names: &'a mut NameGen,
}

impl<'a> CpsConverter<'a> {
    pub fn new(names: &'a mut NameGen) -> Self {
        Self { names }
    }

    /// Transform a whole program.
    ///
    /// A top-level expression becomes a nullary definition recorded as the
    /// program's entry. Every definition is assigned a fresh worker name that
    /// all references inside definition bodies are renamed to.
    pub fn convert_program(&mut self, program: Program) -> Result<Program, CompileError> {
        let Program {
            mut definitions,
            main,
            entry,
            ..
        } = program;

        let entry = match main {
            Some(main) => {
                let name = self.names.fresh("main");
                definitions.push(Expr::define(name.clone(), vec![], main));
                Some(name)
            }
            None => entry,
        };

        let mut workers = BTreeMap::new();
        for def in &definitions {
            let Expr::Define { name, .. } = def else {
                return Err(CompileError::malformed(
                    Stage::Cps,
                    "expected a top-level definition",
                    def,
                ));
            };
            let worker = self.names.fresh(name);
            if workers.insert(name.clone(), worker).is_some() {
                return Err(CompileError::malformed(Stage::Cps, "duplicate definition", def));
            }
        }

        let definitions = definitions
            .into_iter()
            .map(|def| self.convert_definition(def, &workers))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Program {
            definitions,
            main: None,
            entry,
            workers,
        })
    }

    /// Transform one definition, renaming references to `workers` first.
    pub fn convert_definition(
        &mut self,
        def: Expr,
        workers: &BTreeMap<Name, Name>,
    ) -> Result<Expr, CompileError> {
        let (name, mut params, body) = match def {
            Expr::Define { name, params, body } => (name, params, body),
            other => {
                return Err(CompileError::malformed(Stage::Cps, "expected a definition", &other))
            }
        };

        // Parameters shadow definitions of the same name
        let visible: BTreeMap<Name, Name> = workers
            .iter()
            .filter(|(public, _)| !params.contains(public))
            .map(|(public, worker)| (public.clone(), worker.clone()))
            .collect();
        let body = rename_free(*body, &visible);

        let k = self.names.fresh("k");
        let body = self.convert(body, Expr::Var(k.clone()))?;
        params.push(k);

        debug!(target: "trampc::cps", definition = %name, arity = params.len(), "converted definition");
        Ok(Expr::Define {
            name,
            params,
            body: Box::new(body),
        })
    }

    /// Transform `expr` so its value is delivered to `k`, a variable or a
    /// continuation.
    pub fn convert(&mut self, expr: Expr, k: Expr) -> Result<Expr, CompileError> {
        if is_trivial(&expr) {
            return Ok(Expr::ContApp {
                cont: Box::new(k),
                arg: Box::new(self.convert_trivial(expr)?),
            });
        }

        match expr {
            Expr::If {
                test,
                then_branch,
                else_branch,
                ..
            } => {
                // Both branches resume `k`; a continuation is bound to a join
                // variable first so it is not copied into each branch
                if let Expr::Cont { .. } = k {
                    let j = self.names.fresh("j");
                    trace!(target: "trampc::cps", var = %j, "binding join continuation");
                    let dispatch = Expr::If {
                        form: IfForm::Serious,
                        test,
                        then_branch,
                        else_branch,
                    };
                    let body = self.convert(dispatch, Expr::Var(j.clone()))?;
                    return Ok(Expr::ContApp {
                        cont: Box::new(Expr::Cont {
                            param: j,
                            body: Box::new(body),
                        }),
                        arg: Box::new(k),
                    });
                }

                let then_branch = Box::new(self.convert(*then_branch, k.clone())?);
                let else_branch = Box::new(self.convert(*else_branch, k)?);

                if test.is_atomic() {
                    return Ok(Expr::If {
                        form: IfForm::Converted,
                        test: Box::new(self.convert_trivial(*test)?),
                        then_branch,
                        else_branch,
                    });
                }

                // Evaluate the test exactly once, then dispatch on its value
                let s = self.names.fresh("s");
                trace!(target: "trampc::cps", var = %s, "binding serious test");
                let dispatch = Expr::If {
                    form: IfForm::Converted,
                    test: Box::new(Expr::Var(s.clone())),
                    then_branch,
                    else_branch,
                };
                self.convert(
                    *test,
                    Expr::Cont {
                        param: s,
                        body: Box::new(dispatch),
                    },
                )
            }

            Expr::App { func, args } => {
                let mut parts = Vec::with_capacity(args.len() + 1);
                parts.push(*func);
                parts.extend(args);
                self.sequence(parts, move |mut values| {
                    let func = values.remove(0);
                    values.push(k);
                    Expr::app(func, values)
                })
            }

            Expr::Op { op, args } => self.sequence(args, move |values| Expr::ContApp {
                cont: Box::new(k),
                arg: Box::new(Expr::op(op, values)),
            }),

            Expr::Define { .. } => Err(CompileError::malformed(
                Stage::Cps,
                "definition below top level",
                &expr,
            )),
            Expr::ContApp { .. } | Expr::LetFlag { .. } | Expr::LetRec { .. } => Err(
                CompileError::malformed(Stage::Cps, "form not valid in source programs", &expr),
            ),

            Expr::Lit(_) | Expr::Var(_) | Expr::Lam { .. } | Expr::Cont { .. } => Err(
                CompileError::invariant(Stage::Cps, "trivial expression reached serious conversion", &expr),
            ),
        }
    }

    /// Transform a trivial expression in place. Only abstractions change
    /// shape; a trivial conditional becomes a converted one.
    pub fn convert_trivial(&mut self, expr: Expr) -> Result<Expr, CompileError> {
        match expr {
            Expr::Lam { mut params, body } => {
                let k = self.names.fresh("k");
                let body = self.convert(*body, Expr::Var(k.clone()))?;
                params.push(k);
                Ok(Expr::lam(params, body))
            }

            Expr::Lit(_) | Expr::Var(_) | Expr::Op { .. } => {
                expr.walk(|child| self.convert_trivial_child(child), |shape, children| {
                    Ok(shape.rebuild(children))
                })
            }

            Expr::If {
                form: IfForm::Trivial | IfForm::Converted,
                ..
            } => expr.walk(|child| self.convert_trivial_child(child), |shape, children| {
                Ok(match shape {
                    Shape::If(_) => Shape::If(IfForm::Converted).rebuild(children),
                    shape => shape.rebuild(children),
                })
            }),

            Expr::If { .. } | Expr::App { .. } | Expr::ContApp { .. } => Err(CompileError::invariant(
                Stage::Cps,
                "serious expression in trivial position",
                &expr,
            )),

            Expr::Define { .. } => Err(CompileError::malformed(
                Stage::Cps,
                "definition below top level",
                &expr,
            )),
            Expr::Cont { .. } | Expr::LetFlag { .. } | Expr::LetRec { .. } => Err(
                CompileError::malformed(Stage::Cps, "form not valid in source programs", &expr),
            ),
        }
    }

    fn convert_trivial_child(&mut self, child: Expr) -> Result<Expr, CompileError> {
        if !is_trivial(&child) {
            return Err(CompileError::invariant(
                Stage::Cps,
                "trivial expression with a serious operand",
                &child,
            ));
        }
        self.convert_trivial(child)
    }

    /// Convert `parts` left to right. Each serious part is evaluated first and
    /// bound to a fresh variable by a continuation wrapping the rest. Trivial
    /// parts are passed inline unless they can fail and a serious part follows
    /// them; those are bound too so runtime errors keep source order.
    /// `build` receives the resulting values.
    fn sequence(
        &mut self,
        parts: Vec<Expr>,
        build: impl FnOnce(Vec<Expr>) -> Expr,
    ) -> Result<Expr, CompileError> {
        let last_serious = parts.iter().rposition(|part| !is_trivial(part));
        let mut values = Vec::with_capacity(parts.len());
        let mut pending = Vec::new();

        for (i, part) in parts.into_iter().enumerate() {
            let ordered = last_serious.is_some_and(|last| i < last) && !is_inert(&part);
            if is_trivial(&part) && !ordered {
                values.push(self.convert_trivial(part)?);
            } else {
                let s = self.names.fresh("s");
                values.push(Expr::Var(s.clone()));
                pending.push((s, part));
            }
        }

        let mut result = build(values);
        for (s, part) in pending.into_iter().rev() {
            result = self.convert(
                part,
                Expr::Cont {
                    param: s,
                    body: Box::new(result),
                },
            )?;
        }
        Ok(result)
    }
}

/// Transform a program to continuation-passing style
pub fn cps_transform(program: Program, names: &mut NameGen) -> Result<Program, CompileError> {
    CpsConverter::new(names).convert_program(program)
}
