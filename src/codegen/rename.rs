//! Free-variable queries and renaming that respect shadowing

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{Expr, Name};

/// Rename free occurrences of the keys of `renames`.
///
/// A binder (abstraction parameter, continuation parameter, flag or local
/// function) hides the outer name for its whole scope.
pub fn rename_free(expr: Expr, renames: &BTreeMap<Name, Name>) -> Expr {
    if renames.is_empty() {
        return expr;
    }
    match expr {
        Expr::Var(name) => match renames.get(&name) {
            Some(new) => Expr::Var(new.clone()),
            None => Expr::Var(name),
        },
        Expr::Lam { params, body } => {
            let inner = without(renames, params.iter());
            Expr::Lam {
                body: Box::new(rename_free(*body, &inner)),
                params,
            }
        }
        Expr::Define { name, params, body } => {
            let inner = without(renames, params.iter());
            Expr::Define {
                body: Box::new(rename_free(*body, &inner)),
                name,
                params,
            }
        }
        Expr::Cont { param, body } => {
            let inner = without(renames, std::iter::once(&param));
            Expr::Cont {
                body: Box::new(rename_free(*body, &inner)),
                param,
            }
        }
        Expr::LetFlag { flag, body } => {
            let inner = without(renames, std::iter::once(&flag));
            Expr::LetFlag {
                body: Box::new(rename_free(*body, &inner)),
                flag,
            }
        }
        Expr::LetRec { bindings, body } => {
            let inner = without(renames, bindings.iter().map(|(name, _)| name));
            Expr::LetRec {
                bindings: bindings
                    .into_iter()
                    .map(|(name, value)| (name, rename_free(value, &inner)))
                    .collect(),
                body: Box::new(rename_free(*body, &inner)),
            }
        }
        other => other.map_children(|child| rename_free(child, renames)),
    }
}

fn without<'a, 'n>(
    renames: &'a BTreeMap<Name, Name>,
    bound: impl Iterator<Item = &'n Name>,
) -> Cow<'a, BTreeMap<Name, Name>> {
    let mut result = Cow::Borrowed(renames);
    for name in bound {
        if result.contains_key(name) {
            result.to_mut().remove(name);
        }
    }
    result
}

/// Variables referenced but not bound inside `expr`
pub fn free_vars(expr: &Expr) -> BTreeSet<Name> {
    let mut free = BTreeSet::new();
    collect_free(expr, &mut Vec::new(), &mut free);
    free
}

fn collect_free<'e>(expr: &'e Expr, bound: &mut Vec<&'e str>, free: &mut BTreeSet<Name>) {
    let scoped: Vec<&'e str> = match expr {
        Expr::Var(name) => {
            if !bound.contains(&name.as_str()) {
                free.insert(name.clone());
            }
            return;
        }
        Expr::Lam { params, .. } | Expr::Define { params, .. } => {
            params.iter().map(String::as_str).collect()
        }
        Expr::Cont { param, .. } => vec![param.as_str()],
        Expr::LetFlag { flag, .. } => vec![flag.as_str()],
        Expr::LetRec { bindings, .. } => bindings.iter().map(|(name, _)| name.as_str()).collect(),
        _ => vec![],
    };

    let depth = bound.len();
    bound.extend(scoped);
    for child in expr.children() {
        collect_free(child, bound, free);
    }
    bound.truncate(depth);
}
