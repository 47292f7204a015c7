//! Rendering trees back to s-expression source
//!
//! `Display` gives a single line; `pretty` breaks forms that do not fit in
//! [`WIDTH`] columns. Output of any stage can be read back by the parser
//! except for the stage-only forms (`continuation`, `continue`, `let-flag`,
//! `letrec`) and fresh names, which the reader rejects.

use std::fmt;

use crate::ast::{Expr, Literal, Name, Program};

pub const WIDTH: usize = 80;

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(true) => write!(f, "#t"),
            Literal::Bool(false) => write!(f, "#f"),
            Literal::Int(n) => write!(f, "{}", n),
        }
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Lit(lit) => write!(f, "{}", lit),
            Expr::Var(name) => write!(f, "{}", name),
            Expr::Op { op, args } => {
                write!(f, "({}", op)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                write!(f, ")")
            }
            Expr::If {
                test,
                then_branch,
                else_branch,
                ..
            } => write!(f, "(if {} {} {})", test, then_branch, else_branch),
            Expr::Lam { params, body } => {
                write!(f, "(lambda (")?;
                write_list(f, params)?;
                write!(f, ") {})", body)
            }
            Expr::Define { name, params, body } => {
                write!(f, "(define ({}", name)?;
                for param in params {
                    write!(f, " {}", param)?;
                }
                write!(f, ") {})", body)
            }
            Expr::Cont { param, body } => write!(f, "(continuation ({}) {})", param, body),
            Expr::ContApp { cont, arg } => write!(f, "(continue {} {})", cont, arg),
            Expr::App { func, args } => {
                write!(f, "({}", func)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                write!(f, ")")
            }
            Expr::LetFlag { flag, body } => write!(f, "(let-flag ({}) {})", flag, body),
            Expr::LetRec { bindings, body } => {
                write!(f, "(letrec (")?;
                for (i, (name, value)) in bindings.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "({} {})", name, value)?;
                }
                write!(f, ") {})", body)
            }
        }
    }
}

impl Expr {
    /// Render with line breaks, assuming the first line starts at `indent`
    /// levels of two spaces.
    pub fn pretty(&self, indent: usize) -> String {
        let flat = self.to_string();
        if indent * 2 + flat.len() <= WIDTH {
            return flat;
        }

        let pad = "  ".repeat(indent + 1);
        match self {
            Expr::Lit(_) | Expr::Var(_) => flat,
            Expr::Op { op, args } => broken(&op.to_string(), args, indent),
            Expr::App { func, args } => broken(&func.pretty(indent + 1), args, indent),
            Expr::If {
                test,
                then_branch,
                else_branch,
                ..
            } => format!(
                "(if {}\n{}{}\n{}{})",
                test.pretty(indent + 2),
                pad,
                then_branch.pretty(indent + 1),
                pad,
                else_branch.pretty(indent + 1)
            ),
            Expr::Lam { params, body } => format!(
                "(lambda ({})\n{}{})",
                params.join(" "),
                pad,
                body.pretty(indent + 1)
            ),
            Expr::Define { name, params, body } => format!(
                "(define ({})\n{}{})",
                header(name, params),
                pad,
                body.pretty(indent + 1)
            ),
            Expr::Cont { param, body } => format!(
                "(continuation ({})\n{}{})",
                param,
                pad,
                body.pretty(indent + 1)
            ),
            Expr::ContApp { cont, arg } => format!(
                "(continue {}\n{}{})",
                cont.pretty(indent + 2),
                pad,
                arg.pretty(indent + 1)
            ),
            Expr::LetFlag { flag, body } => format!(
                "(let-flag ({})\n{}{})",
                flag,
                pad,
                body.pretty(indent + 1)
            ),
            Expr::LetRec { bindings, body } => {
                let inner = "  ".repeat(indent + 3);
                let mut s = String::from("(letrec (");
                for (i, (name, value)) in bindings.iter().enumerate() {
                    if i > 0 {
                        s.push('\n');
                        s.push_str(&"  ".repeat(indent + 4));
                        s.push(' ');
                    }
                    s.push_str(&format!("({}\n{}  {})", name, inner, value.pretty(indent + 4)));
                }
                s.push_str(&format!(")\n{}{})", pad, body.pretty(indent + 1)));
                s
            }
        }
    }
}

fn header(name: &Name, params: &[Name]) -> String {
    std::iter::once(name.as_str())
        .chain(params.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn broken(head: &str, args: &[Expr], indent: usize) -> String {
    let pad = "  ".repeat(indent + 1);
    let mut s = format!("({}", head);
    for arg in args {
        s.push('\n');
        s.push_str(&pad);
        s.push_str(&arg.pretty(indent + 1));
    }
    s.push(')');
    s
}

/// Render a whole program: definitions in order, then the top-level
/// expression or a call to the entry definition.
pub fn emit_program(program: &Program) -> String {
    let mut out = program
        .definitions
        .iter()
        .map(|def| def.pretty(0))
        .collect::<Vec<_>>();
    if let Some(main) = &program.main {
        out.push(main.pretty(0));
    } else if let Some(entry) = &program.entry {
        out.push(format!("({})", entry));
    }
    let mut text = out.join("\n\n");
    text.push('\n');
    text
}
