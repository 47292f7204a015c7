//! Diagnostics for compile-time and runtime failures.
//!
//! Messages are laid out as a header naming the kind of problem, the file
//! location, a snippet of the offending source with carets, and a plain
//! explanation. Unbound names get "did you mean?" hints computed by edit
//! distance against the names in scope.

use std::io::IsTerminal;

use crate::ast::{is_fresh_name, SourceMap, Span};
use crate::codegen::CompileError;
use crate::eval::EvalError;

/// ANSI color codes for terminal output
#[derive(Debug, Clone, Default)]
pub struct Colors {
    pub enabled: bool,
}

impl Colors {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn code(&self, code: &'static str) -> &'static str {
        if self.enabled {
            code
        } else {
            ""
        }
    }

    pub fn red(&self) -> &'static str {
        self.code("\x1b[31m")
    }

    pub fn cyan(&self) -> &'static str {
        self.code("\x1b[36m")
    }

    pub fn yellow(&self) -> &'static str {
        self.code("\x1b[33m")
    }

    pub fn bold(&self) -> &'static str {
        self.code("\x1b[1m")
    }

    pub fn reset(&self) -> &'static str {
        self.code("\x1b[0m")
    }
}

/// Configuration for error display
#[derive(Debug, Clone, Default)]
pub struct ErrorConfig {
    pub colors: Colors,
    pub filename: Option<String>,
}

impl ErrorConfig {
    pub fn new(use_color: bool) -> Self {
        Self {
            colors: Colors::new(use_color),
            filename: None,
        }
    }

    /// Colors on when stderr is a terminal, unless `no_color` is set
    pub fn for_stderr(no_color: bool) -> Self {
        Self::new(!no_color && std::io::stderr().is_terminal())
    }

    pub fn with_filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }
}

// ============================================================================
// Suggestions
// ============================================================================

/// Edit distance between two strings, counted in characters
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitute = prev[j] + usize::from(ca != *cb);
            row[j + 1] = substitute.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

/// Up to three candidates within `max_distance` edits of `name`, closest
/// first, ties broken alphabetically. `name` itself is never suggested.
pub fn find_similar<'a>(
    name: &str,
    candidates: impl IntoIterator<Item = &'a str>,
    max_distance: usize,
) -> Vec<String> {
    let mut close: Vec<(usize, &str)> = candidates
        .into_iter()
        .map(|candidate| (levenshtein_distance(name, candidate), candidate))
        .filter(|&(dist, _)| dist > 0 && dist <= max_distance)
        .collect();
    close.sort();
    close.dedup();
    close.into_iter().take(3).map(|(_, c)| c.to_string()).collect()
}

// ============================================================================
// Layout
// ============================================================================

/// Header line, e.g. `-- SYNTAX ERROR ------------------------------------`
pub fn format_header(kind: &str, colors: &Colors) -> String {
    let dashes = "-".repeat(56usize.saturating_sub(kind.len()).max(4));
    format!("{}-- {} {}{}", colors.cyan(), kind, dashes, colors.reset())
}

/// `file:line:column` of the start of `span`
pub fn format_location(filename: Option<&str>, span: &Span, source_map: &SourceMap, colors: &Colors) -> String {
    format!(
        "{}{}:{}{}",
        colors.bold(),
        filename.unwrap_or("<input>"),
        source_map.position(span.start),
        colors.reset()
    )
}

/// The first line of `span` with the covered columns underlined.
///
/// ```text
/// 3 | (let ((x 1)) x)
///     ^^^^^^^^^^^^^^^
/// ```
pub fn format_snippet(source_map: &SourceMap, span: &Span, colors: &Colors) -> String {
    let start = source_map.position(span.start);
    let end = source_map.position(span.end);
    let text = source_map.line(start.line).unwrap_or("");
    let gutter = start.line.to_string();

    let width = if end.line == start.line {
        end.column.saturating_sub(start.column).max(1)
    } else {
        text.chars().count().saturating_sub(start.column - 1).max(1)
    };

    format!(
        "{}{} |{} {}\n{}{}{}{}",
        colors.cyan(),
        gutter,
        colors.reset(),
        text,
        " ".repeat(gutter.len() + 3 + start.column - 1),
        colors.red(),
        "^".repeat(width),
        colors.reset()
    )
}

/// The "did you mean?" hint, or nothing
pub fn format_suggestions(suggestions: &[String], colors: &Colors) -> String {
    match suggestions {
        [] => String::new(),
        [only] => format!("\n\nDid you mean {}{}{}?", colors.bold(), only, colors.reset()),
        many => {
            let names: Vec<String> = many
                .iter()
                .map(|s| format!("{}{}{}", colors.bold(), s, colors.reset()))
                .collect();
            format!("\n\nDid you mean one of: {}?", names.join(", "))
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

fn compile_error_kind(err: &CompileError) -> &'static str {
    match err {
        CompileError::Lex(_) | CompileError::Parse(_) => "SYNTAX ERROR",
        CompileError::MalformedExpression { .. } => "MALFORMED EXPRESSION",
        CompileError::InvariantViolation { .. } => "COMPILER BUG",
    }
}

/// Render a compile error against the source it came from
pub fn format_compile_error(err: &CompileError, source: &str, config: &ErrorConfig) -> String {
    let colors = &config.colors;
    let mut out = format_header(compile_error_kind(err), colors);
    out.push_str("\n\n");

    if let Some(span) = err.span() {
        let map = SourceMap::new(source);
        out.push_str(&format_location(config.filename.as_deref(), &span, &map, colors));
        out.push_str("\n\n");
        out.push_str(&format_snippet(&map, &span, colors));
        out.push_str("\n\n");
    }

    match err {
        CompileError::MalformedExpression { reason, .. } => {
            out.push_str(&format!("I cannot compile this expression: {}.", reason));
        }
        CompileError::InvariantViolation { stage, detail, form } => {
            out.push_str(&format!(
                "{}The {} stage produced a shape it should never produce:{} {}.\n\n    {}\n\nThis is a bug in the compiler.",
                colors.yellow(),
                stage,
                colors.reset(),
                detail,
                form
            ));
        }
        other => out.push_str(&format!("I got stuck reading this: {}.", other)),
    }
    out
}

/// Render a runtime error; `in_scope` feeds the suggestions for unbound names
pub fn format_eval_error<'a>(
    err: &EvalError,
    in_scope: impl IntoIterator<Item = &'a str>,
    config: &ErrorConfig,
) -> String {
    let colors = &config.colors;
    let mut out = format_header("RUNTIME ERROR", colors);
    out.push_str("\n\n");
    out.push_str(&err.to_string());

    if let EvalError::UnboundVariable(name) = err {
        let visible = in_scope.into_iter().filter(|n| !is_fresh_name(n));
        let suggestions = find_similar(name, visible, 2);
        out.push_str(&format_suggestions(&suggestions, colors));
    }
    out
}
