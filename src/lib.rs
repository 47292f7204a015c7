//! trampc - CPS conversion, thunkification and trampoline insertion for a
//! small functional language

pub mod ast;
pub mod codegen;
pub mod emit;
pub mod errors;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod test_support;

pub use ast::{Expr, NameGen, Position, PrimOp, Program, SourceMap, Span};
pub use codegen::{compile, CompileError, CompileOptions, Stage};
pub use emit::emit_program;
pub use errors::{
    find_similar, format_compile_error, format_eval_error, format_header, format_location,
    format_snippet, format_suggestions, levenshtein_distance, Colors, ErrorConfig,
};
pub use eval::{EvalError, EvalOptions, Interpreter, Value};
pub use lexer::Lexer;
pub use parser::{parse_expr, parse_program, Parser};
