//! trampc CLI - compile files and explore the pipeline in a REPL

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use rustyline::completion::Completer;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::{ValidationContext, ValidationResult, Validator};
use rustyline::{Editor, Helper};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use trampc::ast::Expr;
use trampc::lexer::{Lexer, Token};
use trampc::{
    compile, emit_program, format_compile_error, format_eval_error, parse_program, CompileOptions,
    ErrorConfig, EvalOptions, Interpreter, Program, Stage,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmitStage {
    Syntax,
    Cps,
    Abstraction,
    Thunk,
    Trampoline,
}

impl From<EmitStage> for Stage {
    fn from(stage: EmitStage) -> Stage {
        match stage {
            EmitStage::Syntax => Stage::Syntax,
            EmitStage::Cps => Stage::Cps,
            EmitStage::Abstraction => Stage::Abstraction,
            EmitStage::Thunk => Stage::Thunk,
            EmitStage::Trampoline => Stage::Trampoline,
        }
    }
}

/// Compile a small functional language to trampolined continuation-passing style
#[derive(Debug, Parser)]
#[command(name = "trampc", version)]
struct Cli {
    /// Source file; starts the REPL when omitted
    file: Option<PathBuf>,

    /// Last pipeline stage to run before printing
    #[arg(long, value_enum, default_value = "trampoline")]
    emit: EmitStage,

    /// Evaluate the compiled program and print its value
    #[arg(long)]
    run: bool,

    /// Only report errors; print nothing on success
    #[arg(long)]
    check: bool,

    /// First value of the fresh-name counter
    #[arg(long, default_value_t = 0)]
    first_fresh: u32,

    /// Machine frames allowed while running
    #[arg(long, default_value_t = trampc::eval::DEFAULT_STACK_LIMIT)]
    stack_limit: usize,

    /// Disable ANSI colors in diagnostics
    #[arg(long)]
    no_color: bool,
}

impl Cli {
    fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            stop_after: self.emit.into(),
            first_fresh: self.first_fresh,
        }
    }

    fn eval_options(&self) -> EvalOptions {
        EvalOptions {
            stack_limit: self.stack_limit,
            ..EvalOptions::default()
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TRAMPC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match &cli.file {
        Some(path) => run_file(&cli, path),
        None => repl(&cli),
    }
}

fn run_file(cli: &Cli, path: &PathBuf) -> ExitCode {
    let config = ErrorConfig::for_stderr(cli.no_color).with_filename(path.display().to_string());

    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot read {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let compiled = match parse_program(&source).and_then(|p| compile(p, &cli.compile_options())) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("{}", format_compile_error(&e, &source, &config));
            return ExitCode::FAILURE;
        }
    };
    debug!(file = %path.display(), definitions = compiled.definitions.len(), "compiled");

    if !cli.check && !cli.run {
        print!("{}", emit_program(&compiled));
    }

    if cli.run {
        let mut interp = Interpreter::with_options(cli.eval_options());
        match interp.run_program(&compiled) {
            Ok(Some(value)) => println!("{}", value),
            Ok(None) => {}
            Err(e) => {
                let names = interp.global_names();
                eprintln!(
                    "{}",
                    format_eval_error(&e, names.iter().map(String::as_str), &config)
                );
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

// ============================================================================
// REPL
// ============================================================================

/// Keeps reading lines while parentheses are open
struct ReplHelper;

impl Completer for ReplHelper {
    type Candidate = String;
}

impl Hinter for ReplHelper {
    type Hint = String;
}

impl Highlighter for ReplHelper {}

impl Validator for ReplHelper {
    fn validate(&self, ctx: &mut ValidationContext) -> rustyline::Result<ValidationResult> {
        let input = ctx.input();
        if input.trim_start().starts_with(':') {
            return Ok(ValidationResult::Valid(None));
        }
        // Lexical errors are reported after submission
        let Ok(tokens) = Lexer::new(input).tokenize() else {
            return Ok(ValidationResult::Valid(None));
        };
        let depth = tokens.iter().fold(0i64, |depth, t| match t.token {
            Token::LParen | Token::LBracket => depth + 1,
            Token::RParen | Token::RBracket => depth - 1,
            _ => depth,
        });
        Ok(if depth > 0 {
            ValidationResult::Incomplete
        } else {
            ValidationResult::Valid(None)
        })
    }
}

impl Helper for ReplHelper {}

/// Definitions entered so far and display settings
struct Session {
    definitions: Vec<Expr>,
    stage: Stage,
    show_code: bool,
}

impl Session {
    fn define(&mut self, def: Expr) {
        if let Expr::Define { name, .. } = &def {
            let name = name.clone();
            self.definitions
                .retain(|d| !matches!(d, Expr::Define { name: n, .. } if *n == name));
        }
        self.definitions.push(def);
    }

    fn names(&self) -> Vec<String> {
        self.definitions
            .iter()
            .filter_map(|d| match d {
                Expr::Define { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

const HELP: &str = "\
Enter definitions or an expression. Each expression is compiled with every
definition entered so far, printed if :code is on, and run.

  :stage NAME   stop the pipeline after NAME (syntax, cps, abstraction, thunk, trampoline)
  :code         toggle printing the compiled program
  :defs         list definitions
  :reset        forget all definitions
  :help         show this message
  :quit         leave";

fn repl(cli: &Cli) -> ExitCode {
    println!("trampc {} - :help for commands", VERSION);

    let mut editor: Editor<ReplHelper, DefaultHistory> = match Editor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("cannot start line editor: {}", e);
            return ExitCode::FAILURE;
        }
    };
    editor.set_helper(Some(ReplHelper));

    let config = ErrorConfig::for_stderr(cli.no_color);
    let mut session = Session {
        definitions: Vec::new(),
        stage: cli.emit.into(),
        show_code: false,
    };

    loop {
        let line = match editor.readline("trampc> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("read error: {}", e);
                return ExitCode::FAILURE;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        remember(&mut editor, input);

        if let Some(command) = input.strip_prefix(':') {
            if !run_command(command, &mut session) {
                break;
            }
            continue;
        }

        eval_input(input, cli, &config, &mut session);
    }
    ExitCode::SUCCESS
}

fn remember(editor: &mut Editor<ReplHelper, DefaultHistory>, input: &str) {
    match editor.add_history_entry(input) {
        Ok(added) => debug!(added, "history entry"),
        Err(e) => debug!(error = %e, "could not record history entry"),
    }
}

/// Returns false when the REPL should exit
fn run_command(command: &str, session: &mut Session) -> bool {
    let mut words = command.split_whitespace();
    match words.next() {
        Some("quit" | "q") => return false,
        Some("help" | "h") => println!("{}", HELP),
        Some("code") => {
            session.show_code = !session.show_code;
            println!("printing compiled code: {}", if session.show_code { "on" } else { "off" });
        }
        Some("defs") => {
            for def in &session.definitions {
                println!("{}", def.pretty(0));
            }
        }
        Some("reset") => {
            session.definitions.clear();
            println!("definitions cleared");
        }
        Some("stage") => match words.next().map(|name| EmitStage::from_str(name, true)) {
            Some(Ok(stage)) => {
                session.stage = stage.into();
                println!("stopping after {}", session.stage);
            }
            _ => println!("usage: :stage syntax|cps|abstraction|thunk|trampoline"),
        },
        _ => println!("unknown command; :help lists commands"),
    }
    true
}

fn eval_input(input: &str, cli: &Cli, config: &ErrorConfig, session: &mut Session) {
    let parsed = match parse_program(input) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("{}", format_compile_error(&e, input, config));
            return;
        }
    };

    let new_names: Vec<String> = parsed
        .definitions
        .iter()
        .filter_map(|d| match d {
            Expr::Define { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();

    // Definitions are checked against the session before they are kept
    let mut candidate = Vec::with_capacity(session.definitions.len() + parsed.definitions.len());
    candidate.extend(
        session
            .definitions
            .iter()
            .filter(|d| !matches!(d, Expr::Define { name, .. } if new_names.contains(name)))
            .cloned(),
    );
    candidate.extend(parsed.definitions.iter().cloned());

    let program = Program::new(candidate, parsed.main.clone());
    let options = CompileOptions {
        stop_after: session.stage,
        first_fresh: cli.first_fresh,
    };
    let compiled = match compile(program, &options) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("{}", format_compile_error(&e, input, config));
            return;
        }
    };

    for def in parsed.definitions {
        session.define(def);
    }
    for name in &new_names {
        println!("defined {}", name);
    }

    if parsed.main.is_none() {
        return;
    }
    if session.show_code {
        print!("{}", emit_program(&compiled));
    }

    let mut interp = Interpreter::with_options(cli.eval_options());
    match interp.run_program(&compiled) {
        Ok(Some(value)) => println!("{}", value),
        Ok(None) => {}
        Err(e) => {
            let mut names = session.names();
            names.extend(interp.global_names());
            eprintln!(
                "{}",
                format_eval_error(&e, names.iter().map(String::as_str), config)
            );
        }
    }
}
