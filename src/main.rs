//! asapc command line.
//!
//! Evaluates the expression given as the first argument, or a line read from
//! standard input. When the result is staged code, a complete C program is
//! printed; otherwise the value itself.

use asapc::Error;
use asapc::ast::Value;
use asapc::codegen;
use asapc::evaluator::{self, menv::MEnv};
use asapc::session::{CompileOptions, Session};
use asapc::sexpr::parse_sexprs;
use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, BufRead};
use std::process::ExitCode;
use std::rc::Rc;

#[derive(Parser)]
#[command(name = "asapc")]
#[command(version)]
#[command(about = "Staged evaluator compiling S-expressions to C with static memory management", long_about = None)]
struct Cli {
    /// Expression to evaluate (read from stdin when omitted)
    #[arg(value_name = "EXPR")]
    expr: Option<String>,

    /// Start an interactive session
    #[arg(long, conflicts_with = "expr")]
    repl: bool,

    /// Print staged results as a bare expression instead of a full program
    #[arg(long)]
    block_only: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Cells in the generated stack pool
    #[arg(long, default_value_t = 256)]
    stack_pool_size: usize,

    /// Deferred decrements applied per safe point
    #[arg(long, default_value_t = 32)]
    deferred_batch_size: usize,

    /// Upper bound on liveness iterations
    #[arg(long, default_value_t = 64)]
    liveness_iteration_cap: usize,

    /// Nesting depth past which analyzers skip a node
    #[arg(long, default_value_t = 256)]
    analysis_depth_limit: usize,

    /// Release bindings at block end only
    #[arg(long)]
    no_nll: bool,

    /// Disable in-place reuse of freed cells
    #[arg(long)]
    no_reuse: bool,

    /// Never allocate bindings from the stack pool
    #[arg(long)]
    no_stack_alloc: bool,

    /// Freeze cyclic bindings and release them per component
    #[arg(long)]
    freeze_cyclic: bool,

    /// Omit the runtime library from the emitted program
    #[arg(long)]
    no_runtime: bool,
}

impl Cli {
    fn options(&self) -> CompileOptions {
        CompileOptions {
            stack_pool_size: self.stack_pool_size,
            deferred_batch_size: self.deferred_batch_size,
            liveness_iteration_cap: self.liveness_iteration_cap,
            analysis_depth_limit: self.analysis_depth_limit,
            enable_nll: !self.no_nll,
            enable_reuse: !self.no_reuse,
            enable_stack_alloc: !self.no_stack_alloc,
            freeze_cyclic: self.freeze_cyclic,
            emit_runtime: !self.no_runtime,
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

/// Evaluate every top-level form in order; the last one is the result.
fn eval_source(source: &str, menv: &Rc<MEnv>) -> Result<Value, Error> {
    let forms = parse_sexprs(source)?;
    let mut result = Value::Nil;
    for form in &forms {
        result = evaluator::eval(form, menv)?;
    }
    Ok(result)
}

fn render(result: &Value, session: &Session, block_only: bool) -> String {
    match result {
        Value::Code(code) if block_only => code.to_string(),
        Value::Code(code) => codegen::emit_program(code, &session.types.borrow(), &session.options),
        other => other.to_string(),
    }
}

fn read_stdin_line() -> Result<String, Error> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| Error::EvalError(format!("failed to read standard input: {e}")))?;
    Ok(line)
}

fn run_once(cli: &Cli) -> Result<(), Error> {
    let session = Rc::new(Session::new(cli.options()));
    let source = match &cli.expr {
        Some(expr) => expr.clone(),
        None => read_stdin_line()?,
    };
    let menv = MEnv::root(Rc::clone(&session));
    let result = eval_source(&source, &menv)?;
    let len = source.len();
    session.arena.register_external("source text", move || {
        tracing::trace!(bytes = len, "releasing source text");
        drop(source);
    });
    println!("{}", render(&result, &session, cli.block_only));
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  :help     show this message");
    println!("  :types    list registered types and their weak fields");
    println!("  :program  print the last staged result as a full program");
    println!("  :quit     leave the session");
}

fn print_types(session: &Session) {
    let types = session.types.borrow();
    if types.is_empty() {
        println!("No types registered.");
        return;
    }
    for def in types.types() {
        let weak: Vec<&str> = def.weak_fields().map(|f| &*f.name).collect();
        println!("{} ({} fields, weak: [{}])", def.name, def.fields.len(), weak.join(", "));
    }
}

/// A history entry that cannot be recorded is logged and the session goes on
fn note_history(recorded: rustyline::Result<bool>) {
    if let Err(e) = recorded {
        tracing::debug!(error = %e, "could not record history entry");
    }
}

fn run_repl(cli: &Cli) -> Result<(), Error> {
    let session = Rc::new(Session::new(cli.options()));
    let menv = MEnv::root(Rc::clone(&session));
    let mut rl = DefaultEditor::new().map_err(|e| Error::EvalError(format!("could not start line editor: {e}")))?;
    let mut last_code: Option<Rc<str>> = None;

    println!("asapc interactive session. Type :help for commands, Ctrl+D to exit.");
    loop {
        match rl.readline("asapc> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                note_history(rl.add_history_entry(line));
                match line {
                    ":help" => print_help(),
                    ":types" => print_types(&session),
                    ":program" => match &last_code {
                        Some(code) => println!("{}", codegen::emit_program(code, &session.types.borrow(), &session.options)),
                        None => println!("Nothing staged yet."),
                    },
                    ":quit" | ":exit" => break,
                    _ => match eval_source(line, &menv) {
                        Ok(result) => {
                            if let Value::Code(code) = &result {
                                last_code = Some(Rc::clone(code));
                            }
                            println!("{}", render(&result, &session, true));
                        }
                        Err(e) => println!("Error: {e}"),
                    },
                }
            }
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => break,
            Err(err) => return Err(Error::EvalError(format!("line editor failed: {err}"))),
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let outcome = if cli.repl { run_repl(&cli) } else { run_once(&cli) };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
