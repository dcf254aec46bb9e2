//! Rillt - the command-line driver for the Rill runtime.
//!
//! A thin host over `rill-core`: it creates one language instance,
//! installs a minimal `show` callable, and either runs a script file
//! or evaluates an expression from the command line.

use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rill_core::function::{NatOut, NativeFn};
use rill_core::{Config, FileSource, Scope, State, StrSource, Value};

/// Rillt - run and evaluate Rill programs.
#[derive(Parser, Debug)]
#[command(name = "rillt")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Command-line driver for the Rill language", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose tracing output
    #[arg(short, long, global = true, env = "RILLT_VERBOSE")]
    verbose: bool,

    /// Compile without debug info (smaller functions, no line info
    /// in stack traces)
    #[arg(long, global = true)]
    no_debug: bool,

    /// Resolve free names as globals instead of unit-local cells
    #[arg(long, global = true)]
    global: bool,

    /// Collect at every safepoint (slow; for shaking out GC bugs)
    #[arg(long, global = true, env = "RILLT_GC_STRESS")]
    gc_stress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a script file
    Run {
        /// Path to the script
        file: String,
    },
    /// Evaluate a single expression and print its values
    Eval {
        /// The expression text
        expr: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    match drive(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rillt: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn drive(cli: &Cli) -> Result<()> {
    let config = Config {
        debug: !cli.no_debug,
        gc_stress: cli.gc_stress,
        ..Config::default()
    };
    let mut state = State::new(config).map_err(|e| anyhow!("{e}"))?;
    install_show(&mut state);

    let scope = if cli.global {
        Scope::Global
    } else {
        Scope::Local
    };

    match &cli.command {
        Commands::Run { file } => {
            let mut src = FileSource::open(file).with_context(|| format!("opening {file}"))?;
            tracing::debug!(file, "running script");
            let vals = state
                .run(&mut src, scope, true)
                .map_err(|e| runtime_error(&e))?;
            print_values(&state, &vals);
            Ok(())
        }
        Commands::Eval { expr } => {
            let mut src = StrSource::new("<eval>", expr.clone());
            let vals = state
                .run(&mut src, scope, false)
                .map_err(|e| runtime_error(&e))?;
            print_values(&state, &vals);
            Ok(())
        }
    }
}

/// Install a minimal `show` callable: prints its argument's bare
/// form followed by a newline and returns it.
fn install_show(state: &mut State) {
    let cb: NativeFn = Rc::new(|state: &mut State, call| {
        let v = call.args.first().cloned().unwrap_or(Value::Udf);
        println!("{}", state.render(&v, false));
        Ok(NatOut::Ret(vec![v]))
    });
    let show = state.native("show", &["value"], cb);
    state
        .def_global("show", show)
        .expect("closures are storable");
}

fn print_values(state: &State, vals: &[Value]) {
    for v in vals {
        println!("{}", state.render(v, true));
    }
}

fn runtime_error(e: &rill_core::Error) -> anyhow::Error {
    let mut text = e.to_string();
    for frame in &e.trace {
        text.push_str(&format!("\n  at {frame}"));
    }
    anyhow!(text)
}
