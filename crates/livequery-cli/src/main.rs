//! # livequery
//!
//! Watches live queries over an element tree while a mutation script runs
//! against it, printing every emission as it happens.
//!
//! The tree is a JSON element description (`tag`, `attributes`, `text`,
//! `children`). The script is a JSON array of timed mutations, see
//! [`script`]. Each `--query` is subscribed before the script starts and
//! unsubscribed `--linger-ms` after its last step.
//!
//! ## Usage
//!
//! ```bash
//! # Print the matches of two queries while a script mutates the tree
//! livequery --tree page.json --script steps.json -q '//li' -q '//button[@id="save"]'
//!
//! # Exactly-one view, human-readable
//! livequery -t page.json -s steps.json -q '//button' --view single --format text
//!
//! # Slower coarse watch without a leading edge, logs to a file
//! livequery -t page.json -s steps.json -q '//li' --throttle-ms 500 --no-leading \
//!     --log-file /tmp/livequery.log
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG` - Log filter (default `warn`)
//! - `LIVEQUERY_THROTTLE_MS` - Default for `--throttle-ms`
//!
//! ## Exit Codes
//!
//! - `0` - Script replayed and every view stayed healthy
//! - `1` - A script step failed
//! - `2` - The tree, script or log file could not be read
//! - `3` - A view terminated with an engine error

mod output;
mod replay;
mod script;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use livequery_core::config::EngineConfig;
use livequery_core::element::ElementSpec;
use livequery_core::engine::Engine;
use livequery_core::error::EngineError;
use livequery_core::matching::MatchFilter;
use livequery_core::memory::{DeliveryMode, MemoryTree};
use livequery_core::outcome::Outcome;
use livequery_core::stream::{Sink, Stream, Subscription};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use output::{Emission, OutputFormat, View};

#[derive(Parser)]
#[command(name = "livequery", about = "Watch live queries while replaying tree mutations", version)]
struct Cli {
    /// JSON element tree to load
    #[arg(short, long)]
    tree: PathBuf,

    /// JSON mutation script to replay against the tree
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Query to watch (repeatable)
    #[arg(short = 'q', long = "query", required = true)]
    queries: Vec<String>,

    /// Live view to print for every query
    #[arg(short, long, value_enum, default_value = "observe")]
    view: View,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    format: OutputFormat,

    /// Coarse watch throttle window in milliseconds (overrides the config file)
    #[arg(long, env = "LIVEQUERY_THROTTLE_MS")]
    throttle_ms: Option<u64>,

    /// Disable the coarse watch's leading edge
    #[arg(long)]
    no_leading: bool,

    /// Keep watching this many milliseconds after the last step
    #[arg(long, default_value_t = 250)]
    linger_ms: u64,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_logging(cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {}", e);
            return e.exit_code();
        }
    };

    let local = tokio::task::LocalSet::new();
    match local.run_until(run(cli)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Input error: {0}")]
    Input(String),

    #[error("Script failed: {0}")]
    Step(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Step(_) => ExitCode::from(1),
            CliError::Input(_) => ExitCode::from(2),
            CliError::Engine(_) => ExitCode::from(3),
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>, CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let name = path
        .file_name()
        .ok_or_else(|| CliError::Input(format!("{} is not a file path", path.display())))?;
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let appender = tracing_appender::rolling::never(dir, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

fn load_tree(path: &Path) -> Result<ElementSpec, CliError> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| CliError::Input(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&json).map_err(|e| CliError::Input(format!("{}: {}", path.display(), e)))
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let spec = load_tree(&cli.tree)?;
    let steps = match &cli.script {
        Some(path) => script::load(path)
            .map_err(|e| CliError::Input(format!("{}: {}", path.display(), e)))?,
        None => Vec::new(),
    };

    let mut config = EngineConfig::load();
    if let Some(ms) = cli.throttle_ms {
        config.coarse_throttle_ms = ms;
    }
    if cli.no_leading {
        config.coarse_leading = false;
    }

    let tree = MemoryTree::from_spec(&spec, DeliveryMode::Spawned);
    let engine = Engine::new(Rc::new(tree.clone()), config);
    info!(queries = cli.queries.len(), steps = steps.len(), view = ?cli.view, "Starting live queries");

    let fatal: Rc<RefCell<Option<EngineError>>> = Rc::default();
    let subscriptions: Vec<Subscription> = cli
        .queries
        .iter()
        .map(|query| watch(&engine, query, cli.view, cli.format, &fatal))
        .collect();

    let replayed = replay::replay(&tree, &steps).await;
    if replayed.is_ok() {
        tokio::time::sleep(Duration::from_millis(cli.linger_ms)).await;
    }
    for subscription in &subscriptions {
        subscription.unsubscribe();
    }

    replayed.map_err(|failure| CliError::Step(failure.to_string()))?;
    if let Some(error) = fatal.borrow_mut().take() {
        return Err(CliError::Engine(error.to_string()));
    }
    Ok(())
}

fn watch(
    engine: &Engine,
    query: &str,
    view: View,
    format: OutputFormat,
    fatal: &Rc<RefCell<Option<EngineError>>>,
) -> Subscription {
    match view {
        View::Observe => print_each(&engine.observe(query), query, view, format, fatal),
        View::Elements => print_each(&engine.elements(query, MatchFilter::any()), query, view, format, fatal),
        View::Single => print_each(&engine.single(query), query, view, format, fatal),
        View::Text => print_each(&engine.text(query), query, view, format, fatal),
    }
}

fn print_each<T: Serialize + 'static>(
    stream: &Stream<Outcome<T>>,
    query: &str,
    view: View,
    format: OutputFormat,
    fatal: &Rc<RefCell<Option<EngineError>>>,
) -> Subscription {
    let label = query.to_string();
    let failed_query = query.to_string();
    let fatal = Rc::clone(fatal);

    let sink = Sink::new(move |outcome: Outcome<T>| {
        match Emission::now(&label, view, &outcome).render(format) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(query = %label, error = %e, "Failed to render emission"),
        }
    })
    .on_error(move |error| {
        warn!(query = %failed_query, %error, "View terminated");
        fatal.borrow_mut().get_or_insert(error);
    });
    stream.subscribe(sink)
}
