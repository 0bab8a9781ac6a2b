//! `palimpsest` command surface. Every command prints JSON on stdout;
//! failures print an error envelope `{code, message[, details]}`.
//!
//! Hosts can embed the same behaviour through [`run_cli`] for a parsed
//! command line or [`run_command`] against an explicit base directory.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use palimpsest_core::TraceError;
use palimpsest_engine::{api, EngineConfig, TraceEngine};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::level_filters::LevelFilter;

const LIST_DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Parser)]
#[command(name = "palimpsest")]
#[command(about = "Record, search and manage agent execution traces")]
#[command(version)]
pub struct Cli {
    /// Directory holding the `.palimpsest` data folder.
    #[arg(long, env = "PALIMPSEST_HOME", default_value = ".")]
    base_dir: PathBuf,

    /// Log debug output to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the data directory and index.
    Init,
    /// Store a trace read from a JSON file, or `-` for stdin.
    Add(AddArgs),
    Search(SearchArgs),
    List(ListArgs),
    Show(TraceIdArgs),
    Delete(TraceIdArgs),
    Stats,
    /// Repopulate the index from every stored trace.
    RebuildIndex,
    /// Check a trace payload without storing it.
    Validate(InputArgs),
}

#[derive(Debug, Args)]
pub struct InputArgs {
    /// Path to a JSON payload, or `-` for stdin.
    input: String,
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[command(flatten)]
    source: InputArgs,
    /// Skip merging platform details into `context.environment`.
    #[arg(long)]
    no_auto_context: bool,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Keywords; empty lists the most recent traces.
    #[arg(default_value = "")]
    query: String,
    #[arg(long, short)]
    limit: Option<usize>,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    complexity: Option<ComplexityArg>,
    #[arg(long, conflicts_with = "failed")]
    success: bool,
    #[arg(long)]
    failed: bool,
    /// Tag substring to require; repeat or comma-separate.
    #[arg(long = "tag", value_delimiter = ',')]
    tags: Vec<String>,
    /// Return index metadata rows instead of full records.
    #[arg(long)]
    metadata: bool,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, short, default_value_t = LIST_DEFAULT_LIMIT)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct TraceIdArgs {
    trace_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ComplexityArg {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityArg {
    fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }
}

/// Installs the stderr `fmt` subscriber; `verbose` lowers the threshold
/// from warn to debug.
pub fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

/// Executes a parsed command line.
///
/// # Errors
/// Returns an error when reading input fails or the requested operation
/// fails; [`TraceError`]s are preserved for [`error_envelope`].
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command(&cli.base_dir, cli.command)
}

/// Executes one command against the data folder under `base_dir`.
///
/// # Errors
/// Returns an error when reading input fails or the requested operation
/// fails.
pub fn run_command(base_dir: &Path, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            let config = EngineConfig::new(base_dir);
            TraceEngine::open(config.clone())?;
            print_json(&json!({ "initialized": config.data_dir() }))
        }
        Command::Add(args) => {
            let payload = read_payload(&args.source.input)?;
            let trace_id = api::create_trace(&payload, !args.no_auto_context, base_dir)?;
            print_json(&json!({ "trace_id": trace_id }))
        }
        Command::Search(args) => {
            let filters = search_filters(&args);
            if args.metadata {
                print_json(&api::search_metadata(&args.query, &filters, args.limit, base_dir)?)
            } else {
                print_json(&api::search_traces(&args.query, &filters, args.limit, base_dir)?)
            }
        }
        Command::List(args) => print_json(&api::list_traces(Some(args.limit), base_dir)?),
        Command::Show(args) => print_json(&api::get_trace(&args.trace_id, base_dir)?),
        Command::Delete(args) => {
            api::delete_trace(&args.trace_id, base_dir)?;
            print_json(&json!({ "deleted": args.trace_id }))
        }
        Command::Stats => print_json(&api::get_stats(base_dir)?),
        Command::RebuildIndex => {
            let indexed = api::rebuild_index(base_dir)?;
            print_json(&json!({ "indexed": indexed }))
        }
        Command::Validate(args) => {
            let payload = read_payload(&args.input)?;
            print_json(&api::validate_trace(&payload))
        }
    }
}

/// Renders any CLI failure as the JSON error envelope. Trace errors keep
/// their kind as `palimpsest.<kind>`; validation failures list each issue
/// under `details`. Anything else is an input problem.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<TraceError>() {
        Some(trace_err) => {
            let mut envelope = json!({
                "code": format!("palimpsest.{}", trace_err.kind()),
                "message": trace_err.to_string(),
            });
            if let TraceError::Validation { source, .. } = trace_err {
                envelope["details"] = json!(source.issues());
            }
            envelope
        }
        None => json!({
            "code": "palimpsest.input",
            "message": format!("{err:#}"),
        }),
    }
}

fn search_filters(args: &SearchArgs) -> Value {
    let mut filters = Map::new();
    if let Some(domain) = &args.domain {
        filters.insert("domain".to_string(), json!(domain));
    }
    if let Some(complexity) = args.complexity {
        filters.insert("complexity".to_string(), json!(complexity.as_str()));
    }
    if args.success || args.failed {
        filters.insert("success".to_string(), json!(args.success));
    }
    let tags: Vec<&str> = args
        .tags
        .iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .collect();
    if !tags.is_empty() {
        filters.insert("tags".to_string(), json!(tags));
    }
    Value::Object(filters)
}

fn read_payload(source: &str) -> Result<Value> {
    let body = if source == "-" {
        let mut body = String::new();
        std::io::stdin()
            .read_to_string(&mut body)
            .context("failed to read trace payload from stdin")?;
        body
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("failed to read trace payload from {source}"))?
    };
    serde_json::from_str(&body).with_context(|| format!("{source} is not valid JSON"))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
