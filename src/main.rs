use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::Value;

use veritas::lifecycle::{Completion, ExecutionStatus, NewExecution};
use veritas::service::Services;
use veritas::settings::Settings;

#[derive(Parser)]
#[command(
    name = "veritas",
    about = "Test-management portal core: executions, configuration and durable artifacts",
    version,
    long_about = None
)]
struct Cli {
    /// Settings file (default: $VERITAS_CONFIG, then ./veritas.toml)
    #[arg(long, global = true, env = "VERITAS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Bind address (overrides [server] listen_address)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Read and write runtime configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Drive test executions
    Exec {
        #[command(subcommand)]
        action: ExecAction,
    },

    /// Inspect stored artifacts
    Artifacts {
        #[command(subcommand)]
        action: ArtifactAction,
    },

    /// Ping the database, cache and object store
    Health,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Resolve a key through memory, cache and database
    Get {
        key: String,
    },

    /// Store a value (JSON objects/arrays are kept structured)
    Set {
        key: String,
        value: String,
    },

    /// Drop every cached configuration value
    Flush,
}

#[derive(Subcommand)]
enum ExecAction {
    /// Queue a new execution
    Create {
        #[arg(long)]
        test_case: i64,

        #[arg(long)]
        suite: String,

        #[arg(long, default_value = "default")]
        environment: String,

        #[arg(long, default_value = "cli")]
        executor: String,
    },

    /// Move a queued execution to running
    Start {
        id: i64,
    },

    /// Record the outcome of a running execution
    Complete {
        id: i64,

        /// passed, failed, skipped or error
        #[arg(long)]
        outcome: String,

        /// Result payload as JSON
        #[arg(long)]
        result: Option<String>,

        #[arg(long)]
        error: Option<String>,
    },

    /// Show one execution
    Show {
        id: i64,
    },

    /// Execution counts and success rate
    Stats,
}

#[derive(Subcommand)]
enum ArtifactAction {
    /// Objects with no database record
    Orphans {
        category: String,

        /// Restrict to one day (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::discover(cli.config.as_deref())?;
    veritas::logging::init(&settings.logging);

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| settings.server.listen_address.clone());
            tracing::info!(%bind, "Starting Veritas");
            veritas::serve(&settings, &bind).await?;
        }
        command => {
            tokio::task::spawn_blocking(move || run_offline(&settings, command))
                .await
                .context("command panicked")??;
        }
    }

    Ok(())
}

/// Commands that talk to the stores directly, without the server.
fn run_offline(settings: &Settings, command: Commands) -> Result<()> {
    let services = Services::build(settings)?;

    match command {
        Commands::Serve { .. } => anyhow::bail!("serve does not run offline"),
        Commands::Health => {
            let report = services.health();
            print_json(&report)?;
            if !report.is_healthy() {
                anyhow::bail!("one or more stores are unavailable");
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => {
                let value = services.resolver.resolve(&key, Value::Null);
                if value.is_null() {
                    anyhow::bail!("config key not set: {key}");
                }
                print_json(&value)?;
            }
            ConfigAction::Set { key, value } => {
                let parsed = veritas::resolver::parse_value(&value);
                services.resolver.set(&key, &parsed)?;
                println!("{key} updated.");
            }
            ConfigAction::Flush => {
                let removed = services.resolver.flush()?;
                println!("{removed} cached entries removed.");
            }
        },
        Commands::Exec { action } => match action {
            ExecAction::Create {
                test_case,
                suite,
                environment,
                executor,
            } => {
                let mut req = NewExecution::new(test_case, suite);
                req.environment = environment;
                req.executor = executor;
                let execution = services.lifecycle.create(&req)?;
                if let Some(notifier) = &services.notifier {
                    tokio::runtime::Handle::current().block_on(notifier.notify(&execution));
                }
                print_json(&execution)?;
            }
            ExecAction::Start { id } => print_json(&services.lifecycle.start(id)?)?,
            ExecAction::Complete {
                id,
                outcome,
                result,
                error,
            } => {
                let outcome: ExecutionStatus = outcome.parse()?;
                let mut completion = Completion::new(outcome);
                if let Some(raw) = result {
                    completion.result =
                        serde_json::from_str(&raw).context("--result is not valid JSON")?;
                }
                completion.error_message = error;
                print_json(&services.lifecycle.complete(id, &completion)?)?;
            }
            ExecAction::Show { id } => print_json(&services.lifecycle.get(id)?)?,
            ExecAction::Stats => print_json(&services.lifecycle.stats()?)?,
        },
        Commands::Artifacts { action } => match action {
            ArtifactAction::Orphans { category, date } => {
                let orphans = services.writer.find_orphans(&category, date)?;
                if orphans.is_empty() {
                    println!("No orphan artifacts.");
                } else {
                    println!("{:<70} | {:>10}", "Path", "Size");
                    println!("{:-<70}-|-{:->10}", "", "");
                    for o in orphans {
                        println!("{:<70} | {:>10}", o.path, o.size);
                    }
                }
            }
        },
    }

    Ok(())
}
