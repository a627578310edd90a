//! rdb-import CLI - plan and inspect relational database imports.

use clap::{Parser, Subcommand};
use rdb_import::source::select_tables;
use rdb_import::{Config, ImportError, ImportResult, Importer, PostgresSource, TargetConfig};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rdb-import")]
#[command(about = "Parallel relational database to tabular store import")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read source metadata and generate the target DDL without touching the target
    Plan {
        /// Write the DDL script to this file
        #[arg(long)]
        script: Option<PathBuf>,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// List the source tables selected by the configuration
    Tables,

    /// Validate the configuration file and print its hash
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ImportError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::CheckConfig => {
            let hash = config.hash();
            if cli.output_json {
                let summary = json!({
                    "valid": true,
                    "hash": hash,
                    "table_options": config.table_options.len(),
                    "table_maps": config.table_maps.len(),
                    "table_refs": config.table_refs.len(),
                    "dry_run": config.is_dry_run(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Configuration is valid");
                println!("  Hash: {}", hash);
                println!(
                    "  Option sets: {}, table maps: {}, pinned tables: {}",
                    config.table_options.len(),
                    config.table_maps.len(),
                    config.table_refs.len()
                );
            }
        }

        Commands::Tables => {
            let config = config.with_auto_tuning();
            let source = connect(&config).await?;
            let config = Arc::new(config);
            let catalog = Arc::clone(&source);
            let decisions = tokio::task::spawn_blocking(move || select_tables(&config, catalog.as_ref()))
                .await
                .map_err(|e| ImportError::pool(e, "running table discovery"))??;

            if cli.output_json {
                let tables: Vec<_> = decisions
                    .iter()
                    .map(|d| {
                        json!({
                            "schema": d.identity.schema,
                            "table": d.identity.table,
                            "options": d.options.name,
                            "pinned": d.table_ref.is_some(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&tables)?);
            } else {
                for d in &decisions {
                    let pinned = if d.table_ref.is_some() { " (pinned)" } else { "" };
                    println!("{}\t{}{}", d.identity, d.options.name, pinned);
                }
                println!("\n{} tables selected", decisions.len());
            }
        }

        Commands::Plan { script, workers } => {
            if let Some(path) = script {
                config
                    .target
                    .get_or_insert_with(TargetConfig::default)
                    .script_file = Some(path);
            }
            if let Some(w) = workers {
                config.workers.pool_size = Some(w);
            }
            config.validate()?;
            let config = config.with_auto_tuning();

            let source = connect(&config).await?;
            let result = Importer::new(config, source).dry_run(true).run().await?;
            print_result(&result, cli.output_json)?;
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> Result<Arc<PostgresSource>, ImportError> {
    info!("Connecting to {}", config.source.connection_string());
    let source = PostgresSource::connect(&config.source, config.workers.get_pool_size()).await?;
    Ok(Arc::new(source))
}

fn print_result(result: &ImportResult, as_json: bool) -> Result<(), ImportError> {
    if as_json {
        println!("{}", result.to_json()?);
        return Ok(());
    }
    println!("\nPlan completed!");
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Tables: {}/{}", result.tables_succeeded(), result.tables_total);
    for stage in &result.stages {
        println!("  {}: {} of {}", stage.stage, stage.succeeded, stage.total);
    }
    for failed in &result.failed_tables {
        println!("  Failed {} at {}: {}", failed.table, failed.stage, failed.error);
    }
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides `--verbosity`.
fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
