//! Harvest CLI
//!
//! Usage:
//!   harvest run --url <url> [--url <url> ...] [--urls-file <path>] [--raw <path> ...]
//!   harvest check
//!   harvest init-schema

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use harvest_core::{AppConfig, GraphBackendKind, LoggingConfig, Source};
use harvest_graph::{GraphStore, InMemoryGraphStore, SurrealDbStore};
use harvest_pipeline::Pipeline;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "harvest")]
#[command(about = "Turn web pages into a knowledge graph")]
#[command(version)]
struct Cli {
    /// TOML config file; environment variables override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Graph store to use instead of the configured one
    #[arg(long, global = true)]
    store: Option<GraphBackendKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process pages into the graph and print the run summary
    Run {
        /// Page to fetch (repeatable)
        #[arg(long = "url")]
        urls: Vec<String>,

        /// File with one URL per line; blank lines and `#` comments are skipped
        #[arg(long)]
        urls_file: Option<PathBuf>,

        /// Local file whose content is processed without fetching (repeatable)
        #[arg(long = "raw")]
        raw: Vec<PathBuf>,

        /// Also write the summary JSON to this file
        #[arg(long)]
        summary_out: Option<PathBuf>,
    },
    /// Check that the browser backend, annotator and graph store are reachable
    Check,
    /// Create the graph schema in SurrealDB
    InitSchema,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.graph.backend = store;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run {
            urls,
            urls_file,
            raw,
            summary_out,
        } => {
            let sources = collect_sources(urls, urls_file.as_deref(), &raw)?;
            if sources.is_empty() {
                bail!("nothing to do: pass --url, --urls-file or --raw");
            }

            let store = open_store(&config).await?;
            let pipeline = Pipeline::builder(config, store).build()?;

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling run");
                    trigger.cancel();
                }
            });

            let summary = pipeline.run(sources, cancel).await?;
            let json = summary.to_json()?;
            println!("{json}");
            if let Some(path) = summary_out {
                std::fs::write(&path, &json)
                    .with_context(|| format!("writing summary to {}", path.display()))?;
            }

            if summary.cancelled {
                return Ok(ExitCode::from(130));
            }
        }
        Commands::Check => {
            let store = open_store(&config).await?;
            let pipeline = Pipeline::builder(config, store).build()?;
            pipeline.check().await?;
            println!("all components reachable");
        }
        Commands::InitSchema => {
            if config.graph.backend != GraphBackendKind::SurrealDb {
                bail!("init-schema only applies to the surrealdb store");
            }
            let store = SurrealDbStore::new(&config.graph).await?;
            store.init_schema().await?;
            info!(
                namespace = %config.graph.surrealdb_namespace,
                database = %config.graph.surrealdb_database,
                "Schema initialised"
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            ["harvest", "harvest_fetch", "harvest_extractor", "harvest_graph", "harvest_pipeline"]
                .iter()
                .map(|target| format!("{target}={}", logging.level))
                .collect::<Vec<_>>()
                .join(",")
                .into()
        });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn GraphStore>> {
    let store: Arc<dyn GraphStore> = match config.graph.backend {
        GraphBackendKind::SurrealDb => Arc::new(SurrealDbStore::new(&config.graph).await?),
        GraphBackendKind::Memory => Arc::new(InMemoryGraphStore::new()),
    };
    Ok(store)
}

fn collect_sources(
    urls: Vec<String>,
    urls_file: Option<&Path>,
    raw: &[PathBuf],
) -> anyhow::Result<Vec<Source>> {
    let mut sources: Vec<Source> = urls.into_iter().map(Source::url).collect();

    if let Some(path) = urls_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        sources.extend(parse_url_list(&content).map(Source::url));
    }

    for path in raw {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        sources.push(Source::raw(path.display().to_string(), content));
    }

    Ok(sources)
}

fn parse_url_list(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}
