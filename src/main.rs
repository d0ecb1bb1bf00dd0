//! # Knowledge Relay CLI (`krelay`)
//!
//! ## Usage
//!
//! ```bash
//! krelay --config ./config/krelay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `krelay serve` | Start the HTTP server |
//! | `krelay partitions` | List partition definitions |
//! | `krelay health` | Round-trip the generation backend |
//! | `krelay retrieve "<query>" --role R` | Run one retrieval |
//! | `krelay ingest --partition P --id D --role R --file F` | Ingest one document |
//! | `krelay research --subject S --section X` | Run one research report |
//!
//! Every command except `serve` prints JSON on stdout. Logs go to stderr.
//!
//! ## Examples
//!
//! ```bash
//! krelay retrieve "detention pay policy" --role driver --partition platform_ops
//! krelay ingest --partition industry_regs --id hos-2026 --role admin --file hos.md
//! krelay research --subject 1234567 --name "Acme Freight" --section safety --section reviews
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::Level;

use knowledge_relay::config::{self, Config};
use knowledge_relay::research::ResearchRequest;
use knowledge_relay::retrieval::{IngestRequest, RetrievalRequest};
use knowledge_relay::server::{self, Services};
use knowledge_relay::telemetry::init_tracing;

/// Knowledge Relay: partitioned retrieval, streamed generation sessions,
/// and parallel research lookups.
#[derive(Parser)]
#[command(name = "krelay", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/krelay.toml")]
    config: PathBuf,

    /// Emit JSON log lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    /// Enable debug logging (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// List configured partitions.
    Partitions,

    /// Check the generation backend with a minimal round-trip.
    Health,

    /// Retrieve a context block for a query.
    Retrieve {
        query: String,

        /// Caller role, checked against each partition's allowed roles.
        #[arg(long)]
        role: String,

        /// Partition to search (repeatable). Defaults to the role's list.
        #[arg(long = "partition")]
        partitions: Vec<String>,

        #[arg(long)]
        top_k: Option<usize>,

        /// Token budget for the context block.
        #[arg(long)]
        budget: Option<usize>,

        /// Caller identity for identity-filtered partitions.
        #[arg(long)]
        user_id: Option<String>,
    },

    /// Ingest one document into a partition.
    Ingest {
        #[arg(long)]
        partition: String,

        /// Document id (upsert key).
        #[arg(long)]
        id: String,

        #[arg(long)]
        role: String,

        /// Read the text from a file.
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,

        /// Inline text.
        #[arg(long)]
        text: Option<String>,

        /// Extra metadata as `key=value` (repeatable).
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,

        /// When the source last changed (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        updated_at: Option<String>,
    },

    /// Build a research report for one subject.
    Research {
        #[arg(long)]
        subject: String,

        /// Display name (defaults to the subject id).
        #[arg(long, default_value = "")]
        name: String,

        /// Section to run (repeatable). Defaults to every configured section.
        #[arg(long = "section")]
        sections: Vec<String>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(
        cli.log_json,
        if cli.verbose { Level::DEBUG } else { Level::INFO },
    );

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else if matches!(cli.command, Commands::Partitions) {
        Config::default()
    } else {
        bail!("config file not found: {}", cli.config.display());
    };

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Partitions => {
            let registry = cfg.registry()?;
            let partitions: Vec<_> = registry.partitions().collect();
            print_json(&serde_json::json!({ "partitions": partitions }))?;
        }
        Commands::Health => {
            let services = Services::from_config(&cfg)?;
            let health = services.provider.health_check().await;
            print_json(&serde_json::json!({
                "provider": services.provider.name(),
                "health": health,
            }))?;
        }
        Commands::Retrieve {
            query,
            role,
            partitions,
            top_k,
            budget,
            user_id,
        } => {
            let services = Services::from_config(&cfg)?;
            let request = RetrievalRequest {
                query,
                role,
                partitions,
                top_k,
                filters: HashMap::new(),
                budget_tokens: budget,
                user_id,
            };
            let result = services.retriever.retrieve(&request).await?;
            print_json(&result)?;
        }
        Commands::Ingest {
            partition,
            id,
            role,
            file,
            text,
            metadata,
            updated_at,
        } => {
            let text = match (file, text) {
                (Some(path), _) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, Some(text)) => text,
                (None, None) => bail!("one of --file or --text is required"),
            };
            let services = Services::from_config(&cfg)?;
            let request = IngestRequest {
                partition,
                document_id: id,
                text,
                role,
                metadata: metadata
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect(),
                source_updated_at: updated_at,
            };
            let outcome = services.retriever.ingest(&request).await?;
            print_json(&outcome)?;
        }
        Commands::Research {
            subject,
            name,
            sections,
        } => {
            let services = Services::from_config(&cfg)?;
            let sections = if sections.is_empty() {
                services.research.known_sections().map(str::to_string).collect()
            } else {
                sections
            };
            let request = ResearchRequest {
                subject_id: subject,
                display_name: name,
                sections,
                prefetched: None,
            };
            let report = services.research.research(&request).await?;
            print_json(&report)?;
        }
    }

    Ok(())
}
