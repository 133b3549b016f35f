//! # CompileFlow CLI (`cflow`)
//!
//! Runs the extraction pipeline locally or starts the HTTP server.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cflow init` | Create the SQLite database and run schema migrations |
//! | `cflow serve` | Start the HTTP API |
//! | `cflow classify <files>` | Split and classify files into logical documents |
//! | `cflow suggest <files>` | Propose fields for a document set |
//! | `cflow extract <files> --fields <json>` | Extract fields, optionally streaming partials |
//! | `cflow template save <json> --supplier <name>` | Save a template |
//! | `cflow template match <supplier>` | Rank saved templates |
//! | `cflow export <result.json>` | Print an extraction result as CSV |
//! | `cflow agent --job <id> <urls>` | Run the orchestrator for a job |
//!
//! ## Examples
//!
//! ```bash
//! cflow init --config ./config/cflow.toml
//! cflow classify scans/batch.pdf
//! cflow extract invoice.pdf --fields fields.json --job job-42 --stream
//! cflow template match "Acme Corp" --client "Globex"
//! cflow export result.json --fields fields.json --labels labels.json > result.csv
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

use compileflow::agent::AgentRequest;
use compileflow::config::{self, Config};
use compileflow::extract::{ExtractionEnvelope, ExtractionFrame};
use compileflow::migrate;
use compileflow::pipeline::Pipeline;
use compileflow::server;
use compileflow::source::{guess_mime, SourceFile};
use compileflow_core::csv::{export_csv, CsvLayout};
use compileflow_core::models::{ConversationTurn, ExtractionResult, FieldSet, TurnRole};

/// CompileFlow: classify trade documents, match supplier templates, and
/// extract structured fields.
///
/// All commands accept `--config`. A missing config file means defaults
/// (model and embeddings disabled).
#[derive(Parser)]
#[command(
    name = "cflow",
    about = "CompileFlow: document classification, template matching, and field extraction",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to rerun.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Split files into logical documents and store the excerpts.
    Classify {
        files: Vec<PathBuf>,

        /// Record the documents under this job id.
        #[arg(long)]
        job: Option<String>,
    },

    /// Propose header and line-item fields for a document set.
    Suggest { files: Vec<PathBuf> },

    /// Extract fields from files.
    Extract {
        files: Vec<PathBuf>,

        /// JSON file with `headerFields` and `lineItemFields`.
        #[arg(long)]
        fields: PathBuf,

        /// Persist the final result (and snapshots, with --stream) under this job id.
        #[arg(long)]
        job: Option<String>,

        /// Print each partial result as a JSON line.
        #[arg(long)]
        stream: bool,
    },

    /// Manage saved templates.
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Print an extraction result (as returned by `extract`) as CSV.
    Export {
        result: PathBuf,

        /// Field lists that fix column order and titles.
        #[arg(long)]
        fields: Option<PathBuf>,

        /// JSON object mapping field names to column titles.
        #[arg(long)]
        labels: Option<PathBuf>,
    },

    /// Run the orchestrator over document URLs.
    Agent {
        #[arg(long)]
        job: String,

        urls: Vec<String>,

        #[arg(long)]
        message: Option<String>,

        #[arg(long)]
        client: Option<String>,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Save (or replace) the template for a supplier and client.
    Save {
        /// JSON file with `headerFields` and `lineItemFields`.
        fields: PathBuf,

        #[arg(long)]
        supplier: String,

        #[arg(long)]
        client: Option<String>,
    },

    /// List saved templates closest to a supplier.
    Match {
        supplier: String,

        #[arg(long)]
        client: Option<String>,
    },
}

fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn read_sources(paths: &[PathBuf]) -> Result<Vec<SourceFile>> {
    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mime = guess_mime(&file_name);
        sources.push(SourceFile::new(file_name, mime, bytes));
    }
    Ok(sources)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("compileflow=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_or_default(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(cfg).await?;
        }
        Commands::Export {
            result,
            fields,
            labels,
        } => {
            // Either a bare result or the envelope printed by `extract`.
            let mut value: serde_json::Value = read_json(&result)?;
            if let Some(inner) = value.get_mut("extractedData") {
                value = inner.take();
            }
            let data: ExtractionResult = serde_json::from_value(value)
                .with_context(|| format!("{} is not an extraction result", result.display()))?;
            let mut layout = match fields {
                Some(path) => CsvLayout::from_fields(&read_json::<FieldSet>(&path)?),
                None => CsvLayout::default(),
            };
            if let Some(path) = labels {
                let labels: HashMap<String, String> = read_json(&path)?;
                layout.labels.extend(labels);
            }
            print!("{}", export_csv(&data, &layout));
        }
        command => run_pipeline_command(cfg, command).await?,
    }

    Ok(())
}

/// Commands that need the database and providers.
async fn run_pipeline_command(cfg: Config, command: Commands) -> Result<()> {
    let pipeline = Pipeline::from_config(cfg).await?;

    match command {
        Commands::Classify { files, job } => {
            let sources = read_sources(&files).await?;
            let outcome = pipeline.segmenter().segment_batch(&sources).await?;
            if let Some(job) = job {
                pipeline.jobs().record_documents(&job, &outcome.documents).await?;
            }
            print_json(&outcome)?;
        }
        Commands::Suggest { files } => {
            let sources = read_sources(&files).await?;
            print_json(&pipeline.suggester().suggest(&sources).await?)?;
        }
        Commands::Extract {
            files,
            fields,
            job,
            stream,
        } => {
            let sources = read_sources(&files).await?;
            let fields: FieldSet = read_json(&fields)?;
            if stream {
                let job = job.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let mut frames = pipeline
                    .extractor()
                    .extract_streaming(&job, sources, fields)
                    .await?;
                while let Some(frame) = frames.next().await {
                    println!("{}", serde_json::to_string(&frame)?);
                    if let ExtractionFrame::Error { message } = frame {
                        anyhow::bail!("extraction failed: {}", message);
                    }
                }
            } else {
                let count = sources.len();
                let result = pipeline.extractor().extract(&sources, &fields).await?;
                if let Some(job) = job {
                    let snapshot = serde_json::json!({ "final": true, "data": &result });
                    pipeline.jobs().put_snapshot(&job, &snapshot).await?;
                }
                print_json(&ExtractionEnvelope::new(result, &fields, count))?;
            }
        }
        Commands::Template { action } => match action {
            TemplateAction::Save {
                fields,
                supplier,
                client,
            } => {
                let fields: FieldSet = read_json(&fields)?;
                let template = pipeline
                    .templates()
                    .save_template(&supplier, client.as_deref(), fields)
                    .await?;
                println!("Saved template {} for {}", template.id, template.supplier);
            }
            TemplateAction::Match { supplier, client } => {
                let matches = pipeline
                    .templates()
                    .match_templates(&supplier, client.as_deref())
                    .await?;
                if matches.is_empty() {
                    println!("No templates saved.");
                }
                for m in matches {
                    println!(
                        "{:.4}  {}  {}{}",
                        m.score,
                        m.template.id,
                        m.template.supplier,
                        m.template
                            .client_name
                            .map(|c| format!(" / {}", c))
                            .unwrap_or_default()
                    );
                }
            }
        },
        Commands::Agent {
            job,
            urls,
            message,
            client,
        } => {
            let messages = message
                .map(|content| {
                    vec![ConversationTurn {
                        role: TurnRole::User,
                        content,
                    }]
                })
                .unwrap_or_default();
            let outcome = pipeline
                .orchestrator()
                .run(AgentRequest {
                    job_id: job,
                    document_urls: urls,
                    messages,
                    client_name: client,
                })
                .await?;
            print_json(&outcome)?;
        }
        Commands::Init | Commands::Serve | Commands::Export { .. } => {}
    }

    Ok(())
}
