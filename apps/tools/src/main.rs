use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use catalog::{CatalogResolver, ConceptCatalog, StaticCatalog, DEFAULT_LOOKUP_TIMEOUT};
use clap::{Parser, Subcommand};
use shared::{
    domain::{AlignmentId, ProposedAssignment, RowId, UserId},
    protocol::RawRow,
};
use storage::{SqliteAlignmentStore, SqliteReviewStore};
use sync_engine::SyncEngine;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/alignments.db")]
    alignment_database_url: String,
    #[arg(long, default_value = "sqlite://./data/review.db")]
    review_database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates an alignment, optionally seeded from a JSON array of rows.
    CreateAlignment {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        rows: Option<PathBuf>,
    },
    /// Appends rows from a JSON array of column maps.
    Import { alignment_id: i64, file: PathBuf },
    Assign {
        alignment_id: i64,
        row_id: i64,
        #[arg(long)]
        dictionary: i64,
        #[arg(long, conflicts_with = "custom")]
        standard: Option<i64>,
        #[arg(long)]
        custom: Option<i64>,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    Unassign { alignment_id: i64, row_id: i64 },
    Reconcile { alignment_id: i64 },
    /// Writes the source-to-concept map as CSV to stdout or `--output`.
    Export {
        alignment_id: i64,
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let alignments = SqliteAlignmentStore::new(&cli.alignment_database_url).await?;
    let review = SqliteReviewStore::new(&cli.review_database_url).await?;
    let engine = SyncEngine::new(Arc::new(alignments), Arc::new(review));

    match cli.command {
        Command::CreateAlignment {
            name,
            description,
            rows,
        } => {
            let alignment_id = match rows {
                Some(file) => {
                    let (alignment_id, row_ids) = engine
                        .create_alignment(&name, &description, read_rows(&file)?)
                        .await?;
                    println!("imported rows={}", row_ids.len());
                    alignment_id
                }
                None => engine.create_empty_alignment(&name, &description).await?,
            };
            println!("created alignment_id={alignment_id}");
        }
        Command::Import { alignment_id, file } => {
            let row_ids = engine
                .import_rows(AlignmentId(alignment_id), read_rows(&file)?)
                .await?;
            match (row_ids.first(), row_ids.last()) {
                (Some(first), Some(last)) => {
                    println!("imported rows={} row_ids={first}..={last}", row_ids.len())
                }
                _ => println!("imported rows=0"),
            }
        }
        Command::Assign {
            alignment_id,
            row_id,
            dictionary,
            standard,
            custom,
            user,
        } => {
            let proposed = ProposedAssignment {
                dictionary_concept_id: Some(dictionary),
                standard_concept_id: standard,
                custom_concept_id: custom,
            };
            let mapping_id = engine
                .assign(
                    AlignmentId(alignment_id),
                    RowId(row_id),
                    proposed,
                    &UserId::new(user),
                )
                .await?;
            println!("assigned mapping_id={mapping_id}");
        }
        Command::Unassign {
            alignment_id,
            row_id,
        } => {
            engine
                .unassign(AlignmentId(alignment_id), RowId(row_id))
                .await?;
            println!("unassigned row_id={row_id}");
        }
        Command::Reconcile { alignment_id } => {
            let report = engine.reconcile(AlignmentId(alignment_id)).await?;
            println!(
                "reconciled removed_missing_row={} removed_unassigned={} updated={} created={}",
                report.removed_missing_row,
                report.removed_unassigned,
                report.updated,
                report.created
            );
        }
        Command::Export {
            alignment_id,
            catalog,
            output,
            timeout_ms,
        } => {
            let catalog: Arc<dyn ConceptCatalog> = match catalog {
                Some(path) => Arc::new(StaticCatalog::load(&path)?),
                None => Arc::new(StaticCatalog::new()),
            };
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_LOOKUP_TIMEOUT);
            let resolver = CatalogResolver::new(catalog, timeout);
            let csv = engine
                .export_csv(AlignmentId(alignment_id), &resolver)
                .await?;
            match output {
                Some(path) => {
                    fs::write(&path, csv)
                        .with_context(|| format!("failed to write '{}'", path.display()))?;
                    info!(path = %path.display(), "export written");
                }
                None => print!("{csv}"),
            }
        }
    }

    Ok(())
}

fn read_rows(file: &Path) -> Result<Vec<RawRow>> {
    let raw = fs::read_to_string(file)
        .with_context(|| format!("failed to read '{}'", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("'{}' is not a JSON array of rows", file.display()))
}
