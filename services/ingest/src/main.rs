//! Ingest Service - Loads Brainnova CSV exports into the hosted store
//!
//! Responsibilities:
//! - Parse table exports (CSV or spreadsheet) into typed rows
//! - Normalize text and numbers to the store column limits
//! - Upsert rows in batches, counting failed batches without aborting
//! - Backfill denormalized indicator names on stored results
//!
//! Usage:
//!   # Upload a table from data/<table>.csv:
//!   cargo run --bin ingest -- raw-data
//!
//!   # Upload from a specific file, without writing:
//!   cargo run --bin ingest -- --dry-run component-links --file exports/links.csv
//!
//!   # Fill missing indicator names on results:
//!   cargo run --bin ingest -- backfill-names --schema-version auto

mod backfill;
mod layout;
mod orchestrator;
mod resolver;
mod source;

use anyhow::{Context, Result};
use backfill::{backfill_names, BackfillOptions, BACKFILL_BATCH_SIZE};
use clap::{Parser, Subcommand, ValueEnum};
use common::config::{SchemaVersion, StoreConfig};
use common::model::{
    ComponentLink, Dimension, IndicatorDefinition, IndicatorResult, RawDataLink, RawDatum,
    Subdimension, Table,
};
use common::normalize::FieldLimits;
use common::store::{Filter, MemoryStore, RestStore, Store, DEFAULT_MAX_ROWS, DEFAULT_PAGE_SIZE};
use layout::{parse_records, FromRecord};
use orchestrator::{upload, UploadOptions, WriteMode};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Loads Brainnova table exports into the hosted store")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Dry run - parse and batch against an in-memory store
    #[arg(long, global = true, default_value = "false")]
    dry_run: bool,

    /// Rows per request (defaults to the table's batch size)
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Text column limit override, e.g. --max-len descripcion=30
    #[arg(long = "max-len", global = true, value_parser = parse_max_len)]
    max_len: Vec<(String, usize)>,

    /// Field delimiter of CSV input
    #[arg(long, global = true, default_value = ",")]
    delimiter: char,
}

#[derive(clap::Args, Debug, Clone)]
struct UploadArgs {
    /// Input file (defaults to data/<table>.csv)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Plain insert instead of upsert on the conflict key
    #[arg(long, default_value = "false")]
    insert: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload indicator definitions (definicion_indicadores)
    Indicators(UploadArgs),
    /// Upload dimensions (dimensiones)
    Dimensions(UploadArgs),
    /// Upload subdimensions (subdimensiones)
    Subdimensions(UploadArgs),
    /// Upload raw data (datos_brutos)
    RawData(UploadArgs),
    /// Upload indicator results (resultado_indicadores)
    Results(UploadArgs),
    /// Upload result-component links (componente_resultado)
    ComponentLinks(UploadArgs),
    /// Upload result-raw data links (resultado_datos_brutos)
    RawDataLinks(UploadArgs),
    /// Fill resultado_indicadores.nombre_indicador from the lookup tables
    BackfillNames {
        /// Which join path the schema populates
        #[arg(long, env = "BRAINNOVA_SCHEMA_VERSION", default_value = "auto")]
        schema_version: SchemaVersion,

        /// Maximum rows scanned per table
        #[arg(long, default_value_t = DEFAULT_MAX_ROWS)]
        max_rows: usize,

        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,

        /// Also rewrite names that are already set
        #[arg(long, default_value = "false")]
        all: bool,
    },
    /// Delete the lineage links of one result
    PurgeAssociations {
        #[arg(long, value_enum)]
        table: LinkTable,

        /// Result id whose links are removed
        #[arg(long)]
        resultado: i64,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LinkTable {
    ComponentLinks,
    RawDataLinks,
}

impl LinkTable {
    fn name(self) -> &'static str {
        match self {
            LinkTable::ComponentLinks => ComponentLink::NAME,
            LinkTable::RawDataLinks => RawDataLink::NAME,
        }
    }
}

fn parse_max_len(s: &str) -> std::result::Result<(String, usize), String> {
    let (column, max) = s
        .split_once('=')
        .ok_or_else(|| format!("expected column=N, got {}", s))?;
    let max: usize = max
        .trim()
        .parse()
        .map_err(|_| format!("invalid length in {}", s))?;
    if max == 0 {
        return Err(format!("length must be positive in {}", s));
    }
    Ok((column.trim().to_string(), max))
}

// =============================================================================
// Commands
// =============================================================================

fn default_path<T: Table>() -> PathBuf {
    PathBuf::from("data").join(format!("{}.csv", T::NAME))
}

fn field_limits<T: Table>(overrides: &[(String, usize)]) -> FieldLimits {
    let mut limits = FieldLimits::for_table::<T>().with_overrides(|key| std::env::var(key).ok());
    for (column, max) in overrides {
        limits.set(column, *max);
    }
    limits
}

/// Parse one input file into `T` rows and upload them. Returns whether every
/// row was written.
async fn run_upload<T: FromRecord>(store: &dyn Store, args: &Args, upload_args: &UploadArgs) -> Result<bool> {
    let path = upload_args.file.clone().unwrap_or_else(default_path::<T>);
    let delimiter = u8::try_from(args.delimiter)
        .context("Delimiter must be a single-byte character")?;
    let limits = field_limits::<T>(&args.max_len);

    println!("\n[{}]", T::NAME);
    println!("  File: {}", path.display());

    let source = source::load(&path, delimiter).await?;
    println!("  Hash: {}", source.content_hash);
    println!("  Records: {}", source.records.len());

    let (rows, skipped) =
        parse_records::<T>(source.records, source.headers.len(), args.delimiter, &limits);
    if skipped > 0 {
        warn!(table = T::NAME, skipped, "Rows skipped during parsing");
    }
    println!("  Parsed: {} rows ({} skipped)", rows.len(), skipped);

    let mut opts = UploadOptions::for_table::<T>();
    if let Some(batch_size) = args.batch_size {
        opts.batch_size = batch_size;
    }
    if upload_args.insert {
        opts.mode = WriteMode::Insert;
    }

    let mut summary = upload(store, &rows, opts).await?;
    summary.skipped = skipped;
    summary.print();
    Ok(summary.is_success())
}

async fn run_backfill(
    store: &dyn Store,
    args: &Args,
    schema: SchemaVersion,
    max_rows: usize,
    page_size: usize,
    all: bool,
) -> Result<bool> {
    println!("\n[backfill-names]");
    println!("  Schema version: {}", schema);

    let report = backfill_names(
        store,
        BackfillOptions {
            schema,
            page_size,
            max_rows,
            batch_size: args.batch_size.unwrap_or(BACKFILL_BATCH_SIZE),
            only_missing: !all,
        },
    )
    .await?;

    if !report.no_op {
        println!("Scanned: {}", report.scanned);
        println!("Candidates: {}", report.candidates);
        report.summary.print();
    }
    Ok(report.is_success())
}

async fn run_purge(store: &dyn Store, table: LinkTable, resultado: i64) -> Result<bool> {
    let deleted = store
        .delete(table.name(), &Filter::new().eq("id_resultado", resultado))
        .await
        .with_context(|| format!("Failed to purge {} for result {}", table.name(), resultado))?;
    println!("Deleted {} row(s) from {} for result {}", deleted, table.name(), resultado);
    Ok(true)
}

async fn run(args: Args) -> Result<bool> {
    let run_id = Uuid::new_v4();
    info!(%run_id, dry_run = args.dry_run, "Starting ingest run");

    println!("=== Brainnova Ingest ===");

    let store: Box<dyn Store> = if args.dry_run {
        println!("Store: in-memory (dry run)");
        Box::new(MemoryStore::new())
    } else {
        let config = StoreConfig::from_env()?;
        println!("Store: {} ({} key)", config.url, config.key_kind);
        Box::new(RestStore::new(&config)?)
    };
    let store = store.as_ref();

    match &args.command {
        Command::Indicators(a) => run_upload::<IndicatorDefinition>(store, &args, a).await,
        Command::Dimensions(a) => run_upload::<Dimension>(store, &args, a).await,
        Command::Subdimensions(a) => run_upload::<Subdimension>(store, &args, a).await,
        Command::RawData(a) => run_upload::<RawDatum>(store, &args, a).await,
        Command::Results(a) => run_upload::<IndicatorResult>(store, &args, a).await,
        Command::ComponentLinks(a) => run_upload::<ComponentLink>(store, &args, a).await,
        Command::RawDataLinks(a) => run_upload::<RawDataLink>(store, &args, a).await,
        Command::BackfillNames {
            schema_version,
            max_rows,
            page_size,
            all,
        } => run_backfill(store, &args, *schema_version, *max_rows, *page_size, *all).await,
        Command::PurgeAssociations { table, resultado } => run_purge(store, *table, *resultado).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = common::logging::init("info") {
        eprintln!("Failed to initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            println!("\nSome rows failed; see the log for details");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "Ingest failed");
            ExitCode::FAILURE
        }
    }
}
