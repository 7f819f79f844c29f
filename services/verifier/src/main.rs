//! Verifier Service - Checks that a report can be built from stored data
//!
//! Responsibilities:
//! - Check the API health endpoint
//! - Fetch report metadata from the API, with a request timeout
//! - Fall back to computing the metadata straight from the hosted store
//! - Compare the metadata against the report's requirements
//!
//! Usage:
//!   cargo run --bin verifier -- --report reports/informe_anual.json
//!
//!   # Against a specific API, with a shorter timeout:
//!   cargo run --bin verifier -- --report reports/informe_anual.json --api-url http://localhost:8080 --timeout-secs 3

use anyhow::{Context, Result};
use clap::Parser;
use common::aggregate::{self, fold, match_country, CountryMatch, ReportMetadata};
use common::config::StoreConfig;
use common::model::{IndicatorResult, COUNTED_TABLES};
use common::model::Table;
use common::store::{fetch_all, RestStore, Select, Store, DEFAULT_MAX_ROWS, DEFAULT_PAGE_SIZE};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "verifier", about = "Checks report metadata against stored indicator data")]
struct Args {
    /// Report requirements file (JSON)
    #[arg(long)]
    report: PathBuf,

    /// Base URL of the API service
    #[arg(long, env = "API_URL")]
    api_url: Option<String>,

    /// Timeout for each API request
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Do not fall back to the hosted store when the API is unavailable
    #[arg(long, default_value = "false")]
    no_fallback: bool,
}

// =============================================================================
// Report requirements
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ReportSpec {
    #[serde(default)]
    name: String,
    #[serde(default)]
    required_indicators: Vec<String>,
    #[serde(default)]
    periods: Vec<i32>,
    #[serde(default)]
    countries: Vec<String>,
    /// Minimum row count per counted table label
    #[serde(default)]
    min_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    ok: bool,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetadataSource {
    Api,
    Store,
}

#[derive(Debug, Default, PartialEq)]
struct Verification {
    missing_indicators: Vec<String>,
    missing_periods: Vec<i32>,
    missing_countries: Vec<String>,
    /// (label, required, found)
    short_counts: Vec<(String, u64, u64)>,
}

impl Verification {
    fn is_complete(&self) -> bool {
        self.missing_indicators.is_empty()
            && self.missing_periods.is_empty()
            && self.missing_countries.is_empty()
            && self.short_counts.is_empty()
    }
}

async fn load_report(path: &Path) -> Result<ReportSpec> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read report file {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse report file")
}

// =============================================================================
// Metadata sources
// =============================================================================

async fn check_health(client: &reqwest::Client, api_url: &str) -> Result<HealthResponse> {
    let url = format!("{}/health", api_url.trim_end_matches('/'));
    let health: HealthResponse = client
        .get(&url)
        .send()
        .await?
        .error_for_status()
        .context("Health check failed")?
        .json()
        .await
        .context("Unexpected health response")?;
    if !health.ok {
        anyhow::bail!("API reports unhealthy");
    }
    Ok(health)
}

async fn fetch_metadata(client: &reqwest::Client, api_url: &str) -> Result<ReportMetadata> {
    let url = format!("{}/report-metadata", api_url.trim_end_matches('/'));
    client
        .get(&url)
        .send()
        .await?
        .error_for_status()
        .context("Report metadata request failed")?
        .json()
        .await
        .context("Unexpected report metadata response")
}

/// Health check plus metadata fetch; any failure means the API is not usable.
async fn metadata_from_api(client: &reqwest::Client, api_url: &str) -> Result<ReportMetadata> {
    let health = check_health(client, api_url).await?;
    println!(
        "  ✓ API healthy (version {})",
        health.version.as_deref().unwrap_or("unknown")
    );
    fetch_metadata(client, api_url).await
}

/// Columns the metadata needs, read leniently: a null `periodo` counts as
/// unknown (0), the same as the API's query does.
const RESULT_COLUMNS: &str = "id,valor_calculado,nombre_indicador,periodo,pais";

#[derive(Debug, Deserialize)]
struct StoredResult {
    id: i64,
    #[serde(default)]
    valor_calculado: Option<f64>,
    #[serde(default)]
    nombre_indicador: Option<String>,
    #[serde(default)]
    periodo: Option<i32>,
    #[serde(default)]
    pais: Option<String>,
}

impl From<StoredResult> for IndicatorResult {
    fn from(row: StoredResult) -> Self {
        Self {
            id: row.id,
            valor_calculado: row.valor_calculado,
            fecha_calculo: None,
            nombre_indicador: row.nombre_indicador,
            periodo: row.periodo.unwrap_or(0),
            pais: row.pais,
            provincia: None,
            sector: None,
        }
    }
}

async fn metadata_from_store(store: &dyn Store) -> Result<ReportMetadata> {
    let values = fetch_all(
        store,
        IndicatorResult::NAME,
        Select::columns(RESULT_COLUMNS),
        "id",
        DEFAULT_PAGE_SIZE,
        DEFAULT_MAX_ROWS,
    )
    .await
    .context("Failed to fetch results from store")?;
    if values.len() >= DEFAULT_MAX_ROWS {
        warn!(max_rows = DEFAULT_MAX_ROWS, "Result rows capped; metadata may be incomplete");
    }

    let rows = values
        .into_iter()
        .map(|value| serde_json::from_value::<StoredResult>(value).map(IndicatorResult::from))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Unexpected result row in store")?;

    let mut counts = BTreeMap::new();
    for (label, table) in COUNTED_TABLES {
        let count = store
            .count(table)
            .await
            .with_context(|| format!("Failed to count {}", table))?;
        counts.insert(label.to_string(), count);
    }

    Ok(aggregate::report_metadata(&rows, counts))
}

async fn resolve_metadata(args: &Args) -> Result<(ReportMetadata, MetadataSource)> {
    resolve_metadata_with(args, || {
        let config = StoreConfig::from_env()?;
        println!("Falling back to store: {}", config.url);
        Ok(Box::new(RestStore::new(&config)?) as Box<dyn Store>)
    })
    .await
}

/// API first, then the store built by `fallback` unless disabled.
async fn resolve_metadata_with<F>(args: &Args, fallback: F) -> Result<(ReportMetadata, MetadataSource)>
where
    F: FnOnce() -> Result<Box<dyn Store>>,
{
    if let Some(api_url) = &args.api_url {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(args.timeout_secs))
            .user_agent("Brainnova-Verifier/1.0")
            .build()?;

        println!("API: {}", api_url);
        match metadata_from_api(&client, api_url).await {
            Ok(metadata) => return Ok((metadata, MetadataSource::Api)),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "API unavailable");
                println!("  ✗ API unavailable: {:#}", e);
            }
        }
    } else {
        println!("API: not configured");
    }

    if args.no_fallback {
        anyhow::bail!("API unavailable and store fallback disabled");
    }

    let store = fallback()?;
    let metadata = metadata_from_store(store.as_ref()).await?;
    Ok((metadata, MetadataSource::Store))
}

// =============================================================================
// Verification
// =============================================================================

fn verify(spec: &ReportSpec, metadata: &ReportMetadata) -> Verification {
    let available: Vec<String> = metadata.indicators.iter().map(|i| fold(i)).collect();

    let missing_indicators = spec
        .required_indicators
        .iter()
        .filter(|wanted| !available.contains(&fold(wanted)))
        .cloned()
        .collect();

    let missing_periods = spec
        .periods
        .iter()
        .filter(|p| !metadata.periods.contains(p))
        .copied()
        .collect();

    let missing_countries = spec
        .countries
        .iter()
        .filter(|wanted| {
            metadata
                .countries
                .iter()
                .all(|c| match_country(Some(c.as_str()), wanted) == CountryMatch::None)
        })
        .cloned()
        .collect();

    let short_counts = spec
        .min_counts
        .iter()
        .filter_map(|(label, &required)| {
            let found = metadata.counts.get(label).copied().unwrap_or(0);
            (found < required).then(|| (label.clone(), required, found))
        })
        .collect();

    Verification {
        missing_indicators,
        missing_periods,
        missing_countries,
        short_counts,
    }
}

fn fingerprint(metadata: &ReportMetadata) -> Result<String> {
    let bytes = serde_json::to_vec(metadata)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

fn print_verification(spec: &ReportSpec, metadata: &ReportMetadata, verification: &Verification) {
    println!("\n=== Verification: {} ===", if spec.name.is_empty() { "report" } else { spec.name.as_str() });
    println!(
        "Indicators: {}/{} available",
        spec.required_indicators.len() - verification.missing_indicators.len(),
        spec.required_indicators.len()
    );
    for name in &verification.missing_indicators {
        println!("  ✗ Missing indicator: {}", name);
    }
    for periodo in &verification.missing_periods {
        println!("  ✗ Missing period: {}", periodo);
    }
    for pais in &verification.missing_countries {
        println!("  ✗ Missing country: {}", pais);
    }
    for (label, required, found) in &verification.short_counts {
        println!("  ✗ {}: {} rows, {} required", label, found, required);
    }
    println!("{:-<60}", "");
    for (label, count) in &metadata.counts {
        println!("  {}: {}", label, count);
    }
}

async fn run(args: Args) -> Result<bool> {
    println!("=== Brainnova Report Verifier ===");
    let spec = load_report(&args.report).await?;
    println!("Report: {}", args.report.display());

    let (metadata, source) = resolve_metadata(&args).await?;
    info!(?source, indicators = metadata.indicators.len(), "Metadata loaded");
    println!(
        "Metadata source: {}",
        match source {
            MetadataSource::Api => "api",
            MetadataSource::Store => "store",
        }
    );
    println!("Fingerprint: {}", fingerprint(&metadata)?);

    let verification = verify(&spec, &metadata);
    print_verification(&spec, &metadata, &verification);

    if verification.is_complete() {
        println!("\n✓ All report requirements are met");
    } else {
        println!("\n✗ Report requirements are not met");
    }
    Ok(verification.is_complete())
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
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Verification failed");
            ExitCode::FAILURE
        }
    }
}
