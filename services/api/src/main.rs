//! API Service - Dashboard statistics for Brainnova
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /stats - Row counts per table
//! - GET /indicators/latest - Most recent value per indicator
//! - GET /averages - Average value for a territory and sector
//! - GET /trends - Value per period for one indicator
//! - GET /kpis - Headline numbers for the dashboard
//! - GET /report-metadata - Indicators, periods and countries with data

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use common::aggregate::{self, TerritoryFilter};
use common::model::{IndicatorResult, COUNTED_TABLES};
use common::store::DEFAULT_MAX_ROWS;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct StatsResponse {
    counts: BTreeMap<String, u64>,
}

#[derive(Serialize)]
struct AverageResponse {
    indicador: Option<String>,
    filter: TerritoryFilter,
    #[serde(flatten)]
    average: Option<aggregate::TerritoryAverage>,
}

#[derive(Serialize)]
struct TrendResponse {
    indicador: String,
    points: Vec<aggregate::TrendPoint>,
}

/// A `resultado_indicadores` row as read from Postgres. Numeric columns are
/// cast in SQL so the decode types do not depend on the column definitions.
#[derive(Debug, sqlx::FromRow)]
struct ResultRow {
    id: i64,
    valor_calculado: Option<f64>,
    fecha_calculo: Option<NaiveDate>,
    nombre_indicador: Option<String>,
    periodo: i32,
    pais: Option<String>,
    provincia: Option<String>,
    sector: Option<String>,
}

impl From<ResultRow> for IndicatorResult {
    fn from(row: ResultRow) -> Self {
        IndicatorResult {
            id: row.id,
            valor_calculado: row.valor_calculado,
            fecha_calculo: row.fecha_calculo,
            nombre_indicador: row.nombre_indicador,
            periodo: row.periodo,
            pais: row.pais,
            provincia: row.provincia,
            sector: row.sector,
        }
    }
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct TerritoryQuery {
    indicador: Option<String>,
    pais: Option<String>,
    provincia: Option<String>,
    sector: Option<String>,
    periodo: Option<i32>,
    #[serde(default)]
    assume_percent: bool,
}

impl TerritoryQuery {
    fn filter(&self) -> TerritoryFilter {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
        TerritoryFilter {
            pais: non_empty(&self.pais),
            provincia: non_empty(&self.provincia),
            sector: non_empty(&self.sector),
            periodo: self.periodo,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TrendQuery {
    indicador: String,
    pais: Option<String>,
    provincia: Option<String>,
    sector: Option<String>,
}

// ============================================================================
// Data access
// ============================================================================

/// Newest periods first, so a capped read drops the oldest results.
const RESULTS_SQL: &str = r#"
    SELECT
        id::int8 AS id,
        valor_calculado::float8 AS valor_calculado,
        fecha_calculo::date AS fecha_calculo,
        nombre_indicador,
        COALESCE(periodo, 0)::int4 AS periodo,
        pais,
        provincia,
        sector
    FROM resultado_indicadores
    WHERE valor_calculado IS NOT NULL
      AND ($1::text IS NULL OR LOWER(nombre_indicador) = LOWER($1))
    ORDER BY COALESCE(periodo, 0) DESC, id
    LIMIT $2
"#;

async fn fetch_results(pool: &PgPool, indicador: Option<&str>) -> sqlx::Result<Vec<IndicatorResult>> {
    let rows: Vec<ResultRow> = sqlx::query_as(RESULTS_SQL)
        .bind(indicador)
        .bind(DEFAULT_MAX_ROWS as i64)
        .fetch_all(pool)
        .await?;
    reached_cap(rows.len(), DEFAULT_MAX_ROWS);
    Ok(rows.into_iter().map(IndicatorResult::from).collect())
}

/// Warns when a read returned the full row cap; older rows were left out.
fn reached_cap(fetched: usize, max_rows: usize) -> bool {
    let capped = fetched >= max_rows;
    if capped {
        warn!(max_rows, "Result read hit the row cap; oldest periods left out");
    }
    capped
}

/// Row count per dashboard table. Table names come from the model, never
/// from the request.
async fn count_rows(pool: &PgPool) -> sqlx::Result<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();
    for (label, table) in COUNTED_TABLES {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await?;
        counts.insert(label.to_string(), count.max(0) as u64);
    }
    Ok(counts)
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn db_error(e: sqlx::Error) -> Response {
    error!(error = %e, "Database query failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match count_rows(&state.pool).await {
        Ok(counts) => Json(StatsResponse { counts }).into_response(),
        Err(e) => db_error(e),
    }
}

async fn latest_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TerritoryQuery>,
) -> impl IntoResponse {
    let rows = match fetch_results(&state.pool, params.indicador.as_deref()).await {
        Ok(rows) => rows,
        Err(e) => return db_error(e),
    };
    let latest = aggregate::latest_by_indicator(&rows, &params.filter());
    Json(serde_json::json!({ "indicators": latest })).into_response()
}

async fn averages_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TerritoryQuery>,
) -> impl IntoResponse {
    let rows = match fetch_results(&state.pool, params.indicador.as_deref()).await {
        Ok(rows) => rows,
        Err(e) => return db_error(e),
    };
    let filter = params.filter();
    let average = aggregate::territory_average(
        &rows,
        params.indicador.as_deref(),
        &filter,
        params.assume_percent,
    );

    match average {
        Some(average) => Json(AverageResponse {
            indicador: params.indicador,
            filter,
            average: Some(average),
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No data for the requested territory"),
    }
}

async fn trends_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TrendQuery>,
) -> impl IntoResponse {
    let rows = match fetch_results(&state.pool, Some(&params.indicador)).await {
        Ok(rows) => rows,
        Err(e) => return db_error(e),
    };
    let filter = TerritoryFilter {
        pais: params.pais,
        provincia: params.provincia,
        sector: params.sector,
        periodo: None,
    };
    let points = aggregate::trend(&rows, &params.indicador, &filter);
    Json(TrendResponse {
        indicador: params.indicador,
        points,
    })
    .into_response()
}

async fn kpis_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TerritoryQuery>,
) -> impl IntoResponse {
    let rows = match fetch_results(&state.pool, None).await {
        Ok(rows) => rows,
        Err(e) => return db_error(e),
    };
    Json(aggregate::kpi_summary(&rows, &params.filter())).into_response()
}

async fn report_metadata_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let counts = match count_rows(&state.pool).await {
        Ok(counts) => counts,
        Err(e) => return db_error(e),
    };
    let rows = match fetch_results(&state.pool, None).await {
        Ok(rows) => rows,
        Err(e) => return db_error(e),
    };
    Json(aggregate::report_metadata(&rows, counts)).into_response()
}

// ============================================================================
// Main
// ============================================================================

fn app(state: Arc<AppState>) -> Router {
    // CORS for the dashboard frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/indicators/latest", get(latest_handler))
        .route("/averages", get(averages_handler))
        .route("/trends", get(trends_handler))
        .route("/kpis", get(kpis_handler))
        .route("/report-metadata", get(report_metadata_handler))
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    common::logging::init("info,sqlx=warn")?;

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Brainnova API ===");
    println!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    info!("Database connected");

    let state = Arc::new(AppState { pool });
    let app = app(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /stats");
    println!("  GET /indicators/latest?indicador=&pais=&provincia=&sector=&periodo=");
    println!("  GET /averages?indicador=&pais=&provincia=&sector=&periodo=&assume_percent=");
    println!("  GET /trends?indicador=&pais=&provincia=&sector=");
    println!("  GET /kpis?pais=&provincia=&sector=");
    println!("  GET /report-metadata");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    /// State whose pool never connects; fine for routes that do not query.
    fn lazy_state() -> Arc<AppState> {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://brainnova@localhost/brainnova")
            .unwrap();
        Arc::new(AppState { pool })
    }

    #[tokio::test]
    async fn test_health_route() {
        let response = app(lazy_state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], true);
    }

    #[tokio::test]
    async fn test_trends_requires_indicator() {
        let response = app(lazy_state())
            .oneshot(Request::builder().uri("/trends?pais=Espa%C3%B1a").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response = app(lazy_state())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_results_read_newest_periods_first() {
        let order = RESULTS_SQL
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("ORDER BY"))
            .unwrap();
        assert_eq!(order, "ORDER BY COALESCE(periodo, 0) DESC, id");
    }

    #[test]
    fn test_reached_cap() {
        assert!(!reached_cap(10, DEFAULT_MAX_ROWS));
        assert!(reached_cap(DEFAULT_MAX_ROWS, DEFAULT_MAX_ROWS));
    }

    #[test]
    fn test_territory_query_drops_blank_filters() {
        let query = TerritoryQuery {
            pais: Some("España".to_string()),
            provincia: Some("  ".to_string()),
            periodo: Some(2023),
            ..TerritoryQuery::default()
        };
        let filter = query.filter();
        assert_eq!(filter.pais.as_deref(), Some("España"));
        assert_eq!(filter.provincia, None);
        assert_eq!(filter.periodo, Some(2023));
    }

    #[test]
    fn test_result_row_conversion() {
        let row = ResultRow {
            id: 5000001,
            valor_calculado: Some(42.5),
            fecha_calculo: NaiveDate::from_ymd_opt(2024, 1, 15),
            nombre_indicador: Some("Conectividad".to_string()),
            periodo: 2023,
            pais: Some("España".to_string()),
            provincia: None,
            sector: None,
        };
        let result = IndicatorResult::from(row);
        assert_eq!(result.id, 5000001);
        assert_eq!(result.valor_calculado, Some(42.5));
        assert_eq!(result.nombre_indicador.as_deref(), Some("Conectividad"));
    }

    #[test]
    fn test_average_response_flattens_average() {
        let response = AverageResponse {
            indicador: Some("Conectividad".to_string()),
            filter: TerritoryFilter::default(),
            average: aggregate::territory_average(
                &[IndicatorResult {
                    id: 1,
                    valor_calculado: Some(250.0),
                    fecha_calculo: None,
                    nombre_indicador: Some("Conectividad".to_string()),
                    periodo: 2023,
                    pais: Some("España".to_string()),
                    provincia: None,
                    sector: None,
                }],
                Some("Conectividad"),
                &TerritoryFilter::default(),
                false,
            ),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["average"], 250.0);
        assert_eq!(json["rescaled"], false);
        assert_eq!(json["count"], 1);
    }
}
