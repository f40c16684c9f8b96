//! Axum API surface: sync trigger + dashboard KPI endpoints.

use std::sync::Arc;
use std::time::Duration;

use apd_core::{
    cents_to_major, days_in_month, derive_budget_pacing, derive_period_kpis, BudgetConfig, DateRange,
};
use apd_store::{CampaignRollupRow, Store};
use apd_sync::{parse_env_var, ConfigError, SyncConfig, SyncEngine};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, NaiveDate};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, warn};

pub const CRATE_NAME: &str = "apd-web";

pub const INSIGHT_FALLBACK: &str =
    "The insight service is temporarily unavailable. Please try again later.";
pub const INSIGHT_NO_DATA: &str = "Not enough data in the selected period to generate an insight.";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub database_url: String,
    pub budget: BudgetConfig,
    pub insight_service_url: Option<String>,
}

impl WebConfig {
    /// Build from the environment. A malformed budget ceiling or pacing ratio
    /// is a startup error, not a silent fall back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let budget = BudgetConfig {
            monthly_budget_cents: parse_env_var("APD_MONTHLY_BUDGET_CENTS", 2_000_000)?,
            over_pace_ratio: parse_env_var("APD_PACING_OVER_RATIO", 1.10)?,
            under_pace_ratio: parse_env_var("APD_PACING_UNDER_RATIO", 0.90)?,
        };
        Ok(Self {
            port: parse_env_var("APD_WEB_PORT", 8000)?,
            database_url: std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://apd.db".to_string()),
            budget,
            insight_service_url: std::env::var("APD_INSIGHT_SERVICE_URL").ok(),
        })
    }
}

/// Client for the best-effort narrative text service. Its failure must never
/// interrupt KPI delivery, so every path degrades to a static fallback.
#[derive(Clone)]
pub struct InsightClient {
    http: reqwest::Client,
    service_url: Option<String>,
}

impl InsightClient {
    pub fn new(service_url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self { http, service_url }
    }

    /// Returns the narrative text and whether the response is degraded.
    pub async fn generate(&self, rollup: &[CampaignRollupRow]) -> (String, bool) {
        let Some(url) = &self.service_url else {
            return (INSIGHT_FALLBACK.to_string(), true);
        };

        let payload = json!({ "campaigns": rollup_summary(rollup) });
        let result = async {
            let response = self.http.post(url).json(&payload).send().await?;
            let body: serde_json::Value = response.error_for_status()?.json().await?;
            Ok::<_, reqwest::Error>(body.get("insight").and_then(|v| v.as_str()).map(str::to_string))
        }
        .await;

        match result {
            Ok(Some(text)) => (text, false),
            Ok(None) => {
                warn!("insight service replied without an insight field");
                (INSIGHT_FALLBACK.to_string(), true)
            }
            Err(err) => {
                warn!(%err, "insight service call failed, using fallback");
                (INSIGHT_FALLBACK.to_string(), true)
            }
        }
    }
}

/// Per-campaign performance summary handed to the narrative service.
pub fn rollup_summary(rollup: &[CampaignRollupRow]) -> Vec<serde_json::Value> {
    rollup
        .iter()
        .map(|row| {
            let total_spend = cents_to_major(row.spend_cents);
            let cpa = if row.leads > 0 {
                round2(total_spend / row.leads as f64)
            } else {
                0.0
            };
            json!({
                "campaign_name": row.campaign_name,
                "total_spend": round2(total_spend),
                "average_roas": round2(row.average_roas),
                "total_clicks": row.clicks,
                "total_leads": row.leads,
                "cpa": cpa,
            })
        })
        .collect()
}

pub struct AppState {
    pub store: Store,
    pub budget: BudgetConfig,
    pub insight: InsightClient,
    /// Present only when upstream credentials are configured; the sync
    /// endpoint reports a configuration error otherwise.
    pub sync_config: Option<SyncConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RangeQuery {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl RangeQuery {
    /// Both bounds are required to form a range; a lone bound is ignored,
    /// matching the all-history default.
    pub fn to_range(&self) -> Option<DateRange> {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => Some(DateRange::new(start, end)),
            _ => None,
        }
    }
}

struct AppError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(err = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": self.0.to_string() })),
        )
            .into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", post(sync_handler))
        .route("/api/dashboard/kpis", get(kpis_handler))
        .route("/api/dashboard/campaigns", get(campaigns_handler))
        .route("/api/dashboard/chart", get(chart_handler))
        .route("/api/dashboard/daily-details", get(daily_details_handler))
        .route("/api/dashboard/campaign-rollup", get(campaign_rollup_handler))
        .route("/api/dashboard/insight", get(insight_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WebConfig::from_env()?;
    let store = Store::connect(&config.database_url).await?;
    store.migrate().await?;
    let state = AppState {
        store,
        budget: config.budget,
        insight: InsightClient::new(config.insight_service_url.clone()),
        sync_config: SyncConfig::from_env().ok(),
    };
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let Some(config) = &state.sync_config else {
        return Err(anyhow::anyhow!("sync is not configured: missing upstream credentials").into());
    };
    let engine = SyncEngine::from_config(config).await?;
    let summary = engine.sync_all().await?;
    Ok(Json(json!({
        "message": "full sync completed",
        "summary": summary,
    })))
}

async fn kpis_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let totals = state.store.period_totals(query.to_range()).await?;
    let kpis = derive_period_kpis(totals);

    // Budget pacing is always the current calendar month, independent of the
    // caller's selected period.
    let today = Local::now().date_naive();
    let month = DateRange::calendar_month_of(today);
    let monthly_spend_cents = state.store.spend_between(month).await?;
    let today_spend_cents = state.store.spend_on(today).await?;
    let pacing = derive_budget_pacing(
        &state.budget,
        days_in_month(today),
        monthly_spend_cents,
        today_spend_cents,
    );

    Ok(Json(json!({
        "period": {
            "total_spend": round2(kpis.total_spend),
            "average_roas": round2(kpis.average_roas),
            "average_cpa": round2(kpis.average_cpa),
            "total_leads": kpis.total_leads,
        },
        "budget": pacing,
    })))
}

async fn campaigns_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let campaigns = state.store.campaigns_with_metrics(query.to_range()).await?;
    Ok(Json(serde_json::to_value(campaigns)?))
}

async fn chart_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let series = state.store.daily_series(query.to_range()).await?;
    let points: Vec<_> = series
        .iter()
        .map(|row| {
            json!({
                "date": row.metric_date.format("%Y-%m-%d").to_string(),
                "spend": round2(cents_to_major(row.spend_cents)),
                "roas": round2(row.average_roas),
            })
        })
        .collect();
    Ok(Json(serde_json::Value::Array(points)))
}

async fn daily_details_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let rows = state.store.daily_detail_rows(query.to_range()).await?;
    Ok(Json(serde_json::to_value(rows)?))
}

async fn campaign_rollup_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let rollup = state.store.campaign_rollup(query.to_range()).await?;
    Ok(Json(serde_json::Value::Array(rollup_summary(&rollup))))
}

async fn insight_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let rollup = state.store.campaign_rollup(query.to_range()).await?;
    if rollup.is_empty() {
        return Ok(Json(json!({ "insight": INSIGHT_NO_DATA, "degraded": false })));
    }
    let (insight, degraded) = state.insight.generate(&rollup).await;
    Ok(Json(json!({ "insight": insight, "degraded": degraded })))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
