//! Typed HTTP client for the external ads platform API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use apd_core::{RawAdSet, RawCampaign, RawInsight};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "apd-client";

pub const CAMPAIGN_FIELDS: &str = "id,name,status,objective,created_time";
pub const AD_SET_FIELDS: &str = "id,name,status,campaign_id,daily_budget,created_time";
pub const INSIGHT_FIELDS: &str =
    "campaign_id,adset_id,spend,impressions,clicks,cpc,ctr,cpm,purchase_roas,actions,date_start";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub ad_account_id: String,
    pub access_token: String,
    pub timeout: Duration,
    pub page_limit: u32,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, ad_account_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ad_account_id: ad_account_id.into(),
            access_token: access_token.into(),
            timeout: Duration::from_secs(20),
            page_limit: 200,
        }
    }
}

/// Error payload the upstream API wraps non-success responses in.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorPayload {
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorPayload,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("upstream api error (http {status}): {}", .payload.message)]
    Api { status: u16, payload: ApiErrorPayload },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagingCursors {
    #[serde(default)]
    pub after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub cursors: Option<PagingCursors>,
    #[serde(default)]
    pub next: Option<String>,
}

/// One page of the `{ "data": [...] }` response envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
pub struct DataPage<T> {
    #[serde(default)]
    pub data: Vec<T>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

impl<T> DataPage<T> {
    /// Cursor for the next page, when the upstream indicates there is one.
    pub fn next_cursor(&self) -> Option<String> {
        let paging = self.paging.as_ref()?;
        paging.next.as_ref()?;
        paging.cursors.as_ref()?.after.clone()
    }
}

/// Seam between the sync orchestrator and the upstream platform. The real
/// client performs HTTP; tests substitute canned record sets.
#[async_trait]
pub trait AdsApi: Send + Sync {
    async fn fetch_campaigns(&self) -> Result<Vec<RawCampaign>, PlatformError>;
    async fn fetch_ad_sets(&self) -> Result<Vec<RawAdSet>, PlatformError>;
    /// Insights for exactly one calendar day; coarser windows conflate dates
    /// upstream, so the orchestrator walks the window day by day.
    async fn fetch_insights(&self, day: NaiveDate) -> Result<Vec<RawInsight>, PlatformError>;
}

#[derive(Debug)]
pub struct AdsApiClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl AdsApiClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, resource: &str) -> String {
        format!(
            "{}/{}/{resource}",
            self.config.base_url.trim_end_matches('/'),
            self.config.ad_account_id
        )
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<DataPage<T>, PlatformError> {
        let response = self.http.get(url).query(params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let final_url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ApiErrorEnvelope>(&body) {
                Ok(envelope) => PlatformError::Api {
                    status: status.as_u16(),
                    payload: envelope.error,
                },
                Err(_) => PlatformError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                },
            });
        }
        Ok(response.json().await?)
    }

    /// Fetch every page of a resource, following the `after` cursor until the
    /// upstream stops advertising a next page.
    async fn fetch_all<T: DeserializeOwned>(
        &self,
        resource: &str,
        base_params: Vec<(&'static str, String)>,
    ) -> Result<Vec<T>, PlatformError> {
        let url = self.endpoint(resource);
        let mut records = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut params = base_params.clone();
            if let Some(cursor) = &after {
                params.push(("after", cursor.clone()));
            }
            let page: DataPage<T> = self.get_page(&url, &params).await?;
            debug!(resource, page_len = page.data.len(), "fetched page");
            if page.data.is_empty() {
                break;
            }
            after = page.next_cursor();
            records.extend(page.data);
            if after.is_none() {
                break;
            }
        }

        Ok(records)
    }

    fn base_params(&self, fields: &str) -> Vec<(&'static str, String)> {
        vec![
            ("access_token", self.config.access_token.clone()),
            ("fields", fields.to_string()),
            ("limit", self.config.page_limit.to_string()),
        ]
    }
}

/// Status allow-list filter expression for campaign queries.
pub fn status_filtering_param(statuses: &[&str]) -> String {
    serde_json::json!([{
        "field": "effective_status",
        "operator": "IN",
        "value": statuses,
    }])
    .to_string()
}

/// Single-day `time_range` expression for insight queries.
pub fn single_day_time_range(day: NaiveDate) -> String {
    let formatted = day.format("%Y-%m-%d").to_string();
    serde_json::json!({ "since": formatted, "until": formatted }).to_string()
}

#[async_trait]
impl AdsApi for AdsApiClient {
    async fn fetch_campaigns(&self) -> Result<Vec<RawCampaign>, PlatformError> {
        let mut params = self.base_params(CAMPAIGN_FIELDS);
        params.push(("filtering", status_filtering_param(&["ACTIVE", "PAUSED"])));
        self.fetch_all("campaigns", params).await
    }

    async fn fetch_ad_sets(&self) -> Result<Vec<RawAdSet>, PlatformError> {
        let params = self.base_params(AD_SET_FIELDS);
        self.fetch_all("adsets", params).await
    }

    async fn fetch_insights(&self, day: NaiveDate) -> Result<Vec<RawInsight>, PlatformError> {
        let mut params = self.base_params(INSIGHT_FIELDS);
        params.push(("level", "adset".to_string()));
        params.push(("time_range", single_day_time_range(day)));
        self.fetch_all("insights", params).await
    }
}

// ---------------------------------------------------------------------------
// Retry support for the orchestrator's phase fetches
// ---------------------------------------------------------------------------

impl PlatformError {
    /// Transient upstream conditions worth retrying: rate limiting, server
    /// errors, and connection-level transport failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            PlatformError::Api { status, .. } | PlatformError::HttpStatus { status, .. } => {
                *status == 429 || (500..600).contains(status)
            }
            PlatformError::Transport(inner) => {
                inner.is_timeout() || inner.is_connect() || inner.is_request()
            }
        }
    }
}

/// Exponential backoff schedule for retrying transient upstream failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based), doubling per attempt
    /// up to the configured cap.
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
