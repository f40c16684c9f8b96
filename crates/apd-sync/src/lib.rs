//! Three-phase sync orchestration: campaigns, ad sets, daily insights.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use apd_client::{AdsApi, AdsApiClient, BackoffPolicy, ClientConfig, PlatformError};
use apd_core::{normalize_ad_set, normalize_campaign, normalize_insight, DailyMetricRow, RawInsight};
use apd_store::{Store, StoreError};
use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "apd-sync";

/// Trailing window of calendar days (today inclusive) backfilled on every
/// insight sync. Each day is fetched separately because the upstream API
/// conflates dates when queried at coarser granularity.
pub const DEFAULT_BACKFILL_DAYS: u32 = 35;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{0}`")]
    MissingVar(&'static str),
    #[error("environment variable `{var}` has invalid value `{value}`")]
    InvalidVar { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub ad_account_id: String,
    pub access_token: String,
    pub database_url: String,
    pub backfill_days: u32,
    pub http_timeout_secs: u64,
    pub page_limit: u32,
}

impl SyncConfig {
    /// Build from the environment. Credentials are required up front; a sync
    /// must never get as far as a network call without them.
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_token =
            std::env::var("ADS_ACCESS_TOKEN").map_err(|_| ConfigError::MissingVar("ADS_ACCESS_TOKEN"))?;
        let ad_account_id =
            std::env::var("ADS_ACCOUNT_ID").map_err(|_| ConfigError::MissingVar("ADS_ACCOUNT_ID"))?;
        Ok(Self {
            api_base_url: std::env::var("ADS_API_BASE_URL")
                .unwrap_or_else(|_| "https://graph.facebook.com/v20.0".to_string()),
            ad_account_id,
            access_token,
            database_url: std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://apd.db".to_string()),
            backfill_days: parse_env_var("APD_BACKFILL_DAYS", DEFAULT_BACKFILL_DAYS)?,
            http_timeout_secs: parse_env_var("APD_HTTP_TIMEOUT_SECS", 20)?,
            page_limit: parse_env_var("APD_PAGE_LIMIT", 200)?,
        })
    }
}

/// Parse an optional environment variable, falling back to `default` only
/// when the variable is absent. Malformed values are an error, never a
/// silent default.
pub fn parse_env_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidVar { var, value }),
        Err(_) => Ok(default),
    }
}

/// Cause of a single failed phase.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A failed phase aborts the run but never rolls back earlier phases; every
/// write is an upsert on a stable natural key, so re-running resumes cleanly.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("campaign sync failed: {0}")]
    Campaigns(#[source] PhaseError),
    #[error("ad set sync failed: {0}")]
    AdSets(#[source] PhaseError),
    #[error("insight sync failed: {0}")]
    Insights(#[source] PhaseError),
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PhaseOutcome {
    pub written: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub campaigns: PhaseOutcome,
    pub ad_sets: PhaseOutcome,
    pub metrics: PhaseOutcome,
}

pub struct SyncEngine<C: AdsApi> {
    client: C,
    store: Store,
    backfill_days: u32,
    backoff: BackoffPolicy,
}

impl SyncEngine<AdsApiClient> {
    /// Wire the real HTTP client and a connected store from config.
    pub async fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let client = AdsApiClient::new(ClientConfig {
            base_url: config.api_base_url.clone(),
            ad_account_id: config.ad_account_id.clone(),
            access_token: config.access_token.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            page_limit: config.page_limit,
        })?;
        let store = Store::connect(&config.database_url).await?;
        store.migrate().await?;
        Ok(Self::new(client, store, config.backfill_days))
    }
}

impl<C: AdsApi> SyncEngine<C> {
    pub fn new(client: C, store: Store, backfill_days: u32) -> Self {
        Self {
            client,
            store,
            backfill_days: backfill_days.max(1),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn sync_campaigns(&self) -> Result<PhaseOutcome, SyncError> {
        self.campaigns_phase().await.map_err(SyncError::Campaigns)
    }

    pub async fn sync_ad_sets(&self) -> Result<PhaseOutcome, SyncError> {
        self.ad_sets_phase().await.map_err(SyncError::AdSets)
    }

    pub async fn sync_insights(&self) -> Result<PhaseOutcome, SyncError> {
        self.insights_phase().await.map_err(SyncError::Insights)
    }

    /// Run the three phases strictly in order so foreign-key dependents are
    /// only written once their parents exist.
    pub async fn sync_all(&self) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "starting full sync");

        let campaigns = self.sync_campaigns().await?;
        let ad_sets = self.sync_ad_sets().await?;
        let metrics = self.sync_insights().await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            campaigns,
            ad_sets,
            metrics,
        };
        info!(
            %run_id,
            campaigns = summary.campaigns.written,
            ad_sets = summary.ad_sets.written,
            metrics = summary.metrics.written,
            "full sync complete"
        );
        Ok(summary)
    }

    /// Retry a fetch on transient upstream failures, backing off between
    /// attempts. Non-retryable errors surface immediately.
    async fn fetch_with_retry<T, F, Fut>(&self, resource: &'static str, mut fetch: F) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let mut attempt = 0usize;
        loop {
            match fetch().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.backoff.max_retries {
                        return Err(err);
                    }
                    let delay = self.backoff.delay(attempt);
                    warn!(%err, resource, attempt, delay_ms = delay.as_millis() as u64, "retrying upstream fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn campaigns_phase(&self) -> Result<PhaseOutcome, PhaseError> {
        let raw = self
            .fetch_with_retry("campaigns", || self.client.fetch_campaigns())
            .await?;
        if raw.is_empty() {
            info!("no campaigns to sync");
            return Ok(PhaseOutcome::default());
        }

        let mut rows = Vec::with_capacity(raw.len());
        let mut discarded = 0usize;
        for record in &raw {
            match normalize_campaign(record) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    warn!(%err, id = %record.id, "dropping campaign record");
                    discarded += 1;
                }
            }
        }

        let written = self.store.upsert_campaigns(&rows).await?;
        info!(written, discarded, "campaign phase complete");
        Ok(PhaseOutcome { written, discarded })
    }

    async fn ad_sets_phase(&self) -> Result<PhaseOutcome, PhaseError> {
        let raw = self
            .fetch_with_retry("adsets", || self.client.fetch_ad_sets())
            .await?;
        if raw.is_empty() {
            info!("no ad sets to sync");
            return Ok(PhaseOutcome::default());
        }

        let mut rows = Vec::with_capacity(raw.len());
        let mut discarded = 0usize;
        for record in &raw {
            match normalize_ad_set(record) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    warn!(%err, id = %record.id, "dropping ad set record");
                    discarded += 1;
                }
            }
        }

        let written = self.store.upsert_ad_sets(&rows).await?;
        info!(written, discarded, "ad set phase complete");
        Ok(PhaseOutcome { written, discarded })
    }

    /// Walk the trailing window one day at a time, accumulate every record,
    /// then filter and write a single terminal batch.
    async fn insights_phase(&self) -> Result<PhaseOutcome, PhaseError> {
        let known_campaigns = self.store.campaign_ids().await?;
        let today = Local::now().date_naive();

        let mut all_insights = Vec::new();
        for target_day in backfill_window(today, self.backfill_days) {
            let batch = self
                .fetch_with_retry("insights", || self.client.fetch_insights(target_day))
                .await?;
            info!(day = %target_day, records = batch.len(), "fetched insight day");
            all_insights.extend(batch);
        }

        if all_insights.is_empty() {
            info!("no insights to sync");
            return Ok(PhaseOutcome::default());
        }

        let (rows, discarded) = filter_and_normalize_insights(&all_insights, &known_campaigns);
        if rows.is_empty() {
            info!(discarded, "no valid insights to write");
            return Ok(PhaseOutcome { written: 0, discarded });
        }

        let written = self.store.upsert_daily_metrics(&rows).await?;
        info!(written, discarded, "insight phase complete");
        Ok(PhaseOutcome { written, discarded })
    }
}

/// Drop incomplete records and records referencing campaigns the store does
/// not know, then normalize the remainder. Orphans must never reach the
/// metrics table, even transiently.
pub fn filter_and_normalize_insights(
    insights: &[RawInsight],
    known_campaigns: &HashSet<i64>,
) -> (Vec<DailyMetricRow>, usize) {
    let mut rows = Vec::with_capacity(insights.len());
    let mut discarded = 0usize;

    for raw in insights {
        if !raw.has_required_fields() {
            discarded += 1;
            continue;
        }
        let campaign_known = raw
            .campaign_id
            .as_deref()
            .and_then(|id| id.parse::<i64>().ok())
            .map(|id| known_campaigns.contains(&id))
            .unwrap_or(false);
        if !campaign_known {
            warn!(campaign_id = ?raw.campaign_id, "dropping insight for unknown campaign");
            discarded += 1;
            continue;
        }
        match normalize_insight(raw) {
            Ok(row) => rows.push(row),
            Err(err) => {
                warn!(%err, "dropping malformed insight record");
                discarded += 1;
            }
        }
    }

    (rows, discarded)
}

/// Today and the preceding `days - 1` calendar days, newest first.
pub fn backfill_window(today: NaiveDate, days: u32) -> Vec<NaiveDate> {
    (0..days.max(1) as u64)
        .filter_map(|offset| today.checked_sub_days(Days::new(offset)))
        .collect()
}
