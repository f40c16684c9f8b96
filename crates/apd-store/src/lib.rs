//! Reconciliation store: natural-key upserts and aggregation reads over SQLite.

use std::collections::HashSet;
use std::str::FromStr;

use apd_core::{AdSetRow, CampaignRow, DailyMetricRow, DateRange, PeriodTotals};
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "apd-store";

/// Rows per multi-row upsert statement. The orchestrator hands over whole
/// phases at once, so batches are split here to stay inside statement limits.
const UPSERT_CHUNK: usize = 200;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Serialize)]
pub struct DailySeriesRow {
    pub metric_date: NaiveDate,
    pub spend_cents: i64,
    pub average_roas: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignRollupRow {
    pub campaign_name: String,
    pub spend_cents: i64,
    pub average_roas: f64,
    pub clicks: i64,
    pub leads: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyDetailRow {
    pub metric_date: NaiveDate,
    pub campaign_name: String,
    pub spend_cents: i64,
    pub clicks: Option<i64>,
    pub cpc_cents: Option<i64>,
    pub roas_value: f64,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = pool_options_for(database_url).connect_with(options).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- write side (sync upserts) ------------------------------------------

    /// Insert campaigns, overwriting every non-key column on id conflict.
    pub async fn upsert_campaigns(&self, rows: &[CampaignRow]) -> Result<usize, StoreError> {
        for chunk in rows.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO campaigns (id, name, status, objective, created_time) ");
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(&row.name)
                    .push_bind(&row.status)
                    .push_bind(&row.objective)
                    .push_bind(row.created_time);
            });
            qb.push(
                " ON CONFLICT(id) DO UPDATE SET \
                 name = excluded.name, \
                 status = excluded.status, \
                 objective = excluded.objective, \
                 created_time = excluded.created_time",
            );
            qb.build().execute(&self.pool).await?;
        }
        debug!(count = rows.len(), "upserted campaigns");
        Ok(rows.len())
    }

    pub async fn upsert_ad_sets(&self, rows: &[AdSetRow]) -> Result<usize, StoreError> {
        for chunk in rows.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO ad_sets (id, name, status, daily_budget_cents, campaign_id, created_time) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(&row.name)
                    .push_bind(&row.status)
                    .push_bind(row.daily_budget_cents)
                    .push_bind(row.campaign_id)
                    .push_bind(row.created_time);
            });
            qb.push(
                " ON CONFLICT(id) DO UPDATE SET \
                 name = excluded.name, \
                 status = excluded.status, \
                 daily_budget_cents = excluded.daily_budget_cents, \
                 campaign_id = excluded.campaign_id, \
                 created_time = excluded.created_time",
            );
            qb.build().execute(&self.pool).await?;
        }
        debug!(count = rows.len(), "upserted ad sets");
        Ok(rows.len())
    }

    /// Upsert keyed on (metric_date, campaign_id, ad_set_id); re-syncing a day
    /// fully overwrites the stored row, never duplicates it.
    pub async fn upsert_daily_metrics(&self, rows: &[DailyMetricRow]) -> Result<usize, StoreError> {
        for chunk in rows.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO daily_metrics \
                 (metric_date, campaign_id, ad_set_id, spend_cents, impressions, clicks, \
                  cpc_cents, cpm_cents, roas_value, ctr, leads) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.metric_date)
                    .push_bind(row.campaign_id)
                    .push_bind(row.ad_set_id)
                    .push_bind(row.spend_cents)
                    .push_bind(row.impressions)
                    .push_bind(row.clicks)
                    .push_bind(row.cpc_cents)
                    .push_bind(row.cpm_cents)
                    .push_bind(row.roas_value)
                    .push_bind(row.ctr)
                    .push_bind(row.leads);
            });
            qb.push(
                " ON CONFLICT(metric_date, campaign_id, ad_set_id) DO UPDATE SET \
                 spend_cents = excluded.spend_cents, \
                 impressions = excluded.impressions, \
                 clicks = excluded.clicks, \
                 cpc_cents = excluded.cpc_cents, \
                 cpm_cents = excluded.cpm_cents, \
                 roas_value = excluded.roas_value, \
                 ctr = excluded.ctr, \
                 leads = excluded.leads",
            );
            qb.build().execute(&self.pool).await?;
        }
        debug!(count = rows.len(), "upserted daily metrics");
        Ok(rows.len())
    }

    /// The current set of known campaign ids; used to filter orphaned metrics
    /// before they are ever written.
    pub async fn campaign_ids(&self) -> Result<HashSet<i64>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM campaigns")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    // -- read side (aggregation engine) -------------------------------------

    /// Spend sum, arithmetic-mean ROAS, and lead sum for the range (all
    /// history when no range is given).
    pub async fn period_totals(&self, range: Option<DateRange>) -> Result<PeriodTotals, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COALESCE(SUM(spend_cents), 0), COALESCE(AVG(roas_value), 0.0), \
             COALESCE(SUM(leads), 0) FROM daily_metrics",
        );
        push_range_filter(&mut qb, "metric_date", range);
        let row = qb.build().fetch_one(&self.pool).await?;
        Ok(PeriodTotals {
            spend_cents: row.try_get(0)?,
            average_roas: row.try_get(1)?,
            leads: row.try_get(2)?,
        })
    }

    pub async fn spend_between(&self, range: DateRange) -> Result<i64, StoreError> {
        let spend: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(spend_cents), 0) FROM daily_metrics \
             WHERE metric_date BETWEEN ? AND ?",
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_one(&self.pool)
        .await?;
        Ok(spend)
    }

    pub async fn spend_on(&self, day: NaiveDate) -> Result<i64, StoreError> {
        self.spend_between(DateRange::new(day, day)).await
    }

    /// Per-day spend and mean ROAS, ascending by date. Days without metrics
    /// simply do not appear; the series is not zero-filled.
    pub async fn daily_series(&self, range: Option<DateRange>) -> Result<Vec<DailySeriesRow>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT metric_date, COALESCE(SUM(spend_cents), 0), COALESCE(AVG(roas_value), 0.0) \
             FROM daily_metrics",
        );
        push_range_filter(&mut qb, "metric_date", range);
        qb.push(" GROUP BY metric_date ORDER BY metric_date ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(DailySeriesRow {
                    metric_date: row.try_get(0)?,
                    spend_cents: row.try_get(1)?,
                    average_roas: row.try_get(2)?,
                })
            })
            .collect()
    }

    /// Spend/clicks/ROAS/leads grouped by campaign name.
    pub async fn campaign_rollup(&self, range: Option<DateRange>) -> Result<Vec<CampaignRollupRow>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT c.name, COALESCE(SUM(dm.spend_cents), 0), COALESCE(AVG(dm.roas_value), 0.0), \
             COALESCE(SUM(dm.clicks), 0), COALESCE(SUM(dm.leads), 0) \
             FROM daily_metrics dm JOIN campaigns c ON dm.campaign_id = c.id",
        );
        push_range_filter(&mut qb, "dm.metric_date", range);
        qb.push(" GROUP BY c.name ORDER BY c.name ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(CampaignRollupRow {
                    campaign_name: row.try_get(0)?,
                    spend_cents: row.try_get(1)?,
                    average_roas: row.try_get(2)?,
                    clicks: row.try_get(3)?,
                    leads: row.try_get(4)?,
                })
            })
            .collect()
    }

    /// Joined per-row detail for the spend report, newest day first.
    pub async fn daily_detail_rows(&self, range: Option<DateRange>) -> Result<Vec<DailyDetailRow>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT dm.metric_date, c.name, dm.spend_cents, dm.clicks, dm.cpc_cents, \
             COALESCE(dm.roas_value, 0.0) \
             FROM daily_metrics dm JOIN campaigns c ON dm.campaign_id = c.id",
        );
        push_range_filter(&mut qb, "dm.metric_date", range);
        qb.push(" ORDER BY dm.metric_date DESC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(DailyDetailRow {
                    metric_date: row.try_get(0)?,
                    campaign_name: row.try_get(1)?,
                    spend_cents: row.try_get(2)?,
                    clicks: row.try_get(3)?,
                    cpc_cents: row.try_get(4)?,
                    roas_value: row.try_get(5)?,
                })
            })
            .collect()
    }

    /// Campaigns ordered by name. With a range, only campaigns that have at
    /// least one metric row inside it; without one, every stored campaign.
    pub async fn campaigns_with_metrics(&self, range: Option<DateRange>) -> Result<Vec<CampaignRow>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, name, status, objective, created_time FROM campaigns");
        if let Some(range) = range {
            qb.push(" WHERE id IN (SELECT DISTINCT campaign_id FROM daily_metrics WHERE metric_date BETWEEN ")
                .push_bind(range.start)
                .push(" AND ")
                .push_bind(range.end)
                .push(")");
        }
        qb.push(" ORDER BY name ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(CampaignRow {
                    id: row.try_get(0)?,
                    name: row.try_get(1)?,
                    status: row.try_get(2)?,
                    objective: row.try_get(3)?,
                    created_time: row.try_get(4)?,
                })
            })
            .collect()
    }

    pub async fn metric_row_count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM daily_metrics")
            .fetch_one(&self.pool)
            .await?)
    }
}

/// An in-memory database lives only as long as its single connection, so the
/// pool must hold that connection open and never reap it as idle.
fn pool_options_for(database_url: &str) -> SqlitePoolOptions {
    if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    }
}

fn push_range_filter(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, range: Option<DateRange>) {
    if let Some(range) = range {
        qb.push(format!(" WHERE {column} BETWEEN "))
            .push_bind(range.start)
            .push(" AND ")
            .push_bind(range.end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.expect("connect");
        store.migrate().await.expect("migrate");
        store
    }

    fn campaign(id: i64, name: &str, status: &str) -> CampaignRow {
        CampaignRow {
            id,
            name: name.to_string(),
            status: status.to_string(),
            objective: Some("OUTCOME_SALES".to_string()),
            created_time: None,
        }
    }

    fn ad_set(id: i64, campaign_id: i64) -> AdSetRow {
        AdSetRow {
            id,
            name: format!("adset-{id}"),
            status: "ACTIVE".to_string(),
            campaign_id,
            daily_budget_cents: 15_000,
            created_time: None,
        }
    }

    fn metric(day: NaiveDate, campaign_id: i64, ad_set_id: i64, spend_cents: i64) -> DailyMetricRow {
        DailyMetricRow {
            metric_date: day,
            campaign_id,
            ad_set_id,
            spend_cents,
            impressions: Some(1000),
            clicks: Some(25),
            cpc_cents: 40,
            cpm_cents: 900,
            ctr: 2.5,
            roas_value: 2.0,
            leads: 4,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn memory_pools_pin_their_connection_open() {
        let mem = pool_options_for("sqlite::memory:");
        assert_eq!(mem.get_max_connections(), 1);
        assert_eq!(mem.get_min_connections(), 1);
        assert_eq!(mem.get_idle_timeout(), None);
        assert_eq!(mem.get_max_lifetime(), None);

        let file = pool_options_for("sqlite://apd.db");
        assert_eq!(file.get_max_connections(), 8);
    }

    #[tokio::test]
    async fn campaign_upsert_overwrites_on_conflict() {
        let store = memory_store().await;
        store
            .upsert_campaigns(&[campaign(101, "Summer Sale", "ACTIVE")])
            .await
            .unwrap();
        store
            .upsert_campaigns(&[campaign(101, "Summer Sale", "PAUSED")])
            .await
            .unwrap();

        let campaigns = store.campaigns_with_metrics(None).await.unwrap();
        assert_eq!(campaigns.len(), 1);
        assert_eq!(campaigns[0].status, "PAUSED");
    }

    #[tokio::test]
    async fn metric_upsert_is_idempotent_on_natural_key() {
        let store = memory_store().await;
        store.upsert_campaigns(&[campaign(101, "C", "ACTIVE")]).await.unwrap();
        store.upsert_ad_sets(&[ad_set(201, 101)]).await.unwrap();

        let rows = vec![metric(day(2024, 1, 10), 101, 201, 1234)];
        store.upsert_daily_metrics(&rows).await.unwrap();
        store.upsert_daily_metrics(&rows).await.unwrap();
        assert_eq!(store.metric_row_count().await.unwrap(), 1);

        // A later sync for the same key overwrites in full.
        let updated = vec![metric(day(2024, 1, 10), 101, 201, 5678)];
        store.upsert_daily_metrics(&updated).await.unwrap();
        assert_eq!(store.metric_row_count().await.unwrap(), 1);
        assert_eq!(store.spend_on(day(2024, 1, 10)).await.unwrap(), 5678);
    }

    #[tokio::test]
    async fn period_totals_respect_inclusive_range() {
        let store = memory_store().await;
        store.upsert_campaigns(&[campaign(101, "C", "ACTIVE")]).await.unwrap();
        store.upsert_ad_sets(&[ad_set(201, 101)]).await.unwrap();

        let rows: Vec<_> = (1..=31)
            .map(|d| metric(day(2024, 1, d), 101, 201, 100))
            .collect();
        store.upsert_daily_metrics(&rows).await.unwrap();

        let range = DateRange::new(day(2024, 1, 10), day(2024, 1, 15));
        let totals = store.period_totals(Some(range)).await.unwrap();
        assert_eq!(totals.spend_cents, 600);
        assert_eq!(totals.leads, 24);
        assert!((totals.average_roas - 2.0).abs() < 1e-9);

        let all = store.period_totals(None).await.unwrap();
        assert_eq!(all.spend_cents, 3100);
    }

    #[tokio::test]
    async fn daily_series_is_ascending_without_zero_fill() {
        let store = memory_store().await;
        store.upsert_campaigns(&[campaign(101, "C", "ACTIVE")]).await.unwrap();
        store.upsert_ad_sets(&[ad_set(201, 101)]).await.unwrap();
        store
            .upsert_daily_metrics(&[
                metric(day(2024, 1, 15), 101, 201, 300),
                metric(day(2024, 1, 10), 101, 201, 100),
                metric(day(2024, 1, 12), 101, 201, 200),
            ])
            .await
            .unwrap();

        let series = store
            .daily_series(Some(DateRange::new(day(2024, 1, 1), day(2024, 1, 31))))
            .await
            .unwrap();
        let dates: Vec<_> = series.iter().map(|r| r.metric_date).collect();
        assert_eq!(dates, vec![day(2024, 1, 10), day(2024, 1, 12), day(2024, 1, 15)]);
        assert_eq!(series[0].spend_cents, 100);
    }

    #[tokio::test]
    async fn rollup_groups_by_campaign_name() {
        let store = memory_store().await;
        store
            .upsert_campaigns(&[campaign(101, "Alpha", "ACTIVE"), campaign(102, "Beta", "ACTIVE")])
            .await
            .unwrap();
        store
            .upsert_ad_sets(&[ad_set(201, 101), ad_set(202, 101), ad_set(203, 102)])
            .await
            .unwrap();
        store
            .upsert_daily_metrics(&[
                metric(day(2024, 1, 10), 101, 201, 100),
                metric(day(2024, 1, 10), 101, 202, 150),
                metric(day(2024, 1, 10), 102, 203, 400),
            ])
            .await
            .unwrap();

        let rollup = store.campaign_rollup(None).await.unwrap();
        assert_eq!(rollup.len(), 2);
        assert_eq!(rollup[0].campaign_name, "Alpha");
        assert_eq!(rollup[0].spend_cents, 250);
        assert_eq!(rollup[0].clicks, 50);
        assert_eq!(rollup[1].campaign_name, "Beta");
        assert_eq!(rollup[1].leads, 4);
    }

    #[tokio::test]
    async fn campaign_list_filters_to_activity_in_range() {
        let store = memory_store().await;
        store
            .upsert_campaigns(&[campaign(101, "Active One", "ACTIVE"), campaign(102, "Dormant", "PAUSED")])
            .await
            .unwrap();
        store.upsert_ad_sets(&[ad_set(201, 101)]).await.unwrap();
        store
            .upsert_daily_metrics(&[metric(day(2024, 1, 10), 101, 201, 100)])
            .await
            .unwrap();

        let in_range = store
            .campaigns_with_metrics(Some(DateRange::new(day(2024, 1, 1), day(2024, 1, 31))))
            .await
            .unwrap();
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].name, "Active One");

        let all = store.campaigns_with_metrics(None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn detail_rows_join_campaign_name_descending() {
        let store = memory_store().await;
        store.upsert_campaigns(&[campaign(101, "Alpha", "ACTIVE")]).await.unwrap();
        store.upsert_ad_sets(&[ad_set(201, 101)]).await.unwrap();
        store
            .upsert_daily_metrics(&[
                metric(day(2024, 1, 10), 101, 201, 100),
                metric(day(2024, 1, 12), 101, 201, 200),
            ])
            .await
            .unwrap();

        let details = store.daily_detail_rows(None).await.unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].metric_date, day(2024, 1, 12));
        assert_eq!(details[0].campaign_name, "Alpha");
        assert_eq!(details[1].spend_cents, 100);
    }

    #[tokio::test]
    async fn deleting_a_campaign_cascades_to_its_metrics() {
        let store = memory_store().await;
        store.upsert_campaigns(&[campaign(101, "C", "ACTIVE")]).await.unwrap();
        store.upsert_ad_sets(&[ad_set(201, 101)]).await.unwrap();
        store
            .upsert_daily_metrics(&[metric(day(2024, 1, 10), 101, 201, 100)])
            .await
            .unwrap();

        sqlx::query("DELETE FROM campaigns WHERE id = 101")
            .execute(store.pool())
            .await
            .unwrap();
        assert_eq!(store.metric_row_count().await.unwrap(), 0);
    }
}
