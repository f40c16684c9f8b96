//! Core domain model, record normalization, and KPI math for APD.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "apd-core";

/// Action types that count as a goal conversion. Matched by substring because the
/// upstream taxonomy nests sub-types (e.g. `offsite_conversion.lead`).
pub const GOAL_ACTION_TYPES: [&str; 3] = ["lead", "purchase", "complete_registration"];

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has unparsable value `{value}`")]
    Unparsable { field: &'static str, value: String },
}

// ---------------------------------------------------------------------------
// Raw upstream records (shape of the ads platform API payloads)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawCampaign {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub created_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawAdSet {
    pub id: String,
    pub name: String,
    pub status: String,
    pub campaign_id: String,
    #[serde(default)]
    pub daily_budget: Option<String>,
    #[serde(default)]
    pub created_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawAction {
    pub action_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawRoasEntry {
    pub value: String,
}

/// One per-adset, per-day insight row as returned by the upstream API. Every
/// numeric comes back as a decimal string in major currency units.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawInsight {
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub adset_id: Option<String>,
    #[serde(default)]
    pub spend: Option<String>,
    #[serde(default)]
    pub impressions: Option<String>,
    #[serde(default)]
    pub clicks: Option<String>,
    #[serde(default)]
    pub cpc: Option<String>,
    #[serde(default)]
    pub ctr: Option<String>,
    #[serde(default)]
    pub cpm: Option<String>,
    #[serde(default)]
    pub purchase_roas: Option<Vec<RawRoasEntry>>,
    #[serde(default)]
    pub actions: Option<Vec<RawAction>>,
    #[serde(default)]
    pub date_start: Option<String>,
}

impl RawInsight {
    /// Records without an owning campaign/ad set, a spend figure, or a date are
    /// discarded before normalization is even attempted.
    pub fn has_required_fields(&self) -> bool {
        self.campaign_id.is_some()
            && self.adset_id.is_some()
            && self.spend.is_some()
            && self.date_start.is_some()
    }
}

// ---------------------------------------------------------------------------
// Normalized rows (the shape the reconciliation store persists)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRow {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub objective: Option<String>,
    pub created_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSetRow {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub campaign_id: i64,
    pub daily_budget_cents: i64,
    pub created_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetricRow {
    pub metric_date: NaiveDate,
    pub campaign_id: i64,
    pub ad_set_id: i64,
    pub spend_cents: i64,
    pub impressions: Option<i64>,
    pub clicks: Option<i64>,
    pub cpc_cents: i64,
    pub cpm_cents: i64,
    pub ctr: f64,
    pub roas_value: f64,
    pub leads: i64,
}

// ---------------------------------------------------------------------------
// Unit conversion
// ---------------------------------------------------------------------------

/// Parse a major-unit decimal string ("12.34") into integer minor units (1234).
pub fn major_str_to_cents(field: &'static str, value: &str) -> Result<i64, ValidationError> {
    let parsed: f64 = value.trim().parse().map_err(|_| ValidationError::Unparsable {
        field,
        value: value.to_string(),
    })?;
    Ok((parsed * 100.0).round() as i64)
}

pub fn cents_to_major(cents: i64) -> f64 {
    cents as f64 / 100.0
}

fn parse_decimal(field: &'static str, value: &str) -> Result<f64, ValidationError> {
    value.trim().parse().map_err(|_| ValidationError::Unparsable {
        field,
        value: value.to_string(),
    })
}

fn parse_integer(field: &'static str, value: &str) -> Result<i64, ValidationError> {
    value.trim().parse().map_err(|_| ValidationError::Unparsable {
        field,
        value: value.to_string(),
    })
}

fn parse_id(field: &'static str, value: &str) -> Result<i64, ValidationError> {
    parse_integer(field, value)
}

/// Upstream timestamps arrive either as RFC3339 or with a colon-less offset
/// (`2024-03-01T10:30:00-0300`).
pub fn parse_created_time(value: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ValidationError::Unparsable {
            field: "created_time",
            value: value.to_string(),
        })
}

fn parse_metric_date(value: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| ValidationError::Unparsable {
        field: "date_start",
        value: value.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Record normalizer
// ---------------------------------------------------------------------------

pub fn normalize_campaign(raw: &RawCampaign) -> Result<CampaignRow, ValidationError> {
    let created_time = match raw.created_time.as_deref() {
        Some(ts) => Some(parse_created_time(ts)?),
        None => None,
    };
    Ok(CampaignRow {
        id: parse_id("id", &raw.id)?,
        name: raw.name.clone(),
        status: raw.status.clone(),
        objective: raw.objective.clone(),
        created_time,
    })
}

pub fn normalize_ad_set(raw: &RawAdSet) -> Result<AdSetRow, ValidationError> {
    let created_time = match raw.created_time.as_deref() {
        Some(ts) => Some(parse_created_time(ts)?),
        None => None,
    };
    let daily_budget_cents = match raw.daily_budget.as_deref() {
        Some(v) => major_str_to_cents("daily_budget", v)?,
        None => 0,
    };
    Ok(AdSetRow {
        id: parse_id("id", &raw.id)?,
        name: raw.name.clone(),
        status: raw.status.clone(),
        campaign_id: parse_id("campaign_id", &raw.campaign_id)?,
        daily_budget_cents,
        created_time,
    })
}

/// Sum the values of every action whose type substring-matches a goal action.
pub fn count_goal_conversions(actions: &[RawAction]) -> Result<i64, ValidationError> {
    let mut total = 0i64;
    for action in actions {
        if GOAL_ACTION_TYPES.iter().any(|t| action.action_type.contains(t)) {
            total += parse_integer("actions.value", &action.value)?;
        }
    }
    Ok(total)
}

/// Normalize one raw insight into a daily metric row. Callers are expected to
/// have already dropped records failing [`RawInsight::has_required_fields`].
pub fn normalize_insight(raw: &RawInsight) -> Result<DailyMetricRow, ValidationError> {
    let campaign_id = raw
        .campaign_id
        .as_deref()
        .ok_or(ValidationError::MissingField("campaign_id"))?;
    let adset_id = raw
        .adset_id
        .as_deref()
        .ok_or(ValidationError::MissingField("adset_id"))?;
    let spend = raw
        .spend
        .as_deref()
        .ok_or(ValidationError::MissingField("spend"))?;
    let date_start = raw
        .date_start
        .as_deref()
        .ok_or(ValidationError::MissingField("date_start"))?;

    let impressions = raw
        .impressions
        .as_deref()
        .map(|v| parse_integer("impressions", v))
        .transpose()?;
    let clicks = raw
        .clicks
        .as_deref()
        .map(|v| parse_integer("clicks", v))
        .transpose()?;

    let roas_value = match raw.purchase_roas.as_deref().and_then(|entries| entries.first()) {
        Some(entry) => round4(parse_decimal("purchase_roas.value", &entry.value)?),
        None => 0.0,
    };
    let leads = match raw.actions.as_deref() {
        Some(actions) => count_goal_conversions(actions)?,
        None => 0,
    };

    Ok(DailyMetricRow {
        metric_date: parse_metric_date(date_start)?,
        campaign_id: parse_id("campaign_id", campaign_id)?,
        ad_set_id: parse_id("adset_id", adset_id)?,
        spend_cents: major_str_to_cents("spend", spend)?,
        impressions,
        clicks,
        cpc_cents: match raw.cpc.as_deref() {
            Some(v) => major_str_to_cents("cpc", v)?,
            None => 0,
        },
        cpm_cents: match raw.cpm.as_deref() {
            Some(v) => major_str_to_cents("cpm", v)?,
            None => 0,
        },
        ctr: match raw.ctr.as_deref() {
            Some(v) => parse_decimal("ctr", v)?,
            None => 0.0,
        },
        roas_value,
        leads,
    })
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

// ---------------------------------------------------------------------------
// Date ranges
// ---------------------------------------------------------------------------

/// Inclusive calendar-day range used to bound the aggregation reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// The calendar month containing `day`, first day through last day.
    pub fn calendar_month_of(day: NaiveDate) -> Self {
        let start = day.with_day(1).expect("day 1 always valid");
        let end = start
            .checked_add_months(chrono::Months::new(1))
            .and_then(|d| d.pred_opt())
            .expect("month end in range");
        Self { start, end }
    }
}

pub fn days_in_month(day: NaiveDate) -> u32 {
    let month = DateRange::calendar_month_of(day);
    month.end.day()
}

// ---------------------------------------------------------------------------
// KPI math
// ---------------------------------------------------------------------------

/// Raw aggregates for a period, straight off the store (minor units).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeriodTotals {
    pub spend_cents: i64,
    pub average_roas: f64,
    pub leads: i64,
}

/// Period KPIs in major units, as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeriodKpis {
    pub total_spend: f64,
    pub average_roas: f64,
    pub average_cpa: f64,
    pub total_leads: i64,
}

pub fn derive_period_kpis(totals: PeriodTotals) -> PeriodKpis {
    let total_spend = cents_to_major(totals.spend_cents);
    let average_cpa = if totals.leads > 0 {
        total_spend / totals.leads as f64
    } else {
        0.0
    };
    PeriodKpis {
        total_spend,
        average_roas: totals.average_roas,
        average_cpa,
        total_leads: totals.leads,
    }
}

/// Monthly budget ceiling and the pacing band thresholds. Injected
/// configuration, never hardcoded business logic.
#[derive(Debug, Clone, Copy)]
pub struct BudgetConfig {
    pub monthly_budget_cents: i64,
    pub over_pace_ratio: f64,
    pub under_pace_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_budget_cents: 2_000_000,
            over_pace_ratio: 1.10,
            under_pace_ratio: 0.90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingBand {
    NoSpendToday,
    OverPace,
    UnderPace,
    OnPace,
}

impl std::fmt::Display for PacingBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PacingBand::NoSpendToday => "no spend today",
            PacingBand::OverPace => "over pace",
            PacingBand::UnderPace => "under pace",
            PacingBand::OnPace => "on pace",
        };
        f.write_str(label)
    }
}

/// Fixed-calendar-month pacing snapshot, always for the current month
/// regardless of the caller's selected period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetPacing {
    pub monthly_budget: f64,
    pub monthly_spend: f64,
    pub today_spend: f64,
    pub planned_daily_spend: f64,
    pub pacing: PacingBand,
}

pub fn derive_budget_pacing(
    config: &BudgetConfig,
    days_in_month: u32,
    monthly_spend_cents: i64,
    today_spend_cents: i64,
) -> BudgetPacing {
    let monthly_budget = cents_to_major(config.monthly_budget_cents);
    let planned_daily_spend = monthly_budget / days_in_month.max(1) as f64;
    let today_spend = cents_to_major(today_spend_cents);
    let pacing = classify_pacing(config, planned_daily_spend, today_spend);
    BudgetPacing {
        monthly_budget,
        monthly_spend: cents_to_major(monthly_spend_cents),
        today_spend,
        planned_daily_spend,
        pacing,
    }
}

pub fn classify_pacing(config: &BudgetConfig, planned_daily_spend: f64, today_spend: f64) -> PacingBand {
    if planned_daily_spend <= 0.0 {
        return PacingBand::OnPace;
    }
    if today_spend == 0.0 {
        return PacingBand::NoSpendToday;
    }
    let ratio = today_spend / planned_daily_spend;
    if ratio > config.over_pace_ratio {
        PacingBand::OverPace
    } else if ratio < config.under_pace_ratio {
        PacingBand::UnderPace
    } else {
        PacingBand::OnPace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insight(spend: &str) -> RawInsight {
        RawInsight {
            campaign_id: Some("101".into()),
            adset_id: Some("201".into()),
            spend: Some(spend.into()),
            impressions: Some("1500".into()),
            clicks: Some("40".into()),
            cpc: Some("0.31".into()),
            ctr: Some("2.67".into()),
            cpm: Some("8.22".into()),
            purchase_roas: Some(vec![RawRoasEntry { value: "3.14159".into() }]),
            actions: None,
            date_start: Some("2024-01-10".into()),
        }
    }

    #[test]
    fn spend_string_converts_to_cents() {
        assert_eq!(major_str_to_cents("spend", "12.34").unwrap(), 1234);
        assert_eq!(major_str_to_cents("spend", "0").unwrap(), 0);
        assert_eq!(major_str_to_cents("spend", "0.005").unwrap(), 1);
    }

    #[test]
    fn absent_budget_defaults_to_zero_cents() {
        let raw = RawAdSet {
            id: "201".into(),
            name: "adset".into(),
            status: "ACTIVE".into(),
            campaign_id: "101".into(),
            daily_budget: None,
            created_time: None,
        };
        assert_eq!(normalize_ad_set(&raw).unwrap().daily_budget_cents, 0);
    }

    #[test]
    fn budget_converts_from_major_units() {
        let raw = RawAdSet {
            id: "201".into(),
            name: "adset".into(),
            status: "ACTIVE".into(),
            campaign_id: "101".into(),
            daily_budget: Some("150.50".into()),
            created_time: Some("2024-03-01T10:30:00-0300".into()),
        };
        let row = normalize_ad_set(&raw).unwrap();
        assert_eq!(row.daily_budget_cents, 15050);
        assert!(row.created_time.is_some());
    }

    #[test]
    fn goal_actions_count_by_substring_only() {
        let actions = vec![
            RawAction {
                action_type: "offsite_conversion.lead".into(),
                value: "3".into(),
            },
            RawAction {
                action_type: "link_click".into(),
                value: "9".into(),
            },
        ];
        assert_eq!(count_goal_conversions(&actions).unwrap(), 3);
    }

    #[test]
    fn goal_actions_sum_across_matching_types() {
        let actions = vec![
            RawAction {
                action_type: "purchase".into(),
                value: "2".into(),
            },
            RawAction {
                action_type: "complete_registration".into(),
                value: "5".into(),
            },
            RawAction {
                action_type: "video_view".into(),
                value: "100".into(),
            },
        ];
        assert_eq!(count_goal_conversions(&actions).unwrap(), 7);
    }

    #[test]
    fn insight_normalizes_money_and_roas() {
        let row = normalize_insight(&insight("12.34")).unwrap();
        assert_eq!(row.spend_cents, 1234);
        assert_eq!(row.cpc_cents, 31);
        assert_eq!(row.cpm_cents, 822);
        assert_eq!(row.roas_value, 3.1416);
        assert_eq!(row.metric_date, NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        assert_eq!(row.leads, 0);
    }

    #[test]
    fn insight_missing_roas_defaults_to_zero() {
        let mut raw = insight("5.00");
        raw.purchase_roas = None;
        assert_eq!(normalize_insight(&raw).unwrap().roas_value, 0.0);
    }

    #[test]
    fn malformed_spend_is_rejected_not_coerced() {
        let raw = insight("not-a-number");
        assert!(normalize_insight(&raw).is_err());
    }

    #[test]
    fn incomplete_insight_fails_required_fields_check() {
        let mut raw = insight("1.00");
        raw.adset_id = None;
        assert!(!raw.has_required_fields());
        assert!(insight("1.00").has_required_fields());
    }

    #[test]
    fn campaign_id_must_be_numeric() {
        let raw = RawCampaign {
            id: "abc".into(),
            name: "x".into(),
            status: "ACTIVE".into(),
            objective: None,
            created_time: None,
        };
        assert!(normalize_campaign(&raw).is_err());
    }

    #[test]
    fn cpa_guards_division_by_zero() {
        let zero = derive_period_kpis(PeriodTotals {
            spend_cents: 100_000,
            average_roas: 1.5,
            leads: 0,
        });
        assert_eq!(zero.average_cpa, 0.0);
        assert_eq!(zero.total_spend, 1000.0);

        let kpis = derive_period_kpis(PeriodTotals {
            spend_cents: 100_000,
            average_roas: 1.5,
            leads: 25,
        });
        assert_eq!(kpis.average_cpa, 40.0);
    }

    #[test]
    fn pacing_bands_follow_configured_thresholds() {
        let config = BudgetConfig {
            monthly_budget_cents: 2_000_000,
            ..BudgetConfig::default()
        };
        // 20000 over a 30-day month -> 666.67 planned per day.
        let planned = cents_to_major(config.monthly_budget_cents) / 30.0;
        assert!((planned - 666.666).abs() < 0.01);

        assert_eq!(classify_pacing(&config, planned, 0.0), PacingBand::NoSpendToday);
        assert_eq!(classify_pacing(&config, planned, 800.0), PacingBand::OverPace);
        assert_eq!(classify_pacing(&config, planned, 500.0), PacingBand::UnderPace);
        assert_eq!(classify_pacing(&config, planned, 666.0), PacingBand::OnPace);
    }

    #[test]
    fn pacing_snapshot_converts_to_major_units() {
        let snapshot = derive_budget_pacing(&BudgetConfig::default(), 30, 1_234_500, 66_600);
        assert_eq!(snapshot.monthly_budget, 20_000.0);
        assert_eq!(snapshot.monthly_spend, 12_345.0);
        assert_eq!(snapshot.today_spend, 666.0);
        assert_eq!(snapshot.pacing, PacingBand::OnPace);
    }

    #[test]
    fn calendar_month_bounds_cover_leap_february() {
        let feb = DateRange::calendar_month_of(NaiveDate::from_ymd_opt(2024, 2, 15).unwrap());
        assert_eq!(feb.start, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(feb.end, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(days_in_month(feb.start), 29);
    }
}
