//! Usage period model: per-cycle consumption, quota snapshot, alert latches
//! and recommendations.

use super::plan::BillingCycle;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Usage recorded for one calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub amount_gb: Decimal,
    /// Hour of day (0-23) to gigabytes.
    #[serde(default)]
    pub hourly: Option<BTreeMap<u8, Decimal>>,
}

/// Day with the single largest daily amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakUsage {
    pub date: NaiveDate,
    pub amount_gb: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub allocated_gb: Decimal,
    pub remaining_gb: Decimal,
    pub percentage_used: Decimal,
    pub is_unlimited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    QuotaWarning,
    QuotaExceeded,
    UnusualUsage,
    PeakUsage,
}

impl AlertKind {
    /// Fixed evaluation order.
    pub const ORDER: [AlertKind; 4] = [
        AlertKind::QuotaWarning,
        AlertKind::QuotaExceeded,
        AlertKind::UnusualUsage,
        AlertKind::PeakUsage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::QuotaWarning => "quota_warning",
            AlertKind::QuotaExceeded => "quota_exceeded",
            AlertKind::UnusualUsage => "unusual_usage",
            AlertKind::PeakUsage => "peak_usage",
        }
    }
}

/// Alert definition with its once-per-period latch.
///
/// `threshold` is a percentage for the quota alerts, a multiple of the
/// daily average for `unusual_usage` and gigabytes per day for
/// `peak_usage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAlert {
    pub kind: AlertKind,
    pub threshold: Decimal,
    pub triggered: bool,
    pub triggered_utc: Option<DateTime<Utc>>,
}

impl UsageAlert {
    pub fn armed(kind: AlertKind, threshold: Decimal) -> Self {
        Self {
            kind,
            threshold,
            triggered: false,
            triggered_utc: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    UpgradePlan,
    DowngradePlan,
    UsageOptimization,
}

impl RecommendationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationKind::UpgradePlan => "upgrade_plan",
            RecommendationKind::DowngradePlan => "downgrade_plan",
            RecommendationKind::UsageOptimization => "usage_optimization",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub confidence: u8,
    pub message: String,
    pub suggested_plan_id: Option<Uuid>,
    pub is_active: bool,
    pub generated_utc: DateTime<Utc>,
    pub deactivated_utc: Option<DateTime<Utc>>,
}

/// Time-of-day bucket used to classify when a subscriber consumes data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageTime {
    Night,
    Morning,
    Afternoon,
    Evening,
    Mixed,
    Unknown,
}

impl UsageTime {
    pub fn for_hour(hour: u8) -> Self {
        match hour {
            0..=5 => UsageTime::Night,
            6..=11 => UsageTime::Morning,
            12..=17 => UsageTime::Afternoon,
            _ => UsageTime::Evening,
        }
    }
}

/// One billing cycle's worth of usage for a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePeriod {
    pub period_id: Uuid,
    pub subscription_id: Uuid,
    pub plan_id: Uuid,
    pub cycle: BillingCycle,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Keyed uniquely by date, kept in insertion order.
    pub daily_usage: Vec<DailyUsage>,
    pub total_used_gb: Decimal,
    pub average_daily_gb: Decimal,
    pub peak: Option<PeakUsage>,
    pub quota: QuotaSnapshot,
    pub alerts: Vec<UsageAlert>,
    pub recommendations: Vec<Recommendation>,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl UsagePeriod {
    pub fn distinct_days(&self) -> usize {
        self.daily_usage.len()
    }

    pub fn usage_on(&self, date: NaiveDate) -> Option<&DailyUsage> {
        self.daily_usage.iter().find(|d| d.date == date)
    }

    pub fn alert(&self, kind: AlertKind) -> Option<&UsageAlert> {
        self.alerts.iter().find(|a| a.kind == kind)
    }

    pub fn active_recommendations(&self) -> impl Iterator<Item = &Recommendation> {
        self.recommendations.iter().filter(|r| r.is_active)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.period_start && at < self.period_end
    }
}
