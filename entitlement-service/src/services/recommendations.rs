//! Plan recommendations derived from a usage period.

use super::metrics::record_recommendation;
use super::store::EntitlementStore;
use crate::error::EngineError;
use crate::models::{
    DataQuota, Plan, Recommendation, RecommendationKind, UsagePeriod, UsageTime,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

const UPGRADE_ABOVE_PERCENT: u32 = 90;
const DOWNGRADE_BELOW_PERCENT: u32 = 30;
const DOWNGRADE_MIN_DAYS: usize = 15;

const UPGRADE_CONFIDENCE: u8 = 85;
const DOWNGRADE_CONFIDENCE: u8 = 75;
const OPTIMIZATION_CONFIDENCE: u8 = 60;

/// Required spare capacity, in percent, when picking a smaller plan.
const DOWNGRADE_HEADROOM_PERCENT: u32 = 20;

/// Bucket the period's hourly breakdowns by time of day.
///
/// A bucket holding at least half of the hourly-attributed usage is
/// dominant; otherwise usage is `Mixed`. Without hourly data the result is
/// `Unknown`.
pub fn classify_usage_time(period: &UsagePeriod) -> UsageTime {
    let mut buckets: BTreeMap<UsageTime, Decimal> = BTreeMap::new();
    for day in &period.daily_usage {
        if let Some(hourly) = &day.hourly {
            for (hour, amount) in hourly {
                let bucket = buckets.entry(UsageTime::for_hour(*hour)).or_default();
                *bucket = bucket.saturating_add(*amount);
            }
        }
    }

    let total = buckets
        .values()
        .fold(Decimal::ZERO, |acc, amount| acc.saturating_add(*amount));
    if total <= Decimal::ZERO {
        return UsageTime::Unknown;
    }

    let dominant = buckets
        .iter()
        .find(|(_, amount)| amount.saturating_mul(Decimal::TWO) >= total)
        .map(|(bucket, _)| *bucket);
    dominant.unwrap_or(UsageTime::Mixed)
}

/// Usage expected by the end of the period at the current daily average.
pub fn projected_usage(period: &UsagePeriod) -> Decimal {
    let days = (period.period_end - period.period_start).num_days().max(1);
    period.average_daily_gb.saturating_mul(Decimal::from(days))
}

fn quota_exceeds(candidate: &DataQuota, current: &DataQuota) -> bool {
    match (candidate, current) {
        (DataQuota::Unlimited, DataQuota::Limited(_)) => true,
        (DataQuota::Limited(a), DataQuota::Limited(b)) => a > b,
        _ => false,
    }
}

fn quota_covers(candidate: &DataQuota, needed_gb: Decimal) -> bool {
    match candidate {
        DataQuota::Unlimited => true,
        DataQuota::Limited(gb) => *gb >= needed_gb,
    }
}

fn upgrade_target<'a>(
    current: &Plan,
    catalog: &'a [Plan],
    now: DateTime<Utc>,
) -> Option<&'a Plan> {
    catalog
        .iter()
        .filter(|p| p.plan_id != current.plan_id && p.is_available(now))
        .filter(|p| quota_exceeds(&p.quota, &current.quota))
        .min_by(|a, b| a.monthly_price.cmp(&b.monthly_price))
}

fn downgrade_target<'a>(
    current: &Plan,
    projected_gb: Decimal,
    catalog: &'a [Plan],
    now: DateTime<Utc>,
) -> Option<&'a Plan> {
    let headroom = Decimal::ONE + Decimal::from(DOWNGRADE_HEADROOM_PERCENT) / Decimal::ONE_HUNDRED;
    let needed = projected_gb.saturating_mul(headroom);
    catalog
        .iter()
        .filter(|p| p.plan_id != current.plan_id && p.is_available(now))
        .filter(|p| p.monthly_price < current.monthly_price)
        .filter(|p| quota_covers(&p.quota, needed))
        .min_by(|a, b| a.monthly_price.cmp(&b.monthly_price))
}

fn recommendation(
    kind: RecommendationKind,
    confidence: u8,
    message: String,
    target: Option<&Plan>,
    now: DateTime<Utc>,
) -> Recommendation {
    Recommendation {
        kind,
        confidence,
        message,
        suggested_plan_id: target.map(|p| p.plan_id),
        is_active: true,
        generated_utc: now,
        deactivated_utc: None,
    }
}

/// Evaluate every rule independently against `period`.
pub fn generate(
    period: &UsagePeriod,
    current_plan: Option<&Plan>,
    catalog: &[Plan],
    now: DateTime<Utc>,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    let quota = &period.quota;
    let shown_percentage = quota.percentage_used.round_dp(2);

    if !quota.is_unlimited && quota.percentage_used > Decimal::from(UPGRADE_ABOVE_PERCENT) {
        let target = current_plan.and_then(|plan| upgrade_target(plan, catalog, now));
        let message = match target {
            Some(plan) => format!(
                "You have used {}% of your data. {} offers more data.",
                shown_percentage, plan.name
            ),
            None => format!(
                "You have used {}% of your data. Consider a larger plan.",
                shown_percentage
            ),
        };
        out.push(recommendation(
            RecommendationKind::UpgradePlan,
            UPGRADE_CONFIDENCE,
            message,
            target,
            now,
        ));
    }

    if quota.percentage_used < Decimal::from(DOWNGRADE_BELOW_PERCENT)
        && period.distinct_days() >= DOWNGRADE_MIN_DAYS
    {
        let projected = projected_usage(period);
        let target = current_plan.and_then(|plan| downgrade_target(plan, projected, catalog, now));
        let message = match target {
            Some(plan) => format!(
                "You are on track to use about {} GB this period. {} would cover it for less.",
                projected.round_dp(1),
                plan.name
            ),
            None => format!(
                "You are on track to use about {} GB this period. A smaller plan may save money.",
                projected.round_dp(1)
            ),
        };
        out.push(recommendation(
            RecommendationKind::DowngradePlan,
            DOWNGRADE_CONFIDENCE,
            message,
            target,
            now,
        ));
    }

    if classify_usage_time(period) == UsageTime::Mixed {
        out.push(recommendation(
            RecommendationKind::UsageOptimization,
            OPTIMIZATION_CONFIDENCE,
            "Your usage is spread across the day. Scheduling large downloads off-peak can help."
                .to_string(),
            None,
            now,
        ));
    }

    out
}

/// Merge freshly generated recommendations into the period's list.
///
/// An active entry of the same kind is refreshed in place, new kinds are
/// appended, and active entries whose rule no longer holds are deactivated.
/// Nothing is removed.
pub fn reconcile(
    existing: &mut Vec<Recommendation>,
    fresh: Vec<Recommendation>,
    now: DateTime<Utc>,
) {
    for rec in existing.iter_mut().filter(|r| r.is_active) {
        if !fresh.iter().any(|f| f.kind == rec.kind) {
            rec.is_active = false;
            rec.deactivated_utc = Some(now);
        }
    }

    for rec in fresh {
        match existing
            .iter_mut()
            .find(|r| r.is_active && r.kind == rec.kind)
        {
            Some(current) => {
                current.confidence = rec.confidence;
                current.message = rec.message;
                current.suggested_plan_id = rec.suggested_plan_id;
                current.generated_utc = rec.generated_utc;
            }
            None => existing.push(rec),
        }
    }
}

/// Recommendation advisor backed by the plan catalog.
#[derive(Clone)]
pub struct RecommendationAdvisor {
    catalog: Arc<dyn EntitlementStore>,
}

impl RecommendationAdvisor {
    pub fn new(catalog: Arc<dyn EntitlementStore>) -> Self {
        Self { catalog }
    }

    /// Regenerate `period`'s recommendations in place. Returns the kinds
    /// that are active afterwards.
    #[instrument(skip(self, period), fields(period_id = %period.period_id))]
    pub async fn refresh(
        &self,
        period: &mut UsagePeriod,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecommendationKind>, EngineError> {
        let current_plan = self.catalog.get_plan(period.plan_id).await?;
        let catalog = self.catalog.list_plans().await?;

        let previously_active: Vec<RecommendationKind> =
            period.active_recommendations().map(|r| r.kind).collect();
        let fresh = generate(period, current_plan.as_ref(), &catalog, now);
        reconcile(&mut period.recommendations, fresh, now);

        let active: Vec<RecommendationKind> =
            period.active_recommendations().map(|r| r.kind).collect();
        for kind in active.iter().filter(|k| !previously_active.contains(k)) {
            record_recommendation(kind.as_str());
            debug!(kind = kind.as_str(), "Recommendation generated");
        }
        Ok(active)
    }
}
