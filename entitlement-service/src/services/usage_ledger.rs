//! Per-period usage accumulation, quota derivation and alert latching.

use super::locks::KeyedLocks;
use super::metrics::{record_alert_triggered, record_error, record_usage_ingestion};
use super::recommendations::RecommendationAdvisor;
use super::store::EntitlementStore;
use crate::error::EngineError;
use crate::models::{
    AlertKind, DailyUsage, DataQuota, PeakUsage, Plan, QuotaSnapshot, Subscription, UsageAlert,
    UsagePeriod,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Thresholds copied into every new period's alert set.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertPolicy {
    /// Percent of quota.
    pub warning_percent: Decimal,
    /// Multiple of the period's daily average.
    pub unusual_multiplier: Decimal,
    /// Gigabytes in one day.
    pub peak_daily_gb: Decimal,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            warning_percent: Decimal::from(80),
            unusual_multiplier: Decimal::TWO,
            peak_daily_gb: Decimal::from(50),
        }
    }
}

impl AlertPolicy {
    /// Fresh, untriggered alert definitions in evaluation order.
    pub fn standard_alerts(&self) -> Vec<UsageAlert> {
        AlertKind::ORDER
            .iter()
            .map(|kind| {
                let threshold = match kind {
                    AlertKind::QuotaWarning => self.warning_percent,
                    AlertKind::QuotaExceeded => Decimal::ONE_HUNDRED,
                    AlertKind::UnusualUsage => self.unusual_multiplier,
                    AlertKind::PeakUsage => self.peak_daily_gb,
                };
                UsageAlert::armed(*kind, threshold)
            })
            .collect()
    }
}

fn out_of_range(what: &str) -> EngineError {
    EngineError::InvalidInput(format!("{} is outside the supported range", what))
}

/// Quota snapshot for `total_used` against `quota`. The percentage is kept
/// exact; round it only for display.
pub fn quota_snapshot(quota: &DataQuota, total_used: Decimal) -> Result<QuotaSnapshot, EngineError> {
    match quota {
        DataQuota::Unlimited => Ok(QuotaSnapshot {
            allocated_gb: Decimal::ZERO,
            remaining_gb: Decimal::ZERO,
            percentage_used: Decimal::ZERO,
            is_unlimited: true,
        }),
        DataQuota::Limited(allocated) if *allocated < Decimal::ZERO => Err(
            EngineError::NegativeQuotaResult(format!("allocated quota is {} GB", allocated)),
        ),
        DataQuota::Limited(allocated) => {
            let remaining = (*allocated - total_used).max(Decimal::ZERO);
            let percentage = if allocated.is_zero() {
                if total_used > Decimal::ZERO {
                    Decimal::ONE_HUNDRED
                } else {
                    Decimal::ZERO
                }
            } else {
                total_used
                    .checked_div(*allocated)
                    .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
                    .ok_or_else(|| out_of_range("Quota percentage"))?
            };
            Ok(QuotaSnapshot {
                allocated_gb: *allocated,
                remaining_gb: remaining,
                percentage_used: percentage,
                is_unlimited: false,
            })
        }
    }
}

fn quota_of(snapshot: &QuotaSnapshot) -> DataQuota {
    if snapshot.is_unlimited {
        DataQuota::Unlimited
    } else {
        DataQuota::Limited(snapshot.allocated_gb)
    }
}

/// A fresh period for `subscription` on `plan`, starting at `now` and
/// running to the end of the subscription's billing window.
pub fn open_period(
    subscription: &Subscription,
    plan: &Plan,
    policy: &AlertPolicy,
    now: DateTime<Utc>,
) -> Result<UsagePeriod, EngineError> {
    let quota = quota_snapshot(&plan.quota, Decimal::ZERO)?;
    let cycle = subscription.billing.cycle;
    let period_end = if subscription.billing.end_utc > now {
        subscription.billing.end_utc
    } else {
        cycle.period_end(now)
    };

    Ok(UsagePeriod {
        period_id: Uuid::new_v4(),
        subscription_id: subscription.subscription_id,
        plan_id: plan.plan_id,
        cycle,
        period_start: now,
        period_end,
        daily_usage: Vec::new(),
        total_used_gb: Decimal::ZERO,
        average_daily_gb: Decimal::ZERO,
        peak: None,
        quota,
        alerts: policy.standard_alerts(),
        recommendations: Vec::new(),
        version: 0,
        created_utc: now,
        updated_utc: now,
    })
}

/// Recompute every derived field from the daily entries.
pub fn recompute(period: &mut UsagePeriod) -> Result<(), EngineError> {
    let total = period
        .daily_usage
        .iter()
        .try_fold(Decimal::ZERO, |acc, d| acc.checked_add(d.amount_gb))
        .ok_or_else(|| out_of_range("Total usage"))?;
    let days = period.daily_usage.len();

    let mut peak: Option<PeakUsage> = None;
    let mut by_date: Vec<&DailyUsage> = period.daily_usage.iter().collect();
    by_date.sort_by_key(|d| d.date);
    for day in by_date {
        if peak.as_ref().map_or(true, |p| day.amount_gb > p.amount_gb) {
            peak = Some(PeakUsage {
                date: day.date,
                amount_gb: day.amount_gb,
            });
        }
    }

    period.quota = quota_snapshot(&quota_of(&period.quota), total)?;
    period.total_used_gb = total;
    period.average_daily_gb = if days == 0 {
        Decimal::ZERO
    } else {
        (total / Decimal::from(days)).round_dp(4)
    };
    period.peak = peak;
    Ok(())
}

/// Latch every untriggered alert whose condition holds, in the fixed order.
/// `day_amount` is the accumulated usage of the date just ingested.
pub fn evaluate_alerts(
    period: &mut UsagePeriod,
    day_amount: Decimal,
    now: DateTime<Utc>,
) -> Vec<AlertKind> {
    let percentage = period.quota.percentage_used;
    let average = period.average_daily_gb;
    let mut fired = Vec::new();

    for kind in AlertKind::ORDER {
        let Some(alert) = period.alerts.iter_mut().find(|a| a.kind == kind) else {
            continue;
        };
        if alert.triggered {
            continue;
        }

        let holds = match kind {
            AlertKind::QuotaWarning => !period.quota.is_unlimited && percentage >= alert.threshold,
            AlertKind::QuotaExceeded => {
                !period.quota.is_unlimited && percentage >= Decimal::ONE_HUNDRED
            }
            AlertKind::UnusualUsage => alert
                .threshold
                .checked_mul(average)
                .is_some_and(|limit| day_amount > limit),
            AlertKind::PeakUsage => day_amount >= alert.threshold,
        };
        if holds {
            alert.triggered = true;
            alert.triggered_utc = Some(now);
            fired.push(kind);
        }
    }
    fired
}

/// Accumulate `amount_gb` onto `date` and refresh derived state and alerts.
/// Returns the alerts that fired on this call. On error `period` is left
/// untouched.
pub fn accumulate(
    period: &mut UsagePeriod,
    date: NaiveDate,
    amount_gb: Decimal,
    hourly: Option<BTreeMap<u8, Decimal>>,
    now: DateTime<Utc>,
) -> Result<Vec<AlertKind>, EngineError> {
    if amount_gb < Decimal::ZERO {
        return Err(EngineError::InvalidInput(format!(
            "Usage amount must not be negative, got {}",
            amount_gb
        )));
    }
    if let Some(hourly) = &hourly {
        if hourly.keys().any(|h| *h > 23) {
            return Err(EngineError::InvalidInput(
                "Hourly breakdown keys must be hours 0-23".to_string(),
            ));
        }
        if hourly.values().any(|v| *v < Decimal::ZERO) {
            return Err(EngineError::InvalidInput(
                "Hourly usage must not be negative".to_string(),
            ));
        }
    }
    let first_day = period.period_start.date_naive();
    let last_day = (period.period_end - Duration::nanoseconds(1)).date_naive();
    if date < first_day || date > last_day {
        return Err(EngineError::InvalidInput(format!(
            "Date {} is outside the usage period {} to {}",
            date, first_day, last_day
        )));
    }

    let mut next = period.clone();
    let day_amount = match next.daily_usage.iter_mut().find(|d| d.date == date) {
        Some(entry) => {
            entry.amount_gb = entry
                .amount_gb
                .checked_add(amount_gb)
                .ok_or_else(|| out_of_range("Daily usage"))?;
            if hourly.is_some() {
                entry.hourly = hourly;
            }
            entry.amount_gb
        }
        None => {
            next.daily_usage.push(DailyUsage {
                date,
                amount_gb,
                hourly,
            });
            amount_gb
        }
    };

    recompute(&mut next)?;
    next.updated_utc = now;
    let fired = evaluate_alerts(&mut next, day_amount, now);
    *period = next;
    Ok(fired)
}

/// Usage ledger over the configured store.
#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn EntitlementStore>,
    locks: Arc<KeyedLocks<Uuid>>,
    advisor: RecommendationAdvisor,
    policy: AlertPolicy,
}

impl UsageLedger {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        locks: Arc<KeyedLocks<Uuid>>,
        policy: AlertPolicy,
    ) -> Self {
        let advisor = RecommendationAdvisor::new(store.clone());
        Self {
            store,
            locks,
            advisor,
            policy,
        }
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    /// Record usage for `date` on the subscription's current period.
    #[instrument(skip(self, hourly), fields(subscription_id = %subscription_id, date = %date, amount_gb = %amount_gb))]
    pub async fn record_daily_usage(
        &self,
        subscription_id: Uuid,
        date: NaiveDate,
        amount_gb: Decimal,
        hourly: Option<BTreeMap<u8, Decimal>>,
        now: DateTime<Utc>,
    ) -> Result<UsagePeriod, EngineError> {
        let _guard = self.locks.lock(&subscription_id).await;

        let result = self
            .ingest(subscription_id, date, amount_gb, hourly, now)
            .await;
        match &result {
            Ok(_) => record_usage_ingestion("ok"),
            Err(e) => {
                record_usage_ingestion(e.kind());
                record_error(e.kind(), "record_daily_usage");
                if matches!(e, EngineError::NegativeQuotaResult(_)) {
                    error!(error = %e, "Quota invariant violated");
                }
            }
        }
        result
    }

    async fn ingest(
        &self,
        subscription_id: Uuid,
        date: NaiveDate,
        amount_gb: Decimal,
        hourly: Option<BTreeMap<u8, Decimal>>,
        now: DateTime<Utc>,
    ) -> Result<UsagePeriod, EngineError> {
        let mut period = self
            .store
            .current_period(subscription_id)
            .await?
            .ok_or(EngineError::UsagePeriodNotFound(subscription_id))?;

        let fired = accumulate(&mut period, date, amount_gb, hourly, now)?;
        self.advisor.refresh(&mut period, now).await?;

        let saved = self.store.save_period(&period).await?;

        for kind in &fired {
            record_alert_triggered(kind.as_str());
            info!(
                alert = kind.as_str(),
                percentage_used = %saved.quota.percentage_used.round_dp(2),
                "Usage alert triggered"
            );
        }
        Ok(saved)
    }

    /// Build, without persisting, a fresh period for `subscription` on `plan`.
    pub fn reset_for_new_period(
        &self,
        subscription: &Subscription,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<UsagePeriod, EngineError> {
        open_period(subscription, plan, &self.policy, now).inspect_err(|e| {
            error!(error = %e, plan_id = %plan.plan_id, "Cannot open usage period");
        })
    }

    pub async fn current_period(&self, subscription_id: Uuid) -> Result<UsagePeriod, EngineError> {
        self.store
            .current_period(subscription_id)
            .await?
            .ok_or(EngineError::UsagePeriodNotFound(subscription_id))
    }

    /// Closed periods followed by the current one.
    pub async fn period_history(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<UsagePeriod>, EngineError> {
        self.store.list_periods(subscription_id).await
    }
}
