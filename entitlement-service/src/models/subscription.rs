//! Subscription model.

use super::discount::{Discount, DiscountUsage};
use super::plan::BillingCycle;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "trial" => SubscriptionStatus::Trial,
            "cancelled" => SubscriptionStatus::Cancelled,
            "expired" => SubscriptionStatus::Expired,
            _ => SubscriptionStatus::Active,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event recorded in a subscription's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Subscribed,
    TrialStarted,
    Upgraded,
    Downgraded,
    Cancelled,
    Renewed,
    Expired,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Subscribed => "subscribed",
            HistoryAction::TrialStarted => "trial_started",
            HistoryAction::Upgraded => "upgraded",
            HistoryAction::Downgraded => "downgraded",
            HistoryAction::Cancelled => "cancelled",
            HistoryAction::Renewed => "renewed",
            HistoryAction::Expired => "expired",
        }
    }
}

/// Append-only history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: HistoryAction,
    pub from_status: Option<SubscriptionStatus>,
    pub to_status: SubscriptionStatus,
    pub plan_id: Uuid,
    pub previous_plan_id: Option<Uuid>,
    pub reason: Option<String>,
    pub occurred_utc: DateTime<Utc>,
}

/// Billing window of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingWindow {
    pub cycle: BillingCycle,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub next_billing_utc: DateTime<Utc>,
    pub auto_renew: bool,
}

impl BillingWindow {
    pub fn starting_at(cycle: BillingCycle, start: DateTime<Utc>, auto_renew: bool) -> Self {
        let end = cycle.period_end(start);
        Self {
            cycle,
            start_utc: start,
            end_utc: end,
            next_billing_utc: end,
            auto_renew,
        }
    }

    /// Extend by one cycle of `cycle`, starting where the window ended.
    pub fn extended(&self, cycle: BillingCycle) -> Self {
        let end = cycle.period_end(self.end_utc);
        Self {
            cycle,
            start_utc: self.start_utc,
            end_utc: end,
            next_billing_utc: end,
            auto_renew: self.auto_renew,
        }
    }
}

/// Price snapshot captured at subscribe / change-plan / renew time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingSnapshot {
    pub base_price: Decimal,
    pub discount_amount: Decimal,
    pub final_price: Decimal,
    pub currency: String,
}

impl PricingSnapshot {
    /// `final = base - discount`; the discount is capped at the base price.
    pub fn new(base_price: Decimal, discount_amount: Decimal, currency: &str) -> Self {
        let discount_amount = discount_amount.max(Decimal::ZERO).min(base_price);
        Self {
            base_price,
            discount_amount,
            final_price: base_price - discount_amount,
            currency: currency.to_string(),
        }
    }

    pub fn full_price(base_price: Decimal, currency: &str) -> Self {
        Self::new(base_price, Decimal::ZERO, currency)
    }
}

/// Discount applied to a subscription; immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub discount_id: Uuid,
    pub code: String,
    pub amount: Decimal,
    pub applied_utc: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Subscription aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub billing: BillingWindow,
    pub pricing: PricingSnapshot,
    pub applied_discounts: Vec<AppliedDiscount>,
    pub history: Vec<HistoryEntry>,
    /// Optimistic concurrency token, bumped on every commit.
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    /// Move to `to` (possibly the same status) and append exactly one
    /// history entry describing the move.
    pub fn record_transition(
        &mut self,
        action: HistoryAction,
        to: SubscriptionStatus,
        previous_plan_id: Option<Uuid>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) {
        let from = self.status;
        self.status = to;
        self.history.push(HistoryEntry {
            action,
            from_status: Some(from),
            to_status: to,
            plan_id: self.plan_id,
            previous_plan_id,
            reason,
            occurred_utc: now,
        });
        self.updated_utc = now;
    }

    /// Record a claimed discount against this subscription's price.
    pub fn attach_discount(&mut self, discount: &Discount, usage: &DiscountUsage) {
        self.pricing = PricingSnapshot::new(
            self.pricing.base_price,
            self.pricing.discount_amount + usage.amount,
            &self.pricing.currency,
        );
        self.applied_discounts.push(AppliedDiscount {
            discount_id: discount.discount_id,
            code: discount.code.clone(),
            amount: usage.amount,
            applied_utc: usage.applied_utc,
            valid_until: discount.valid_until,
        });
    }

    /// Discount amount still carried at `now`.
    pub fn carried_discount(&self, now: DateTime<Utc>) -> Decimal {
        self.applied_discounts
            .iter()
            .filter(|d| d.valid_until > now)
            .map(|d| d.amount)
            .sum()
    }

    /// Uncapped discount the current price was built from: every applied
    /// discount since subscribe, or those still valid at the latest renew.
    pub fn discount_in_effect(&self) -> Decimal {
        let last_renewal = self
            .history
            .iter()
            .rev()
            .find(|h| h.action == HistoryAction::Renewed);
        match last_renewal {
            Some(entry) => self.carried_discount(entry.occurred_utc),
            None => self.applied_discounts.iter().map(|d| d.amount).sum(),
        }
    }

    pub fn history_actions(&self) -> Vec<HistoryAction> {
        self.history.iter().map(|h| h.action).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_never_goes_negative() {
        let pricing = PricingSnapshot::new(Decimal::from(799), Decimal::from(1000), "INR");
        assert_eq!(pricing.discount_amount, Decimal::from(799));
        assert_eq!(pricing.final_price, Decimal::ZERO);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SubscriptionStatus::Trial,
            SubscriptionStatus::Active,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(SubscriptionStatus::from_string(status.as_str()), status);
        }
        assert!(SubscriptionStatus::Cancelled.is_terminal());
        assert!(!SubscriptionStatus::Trial.is_terminal());
    }
}
