//! Subscription state machine: subscribe, trial start, change plan, cancel,
//! renew and expire.

use super::discounts::DiscountEngine;
use super::locks::KeyedLocks;
use super::metrics::{record_discount_application, record_error, record_subscription_operation};
use super::store::{DiscountClaim, EntitlementStore, SubscriptionCommit};
use super::usage_ledger::UsageLedger;
use crate::error::EngineError;
use crate::models::{
    BillingCycle, BillingWindow, DiscountOutcome, HistoryAction, HistoryEntry, Plan,
    PricingSnapshot, Subscription, SubscriptionStatus, UsagePeriod,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// What subscribe does when a supplied discount code cannot be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountFallback {
    /// Subscribe at full price and report the rejection.
    #[default]
    FullPrice,
    /// Fail the subscribe with the discount error.
    Reject,
}

impl DiscountFallback {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountFallback::FullPrice => "full_price",
            DiscountFallback::Reject => "reject",
        }
    }

}

impl FromStr for DiscountFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full_price" => Ok(DiscountFallback::FullPrice),
            "reject" => Ok(DiscountFallback::Reject),
            _ => Err(format!("Invalid discount fallback: {}", s)),
        }
    }
}

/// Fire-and-forget customer notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: Uuid, message: &str) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, user_id: Uuid, message: &str) -> anyhow::Result<()> {
        info!(user_id = %user_id, message = message, "Customer notification");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub discount_code: Option<String>,
    /// Defaults to the plan's own cycle.
    pub billing_cycle: Option<BillingCycle>,
    #[serde(default = "default_auto_renew")]
    pub auto_renew: bool,
}

fn default_auto_renew() -> bool {
    true
}

impl SubscribeRequest {
    pub fn new(user_id: Uuid, plan_id: Uuid) -> Self {
        Self {
            user_id,
            plan_id,
            discount_code: None,
            billing_cycle: None,
            auto_renew: true,
        }
    }

    pub fn with_discount_code(mut self, code: impl Into<String>) -> Self {
        self.discount_code = Some(code.into());
        self
    }

    pub fn with_billing_cycle(mut self, cycle: BillingCycle) -> Self {
        self.billing_cycle = Some(cycle);
        self
    }
}

/// Result of subscribe or trial start.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionReceipt {
    pub subscription: Subscription,
    pub period: UsagePeriod,
    pub discount: DiscountOutcome,
}

/// Outcome of one due-subscription sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub renewed: Vec<Uuid>,
    pub expired: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

fn new_subscription(
    request: &SubscribeRequest,
    plan: &Plan,
    status: SubscriptionStatus,
    billing: BillingWindow,
    pricing: PricingSnapshot,
    action: HistoryAction,
    now: DateTime<Utc>,
) -> Subscription {
    Subscription {
        subscription_id: Uuid::new_v4(),
        user_id: request.user_id,
        plan_id: plan.plan_id,
        status,
        billing,
        pricing,
        applied_discounts: Vec::new(),
        history: vec![HistoryEntry {
            action,
            from_status: None,
            to_status: status,
            plan_id: plan.plan_id,
            previous_plan_id: None,
            reason: None,
            occurred_utc: now,
        }],
        version: 0,
        created_utc: now,
        updated_utc: now,
    }
}

fn invalid_transition(from: SubscriptionStatus, action: &'static str) -> EngineError {
    EngineError::InvalidStateTransition { from, action }
}

/// Subscription lifecycle orchestrator.
#[derive(Clone)]
pub struct SubscriptionLifecycle {
    store: Arc<dyn EntitlementStore>,
    discounts: DiscountEngine,
    ledger: UsageLedger,
    locks: Arc<KeyedLocks<Uuid>>,
    notifier: Arc<dyn Notifier>,
    fallback: DiscountFallback,
}

impl SubscriptionLifecycle {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        discounts: DiscountEngine,
        ledger: UsageLedger,
        locks: Arc<KeyedLocks<Uuid>>,
        notifier: Arc<dyn Notifier>,
        fallback: DiscountFallback,
    ) -> Self {
        Self {
            store,
            discounts,
            ledger,
            locks,
            notifier,
            fallback,
        }
    }

    pub fn fallback(&self) -> DiscountFallback {
        self.fallback
    }

    pub async fn get(&self, subscription_id: Uuid) -> Result<Subscription, EngineError> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or(EngineError::SubscriptionNotFound(subscription_id))
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Subscription>, EngineError> {
        self.store.list_user_subscriptions(user_id).await
    }

    async fn available_plan(&self, plan_id: Uuid, now: DateTime<Utc>) -> Result<Plan, EngineError> {
        let plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or(EngineError::PlanNotFound(plan_id))?;
        if !self.store.is_available(&plan, now) {
            return Err(EngineError::PlanUnavailable(plan_id));
        }
        Ok(plan)
    }

    async fn ensure_no_live_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> Result<(), EngineError> {
        match self.store.find_active_subscription(user_id, plan_id).await? {
            Some(_) => Err(EngineError::DuplicateActiveSubscription { user_id, plan_id }),
            None => Ok(()),
        }
    }

    fn observe<T>(&self, operation: &str, result: &Result<T, EngineError>) {
        match result {
            Ok(_) => record_subscription_operation(operation, "ok"),
            Err(e) => {
                record_subscription_operation(operation, e.kind());
                record_error(e.kind(), operation);
            }
        }
    }

    async fn notify(&self, user_id: Uuid, message: String) {
        if let Err(e) = self.notifier.notify(user_id, &message).await {
            warn!(error = %e, user_id = %user_id, "Notification failed");
        }
    }

    /// Subscribe a user to a plan, optionally with a discount code.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, plan_id = %request.plan_id))]
    pub async fn subscribe(
        &self,
        request: SubscribeRequest,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionReceipt, EngineError> {
        let result = self.subscribe_inner(&request, now).await;
        self.observe("subscribe", &result);

        if let Ok(receipt) = &result {
            let s = &receipt.subscription;
            info!(
                subscription_id = %s.subscription_id,
                final_price = %s.pricing.final_price,
                "Subscription created"
            );
            self.notify(
                s.user_id,
                format!(
                    "Your subscription is active. You pay {} {} until {}.",
                    s.pricing.final_price,
                    s.pricing.currency,
                    s.billing.end_utc.date_naive()
                ),
            )
            .await;
        }
        result
    }

    async fn subscribe_inner(
        &self,
        request: &SubscribeRequest,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionReceipt, EngineError> {
        let plan = self.available_plan(request.plan_id, now).await?;
        self.ensure_no_live_subscription(request.user_id, plan.plan_id)
            .await?;

        let cycle = request.billing_cycle.unwrap_or(plan.billing_cycle);
        let subscription = new_subscription(
            request,
            &plan,
            SubscriptionStatus::Active,
            BillingWindow::starting_at(cycle, now, request.auto_renew),
            PricingSnapshot::full_price(plan.cycle_price(cycle), &plan.currency),
            HistoryAction::Subscribed,
            now,
        );
        let period = self
            .ledger
            .reset_for_new_period(&subscription, &plan, now)?;

        let claim = match &request.discount_code {
            Some(code) => match self.resolve_claim(code, &subscription, &plan).await {
                Ok(claim) => Some(claim),
                Err(e) => {
                    return self
                        .fall_back(code, e, subscription, period, now)
                        .await;
                }
            },
            None => None,
        };
        let code = request.discount_code.clone();

        let commit = SubscriptionCommit {
            subscription: subscription.clone(),
            period: period.clone(),
            claim,
        };
        match self.store.commit_subscription(commit, now).await {
            Ok(committed) => {
                let discount = match committed.discount {
                    Some((discount, usage)) => {
                        record_discount_application("applied");
                        DiscountOutcome::Applied {
                            discount_id: discount.discount_id,
                            amount: usage.amount,
                        }
                    }
                    None => DiscountOutcome::NotRequested,
                };
                Ok(SubscriptionReceipt {
                    subscription: committed.subscription,
                    period: committed.period,
                    discount,
                })
            }
            Err(e) if e.is_discount_rejection() => match code {
                Some(code) => self.fall_back(&code, e, subscription, period, now).await,
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn resolve_claim(
        &self,
        code: &str,
        subscription: &Subscription,
        plan: &Plan,
    ) -> Result<DiscountClaim, EngineError> {
        let discount = self.discounts.find_by_code(code).await?;
        self.discounts
            .claim_for(
                &discount,
                subscription.user_id,
                subscription.subscription_id,
                plan,
                subscription.pricing.base_price,
            )
            .await
    }

    /// Apply the discount fallback policy after `reason` rejected `code`.
    async fn fall_back(
        &self,
        code: &str,
        reason: EngineError,
        subscription: Subscription,
        period: UsagePeriod,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionReceipt, EngineError> {
        record_discount_application(reason.kind());
        if !reason.is_discount_rejection() || self.fallback == DiscountFallback::Reject {
            return Err(reason);
        }

        warn!(
            code = code,
            reason = reason.kind(),
            "Discount not applied, subscribing at full price"
        );
        let committed = self
            .store
            .commit_subscription(
                SubscriptionCommit {
                    subscription,
                    period,
                    claim: None,
                },
                now,
            )
            .await?;

        Ok(SubscriptionReceipt {
            subscription: committed.subscription,
            period: committed.period,
            discount: DiscountOutcome::Rejected {
                code: code.to_string(),
                reason: reason.to_string(),
            },
        })
    }

    /// Start a free trial that ends after `trial_days`.
    #[instrument(skip(self), fields(user_id = %user_id, plan_id = %plan_id))]
    pub async fn start_trial(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        trial_days: u32,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionReceipt, EngineError> {
        let result = self.start_trial_inner(user_id, plan_id, trial_days, now).await;
        self.observe("start_trial", &result);
        if let Ok(receipt) = &result {
            info!(
                subscription_id = %receipt.subscription.subscription_id,
                trial_ends = %receipt.subscription.billing.end_utc,
                "Trial started"
            );
        }
        result
    }

    async fn start_trial_inner(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        trial_days: u32,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionReceipt, EngineError> {
        if trial_days == 0 {
            return Err(EngineError::InvalidInput(
                "Trial must last at least one day".to_string(),
            ));
        }
        let plan = self.available_plan(plan_id, now).await?;
        self.ensure_no_live_subscription(user_id, plan_id).await?;

        let end = now + Duration::days(i64::from(trial_days));
        let billing = BillingWindow {
            cycle: plan.billing_cycle,
            start_utc: now,
            end_utc: end,
            next_billing_utc: end,
            auto_renew: true,
        };
        let base = plan.cycle_price(plan.billing_cycle);
        let request = SubscribeRequest::new(user_id, plan_id);
        let subscription = new_subscription(
            &request,
            &plan,
            SubscriptionStatus::Trial,
            billing,
            PricingSnapshot::new(base, base, &plan.currency),
            HistoryAction::TrialStarted,
            now,
        );
        let period = self
            .ledger
            .reset_for_new_period(&subscription, &plan, now)?;

        let committed = self
            .store
            .commit_subscription(
                SubscriptionCommit {
                    subscription,
                    period,
                    claim: None,
                },
                now,
            )
            .await?;

        Ok(SubscriptionReceipt {
            subscription: committed.subscription,
            period: committed.period,
            discount: DiscountOutcome::NotRequested,
        })
    }

    /// Move an active subscription to another plan.
    #[instrument(skip(self, reason), fields(subscription_id = %subscription_id, new_plan_id = %new_plan_id))]
    pub async fn change_plan(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EngineError> {
        let _guard = self.locks.lock(&subscription_id).await;
        let result = self
            .change_plan_inner(subscription_id, new_plan_id, reason, now)
            .await;
        self.observe("change_plan", &result);
        if let Ok(s) = &result {
            info!(
                action = s.history.last().map(|h| h.action.as_str()).unwrap_or_default(),
                final_price = %s.pricing.final_price,
                "Plan changed"
            );
        }
        result
    }

    async fn change_plan_inner(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EngineError> {
        let mut subscription = self.get(subscription_id).await?;
        if subscription.status != SubscriptionStatus::Active {
            return Err(invalid_transition(subscription.status, "change plan"));
        }
        if subscription.plan_id == new_plan_id {
            return Err(EngineError::InvalidInput(
                "Subscription is already on this plan".to_string(),
            ));
        }
        let plan = self.available_plan(new_plan_id, now).await?;

        let new_base = plan.cycle_price(subscription.billing.cycle);
        let action = if new_base > subscription.pricing.base_price {
            HistoryAction::Upgraded
        } else {
            HistoryAction::Downgraded
        };

        let previous_plan_id = subscription.plan_id;
        subscription.plan_id = plan.plan_id;
        subscription.pricing =
            PricingSnapshot::new(new_base, subscription.discount_in_effect(), &plan.currency);
        subscription.record_transition(
            action,
            SubscriptionStatus::Active,
            Some(previous_plan_id),
            reason,
            now,
        );

        let period = self
            .ledger
            .reset_for_new_period(&subscription, &plan, now)?;
        self.store
            .commit_transition(&subscription, Some(&period))
            .await
    }

    /// Cancel an active or trial subscription. The current usage period is
    /// kept.
    #[instrument(skip(self, reason), fields(subscription_id = %subscription_id))]
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EngineError> {
        let _guard = self.locks.lock(&subscription_id).await;
        let result = self.cancel_inner(subscription_id, reason, now).await;
        self.observe("cancel", &result);

        if let Ok(s) = &result {
            info!("Subscription cancelled");
            self.notify(
                s.user_id,
                "Your subscription has been cancelled.".to_string(),
            )
            .await;
        }
        result
    }

    async fn cancel_inner(
        &self,
        subscription_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EngineError> {
        let mut subscription = self.get(subscription_id).await?;
        if !matches!(
            subscription.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trial
        ) {
            return Err(invalid_transition(subscription.status, "cancel"));
        }

        subscription.billing.auto_renew = false;
        subscription.record_transition(
            HistoryAction::Cancelled,
            SubscriptionStatus::Cancelled,
            None,
            reason,
            now,
        );
        self.store.commit_transition(&subscription, None).await
    }

    /// Extend the billing window by one cycle and open a new usage period.
    /// `cycle` switches the billing cycle from here on. Only due once the
    /// current window has ended.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn renew(
        &self,
        subscription_id: Uuid,
        cycle: Option<BillingCycle>,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EngineError> {
        let _guard = self.locks.lock(&subscription_id).await;
        let result = self.renew_inner(subscription_id, cycle, now).await;
        self.observe("renew", &result);
        if let Ok(s) = &result {
            info!(
                end_utc = %s.billing.end_utc,
                final_price = %s.pricing.final_price,
                "Subscription renewed"
            );
        }
        result
    }

    async fn renew_inner(
        &self,
        subscription_id: Uuid,
        cycle: Option<BillingCycle>,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EngineError> {
        let mut subscription = self.get(subscription_id).await?;
        if subscription.status == SubscriptionStatus::Cancelled {
            return Err(invalid_transition(subscription.status, "renew"));
        }
        if now < subscription.billing.end_utc {
            return Err(EngineError::RenewalNotDue {
                subscription_id,
                due_utc: subscription.billing.end_utc,
            });
        }
        let plan = self.available_plan(subscription.plan_id, now).await?;
        let cycle = cycle.unwrap_or(subscription.billing.cycle);

        let mut billing = subscription.billing.extended(cycle);
        if billing.end_utc <= now {
            billing = BillingWindow::starting_at(cycle, now, subscription.billing.auto_renew);
        }
        subscription.billing = billing;
        subscription.pricing = PricingSnapshot::new(
            plan.cycle_price(cycle),
            subscription.carried_discount(now),
            &plan.currency,
        );
        subscription.record_transition(
            HistoryAction::Renewed,
            SubscriptionStatus::Active,
            None,
            None,
            now,
        );

        let period = self
            .ledger
            .reset_for_new_period(&subscription, &plan, now)?;
        self.store
            .commit_transition(&subscription, Some(&period))
            .await
    }

    /// Move an active or trial subscription to `expired`.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn expire(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EngineError> {
        let _guard = self.locks.lock(&subscription_id).await;
        let result = self.expire_inner(subscription_id, now).await;
        self.observe("expire", &result);
        if result.is_ok() {
            info!("Subscription expired");
        }
        result
    }

    async fn expire_inner(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EngineError> {
        let mut subscription = self.get(subscription_id).await?;
        if subscription.status.is_terminal() {
            return Err(invalid_transition(subscription.status, "expire"));
        }
        subscription.record_transition(
            HistoryAction::Expired,
            SubscriptionStatus::Expired,
            None,
            None,
            now,
        );
        self.store.commit_transition(&subscription, None).await
    }

    /// Renew every due subscription with auto-renew on and expire the rest.
    /// One failure does not stop the sweep.
    #[instrument(skip(self))]
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<SweepSummary, EngineError> {
        let due = self.store.list_due_subscriptions(now).await?;
        let mut summary = SweepSummary::default();

        for subscription in due {
            let id = subscription.subscription_id;
            let result = if subscription.billing.auto_renew {
                self.renew(id, None, now).await.map(|_| true)
            } else {
                self.expire(id, now).await.map(|_| false)
            };
            match result {
                Ok(true) => summary.renewed.push(id),
                Ok(false) => summary.expired.push(id),
                Err(e) => {
                    warn!(subscription_id = %id, error = %e, "Due subscription not processed");
                    summary.failed.push((id, e.kind().to_string()));
                }
            }
        }

        info!(
            renewed = summary.renewed.len(),
            expired = summary.expired.len(),
            failed = summary.failed.len(),
            "Due subscriptions processed"
        );
        Ok(summary)
    }
}
