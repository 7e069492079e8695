//! Storage ports used by the engine.
//!
//! Every method that mutates shared state is an atomic unit: either the whole
//! change is visible afterwards or none of it is.

use crate::error::EngineError;
use crate::models::{
    Discount, DiscountUsage, Plan, Subscription, UpdateDiscountTerms, UsagePeriod,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Read-only plan lookup.
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, EngineError>;

    async fn list_plans(&self) -> Result<Vec<Plan>, EngineError>;

    fn is_available(&self, plan: &Plan, now: DateTime<Utc>) -> bool {
        plan.is_available(now)
    }
}

/// Facts about a customer that discount conditions depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomerProfile {
    pub user_id: Uuid,
    /// Holds no prior subscriptions of any status.
    pub is_new_customer: bool,
    pub was_referred: bool,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn prior_discount_use_count(
        &self,
        discount_id: Uuid,
        user_id: Uuid,
    ) -> Result<u32, EngineError>;

    async fn customer_profile(&self, user_id: Uuid) -> Result<CustomerProfile, EngineError>;
}

/// A request to consume one use of a discount, re-validated atomically by
/// the store against the discount's latest state.
#[derive(Debug, Clone)]
pub struct DiscountClaim {
    pub discount_id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub plan: Plan,
    pub customer: CustomerProfile,
    pub base_price: Decimal,
}

#[async_trait]
pub trait DiscountStore: Send + Sync {
    /// Fails with `DuplicateDiscountCode` if the code is taken.
    async fn insert_discount(&self, discount: &Discount) -> Result<(), EngineError>;

    async fn get_discount(&self, discount_id: Uuid) -> Result<Option<Discount>, EngineError>;

    /// `code` must already be normalised.
    async fn find_discount_by_code(&self, code: &str) -> Result<Option<Discount>, EngineError>;

    /// Fails with `DiscountInUse` once the discount has been applied.
    async fn update_discount_terms(
        &self,
        discount_id: Uuid,
        terms: UpdateDiscountTerms,
        now: DateTime<Utc>,
    ) -> Result<Discount, EngineError>;

    async fn deactivate_discount(
        &self,
        discount_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Discount, EngineError>;

    /// Conditional update: eligibility check, ledger append and counter
    /// increment as one unit, serialized per discount.
    async fn apply_discount(
        &self,
        claim: &DiscountClaim,
        now: DateTime<Utc>,
    ) -> Result<DiscountUsage, EngineError>;
}

/// Everything a subscribe/trial-start persists.
#[derive(Debug, Clone)]
pub struct SubscriptionCommit {
    pub subscription: Subscription,
    pub period: UsagePeriod,
    pub claim: Option<DiscountClaim>,
}

#[derive(Debug, Clone)]
pub struct CommittedSubscription {
    pub subscription: Subscription,
    pub period: UsagePeriod,
    pub discount: Option<(Discount, DiscountUsage)>,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, EngineError>;

    async fn find_active_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<Subscription>, EngineError>;

    async fn list_user_subscriptions(&self, user_id: Uuid)
        -> Result<Vec<Subscription>, EngineError>;

    /// Active or trial subscriptions whose billing window ended by `now`.
    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, EngineError>;

    /// Insert a new subscription with its first usage period, claiming the
    /// discount (if any) in the same unit and attaching it to the stored
    /// pricing. One live (active or trial) subscription per (user, plan) is
    /// enforced here.
    async fn commit_subscription(
        &self,
        commit: SubscriptionCommit,
        now: DateTime<Utc>,
    ) -> Result<CommittedSubscription, EngineError>;

    /// Persist a transition. `subscription.version` must match the stored
    /// version; the stored copy gets `version + 1`. A supplied period becomes
    /// the subscription's current period.
    async fn commit_transition(
        &self,
        subscription: &Subscription,
        new_period: Option<&UsagePeriod>,
    ) -> Result<Subscription, EngineError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn current_period(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<UsagePeriod>, EngineError>;

    /// All periods, oldest first.
    async fn list_periods(&self, subscription_id: Uuid) -> Result<Vec<UsagePeriod>, EngineError>;

    /// Version-checked save of an existing period.
    async fn save_period(&self, period: &UsagePeriod) -> Result<UsagePeriod, EngineError>;
}

/// The full persistence surface the engine runs against.
#[async_trait]
pub trait EntitlementStore:
    PlanCatalog + UserDirectory + DiscountStore + SubscriptionStore + UsageStore
{
    fn backend_name(&self) -> &'static str;

    async fn health_check(&self) -> Result<(), EngineError>;
}
