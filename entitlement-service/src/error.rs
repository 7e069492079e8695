//! Engine error kinds.

use crate::models::SubscriptionStatus;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Value-level failures surfaced by the engine. Callers branch on these;
/// none of them represent a crash.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Discount is not currently valid")]
    NotValid,

    #[error("Discount usage limit reached for this user")]
    UserLimitReached,

    #[error("Discount does not apply to this plan")]
    PlanNotEligible,

    #[error("Customer does not meet the discount conditions")]
    CustomerNotEligible,

    #[error("Plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("Plan is not available: {0}")]
    PlanUnavailable(Uuid),

    #[error("Discount not found: {0}")]
    DiscountNotFound(String),

    #[error("Discount code already exists: {0}")]
    DuplicateDiscountCode(String),

    #[error("Discount has already been applied and can no longer be edited")]
    DiscountInUse,

    #[error("User {user_id} already holds an active subscription to plan {plan_id}")]
    DuplicateActiveSubscription { user_id: Uuid, plan_id: Uuid },

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(Uuid),

    #[error("No usage period for subscription {0}")]
    UsagePeriodNotFound(Uuid),

    #[error("Cannot {action} a subscription in state {from}")]
    InvalidStateTransition {
        from: SubscriptionStatus,
        action: &'static str,
    },

    #[error("Subscription {subscription_id} is not due for renewal until {due_utc}")]
    RenewalNotDue {
        subscription_id: Uuid,
        due_utc: DateTime<Utc>,
    },

    #[error("Quota computation produced a negative result: {0}")]
    NegativeQuotaResult(String),

    #[error("{entity} was modified concurrently")]
    ConcurrentModification { entity: &'static str, id: Uuid },

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(anyhow::Error),
}

impl EngineError {
    /// Stable snake_case label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotValid => "not_valid",
            EngineError::UserLimitReached => "user_limit_reached",
            EngineError::PlanNotEligible => "plan_not_eligible",
            EngineError::CustomerNotEligible => "customer_not_eligible",
            EngineError::PlanNotFound(_) => "plan_not_found",
            EngineError::PlanUnavailable(_) => "plan_unavailable",
            EngineError::DiscountNotFound(_) => "discount_not_found",
            EngineError::DuplicateDiscountCode(_) => "duplicate_discount_code",
            EngineError::DiscountInUse => "discount_in_use",
            EngineError::DuplicateActiveSubscription { .. } => "duplicate_active_subscription",
            EngineError::SubscriptionNotFound(_) => "subscription_not_found",
            EngineError::UsagePeriodNotFound(_) => "usage_period_not_found",
            EngineError::InvalidStateTransition { .. } => "invalid_state_transition",
            EngineError::RenewalNotDue { .. } => "renewal_not_due",
            EngineError::NegativeQuotaResult(_) => "negative_quota_result",
            EngineError::ConcurrentModification { .. } => "concurrent_modification",
            EngineError::Validation(_) => "validation",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Storage(_) => "storage",
        }
    }

    /// Whether this error means "the discount could not be used", as opposed
    /// to a failure of the surrounding operation.
    pub fn is_discount_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::NotValid
                | EngineError::UserLimitReached
                | EngineError::PlanNotEligible
                | EngineError::CustomerNotEligible
                | EngineError::DiscountNotFound(_)
        )
    }

    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        EngineError::Storage(anyhow::anyhow!("{}: {}", context, err))
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(errors) => AppError::ValidationError(errors),
            EngineError::NotValid
            | EngineError::UserLimitReached
            | EngineError::PlanNotEligible
            | EngineError::CustomerNotEligible
            | EngineError::PlanUnavailable(_)
            | EngineError::InvalidInput(_) => AppError::Unprocessable(anyhow::Error::new(err)),
            EngineError::InvalidStateTransition { .. } | EngineError::RenewalNotDue { .. } => {
                AppError::BadRequest(anyhow::Error::new(err))
            }
            EngineError::PlanNotFound(_)
            | EngineError::DiscountNotFound(_)
            | EngineError::SubscriptionNotFound(_)
            | EngineError::UsagePeriodNotFound(_) => AppError::NotFound(anyhow::Error::new(err)),
            EngineError::DuplicateDiscountCode(_)
            | EngineError::DiscountInUse
            | EngineError::DuplicateActiveSubscription { .. }
            | EngineError::ConcurrentModification { .. } => {
                AppError::Conflict(anyhow::Error::new(err))
            }
            EngineError::Storage(e) => AppError::DatabaseError(e),
            EngineError::NegativeQuotaResult(_) => AppError::InternalError(anyhow::Error::new(err)),
        }
    }
}
