//! Domain models for entitlement-service.

mod discount;
mod plan;
mod subscription;
mod usage;

pub use discount::{
    normalize_code, Discount, DiscountConditions, DiscountKind, DiscountOutcome, DiscountUsage,
    NewDiscount, UpdateDiscountTerms,
};
pub use plan::{BillingCycle, DataQuota, NewPlan, Plan};
pub use subscription::{
    AppliedDiscount, BillingWindow, HistoryAction, HistoryEntry, PricingSnapshot, Subscription,
    SubscriptionStatus,
};
pub use usage::{
    AlertKind, DailyUsage, PeakUsage, QuotaSnapshot, Recommendation, RecommendationKind,
    UsageAlert, UsagePeriod, UsageTime,
};
