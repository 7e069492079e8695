//! Plan model, as served by the plan catalog.

use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Billing cycle governing a subscription's usage-period boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Quarterly => "quarterly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "quarterly" => BillingCycle::Quarterly,
            "yearly" | "annually" => BillingCycle::Yearly,
            _ => BillingCycle::Monthly,
        }
    }

    /// Number of calendar months covered by one cycle.
    pub fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Quarterly => 3,
            BillingCycle::Yearly => 12,
        }
    }

    /// End of the cycle starting at `start`.
    pub fn period_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        let months = self.months();
        start
            .checked_add_months(Months::new(months))
            .unwrap_or_else(|| start + Duration::days(30 * i64::from(months)))
    }
}

/// Data allowance attached to a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "gb", rename_all = "snake_case")]
pub enum DataQuota {
    Limited(Decimal),
    Unlimited,
}

impl DataQuota {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, DataQuota::Unlimited)
    }

    /// Allocated gigabytes; zero for unlimited plans.
    pub fn allocated_gb(&self) -> Decimal {
        match self {
            DataQuota::Limited(gb) => *gb,
            DataQuota::Unlimited => Decimal::ZERO,
        }
    }
}

/// Catalog plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub name: String,
    pub plan_type: String,
    pub monthly_price: Decimal,
    pub currency: String,
    pub quota: DataQuota,
    pub billing_cycle: BillingCycle,
    pub is_active: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Plan {
    /// Active and inside its validity window (open bounds are unbounded).
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.valid_from.map_or(true, |from| now >= from)
            && self.valid_until.map_or(true, |until| now <= until)
    }

    /// Price for one full cycle of the given kind.
    pub fn cycle_price(&self, cycle: BillingCycle) -> Decimal {
        self.monthly_price * Decimal::from(cycle.months())
    }
}

/// Input for registering a catalog plan.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewPlan {
    #[validate(length(min = 1, max = 120, message = "Plan name is required"))]
    pub name: String,
    #[validate(length(min = 1, max = 60, message = "Plan type is required"))]
    pub plan_type: String,
    pub monthly_price: Decimal,
    #[validate(length(equal = 3, message = "Currency must be an ISO 4217 code"))]
    pub currency: String,
    pub quota: DataQuota,
    pub billing_cycle: BillingCycle,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl NewPlan {
    pub fn into_plan(self, now: DateTime<Utc>) -> Plan {
        Plan {
            plan_id: Uuid::new_v4(),
            name: self.name,
            plan_type: self.plan_type,
            monthly_price: self.monthly_price,
            currency: self.currency.to_uppercase(),
            quota: self.quota,
            billing_cycle: self.billing_cycle,
            is_active: true,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            created_utc: now,
            updated_utc: now,
        }
    }
}
