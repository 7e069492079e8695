//! Discount model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// How a discount's value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    Percentage,
    FixedAmount,
    FreeMonths,
    /// Kind stored by a newer writer; applies no amount.
    #[serde(other)]
    Unknown,
}

impl DiscountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountKind::Percentage => "percentage",
            DiscountKind::FixedAmount => "fixed_amount",
            DiscountKind::FreeMonths => "free_months",
            DiscountKind::Unknown => "unknown",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "percentage" => DiscountKind::Percentage,
            "fixed_amount" => DiscountKind::FixedAmount,
            "free_months" => DiscountKind::FreeMonths,
            _ => DiscountKind::Unknown,
        }
    }
}

fn default_max_uses_per_user() -> u32 {
    1
}

/// Applicability conditions.
///
/// Empty plan-id and plan-type sets mean "any plan".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountConditions {
    #[serde(default)]
    pub applicable_plan_ids: Vec<Uuid>,
    #[serde(default)]
    pub applicable_plan_types: Vec<String>,
    #[serde(default)]
    pub min_plan_price: Option<Decimal>,
    #[serde(default)]
    pub new_customers_only: bool,
    #[serde(default = "default_max_uses_per_user")]
    pub max_uses_per_user: u32,
    #[serde(default)]
    pub requires_referral: bool,
}

impl Default for DiscountConditions {
    fn default() -> Self {
        Self {
            applicable_plan_ids: Vec::new(),
            applicable_plan_types: Vec::new(),
            min_plan_price: None,
            new_customers_only: false,
            max_uses_per_user: default_max_uses_per_user(),
            requires_referral: false,
        }
    }
}

/// One successful application, in application order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountUsage {
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub amount: Decimal,
    pub applied_utc: DateTime<Utc>,
}

/// Discount aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discount {
    pub discount_id: Uuid,
    /// Stored upper-cased; unique while present.
    pub code: String,
    pub description: Option<String>,
    pub kind: DiscountKind,
    pub value: Decimal,
    pub conditions: DiscountConditions,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub is_active: bool,
    pub total_uses: u32,
    pub max_uses: Option<u32>,
    pub usages: Vec<DiscountUsage>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Discount {
    /// Prior successful applications by `user_id`.
    pub fn uses_by(&self, user_id: Uuid) -> u32 {
        self.usages.iter().filter(|u| u.user_id == user_id).count() as u32
    }

    /// Append a usage entry and bump the counter.
    pub fn record_usage(&mut self, usage: DiscountUsage) {
        self.updated_utc = usage.applied_utc;
        self.usages.push(usage);
        self.total_uses += 1;
    }
}

/// Normalise a user-supplied code to its stored form.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Input for creating a discount.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewDiscount {
    #[validate(length(min = 3, max = 32, message = "Code must be 3-32 characters"))]
    pub code: String,
    pub description: Option<String>,
    pub kind: DiscountKind,
    pub value: Decimal,
    #[serde(default)]
    pub conditions: DiscountConditions,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    #[validate(range(min = 1, message = "Usage cap must be at least 1"))]
    pub max_uses: Option<u32>,
}

impl NewDiscount {
    pub fn into_discount(self, now: DateTime<Utc>) -> Discount {
        Discount {
            discount_id: Uuid::new_v4(),
            code: normalize_code(&self.code),
            description: self.description,
            kind: self.kind,
            value: self.value,
            conditions: self.conditions,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            is_active: true,
            total_uses: 0,
            max_uses: self.max_uses,
            usages: Vec::new(),
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Editable terms; only accepted before the first application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDiscountTerms {
    pub description: Option<String>,
    pub value: Option<Decimal>,
    pub conditions: Option<DiscountConditions>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub max_uses: Option<Option<u32>>,
}

impl UpdateDiscountTerms {
    pub fn apply_to(self, discount: &mut Discount, now: DateTime<Utc>) {
        if let Some(description) = self.description {
            discount.description = Some(description);
        }
        if let Some(value) = self.value {
            discount.value = value;
        }
        if let Some(conditions) = self.conditions {
            discount.conditions = conditions;
        }
        if let Some(valid_from) = self.valid_from {
            discount.valid_from = valid_from;
        }
        if let Some(valid_until) = self.valid_until {
            discount.valid_until = valid_until;
        }
        if let Some(max_uses) = self.max_uses {
            discount.max_uses = max_uses;
        }
        discount.updated_utc = now;
    }
}

/// Outcome of a discount attempt during subscribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiscountOutcome {
    NotRequested,
    Applied { discount_id: Uuid, amount: Decimal },
    Rejected { code: String, reason: String },
}
