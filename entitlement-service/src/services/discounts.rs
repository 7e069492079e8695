//! Discount eligibility, amount computation and application.

use super::metrics::{record_discount_application, record_error};
use super::store::{CustomerProfile, DiscountClaim, EntitlementStore};
use crate::error::EngineError;
use crate::models::{
    normalize_code, Discount, DiscountKind, DiscountUsage, NewDiscount, Plan, UpdateDiscountTerms,
};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// `active ∧ now ∈ [start, end] ∧ (no cap ∨ total_uses < cap)`.
pub fn is_currently_valid(discount: &Discount, now: DateTime<Utc>) -> bool {
    discount.is_active
        && now >= discount.valid_from
        && now <= discount.valid_until
        && discount
            .max_uses
            .map_or(true, |cap| discount.total_uses < cap)
}

/// Ordered eligibility checks: validity, per-user cap, plan set, plan type,
/// minimum price, new-customer flag, referral flag.
pub fn check_eligibility(
    discount: &Discount,
    plan: &Plan,
    prior_uses: u32,
    customer: &CustomerProfile,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let conditions = &discount.conditions;

    if !is_currently_valid(discount, now) {
        return Err(EngineError::NotValid);
    }
    if prior_uses >= conditions.max_uses_per_user {
        return Err(EngineError::UserLimitReached);
    }
    if !conditions.applicable_plan_ids.is_empty()
        && !conditions.applicable_plan_ids.contains(&plan.plan_id)
    {
        return Err(EngineError::PlanNotEligible);
    }
    if !conditions.applicable_plan_types.is_empty()
        && !conditions
            .applicable_plan_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&plan.plan_type))
    {
        return Err(EngineError::PlanNotEligible);
    }
    if let Some(min_price) = conditions.min_plan_price {
        if plan.monthly_price < min_price {
            return Err(EngineError::PlanNotEligible);
        }
    }
    if conditions.new_customers_only && !customer.is_new_customer {
        return Err(EngineError::CustomerNotEligible);
    }
    if conditions.requires_referral && !customer.was_referred {
        return Err(EngineError::CustomerNotEligible);
    }
    Ok(())
}

/// Monetary effect of `discount` on `base_price`. Never negative; a fixed
/// amount never exceeds the base price. Free months are a one-time credit
/// of `base_price × months`. A product outside the decimal range is
/// `InvalidInput`.
pub fn compute_amount(discount: &Discount, base_price: Decimal) -> Result<Decimal, EngineError> {
    let base = base_price.max(Decimal::ZERO);
    let value = discount.value.max(Decimal::ZERO);

    let amount = match discount.kind {
        DiscountKind::Percentage => base
            .checked_mul(value)
            .and_then(|product| product.checked_div(Decimal::ONE_HUNDRED)),
        DiscountKind::FixedAmount => Some(value.min(base)),
        DiscountKind::FreeMonths => base.checked_mul(value),
        DiscountKind::Unknown => Some(Decimal::ZERO),
    }
    .ok_or_else(|| {
        EngineError::InvalidInput(format!(
            "Discount {} of {} on {} is out of range",
            discount.code, discount.value, base_price
        ))
    })?;

    Ok(amount
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .max(Decimal::ZERO))
}

/// Consume one use of `discount` for `claim`, mutating it in place.
///
/// Stores call this while holding their per-discount lock; the prior-use
/// count comes from the discount's own ledger so it cannot race.
pub fn claim_discount(
    discount: &mut Discount,
    claim: &DiscountClaim,
    now: DateTime<Utc>,
) -> Result<DiscountUsage, EngineError> {
    let prior_uses = discount.uses_by(claim.user_id);
    check_eligibility(discount, &claim.plan, prior_uses, &claim.customer, now)?;

    let usage = DiscountUsage {
        user_id: claim.user_id,
        subscription_id: claim.subscription_id,
        amount: compute_amount(discount, claim.base_price)?,
        applied_utc: now,
    };
    discount.record_usage(usage.clone());
    Ok(usage)
}

/// Request to apply a discount outside of subscribe.
#[derive(Debug, Clone)]
pub struct ApplyDiscount {
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub plan_id: Uuid,
    pub base_price: Decimal,
}

/// Discount engine.
#[derive(Clone)]
pub struct DiscountEngine {
    store: Arc<dyn EntitlementStore>,
}

impl DiscountEngine {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// Create a discount; the code is stored upper-cased.
    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_discount(
        &self,
        input: NewDiscount,
        now: DateTime<Utc>,
    ) -> Result<Discount, EngineError> {
        input.validate()?;
        if input.value < Decimal::ZERO {
            return Err(EngineError::InvalidInput(
                "Discount value must not be negative".to_string(),
            ));
        }
        if input.kind == DiscountKind::Percentage && input.value > Decimal::ONE_HUNDRED {
            return Err(EngineError::InvalidInput(
                "Percentage discount cannot exceed 100".to_string(),
            ));
        }
        if input.valid_until < input.valid_from {
            return Err(EngineError::InvalidInput(
                "Discount validity window ends before it starts".to_string(),
            ));
        }

        let discount = input.into_discount(now);
        self.store.insert_discount(&discount).await?;

        info!(
            discount_id = %discount.discount_id,
            code = %discount.code,
            kind = discount.kind.as_str(),
            "Discount created"
        );
        Ok(discount)
    }

    /// Case-insensitive lookup.
    pub async fn find_by_code(&self, code: &str) -> Result<Discount, EngineError> {
        let code = normalize_code(code);
        self.store
            .find_discount_by_code(&code)
            .await?
            .ok_or(EngineError::DiscountNotFound(code))
    }

    pub async fn get(&self, discount_id: Uuid) -> Result<Discount, EngineError> {
        self.store
            .get_discount(discount_id)
            .await?
            .ok_or_else(|| EngineError::DiscountNotFound(discount_id.to_string()))
    }

    #[instrument(skip(self, terms))]
    pub async fn update_terms(
        &self,
        discount_id: Uuid,
        terms: UpdateDiscountTerms,
        now: DateTime<Utc>,
    ) -> Result<Discount, EngineError> {
        if terms.value.is_some_and(|v| v < Decimal::ZERO) {
            return Err(EngineError::InvalidInput(
                "Discount value must not be negative".to_string(),
            ));
        }
        self.store
            .update_discount_terms(discount_id, terms, now)
            .await
    }

    /// Deactivate; the record and its ledger stay.
    #[instrument(skip(self))]
    pub async fn deactivate(
        &self,
        discount_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Discount, EngineError> {
        let discount = self.store.deactivate_discount(discount_id, now).await?;
        info!(discount_id = %discount_id, total_uses = discount.total_uses, "Discount deactivated");
        Ok(discount)
    }

    pub fn is_currently_valid(&self, discount: &Discount, now: DateTime<Utc>) -> bool {
        is_currently_valid(discount, now)
    }

    pub fn compute_amount(
        &self,
        discount: &Discount,
        base_price: Decimal,
    ) -> Result<Decimal, EngineError> {
        compute_amount(discount, base_price)
    }

    /// Non-binding eligibility check for `user_id` on `plan_id`.
    #[instrument(skip(self, discount), fields(discount_id = %discount.discount_id))]
    pub async fn can_apply(
        &self,
        discount: &Discount,
        user_id: Uuid,
        plan_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or(EngineError::PlanNotFound(plan_id))?;
        let prior_uses = self
            .store
            .prior_discount_use_count(discount.discount_id, user_id)
            .await?;
        let customer = self.store.customer_profile(user_id).await?;

        check_eligibility(discount, &plan, prior_uses, &customer, now)
    }

    /// Build the claim used by `apply` and by subscribe.
    pub(crate) async fn claim_for(
        &self,
        discount: &Discount,
        user_id: Uuid,
        subscription_id: Uuid,
        plan: &Plan,
        base_price: Decimal,
    ) -> Result<DiscountClaim, EngineError> {
        let customer = self.store.customer_profile(user_id).await?;
        Ok(DiscountClaim {
            discount_id: discount.discount_id,
            user_id,
            subscription_id,
            plan: plan.clone(),
            customer,
            base_price,
        })
    }

    /// Apply one use of `discount`; returns the amount granted. Nothing is
    /// recorded if the discount is ineligible.
    #[instrument(skip(self, discount, request), fields(discount_id = %discount.discount_id, user_id = %request.user_id))]
    pub async fn apply(
        &self,
        discount: &Discount,
        request: ApplyDiscount,
        now: DateTime<Utc>,
    ) -> Result<Decimal, EngineError> {
        let plan = self
            .store
            .get_plan(request.plan_id)
            .await?
            .ok_or(EngineError::PlanNotFound(request.plan_id))?;
        let claim = self
            .claim_for(
                discount,
                request.user_id,
                request.subscription_id,
                &plan,
                request.base_price,
            )
            .await?;

        match self.store.apply_discount(&claim, now).await {
            Ok(usage) => {
                record_discount_application("applied");
                info!(amount = %usage.amount, "Discount applied");
                Ok(usage.amount)
            }
            Err(e) => {
                record_discount_application(e.kind());
                if !e.is_discount_rejection() {
                    record_error(e.kind(), "apply_discount");
                }
                warn!(reason = e.kind(), "Discount not applied");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingCycle, DataQuota, DiscountConditions};
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap()
    }

    fn plan(price: i64) -> Plan {
        Plan {
            plan_id: Uuid::new_v4(),
            name: "Home 100".to_string(),
            plan_type: "fiber".to_string(),
            monthly_price: Decimal::from(price),
            currency: "INR".to_string(),
            quota: DataQuota::Limited(Decimal::from(100)),
            billing_cycle: BillingCycle::Monthly,
            is_active: true,
            valid_from: None,
            valid_until: None,
            created_utc: now(),
            updated_utc: now(),
        }
    }

    fn discount(kind: DiscountKind, value: Decimal) -> Discount {
        NewDiscount {
            code: "save20".to_string(),
            description: None,
            kind,
            value,
            conditions: DiscountConditions::default(),
            valid_from: now() - Duration::days(1),
            valid_until: now() + Duration::days(30),
            max_uses: None,
        }
        .into_discount(now())
    }

    fn customer() -> CustomerProfile {
        CustomerProfile {
            user_id: Uuid::new_v4(),
            is_new_customer: true,
            was_referred: false,
        }
    }

    #[test]
    fn percentage_of_base_price() {
        let d = discount(DiscountKind::Percentage, Decimal::from(20));
        assert_eq!(compute_amount(&d, Decimal::from(500)).unwrap(), Decimal::from(100));
    }

    #[test]
    fn fixed_amount_is_capped_at_base_price() {
        let d = discount(DiscountKind::FixedAmount, Decimal::from(1000));
        assert_eq!(compute_amount(&d, Decimal::from(799)).unwrap(), Decimal::from(799));
    }

    #[test]
    fn free_months_is_a_one_time_credit() {
        let d = discount(DiscountKind::FreeMonths, Decimal::from(2));
        assert_eq!(compute_amount(&d, Decimal::from(499)).unwrap(), Decimal::from(998));
    }

    #[test]
    fn free_months_overflow_is_an_error() {
        let d = discount(DiscountKind::FreeMonths, Decimal::MAX);
        assert!(matches!(
            compute_amount(&d, Decimal::from(799)),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn unknown_kind_grants_nothing() {
        let d = discount(DiscountKind::Unknown, Decimal::from(50));
        assert_eq!(compute_amount(&d, Decimal::from(500)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn validity_requires_flag_window_and_cap() {
        let mut d = discount(DiscountKind::Percentage, Decimal::from(10));
        assert!(is_currently_valid(&d, now()));
        assert!(!is_currently_valid(&d, now() + Duration::days(31)));
        assert!(!is_currently_valid(&d, now() - Duration::days(2)));

        d.max_uses = Some(1);
        d.total_uses = 1;
        assert!(!is_currently_valid(&d, now()));

        d.max_uses = None;
        d.is_active = false;
        assert!(!is_currently_valid(&d, now()));
    }

    #[test]
    fn eligibility_checks_run_in_fixed_order() {
        let p = plan(500);
        let mut d = discount(DiscountKind::Percentage, Decimal::from(10));
        d.conditions.applicable_plan_ids = vec![Uuid::new_v4()];
        d.is_active = false;

        // Invalid, capped and wrong plan at once: validity wins.
        assert!(matches!(
            check_eligibility(&d, &p, 5, &customer(), now()),
            Err(EngineError::NotValid)
        ));

        d.is_active = true;
        assert!(matches!(
            check_eligibility(&d, &p, 5, &customer(), now()),
            Err(EngineError::UserLimitReached)
        ));

        assert!(matches!(
            check_eligibility(&d, &p, 0, &customer(), now()),
            Err(EngineError::PlanNotEligible)
        ));

        d.conditions.applicable_plan_ids.push(p.plan_id);
        assert!(check_eligibility(&d, &p, 0, &customer(), now()).is_ok());
    }

    #[test]
    fn extended_conditions_are_enforced() {
        let p = plan(300);
        let mut d = discount(DiscountKind::Percentage, Decimal::from(10));

        d.conditions.applicable_plan_types = vec!["FIBER".to_string()];
        assert!(check_eligibility(&d, &p, 0, &customer(), now()).is_ok());

        d.conditions.min_plan_price = Some(Decimal::from(400));
        assert!(matches!(
            check_eligibility(&d, &p, 0, &customer(), now()),
            Err(EngineError::PlanNotEligible)
        ));

        d.conditions.min_plan_price = None;
        d.conditions.new_customers_only = true;
        let returning = CustomerProfile {
            is_new_customer: false,
            ..customer()
        };
        assert!(matches!(
            check_eligibility(&d, &p, 0, &returning, now()),
            Err(EngineError::CustomerNotEligible)
        ));

        d.conditions.new_customers_only = false;
        d.conditions.requires_referral = true;
        assert!(matches!(
            check_eligibility(&d, &p, 0, &customer(), now()),
            Err(EngineError::CustomerNotEligible)
        ));
    }

    #[test]
    fn claim_appends_ledger_entry_and_counts() {
        let p = plan(500);
        let mut d = discount(DiscountKind::Percentage, Decimal::from(20));
        let c = customer();
        let claim = DiscountClaim {
            discount_id: d.discount_id,
            user_id: c.user_id,
            subscription_id: Uuid::new_v4(),
            plan: p,
            customer: c,
            base_price: Decimal::from(500),
        };

        let usage = claim_discount(&mut d, &claim, now()).unwrap();
        assert_eq!(usage.amount, Decimal::from(100));
        assert_eq!(d.total_uses, 1);
        assert_eq!(d.usages.len(), 1);

        // Default cap is one use per user.
        assert!(matches!(
            claim_discount(&mut d, &claim, now()),
            Err(EngineError::UserLimitReached)
        ));
        assert_eq!(d.total_uses, 1);
    }

    fn any_kind() -> impl Strategy<Value = DiscountKind> {
        prop_oneof![
            Just(DiscountKind::Percentage),
            Just(DiscountKind::FixedAmount),
            Just(DiscountKind::FreeMonths),
            Just(DiscountKind::Unknown),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn amount_is_never_negative(
            kind in any_kind(),
            value_cents in -100_000i64..1_000_000,
            base_cents in -100_000i64..10_000_000,
        ) {
            let d = discount(kind, Decimal::new(value_cents, 2));
            let amount = compute_amount(&d, Decimal::new(base_cents, 2)).unwrap();
            prop_assert!(amount >= Decimal::ZERO);
        }

        #[test]
        fn fixed_amount_never_exceeds_base(
            value_cents in 0i64..10_000_000,
            base_cents in 0i64..10_000_000,
        ) {
            let d = discount(DiscountKind::FixedAmount, Decimal::new(value_cents, 2));
            let base = Decimal::new(base_cents, 2);
            prop_assert!(compute_amount(&d, base).unwrap() <= base);
        }
    }
}
