//! In-process storage backend.
//!
//! State is sharded with `DashMap`; every atomic unit holds only the entries
//! it mutates. When a unit needs several maps it always takes them in the
//! order accounts, discounts, periods, owners, and it never awaits while a
//! guard is held.

use super::discounts::claim_discount;
use super::metrics::STORE_OPERATION_DURATION;
use super::store::{
    CommittedSubscription, CustomerProfile, DiscountClaim, DiscountStore, EntitlementStore,
    PlanCatalog, SubscriptionCommit, SubscriptionStore, UsageStore, UserDirectory,
};
use crate::error::EngineError;
use crate::models::{
    Discount, DiscountUsage, NewPlan, Plan, Subscription, SubscriptionStatus,
    UpdateDiscountTerms, UsagePeriod,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

const BACKEND: &str = "memory";

/// A user's subscriptions plus the facts discount conditions look at.
#[derive(Debug, Default)]
struct CustomerAccount {
    subscriptions: HashMap<Uuid, Subscription>,
    was_referred: bool,
}

impl CustomerAccount {
    fn live_on_plan(&self, plan_id: Uuid, except: Option<Uuid>) -> Option<&Subscription> {
        self.subscriptions.values().find(|s| {
            s.plan_id == plan_id && occupies_plan(s.status) && Some(s.subscription_id) != except
        })
    }
}

#[derive(Debug)]
struct PeriodLog {
    current: UsagePeriod,
    closed: Vec<UsagePeriod>,
}

/// Trial and active subscriptions both hold the (user, plan) slot.
fn occupies_plan(status: SubscriptionStatus) -> bool {
    matches!(status, SubscriptionStatus::Active | SubscriptionStatus::Trial)
}

#[derive(Default)]
pub struct InMemoryStore {
    plans: DashMap<Uuid, Plan>,
    discounts: DashMap<Uuid, Discount>,
    discount_codes: DashMap<String, Uuid>,
    accounts: DashMap<Uuid, CustomerAccount>,
    periods: DashMap<Uuid, PeriodLog>,
    owners: DashMap<Uuid, Uuid>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_plan(&self, plan: Plan) {
        self.plans.insert(plan.plan_id, plan);
    }

    pub fn create_plan(&self, input: NewPlan, now: DateTime<Utc>) -> Result<Plan, EngineError> {
        input.validate()?;
        let plan = input.into_plan(now);
        self.insert_plan(plan.clone());
        Ok(plan)
    }

    /// Record whether a user arrived through a referral.
    pub fn register_customer(&self, user_id: Uuid, was_referred: bool) {
        self.accounts.entry(user_id).or_default().was_referred = was_referred;
    }

    fn owner_of(&self, subscription_id: Uuid) -> Result<Uuid, EngineError> {
        self.owners
            .get(&subscription_id)
            .map(|owner| *owner)
            .ok_or(EngineError::SubscriptionNotFound(subscription_id))
    }
}

#[async_trait]
impl PlanCatalog for InMemoryStore {
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, EngineError> {
        Ok(self.plans.get(&plan_id).map(|p| p.clone()))
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, EngineError> {
        let mut plans: Vec<Plan> = self.plans.iter().map(|p| p.clone()).collect();
        plans.sort_by(|a, b| a.monthly_price.cmp(&b.monthly_price));
        Ok(plans)
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn prior_discount_use_count(
        &self,
        discount_id: Uuid,
        user_id: Uuid,
    ) -> Result<u32, EngineError> {
        Ok(self
            .discounts
            .get(&discount_id)
            .map(|d| d.uses_by(user_id))
            .unwrap_or(0))
    }

    async fn customer_profile(&self, user_id: Uuid) -> Result<CustomerProfile, EngineError> {
        let profile = match self.accounts.get(&user_id) {
            Some(account) => CustomerProfile {
                user_id,
                is_new_customer: account.subscriptions.is_empty(),
                was_referred: account.was_referred,
            },
            None => CustomerProfile {
                user_id,
                is_new_customer: true,
                was_referred: false,
            },
        };
        Ok(profile)
    }
}

#[async_trait]
impl DiscountStore for InMemoryStore {
    #[instrument(skip(self, discount), fields(code = %discount.code))]
    async fn insert_discount(&self, discount: &Discount) -> Result<(), EngineError> {
        match self.discount_codes.entry(discount.code.clone()) {
            Entry::Occupied(_) => Err(EngineError::DuplicateDiscountCode(discount.code.clone())),
            Entry::Vacant(slot) => {
                self.discounts.insert(discount.discount_id, discount.clone());
                slot.insert(discount.discount_id);
                Ok(())
            }
        }
    }

    async fn get_discount(&self, discount_id: Uuid) -> Result<Option<Discount>, EngineError> {
        Ok(self.discounts.get(&discount_id).map(|d| d.clone()))
    }

    async fn find_discount_by_code(&self, code: &str) -> Result<Option<Discount>, EngineError> {
        let discount_id = match self.discount_codes.get(code) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get_discount(discount_id).await
    }

    async fn update_discount_terms(
        &self,
        discount_id: Uuid,
        terms: UpdateDiscountTerms,
        now: DateTime<Utc>,
    ) -> Result<Discount, EngineError> {
        let mut discount = self
            .discounts
            .get_mut(&discount_id)
            .ok_or_else(|| EngineError::DiscountNotFound(discount_id.to_string()))?;
        if discount.total_uses > 0 {
            return Err(EngineError::DiscountInUse);
        }
        terms.apply_to(&mut discount, now);
        Ok(discount.clone())
    }

    async fn deactivate_discount(
        &self,
        discount_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Discount, EngineError> {
        let mut discount = self
            .discounts
            .get_mut(&discount_id)
            .ok_or_else(|| EngineError::DiscountNotFound(discount_id.to_string()))?;
        discount.is_active = false;
        discount.updated_utc = now;
        Ok(discount.clone())
    }

    #[instrument(skip(self, claim), fields(discount_id = %claim.discount_id, user_id = %claim.user_id))]
    async fn apply_discount(
        &self,
        claim: &DiscountClaim,
        now: DateTime<Utc>,
    ) -> Result<DiscountUsage, EngineError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "apply_discount"])
            .start_timer();

        // The shard write guard serializes every claim on this discount.
        let result = match self.discounts.get_mut(&claim.discount_id) {
            Some(mut discount) => claim_discount(&mut discount, claim, now),
            None => Err(EngineError::DiscountNotFound(claim.discount_id.to_string())),
        };

        timer.observe_duration();
        result
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, EngineError> {
        let Some(user_id) = self.owners.get(&subscription_id).map(|o| *o) else {
            return Ok(None);
        };
        Ok(self
            .accounts
            .get(&user_id)
            .and_then(|account| account.subscriptions.get(&subscription_id).cloned()))
    }

    async fn find_active_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<Subscription>, EngineError> {
        Ok(self
            .accounts
            .get(&user_id)
            .and_then(|account| account.live_on_plan(plan_id, None).cloned()))
    }

    async fn list_user_subscriptions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Subscription>, EngineError> {
        let mut subscriptions: Vec<Subscription> = self
            .accounts
            .get(&user_id)
            .map(|account| account.subscriptions.values().cloned().collect())
            .unwrap_or_default();
        subscriptions.sort_by_key(|s| s.created_utc);
        Ok(subscriptions)
    }

    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, EngineError> {
        let mut due: Vec<Subscription> = self
            .accounts
            .iter()
            .flat_map(|account| {
                account
                    .subscriptions
                    .values()
                    .filter(|s| occupies_plan(s.status) && s.billing.end_utc <= now)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        due.sort_by_key(|s| s.billing.end_utc);
        Ok(due)
    }

    #[instrument(skip(self, commit), fields(subscription_id = %commit.subscription.subscription_id))]
    async fn commit_subscription(
        &self,
        commit: SubscriptionCommit,
        now: DateTime<Utc>,
    ) -> Result<CommittedSubscription, EngineError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "commit_subscription"])
            .start_timer();

        let SubscriptionCommit {
            mut subscription,
            mut period,
            claim,
        } = commit;
        let subscription_id = subscription.subscription_id;
        let user_id = subscription.user_id;

        // Holding the account entry serializes subscribes for this user.
        let mut account = self.accounts.entry(user_id).or_default();
        if account.live_on_plan(subscription.plan_id, None).is_some() {
            return Err(EngineError::DuplicateActiveSubscription {
                user_id,
                plan_id: subscription.plan_id,
            });
        }

        let discount = match claim {
            Some(mut claim) => {
                claim.customer.is_new_customer = account.subscriptions.is_empty();
                claim.customer.was_referred = account.was_referred;

                let mut entry = self
                    .discounts
                    .get_mut(&claim.discount_id)
                    .ok_or_else(|| EngineError::DiscountNotFound(claim.discount_id.to_string()))?;
                let usage = claim_discount(&mut entry, &claim, now)?;
                subscription.attach_discount(&entry, &usage);
                Some((entry.clone(), usage))
            }
            None => None,
        };

        subscription.version = 1;
        period.version = 1;
        account
            .subscriptions
            .insert(subscription_id, subscription.clone());
        self.periods.insert(
            subscription_id,
            PeriodLog {
                current: period.clone(),
                closed: Vec::new(),
            },
        );
        self.owners.insert(subscription_id, user_id);

        timer.observe_duration();
        Ok(CommittedSubscription {
            subscription,
            period,
            discount,
        })
    }

    #[instrument(skip(self, subscription, new_period), fields(subscription_id = %subscription.subscription_id))]
    async fn commit_transition(
        &self,
        subscription: &Subscription,
        new_period: Option<&UsagePeriod>,
    ) -> Result<Subscription, EngineError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "commit_transition"])
            .start_timer();
        let subscription_id = subscription.subscription_id;
        let user_id = self.owner_of(subscription_id)?;

        let mut account = self
            .accounts
            .get_mut(&user_id)
            .ok_or(EngineError::SubscriptionNotFound(subscription_id))?;

        let stored_version = account
            .subscriptions
            .get(&subscription_id)
            .map(|s| s.version)
            .ok_or(EngineError::SubscriptionNotFound(subscription_id))?;
        if stored_version != subscription.version {
            return Err(EngineError::ConcurrentModification {
                entity: "subscription",
                id: subscription_id,
            });
        }
        if occupies_plan(subscription.status)
            && account
                .live_on_plan(subscription.plan_id, Some(subscription_id))
                .is_some()
        {
            return Err(EngineError::DuplicateActiveSubscription {
                user_id,
                plan_id: subscription.plan_id,
            });
        }

        let mut saved = subscription.clone();
        saved.version += 1;

        if let Some(period) = new_period {
            let mut period = period.clone();
            period.version = 1;
            match self.periods.entry(subscription_id) {
                Entry::Occupied(mut log) => {
                    let log = log.get_mut();
                    let previous = std::mem::replace(&mut log.current, period);
                    log.closed.push(previous);
                }
                Entry::Vacant(slot) => {
                    slot.insert(PeriodLog {
                        current: period,
                        closed: Vec::new(),
                    });
                }
            }
        }
        account.subscriptions.insert(subscription_id, saved.clone());

        timer.observe_duration();
        Ok(saved)
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn current_period(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<UsagePeriod>, EngineError> {
        Ok(self
            .periods
            .get(&subscription_id)
            .map(|log| log.current.clone()))
    }

    async fn list_periods(&self, subscription_id: Uuid) -> Result<Vec<UsagePeriod>, EngineError> {
        Ok(self
            .periods
            .get(&subscription_id)
            .map(|log| {
                let mut all = log.closed.clone();
                all.push(log.current.clone());
                all
            })
            .unwrap_or_default())
    }

    #[instrument(skip(self, period), fields(period_id = %period.period_id))]
    async fn save_period(&self, period: &UsagePeriod) -> Result<UsagePeriod, EngineError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "save_period"])
            .start_timer();

        let mut log = self
            .periods
            .get_mut(&period.subscription_id)
            .ok_or(EngineError::UsagePeriodNotFound(period.subscription_id))?;
        if log.current.period_id != period.period_id || log.current.version != period.version {
            return Err(EngineError::ConcurrentModification {
                entity: "usage_period",
                id: period.period_id,
            });
        }

        let mut saved = period.clone();
        saved.version += 1;
        log.current = saved.clone();

        timer.observe_duration();
        Ok(saved)
    }
}

#[async_trait]
impl EntitlementStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
