//! PostgreSQL storage backend.

use super::discounts::claim_discount;
use super::metrics::STORE_OPERATION_DURATION;
use super::store::{
    CommittedSubscription, CustomerProfile, DiscountClaim, DiscountStore, EntitlementStore,
    PlanCatalog, SubscriptionCommit, SubscriptionStore, UsageStore, UserDirectory,
};
use crate::error::EngineError;
use crate::models::{
    AppliedDiscount, BillingCycle, BillingWindow, DailyUsage, DataQuota, Discount,
    DiscountConditions, DiscountKind, DiscountUsage, HistoryEntry, NewPlan, PeakUsage, Plan,
    PricingSnapshot, QuotaSnapshot, Recommendation, Subscription, SubscriptionStatus,
    UpdateDiscountTerms, UsageAlert, UsagePeriod,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

const BACKEND: &str = "postgres";

const PLAN_COLUMNS: &str = "plan_id, name, plan_type, monthly_price, currency, quota_gb, \
     billing_cycle, is_active, valid_from, valid_until, created_utc, updated_utc";

const DISCOUNT_COLUMNS: &str = "discount_id, code, description, kind, value, conditions, \
     valid_from, valid_until, is_active, total_uses, max_uses, created_utc, updated_utc";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, plan_id, status, billing_cycle, \
     start_utc, end_utc, next_billing_utc, auto_renew, base_price, discount_amount, final_price, \
     currency, applied_discounts, history, version, created_utc, updated_utc";

const PERIOD_COLUMNS: &str = "period_id, subscription_id, plan_id, billing_cycle, period_start, \
     period_end, daily_usage, total_used_gb, average_daily_gb, peak, quota, alerts, \
     recommendations, version, created_utc, updated_utc";

#[derive(sqlx::FromRow)]
struct PlanRow {
    plan_id: Uuid,
    name: String,
    plan_type: String,
    monthly_price: Decimal,
    currency: String,
    quota_gb: Option<Decimal>,
    billing_cycle: String,
    is_active: bool,
    valid_from: Option<DateTime<Utc>>,
    valid_until: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            plan_id: row.plan_id,
            name: row.name,
            plan_type: row.plan_type,
            monthly_price: row.monthly_price,
            currency: row.currency,
            quota: row.quota_gb.map_or(DataQuota::Unlimited, DataQuota::Limited),
            billing_cycle: BillingCycle::from_string(&row.billing_cycle),
            is_active: row.is_active,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DiscountRow {
    discount_id: Uuid,
    code: String,
    description: Option<String>,
    kind: String,
    value: Decimal,
    conditions: Json<DiscountConditions>,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    is_active: bool,
    total_uses: i32,
    max_uses: Option<i32>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl DiscountRow {
    fn into_discount(self, usages: Vec<DiscountUsage>) -> Discount {
        Discount {
            discount_id: self.discount_id,
            code: self.code,
            description: self.description,
            kind: DiscountKind::from_string(&self.kind),
            value: self.value,
            conditions: self.conditions.0,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            is_active: self.is_active,
            total_uses: u32::try_from(self.total_uses).unwrap_or(0),
            max_uses: self.max_uses.and_then(|m| u32::try_from(m).ok()),
            usages,
            created_utc: self.created_utc,
            updated_utc: self.updated_utc,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DiscountUsageRow {
    user_id: Uuid,
    subscription_id: Uuid,
    amount: Decimal,
    applied_utc: DateTime<Utc>,
}

impl From<DiscountUsageRow> for DiscountUsage {
    fn from(row: DiscountUsageRow) -> Self {
        DiscountUsage {
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            amount: row.amount,
            applied_utc: row.applied_utc,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    status: String,
    billing_cycle: String,
    start_utc: DateTime<Utc>,
    end_utc: DateTime<Utc>,
    next_billing_utc: DateTime<Utc>,
    auto_renew: bool,
    base_price: Decimal,
    discount_amount: Decimal,
    final_price: Decimal,
    currency: String,
    applied_discounts: Json<Vec<AppliedDiscount>>,
    history: Json<Vec<HistoryEntry>>,
    version: i64,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            subscription_id: row.subscription_id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status: SubscriptionStatus::from_string(&row.status),
            billing: BillingWindow {
                cycle: BillingCycle::from_string(&row.billing_cycle),
                start_utc: row.start_utc,
                end_utc: row.end_utc,
                next_billing_utc: row.next_billing_utc,
                auto_renew: row.auto_renew,
            },
            pricing: PricingSnapshot {
                base_price: row.base_price,
                discount_amount: row.discount_amount,
                final_price: row.final_price,
                currency: row.currency,
            },
            applied_discounts: row.applied_discounts.0,
            history: row.history.0,
            version: row.version,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UsagePeriodRow {
    period_id: Uuid,
    subscription_id: Uuid,
    plan_id: Uuid,
    billing_cycle: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    daily_usage: Json<Vec<DailyUsage>>,
    total_used_gb: Decimal,
    average_daily_gb: Decimal,
    peak: Option<Json<PeakUsage>>,
    quota: Json<QuotaSnapshot>,
    alerts: Json<Vec<UsageAlert>>,
    recommendations: Json<Vec<Recommendation>>,
    version: i64,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<UsagePeriodRow> for UsagePeriod {
    fn from(row: UsagePeriodRow) -> Self {
        UsagePeriod {
            period_id: row.period_id,
            subscription_id: row.subscription_id,
            plan_id: row.plan_id,
            cycle: BillingCycle::from_string(&row.billing_cycle),
            period_start: row.period_start,
            period_end: row.period_end,
            daily_usage: row.daily_usage.0,
            total_used_gb: row.total_used_gb,
            average_daily_gb: row.average_daily_gb,
            peak: row.peak.map(|p| p.0),
            quota: row.quota.0,
            alerts: row.alerts.0,
            recommendations: row.recommendations.0,
            version: row.version,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "entitlement-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, EngineError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| EngineError::storage("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), EngineError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::storage("Migration failed", e))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Register a catalog plan.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_plan(&self, input: NewPlan, now: DateTime<Utc>) -> Result<Plan, EngineError> {
        input.validate()?;
        let plan = input.into_plan(now);
        let quota_gb = match plan.quota {
            DataQuota::Limited(gb) => Some(gb),
            DataQuota::Unlimited => None,
        };

        sqlx::query(
            r#"
            INSERT INTO plans (plan_id, name, plan_type, monthly_price, currency, quota_gb, billing_cycle, is_active, valid_from, valid_until, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(plan.plan_id)
        .bind(&plan.name)
        .bind(&plan.plan_type)
        .bind(plan.monthly_price)
        .bind(&plan.currency)
        .bind(quota_gb)
        .bind(plan.billing_cycle.as_str())
        .bind(plan.is_active)
        .bind(plan.valid_from)
        .bind(plan.valid_until)
        .bind(plan.created_utc)
        .bind(plan.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::storage("Failed to create plan", e))?;

        info!(plan_id = %plan.plan_id, "Plan created");
        Ok(plan)
    }

    /// Record whether a user arrived through a referral.
    pub async fn register_customer(&self, user_id: Uuid, was_referred: bool) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO customer_profiles (user_id, was_referred)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET was_referred = EXCLUDED.was_referred
            "#,
        )
        .bind(user_id)
        .bind(was_referred)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::storage("Failed to register customer", e))?;
        Ok(())
    }

    async fn load_usages<'e, E>(executor: E, discount_id: Uuid) -> Result<Vec<DiscountUsage>, EngineError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let rows = sqlx::query_as::<_, DiscountUsageRow>(
            r#"
            SELECT user_id, subscription_id, amount, applied_utc
            FROM discount_usages
            WHERE discount_id = $1
            ORDER BY usage_seq
            "#,
        )
        .bind(discount_id)
        .fetch_all(executor)
        .await
        .map_err(|e| EngineError::storage("Failed to load discount usages", e))?;
        Ok(rows.into_iter().map(DiscountUsage::from).collect())
    }

    /// Lock the discount row for the rest of the transaction.
    async fn lock_discount(
        tx: &mut Transaction<'_, Postgres>,
        discount_id: Uuid,
    ) -> Result<Discount, EngineError> {
        let row = sqlx::query_as::<_, DiscountRow>(&format!(
            "SELECT {} FROM discounts WHERE discount_id = $1 FOR UPDATE",
            DISCOUNT_COLUMNS
        ))
        .bind(discount_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| EngineError::storage("Failed to lock discount", e))?
        .ok_or_else(|| EngineError::DiscountNotFound(discount_id.to_string()))?;

        let usages = Self::load_usages(&mut **tx, discount_id).await?;
        Ok(row.into_discount(usages))
    }

    /// Claim inside `tx`: the row lock serializes concurrent claims on the
    /// same discount.
    async fn claim_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        claim: &DiscountClaim,
        now: DateTime<Utc>,
    ) -> Result<(Discount, DiscountUsage), EngineError> {
        let mut discount = Self::lock_discount(tx, claim.discount_id).await?;
        let usage = claim_discount(&mut discount, claim, now)?;

        sqlx::query(
            r#"
            INSERT INTO discount_usages (discount_id, user_id, subscription_id, amount, applied_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(discount.discount_id)
        .bind(usage.user_id)
        .bind(usage.subscription_id)
        .bind(usage.amount)
        .bind(usage.applied_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| EngineError::storage("Failed to record discount usage", e))?;

        sqlx::query("UPDATE discounts SET total_uses = $2, updated_utc = $3 WHERE discount_id = $1")
            .bind(discount.discount_id)
            .bind(i32::try_from(discount.total_uses).unwrap_or(i32::MAX))
            .bind(discount.updated_utc)
            .execute(&mut **tx)
            .await
            .map_err(|e| EngineError::storage("Failed to update discount counter", e))?;

        Ok((discount, usage))
    }

    async fn profile_in<'e, E>(executor: E, user_id: Uuid) -> Result<CustomerProfile, EngineError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let (subscription_count, was_referred): (i64, Option<bool>) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM subscriptions WHERE user_id = $1),
                (SELECT was_referred FROM customer_profiles WHERE user_id = $1)
            "#,
        )
        .bind(user_id)
        .fetch_one(executor)
        .await
        .map_err(|e| EngineError::storage("Failed to load customer profile", e))?;

        Ok(CustomerProfile {
            user_id,
            is_new_customer: subscription_count == 0,
            was_referred: was_referred.unwrap_or(false),
        })
    }

    async fn insert_period(
        tx: &mut Transaction<'_, Postgres>,
        period: &UsagePeriod,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO usage_periods (period_id, subscription_id, plan_id, billing_cycle, period_start, period_end, daily_usage, total_used_gb, average_daily_gb, peak, quota, alerts, recommendations, is_current, version, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, TRUE, 1, $14, $15)
            "#,
        )
        .bind(period.period_id)
        .bind(period.subscription_id)
        .bind(period.plan_id)
        .bind(period.cycle.as_str())
        .bind(period.period_start)
        .bind(period.period_end)
        .bind(Json(&period.daily_usage))
        .bind(period.total_used_gb)
        .bind(period.average_daily_gb)
        .bind(period.peak.as_ref().map(Json))
        .bind(Json(&period.quota))
        .bind(Json(&period.alerts))
        .bind(Json(&period.recommendations))
        .bind(period.created_utc)
        .bind(period.updated_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| EngineError::storage("Failed to create usage period", e))?;
        Ok(())
    }

    async fn fetch_subscriptions(
        &self,
        filter: &str,
        bind: SubscriptionFilter,
    ) -> Result<Vec<Subscription>, EngineError> {
        let sql = format!("SELECT {} FROM subscriptions WHERE {}", SUBSCRIPTION_COLUMNS, filter);
        let query = sqlx::query_as::<_, SubscriptionRow>(&sql);
        let query = match bind {
            SubscriptionFilter::User(user_id) => query.bind(user_id),
            SubscriptionFilter::UserPlan(user_id, plan_id) => query.bind(user_id).bind(plan_id),
            SubscriptionFilter::DueBy(now) => query.bind(now),
        };
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::storage("Failed to list subscriptions", e))?;
        Ok(rows.into_iter().map(Subscription::from).collect())
    }
}

enum SubscriptionFilter {
    User(Uuid),
    UserPlan(Uuid, Uuid),
    DueBy(DateTime<Utc>),
}

#[async_trait]
impl PlanCatalog for Database {
    #[instrument(skip(self))]
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, EngineError> {
        let row = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {} FROM plans WHERE plan_id = $1",
            PLAN_COLUMNS
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::storage("Failed to get plan", e))?;
        Ok(row.map(Plan::from))
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, EngineError> {
        let rows = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {} FROM plans ORDER BY monthly_price",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::storage("Failed to list plans", e))?;
        Ok(rows.into_iter().map(Plan::from).collect())
    }
}

#[async_trait]
impl UserDirectory for Database {
    async fn prior_discount_use_count(
        &self,
        discount_id: Uuid,
        user_id: Uuid,
    ) -> Result<u32, EngineError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM discount_usages WHERE discount_id = $1 AND user_id = $2",
        )
        .bind(discount_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EngineError::storage("Failed to count discount usages", e))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn customer_profile(&self, user_id: Uuid) -> Result<CustomerProfile, EngineError> {
        Self::profile_in(&self.pool, user_id).await
    }
}

#[async_trait]
impl DiscountStore for Database {
    #[instrument(skip(self, discount), fields(code = %discount.code))]
    async fn insert_discount(&self, discount: &Discount) -> Result<(), EngineError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "insert_discount"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO discounts (discount_id, code, description, kind, value, conditions, valid_from, valid_until, is_active, total_uses, max_uses, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, $11, $12)
            "#,
        )
        .bind(discount.discount_id)
        .bind(&discount.code)
        .bind(&discount.description)
        .bind(discount.kind.as_str())
        .bind(discount.value)
        .bind(Json(&discount.conditions))
        .bind(discount.valid_from)
        .bind(discount.valid_until)
        .bind(discount.is_active)
        .bind(discount.max_uses.map(|m| i32::try_from(m).unwrap_or(i32::MAX)))
        .bind(discount.created_utc)
        .bind(discount.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EngineError::DuplicateDiscountCode(discount.code.clone())
            } else {
                EngineError::storage("Failed to create discount", e)
            }
        })?;

        timer.observe_duration();
        Ok(())
    }

    async fn get_discount(&self, discount_id: Uuid) -> Result<Option<Discount>, EngineError> {
        let row = sqlx::query_as::<_, DiscountRow>(&format!(
            "SELECT {} FROM discounts WHERE discount_id = $1",
            DISCOUNT_COLUMNS
        ))
        .bind(discount_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::storage("Failed to get discount", e))?;

        match row {
            Some(row) => {
                let usages = Self::load_usages(&self.pool, discount_id).await?;
                Ok(Some(row.into_discount(usages)))
            }
            None => Ok(None),
        }
    }

    async fn find_discount_by_code(&self, code: &str) -> Result<Option<Discount>, EngineError> {
        let discount_id: Option<Uuid> =
            sqlx::query_scalar("SELECT discount_id FROM discounts WHERE code = $1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| EngineError::storage("Failed to find discount", e))?;

        match discount_id {
            Some(id) => self.get_discount(id).await,
            None => Ok(None),
        }
    }

    #[instrument(skip(self, terms))]
    async fn update_discount_terms(
        &self,
        discount_id: Uuid,
        terms: UpdateDiscountTerms,
        now: DateTime<Utc>,
    ) -> Result<Discount, EngineError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::storage("Failed to begin transaction", e))?;

        let mut discount = Self::lock_discount(&mut tx, discount_id).await?;
        if discount.total_uses > 0 {
            return Err(EngineError::DiscountInUse);
        }
        terms.apply_to(&mut discount, now);

        sqlx::query(
            r#"
            UPDATE discounts
            SET description = $2, value = $3, conditions = $4, valid_from = $5, valid_until = $6, max_uses = $7, updated_utc = $8
            WHERE discount_id = $1
            "#,
        )
        .bind(discount_id)
        .bind(&discount.description)
        .bind(discount.value)
        .bind(Json(&discount.conditions))
        .bind(discount.valid_from)
        .bind(discount.valid_until)
        .bind(discount.max_uses.map(|m| i32::try_from(m).unwrap_or(i32::MAX)))
        .bind(discount.updated_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| EngineError::storage("Failed to update discount", e))?;

        tx.commit()
            .await
            .map_err(|e| EngineError::storage("Failed to commit transaction", e))?;
        Ok(discount)
    }

    #[instrument(skip(self))]
    async fn deactivate_discount(
        &self,
        discount_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Discount, EngineError> {
        let updated = sqlx::query(
            "UPDATE discounts SET is_active = FALSE, updated_utc = $2 WHERE discount_id = $1",
        )
        .bind(discount_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::storage("Failed to deactivate discount", e))?;

        if updated.rows_affected() == 0 {
            return Err(EngineError::DiscountNotFound(discount_id.to_string()));
        }
        self.get_discount(discount_id)
            .await?
            .ok_or_else(|| EngineError::DiscountNotFound(discount_id.to_string()))
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::storage("Failed to begin transaction", e))?;
        let (_, usage) = Self::claim_in_tx(&mut tx, claim, now).await?;
        tx.commit()
            .await
            .map_err(|e| EngineError::storage("Failed to commit transaction", e))?;

        timer.observe_duration();
        Ok(usage)
    }
}

#[async_trait]
impl SubscriptionStore for Database {
    #[instrument(skip(self))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, EngineError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::storage("Failed to get subscription", e))?;
        Ok(row.map(Subscription::from))
    }

    async fn find_active_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<Subscription>, EngineError> {
        let mut found = self
            .fetch_subscriptions(
                "user_id = $1 AND plan_id = $2 AND status IN ('active', 'trial')",
                SubscriptionFilter::UserPlan(user_id, plan_id),
            )
            .await?;
        Ok(found.pop())
    }

    async fn list_user_subscriptions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Subscription>, EngineError> {
        self.fetch_subscriptions(
            "user_id = $1 ORDER BY created_utc",
            SubscriptionFilter::User(user_id),
        )
        .await
    }

    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, EngineError> {
        self.fetch_subscriptions(
            "status IN ('active', 'trial') AND end_utc <= $1 ORDER BY end_utc",
            SubscriptionFilter::DueBy(now),
        )
        .await
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::storage("Failed to begin transaction", e))?;

        let discount = match claim {
            Some(mut claim) => {
                claim.customer = Self::profile_in(&mut *tx, claim.user_id).await?;
                let (discount, usage) = Self::claim_in_tx(&mut tx, &claim, now).await?;
                subscription.attach_discount(&discount, &usage);
                Some((discount, usage))
            }
            None => None,
        };

        subscription.version = 1;
        period.version = 1;

        sqlx::query(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, plan_id, status, billing_cycle, start_utc, end_utc, next_billing_utc, auto_renew, base_price, discount_amount, final_price, currency, applied_discounts, history, version, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, 1, $16, $17)
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(subscription.user_id)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.billing.cycle.as_str())
        .bind(subscription.billing.start_utc)
        .bind(subscription.billing.end_utc)
        .bind(subscription.billing.next_billing_utc)
        .bind(subscription.billing.auto_renew)
        .bind(subscription.pricing.base_price)
        .bind(subscription.pricing.discount_amount)
        .bind(subscription.pricing.final_price)
        .bind(&subscription.pricing.currency)
        .bind(Json(&subscription.applied_discounts))
        .bind(Json(&subscription.history))
        .bind(subscription.created_utc)
        .bind(subscription.updated_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EngineError::DuplicateActiveSubscription {
                    user_id: subscription.user_id,
                    plan_id: subscription.plan_id,
                }
            } else {
                EngineError::storage("Failed to create subscription", e)
            }
        })?;

        Self::insert_period(&mut tx, &period).await?;

        tx.commit()
            .await
            .map_err(|e| EngineError::storage("Failed to commit transaction", e))?;

        timer.observe_duration();
        info!(subscription_id = %subscription.subscription_id, "Subscription stored");

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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::storage("Failed to begin transaction", e))?;

        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE subscriptions
            SET plan_id = $3, status = $4, billing_cycle = $5, start_utc = $6, end_utc = $7, next_billing_utc = $8, auto_renew = $9,
                base_price = $10, discount_amount = $11, final_price = $12, currency = $13,
                applied_discounts = $14, history = $15, version = version + 1, updated_utc = $16
            WHERE subscription_id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(subscription.version)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.billing.cycle.as_str())
        .bind(subscription.billing.start_utc)
        .bind(subscription.billing.end_utc)
        .bind(subscription.billing.next_billing_utc)
        .bind(subscription.billing.auto_renew)
        .bind(subscription.pricing.base_price)
        .bind(subscription.pricing.discount_amount)
        .bind(subscription.pricing.final_price)
        .bind(&subscription.pricing.currency)
        .bind(Json(&subscription.applied_discounts))
        .bind(Json(&subscription.history))
        .bind(subscription.updated_utc)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EngineError::DuplicateActiveSubscription {
                    user_id: subscription.user_id,
                    plan_id: subscription.plan_id,
                }
            } else {
                EngineError::storage("Failed to update subscription", e)
            }
        })?;

        let Some(version) = version else {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT version FROM subscriptions WHERE subscription_id = $1")
                    .bind(subscription.subscription_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| EngineError::storage("Failed to get subscription", e))?;
            return Err(match exists {
                Some(_) => EngineError::ConcurrentModification {
                    entity: "subscription",
                    id: subscription.subscription_id,
                },
                None => EngineError::SubscriptionNotFound(subscription.subscription_id),
            });
        };

        if let Some(period) = new_period {
            sqlx::query(
                "UPDATE usage_periods SET is_current = FALSE, updated_utc = $2 WHERE subscription_id = $1 AND is_current",
            )
            .bind(subscription.subscription_id)
            .bind(subscription.updated_utc)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::storage("Failed to close usage period", e))?;

            Self::insert_period(&mut tx, period).await?;
        }

        tx.commit()
            .await
            .map_err(|e| EngineError::storage("Failed to commit transaction", e))?;

        timer.observe_duration();

        let mut saved = subscription.clone();
        saved.version = version;
        Ok(saved)
    }
}

#[async_trait]
impl UsageStore for Database {
    async fn current_period(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<UsagePeriod>, EngineError> {
        let row = sqlx::query_as::<_, UsagePeriodRow>(&format!(
            "SELECT {} FROM usage_periods WHERE subscription_id = $1 AND is_current",
            PERIOD_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::storage("Failed to get usage period", e))?;
        Ok(row.map(UsagePeriod::from))
    }

    async fn list_periods(&self, subscription_id: Uuid) -> Result<Vec<UsagePeriod>, EngineError> {
        let rows = sqlx::query_as::<_, UsagePeriodRow>(&format!(
            "SELECT {} FROM usage_periods WHERE subscription_id = $1 ORDER BY is_current, created_utc",
            PERIOD_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::storage("Failed to list usage periods", e))?;
        Ok(rows.into_iter().map(UsagePeriod::from).collect())
    }

    #[instrument(skip(self, period), fields(period_id = %period.period_id))]
    async fn save_period(&self, period: &UsagePeriod) -> Result<UsagePeriod, EngineError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "save_period"])
            .start_timer();

        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE usage_periods
            SET daily_usage = $3, total_used_gb = $4, average_daily_gb = $5, peak = $6, quota = $7,
                alerts = $8, recommendations = $9, version = version + 1, updated_utc = $10
            WHERE period_id = $1 AND version = $2 AND is_current
            RETURNING version
            "#,
        )
        .bind(period.period_id)
        .bind(period.version)
        .bind(Json(&period.daily_usage))
        .bind(period.total_used_gb)
        .bind(period.average_daily_gb)
        .bind(period.peak.as_ref().map(Json))
        .bind(Json(&period.quota))
        .bind(Json(&period.alerts))
        .bind(Json(&period.recommendations))
        .bind(period.updated_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::storage("Failed to save usage period", e))?;

        timer.observe_duration();
        match version {
            Some(version) => {
                let mut saved = period.clone();
                saved.version = version;
                Ok(saved)
            }
            None => Err(EngineError::ConcurrentModification {
                entity: "usage_period",
                id: period.period_id,
            }),
        }
    }
}

#[async_trait]
impl EntitlementStore for Database {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), EngineError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::storage("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }
}
