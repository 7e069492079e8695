//! PostgreSQL backend integration tests for entitlement-service.
//!
//! Run with a database at `TEST_DATABASE_URL`:
//! `cargo test --test postgres_test -- --ignored`

mod common;

use chrono::Duration;
use common::{date_after, days_after, discount_input, plan_input, t0, TestDb};
use entitlement_service::models::{
    AlertKind, DataQuota, DiscountKind, DiscountOutcome, HistoryAction, Plan,
    SubscriptionStatus, UpdateDiscountTerms,
};
use entitlement_service::services::{EngineSettings, SubscribeRequest};
use entitlement_service::{EngineError, EntitlementEngine};
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

async fn engine_with_plans(test_db: &TestDb) -> (EntitlementEngine, Plan, Plan) {
    let basic = test_db
        .db
        .create_plan(
            plan_input("Basic 100", 500, DataQuota::Limited(dec!(100))),
            t0() - Duration::days(60),
        )
        .await
        .expect("Failed to create plan");
    let premium = test_db
        .db
        .create_plan(
            plan_input("Premium 200", 799, DataQuota::Limited(dec!(200))),
            t0() - Duration::days(60),
        )
        .await
        .expect("Failed to create plan");

    let engine = EntitlementEngine::new(Arc::new(test_db.db.clone()), EngineSettings::default());
    (engine, basic, premium)
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn lifecycle_round_trips_through_postgres() {
    let test_db = TestDb::spawn().await;
    let (engine, basic, premium) = engine_with_plans(&test_db).await;
    engine
        .discounts
        .create_discount(
            discount_input("SAVE20", DiscountKind::Percentage, dec!(20)),
            t0() - Duration::days(1),
        )
        .await
        .unwrap();
    let user = Uuid::new_v4();

    let receipt = engine
        .lifecycle
        .subscribe(
            SubscribeRequest::new(user, basic.plan_id).with_discount_code("save20"),
            t0(),
        )
        .await
        .unwrap();
    assert!(matches!(receipt.discount, DiscountOutcome::Applied { .. }));
    assert_eq!(receipt.subscription.pricing.final_price, dec!(400));
    let id = receipt.subscription.subscription_id;

    let duplicate = engine
        .lifecycle
        .subscribe(SubscribeRequest::new(user, basic.plan_id), t0())
        .await;
    assert!(matches!(
        duplicate,
        Err(EngineError::DuplicateActiveSubscription { .. })
    ));

    engine
        .lifecycle
        .change_plan(id, premium.plan_id, None, days_after(2))
        .await
        .unwrap();
    engine
        .lifecycle
        .cancel(id, Some("moving".to_string()), days_after(3))
        .await
        .unwrap();

    let stored = engine.lifecycle.get(id).await.unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Cancelled);
    assert_eq!(stored.pricing.final_price, dec!(699));
    assert_eq!(stored.applied_discounts.len(), 1);
    assert_eq!(
        stored.history_actions(),
        vec![
            HistoryAction::Subscribed,
            HistoryAction::Upgraded,
            HistoryAction::Cancelled
        ]
    );

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn discount_terms_and_codes_are_enforced() {
    let test_db = TestDb::spawn().await;
    let (engine, basic, _) = engine_with_plans(&test_db).await;
    let discount = engine
        .discounts
        .create_discount(
            discount_input("LAUNCH", DiscountKind::FixedAmount, dec!(50)),
            t0() - Duration::days(1),
        )
        .await
        .unwrap();

    let duplicate = engine
        .discounts
        .create_discount(
            discount_input("launch", DiscountKind::FixedAmount, dec!(10)),
            t0(),
        )
        .await;
    assert!(matches!(duplicate, Err(EngineError::DuplicateDiscountCode(_))));

    engine
        .lifecycle
        .subscribe(
            SubscribeRequest::new(Uuid::new_v4(), basic.plan_id).with_discount_code("LAUNCH"),
            t0(),
        )
        .await
        .unwrap();

    let frozen = engine
        .discounts
        .update_terms(
            discount.discount_id,
            UpdateDiscountTerms {
                value: Some(dec!(75)),
                ..Default::default()
            },
            t0(),
        )
        .await;
    assert!(matches!(frozen, Err(EngineError::DiscountInUse)));

    let stored = engine.discounts.find_by_code("Launch").await.unwrap();
    assert_eq!(stored.total_uses, 1);
    assert_eq!(stored.usages[0].amount, dec!(50));

    test_db.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires PostgreSQL
async fn global_cap_holds_across_connections() {
    let test_db = TestDb::spawn().await;
    let (engine, basic, _) = engine_with_plans(&test_db).await;
    let mut input = discount_input("FIRST3", DiscountKind::Percentage, dec!(10));
    input.max_uses = Some(3);
    let discount = engine
        .discounts
        .create_discount(input, t0() - Duration::days(1))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        let plan_id = basic.plan_id;
        handles.push(tokio::spawn(async move {
            engine
                .lifecycle
                .subscribe(
                    SubscribeRequest::new(Uuid::new_v4(), plan_id).with_discount_code("FIRST3"),
                    t0(),
                )
                .await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        let receipt = handle.await.unwrap().unwrap();
        if matches!(receipt.discount, DiscountOutcome::Applied { .. }) {
            applied += 1;
        }
    }

    assert_eq!(applied, 3);
    let stored = engine.discounts.get(discount.discount_id).await.unwrap();
    assert_eq!(stored.total_uses, 3);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn usage_periods_persist_across_renewal() {
    let test_db = TestDb::spawn().await;
    let (engine, basic, _) = engine_with_plans(&test_db).await;
    let id = engine
        .lifecycle
        .subscribe(SubscribeRequest::new(Uuid::new_v4(), basic.plan_id), t0())
        .await
        .unwrap()
        .subscription
        .subscription_id;

    engine
        .usage
        .record_daily_usage(id, date_after(1), dec!(50), None, days_after(1))
        .await
        .unwrap();
    let period = engine
        .usage
        .record_daily_usage(id, date_after(1), dec!(35), None, days_after(1))
        .await
        .unwrap();
    assert_eq!(period.total_used_gb, dec!(85));
    assert!(period.alert(AlertKind::QuotaWarning).unwrap().triggered);
    assert!(period.alert(AlertKind::PeakUsage).unwrap().triggered);

    engine
        .lifecycle
        .renew(id, None, days_after(31))
        .await
        .unwrap();

    let history = engine.usage.period_history(id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].total_used_gb, dec!(85));
    let current = engine.usage.current_period(id).await.unwrap();
    assert!(current.daily_usage.is_empty());
    assert_eq!(current.period_id, history[1].period_id);

    test_db.cleanup().await;
}
