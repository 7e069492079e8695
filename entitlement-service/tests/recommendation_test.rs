//! Plan recommendation integration tests for entitlement-service.

mod common;

use common::{date_after, days_after, t0, TestEngine};
use entitlement_service::models::{Plan, RecommendationKind};
use entitlement_service::services::SubscribeRequest;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use uuid::Uuid;

async fn subscribed(t: &TestEngine, plan: &Plan) -> Uuid {
    t.engine
        .lifecycle
        .subscribe(SubscribeRequest::new(Uuid::new_v4(), plan.plan_id), t0())
        .await
        .expect("Failed to subscribe")
        .subscription
        .subscription_id
}

fn hours(entries: &[(u8, i64)]) -> Option<BTreeMap<u8, Decimal>> {
    Some(
        entries
            .iter()
            .map(|(hour, gb)| (*hour, Decimal::from(*gb)))
            .collect(),
    )
}

#[tokio::test]
async fn heavy_usage_suggests_the_next_larger_plan() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.basic).await;

    let period = t
        .engine
        .usage
        .record_daily_usage(id, date_after(1), dec!(95), None, days_after(1))
        .await
        .unwrap();

    let active: Vec<_> = period.active_recommendations().collect();
    assert_eq!(active.len(), 1);
    let upgrade = active[0];
    assert_eq!(upgrade.kind, RecommendationKind::UpgradePlan);
    assert_eq!(upgrade.confidence, 85);
    assert_eq!(upgrade.suggested_plan_id, Some(t.plans.premium.plan_id));
    assert!(upgrade.message.contains("95"));

    // Still over the threshold: the same entry is refreshed.
    let period = t
        .engine
        .usage
        .record_daily_usage(id, date_after(2), dec!(2), None, days_after(2))
        .await
        .unwrap();
    assert_eq!(period.recommendations.len(), 1);
    assert!(period.recommendations[0].message.contains("97"));
    assert_eq!(period.recommendations[0].generated_utc, days_after(2));
}

#[tokio::test]
async fn unlimited_plans_are_never_told_to_upgrade() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.unlimited).await;

    let period = t
        .engine
        .usage
        .record_daily_usage(id, date_after(1), dec!(400), None, days_after(1))
        .await
        .unwrap();

    assert!(period
        .active_recommendations()
        .all(|r| r.kind != RecommendationKind::UpgradePlan));
}

#[tokio::test]
async fn light_usage_over_enough_days_suggests_a_cheaper_plan() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.premium).await;

    let mut period = None;
    for day in 1..=15 {
        period = Some(
            t.engine
                .usage
                .record_daily_usage(id, date_after(day), dec!(1), None, days_after(day))
                .await
                .unwrap(),
        );
        if day == 14 {
            let early = period.as_ref().unwrap();
            assert_eq!(early.active_recommendations().count(), 0);
        }
    }
    let period = period.unwrap();

    let downgrade = period
        .active_recommendations()
        .find(|r| r.kind == RecommendationKind::DowngradePlan)
        .expect("downgrade recommendation");
    assert_eq!(downgrade.confidence, 75);
    // About 31 GB projected, 20% headroom rules out the 20 GB plan.
    assert_eq!(downgrade.suggested_plan_id, Some(t.plans.basic.plan_id));
}

#[tokio::test]
async fn spread_usage_suggests_optimization_until_a_bucket_dominates() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.premium).await;

    let period = t
        .engine
        .usage
        .record_daily_usage(
            id,
            date_after(1),
            dec!(12),
            hours(&[(2, 3), (9, 3), (14, 3), (20, 3)]),
            days_after(1),
        )
        .await
        .unwrap();
    let optimization = period
        .active_recommendations()
        .find(|r| r.kind == RecommendationKind::UsageOptimization)
        .expect("optimization recommendation");
    assert_eq!(optimization.confidence, 60);
    assert_eq!(optimization.suggested_plan_id, None);

    let period = t
        .engine
        .usage
        .record_daily_usage(
            id,
            date_after(2),
            dec!(30),
            hours(&[(21, 30)]),
            days_after(2),
        )
        .await
        .unwrap();

    let kept = period
        .recommendations
        .iter()
        .find(|r| r.kind == RecommendationKind::UsageOptimization)
        .expect("deactivated entry is kept");
    assert!(!kept.is_active);
    assert_eq!(kept.deactivated_utc, Some(days_after(2)));
    assert_eq!(period.active_recommendations().count(), 0);
}
