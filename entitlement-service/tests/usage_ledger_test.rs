//! Usage ledger integration tests for entitlement-service.

mod common;

use common::{date_after, days_after, t0, TestEngine};
use entitlement_service::models::{AlertKind, Plan};
use entitlement_service::services::SubscribeRequest;
use entitlement_service::EngineError;
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

#[tokio::test]
async fn subscribe_opens_an_empty_period_with_armed_alerts() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.basic).await;

    let period = t.engine.usage.current_period(id).await.unwrap();
    assert_eq!(period.period_start, t0());
    assert_eq!(period.total_used_gb, Decimal::ZERO);
    assert_eq!(period.quota.allocated_gb, dec!(100));
    assert_eq!(period.quota.remaining_gb, dec!(100));
    assert_eq!(period.alerts.len(), 4);
    assert!(period.alerts.iter().all(|a| !a.triggered));
}

#[tokio::test]
async fn same_date_accumulates() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.basic).await;

    t.engine
        .usage
        .record_daily_usage(id, date_after(1), dec!(3.5), None, days_after(1))
        .await
        .unwrap();
    let period = t
        .engine
        .usage
        .record_daily_usage(id, date_after(1), dec!(1.5), None, days_after(1))
        .await
        .unwrap();

    assert_eq!(period.distinct_days(), 1);
    assert_eq!(period.usage_on(date_after(1)).unwrap().amount_gb, dec!(5.0));
    assert_eq!(period.total_used_gb, dec!(5.0));
    assert_eq!(period.average_daily_gb, dec!(5));
    assert_eq!(period.quota.percentage_used, dec!(5));
}

#[tokio::test]
async fn quota_alerts_latch_once_per_period() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.basic).await;
    let usage = &t.engine.usage;

    usage
        .record_daily_usage(id, date_after(1), dec!(40), None, days_after(1))
        .await
        .unwrap();
    let period = usage
        .record_daily_usage(id, date_after(2), dec!(45), None, days_after(2))
        .await
        .unwrap();

    assert_eq!(period.quota.percentage_used, dec!(85));
    let warning = period.alert(AlertKind::QuotaWarning).unwrap();
    assert!(warning.triggered);
    assert_eq!(warning.triggered_utc, Some(days_after(2)));
    assert!(!period.alert(AlertKind::QuotaExceeded).unwrap().triggered);

    let period = usage
        .record_daily_usage(id, date_after(3), dec!(20), None, days_after(3))
        .await
        .unwrap();

    assert_eq!(period.quota.percentage_used, dec!(105));
    assert_eq!(period.quota.remaining_gb, Decimal::ZERO);
    assert!(period.alert(AlertKind::QuotaExceeded).unwrap().triggered);
    // The warning keeps its original trigger time.
    assert_eq!(
        period.alert(AlertKind::QuotaWarning).unwrap().triggered_utc,
        Some(days_after(2))
    );
}

#[tokio::test]
async fn quota_alerts_use_the_unrounded_percentage() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.basic).await;
    let usage = &t.engine.usage;

    let period = usage
        .record_daily_usage(id, date_after(1), dec!(79.995), None, days_after(1))
        .await
        .unwrap();
    assert!(!period.alert(AlertKind::QuotaWarning).unwrap().triggered);

    let period = usage
        .record_daily_usage(id, date_after(2), dec!(20.001), None, days_after(2))
        .await
        .unwrap();
    assert_eq!(period.quota.remaining_gb, dec!(0.004));
    assert_eq!(period.quota.percentage_used, dec!(99.996));
    assert!(period.alert(AlertKind::QuotaWarning).unwrap().triggered);
    assert!(!period.alert(AlertKind::QuotaExceeded).unwrap().triggered);

    let period = usage
        .record_daily_usage(id, date_after(2), dec!(0.004), None, days_after(2))
        .await
        .unwrap();
    assert_eq!(period.quota.remaining_gb, Decimal::ZERO);
    assert!(period.alert(AlertKind::QuotaExceeded).unwrap().triggered);
}

#[tokio::test]
async fn usage_beyond_the_decimal_range_is_rejected() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.unlimited).await;
    let usage = &t.engine.usage;

    usage
        .record_daily_usage(id, date_after(1), Decimal::MAX, None, days_after(1))
        .await
        .unwrap();
    let overflow = usage
        .record_daily_usage(id, date_after(2), dec!(1), None, days_after(2))
        .await;
    assert!(matches!(overflow, Err(EngineError::InvalidInput(_))));

    let period = usage.current_period(id).await.unwrap();
    assert_eq!(period.distinct_days(), 1);
    assert_eq!(period.total_used_gb, Decimal::MAX);
}

#[tokio::test]
async fn unusual_and_peak_alerts() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.unlimited).await;
    let usage = &t.engine.usage;

    for day in 1..=3 {
        usage
            .record_daily_usage(id, date_after(day), dec!(2), None, days_after(day))
            .await
            .unwrap();
    }
    let period = usage
        .record_daily_usage(id, date_after(4), dec!(20), None, days_after(4))
        .await
        .unwrap();

    // 20 GB against an average of 6.5 GB.
    assert!(period.alert(AlertKind::UnusualUsage).unwrap().triggered);
    assert!(!period.alert(AlertKind::PeakUsage).unwrap().triggered);
    assert!(!period.alert(AlertKind::QuotaWarning).unwrap().triggered);
    assert!(period.quota.is_unlimited);
    assert_eq!(period.quota.percentage_used, Decimal::ZERO);

    let period = usage
        .record_daily_usage(id, date_after(5), dec!(55), None, days_after(5))
        .await
        .unwrap();
    assert!(period.alert(AlertKind::PeakUsage).unwrap().triggered);

    let peak = period.peak.unwrap();
    assert_eq!(peak.date, date_after(5));
    assert_eq!(peak.amount_gb, dec!(55));
}

#[tokio::test]
async fn peak_ties_keep_the_earliest_date() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.premium).await;

    t.engine
        .usage
        .record_daily_usage(id, date_after(3), dec!(10), None, days_after(3))
        .await
        .unwrap();
    let period = t
        .engine
        .usage
        .record_daily_usage(id, date_after(1), dec!(10), None, days_after(3))
        .await
        .unwrap();

    assert_eq!(period.peak.unwrap().date, date_after(1));
}

#[tokio::test]
async fn rejects_bad_usage_records() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.basic).await;
    let usage = &t.engine.usage;

    let before_period = usage
        .record_daily_usage(id, date_after(-1), dec!(1), None, t0())
        .await;
    assert!(matches!(before_period, Err(EngineError::InvalidInput(_))));

    let after_period = usage
        .record_daily_usage(id, date_after(45), dec!(1), None, t0())
        .await;
    assert!(matches!(after_period, Err(EngineError::InvalidInput(_))));

    let negative = usage
        .record_daily_usage(id, date_after(1), dec!(-1), None, t0())
        .await;
    assert!(matches!(negative, Err(EngineError::InvalidInput(_))));

    let bad_hour = usage
        .record_daily_usage(
            id,
            date_after(1),
            dec!(1),
            Some(BTreeMap::from([(24u8, dec!(1))])),
            t0(),
        )
        .await;
    assert!(matches!(bad_hour, Err(EngineError::InvalidInput(_))));

    let unknown = usage
        .record_daily_usage(Uuid::new_v4(), date_after(1), dec!(1), None, t0())
        .await;
    assert!(matches!(unknown, Err(EngineError::UsagePeriodNotFound(_))));

    let period = usage.current_period(id).await.unwrap();
    assert!(period.daily_usage.is_empty());
}

#[tokio::test]
async fn renewal_closes_the_period_and_keeps_history() {
    let t = TestEngine::new();
    let id = subscribed(&t, &t.plans.basic).await;

    t.engine
        .usage
        .record_daily_usage(id, date_after(10), dec!(30), None, days_after(10))
        .await
        .unwrap();
    t.engine
        .lifecycle
        .renew(id, None, days_after(31))
        .await
        .unwrap();

    let history = t.engine.usage.period_history(id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].total_used_gb, dec!(30));
    assert!(history[1].daily_usage.is_empty());
    assert_eq!(history[1].period_start, days_after(31));

    let current = t.engine.usage.current_period(id).await.unwrap();
    assert_eq!(current.period_id, history[1].period_id);
    assert!(current.alerts.iter().all(|a| !a.triggered));
}
