//! Services module for entitlement-service.

pub mod database;
pub mod discounts;
pub mod lifecycle;
pub mod locks;
pub mod memory;
pub mod metrics;
pub mod recommendations;
pub mod store;
pub mod usage_ledger;

pub use database::Database;
pub use discounts::{ApplyDiscount, DiscountEngine};
pub use lifecycle::{
    DiscountFallback, Notifier, SubscribeRequest, SubscriptionLifecycle, SubscriptionReceipt,
    SweepSummary, TracingNotifier,
};
pub use locks::KeyedLocks;
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use recommendations::RecommendationAdvisor;
pub use store::{CustomerProfile, EntitlementStore};
pub use usage_ledger::{AlertPolicy, UsageLedger};

use std::sync::Arc;
use uuid::Uuid;

/// Engine settings that are not storage-specific.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub discount_fallback: DiscountFallback,
    pub alert_policy: AlertPolicy,
}

/// The wired engine: all components over one store, sharing one set of
/// per-subscription locks.
#[derive(Clone)]
pub struct EntitlementEngine {
    store: Arc<dyn EntitlementStore>,
    pub discounts: DiscountEngine,
    pub usage: UsageLedger,
    pub advisor: RecommendationAdvisor,
    pub lifecycle: SubscriptionLifecycle,
}

impl EntitlementEngine {
    pub fn new(store: Arc<dyn EntitlementStore>, settings: EngineSettings) -> Self {
        Self::with_notifier(store, settings, Arc::new(TracingNotifier))
    }

    pub fn with_notifier(
        store: Arc<dyn EntitlementStore>,
        settings: EngineSettings,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let locks: Arc<KeyedLocks<Uuid>> = Arc::new(KeyedLocks::new());
        let discounts = DiscountEngine::new(store.clone());
        let usage = UsageLedger::new(store.clone(), locks.clone(), settings.alert_policy);
        let advisor = RecommendationAdvisor::new(store.clone());
        let lifecycle = SubscriptionLifecycle::new(
            store.clone(),
            discounts.clone(),
            usage.clone(),
            locks,
            notifier,
            settings.discount_fallback,
        );

        Self {
            store,
            discounts,
            usage,
            advisor,
            lifecycle,
        }
    }

    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }
}
