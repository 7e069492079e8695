//! Entitlement and usage engine: discount eligibility, quota accounting with
//! alerts and plan recommendations, and the subscription lifecycle.
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;

pub use error::EngineError;
pub use services::{EngineSettings, EntitlementEngine};
