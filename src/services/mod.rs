pub mod claims;
pub mod consumer;
pub mod identity;
pub mod jwks;
pub mod metrics;
pub mod notifier;
pub mod orders;
pub mod profile_store;
pub mod reconciler;
