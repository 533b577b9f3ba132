// Deposit lifecycle and alerting
pub mod alerts;
pub mod deposits;
pub mod sweep;

// Collaborators consumed by the lifecycle
pub mod directory;
pub mod movements;
pub mod sequence;

// Service factory for dependency injection
pub mod factory;

pub use factory::{AppServices, ServiceFactory};
