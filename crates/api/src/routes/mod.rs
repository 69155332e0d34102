pub mod observability;
pub mod resilience;
pub mod sagas;
