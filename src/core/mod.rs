pub mod agents;
pub mod consensus;
pub mod evaluator;
pub mod hub;
pub mod notify;
pub mod scheduler;
pub mod store;
pub mod types;
