pub mod approval;
pub mod context;
pub mod error;
pub mod provider_queue;
pub mod runqueue;
pub mod scheduler;
pub mod store;
pub mod types;
