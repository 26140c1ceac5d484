pub mod allocator;
pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod object;
pub mod reconciler;
pub mod server;
pub mod store;
