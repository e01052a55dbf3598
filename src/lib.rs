// Core modules
pub mod broker;
pub mod config;
pub mod error;
pub mod execution;
pub mod feed;
pub mod models;
pub mod persistence;
pub mod signal;

// Re-export commonly used types
pub use config::TradingConfig;
pub use error::{BrokerError, FeedError};
pub use models::*;
