pub mod analytics;
pub mod config;
pub mod error;
pub mod event;
pub mod store;
