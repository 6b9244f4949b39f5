pub mod bucket;
pub mod context;
pub mod engine;
pub mod filter;
pub mod funnel;
pub mod goals;
pub mod journey;
pub mod memory;
pub mod metrics;
pub mod pagination;
pub mod paths;
pub mod retry;
pub mod session;

pub use context::QueryContext;
pub use engine::Engine;
