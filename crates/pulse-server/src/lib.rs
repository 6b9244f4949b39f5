pub mod app;
pub mod error;
pub mod routes;
pub mod seed;
pub mod state;
