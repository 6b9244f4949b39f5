pub mod aggregate;
pub mod funnels;
pub mod goals;
pub mod health;
pub mod journeys;
