#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod logging;
pub mod transport;
