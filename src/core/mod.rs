pub mod config;
pub mod counters;
pub mod error;
pub mod events;
pub mod model;
pub mod progress;
pub mod security;
pub mod store;
pub mod worker;
