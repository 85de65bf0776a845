pub mod client;
pub mod core;
pub mod plugins;
pub mod server;
