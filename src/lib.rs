pub mod band;
pub mod config;
pub mod error;
pub mod gateway;
pub mod model;
pub mod processor;
pub mod protocol;
pub mod server;
pub mod storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
