pub mod cache;
pub mod config;
pub mod flight;
pub mod protocol;
pub mod server;
pub mod tls;
