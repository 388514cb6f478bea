pub mod api;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod source;
pub mod store;
