pub mod aggregator;
pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod process;
pub mod providers;
