pub mod ai;
pub mod auth;
pub mod chat;
pub mod config;
pub mod store;
pub mod types;
