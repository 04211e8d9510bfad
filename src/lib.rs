//! tokengate: library crate for the binary and integration tests.

pub mod api;
pub mod authz;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod forward_auth;
pub mod glob;
pub mod jobs;
pub mod models;
pub mod server;
pub mod service;
pub mod store;
pub mod usage;
pub mod validation;
