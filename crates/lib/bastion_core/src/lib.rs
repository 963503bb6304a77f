//! # bastion_core
//!
//! Core authentication domain logic for Bastion: signed session tokens,
//! the revocation ledger, login throttling and the audit sink.

pub mod auth;
pub mod config;
pub mod migrate;
pub mod models;
pub mod uuid;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
