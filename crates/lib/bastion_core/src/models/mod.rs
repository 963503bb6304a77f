//! Domain models shared across the auth subsystem.

pub mod auth;
