//! Core data models for the cart service.
//!
//! A cart groups the files a client asked for; each file tracks its own
//! staging outcome. Both map to SQLite rows via `sqlx::FromRow` and
//! serialize as JSON via `serde`.

pub mod cart;
pub mod file;
