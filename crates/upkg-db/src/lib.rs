//! SQLite storage for upkg install records.
//!
//! Records live in a single `installs` table managed through diesel with
//! embedded migrations. Higher-level typing of the `metadata` column is done by
//! callers; this crate stores it as text.

pub mod connection;
pub mod error;
pub mod migration;
pub mod models;
pub mod repository;
pub mod schema;
