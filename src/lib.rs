//! Quota-aware, scheduled acquisition of third-party profile records.
//!
//! The pipeline: the [`scheduler`] fires cron triggers, the
//! [`fetcher`] drains pending profile entries through the
//! [`profile_api`] client, stores payloads in the [`blob`] store and
//! normalized rows in SQLite ([`db`]), while the [`quota`] manager keeps
//! the monthly call budget.

pub mod blob;
pub mod db;
pub mod error;
pub mod fetcher;
mod migrations;
pub mod notification;
pub mod profile_api;
pub mod quota;
pub mod scheduler;
pub mod state;
pub mod types;

#[cfg(test)]
mod test_support;
