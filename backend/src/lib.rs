//! Backup Keeper - Backend Library
//!
//! Scheduled database and file backups with integrity-checked restores,
//! tiered retention, monitoring and alerting, and disaster recovery
//! orchestration.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod store;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
