//! HTTP request handlers.

pub mod alerts;
pub mod backups;
pub mod health;
pub mod recovery;
pub mod reports;
pub mod schedules;
