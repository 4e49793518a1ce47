//! Business logic services.

pub mod alert_service;
pub mod backup_service;
pub mod command_registry;
pub mod health_monitor_service;
pub mod metrics_service;
pub mod notification_service;
pub mod producer;
pub mod recovery_plans;
pub mod recovery_service;
pub mod report_service;
pub mod retention;
pub mod scheduler_service;
pub mod storage_service;
