//! Built-in recovery procedures and the plan selection table.

use crate::models::{DisasterSeverity, DisasterType, RecoveryProcedure, RecoveryStep, StepType};
use crate::services::command_registry::{
    CHECK_SERVICE_HEALTH, CHECK_STORAGE, RESTORE_LATEST_DATABASE, RESTORE_LATEST_FILES,
    RUN_FULL_BACKUP, VERIFY_LATEST_BACKUPS,
};

pub const DATABASE_RECOVERY: &str = "database_recovery";
pub const DATA_CORRUPTION_RECOVERY: &str = "data_corruption_recovery";
pub const SERVICE_RESTART: &str = "service_restart";
pub const SERVICE_RECOVERY: &str = "service_recovery";
pub const SECURITY_INCIDENT_RESPONSE: &str = "security_incident_response";
pub const FULL_SITE_RECOVERY: &str = "full_site_recovery";

/// Recovery plan for a disaster type and severity.
pub fn select_plan(disaster_type: DisasterType, severity: DisasterSeverity) -> &'static str {
    use DisasterSeverity::*;
    use DisasterType::*;

    match (disaster_type, severity) {
        (DatabaseFailure, _) => DATABASE_RECOVERY,
        (DataCorruption, _) => DATA_CORRUPTION_RECOVERY,
        (ServiceOutage, Low | Medium) => SERVICE_RESTART,
        (ServiceOutage, High | Critical) => SERVICE_RECOVERY,
        (SecurityBreach, _) => SECURITY_INCIDENT_RESPONSE,
        (NaturalDisaster, _) => FULL_SITE_RECOVERY,
    }
}

fn manual(name: &str, minutes: u32) -> RecoveryStep {
    RecoveryStep {
        name: name.to_string(),
        step_type: StepType::Manual,
        command: None,
        expected_duration_minutes: minutes,
        critical: true,
        rollback: Vec::new(),
    }
}

fn automated(name: &str, command: &str, minutes: u32, rollback: &[&str]) -> RecoveryStep {
    RecoveryStep {
        name: name.to_string(),
        step_type: StepType::Automated,
        command: Some(command.to_string()),
        expected_duration_minutes: minutes,
        critical: true,
        rollback: rollback.iter().map(|s| s.to_string()).collect(),
    }
}

fn verify(name: &str, command: &str, minutes: u32, critical: bool) -> RecoveryStep {
    RecoveryStep {
        name: name.to_string(),
        step_type: StepType::Verification,
        command: Some(command.to_string()),
        expected_duration_minutes: minutes,
        critical,
        rollback: Vec::new(),
    }
}

fn procedure(id: &str, name: &str, steps: Vec<RecoveryStep>) -> RecoveryProcedure {
    RecoveryProcedure {
        id: id.to_string(),
        name: name.to_string(),
        steps,
        last_tested_at: None,
        test_results: Vec::new(),
    }
}

/// The procedures seeded into the store at start-up.
pub fn builtin_procedures() -> Vec<RecoveryProcedure> {
    vec![
        procedure(
            DATABASE_RECOVERY,
            "Database recovery",
            vec![
                verify("Verify latest backup integrity", VERIFY_LATEST_BACKUPS, 5, true),
                automated(
                    "Restore database from latest backup",
                    RESTORE_LATEST_DATABASE,
                    30,
                    &["Restore the previous database artifact"],
                ),
                verify("Confirm service health", CHECK_SERVICE_HEALTH, 5, true),
            ],
        ),
        procedure(
            DATA_CORRUPTION_RECOVERY,
            "Data corruption recovery",
            vec![
                manual("Identify the scope of corrupted data and stop writes", 30),
                verify("Verify latest backup integrity", VERIFY_LATEST_BACKUPS, 5, true),
                automated(
                    "Restore database from latest backup",
                    RESTORE_LATEST_DATABASE,
                    30,
                    &["Restore the previous database artifact"],
                ),
                automated(
                    "Restore files from latest backup",
                    RESTORE_LATEST_FILES,
                    30,
                    &["Restore the previous file artifact"],
                ),
                verify("Confirm service health", CHECK_SERVICE_HEALTH, 5, true),
            ],
        ),
        procedure(
            SERVICE_RESTART,
            "Service restart",
            vec![
                manual("Restart the application service", 10),
                verify("Confirm service health", CHECK_SERVICE_HEALTH, 5, true),
            ],
        ),
        procedure(
            SERVICE_RECOVERY,
            "Service recovery",
            vec![
                verify("Check backup storage", CHECK_STORAGE, 5, false),
                manual("Redeploy the application or fail over to standby", 60),
                verify("Confirm service health", CHECK_SERVICE_HEALTH, 5, true),
            ],
        ),
        procedure(
            SECURITY_INCIDENT_RESPONSE,
            "Security incident response",
            vec![
                manual("Isolate affected systems", 30),
                manual("Rotate credentials and revoke sessions", 60),
                verify("Verify latest backup integrity", VERIFY_LATEST_BACKUPS, 5, true),
                automated(
                    "Restore database from latest backup",
                    RESTORE_LATEST_DATABASE,
                    30,
                    &["Restore the previous database artifact"],
                ),
                automated("Take a post-incident backup", RUN_FULL_BACKUP, 30, &[]),
            ],
        ),
        procedure(
            FULL_SITE_RECOVERY,
            "Full site recovery",
            vec![
                manual("Provision replacement infrastructure", 240),
                verify("Check backup storage", CHECK_STORAGE, 5, true),
                verify("Verify latest backup integrity", VERIFY_LATEST_BACKUPS, 10, true),
                automated(
                    "Restore database from latest backup",
                    RESTORE_LATEST_DATABASE,
                    60,
                    &["Restore the previous database artifact"],
                ),
                automated(
                    "Restore files from latest backup",
                    RESTORE_LATEST_FILES,
                    60,
                    &["Restore the previous file artifact"],
                ),
                verify("Confirm service health", CHECK_SERVICE_HEALTH, 5, true),
            ],
        ),
    ]
}
