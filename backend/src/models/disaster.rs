//! Disaster events and recovery procedures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisasterType {
    DatabaseFailure,
    ServiceOutage,
    DataCorruption,
    SecurityBreach,
    NaturalDisaster,
}

impl fmt::Display for DisasterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisasterType::DatabaseFailure => "database_failure",
            DisasterType::ServiceOutage => "service_outage",
            DisasterType::DataCorruption => "data_corruption",
            DisasterType::SecurityBreach => "security_breach",
            DisasterType::NaturalDisaster => "natural_disaster",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisasterSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for DisasterSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisasterSeverity::Low => "low",
            DisasterSeverity::Medium => "medium",
            DisasterSeverity::High => "high",
            DisasterSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for DisasterSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(DisasterSeverity::Low),
            "medium" => Ok(DisasterSeverity::Medium),
            "high" => Ok(DisasterSeverity::High),
            "critical" => Ok(DisasterSeverity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// `detected -> responding -> {recovered | investigating}`;
/// `investigating -> responding` on operator retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisasterStatus {
    Detected,
    Responding,
    Investigating,
    Recovered,
}

impl DisasterStatus {
    pub fn can_transition_to(self, next: DisasterStatus) -> bool {
        matches!(
            (self, next),
            (DisasterStatus::Detected, DisasterStatus::Responding)
                | (DisasterStatus::Responding, DisasterStatus::Recovered)
                | (DisasterStatus::Responding, DisasterStatus::Investigating)
                | (DisasterStatus::Investigating, DisasterStatus::Responding)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Manual,
    Automated,
    Verification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub name: String,
    pub step_type: StepType,
    /// Allowlisted command id for automated and verification steps.
    pub command: Option<String>,
    pub expected_duration_minutes: u32,
    pub critical: bool,
    #[serde(default)]
    pub rollback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: Uuid,
    pub procedure_id: String,
    pub tested_at: DateTime<Utc>,
    pub environment: String,
    pub success: bool,
    pub duration_ms: u64,
    pub steps_passed: usize,
    pub steps_total: usize,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryProcedure {
    pub id: String,
    pub name: String,
    pub steps: Vec<RecoveryStep>,
    pub last_tested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
}

impl RecoveryProcedure {
    /// Sum of the steps' expected durations.
    pub fn estimated_duration_minutes(&self) -> u32 {
        self.steps.iter().map(|s| s.expected_duration_minutes).sum()
    }
}

/// Outcome of one executed step, kept on the event for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub success: bool,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisasterEvent {
    pub id: Uuid,
    pub disaster_type: DisasterType,
    pub severity: DisasterSeverity,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub affected_systems: Vec<String>,
    pub recovery_plan: String,
    pub status: DisasterStatus,
    pub estimated_recovery_at: DateTime<Utc>,
    pub actual_recovery_at: Option<DateTime<Utc>>,
    pub post_mortem_required: bool,
    /// Index of the next step to run.
    pub next_step: usize,
    /// Set while a manual step waits for operator confirmation.
    pub awaiting_confirmation: Option<String>,
    #[serde(default)]
    pub step_log: Vec<StepOutcome>,
}

impl DisasterEvent {
    pub fn transition(&mut self, next: DisasterStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }
}
