//! Domain models for schedules, jobs, artifacts, alerts and disaster recovery.

pub mod alert;
pub mod artifact;
pub mod disaster;
pub mod job;
pub mod schedule;

pub use alert::{Alert, AlertSeverity, AlertType, NewAlert};
pub use artifact::{Artifact, ArtifactStatus};
pub use disaster::{
    DisasterEvent, DisasterSeverity, DisasterStatus, DisasterType, RecoveryProcedure,
    RecoveryStep, StepOutcome, StepType, TestResult,
};
pub use job::{Job, JobStatus, JobTransition};
pub use schedule::{BackupKind, Schedule, SourceKind};
