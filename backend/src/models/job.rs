//! Backup job model and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::schedule::BackupKind;

/// Job status.
///
/// `pending -> running -> {success | failed -> retrying -> running ...}`.
/// A failed attempt with attempts left moves straight to `retrying`; `failed`
/// is only reached once attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Retrying)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Retrying, JobStatus::Running)
                | (JobStatus::Retrying, JobStatus::Failed)
        )
    }
}

/// One entry of a job's append-only transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTransition {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    pub attempt: u32,
}

/// A single execution of a schedule, across all of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub kind: BackupKind,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub artifact_ids: Vec<Uuid>,
    pub last_error: Option<String>,
    pub duration_ms: Option<u64>,
    pub transitions: Vec<JobTransition>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(schedule_id: Uuid, kind: BackupKind, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            kind,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            artifact_ids: Vec::new(),
            last_error: None,
            duration_ms: None,
            transitions: vec![JobTransition {
                status: JobStatus::Pending,
                at: now,
                attempt: 0,
            }],
            created_at: now,
        }
    }

    fn transition(&mut self, next: JobStatus, at: DateTime<Utc>) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal job transition {:?} -> {:?}",
            self.status,
            next
        );
        self.status = next;
        self.transitions.push(JobTransition {
            status: next,
            at,
            attempt: self.attempt,
        });
    }

    /// Begin the next attempt. Returns false if the job cannot run again.
    pub fn start_attempt(&mut self, at: DateTime<Utc>) -> bool {
        if !matches!(self.status, JobStatus::Pending | JobStatus::Retrying)
            || self.attempt >= self.max_attempts
        {
            return false;
        }
        self.attempt += 1;
        if self.started_at.is_none() {
            self.started_at = Some(at);
        }
        self.transition(JobStatus::Running, at);
        true
    }

    /// When the job entered its current status.
    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.transitions
            .last()
            .map(|t| t.at)
            .unwrap_or(self.created_at)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub fn succeed(&mut self, artifact_ids: Vec<Uuid>, duration_ms: u64, at: DateTime<Utc>) {
        self.artifact_ids.extend(artifact_ids);
        self.duration_ms = Some(duration_ms);
        self.completed_at = Some(at);
        self.last_error = None;
        self.transition(JobStatus::Success, at);
    }

    /// Record a failed attempt that will be retried.
    pub fn schedule_retry(&mut self, error: String, artifact_ids: Vec<Uuid>, at: DateTime<Utc>) {
        self.artifact_ids.extend(artifact_ids);
        self.last_error = Some(error);
        self.transition(JobStatus::Retrying, at);
    }

    /// Record terminal failure.
    pub fn fail(&mut self, error: String, artifact_ids: Vec<Uuid>, at: DateTime<Utc>) {
        self.artifact_ids.extend(artifact_ids);
        self.last_error = Some(error);
        self.completed_at = Some(at);
        self.transition(JobStatus::Failed, at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_cycle_then_success() {
        let now = Utc::now();
        let mut job = Job::new(Uuid::new_v4(), BackupKind::Database, 3, now);
        assert!(job.start_attempt(now));
        job.schedule_retry("dump failed".into(), vec![], now);
        assert!(job.start_attempt(now));
        job.schedule_retry("dump failed".into(), vec![], now);
        assert!(job.start_attempt(now));
        job.succeed(vec![Uuid::new_v4()], 10, now);

        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.attempt, 3);
        assert!(job.last_error.is_none());
        let statuses: Vec<_> = job.transitions.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Retrying,
                JobStatus::Running,
                JobStatus::Retrying,
                JobStatus::Running,
                JobStatus::Success,
            ]
        );
    }

    #[test]
    fn test_attempts_never_exceed_max() {
        let now = Utc::now();
        let mut job = Job::new(Uuid::new_v4(), BackupKind::Files, 1, now);
        assert!(job.start_attempt(now));
        assert!(!job.has_attempts_left());
        job.fail("boom".into(), vec![], now);
        assert!(!job.start_attempt(now));
        assert_eq!(job.attempt, 1);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}
