//! Backup scheduler.
//!
//! Each enabled schedule has exactly one armed occurrence in a
//! delayed-visibility work queue. `tick(now)` drains whatever has become
//! visible: schedule occurrences create jobs, retry entries re-run failed
//! jobs. Arming is tracked with a per-schedule generation counter so that
//! stale queue entries left behind by an update are ignored.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule as CronSchedule;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{ArtifactStatus, BackupKind, Job, JobStatus, Schedule};
use crate::services::backup_service::BackupService;
use crate::services::metrics_service;
use crate::store::MetadataStore;

const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_RETRY_DELAY_MINUTES: u32 = 5;

/// Parse a recurrence expression.
///
/// The cron crate expects 6 or 7 fields (with seconds); 5-field expressions
/// get a leading `0` seconds field.
pub fn parse_cron(expr: &str) -> Result<CronSchedule> {
    let normalized = match expr.split_whitespace().count() {
        5 => format!("0 {}", expr.trim()),
        6 | 7 => expr.trim().to_string(),
        n => {
            return Err(AppError::InvalidSchedule(format!(
                "'{}' has {} fields, expected 5, 6 or 7",
                expr, n
            )))
        }
    };
    CronSchedule::from_str(&normalized)
        .map_err(|e| AppError::InvalidSchedule(format!("'{}': {}", expr, e)))
}

/// Next occurrence strictly after `after`.
pub fn next_occurrence(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    Ok(parse_cron(expr)?.after(&after).next())
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub kind: BackupKind,
    pub cron_expression: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub max_retries: Option<u32>,
    pub retry_delay_minutes: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateScheduleRequest {
    pub name: Option<String>,
    pub kind: Option<BackupKind>,
    pub cron_expression: Option<String>,
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay_minutes: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub fired: usize,
    pub retried: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkItem {
    Fire { schedule_id: Uuid, generation: u64 },
    Retry { job_id: Uuid, schedule_id: Uuid },
}

#[derive(Debug)]
struct Queued {
    visible_at: DateTime<Utc>,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Reversed so the max-heap pops the earliest entry first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    /// Current generation for each armed schedule.
    armed: HashMap<Uuid, u64>,
    next_generation: u64,
    queue: BinaryHeap<Queued>,
    seq: u64,
    /// Running job id -> (schedule id, cancellation token)
    running: HashMap<Uuid, (Uuid, CancellationToken)>,
}

impl State {
    fn push(&mut self, visible_at: DateTime<Utc>, item: WorkItem) {
        self.seq += 1;
        self.queue.push(Queued {
            visible_at,
            seq: self.seq,
            item,
        });
    }

    fn arm(&mut self, schedule_id: Uuid, at: DateTime<Utc>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.armed.insert(schedule_id, generation);
        self.push(
            at,
            WorkItem::Fire {
                schedule_id,
                generation,
            },
        );
    }

    /// Drop the timer, queued retries and running work of a schedule.
    /// Returns the job ids whose retries were dropped.
    fn disarm(&mut self, schedule_id: Uuid, cancel_work: bool) -> Vec<Uuid> {
        self.armed.remove(&schedule_id);
        if !cancel_work {
            return Vec::new();
        }

        let mut dropped = Vec::new();
        let queue = std::mem::take(&mut self.queue);
        self.queue = queue
            .into_iter()
            .filter(|q| match q.item {
                WorkItem::Retry {
                    job_id,
                    schedule_id: owner,
                } if owner == schedule_id => {
                    dropped.push(job_id);
                    false
                }
                _ => true,
            })
            .collect();

        for (owner, token) in self.running.values() {
            if *owner == schedule_id {
                token.cancel();
            }
        }
        dropped
    }

    fn pop_visible(&mut self, now: DateTime<Utc>) -> Vec<Queued> {
        let mut out = Vec::new();
        while self.queue.peek().is_some_and(|q| q.visible_at <= now) {
            if let Some(q) = self.queue.pop() {
                out.push(q);
            }
        }
        out
    }
}

/// Backup scheduler
pub struct BackupScheduler {
    store: Arc<dyn MetadataStore>,
    backups: Arc<BackupService>,
    state: StdMutex<State>,
    /// Serializes read-modify-write cycles on schedule and job records.
    bookkeeping: Mutex<()>,
}

impl BackupScheduler {
    pub fn new(store: Arc<dyn MetadataStore>, backups: Arc<BackupService>) -> Self {
        Self {
            store,
            backups,
            state: StdMutex::new(State::default()),
            bookkeeping: Mutex::new(()),
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("scheduler state poisoned".into()))
    }

    /// Rebuild the in-memory queue from the store after a start.
    ///
    /// Every enabled schedule is armed; schedules whose stored next run is
    /// already past fire on the first tick. Jobs left unfinished by the
    /// previous process are picked up again: `retrying` jobs are requeued at
    /// their original retry time, `pending` jobs run on the next tick and
    /// `running` jobs count their interrupted attempt as failed. Jobs of
    /// disabled or deleted schedules are failed.
    pub async fn restore_timers(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.bookkeeping.lock().await;
        let mut schedules: HashMap<Uuid, Schedule> = self
            .store
            .list_schedules()
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();

        let mut armed = 0;
        {
            let mut state = self.state()?;
            for schedule in schedules.values().filter(|s| s.is_live()) {
                let next = match schedule.next_run_at {
                    Some(at) => Some(at),
                    None => next_occurrence(&schedule.cron_expression, now).unwrap_or(None),
                };
                if let Some(at) = next {
                    state.arm(schedule.id, at);
                    armed += 1;
                }
            }
        }

        let mut requeued = 0;
        let mut touched = Vec::new();
        for mut job in self.store.list_unfinished_jobs().await? {
            let Some(schedule) = schedules.get_mut(&job.schedule_id) else {
                warn!(job_id = %job.id, schedule_id = %job.schedule_id, "Unfinished job has no schedule");
                continue;
            };

            if !schedule.is_live() {
                let error = format!(
                    "Schedule no longer active; last error: {}",
                    job.last_error.as_deref().unwrap_or("none")
                );
                job.fail(error, Vec::new(), now);
                schedule.record_failure(now);
                touched.push(schedule.id);
                self.store.upsert_job(&job).await?;
                metrics_service::record_job_finished(&job.kind.to_string(), false);
                info!(job_id = %job.id, schedule_id = %schedule.id, "Unfinished job of inactive schedule failed");
                continue;
            }

            let delay = ChronoDuration::minutes(schedule.retry_delay_minutes as i64);
            let visible_at = match job.status {
                JobStatus::Pending => now,
                JobStatus::Retrying => job.last_transition_at() + delay,
                JobStatus::Running => {
                    let error = "Attempt interrupted by restart".to_string();
                    if job.has_attempts_left() {
                        job.schedule_retry(error, Vec::new(), now);
                        self.store.upsert_job(&job).await?;
                        now + delay
                    } else {
                        job.fail(error, Vec::new(), now);
                        schedule.record_failure(now);
                        touched.push(schedule.id);
                        self.store.upsert_job(&job).await?;
                        metrics_service::record_job_finished(&job.kind.to_string(), false);
                        warn!(job_id = %job.id, attempt = job.attempt, "Interrupted job had no attempts left");
                        continue;
                    }
                }
                JobStatus::Success | JobStatus::Failed => continue,
            };

            self.state()?.push(
                visible_at,
                WorkItem::Retry {
                    job_id: job.id,
                    schedule_id: schedule.id,
                },
            );
            requeued += 1;
            debug!(job_id = %job.id, status = ?job.status, retry_at = %visible_at, "Unfinished job requeued");
        }

        touched.sort();
        touched.dedup();
        for id in touched {
            if let Some(schedule) = schedules.get(&id) {
                self.store.upsert_schedule(schedule).await?;
            }
        }

        info!(armed, requeued, "Backup schedules armed");
        Ok(armed)
    }

    pub async fn create_schedule(
        &self,
        request: CreateScheduleRequest,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation("Schedule name is required".into()));
        }
        let next_run_at = next_occurrence(&request.cron_expression, now)?;

        let schedule = Schedule {
            id: Uuid::new_v4(),
            name,
            kind: request.kind,
            cron_expression: request.cron_expression.trim().to_string(),
            enabled: request.enabled,
            last_run_at: None,
            last_success_at: None,
            next_run_at: if request.enabled { next_run_at } else { None },
            success_count: 0,
            failure_count: 0,
            average_duration_ms: 0.0,
            max_retries: request.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_minutes: request
                .retry_delay_minutes
                .unwrap_or(DEFAULT_RETRY_DELAY_MINUTES),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let _guard = self.bookkeeping.lock().await;
        self.store.upsert_schedule(&schedule).await?;
        if let Some(at) = schedule.next_run_at {
            self.state()?.arm(schedule.id, at);
        }

        info!(
            schedule_id = %schedule.id,
            name = %schedule.name,
            cron = %schedule.cron_expression,
            next_run = ?schedule.next_run_at,
            "Backup schedule created"
        );
        Ok(schedule)
    }

    pub async fn update_schedule(
        &self,
        id: Uuid,
        update: UpdateScheduleRequest,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        if let Some(expr) = &update.cron_expression {
            parse_cron(expr)?;
        }
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(AppError::Validation("Schedule name is required".into()));
            }
        }

        let _guard = self.bookkeeping.lock().await;
        let mut schedule = self.live_schedule(id).await?;

        if let Some(name) = update.name {
            schedule.name = name.trim().to_string();
        }
        if let Some(kind) = update.kind {
            schedule.kind = kind;
        }
        if let Some(expr) = update.cron_expression {
            schedule.cron_expression = expr.trim().to_string();
        }
        if let Some(enabled) = update.enabled {
            schedule.enabled = enabled;
        }
        if let Some(max_retries) = update.max_retries {
            schedule.max_retries = max_retries;
        }
        if let Some(delay) = update.retry_delay_minutes {
            schedule.retry_delay_minutes = delay;
        }

        schedule.next_run_at = if schedule.enabled {
            next_occurrence(&schedule.cron_expression, now)?
        } else {
            None
        };
        schedule.updated_at = now;

        let dropped = {
            let mut state = self.state()?;
            let dropped = state.disarm(id, !schedule.enabled);
            if let Some(at) = schedule.next_run_at {
                state.arm(id, at);
            }
            dropped
        };
        self.fail_dropped(&mut schedule, dropped, "Schedule disabled", now)
            .await?;
        self.store.upsert_schedule(&schedule).await?;

        info!(schedule_id = %id, enabled = schedule.enabled, next_run = ?schedule.next_run_at, "Backup schedule updated");
        Ok(schedule)
    }

    /// Soft delete: the schedule is disabled and hidden, its history kept.
    pub async fn delete_schedule(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.bookkeeping.lock().await;
        let mut schedule = self.live_schedule(id).await?;

        let dropped = self.state()?.disarm(id, true);
        schedule.enabled = false;
        schedule.next_run_at = None;
        schedule.deleted_at = Some(now);
        schedule.updated_at = now;
        self.fail_dropped(&mut schedule, dropped, "Schedule deleted", now)
            .await?;
        self.store.upsert_schedule(&schedule).await?;

        info!(schedule_id = %id, "Backup schedule deleted");
        Ok(())
    }

    /// Mark jobs whose queued retries were cancelled as terminally failed.
    async fn fail_dropped(
        &self,
        schedule: &mut Schedule,
        job_ids: Vec<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for job_id in job_ids {
            let Some(mut job) = self.store.get_job(job_id).await? else {
                continue;
            };
            if job.status != JobStatus::Retrying {
                continue;
            }
            let error = format!(
                "{}; last error: {}",
                reason,
                job.last_error.as_deref().unwrap_or("unknown")
            );
            job.fail(error, Vec::new(), now);
            schedule.record_failure(now);
            self.store.upsert_job(&job).await?;
            metrics_service::record_job_finished(&job.kind.to_string(), false);
            info!(job_id = %job_id, schedule_id = %schedule.id, "Queued retry cancelled");
        }
        Ok(())
    }

    async fn live_schedule(&self, id: Uuid) -> Result<Schedule> {
        self.store
            .get_schedule(id)
            .await?
            .filter(|s| !s.is_deleted())
            .ok_or_else(|| AppError::NotFound(format!("Schedule {} not found", id)))
    }

    pub async fn get_schedule(&self, id: Uuid) -> Result<Schedule> {
        self.live_schedule(id).await
    }

    pub async fn list_schedules(&self, include_deleted: bool) -> Result<Vec<Schedule>> {
        Ok(self
            .store
            .list_schedules()
            .await?
            .into_iter()
            .filter(|s| include_deleted || !s.is_deleted())
            .collect())
    }

    pub async fn list_jobs(&self, schedule_id: Option<Uuid>, limit: usize) -> Result<Vec<Job>> {
        self.store.list_jobs(schedule_id, limit).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))
    }

    async fn create_job(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<Job> {
        let job = Job::new(schedule.id, schedule.kind, schedule.max_attempts(), now);
        self.store.upsert_job(&job).await?;
        debug!(job_id = %job.id, schedule_id = %schedule.id, "Job created");
        Ok(job)
    }

    /// Manually run a schedule now and wait for the first attempt.
    ///
    /// Returns the job as it stands after that attempt: `success`,
    /// `retrying` (a retry is queued) or `failed`.
    pub async fn execute_job(&self, schedule_id: Uuid, now: DateTime<Utc>) -> Result<Job> {
        let schedule = self.live_schedule(schedule_id).await?;
        let job = self.create_job(&schedule, now).await?;
        self.run_attempt(job.id).await;
        self.get_job(job.id).await
    }

    /// Manually run a schedule in the background. Returns the pending job.
    pub async fn trigger(self: &Arc<Self>, schedule_id: Uuid, now: DateTime<Utc>) -> Result<Job> {
        let schedule = self.live_schedule(schedule_id).await?;
        let job = self.create_job(&schedule, now).await?;
        let this = self.clone();
        let job_id = job.id;
        tokio::spawn(async move { this.run_attempt(job_id).await });
        Ok(job)
    }

    /// Process every queue entry visible at `now`, running due attempts
    /// concurrently.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let visible = self.state()?.pop_visible(now);
        if visible.is_empty() {
            return Ok(TickReport::default());
        }

        let mut report = TickReport::default();
        let mut attempts = Vec::new();

        for entry in visible {
            match entry.item {
                WorkItem::Fire {
                    schedule_id,
                    generation,
                } => {
                    if self.state()?.armed.get(&schedule_id) != Some(&generation) {
                        continue;
                    }
                    match self.fire(schedule_id, generation, entry.visible_at, now).await {
                        Ok(Some(job_id)) => {
                            report.fired += 1;
                            attempts.push(job_id);
                        }
                        Ok(None) => {}
                        Err(e) => error!(schedule_id = %schedule_id, "Failed to fire schedule: {}", e),
                    }
                }
                WorkItem::Retry { job_id, .. } => {
                    report.retried += 1;
                    attempts.push(job_id);
                }
            }
        }

        join_all(attempts.into_iter().map(|job_id| self.run_attempt(job_id))).await;
        Ok(report)
    }

    /// Create the job for an occurrence and arm the next one.
    async fn fire(
        &self,
        schedule_id: Uuid,
        generation: u64,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let _guard = self.bookkeeping.lock().await;
        let Some(mut schedule) = self.store.get_schedule(schedule_id).await? else {
            self.state()?.armed.remove(&schedule_id);
            return Ok(None);
        };
        if !schedule.is_live() {
            self.state()?.armed.remove(&schedule_id);
            return Ok(None);
        }

        // Missed occurrences are skipped, not replayed.
        let after = scheduled_for.max(now);
        schedule.next_run_at = next_occurrence(&schedule.cron_expression, after)?;
        {
            let mut state = self.state()?;
            if state.armed.get(&schedule_id) == Some(&generation) {
                if let Some(at) = schedule.next_run_at {
                    state.push(
                        at,
                        WorkItem::Fire {
                            schedule_id,
                            generation,
                        },
                    );
                } else {
                    state.armed.remove(&schedule_id);
                }
            }
        }
        self.store.upsert_schedule(&schedule).await?;

        let job = self.create_job(&schedule, now).await?;
        info!(schedule_id = %schedule_id, job_id = %job.id, name = %schedule.name, "Scheduled backup fired");
        Ok(Some(job.id))
    }

    /// Run one attempt of a job and apply its outcome. Never returns an
    /// error: failures become job and schedule state.
    async fn run_attempt(&self, job_id: Uuid) {
        if let Err(e) = self.try_run_attempt(job_id).await {
            error!(job_id = %job_id, "Job bookkeeping failed: {}", e);
        }
    }

    async fn try_run_attempt(&self, job_id: Uuid) -> Result<()> {
        let token = CancellationToken::new();
        let mut job = {
            let _guard = self.bookkeeping.lock().await;
            let mut job = self.get_job(job_id).await?;
            if !job.start_attempt(Utc::now()) {
                debug!(job_id = %job_id, status = ?job.status, "Job not runnable, skipped");
                return Ok(());
            }
            self.store.upsert_job(&job).await?;
            self.state()?
                .running
                .insert(job_id, (job.schedule_id, token.clone()));
            job
        };

        info!(job_id = %job_id, attempt = job.attempt, max_attempts = job.max_attempts, kind = %job.kind, "Running backup attempt");

        let started = Instant::now();
        let outcome = self.backups.run_backup(job.kind, job.id, &token).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        self.state()?.running.remove(&job_id);

        let (artifact_ids, failure) = match outcome {
            Ok(artifacts) => {
                let ids = artifacts.iter().map(|a| a.id).collect::<Vec<_>>();
                let failure = artifacts
                    .iter()
                    .find(|a| a.status != ArtifactStatus::Success)
                    .map(|a| {
                        a.error
                            .clone()
                            .unwrap_or_else(|| format!("{} backup failed", a.kind))
                    });
                (ids, failure)
            }
            Err(e) => (Vec::new(), Some(e.to_string())),
        };

        let _guard = self.bookkeeping.lock().await;
        let at = Utc::now();
        let mut schedule = self
            .store
            .get_schedule(job.schedule_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Schedule {} not found", job.schedule_id)))?;
        let kind = job.kind.to_string();

        match failure {
            None => {
                job.succeed(artifact_ids, duration_ms, at);
                schedule.record_success(duration_ms, at);
                metrics_service::record_job_finished(&kind, true);
                info!(job_id = %job_id, attempt = job.attempt, duration_ms, "Backup job succeeded");
            }
            Some(error) if job.has_attempts_left() && schedule.is_live() => {
                let visible_at =
                    at + ChronoDuration::minutes(schedule.retry_delay_minutes as i64);
                job.schedule_retry(error.clone(), artifact_ids, at);
                self.state()?.push(
                    visible_at,
                    WorkItem::Retry {
                        job_id,
                        schedule_id: schedule.id,
                    },
                );
                metrics_service::record_job_retry(&kind);
                warn!(
                    job_id = %job_id,
                    attempt = job.attempt,
                    retry_at = %visible_at,
                    "Backup attempt failed, retry queued: {}",
                    error
                );
                self.store.upsert_job(&job).await?;
                return Ok(());
            }
            Some(error) => {
                error!(job_id = %job_id, attempt = job.attempt, "Backup job failed: {}", error);
                job.fail(error, artifact_ids, at);
                schedule.record_failure(at);
                metrics_service::record_job_finished(&kind, false);
            }
        }

        self.store.upsert_job(&job).await?;
        self.store.upsert_schedule(&schedule).await?;
        Ok(())
    }

    /// Drive `tick` on a fixed interval until `shutdown` fires. Each tick
    /// runs in its own task so long backups never delay the next one.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken, every: Duration) {
        let mut ticker = interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.tick(Utc::now()).await {
                            error!("Scheduler tick failed: {}", e);
                        }
                    });
                }
            }
        }

        if let Ok(state) = self.state() {
            for (_, token) in state.running.values() {
                token.cancel();
            }
        }
        info!("Backup scheduler stopped");
    }

    /// Number of retries currently queued, for tests and diagnostics.
    pub fn queued_retries(&self) -> usize {
        self.state()
            .map(|s| {
                s.queue
                    .iter()
                    .filter(|q| matches!(q.item, WorkItem::Retry { .. }))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Whether a schedule currently has an armed occurrence.
    pub fn is_armed(&self, schedule_id: Uuid) -> bool {
        self.state()
            .map(|s| s.armed.contains_key(&schedule_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_cron_accepts_five_fields() {
        assert!(parse_cron("0 2 * * *").is_ok());
        assert!(parse_cron("0 0 2 * * *").is_ok());
        assert!(matches!(
            parse_cron("every day"),
            Err(AppError::InvalidSchedule(_))
        ));
        assert!(matches!(
            parse_cron("99 2 * * *"),
            Err(AppError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_next_occurrence() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 3, 0, 0).unwrap();
        let next = next_occurrence("0 2 * * *", now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 5, 2, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_queue_pops_in_time_order() {
        let base = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let mut state = State::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        state.arm(a, base + ChronoDuration::minutes(10));
        state.arm(b, base + ChronoDuration::minutes(5));

        assert!(state.pop_visible(base).is_empty());
        let popped = state.pop_visible(base + ChronoDuration::minutes(10));
        let ids: Vec<_> = popped
            .iter()
            .map(|q| match q.item {
                WorkItem::Fire { schedule_id, .. } => schedule_id,
                WorkItem::Retry { job_id, .. } => job_id,
            })
            .collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[test]
    fn test_rearm_supersedes_previous_generation() {
        let base = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let mut state = State::default();
        let id = Uuid::new_v4();
        state.arm(id, base);
        let first = state.armed[&id];
        state.arm(id, base);
        assert_ne!(state.armed[&id], first);
        assert_eq!(state.armed.len(), 1);
    }

    #[test]
    fn test_disarm_drops_only_own_retries() {
        let base = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let mut state = State::default();
        let (mine, other) = (Uuid::new_v4(), Uuid::new_v4());
        let (job_a, job_b) = (Uuid::new_v4(), Uuid::new_v4());
        state.push(base, WorkItem::Retry { job_id: job_a, schedule_id: mine });
        state.push(base, WorkItem::Retry { job_id: job_b, schedule_id: other });
        let token = CancellationToken::new();
        state.running.insert(Uuid::new_v4(), (mine, token.clone()));

        let dropped = state.disarm(mine, true);
        assert_eq!(dropped, vec![job_a]);
        assert_eq!(state.queue.len(), 1);
        assert!(token.is_cancelled());
    }
}
