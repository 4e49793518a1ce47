//! Three-tier retention planning.
//!
//! Distances are calendar based, measured from the day of the cleanup run:
//! an artifact is kept if it was made on one of the last `daily` calendar
//! days (today counts as the first), or it falls on the
//! weekly anchor weekday at most `weekly` weeks back, or it falls on the
//! monthly anchor day at most `monthly` calendar months back.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use uuid::Uuid;

use crate::config::RetentionPolicy;
use crate::models::{Artifact, ArtifactStatus};

/// Why an artifact survives, mostly for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    Daily,
    Weekly,
    Monthly,
}

fn week_start(date: NaiveDate, anchor: Weekday) -> NaiveDate {
    let offset = (7 + date.weekday().num_days_from_monday() as i64
        - anchor.num_days_from_monday() as i64)
        % 7;
    date - Duration::days(offset)
}

fn month_index(date: NaiveDate) -> i64 {
    date.year() as i64 * 12 + date.month0() as i64
}

/// Tier that retains an artifact created on `created`, if any.
pub fn retention_tier(created: NaiveDate, today: NaiveDate, policy: &RetentionPolicy) -> Option<Keep> {
    let days_ago = (today - created).num_days();
    if days_ago < policy.daily as i64 {
        return Some(Keep::Daily);
    }

    if created.weekday() == policy.weekly_anchor {
        let weeks_ago = (week_start(today, policy.weekly_anchor)
            - week_start(created, policy.weekly_anchor))
        .num_days()
            / 7;
        if weeks_ago <= policy.weekly as i64 {
            return Some(Keep::Weekly);
        }
    }

    if created.day() == policy.monthly_anchor_day {
        let months_ago = month_index(today) - month_index(created);
        if months_ago <= policy.monthly as i64 {
            return Some(Keep::Monthly);
        }
    }

    None
}

/// Ids of artifacts the policy no longer retains. In-progress artifacts are
/// never selected.
pub fn plan_deletions(
    artifacts: &[Artifact],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<Uuid> {
    let today = now.date_naive();
    artifacts
        .iter()
        .filter(|a| a.status != ArtifactStatus::InProgress)
        .filter(|a| retention_tier(a.created_at.date_naive(), today, policy).is_none())
        .map(|a| a.id)
        .collect()
}
