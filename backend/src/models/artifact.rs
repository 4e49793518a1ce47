//! Backup artifact metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::schedule::SourceKind;

/// Artifact status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    InProgress,
    Success,
    Failed,
}

/// Durable, checksummed output of one backup run.
///
/// Immutable once `status` is `Success`; a successful artifact always carries
/// a non-empty checksum and storage key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub job_id: Uuid,
    pub kind: SourceKind,
    pub created_at: DateTime<Utc>,
    /// Tables or file paths captured.
    pub sources: Vec<String>,
    pub size_bytes: u64,
    pub compressed_size_bytes: u64,
    pub compressed: bool,
    pub duration_ms: u64,
    pub status: ArtifactStatus,
    /// Storage key handed to the storage gateway.
    pub storage_key: String,
    /// Human-readable locator (`file://...`, `s3://...`).
    pub location: String,
    /// Hex-encoded SHA-256 of the stored bytes.
    pub checksum: String,
    pub error: Option<String>,
}

impl Artifact {
    pub fn is_restorable(&self) -> bool {
        self.status == ArtifactStatus::Success
            && !self.checksum.is_empty()
            && !self.storage_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_artifact_is_not_restorable() {
        let artifact = Artifact {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            kind: SourceKind::Database,
            created_at: Utc::now(),
            sources: vec![],
            size_bytes: 0,
            compressed_size_bytes: 0,
            compressed: false,
            duration_ms: 0,
            status: ArtifactStatus::Failed,
            storage_key: String::new(),
            location: String::new(),
            checksum: String::new(),
            error: Some("pg_dump exited with 1".into()),
        };
        assert!(!artifact.is_restorable());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ArtifactStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
