use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::comparison::Rect;
use crate::models::release::BasicAuth;

/// Host environment a screenshot is taken against.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Variant {
    /// Baseline
    A,
    /// Candidate
    B,
}

impl Variant {
    pub const ALL: [Variant; 2] = [Variant::A, Variant::B];

    pub fn sibling(self) -> Self {
        match self {
            Variant::A => Variant::B,
            Variant::B => Variant::A,
        }
    }
}

/// Browser viewport used for one capture.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Validate,
)]
pub struct ScreenSize {
    #[garde(range(min = 1, max = 16384))]
    pub width: u32,

    #[garde(range(min = 1, max = 16384))]
    pub height: u32,
}

impl ScreenSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for ScreenSize {
    fn default() -> Self {
        Self::new(1024, 768)
    }
}

impl fmt::Display for ScreenSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Stable identifier of a capture task.
///
/// Derived from (build, release, test, variant, size) so that resubmitting the
/// same release yields the same ids and duplicate reports collapse in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn derive(build: &str, release: &str, test: &str, variant: Variant, size: ScreenSize) -> Self {
        let mut hasher = Sha256::new();
        for part in [
            build,
            release,
            test,
            variant.to_string().as_str(),
            size.to_string().as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    /// Wrap an id read back from storage or a queue payload.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a capture task. Transitions only move forward, except the
/// Retrying -> InFlight loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InFlight,
    Retrying,
    Finalized,
}

impl TaskStatus {
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, InFlight)
                | (InFlight, Retrying)
                | (Retrying, InFlight)
                | (Queued, Finalized)
                | (InFlight, Finalized)
                | (Retrying, Finalized)
        )
    }
}

/// Reference to a stored screenshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Blob storage key.
    pub key: String,
    /// Hex SHA-256 of the PNG bytes.
    pub sha256: String,
    pub width: u32,
    pub height: u32,
    /// Element rectangles the capture resolved for each requested mask selector.
    #[serde(default)]
    pub regions: BTreeMap<String, Vec<Rect>>,
}

/// Terminal failure of a capture task. Recorded, never fatal to the release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureError {
    #[error("capture failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("capture failed permanently: {detail}")]
    NonRetriable { detail: String },

    #[error("capture cancelled")]
    Cancelled,
}

/// What a finalized task produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Captured { image: ImageRef },
    Failed { error: CaptureError },
}

impl TaskOutcome {
    pub fn image(&self) -> Option<&ImageRef> {
        match self {
            TaskOutcome::Captured { image } => Some(image),
            TaskOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&CaptureError> {
        match self {
            TaskOutcome::Captured { .. } => None,
            TaskOutcome::Failed { error } => Some(error),
        }
    }
}

impl From<ImageRef> for TaskOutcome {
    fn from(image: ImageRef) -> Self {
        TaskOutcome::Captured { image }
    }
}

impl From<CaptureError> for TaskOutcome {
    fn from(error: CaptureError) -> Self {
        TaskOutcome::Failed { error }
    }
}

/// Everything the capture collaborator needs to take one screenshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub auth: Option<BasicAuth>,
    pub user_agent: Option<String>,
    pub size: ScreenSize,
    pub setup_code: Option<String>,
    pub inject_css: Option<String>,
    #[serde(default)]
    pub mask_selectors: Vec<String>,
}

/// One (test, variant, screen size) capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureTask {
    pub id: TaskId,
    pub candidate_id: Uuid,
    pub test_name: String,
    pub variant: Variant,
    pub size: ScreenSize,
    /// Host prefix the capture targets; concurrency is capped per host.
    pub host: String,
    pub request: CaptureRequest,
    pub attempts: u32,
    pub status: TaskStatus,
    pub outcome: Option<TaskOutcome>,
    pub updated_at: DateTime<Utc>,
}

impl CaptureTask {
    /// Id of the task capturing the same test and size on the other variant.
    pub fn sibling_id(&self, build: &str, release: &str) -> TaskId {
        TaskId::derive(build, release, &self.test_name, self.variant.sibling(), self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_is_stable() {
        let size = ScreenSize::new(1280, 800);
        let a = TaskId::derive("site", "r1", "home", Variant::A, size);
        let again = TaskId::derive("site", "r1", "home", Variant::A, size);
        assert_eq!(a, again);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_task_id_separates_fields() {
        let size = ScreenSize::default();
        let a = TaskId::derive("site", "r1", "home", Variant::A, size);
        let b = TaskId::derive("site", "r1", "home", Variant::B, size);
        let other_size = TaskId::derive("site", "r1", "home", Variant::A, ScreenSize::new(320, 480));
        // "ab" + "c" must not collide with "a" + "bc"
        let shifted_a = TaskId::derive("site", "ab", "c", Variant::A, size);
        let shifted_b = TaskId::derive("site", "a", "bc", Variant::A, size);
        assert_ne!(a, b);
        assert_ne!(a, other_size);
        assert_ne!(shifted_a, shifted_b);
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::InFlight));
        assert!(TaskStatus::InFlight.can_transition_to(TaskStatus::Retrying));
        assert!(TaskStatus::Retrying.can_transition_to(TaskStatus::InFlight));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Finalized));
        assert!(!TaskStatus::Finalized.can_transition_to(TaskStatus::InFlight));
        assert!(!TaskStatus::Finalized.can_transition_to(TaskStatus::Finalized));
        assert!(!TaskStatus::InFlight.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let outcome = TaskOutcome::from(CaptureError::Cancelled);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["error"]["kind"], "cancelled");
        let back: TaskOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }
}
