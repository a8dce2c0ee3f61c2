use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Aggregate outcome that triggered a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerReason {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    Callback,
    Email,
}

/// Delivery failed on every attempt. Never affects the release status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationError {
    #[error("transport failure after {attempts} attempts: {detail}")]
    TransportFailure { attempts: u32, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Failed { error: NotificationError },
}

/// One channel's delivery record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub channel: Channel,
    pub target: String,
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotificationOutcome {
    Delivered,
    /// Policy did not ask for a notification, or there was nowhere to send it.
    Skipped,
    Failed { error: NotificationError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub candidate_id: Uuid,
    pub reason: TriggerReason,
    pub deliveries: Vec<Delivery>,
    pub outcome: NotificationOutcome,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn total_attempts(&self) -> u32 {
        self.deliveries.iter().map(|d| d.attempts).sum()
    }
}
