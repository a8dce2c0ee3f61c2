//! Post-completion notification.
//!
//! Runs once per release after it enters Done. Delivery failures are recorded
//! on the notification event and never touch the release status.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::comparison::{Classification, ComparisonResult};
use crate::models::notification::{
    Channel, Delivery, DeliveryOutcome, NotificationError, NotificationEvent, NotificationOutcome,
    TriggerReason,
};
use crate::models::release::Release;
use crate::models::task::ScreenSize;
use crate::services::backoff;
use crate::store::{ReleaseStore, StoreError};

/// How per-test results roll up into a success/failure verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomePolicy {
    /// Any difference or error fails the release.
    #[default]
    Strict,
    /// Only visual differences fail the release; errors are reported but tolerated.
    DifferencesOnly,
}

impl OutcomePolicy {
    pub fn evaluate(self, results: &[ComparisonResult]) -> TriggerReason {
        let failed = results.iter().any(|r| match r.classification {
            Classification::Same => false,
            Classification::Different => true,
            Classification::Error(_) => self == OutcomePolicy::Strict,
        });
        if failed {
            TriggerReason::Failure
        } else {
            TriggerReason::Success
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub outcome_policy: OutcomePolicy,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub public_base_url: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            outcome_policy: OutcomePolicy::Strict,
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            public_base_url: "http://localhost:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Payload POSTed to callback URLs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseSummary {
    pub candidate_id: Uuid,
    pub build: String,
    pub release: String,
    pub release_number: i32,
    pub reason: TriggerReason,
    pub results_url: String,
    pub same: usize,
    pub different: usize,
    pub errors: usize,
    pub tests: Vec<TestSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestSummary {
    pub name: String,
    pub size: ScreenSize,
    pub classification: Classification,
}

impl ReleaseSummary {
    pub fn build(release: &Release, results: &[ComparisonResult], reason: TriggerReason, base_url: &str) -> Self {
        let count = |label: &str| {
            results
                .iter()
                .filter(|r| r.classification.label() == label)
                .count()
        };
        Self {
            candidate_id: release.candidate_id,
            build: release.build_name.clone(),
            release: release.release_name.clone(),
            release_number: release.release_number,
            reason,
            results_url: results_url(base_url, release.candidate_id),
            same: count("same"),
            different: count("different"),
            errors: count("error"),
            tests: results
                .iter()
                .map(|r| TestSummary {
                    name: r.test_name.clone(),
                    size: r.size,
                    classification: r.classification,
                })
                .collect(),
        }
    }

    fn subject(&self) -> String {
        let verdict = match self.reason {
            TriggerReason::Success => "passed",
            TriggerReason::Failure => "failed",
        };
        format!(
            "[shotdiff] {} {} #{} {}",
            self.build, self.release, self.release_number, verdict
        )
    }

    fn body(&self) -> String {
        let mut body = format!(
            "{} same, {} different, {} errors\n\n",
            self.same, self.different, self.errors
        );
        for test in &self.tests {
            body.push_str(&format!(
                "{} @ {}: {}\n",
                test.name,
                test.size,
                test.classification.label()
            ));
        }
        body.push_str(&format!("\nResults: {}\n", self.results_url));
        body
    }
}

pub fn results_url(base_url: &str, candidate_id: Uuid) -> String {
    format!(
        "{}/api/v1/releases/{}",
        base_url.trim_end_matches('/'),
        candidate_id
    )
}

#[async_trait]
pub trait CallbackSender: Send + Sync {
    async fn post(&self, url: &str, summary: &ReleaseSummary) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError>;
}

pub struct HttpCallbackSender {
    http: Client,
}

impl HttpCallbackSender {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("shotdiff/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl CallbackSender for HttpCallbackSender {
    async fn post(&self, url: &str, summary: &ReleaseSummary) -> Result<(), TransportError> {
        let response = self
            .http
            .post(url)
            .json(summary)
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError(format!(
                "callback returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Sends mail through an HTTP relay accepting `{to, subject, body}`.
pub struct HttpMailer {
    http: Client,
    relay_url: Option<String>,
    token: Option<String>,
}

impl HttpMailer {
    pub fn new(relay_url: Option<String>, token: Option<String>, timeout: Duration) -> Result<Self, TransportError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(Self {
            http,
            relay_url,
            token,
        })
    }
}

#[derive(Serialize)]
struct MailMessage<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        let Some(relay_url) = &self.relay_url else {
            return Err(TransportError("mail relay not configured".to_string()));
        };
        let mut request = self
            .http
            .post(relay_url)
            .json(&MailMessage { to, subject, body });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError(format!("mail relay returned {}", response.status())));
        }
        Ok(())
    }
}

pub struct Notifier {
    store: Arc<dyn ReleaseStore>,
    callbacks: Arc<dyn CallbackSender>,
    mailer: Arc<dyn Mailer>,
    config: NotifierConfig,
}

impl Notifier {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        callbacks: Arc<dyn CallbackSender>,
        mailer: Arc<dyn Mailer>,
        config: NotifierConfig,
    ) -> Self {
        Self {
            store,
            callbacks,
            mailer,
            config,
        }
    }

    pub fn outcome_policy(&self) -> OutcomePolicy {
        self.config.outcome_policy
    }

    /// Notify about a finished release. A release is notified at most once;
    /// a second call returns the recorded event.
    pub async fn notify(&self, release: &Release) -> Result<NotificationEvent, StoreError> {
        if let Some(existing) = self.store.get_notification(release.candidate_id).await? {
            return Ok(existing);
        }

        let results = self.store.list_comparisons(release.candidate_id).await?;
        let reason = self.config.outcome_policy.evaluate(&results);
        let summary = ReleaseSummary::build(release, &results, reason, &self.config.public_base_url);

        let mut deliveries = Vec::new();
        if release.config.notify_policy.should_notify(reason) {
            if let Some(url) = &release.callback_url {
                deliveries.push(self.deliver(Channel::Callback, url, &summary).await);
            }
            if let Some(address) = release.notify_address() {
                deliveries.push(self.deliver(Channel::Email, address, &summary).await);
            }
        }

        // Failed only when no channel got through; each delivery keeps its own result.
        let delivered = deliveries.iter().any(|d| d.outcome == DeliveryOutcome::Delivered);
        let first_error = deliveries.iter().find_map(|d| match &d.outcome {
            DeliveryOutcome::Failed { error } => Some(error.clone()),
            DeliveryOutcome::Delivered => None,
        });
        let outcome = match first_error {
            _ if deliveries.is_empty() => NotificationOutcome::Skipped,
            Some(error) if !delivered => NotificationOutcome::Failed { error },
            _ => NotificationOutcome::Delivered,
        };

        let event = NotificationEvent {
            candidate_id: release.candidate_id,
            reason,
            deliveries,
            outcome,
            created_at: Utc::now(),
        };
        self.store.save_notification(&event).await?;

        let status = match &event.outcome {
            NotificationOutcome::Delivered => "delivered",
            NotificationOutcome::Skipped => "skipped",
            NotificationOutcome::Failed { .. } => "failed",
        };
        metrics::counter!("notifications_total", "outcome" => status).increment(1);
        info!(
            candidate_id = %release.candidate_id,
            reason = %reason,
            outcome = status,
            attempts = event.total_attempts(),
            "Release notification processed"
        );
        Ok(event)
    }

    async fn deliver(&self, channel: Channel, target: &str, summary: &ReleaseSummary) -> Delivery {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let sent = match channel {
                Channel::Callback => self.callbacks.post(target, summary).await,
                Channel::Email => {
                    self.mailer
                        .send(target, &summary.subject(), &summary.body())
                        .await
                }
            };
            match sent {
                Ok(()) => {
                    return Delivery {
                        channel,
                        target: target.to_string(),
                        attempts: attempt,
                        outcome: DeliveryOutcome::Delivered,
                    }
                }
                Err(e) => {
                    warn!(
                        candidate_id = %summary.candidate_id,
                        channel = %channel,
                        attempt,
                        error = %e,
                        "Notification delivery failed"
                    );
                    last_error = e.0;
                    if attempt < max_attempts {
                        tokio::time::sleep(backoff::delay(
                            self.config.backoff_base,
                            self.config.backoff_max,
                            attempt,
                        ))
                        .await;
                    }
                }
            }
        }

        Delivery {
            channel,
            target: target.to_string(),
            attempts: max_attempts,
            outcome: DeliveryOutcome::Failed {
                error: NotificationError::TransportFailure {
                    attempts: max_attempts,
                    detail: last_error,
                },
            },
        }
    }
}
