//! Wires the release pipeline together from its external collaborators.

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db::PgStore;
use crate::services::aggregator::ComparisonAggregator;
use crate::services::capture::{CaptureClient, CaptureFailure, HttpCaptureClient};
use crate::services::dispatcher::{Dispatcher, DispatcherConfig};
use crate::services::encryption::{EncryptionError, EncryptionService};
use crate::services::notifier::{
    CallbackSender, HttpCallbackSender, HttpMailer, Mailer, Notifier, NotifierConfig, TransportError,
};
use crate::services::queue::{QueueError, RedisTaskQueue, TaskQueue};
use crate::services::releases::ReleaseService;
use crate::services::status::StatusService;
use crate::services::storage::{BlobStore, R2Client, SealedBlobStore, StorageError};
use crate::services::sweeper::{RetentionConfig, RetentionSweeper};
use crate::services::tracker::CompletionTracker;
use crate::store::ReleaseStore;

/// External systems the pipeline talks to.
pub struct Collaborators {
    pub store: Arc<dyn ReleaseStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub capture: Arc<dyn CaptureClient>,
    pub callbacks: Arc<dyn CallbackSender>,
    pub mailer: Arc<dyn Mailer>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub dispatcher: DispatcherConfig,
    pub notifier: NotifierConfig,
    pub retention: RetentionConfig,
    pub comparison_tolerance: f64,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            dispatcher: config.dispatcher(),
            notifier: config.notifier(),
            retention: config.retention(),
            comparison_tolerance: config.comparison_tolerance,
        }
    }

    pub fn public_base_url(&self) -> &str {
        &self.notifier.public_base_url
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("blob storage: {0}")]
    Storage(#[from] StorageError),

    #[error("blob encryption: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("task queue: {0}")]
    Queue(#[from] QueueError),

    #[error("capture client: {0}")]
    Capture(#[from] CaptureFailure),

    #[error("notification transport: {0}")]
    Transport(#[from] TransportError),
}

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Pipeline {
    pub store: Arc<dyn ReleaseStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub tracker: Arc<CompletionTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub sweeper: Arc<RetentionSweeper>,
    pub releases: Arc<ReleaseService>,
    pub status: Arc<StatusService>,
}

impl Pipeline {
    /// Production wiring: PostgreSQL, R2 (optionally sealed), Redis and the
    /// HTTP capture, callback and mail clients.
    pub fn connect(config: &AppConfig, pool: PgPool) -> Result<Self, StartupError> {
        let r2 = R2Client::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
        )?;
        let blobs: Arc<dyn BlobStore> = match &config.encryption_key {
            Some(key) => {
                tracing::info!("Sealing blobs at rest with AES-256-GCM");
                Arc::new(SealedBlobStore::new(Arc::new(r2), EncryptionService::new(key)?))
            }
            None => Arc::new(r2),
        };

        let collaborators = Collaborators {
            store: Arc::new(PgStore::new(pool)),
            blobs,
            queue: Arc::new(RedisTaskQueue::new(&config.redis_url)?),
            capture: Arc::new(HttpCaptureClient::new(
                &config.capture_service_url,
                config.capture_api_token.clone(),
                config.capture_timeout(),
            )?),
            callbacks: Arc::new(HttpCallbackSender::new(NOTIFY_TIMEOUT)?),
            mailer: Arc::new(HttpMailer::new(
                config.mail_relay_url.clone(),
                config.mail_relay_token.clone(),
                NOTIFY_TIMEOUT,
            )?),
        };
        Ok(Self::new(collaborators, PipelineSettings::from_config(config)))
    }

    pub fn new(collaborators: Collaborators, settings: PipelineSettings) -> Self {
        let Collaborators {
            store,
            blobs,
            queue,
            capture,
            callbacks,
            mailer,
        } = collaborators;
        let public_base_url = settings.public_base_url().to_string();

        let aggregator = Arc::new(ComparisonAggregator::new(
            store.clone(),
            blobs.clone(),
            settings.comparison_tolerance,
        ));
        let notifier = Arc::new(Notifier::new(store.clone(), callbacks, mailer, settings.notifier));
        let tracker = Arc::new(CompletionTracker::new(store.clone(), aggregator, notifier));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            capture,
            blobs.clone(),
            tracker.clone(),
            settings.dispatcher,
        ));
        let sweeper = Arc::new(RetentionSweeper::new(store.clone(), blobs.clone(), settings.retention));
        let releases = Arc::new(ReleaseService::new(
            store.clone(),
            queue.clone(),
            tracker.clone(),
            public_base_url,
        ));
        let status = Arc::new(StatusService::new(store.clone()));

        Self {
            store,
            blobs,
            queue,
            tracker,
            dispatcher,
            sweeper,
            releases,
            status,
        }
    }
}
