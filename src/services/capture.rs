use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::models::comparison::Rect;
use crate::models::task::CaptureRequest;

/// Raw output of one capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResponse {
    /// PNG bytes.
    pub image: Vec<u8>,
    /// Element rectangles resolved for each requested mask selector.
    pub regions: BTreeMap<String, Vec<Rect>>,
}

/// Failure of a single capture attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureFailure {
    #[error("capture service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("capture attempt timed out")]
    Timeout,

    #[error("capture transport error: {0}")]
    Transport(String),

    #[error("capture service response was malformed: {0}")]
    InvalidResponse(String),
}

impl CaptureFailure {
    /// 5xx, timeouts and transport errors are worth another attempt; 4xx and
    /// malformed responses are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            CaptureFailure::Status { status, .. } => *status >= 500,
            CaptureFailure::Timeout | CaptureFailure::Transport(_) => true,
            CaptureFailure::InvalidResponse(_) => false,
        }
    }
}

/// The rendering collaborator that turns a page into a screenshot.
#[async_trait]
pub trait CaptureClient: Send + Sync {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureResponse, CaptureFailure>;
}

/// Client for a remote headless-browser capture service.
pub struct HttpCaptureClient {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct CaptureCall<'a> {
    #[serde(flatten)]
    request: &'a CaptureRequest,
    format: &'static str,
}

#[derive(Deserialize)]
struct CaptureReply {
    /// Base64-encoded PNG.
    image: String,
    #[serde(default)]
    regions: BTreeMap<String, Vec<Rect>>,
}

impl HttpCaptureClient {
    pub fn new(endpoint: &str, api_token: Option<String>, timeout: Duration) -> Result<Self, CaptureFailure> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("shotdiff/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CaptureFailure::Transport(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl CaptureClient for HttpCaptureClient {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureResponse, CaptureFailure> {
        let mut call = self.http.post(&self.endpoint).json(&CaptureCall {
            request,
            format: "png",
        });
        if let Some(token) = &self.api_token {
            call = call.bearer_auth(token);
        }

        let response = call.send().await.map_err(|e| {
            if e.is_timeout() {
                CaptureFailure::Timeout
            } else {
                CaptureFailure::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(CaptureFailure::Status {
                status: status.as_u16(),
                body: truncate(body, 512),
            });
        }

        let reply: CaptureReply = response
            .json()
            .await
            .map_err(|e| CaptureFailure::InvalidResponse(e.to_string()))?;

        let image = base64::engine::general_purpose::STANDARD
            .decode(reply.image.as_bytes())
            .map_err(|e| CaptureFailure::InvalidResponse(e.to_string()))?;

        Ok(CaptureResponse {
            image,
            regions: reply.regions,
        })
    }
}

fn truncate(mut body: String, max: usize) -> String {
    if body.len() > max {
        let mut cut = max;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
