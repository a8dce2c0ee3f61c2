use garde::Validate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::release::BasicAuth;
use crate::models::task::ScreenSize;

/// Body of `POST /api/v1/releases`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitRelease {
    #[garde(length(min = 1, max = 200))]
    pub build: String,

    #[garde(length(min = 1, max = 200))]
    pub release: String,

    #[garde(skip)]
    pub api_key: String,

    /// Prepended to every test's setup code.
    #[garde(skip)]
    #[serde(default)]
    pub setup_code: Option<String>,

    #[garde(url)]
    #[serde(default)]
    pub callback_url: Option<String>,

    #[garde(email)]
    #[serde(default)]
    pub notify_email: Option<String>,

    #[garde(length(min = 1), dive)]
    pub tests: Vec<TestSpec>,
}

/// One page test as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TestSpec {
    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[garde(length(min = 1))]
    pub url: String,

    #[garde(length(min = 1))]
    pub host_a: String,

    #[garde(length(min = 1))]
    pub host_b: String,

    #[garde(skip)]
    #[serde(default)]
    pub setup_code: Option<String>,

    #[garde(skip)]
    #[serde(default)]
    pub auth: Option<BasicAuth>,

    #[garde(skip)]
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[garde(skip)]
    #[serde(default)]
    pub mask_selectors: Vec<String>,

    /// Empty means the default viewport.
    #[garde(dive)]
    #[serde(default)]
    pub sizes: Vec<ScreenSize>,

    #[garde(skip)]
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Response after submitting a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitReleaseResponse {
    pub polling_id: Uuid,
    pub candidate_id: Uuid,
    pub results_url: String,
    /// False when an identical submission already created this candidate.
    pub created: bool,
}
