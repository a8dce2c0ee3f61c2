use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::build::BuildConfig;
use crate::models::task::{ScreenSize, Variant};

/// Overall status of a release candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    Capturing,
    Comparing,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// A compiled page test. Immutable once its tasks exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    /// Path relative to the host prefixes.
    pub url: String,
    pub host_a: String,
    pub host_b: String,
    pub setup_code: Option<String>,
    pub auth: Option<BasicAuth>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub mask_selectors: Vec<String>,
    pub sizes: Vec<ScreenSize>,
    pub user_agent: Option<String>,
}

impl TestCase {
    pub fn host(&self, variant: Variant) -> &str {
        match variant {
            Variant::A => &self.host_a,
            Variant::B => &self.host_b,
        }
    }

    /// Absolute URL of this test on the given variant.
    pub fn url_for(&self, variant: Variant) -> String {
        let host = self.host(variant).trim_end_matches('/');
        let path = self.url.trim_start_matches('/');
        if path.is_empty() {
            format!("{}/", host)
        } else {
            format!("{}/{}", host, path)
        }
    }
}

/// One comparison run for a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub candidate_id: Uuid,
    pub build_id: Uuid,
    pub build_name: String,
    pub release_name: String,
    pub release_number: i32,
    /// Build config as it was at submission time.
    pub config: BuildConfig,
    pub tests: Vec<TestCase>,
    pub expected_count: u32,
    pub reported_count: u32,
    pub status: ReleaseStatus,
    /// SHA-256 over the compiled task set; equal digests mean an identical resubmission.
    pub spec_digest: String,
    pub callback_url: Option<String>,
    pub notify_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub swept_at: Option<DateTime<Utc>>,
}

impl Release {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    pub fn is_done(&self) -> bool {
        self.status == ReleaseStatus::Done
    }

    pub fn test(&self, name: &str) -> Option<&TestCase> {
        self.tests.iter().find(|t| t.name == name)
    }

    /// Selectors masked for a test: the test's own plus the build ignore-list.
    pub fn mask_selectors(&self, test: &TestCase) -> Vec<String> {
        let mut selectors = self.config.ignore_selectors.clone();
        for selector in &test.mask_selectors {
            if !selectors.contains(selector) {
                selectors.push(selector.clone());
            }
        }
        selectors
    }

    /// Release-level address overrides the build's notify email.
    pub fn notify_address(&self) -> Option<&str> {
        self.notify_email
            .as_deref()
            .or(self.config.notify_email.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_case() -> TestCase {
        TestCase {
            name: "home".to_string(),
            url: "/index.html".to_string(),
            host_a: "https://prod.example.com/".to_string(),
            host_b: "https://staging.example.com".to_string(),
            setup_code: None,
            auth: None,
            headers: BTreeMap::new(),
            mask_selectors: vec![".clock".to_string()],
            sizes: vec![ScreenSize::default()],
            user_agent: None,
        }
    }

    #[test]
    fn test_url_join_handles_slashes() {
        let test = test_case();
        assert_eq!(test.url_for(Variant::A), "https://prod.example.com/index.html");
        assert_eq!(test.url_for(Variant::B), "https://staging.example.com/index.html");
    }

    #[test]
    fn test_url_join_root_path() {
        let mut test = test_case();
        test.url = "/".to_string();
        assert_eq!(test.url_for(Variant::A), "https://prod.example.com/");
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        assert_eq!(ReleaseStatus::Capturing.to_string(), "capturing");
        assert_eq!("done".parse::<ReleaseStatus>().unwrap(), ReleaseStatus::Done);
    }
}
