use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::notification::TriggerReason;
use crate::models::submission::TestSpec;

/// When a build wants to hear about finished releases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotifyPolicy {
    OnSuccess,
    #[default]
    OnFailure,
    #[serde(alias = "always")]
    #[strum(to_string = "both", serialize = "always")]
    Both,
    #[serde(rename = "none", alias = "never")]
    #[strum(to_string = "none", serialize = "never")]
    Disabled,
}

impl NotifyPolicy {
    pub fn should_notify(self, reason: TriggerReason) -> bool {
        match self {
            NotifyPolicy::Both => true,
            NotifyPolicy::Disabled => false,
            NotifyPolicy::OnSuccess => reason == TriggerReason::Success,
            NotifyPolicy::OnFailure => reason == TriggerReason::Failure,
        }
    }
}

/// Operator-managed build settings. Releases snapshot this at submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// CSS injected into every page before capture.
    #[serde(default)]
    pub inject_css: Option<String>,

    /// Selectors masked in every test of this build.
    #[serde(default)]
    pub ignore_selectors: Vec<String>,

    #[serde(default)]
    pub notify_email: Option<String>,

    #[serde(default)]
    pub notify_policy: NotifyPolicy,

    /// Pro builds keep their screenshots past the retention window.
    #[serde(default)]
    pub pro: bool,

    /// Tests submitted when a source-control push arrives for this build.
    #[serde(default)]
    pub push_tests: Vec<TestSpec>,
}

/// A named project whose releases are compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub name: String,
    pub account: String,
    /// Hex SHA-256 of the API key issued to the owning account.
    pub api_key_hash: String,
    pub config: BuildConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Build {
    pub fn new(name: &str, account: &str, api_key: &str, config: BuildConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            account: account.to_string(),
            api_key_hash: hash_api_key(api_key),
            config,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn accepts_key(&self, api_key: &str) -> bool {
        hash_api_key(api_key) == self.api_key_hash
    }
}

pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_policy_matrix() {
        use TriggerReason::*;
        assert!(NotifyPolicy::Both.should_notify(Success));
        assert!(NotifyPolicy::Both.should_notify(Failure));
        assert!(NotifyPolicy::OnSuccess.should_notify(Success));
        assert!(!NotifyPolicy::OnSuccess.should_notify(Failure));
        assert!(NotifyPolicy::OnFailure.should_notify(Failure));
        assert!(!NotifyPolicy::OnFailure.should_notify(Success));
        assert!(!NotifyPolicy::Disabled.should_notify(Success));
        assert!(!NotifyPolicy::Disabled.should_notify(Failure));
    }

    #[test]
    fn test_notify_policy_wire_names() {
        assert_eq!(serde_json::to_value(NotifyPolicy::Disabled).unwrap(), "none");
        assert_eq!("none".parse::<NotifyPolicy>().unwrap(), NotifyPolicy::Disabled);
        assert_eq!("on_failure".parse::<NotifyPolicy>().unwrap(), NotifyPolicy::OnFailure);
        assert_eq!("never".parse::<NotifyPolicy>().unwrap(), NotifyPolicy::Disabled);
        let always: NotifyPolicy = serde_json::from_str("\"always\"").unwrap();
        assert_eq!(always, NotifyPolicy::Both);
        assert_eq!(NotifyPolicy::Both.to_string(), "both");
    }

    #[test]
    fn test_api_key_check() {
        let build = Build::new("site", "acme", "secret-key", BuildConfig::default());
        assert!(build.accepts_key("secret-key"));
        assert!(!build.accepts_key("secret-key2"));
        assert_ne!(build.api_key_hash, "secret-key");
    }
}
