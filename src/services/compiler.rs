//! Expands a release submission into the immutable list of capture tasks.
//!
//! One task per (test, variant, screen size). Task ids are derived from the
//! build name, release name, test name, variant and size, so a resubmitted
//! release compiles to exactly the same ids.

use garde::Validate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use uuid::Uuid;

use crate::models::build::BuildConfig;
use crate::models::release::TestCase;
use crate::models::submission::{SubmitRelease, TestSpec};
use crate::models::task::{CaptureRequest, CaptureTask, ScreenSize, TaskId, TaskStatus, Variant};

/// A single offending field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

/// Every problem found in a submission, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("invalid submission ({} violations)", .violations.len())]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

/// A task before it is bound to a candidate id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub test_name: String,
    pub variant: Variant,
    pub size: ScreenSize,
    pub host: String,
    pub request: CaptureRequest,
}

/// Output of [`compile`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRelease {
    pub tests: Vec<TestCase>,
    pub tasks: Vec<TaskSpec>,
}

impl CompiledRelease {
    pub fn expected_count(&self) -> u32 {
        self.tasks.len() as u32
    }

    /// SHA-256 over the ordered task set. Two submissions with the same digest
    /// would capture exactly the same pages the same way.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for task in &self.tasks {
            hasher.update(task.id.as_str().as_bytes());
            // BTreeMap-backed fields keep this encoding stable.
            if let Ok(request) = serde_json::to_vec(&task.request) {
                hasher.update(&request);
            }
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn tasks_for(&self, candidate_id: Uuid) -> Vec<CaptureTask> {
        let now = chrono::Utc::now();
        self.tasks
            .iter()
            .map(|spec| CaptureTask {
                id: spec.id.clone(),
                candidate_id,
                test_name: spec.test_name.clone(),
                variant: spec.variant,
                size: spec.size,
                host: spec.host.clone(),
                request: spec.request.clone(),
                attempts: 0,
                status: TaskStatus::Queued,
                outcome: None,
                updated_at: now,
            })
            .collect()
    }
}

/// Validate a submission and expand it into capture tasks.
pub fn compile(
    submission: &SubmitRelease,
    config: &BuildConfig,
) -> Result<CompiledRelease, ValidationError> {
    let mut violations = Vec::new();

    if let Err(report) = submission.validate() {
        for (path, error) in report.iter() {
            violations.push(Violation {
                field: path.to_string(),
                message: error.to_string(),
            });
        }
    }

    let mut seen = HashSet::new();
    for (index, test) in submission.tests.iter().enumerate() {
        check_test(index, test, &mut seen, &mut violations);
    }

    if !violations.is_empty() {
        return Err(ValidationError { violations });
    }

    let mut tests = Vec::with_capacity(submission.tests.len());
    let mut tasks = Vec::new();

    for spec in &submission.tests {
        let test = to_test_case(spec, submission.setup_code.as_deref());
        let mut mask_selectors = config.ignore_selectors.clone();
        for selector in &test.mask_selectors {
            if !mask_selectors.contains(selector) {
                mask_selectors.push(selector.clone());
            }
        }

        for &size in &test.sizes {
            for variant in Variant::ALL {
                tasks.push(TaskSpec {
                    id: TaskId::derive(&submission.build, &submission.release, &test.name, variant, size),
                    test_name: test.name.clone(),
                    variant,
                    size,
                    host: test.host(variant).to_string(),
                    request: CaptureRequest {
                        url: test.url_for(variant),
                        headers: test.headers.clone(),
                        auth: test.auth.clone(),
                        user_agent: test.user_agent.clone(),
                        size,
                        setup_code: test.setup_code.clone(),
                        inject_css: config.inject_css.clone(),
                        mask_selectors: mask_selectors.clone(),
                    },
                });
            }
        }
        tests.push(test);
    }

    Ok(CompiledRelease { tests, tasks })
}

/// Cross-field rules the derive cannot express.
fn check_test(
    index: usize,
    test: &TestSpec,
    seen: &mut HashSet<String>,
    violations: &mut Vec<Violation>,
) {
    let field = |name: &str| format!("tests[{}].{}", index, name);

    if !test.name.trim().is_empty() && !seen.insert(test.name.clone()) {
        violations.push(Violation {
            field: field("name"),
            message: format!("duplicate test name `{}`", test.name),
        });
    }

    for (name, value) in [
        ("name", &test.name),
        ("url", &test.url),
        ("host_a", &test.host_a),
        ("host_b", &test.host_b),
    ] {
        if !value.is_empty() && value.trim().is_empty() {
            violations.push(Violation {
                field: field(name),
                message: "must not be blank".to_string(),
            });
        }
    }

    for (name, host) in [("host_a", &test.host_a), ("host_b", &test.host_b)] {
        let host = host.trim();
        if !host.is_empty() && !(host.starts_with("http://") || host.starts_with("https://")) {
            violations.push(Violation {
                field: field(name),
                message: "host prefix must start with http:// or https://".to_string(),
            });
        }
    }
}

fn to_test_case(spec: &TestSpec, common_setup: Option<&str>) -> TestCase {
    let setup_code = match (common_setup, spec.setup_code.as_deref()) {
        (Some(common), Some(own)) => Some(format!("{}\n{}", common, own)),
        (Some(common), None) => Some(common.to_string()),
        (None, own) => own.map(str::to_string),
    };

    // Repeated sizes would compile to repeated task ids.
    let mut sizes: Vec<ScreenSize> = Vec::with_capacity(spec.sizes.len().max(1));
    for size in &spec.sizes {
        if !sizes.contains(size) {
            sizes.push(*size);
        }
    }
    if sizes.is_empty() {
        sizes.push(ScreenSize::default());
    }

    TestCase {
        name: spec.name.clone(),
        url: spec.url.clone(),
        host_a: spec.host_a.trim().to_string(),
        host_b: spec.host_b.trim().to_string(),
        setup_code,
        auth: spec.auth.clone(),
        headers: spec.headers.clone(),
        mask_selectors: spec.mask_selectors.clone(),
        sizes,
        user_agent: spec.user_agent.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(name: &str) -> TestSpec {
        TestSpec {
            name: name.to_string(),
            url: "/pricing".to_string(),
            host_a: "https://www.example.com".to_string(),
            host_b: "https://staging.example.com".to_string(),
            setup_code: None,
            auth: None,
            headers: BTreeMap::new(),
            mask_selectors: vec![],
            sizes: vec![],
            user_agent: None,
        }
    }

    fn submission(tests: Vec<TestSpec>) -> SubmitRelease {
        SubmitRelease {
            build: "marketing-site".to_string(),
            release: "2024-06-01".to_string(),
            api_key: "key".to_string(),
            setup_code: None,
            callback_url: None,
            notify_email: None,
            tests,
        }
    }

    #[test]
    fn test_expected_count_is_two_per_test_and_size() {
        let mut wide = spec("pricing");
        wide.sizes = vec![ScreenSize::new(1280, 800), ScreenSize::new(375, 667)];
        let compiled = compile(&submission(vec![wide, spec("home")]), &BuildConfig::default()).unwrap();
        assert_eq!(compiled.expected_count(), 2 * 2 + 2);
        assert_eq!(compiled.tests.len(), 2);
    }

    #[test]
    fn test_default_screen_size_applied() {
        let compiled = compile(&submission(vec![spec("home")]), &BuildConfig::default()).unwrap();
        assert_eq!(compiled.tests[0].sizes, vec![ScreenSize::default()]);
        assert!(compiled.tasks.iter().all(|t| t.size == ScreenSize::default()));
    }

    #[test]
    fn test_task_ids_stable_across_resubmission() {
        let first = compile(&submission(vec![spec("home")]), &BuildConfig::default()).unwrap();
        let second = compile(&submission(vec![spec("home")]), &BuildConfig::default()).unwrap();
        let first_ids: Vec<_> = first.tasks.iter().map(|t| t.id.clone()).collect();
        let second_ids: Vec<_> = second.tasks.iter().map(|t| t.id.clone()).collect();
        assert_eq!(first_ids, second_ids);
        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn test_digest_changes_with_content() {
        let first = compile(&submission(vec![spec("home")]), &BuildConfig::default()).unwrap();
        let mut changed = spec("home");
        changed.url = "/pricing?v=2".to_string();
        let second = compile(&submission(vec![changed]), &BuildConfig::default()).unwrap();
        assert_ne!(first.digest(), second.digest());
    }

    #[test]
    fn test_all_violations_listed() {
        let mut missing_host = spec("home");
        missing_host.host_a = String::new();
        let mut missing_url = spec("about");
        missing_url.url = String::new();
        missing_url.host_b = String::new();

        let err = compile(&submission(vec![missing_host, missing_url]), &BuildConfig::default())
            .unwrap_err();

        assert_eq!(err.violations.len(), 3, "{:?}", err.violations);
        let fields = err.fields().join(",");
        assert!(fields.contains("host_a"));
        assert!(fields.contains("url"));
        assert!(fields.contains("host_b"));
    }

    #[test]
    fn test_empty_test_list_rejected() {
        let err = compile(&submission(vec![]), &BuildConfig::default()).unwrap_err();
        assert!(err.fields().iter().any(|f| f.contains("tests")));
    }

    #[test]
    fn test_duplicate_names_and_bad_scheme_rejected() {
        let mut bad_scheme = spec("home");
        bad_scheme.host_b = "staging.example.com".to_string();
        let err = compile(&submission(vec![spec("home"), bad_scheme]), &BuildConfig::default())
            .unwrap_err();
        let fields = err.fields();
        assert!(fields.contains(&"tests[1].name"));
        assert!(fields.contains(&"tests[1].host_b"));
    }

    #[test]
    fn test_zero_sized_screen_rejected() {
        let mut test = spec("home");
        test.sizes = vec![ScreenSize::new(0, 768)];
        let err = compile(&submission(vec![test]), &BuildConfig::default()).unwrap_err();
        assert!(err.fields().iter().any(|f| f.contains("width")));
    }

    #[test]
    fn test_build_config_flows_into_requests() {
        let config = BuildConfig {
            inject_css: Some("* { animation: none !important; }".to_string()),
            ignore_selectors: vec!["#ad-slot".to_string()],
            ..BuildConfig::default()
        };
        let mut test = spec("home");
        test.mask_selectors = vec![".timestamp".to_string(), "#ad-slot".to_string()];
        test.setup_code = Some("window.scrollTo(0, 0);".to_string());
        let mut sub = submission(vec![test]);
        sub.setup_code = Some("localStorage.clear();".to_string());

        let compiled = compile(&sub, &config).unwrap();
        let request = &compiled.tasks[0].request;
        assert_eq!(request.mask_selectors, vec!["#ad-slot", ".timestamp"]);
        assert_eq!(request.inject_css, config.inject_css);
        assert_eq!(
            request.setup_code.as_deref(),
            Some("localStorage.clear();\nwindow.scrollTo(0, 0);")
        );
        assert_eq!(request.url, "https://www.example.com/pricing");
        assert_eq!(compiled.tasks[1].request.url, "https://staging.example.com/pricing");
    }
}
