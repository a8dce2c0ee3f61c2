//! Builds and submissions shared by the pipeline tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use shotdiff::models::build::{Build, BuildConfig, NotifyPolicy};
use shotdiff::models::submission::{SubmitRelease, TestSpec};
use shotdiff::models::task::ScreenSize;

pub const PROD: &str = "https://prod.example.com";
pub const STAGING: &str = "https://staging.example.com";
pub const API_KEY: &str = "fixture-api-key-0001";
pub const CALLBACK_URL: &str = "https://ci.example.com/hooks/shotdiff";

pub fn build(name: &str, pro: bool, notify_policy: NotifyPolicy) -> Build {
    let config = BuildConfig {
        pro,
        notify_policy,
        ..BuildConfig::default()
    };
    Build::new(name, "acme", API_KEY, config)
}

/// A test comparing `path` on production against staging at one viewport.
pub fn page(name: &str, path: &str) -> TestSpec {
    TestSpec {
        name: name.to_string(),
        url: path.to_string(),
        host_a: PROD.to_string(),
        host_b: STAGING.to_string(),
        setup_code: None,
        auth: None,
        headers: BTreeMap::new(),
        mask_selectors: vec![],
        sizes: vec![ScreenSize::new(1024, 768)],
        user_agent: None,
    }
}

pub fn submission(build: &str, release: &str, tests: Vec<TestSpec>) -> SubmitRelease {
    SubmitRelease {
        build: build.to_string(),
        release: release.to_string(),
        api_key: API_KEY.to_string(),
        setup_code: None,
        callback_url: Some(CALLBACK_URL.to_string()),
        notify_email: None,
        tests,
    }
}

/// Home page and pricing page, one size each: four capture tasks.
pub fn two_page_submission(build: &str, release: &str) -> SubmitRelease {
    submission(build, release, vec![page("home", "/"), page("pricing", "/pricing")])
}

pub fn url(host: &str, path: &str) -> String {
    format!("{}{}", host, path)
}
