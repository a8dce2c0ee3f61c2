//! Visual regression testing for web releases.
//!
//! A release lists page tests captured on two host variants at one or more
//! screen sizes. Captures run on a worker pool with per-host limits and
//! retries; each (test, size) pair is diffed as soon as both sides land, and a
//! completion barrier moves the release to done exactly once before notifying
//! its owner.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
pub mod store;
