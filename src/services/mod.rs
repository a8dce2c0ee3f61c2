pub mod aggregator;
pub mod backoff;
pub mod capture;
pub mod comparator;
pub mod compiler;
pub mod dispatcher;
pub mod encryption;
pub mod notifier;
pub mod queue;
pub mod releases;
pub mod status;
pub mod storage;
pub mod sweeper;
pub mod tracker;
