pub mod build;
pub mod comparison;
pub mod notification;
pub mod release;
pub mod submission;
pub mod task;
