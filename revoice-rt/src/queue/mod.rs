//! Priority-ordered job runtime

pub mod runtime;

pub use runtime::{
    JobContext, JobExecutor, JobSnapshot, ProgressHandle, QueueConfig, QueueRuntime,
};
