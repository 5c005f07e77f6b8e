//! `queue` crate — background task queue for long-running platform work.
//!
//! Work is submitted as a future and started in submission order by a single
//! dispatcher task. Every submission returns a [`JobHandle`] that can be
//! awaited for the result or dropped to let the job run detached.

pub mod error;
pub mod job;
pub mod worker;

pub use error::QueueError;
pub use job::{JobHandle, JobId};
pub use worker::{QueueConfig, TaskQueue};
