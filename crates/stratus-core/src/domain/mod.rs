//! Domain model: upload tasks, their status machine, and the retry policy.
//!
//! Nothing here touches storage, the filesystem or the clock; callers pass `now` in.

pub mod retry;
pub mod task;

pub use retry::{RetryDecision, RetryPolicy};
pub use task::{TaskStatus, UnknownStatus, UploadTask, path_key};
