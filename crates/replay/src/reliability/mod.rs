//! Reliability primitives
//!
//! Retry configuration shared by remote activity decisions and in-process
//! local activities.

mod retry;

pub(crate) use retry::{duration_millis, option_duration_millis};
pub use retry::{RetryPolicy, RetryPolicyError};
