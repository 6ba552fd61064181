//! Per-client request throttling
//!
//! Two independent limiters, both keyed by client IP and both allowing a
//! client the first time it is seen:
//! - [`TokenBucketLimiter`] guards routes that end up executing probes.
//! - [`SlidingWindowLimiter`] throttles all inbound HTTP traffic.

pub mod sliding_window;
pub mod token_bucket;

pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::{TokenBucket, TokenBucketLimiter};
