//! Access to the upstream content API.
//!
//! - [`RateLimiter`]: process-wide FIFO gate, N requests per rolling window
//! - [`UpstreamApi`] / [`HttpUpstream`]: authenticated JSON requests
//! - [`ApiCache`]: TTL cache over both, persisted in the database

mod cache;
mod limiter;
mod upstream;

pub use cache::{ApiCache, FetchOptions};
pub use limiter::{RateLimiter, RateLimiterConfig};
pub use upstream::{HttpUpstream, UpstreamApi, DEFAULT_UPSTREAM_URL};
