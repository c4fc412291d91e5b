//! HTTP middleware for the Quill Server API

pub mod rate_limit;

pub use rate_limit::{add_rate_limit_headers, RateLimitLayer, RateLimitService};
