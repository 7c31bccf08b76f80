pub mod backoff;
pub mod logging;
pub mod rate_limiter;
pub mod time;

pub use backoff::{retry_with_backoff, RetryPolicy};
pub use logging::init_tracing;
pub use rate_limiter::RateLimiter;
pub use time::*;
