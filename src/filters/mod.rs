pub mod question;
pub mod rate_limiter;
