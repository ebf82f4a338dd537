//! Small shared utilities

pub mod debounce;
pub mod throttle;

pub use debounce::Debouncer;
pub use throttle::LogThrottler;
