//! Grading orchestration: admission, the attempt pipeline and persistence.

pub mod orchestrator;
pub mod rate_limit;
pub mod state;

pub use orchestrator::Grader;
pub use rate_limit::{InFlightPermit, RateLimiter};
pub use state::{AttemptState, AttemptTracker};
