//! The control loop: job discovery, claiming and lifecycle bookkeeping.

mod discovery;
mod job;
mod runner;

pub use discovery::{discover, DiscoveredJobs};
pub use job::{JobSpec, JobState};
pub use runner::Controller;
