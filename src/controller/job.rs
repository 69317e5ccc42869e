use serde::{Deserialize, Serialize};

/// Lifecycle of an analytical job, stored in the `state` field of its
/// catalog document.
///
/// The controller only picks up PENDING jobs, records RUNNING once the job's
/// lock is held, and leaves FINISHED or FAILED behind unless the catalog
/// itself became unreachable mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Finished,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Finished => write!(f, "FINISHED"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

/// An analytical job's catalog document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Query text, possibly containing `@source.table` references.
    pub sql: String,
    /// Single reference naming the table the result is written to.
    pub target: String,
    /// Treated as PENDING when the field is absent.
    #[serde(default)]
    pub state: JobState,
}

impl JobSpec {
    pub fn parse(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
