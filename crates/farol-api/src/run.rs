// Application run lifecycle models

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one application run.
///
/// `Failed` is reachable from any non-terminal state on an unrecoverable
/// error from an external collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Terminated | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Starting => write!(f, "STARTING"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Stopping => write!(f, "STOPPING"),
            RunState::Terminated => write!(f, "TERMINATED"),
            RunState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Payload of a target's ephemeral liveness node in the run registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    pub host: String,
    pub started_at_ms: i64,
}

impl TargetInfo {
    pub fn new(target_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            host: host.into(),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Snapshot of one application run, owned by the controller.
#[derive(Clone, Debug)]
pub struct RunRecord {
    pub run_id: String,
    pub state: RunState,
    /// Union of every target ever observed in the run's registry.
    pub known_targets: HashSet<String>,
    /// Reason for the last fatal transition, if any.
    pub last_error: Option<String>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: RunState::Starting,
            known_targets: HashSet::new(),
            last_error: None,
        }
    }
}
