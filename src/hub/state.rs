use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a hub instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HubState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl HubState {
    /// Only a running hub can evaluate project elements
    pub fn is_active(self) -> bool {
        matches!(self, HubState::Running)
    }

    /// Starting and Stopping are in flight; the others are at rest
    pub fn is_transitional(self) -> bool {
        matches!(self, HubState::Starting | HubState::Stopping)
    }
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HubState::Stopped => "stopped",
            HubState::Starting => "starting",
            HubState::Running => "running",
            HubState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Events broadcast by the hub controller, in transition order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubEvent {
    StateChanged {
        from: HubState,
        to: HubState,
        /// Incremented on every entry into Starting
        session: u64,
    },
    /// A start or restart arrived while stopping; the hub restarts once stopped
    RestartScheduled,
    /// A stop arrived while stopping and cleared a pending restart
    RestartCancelled,
}
