//! Startup and shutdown tasks owned by the hub controller

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::context::{ParticipantTable, RootRegistry};
use crate::core::config::{HubConfig, ParticipantConfig};
use crate::process::{ChildProcessSupervisor, LaunchOptions};
use crate::task::{Task, TaskState};

/// Launches one declared participant and records its endpoint
pub struct LaunchParticipantTask {
    participant: ParticipantConfig,
    config: Arc<HubConfig>,
    table: Arc<ParticipantTable>,
    log: Mutex<Vec<String>>,
}

impl LaunchParticipantTask {
    pub fn new(
        participant: ParticipantConfig,
        config: Arc<HubConfig>,
        table: Arc<ParticipantTable>,
    ) -> Self {
        Self {
            participant,
            config,
            table,
            log: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Task for LaunchParticipantTask {
    fn description(&self) -> Option<String> {
        Some(format!("Launching participant {}", self.participant.id))
    }

    async fn execute(&self, token: CancellationToken) -> TaskState {
        let options = LaunchOptions::for_participant(&self.participant, &self.config);
        let mut supervisor = ChildProcessSupervisor::launch(options);

        let outcome = tokio::select! {
            outcome = supervisor.info() => Some(outcome),
            _ = token.cancelled() => None,
        };

        match outcome {
            Some(Ok(info)) => {
                info!(
                    participant = %self.participant.id,
                    address = %info.address,
                    "Participant up"
                );
                self.table.insert(self.participant.id.clone(), info);
                TaskState::Completed
            }
            Some(Err(e)) => {
                warn!(
                    participant = %self.participant.id,
                    error = %e,
                    "Participant failed to start"
                );
                self.log
                    .lock()
                    .push(format!("Participant {}: {}", self.participant.id, e));
                // the launch owns the process, so a failed handshake must not leak it
                kill_quietly(&mut supervisor).await;
                TaskState::Error
            }
            None => {
                kill_quietly(&mut supervisor).await;
                TaskState::Cancelled
            }
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

async fn kill_quietly(supervisor: &mut ChildProcessSupervisor) {
    let process = tokio::time::timeout(Duration::from_secs(1), supervisor.process()).await;
    if let Ok(Ok(process)) = process {
        if let Err(e) = process.kill().await {
            warn!(pid = ?process.id(), error = %e, "Failed to kill participant");
        }
    }
}

/// Removes every user-created root context
pub struct RemoveRootsTask {
    roots: Arc<dyn RootRegistry>,
    log: Mutex<Vec<String>>,
}

impl RemoveRootsTask {
    pub fn new(roots: Arc<dyn RootRegistry>) -> Self {
        Self {
            roots,
            log: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Task for RemoveRootsTask {
    fn description(&self) -> Option<String> {
        Some("Removing user roots".to_string())
    }

    async fn execute(&self, _token: CancellationToken) -> TaskState {
        let mut failed = false;
        for root in self.roots.user_roots().await {
            if let Err(e) = self.roots.remove_root(&root).await {
                warn!(root = %root, error = %e, "Failed to remove root");
                self.log.lock().push(format!("Root {}: {}", root, e));
                failed = true;
            }
        }
        if failed {
            TaskState::Error
        } else {
            TaskState::Completed
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

/// Terminates every participant launched at startup
pub struct StopParticipantsTask {
    table: Arc<ParticipantTable>,
    log: Mutex<Vec<String>>,
}

impl StopParticipantsTask {
    pub fn new(table: Arc<ParticipantTable>) -> Self {
        Self {
            table,
            log: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Task for StopParticipantsTask {
    fn description(&self) -> Option<String> {
        Some("Stopping participants".to_string())
    }

    async fn execute(&self, _token: CancellationToken) -> TaskState {
        let ids: Vec<String> = self.table.iter().map(|e| e.key().clone()).collect();
        let mut failed = false;
        for id in ids {
            let Some((_, info)) = self.table.remove(&id) else {
                continue;
            };
            if let Err(e) = info.process.kill().await {
                warn!(participant = %id, error = %e, "Failed to stop participant");
                self.log.lock().push(format!("Participant {}: {}", id, e));
                failed = true;
            }
        }
        if failed {
            TaskState::Error
        } else {
            TaskState::Completed
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}
