//! Hub lifecycle controller
//!
//! A four-state machine (Stopped, Starting, Running, Stopping) whose
//! transitions are carried out by two tasks: the startup task and the shutdown
//! task. Callers only request transitions; the state itself is mutated inside
//! those tasks, under one lock, and every transition is broadcast in order.
//!
//! ```text
//! Stopped --start--> Starting --startup done--> Running
//! Running --stop--> Stopping --shutdown done--> Stopped
//! Starting --stop--> (cancel startup) --> Stopped
//! Stopping --start/restart--> restart flag; Stopped --> Starting
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::HubContext;
use super::participant::{LaunchParticipantTask, RemoveRootsTask, StopParticipantsTask};
use super::state::{HubEvent, HubState};
use crate::core::config::HubConfig;
use crate::task::{LoggingHooks, SequentialTaskRunner, Task, TaskState};

struct Lifecycle {
    state: HubState,
    restart: bool,
    startup_token: Option<CancellationToken>,
    session: u64,
}

struct Inner {
    context: HubContext,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<HubState>,
    events: broadcast::Sender<HubEvent>,
}

/// Controls the lifecycle of one hub instance. Cheap to clone.
#[derive(Clone)]
pub struct HubController {
    inner: Arc<Inner>,
}

impl HubController {
    pub fn new(context: HubContext) -> Self {
        let (state_tx, _) = watch::channel(HubState::Stopped);
        let (events, _) = broadcast::channel(context.config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                context,
                lifecycle: Mutex::new(Lifecycle {
                    state: HubState::Stopped,
                    restart: false,
                    startup_token: None,
                    session: 0,
                }),
                state_tx,
                events,
            }),
        }
    }

    pub fn context(&self) -> &HubContext {
        &self.inner.context
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.context.config
    }

    pub fn state(&self) -> HubState {
        self.inner.lifecycle.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Number of times the hub has entered Starting
    pub fn session(&self) -> u64 {
        self.inner.lifecycle.lock().session
    }

    pub fn restart_pending(&self) -> bool {
        self.inner.lifecycle.lock().restart
    }

    /// Latest state; intermediate states may be skipped by slow readers
    pub fn watch(&self) -> watch::Receiver<HubState> {
        self.inner.state_tx.subscribe()
    }

    /// Every transition, in order
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the hub reaches `state`
    pub async fn wait_for(&self, state: HubState) -> HubState {
        let mut rx = self.watch();
        let reached = match rx.wait_for(|s| *s == state).await {
            Ok(s) => *s,
            Err(_) => self.state(),
        };
        reached
    }

    /// Task that brings the hub to Running; a no-op if it already is
    pub fn startup_task(&self) -> StartupTask {
        StartupTask {
            inner: self.inner.clone(),
        }
    }

    /// Task that brings the hub to Stopped; a no-op if it already is
    pub fn shutdown_task(&self) -> ShutdownTask {
        ShutdownTask {
            inner: self.inner.clone(),
        }
    }

    /// Request a start. No-op while Starting or Running.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        let current = lifecycle.state;
        match current {
            HubState::Stopped => {
                let (token, session) = self.inner.begin_startup(&mut lifecycle, None);
                drop(lifecycle);
                self.inner.spawn_startup(token, session);
            }
            HubState::Stopping => self.inner.schedule_restart(&mut lifecycle),
            HubState::Starting | HubState::Running => {
                debug!(state = %lifecycle.state, "Start ignored");
            }
        }
    }

    /// Request a stop. Cancels an in-flight startup; while Stopping, clears
    /// any pending restart.
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        let current = lifecycle.state;
        match current {
            HubState::Running => {
                self.inner.begin_shutdown(&mut lifecycle);
                drop(lifecycle);
                self.inner.spawn_shutdown();
            }
            HubState::Starting => {
                lifecycle.restart = false;
                if let Some(token) = &lifecycle.startup_token {
                    info!("Stop requested during startup, cancelling");
                    token.cancel();
                }
            }
            HubState::Stopping => self.inner.cancel_restart(&mut lifecycle),
            HubState::Stopped => {}
        }
    }

    /// Stop then start again. From Stopped this is `start()`.
    pub fn restart(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        let current = lifecycle.state;
        match current {
            HubState::Stopped => {
                drop(lifecycle);
                self.start();
            }
            HubState::Running => {
                lifecycle.restart = true;
                self.inner.begin_shutdown(&mut lifecycle);
                drop(lifecycle);
                self.inner.spawn_shutdown();
            }
            HubState::Stopping => self.inner.schedule_restart(&mut lifecycle),
            HubState::Starting => {}
        }
    }

    /// Run the startup task inline and wait for its outcome
    pub async fn ensure_running(&self) -> TaskState {
        self.startup_task().execute(CancellationToken::new()).await
    }

    /// Run the shutdown task inline and wait for its outcome
    pub async fn ensure_stopped(&self) -> TaskState {
        self.shutdown_task().execute(CancellationToken::new()).await
    }
}

impl Inner {
    fn transition(&self, lifecycle: &mut Lifecycle, to: HubState) {
        let from = lifecycle.state;
        if to == HubState::Starting {
            lifecycle.session += 1;
        }
        lifecycle.state = to;
        info!(%from, %to, session = lifecycle.session, "Hub state changed");
        // event first: a watcher woken by the new state sees the event too
        let _ = self.events.send(HubEvent::StateChanged {
            from,
            to,
            session: lifecycle.session,
        });
        self.state_tx.send_replace(to);
    }

    fn schedule_restart(&self, lifecycle: &mut Lifecycle) {
        if !lifecycle.restart {
            lifecycle.restart = true;
            debug!("Restart scheduled after shutdown");
            let _ = self.events.send(HubEvent::RestartScheduled);
        }
    }

    fn cancel_restart(&self, lifecycle: &mut Lifecycle) {
        if lifecycle.restart {
            lifecycle.restart = false;
            debug!("Pending restart cleared by stop");
            let _ = self.events.send(HubEvent::RestartCancelled);
        }
    }

    /// Stopped -> Starting. The startup token is a child of `parent` when given.
    fn begin_startup(
        &self,
        lifecycle: &mut Lifecycle,
        parent: Option<&CancellationToken>,
    ) -> (CancellationToken, u64) {
        let token = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        lifecycle.restart = false;
        lifecycle.startup_token = Some(token.clone());
        self.transition(lifecycle, HubState::Starting);
        (token, lifecycle.session)
    }

    fn begin_shutdown(&self, lifecycle: &mut Lifecycle) {
        self.transition(lifecycle, HubState::Stopping);
    }

    fn spawn_startup(self: &Arc<Self>, token: CancellationToken, session: u64) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.run_startup(token, session).await;
        });
    }

    fn spawn_shutdown(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.run_shutdown(CancellationToken::new()).await;
        });
    }

    fn startup_tasks(&self) -> Vec<Box<dyn Task>> {
        let context = &self.context;
        let mut tasks: Vec<Box<dyn Task>> = context
            .config
            .participants
            .iter()
            .map(|p| {
                Box::new(LaunchParticipantTask::new(
                    p.clone(),
                    context.config.clone(),
                    context.participants.clone(),
                )) as Box<dyn Task>
            })
            .collect();
        tasks.extend(context.backend.startup_tasks());
        tasks
    }

    fn shutdown_tasks(&self) -> Vec<Box<dyn Task>> {
        let context = &self.context;
        let mut tasks: Vec<Box<dyn Task>> =
            vec![Box::new(RemoveRootsTask::new(context.roots.clone()))];
        tasks.extend(context.backend.shutdown_tasks());
        tasks.push(Box::new(StopParticipantsTask::new(
            context.participants.clone(),
        )));
        tasks
    }

    /// Body of the Starting state. Ends in Running or Stopped.
    async fn run_startup(self: &Arc<Self>, token: CancellationToken, session: u64) -> TaskState {
        info!(session, "Hub starting");
        let runner = SequentialTaskRunner::new(self.startup_tasks())
            .with_description("Hub startup")
            .with_hook(Arc::new(LoggingHooks::new("hub-startup")));

        // task errors are skipped; only cancellation aborts the boot
        let outcome = runner.execute(token.clone()).await;
        for warning in runner.log() {
            warn!(session, "{}", warning);
        }

        if outcome == TaskState::Cancelled || token.is_cancelled() {
            self.release_participants().await;
            self.finish_startup(HubState::Stopped);
            info!(session, "Hub startup cancelled");
            return TaskState::Cancelled;
        }

        if let Err(e) = self.context.backend.initialize().await {
            error!(session, error = %e, "Hub initialization failed");
            self.release_participants().await;
            self.finish_startup(HubState::Stopped);
            return TaskState::Error;
        }

        if self.enter_running(&token) {
            return TaskState::Completed;
        }

        // stop arrived while initializing: undo it and skip Stopping
        if let Err(e) = self.context.backend.teardown().await {
            warn!(session, error = %e, "Teardown after cancelled startup failed");
        }
        self.release_participants().await;
        self.finish_startup(HubState::Stopped);
        TaskState::Cancelled
    }

    /// Move Starting to Running unless a stop cancelled `token`. The token is
    /// read under the lifecycle lock that `stop()` cancels it under.
    fn enter_running(&self, token: &CancellationToken) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if token.is_cancelled() || lifecycle.state != HubState::Starting {
            return false;
        }
        lifecycle.startup_token = None;
        self.transition(&mut lifecycle, HubState::Running);
        true
    }

    fn finish_startup(&self, to: HubState) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.startup_token = None;
        if lifecycle.state == HubState::Starting {
            self.transition(&mut lifecycle, to);
        }
    }

    async fn release_participants(&self) {
        if self.context.participants.is_empty() {
            return;
        }
        let task = StopParticipantsTask::new(self.context.participants.clone());
        task.execute(CancellationToken::new()).await;
    }

    /// Body of the Stopping state. Ends in Stopped, or re-enters Starting when
    /// a restart was requested meanwhile.
    async fn run_shutdown(self: &Arc<Self>, token: CancellationToken) -> TaskState {
        info!("Hub stopping");
        let runner = SequentialTaskRunner::new(self.shutdown_tasks())
            .with_description("Hub shutdown")
            .with_hook(Arc::new(LoggingHooks::new("hub-shutdown")));

        let outcome = runner.execute(token).await;
        for warning in runner.log() {
            warn!("{}", warning);
        }

        if outcome == TaskState::Cancelled {
            warn!("Hub shutdown cancelled, skipping teardown");
        } else if let Err(e) = self.context.backend.teardown().await {
            warn!(error = %e, "Hub teardown failed");
        }

        let restart = {
            let mut lifecycle = self.lifecycle.lock();
            self.transition(&mut lifecycle, HubState::Stopped);
            if lifecycle.restart {
                Some(self.begin_startup(&mut lifecycle, None))
            } else {
                None
            }
        };
        if let Some((token, session)) = restart {
            info!(session, "Restarting hub");
            self.spawn_startup(token, session);
        }

        if outcome == TaskState::Cancelled {
            TaskState::Cancelled
        } else {
            TaskState::Completed
        }
    }

    /// Wait until the hub comes to rest. Reads the locked state rather than
    /// the watch value so that Stopped followed by a restart is not mistaken
    /// for a resting hub.
    async fn settle(&self) -> HubState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = {
                let lifecycle = self.lifecycle.lock();
                match lifecycle.state {
                    HubState::Running => Some(HubState::Running),
                    HubState::Stopped if !lifecycle.restart => Some(HubState::Stopped),
                    _ => None,
                }
            };
            if let Some(state) = state {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.lifecycle.lock().state;
            }
        }
    }
}

/// Brings the hub to Running
pub struct StartupTask {
    inner: Arc<Inner>,
}

#[async_trait]
impl Task for StartupTask {
    fn description(&self) -> Option<String> {
        Some("Starting hub".to_string())
    }

    async fn execute(&self, token: CancellationToken) -> TaskState {
        let begun = {
            let mut lifecycle = self.inner.lifecycle.lock();
            let current = lifecycle.state;
            match current {
                HubState::Stopped => Some(self.inner.begin_startup(&mut lifecycle, Some(&token))),
                HubState::Running => return TaskState::Completed,
                HubState::Stopping => {
                    self.inner.schedule_restart(&mut lifecycle);
                    None
                }
                HubState::Starting => None,
            }
        };

        match begun {
            Some((startup_token, session)) => self.inner.run_startup(startup_token, session).await,
            None => {
                let settled = tokio::select! {
                    state = self.inner.settle() => state,
                    _ = token.cancelled() => return TaskState::Cancelled,
                };
                match settled {
                    HubState::Running => TaskState::Completed,
                    _ => TaskState::Error,
                }
            }
        }
    }
}

/// Brings the hub to Stopped
pub struct ShutdownTask {
    inner: Arc<Inner>,
}

#[async_trait]
impl Task for ShutdownTask {
    fn description(&self) -> Option<String> {
        Some("Stopping hub".to_string())
    }

    async fn execute(&self, token: CancellationToken) -> TaskState {
        loop {
            let begun = {
                let mut lifecycle = self.inner.lifecycle.lock();
                let current = lifecycle.state;
                match current {
                    HubState::Running => {
                        self.inner.begin_shutdown(&mut lifecycle);
                        true
                    }
                    HubState::Stopped => return TaskState::Completed,
                    HubState::Starting => {
                        lifecycle.restart = false;
                        if let Some(startup) = &lifecycle.startup_token {
                            startup.cancel();
                        }
                        false
                    }
                    HubState::Stopping => {
                        self.inner.cancel_restart(&mut lifecycle);
                        false
                    }
                }
            };

            if begun {
                return self.inner.run_shutdown(token).await;
            }
            // a startup that finished before seeing the cancel lands in
            // Running; go around and stop it
            if self.inner.settle().await == HubState::Stopped {
                return TaskState::Completed;
            }
        }
    }
}
