//! Sequential task runner
//!
//! Runs an ordered list of tasks strictly one at a time. The runner is itself a
//! [`Task`], so runners nest: the hub startup sequence is a runner that the
//! project pipeline schedules as the first task of its own runner.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::task::{Task, TaskState};

/// Progress update emitted before each task starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Description of the task about to run
    pub description: Option<String>,
    /// Tasks left to run, including this one
    pub remaining: usize,
    /// Tasks in the run
    pub total: usize,
}

/// What the runner does after a task reports [`TaskState::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Proceed,
    Abort,
}

/// Hooks invoked around task execution
///
/// Hooks observe the run; the only decision they take part in is whether to
/// keep going after a task error.
#[async_trait]
pub trait RunnerHooks: Send + Sync {
    /// Called immediately before the first task
    async fn before_execute(&self, _total: usize) {}

    /// Called before each task
    async fn before_task(&self, _description: Option<&str>, _remaining: usize) {}

    /// Called after each task with the warnings it logged
    async fn after_task(&self, _description: Option<&str>, _state: TaskState, _log: &[String]) {}

    /// Decide whether to keep running after a task error
    async fn on_task_error(&self, _description: Option<&str>) -> Continuation {
        Continuation::Proceed
    }

    /// Called once after the last task with the aggregated warnings
    async fn after_execute(&self, _state: TaskState, _log: &[String]) {}
}

/// Composite hook that chains multiple hooks
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Arc<dyn RunnerHooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add_hook(&mut self, hook: Arc<dyn RunnerHooks>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl RunnerHooks for CompositeHooks {
    async fn before_execute(&self, total: usize) {
        for hook in &self.hooks {
            hook.before_execute(total).await;
        }
    }

    async fn before_task(&self, description: Option<&str>, remaining: usize) {
        for hook in &self.hooks {
            hook.before_task(description, remaining).await;
        }
    }

    async fn after_task(&self, description: Option<&str>, state: TaskState, log: &[String]) {
        for hook in &self.hooks {
            hook.after_task(description, state, log).await;
        }
    }

    /// Any hook voting to abort wins
    async fn on_task_error(&self, description: Option<&str>) -> Continuation {
        let mut decision = Continuation::Proceed;
        for hook in &self.hooks {
            if hook.on_task_error(description).await == Continuation::Abort {
                decision = Continuation::Abort;
            }
        }
        decision
    }

    async fn after_execute(&self, state: TaskState, log: &[String]) {
        for hook in &self.hooks {
            hook.after_execute(state, log).await;
        }
    }
}

/// Logs task boundaries through `tracing`
pub struct LoggingHooks {
    name: String,
}

impl LoggingHooks {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl RunnerHooks for LoggingHooks {
    async fn before_execute(&self, total: usize) {
        tracing::debug!(runner = %self.name, total, "Runner starting");
    }

    async fn before_task(&self, description: Option<&str>, remaining: usize) {
        tracing::debug!(
            runner = %self.name,
            task = description.unwrap_or("<unnamed>"),
            remaining,
            "Task starting"
        );
    }

    async fn after_task(&self, description: Option<&str>, state: TaskState, log: &[String]) {
        let task = description.unwrap_or("<unnamed>");
        match state {
            TaskState::Error => {
                tracing::warn!(runner = %self.name, task, warnings = log.len(), "Task failed")
            }
            _ => tracing::debug!(
                runner = %self.name,
                task,
                %state,
                warnings = log.len(),
                "Task finished"
            ),
        }
    }

    async fn after_execute(&self, state: TaskState, log: &[String]) {
        tracing::info!(runner = %self.name, %state, warnings = log.len(), "Runner finished");
    }
}

/// Hook that stops the run at the first task error
pub struct AbortOnError;

#[async_trait]
impl RunnerHooks for AbortOnError {
    async fn on_task_error(&self, _description: Option<&str>) -> Continuation {
        Continuation::Abort
    }
}

/// Runs tasks one at a time in list order
pub struct SequentialTaskRunner {
    description: Option<String>,
    tasks: Mutex<VecDeque<Box<dyn Task>>>,
    hooks: CompositeHooks,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    log: Mutex<Vec<String>>,
}

impl SequentialTaskRunner {
    pub fn new(tasks: Vec<Box<dyn Task>>) -> Self {
        Self {
            description: None,
            tasks: Mutex::new(tasks.into()),
            hooks: CompositeHooks::new(),
            progress: None,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn RunnerHooks>) -> Self {
        self.hooks.add_hook(hook);
        self
    }

    /// Send a [`ProgressEvent`] before each task
    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn push(&mut self, task: Box<dyn Task>) {
        self.tasks.get_mut().push_back(task);
    }

    /// Tasks not yet started
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptions of the pending tasks, in run order
    pub fn descriptions(&self) -> Vec<Option<String>> {
        self.tasks.lock().iter().map(|t| t.description()).collect()
    }

    fn pop(&self) -> Option<Box<dyn Task>> {
        self.tasks.lock().pop_front()
    }
}

#[async_trait]
impl Task for SequentialTaskRunner {
    fn description(&self) -> Option<String> {
        self.description.clone()
    }

    async fn execute(&self, token: CancellationToken) -> TaskState {
        let total = self.len();
        self.hooks.before_execute(total).await;

        let mut outcome = TaskState::Completed;
        let mut started = 0usize;

        loop {
            // cancellation is honoured between tasks only
            if token.is_cancelled() {
                outcome = TaskState::Cancelled;
                break;
            }
            let Some(task) = self.pop() else {
                break;
            };

            let remaining = total.saturating_sub(started);
            started += 1;
            let description = task.description();

            if let Some(progress) = &self.progress {
                let _ = progress.send(ProgressEvent {
                    description: description.clone(),
                    remaining,
                    total,
                });
            }
            self.hooks.before_task(description.as_deref(), remaining).await;

            let state = match task.execute(token.child_token()).await {
                TaskState::Running => {
                    tracing::warn!(
                        task = description.as_deref().unwrap_or("<unnamed>"),
                        "Task resolved without a terminal state, treating as error"
                    );
                    TaskState::Error
                }
                state => state,
            };

            let task_log = task.log();
            self.hooks
                .after_task(description.as_deref(), state, &task_log)
                .await;
            self.log.lock().extend(task_log);

            match state {
                TaskState::Completed | TaskState::Running => {}
                TaskState::Error => {
                    let label = description.as_deref().unwrap_or("task");
                    match self.hooks.on_task_error(description.as_deref()).await {
                        Continuation::Proceed => {
                            self.log.lock().push(format!("{} failed", label));
                        }
                        Continuation::Abort => {
                            outcome = TaskState::Error;
                            break;
                        }
                    }
                }
                TaskState::Cancelled => {
                    outcome = TaskState::Cancelled;
                    break;
                }
            }
        }

        // tasks left behind by an abort are dropped without running
        let skipped = {
            let mut tasks = self.tasks.lock();
            let n = tasks.len();
            tasks.clear();
            n
        };
        if skipped > 0 {
            tracing::debug!(skipped, %outcome, "Runner stopped before all tasks ran");
        }

        let log = self.log.lock().clone();
        self.hooks.after_execute(outcome, &log).await;
        outcome
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}
