//! Task - the unit of cancellable work
//!
//! A task performs its side effects only inside `execute`. The returned future
//! is the single-shot completion promise; `spawn_task` wraps it in a handle
//! that publishes the terminal state exactly once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Observable state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Error => "error",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Asynchronous, cancellable unit of work.
///
/// `execute` resolves to a terminal state. Implementations observe `token`
/// and, when it fires mid-flight, either finish applying their side effects or
/// roll them back before returning [`TaskState::Cancelled`].
#[async_trait]
pub trait Task: Send + Sync {
    /// Optional label used for progress reporting
    fn description(&self) -> Option<String> {
        None
    }

    async fn execute(&self, token: CancellationToken) -> TaskState;

    /// Warnings gathered during execution
    fn log(&self) -> Vec<String> {
        Vec::new()
    }
}

#[async_trait]
impl<T: Task + ?Sized> Task for Arc<T> {
    fn description(&self) -> Option<String> {
        (**self).description()
    }

    async fn execute(&self, token: CancellationToken) -> TaskState {
        (**self).execute(token).await
    }

    fn log(&self) -> Vec<String> {
        (**self).log()
    }
}

#[async_trait]
impl<T: Task + ?Sized> Task for Box<T> {
    fn description(&self) -> Option<String> {
        (**self).description()
    }

    async fn execute(&self, token: CancellationToken) -> TaskState {
        (**self).execute(token).await
    }

    fn log(&self) -> Vec<String> {
        (**self).log()
    }
}

/// Task backed by an async closure
pub struct FnTask<F> {
    description: Option<String>,
    func: F,
}

impl<F, Fut> FnTask<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = TaskState> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            description: None,
            func,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = TaskState> + Send + 'static,
{
    fn description(&self) -> Option<String> {
        self.description.clone()
    }

    async fn execute(&self, token: CancellationToken) -> TaskState {
        (self.func)(token).await
    }
}

/// Handle to a task running on the tokio runtime
#[derive(Clone)]
pub struct TaskHandle {
    description: Option<String>,
    state: watch::Receiver<TaskState>,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Request cancellation. Ignored once the task is terminal.
    pub fn cancel(&self) {
        if !self.state().is_terminal() {
            self.token.cancel();
        }
    }

    /// Wait for the terminal state
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            // the task panicked or was aborted before publishing
            Err(_) => TaskState::Error,
        };
        state
    }
}

/// Run `task` on the current tokio runtime and return its handle
pub fn spawn_task<T>(task: T) -> TaskHandle
where
    T: Task + 'static,
{
    let (tx, rx) = watch::channel(TaskState::Running);
    let token = CancellationToken::new();
    let description = task.description();
    let child = token.clone();

    tokio::spawn(async move {
        let state = match task.execute(child).await {
            TaskState::Running => {
                tracing::warn!("Task resolved without a terminal state, reporting error");
                TaskState::Error
            }
            state => state,
        };
        let _ = tx.send(state);
    });

    TaskHandle {
        description,
        state: rx,
        token,
    }
}
