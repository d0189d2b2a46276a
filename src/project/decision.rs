//! External collaborators the pipeline asks and informs
//!
//! The pipeline never shows anything to a user itself. It asks a
//! [`ContinuationDecider`] whether to go on after a failed element and hands
//! warnings and errors to a [`Notifier`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::element::ExecutionLevel;

/// Answer to a continuation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Continue,
    Abort,
}

/// Question asked when an element fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueRequest {
    pub project: String,
    pub level: ExecutionLevel,
    /// "Continue building project?" or "Continue running project?"
    pub title: String,
    pub element: String,
    /// First lines of the error
    pub detail: String,
}

#[async_trait]
pub trait ContinuationDecider: Send + Sync {
    async fn decide(&self, request: &ContinueRequest) -> Decision;
}

/// Always gives the same answer
pub struct FixedDecision(pub Decision);

#[async_trait]
impl ContinuationDecider for FixedDecision {
    async fn decide(&self, request: &ContinueRequest) -> Decision {
        warn!(
            project = %request.project,
            level = %request.level,
            element = %request.element,
            decision = ?self.0,
            "{}",
            request.title
        );
        self.0
    }
}

/// Receives user-visible outcomes of a pipeline run
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Warnings of a whole run, delivered at most once per run
    async fn warnings(&self, project: &str, warnings: &[String]);

    /// A run was rejected or failed outright
    async fn error(&self, project: &str, message: &str);
}

/// Writes notifications to the log
#[derive(Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn warnings(&self, project: &str, warnings: &[String]) {
        warn!(
            project,
            count = warnings.len(),
            "Project run finished with warnings:\n{}",
            warnings.join("\n")
        );
    }

    async fn error(&self, project: &str, message: &str) {
        error!(project, "{}", message);
    }
}
