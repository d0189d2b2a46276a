//! Element handlers: the collaborators that actually evaluate project elements
//!
//! A handler is bound to exactly one element when the pipeline plans a run.
//! Handlers report failure through `anyhow::Result`; the pipeline turns that
//! into a continue/abort question.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::element::{ExecutionElement, ExecutionLevel};
use super::model::Project;

/// Executes one project element
#[async_trait]
pub trait ElementHandler: Send + Sync {
    /// Evaluate the element. Long evaluations should watch `token`.
    async fn process(&self, token: CancellationToken) -> Result<()>;

    /// Warnings gathered by the last `process` call
    fn warnings(&self) -> Vec<String> {
        Vec::new()
    }

    /// Transform a Line element's text when the script is written back
    fn rewrite(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Binds handlers to elements
pub trait HandlerFactory: Send + Sync {
    fn create(
        &self,
        project: &Project,
        level: ExecutionLevel,
        element: &ExecutionElement,
    ) -> Result<Arc<dyn ElementHandler>>;
}

/// The script-evaluation service elements are sent to
#[async_trait]
pub trait ScriptEvaluator: Send + Sync {
    /// Evaluate `source`, returning any warnings. `origin` names the file or
    /// the literal line for diagnostics.
    async fn evaluate(
        &self,
        source: &str,
        origin: &str,
        token: CancellationToken,
    ) -> Result<Vec<String>>;
}

/// Handler that reads File elements from disk and sends their contents, or
/// the literal text of Line elements, to a [`ScriptEvaluator`]
pub struct EvalHandler {
    element: ExecutionElement,
    evaluator: Arc<dyn ScriptEvaluator>,
    warnings: Mutex<Vec<String>>,
}

impl EvalHandler {
    pub fn new(element: ExecutionElement, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        Self {
            element,
            evaluator,
            warnings: Mutex::new(Vec::new()),
        }
    }

    async fn source(&self) -> Result<String> {
        match &self.element {
            ExecutionElement::File(path) => read_source(path).await,
            ExecutionElement::Line(text) => Ok(text.clone()),
        }
    }
}

async fn read_source(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

#[async_trait]
impl ElementHandler for EvalHandler {
    async fn process(&self, token: CancellationToken) -> Result<()> {
        let source = self.source().await?;
        let origin = self.element.to_string();
        let warnings = self.evaluator.evaluate(&source, &origin, token).await?;
        *self.warnings.lock() = warnings;
        Ok(())
    }

    fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }
}

/// Creates an [`EvalHandler`] per element, all sharing one evaluator
pub struct EvalHandlerFactory {
    evaluator: Arc<dyn ScriptEvaluator>,
}

impl EvalHandlerFactory {
    pub fn new(evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        Self { evaluator }
    }
}

impl HandlerFactory for EvalHandlerFactory {
    fn create(
        &self,
        _project: &Project,
        _level: ExecutionLevel,
        element: &ExecutionElement,
    ) -> Result<Arc<dyn ElementHandler>> {
        Ok(Arc::new(EvalHandler::new(element.clone(), self.evaluator.clone())))
    }
}
