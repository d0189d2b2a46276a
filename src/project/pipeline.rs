//! Project execution pipeline
//!
//! Turns a project and a requested [`ExecutionLevel`] into the shortest task
//! list that gets the project there, then runs it on a
//! [`SequentialTaskRunner`]:
//!
//! 1. preflight: reject projects needing a newer environment;
//! 2. hub startup first if the hub is not running;
//! 3. Configure, then Build, then Run elements up to the requested level,
//!    skipping Configure/Build elements already scheduled this hub session.
//!
//! Element failures are turned into a continue/abort question. Warnings of
//! the whole run are reported once, at the end.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use super::decision::{
    ContinuationDecider, ContinueRequest, Decision, LoggingNotifier, Notifier,
};
use super::element::{ExecutionElement, ExecutionEntry, ExecutionLevel};
use super::handler::{ElementHandler, HandlerFactory};
use super::model::Project;
use super::script::serialize_script;
use crate::core::errors::{truncate_lines, HubError, Result};
use crate::hub::HubController;
use crate::process::StopHandler;
use crate::task::{
    AbortOnError, LoggingHooks, ProgressEvent, RunnerHooks, SequentialTaskRunner, Task, TaskState,
};

/// Identity of a scheduled element within a hub session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    directory: PathBuf,
    level: ExecutionLevel,
    index: usize,
    element: ExecutionElement,
}

impl EntryKey {
    fn new(
        project: &Project,
        level: ExecutionLevel,
        index: usize,
        element: &ExecutionElement,
    ) -> Self {
        Self {
            directory: project.directory.clone(),
            level,
            index,
            element: element.clone(),
        }
    }
}

/// Executed-handler memo, valid for one hub session
#[derive(Default)]
struct Memo {
    /// Hub session the memo belongs to; `None` until the hub it started is up
    session: Option<u64>,
    /// Bumped on every reset so plans from before it leave the memo alone
    generation: u64,
    executed: HashMap<EntryKey, Arc<dyn ElementHandler>>,
    active: BTreeSet<String>,
}

impl Memo {
    fn reset(&mut self, session: Option<u64>) {
        self.session = session;
        self.generation = self.generation.wrapping_add(1);
        self.executed.clear();
        self.active.clear();
    }
}

/// Tasks planned for one run, in execution order
///
/// Configure and Build elements stay marked as scheduled while the plan is
/// alive. Dropping the plan, run or not, releases those that never started.
pub struct ExecutionPlan {
    level: ExecutionLevel,
    tasks: Vec<Box<dyn Task>>,
    starts_hub: bool,
    scheduled: Vec<(EntryKey, Arc<AtomicBool>)>,
    memo: Weak<Mutex<Memo>>,
    generation: u64,
}

impl ExecutionPlan {
    pub fn level(&self) -> ExecutionLevel {
        self.level
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether the plan begins with the hub startup task
    pub fn starts_hub(&self) -> bool {
        self.starts_hub
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.tasks
            .iter()
            .map(|t| t.description().unwrap_or_default())
            .collect()
    }
}

impl Drop for ExecutionPlan {
    fn drop(&mut self) {
        let Some(memo) = self.memo.upgrade() else {
            return;
        };
        let mut memo = memo.lock();
        if memo.generation != self.generation {
            return;
        }
        for (key, started) in self.scheduled.drain(..) {
            if !started.load(Ordering::SeqCst) {
                memo.executed.remove(&key);
            }
        }
    }
}

/// Runs one element's handler and asks whether to go on when it fails
struct ElementTask {
    project: String,
    entry: ExecutionEntry,
    decider: Arc<dyn ContinuationDecider>,
    detail_lines: usize,
    started: Arc<AtomicBool>,
    log: Mutex<Vec<String>>,
}

#[async_trait]
impl Task for ElementTask {
    fn description(&self) -> Option<String> {
        Some(self.entry.description())
    }

    async fn execute(&self, token: CancellationToken) -> TaskState {
        self.started.store(true, Ordering::SeqCst);
        let outcome = self.entry.handler.process(token.clone()).await;
        self.log.lock().extend(self.entry.handler.warnings());

        let err = match outcome {
            Ok(()) => return TaskState::Completed,
            Err(err) => err,
        };
        if token.is_cancelled() {
            return TaskState::Cancelled;
        }

        let detail = truncate_lines(&format!("{:#}", err), self.detail_lines);
        let request = ContinueRequest {
            project: self.project.clone(),
            level: self.entry.level,
            title: self.entry.level.continue_title().to_string(),
            element: self.entry.element.to_string(),
            detail: detail.clone(),
        };
        let decision = self.entry_decision(&request).await;
        self.log
            .lock()
            .push(format!("{} failed: {}", self.entry.description(), detail));
        match decision {
            Decision::Continue => TaskState::Completed,
            Decision::Abort => TaskState::Error,
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl ElementTask {
    async fn entry_decision(&self, request: &ContinueRequest) -> Decision {
        let decision = self.decider.decide(request).await;
        info!(
            project = %self.project,
            level = %self.entry.level,
            element = %self.entry.element,
            ?decision,
            "Element failed"
        );
        decision
    }
}

/// Reports the aggregated warnings of a run once
struct WarningsHook {
    project: String,
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl RunnerHooks for WarningsHook {
    async fn after_execute(&self, _state: TaskState, log: &[String]) {
        if !log.is_empty() {
            self.notifier.warnings(&self.project, log).await;
        }
    }
}

/// Drives projects through Configure, Build and Run on one hub
pub struct ProjectPipeline {
    hub: HubController,
    handlers: Arc<dyn HandlerFactory>,
    decider: Arc<dyn ContinuationDecider>,
    notifier: Arc<dyn Notifier>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    memo: Arc<Mutex<Memo>>,
    run_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<CancellationToken>>,
}

impl ProjectPipeline {
    pub fn new(
        hub: HubController,
        handlers: Arc<dyn HandlerFactory>,
        decider: Arc<dyn ContinuationDecider>,
    ) -> Self {
        Self {
            hub,
            handlers,
            decider,
            notifier: Arc::new(LoggingNotifier),
            progress: None,
            memo: Arc::new(Mutex::new(Memo::default())),
            run_lock: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Send a [`ProgressEvent`] before each task of every run
    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn hub(&self) -> &HubController {
        &self.hub
    }

    /// Reject a project that needs a newer environment. Never touches the hub.
    pub fn preflight(&self, project: &Project) -> Result<()> {
        let supported = self.hub.config().supported_version;
        match project.required_version {
            Some(required) if required > supported => {
                Err(HubError::preflight(&project.name, required, supported))
            }
            _ => Ok(()),
        }
    }

    /// Plan the tasks that bring `project` to `level`
    ///
    /// Configure and Build elements in the plan count as scheduled while the
    /// plan is alive, and for the rest of the hub session once they start.
    pub fn plan(&self, project: &Project, level: ExecutionLevel) -> Result<ExecutionPlan> {
        let mut memo = self.memo.lock();
        let mut tasks: Vec<Box<dyn Task>> = Vec::new();

        let starts_hub = !self.hub.is_active();
        if starts_hub {
            memo.reset(None);
            tasks.push(Box::new(self.hub.startup_task()));
        } else {
            let session = self.hub.session();
            match memo.session {
                Some(s) if s == session => {}
                Some(s) => {
                    debug!(previous = s, session, "Hub restarted, clearing executed elements");
                    memo.reset(Some(session));
                }
                None => memo.session = Some(session),
            }
        }

        let detail_lines = self.hub.config().continue_detail_lines;
        let mut staged = Vec::new();
        let mut scheduled = Vec::new();
        for lvl in level.up_to() {
            for (index, element) in project.elements.get(lvl).iter().enumerate() {
                let key = EntryKey::new(project, lvl, index, element);
                if lvl.is_memoized() && memo.executed.contains_key(&key) {
                    continue;
                }
                let handler = self
                    .handlers
                    .create(project, lvl, element)
                    .map_err(|e| HubError::element(element, format!("{:#}", e)))?;
                let started = Arc::new(AtomicBool::new(false));
                if lvl.is_memoized() {
                    staged.push((key.clone(), handler.clone()));
                    scheduled.push((key, started.clone()));
                }
                tasks.push(Box::new(ElementTask {
                    project: project.name.clone(),
                    entry: ExecutionEntry::new(lvl, element.clone(), handler),
                    decider: self.decider.clone(),
                    detail_lines,
                    started,
                    log: Mutex::new(Vec::new()),
                }));
            }
        }
        memo.executed.extend(staged);

        debug!(project = %project.name, %level, tasks = tasks.len(), "Planned run");
        Ok(ExecutionPlan {
            level,
            tasks,
            starts_hub,
            scheduled,
            memo: Arc::downgrade(&self.memo),
            generation: memo.generation,
        })
    }

    /// Bring `project` to `level`
    ///
    /// Preflight and planning failures are returned as errors; everything
    /// after that is reported as the terminal state of the run.
    pub async fn execute(&self, project: &Project, level: ExecutionLevel) -> Result<TaskState> {
        let run_id = Uuid::new_v4();
        let span = info_span!("project_run", project = %project.name, %level, %run_id);
        async {
            if let Err(e) = self.preflight(project) {
                self.notifier.error(&project.name, &e.to_string()).await;
                return Err(e);
            }
            let _guard = self.run_lock.lock().await;
            let plan = match self.plan(project, level) {
                Ok(plan) => plan,
                Err(e) => {
                    self.notifier.error(&project.name, &e.to_string()).await;
                    return Err(e);
                }
            };
            Ok(self.execute_plan(project, plan).await)
        }
        .instrument(span)
        .await
    }

    pub async fn build(&self, project: &Project) -> Result<TaskState> {
        self.execute(project, ExecutionLevel::Build).await
    }

    pub async fn run(&self, project: &Project) -> Result<TaskState> {
        self.execute(project, ExecutionLevel::Run).await
    }

    /// Run a plan produced by [`plan`](Self::plan)
    pub async fn execute_plan(&self, project: &Project, mut plan: ExecutionPlan) -> TaskState {
        let level = plan.level;
        let tasks = std::mem::take(&mut plan.tasks);

        let token = CancellationToken::new();
        *self.current.lock() = Some(token.clone());

        let mut runner = SequentialTaskRunner::new(tasks)
            .with_description(format!("{} {}", level, project.name))
            .with_hook(Arc::new(LoggingHooks::new(project.name.clone())))
            .with_hook(Arc::new(AbortOnError))
            .with_hook(Arc::new(WarningsHook {
                project: project.name.clone(),
                notifier: self.notifier.clone(),
            }));
        if let Some(progress) = &self.progress {
            runner = runner.with_progress(progress.clone());
        }

        let outcome = runner.execute(token).await;
        self.current.lock().take();

        // elements dropped by an abort never ran; let the next run schedule them
        drop(plan);

        let mut memo = self.memo.lock();
        if self.hub.is_active() {
            if memo.session.is_none() {
                memo.session = Some(self.hub.session());
            }
            memo.active.insert(project.name.clone());
        }
        info!(project = %project.name, %level, %outcome, "Project run finished");
        outcome
    }

    /// Cancel the current run, stop the hub and forget executed elements
    pub async fn clean(&self) -> TaskState {
        if let Some(token) = self.current.lock().as_ref() {
            info!("Cancelling running project");
            token.cancel();
        }
        let _guard = self.run_lock.lock().await;
        let state = self.hub.shutdown_task().execute(CancellationToken::new()).await;
        self.memo.lock().reset(None);
        state
    }

    /// Projects run since the hub came up
    pub fn active_projects(&self) -> Vec<String> {
        self.memo.lock().active.iter().cloned().collect()
    }

    /// Serialise `project` back to script text
    ///
    /// Line elements pass through their handler's `rewrite`: the handler that
    /// executed them in this session if any, otherwise a fresh one.
    pub fn rewrite_script(&self, project: &Project) -> String {
        let memo = self.memo.lock();
        let mut indices: HashMap<ExecutionLevel, usize> = HashMap::new();
        serialize_script(&project.elements, &project.directory, |level, text| {
            // File elements are not passed here, so line indices are recovered
            // by matching within the level
            let position = indices.entry(level).or_insert(0);
            let group = project.elements.get(level);
            let index = group
                .iter()
                .enumerate()
                .skip(*position)
                .find(|(_, e)| matches!(e, ExecutionElement::Line(t) if t == text))
                .map(|(i, _)| i);
            let Some(index) = index else {
                return text.to_string();
            };
            *position = index + 1;

            let element = &group[index];
            let key = EntryKey::new(project, level, index, element);
            match memo.executed.get(&key) {
                Some(handler) => handler.rewrite(text),
                None => match self.handlers.create(project, level, element) {
                    Ok(handler) => handler.rewrite(text),
                    Err(_) => text.to_string(),
                },
            }
        })
    }
}

#[async_trait]
impl StopHandler for ProjectPipeline {
    async fn stop(&self) -> Result<TaskState> {
        Ok(self.clean().await)
    }
}
