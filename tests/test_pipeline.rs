//! Project execution pipeline tests
//!
//! Planning, the executed-element memo, continue/abort decisions,
//! preflight rejection and clean.

use anyhow::Result;
use async_trait::async_trait;
use livehub::hub::{HubContext, HubController, HubState};
use livehub::project::{
    ContinuationDecider, ContinueRequest, Decision, ElementHandler, EvalHandlerFactory,
    ExecutionElement, ExecutionLevel, FixedDecision, HandlerFactory, Notifier, Project,
    ProjectPipeline, ScriptEvaluator, Version,
};
use livehub::process::StopHandler;
use livehub::task::{ProgressEvent, TaskState};
use livehub::{init_test_tracing, HubConfig, HubError};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Evaluator that journals what it runs. Sources starting with `fail` fail
/// with an eight-line error; sources starting with `warn` produce a warning.
#[derive(Default)]
struct Journal {
    evaluated: Mutex<Vec<String>>,
}

impl Journal {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.evaluated.lock())
    }
}

#[async_trait]
impl ScriptEvaluator for Journal {
    async fn evaluate(
        &self,
        source: &str,
        _origin: &str,
        _token: CancellationToken,
    ) -> Result<Vec<String>> {
        let source = source.trim().to_string();
        self.evaluated.lock().push(source.clone());
        if source.starts_with("fail") {
            let detail: Vec<String> = (1..=8).map(|i| format!("trace line {}", i)).collect();
            anyhow::bail!("{}", detail.join("\n"));
        }
        if source.starts_with("warn") {
            return Ok(vec![format!("deprecated: {}", source)]);
        }
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct Recorded {
    warnings: Mutex<Vec<Vec<String>>>,
    errors: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for Recorded {
    async fn warnings(&self, _project: &str, warnings: &[String]) {
        self.warnings.lock().push(warnings.to_vec());
    }

    async fn error(&self, _project: &str, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}

/// Decider that records the questions it was asked
struct Asking {
    answer: Decision,
    asked: Mutex<Vec<ContinueRequest>>,
}

#[async_trait]
impl ContinuationDecider for Asking {
    async fn decide(&self, request: &ContinueRequest) -> Decision {
        self.asked.lock().push(request.clone());
        self.answer
    }
}

struct Fixture {
    hub: HubController,
    journal: Arc<Journal>,
    notifier: Arc<Recorded>,
    pipeline: ProjectPipeline,
}

fn fixture(decider: Arc<dyn ContinuationDecider>) -> Fixture {
    init_test_tracing();
    let hub = HubController::new(HubContext::local(HubConfig::default()));
    let journal = Arc::new(Journal::default());
    let notifier = Arc::new(Recorded::default());
    let pipeline = ProjectPipeline::new(
        hub.clone(),
        Arc::new(EvalHandlerFactory::new(journal.clone())),
        decider,
    )
    .with_notifier(notifier.clone());
    Fixture {
        hub,
        journal,
        notifier,
        pipeline,
    }
}

fn three_level_project() -> Project {
    Project::new("demo", "/work/demo")
        .with_element(ExecutionLevel::Configure, ExecutionElement::line("A"))
        .with_element(ExecutionLevel::Build, ExecutionElement::line("B"))
        .with_element(ExecutionLevel::Run, ExecutionElement::line("C"))
}

/// A Build request schedules hub startup, then Configure, then Build; Run is left out
#[tokio::test]
async fn test_build_plan_starts_hub_first() {
    let f = fixture(Arc::new(FixedDecision(Decision::Continue)));
    let project = three_level_project();

    let plan = f.pipeline.plan(&project, ExecutionLevel::Build).unwrap();

    assert!(plan.starts_hub());
    assert_eq!(
        plan.descriptions(),
        vec!["Starting hub", "Configure: A", "Build: B"]
    );
    // planning alone never touches the hub
    assert_eq!(f.hub.state(), HubState::Stopped);
}

/// A second Build schedules nothing; every Run re-runs the Run elements
#[tokio::test]
async fn test_memo_skips_configure_and_build() {
    let f = fixture(Arc::new(FixedDecision(Decision::Continue)));
    let project = three_level_project();

    assert_eq!(f.pipeline.build(&project).await.unwrap(), TaskState::Completed);
    assert_eq!(f.journal.take(), vec!["A", "B"]);
    assert!(f.hub.is_active());

    let again = f.pipeline.plan(&project, ExecutionLevel::Build).unwrap();
    assert!(again.is_empty());
    assert_eq!(f.pipeline.execute_plan(&project, again).await, TaskState::Completed);
    assert!(f.journal.take().is_empty());

    assert_eq!(f.pipeline.run(&project).await.unwrap(), TaskState::Completed);
    assert_eq!(f.journal.take(), vec!["C"]);
    assert_eq!(f.pipeline.run(&project).await.unwrap(), TaskState::Completed);
    assert_eq!(f.journal.take(), vec!["C"]);

    assert_eq!(f.pipeline.active_projects(), vec!["demo".to_string()]);
}

/// Planning marks elements as scheduled before they run
#[tokio::test]
async fn test_planning_marks_elements_once() {
    let f = fixture(Arc::new(FixedDecision(Decision::Continue)));
    let project = three_level_project();
    assert_eq!(f.hub.ensure_running().await, TaskState::Completed);

    let first = f.pipeline.plan(&project, ExecutionLevel::Build).unwrap();
    let second = f.pipeline.plan(&project, ExecutionLevel::Build).unwrap();

    assert_eq!(first.len(), 2);
    assert!(second.is_empty());
}

/// A plan dropped without running leaves its elements to the next run
#[tokio::test]
async fn test_dropped_plan_releases_elements() {
    let f = fixture(Arc::new(FixedDecision(Decision::Continue)));
    let project = three_level_project();
    assert_eq!(f.hub.ensure_running().await, TaskState::Completed);

    let plan = f.pipeline.plan(&project, ExecutionLevel::Build).unwrap();
    assert_eq!(plan.len(), 2);
    drop(plan);

    assert_eq!(f.pipeline.build(&project).await.unwrap(), TaskState::Completed);
    assert_eq!(f.journal.take(), vec!["A", "B"]);
    assert!(f.pipeline.plan(&project, ExecutionLevel::Build).unwrap().is_empty());
}

/// A failure answered with "continue" leaves the run Completed, warning once
#[tokio::test]
async fn test_continue_after_failure() {
    let f = fixture(Arc::new(FixedDecision(Decision::Continue)));
    let project = Project::new("demo", "/work/demo")
        .with_element(ExecutionLevel::Configure, ExecutionElement::line("fail early"))
        .with_element(ExecutionLevel::Configure, ExecutionElement::line("warn old api"))
        .with_element(ExecutionLevel::Build, ExecutionElement::line("B"));

    assert_eq!(f.pipeline.build(&project).await.unwrap(), TaskState::Completed);
    assert_eq!(f.journal.take(), vec!["fail early", "warn old api", "B"]);

    let notified = f.notifier.warnings.lock().clone();
    assert_eq!(notified.len(), 1);
    let warnings = &notified[0];
    assert_eq!(warnings.len(), 2);
    assert!(warnings[0].starts_with("Configure: fail early failed"));
    assert_eq!(warnings[1], "deprecated: warn old api");
}

/// "abort" ends the run as Error and nothing after the failure runs
#[tokio::test]
async fn test_abort_after_failure() {
    let decider = Arc::new(Asking {
        answer: Decision::Abort,
        asked: Mutex::new(Vec::new()),
    });
    let f = fixture(decider.clone());
    let project = Project::new("demo", "/work/demo")
        .with_element(ExecutionLevel::Configure, ExecutionElement::line("A"))
        .with_element(ExecutionLevel::Build, ExecutionElement::line("fail build"))
        .with_element(ExecutionLevel::Build, ExecutionElement::line("never"));

    assert_eq!(f.pipeline.build(&project).await.unwrap(), TaskState::Error);
    assert_eq!(f.journal.take(), vec!["A", "fail build"]);

    let asked = decider.asked.lock().clone();
    assert_eq!(asked.len(), 1);
    assert_eq!(asked[0].title, "Continue building project?");
    assert_eq!(asked[0].level, ExecutionLevel::Build);
    assert_eq!(asked[0].element, "fail build");
    assert_eq!(asked[0].detail.lines().count(), 6);
    assert!(asked[0].detail.ends_with("trace line 5\n..."));

    // the element dropped by the abort is scheduled again next time
    let plan = f.pipeline.plan(&project, ExecutionLevel::Build).unwrap();
    assert_eq!(plan.descriptions(), vec!["Build: never"]);
}

/// Run-level failures ask about running, not building
#[tokio::test]
async fn test_run_failure_title() {
    let decider = Arc::new(Asking {
        answer: Decision::Continue,
        asked: Mutex::new(Vec::new()),
    });
    let f = fixture(decider.clone());
    let project = Project::new("demo", "/work/demo")
        .with_element(ExecutionLevel::Run, ExecutionElement::line("fail run"));

    assert_eq!(f.pipeline.run(&project).await.unwrap(), TaskState::Completed);
    assert_eq!(decider.asked.lock()[0].title, "Continue running project?");
}

/// A project needing a newer environment is rejected without touching the hub
#[tokio::test]
async fn test_preflight_rejection() {
    let f = fixture(Arc::new(FixedDecision(Decision::Continue)));
    let project = three_level_project().with_required_version(Version::new(99, 0, 0));

    let err = f.pipeline.build(&project).await.unwrap_err();

    assert!(matches!(err, HubError::Preflight { .. }));
    assert_eq!(f.hub.state(), HubState::Stopped);
    assert_eq!(f.hub.session(), 0);
    assert!(f.journal.take().is_empty());
    assert_eq!(f.notifier.errors.lock().len(), 1);
}

/// clean stops the hub and forgets executed elements
#[tokio::test]
async fn test_clean_clears_memo() {
    let f = fixture(Arc::new(FixedDecision(Decision::Continue)));
    let project = three_level_project();
    f.pipeline.build(&project).await.unwrap();
    f.journal.take();

    assert_eq!(f.pipeline.clean().await, TaskState::Completed);
    assert_eq!(f.hub.state(), HubState::Stopped);
    assert!(f.pipeline.active_projects().is_empty());

    let plan = f.pipeline.plan(&project, ExecutionLevel::Build).unwrap();
    assert_eq!(
        plan.descriptions(),
        vec!["Starting hub", "Configure: A", "Build: B"]
    );
}

/// A hub restarted outside the pipeline invalidates the memo
#[tokio::test]
async fn test_external_restart_clears_memo() {
    let f = fixture(Arc::new(FixedDecision(Decision::Continue)));
    let project = three_level_project();
    f.pipeline.build(&project).await.unwrap();
    f.journal.take();

    f.hub.restart();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !(f.hub.session() == 2 && f.hub.is_active()) {
            f.hub.wait_for(HubState::Running).await;
        }
    })
    .await
    .unwrap();

    let plan = f.pipeline.plan(&project, ExecutionLevel::Build).unwrap();
    assert!(!plan.starts_hub());
    assert_eq!(plan.descriptions(), vec!["Configure: A", "Build: B"]);
}

/// Progress events describe every task of the run
#[tokio::test]
async fn test_progress_reporting() {
    let hub = HubController::new(HubContext::local(HubConfig::default()));
    let journal = Arc::new(Journal::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipeline = ProjectPipeline::new(
        hub,
        Arc::new(EvalHandlerFactory::new(journal)),
        Arc::new(FixedDecision(Decision::Continue)),
    )
    .with_progress(tx);

    pipeline.build(&three_level_project()).await.unwrap();
    drop(pipeline);

    let mut events: Vec<ProgressEvent> = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let remaining: Vec<usize> = events.iter().map(|e| e.remaining).collect();
    assert_eq!(remaining, vec![3, 2, 1]);
    assert_eq!(events[0].description.as_deref(), Some("Starting hub"));
}

/// Include directives are read from the project directory
#[tokio::test]
async fn test_included_file_is_evaluated() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("setup.scr"), "warn from file\n").unwrap();
    let project = Project::from_script(
        "files",
        dir.path(),
        "include [file \"setup.scr\"]\n# <<<BUILD>>>\nB\n",
    )
    .unwrap();
    let f = fixture(Arc::new(FixedDecision(Decision::Continue)));

    assert_eq!(f.pipeline.build(&project).await.unwrap(), TaskState::Completed);
    assert_eq!(f.journal.take(), vec!["warn from file", "B"]);
}

/// An empty level is a no-op
#[tokio::test]
async fn test_empty_project() {
    let f = fixture(Arc::new(FixedDecision(Decision::Abort)));
    let project = Project::new("empty", "/work/empty");
    assert_eq!(f.hub.ensure_running().await, TaskState::Completed);

    let plan = f.pipeline.plan(&project, ExecutionLevel::Run).unwrap();
    assert!(plan.is_empty());
    assert_eq!(f.pipeline.run(&project).await.unwrap(), TaskState::Completed);
}

/// The pipeline serves as the stop control of a launched runtime
#[tokio::test]
async fn test_stop_handler_cleans() {
    let f = fixture(Arc::new(FixedDecision(Decision::Continue)));
    f.pipeline.build(&three_level_project()).await.unwrap();

    let pipeline: Arc<ProjectPipeline> = Arc::new(f.pipeline);
    let handler: Arc<dyn StopHandler> = pipeline.clone();
    assert_eq!(handler.stop().await.unwrap(), TaskState::Completed);
    assert_eq!(f.hub.state(), HubState::Stopped);
}

/// Evaluator whose `slow` elements block until their run is cancelled
#[derive(Default)]
struct Gated {
    entered: Notify,
    evaluated: Mutex<Vec<String>>,
}

#[async_trait]
impl ScriptEvaluator for Gated {
    async fn evaluate(
        &self,
        source: &str,
        _origin: &str,
        token: CancellationToken,
    ) -> Result<Vec<String>> {
        let source = source.trim().to_string();
        self.evaluated.lock().push(source.clone());
        if source.starts_with("slow") {
            self.entered.notify_one();
            token.cancelled().await;
            anyhow::bail!("interrupted");
        }
        Ok(Vec::new())
    }
}

/// clean cancels the run in progress before stopping the hub
#[tokio::test]
async fn test_clean_cancels_running_project() {
    init_test_tracing();
    let hub = HubController::new(HubContext::local(HubConfig::default()));
    let gated = Arc::new(Gated::default());
    let pipeline = Arc::new(ProjectPipeline::new(
        hub.clone(),
        Arc::new(EvalHandlerFactory::new(gated.clone())),
        Arc::new(FixedDecision(Decision::Continue)),
    ));
    let project = Project::new("demo", "/work/demo")
        .with_element(ExecutionLevel::Configure, ExecutionElement::line("slow setup"))
        .with_element(ExecutionLevel::Build, ExecutionElement::line("B"));

    let run = tokio::spawn({
        let pipeline = pipeline.clone();
        let project = project.clone();
        async move { pipeline.build(&project).await }
    });
    gated.entered.notified().await;

    let cleaned = tokio::time::timeout(Duration::from_secs(5), pipeline.clean())
        .await
        .unwrap();
    assert_eq!(cleaned, TaskState::Completed);
    assert_eq!(run.await.unwrap().unwrap(), TaskState::Cancelled);

    assert_eq!(*gated.evaluated.lock(), vec!["slow setup".to_string()]);
    assert_eq!(hub.state(), HubState::Stopped);
    assert!(pipeline.active_projects().is_empty());

    let plan = pipeline.plan(&project, ExecutionLevel::Build).unwrap();
    assert_eq!(
        plan.descriptions(),
        vec!["Starting hub", "Configure: slow setup", "Build: B"]
    );
}

struct Shouting;

#[async_trait]
impl ElementHandler for Shouting {
    async fn process(&self, _token: CancellationToken) -> Result<()> {
        Ok(())
    }

    fn rewrite(&self, text: &str) -> String {
        text.to_uppercase()
    }
}

struct ShoutingFactory;

impl HandlerFactory for ShoutingFactory {
    fn create(
        &self,
        _project: &Project,
        _level: ExecutionLevel,
        _element: &ExecutionElement,
    ) -> Result<Arc<dyn ElementHandler>> {
        Ok(Arc::new(Shouting))
    }
}

/// Writing the script back passes lines through their handlers
#[tokio::test]
async fn test_rewrite_script() {
    let hub = HubController::new(HubContext::local(HubConfig::default()));
    let pipeline = ProjectPipeline::new(
        hub,
        Arc::new(ShoutingFactory),
        Arc::new(FixedDecision(Decision::Continue)),
    );
    let project = Project::from_script(
        "demo",
        "/work/demo",
        "set x\ninclude [file \"lib/a.scr\"]\n# <<<RUN>>>\nrun x\n",
    )
    .unwrap();

    assert_eq!(
        pipeline.rewrite_script(&project),
        "SET X\ninclude [file \"lib/a.scr\"]\n# <<<RUN>>>\nRUN X\n"
    );
}
