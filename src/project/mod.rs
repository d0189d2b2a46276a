//! Projects and the pipeline that executes them

pub mod decision;
pub mod element;
pub mod handler;
pub mod model;
pub mod pipeline;
pub mod script;

pub use decision::{
    ContinuationDecider, ContinueRequest, Decision, FixedDecision, LoggingNotifier, Notifier,
};
pub use element::{ExecutionElement, ExecutionEntry, ExecutionLevel};
pub use handler::{ElementHandler, EvalHandler, EvalHandlerFactory, HandlerFactory, ScriptEvaluator};
pub use model::{Project, Version};
pub use pipeline::{ExecutionPlan, ProjectPipeline};
pub use script::{parse_script, serialize_script, to_script, ProjectElements};
