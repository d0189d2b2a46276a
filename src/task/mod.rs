//! Task abstraction and the sequential runner

pub mod runner;
pub mod task;

pub use runner::{
    AbortOnError, CompositeHooks, Continuation, LoggingHooks, ProgressEvent, RunnerHooks,
    SequentialTaskRunner,
};
pub use task::{spawn_task, FnTask, Task, TaskHandle, TaskState};
