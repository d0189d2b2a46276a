// Core infrastructure modules
pub mod core;

// Runtime orchestration layers
pub mod task;     // Tasks and the sequential runner
pub mod hub;      // Hub lifecycle state machine
pub mod process;  // Child process launch and handshake
pub mod project;  // Project scripts and the execution pipeline

// Re-exports for convenience
pub use core::config::{HubConfig, HubConfigBuilder, ParticipantConfig};
pub use core::errors::{HubError, Result};
pub use core::logging::{init_test_tracing, init_tracing};

pub use hub::{HubContext, HubController, HubEvent, HubState};
pub use process::{ChildProcessInfo, ChildProcessSupervisor, LaunchOptions};
pub use project::{
    ExecutionElement, ExecutionLevel, Project, ProjectPipeline, Version,
};
pub use task::{SequentialTaskRunner, Task, TaskState};
