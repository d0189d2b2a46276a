// Core infrastructure shared by the task, hub, process and project layers

pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use config::{HubConfig, HubConfigBuilder, ParticipantConfig};
pub use errors::{HubError, Result};
pub use logging::{init_test_tracing, init_tracing};
