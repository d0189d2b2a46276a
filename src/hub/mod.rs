//! Hub lifecycle: state, collaborators and the controller

pub mod context;
pub mod controller;
pub mod participant;
pub mod state;

pub use context::{
    HubBackend, HubContext, InMemoryRootRegistry, LocalBackend, ParticipantTable, RootRegistry,
};
pub use controller::{HubController, ShutdownTask, StartupTask};
pub use participant::{LaunchParticipantTask, RemoveRootsTask, StopParticipantsTask};
pub use state::{HubEvent, HubState};
