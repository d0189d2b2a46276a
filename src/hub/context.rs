//! Explicit context handed to the hub controller
//!
//! Replaces process-wide registries: tests build a fresh context per case.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

use crate::core::config::HubConfig;
use crate::process::ChildProcessInfo;
use crate::task::Task;

/// The execution engine the controller boots and tears down
#[async_trait]
pub trait HubBackend: Send + Sync {
    /// Extra startup tasks, run after participants are launched
    fn startup_tasks(&self) -> Vec<Box<dyn Task>> {
        Vec::new()
    }

    /// Install internal extensions and set up log routing
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Extra shutdown tasks, run after user roots are removed
    fn shutdown_tasks(&self) -> Vec<Box<dyn Task>> {
        Vec::new()
    }

    /// Tear down internal extensions
    async fn teardown(&self) -> anyhow::Result<()>;
}

/// In-process hub with no extensions of its own
pub struct LocalBackend;

#[async_trait]
impl HubBackend for LocalBackend {
    async fn initialize(&self) -> anyhow::Result<()> {
        tracing::debug!("Local hub initialized");
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        tracing::debug!("Local hub torn down");
        Ok(())
    }
}

/// Registry of root contexts living in the hub
#[async_trait]
pub trait RootRegistry: Send + Sync {
    /// Roots known to have been created by the user
    async fn user_roots(&self) -> Vec<String>;

    async fn remove_root(&self, id: &str) -> anyhow::Result<()>;
}

/// Root registry backed by a concurrent set
#[derive(Default)]
pub struct InMemoryRootRegistry {
    roots: DashSet<String>,
}

impl InMemoryRootRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&self, id: impl Into<String>) {
        self.roots.insert(id.into());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.roots.contains(id)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

#[async_trait]
impl RootRegistry for InMemoryRootRegistry {
    async fn user_roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = self.roots.iter().map(|r| r.key().clone()).collect();
        roots.sort();
        roots
    }

    async fn remove_root(&self, id: &str) -> anyhow::Result<()> {
        match self.roots.remove(id) {
            Some(_) => Ok(()),
            None => Err(anyhow::anyhow!("Root not found: {}", id)),
        }
    }
}

/// Participants launched during startup, keyed by participant id
pub type ParticipantTable = DashMap<String, ChildProcessInfo>;

/// Everything the hub controller collaborates with
#[derive(Clone)]
pub struct HubContext {
    pub config: Arc<HubConfig>,
    pub backend: Arc<dyn HubBackend>,
    pub roots: Arc<dyn RootRegistry>,
    pub participants: Arc<ParticipantTable>,
}

impl HubContext {
    pub fn new(
        config: HubConfig,
        backend: Arc<dyn HubBackend>,
        roots: Arc<dyn RootRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            roots,
            participants: Arc::new(DashMap::new()),
        }
    }

    /// Local backend and an empty in-memory root registry
    pub fn local(config: HubConfig) -> Self {
        Self::new(
            config,
            Arc::new(LocalBackend),
            Arc::new(InMemoryRootRegistry::new()),
        )
    }
}
