use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::handler::ElementHandler;

/// Execution level of a project element
///
/// Ordering is significant: a Build run implies Configure elements have run,
/// and a Run implies Build elements have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionLevel {
    Configure,
    Build,
    Run,
}

impl ExecutionLevel {
    pub const ALL: [ExecutionLevel; 3] = [
        ExecutionLevel::Configure,
        ExecutionLevel::Build,
        ExecutionLevel::Run,
    ];

    /// Script marker that switches to this level, if any
    pub fn marker(self) -> Option<&'static str> {
        match self {
            ExecutionLevel::Configure => None,
            ExecutionLevel::Build => Some("<<<BUILD>>>"),
            ExecutionLevel::Run => Some("<<<RUN>>>"),
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker.trim() {
            "<<<BUILD>>>" => Some(ExecutionLevel::Build),
            "<<<RUN>>>" => Some(ExecutionLevel::Run),
            _ => None,
        }
    }

    /// Run elements always re-execute; the others execute once per hub session
    pub fn is_memoized(self) -> bool {
        !matches!(self, ExecutionLevel::Run)
    }

    /// Title of the continue/abort question asked when an element fails
    pub fn continue_title(self) -> &'static str {
        match self {
            ExecutionLevel::Configure | ExecutionLevel::Build => "Continue building project?",
            ExecutionLevel::Run => "Continue running project?",
        }
    }

    /// Levels that must run to reach `self`, in order
    pub fn up_to(self) -> impl Iterator<Item = ExecutionLevel> {
        Self::ALL.into_iter().filter(move |l| *l <= self)
    }

    fn verb(self) -> &'static str {
        match self {
            ExecutionLevel::Configure => "Configure",
            ExecutionLevel::Build => "Build",
            ExecutionLevel::Run => "Run",
        }
    }
}

impl fmt::Display for ExecutionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// One unit of project configuration: a file to evaluate or an inline line
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ExecutionElement {
    File(PathBuf),
    Line(String),
}

impl ExecutionElement {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ExecutionElement::File(path.into())
    }

    pub fn line(text: impl Into<String>) -> Self {
        ExecutionElement::Line(text.into())
    }
}

impl fmt::Display for ExecutionElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionElement::File(path) => write!(f, "{}", path.display()),
            ExecutionElement::Line(text) => f.write_str(text),
        }
    }
}

/// An element bound to the handler that executes it
#[derive(Clone)]
pub struct ExecutionEntry {
    pub level: ExecutionLevel,
    pub element: ExecutionElement,
    pub handler: Arc<dyn ElementHandler>,
}

impl ExecutionEntry {
    pub fn new(
        level: ExecutionLevel,
        element: ExecutionElement,
        handler: Arc<dyn ElementHandler>,
    ) -> Self {
        Self {
            level,
            element,
            handler,
        }
    }

    /// Label used for progress reporting
    pub fn description(&self) -> String {
        format!("{}: {}", self.level, self.element)
    }
}

impl fmt::Debug for ExecutionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEntry")
            .field("level", &self.level)
            .field("element", &self.element)
            .finish_non_exhaustive()
    }
}
