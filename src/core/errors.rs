use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::project::Version;

/// Number of lines of offending text kept in parse and element errors
pub const DETAIL_LINES: usize = 5;

/// Unified error type for the hub runtime layer
#[derive(Debug, Error)]
pub enum HubError {
    /// A project was rejected before the hub was touched
    #[error("Project {project} requires version {required}, environment supports {supported}")]
    Preflight {
        project: String,
        required: Version,
        supported: Version,
    },

    /// Malformed project script
    #[error("Parse error at line {line}: {message}\n{text}")]
    Parse {
        line: usize,
        message: String,
        text: String,
    },

    /// Malformed handshake line from a child process
    #[error("Handshake failed: {message} (line: {line:?})")]
    Handshake { line: String, message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// An element handler reported failure
    #[error("Element {element} failed: {message}")]
    Element { element: String, message: String },

    /// Child process errors (spawn, wait, kill)
    #[error("Process error: {operation} - {message}")]
    Process { operation: String, message: String },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl HubError {
    pub fn preflight<S: Into<String>>(project: S, required: Version, supported: Version) -> Self {
        Self::Preflight {
            project: project.into(),
            required,
            supported,
        }
    }

    /// Create a parse error, truncating the offending text
    pub fn parse<M: Into<String>>(line: usize, message: M, text: &str) -> Self {
        Self::Parse {
            line,
            message: message.into(),
            text: truncate_lines(text, DETAIL_LINES),
        }
    }

    pub fn handshake<L: Into<String>, M: Into<String>>(line: L, message: M) -> Self {
        Self::Handshake {
            line: line.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create an element error, truncating the message
    pub fn element<E: fmt::Display, M: AsRef<str>>(element: E, message: M) -> Self {
        Self::Element {
            element: element.to_string(),
            message: truncate_lines(message.as_ref(), DETAIL_LINES),
        }
    }

    pub fn process<S: Into<String>, M: Into<String>>(operation: S, message: M) -> Self {
        Self::Process {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Preflight { .. } => "preflight",
            Self::Parse { .. } => "parse",
            Self::Handshake { .. } => "handshake",
            Self::Timeout { .. } => "timeout",
            Self::Element { .. } => "element",
            Self::Process { .. } => "process",
            Self::Io { .. } => "io",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, HubError>;

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_yaml::Error> for HubError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}

/// Keep at most `max` lines of `text`, marking the cut with an ellipsis line
pub fn truncate_lines(text: &str, max: usize) -> String {
    let mut lines = text.lines();
    let kept: Vec<&str> = lines.by_ref().take(max).collect();
    let mut out = kept.join("\n");
    if lines.next().is_some() {
        out.push_str("\n...");
    }
    out
}
