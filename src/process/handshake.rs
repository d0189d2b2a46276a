//! Line handshake used by a child runtime to announce its control port
//!
//! The child prints `Listening at : <port>` on stdout. Every other line is
//! ignored here (it still reaches the process console).

use std::net::{Ipv4Addr, SocketAddr};

use crate::core::errors::{HubError, Result};

/// Exact prefix of the announcement line, spaces around the colon included
pub const HANDSHAKE_PREFIX: &str = "Listening at : ";

/// Parse a single line. `None` means the line is not a handshake line.
pub fn parse_line(line: &str) -> Option<Result<SocketAddr>> {
    let line = line.trim_end_matches(['\r', '\n']);
    let rest = line.strip_prefix(HANDSHAKE_PREFIX)?;
    let port = rest.trim();
    let parsed = port
        .parse::<u16>()
        .map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .map_err(|e| HubError::handshake(line, format!("invalid port {:?}: {}", port, e)));
    Some(parsed)
}

/// Stateful parser fed one stdout line at a time; resolves at most once
#[derive(Debug, Default)]
pub struct HandshakeParser {
    resolved: bool,
}

impl HandshakeParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Returns the outcome on the first handshake line, `None` otherwise
    pub fn feed(&mut self, line: &str) -> Option<Result<SocketAddr>> {
        if self.resolved {
            return None;
        }
        let outcome = parse_line(line)?;
        self.resolved = true;
        Some(outcome)
    }
}
