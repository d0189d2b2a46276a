//! Project script parsing and serialisation
//!
//! A script is plain text, one element per line:
//!
//! ```text
//! # configure elements come first
//! set threads 4
//! include [file "lib/setup.scr"]
//! # <<<BUILD>>>
//! build all
//! # <<<RUN>>>
//! run main
//! ```
//!
//! Blank lines and comments are skipped. A comment holding a level marker
//! switches the level for the lines that follow; levels only move forward.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::element::{ExecutionElement, ExecutionLevel};
use crate::core::errors::{HubError, Result};

const INCLUDE_PREFIX: &str = "include [file \"";
const INCLUDE_SUFFIX: &str = "\"]";

/// Elements of a project grouped by level, each group in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectElements {
    #[serde(default)]
    pub configure: Vec<ExecutionElement>,
    #[serde(default)]
    pub build: Vec<ExecutionElement>,
    #[serde(default)]
    pub run: Vec<ExecutionElement>,
}

impl ProjectElements {
    pub fn get(&self, level: ExecutionLevel) -> &[ExecutionElement] {
        match level {
            ExecutionLevel::Configure => &self.configure,
            ExecutionLevel::Build => &self.build,
            ExecutionLevel::Run => &self.run,
        }
    }

    pub fn push(&mut self, level: ExecutionLevel, element: ExecutionElement) {
        match level {
            ExecutionLevel::Configure => self.configure.push(element),
            ExecutionLevel::Build => self.build.push(element),
            ExecutionLevel::Run => self.run.push(element),
        }
    }

    /// All elements, Configure first, then Build, then Run
    pub fn iter(&self) -> impl Iterator<Item = (ExecutionLevel, &ExecutionElement)> {
        ExecutionLevel::ALL
            .into_iter()
            .flat_map(move |level| self.get(level).iter().map(move |e| (level, e)))
    }

    pub fn len(&self) -> usize {
        self.configure.len() + self.build.len() + self.run.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parser accumulator; the current level travels with it through the fold
struct ParseState {
    level: ExecutionLevel,
    elements: ProjectElements,
}

/// Parse a project script. Included files resolve against `directory`.
pub fn parse_script(text: &str, directory: &Path) -> Result<ProjectElements> {
    let initial = ParseState {
        level: ExecutionLevel::Configure,
        elements: ProjectElements::default(),
    };
    let state = text
        .lines()
        .enumerate()
        .try_fold(initial, |state, (index, line)| {
            parse_line(state, index + 1, line, directory)
        })?;
    Ok(state.elements)
}

fn parse_line(
    mut state: ParseState,
    number: usize,
    line: &str,
    directory: &Path,
) -> Result<ParseState> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(state);
    }

    if let Some(comment) = trimmed.strip_prefix('#') {
        if let Some(level) = ExecutionLevel::from_marker(comment) {
            if level < state.level {
                return Err(HubError::parse(
                    number,
                    format!("Level marker {} after {}", level, state.level),
                    line,
                ));
            }
            state.level = level;
        }
        return Ok(state);
    }

    let element = if is_include(trimmed) {
        let path = trimmed
            .strip_prefix(INCLUDE_PREFIX)
            .and_then(|rest| rest.strip_suffix(INCLUDE_SUFFIX))
            .filter(|p| !p.is_empty() && !p.contains('"'))
            .ok_or_else(|| HubError::parse(number, "Malformed include directive", line))?;
        ExecutionElement::File(directory.join(path))
    } else {
        ExecutionElement::Line(trimmed.to_string())
    };
    state.elements.push(state.level, element);
    Ok(state)
}

/// The `include` word on its own; longer words such as `includes_dir` are
/// plain commands
fn is_include(line: &str) -> bool {
    line.strip_prefix("include").map_or(false, |rest| {
        rest.chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == '[')
    })
}

/// Write elements back to script text
///
/// File elements under `directory` are written relative to it. Each Line
/// element passes through `rewrite` before it is written.
pub fn serialize_script<F>(elements: &ProjectElements, directory: &Path, mut rewrite: F) -> String
where
    F: FnMut(ExecutionLevel, &str) -> String,
{
    let mut out = String::new();
    for level in ExecutionLevel::ALL {
        let group = elements.get(level);
        if group.is_empty() {
            continue;
        }
        if let Some(marker) = level.marker() {
            out.push_str("# ");
            out.push_str(marker);
            out.push('\n');
        }
        for element in group {
            match element {
                ExecutionElement::File(path) => {
                    let path = relative_to(path, directory);
                    out.push_str(INCLUDE_PREFIX);
                    out.push_str(&path.to_string_lossy());
                    out.push_str(INCLUDE_SUFFIX);
                }
                ExecutionElement::Line(text) => out.push_str(&rewrite(level, text)),
            }
            out.push('\n');
        }
    }
    out
}

/// Serialise without rewriting lines
pub fn to_script(elements: &ProjectElements, directory: &Path) -> String {
    serialize_script(elements, directory, |_, text| text.to_string())
}

fn relative_to(path: &Path, directory: &Path) -> PathBuf {
    path.strip_prefix(directory)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}
