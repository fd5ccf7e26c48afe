//! Typed failures carried inside `anyhow::Error`.
//!
//! Callers recover them with `downcast_ref` at the service and HTTP
//! boundaries; everywhere else they travel as plain `anyhow` errors.

use std::fmt;

use crate::core::run::RunStatus;

/// Required credentials or settings for an external service are absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationError {
    pub service: String,
    pub missing: Vec<String>,
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is not configured (missing {})",
            self.service,
            self.missing.join(", ")
        )
    }
}

impl std::error::Error for ConfigurationError {}

/// A remote call to the tracker or reasoning service failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub service: String,
    pub message: String,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} request failed: {}", self.service, self.message)
    }
}

impl std::error::Error for TransportError {}

/// The reasoning service returned text that could not be read as the
/// expected structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFormatError {
    pub reason: String,
    /// Bounded prefix of the offending text.
    pub preview: String,
}

impl fmt::Display for ResponseFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unparseable response: {} (preview: {:?})",
            self.reason, self.preview
        )
    }
}

impl std::error::Error for ResponseFormatError {}

/// Every drafting attempt produced edits without the required tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateExhaustedError {
    pub attempts: u32,
    /// Paths of the last (discarded) candidate set.
    pub last_paths: Vec<String>,
}

impl fmt::Display for GateExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unit-test gate failed after {} attempts (last edit set: [{}])",
            self.attempts,
            self.last_paths.join(", ")
        )
    }
}

impl std::error::Error for GateExhaustedError {}

/// The working tree has uncommitted changes where a clean tree is required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeStateError {
    pub repo_path: String,
    /// `git status --porcelain` style entries.
    pub entries: Vec<String>,
}

impl fmt::Display for WorktreeStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "working tree {} not clean:\n{}",
            self.repo_path,
            self.entries.join("\n")
        )
    }
}

impl std::error::Error for WorktreeStateError {}

/// A run was asked to move to a status its current status does not allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransitionError {
    pub run_id: String,
    pub from: RunStatus,
    pub to: RunStatus,
}

impl fmt::Display for InvalidTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} cannot move from {} to {}",
            self.run_id,
            self.from.as_str(),
            self.to.as_str()
        )
    }
}

impl std::error::Error for InvalidTransitionError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNotFoundError {
    pub run_id: String,
}

impl fmt::Display for RunNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run {} not found", self.run_id)
    }
}

impl std::error::Error for RunNotFoundError {}

/// Clip `text` to at most `limit` bytes on a char boundary.
pub fn preview(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("héllo", 2), "h...");
    }

    #[test]
    fn errors_survive_anyhow_downcast() {
        let err = anyhow::Error::new(GateExhaustedError {
            attempts: 2,
            last_paths: vec!["src/a.ts".to_string()],
        });
        let gate = err.downcast_ref::<GateExhaustedError>().expect("downcast");
        assert_eq!(gate.attempts, 2);
        assert!(err.to_string().contains("src/a.ts"));
    }
}
