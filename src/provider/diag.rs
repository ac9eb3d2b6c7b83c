//! Diagnostics
//!
//! What a handler reports back to the host engine: errors and warnings, each with a
//! short summary, a detail string, and an optional attribute path.

use crate::error::{Error, ErrorKind};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
            attribute: None,
        }
    }

    pub fn warning(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
            attribute: None,
        }
    }

    pub fn with_attribute(mut self, path: impl Into<String>) -> Self {
        self.attribute = Some(path.into());
        self
    }

    /// Error diagnostic summarised from the error kind
    pub fn from_error(err: &Error) -> Self {
        let summary = match err.kind() {
            ErrorKind::NotFound => "Resource not found",
            ErrorKind::Forbidden => "Permission denied",
            ErrorKind::Conflict => "Resource conflict",
            ErrorKind::PreconditionFailed => "Precondition failed",
            ErrorKind::TooManyResults => "Too many results",
            ErrorKind::TransientState => "Resource is in a transient state",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::Unavailable => "Service unavailable",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Request failed",
        };
        Self::error(summary, err.to_string())
    }
}

/// Ordered list of diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.0.push(diag);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    pub fn warn(&mut self, summary: impl Into<String>, detail: impl Into<String>) {
        self.push(Diagnostic::warning(summary, detail));
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| d.severity == Severity::Warning)
    }
}

impl From<Error> for Diagnostics {
    fn from(err: Error) -> Self {
        Self(vec![Diagnostic::from_error(&err)])
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diag: Diagnostic) -> Self {
        Self(vec![diag])
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let diags: Diagnostics = Error::TooManyResults {
            what: "servers".into(),
            key: "dup".into(),
            count: 2,
        }
        .into();
        assert!(diags.has_errors());
        let diag = diags.iter().next().unwrap();
        assert_eq!(diag.summary, "Too many results");
        assert!(diag.detail.contains("dup"));
    }

    #[test]
    fn test_warnings_are_not_errors() {
        let mut diags = Diagnostics::new();
        diags.warn("certificate in error", "status is error");
        assert!(!diags.has_errors());
        assert_eq!(diags.warnings().count(), 1);
    }
}
