use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational, e.g. why a sub-query was nested.
    Info,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn info(message: impl Into<String>) -> Self {
        Self { severity: Severity::Info, message: message.into() }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self { severity: Severity::Unsupported, message: message.into() }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Info => write!(f, "info: {}", self.message),
            Severity::Unsupported => write!(f, "unsupported: {}", self.message),
        }
    }
}

fn list(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Unsupported)
        .map(|d| d.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum QueryAstError {
    /// Every unsupported construct found in one pass.
    #[error("plan is not supported by this device: {}", list(.diagnostics))]
    Unsupported { diagnostics: Vec<Diagnostic> },
    #[error("emit error: {0}")]
    Emit(String),
    #[error("plan kind {0} cannot be opened as a cursor")]
    NotTableValued(&'static str),
    #[error("column {0} does not resolve to a range variable in scope")]
    UnresolvedReference(String),
}

impl QueryAstError {
    pub fn unsupported_messages(&self) -> Vec<&str> {
        match self {
            QueryAstError::Unsupported { diagnostics } => diagnostics
                .iter()
                .filter(|d| d.severity == Severity::Unsupported)
                .map(|d| d.message.as_str())
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum RewriteError {
    #[error("statement has no key columns to restrict on")]
    NoKey,
    #[error("key column {0} is outside the select list")]
    KeyOutOfRange(usize),
    #[error("sort key {0} restarts from NULL but the scan's NULL placement is unknown")]
    NullPlacementUnknown(usize),
}

impl From<RewriteError> for QueryAstError {
    fn from(e: RewriteError) -> Self {
        QueryAstError::Emit(e.to_string())
    }
}
