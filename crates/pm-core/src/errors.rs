//! Structured error types shared across the protomodel crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`PmError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (walker ids, paths, particle ids).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for the protomodel walkers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum PmError {
    /// Candidate model structure or snapshot errors.
    #[error("model error: {0}")]
    Model(ErrorInfo),
    /// Mutation operator errors.
    #[error("mutation error: {0}")]
    Mutation(ErrorInfo),
    /// Failures reported by a score oracle.
    #[error("oracle error: {0}")]
    Oracle(ErrorInfo),
    /// Leaderboard persistence errors.
    #[error("hiscore error: {0}")]
    Hiscore(ErrorInfo),
    /// Cross-process lock acquisition errors.
    #[error("lock error: {0}")]
    Lock(ErrorInfo),
    /// Checkpoint read/write errors.
    #[error("checkpoint error: {0}")]
    Checkpoint(ErrorInfo),
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(ErrorInfo),
    /// Serialization and schema errors.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
    /// Filesystem errors.
    #[error("io error: {0}")]
    Io(ErrorInfo),
    /// Worker pool supervision errors.
    #[error("pool error: {0}")]
    Pool(ErrorInfo),
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

impl PmError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            PmError::Model(info)
            | PmError::Mutation(info)
            | PmError::Oracle(info)
            | PmError::Hiscore(info)
            | PmError::Lock(info)
            | PmError::Checkpoint(info)
            | PmError::Config(info)
            | PmError::Serde(info)
            | PmError::Io(info)
            | PmError::Pool(info) => info,
        }
    }

    /// Shorthand for the machine readable code of the payload.
    pub fn code(&self) -> &str {
        &self.info().code
    }

    /// Wraps a filesystem error, recording the offending path.
    pub fn io(code: &str, path: &std::path::Path, err: impl ToString) -> Self {
        PmError::Io(
            ErrorInfo::new(code, err.to_string())
                .with_context("path", path.display().to_string()),
        )
    }
}
