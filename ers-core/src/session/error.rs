use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::browser::BrowserError;
use crate::error::ConfigError;
use crate::navigation::PortalError;
use crate::readings::ParseError;
use crate::sink::SinkError;
use crate::task::RegistryError;

use super::request::ValidationError;

/// Failure category as surfaced in task status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Authentication,
    SecurityChallenge,
    Navigation,
    PeriodUnavailable,
    Download,
    Connection,
    Write,
    Validation,
    Parse,
    Registry,
    Browser,
    Config,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::SecurityChallenge => "SecurityChallengeError",
            ErrorKind::Navigation => "NavigationError",
            ErrorKind::PeriodUnavailable => "PeriodUnavailableError",
            ErrorKind::Download => "DownloadError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Write => "WriteError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::Registry => "RegistryError",
            ErrorKind::Browser => "BrowserError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Io => "IoError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-sink failures collected after every requested sink was attempted.
#[derive(Debug)]
pub struct SinkFailures(pub Vec<SinkError>);

impl fmt::Display for SinkFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, error) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Sinks(SinkFailures),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("workspace error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Validation(_) => ErrorKind::Validation,
            WorkflowError::Portal(err) => match err {
                PortalError::Authentication(_) => ErrorKind::Authentication,
                PortalError::SecurityChallenge { .. } => ErrorKind::SecurityChallenge,
                PortalError::Navigation { .. } => ErrorKind::Navigation,
                PortalError::PeriodUnavailable(_) => ErrorKind::PeriodUnavailable,
                PortalError::Download(_) => ErrorKind::Download,
                PortalError::Browser { .. } => ErrorKind::Browser,
            },
            WorkflowError::Browser(_) => ErrorKind::Browser,
            WorkflowError::Parse(_) => ErrorKind::Parse,
            WorkflowError::Sinks(failures) => failures
                .0
                .first()
                .map(sink_kind)
                .unwrap_or(ErrorKind::Write),
            WorkflowError::Registry(_) => ErrorKind::Registry,
            WorkflowError::Config(_) => ErrorKind::Config,
            WorkflowError::Io(_) => ErrorKind::Io,
        }
    }

    /// `"<Kind>: <detail>"`, the message stored on failed tasks.
    pub fn task_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

fn sink_kind(error: &SinkError) -> ErrorKind {
    match error {
        SinkError::Write { .. } => ErrorKind::Write,
        SinkError::Connection { .. } | SinkError::Query { .. } | SinkError::NotConnected(_) => {
            ErrorKind::Connection
        }
    }
}

impl From<SinkError> for WorkflowError {
    fn from(err: SinkError) -> Self {
        WorkflowError::Sinks(SinkFailures(vec![err]))
    }
}
