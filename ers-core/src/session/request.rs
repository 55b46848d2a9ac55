use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::navigation::Period;
use crate::sink::SinkRegistry;
use crate::task::{WorkflowKind, WorkflowRequest};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workflow `select` requires both month and year")]
    MissingPeriod,
    #[error("month {0} is outside 1-12")]
    InvalidMonth(u32),
    #[error("period {0} has not started yet")]
    FuturePeriod(Period),
    #[error("unknown sink `{0}`")]
    UnknownSink(String),
}

/// A request checked against the registered sinks and resolved to a
/// concrete period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedRequest {
    pub workflow: WorkflowKind,
    pub sinks: Vec<String>,
    pub target: Period,
    pub current: Period,
    pub delta: bool,
    pub keep: bool,
}

/// Resolves `request` against the clock. Sink names keep their first
/// occurrence order; duplicates are dropped.
pub fn validate_request(
    request: &WorkflowRequest,
    sinks: &SinkRegistry,
    now: DateTime<Utc>,
) -> Result<ValidatedRequest, ValidationError> {
    let current = Period::containing(&now);
    let target = match request.workflow {
        WorkflowKind::Current => current,
        WorkflowKind::Previous => current.previous(),
        WorkflowKind::Select => {
            let (Some(month), Some(year)) = (request.month, request.year) else {
                return Err(ValidationError::MissingPeriod);
            };
            let period = Period::new(year, month).ok_or(ValidationError::InvalidMonth(month))?;
            if period > current {
                return Err(ValidationError::FuturePeriod(period));
            }
            period
        }
    };

    let mut names: Vec<String> = Vec::with_capacity(request.sinks.len());
    for name in &request.sinks {
        let name = name.trim();
        if !sinks.contains(name) {
            return Err(ValidationError::UnknownSink(name.to_string()));
        }
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_string());
        }
    }

    Ok(ValidatedRequest {
        workflow: request.workflow,
        sinks: names,
        target,
        current,
        delta: request.delta,
        keep: request.keep,
    })
}
