use thiserror::Error;

use crate::browser::BrowserError;

use super::state::NavState;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("invalid credentials: {0}")]
    Authentication(String),
    #[error("security challenge shown during {step}")]
    SecurityChallenge { step: NavState },
    #[error("{step}: {detail}")]
    Navigation { step: NavState, detail: String },
    #[error("{0}")]
    PeriodUnavailable(String),
    #[error("{0}")]
    Download(String),
    #[error("{step}: browser failure: {source}")]
    Browser {
        step: NavState,
        #[source]
        source: BrowserError,
    },
}

impl PortalError {
    pub fn navigation(step: NavState, detail: impl Into<String>) -> Self {
        PortalError::Navigation {
            step,
            detail: detail.into(),
        }
    }

    pub fn browser(step: NavState) -> impl FnOnce(BrowserError) -> PortalError {
        move |source| PortalError::Browser { step, source }
    }
}
