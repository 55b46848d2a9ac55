mod controller;
mod error;
mod request;
mod worker;
mod workspace;

pub use controller::{Clock, SessionController, TaskReport, HEARTBEAT_INTERVAL};
pub use error::{ErrorKind, SinkFailures, WorkflowError};
pub use request::{validate_request, ValidatedRequest, ValidationError};
pub use worker::{RecoveryReport, TaskDispatcher, TaskResult, INTERRUPTED_MESSAGE, STALE_AFTER};
pub use workspace::Workspace;
