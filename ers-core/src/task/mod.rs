mod error;
mod models;
mod registry;

pub use error::{RegistryError, RegistryResult};
pub use models::{
    SinkOutcome, SinkOutcomeStatus, Task, TaskStatus, TaskStatusRecord, TaskUpdate, WorkflowKind,
    WorkflowRequest,
};
pub use registry::{TaskRegistry, TaskRegistryBuilder};
