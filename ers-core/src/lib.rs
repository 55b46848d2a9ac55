pub mod browser;
pub mod config;
pub mod error;
pub mod navigation;
pub mod readings;
pub mod session;
pub mod sink;
pub mod sqlite;
pub mod task;

pub use browser::{
    BrowserError, BrowserLauncher, BrowserResult, Locator, PortalSession, PortalSessionFactory,
};
pub use config::{load_config, parse_config, ErsConfig, ResolvedPaths};
pub use error::{ConfigError, Result};
pub use navigation::{
    DiagnosticSnapshot, MonthLabels, NavState, NavigationPlan, Navigator, NavigatorSettings,
    Period, PortalError,
};
pub use readings::{
    reconcile, sentinel_epoch, ExportParser, ParseError, Reading, XlsxExportParser,
};
pub use session::{
    ErrorKind, RecoveryReport, SessionController, TaskDispatcher, TaskReport, ValidationError,
    WorkflowError,
};
pub use sink::{DuckDbSink, InfluxSink, Sink, SinkError, SinkRegistry, SinkResult};
pub use task::{
    RegistryError, SinkOutcome, Task, TaskRegistry, TaskStatus, TaskStatusRecord, TaskUpdate,
    WorkflowKind, WorkflowRequest,
};
