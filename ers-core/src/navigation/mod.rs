mod diagnostics;
mod error;
mod navigator;
mod period;
mod state;

pub use diagnostics::{capture, snapshot_paths, DiagnosticSnapshot};
pub use error::PortalError;
pub use navigator::{
    NavigationFailure, NavigationOutcome, NavigationPlan, Navigator, NavigatorSettings,
    PortalLocators,
};
pub use period::{short_task_id, year_steps, MonthLabels, Period};
pub use state::NavState;
