mod automation;
mod download;
mod error;
mod session;

pub use automation::{BrowserLauncher, ChromiumSession};
pub use download::poll_for_download;
pub use error::{BrowserError, BrowserResult};
pub use session::{wait_until_visible, Locator, PortalSession, PortalSessionFactory};
