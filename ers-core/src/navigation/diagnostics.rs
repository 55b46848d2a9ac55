use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::PortalSession;

use super::state::NavState;

/// Files written for one failed navigation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticSnapshot {
    pub step: NavState,
    pub screenshot: Option<PathBuf>,
    pub page_source: Option<PathBuf>,
}

impl DiagnosticSnapshot {
    pub fn is_empty(&self) -> bool {
        self.screenshot.is_none() && self.page_source.is_none()
    }
}

pub fn snapshot_paths(dir: &Path, task_id: &Uuid, step: NavState) -> (PathBuf, PathBuf) {
    let stem = format!("{task_id}_{}", step.as_str());
    (
        dir.join(format!("{stem}.png")),
        dir.join(format!("{stem}.html")),
    )
}

/// Captures a screenshot and DOM dump for `step`. Capture failures are
/// logged; the snapshot only lists files that were actually written.
pub async fn capture(
    session: &mut dyn PortalSession,
    dir: &Path,
    task_id: &Uuid,
    step: NavState,
) -> DiagnosticSnapshot {
    let (png_path, html_path) = snapshot_paths(dir, task_id, step);
    if let Err(err) = fs::create_dir_all(dir).await {
        warn!(dir = %dir.display(), error = %err, "cannot create diagnostics directory");
    }

    let screenshot = match session.screenshot().await {
        Ok(bytes) => write_file(&png_path, &bytes).await,
        Err(err) => {
            warn!(%task_id, step = %step, error = %err, "screenshot capture failed");
            None
        }
    };
    let page_source = match session.page_source().await {
        Ok(markup) => write_file(&html_path, markup.as_bytes()).await,
        Err(err) => {
            warn!(%task_id, step = %step, error = %err, "page source capture failed");
            None
        }
    };

    let snapshot = DiagnosticSnapshot {
        step,
        screenshot,
        page_source,
    };
    if !snapshot.is_empty() {
        info!(%task_id, step = %step, dir = %dir.display(), "diagnostic snapshot captured");
    }
    snapshot
}

async fn write_file(path: &Path, bytes: &[u8]) -> Option<PathBuf> {
    match fs::write(path, bytes).await {
        Ok(()) => Some(path.to_path_buf()),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot write diagnostic file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_names_follow_task_and_step() {
        let id = Uuid::parse_str("3f2a9c1e-7b4d-4e2a-9f10-5c6d7e8f9a0b").unwrap();
        let (png, html) = snapshot_paths(Path::new("diag"), &id, NavState::LocatingMeter);
        assert_eq!(
            png,
            Path::new("diag/3f2a9c1e-7b4d-4e2a-9f10-5c6d7e8f9a0b_locating_meter.png")
        );
        assert_eq!(
            html,
            Path::new("diag/3f2a9c1e-7b4d-4e2a-9f10-5c6d7e8f9a0b_locating_meter.html")
        );
    }
}
