use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-task staging directory the browser downloads into.
#[derive(Debug)]
pub struct Workspace {
    task_id: Uuid,
    dir: PathBuf,
}

impl Workspace {
    pub async fn create(root: &Path, task_id: Uuid) -> io::Result<Self> {
        let dir = root.join(task_id.to_string());
        fs::create_dir_all(&dir).await?;
        debug!(%task_id, dir = %dir.display(), "workspace created");
        Ok(Self { task_id, dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deletes the export and the directory once empty. Permission
    /// problems are logged and otherwise ignored.
    pub async fn discard(self, export: &Path) {
        if let Err(err) = fs::remove_file(export).await {
            self.log_cleanup_failure("remove export", export, &err);
        }
        if let Err(err) = fs::remove_dir(&self.dir).await {
            self.log_cleanup_failure("remove workspace", &self.dir, &err);
        }
    }

    /// Moves the export to `<output_dir>/<task_id>/` and returns its new
    /// path.
    pub async fn retain(self, export: &Path, output_dir: &Path) -> io::Result<PathBuf> {
        let destination_dir = output_dir.join(self.task_id.to_string());
        fs::create_dir_all(&destination_dir).await?;
        let file_name = export
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "export has no file name"))?;
        let destination = destination_dir.join(file_name);
        move_file(export, &destination).await?;
        info!(task_id = %self.task_id, path = %destination.display(), "export retained");
        if let Err(err) = fs::remove_dir(&self.dir).await {
            self.log_cleanup_failure("remove workspace", &self.dir, &err);
        }
        Ok(destination)
    }

    /// Removes the workspace with whatever partial downloads it holds.
    pub async fn abandon(self) {
        if let Err(err) = fs::remove_dir_all(&self.dir).await {
            self.log_cleanup_failure("remove workspace", &self.dir, &err);
        }
    }

    fn log_cleanup_failure(&self, action: &str, path: &Path, err: &io::Error) {
        match err.kind() {
            io::ErrorKind::NotFound => {}
            io::ErrorKind::PermissionDenied => {
                warn!(task_id = %self.task_id, path = %path.display(), error = %err, "{action}: permission denied");
            }
            _ => {
                warn!(task_id = %self.task_id, path = %path.display(), error = %err, "{action} failed");
            }
        }
    }
}

async fn move_file(source: &Path, destination: &Path) -> io::Result<()> {
    match fs::rename(source, destination).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            // rename does not cross filesystems
            debug!(error = %err, "rename failed, copying export instead");
            fs::copy(source, destination).await?;
            fs::remove_file(source).await
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discard_removes_export_and_directory() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path(), Uuid::new_v4()).await.unwrap();
        let dir = workspace.dir().to_path_buf();
        let export = dir.join("2023_3_abcd1234_readings.xlsx");
        std::fs::write(&export, b"xlsx").unwrap();
        workspace.discard(&export).await;
        assert!(!export.exists());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn retain_moves_export_under_task_id() {
        let root = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let task_id = Uuid::new_v4();
        let workspace = Workspace::create(root.path(), task_id).await.unwrap();
        let dir = workspace.dir().to_path_buf();
        let export = dir.join("2023_3_abcd1234_readings.xlsx");
        std::fs::write(&export, b"xlsx").unwrap();

        let kept = workspace.retain(&export, output.path()).await.unwrap();
        assert_eq!(
            kept,
            output
                .path()
                .join(task_id.to_string())
                .join("2023_3_abcd1234_readings.xlsx")
        );
        assert_eq!(std::fs::read(&kept).unwrap(), b"xlsx");
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn discard_tolerates_read_only_workspace() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path(), Uuid::new_v4()).await.unwrap();
        let dir = workspace.dir().to_path_buf();
        let export = dir.join("2023_3_abcd1234_readings.xlsx");
        std::fs::write(&export, b"xlsx").unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o555)).unwrap();
        let restore = || std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755));

        // privileged users ignore directory permissions
        if std::fs::write(dir.join("write_check"), b"").is_ok() {
            restore().unwrap();
            return;
        }

        workspace.discard(&export).await;
        assert!(export.exists());
        assert!(dir.exists());
        restore().unwrap();
    }

    #[tokio::test]
    async fn abandon_removes_partial_downloads() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path(), Uuid::new_v4()).await.unwrap();
        let dir = workspace.dir().to_path_buf();
        std::fs::write(dir.join("export.xlsx.crdownload"), b"partial").unwrap();
        workspace.abandon().await;
        assert!(!dir.exists());
    }
}
