use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::{sleep, Instant};
use tracing::trace;

const PARTIAL_SUFFIXES: &[&str] = &["crdownload", "part", "tmp"];

/// Polls `dir` until it holds at least one finished file and no partial
/// downloads. Returns the most recently modified finished file, or `None`
/// once `timeout` elapses.
pub async fn poll_for_download(
    dir: &Path,
    timeout: Duration,
    poll: Duration,
) -> std::io::Result<Option<PathBuf>> {
    let deadline = Instant::now() + timeout;
    loop {
        let scan = scan_dir(dir).await?;
        trace!(
            dir = %dir.display(),
            partial = scan.partial,
            finished = scan.finished.len(),
            "download directory scan"
        );
        if scan.partial == 0 {
            if let Some(path) = newest(scan.finished) {
                return Ok(Some(path));
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        sleep(poll).await;
    }
}

struct DirScan {
    partial: usize,
    finished: Vec<(PathBuf, SystemTime)>,
}

async fn scan_dir(dir: &Path) -> std::io::Result<DirScan> {
    let mut scan = DirScan {
        partial: 0,
        finished: Vec::new(),
    };
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
        Err(err) => return Err(err),
    };
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let path = entry.path();
        if is_partial(&path) {
            scan.partial += 1;
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        scan.finished.push((path, modified));
    }
    Ok(scan)
}

fn is_partial(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| PARTIAL_SUFFIXES.contains(&ext))
        .unwrap_or(false)
}

fn newest(files: Vec<(PathBuf, SystemTime)>) -> Option<PathBuf> {
    files
        .into_iter()
        .max_by_key(|(_, modified)| *modified)
        .map(|(path, _)| path)
}
