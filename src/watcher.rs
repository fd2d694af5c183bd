use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::hub::Notice;
use crate::uploads::UploadStore;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Stream name used when no local player identity is configured.
const DEFAULT_IDENTITY: &str = "local";

#[derive(Debug, PartialEq, Eq)]
enum ScanOutcome {
    Unchanged,
    Grew(String),
    /// The file shrank: a new match started writing over the old log.
    Truncated,
}

/// Reads whatever appeared past `offset`, advancing it. A shrink resets the
/// offset to zero and reports `Truncated` without consuming content; the
/// caller re-scans after clearing its stream.
fn scan_file(path: &Path, offset: &mut u64) -> ScanOutcome {
    let Ok(metadata) = std::fs::metadata(path) else {
        return ScanOutcome::Unchanged;
    };
    let len = metadata.len();
    if len < *offset {
        *offset = 0;
        return ScanOutcome::Truncated;
    }
    if len == *offset {
        return ScanOutcome::Unchanged;
    }
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            debug!(%err, path = %path.display(), "failed opening gamelog");
            return ScanOutcome::Unchanged;
        }
    };
    if file.seek(SeekFrom::Start(*offset)).is_err() {
        return ScanOutcome::Unchanged;
    }
    let mut raw = Vec::with_capacity((len - *offset) as usize);
    if let Err(err) = file.read_to_end(&mut raw) {
        warn!(%err, path = %path.display(), "failed reading gamelog tail");
        return ScanOutcome::Unchanged;
    }
    *offset += raw.len() as u64;
    ScanOutcome::Grew(String::from_utf8_lossy(&raw).into_owned())
}

struct WatchedFile {
    path: PathBuf,
    offset: u64,
}

/// Polls every candidate `gamelog.txt` and feeds growth into the upload
/// store under the local identity. Content that predates startup is skipped
/// by seeding the offset with the initial file size.
pub async fn run_gamelog_watcher(
    dirs: Vec<PathBuf>,
    local_player: Option<String>,
    uploads: Arc<UploadStore>,
    notices: Sender<Notice>,
) {
    let identity = local_player
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_IDENTITY.to_owned());

    let mut files: Vec<WatchedFile> = Vec::new();
    for dir in &dirs {
        let path = dir.join("gamelog.txt");
        if let Ok(metadata) = std::fs::metadata(&path) {
            info!(path = %path.display(), size = metadata.len(), "watching gamelog");
            files.push(WatchedFile {
                path,
                offset: metadata.len(),
            });
        }
    }
    if files.is_empty() {
        info!(dirs = dirs.len(), "no gamelog.txt found yet; will keep scanning");
    }

    loop {
        // Pick up files that appear after startup, from their beginning.
        for dir in &dirs {
            let path = dir.join("gamelog.txt");
            if files.iter().all(|file| file.path != path) && path.is_file() {
                info!(path = %path.display(), "new gamelog appeared");
                files.push(WatchedFile { path, offset: 0 });
            }
        }

        for file in &mut files {
            match scan_file(&file.path, &mut file.offset) {
                ScanOutcome::Unchanged => {}
                ScanOutcome::Grew(chunk) => {
                    match uploads.append(&identity, &chunk) {
                        Ok(stats) if stats.new_events > 0 => {
                            debug!(
                                path = %file.path.display(),
                                new_events = stats.new_events,
                                "local gamelog grew"
                            );
                            let _ = notices.send(Notice::SnapshotDirty);
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "local gamelog chunk failed to parse"),
                    }
                }
                ScanOutcome::Truncated => {
                    info!(path = %file.path.display(), "gamelog shrank, starting a new stream");
                    uploads.reset(&identity);
                    let _ = notices.send(Notice::GamelogReset);
                }
            }
        }

        sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn scan_reads_only_new_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gamelog.txt");
        std::fs::write(&path, "old line\n").expect("seed file");

        let mut offset = std::fs::metadata(&path).expect("metadata").len();
        assert_eq!(scan_file(&path, &mut offset), ScanOutcome::Unchanged);

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open for append");
        writeln!(file, "You killed bob").expect("append");
        drop(file);

        match scan_file(&path, &mut offset) {
            ScanOutcome::Grew(chunk) => assert_eq!(chunk, "You killed bob\n"),
            other => panic!("expected growth, got {other:?}"),
        }
        assert_eq!(scan_file(&path, &mut offset), ScanOutcome::Unchanged);
    }

    #[test]
    fn shrink_reports_truncation_then_rereads_from_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gamelog.txt");
        std::fs::write(&path, "a much longer first match log\n").expect("seed file");
        let mut offset = std::fs::metadata(&path).expect("metadata").len();

        std::fs::write(&path, "fresh\n").expect("truncate");
        assert_eq!(scan_file(&path, &mut offset), ScanOutcome::Truncated);
        match scan_file(&path, &mut offset) {
            ScanOutcome::Grew(chunk) => assert_eq!(chunk, "fresh\n"),
            other => panic!("expected growth after truncation, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut offset = 0;
        assert_eq!(
            scan_file(&dir.path().join("gamelog.txt"), &mut offset),
            ScanOutcome::Unchanged
        );
    }
}
