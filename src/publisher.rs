use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use crossbeam_channel::Receiver;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::aggregate::{merge_match, MergedView};
use crate::archive::{finalize, ArchiveSink};
use crate::hub::{BroadcastHub, Frame, Notice};
use crate::registry::{GameRecord, GameRegistry, MatchKey};
use crate::snapshot::{
    build_digest, game_snapshot, write_snapshot, GameSnapshot, SnapshotDocument,
};
use crate::uploads::UploadStore;

pub struct Publisher {
    pub registry: Arc<GameRegistry>,
    pub uploads: Arc<UploadStore>,
    pub hub: Arc<BroadcastHub>,
    pub archive: Arc<dyn ArchiveSink>,
    pub snapshot_path: PathBuf,
    pub started: Instant,
}

impl Publisher {
    /// Merged views of every confirmed match against the current textual
    /// streams.
    pub fn views(&self) -> Vec<(GameRecord, MergedView)> {
        let streams = self.uploads.views();
        self.registry
            .confirmed()
            .into_iter()
            .map(|record| {
                let merged = merge_match(&record, &streams);
                (record, merged)
            })
            .collect()
    }

    fn write_current_snapshot(&self) {
        let views = self.views();
        let games: Vec<GameSnapshot> = views
            .iter()
            .map(|(record, merged)| game_snapshot(record, merged))
            .collect();
        let merged_only: Vec<MergedView> =
            views.into_iter().map(|(_, merged)| merged).collect();
        let document = SnapshotDocument {
            updated: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            tracker_version: env!("CARGO_PKG_VERSION").to_owned(),
            games,
            gamelog: build_digest(&merged_only, &self.uploads.views()),
        };
        // Snapshot writes are best-effort; a failed write is invisible to
        // the rest of the tracker.
        if let Err(err) = write_snapshot(&self.snapshot_path, &document) {
            debug!(%err, path = %self.snapshot_path.display(), "snapshot write failed");
        }
    }

    fn broadcast_game(&self, kind: &str, key: &MatchKey) {
        let streams = self.uploads.views();
        if let Some(record) = self.registry.get_clone(key) {
            let merged = merge_match(&record, &streams);
            let snapshot = game_snapshot(&record, &merged);
            self.hub.broadcast(&Frame::new(kind, json!({ "game": snapshot })));
        }
    }

    fn broadcast_summary(&self) {
        let merged_only: Vec<MergedView> =
            self.views().into_iter().map(|(_, merged)| merged).collect();
        let digest = build_digest(&merged_only, &self.uploads.views());
        self.hub
            .broadcast(&Frame::new("game_summary", json!({ "gamelog": digest })));
    }

    fn handle(&self, notice: Notice) {
        match notice {
            Notice::GameNew(key) => {
                self.broadcast_game("game_new", &key);
                self.write_current_snapshot();
            }
            Notice::GameUpdate(key) => {
                self.broadcast_game("game_update", &key);
                self.write_current_snapshot();
            }
            Notice::GameRemoved(record) => {
                self.hub.broadcast(&Frame::new(
                    "game_removed",
                    json!({
                        "key": record.key.to_string(),
                        "gameId": record.game_id,
                    }),
                ));
                self.archive_record(&record);
                self.write_current_snapshot();
            }
            Notice::GameEvent { key, event } => {
                self.hub.broadcast(&Frame::new(
                    "game_event",
                    json!({
                        "key": key.to_string(),
                        "event": event,
                    }),
                ));
                self.broadcast_summary();
                self.write_current_snapshot();
            }
            Notice::GamelogReset => {
                self.hub
                    .broadcast(&Frame::new("gamelog_reset", json!({})));
                self.broadcast_summary();
                self.write_current_snapshot();
            }
            Notice::SnapshotDirty => {
                self.broadcast_summary();
                self.write_current_snapshot();
            }
        }
    }

    /// One-shot handoff to the archive sink. Failures are logged; live state
    /// has already moved on and reaps never retry.
    fn archive_record(&self, record: &GameRecord) {
        let streams = self.uploads.views();
        let merged = merge_match(record, &streams);
        let finalized = finalize(record, &merged, Instant::now());
        let events = merged.timeline.clone();
        info!(id = %finalized.id, key = %record.key, "archiving finished game");
        if let Err(err) = self.archive.save(&finalized, &events) {
            warn!(%err, id = %finalized.id, "archive sink failed");
        }
    }
}

/// Bus consumer loop; runs on its own thread until every producer is gone
/// or the shutdown flag is raised, draining one final snapshot on the way
/// out.
pub fn run_publisher(
    publisher: Publisher,
    notices: Receiver<Notice>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
) {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    loop {
        match notices.recv_timeout(Duration::from_millis(500)) {
            Ok(notice) => publisher.handle(notice),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    publisher.write_current_snapshot();
    debug!("publisher drained and stopped");
}
