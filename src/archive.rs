use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::aggregate::MergedView;
use crate::events::GameEvent;
use crate::registry::GameRecord;
use crate::snapshot::{game_snapshot, GameSnapshot};

/// A finished match as handed to the archive sink: the live schema plus the
/// total duration and a filename-style id the dashboard can look games up by.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedMatch {
    pub id: String,
    pub duration_secs: u64,
    #[serde(flatten)]
    pub game: GameSnapshot,
}

pub fn finalize(record: &GameRecord, merged: &MergedView, now: std::time::Instant) -> FinalizedMatch {
    let game = game_snapshot(record, merged);
    FinalizedMatch {
        id: filename_id(&game.game_name, record.first_registered),
        duration_secs: now
            .saturating_duration_since(record.created_at)
            .as_secs(),
        game,
    }
}

/// `<slug>-DD-MM-YYYY-HH-MM-SS`, the timestamp shape archived game pages
/// are matched by.
fn filename_id(game_name: &str, started: DateTime<Utc>) -> String {
    let slug: String = game_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    let stamp = started.format("%d-%m-%Y-%H-%M-%S");
    if slug.is_empty() {
        format!("game-{stamp}")
    } else {
        format!("{slug}-{stamp}")
    }
}

/// Long-term storage capability. The tracker calls it fire-and-forget; a
/// failing sink must never stall or roll back live state.
pub trait ArchiveSink: Send + Sync {
    fn save(&self, game: &FinalizedMatch, events: &[GameEvent]) -> Result<()>;
}

/// Discards everything; used in tests and when archival is disabled.
#[derive(Debug, Default)]
pub struct NullSink;

impl ArchiveSink for NullSink {
    fn save(&self, _game: &FinalizedMatch, _events: &[GameEvent]) -> Result<()> {
        Ok(())
    }
}

/// Writes one JSON document per finished match into a directory.
#[derive(Debug)]
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl ArchiveSink for JsonDirSink {
    fn save(&self, game: &FinalizedMatch, events: &[GameEvent]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed creating archive dir {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.json", game.id));
        let payload = serde_json::to_vec(&json!({
            "game": game,
            "events": events,
        }))
        .context("failed serializing archived game")?;
        fs::write(&path, payload)
            .with_context(|| format!("failed writing archived game {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn filename_id_slugs_and_stamps() {
        let started = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 2).unwrap();
        assert_eq!(
            filename_id("1v1 Wrath!", started),
            "1v1-wrath-14-03-2026-15-09-02"
        );
        assert_eq!(filename_id("", started), "game-14-03-2026-15-09-02");
    }

    #[test]
    fn json_dir_sink_writes_one_file_per_match() {
        use crate::codec::{DxxVersion, RegisterPacket, Release};
        use crate::registry::{GameRegistry, MatchKey};

        let registry = GameRegistry::new();
        let source: std::net::SocketAddr = "203.0.113.7:55000".parse().expect("addr");
        registry.upsert_on_register(
            source,
            &RegisterPacket {
                tracker_ver: 0,
                version: DxxVersion::D1,
                game_port: 5000,
                game_id: 7,
                release: Release {
                    major: 1,
                    minor: 3,
                    micro: 2,
                },
            },
        );
        let record = registry
            .get_clone(&MatchKey::new(source.ip(), 5000))
            .expect("record");
        let finalized = finalize(&record, &MergedView::default(), std::time::Instant::now());

        let dir = tempfile::tempdir().expect("tempdir");
        let sink = JsonDirSink::new(dir.path().to_path_buf());
        sink.save(&finalized, &[]).expect("archive should write");
        let path = dir.path().join(format!("{}.json", finalized.id));
        let text = fs::read_to_string(path).expect("archived game should exist");
        let parsed: serde_json::Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(parsed["game"]["gameId"], 7);
        assert!(parsed["events"].is_array());
    }
}
