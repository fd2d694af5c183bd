use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregate::{textual_event, MergedPlayer, MergedView};
use crate::events::GameEvent;
use crate::registry::{GameRecord, Phase};
use crate::uploads::StreamView;

pub const DIGEST_KILL_CAP: usize = 50;
pub const DIGEST_TIMELINE_CAP: usize = 100;
pub const DIGEST_CHAT_CAP: usize = 50;
pub const DIGEST_WEAPON_ROWS: usize = 30;

/// One match as serialized into the snapshot file, websocket frames and the
/// games API. Consumers tolerate missing optional fields, so empty maps are
/// skipped.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub key: String,
    pub game_id: u32,
    pub version: String,
    pub release: String,
    pub netgame_proto: u16,
    pub phase: Phase,
    pub game_name: String,
    pub mission_title: String,
    pub mission_id: String,
    pub level: u32,
    pub mode: String,
    pub status: String,
    pub difficulty: u8,
    pub refuse: u8,
    pub flags: u8,
    pub player_count: u8,
    pub max_players: u8,
    pub first_registered: DateTime<Utc>,
    pub players: Vec<MergedPlayer>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub kill_matrix_by_name: HashMap<String, HashMap<String, u32>>,
    pub total_kills: u32,
    pub total_deaths: u32,
}

pub fn game_snapshot(record: &GameRecord, merged: &MergedView) -> GameSnapshot {
    let lite = record.lite.as_ref();
    let full = record.full.as_ref();
    let player_count = full
        .map(|full| full.current_players)
        .or_else(|| lite.map(|lite| lite.players))
        .unwrap_or(0);
    GameSnapshot {
        key: record.key.to_string(),
        game_id: record.game_id,
        version: record.version.to_string(),
        release: record.release.to_string(),
        netgame_proto: record.netgame_proto,
        phase: record.phase,
        game_name: record.game_name(),
        mission_title: lite
            .map(|lite| lite.mission_title.clone())
            .or_else(|| full.map(|full| full.mission_title.clone()))
            .unwrap_or_default(),
        mission_id: lite
            .map(|lite| lite.mission_id.clone())
            .or_else(|| full.map(|full| full.mission_id.clone()))
            .unwrap_or_default(),
        level: lite.map(|lite| lite.level).unwrap_or(0),
        mode: lite
            .map(|lite| lite.mode)
            .or_else(|| full.map(|full| full.mode))
            .map(|mode| mode.label())
            .unwrap_or_default(),
        status: lite
            .map(|lite| lite.status)
            .or_else(|| full.map(|full| full.status))
            .map(|status| status.label())
            .unwrap_or_default(),
        difficulty: lite.map(|lite| lite.difficulty).unwrap_or(0),
        refuse: lite.map(|lite| lite.refuse).unwrap_or(0),
        flags: lite.map(|lite| lite.flags).unwrap_or(0),
        player_count,
        max_players: lite
            .map(|lite| lite.max_players)
            .or_else(|| full.map(|full| full.max_players))
            .unwrap_or(0),
        first_registered: record.first_registered,
        players: merged.players.clone(),
        kill_matrix_by_name: merged.kill_matrix_by_name.clone(),
        total_kills: merged.total_kills,
        total_deaths: merged.total_deaths,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WeaponDamage {
    pub weapon: String,
    pub count: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GamelogDigest {
    pub total_kills: u32,
    pub total_deaths: u32,
    pub total_suicides: u32,
    pub kill_feed: Vec<GameEvent>,
    pub timeline: Vec<GameEvent>,
    pub chat: Vec<GameEvent>,
    pub damage_by_weapon: Vec<WeaponDamage>,
}

/// Top-level digest across every live match. When no match is live the
/// textual streams alone feed it, so a local player still gets a kill feed.
pub fn build_digest(views: &[MergedView], streams: &[StreamView]) -> GamelogDigest {
    let mut timeline: Vec<GameEvent> = Vec::new();
    let mut damage: HashMap<String, u32> = HashMap::new();
    let mut totals = (0u32, 0u32, 0u32);

    if views.is_empty() {
        let mut seen = std::collections::HashSet::new();
        for view in streams {
            for event in &view.events {
                let converted = textual_event(event, view.last_update);
                if seen.insert(converted.merge_key()) {
                    match &converted {
                        GameEvent::Kill { .. } if converted.is_suicide() => {
                            totals.1 += 1;
                            totals.2 += 1;
                        }
                        GameEvent::Kill { .. } => {
                            totals.0 += 1;
                            totals.1 += 1;
                        }
                        GameEvent::Death { .. } => totals.1 += 1,
                        _ => {}
                    }
                    timeline.push(converted);
                }
            }
            for player in view.summary.totals.values() {
                for (weapon, count) in &player.weapons {
                    let entry = damage.entry(weapon.clone()).or_default();
                    *entry = (*entry).max(*count);
                }
            }
        }
    } else {
        for view in views {
            timeline.extend(view.timeline.iter().cloned());
            for (weapon, count) in &view.damage_by_weapon {
                *damage.entry(weapon.clone()).or_default() += count;
            }
            totals.0 += view.total_kills;
            totals.1 += view.total_deaths;
            totals.2 += view.total_suicides;
        }
    }

    timeline.sort_by_key(|event| event.game_time_us().unwrap_or(0));

    let kill_feed: Vec<GameEvent> = timeline
        .iter()
        .filter(|event| matches!(event, GameEvent::Kill { .. }))
        .cloned()
        .collect();
    let chat: Vec<GameEvent> = timeline
        .iter()
        .filter(|event| matches!(event, GameEvent::Chat { .. }))
        .cloned()
        .collect();

    let mut damage_rows: Vec<WeaponDamage> = damage
        .into_iter()
        .map(|(weapon, count)| WeaponDamage { weapon, count })
        .collect();
    damage_rows.sort_by(|a, b| b.count.cmp(&a.count).then(a.weapon.cmp(&b.weapon)));
    damage_rows.truncate(DIGEST_WEAPON_ROWS);

    GamelogDigest {
        total_kills: totals.0,
        total_deaths: totals.1,
        total_suicides: totals.2,
        kill_feed: tail(kill_feed, DIGEST_KILL_CAP),
        timeline: tail(timeline, DIGEST_TIMELINE_CAP),
        chat: tail(chat, DIGEST_CHAT_CAP),
        damage_by_weapon: damage_rows,
    }
}

fn tail<T>(mut items: Vec<T>, cap: usize) -> Vec<T> {
    if items.len() > cap {
        items.drain(..items.len() - cap);
    }
    items
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDocument {
    pub updated: DateTime<Utc>,
    pub uptime_secs: u64,
    pub tracker_version: String,
    pub games: Vec<GameSnapshot>,
    pub gamelog: GamelogDigest,
}

/// Writes through a sibling temp file and renames, so a reader never sees a
/// truncated document.
pub fn write_snapshot(path: &Path, document: &SnapshotDocument) -> Result<()> {
    let payload = serde_json::to_vec(document).context("failed serializing snapshot")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload)
        .with_context(|| format!("failed writing snapshot temp file {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed renaming snapshot into {}", path.display()))?;
    Ok(())
}
