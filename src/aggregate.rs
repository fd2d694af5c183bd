use std::collections::HashMap;

use serde::Serialize;

use crate::codec::MAX_PLAYER_SLOTS;
use crate::events::GameEvent;
use crate::gamelog::LogEvent;
use crate::registry::GameRecord;
use crate::uploads::StreamView;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedPlayer {
    pub name: String,
    pub slot: u8,
    pub connected: bool,
    pub kills: u32,
    pub deaths: u32,
    pub suicides: u32,
    pub score: i32,
}

/// One match as the dashboard sees it: authoritative full-info numbers where
/// available, never regressing below what the event streams already showed.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedView {
    pub players: Vec<MergedPlayer>,
    pub kill_matrix_by_name: HashMap<String, HashMap<String, u32>>,
    pub kill_feed: Vec<GameEvent>,
    pub chat: Vec<GameEvent>,
    pub timeline: Vec<GameEvent>,
    pub damage_by_weapon: HashMap<String, u32>,
    pub total_kills: u32,
    pub total_deaths: u32,
    pub total_suicides: u32,
}

pub fn merge_match(record: &GameRecord, streams: &[StreamView]) -> MergedView {
    let names = record.display_names();
    let store_summary = record.events.summary();

    let mut players = Vec::new();
    if let Some(full) = &record.full {
        for (index, slot) in full.slots.iter().take(MAX_PLAYER_SLOTS).enumerate() {
            if !slot.is_present() {
                continue;
            }
            let name = names
                .get(index)
                .filter(|name| !name.is_empty())
                .cloned()
                .unwrap_or_else(|| format!("Player {index}"));
            let textual = textual_totals(streams, &name);
            let full_kills = u32::try_from(full.total_kills[index].max(0)).unwrap_or(0);
            let full_deaths = u32::try_from(full.total_deaths[index].max(0)).unwrap_or(0);
            players.push(MergedPlayer {
                kills: full_kills
                    .max(record.events.slot_kills()[index])
                    .max(textual.0),
                deaths: full_deaths
                    .max(record.events.slot_deaths()[index])
                    .max(textual.1),
                suicides: record.events.slot_suicides()[index].max(textual.2),
                score: full.scores[index],
                name,
                slot: index as u8,
                connected: slot.connected,
            });
        }
    }

    let kill_matrix_by_name = if let Some(full) = &record.full {
        let mut matrix = HashMap::new();
        for killer in 0..MAX_PLAYER_SLOTS {
            let killer_name = match names.get(killer) {
                Some(name) if !name.is_empty() => name.clone(),
                _ => continue,
            };
            for victim in 0..MAX_PLAYER_SLOTS {
                let victim_name = match names.get(victim) {
                    Some(name) if !name.is_empty() => name.clone(),
                    _ => continue,
                };
                let count = full.kill_matrix[killer][victim];
                if count > 0 {
                    matrix
                        .entry(killer_name.clone())
                        .or_insert_with(HashMap::new)
                        .insert(victim_name, count as u32);
                }
            }
        }
        matrix
    } else {
        store_summary.kill_matrix_by_name.clone()
    };

    let timeline = merge_timeline(record, streams);
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

    let mut damage_by_weapon = store_summary.damage_by_weapon.clone();
    for view in streams {
        for totals in view.summary.totals.values() {
            for (weapon, count) in &totals.weapons {
                let entry = damage_by_weapon.entry(weapon.clone()).or_default();
                *entry = (*entry).max(*count);
            }
        }
    }

    let (total_kills, total_deaths, total_suicides) = if players.is_empty() {
        (
            store_summary.total_kills,
            store_summary.total_deaths,
            store_summary.total_suicides,
        )
    } else {
        players.iter().fold((0, 0, 0), |acc, player| {
            (
                acc.0 + player.kills,
                acc.1 + player.deaths,
                acc.2 + player.suicides,
            )
        })
    };

    MergedView {
        players,
        kill_matrix_by_name,
        kill_feed,
        chat,
        timeline,
        damage_by_weapon,
        total_kills,
        total_deaths,
        total_suicides,
    }
}

fn textual_totals(streams: &[StreamView], name: &str) -> (u32, u32, u32) {
    let mut kills = 0u32;
    let mut deaths = 0u32;
    let mut suicides = 0u32;
    for view in streams {
        if let Some(totals) = view.summary.totals.get(name) {
            kills = kills.max(totals.kills);
            deaths = deaths.max(totals.deaths);
            suicides = suicides.max(totals.suicides);
        }
    }
    (kills, deaths, suicides)
}

/// Union of the UDP timeline and every textual stream. Kills are matched by
/// participant names with per-pair counting, so the same kill observed over
/// UDP and by K uploaders still lands exactly once; other event types dedup
/// on their merge key.
fn merge_timeline(record: &GameRecord, streams: &[StreamView]) -> Vec<GameEvent> {
    let mut merged: Vec<GameEvent> = record.events.timeline.iter().cloned().collect();

    let mut udp_kill_counts: HashMap<(String, String), u32> = HashMap::new();
    for event in &merged {
        if let GameEvent::Kill { killer, victim, .. } = event {
            *udp_kill_counts
                .entry((killer.clone(), victim.clone()))
                .or_default() += 1;
        }
    }

    let mut seen_keys: std::collections::HashSet<_> =
        merged.iter().map(GameEvent::merge_key).collect();

    // Per (killer, victim) pair, the most complete single observer wins;
    // uploads are not summed with each other.
    let mut textual_kill_counts: HashMap<(String, String), u32> = HashMap::new();
    let mut textual_kill_samples: HashMap<(String, String), GameEvent> = HashMap::new();
    let mut textual_other: Vec<GameEvent> = Vec::new();

    for view in streams {
        let mut stream_counts: HashMap<(String, String), u32> = HashMap::new();
        for event in &view.events {
            let converted = textual_event(event, view.last_update);
            match &converted {
                GameEvent::Kill { killer, victim, .. } => {
                    let pair = (killer.clone(), victim.clone());
                    *stream_counts.entry(pair.clone()).or_default() += 1;
                    textual_kill_samples.entry(pair).or_insert(converted);
                }
                _ => textual_other.push(converted),
            }
        }
        for (pair, count) in stream_counts {
            let entry = textual_kill_counts.entry(pair).or_default();
            *entry = (*entry).max(count);
        }
    }

    for (pair, count) in textual_kill_counts {
        let already = udp_kill_counts.get(&pair).copied().unwrap_or(0);
        let missing = count.saturating_sub(already);
        if missing == 0 {
            continue;
        }
        let sample = textual_kill_samples
            .get(&pair)
            .cloned()
            .expect("sample recorded alongside count");
        for _ in 0..missing {
            merged.push(sample.clone());
        }
    }

    for event in textual_other {
        let key = event.merge_key();
        if seen_keys.insert(key) {
            merged.push(event);
        }
    }

    merged.sort_by_key(|event| event.game_time_us().unwrap_or(0));
    merged
}

/// Lifts a parsed gamelog line into the shared event shape; textual events
/// carry no slot indices or game time.
pub fn textual_event(event: &LogEvent, at: chrono::DateTime<chrono::Utc>) -> GameEvent {
    match event {
        LogEvent::Kill {
            killer,
            victim,
            weapon,
        } => GameEvent::Kill {
            killer_slot: None,
            victim_slot: None,
            killer: killer.clone(),
            victim: victim.clone(),
            weapon: weapon.clone(),
            weapon_type: None,
            weapon_id: None,
            game_time_us: None,
            at,
        },
        LogEvent::Suicide { name } => GameEvent::Kill {
            killer_slot: None,
            victim_slot: None,
            killer: name.clone(),
            victim: name.clone(),
            weapon: None,
            weapon_type: None,
            weapon_id: None,
            game_time_us: None,
            at,
        },
        LogEvent::Death { name, .. } => GameEvent::Death {
            slot: None,
            name: name.clone(),
            game_time_us: None,
            at,
        },
        LogEvent::Quit { name } => GameEvent::Quit {
            slot: None,
            name: name.clone(),
            game_time_us: None,
            at,
        },
        LogEvent::Join { name } => GameEvent::Join {
            name: name.clone(),
            at,
        },
        LogEvent::Escape { name } => GameEvent::Escape {
            name: Some(name.clone()),
            at,
        },
        LogEvent::ReactorDestroyed => GameEvent::ReactorDestroyed { at },
        LogEvent::FlagCaptured { name } => GameEvent::FlagCaptured {
            name: Some(name.clone()),
            at,
        },
        LogEvent::KillGoal => GameEvent::KillGoal { at },
        LogEvent::Chat { sender, text } => GameEvent::Chat {
            sender_slot: None,
            sender: sender.clone(),
            text: text.clone(),
            is_observer: false,
            game_time_us: None,
            at,
        },
    }
}
