use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::MAX_PLAYER_SLOTS;

pub const KILL_FEED_CAP: usize = 100;
pub const CHAT_CAP: usize = 200;
pub const TIMELINE_CAP: usize = 500;

/// One tracked in-match occurrence, merged from UDP packets and textual
/// gamelog streams. Slot indices are present only for UDP-sourced events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameEvent {
    Kill {
        #[serde(rename = "killerSlot")]
        killer_slot: Option<u8>,
        #[serde(rename = "victimSlot")]
        victim_slot: Option<u8>,
        killer: String,
        victim: String,
        weapon: Option<String>,
        #[serde(rename = "weaponType")]
        weapon_type: Option<u8>,
        #[serde(rename = "weaponId")]
        weapon_id: Option<u8>,
        #[serde(rename = "gameTimeUs")]
        game_time_us: Option<u64>,
        at: DateTime<Utc>,
    },
    Chat {
        #[serde(rename = "senderSlot")]
        sender_slot: Option<u8>,
        sender: String,
        text: String,
        #[serde(rename = "isObserver")]
        is_observer: bool,
        #[serde(rename = "gameTimeUs")]
        game_time_us: Option<u64>,
        at: DateTime<Utc>,
    },
    Death {
        slot: Option<u8>,
        name: String,
        #[serde(rename = "gameTimeUs")]
        game_time_us: Option<u64>,
        at: DateTime<Utc>,
    },
    Quit {
        slot: Option<u8>,
        name: String,
        #[serde(rename = "gameTimeUs")]
        game_time_us: Option<u64>,
        at: DateTime<Utc>,
    },
    Join {
        name: String,
        at: DateTime<Utc>,
    },
    ReactorDestroyed {
        at: DateTime<Utc>,
    },
    Escape {
        name: Option<String>,
        at: DateTime<Utc>,
    },
    FlagCaptured {
        name: Option<String>,
        at: DateTime<Utc>,
    },
    KillGoal {
        at: DateTime<Utc>,
    },
}

impl GameEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Kill { .. } => "kill",
            Self::Chat { .. } => "chat",
            Self::Death { .. } => "death",
            Self::Quit { .. } => "quit",
            Self::Join { .. } => "join",
            Self::ReactorDestroyed { .. } => "reactor_destroyed",
            Self::Escape { .. } => "escape",
            Self::FlagCaptured { .. } => "flag_captured",
            Self::KillGoal { .. } => "kill_goal",
        }
    }

    pub fn game_time_us(&self) -> Option<u64> {
        match self {
            Self::Kill { game_time_us, .. }
            | Self::Chat { game_time_us, .. }
            | Self::Death { game_time_us, .. }
            | Self::Quit { game_time_us, .. } => *game_time_us,
            _ => None,
        }
    }

    /// Identity tuple used to collapse the same occurrence reported by
    /// several observers.
    pub fn merge_key(&self) -> (u64, &'static str, String, String, String) {
        let us = self.game_time_us().unwrap_or(0);
        match self {
            Self::Kill { killer, victim, .. } => {
                (us, self.kind(), killer.clone(), victim.clone(), String::new())
            }
            Self::Chat { sender, text, .. } => {
                (us, self.kind(), String::new(), text.clone(), sender.clone())
            }
            Self::Death { name, .. }
            | Self::Quit { name, .. }
            | Self::Join { name, .. } => (us, self.kind(), name.clone(), String::new(), String::new()),
            Self::Escape { name, .. } | Self::FlagCaptured { name, .. } => (
                us,
                self.kind(),
                name.clone().unwrap_or_default(),
                String::new(),
                String::new(),
            ),
            Self::ReactorDestroyed { .. } | Self::KillGoal { .. } => {
                (us, self.kind(), String::new(), String::new(), String::new())
            }
        }
    }

    pub fn is_suicide(&self) -> bool {
        match self {
            Self::Kill {
                killer_slot,
                victim_slot,
                killer,
                victim,
                ..
            } => match (killer_slot, victim_slot) {
                (Some(k), Some(v)) => k == v,
                _ => !killer.is_empty() && killer.eq_ignore_ascii_case(victim),
            },
            _ => false,
        }
    }
}

/// Fixed-capacity FIFO that drops the oldest entry on overflow.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    items: VecDeque<T>,
    cap: usize,
}

impl<T> Ring<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.cap {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }
}

impl<T: Clone> Ring<T> {
    /// Last `limit` entries, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(limit);
        self.items.iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSummary {
    pub total_kills: u32,
    pub total_deaths: u32,
    pub total_suicides: u32,
    pub kill_matrix_by_name: HashMap<String, HashMap<String, u32>>,
    pub damage_by_weapon: HashMap<String, u32>,
    pub last_kill: Option<GameEvent>,
}

/// Per-match buffers plus the running summary derived from them.
#[derive(Debug, Clone)]
pub struct EventStore {
    pub kill_feed: Ring<GameEvent>,
    pub chat: Ring<GameEvent>,
    pub timeline: Ring<GameEvent>,
    slot_kills: [u32; MAX_PLAYER_SLOTS],
    slot_deaths: [u32; MAX_PLAYER_SLOTS],
    slot_suicides: [u32; MAX_PLAYER_SLOTS],
    matrix_by_name: HashMap<String, HashMap<String, u32>>,
    damage_by_weapon: HashMap<String, u32>,
    last_kill: Option<GameEvent>,
    total_kills: u32,
    total_deaths: u32,
    total_suicides: u32,
}

impl Default for EventStore {
    fn default() -> Self {
        Self {
            kill_feed: Ring::new(KILL_FEED_CAP),
            chat: Ring::new(CHAT_CAP),
            timeline: Ring::new(TIMELINE_CAP),
            slot_kills: [0; MAX_PLAYER_SLOTS],
            slot_deaths: [0; MAX_PLAYER_SLOTS],
            slot_suicides: [0; MAX_PLAYER_SLOTS],
            matrix_by_name: HashMap::new(),
            damage_by_weapon: HashMap::new(),
            last_kill: None,
            total_kills: 0,
            total_deaths: 0,
            total_suicides: 0,
        }
    }
}

impl EventStore {
    pub fn append(&mut self, event: GameEvent) {
        match &event {
            GameEvent::Kill {
                killer_slot,
                victim_slot,
                killer,
                victim,
                weapon,
                ..
            } => {
                if event.is_suicide() {
                    self.total_suicides += 1;
                    self.total_deaths += 1;
                    if let Some(slot) = victim_slot {
                        if let Some(index) = slot_index(*slot) {
                            self.slot_suicides[index] += 1;
                            self.slot_deaths[index] += 1;
                        }
                    }
                } else {
                    self.total_kills += 1;
                    self.total_deaths += 1;
                    if let Some(index) = (*killer_slot).and_then(slot_index) {
                        self.slot_kills[index] += 1;
                    }
                    if let Some(index) = (*victim_slot).and_then(slot_index) {
                        self.slot_deaths[index] += 1;
                    }
                    if !killer.is_empty() {
                        *self
                            .matrix_by_name
                            .entry(killer.clone())
                            .or_default()
                            .entry(victim.clone())
                            .or_default() += 1;
                    }
                }
                if let Some(weapon) = weapon {
                    *self.damage_by_weapon.entry(weapon.clone()).or_default() += 1;
                }
                self.last_kill = Some(event.clone());
                self.kill_feed.push(event.clone());
                self.timeline.push(event);
            }
            GameEvent::Chat { .. } => {
                self.chat.push(event.clone());
                self.timeline.push(event);
            }
            GameEvent::Death { slot, .. } => {
                self.total_deaths += 1;
                if let Some(index) = (*slot).and_then(slot_index) {
                    self.slot_deaths[index] += 1;
                }
                self.timeline.push(event);
            }
            _ => {
                self.timeline.push(event);
            }
        }
    }

    pub fn slot_kills(&self) -> &[u32; MAX_PLAYER_SLOTS] {
        &self.slot_kills
    }

    pub fn slot_deaths(&self) -> &[u32; MAX_PLAYER_SLOTS] {
        &self.slot_deaths
    }

    pub fn slot_suicides(&self) -> &[u32; MAX_PLAYER_SLOTS] {
        &self.slot_suicides
    }

    pub fn summary(&self) -> StoreSummary {
        StoreSummary {
            total_kills: self.total_kills,
            total_deaths: self.total_deaths,
            total_suicides: self.total_suicides,
            kill_matrix_by_name: self.matrix_by_name.clone(),
            damage_by_weapon: self.damage_by_weapon.clone(),
            last_kill: self.last_kill.clone(),
        }
    }
}

fn slot_index(slot: u8) -> Option<usize> {
    let index = usize::from(slot);
    (index < MAX_PLAYER_SLOTS).then_some(index)
}
