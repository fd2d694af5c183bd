use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::codec::{DxxVersion, FullInfo, LiteInfo, RegisterPacket, Release};
use crate::events::{EventStore, GameEvent};

/// A record whose host has been silent this long is reaped.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// `(host-ip, game-port)` — the identity of one live match. The game port
/// is the announced port, not the ephemeral source port packets arrive from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub ip: IpAddr,
    pub port: u16,
}

impl MatchKey {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.addr(), f)
    }
}

impl FromStr for MatchKey {
    type Err = std::net::AddrParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = text.parse()?;
        Ok(Self::new(addr.ip(), addr.port()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Confirmed,
    Dead,
}

#[derive(Debug, Clone)]
pub struct GameRecord {
    pub key: MatchKey,
    pub game_id: u32,
    pub version: DxxVersion,
    pub release: Release,
    pub netgame_proto: u16,
    pub source_addr: SocketAddr,
    pub first_registered: DateTime<Utc>,
    pub created_at: Instant,
    pub last_seen: Instant,
    pub phase: Phase,
    pub ack_sent: bool,
    pub lite: Option<LiteInfo>,
    pub full: Option<FullInfo>,
    pub events: EventStore,
}

impl GameRecord {
    fn new(key: MatchKey, source_addr: SocketAddr, packet: &RegisterPacket) -> Self {
        let now = Instant::now();
        Self {
            key,
            game_id: packet.game_id,
            version: packet.version,
            release: packet.release,
            netgame_proto: 0,
            source_addr,
            first_registered: Utc::now(),
            created_at: now,
            last_seen: now,
            phase: Phase::Pending,
            ack_sent: false,
            lite: None,
            full: None,
            events: EventStore::default(),
        }
    }

    pub fn game_name(&self) -> String {
        self.lite
            .as_ref()
            .map(|lite| lite.game_name.clone())
            .or_else(|| self.full.as_ref().map(|full| full.game_name.clone()))
            .unwrap_or_default()
    }

    /// Display names per slot, with " (1)"/" (2)" suffixes appended to later
    /// duplicates of the same callsign.
    pub fn display_names(&self) -> Vec<String> {
        let Some(full) = &self.full else {
            return Vec::new();
        };
        let mut names = Vec::with_capacity(full.slots.len());
        for slot in &full.slots {
            if !slot.is_present() {
                names.push(String::new());
                continue;
            }
            let base = slot.callsign.clone();
            let duplicates = names
                .iter()
                .filter(|existing: &&String| {
                    **existing == base
                        || existing.strip_suffix(')').is_some_and(|prefix| {
                            prefix
                                .rsplit_once(" (")
                                .is_some_and(|(name, _)| name == base)
                        })
                })
                .count();
            if duplicates == 0 {
                names.push(base);
            } else {
                names.push(format!("{base} ({duplicates})"));
            }
        }
        names
    }

    pub fn slot_name(&self, slot: u8) -> String {
        self.display_names()
            .get(usize::from(slot))
            .filter(|name| !name.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("Player {slot}"))
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// No record existed under the key.
    Created,
    /// Same game id seen again; last-seen refreshed.
    Refreshed,
    /// The game id changed, so the predecessor (and its events) were dropped.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoOutcome {
    /// First successful info decode: pending → confirmed. Carries the
    /// register source address the ACK triplet must go to.
    FirstConfirm { ack_to: SocketAddr },
    Updated,
    GameIdMismatch,
    UnknownSource,
}

/// The single source of truth for live matches. A concurrent map keyed by
/// match key; critical sections stay inside single map operations so no
/// lock is ever held across I/O.
#[derive(Debug, Default)]
pub struct GameRegistry {
    games: DashMap<MatchKey, GameRecord>,
}

impl GameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    pub fn contains(&self, key: &MatchKey) -> bool {
        self.games.contains_key(key)
    }

    pub fn upsert_on_register(
        &self,
        source_addr: SocketAddr,
        packet: &RegisterPacket,
    ) -> RegisterOutcome {
        let key = MatchKey::new(source_addr.ip(), packet.game_port);
        if let Some(mut existing) = self.games.get_mut(&key) {
            if existing.game_id == packet.game_id {
                existing.last_seen = Instant::now();
                existing.source_addr = source_addr;
                return RegisterOutcome::Refreshed;
            }
        } else {
            self.games
                .insert(key, GameRecord::new(key, source_addr, packet));
            return RegisterOutcome::Created;
        }
        // Game id changed under the same key: a new lifecycle. Drop the
        // predecessor before inserting so its event store is discarded.
        self.games.remove(&key);
        self.games
            .insert(key, GameRecord::new(key, source_addr, packet));
        RegisterOutcome::Replaced
    }

    pub fn apply_lite(&self, key: &MatchKey, lite: LiteInfo) -> InfoOutcome {
        let Some(mut record) = self.games.get_mut(key) else {
            return InfoOutcome::UnknownSource;
        };
        if lite.game_id != record.game_id {
            return InfoOutcome::GameIdMismatch;
        }
        record.last_seen = Instant::now();
        record.release = lite.release;
        record.lite = Some(lite);
        self.promote(&mut record)
    }

    pub fn apply_full(&self, key: &MatchKey, full: FullInfo) -> InfoOutcome {
        let Some(mut record) = self.games.get_mut(key) else {
            return InfoOutcome::UnknownSource;
        };
        record.last_seen = Instant::now();
        record.release = full.release;
        record.full = Some(full);
        self.promote(&mut record)
    }

    fn promote(&self, record: &mut GameRecord) -> InfoOutcome {
        if record.phase == Phase::Pending {
            record.phase = Phase::Confirmed;
            if !record.ack_sent {
                record.ack_sent = true;
                return InfoOutcome::FirstConfirm {
                    ack_to: record.source_addr,
                };
            }
        }
        InfoOutcome::Updated
    }

    /// A version-deny teaches the netgame protocol for every record on that
    /// IP that does not know its protocol yet.
    pub fn apply_version_deny(&self, source_ip: IpAddr, netgame_proto: u16) -> usize {
        let mut updated = 0;
        for mut entry in self.games.iter_mut() {
            if entry.key.ip == source_ip && entry.netgame_proto == 0 {
                entry.netgame_proto = netgame_proto;
                entry.last_seen = Instant::now();
                updated += 1;
            }
        }
        updated
    }

    /// Unregister matches on IP plus game id; the source port is usually not
    /// the game port.
    pub fn remove_by_game_id(&self, source_ip: IpAddr, game_id: u32) -> Option<GameRecord> {
        let key = self
            .games
            .iter()
            .find(|entry| entry.key.ip == source_ip && entry.game_id == game_id)
            .map(|entry| entry.key)?;
        self.games.remove(&key).map(|(_, mut record)| {
            record.phase = Phase::Dead;
            record
        })
    }

    /// Correlates a response to a record: exact `ip:port` first, then any
    /// record on the same IP (info responses come from ephemeral ports).
    pub fn correlate(&self, addr: SocketAddr) -> Option<MatchKey> {
        let exact = MatchKey::new(addr.ip(), addr.port());
        if self.games.contains_key(&exact) {
            return Some(exact);
        }
        self.games
            .iter()
            .find(|entry| entry.key.ip == addr.ip())
            .map(|entry| entry.key)
    }

    /// Gamelog packets arrive from an ephemeral port, so they bind by IP
    /// alone.
    // TODO: two concurrent matches behind one NAT IP will mis-attribute
    // gamelog events to whichever record is found first.
    pub fn correlate_by_ip(&self, ip: IpAddr) -> Option<MatchKey> {
        self.games
            .iter()
            .find(|entry| entry.key.ip == ip)
            .map(|entry| entry.key)
    }

    pub fn append_event(&self, key: &MatchKey, event: GameEvent) -> bool {
        let Some(mut record) = self.games.get_mut(key) else {
            return false;
        };
        record.last_seen = Instant::now();
        record.events.append(event);
        true
    }

    pub fn get_clone(&self, key: &MatchKey) -> Option<GameRecord> {
        self.games.get(key).map(|record| record.clone())
    }

    pub fn with_record<T>(&self, key: &MatchKey, read: impl FnOnce(&GameRecord) -> T) -> Option<T> {
        self.games.get(key).map(|record| read(&record))
    }

    /// Copies of every record, pending included; snapshot-style read for
    /// pollers and publishers.
    pub fn all(&self) -> Vec<GameRecord> {
        self.games.iter().map(|entry| entry.clone()).collect()
    }

    pub fn confirmed(&self) -> Vec<GameRecord> {
        self.games
            .iter()
            .filter(|entry| entry.phase == Phase::Confirmed)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Removes and returns every record whose host has been silent past the
    /// inactivity threshold.
    pub fn reap_expired(&self, now: Instant) -> Vec<GameRecord> {
        let expired: Vec<MatchKey> = self
            .games
            .iter()
            .filter(|entry| entry.age(now) > INACTIVITY_TIMEOUT)
            .map(|entry| entry.key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.games.remove(&key))
            .map(|(_, mut record)| {
                record.phase = Phase::Dead;
                record
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{GameMode, GameStatus};

    fn register_packet(game_id: u32, game_port: u16) -> RegisterPacket {
        RegisterPacket {
            tracker_ver: 0,
            version: DxxVersion::D1,
            game_port,
            game_id,
            release: Release {
                major: 1,
                minor: 3,
                micro: 2,
            },
        }
    }

    fn lite_info(game_id: u32) -> LiteInfo {
        LiteInfo {
            release: Release {
                major: 1,
                minor: 3,
                micro: 2,
            },
            game_id,
            game_name: "1v1".to_owned(),
            mission_title: "Wrath".to_owned(),
            mission_id: "wrath".to_owned(),
            level: 1,
            mode: GameMode::Anarchy,
            refuse: 0,
            difficulty: 2,
            status: GameStatus::Playing,
            players: 2,
            max_players: 2,
            flags: 0,
        }
    }

    fn source() -> SocketAddr {
        "203.0.113.7:55000".parse().expect("test addr")
    }

    #[test]
    fn register_creates_then_refreshes_on_same_game_id() {
        let registry = GameRegistry::new();
        let packet = register_packet(7, 5000);
        assert_eq!(
            registry.upsert_on_register(source(), &packet),
            RegisterOutcome::Created
        );
        assert_eq!(
            registry.upsert_on_register(source(), &packet),
            RegisterOutcome::Refreshed
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn changed_game_id_replaces_record_and_discards_events() {
        let registry = GameRegistry::new();
        let key = MatchKey::new(source().ip(), 5000);
        registry.upsert_on_register(source(), &register_packet(7, 5000));
        registry.append_event(
            &key,
            GameEvent::KillGoal {
                at: chrono::Utc::now(),
            },
        );
        assert_eq!(
            registry.upsert_on_register(source(), &register_packet(8, 5000)),
            RegisterOutcome::Replaced
        );
        let record = registry.get_clone(&key).expect("record should exist");
        assert_eq!(record.game_id, 8);
        assert_eq!(record.phase, Phase::Pending);
        assert!(record.events.timeline.is_empty());
    }

    #[test]
    fn first_lite_confirms_and_carries_ack_target_once() {
        let registry = GameRegistry::new();
        registry.upsert_on_register(source(), &register_packet(7, 5000));
        let key = MatchKey::new(source().ip(), 5000);
        assert_eq!(
            registry.apply_lite(&key, lite_info(7)),
            InfoOutcome::FirstConfirm { ack_to: source() }
        );
        assert_eq!(registry.apply_lite(&key, lite_info(7)), InfoOutcome::Updated);
        let record = registry.get_clone(&key).expect("record should exist");
        assert_eq!(record.phase, Phase::Confirmed);
        assert!(record.ack_sent);
    }

    #[test]
    fn lite_with_wrong_game_id_is_dropped() {
        let registry = GameRegistry::new();
        registry.upsert_on_register(source(), &register_packet(7, 5000));
        let key = MatchKey::new(source().ip(), 5000);
        assert_eq!(
            registry.apply_lite(&key, lite_info(9)),
            InfoOutcome::GameIdMismatch
        );
        let record = registry.get_clone(&key).expect("record should exist");
        assert_eq!(record.phase, Phase::Pending);
        assert!(record.lite.is_none());
    }

    #[test]
    fn version_deny_teaches_only_unknown_protos() {
        let registry = GameRegistry::new();
        registry.upsert_on_register(source(), &register_packet(7, 5000));
        registry.upsert_on_register("203.0.113.7:55001".parse().expect("addr"), &register_packet(9, 6000));
        let first = MatchKey::new(source().ip(), 5000);
        assert_eq!(registry.apply_version_deny(source().ip(), 7650), 2);
        // A second deny with a different proto must not overwrite.
        assert_eq!(registry.apply_version_deny(source().ip(), 1234), 0);
        let record = registry.get_clone(&first).expect("record should exist");
        assert_eq!(record.netgame_proto, 7650);
    }

    #[test]
    fn remove_by_game_id_ignores_source_port() {
        let registry = GameRegistry::new();
        registry.upsert_on_register(source(), &register_packet(7, 5000));
        let removed = registry
            .remove_by_game_id(source().ip(), 7)
            .expect("record should be removed");
        assert_eq!(removed.phase, Phase::Dead);
        assert!(registry.is_empty());
        assert!(registry.remove_by_game_id(source().ip(), 7).is_none());
    }

    #[test]
    fn correlate_falls_back_to_ip_only() {
        let registry = GameRegistry::new();
        registry.upsert_on_register(source(), &register_packet(7, 5000));
        let key = MatchKey::new(source().ip(), 5000);
        assert_eq!(
            registry.correlate("203.0.113.7:5000".parse().expect("addr")),
            Some(key)
        );
        assert_eq!(
            registry.correlate("203.0.113.7:49152".parse().expect("addr")),
            Some(key)
        );
        assert_eq!(
            registry.correlate("203.0.113.9:5000".parse().expect("addr")),
            None
        );
    }

    #[test]
    fn reap_expired_removes_exactly_the_silent_records() {
        let registry = GameRegistry::new();
        registry.upsert_on_register(source(), &register_packet(7, 5000));
        registry.upsert_on_register("198.51.100.4:55000".parse().expect("addr"), &register_packet(8, 5000));
        let stale_key = MatchKey::new(source().ip(), 5000);
        let fresh_key = MatchKey::new("198.51.100.4".parse::<IpAddr>().expect("ip"), 5000);
        {
            // Push the fresh record's last-seen ahead so only the stale one
            // ages past the threshold when the clock advances.
            let mut record = registry.games.get_mut(&fresh_key).expect("record");
            record.last_seen = Instant::now() + Duration::from_secs(600);
        }
        let reaped = registry.reap_expired(Instant::now() + Duration::from_secs(301));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].key, stale_key);
        assert_eq!(reaped[0].phase, Phase::Dead);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_callsigns_get_slot_order_suffixes() {
        use crate::codec::{FullInfo, PlayerSlot};
        let registry = GameRegistry::new();
        registry.upsert_on_register(source(), &register_packet(7, 5000));
        let key = MatchKey::new(source().ip(), 5000);
        let mut slots = vec![
            PlayerSlot {
                callsign: "ace".to_owned(),
                connected: true,
                rank: 0,
                color: None,
                missile_color: None,
            };
            3
        ];
        slots.extend(std::iter::repeat_n(
            PlayerSlot {
                callsign: String::new(),
                connected: false,
                rank: 0,
                color: None,
                missile_color: None,
            },
            9,
        ));
        let full = FullInfo {
            release: Release {
                major: 1,
                minor: 3,
                micro: 2,
            },
            slots,
            game_name: "1v1".to_owned(),
            mission_title: "Wrath".to_owned(),
            mission_id: "wrath".to_owned(),
            mode: GameMode::Anarchy,
            refuse: 0,
            difficulty: 2,
            status: GameStatus::Playing,
            prior_players: 3,
            max_players: 8,
            current_players: 3,
            kill_matrix: [[0; 8]; 8],
            total_deaths: [0; 8],
            total_kills: [0; 8],
            kill_goal: 0,
            play_time_allowed: 0,
            level_time: 0,
            control_invul_time: 0,
            monitor_vector: 0,
            scores: [0; 8],
        };
        registry.apply_full(&key, full);
        let record = registry.get_clone(&key).expect("record should exist");
        let names = record.display_names();
        assert_eq!(&names[..3], &["ace", "ace (1)", "ace (2)"]);
        assert_eq!(record.slot_name(1), "ace (1)");
        assert_eq!(record.slot_name(5), "Player 5");
    }
}
