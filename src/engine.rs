use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::Sender;
use tokio::net::UdpSocket;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::codec::{
    self, GameListEntry, HostNotice, MultiEvent, OP_FULL_INFO, OP_GAMELOG_CHAT, OP_GAMELOG_KILL,
    OP_GAME_LIST, OP_LITE_INFO, OP_MDATA_ACK, OP_MDATA_NORM, OP_OBSDATA, OP_PDATA, OP_REGISTER,
    OP_UNREGISTER, OP_WEBUI_PING,
};
use crate::events::GameEvent;
use crate::hub::Notice;
use crate::registry::{GameRegistry, InfoOutcome, MatchKey, Phase};
use crate::weapons::weapon_name;

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Spacing between the three register-ACK sends.
const ACK_GAP: Duration = Duration::from_millis(25);

/// Hosts announcing a game on a privileged port are junk traffic.
const MIN_GAME_PORT: u16 = 1024;

/// A frame the dispatcher wants on the wire. Handlers never touch the
/// socket themselves; the receive loop performs the sends after the
/// registry locks are long gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Frame { to: SocketAddr, bytes: Vec<u8> },
    /// Three single-byte ACKs at 0/25/50 ms, to the register source.
    AckTriplet { to: SocketAddr },
}

pub struct Engine {
    registry: Arc<GameRegistry>,
    notices: Sender<Notice>,
}

impl Engine {
    pub fn new(registry: Arc<GameRegistry>, notices: Sender<Notice>) -> Self {
        Self { registry, notices }
    }

    pub fn registry(&self) -> &GameRegistry {
        &self.registry
    }

    fn publish(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    /// Classifies one datagram by opcode and applies it. Returns the frames
    /// to send; a handler failure drops the packet and changes nothing.
    pub fn handle_datagram(&self, src: SocketAddr, buf: &[u8]) -> Vec<Outgoing> {
        let Some(&op) = buf.first() else {
            return Vec::new();
        };
        match op {
            OP_REGISTER => self.on_register(src, buf),
            OP_UNREGISTER => self.on_host_notice(src, buf),
            OP_GAME_LIST => self.on_game_list_request(src, buf),
            OP_FULL_INFO => self.on_full_info(src, buf),
            OP_LITE_INFO => self.on_lite_info(src, buf),
            OP_PDATA => Vec::new(),
            OP_MDATA_NORM | OP_MDATA_ACK | OP_OBSDATA => self.on_multi_data(src, op, buf),
            OP_GAMELOG_KILL => self.on_gamelog_kill(src, buf),
            OP_GAMELOG_CHAT => self.on_gamelog_chat(src, buf),
            OP_WEBUI_PING if codec::is_webui_ping(buf) => {
                let unix = u32::try_from(Utc::now().timestamp()).unwrap_or(0);
                vec![Outgoing::Frame {
                    to: src,
                    bytes: codec::encode_pong(unix).to_vec(),
                }]
            }
            other => {
                debug!(op = other, len = buf.len(), src = %src, "ignoring unknown opcode");
                Vec::new()
            }
        }
    }

    fn on_register(&self, src: SocketAddr, buf: &[u8]) -> Vec<Outgoing> {
        let packet = match codec::decode_register(buf) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(%err, src = %src, "dropping malformed register");
                return Vec::new();
            }
        };
        if packet.game_port < MIN_GAME_PORT {
            warn!(src = %src, port = packet.game_port, "dropping register with privileged game port");
            return Vec::new();
        }
        let outcome = self.registry.upsert_on_register(src, &packet);
        debug!(src = %src, game_id = packet.game_id, ?outcome, "register");
        // Probe right away; pending records are re-probed by the poll tick.
        vec![Outgoing::Frame {
            to: SocketAddr::new(src.ip(), packet.game_port),
            bytes: codec::encode_lite_req(packet.version, packet.release).to_vec(),
        }]
    }

    fn on_host_notice(&self, src: SocketAddr, buf: &[u8]) -> Vec<Outgoing> {
        match codec::decode_host_notice(buf) {
            Ok(HostNotice::Unregister { game_id }) => {
                if let Some(record) = self.registry.remove_by_game_id(src.ip(), game_id) {
                    info!(src = %src, game_id, key = %record.key, "game unregistered");
                    self.publish(Notice::GameRemoved(Box::new(record)));
                } else {
                    debug!(src = %src, game_id, "unregister for unknown game");
                }
            }
            Ok(HostNotice::VersionDeny {
                netgame_proto, ..
            }) => {
                let updated = self.registry.apply_version_deny(src.ip(), netgame_proto);
                debug!(src = %src, netgame_proto, updated, "version deny");
            }
            Err(err) => warn!(%err, src = %src, "dropping malformed host notice"),
        }
        Vec::new()
    }

    fn on_game_list_request(&self, src: SocketAddr, buf: &[u8]) -> Vec<Outgoing> {
        let version = match codec::decode_game_list_request(buf) {
            Ok(version) => version,
            Err(err) => {
                warn!(%err, src = %src, "dropping malformed game list request");
                return Vec::new();
            }
        };
        self.registry
            .confirmed()
            .iter()
            .filter(|record| record.version == version)
            .filter_map(game_list_entry)
            .map(|entry| Outgoing::Frame {
                to: src,
                bytes: codec::encode_game_list_entry(&entry),
            })
            .collect()
    }

    fn on_lite_info(&self, src: SocketAddr, buf: &[u8]) -> Vec<Outgoing> {
        let Some(key) = self.registry.correlate(src) else {
            debug!(src = %src, "lite info from unknown source");
            return Vec::new();
        };
        let lite = match codec::decode_lite_info(buf) {
            Ok(lite) => lite,
            Err(err) => {
                warn!(%err, src = %src, "dropping malformed lite info");
                return Vec::new();
            }
        };
        match self.registry.apply_lite(&key, lite) {
            InfoOutcome::FirstConfirm { ack_to } => {
                info!(key = %key, "game confirmed");
                self.publish(Notice::GameNew(key));
                vec![Outgoing::AckTriplet { to: ack_to }]
            }
            InfoOutcome::Updated => {
                self.publish(Notice::GameUpdate(key));
                Vec::new()
            }
            InfoOutcome::GameIdMismatch => {
                debug!(key = %key, "lite info with stale game id dropped");
                Vec::new()
            }
            InfoOutcome::UnknownSource => Vec::new(),
        }
    }

    fn on_full_info(&self, src: SocketAddr, buf: &[u8]) -> Vec<Outgoing> {
        let Some(key) = self.registry.correlate(src) else {
            debug!(src = %src, "full info from unknown source");
            return Vec::new();
        };
        let full = match codec::decode_full_info(buf) {
            Ok(full) => full,
            Err(err) => {
                warn!(%err, src = %src, "dropping malformed full info");
                return Vec::new();
            }
        };
        match self.registry.apply_full(&key, full) {
            InfoOutcome::FirstConfirm { ack_to } => {
                info!(key = %key, "game confirmed via full info");
                self.publish(Notice::GameNew(key));
                vec![Outgoing::AckTriplet { to: ack_to }]
            }
            InfoOutcome::Updated => {
                self.publish(Notice::GameUpdate(key));
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_multi_data(&self, src: SocketAddr, op: u8, buf: &[u8]) -> Vec<Outgoing> {
        let Some(key) = self.registry.correlate(src) else {
            debug!(src = %src, "multi data from unknown source");
            return Vec::new();
        };
        let event = match codec::decode_multi_event(op, buf) {
            Ok(Some(event)) => event,
            Ok(None) => return Vec::new(),
            Err(err) => {
                debug!(%err, src = %src, "dropping malformed multi data");
                return Vec::new();
            }
        };
        let now = Utc::now();
        let game_event = self.registry.with_record(&key, |record| match &event {
            MultiEvent::Kill {
                killer_slot,
                victim_slot,
            } => GameEvent::Kill {
                killer_slot: Some(*killer_slot),
                victim_slot: Some(*victim_slot),
                killer: record.slot_name(*killer_slot),
                victim: record.slot_name(*victim_slot),
                weapon: None,
                weapon_type: None,
                weapon_id: None,
                game_time_us: None,
                at: now,
            },
            MultiEvent::PlayerExplode { slot } => GameEvent::Death {
                slot: Some(*slot),
                name: record.slot_name(*slot),
                game_time_us: None,
                at: now,
            },
            MultiEvent::Quit { slot } => GameEvent::Quit {
                slot: Some(*slot),
                name: record.slot_name(*slot),
                game_time_us: None,
                at: now,
            },
            MultiEvent::Message { sender_slot, text } => GameEvent::Chat {
                sender_slot: Some(*sender_slot),
                sender: record.slot_name(*sender_slot),
                text: text.clone(),
                is_observer: false,
                game_time_us: None,
                at: now,
            },
            MultiEvent::ObsMessage { sender_slot, text } => GameEvent::Chat {
                sender_slot: Some(*sender_slot),
                sender: format!("Observer {sender_slot}"),
                text: text.clone(),
                is_observer: true,
                game_time_us: None,
                at: now,
            },
        });
        if let Some(event) = game_event {
            self.append_event(key, event);
        }
        Vec::new()
    }

    fn on_gamelog_kill(&self, src: SocketAddr, buf: &[u8]) -> Vec<Outgoing> {
        // Gamelog packets come from an ephemeral port; bind by IP alone.
        let Some(key) = self.registry.correlate_by_ip(src.ip()) else {
            debug!(src = %src, "gamelog kill from unknown source");
            return Vec::new();
        };
        let kill = match codec::decode_gamelog_kill(buf) {
            Ok(kill) => kill,
            Err(err) => {
                warn!(%err, src = %src, "dropping malformed gamelog kill");
                return Vec::new();
            }
        };
        let now = Utc::now();
        let event = self.registry.with_record(&key, |record| GameEvent::Kill {
            killer_slot: Some(kill.killer_slot),
            victim_slot: Some(kill.victim_slot),
            killer: record.slot_name(kill.killer_slot),
            victim: record.slot_name(kill.victim_slot),
            weapon: Some(weapon_name(
                record.version,
                kill.weapon_type,
                kill.weapon_id,
            )),
            weapon_type: Some(kill.weapon_type),
            weapon_id: Some(kill.weapon_id),
            game_time_us: Some(kill.game_time_us),
            at: now,
        });
        if let Some(event) = event {
            self.append_event(key, event);
        }
        Vec::new()
    }

    fn on_gamelog_chat(&self, src: SocketAddr, buf: &[u8]) -> Vec<Outgoing> {
        let Some(key) = self.registry.correlate_by_ip(src.ip()) else {
            debug!(src = %src, "gamelog chat from unknown source");
            return Vec::new();
        };
        let chat = match codec::decode_gamelog_chat(buf) {
            Ok(chat) => chat,
            Err(err) => {
                warn!(%err, src = %src, "dropping malformed gamelog chat");
                return Vec::new();
            }
        };
        let now = Utc::now();
        let event = self.registry.with_record(&key, |record| GameEvent::Chat {
            sender_slot: Some(chat.sender_slot),
            sender: record.slot_name(chat.sender_slot),
            text: chat.text.clone(),
            is_observer: false,
            game_time_us: Some(chat.game_time_us),
            at: now,
        });
        if let Some(event) = event {
            self.append_event(key, event);
        }
        Vec::new()
    }

    fn append_event(&self, key: MatchKey, event: GameEvent) {
        if self.registry.append_event(&key, event.clone()) {
            self.publish(Notice::GameEvent { key, event });
        }
    }

    /// One poll tick: lite probes for pending records, full probes for
    /// confirmed ones. A record with an unknown protocol is probed with
    /// proto 0 so the host answers with a version-deny that teaches it.
    pub fn poll_tick(&self) -> Vec<Outgoing> {
        let mut out = Vec::new();
        for record in self.registry.all() {
            match record.phase {
                Phase::Pending => out.push(Outgoing::Frame {
                    to: record.key.addr(),
                    bytes: codec::encode_lite_req(record.version, record.release).to_vec(),
                }),
                Phase::Confirmed => out.push(Outgoing::Frame {
                    to: record.key.addr(),
                    bytes: codec::encode_full_info_req(
                        record.version,
                        record.release,
                        record.netgame_proto,
                    )
                    .to_vec(),
                }),
                Phase::Dead => {}
            }
        }
        self.publish(Notice::SnapshotDirty);
        out
    }

    /// One cleanup tick: reap silent records and hand each to the publisher
    /// for the archive handoff.
    pub fn cleanup_tick(&self, now: Instant) -> usize {
        let reaped = self.registry.reap_expired(now);
        let count = reaped.len();
        for record in reaped {
            info!(key = %record.key, game_id = record.game_id, "reaping expired game");
            self.publish(Notice::GameRemoved(Box::new(record)));
        }
        count
    }
}

fn game_list_entry(record: &crate::registry::GameRecord) -> Option<GameListEntry> {
    let lite = record.lite.as_ref();
    let full = record.full.as_ref();
    if lite.is_none() && full.is_none() {
        return None;
    }
    Some(GameListEntry {
        addr: record.key.addr(),
        release: record.release,
        game_id: record.game_id,
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
            .unwrap_or(crate::codec::GameMode::Anarchy),
        refuse: lite.map(|lite| lite.refuse).unwrap_or(0),
        difficulty: lite.map(|lite| lite.difficulty).unwrap_or(0),
        status: lite
            .map(|lite| lite.status)
            .or_else(|| full.map(|full| full.status))
            .unwrap_or(crate::codec::GameStatus::Menu),
        players: full
            .map(|full| full.current_players)
            .or_else(|| lite.map(|lite| lite.players))
            .unwrap_or(0),
        max_players: lite
            .map(|lite| lite.max_players)
            .or_else(|| full.map(|full| full.max_players))
            .unwrap_or(0),
        flags: lite.map(|lite| lite.flags).unwrap_or(0),
    })
}

/// Sends the register-ACK triplet at 0/25/50 ms.
pub async fn send_ack_triplet(socket: &UdpSocket, to: SocketAddr) {
    let ack = codec::encode_register_ack();
    for index in 0..3 {
        if index > 0 {
            sleep(ACK_GAP).await;
        }
        if let Err(err) = socket.send_to(&ack, to).await {
            warn!(%err, to = %to, "register ack send failed");
        }
    }
}

async fn send_outgoing(socket: &Arc<UdpSocket>, outgoing: Vec<Outgoing>) {
    for item in outgoing {
        match item {
            Outgoing::Frame { to, bytes } => {
                if let Err(err) = socket.send_to(&bytes, to).await {
                    warn!(%err, to = %to, "udp send failed");
                }
            }
            Outgoing::AckTriplet { to } => {
                let socket = Arc::clone(socket);
                tokio::spawn(async move {
                    send_ack_triplet(&socket, to).await;
                });
            }
        }
    }
}

/// The single receive loop; packets are handled in arrival order and every
/// handler failure is contained to that one packet.
pub async fn run_udp_loop(engine: Arc<Engine>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 2048];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                let outgoing = engine.handle_datagram(src, &buf[..len]);
                send_outgoing(&socket, outgoing).await;
            }
            Err(err) => {
                warn!(%err, "udp receive failed");
                sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

pub async fn run_poll_ticker(engine: Arc<Engine>, socket: Arc<UdpSocket>) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let outgoing = engine.poll_tick();
        send_outgoing(&socket, outgoing).await;
    }
}

pub async fn run_cleanup_ticker(engine: Arc<Engine>) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        ticker.tick().await;
        engine.cleanup_tick(Instant::now());
    }
}
