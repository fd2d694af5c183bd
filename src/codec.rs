//! Wire codecs for the PyTracker-compatible UDP protocol. Integers are
//! little-endian, strings fixed-width NUL-padded ASCII. Pure byte-slice
//! decode/encode, no I/O.

use std::net::SocketAddr;

use serde::Serialize;
use thiserror::Error;

pub const OP_REGISTER: u8 = 0;
pub const OP_UNREGISTER: u8 = 1;
pub const OP_GAME_LIST: u8 = 2;
pub const OP_FULL_INFO: u8 = 3;
pub const OP_LITE_REQ: u8 = 4;
pub const OP_LITE_INFO: u8 = 5;
pub const OP_PDATA: u8 = 13;
pub const OP_MDATA_NORM: u8 = 19;
pub const OP_MDATA_ACK: u8 = 20;
pub const OP_REGISTER_ACK: u8 = 21;
pub const OP_GAME_LIST_ENTRY: u8 = 22;
pub const OP_OBSDATA: u8 = 25;
pub const OP_GAMELOG_KILL: u8 = 31;
pub const OP_GAMELOG_CHAT: u8 = 32;
pub const OP_WEBUI_PING: u8 = 99;

pub const MULTI_KILL: u8 = 3;
pub const MULTI_PLAYER_EXPLODE: u8 = 5;
pub const MULTI_MESSAGE: u8 = 6;
pub const MULTI_QUIT: u8 = 7;
pub const MULTI_OBS_MESSAGE: u8 = 61;

pub const MAX_PLAYER_SLOTS: usize = 8;
const FULL_INFO_SLOTS: usize = 12;
const SETTINGS_AREA_MIN: usize = 270;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("malformed packet: expected {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },
    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u8 },
}

pub type Result<T> = std::result::Result<T, PacketError>;

/// Sequential little-endian reader over a datagram.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, count: usize) -> Result<()> {
        if self.pos + count > self.buf.len() {
            return Err(PacketError::Malformed {
                expected: self.pos + count,
                actual: self.buf.len(),
            });
        }
        Ok(())
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        self.need(count)?;
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn i16(&mut self) -> Result<i16> {
        let bytes = self.take(2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn fixed_str(&mut self, width: usize) -> Result<String> {
        Ok(clean_ascii(self.take(width)?))
    }
}

/// Trims at the first NUL, then drops anything outside printable ASCII.
pub fn clean_ascii(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    raw[..end]
        .iter()
        .filter(|b| (0x20..=0x7e).contains(*b))
        .map(|b| *b as char)
        .collect()
}

fn put_fixed(out: &mut Vec<u8>, text: &str, width: usize) {
    let bytes = text.as_bytes();
    for index in 0..width {
        out.push(if index < bytes.len() { bytes[index] } else { 0 });
    }
}

fn exact_len(buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() != expected {
        return Err(PacketError::Malformed {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DxxVersion {
    D1,
    D2,
}

impl DxxVersion {
    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::D1),
            2 => Ok(Self::D2),
            other => Err(PacketError::InvalidField {
                field: "dxx version",
                value: other,
            }),
        }
    }

    pub fn wire(self) -> u8 {
        match self {
            Self::D1 => 1,
            Self::D2 => 2,
        }
    }

    /// Four-byte request id sent in probe packets.
    pub fn request_id(self) -> &'static [u8; 4] {
        match self {
            Self::D1 => b"D1XR",
            Self::D2 => b"D2XR",
        }
    }
}

impl std::fmt::Display for DxxVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::D1 => write!(f, "D1"),
            Self::D2 => write!(f, "D2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Release {
    pub major: u16,
    pub minor: u16,
    pub micro: u16,
}

impl Release {
    pub const ZERO: Release = Release {
        major: 0,
        minor: 0,
        micro: 0,
    };
}

impl std::fmt::Display for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GameMode {
    Anarchy,
    TeamAnarchy,
    RoboAnarchy,
    Cooperative,
    CaptureFlag,
    Hoard,
    TeamHoard,
    Bounty,
    Unknown(u8),
}

impl GameMode {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => Self::Anarchy,
            1 => Self::TeamAnarchy,
            2 => Self::RoboAnarchy,
            3 => Self::Cooperative,
            4 => Self::CaptureFlag,
            5 => Self::Hoard,
            6 => Self::TeamHoard,
            7 => Self::Bounty,
            other => Self::Unknown(other),
        }
    }

    pub fn wire(self) -> u8 {
        match self {
            Self::Anarchy => 0,
            Self::TeamAnarchy => 1,
            Self::RoboAnarchy => 2,
            Self::Cooperative => 3,
            Self::CaptureFlag => 4,
            Self::Hoard => 5,
            Self::TeamHoard => 6,
            Self::Bounty => 7,
            Self::Unknown(other) => other,
        }
    }

    pub fn label(self) -> String {
        match self {
            Self::Anarchy => "Anarchy".to_owned(),
            Self::TeamAnarchy => "Team Anarchy".to_owned(),
            Self::RoboAnarchy => "Robo Anarchy".to_owned(),
            Self::Cooperative => "Cooperative".to_owned(),
            Self::CaptureFlag => "Capture Flag".to_owned(),
            Self::Hoard => "Hoard".to_owned(),
            Self::TeamHoard => "Team Hoard".to_owned(),
            Self::Bounty => "Bounty".to_owned(),
            Self::Unknown(other) => format!("Mode {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GameStatus {
    Menu,
    Playing,
    Between,
    EndLevel,
    Forming,
    Unknown(u8),
}

impl GameStatus {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => Self::Menu,
            1 => Self::Playing,
            2 => Self::Between,
            3 => Self::EndLevel,
            4 => Self::Forming,
            other => Self::Unknown(other),
        }
    }

    pub fn wire(self) -> u8 {
        match self {
            Self::Menu => 0,
            Self::Playing => 1,
            Self::Between => 2,
            Self::EndLevel => 3,
            Self::Forming => 4,
            Self::Unknown(other) => other,
        }
    }

    pub fn label(self) -> String {
        match self {
            Self::Menu => "Menu".to_owned(),
            Self::Playing => "Playing".to_owned(),
            Self::Between => "Between".to_owned(),
            Self::EndLevel => "End Level".to_owned(),
            Self::Forming => "Forming".to_owned(),
            Self::Unknown(other) => format!("Status {other}"),
        }
    }
}

/// Opcode 0: a host announcing a game to the tracker. 14-byte packets carry
/// a single-byte micro version, 15-byte packets a full u16.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterPacket {
    pub tracker_ver: u8,
    pub version: DxxVersion,
    pub game_port: u16,
    pub game_id: u32,
    pub release: Release,
}

pub fn decode_register(buf: &[u8]) -> Result<RegisterPacket> {
    if buf.len() != 14 && buf.len() != 15 {
        return Err(PacketError::Malformed {
            expected: 15,
            actual: buf.len(),
        });
    }
    let mut reader = Reader::new(buf);
    let _op = reader.u8()?;
    let tracker_ver = reader.u8()?;
    let version = DxxVersion::from_wire(reader.u8()?)?;
    let game_port = reader.u16()?;
    let game_id = reader.u32()?;
    let major = reader.u16()?;
    let minor = reader.u16()?;
    let micro = if buf.len() == 15 {
        reader.u16()?
    } else {
        u16::from(reader.u8()?)
    };
    Ok(RegisterPacket {
        tracker_ver,
        version,
        game_port,
        game_id,
        release: Release {
            major,
            minor,
            micro,
        },
    })
}

/// Opcode 1 is overloaded by length: 5 bytes unregister a game id, 9 bytes
/// are a version-deny response teaching the netgame protocol number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostNotice {
    Unregister { game_id: u32 },
    VersionDeny { release: Release, netgame_proto: u16 },
}

pub fn decode_host_notice(buf: &[u8]) -> Result<HostNotice> {
    match buf.len() {
        5 => {
            let mut reader = Reader::new(buf);
            let _op = reader.u8()?;
            Ok(HostNotice::Unregister {
                game_id: reader.u32()?,
            })
        }
        9 => {
            let mut reader = Reader::new(buf);
            let _op = reader.u8()?;
            let major = reader.u16()?;
            let minor = reader.u16()?;
            let micro = reader.u16()?;
            let netgame_proto = reader.u16()?;
            Ok(HostNotice::VersionDeny {
                release: Release {
                    major,
                    minor,
                    micro,
                },
                netgame_proto,
            })
        }
        other => Err(PacketError::Malformed {
            expected: 9,
            actual: other,
        }),
    }
}

/// Opcode 2 ingress: a dashboard client asking for the confirmed game list.
pub fn decode_game_list_request(buf: &[u8]) -> Result<DxxVersion> {
    exact_len(buf, 3)?;
    let mut reader = Reader::new(buf);
    let _op = reader.u8()?;
    let version = reader.u16()?;
    DxxVersion::from_wire(version.try_into().unwrap_or(0))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteInfo {
    pub release: Release,
    pub game_id: u32,
    pub game_name: String,
    pub mission_title: String,
    pub mission_id: String,
    pub level: u32,
    pub mode: GameMode,
    pub refuse: u8,
    pub difficulty: u8,
    pub status: GameStatus,
    pub players: u8,
    pub max_players: u8,
    pub flags: u8,
}

pub fn decode_lite_info(buf: &[u8]) -> Result<LiteInfo> {
    exact_len(buf, 73)?;
    let mut reader = Reader::new(buf);
    let _op = reader.u8()?;
    let major = reader.u16()?;
    let minor = reader.u16()?;
    let micro = reader.u16()?;
    let game_id = reader.u32()?;
    let game_name = reader.fixed_str(16)?;
    let mission_title = reader.fixed_str(26)?;
    let mission_id = reader.fixed_str(9)?;
    let level = reader.u32()?;
    let mode = GameMode::from_wire(reader.u8()?);
    let refuse = reader.u8()?;
    let difficulty = reader.u8()?;
    let status = GameStatus::from_wire(reader.u8()?);
    let players = reader.u8()?;
    let max_players = reader.u8()?;
    let flags = reader.u8()?;
    Ok(LiteInfo {
        release: Release {
            major,
            minor,
            micro,
        },
        game_id,
        game_name,
        mission_title,
        mission_id,
        level,
        mode,
        refuse,
        difficulty,
        status,
        players,
        max_players,
        flags,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSlot {
    pub callsign: String,
    pub connected: bool,
    pub rank: u8,
    pub color: Option<u8>,
    pub missile_color: Option<u8>,
}

impl PlayerSlot {
    pub fn is_present(&self) -> bool {
        !self.callsign.is_empty() || self.connected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullInfo {
    pub release: Release,
    pub slots: Vec<PlayerSlot>,
    pub game_name: String,
    pub mission_title: String,
    pub mission_id: String,
    pub mode: GameMode,
    pub refuse: u8,
    pub difficulty: u8,
    pub status: GameStatus,
    pub prior_players: u8,
    pub max_players: u8,
    pub current_players: u8,
    pub kill_matrix: [[i16; MAX_PLAYER_SLOTS]; MAX_PLAYER_SLOTS],
    pub total_deaths: [i16; MAX_PLAYER_SLOTS],
    pub total_kills: [i16; MAX_PLAYER_SLOTS],
    pub kill_goal: i32,
    pub play_time_allowed: i32,
    pub level_time: i32,
    pub control_invul_time: i32,
    pub monitor_vector: i32,
    pub scores: [i32; MAX_PLAYER_SLOTS],
}

/// Opcode 3. The slot stride is selected from total packet length: the
/// 519/520-byte variants pack 12-byte slots, every other length 14-byte
/// slots with two extra color bytes.
pub fn decode_full_info(buf: &[u8]) -> Result<FullInfo> {
    let stride = if buf.len() == 519 || buf.len() == 520 {
        12
    } else {
        14
    };
    let settings_start = 7 + FULL_INFO_SLOTS * stride;
    if buf.len() < settings_start + SETTINGS_AREA_MIN {
        return Err(PacketError::Malformed {
            expected: settings_start + SETTINGS_AREA_MIN,
            actual: buf.len(),
        });
    }

    let mut reader = Reader::new(buf);
    let _op = reader.u8()?;
    let major = reader.u16()?;
    let minor = reader.u16()?;
    let micro = reader.u16()?;

    let mut slots = Vec::with_capacity(FULL_INFO_SLOTS);
    for _ in 0..FULL_INFO_SLOTS {
        let callsign = reader.fixed_str(9)?;
        let connected = reader.u8()? != 0;
        let rank = reader.u8()?;
        let _extra = reader.u8()?;
        let (color, missile_color) = if stride == 14 {
            (Some(reader.u8()?), Some(reader.u8()?))
        } else {
            (None, None)
        };
        slots.push(PlayerSlot {
            callsign,
            connected,
            rank,
            color,
            missile_color,
        });
    }

    let game_name = reader.fixed_str(16)?;
    let mission_title = reader.fixed_str(26)?;
    let mission_id = reader.fixed_str(9)?;
    let mode = GameMode::from_wire(reader.u8()?);
    let refuse = reader.u8()?;
    let difficulty = reader.u8()?;
    let status = GameStatus::from_wire(reader.u8()?);
    let prior_players = reader.u8()?;
    let max_players = reader.u8()?;
    let current_players = reader.u8()?;

    let mut kill_matrix = [[0i16; MAX_PLAYER_SLOTS]; MAX_PLAYER_SLOTS];
    for row in kill_matrix.iter_mut() {
        for cell in row.iter_mut() {
            *cell = reader.i16()?;
        }
    }
    let mut total_deaths = [0i16; MAX_PLAYER_SLOTS];
    for cell in total_deaths.iter_mut() {
        *cell = reader.i16()?;
    }
    let mut total_kills = [0i16; MAX_PLAYER_SLOTS];
    for cell in total_kills.iter_mut() {
        *cell = reader.i16()?;
    }
    let kill_goal = reader.i32()?;
    let play_time_allowed = reader.i32()?;
    let level_time = reader.i32()?;
    let control_invul_time = reader.i32()?;
    let monitor_vector = reader.i32()?;
    let mut scores = [0i32; MAX_PLAYER_SLOTS];
    for cell in scores.iter_mut() {
        *cell = reader.i32()?;
    }

    Ok(FullInfo {
        release: Release {
            major,
            minor,
            micro,
        },
        slots,
        game_name,
        mission_title,
        mission_id,
        mode,
        refuse,
        difficulty,
        status,
        prior_players,
        max_players,
        current_players,
        kill_matrix,
        total_deaths,
        total_kills,
        kill_goal,
        play_time_allowed,
        level_time,
        control_invul_time,
        monitor_vector,
        scores,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GamelogKill {
    pub game_time_us: u64,
    pub killer_slot: u8,
    pub victim_slot: u8,
    pub weapon_type: u8,
    pub weapon_id: u8,
}

pub fn decode_gamelog_kill(buf: &[u8]) -> Result<GamelogKill> {
    exact_len(buf, 13)?;
    let mut reader = Reader::new(buf);
    let _op = reader.u8()?;
    Ok(GamelogKill {
        game_time_us: reader.u64()?,
        killer_slot: reader.u8()?,
        victim_slot: reader.u8()?,
        weapon_type: reader.u8()?,
        weapon_id: reader.u8()?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GamelogChat {
    pub game_time_us: u64,
    pub sender_slot: u8,
    pub text: String,
}

pub fn decode_gamelog_chat(buf: &[u8]) -> Result<GamelogChat> {
    if buf.len() < 11 {
        return Err(PacketError::Malformed {
            expected: 11,
            actual: buf.len(),
        });
    }
    let mut reader = Reader::new(buf);
    let _op = reader.u8()?;
    let game_time_us = reader.u64()?;
    let sender_slot = reader.u8()?;
    let raw = &buf[10..];
    let text = String::from_utf8_lossy(raw)
        .replace('\0', "")
        .trim()
        .to_owned();
    Ok(GamelogChat {
        game_time_us,
        sender_slot,
        text,
    })
}

/// In-game submessages embedded in MDATA/OBSDATA streams. Only the tags the
/// tracker feeds into the event store are surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiEvent {
    Kill { killer_slot: u8, victim_slot: u8 },
    PlayerExplode { slot: u8 },
    Message { sender_slot: u8, text: String },
    Quit { slot: u8 },
    ObsMessage { sender_slot: u8, text: String },
}

/// Extracts the embedded submessage from an opcode 19/20/25 datagram, if it
/// carries one of the tags the tracker cares about.
pub fn decode_multi_event(op: u8, buf: &[u8]) -> Result<Option<MultiEvent>> {
    // op, u32 token, u8 sender-slot, then (for MDATA-A only) u32 pkt-num.
    let body_start = if op == OP_MDATA_ACK { 10 } else { 6 };
    if buf.len() <= body_start {
        return Err(PacketError::Malformed {
            expected: body_start + 1,
            actual: buf.len(),
        });
    }
    let body = &buf[body_start..];
    let mut reader = Reader::new(body);
    let tag = reader.u8()?;
    let event = match tag {
        MULTI_KILL => Some(MultiEvent::Kill {
            killer_slot: reader.u8()?,
            victim_slot: reader.u8()?,
        }),
        MULTI_PLAYER_EXPLODE => Some(MultiEvent::PlayerExplode { slot: reader.u8()? }),
        MULTI_QUIT => Some(MultiEvent::Quit { slot: reader.u8()? }),
        MULTI_MESSAGE | MULTI_OBS_MESSAGE => {
            let sender_slot = reader.u8()?;
            let text = clean_ascii(&body[2..]);
            if tag == MULTI_MESSAGE {
                Some(MultiEvent::Message { sender_slot, text })
            } else {
                Some(MultiEvent::ObsMessage { sender_slot, text })
            }
        }
        _ => None,
    };
    Ok(event)
}

pub fn is_webui_ping(buf: &[u8]) -> bool {
    buf.len() >= 5 && buf[0] == OP_WEBUI_PING && &buf[1..5] == b"ping"
}

pub fn encode_pong(unix_seconds: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(b"pong");
    out[4..].copy_from_slice(&unix_seconds.to_le_bytes());
    out
}

pub fn decode_pong(buf: &[u8]) -> Result<u32> {
    exact_len(buf, 8)?;
    if &buf[..4] != b"pong" {
        return Err(PacketError::InvalidField {
            field: "pong magic",
            value: buf[0],
        });
    }
    Ok(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]))
}

pub fn encode_register_ack() -> [u8; 1] {
    [OP_REGISTER_ACK]
}

pub fn decode_register_ack(buf: &[u8]) -> Result<()> {
    exact_len(buf, 1)?;
    if buf[0] != OP_REGISTER_ACK {
        return Err(PacketError::InvalidField {
            field: "register-ack opcode",
            value: buf[0],
        });
    }
    Ok(())
}

pub fn encode_lite_req(version: DxxVersion, release: Release) -> [u8; 11] {
    let mut out = [0u8; 11];
    out[0] = OP_LITE_REQ;
    out[1..5].copy_from_slice(version.request_id());
    out[5..7].copy_from_slice(&release.major.to_le_bytes());
    out[7..9].copy_from_slice(&release.minor.to_le_bytes());
    out[9..11].copy_from_slice(&release.micro.to_le_bytes());
    out
}

pub fn decode_lite_req(buf: &[u8]) -> Result<(DxxVersion, Release)> {
    exact_len(buf, 11)?;
    let version = match &buf[1..5] {
        b"D1XR" => DxxVersion::D1,
        b"D2XR" => DxxVersion::D2,
        _ => {
            return Err(PacketError::InvalidField {
                field: "request id",
                value: buf[1],
            })
        }
    };
    Ok((
        version,
        Release {
            major: u16::from_le_bytes([buf[5], buf[6]]),
            minor: u16::from_le_bytes([buf[7], buf[8]]),
            micro: u16::from_le_bytes([buf[9], buf[10]]),
        },
    ))
}

/// The outgoing 13-byte flavor of opcode 2, probing a host for full info.
pub fn encode_full_info_req(version: DxxVersion, release: Release, netgame_proto: u16) -> [u8; 13] {
    let mut out = [0u8; 13];
    out[0] = OP_GAME_LIST;
    out[1..5].copy_from_slice(version.request_id());
    out[5..7].copy_from_slice(&release.major.to_le_bytes());
    out[7..9].copy_from_slice(&release.minor.to_le_bytes());
    out[9..11].copy_from_slice(&release.micro.to_le_bytes());
    out[11..13].copy_from_slice(&netgame_proto.to_le_bytes());
    out
}

pub fn decode_full_info_req(buf: &[u8]) -> Result<(DxxVersion, Release, u16)> {
    exact_len(buf, 13)?;
    let version = match &buf[1..5] {
        b"D1XR" => DxxVersion::D1,
        b"D2XR" => DxxVersion::D2,
        _ => {
            return Err(PacketError::InvalidField {
                field: "request id",
                value: buf[1],
            })
        }
    };
    Ok((
        version,
        Release {
            major: u16::from_le_bytes([buf[5], buf[6]]),
            minor: u16::from_le_bytes([buf[7], buf[8]]),
            micro: u16::from_le_bytes([buf[9], buf[10]]),
        },
        u16::from_le_bytes([buf[11], buf[12]]),
    ))
}

/// One confirmed game, as announced to dashboard clients in response to a
/// game-list request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameListEntry {
    pub addr: SocketAddr,
    pub release: Release,
    pub game_id: u32,
    pub game_name: String,
    pub mission_title: String,
    pub mission_id: String,
    pub level: u32,
    pub mode: GameMode,
    pub refuse: u8,
    pub difficulty: u8,
    pub status: GameStatus,
    pub players: u8,
    pub max_players: u8,
    pub flags: u8,
}

pub fn encode_game_list_entry(entry: &GameListEntry) -> Vec<u8> {
    let ip_text = entry.addr.ip().to_string();
    let mut out = Vec::with_capacity(2 + ip_text.len() + 1 + 69);
    out.push(OP_GAME_LIST_ENTRY);
    out.push(u8::from(entry.addr.is_ipv6()));
    out.extend_from_slice(ip_text.as_bytes());
    out.push(0);
    out.extend_from_slice(&entry.addr.port().to_le_bytes());
    out.extend_from_slice(&entry.release.major.to_le_bytes());
    out.extend_from_slice(&entry.release.minor.to_le_bytes());
    out.extend_from_slice(&entry.release.micro.to_le_bytes());
    out.extend_from_slice(&entry.game_id.to_le_bytes());
    put_fixed(&mut out, &entry.game_name, 16);
    put_fixed(&mut out, &entry.mission_title, 26);
    put_fixed(&mut out, &entry.mission_id, 9);
    out.extend_from_slice(&entry.level.to_le_bytes());
    out.push(entry.mode.wire());
    out.push(entry.refuse);
    out.push(entry.difficulty);
    out.push(entry.status.wire());
    out.push(entry.players);
    out.push(entry.max_players);
    out.push(entry.flags);
    out.push(0);
    out
}

pub fn decode_game_list_entry(buf: &[u8]) -> Result<GameListEntry> {
    let mut reader = Reader::new(buf);
    let _op = reader.u8()?;
    let is_ipv6 = reader.u8()? != 0;
    let ip_start = reader.pos;
    let nul = buf[ip_start..]
        .iter()
        .position(|b| *b == 0)
        .ok_or(PacketError::Malformed {
            expected: buf.len() + 1,
            actual: buf.len(),
        })?;
    let ip_text = clean_ascii(&buf[ip_start..ip_start + nul]);
    reader.pos = ip_start + nul + 1;
    let port = reader.u16()?;
    let ip: std::net::IpAddr = ip_text.parse().map_err(|_| PacketError::InvalidField {
        field: "ip literal",
        value: u8::from(is_ipv6),
    })?;
    let major = reader.u16()?;
    let minor = reader.u16()?;
    let micro = reader.u16()?;
    let game_id = reader.u32()?;
    let game_name = reader.fixed_str(16)?;
    let mission_title = reader.fixed_str(26)?;
    let mission_id = reader.fixed_str(9)?;
    let level = reader.u32()?;
    let mode = GameMode::from_wire(reader.u8()?);
    let refuse = reader.u8()?;
    let difficulty = reader.u8()?;
    let status = GameStatus::from_wire(reader.u8()?);
    let players = reader.u8()?;
    let max_players = reader.u8()?;
    let flags = reader.u8()?;
    let _padding = reader.u8()?;
    Ok(GameListEntry {
        addr: SocketAddr::new(ip, port),
        release: Release {
            major,
            minor,
            micro,
        },
        game_id,
        game_name,
        mission_title,
        mission_id,
        level,
        mode,
        refuse,
        difficulty,
        status,
        players,
        max_players,
        flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lite_info_bytes(game_id: u32, name: &str, mission: &str, players: u8) -> Vec<u8> {
        let mut out = vec![OP_LITE_INFO];
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&3u16.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&game_id.to_le_bytes());
        put_fixed(&mut out, name, 16);
        put_fixed(&mut out, mission, 26);
        put_fixed(&mut out, "wrath", 9);
        out.extend_from_slice(&1u32.to_le_bytes());
        out.push(0); // mode
        out.push(0); // refuse
        out.push(2); // difficulty
        out.push(1); // status
        out.push(players);
        out.push(2); // max players
        out.push(0); // flags
        out
    }

    #[test]
    fn decodes_fifteen_byte_register_from_scenario_bytes() {
        let bytes = [
            0x00, 0x00, 0x01, 0x88, 0x13, 0x01, 0x02, 0x03, 0x04, 0x01, 0x00, 0x03, 0x00, 0x02,
            0x00,
        ];
        let decoded = decode_register(&bytes).expect("register should decode");
        assert_eq!(decoded.version, DxxVersion::D1);
        assert_eq!(decoded.game_port, 5000);
        assert_eq!(decoded.game_id, 0x0403_0201);
        assert_eq!(decoded.release, Release { major: 1, minor: 3, micro: 2 });
    }

    #[test]
    fn decodes_fourteen_byte_register_with_u8_micro() {
        let bytes = [
            0x00, 0x00, 0x02, 0x88, 0x13, 0x01, 0x02, 0x03, 0x04, 0x01, 0x00, 0x03, 0x00, 0x09,
        ];
        let decoded = decode_register(&bytes).expect("register should decode");
        assert_eq!(decoded.version, DxxVersion::D2);
        assert_eq!(decoded.release.micro, 9);
    }

    #[test]
    fn rejects_register_with_other_lengths() {
        for len in [0usize, 5, 13, 16, 64] {
            let buf = vec![0u8; len];
            assert!(matches!(
                decode_register(&buf),
                Err(PacketError::Malformed { .. })
            ));
        }
    }

    #[test]
    fn host_notice_splits_on_length() {
        let mut unregister = vec![OP_UNREGISTER];
        unregister.extend_from_slice(&0x0403_0201u32.to_le_bytes());
        assert_eq!(
            decode_host_notice(&unregister).expect("unregister should decode"),
            HostNotice::Unregister {
                game_id: 0x0403_0201
            }
        );

        let mut deny = vec![OP_UNREGISTER];
        deny.extend_from_slice(&1u16.to_le_bytes());
        deny.extend_from_slice(&3u16.to_le_bytes());
        deny.extend_from_slice(&2u16.to_le_bytes());
        deny.extend_from_slice(&7650u16.to_le_bytes());
        assert_eq!(
            decode_host_notice(&deny).expect("version deny should decode"),
            HostNotice::VersionDeny {
                release: Release { major: 1, minor: 3, micro: 2 },
                netgame_proto: 7650
            }
        );

        assert!(decode_host_notice(&[OP_UNREGISTER, 1, 2]).is_err());
    }

    #[test]
    fn lite_info_decodes_names_and_scalars() {
        let bytes = lite_info_bytes(0x0403_0201, "1v1", "Wrath", 2);
        assert_eq!(bytes.len(), 73);
        let decoded = decode_lite_info(&bytes).expect("lite info should decode");
        assert_eq!(decoded.game_id, 0x0403_0201);
        assert_eq!(decoded.game_name, "1v1");
        assert_eq!(decoded.mission_title, "Wrath");
        assert_eq!(decoded.level, 1);
        assert_eq!(decoded.mode, GameMode::Anarchy);
        assert_eq!(decoded.status, GameStatus::Playing);
        assert_eq!(decoded.players, 2);
        assert_eq!(decoded.max_players, 2);
    }

    #[test]
    fn lite_info_rejects_wrong_length() {
        let mut bytes = lite_info_bytes(1, "x", "y", 1);
        bytes.push(0);
        assert!(matches!(
            decode_lite_info(&bytes),
            Err(PacketError::Malformed {
                expected: 73,
                actual: 74
            })
        ));
    }

    #[test]
    fn lite_info_strips_non_printable_name_bytes() {
        let mut bytes = lite_info_bytes(1, "", "m", 1);
        bytes[11] = b'a';
        bytes[12] = 0x01; // control byte inside the name field
        bytes[13] = b'b';
        let decoded = decode_lite_info(&bytes).expect("lite info should decode");
        assert_eq!(decoded.game_name, "ab");
    }

    fn full_info_bytes(stride: usize, callsigns: &[&str]) -> Vec<u8> {
        let mut out = vec![OP_FULL_INFO];
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&3u16.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        for index in 0..FULL_INFO_SLOTS {
            let callsign = callsigns.get(index).copied().unwrap_or("");
            put_fixed(&mut out, callsign, 9);
            out.push(u8::from(!callsign.is_empty())); // connected
            out.push(0); // rank
            out.push(0); // extra
            if stride == 14 {
                out.push(3);
                out.push(4);
            }
        }
        put_fixed(&mut out, "1v1", 16);
        put_fixed(&mut out, "Wrath", 26);
        put_fixed(&mut out, "wrath", 9);
        out.push(0); // mode
        out.push(0); // refuse
        out.push(2); // difficulty
        out.push(1); // status
        out.push(2); // prior players
        out.push(2); // max players
        out.push(2); // current players
        let mut matrix = [[0i16; MAX_PLAYER_SLOTS]; MAX_PLAYER_SLOTS];
        matrix[0][1] = 5;
        matrix[1][0] = 3;
        matrix[1][1] = -1; // suicide column convention from the game
        for row in matrix {
            for cell in row {
                out.extend_from_slice(&cell.to_le_bytes());
            }
        }
        for deaths in [3i16, 5, 0, 0, 0, 0, 0, 0] {
            out.extend_from_slice(&deaths.to_le_bytes());
        }
        for kills in [5i16, 3, 0, 0, 0, 0, 0, 0] {
            out.extend_from_slice(&kills.to_le_bytes());
        }
        out.extend_from_slice(&20i32.to_le_bytes()); // kill goal
        out.extend_from_slice(&0i32.to_le_bytes()); // play time allowed
        out.extend_from_slice(&310i32.to_le_bytes()); // level time
        out.extend_from_slice(&0i32.to_le_bytes()); // control invul time
        out.extend_from_slice(&0i32.to_le_bytes()); // monitor vector
        for score in [5i32, 3, 0, 0, 0, 0, 0, 0] {
            out.extend_from_slice(&score.to_le_bytes());
        }
        out
    }

    #[test]
    fn full_info_parses_twelve_byte_stride_at_519() {
        let mut bytes = full_info_bytes(12, &["alice", "bob"]);
        bytes.resize(519, 0);
        let decoded = decode_full_info(&bytes).expect("full info should decode");
        assert_eq!(decoded.slots[0].callsign, "alice");
        assert_eq!(decoded.slots[1].callsign, "bob");
        assert!(decoded.slots[0].color.is_none());
        assert_eq!(decoded.kill_matrix[0][1], 5);
        assert_eq!(decoded.total_kills[0], 5);
        assert_eq!(decoded.total_deaths[1], 5);
        assert_eq!(decoded.scores[0], 5);
        assert_eq!(decoded.kill_goal, 20);
        assert!(decoded.slots[2..].iter().all(|slot| !slot.is_present()));
    }

    #[test]
    fn full_info_parses_fourteen_byte_stride_otherwise() {
        let bytes = full_info_bytes(14, &["alice", "bob"]);
        assert_ne!(bytes.len(), 519);
        assert_ne!(bytes.len(), 520);
        let decoded = decode_full_info(&bytes).expect("full info should decode");
        assert_eq!(decoded.slots[0].color, Some(3));
        assert_eq!(decoded.slots[0].missile_color, Some(4));
        assert_eq!(decoded.kill_matrix[1][0], 3);
    }

    #[test]
    fn full_info_rejects_truncated_settings_area() {
        let mut bytes = full_info_bytes(14, &["alice"]);
        bytes.truncate(bytes.len() - 40);
        assert!(matches!(
            decode_full_info(&bytes),
            Err(PacketError::Malformed { .. })
        ));
    }

    #[test]
    fn gamelog_kill_decodes_and_rejects_lengths() {
        let mut bytes = vec![OP_GAMELOG_KILL];
        bytes.extend_from_slice(&1_234_567u64.to_le_bytes());
        bytes.extend_from_slice(&[0, 1, 0, 13]);
        let decoded = decode_gamelog_kill(&bytes).expect("kill should decode");
        assert_eq!(decoded.game_time_us, 1_234_567);
        assert_eq!(decoded.killer_slot, 0);
        assert_eq!(decoded.victim_slot, 1);
        assert_eq!(decoded.weapon_id, 13);

        bytes.pop();
        assert!(matches!(
            decode_gamelog_kill(&bytes),
            Err(PacketError::Malformed {
                expected: 13,
                actual: 12
            })
        ));
    }

    #[test]
    fn gamelog_chat_trims_and_strips_nuls() {
        let mut bytes = vec![OP_GAMELOG_CHAT];
        bytes.extend_from_slice(&99u64.to_le_bytes());
        bytes.push(2);
        bytes.extend_from_slice(b"  good game\0\0");
        let decoded = decode_gamelog_chat(&bytes).expect("chat should decode");
        assert_eq!(decoded.sender_slot, 2);
        assert_eq!(decoded.text, "good game");

        assert!(decode_gamelog_chat(&bytes[..10]).is_err());
    }

    #[test]
    fn multi_event_extracts_kill_and_message() {
        let mut kill = vec![OP_MDATA_NORM];
        kill.extend_from_slice(&7u32.to_le_bytes());
        kill.push(0); // sender slot
        kill.extend_from_slice(&[MULTI_KILL, 0, 1]);
        assert_eq!(
            decode_multi_event(OP_MDATA_NORM, &kill).expect("should decode"),
            Some(MultiEvent::Kill {
                killer_slot: 0,
                victim_slot: 1
            })
        );

        let mut message = vec![OP_MDATA_ACK];
        message.extend_from_slice(&7u32.to_le_bytes());
        message.push(1);
        message.extend_from_slice(&3u32.to_le_bytes()); // pkt-num
        message.extend_from_slice(&[MULTI_MESSAGE, 1]);
        message.extend_from_slice(b"gg\0");
        assert_eq!(
            decode_multi_event(OP_MDATA_ACK, &message).expect("should decode"),
            Some(MultiEvent::Message {
                sender_slot: 1,
                text: "gg".to_owned()
            })
        );
    }

    #[test]
    fn multi_event_ignores_unknown_tags() {
        let mut frame = vec![OP_MDATA_NORM];
        frame.extend_from_slice(&7u32.to_le_bytes());
        frame.push(0);
        frame.extend_from_slice(&[42, 1, 2, 3]);
        assert_eq!(
            decode_multi_event(OP_MDATA_NORM, &frame).expect("should decode"),
            None
        );
    }

    #[test]
    fn lite_req_roundtrips() {
        let release = Release { major: 1, minor: 3, micro: 2 };
        let encoded = encode_lite_req(DxxVersion::D1, release);
        assert_eq!(&encoded[..5], &[OP_LITE_REQ, b'D', b'1', b'X', b'R']);
        let (version, decoded) = decode_lite_req(&encoded).expect("should roundtrip");
        assert_eq!(version, DxxVersion::D1);
        assert_eq!(decoded, release);
    }

    #[test]
    fn full_info_req_roundtrips_with_proto() {
        let release = Release { major: 1, minor: 3, micro: 2 };
        let encoded = encode_full_info_req(DxxVersion::D2, release, 7650);
        assert_eq!(encoded.len(), 13);
        let (version, decoded, proto) =
            decode_full_info_req(&encoded).expect("should roundtrip");
        assert_eq!(version, DxxVersion::D2);
        assert_eq!(decoded, release);
        assert_eq!(proto, 7650);
    }

    #[test]
    fn register_ack_and_pong_roundtrip() {
        assert!(decode_register_ack(&encode_register_ack()).is_ok());
        let pong = encode_pong(1_700_000_000);
        assert_eq!(decode_pong(&pong).expect("pong should decode"), 1_700_000_000);
        assert!(is_webui_ping(&[OP_WEBUI_PING, b'p', b'i', b'n', b'g']));
        assert!(!is_webui_ping(&[OP_WEBUI_PING, b'p', b'o', b'n', b'g']));
    }

    #[test]
    fn game_list_entry_roundtrips_for_v4_and_v6() {
        for addr in ["203.0.113.7:5000", "[2001:db8::7]:5000"] {
            let entry = GameListEntry {
                addr: addr.parse().expect("test addr should parse"),
                release: Release { major: 1, minor: 3, micro: 2 },
                game_id: 0x0403_0201,
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
            };
            let encoded = encode_game_list_entry(&entry);
            assert_eq!(encoded[0], OP_GAME_LIST_ENTRY);
            let decoded = decode_game_list_entry(&encoded).expect("entry should roundtrip");
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn game_list_request_takes_exactly_three_bytes() {
        assert_eq!(
            decode_game_list_request(&[OP_GAME_LIST, 1, 0]).expect("should decode"),
            DxxVersion::D1
        );
        assert!(decode_game_list_request(&[OP_GAME_LIST, 1]).is_err());
        assert!(decode_game_list_request(&[OP_GAME_LIST, 1, 0, 0]).is_err());
    }
}
