//! Line parser for DXX textual gamelogs. Patterns are compiled once and
//! matched case-insensitively per line; "You"/"Yourself" participants are
//! rewritten to the bound identity at parse time so events from different
//! uploaders merge cleanly.

use std::collections::HashMap;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

const MAX_UPLOAD_BYTES: usize = 4 * 1024 * 1024;
const MAX_UNKNOWN_LINES: usize = 50;

static JOIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^'?([^']+?)'? is joining the game\.?$").expect("join pattern"));
static DEATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.+?) was killed by (?:an? )?(.+?)[.!]?$").expect("death pattern"));
static SUICIDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.+?) committed suicide[.!]?$").expect("suicide pattern"));
static KILL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(.+?) killed (.+?)(?: with (.+?))?[.!]?$").expect("kill pattern")
});
static QUIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.+?) has left the game[.!]?$").expect("quit pattern"));
static ESCAPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(.+?) (?:has|have) escaped(?: the mine)?[.!]?$").expect("escape pattern")
});
static FLAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.+?) captured the flag[.!]?$").expect("flag pattern"));
static KILL_GOAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)kill goal reached").expect("kill goal pattern"));
static REACTOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)reactor (?:was )?destroyed").expect("reactor pattern"));
static CHAT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:\[chat\] |message from )(.+?): (.+)$").expect("chat pattern")
});

// "X was killed by <cause>" where the cause is the environment rather than
// another pilot.
const ENVIRONMENT_CAUSES: &[&str] = &[
    "robot",
    "mine",
    "reactor",
    "lava",
    "door",
    "wall",
    "self-destruct",
    "countdown",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Join {
        name: String,
    },
    Kill {
        killer: String,
        victim: String,
        weapon: Option<String>,
    },
    Suicide {
        name: String,
    },
    Death {
        name: String,
        cause: Option<String>,
    },
    Quit {
        name: String,
    },
    Escape {
        name: String,
    },
    ReactorDestroyed,
    FlagCaptured {
        name: String,
    },
    KillGoal,
    Chat {
        sender: String,
        text: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlayerTotals {
    pub kills: u32,
    pub deaths: u32,
    pub suicides: u32,
    pub streak: u32,
    pub max_streak: u32,
    pub weapons: HashMap<String, u32>,
    pub victims: HashMap<String, u32>,
    pub killers: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GamelogSummary {
    pub identity: Option<String>,
    pub provisional_identity: bool,
    pub totals: HashMap<String, PlayerTotals>,
    pub unknown_lines: usize,
}

/// Incremental gamelog parser. Feed it chunks as they arrive; a trailing
/// partial line is buffered until its newline shows up. No state outside
/// the instance, so a fresh parser over a truncated input yields the same
/// prefix of events.
#[derive(Debug, Default)]
pub struct GamelogParser {
    identity: Option<String>,
    provisional: bool,
    joined_names: Vec<String>,
    events: Vec<LogEvent>,
    totals: HashMap<String, PlayerTotals>,
    unknown: Vec<String>,
    unknown_total: usize,
    pending: String,
}

impl GamelogParser {
    pub fn new(identity: Option<&str>) -> Self {
        Self {
            identity: identity
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(ToOwned::to_owned),
            ..Self::default()
        }
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn provisional_identity(&self) -> bool {
        self.provisional
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Unconsumed tail of the last chunk (no trailing newline yet).
    pub fn raw_tail(&self) -> &str {
        &self.pending
    }

    pub fn feed(&mut self, chunk: &str) {
        self.pending.push_str(chunk);
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            self.push_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    /// Flushes the buffered tail as a final line (end of input).
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.push_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    pub fn summary(&self) -> GamelogSummary {
        GamelogSummary {
            identity: self.identity.clone(),
            provisional_identity: self.provisional,
            totals: self.totals.clone(),
            unknown_lines: self.unknown_total,
        }
    }

    pub fn unknown_lines(&self) -> &[String] {
        &self.unknown
    }

    fn push_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let Some(event) = self.classify(line) else {
            self.unknown_total += 1;
            if self.unknown.len() < MAX_UNKNOWN_LINES {
                self.unknown.push(line.to_owned());
            }
            return;
        };
        self.apply_totals(&event);
        self.events.push(event);
    }

    fn classify(&mut self, line: &str) -> Option<LogEvent> {
        if let Some(captures) = JOIN_RE.captures(line) {
            let name = self.participant(&captures[1]);
            if self.identity.is_none() {
                self.joined_names.push(name.clone());
            }
            return Some(LogEvent::Join { name });
        }
        if let Some(captures) = DEATH_RE.captures(line) {
            let victim = self.participant(&captures[1]);
            let cause = captures[2].trim().to_owned();
            if is_environment_cause(&cause) {
                return Some(LogEvent::Death {
                    name: victim,
                    cause: Some(cause),
                });
            }
            // The cause is another pilot; record it as a kill so it merges
            // with the same kill seen over UDP.
            let killer = self.participant(&cause);
            if killer.eq_ignore_ascii_case(&victim) {
                return Some(LogEvent::Suicide { name: victim });
            }
            return Some(LogEvent::Kill {
                killer,
                victim,
                weapon: None,
            });
        }
        if let Some(captures) = SUICIDE_RE.captures(line) {
            return Some(LogEvent::Suicide {
                name: self.participant(&captures[1]),
            });
        }
        if let Some(captures) = KILL_RE.captures(line) {
            let killer = self.participant(&captures[1]);
            let victim = self.participant(&captures[2]);
            let weapon = captures.get(3).map(|m| m.as_str().trim().to_owned());
            if killer.eq_ignore_ascii_case(&victim) {
                return Some(LogEvent::Suicide { name: victim });
            }
            return Some(LogEvent::Kill {
                killer,
                victim,
                weapon,
            });
        }
        if let Some(captures) = QUIT_RE.captures(line) {
            return Some(LogEvent::Quit {
                name: self.participant(&captures[1]),
            });
        }
        if let Some(captures) = ESCAPE_RE.captures(line) {
            return Some(LogEvent::Escape {
                name: self.participant(&captures[1]),
            });
        }
        if let Some(captures) = FLAG_RE.captures(line) {
            return Some(LogEvent::FlagCaptured {
                name: self.participant(&captures[1]),
            });
        }
        if REACTOR_RE.is_match(line) {
            return Some(LogEvent::ReactorDestroyed);
        }
        if KILL_GOAL_RE.is_match(line) {
            return Some(LogEvent::KillGoal);
        }
        if let Some(captures) = CHAT_RE.captures(line) {
            return Some(LogEvent::Chat {
                sender: self.participant(&captures[1]),
                text: captures[2].trim().to_owned(),
            });
        }
        None
    }

    /// Resolves a captured participant token, rewriting the second person to
    /// the bound identity. The first "You" action seen without a bound
    /// identity adopts the sole joined name as a provisional identity.
    fn participant(&mut self, token: &str) -> String {
        let token = token.trim();
        if !(token.eq_ignore_ascii_case("you") || token.eq_ignore_ascii_case("yourself")) {
            return token.to_owned();
        }
        if self.identity.is_none() && self.joined_names.len() == 1 {
            self.identity = Some(self.joined_names[0].clone());
            self.provisional = true;
        }
        self.identity
            .clone()
            .unwrap_or_else(|| token.to_owned())
    }

    fn apply_totals(&mut self, event: &LogEvent) {
        match event {
            LogEvent::Kill {
                killer,
                victim,
                weapon,
            } => {
                {
                    let entry = self.totals.entry(killer.clone()).or_default();
                    entry.kills += 1;
                    entry.streak += 1;
                    entry.max_streak = entry.max_streak.max(entry.streak);
                    if let Some(weapon) = weapon {
                        *entry.weapons.entry(weapon.clone()).or_default() += 1;
                    }
                    *entry.victims.entry(victim.clone()).or_default() += 1;
                }
                let entry = self.totals.entry(victim.clone()).or_default();
                entry.deaths += 1;
                entry.streak = 0;
                *entry.killers.entry(killer.clone()).or_default() += 1;
            }
            LogEvent::Suicide { name } => {
                let entry = self.totals.entry(name.clone()).or_default();
                entry.suicides += 1;
                entry.deaths += 1;
                entry.streak = 0;
            }
            LogEvent::Death { name, .. } => {
                let entry = self.totals.entry(name.clone()).or_default();
                entry.deaths += 1;
                entry.streak = 0;
            }
            _ => {}
        }
    }
}

fn is_environment_cause(cause: &str) -> bool {
    let lowered = cause.to_ascii_lowercase();
    ENVIRONMENT_CAUSES
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Batch entry point used by the upload endpoints. Runs an inference
/// pre-pass when no identity is bound, so "You" lines ahead of the join
/// line still resolve.
pub fn parse_gamelog(text: &str, identity: Option<&str>) -> Result<GamelogParser> {
    if text.len() > MAX_UPLOAD_BYTES {
        bail!(
            "gamelog exceeds {MAX_UPLOAD_BYTES} bytes ({} received)",
            text.len()
        );
    }
    let mut resolved = identity
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned);
    let mut provisional = false;
    if resolved.is_none() {
        let mut joined = Vec::new();
        let mut saw_you_action = false;
        for line in text.lines() {
            let line = line.trim();
            if let Some(captures) = JOIN_RE.captures(line) {
                joined.push(captures[1].trim().to_owned());
            } else if line.to_ascii_lowercase().starts_with("you ") {
                saw_you_action = true;
            }
        }
        if joined.len() == 1 && saw_you_action {
            resolved = Some(joined.remove(0));
            provisional = true;
        }
    }
    let mut parser = GamelogParser::new(resolved.as_deref());
    parser.provisional = provisional;
    parser.feed(text);
    parser.finish();
    Ok(parser)
}
