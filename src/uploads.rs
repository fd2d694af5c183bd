use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::gamelog::{parse_gamelog, GamelogParser, GamelogSummary, LogEvent};

/// One uploader's parsed textual stream, bound to the identity they named.
#[derive(Debug)]
pub struct UploadedStream {
    pub identity: String,
    pub parser: GamelogParser,
    pub last_update: DateTime<Utc>,
}

/// A read-only copy handed to the aggregator.
#[derive(Debug, Clone)]
pub struct StreamView {
    pub identity: String,
    pub events: Vec<LogEvent>,
    pub summary: GamelogSummary,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplaceStats {
    pub events_received: usize,
    pub total_clients: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct AppendStats {
    pub new_events: usize,
    pub total_events: usize,
}

/// All textual streams the tracker currently holds, keyed by uploader name.
/// The local gamelog watcher feeds the same table under its own identity.
#[derive(Debug, Default)]
pub struct UploadStore {
    streams: DashMap<String, UploadedStream>,
}

impl UploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_count(&self) -> usize {
        self.streams.len()
    }

    /// Full replace of one player's stream. Nothing is committed when the
    /// content fails to parse.
    pub fn replace(&self, player: &str, content: &str) -> Result<ReplaceStats> {
        let parser = parse_gamelog(content, Some(player))?;
        let events_received = parser.event_count();
        self.streams.insert(
            player.to_owned(),
            UploadedStream {
                identity: player.to_owned(),
                parser,
                last_update: Utc::now(),
            },
        );
        Ok(ReplaceStats {
            events_received,
            total_clients: self.streams.len(),
        })
    }

    /// Appends a tail chunk to one player's stream, creating it on first
    /// contact.
    pub fn append(&self, player: &str, content: &str) -> Result<AppendStats> {
        let mut entry = self
            .streams
            .entry(player.to_owned())
            .or_insert_with(|| UploadedStream {
                identity: player.to_owned(),
                parser: GamelogParser::new(Some(player)),
                last_update: Utc::now(),
            });
        let before = entry.parser.event_count();
        entry.parser.feed(content);
        entry.last_update = Utc::now();
        let total_events = entry.parser.event_count();
        Ok(AppendStats {
            new_events: total_events - before,
            total_events,
        })
    }

    /// Drops one stream; the local watcher uses this when its file shrinks.
    pub fn reset(&self, player: &str) {
        self.streams.remove(player);
    }

    pub fn views(&self) -> Vec<StreamView> {
        self.streams
            .iter()
            .map(|entry| StreamView {
                identity: entry.identity.clone(),
                events: entry.parser.events().to_vec(),
                summary: entry.parser.summary(),
                last_update: entry.last_update,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_overwrites_previous_events() {
        let store = UploadStore::new();
        let first = store
            .replace("alice", "You killed bob\nYou killed carol\n")
            .expect("upload should parse");
        assert_eq!(first.events_received, 2);
        assert_eq!(first.total_clients, 1);

        let second = store
            .replace("alice", "You killed bob\n")
            .expect("upload should parse");
        assert_eq!(second.events_received, 1);
        assert_eq!(store.views()[0].events.len(), 1);
    }

    #[test]
    fn append_accumulates_and_buffers_partial_lines() {
        let store = UploadStore::new();
        let first = store
            .append("alice", "You killed bob\nYou killed c")
            .expect("append should parse");
        assert_eq!(first.new_events, 1);
        let second = store
            .append("alice", "arol\n")
            .expect("append should parse");
        assert_eq!(second.new_events, 1);
        assert_eq!(second.total_events, 2);
    }

    #[test]
    fn reset_drops_the_stream() {
        let store = UploadStore::new();
        store.replace("alice", "You killed bob\n").expect("upload");
        store.reset("alice");
        assert_eq!(store.client_count(), 0);
    }
}
