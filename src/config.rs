use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

pub const DEFAULT_UDP_PORT: u16 = 9999;
pub const DEFAULT_WS_PORT: u16 = 8081;
pub const DEFAULT_HTTP_PORT: u16 = 9998;
pub const DEFAULT_SNAPSHOT_PATH: &str = "tracker_live.json";
pub const DEFAULT_ARCHIVE_DIR: &str = "archive";

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub udp_port: u16,
    pub ws_port: u16,
    pub http_port: u16,
    pub local_player: Option<String>,
    pub gamelog_dirs: Vec<PathBuf>,
    pub snapshot_path: PathBuf,
    pub archive_dir: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_UDP_PORT,
            ws_port: DEFAULT_WS_PORT,
            http_port: DEFAULT_HTTP_PORT,
            local_player: None,
            gamelog_dirs: Vec::new(),
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            archive_dir: Some(PathBuf::from(DEFAULT_ARCHIVE_DIR)),
        }
    }
}

impl TrackerConfig {
    /// Environment (with `.env` fallback) first, then `--key value` CLI
    /// flags on top. No flag is positional. A value that fails to parse
    /// keeps the default rather than aborting startup.
    pub fn load(args: &[String]) -> Self {
        let dotenv = load_dotenv_fallback();
        let lookup = |key: &str| env_or_dotenv(key, &dotenv);
        Self::resolve(args, lookup)
    }

    fn resolve(args: &[String], lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup("TRACKER_UDP_PORT") {
            apply_port(&mut config.udp_port, "TRACKER_UDP_PORT", &value);
        }
        if let Some(value) = lookup("TRACKER_WS_PORT") {
            apply_port(&mut config.ws_port, "TRACKER_WS_PORT", &value);
        }
        if let Some(value) = lookup("TRACKER_HTTP_PORT") {
            apply_port(&mut config.http_port, "TRACKER_HTTP_PORT", &value);
        }
        if let Some(value) = lookup("TRACKER_LOCAL_PLAYER") {
            config.local_player = Some(value);
        }
        if let Some(value) = lookup("TRACKER_GAMELOG_DIRS") {
            config.gamelog_dirs = split_dirs(&value);
        }
        if let Some(value) = lookup("TRACKER_SNAPSHOT_PATH") {
            config.snapshot_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("TRACKER_ARCHIVE_DIR") {
            config.archive_dir = if value.is_empty() {
                None
            } else {
                Some(PathBuf::from(value))
            };
        }

        let mut iter = args.iter();
        while let Some(flag) = iter.next() {
            let Some(name) = flag.strip_prefix("--") else {
                warn!(arg = %flag, "ignoring unexpected positional argument");
                continue;
            };
            let Some(value) = iter.next() else {
                warn!(flag = %flag, "flag is missing a value");
                break;
            };
            match name {
                "udp-port" => apply_port(&mut config.udp_port, "--udp-port", value),
                "ws-port" => apply_port(&mut config.ws_port, "--ws-port", value),
                "http-port" => apply_port(&mut config.http_port, "--http-port", value),
                "local-player" => config.local_player = Some(value.clone()),
                "gamelog-dirs" => config.gamelog_dirs = split_dirs(value),
                "snapshot-path" => config.snapshot_path = PathBuf::from(value),
                "archive-dir" => {
                    config.archive_dir = if value.is_empty() {
                        None
                    } else {
                        Some(PathBuf::from(value))
                    }
                }
                other => warn!(flag = other, "ignoring unknown flag"),
            }
        }

        config
    }

    /// Directories the local watcher scans: the explicit override wins,
    /// otherwise the working directory plus the rebirth engine's per-user
    /// locations.
    pub fn watch_dirs(&self) -> Vec<PathBuf> {
        if !self.gamelog_dirs.is_empty() {
            return self.gamelog_dirs.clone();
        }
        let mut dirs = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }
        if let Some(home) = dirs::home_dir() {
            dirs.push(home.join(".d1x-rebirth"));
            dirs.push(home.join(".d2x-rebirth"));
        }
        if let Some(config_dir) = dirs::config_dir() {
            dirs.push(config_dir.join("d1x-rebirth"));
            dirs.push(config_dir.join("d2x-rebirth"));
        }
        dirs
    }
}

fn apply_port(slot: &mut u16, origin: &str, value: &str) {
    match value.trim().parse::<u16>() {
        Ok(port) if port != 0 => *slot = port,
        _ => warn!(origin, value, "invalid port value, keeping default"),
    }
}

fn split_dirs(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn env_or_dotenv(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key)
        .ok()
        .or_else(|| dotenv.get(key).cloned())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn load_dotenv_fallback() -> HashMap<String, String> {
    for path in dotenv_candidate_paths() {
        if !path.is_file() {
            continue;
        }
        match parse_dotenv_file(&path) {
            Ok(values) => {
                info!(path = %path.display(), entries = values.len(), "loaded .env fallback");
                return values;
            }
            Err(err) => {
                warn!(?err, path = %path.display(), "failed parsing .env fallback file");
            }
        }
    }
    HashMap::new()
}

fn dotenv_candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".env"));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            paths.push(exe_dir.join(".env"));
        }
    }
    paths
}

fn parse_dotenv_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    let text =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'').to_owned();
        out.insert(key.to_owned(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_key: &str) -> Option<String> {
        None
    }

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| (*part).to_owned()).collect()
    }

    #[test]
    fn defaults_match_the_documented_ports() {
        let config = TrackerConfig::resolve(&[], no_env);
        assert_eq!(config.udp_port, 9999);
        assert_eq!(config.ws_port, 8081);
        assert_eq!(config.http_port, 9998);
        assert_eq!(config.snapshot_path, PathBuf::from("tracker_live.json"));
    }

    #[test]
    fn cli_flags_override_env_values() {
        let env = |key: &str| match key {
            "TRACKER_UDP_PORT" => Some("7000".to_owned()),
            "TRACKER_LOCAL_PLAYER" => Some("alice".to_owned()),
            _ => None,
        };
        let config = TrackerConfig::resolve(&args(&["--udp-port", "7777"]), env);
        assert_eq!(config.udp_port, 7777);
        assert_eq!(config.local_player.as_deref(), Some("alice"));
    }

    #[test]
    fn invalid_port_keeps_the_default() {
        let config = TrackerConfig::resolve(&args(&["--udp-port", "not-a-port"]), no_env);
        assert_eq!(config.udp_port, 9999);
    }

    #[test]
    fn gamelog_dirs_split_on_commas() {
        let config =
            TrackerConfig::resolve(&args(&["--gamelog-dirs", "/tmp/a, /tmp/b,,"]), no_env);
        assert_eq!(
            config.gamelog_dirs,
            vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]
        );
        assert_eq!(config.watch_dirs(), config.gamelog_dirs);
    }

    #[test]
    fn parse_dotenv_supports_comments_export_and_quotes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.env");
        let body = "\n# comment\nexport TRACKER_UDP_PORT=7001\nTRACKER_LOCAL_PLAYER=\"alice\"\nEMPTY=\n";
        fs::write(&path, body).expect("should write temp env file");
        let parsed = parse_dotenv_file(&path).expect("should parse dotenv");
        assert_eq!(
            parsed.get("TRACKER_UDP_PORT").map(String::as_str),
            Some("7001")
        );
        assert_eq!(
            parsed.get("TRACKER_LOCAL_PLAYER").map(String::as_str),
            Some("alice")
        );
        assert_eq!(parsed.get("EMPTY").map(String::as_str), Some(""));
    }

    #[test]
    fn empty_archive_dir_disables_the_sink() {
        let config = TrackerConfig::resolve(&args(&["--archive-dir", ""]), no_env);
        assert!(config.archive_dir.is_none());
    }
}
