//! Runtime configuration.
//!
//! Everything is environment-driven with conservative defaults so the binary
//! can run with no flags at all. The config is built once at startup and
//! shared read-only through the [`Broker`](crate::core::Broker).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;

/// Default terminal geometry handed to every PTY unless the client says
/// otherwise.
pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;

/// Immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The Agent CLI binary to launch (`AGENTDECK_CLI`).
    pub cli: String,
    /// Address the WebSocket/HTTP server binds to (`AGENTDECK_ADDR`).
    pub listen_addr: SocketAddr,
    /// Terminal geometry used when an `init` frame omits cols/rows.
    pub default_cols: u16,
    pub default_rows: u16,
    /// Maximum number of concurrently live PTYs (`AGENTDECK_MAX_SESSIONS`).
    pub max_sessions: usize,
    /// Byte budget for a channel's pending outbound chunks
    /// (`AGENTDECK_OUTBOUND_BUDGET`).
    pub outbound_budget: usize,
    /// Directory the external hook writes completion markers into
    /// (`AGENTDECK_MARKER_DIR`).
    pub marker_dir: PathBuf,
    /// Directory where agent-descriptor files appear after a home-level
    /// initialization task (`AGENTDECK_AGENTS_DIR`).
    pub agents_dir: PathBuf,
    /// File names that must all exist under `agents_dir` before
    /// `agents_deployed` is published (`AGENTDECK_AGENT_DESCRIPTORS`,
    /// comma-separated). Empty disables the check.
    pub agent_descriptors: Vec<String>,
    /// SIGTERM to SIGKILL escalation window.
    pub term_grace: Duration,
    /// Flush budget for buffered output while a session drains.
    pub drain_grace: Duration,
    /// How long a freshly spawned PTY may stay silent before a log line is
    /// emitted. Observational only; the session is never killed for this.
    pub init_quiet: Duration,
    /// Announcement contexts for agent-id capture, matched against the
    /// ANSI-stripped rolling window. Group 1 of each pattern is the id.
    pub capture_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let home = BaseDirs::new()
            .map(|d| d.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/"));
        Self {
            cli: "claude".to_string(),
            listen_addr: "127.0.0.1:9480".parse().expect("static addr"),
            default_cols: DEFAULT_COLS,
            default_rows: DEFAULT_ROWS,
            max_sessions: 64,
            outbound_budget: 4 * 1024 * 1024,
            marker_dir: home.join(".agentdeck").join("markers"),
            agents_dir: home.join(".agentdeck").join("agents"),
            agent_descriptors: Vec::new(),
            term_grace: Duration::from_millis(500),
            drain_grace: Duration::from_millis(500),
            init_quiet: Duration::from_secs(30),
            capture_patterns: default_capture_patterns(),
        }
    }
}

/// UUID-shaped token, case-insensitive.
const UUID: &str = "[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";

/// The safe default announcement contexts: `Session: <uuid>` on one line, or
/// a JSON `"session_id"` value.
pub fn default_capture_patterns() -> Vec<String> {
    vec![
        format!(r"(?i)session:[ \t]*({UUID})"),
        format!(r#""session_id"[ \t]*:[ \t]*"({UUID})""#),
    ]
}

impl Config {
    /// Builds a config from the environment, falling back to defaults for
    /// anything unset or unparseable (unparseable values are logged).
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Ok(cli) = std::env::var("AGENTDECK_CLI") {
            if !cli.is_empty() {
                cfg.cli = cli;
            }
        }
        if let Some(addr) = env_parse::<SocketAddr>("AGENTDECK_ADDR") {
            cfg.listen_addr = addr;
        }
        if let Some(max) = env_parse::<usize>("AGENTDECK_MAX_SESSIONS") {
            cfg.max_sessions = max.max(1);
        }
        if let Some(budget) = env_parse::<usize>("AGENTDECK_OUTBOUND_BUDGET") {
            cfg.outbound_budget = budget.max(64 * 1024);
        }
        if let Ok(dir) = std::env::var("AGENTDECK_MARKER_DIR") {
            cfg.marker_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("AGENTDECK_AGENTS_DIR") {
            cfg.agents_dir = PathBuf::from(dir);
        }
        if let Ok(names) = std::env::var("AGENTDECK_AGENT_DESCRIPTORS") {
            cfg.agent_descriptors = names
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(secs) = env_parse::<u64>("AGENTDECK_INIT_QUIET_SECS") {
            cfg.init_quiet = Duration::from_secs(secs);
        }
        cfg
    }

    /// Slot count for a bounded chunk queue covering `outbound_budget` bytes
    /// of 4 KiB reads.
    pub fn outbound_slots(&self) -> usize {
        (self.outbound_budget / crate::core::pty_engine::READ_CHUNK).max(16)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("Ignoring unparseable {key}={raw}");
                None
            }
        },
        Err(_) => None,
    }
}
