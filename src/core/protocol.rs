//! Client channel frame grammar.
//!
//! One JSON object per WebSocket text message. The first inbound frame must
//! be `init`; everything after is `input` or `resize`. Outbound, the server
//! sends `output` chunks, at most one terminal `error`, and out-of-band
//! `url_open` hints.

use serde::{Deserialize, Serialize};

use super::error::{CoreError, ErrorBody};
use super::registry::ExecutionMode;

/// Parameters of the mandatory first frame.
#[derive(Debug, Clone, Deserialize)]
pub struct InitFrame {
    pub project_path: String,
    /// For `resume`, the Agent's own prior session id; otherwise an optional
    /// caller-chosen session id.
    pub session_id: Option<String>,
    #[serde(default)]
    pub resume: bool,
    /// Literal command line to run instead of the bare Agent CLI. Never
    /// parsed by the core; handed to the user's shell as-is.
    pub initial_command: Option<String>,
    pub task_id: Option<String>,
    pub execution_mode: Option<ExecutionMode>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Frames the client sends.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Init(InitFrame),
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Opaque chunk of PTY output; may contain ANSI sequences.
    Output { data: String },
    /// Terminal error; the socket closes right after.
    Error { error: ErrorBody },
    /// The Agent printed a URL the UI should open.
    UrlOpen { url: String },
}

impl Outbound {
    pub fn error(err: &CoreError) -> Self {
        Outbound::Error { error: err.body() }
    }
}
