//! Process-wide session registry and lifecycle state machine.
//!
//! The registry is the only shared mutable state that spans sessions. The
//! map itself is a concurrent map with short operations; each record's
//! mutable fields sit behind their own mutex. Ownership is strictly one-way:
//! the registry owns records, a record owns its PTY engine, and channels are
//! referenced only by binding state, never by handle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::error::CoreError;
use super::pty_engine::PtyEngine;

/// What a session is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Interactive,
    Task,
    Resume,
}

/// Whether a browser tab drives the session or it runs detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Interactive,
    Background,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// `init` accepted, id reserved, no I/O yet.
    Initializing,
    /// PTY spawned, duplex I/O in flight.
    Running,
    /// Closing: buffered output flushes, no new input.
    Draining,
    /// Spawn or bind error; never owned a PTY.
    Failed,
    /// Done; the record is removed from the registry.
    Terminated,
}

/// Attempted transition outside the lifecycle table. Always a caller bug,
/// never surfaced on the wire.
#[derive(Debug, thiserror::Error)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    fn may_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, Failed)
                | (Running, Draining)
                | (Running, Terminated)
                | (Draining, Terminated)
                | (Failed, Terminated)
        )
    }
}

/// One live session: identity, lifecycle state, and its owned PTY.
pub struct SessionRecord {
    pub id: String,
    pub kind: SessionKind,
    pub project_path: PathBuf,
    /// Prior Agent id to pass via `--resume`, when kind is `Resume`.
    pub requested_resume_id: Option<String>,
    /// Present iff kind is `Task`.
    pub task_id: Option<String>,
    pub execution_mode: ExecutionMode,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    captured_agent_id: Mutex<Option<String>>,
    last_io_at: Mutex<DateTime<Utc>>,
    pty: Mutex<Option<Arc<PtyEngine>>>,
    /// True while a client channel is bound; a channel binds to at most one
    /// session and a session accepts at most one channel at a time.
    client_bound: AtomicBool,
    /// Set by the output pump when the first chunk arrives, read by the
    /// init-quiet observer.
    saw_output: AtomicBool,
}

impl SessionRecord {
    pub fn new(
        id: String,
        kind: SessionKind,
        project_path: PathBuf,
        requested_resume_id: Option<String>,
        task_id: Option<String>,
        execution_mode: ExecutionMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            project_path,
            requested_resume_id,
            task_id,
            execution_mode,
            created_at: now,
            state: Mutex::new(SessionState::Initializing),
            captured_agent_id: Mutex::new(None),
            last_io_at: Mutex::new(now),
            pty: Mutex::new(None),
            client_bound: AtomicBool::new(false),
            saw_output: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().map(|s| *s).unwrap_or(SessionState::Terminated)
    }

    /// Moves the session along the lifecycle table. Repeated requests for
    /// the state already held are accepted (teardown paths may race).
    pub fn transition(&self, next: SessionState) -> Result<(), IllegalTransition> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(()), // poisoned during teardown; nothing left to protect
        };
        if *state == next {
            return Ok(());
        }
        if !state.may_become(next) {
            return Err(IllegalTransition {
                from: *state,
                to: next,
            });
        }
        log::debug!("session {}: {:?} -> {:?}", self.id, *state, next);
        *state = next;
        Ok(())
    }

    /// Records the Agent's self-assigned id. The first caller wins; later
    /// calls are ignored and return false.
    pub fn set_captured_agent_id(&self, agent_id: &str) -> bool {
        if let Ok(mut slot) = self.captured_agent_id.lock() {
            if slot.is_none() {
                *slot = Some(agent_id.to_string());
                return true;
            }
        }
        false
    }

    pub fn captured_agent_id(&self) -> Option<String> {
        self.captured_agent_id.lock().ok().and_then(|s| s.clone())
    }

    pub fn attach_pty(&self, engine: Arc<PtyEngine>) {
        if let Ok(mut pty) = self.pty.lock() {
            *pty = Some(engine);
        }
    }

    pub fn pty(&self) -> Option<Arc<PtyEngine>> {
        self.pty.lock().ok().and_then(|p| p.clone())
    }

    pub fn take_pty(&self) -> Option<Arc<PtyEngine>> {
        self.pty.lock().ok().and_then(|mut p| p.take())
    }

    /// Claims the single client-binding slot. Returns false if another
    /// channel is already bound.
    pub fn try_bind_client(&self) -> bool {
        self.client_bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_client(&self) {
        self.client_bound.store(false, Ordering::Release);
    }

    pub fn touch_io(&self) {
        if let Ok(mut at) = self.last_io_at.lock() {
            *at = Utc::now();
        }
    }

    pub fn last_io_at(&self) -> DateTime<Utc> {
        self.last_io_at.lock().map(|at| *at).unwrap_or(self.created_at)
    }

    pub fn mark_output(&self) {
        self.saw_output.store(true, Ordering::Release);
    }

    pub fn has_output(&self) -> bool {
        self.saw_output.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("project_path", &self.project_path)
            .finish()
    }
}

/// Thread-safe registry of live sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionRecord>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
        }
    }

    /// Reserves an id for a new session. Fails with `ResourceExhausted` at
    /// the PTY cap and with `BindError` when the id is already live.
    pub fn reserve(&self, record: SessionRecord) -> Result<Arc<SessionRecord>, CoreError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(CoreError::ResourceExhausted(self.sessions.len()));
        }
        match self.sessions.entry(record.id.clone()) {
            Entry::Occupied(mut entry) => {
                // A terminated leftover may be replaced; anything else is a
                // live binding.
                if entry.get().state() == SessionState::Terminated {
                    let fresh = Arc::new(record);
                    entry.insert(fresh.clone());
                    Ok(fresh)
                } else {
                    Err(CoreError::Bind(record.id))
                }
            }
            Entry::Vacant(entry) => {
                let fresh = Arc::new(record);
                entry.insert(fresh.clone());
                Ok(fresh)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions.get(id).map(|r| r.clone())
    }

    /// Removes a record; the caller must already have driven it to
    /// `Terminated`.
    pub fn remove(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions.remove(id).map(|(_, r)| r)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}
