//! One-shot task runs of the Agent CLI.
//!
//! A task is a session of kind `task`: the CLI runs once with a literal
//! prompt, its output feeds the id-capture filter and a bounded post-mortem
//! ring, and completion is decided by a race between the hook-written
//! marker file and PTY exit. Whatever happens, exactly one `task_completed`
//! event is published.
//!
//! Tasks outlive their client: a disconnecting tab detaches, the run keeps
//! going, and a later tab may re-attach and catch up from the ring.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use directories::BaseDirs;
use notify::Watcher;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::core::error::CoreError;
use crate::core::event_bus::{BusEvent, EventBus, TaskCompletion, TaskStatus};
use crate::core::id_capture::{IdCaptureFilter, UrlScanner};
use crate::core::multiplexer::shell_argv;
use crate::core::protocol::{InitFrame, Inbound, Outbound};
use crate::core::pty_engine::{PtyEngine, SpawnSpec, Utf8Decoder};
use crate::core::registry::{ExecutionMode, SessionKind, SessionRecord, SessionRegistry, SessionState};
use crate::core::ring::RingBuffer;

/// Post-mortem output retained for a detached task.
const TASK_RING_BYTES: usize = 256 * 1024;

/// Fan-out capacity towards an attached viewer.
const TASK_BROADCAST_SLOTS: usize = 256;

/// Backstop poll interval for the marker watch, in case a filesystem event
/// is missed or the platform watcher fails.
const MARKER_POLL: Duration = Duration::from_secs(2);

/// How a task run is requested.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_id: String,
    /// Literal prompt, passed as the single positional argument.
    pub prompt: Option<String>,
    /// Alternatively a full literal command line (from a channel `init`);
    /// takes precedence over `prompt` and is never parsed.
    pub command_line: Option<String>,
    /// Defaults to the user's home directory (home-level initialization).
    pub working_directory: Option<PathBuf>,
    pub skip_permissions: bool,
    pub verbose: bool,
    /// Opaque; forwarded verbatim on the completion event.
    pub notification_targets: serde_json::Value,
    pub execution_mode: ExecutionMode,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl TaskSpec {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            prompt: None,
            command_line: None,
            working_directory: None,
            skip_permissions: false,
            verbose: false,
            notification_targets: serde_json::Value::Null,
            execution_mode: ExecutionMode::Background,
            cols: None,
            rows: None,
        }
    }
}

/// The completion marker the external hook writes.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionMarker {
    pub task_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub ended_at: Option<String>,
}

/// A running task: its session, engine, and output fan-out.
pub struct TaskHandle {
    pub task_id: String,
    pub record: Arc<SessionRecord>,
    pub engine: Arc<PtyEngine>,
    /// Live output fan-out for an attached viewer. Lagging viewers skip
    /// chunks; the run itself never stalls on them.
    output: broadcast::Sender<Vec<u8>>,
    /// Recent output for catch-up and post-mortem.
    ring: Mutex<RingBuffer>,
    status: Mutex<TaskStatus>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    home_level: bool,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .field("record", &self.record)
            .field("engine", &self.engine)
            .field("ring", &self.ring)
            .field("status", &self.status)
            .field("started_at", &self.started_at)
            .field("home_level", &self.home_level)
            .finish_non_exhaustive()
    }
}

impl TaskHandle {
    pub fn status(&self) -> TaskStatus {
        self.status.lock().map(|s| *s).unwrap_or(TaskStatus::Failed)
    }

    /// Moves to a terminal status. The first caller wins and gets `true`;
    /// that caller publishes the completion event.
    fn finish(&self, status: TaskStatus) -> bool {
        if let Ok(mut slot) = self.status.lock() {
            if matches!(*slot, TaskStatus::Pending | TaskStatus::Running) {
                *slot = status;
                return true;
            }
        }
        false
    }

    /// Subscribes a viewer and snapshots the ring under one lock, so the
    /// snapshot plus the live stream is gap- and duplicate-free.
    fn attach_output(&self) -> (Vec<u8>, broadcast::Receiver<Vec<u8>>) {
        match self.ring.lock() {
            Ok(ring) => {
                let rx = self.output.subscribe();
                (ring.read_all(), rx)
            }
            Err(_) => (Vec::new(), self.output.subscribe()),
        }
    }

    /// Post-mortem view of the retained output.
    pub fn ring_contents(&self) -> Vec<u8> {
        self.ring.lock().map(|r| r.read_all()).unwrap_or_default()
    }
}

/// Launches and supervises tasks; owns the task table.
pub struct TaskSupervisor {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    tasks: Arc<DashMap<String, Arc<TaskHandle>>>,
}

impl TaskSupervisor {
    pub fn new(config: Arc<Config>, registry: Arc<SessionRegistry>, bus: EventBus) -> Self {
        Self {
            config,
            registry,
            bus,
            tasks: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// Launches a task and starts its pump and monitor. Returns the handle;
    /// the completion event arrives on the bus later.
    pub fn launch(&self, spec: TaskSpec) -> Result<Arc<TaskHandle>, CoreError> {
        if self.tasks.contains_key(&spec.task_id) {
            return Err(CoreError::Bind(spec.task_id));
        }

        let cwd = match &spec.working_directory {
            Some(dir) => dir.clone(),
            None => BaseDirs::new()
                .map(|d| d.home_dir().to_path_buf())
                .ok_or_else(|| CoreError::Spawn("cannot resolve home directory".to_string()))?,
        };
        let home_level = spec.working_directory.is_none();

        let session_id = uuid::Uuid::new_v4().to_string();
        let record = self.registry.reserve(SessionRecord::new(
            session_id,
            SessionKind::Task,
            cwd.clone(),
            None,
            Some(spec.task_id.clone()),
            spec.execution_mode,
        ))?;

        let pty_spec = SpawnSpec {
            cwd,
            argv: self.task_argv(&spec),
            env: vec![("AGENTDECK_SESSION_ID".to_string(), record.id.clone())],
            cols: spec.cols.unwrap_or(self.config.default_cols),
            rows: spec.rows.unwrap_or(self.config.default_rows),
        };
        let engine = match PtyEngine::spawn(&pty_spec, self.config.outbound_slots()) {
            Ok(engine) => Arc::new(engine),
            Err(err) => {
                let _ = record.transition(SessionState::Failed);
                let _ = record.transition(SessionState::Terminated);
                self.registry.remove(&record.id);
                // Downstream consumers still learn the task is dead.
                self.bus.publish(BusEvent::TaskCompleted(TaskCompletion {
                    task_id: spec.task_id.clone(),
                    session_id: None,
                    exit_code: None,
                    status: TaskStatus::Failed,
                    notification_targets: spec.notification_targets.clone(),
                    ended_at: chrono::Utc::now().to_rfc3339(),
                }));
                return Err(err);
            }
        };
        record.attach_pty(engine.clone());
        if let Err(e) = record.transition(SessionState::Running) {
            log::error!("task {}: {e}", spec.task_id);
        }

        let (output_tx, _) = broadcast::channel(TASK_BROADCAST_SLOTS);
        let handle = Arc::new(TaskHandle {
            task_id: spec.task_id.clone(),
            record: record.clone(),
            engine: engine.clone(),
            output: output_tx,
            ring: Mutex::new(RingBuffer::new(TASK_RING_BYTES)),
            status: Mutex::new(TaskStatus::Running),
            started_at: chrono::Utc::now(),
            home_level,
        });
        match self.tasks.entry(spec.task_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Lost a launch race for this task id; the winner owns the
                // run and will publish its completion.
                let engine = engine.clone();
                let record = record.clone();
                let registry = self.registry.clone();
                let grace = self.config.term_grace;
                tokio::spawn(async move {
                    engine.terminate(grace).await;
                    engine.close().await;
                    let _ = record.transition(SessionState::Draining);
                    let _ = record.transition(SessionState::Terminated);
                    registry.remove(&record.id);
                });
                return Err(CoreError::Bind(spec.task_id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle.clone());
            }
        }

        log::info!(
            "task {} launched (session {}, mode {:?})",
            spec.task_id,
            record.id,
            spec.execution_mode
        );

        // Observational only: a slow-starting Agent is legitimate.
        {
            let record = record.clone();
            let quiet = self.config.init_quiet;
            tokio::spawn(async move {
                tokio::time::sleep(quiet).await;
                if !record.has_output() {
                    log::info!(
                        "task session {}: no PTY output within {quiet:?} of spawn",
                        record.id
                    );
                }
            });
        }

        let pump = self.spawn_pump(handle.clone());
        self.spawn_monitor(handle.clone(), spec, pump);
        Ok(handle)
    }

    /// Argv for a task run: either the literal command line through the
    /// shell, or the CLI with the prompt positional plus the core-layer
    /// flags.
    fn task_argv(&self, spec: &TaskSpec) -> Vec<String> {
        if let Some(command_line) = &spec.command_line {
            return shell_argv(command_line);
        }
        let mut argv = vec![self.config.cli.clone()];
        if let Some(prompt) = &spec.prompt {
            argv.push(prompt.clone());
        }
        if spec.skip_permissions {
            argv.push("--dangerously-skip-permissions".to_string());
        }
        if spec.verbose {
            argv.push("--verbose".to_string());
        }
        argv
    }

    /// Output pump: PTY chunks feed the id filter, the ring, and the viewer
    /// fan-out. Runs until PTY EOF regardless of viewers.
    fn spawn_pump(&self, handle: Arc<TaskHandle>) -> Option<tokio::task::JoinHandle<()>> {
        let mut out_rx = match handle.engine.take_output() {
            Some(rx) => rx,
            None => {
                log::error!("task {}: output stream already claimed", handle.task_id);
                return None;
            }
        };
        let patterns = self.config.capture_patterns.clone();
        let pump = tokio::spawn(async move {
            let mut filter = IdCaptureFilter::new(&patterns);
            while let Some(chunk) = out_rx.recv().await {
                handle.record.mark_output();
                handle.record.touch_io();
                if let Some(agent_id) = filter.scan(&chunk) {
                    if handle.record.set_captured_agent_id(&agent_id) {
                        log::info!(
                            "task {}: captured agent session id {agent_id}",
                            handle.task_id
                        );
                    }
                }
                // Ring write and fan-out are serialized so a late attach
                // sees every byte exactly once.
                if let Ok(mut ring) = handle.ring.lock() {
                    ring.write(&chunk);
                    let _ = handle.output.send(chunk);
                }
            }
            log::debug!("task {}: output pump finished", handle.task_id);
        });
        Some(pump)
    }

    /// Completion monitor: races the marker watch against PTY exit, lets the
    /// pump flush within the drain budget, assembles the completion event,
    /// publishes it once, and tears the session down.
    fn spawn_monitor(
        &self,
        handle: Arc<TaskHandle>,
        spec: TaskSpec,
        pump: Option<tokio::task::JoinHandle<()>>,
    ) {
        let config = self.config.clone();
        let registry = self.registry.clone();
        let bus = self.bus.clone();
        let tasks_key = handle.task_id.clone();
        let supervisor_tasks = self.tasks.clone();
        tokio::spawn(async move {
            let marker_path = config.marker_dir.join(format!("{}.json", handle.task_id));

            let (marker, exit_code) = tokio::select! {
                marker = await_marker(config.marker_dir.clone(), marker_path.clone(), handle.task_id.clone()) => {
                    // Marker first: the run is over as far as the hook is
                    // concerned; reap the child if it lingers.
                    if handle.engine.try_exit_code().is_none() {
                        handle.engine.terminate(config.term_grace).await;
                    }
                    (Some(marker), handle.engine.try_exit_code())
                }
                code = handle.engine.wait() => {
                    // The hook may have written the marker right at exit;
                    // one final check so marker fields can take precedence.
                    (read_marker(&marker_path, &handle.task_id).await, Some(code))
                }
            };

            if let Err(e) = handle.record.transition(SessionState::Draining) {
                log::error!("task {}: {e}", handle.task_id);
            }

            // Let the pump drain what the child left behind; a capture in
            // the final chunks must land before the event is assembled.
            if let Some(mut pump) = pump {
                if tokio::time::timeout(config.drain_grace, &mut pump)
                    .await
                    .is_err()
                {
                    pump.abort();
                }
            }

            let captured = handle.record.captured_agent_id();
            let session_id = match (&marker, &captured) {
                (Some(m), Some(c)) => match &m.session_id {
                    Some(mid) => {
                        if mid != c {
                            log::warn!(
                                "task {}: captured agent id {c} disagrees with marker {mid}; using marker",
                                handle.task_id
                            );
                        }
                        Some(mid.clone())
                    }
                    None => Some(c.clone()),
                },
                (Some(m), None) => m.session_id.clone(),
                (None, Some(c)) => Some(c.clone()),
                (None, None) => None,
            };

            let published_exit = match &marker {
                Some(m) => match m.exit_code {
                    Some(code) => {
                        if let Some(proc_code) = exit_code {
                            if proc_code != code {
                                log::warn!(
                                    "task {}: marker exit {code} disagrees with process exit {proc_code}; using marker",
                                    handle.task_id
                                );
                            }
                        }
                        Some(code)
                    }
                    None => exit_code,
                },
                None => exit_code,
            };

            let status = if marker.is_some() {
                TaskStatus::Completed
            } else if published_exit == Some(0) {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };

            let ended_at = marker
                .as_ref()
                .and_then(|m| m.ended_at.clone())
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

            if handle.finish(status) {
                log::info!(
                    "task {} finished: status={status:?} exit={published_exit:?} agent={session_id:?}",
                    handle.task_id
                );
                bus.publish(BusEvent::TaskCompleted(TaskCompletion {
                    task_id: handle.task_id.clone(),
                    session_id,
                    exit_code: published_exit,
                    status,
                    notification_targets: spec.notification_targets.clone(),
                    ended_at,
                }));

                if status == TaskStatus::Completed && handle.home_level {
                    maybe_publish_agents_deployed(&config, &bus, &handle.task_id);
                }
            }

            // Orderly teardown of the backing session.
            if handle.engine.try_exit_code().is_none() {
                handle.engine.terminate(config.term_grace).await;
            }
            handle.engine.close().await;
            handle.record.take_pty();
            if let Err(e) = handle.record.transition(SessionState::Terminated) {
                log::error!("task {}: {e}", handle.task_id);
            }
            registry.remove(&handle.record.id);
            // The task record has served its purpose once the event is out.
            supervisor_tasks.remove(&tasks_key);
        });
    }

    /// Serves a channel whose `init` carries a `task_id`: attaches to the
    /// running task, or launches it from the init parameters first.
    pub async fn run_channel(
        &self,
        init: InitFrame,
        outbound: mpsc::Sender<Outbound>,
        inbound: mpsc::Receiver<Inbound>,
    ) {
        let task_id = match &init.task_id {
            Some(id) => id.clone(),
            None => return,
        };
        let mode = init.execution_mode.unwrap_or(ExecutionMode::Interactive);

        let handle = match self.get(&task_id) {
            Some(handle) => handle,
            None => {
                let spec = TaskSpec {
                    task_id: task_id.clone(),
                    prompt: None,
                    command_line: init.initial_command.clone(),
                    working_directory: Some(PathBuf::from(&init.project_path)),
                    skip_permissions: false,
                    verbose: false,
                    notification_targets: serde_json::Value::Null,
                    execution_mode: mode,
                    cols: init.cols,
                    rows: init.rows,
                };
                match self.launch(spec) {
                    Ok(handle) => handle,
                    Err(err) => {
                        log::warn!("task {task_id} launch failed: {err}");
                        let _ = outbound.send(Outbound::error(&err)).await;
                        return;
                    }
                }
            }
        };

        // Background runs never get a channel; the init is fire-and-forget.
        if mode == ExecutionMode::Background {
            return;
        }

        attach_viewer(handle, outbound, inbound).await;
    }
}

/// Bidirectional attach of a viewer channel to a running task. A close from
/// the client detaches without touching the run.
async fn attach_viewer(
    handle: Arc<TaskHandle>,
    outbound: mpsc::Sender<Outbound>,
    mut inbound: mpsc::Receiver<Inbound>,
) {
    if !handle.record.try_bind_client() {
        let err = CoreError::Bind(handle.record.id.clone());
        let _ = outbound.send(Outbound::error(&err)).await;
        return;
    }

    let (catch_up, mut live) = handle.attach_output();
    let mut decoder = Utf8Decoder::new();
    let mut urls = UrlScanner::new();
    if !catch_up.is_empty() {
        let data = decoder.decode(&catch_up);
        if outbound.send(Outbound::Output { data }).await.is_err() {
            handle.record.release_client();
            return;
        }
    }

    loop {
        tokio::select! {
            chunk = live.recv() => match chunk {
                Ok(chunk) => {
                    if let Some(url) = urls.scan(&chunk) {
                        if outbound.send(Outbound::UrlOpen { url }).await.is_err() {
                            break;
                        }
                    }
                    let data = decoder.decode(&chunk);
                    if data.is_empty() {
                        continue;
                    }
                    if outbound.send(Outbound::Output { data }).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "task {}: viewer lagged, {skipped} chunks skipped",
                        handle.task_id
                    );
                    continue;
                }
                // Pump finished: the run is over, close the channel.
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = inbound.recv() => match frame {
                Some(Inbound::Input { data }) => {
                    if let Err(err) = handle.engine.write(data.as_bytes()) {
                        log::warn!("task {}: {err}", handle.task_id);
                        let _ = outbound.send(Outbound::error(&err)).await;
                        break;
                    }
                    handle.record.touch_io();
                }
                Some(Inbound::Resize { cols, rows }) => {
                    if cols > 0 && rows > 0 {
                        let _ = handle.engine.resize(cols, rows);
                    }
                }
                Some(Inbound::Init(_)) => {
                    let err = CoreError::Protocol("init on an initialized channel".to_string());
                    let _ = outbound.send(Outbound::error(&err)).await;
                    break;
                }
                // Client hung up: detach, the task keeps running.
                None => break,
            },
        }
    }
    handle.record.release_client();
    log::debug!("task {}: viewer detached", handle.task_id);
}

/// Publishes `agents_deployed` when every configured descriptor file exists.
fn maybe_publish_agents_deployed(config: &Config, bus: &EventBus, task_id: &str) {
    if config.agent_descriptors.is_empty() {
        return;
    }
    let all_present = config
        .agent_descriptors
        .iter()
        .all(|name| config.agents_dir.join(name).exists());
    if all_present {
        log::info!("home-level task {task_id} deployed the agent descriptors");
        bus.publish(BusEvent::AgentsDeployed {
            task_id: task_id.to_string(),
        });
    }
}

/// Resolves once the completion marker for `task_id` exists and parses.
/// Watches the marker directory, with a poll backstop in case the platform
/// watcher fails or misses an event.
async fn await_marker(dir: PathBuf, path: PathBuf, task_id: String) -> CompletionMarker {
    if let Err(e) = std::fs::create_dir_all(&dir) {
        log::warn!("cannot create marker dir {}: {e}", dir.display());
    }

    let (tx, mut rx) = mpsc::channel::<()>(8);
    let _watcher = match notify::recommended_watcher(
        move |res: Result<notify::Event, notify::Error>| {
            if res.is_ok() {
                // Callback runs on the watcher's own thread.
                let _ = tx.blocking_send(());
            }
        },
    ) {
        Ok(mut watcher) => match watcher.watch(&dir, notify::RecursiveMode::NonRecursive) {
            Ok(()) => Some(watcher),
            Err(e) => {
                log::warn!("marker watch on {} failed: {e}", dir.display());
                None
            }
        },
        Err(e) => {
            log::warn!("marker watcher unavailable: {e}");
            None
        }
    };

    loop {
        if let Some(marker) = read_marker(&path, &task_id).await {
            return marker;
        }
        if _watcher.is_some() {
            let _ = tokio::time::timeout(MARKER_POLL, rx.recv()).await;
        } else {
            tokio::time::sleep(MARKER_POLL).await;
        }
    }
}

/// Reads and parses the marker if it is present and complete. A half-written
/// file simply fails to parse and is retried on the next event.
async fn read_marker(path: &Path, task_id: &str) -> Option<CompletionMarker> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let marker: CompletionMarker = serde_json::from_slice(&bytes).ok()?;
    if marker.task_id != task_id {
        log::warn!(
            "marker at {} names task {} (expected {task_id})",
            path.display(),
            marker.task_id
        );
    }
    Some(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const AGENT_ID: &str = "8a2f04c6-1b2c-4d5e-8f90-abcdef012345";

    struct Fixture {
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        bus: EventBus,
        supervisor: TaskSupervisor,
        _dirs: Vec<tempfile::TempDir>,
    }

    fn fixture() -> Fixture {
        let marker_dir = tempfile::tempdir().unwrap();
        let agents_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.marker_dir = marker_dir.path().to_path_buf();
        config.agents_dir = agents_dir.path().to_path_buf();
        config.drain_grace = Duration::from_millis(50);
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        let bus = EventBus::new();
        let supervisor = TaskSupervisor::new(config.clone(), registry.clone(), bus.clone());
        Fixture {
            config,
            registry,
            bus,
            supervisor,
            _dirs: vec![marker_dir, agents_dir],
        }
    }

    /// Writes an executable fake Agent CLI script and returns its path.
    fn fake_cli(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-agent");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn spec_for(script: &Path, task_id: &str, workdir: &Path) -> TaskSpec {
        let mut spec = TaskSpec::new(task_id);
        spec.command_line = Some(script.display().to_string());
        spec.working_directory = Some(workdir.to_path_buf());
        spec
    }

    async fn next_completion(rx: &mut broadcast::Receiver<BusEvent>) -> TaskCompletion {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for completion")
                .expect("bus closed")
            {
                BusEvent::TaskCompleted(c) => return c,
                BusEvent::AgentsDeployed { .. } => continue,
            }
        }
    }

    #[tokio::test]
    async fn capture_without_marker_completes_with_agent_id() {
        let fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cli(dir.path(), &format!("echo \"Session: {AGENT_ID}\"; exit 0"));
        let mut rx = fx.bus.subscribe();

        fx.supervisor
            .launch(spec_for(&script, "T7", dir.path()))
            .unwrap();
        let done = next_completion(&mut rx).await;
        assert_eq!(done.task_id, "T7");
        assert_eq!(done.session_id.as_deref(), Some(AGENT_ID));
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn marker_fields_take_precedence() {
        let fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        // Exits non-zero and lingers; the marker decides the outcome.
        let script = fake_cli(
            dir.path(),
            &format!("echo \"Session: {AGENT_ID}\"; sleep 30"),
        );
        let mut rx = fx.bus.subscribe();

        fx.supervisor
            .launch(spec_for(&script, "T8", dir.path()))
            .unwrap();
        // Let the run start, then play the hook.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let marker = serde_json::json!({
            "task_id": "T8",
            "session_id": AGENT_ID,
            "exit_code": 0,
            "ended_at": "2026-08-01T00:00:00Z",
        });
        std::fs::write(
            fx.config.marker_dir.join("T8.json"),
            serde_json::to_vec(&marker).unwrap(),
        )
        .unwrap();

        let done = next_completion(&mut rx).await;
        assert_eq!(done.session_id.as_deref(), Some(AGENT_ID));
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.ended_at, "2026-08-01T00:00:00Z");
    }

    #[tokio::test]
    async fn failure_without_capture_or_marker() {
        let fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cli(dir.path(), "echo working; exit 2");
        let mut rx = fx.bus.subscribe();

        let handle = fx
            .supervisor
            .launch(spec_for(&script, "T9", dir.path()))
            .unwrap();
        let done = next_completion(&mut rx).await;
        assert_eq!(done.session_id, None);
        assert_eq!(done.exit_code, Some(2));
        assert_eq!(done.status, TaskStatus::Failed);
        // The ring retains the output for post-mortem inspection.
        let post_mortem = String::from_utf8_lossy(&handle.ring_contents()).to_string();
        assert!(post_mortem.contains("working"), "got: {post_mortem:?}");
    }

    #[tokio::test]
    async fn completion_is_published_exactly_once_and_session_cleaned() {
        let fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cli(dir.path(), "exit 0");
        let mut rx = fx.bus.subscribe();

        fx.supervisor
            .launch(spec_for(&script, "T1", dir.path()))
            .unwrap();
        let done = next_completion(&mut rx).await;
        assert_eq!(done.task_id, "T1");

        // No second event and no leftover session or task entry.
        let extra = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(extra.is_err(), "unexpected second event: {extra:?}");
        assert_eq!(fx.registry.active_count(), 0);
        assert!(fx.supervisor.get("T1").is_none());
    }

    #[tokio::test]
    async fn duplicate_task_id_is_rejected() {
        let fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cli(dir.path(), "sleep 5");
        fx.supervisor
            .launch(spec_for(&script, "T2", dir.path()))
            .unwrap();
        match fx.supervisor.launch(spec_for(&script, "T2", dir.path())) {
            Err(CoreError::Bind(_)) => {}
            other => panic!("expected BindError, got {other:?}"),
        }
        if let Some(handle) = fx.supervisor.get("T2") {
            handle.engine.terminate(Duration::from_millis(200)).await;
        }
    }

    #[tokio::test]
    async fn spawn_failure_publishes_failed_completion() {
        let fx = fixture();
        let mut rx = fx.bus.subscribe();
        let mut spec = TaskSpec::new("T3");
        spec.prompt = Some("hello".to_string());
        spec.working_directory = Some(PathBuf::from("/definitely/not/here"));
        // Default config CLI is not on PATH here either way; cwd fails first.
        assert!(fx.supervisor.launch(spec).is_err());
        let done = next_completion(&mut rx).await;
        assert_eq!(done.task_id, "T3");
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.exit_code, None);
        assert_eq!(fx.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn home_level_success_reports_agents_deployed() {
        let fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cli(dir.path(), "exit 0");

        // Pretend the task deployed its descriptors.
        let mut config = (*fx.config).clone();
        config.agent_descriptors = vec!["planner.md".to_string(), "reviewer.md".to_string()];
        for name in &config.agent_descriptors {
            std::fs::write(config.agents_dir.join(name), "agent").unwrap();
        }
        let config = Arc::new(config);
        let supervisor =
            TaskSupervisor::new(config.clone(), fx.registry.clone(), fx.bus.clone());
        let mut rx = fx.bus.subscribe();

        // working_directory None marks the task as home-level; the fixture
        // script still needs to resolve, so pass it as the command line.
        let mut spec = TaskSpec::new("T4");
        spec.command_line = Some(script.display().to_string());
        supervisor.launch(spec).unwrap();

        let mut saw_completion = false;
        let mut saw_deployed = false;
        for _ in 0..2 {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out")
                .expect("bus closed")
            {
                BusEvent::TaskCompleted(c) => {
                    assert_eq!(c.task_id, "T4");
                    saw_completion = true;
                }
                BusEvent::AgentsDeployed { task_id } => {
                    assert_eq!(task_id, "T4");
                    saw_deployed = true;
                }
            }
        }
        assert!(saw_completion && saw_deployed);
    }

    #[tokio::test]
    async fn viewer_attaches_detaches_and_reattaches() {
        let fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cli(
            dir.path(),
            "echo first-chunk; sleep 2; echo late-chunk; exit 0",
        );
        let handle = fx
            .supervisor
            .launch(spec_for(&script, "T5", dir.path()))
            .unwrap();

        // First viewer sees the early output, then hangs up.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let attach = tokio::spawn(attach_viewer(handle.clone(), out_tx, in_rx));
        let first = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .unwrap();
        match first {
            Some(Outbound::Output { data }) => assert!(data.contains("first-chunk")),
            other => panic!("expected catch-up output, got {other:?}"),
        }
        drop(in_tx); // client disconnect: the task must survive
        attach.await.unwrap();
        assert!(fx.supervisor.get("T5").is_some(), "task died with its viewer");

        // Second viewer catches up from the ring.
        let (out_tx2, mut out_rx2) = mpsc::channel(64);
        let (_in_tx2, in_rx2) = mpsc::channel(64);
        let handle2 = fx.supervisor.get("T5").unwrap();
        tokio::spawn(attach_viewer(handle2, out_tx2, in_rx2));
        let mut seen = String::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_secs(5), out_rx2.recv()).await
        {
            if let Outbound::Output { data } = frame {
                seen.push_str(&data);
                if seen.contains("late-chunk") {
                    break;
                }
            }
        }
        assert!(seen.contains("first-chunk"), "ring catch-up missing: {seen:?}");
        assert!(seen.contains("late-chunk"), "live tail missing: {seen:?}");
    }
}
