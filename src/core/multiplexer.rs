//! Glues a bound client channel to its PTY engine.
//!
//! Each channel/session pair runs three cooperating tasks: the PTY-to-client
//! pump, the client-to-PTY pump, and the supervisor that watches for PTY
//! exit, channel close, or a pump failure and then drives the orderly
//! Draining -> Terminated teardown. Task channels (`init` with a `task_id`)
//! are handed to the task supervisor, which owns their lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::core::broker::Broker;
use crate::core::error::CoreError;
use crate::core::id_capture::UrlScanner;
use crate::core::protocol::{InitFrame, Inbound, Outbound};
use crate::core::pty_engine::{PtyEngine, SpawnSpec, Utf8Decoder};
use crate::core::registry::{ExecutionMode, SessionKind, SessionRecord, SessionState};

/// Upper bound accepted from `resize` frames, matching what any real
/// terminal emulator would request.
const MAX_DIM: u16 = 500;

/// Why the client-to-PTY pump stopped.
enum PumpEnd {
    /// Inbound queue closed: the socket reader saw the connection go away.
    ClientClosed,
    /// Writing or resizing the PTY failed.
    PtyGone(CoreError),
    /// The client sent an out-of-order or invalid control frame.
    Protocol(String),
}

/// Builds the child argv for an `init` frame.
///
/// Resume wins: `<CLI> --resume <id>`. An `initial_command` is a literal
/// command line the core never parses; it goes to the user's shell verbatim.
/// Otherwise the bare Agent CLI is started.
pub(crate) fn build_argv(config: &Config, init: &InitFrame) -> Vec<String> {
    if init.resume {
        if let Some(resume_id) = &init.session_id {
            return vec![
                config.cli.clone(),
                "--resume".to_string(),
                resume_id.clone(),
            ];
        }
    }
    if let Some(command_line) = &init.initial_command {
        return shell_argv(command_line);
    }
    vec![config.cli.clone()]
}

/// Wraps a literal command line in the user's shell.
pub(crate) fn shell_argv(command_line: &str) -> Vec<String> {
    #[cfg(unix)]
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    #[cfg(unix)]
    return vec![shell, "-c".to_string(), command_line.to_string()];

    #[cfg(windows)]
    {
        let shell = std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());
        vec![shell, "/C".to_string(), command_line.to_string()]
    }
}

pub struct Multiplexer {
    broker: Arc<Broker>,
}

impl Multiplexer {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Drives one accepted channel from `init` to teardown. Returns when the
    /// channel is finished; dropping `outbound` afterwards closes the socket.
    pub async fn run(
        &self,
        init: InitFrame,
        outbound: mpsc::Sender<Outbound>,
        inbound: mpsc::Receiver<Inbound>,
    ) {
        if init.task_id.is_some() {
            self.broker
                .tasks()
                .run_channel(init, outbound, inbound)
                .await;
            return;
        }
        match self.start_interactive(&init) {
            Ok((record, engine)) => self.bridge(record, engine, outbound, inbound).await,
            Err(err) => {
                log::warn!("session init failed: {err}");
                let _ = outbound.send(Outbound::error(&err)).await;
            }
        }
    }

    /// Reserves the session id, spawns the PTY, and moves the record to
    /// Running. On failure the record goes Failed -> Terminated and out of
    /// the registry before the error is returned.
    fn start_interactive(
        &self,
        init: &InitFrame,
    ) -> Result<(Arc<SessionRecord>, Arc<PtyEngine>), CoreError> {
        let config = self.broker.config();
        let kind = if init.resume {
            SessionKind::Resume
        } else {
            SessionKind::Interactive
        };
        let id = init
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let resume_id = if init.resume {
            init.session_id.clone()
        } else {
            None
        };

        let record = self.broker.registry().reserve(SessionRecord::new(
            id.clone(),
            kind,
            PathBuf::from(&init.project_path),
            resume_id,
            None,
            ExecutionMode::Interactive,
        ))?;

        if !record.try_bind_client() {
            self.broker.registry().remove(&record.id);
            return Err(CoreError::Bind(id));
        }

        let cwd = match PathBuf::from(&init.project_path).canonicalize() {
            Ok(cwd) => cwd,
            Err(e) => {
                return Err(self.fail_init(
                    &record,
                    CoreError::Spawn(format!(
                        "project path '{}' is not usable: {e}",
                        init.project_path
                    )),
                ));
            }
        };

        let spec = SpawnSpec {
            cwd,
            argv: build_argv(config, init),
            env: vec![("AGENTDECK_SESSION_ID".to_string(), record.id.clone())],
            cols: init.cols.unwrap_or(config.default_cols),
            rows: init.rows.unwrap_or(config.default_rows),
        };
        match PtyEngine::spawn(&spec, config.outbound_slots()) {
            Ok(engine) => {
                let engine = Arc::new(engine);
                record.attach_pty(engine.clone());
                if let Err(e) = record.transition(SessionState::Running) {
                    log::error!("session {}: {e}", record.id);
                }
                Ok((record, engine))
            }
            Err(err) => Err(self.fail_init(&record, err)),
        }
    }

    fn fail_init(&self, record: &Arc<SessionRecord>, err: CoreError) -> CoreError {
        let _ = record.transition(SessionState::Failed);
        let _ = record.transition(SessionState::Terminated);
        record.release_client();
        self.broker.registry().remove(&record.id);
        err
    }

    /// The three-task bridge of a running interactive session.
    async fn bridge(
        &self,
        record: Arc<SessionRecord>,
        engine: Arc<PtyEngine>,
        outbound: mpsc::Sender<Outbound>,
        mut inbound: mpsc::Receiver<Inbound>,
    ) {
        let config = self.broker.config().clone();

        let mut out_rx = match engine.take_output() {
            Some(rx) => rx,
            None => {
                let err = CoreError::Closed("pty output stream already claimed".to_string());
                let _ = outbound.send(Outbound::error(&err)).await;
                self.teardown(&record, &engine, &config).await;
                return;
            }
        };

        // PTY -> client. Bounded sends all the way down: when the client
        // stalls, this pump stalls, the engine queue fills, and the reader
        // thread parks until the client drains.
        let mut pump_out = {
            let record = record.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let mut urls = UrlScanner::new();
                let mut decoder = Utf8Decoder::new();
                while let Some(chunk) = out_rx.recv().await {
                    record.mark_output();
                    record.touch_io();
                    if let Some(url) = urls.scan(&chunk) {
                        if outbound.send(Outbound::UrlOpen { url }).await.is_err() {
                            return;
                        }
                    }
                    let text = decoder.decode(&chunk);
                    if text.is_empty() {
                        continue;
                    }
                    if outbound.send(Outbound::Output { data: text }).await.is_err() {
                        return;
                    }
                }
            })
        };

        // Client -> PTY.
        let mut pump_in = {
            let record = record.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(frame) = inbound.recv().await {
                    match frame {
                        Inbound::Input { data } => {
                            if let Err(err) = engine.write(data.as_bytes()) {
                                return PumpEnd::PtyGone(err);
                            }
                            record.touch_io();
                        }
                        Inbound::Resize { cols, rows } => {
                            if cols == 0 || rows == 0 || cols > MAX_DIM || rows > MAX_DIM {
                                return PumpEnd::Protocol(format!(
                                    "resize to {cols}x{rows} rejected"
                                ));
                            }
                            if let Err(err) = engine.resize(cols, rows) {
                                return PumpEnd::PtyGone(err);
                            }
                        }
                        Inbound::Init(_) => {
                            return PumpEnd::Protocol("init on an initialized channel".to_string())
                        }
                    }
                }
                PumpEnd::ClientClosed
            })
        };

        // Observational only: a slow-starting Agent is legitimate.
        let quiet_watch = {
            let record = record.clone();
            let quiet = config.init_quiet;
            tokio::spawn(async move {
                tokio::time::sleep(quiet).await;
                if !record.has_output() {
                    log::info!(
                        "session {}: no PTY output within {quiet:?} of spawn",
                        record.id
                    );
                }
            })
        };

        let channel_end = tokio::select! {
            code = engine.wait() => {
                log::info!("session {}: child exited with {code}", record.id);
                None
            }
            end = &mut pump_in => Some(end.unwrap_or(PumpEnd::ClientClosed)),
        };
        quiet_watch.abort();

        if let Err(e) = record.transition(SessionState::Draining) {
            log::error!("session {}: {e}", record.id);
        }

        match &channel_end {
            None => {}
            Some(PumpEnd::ClientClosed) => {
                log::info!("session {}: client disconnected", record.id);
            }
            Some(PumpEnd::PtyGone(err)) => {
                log::warn!("session {}: {err}", record.id);
                let _ = tokio::time::timeout(config.drain_grace, outbound.send(Outbound::error(err)))
                    .await;
            }
            Some(PumpEnd::Protocol(msg)) => {
                let err = CoreError::Protocol(msg.clone());
                log::warn!("session {}: {err}", record.id);
                let _ = tokio::time::timeout(config.drain_grace, outbound.send(Outbound::error(&err)))
                    .await;
            }
        }

        // Interactive sessions end with their client; reconnect grace is
        // zero by design.
        if engine.try_exit_code().is_none() {
            engine.terminate(config.term_grace).await;
        }

        // Let buffered output flush within the drain budget, then cut off.
        if tokio::time::timeout(config.drain_grace, &mut pump_out)
            .await
            .is_err()
        {
            pump_out.abort();
        }
        pump_in.abort();

        self.teardown(&record, &engine, &config).await;
    }

    async fn teardown(&self, record: &Arc<SessionRecord>, engine: &PtyEngine, config: &Config) {
        if engine.try_exit_code().is_none() {
            engine.terminate(config.term_grace).await;
        }
        engine.close().await;
        record.take_pty();
        if let Err(e) = record.transition(SessionState::Terminated) {
            log::error!("session {}: {e}", record.id);
        }
        record.release_client();
        self.broker.registry().remove(&record.id);
        log::info!("session {} terminated", record.id);
    }
}
