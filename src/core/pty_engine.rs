//! PTY ownership: one engine per live session or task.
//!
//! An engine owns exactly one child process attached to a PTY master. A
//! dedicated OS thread drains the master in 4 KiB chunks into a bounded
//! channel; when the channel is full, `blocking_send` parks the reader and
//! the kernel-side PTY buffer fills, which is how backpressure reaches a
//! fast-producing child. A second thread reaps the child and publishes the
//! exit code on a watch channel so any number of supervisors can await it.
//!
//! Any I/O failure is fatal to the engine. There is no reconnection; the
//! owning multiplexer surfaces the error and tears the session down.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};

#[cfg(unix)]
use libc;

use super::error::CoreError;

/// Read granularity for the PTY master. Chunk boundaries are arbitrary;
/// consumers must tolerate multi-byte sequences split across chunks.
pub const READ_CHUNK: usize = 4096;

/// Exit-code sentinel reported when the supervisor had to SIGKILL the child.
pub const KILLED_BY_SUPERVISOR: i32 = -1;

/// Everything needed to start a child in a fresh PTY.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub cwd: PathBuf,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// A live PTY and its child process.
pub struct PtyEngine {
    pid: i32,
    /// Process group for signal delivery. portable-pty calls setsid() on
    /// spawn, so the child leads its own group (pgid == pid).
    #[cfg(unix)]
    pgid: i32,
    /// Writer half of the master; used for stdin.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// Master handle; used for resize.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    /// Output stream, taken once by the owning pump.
    output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    /// Raw exit code once the reaper thread has collected it.
    exit_rx: watch::Receiver<Option<i32>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    /// Set when termination escalated to SIGKILL.
    killed: AtomicBool,
}

impl PtyEngine {
    /// Spawns `spec.argv` in a new PTY. `queue_slots` bounds the output
    /// channel (slots of up to [`READ_CHUNK`] bytes).
    ///
    /// Fails with [`CoreError::Spawn`] when the working directory is missing,
    /// the binary is not on PATH, or the PTY cannot be allocated.
    pub fn spawn(spec: &SpawnSpec, queue_slots: usize) -> Result<Self, CoreError> {
        if spec.argv.is_empty() {
            return Err(CoreError::Spawn("empty argv".to_string()));
        }
        if !spec.cwd.is_dir() {
            return Err(CoreError::Spawn(format!(
                "working directory '{}' does not exist",
                spec.cwd.display()
            )));
        }
        let program = which::which(&spec.argv[0]).map_err(|e| {
            CoreError::Spawn(format!("'{}' not found on PATH: {e}", spec.argv[0]))
        })?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CoreError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&spec.argv[1..]);
        cmd.cwd(&spec.cwd);
        // Minimal terminal environment on top of the caller's vars.
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| CoreError::Spawn(format!("failed to spawn '{}': {e}", spec.argv[0])))?;

        let pid = child
            .process_id()
            .map(|p| p as i32)
            .ok_or_else(|| CoreError::Spawn("could not obtain child PID".to_string()))?;

        #[cfg(unix)]
        let pgid = pair.master.process_group_leader().unwrap_or(pid);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| CoreError::Spawn(format!("failed to take PTY writer: {e}")))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| CoreError::Spawn(format!("failed to clone PTY reader: {e}")))?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(queue_slots.max(1));

        // Dedicated OS thread for the blocking master reads. It exits on EOF,
        // which the supervisor triggers by dropping the master and writer.
        let reader_handle = std::thread::Builder::new()
            .name(format!("pty-reader-{pid}"))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break, // EOF, child side closed
                        Ok(n) => {
                            // blocking_send parks here while the queue is
                            // full; it only errors once the receiver is gone.
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            log::debug!("PTY reader {pid} error: {e}");
                            break;
                        }
                    }
                }
                log::debug!("PTY reader {pid} exited");
            })
            .map_err(|e| CoreError::Spawn(format!("failed to spawn reader thread: {e}")))?;

        // Reaper thread: collect the exit code and publish it.
        let (exit_tx, exit_rx) = watch::channel(None);
        std::thread::Builder::new()
            .name(format!("pty-wait-{pid}"))
            .spawn(move || {
                let mut child = child;
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        log::warn!("wait() for pid {pid} failed: {e}");
                        KILLED_BY_SUPERVISOR
                    }
                };
                log::debug!("child {pid} exited with code {code}");
                let _ = exit_tx.send(Some(code));
            })
            .map_err(|e| CoreError::Spawn(format!("failed to spawn wait thread: {e}")))?;

        // The master keeps the PTY alive.
        drop(pair.slave);

        #[cfg(unix)]
        log::info!(
            "Spawned PTY (pid={pid}, pgid={pgid}, argv={:?}, cwd={})",
            spec.argv,
            spec.cwd.display()
        );
        #[cfg(windows)]
        log::info!(
            "Spawned PTY (pid={pid}, argv={:?}, cwd={})",
            spec.argv,
            spec.cwd.display()
        );

        Ok(Self {
            pid,
            #[cfg(unix)]
            pgid,
            writer: Mutex::new(Some(writer)),
            master: Mutex::new(Some(pair.master)),
            output_rx: Mutex::new(Some(rx)),
            exit_rx,
            reader_handle: Mutex::new(Some(reader_handle)),
            killed: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Takes the output stream. There is exactly one consumer; subsequent
    /// calls return `None`.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Writes raw bytes to the child's stdin and flushes. Returns only after
    /// the kernel has accepted the bytes.
    pub fn write(&self, data: &[u8]) -> Result<(), CoreError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| CoreError::Closed("writer lock poisoned".to_string()))?;
        let writer = guard
            .as_mut()
            .ok_or_else(|| CoreError::Closed("pty writer closed".to_string()))?;
        writer
            .write_all(data)
            .map_err(|e| CoreError::Closed(format!("write failed: {e}")))?;
        writer
            .flush()
            .map_err(|e| CoreError::Closed(format!("flush failed: {e}")))
    }

    /// Resizes the PTY, propagating SIGWINCH to the child. Idempotent.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), CoreError> {
        let guard = self
            .master
            .lock()
            .map_err(|_| CoreError::Closed("master lock poisoned".to_string()))?;
        let master = guard
            .as_ref()
            .ok_or_else(|| CoreError::Closed("pty master closed".to_string()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CoreError::Closed(format!("resize failed: {e}")))
    }

    /// Waits for the child to exit and returns its exit code: the normal
    /// code, 128+signal when signal-terminated, or
    /// [`KILLED_BY_SUPERVISOR`] when termination escalated to SIGKILL.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return self.adjust(code);
            }
            if rx.changed().await.is_err() {
                return KILLED_BY_SUPERVISOR;
            }
        }
    }

    /// Exit code if the child has already been reaped.
    pub fn try_exit_code(&self) -> Option<i32> {
        (*self.exit_rx.borrow()).map(|code| self.adjust(code))
    }

    fn adjust(&self, code: i32) -> i32 {
        if self.killed.load(Ordering::Acquire) {
            KILLED_BY_SUPERVISOR
        } else {
            code
        }
    }

    /// Requests termination: SIGTERM to the process group, escalating to
    /// SIGKILL if the child survives `grace`.
    pub async fn terminate(&self, grace: Duration) {
        if self.try_exit_code().is_some() {
            return;
        }

        #[cfg(unix)]
        {
            let pgid = self.pgid;
            if unsafe { libc::kill(-pgid, libc::SIGTERM) } != 0 {
                log::warn!(
                    "Failed to SIGTERM pid {} (pgid={pgid}): {}",
                    self.pid,
                    std::io::Error::last_os_error()
                );
            }
            if tokio::time::timeout(grace, self.wait()).await.is_err() {
                self.killed.store(true, Ordering::Release);
                if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
                    log::warn!(
                        "Failed to SIGKILL pid {} (pgid={pgid}): {}",
                        self.pid,
                        std::io::Error::last_os_error()
                    );
                }
                log::warn!("PTY child {} (pgid={pgid}) required SIGKILL", self.pid);
                let _ = tokio::time::timeout(grace, self.wait()).await;
            }
        }

        #[cfg(windows)]
        {
            let result = std::process::Command::new("taskkill")
                .args(["/PID", &self.pid.to_string(), "/T", "/F"])
                .output();
            if let Err(e) = result {
                log::warn!("Failed to taskkill pid {}: {e}", self.pid);
            }
            let _ = tokio::time::timeout(grace, self.wait()).await;
        }
    }

    /// Closes the master and writer (EOF-ing the reader thread) and joins
    /// the reader off the async runtime.
    pub async fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
        let handle = self.reader_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

impl Drop for PtyEngine {
    fn drop(&mut self) {
        // Last-resort cleanup for abnormal paths; the supervisor normally
        // terminates and closes before the engine is dropped.
        if self.exit_rx.borrow().is_none() {
            self.killed.store(true, Ordering::Release);
            #[cfg(unix)]
            unsafe {
                libc::kill(-self.pgid, libc::SIGKILL);
            }
            #[cfg(windows)]
            {
                let _ = std::process::Command::new("taskkill")
                    .args(["/PID", &self.pid.to_string(), "/T", "/F"])
                    .output();
            }
        }
    }
}

impl std::fmt::Debug for PtyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyEngine")
            .field("pid", &self.pid)
            .field("exit_code", &self.try_exit_code())
            .finish()
    }
}

/// Stateful UTF-8 decoder that handles split multi-byte sequences.
///
/// When reading from a PTY in 4 KiB chunks, a multi-byte UTF-8 character can
/// be split across chunk boundaries; decoding each chunk independently would
/// replace the halves with U+FFFD. This decoder buffers the incomplete tail
/// and prepends it to the next chunk.
pub(crate) struct Utf8Decoder {
    /// Incomplete trailing sequence (at most 4 bytes).
    incomplete: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            incomplete: Vec::with_capacity(4),
        }
    }

    /// Decodes bytes, buffering an incomplete trailing sequence for the next
    /// call. Invalid bytes in the middle of the input are skipped.
    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.incomplete);
        data.extend_from_slice(input);

        let valid_up_to = Self::find_valid_boundary(&data);
        if valid_up_to < data.len() {
            self.incomplete = data[valid_up_to..].to_vec();
        }

        String::from_utf8(data[..valid_up_to].to_vec())
            .unwrap_or_else(|_| String::from_utf8_lossy(&data[..valid_up_to]).into_owned())
    }

    fn find_valid_boundary(data: &[u8]) -> usize {
        match std::str::from_utf8(data) {
            Ok(_) => data.len(),
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_none() {
                    valid // incomplete sequence at the end, buffer it
                } else {
                    valid + e.error_len().unwrap_or(1)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, cwd: &std::path::Path) -> SpawnSpec {
        SpawnSpec {
            cwd: cwd.to_path_buf(),
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            env: Vec::new(),
            cols: 120,
            rows: 30,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn spawn_missing_cwd_is_spawn_error() {
        let spec = sh("true", std::path::Path::new("/definitely/not/here"));
        match PtyEngine::spawn(&spec, 16) {
            Err(CoreError::Spawn(_)) => {}
            other => panic!("expected SpawnError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_unknown_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SpawnSpec {
            cwd: dir.path().to_path_buf(),
            argv: vec!["agentdeck-no-such-binary".to_string()],
            env: Vec::new(),
            cols: 120,
            rows: 30,
        };
        match PtyEngine::spawn(&spec, 16) {
            Err(CoreError::Spawn(_)) => {}
            other => panic!("expected SpawnError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn output_and_exit_code_flow_through() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PtyEngine::spawn(&sh("printf hello; exit 7", dir.path()), 16).unwrap();
        let rx = engine.take_output().unwrap();
        assert!(engine.take_output().is_none(), "single consumer only");
        let code = engine.wait().await;
        assert_eq!(code, 7);
        engine.close().await;
        let out = drain(rx).await;
        assert!(
            String::from_utf8_lossy(&out).contains("hello"),
            "got: {out:?}"
        );
    }

    #[tokio::test]
    async fn env_reaches_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = sh("printf \"%s/$AGENTDECK_SESSION_ID\" \"$TERM\"", dir.path());
        spec.env
            .push(("AGENTDECK_SESSION_ID".to_string(), "s-42".to_string()));
        let engine = PtyEngine::spawn(&spec, 16).unwrap();
        let rx = engine.take_output().unwrap();
        engine.wait().await;
        engine.close().await;
        let out = String::from_utf8_lossy(&drain(rx).await).to_string();
        assert!(out.contains("xterm-256color/s-42"), "got: {out}");
    }

    #[tokio::test]
    async fn input_reaches_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PtyEngine::spawn(&sh("read line; printf \"got:%s\" \"$line\"", dir.path()), 16)
            .unwrap();
        let rx = engine.take_output().unwrap();
        engine.write(b"ping\n").unwrap();
        assert_eq!(engine.wait().await, 0);
        engine.close().await;
        let out = String::from_utf8_lossy(&drain(rx).await).to_string();
        assert!(out.contains("got:ping"), "got: {out}");
    }

    #[tokio::test]
    async fn write_and_resize_after_close_fail_closed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PtyEngine::spawn(&sh("true", dir.path()), 16).unwrap();
        engine.wait().await;
        engine.close().await;
        match engine.write(b"x") {
            Err(CoreError::Closed(_)) => {}
            other => panic!("expected ClosedError, got {other:?}"),
        }
        match engine.resize(80, 24) {
            Err(CoreError::Closed(_)) => {}
            other => panic!("expected ClosedError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resize_is_accepted_down_to_one_cell() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PtyEngine::spawn(&sh("sleep 5", dir.path()), 16).unwrap();
        engine.resize(1, 1).unwrap();
        engine.resize(1, 1).unwrap(); // idempotent
        engine.terminate(Duration::from_millis(500)).await;
        engine.close().await;
    }

    #[tokio::test]
    async fn terminate_kills_a_stubborn_child() {
        let dir = tempfile::tempdir().unwrap();
        // Traps TERM so only the KILL escalation can end it.
        let engine = PtyEngine::spawn(
            &sh("trap '' TERM; while true; do sleep 1; done", dir.path()),
            16,
        )
        .unwrap();
        engine.terminate(Duration::from_millis(200)).await;
        assert_eq!(engine.wait().await, KILLED_BY_SUPERVISOR);
        engine.close().await;
    }

    #[test]
    fn utf8_decoder_joins_split_sequences() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "héllo".as_bytes();
        // Split inside the two-byte 'é'.
        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..]);
        assert_eq!(format!("{first}{second}"), "héllo");
    }

    #[test]
    fn utf8_decoder_skips_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        let out = decoder.decode(b"a\xffb");
        assert_eq!(out, "ab");
    }
}
