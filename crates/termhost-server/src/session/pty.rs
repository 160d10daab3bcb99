//! PTY process adapter using portable-pty.
//!
//! Opens a pseudo-terminal and spawns a command on it. Two threads serve each
//! process: a reader that pumps output into a channel, and a reaper that
//! polls the child for exit. The reaper reports exit only once the reader has
//! drained what was queued on the terminal, so the exit notification follows
//! the process's output even when a background job keeps the terminal open.

use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use termhost_core::{TermError, TermResult};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How often the reaper checks whether the child has exited.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// After exit, the reader is considered drained once it has been idle this long.
const DRAIN_QUIET: Duration = Duration::from_millis(100);

/// Upper bound on the post-exit drain, for children that keep writing.
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// Notification produced by a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(String),
    Exited { code: i32, signal: Option<String> },
}

/// What to run and how to size the terminal.
#[derive(Debug, Clone)]
pub struct PtyOptions<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// The child handle, shared by the reaper and [`PtyProcess::kill`].
struct ChildSlot {
    child: Box<dyn Child + Send + Sync>,
    /// Set once the child has been waited for; its pid may be reused after.
    reaped: bool,
}

type SharedChild = Arc<Mutex<ChildSlot>>;

fn lock_child(child: &SharedChild) -> MutexGuard<'_, ChildSlot> {
    child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A spawned process bound to a pseudo-terminal.
pub struct PtyProcess {
    writer: Mutex<Box<dyn Write + Send>>,
    /// Kept for resize; MasterPty is not Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: SharedChild,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawn `options.command` on a fresh PTY.
    ///
    /// Returns the process and the receiver for its output/exit events.
    pub fn spawn(options: PtyOptions<'_>) -> TermResult<(Self, mpsc::UnboundedReceiver<PtyEvent>)> {
        // portable-pty silently falls back to $HOME for a bad cwd.
        if !options.cwd.is_dir() {
            return Err(TermError::Spawn(format!(
                "working directory does not exist: {}",
                options.cwd.display()
            )));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(options.cols, options.rows))
            .map_err(|e| TermError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(options.command);
        cmd.args(options.args);
        cmd.cwd(options.cwd);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermError::Spawn(format!("failed to spawn {}: {e}", options.command)))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let child: SharedChild = Arc::new(Mutex::new(ChildSlot {
            child,
            reaped: false,
        }));

        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                terminate(&child);
                return Err(TermError::Spawn(format!("failed to attach PTY streams: {e}")));
            }
        };

        let label = pid.unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        let (activity_tx, activity_rx) = sync_channel::<()>(1);

        let reader_tx = tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("pty-reader-{label}"))
            .spawn(move || pump(reader, reader_tx, activity_tx));
        if let Err(e) = spawned {
            terminate(&child);
            return Err(TermError::Spawn(format!("failed to start PTY reader: {e}")));
        }

        let reaper_child = child.clone();
        let spawned = thread::Builder::new()
            .name(format!("pty-reaper-{label}"))
            .spawn(move || reap(reaper_child, activity_rx, tx));
        if let Err(e) = spawned {
            terminate(&child);
            return Err(TermError::Spawn(format!("failed to start PTY reaper: {e}")));
        }

        info!(command = options.command, ?pid, cols = options.cols, rows = options.rows, "PTY spawned");

        Ok((
            Self {
                writer: Mutex::new(writer),
                master: Mutex::new(pair.master),
                child,
                pid,
            },
            rx,
        ))
    }

    /// OS process id of the child, when the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write to the process input.
    ///
    /// Blocks while the terminal's input queue is full; call from a
    /// blocking context.
    pub fn write(&self, data: &[u8]) -> TermResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TermError::Pty("PTY writer lock poisoned".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Inform the process of new terminal dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> TermResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| TermError::Pty("PTY master lock poisoned".into()))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| TermError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, pid = ?self.pid, "PTY resized");
        Ok(())
    }

    /// Terminate the process.
    ///
    /// On unix this sends SIGHUP, waits briefly, then sends SIGKILL if the
    /// process is still running. A process that was already reaped is left
    /// alone. Blocks for up to a few hundred milliseconds; call from a
    /// blocking context.
    pub fn kill(&self) -> TermResult<()> {
        let mut slot = lock_child(&self.child);
        if slot.reaped {
            return Ok(());
        }
        slot.child
            .kill()
            .map_err(|e| TermError::Pty(format!("kill failed: {e}")))
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Best-effort kill for a child whose PTY setup failed half-way.
fn terminate(child: &SharedChild) {
    if let Err(e) = lock_child(child).child.kill() {
        warn!(error = %e, "failed to terminate PTY child after setup error");
    }
}

/// Reader thread body: forward output until EOF or until nobody listens.
///
/// Every forwarded chunk is followed by a tick on `activity`, which the
/// reaper uses to tell when the terminal has gone quiet.
fn pump(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<PtyEvent>,
    activity: SyncSender<()>,
) {
    let mut buf = [0u8; 8192];
    let mut decoder = Utf8Chunker::default();

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.feed(&buf[..n]);
                if !text.is_empty() && tx.send(PtyEvent::Output(text)).is_err() {
                    debug!("PTY output receiver gone, stopping reader");
                    return;
                }
                let _ = activity.try_send(());
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // Linux reports EIO once the slave side is gone.
            Err(e) => {
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = tx.send(PtyEvent::Output(rest));
    }
}

/// Reaper thread body: wait for the child, let the reader drain, report exit.
fn reap(child: SharedChild, activity: Receiver<()>, tx: mpsc::UnboundedSender<PtyEvent>) {
    let (status, pid) = loop {
        {
            let mut slot = lock_child(&child);
            let pid = slot.child.process_id();
            match slot.child.try_wait() {
                Ok(Some(status)) => {
                    slot.reaped = true;
                    break (Some(status), pid);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, ?pid, "failed to reap PTY child");
                    slot.reaped = true;
                    break (None, pid);
                }
            }
        }
        thread::sleep(REAP_POLL_INTERVAL);
    };

    await_drain(&activity);

    let (code, signal) = status.as_ref().map(exit_parts).unwrap_or((-1, None));
    info!(code, ?signal, ?pid, "PTY child exited");
    let _ = tx.send(PtyEvent::Exited { code, signal });
}

/// Block until the reader has been idle for [`DRAIN_QUIET`], has finished,
/// or [`DRAIN_LIMIT`] has passed.
fn await_drain(activity: &Receiver<()>) {
    // Ticks queued before the exit belong to output that is already sent.
    while activity.try_recv().is_ok() {}

    let deadline = Instant::now() + DRAIN_LIMIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        match activity.recv_timeout(DRAIN_QUIET.min(remaining)) {
            Ok(()) => continue,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Exit code and signal name of a finished child.
///
/// portable-pty exposes the signal name only through `Display`.
fn exit_parts(status: &ExitStatus) -> (i32, Option<String>) {
    let code = i32::try_from(status.exit_code()).unwrap_or(-1);
    let signal = status
        .to_string()
        .strip_prefix("Terminated by ")
        .map(str::to_string);
    (code, signal)
}

/// Decodes a byte stream into text without splitting multi-byte characters
/// across chunks. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn feed(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Activity kinds emitted by agent CLIs as JSON lines.
const ACTIVITY_TYPES: &[&str] = &["assistant", "tool_use", "tool_result", "tool", "system"];

const NOTABLE_WORDS: &[&str] = &["error", "completed", "success"];

const PREVIEW_CHARS: usize = 200;

/// Whether a chunk looks worth mirroring to the operational log.
pub fn is_notable(chunk: &str) -> bool {
    let lower = chunk.to_ascii_lowercase();
    if NOTABLE_WORDS.iter().any(|w| lower.contains(w)) {
        return true;
    }
    chunk.contains("\"type\"") && chunk.lines().any(is_activity_line)
}

fn is_activity_line(line: &str) -> bool {
    let line = line.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
        return value
            .get("type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| ACTIVITY_TYPES.contains(&t));
    }
    // Fragments of a JSON line split across reads.
    ACTIVITY_TYPES
        .iter()
        .any(|t| line.contains(&format!("\"type\":\"{t}\"")) || line.contains(&format!("\"type\": \"{t}\"")))
}

/// Mirror a notable chunk to the `termhost::pty_output` log target.
pub fn mirror_notable(execution_id: &str, chunk: &str) {
    if !is_notable(chunk) {
        return;
    }
    let preview: String = chunk.chars().take(PREVIEW_CHARS).collect();
    info!(
        target: "termhost::pty_output",
        execution_id,
        bytes = chunk.len(),
        preview = %preview.trim_end(),
        "notable PTY output"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_passes_ascii_through() {
        let mut d = Utf8Chunker::default();
        assert_eq!(d.feed(b"hello"), "hello");
        assert_eq!(d.finish(), "");
    }

    #[test]
    fn chunker_holds_split_multibyte_char() {
        let bytes = "héllo".as_bytes();
        let mut d = Utf8Chunker::default();
        // 'é' is two bytes; split inside it.
        assert_eq!(d.feed(&bytes[..2]), "h");
        assert_eq!(d.feed(&bytes[2..]), "éllo");
    }

    #[test]
    fn chunker_replaces_invalid_bytes() {
        let mut d = Utf8Chunker::default();
        assert_eq!(d.feed(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn chunker_flushes_truncated_tail_lossily() {
        let mut d = Utf8Chunker::default();
        assert_eq!(d.feed(&[b'x', 0xe2, 0x82]), "x");
        assert_eq!(d.finish(), "\u{FFFD}");
    }

    #[test]
    fn notable_words() {
        assert!(is_notable("Build completed in 3s"));
        assert!(is_notable("ERROR: disk full"));
        assert!(is_notable("tests: success"));
        assert!(!is_notable("$ ls\r\nfoo bar\r\n"));
    }

    #[test]
    fn notable_structured_activity() {
        assert!(is_notable("{\"type\":\"assistant\",\"message\":{}}\n"));
        assert!(is_notable("{\"type\": \"tool_use\", \"name\": \"Bash\""));
        assert!(!is_notable("{\"type\":\"ping\"}\n"));
    }

    #[test]
    fn exit_parts_reads_code_and_signal() {
        assert_eq!(exit_parts(&ExitStatus::with_exit_code(3)), (3, None));
        assert_eq!(exit_parts(&ExitStatus::with_exit_code(0)), (0, None));
        assert_eq!(
            exit_parts(&ExitStatus::with_signal("Hangup")),
            (1, Some("Hangup".to_string()))
        );
    }

    #[cfg(unix)]
    fn spawn_sh(script: &str) -> (PtyProcess, mpsc::UnboundedReceiver<PtyEvent>) {
        let args = vec!["-c".to_string(), script.to_string()];
        let env = HashMap::new();
        PtyProcess::spawn(PtyOptions {
            command: "/bin/sh",
            args: &args,
            cwd: Path::new("/"),
            env: &env,
            cols: 80,
            rows: 24,
        })
        .unwrap()
    }

    /// Collect output until `Exited`, returning the output and exit fields.
    #[cfg(unix)]
    async fn run_to_exit(
        events: &mut mpsc::UnboundedReceiver<PtyEvent>,
        limit: Duration,
    ) -> (String, i32, Option<String>) {
        let mut output = String::new();
        let exit = tokio::time::timeout(limit, async {
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Output(text) => output.push_str(&text),
                    PtyEvent::Exited { code, signal } => return (code, signal),
                }
            }
            panic!("event channel closed before exit");
        })
        .await;
        let (code, signal) = exit.expect("no exit notification in time");
        (output, code, signal)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_reported_while_background_job_holds_terminal() {
        let (_process, mut events) = spawn_sh("echo started; sleep 20 & exit 3");
        let started = Instant::now();
        let (output, code, signal) = run_to_exit(&mut events, Duration::from_secs(5)).await;
        assert_eq!(code, 3);
        assert_eq!(signal, None);
        assert!(output.contains("started"), "output was {output:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_escalates_when_hangup_is_ignored() {
        let (process, mut events) =
            spawn_sh("trap '' HUP; echo ready; while true; do sleep 1; done");

        let mut seen = String::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !seen.contains("ready") {
                match events.recv().await {
                    Some(PtyEvent::Output(text)) => seen.push_str(&text),
                    other => panic!("unexpected event before ready: {other:?}"),
                }
            }
        })
        .await
        .expect("shell never became ready");

        process.kill().unwrap();
        let (_, _, signal) = run_to_exit(&mut events, Duration::from_secs(5)).await;
        assert!(signal.is_some(), "process exited without a signal");

        // Reaped: a second kill must not signal anything.
        process.kill().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_reports_output_then_exit() {
        let args = vec!["-c".to_string(), "echo pty-ok; exit 7".to_string()];
        let env = HashMap::new();
        let (process, mut events) = PtyProcess::spawn(PtyOptions {
            command: "/bin/sh",
            args: &args,
            cwd: Path::new("/"),
            env: &env,
            cols: 80,
            rows: 24,
        })
        .unwrap();
        assert!(process.pid().is_some());

        let mut output = String::new();
        let exit = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Output(text) => output.push_str(&text),
                    PtyEvent::Exited { code, .. } => return Some(code),
                }
            }
            None
        })
        .await
        .unwrap();

        assert_eq!(exit, Some(7));
        assert!(output.contains("pty-ok"), "output was {output:?}");
        // Channel closes after the exit notification.
        assert!(events.recv().await.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn spawn_in_missing_directory_fails() {
        let env = HashMap::new();
        let result = PtyProcess::spawn(PtyOptions {
            command: "/bin/sh",
            args: &[],
            cwd: Path::new("/definitely/not/a/dir"),
            env: &env,
            cols: 80,
            rows: 24,
        });
        assert!(matches!(result, Err(TermError::Spawn(_))));
    }
}
