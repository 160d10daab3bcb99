//! Session lifecycle management.
//!
//! The registry maps caller-assigned execution ids to live PTY sessions.
//! It owns creation and destruction ordering: spawn registers a session and
//! starts a driver task that applies the process's output and exit events,
//! the inactivity supervisor reclaims idle sessions, and an exited session
//! stays readable for a grace period before it is purged.
//!
//! Lock order is always the session map first, then a session's state.

use super::events::{EventPublisher, Subscription, SubscriptionId};
use super::output_buffer::{OutputBuffer, DEFAULT_MAX_BYTES, DEFAULT_MAX_LINES};
use super::pty::{self, PtyEvent, PtyOptions, PtyProcess};
use super::supervisor::InactivitySupervisor;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use termhost_core::{SessionEvent, SessionInfo, SpawnRequest, TermError, TermResult};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Shell used when neither the request, the config, nor `$SHELL` names one.
#[cfg(not(windows))]
const FALLBACK_SHELL: &str = "/bin/sh";
#[cfg(windows)]
const FALLBACK_SHELL: &str = "cmd.exe";

/// Registry-wide settings. Per-spawn overrides live on [`SpawnRequest`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shell for requests that don't name one. `None` means `$SHELL`.
    pub default_shell: Option<String>,
    /// Idle time after which a session is reclaimed (default 30 min).
    pub inactivity_timeout: Duration,
    /// How long an exited session stays readable (default 5 s).
    pub exit_grace_period: Duration,
    /// Output buffer line cap (default 10 000).
    pub max_buffer_lines: usize,
    /// Output buffer size cap in bytes (default 10 MiB).
    pub max_buffer_bytes: usize,
    /// Terminal size for requests that don't set one (default 80x24).
    pub default_cols: u16,
    pub default_rows: u16,
    /// Maximum number of registered sessions (default 100).
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            inactivity_timeout: Duration::from_secs(30 * 60),
            exit_grace_period: Duration::from_secs(5),
            max_buffer_lines: DEFAULT_MAX_LINES,
            max_buffer_bytes: DEFAULT_MAX_BYTES,
            default_cols: 80,
            default_rows: 24,
            max_sessions: 100,
        }
    }
}

impl SessionConfig {
    /// Pick the shell for a spawn: request, then config, then `$SHELL`.
    pub fn resolve_shell(&self, requested: Option<&str>) -> String {
        requested
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.default_shell.clone())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| FALLBACK_SHELL.to_string())
    }
}

/// One managed PTY session.
struct Session {
    execution_id: String,
    /// Registry-unique; lets timers tell this session apart from a later one
    /// that reuses the same execution id.
    serial: u64,
    process: PtyProcess,
    command: String,
    working_dir: PathBuf,
    created_at_ms: u64,
    state: Mutex<SessionState>,
}

/// Mutable per-session state, only touched under the session's lock.
struct SessionState {
    buffer: OutputBuffer,
    last_activity_ms: u64,
    exit_code: Option<i32>,
    cols: u16,
    rows: u16,
    supervisor: InactivitySupervisor,
    /// Set once the session has left the registry.
    closed: bool,
}

impl Session {
    fn info(&self, state: &SessionState) -> SessionInfo {
        SessionInfo {
            execution_id: self.execution_id.clone(),
            pid: self.process.pid(),
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            cols: state.cols,
            rows: state.rows,
            buffer: state.buffer.lines(),
            created_at_ms: self.created_at_ms,
            last_activity_ms: state.last_activity_ms,
            exit_code: state.exit_code,
        }
    }
}

struct Registry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Ids claimed by spawns whose process is still being started. Claimed
    /// and checked only under the `sessions` write lock.
    reserved: std::sync::Mutex<HashSet<String>>,
    config: SessionConfig,
    events: EventPublisher,
    next_serial: AtomicU64,
}

/// Manages all PTY sessions. Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Registry>,
}

impl SessionManager {
    /// Create an empty registry.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Registry {
                sessions: RwLock::new(HashMap::new()),
                reserved: std::sync::Mutex::new(HashSet::new()),
                config,
                events: EventPublisher::new(),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    /// Receive `output` and `exited` events for every session.
    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Spawn a process on a new PTY and register it under `request.execution_id`.
    pub async fn spawn(&self, request: SpawnRequest) -> TermResult<SessionInfo> {
        let registry = &self.inner;
        let config = &registry.config;

        if request.execution_id.trim().is_empty() {
            return Err(TermError::InvalidArgument(
                "execution id must not be empty".into(),
            ));
        }
        let cols = request.cols.unwrap_or(config.default_cols);
        let rows = request.rows.unwrap_or(config.default_rows);
        if cols == 0 || rows == 0 {
            return Err(TermError::InvalidArgument(format!(
                "terminal size must be non-zero, got {cols}x{rows}"
            )));
        }

        // Claim the id up front so the process can start without the map lock.
        let mut reservation = {
            let sessions = registry.sessions.write().await;
            let mut reserved = registry.reserved();
            if sessions.contains_key(&request.execution_id)
                || reserved.contains(&request.execution_id)
            {
                return Err(TermError::AlreadyExists(request.execution_id));
            }
            if sessions.len() + reserved.len() >= config.max_sessions {
                return Err(TermError::LimitReached(config.max_sessions));
            }
            reserved.insert(request.execution_id.clone());
            Reservation {
                registry: registry.as_ref(),
                execution_id: request.execution_id.clone(),
                held: true,
            }
        };

        let shell = config.resolve_shell(request.shell.as_deref());
        let (process, pty_events) = PtyProcess::spawn(PtyOptions {
            command: &shell,
            args: &request.args,
            cwd: &request.working_dir,
            env: &request.env,
            cols,
            rows,
        })?;

        let command = if request.args.is_empty() {
            shell
        } else {
            format!("{shell} {}", request.args.join(" "))
        };
        let timeout = request
            .inactivity_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(config.inactivity_timeout);
        let now = now_millis();

        let session = Arc::new(Session {
            execution_id: request.execution_id.clone(),
            serial: registry.next_serial.fetch_add(1, Ordering::Relaxed),
            process,
            command,
            working_dir: request.working_dir,
            created_at_ms: now,
            state: Mutex::new(SessionState {
                buffer: OutputBuffer::new(config.max_buffer_lines, config.max_buffer_bytes),
                last_activity_ms: now,
                exit_code: None,
                cols,
                rows,
                supervisor: InactivitySupervisor::new(timeout),
                closed: false,
            }),
        });

        let info = {
            let mut sessions = registry.sessions.write().await;
            reservation.release();
            let mut state = session.state.lock().await;
            registry.arm_inactivity(&session, &mut state);
            sessions.insert(request.execution_id.clone(), session.clone());
            session.info(&state)
        };

        tokio::spawn(drive(Arc::downgrade(registry), session, pty_events));

        info!(
            execution_id = %request.execution_id,
            pid = ?info.pid,
            command = %info.command,
            cols,
            rows,
            timeout_ms = timeout.as_millis() as u64,
            "session created"
        );
        Ok(info)
    }

    /// Write to a session's input. Best effort: `false` if the session is
    /// unknown or the write fails.
    pub async fn write(&self, execution_id: &str, data: &str) -> bool {
        let Some(session) = self.inner.get(execution_id).await else {
            debug!(execution_id, "write to unknown session ignored");
            return false;
        };

        {
            let mut state = session.state.lock().await;
            self.inner.touch(&session, &mut state);
        }

        let bytes = data.as_bytes().to_vec();
        let writer = session.clone();
        let result = tokio::task::spawn_blocking(move || writer.process.write(&bytes))
            .await
            .map_err(|e| TermError::Other(format!("join error: {e}")))
            .and_then(|r| r);
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(execution_id, error = %e, "write to PTY failed");
                false
            }
        }
    }

    /// Change a session's terminal size.
    ///
    /// Unknown sessions are an error; a failing OS resize is logged only.
    pub async fn resize(&self, execution_id: &str, cols: u16, rows: u16) -> TermResult<()> {
        let session = self
            .inner
            .get(execution_id)
            .await
            .ok_or_else(|| TermError::NotFound(execution_id.to_string()))?;
        if cols == 0 || rows == 0 {
            return Err(TermError::InvalidArgument(format!(
                "terminal size must be non-zero, got {cols}x{rows}"
            )));
        }

        let mut state = session.state.lock().await;
        self.inner.touch(&session, &mut state);
        match session.process.resize(cols, rows) {
            Ok(()) => {
                state.cols = cols;
                state.rows = rows;
            }
            Err(e) => warn!(execution_id, cols, rows, error = %e, "PTY resize failed"),
        }
        Ok(())
    }

    /// Metadata for a session, including a copy of its buffer.
    pub async fn get_session(&self, execution_id: &str) -> Option<SessionInfo> {
        let session = self.inner.get(execution_id).await?;
        let state = session.state.lock().await;
        Some(session.info(&state))
    }

    /// Copy of a session's buffered lines; empty if the session is unknown.
    pub async fn get_buffer(&self, execution_id: &str) -> Vec<String> {
        match self.inner.get(execution_id).await {
            Some(session) => session.state.lock().await.buffer.lines(),
            None => Vec::new(),
        }
    }

    /// Terminate a session's process and remove it immediately, skipping the
    /// grace period. Returns `false` if no such session is registered.
    pub async fn kill(&self, execution_id: &str) -> bool {
        let removed = self.inner.sessions.write().await.remove(execution_id);
        let Some(session) = removed else {
            return false;
        };
        self.inner.close(&session).await;
        info!(execution_id, "session killed");
        true
    }

    /// Ids of all registered sessions, sorted.
    pub async fn active_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered sessions.
    pub async fn count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Kill every session and clear the registry.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        join_all(drained.iter().map(|session| self.inner.close(session))).await;
        info!(count, "all sessions shut down");
    }
}

/// Claim on an execution id while its process starts. Dropping it frees
/// the id again unless the session was inserted.
struct Reservation<'a> {
    registry: &'a Registry,
    execution_id: String,
    held: bool,
}

impl Reservation<'_> {
    /// Give up the claim. Idempotent; a later spawn's claim on the same id
    /// is never touched.
    fn release(&mut self) {
        if std::mem::take(&mut self.held) {
            self.registry.reserved().remove(&self.execution_id);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl Registry {
    fn reserved(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn get(&self, execution_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(execution_id).cloned()
    }

    /// The registered session for `execution_id`, if it is still `serial`.
    async fn lookup(&self, execution_id: &str, serial: u64) -> Option<Arc<Session>> {
        self.get(execution_id)
            .await
            .filter(|session| session.serial == serial)
    }

    /// Record activity and restart the inactivity deadline.
    ///
    /// Exited or closed sessions only get the timestamp; activity never
    /// brings them back.
    fn touch(self: &Arc<Self>, session: &Arc<Session>, state: &mut SessionState) {
        state.last_activity_ms = now_millis();
        if state.closed || state.exit_code.is_some() {
            return;
        }
        self.arm_inactivity(session, state);
    }

    fn arm_inactivity(self: &Arc<Self>, session: &Session, state: &mut SessionState) {
        let registry = Arc::downgrade(self);
        let execution_id = session.execution_id.clone();
        let serial = session.serial;
        state.supervisor.reset(move |epoch| async move {
            if let Some(registry) = registry.upgrade() {
                registry.reclaim_idle(&execution_id, serial, epoch).await;
            }
        });
    }

    /// Inactivity deadline expired.
    async fn reclaim_idle(self: &Arc<Self>, execution_id: &str, serial: u64, epoch: u64) {
        let Some(session) = self.lookup(execution_id, serial).await else {
            return;
        };
        {
            let mut state = session.state.lock().await;
            if state.closed || !state.supervisor.is_current(epoch) {
                // Activity raced the deadline and won.
                return;
            }
            state.supervisor.mark_fired();
            let idle_ms = now_millis().saturating_sub(state.last_activity_ms);
            let timeout_ms = state.supervisor.timeout().as_millis() as u64;
            info!(execution_id, idle_ms, timeout_ms, "reclaiming idle session");
        }
        self.purge(execution_id, serial).await;
    }

    /// Remove `serial`'s session if it is still the registered one, then
    /// close it. Returns whether anything was removed.
    async fn purge(&self, execution_id: &str, serial: u64) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(execution_id) {
                Some(session) if session.serial == serial => sessions.remove(execution_id),
                _ => None,
            }
        };
        match removed {
            Some(session) => {
                self.close(&session).await;
                debug!(execution_id, "session purged");
                true
            }
            None => false,
        }
    }

    /// Tear down a session that has already left the map: stop its timer and
    /// terminate the process unless it has exited on its own.
    async fn close(&self, session: &Arc<Session>) {
        {
            let mut state = session.state.lock().await;
            state.closed = true;
            state.supervisor.disarm();
            if state.exit_code.is_some() {
                return;
            }
        }

        let target = session.clone();
        let result = tokio::task::spawn_blocking(move || target.process.kill())
            .await
            .map_err(|e| TermError::Other(format!("join error: {e}")))
            .and_then(|r| r);
        if let Err(e) = result {
            warn!(execution_id = %session.execution_id, error = %e, "failed to terminate PTY process");
        }
    }

    async fn on_output(self: &Arc<Self>, session: &Arc<Session>, chunk: String) {
        {
            let mut state = session.state.lock().await;
            let outcome = state.buffer.push(&chunk);
            if outcome.first_overflow {
                warn!(
                    execution_id = %session.execution_id,
                    max_lines = state.buffer.max_lines(),
                    max_bytes = state.buffer.max_bytes(),
                    retained_lines = state.buffer.len(),
                    "output buffer limit exceeded, dropping oldest lines"
                );
            }
            self.touch(session, &mut state);
        }

        pty::mirror_notable(&session.execution_id, &chunk);
        self.events.publish(SessionEvent::Output {
            execution_id: session.execution_id.clone(),
            data: chunk,
        });
    }

    async fn on_exit(self: &Arc<Self>, session: &Arc<Session>, code: i32, signal: Option<String>) {
        {
            let mut state = session.state.lock().await;
            if state.exit_code.is_none() {
                state.exit_code = Some(code);
            }
            state.supervisor.disarm();
        }

        self.events.publish(SessionEvent::Exited {
            execution_id: session.execution_id.clone(),
            exit_code: code,
            signal: signal.clone(),
        });

        if self.lookup(&session.execution_id, session.serial).await.is_none() {
            debug!(execution_id = %session.execution_id, code, "killed session exited");
            return;
        }

        let grace = self.config.exit_grace_period;
        info!(
            execution_id = %session.execution_id,
            code,
            ?signal,
            grace_ms = grace.as_millis() as u64,
            "session exited, purging after grace period"
        );

        let registry = Arc::downgrade(self);
        let execution_id = session.execution_id.clone();
        let serial = session.serial;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = registry.upgrade() {
                registry.purge(&execution_id, serial).await;
            }
        });
    }
}

/// Apply one session's PTY events in order until the process exits.
async fn drive(
    registry: Weak<Registry>,
    session: Arc<Session>,
    mut events: mpsc::UnboundedReceiver<PtyEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        match event {
            PtyEvent::Output(chunk) => registry.on_output(&session, chunk).await,
            PtyEvent::Exited { code, signal } => {
                registry.on_exit(&session, code, signal).await;
                break;
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
