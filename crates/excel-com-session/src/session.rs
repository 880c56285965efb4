//! One live connection to one host process.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::handle::NativeHandle;
use crate::host::Host;

/// Caller-visible session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::borrow::Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The workbook a session is bound to.
///
/// Two identities are equal when their normalized absolute paths are equal
/// (case-insensitively on Windows, where the file system is).
#[derive(Debug, Clone)]
pub struct FileIdentity {
    path: PathBuf,
    key: String,
}

impl FileIdentity {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = normalize(path.as_ref());
        let key = path.to_string_lossy().into_owned();
        #[cfg(windows)]
        let key = key.to_lowercase();
        Self { path, key }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registry key for this identity.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl PartialEq for FileIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for FileIdentity {}

impl std::hash::Hash for FileIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Absolute, lexically normalized path. Does not touch the file system so
/// that identities for not-yet-created workbooks are stable.
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Open,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        })
    }
}

/// Point-in-time view of a session, built from lock-free fields only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub file: PathBuf,
    pub active_operations: usize,
    pub visible: bool,
    pub suspect: bool,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl SessionInfo {
    /// Whether a `close` would be accepted right now under the fail-fast
    /// policy.
    pub fn can_close(&self) -> bool {
        self.state == SessionState::Open && self.active_operations == 0
    }
}

/// One live host process and the workbook it has open.
///
/// Only the batch holding the execution lock may touch the root handle or
/// anything reachable from it. `active_operations`, `visible`, `suspect` and
/// `state` are atomics so that monitors can read them without the lock.
pub struct Session {
    id: SessionId,
    file: FileIdentity,
    host: Arc<dyn Host>,
    root: Arc<NativeHandle>,
    execution_lock: Mutex<()>,
    active_operations: AtomicUsize,
    visible: AtomicBool,
    suspect: AtomicBool,
    state: AtomicU8,
    created_at: DateTime<Utc>,
    last_used_ms: AtomicI64,
}

impl Session {
    pub(crate) fn new(id: SessionId, file: FileIdentity, host: Arc<dyn Host>, visible: bool) -> Self {
        let root = NativeHandle::new(Arc::clone(&host), host.root());
        let now = Utc::now();
        Self {
            id,
            file,
            host,
            root,
            execution_lock: Mutex::new(()),
            active_operations: AtomicUsize::new(0),
            visible: AtomicBool::new(visible),
            suspect: AtomicBool::new(false),
            state: AtomicU8::new(SessionState::Open as u8),
            created_at: now,
            last_used_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn file(&self) -> &FileIdentity {
        &self.file
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn active_operations(&self) -> usize {
        self.active_operations.load(Ordering::SeqCst)
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }

    /// Set after a batch timed out, until the watchdog has a verdict.
    pub fn is_suspect(&self) -> bool {
        self.suspect.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.host.pid()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_used_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            file: self.file.path().to_path_buf(),
            active_operations: self.active_operations(),
            visible: self.is_visible(),
            suspect: self.is_suspect(),
            state: self.state(),
            created_at: self.created_at,
            last_used_at: self.last_used_at(),
        }
    }

    pub(crate) fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub(crate) fn root(&self) -> &Arc<NativeHandle> {
        &self.root
    }

    /// Count an operation as in flight until the guard drops.
    pub(crate) fn begin_operation(&self) -> ActiveOperation<'_> {
        self.active_operations.fetch_add(1, Ordering::SeqCst);
        ActiveOperation { session: self }
    }

    pub(crate) fn lock_execution(&self) -> MutexGuard<'_, ()> {
        self.execution_lock.lock()
    }

    pub(crate) fn try_lock_execution_for(&self, timeout: Duration) -> Option<MutexGuard<'_, ()>> {
        self.execution_lock.try_lock_for(timeout)
    }

    pub(crate) fn touch(&self) {
        self.last_used_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub(crate) fn set_visible_flag(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
    }

    pub(crate) fn mark_suspect(&self) {
        self.suspect.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_suspect(&self) {
        self.suspect.store(false, Ordering::SeqCst);
    }

    /// Open → Closing. Only one closer can win.
    pub(crate) fn begin_close(&self) -> Result<(), SessionState> {
        self.state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(SessionState::from_u8)
    }

    /// Closing → Open, after a close was refused.
    pub(crate) fn abort_close(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Closing as u8,
            SessionState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);
    }

    /// Kill the host without talking to it. The root handle is abandoned
    /// rather than released because there is nobody left to release it to.
    pub(crate) fn terminate(&self, reason: &str) {
        let previous = SessionState::from_u8(
            self.state.swap(SessionState::Closed as u8, Ordering::SeqCst),
        );
        if previous == SessionState::Closed {
            return;
        }
        warn!(session = %self.id, pid = ?self.pid(), reason, "terminating host process");
        self.root.abandon();
        self.host.terminate();
        info!(session = %self.id, "session closed by termination");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("file", &self.file)
            .field("state", &self.state())
            .field("active_operations", &self.active_operations())
            .finish()
    }
}

/// Decrements the session's active operation count on drop.
pub(crate) struct ActiveOperation<'a> {
    session: &'a Session,
}

impl Drop for ActiveOperation<'_> {
    fn drop(&mut self) {
        self.session.active_operations.fetch_sub(1, Ordering::SeqCst);
    }
}
