//! The session registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ClosePolicy, EngineConfig};
use crate::deadline::{run_with_deadline, Outcome};
use crate::error::{classify, EngineError, Result};
use crate::executor::{BatchContext, BatchExecutor};
use crate::host::{HostLauncher, LaunchRequest};
use crate::session::{FileIdentity, Session, SessionId, SessionInfo, SessionState};

/// Parameters for [`SessionManager::open`].
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub file: PathBuf,
    /// Caller-chosen id. A random one is generated when absent.
    pub session_id: Option<SessionId>,
    pub visible: bool,
}

impl SessionRequest {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            session_id: None,
            visible: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(SessionId::new(id));
        self
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Arc<Session>>,
    by_file: HashMap<String, SessionId>,
}

impl Registry {
    fn insert(&mut self, session: Arc<Session>) {
        self.by_file
            .insert(session.file().key().to_string(), session.id().clone());
        self.sessions.insert(session.id().clone(), session);
    }

    fn remove(&mut self, session: &Session) {
        let is_same = |s: &Arc<Session>| std::ptr::eq(Arc::as_ptr(s), session);
        if self.sessions.get(session.id()).is_some_and(is_same) {
            self.sessions.remove(session.id());
        }
        if self.by_file.get(session.file().key()) == Some(session.id()) {
            self.by_file.remove(session.file().key());
        }
    }
}

/// Owns every session in the process.
///
/// The registry lock guards only the maps and is never held across a host
/// call, so listing sessions never waits on a running batch. Dropping the
/// manager closes every session without saving.
pub struct SessionManager {
    launcher: Arc<dyn HostLauncher>,
    executor: BatchExecutor,
    config: EngineConfig,
    registry: Arc<RwLock<Registry>>,
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn HostLauncher>, config: EngineConfig) -> Self {
        let registry = Arc::new(RwLock::new(Registry::default()));
        let forget = Arc::downgrade(&registry);
        let executor = BatchExecutor::new(&config).on_terminated(move |session| {
            if let Some(registry) = forget.upgrade() {
                registry.write().remove(session);
                debug!(session = %session.id(), "terminated session unregistered");
            }
        });
        Self {
            launcher,
            executor,
            config,
            registry,
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &BatchExecutor {
        &self.executor
    }

    /// The open session for `file`, launching a host if there is none.
    pub fn get_or_create(&self, file: impl AsRef<Path>) -> Result<Arc<Session>> {
        self.open(SessionRequest::new(file.as_ref()))
    }

    pub fn open(&self, request: SessionRequest) -> Result<Arc<Session>> {
        let file = FileIdentity::new(&request.file);
        let creation = self.creation_lock(&file);
        let result = {
            let _creating = creation.lock();
            self.open_locked(file.clone(), request)
        };
        drop(creation);
        self.creation_locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        result
    }

    fn creation_lock(&self, file: &FileIdentity) -> Arc<Mutex<()>> {
        Arc::clone(
            self.creation_locks
                .lock()
                .entry(file.key().to_string())
                .or_default(),
        )
    }

    fn open_locked(&self, file: FileIdentity, request: SessionRequest) -> Result<Arc<Session>> {
        if let Some(existing) = self.registered_for(&file) {
            match existing.state() {
                SessionState::Open if existing.is_suspect() => {
                    return Err(EngineError::invalid_state(
                        existing.id().as_str(),
                        format!("is suspect after a timed-out batch on '{file}'; retry once the host has been checked"),
                    ));
                }
                SessionState::Open => {
                    if let Some(id) = &request.session_id {
                        if id != existing.id() {
                            return Err(EngineError::invalid_state(
                                id.as_str(),
                                format!("cannot open '{file}': already open in session '{}'", existing.id()),
                            ));
                        }
                    }
                    debug!(session = %existing.id(), %file, "reusing open session");
                    return Ok(existing);
                }
                SessionState::Closing => {
                    return Err(EngineError::invalid_state(
                        existing.id().as_str(),
                        format!("is closing '{file}'; retry once it has closed"),
                    ));
                }
                SessionState::Closed => self.registry.write().remove(&existing),
            }
        }

        let id = match request.session_id {
            Some(id) => {
                let taken = self.registry.read().sessions.get(id.as_str()).cloned();
                if let Some(other) = taken {
                    if other.state() != SessionState::Closed {
                        return Err(EngineError::invalid_state(
                            id.as_str(),
                            format!("already names a session for '{}'", other.file()),
                        ));
                    }
                    self.registry.write().remove(&other);
                }
                id
            }
            None => self.generate_id(),
        };

        info!(session = %id, %file, visible = request.visible, "launching host");
        let launch = LaunchRequest {
            file: file.clone(),
            visible: request.visible,
        };
        let host = self.launcher.launch(&launch).map_err(|e| match e {
            e @ EngineError::HostLaunchFailed { .. } => e,
            other => EngineError::HostLaunchFailed {
                file: file.to_string(),
                reason: other.to_string(),
            },
        })?;

        let session = Arc::new(Session::new(id, file, host, request.visible));
        self.registry.write().insert(Arc::clone(&session));
        info!(session = %session.id(), pid = ?session.pid(), "session opened");
        Ok(session)
    }

    fn generate_id(&self) -> SessionId {
        loop {
            let id = SessionId::new(format!("{:08x}", rand::random::<u32>()));
            if !self.registry.read().sessions.contains_key(&id) {
                return id;
            }
        }
    }

    fn registered_for(&self, file: &FileIdentity) -> Option<Arc<Session>> {
        let registry = self.registry.read();
        let id = registry.by_file.get(file.key())?;
        registry.sessions.get(id).cloned()
    }

    /// The session with this id, unless it has been closed.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.registry
            .read()
            .sessions
            .get(session_id)
            .filter(|s| s.state() != SessionState::Closed)
            .cloned()
    }

    /// The session bound to `file`, unless it has been closed.
    pub fn find_by_file(&self, file: impl AsRef<Path>) -> Option<Arc<Session>> {
        self.registered_for(&FileIdentity::new(file))
            .filter(|s| s.state() != SessionState::Closed)
    }

    /// Snapshot of every session that is not closed, oldest first.
    pub fn list_active(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.registry.read().sessions.values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|s| s.info())
            .filter(|info| info.state != SessionState::Closed)
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Close a session. `Ok(false)` if there is no such session.
    pub fn close(&self, session_id: &str, save: bool) -> Result<bool> {
        let Some(session) = self.get(session_id) else {
            return Ok(false);
        };
        self.close_session(&session, save)?;
        Ok(true)
    }

    fn close_session(&self, session: &Arc<Session>, save: bool) -> Result<()> {
        match session.begin_close() {
            Ok(()) => {}
            Err(SessionState::Closed) => {
                self.registry.write().remove(session);
                return Ok(());
            }
            Err(state) => {
                return Err(EngineError::invalid_state(
                    session.id().as_str(),
                    format!("is already {state}"),
                ));
            }
        }

        if let Err(e) = self.wait_until_idle(session) {
            session.abort_close();
            return Err(e);
        }

        // A host left running an abandoned call cannot be trusted to save or
        // quit.
        if session.is_suspect() {
            if save {
                session.abort_close();
                return Err(EngineError::invalid_state(
                    session.id().as_str(),
                    "is suspect after a timed-out batch and cannot save; close without saving to terminate it",
                ));
            }
            session.terminate("closed while suspect");
            self.registry.write().remove(session);
            info!(session = %session.id(), "suspect session terminated on close");
            return Ok(());
        }

        let Some(guard) = session.try_lock_execution_for(self.config.close_lock_timeout) else {
            session.terminate("execution lock not released during close");
            self.registry.write().remove(session);
            return if save {
                Err(EngineError::fatal(format!(
                    "session '{}' was closed without saving: its execution lock was never released",
                    session.id()
                )))
            } else {
                Ok(())
            };
        };

        if save {
            if let Err(e) = self.save_for_close(session) {
                drop(guard);
                if session.state() == SessionState::Closing {
                    session.abort_close();
                } else {
                    self.registry.write().remove(session);
                }
                return Err(e);
            }
        }

        self.shut_down_host(session);
        drop(guard);
        self.registry.write().remove(session);
        info!(session = %session.id(), saved = save, "session closed");
        Ok(())
    }

    fn wait_until_idle(&self, session: &Session) -> Result<()> {
        let busy = |active| EngineError::Busy {
            session: session.id().to_string(),
            active,
        };
        match self.config.close_policy {
            ClosePolicy::FailFast => match session.active_operations() {
                0 => Ok(()),
                active => Err(busy(active)),
            },
            ClosePolicy::WaitForIdle(limit) => {
                let started = Instant::now();
                loop {
                    let active = session.active_operations();
                    if active == 0 {
                        return Ok(());
                    }
                    if started.elapsed() >= limit {
                        return Err(busy(active));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    /// Save under the close deadline. A save that hangs kills the host.
    fn save_for_close(&self, session: &Arc<Session>) -> Result<()> {
        let host = Arc::clone(session.host());
        let timeout = self.config.shutdown_timeout;
        match run_with_deadline(format!("save-{}", session.id()), timeout, move || host.save(None))? {
            Outcome::Completed(result) => result.map_err(classify),
            Outcome::Panicked(msg) => Err(EngineError::fatal(format!("save panicked: {msg}"))),
            Outcome::TimedOut(_) => {
                session.terminate("save did not finish during close");
                Err(EngineError::TimedOut {
                    session: session.id().to_string(),
                    elapsed: timeout,
                })
            }
        }
    }

    /// Release the root, ask the host to quit, then make sure the process is
    /// gone. Failures here are logged; the session ends up closed regardless.
    fn shut_down_host(&self, session: &Arc<Session>) {
        let host = Arc::clone(session.host());
        let root = Arc::clone(session.root());
        let name = format!("quit-{}", session.id());
        let quit = run_with_deadline(name, self.config.shutdown_timeout, move || {
            if let Err(fault) = root.release() {
                warn!(%fault, "failed to release root handle");
            }
            host.quit()
        });
        match quit {
            Ok(Outcome::Completed(Ok(()))) => {
                session.mark_closed();
                session.host().terminate();
            }
            Ok(Outcome::Completed(Err(fault))) => {
                warn!(session = %session.id(), %fault, "host refused to quit");
                session.terminate("quit failed");
            }
            Ok(Outcome::TimedOut(_)) => session.terminate("quit timed out"),
            Ok(Outcome::Panicked(msg)) => {
                warn!(session = %session.id(), %msg, "quit panicked");
                session.terminate("quit panicked");
            }
            Err(e) => {
                warn!(session = %session.id(), error = %e, "could not run quit");
                session.terminate("quit could not run");
            }
        }
    }

    /// Show or hide a session's host window.
    pub fn set_visible(&self, session_id: &str, visible: bool) -> Result<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| EngineError::not_found(format!("session '{session_id}'")))?;
        self.executor
            .execute_once(&session, self.executor.default_timeout(), move |ctx| {
                ctx.set_visible(visible)
            })
    }

    /// Run one batch against `file`.
    ///
    /// If a session is already open for the file it is reused and left open.
    /// Otherwise a temporary session is opened for the batch and closed
    /// afterwards, even when the batch fails. With `save`, the workbook is
    /// saved after the work succeeds.
    pub fn with_session_of_one<T, F>(&self, file: impl AsRef<Path>, save: bool, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&BatchContext) -> Result<T> + Send + 'static,
    {
        let file = file.as_ref();
        let work = move |ctx: &BatchContext| -> Result<T> {
            let value = work(ctx)?;
            if save {
                ctx.save(None)?;
            }
            Ok(value)
        };
        let timeout = self.executor.default_timeout();

        if let Some(existing) = self.find_by_file(file) {
            return self.executor.execute_once(&existing, timeout, work);
        }

        let session = self.get_or_create(file)?;
        let result = self.executor.execute_once(&session, timeout, work);
        // The session is registered, so another caller may have picked it up
        // meanwhile. Their work keeps it open.
        match self.close_session(&session, false) {
            Ok(()) => {}
            Err(EngineError::Busy { active, .. }) => {
                info!(session = %session.id(), active, "temporary session in use elsewhere; leaving it open");
            }
            Err(e) => {
                warn!(session = %session.id(), error = %e, "temporary session did not close cleanly");
            }
        }
        result
    }

    /// Drop registry entries for sessions that were closed without going
    /// through [`close`](Self::close). The watchdog unregisters the sessions
    /// it terminates itself, so this is only a sweep.
    pub fn prune_closed(&self) -> usize {
        let mut registry = self.registry.write();
        let closed: Vec<Arc<Session>> = registry
            .sessions
            .values()
            .filter(|s| s.state() == SessionState::Closed)
            .cloned()
            .collect();
        for session in &closed {
            registry.remove(session);
        }
        closed.len()
    }

    /// Close every session without saving.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.registry.read().sessions.values().cloned().collect();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "closing all sessions");
        for session in sessions {
            if let Err(e) = self.close_session(&session, false) {
                warn!(session = %session.id(), error = %e, "forcing close");
                session.terminate("manager shutdown");
                self.registry.write().remove(&session);
            }
        }
    }
}

#[cfg(test)]
impl SessionManager {
    /// Registry entries, closed ones included.
    pub(crate) fn registered(&self) -> usize {
        self.registry.read().sessions.len()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.registry.read().sessions.len())
            .finish()
    }
}
