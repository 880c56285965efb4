//! Native handle ownership.
//!
//! Every object reference the host hands out must be released exactly once.
//! Ownership is carried in the types:
//!
//! - [`OwnedHandle`]: nobody has registered this handle yet. Whoever holds it
//!   must either [`HandleScope::adopt`] it or [`OwnedHandle::release`] it.
//!   Lookups ([`NativeHandle::get_object`], [`NativeHandle::call_object`])
//!   return this type, so a helper that finds an object and returns it never
//!   releases what it returns.
//! - [`ObjectRef`]: a borrowed reference into a [`HandleScope`]. It cannot
//!   outlive the scope and the scope, not the borrower, releases it.
//!
//! Release itself is idempotent: a handle moves from live to released once
//! and later release attempts are no-ops.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use excel_com_protocol::{ObjectId, Variant};
use tracing::{debug, warn};

use crate::error::{EngineError, HostFault, Result};
use crate::host::Host;

/// A reference to one object in the host's graph.
pub struct NativeHandle {
    id: ObjectId,
    host: Arc<dyn Host>,
    released: AtomicBool,
}

impl NativeHandle {
    pub(crate) fn new(host: Arc<dyn Host>, id: ObjectId) -> Arc<Self> {
        Arc::new(Self {
            id,
            host,
            released: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release the host reference. Returns `Ok(false)` if it was already
    /// released; the host sees at most one release per handle.
    pub(crate) fn release(&self) -> std::result::Result<bool, HostFault> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.host.release(self.id).map(|()| true)
    }

    /// Mark released without talking to the host. Used once the host process
    /// is gone and there is nobody left to release to.
    pub(crate) fn abandon(&self) {
        self.released.store(true, Ordering::Release);
    }

    fn ensure_live(&self, member: &str) -> Result<()> {
        if self.is_released() {
            return Err(EngineError::fatal(format!(
                "use of released handle {} ({member})",
                self.id
            )));
        }
        Ok(())
    }

    /// Read a scalar property.
    ///
    /// A property that turns out to be an object is released immediately and
    /// reported as an error; use [`get_object`](Self::get_object) for those.
    pub fn get(&self, name: &str) -> Result<Variant> {
        self.get_with(name, &[])
    }

    /// Read an indexed scalar property, e.g. `Range("A1")`'s `Value`.
    pub fn get_with(&self, name: &str, args: &[Variant]) -> Result<Variant> {
        self.ensure_live(name)?;
        let value = self.host.get_property(self.id, name, args)?;
        self.reject_object(name, value)
    }

    pub fn set(&self, name: &str, value: impl Into<Variant>) -> Result<()> {
        self.ensure_live(name)?;
        self.host.set_property(self.id, name, value.into())?;
        Ok(())
    }

    /// Invoke a method whose result is not an object.
    pub fn call(&self, name: &str, args: &[Variant]) -> Result<Variant> {
        self.ensure_live(name)?;
        let value = self.host.invoke(self.id, name, args)?;
        self.reject_object(name, value)
    }

    /// Read a property that returns an object. The caller owns the result.
    pub fn get_object(&self, name: &str) -> Result<OwnedHandle> {
        self.get_object_with(name, &[])
    }

    /// Read an indexed property that returns an object, e.g.
    /// `Worksheets.Item("Data")`.
    pub fn get_object_with(&self, name: &str, args: &[Variant]) -> Result<OwnedHandle> {
        self.ensure_live(name)?;
        let value = self.host.get_property(self.id, name, args)?;
        self.expect_object(name, value)
    }

    /// Invoke a method that returns an object. The caller owns the result.
    pub fn call_object(&self, name: &str, args: &[Variant]) -> Result<OwnedHandle> {
        self.ensure_live(name)?;
        let value = self.host.invoke(self.id, name, args)?;
        self.expect_object(name, value)
    }

    fn expect_object(&self, name: &str, value: Variant) -> Result<OwnedHandle> {
        match value {
            Variant::Object { handle } => Ok(OwnedHandle::new(NativeHandle::new(
                Arc::clone(&self.host),
                handle,
            ))),
            Variant::Null => Err(EngineError::not_found(format!(
                "'{name}' on {} returned nothing",
                self.id
            ))),
            other => Err(EngineError::fatal(format!(
                "'{name}' on {} returned {other}, expected an object",
                self.id
            ))),
        }
    }

    fn reject_object(&self, name: &str, value: Variant) -> Result<Variant> {
        match value {
            Variant::Object { handle } => {
                let stray = OwnedHandle::new(NativeHandle::new(Arc::clone(&self.host), handle));
                if let Err(fault) = stray.release() {
                    warn!(%fault, "failed to release unexpected object result");
                }
                Err(EngineError::fatal(format!(
                    "'{name}' on {} returned an object where a value was expected",
                    self.id
                )))
            }
            other => Ok(other),
        }
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

/// A handle that has not been registered with any scope yet.
///
/// Dropping one without adopting or releasing it still releases it, but logs
/// a warning: that is a leak the caller should fix.
///
/// Owned handles are tied to the thread running the batch. They are not
/// `Send`, so they cannot be returned from a batch or smuggled out of it and
/// used without the session's execution lock:
///
/// ```compile_fail
/// use std::time::Duration;
///
/// use excel_com_session::testing::FakeLauncher;
/// use excel_com_session::{EngineConfig, SessionManager};
///
/// let manager = SessionManager::new(FakeLauncher::new(), EngineConfig::default());
/// let session = manager.get_or_create("/books/a.xlsx").unwrap();
/// let sheets = manager
///     .executor()
///     .execute_once(&session, Duration::from_secs(5), |ctx| ctx.root().get_object("Worksheets"))
///     .unwrap();
/// ```
#[must_use = "an owned handle must be adopted by a HandleScope or released"]
#[derive(Debug)]
pub struct OwnedHandle {
    handle: Arc<NativeHandle>,
    transferred: bool,
    _not_send: PhantomData<*const ()>,
}

impl OwnedHandle {
    fn new(handle: Arc<NativeHandle>) -> Self {
        Self {
            handle,
            transferred: false,
            _not_send: PhantomData,
        }
    }

    fn into_inner(mut self) -> Arc<NativeHandle> {
        self.transferred = true;
        Arc::clone(&self.handle)
    }

    /// Release now instead of handing the handle to a scope.
    pub fn release(self) -> std::result::Result<bool, HostFault> {
        self.into_inner().release()
    }
}

impl Deref for OwnedHandle {
    type Target = NativeHandle;

    fn deref(&self) -> &NativeHandle {
        &self.handle
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.transferred || self.handle.is_released() {
            return;
        }
        warn!(handle = %self.handle.id(), "owned handle dropped without being adopted; releasing");
        if let Err(fault) = self.handle.release() {
            warn!(%fault, "release of dropped handle failed");
        }
    }
}

/// A handle borrowed from a [`HandleScope`].
#[derive(Clone)]
pub struct ObjectRef<'scope> {
    handle: Arc<NativeHandle>,
    _scope: PhantomData<&'scope HandleScope>,
}

impl<'scope> ObjectRef<'scope> {
    fn new(handle: Arc<NativeHandle>) -> Self {
        Self {
            handle,
            _scope: PhantomData,
        }
    }

    /// Release before the scope ends, e.g. inside a long loop over a
    /// collection. The scope skips it on exit.
    pub fn release_early(&self) -> std::result::Result<bool, HostFault> {
        self.handle.release()
    }
}

impl Deref for ObjectRef<'_> {
    type Target = NativeHandle;

    fn deref(&self) -> &NativeHandle {
        &self.handle
    }
}

impl std::fmt::Debug for ObjectRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ObjectRef").field(&self.handle.id()).finish()
    }
}

/// Outcome of releasing a scope's handles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisposeReport {
    /// Handles this dispose released.
    pub released: usize,
    /// Handles that had already been released early.
    pub already_released: usize,
    /// Release calls the host rejected. Logged, never propagated.
    pub failed: usize,
}

/// Tracks every handle acquired during one batch and releases them, children
/// before parents, when the scope ends.
///
/// The root handle is borrowed: the session owns it and the scope never
/// releases it.
pub struct HandleScope {
    root: Arc<NativeHandle>,
    handles: RefCell<Vec<Arc<NativeHandle>>>,
}

impl HandleScope {
    pub fn new(root: Arc<NativeHandle>) -> Self {
        Self {
            root,
            handles: RefCell::new(Vec::new()),
        }
    }

    /// The session's root object.
    pub fn root(&self) -> ObjectRef<'_> {
        ObjectRef::new(Arc::clone(&self.root))
    }

    /// Take ownership of a handle. It is released when the scope ends.
    pub fn adopt(&self, owned: OwnedHandle) -> ObjectRef<'_> {
        let handle = owned.into_inner();
        self.handles.borrow_mut().push(Arc::clone(&handle));
        ObjectRef::new(handle)
    }

    /// `parent.name`, registered with this scope.
    pub fn get(&self, parent: &NativeHandle, name: &str) -> Result<ObjectRef<'_>> {
        Ok(self.adopt(parent.get_object(name)?))
    }

    /// `collection.Item(key)`, registered with this scope.
    pub fn item(&self, collection: &NativeHandle, key: impl Into<Variant>) -> Result<ObjectRef<'_>> {
        Ok(self.adopt(collection.get_object_with("Item", &[key.into()])?))
    }

    /// `parent.name(args...)` returning an object, registered with this scope.
    pub fn call(&self, parent: &NativeHandle, name: &str, args: &[Variant]) -> Result<ObjectRef<'_>> {
        Ok(self.adopt(parent.call_object(name, args)?))
    }

    /// Number of handles registered so far, including released ones.
    pub fn len(&self) -> usize {
        self.handles.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release everything now and report what happened.
    pub fn dispose(self) -> DisposeReport {
        self.release_all()
    }

    /// Forget every handle without telling the host. Only for scopes whose
    /// host process is gone.
    pub(crate) fn abandon(self) -> usize {
        let handles = std::mem::take(&mut *self.handles.borrow_mut());
        for handle in &handles {
            handle.abandon();
        }
        handles.len()
    }

    fn release_all(&self) -> DisposeReport {
        let mut report = DisposeReport::default();
        let mut handles = self.handles.borrow_mut();
        while let Some(handle) = handles.pop() {
            match handle.release() {
                Ok(true) => report.released += 1,
                Ok(false) => report.already_released += 1,
                Err(fault) => {
                    report.failed += 1;
                    warn!(handle = %handle.id(), %fault, "handle release failed during scope cleanup");
                }
            }
        }
        if report.released + report.failed > 0 {
            debug!(
                released = report.released,
                already_released = report.already_released,
                failed = report.failed,
                "handle scope disposed"
            );
        }
        report
    }
}

impl Drop for HandleScope {
    fn drop(&mut self) {
        self.release_all();
    }
}
