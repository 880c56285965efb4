//! The boundary to the external automation host.
//!
//! Everything late-bound goes through [`Host`]: property reads and writes and
//! method calls by name against an [`ObjectId`], each returning a `Result`.
//! Keeping the untyped surface to this one trait means there is exactly one
//! place where foreign failures are turned into [`HostFault`]s.

use std::path::PathBuf;
use std::sync::Arc;

use excel_com_protocol::{ObjectId, Variant};

use crate::error::{HostFault, Result};
use crate::session::FileIdentity;

/// A live connection to one host process.
///
/// Implementations must be callable from any thread. Calls may block for as
/// long as the host takes to answer; callers that need a deadline run them
/// on a worker thread.
pub trait Host: Send + Sync {
    /// The workbook object the session was opened on.
    fn root(&self) -> ObjectId;

    /// OS process id of the host, when known.
    fn pid(&self) -> Option<u32> {
        None
    }

    fn get_property(
        &self,
        target: ObjectId,
        name: &str,
        args: &[Variant],
    ) -> std::result::Result<Variant, HostFault>;

    fn set_property(
        &self,
        target: ObjectId,
        name: &str,
        value: Variant,
    ) -> std::result::Result<(), HostFault>;

    fn invoke(
        &self,
        target: ObjectId,
        name: &str,
        args: &[Variant],
    ) -> std::result::Result<Variant, HostFault>;

    /// Drop the host's reference to `handle`. Called at most once per handle
    /// by the engine.
    fn release(&self, handle: ObjectId) -> std::result::Result<(), HostFault>;

    /// Prove the host is still servicing calls.
    fn ping(&self) -> std::result::Result<(), HostFault>;

    /// Persist the root workbook, optionally under a new path.
    fn save(&self, path: Option<&str>) -> std::result::Result<(), HostFault>;

    fn set_visible(&self, visible: bool) -> std::result::Result<(), HostFault>;

    /// Ask the host to close the workbook and exit.
    fn quit(&self) -> std::result::Result<(), HostFault>;

    /// Kill the host process. Must not block on the host.
    fn terminate(&self);
}

/// What to open when launching a host.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub file: FileIdentity,
    pub visible: bool,
}

impl LaunchRequest {
    pub fn path(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }
}

/// Starts host processes for the session manager.
pub trait HostLauncher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<Arc<dyn Host>>;
}
