//! Session and batch execution engine for automating a long-lived Excel
//! process.
//!
//! The engine keeps one host process per open workbook, serializes access to
//! it, releases every object handle a batch acquires, enforces deadlines
//! against a host that may hang on a modal dialog, retries a narrow set of
//! transient cross-process faults, and exposes session state to an
//! out-of-process monitor without stalling running work.
//!
//! # Architecture
//!
//! ```text
//! command ──► SessionManager ──► Session (one host process, one workbook)
//!                 │                  ▲
//!                 ▼                  │ execution lock, HandleScope
//!            BatchExecutor ──► ResiliencePipeline ──► work(&BatchContext)
//!
//! monitor ──► StatusServer ──► SessionManager::list_active (lock-free)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use excel_com_session::{BridgeLauncher, EngineConfig, SessionManager};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = SessionManager::new(Arc::new(BridgeLauncher::default()), EngineConfig::default());
//!     let session = manager.get_or_create("/data/report.xlsx")?;
//!     let sheets = manager.executor().execute(&session, Duration::from_secs(30), |ctx| {
//!         let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
//!         sheets.get("Count")
//!     })?;
//!     println!("{sheets} worksheets");
//!     manager.close(session.id().as_str(), true)?;
//!     Ok(())
//! }
//! ```

mod bridge;
mod config;
mod deadline;
mod error;
mod executor;
mod handle;
mod host;
mod manager;
mod resilience;
mod session;
pub mod status;
pub mod testing;
mod watchdog;

pub use bridge::{linux_to_wine_path, BridgeConfig, BridgeHost, BridgeLauncher};
pub use config::{ClosePolicy, EngineConfig, StatusConfig};
pub use error::{classify, EngineError, HostFault, Result, TransientCode};
pub use excel_com_protocol::{ObjectId, Variant};
pub use executor::{BatchContext, BatchExecutor, CancellationToken};
pub use handle::{DisposeReport, HandleScope, NativeHandle, ObjectRef, OwnedHandle};
pub use host::{Host, HostLauncher, LaunchRequest};
pub use manager::{SessionManager, SessionRequest};
pub use resilience::{ResiliencePipeline, RetryPolicy};
pub use session::{FileIdentity, Session, SessionId, SessionInfo, SessionState};
