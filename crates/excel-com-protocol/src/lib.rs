//! Shared protocol types for the Excel automation stack.
//!
//! Two wire protocols live here, both newline-delimited JSON (one object per
//! line in each direction):
//!
//! - [`bridge`]: the native client talking to the bridge process that owns
//!   the COM object graph. Objects are addressed by numeric [`ObjectId`]s
//!   that the bridge hands out and the client releases.
//! - [`status`]: the local status channel an external monitor uses to list
//!   and close sessions, or stop the engine, without going through command
//!   dispatch.

pub mod bridge;
pub mod status;
mod variant;

pub use variant::{ErrorValue, ObjectId, Variant};
