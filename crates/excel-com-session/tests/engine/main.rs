//! End-to-end tests for the session engine against the in-memory host:
//! batches, close policies, the watchdog and the status channel.

mod batches;
mod common;
mod lifecycle;
#[cfg(unix)]
mod status_channel;
mod watchdog;

pub use common::*;
