//! Error taxonomy for the session engine.
//!
//! Every failure a caller can see is one [`EngineError`] variant. Raw COM
//! error codes never form the primary message: they ride along as a
//! [`HostFault`] detail, and [`classify`] maps them onto the taxonomy.

use std::time::Duration;

use thiserror::Error;

/// `DISP_E_MEMBERNOTFOUND`
const DISP_E_MEMBERNOTFOUND: u32 = 0x8002_0003;
/// `DISP_E_UNKNOWNNAME`
const DISP_E_UNKNOWNNAME: u32 = 0x8002_0006;
/// `DISP_E_BADINDEX`: collection `Item` lookup with a missing key.
const DISP_E_BADINDEX: u32 = 0x8002_000B;
/// `TYPE_E_ELEMENTNOTFOUND`
const TYPE_E_ELEMENTNOTFOUND: u32 = 0x8002_802B;

/// The fixed set of cross-process faults that are safe to retry.
///
/// Keep this list narrow: anything added here gets retried, and a retried
/// non-idempotent call runs its side effects twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientCode {
    /// `RPC_E_CALL_REJECTED`: the host's message filter rejected the call,
    /// typically because Excel is in edit mode or showing a dialog.
    CallRejected,
    /// `RPC_E_SERVERCALL_RETRYLATER`: the host asked us to retry.
    RetryLater,
    /// `VBA_E_IGNORE`: Excel is busy and ignored the automation call.
    ApplicationBusy,
}

impl TransientCode {
    pub const fn hresult(self) -> u32 {
        match self {
            TransientCode::CallRejected => 0x8001_0001,
            TransientCode::RetryLater => 0x8001_010A,
            TransientCode::ApplicationBusy => 0x800A_C472,
        }
    }

    pub fn from_hresult(hresult: i32) -> Option<Self> {
        [
            TransientCode::CallRejected,
            TransientCode::RetryLater,
            TransientCode::ApplicationBusy,
        ]
        .into_iter()
        .find(|code| code.hresult() == hresult as u32)
    }
}

impl std::fmt::Display for TransientCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransientCode::CallRejected => "call rejected by host",
            TransientCode::RetryLater => "host asked to retry later",
            TransientCode::ApplicationBusy => "application busy",
        };
        f.write_str(name)
    }
}

/// A failure reported by the host for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFault {
    /// The call that failed, e.g. `Invoke(Item) on #12`.
    pub operation: String,
    /// Host-provided description.
    pub message: String,
    /// Raw HRESULT, when the failure came from a COM call.
    pub hresult: Option<i32>,
}

impl HostFault {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            hresult: None,
        }
    }

    pub fn with_hresult(mut self, hresult: i32) -> Self {
        self.hresult = Some(hresult);
        self
    }
}

impl std::fmt::Display for HostFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)?;
        if let Some(hresult) = self.hresult {
            write!(f, " (HRESULT 0x{:08X})", hresult as u32)?;
        }
        Ok(())
    }
}

/// Errors surfaced by the session engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A named object was absent. Never retried.
    #[error("not found: {what}")]
    ResourceNotFound {
        what: String,
        fault: Option<HostFault>,
    },

    /// The session cannot accept this request in its current state.
    #[error("session '{session}' {reason}")]
    InvalidState { session: String, reason: String },

    /// A recognized transient cross-process fault. Retried by the pipeline.
    #[error("{code} during {}", .fault.operation)]
    Transient { code: TransientCode, fault: HostFault },

    /// The retry budget ran out; `last` is the final transient failure.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<EngineError>,
    },

    /// The batch did not finish before its deadline. The host call may still
    /// be running; the session is now suspect.
    #[error("batch on session '{session}' timed out after {elapsed:?}")]
    TimedOut { session: String, elapsed: Duration },

    /// The host process could not be started. No session was registered.
    #[error("failed to launch host for '{file}': {reason}")]
    HostLaunchFailed { file: String, reason: String },

    /// Close was refused because operations are still in flight.
    #[error("session '{session}' is busy with {active} active operation(s)")]
    Busy { session: String, active: usize },

    /// Anything unclassified. Surfaced verbatim, never retried.
    #[error("{message}")]
    Fatal {
        message: String,
        fault: Option<HostFault>,
    },
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::ResourceNotFound {
            what: what.into(),
            fault: None,
        }
    }

    pub fn invalid_state(session: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidState {
            session: session.into(),
            reason: reason.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        EngineError::Fatal {
            message: message.into(),
            fault: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient { .. })
    }

    /// The host fault behind this error, if it came from a host call.
    pub fn fault(&self) -> Option<&HostFault> {
        match self {
            EngineError::ResourceNotFound { fault, .. } | EngineError::Fatal { fault, .. } => {
                fault.as_ref()
            }
            EngineError::Transient { fault, .. } => Some(fault),
            EngineError::RetriesExhausted { last, .. } => last.fault(),
            _ => None,
        }
    }

    /// Raw HRESULT attached to this error, for diagnostics only.
    pub fn hresult(&self) -> Option<i32> {
        self.fault().and_then(|f| f.hresult)
    }
}

/// Map a host fault onto the taxonomy.
pub fn classify(fault: HostFault) -> EngineError {
    let Some(hresult) = fault.hresult else {
        return fatal_fault(fault);
    };

    if let Some(code) = TransientCode::from_hresult(hresult) {
        return EngineError::Transient { code, fault };
    }

    match hresult as u32 {
        DISP_E_MEMBERNOTFOUND | DISP_E_UNKNOWNNAME | DISP_E_BADINDEX | TYPE_E_ELEMENTNOTFOUND => {
            EngineError::ResourceNotFound {
                what: fault.operation.clone(),
                fault: Some(fault),
            }
        }
        _ => fatal_fault(fault),
    }
}

/// The raw code stays in `fault`; the message is the same with or without one.
fn fatal_fault(fault: HostFault) -> EngineError {
    EngineError::Fatal {
        message: format!("{}: {}", fault.operation, fault.message),
        fault: Some(fault),
    }
}

impl From<HostFault> for EngineError {
    fn from(fault: HostFault) -> Self {
        classify(fault)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
