//! The structured error taxonomy of `spec.md` §3 and the recovery metadata of
//! §4.2.
//!
//! The teacher's own `Error` is a flat struct (`ErrorKind` + optional OS
//! code) built for a small, mostly-uniform error surface. That doesn't fit a
//! dozen-variant taxonomy with payload fields (`NotClaimed(device_id)`,
//! `EndpointNotFound(addr)`, `InvalidTimeout(ms)`, ...) as naturally as a
//! derived enum does, so this crate follows the
//! `chromiumos-platform2` pack repo's convention (`cronista`, `hiberman`,
//! `sirenia`, `libchromeos-rs`) of a `thiserror`-derived enum instead.

use thiserror::Error as ThisError;

/// Structured error taxonomy (`spec.md` §3).
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// Device is absent: disconnected, not responding, or not attached.
    #[error("device is not available")]
    NotAvailable,

    /// The device or interface is not claimed by this agent.
    #[error("device {0} is not claimed")]
    NotClaimed(String),

    /// No such endpoint on the opened interface.
    #[error("endpoint {0:#04x} not found")]
    EndpointNotFound(u8),

    /// A request argument was invalid.
    #[error("invalid parameters")]
    InvalidParameters,

    /// Timeout value was out of the allowed `(0, 60_000]` ms range.
    #[error("invalid timeout: {0}ms")]
    InvalidTimeout(u32),

    /// Control transfer submitted without (or with a malformed) 8-byte setup
    /// packet.
    #[error("invalid setup packet")]
    InvalidSetupPacket,

    /// Transfer type requested does not match the method used to submit it.
    #[error("transfer type unsupported: {0}")]
    TransferTypeUnsupported(String),

    /// Registry reported resource shortage, busy, or lock contention.
    #[error("too many requests")]
    TooManyRequests,

    /// The operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled, by the user or the system.
    #[error("operation was cancelled")]
    Cancelled,

    /// Transfer failed for a reason not covered by a more specific variant.
    #[error("transfer failed")]
    TransferFailed,

    /// A required registry property was absent or had an unexpected runtime
    /// type.
    #[error("missing property: {0}")]
    MissingProperty(String),

    /// Raw, unrecognized or uncategorized registry/kernel error.
    #[error("registry error {code:#x}: {message}")]
    RegistryError {
        /// Raw OS/kernel return code.
        code: u32,
        /// Human-readable description, if the registry provided one.
        message: String,
    },
}

impl Error {
    /// The raw OS error code, if this variant carries one.
    pub fn os_error(&self) -> Option<u32> {
        match self {
            Error::RegistryError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether a caller may reasonably retry the operation that produced
    /// this error (`spec.md` §7: "local recovery ... `TooManyRequests`,
    /// `Timeout` inside enumeration/handle-creation paths only"). Everything
    /// else in the taxonomy surfaces without retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TooManyRequests | Error::Timeout)
    }
}

/// Observability-only category tag (`spec.md` §4.2). Never affects behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryTag {
    /// Bad argument or unsupported.
    InvalidParameter,
    /// Memory/resource shortage, busy, wiring, lock contention.
    ResourceShortage,
    /// Not-open, not-permitted, exclusive access.
    AccessDenied,
    /// Timed out.
    Timeout,
    /// Device, endpoint, or configuration absent.
    NotFound,
    /// Device is busy servicing another request.
    DeviceBusy,
    /// Uncategorized registry/kernel-layer error.
    IoKitError,
    /// Fallback when no more specific category applies.
    UnknownError,
}

impl CategoryTag {
    /// Stable lowercase name, matching the strings named in `spec.md` §4.2.
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryTag::InvalidParameter => "invalid_parameter",
            CategoryTag::ResourceShortage => "resource_shortage",
            CategoryTag::AccessDenied => "access_denied",
            CategoryTag::Timeout => "timeout",
            CategoryTag::NotFound => "not_found",
            CategoryTag::DeviceBusy => "device_busy",
            CategoryTag::IoKitError => "iokit_error",
            CategoryTag::UnknownError => "unknown_error",
        }
    }
}

/// Recovery guidance attached to a mapped error (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecoveryHint {
    /// Whether a caller can reasonably retry this operation.
    pub recoverable: bool,
    /// Suggested initial backoff, in milliseconds, if recoverable.
    pub base_delay_ms: Option<u32>,
    /// Maximum number of retries this hint suggests.
    pub max_retries: u32,
    /// What, if anything, the user needs to do (e.g. "grant permission").
    pub user_action: Option<&'static str>,
    /// What, if anything, the system does automatically (e.g. "backing off").
    pub system_action: Option<&'static str>,
}

impl RecoveryHint {
    /// Not recoverable; no retries suggested.
    pub const fn unrecoverable() -> Self {
        Self {
            recoverable: false,
            base_delay_ms: None,
            max_retries: 0,
            user_action: None,
            system_action: None,
        }
    }

    /// Recoverable with the given base delay and retry budget.
    pub const fn retry(base_delay_ms: u32, max_retries: u32) -> Self {
        Self {
            recoverable: true,
            base_delay_ms: Some(base_delay_ms),
            max_retries,
            user_action: None,
            system_action: None,
        }
    }
}

/// Context passed to the mapper alongside a raw OS return code (`spec.md`
/// §4.2).
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Name of the operation being performed, e.g. `"open_interface"`.
    pub operation: &'static str,
    /// Device identity, if known.
    pub device_id: Option<String>,
    /// Endpoint address, if this was a transfer.
    pub endpoint: Option<u8>,
    /// Free-form extra context for logging.
    pub extras: Vec<(&'static str, String)>,
}

impl ErrorContext {
    /// A minimal context naming only the operation.
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            ..Default::default()
        }
    }

    /// Attach a device identity.
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Attach an endpoint address.
    pub fn with_endpoint(mut self, endpoint: u8) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Render the user-visible message prefix required by `spec.md` §7:
    /// operation, device identity if known, endpoint if known.
    pub fn describe(&self) -> String {
        let mut s = self.operation.to_string();
        if let Some(device_id) = &self.device_id {
            s.push_str(&format!(" device={device_id}"));
        }
        if let Some(endpoint) = self.endpoint {
            s.push_str(&format!(" endpoint={endpoint:#04x}"));
        }
        s
    }
}
