use crate::handle::Handle;
use thiserror::Error;

/// Fatal wire-level failures. Once one of these fires the byte stream's
/// framing can no longer be trusted, so the consuming dispatch loop aborts
/// instead of resynchronizing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The leading tag of a frame is not present in the command registry
    #[error("unknown command tag {tag}")]
    UnknownTag { tag: u64 },

    /// A read ran past the end of the frame body
    #[error("truncated frame while reading {what}: needed {needed} bytes, {remaining} left")]
    Truncated {
        what: &'static str,
        needed: usize,
        remaining: usize,
    },

    /// A field decoded to a value outside its domain
    #[error("malformed field {field}: {detail}")]
    MalformedField { field: &'static str, detail: String },

    /// A string field was not valid UTF-8
    #[error("invalid utf-8 in field {field}")]
    InvalidUtf8 { field: &'static str },

    /// Bytes were left over after the declared body was fully decoded
    #[error("frame for tag {tag} carried {trailing} undeclared trailing bytes")]
    TrailingBytes { tag: u64, trailing: usize },
}

impl ProtocolError {
    /// Create a malformed-field error
    pub fn malformed<D: Into<String>>(field: &'static str, detail: D) -> Self {
        Self::MalformedField {
            field,
            detail: detail.into(),
        }
    }
}

/// Handle table failures. Severity depends on the command: misordered
/// streams surface as `Undefined` and abort workers, while coordinator-side
/// mirror checks degrade to no-ops before ever constructing one of these.
#[derive(Debug, Error)]
pub enum HandleError {
    /// Lookup of a handle that is null, never bound, or already released
    #[error("undefined handle {handle}")]
    Undefined { handle: Handle },

    /// A construction command tried to bind a handle that is already live
    #[error("handle {handle} is already bound")]
    AlreadyBound { handle: Handle },

    /// The resolved object is not of the kind the command requires
    #[error("handle {handle} resolves to {actual}, expected {expected}")]
    KindMismatch {
        handle: Handle,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Unified error type for the beamline crate
#[derive(Debug, Error)]
pub enum BeamlineError {
    /// Wire-level protocol violations (fatal)
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Handle table failures
    #[error("handle failure: {0}")]
    Handle(#[from] HandleError),

    /// The type catalog has no constructor for the requested object
    #[error("unknown {kind} type '{name}'")]
    UnknownObjectType { kind: &'static str, name: String },

    /// A named extension module failed to load
    #[error("module '{name}' failed to load (code {code})")]
    ModuleLoad { name: String, code: i32 },

    /// Transport seam failure (broadcast, gather, or report path)
    #[error("fabric error during {operation}")]
    Fabric {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A worker dispatch loop terminated with an error
    #[error("worker {rank} failed: {message}")]
    Worker { rank: u32, message: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal errors
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl BeamlineError {
    /// Create a fabric error wrapping a transport-side failure
    pub fn fabric<E: Into<anyhow::Error>>(operation: &'static str, source: E) -> Self {
        Self::Fabric {
            operation,
            source: source.into(),
        }
    }

    /// Create a worker failure error
    pub fn worker<M: Into<String>>(rank: u32, message: M) -> Self {
        Self::Worker {
            rank,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<M: Into<String>>(message: M) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Fatal errors abort the owning process; everything else is reported
    /// and the caller decides
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(_) => true,
            Self::Handle(_) => true,
            Self::UnknownObjectType { .. } => true,
            Self::ModuleLoad { .. } => false,
            Self::Fabric { .. } => false,
            Self::Worker { .. } => true,
            Self::Configuration { .. } => false,
            Self::Internal { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::Handle(_) => "handle",
            Self::UnknownObjectType { .. } => "object_type",
            Self::ModuleLoad { .. } => "module",
            Self::Fabric { .. } => "fabric",
            Self::Worker { .. } => "worker",
            Self::Configuration { .. } => "configuration",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience. The error parameter defaults to the
/// crate-wide type but can name a narrower taxonomy at decode seams.
pub type Result<T, E = BeamlineError> = std::result::Result<T, E>;

impl From<serde_yaml::Error> for BeamlineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<std::io::Error> for BeamlineError {
    fn from(err: std::io::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BeamlineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal(format!("task join failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_fatal() {
        let err = BeamlineError::from(ProtocolError::UnknownTag { tag: 999 });
        assert!(err.is_fatal());
        assert_eq!(err.category(), "protocol");
    }

    #[test]
    fn module_load_is_best_effort() {
        let err = BeamlineError::ModuleLoad {
            name: "denoiser".into(),
            code: 2,
        };
        assert!(!err.is_fatal());
        assert_eq!(err.category(), "module");
    }

    #[test]
    fn undefined_handle_formats_with_value() {
        let err = HandleError::Undefined {
            handle: Handle::from_raw(42),
        };
        assert_eq!(err.to_string(), "undefined handle 42");
    }

    #[test]
    fn truncated_read_reports_counts() {
        let err = ProtocolError::Truncated {
            what: "u64",
            needed: 8,
            remaining: 3,
        };
        assert!(err.to_string().contains("needed 8"));
        assert!(err.to_string().contains("3 left"));
    }
}
