//! Defines fundamental types used throughout the twind codebase.

use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Enumerates all the errors that can be reported in twind. Code in
/// the stores, the reconcilers, or the client surfaces should try to
/// map their errors into one of these values. If no current value is
/// appropriate, a new one could be added but make sure the new error
/// value is generic enough that it may be useful elsewhere. For
/// instance, don't add an error value that is specific to one storage
/// backend. Add a more general value and use the associated
/// description string to explain the details.

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// Returned whenever a resource cannot be found.
    NotFound,

    /// An invalid value was provided.
    InvArgument(String),

    /// A type mismatch is preventing the operation from continuing.
    TypeError,

    /// A stored record disagrees with the type registered for its
    /// device. Reads never return such a value.
    CorruptState(String),

    /// An optimistic-concurrency write lost the race. The caller
    /// holds a stale `version`.
    VersionConflict,

    /// A safety rule refused the proposed change. The first field is
    /// the id of the refusing rule, the second is its reason.
    SafetyBlock(String, String),

    /// The infrastructure health gate is open; no commands are being
    /// emitted and writes may be rejected.
    InfraDown,

    /// There was a problem parsing a string. The associated string
    /// will describe how the parsing failed.
    ParseError(String),

    /// Reported when the peer of a communication channel has closed
    /// its handle.
    MissingPeer(String),

    /// An operation didn't complete in a timely fashion.
    TimeoutError,

    /// A general error returned by the backend storage. The string
    /// will have more information about the error.
    BackendError(String),

    /// A bad parameter was given in a configuration or a
    /// configuration was missing a required parameter.
    ConfigError(String),

    /// The requested operation couldn't complete. The description
    /// field will have more information for the user.
    OperationError(String),
}

impl Error {
    /// Maps the error onto the machine-readable code used by the
    /// problem-detail replies of the REST surface.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvArgument(_) | Error::TypeError => "VALIDATION_ERROR",
            Error::ParseError(_) => "PARSE_ERROR",
            Error::NotFound => "NOT_FOUND",
            Error::VersionConflict => "CONFLICT",
            Error::SafetyBlock(..) => "SAFETY_BLOCK",
            Error::InfraDown => "INFRASTRUCTURE_DOWN",
            Error::CorruptState(_)
            | Error::MissingPeer(_)
            | Error::TimeoutError
            | Error::BackendError(_)
            | Error::ConfigError(_)
            | Error::OperationError(_) => "INTERNAL_ERROR",
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "item not found"),
            Error::InvArgument(v) => write!(f, "{}", &v),
            Error::TypeError => write!(f, "incorrect type"),
            Error::CorruptState(v) => {
                write!(f, "corrupt state: {}", &v)
            }
            Error::VersionConflict => write!(f, "version conflict"),
            Error::SafetyBlock(rule, reason) => {
                write!(f, "blocked by rule {}: {}", &rule, &reason)
            }
            Error::InfraDown => write!(f, "infrastructure unavailable"),
            Error::ParseError(v) => write!(f, "parse error: {}", &v),
            Error::MissingPeer(v) => write!(f, "{} is missing peer", &v),
            Error::TimeoutError => write!(f, "timeout"),
            Error::BackendError(v) => write!(f, "backend error: {}", &v),
            Error::ConfigError(v) => write!(f, "config error: {}", &v),
            Error::OperationError(v) => {
                write!(f, "couldn't complete operation: {}", &v)
            }
        }
    }
}

// Defining these trait implementations allows any code that sends
// requests over an `mpsc` channel and expects the reply in a
// `oneshot` to easily translate the channel errors into a twind
// error.

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_error: mpsc::error::SendError<T>) -> Self {
        Error::MissingPeer(String::from("request channel is closed"))
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_error: oneshot::error::RecvError) -> Self {
        Error::MissingPeer(String::from("request dropped"))
    }
}

pub mod device;
pub mod overrides;
pub mod system;
pub mod twin;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::InvArgument("x".into()).error_code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(Error::TypeError.error_code(), "VALIDATION_ERROR");
        assert_eq!(Error::ParseError("x".into()).error_code(), "PARSE_ERROR");
        assert_eq!(Error::NotFound.error_code(), "NOT_FOUND");
        assert_eq!(Error::VersionConflict.error_code(), "CONFLICT");
        assert_eq!(
            Error::SafetyBlock("r".into(), "why".into()).error_code(),
            "SAFETY_BLOCK"
        );
        assert_eq!(Error::InfraDown.error_code(), "INFRASTRUCTURE_DOWN");
        assert_eq!(Error::TimeoutError.error_code(), "INTERNAL_ERROR");
        assert_eq!(
            Error::BackendError("x".into()).error_code(),
            "INTERNAL_ERROR"
        );
    }
}
