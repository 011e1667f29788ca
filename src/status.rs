//! Call outcomes: the wire-level [`Status`] trailer and the per-end [`CallStatus`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::RpcError;

/// Status codes carried by the trailing `Status` frame of every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Ok,
    Canceled,
    DeadlineExceeded,
    Internal,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Canceled => "CANCELED",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// Final status of a call as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

/// State of one call as observed by one end.
///
/// Starts as `Running` and moves to exactly one terminal value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    Running,
    Ok,
    Canceled,
    DeadlineExceeded,
    TransportError(String),
    Internal(String),
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::Running)
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, CallStatus::Running | CallStatus::Ok)
    }

    /// The error a caller observes for this status, `None` while running or on success.
    pub fn error(&self) -> Option<RpcError> {
        match self {
            CallStatus::Running | CallStatus::Ok => None,
            CallStatus::Canceled => Some(RpcError::Canceled),
            CallStatus::DeadlineExceeded => Some(RpcError::DeadlineExceeded),
            CallStatus::TransportError(message) => Some(RpcError::TransportError(message.clone())),
            CallStatus::Internal(message) => Some(RpcError::InternalError(message.clone())),
        }
    }

    pub(crate) fn from_cancel(code: Code) -> Self {
        match code {
            Code::DeadlineExceeded => CallStatus::DeadlineExceeded,
            _ => CallStatus::Canceled,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Running => f.write_str("running"),
            CallStatus::Ok => f.write_str("ok"),
            CallStatus::Canceled => f.write_str("canceled"),
            CallStatus::DeadlineExceeded => f.write_str("deadline exceeded"),
            CallStatus::TransportError(message) => write!(f, "transport error: {message}"),
            CallStatus::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl From<Status> for CallStatus {
    fn from(status: Status) -> Self {
        match status.code {
            Code::Ok => CallStatus::Ok,
            Code::Canceled => CallStatus::Canceled,
            Code::DeadlineExceeded => CallStatus::DeadlineExceeded,
            Code::Internal => CallStatus::Internal(status.message),
        }
    }
}

impl From<&CallStatus> for Status {
    fn from(status: &CallStatus) -> Self {
        match status {
            CallStatus::Ok => Status::ok(),
            CallStatus::Canceled => Status::new(Code::Canceled, "call canceled by client"),
            CallStatus::DeadlineExceeded => Status::new(Code::DeadlineExceeded, "deadline exceeded"),
            CallStatus::TransportError(message) | CallStatus::Internal(message) => {
                Status::new(Code::Internal, message.clone())
            }
            CallStatus::Running => Status::new(Code::Internal, "call finished while still running"),
        }
    }
}

impl From<&RpcError> for CallStatus {
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::Canceled => CallStatus::Canceled,
            RpcError::DeadlineExceeded => CallStatus::DeadlineExceeded,
            RpcError::TransportError(_) | RpcError::ConnectionError(_) | RpcError::IoError(_) => {
                CallStatus::TransportError(err.to_string())
            }
            RpcError::InternalError(message) => CallStatus::Internal(message.clone()),
            other => CallStatus::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_status_round_trips_into_call_status() {
        assert_eq!(CallStatus::from(Status::ok()), CallStatus::Ok);
        assert_eq!(
            CallStatus::from(Status::new(Code::DeadlineExceeded, "late")),
            CallStatus::DeadlineExceeded
        );
        assert_eq!(
            CallStatus::from(Status::new(Code::Internal, "boom")),
            CallStatus::Internal("boom".to_string())
        );
    }

    #[test]
    fn transport_failures_are_reported_as_internal_on_the_wire() {
        let status = Status::from(&CallStatus::TransportError("reset".into()));
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "reset");
    }

    #[test]
    fn canceled_and_deadline_errors_stay_distinct() {
        let canceled = CallStatus::Canceled.error().unwrap();
        let expired = CallStatus::DeadlineExceeded.error().unwrap();
        assert_eq!(canceled.status_code(), Some(Code::Canceled));
        assert_eq!(expired.status_code(), Some(Code::DeadlineExceeded));
        assert!(CallStatus::Ok.error().is_none());
        assert!(!CallStatus::Running.is_terminal());
        assert!(!CallStatus::Ok.is_failure());
    }

    #[test]
    fn cancel_reason_maps_back_to_status() {
        assert_eq!(CallStatus::from_cancel(Code::DeadlineExceeded), CallStatus::DeadlineExceeded);
        assert_eq!(CallStatus::from_cancel(Code::Canceled), CallStatus::Canceled);
    }

    #[test]
    fn status_display_uses_wire_code_names() {
        let status = Status::new(Code::DeadlineExceeded, "deadline exceeded");
        assert_eq!(status.to_string(), "DEADLINE_EXCEEDED: deadline exceeded");
    }
}
