use serde_json::Value;
use thiserror::Error;

/// An error that happens when fetching a resource through a transport.
///
/// These are the only errors that are surfaced to callers. Failures of the caching layer
/// itself (storage, serialization, ledger) are recovered locally and only logged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// The remote answered with a status outside of the 2xx/3xx range.
    ///
    /// `data` holds the response body, parsed as JSON if possible.
    #[error("request failed with status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        data: Option<Value>,
    },
    /// The request never produced a response, e.g. because of connection loss or DNS
    /// resolution failures.
    #[error("transport failed: {0}")]
    Transport(String),
    /// The response was received but its body could not be parsed as requested.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The coordinated computation went away before producing a result.
    ///
    /// This happens when the task driving the transport call panics or the runtime shuts down.
    #[error("request interrupted")]
    Interrupted,
}

impl FetchError {
    /// The HTTP status recorded for this error, `0` if no response was received.
    pub fn status(&self) -> u16 {
        match self {
            Self::Status { status, .. } => *status,
            _ => 0,
        }
    }

    /// A human readable message, as persisted in `errorMessage`.
    pub fn message(&self) -> String {
        match self {
            Self::Status { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Additional error data, as persisted in `errorData`.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Status { data, .. } => data.as_ref(),
            _ => None,
        }
    }

    /// Whether this is a "not found" answer from the remote.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_accessors() {
        let err = FetchError::Status {
            status: 404,
            message: "Not Found".into(),
            data: Some(serde_json::json!({"error": "no such list"})),
        };
        assert_eq!(err.status(), 404);
        assert_eq!(err.message(), "Not Found");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "request failed with status 404: Not Found");

        let err = FetchError::Transport("connection reset".into());
        assert_eq!(err.status(), 0);
        assert_eq!(err.message(), "transport failed: connection reset");
        assert!(err.data().is_none());
        assert!(!err.is_not_found());
    }
}
