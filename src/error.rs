//! Error kinds shared by the ingestion pipeline.

use core::fmt;

/// Coarse classification used for log labels and retry decisions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NetworkFailure,
    UpstreamError,
    MalformedPayload,
    InvalidTimestamp,
    StorageFailure,
    ConfigurationError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::MalformedPayload => "malformed_payload",
            ErrorKind::InvalidTimestamp => "invalid_timestamp",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::ConfigurationError => "configuration_error",
        }
    }

    /// Whether the failure ends the current poll cycle (as opposed to a single sensor).
    pub fn is_cycle_level(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkFailure | ErrorKind::UpstreamError | ErrorKind::StorageFailure
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum IngestError {
    /// Transport-level failure or timeout talking to the sensor API.
    NetworkFailure(String),
    /// Non-success HTTP status, or an API envelope reporting failure.
    UpstreamError { status: u16, message: String },
    /// Body or device entry that could not be decoded. `sensor_id` is `None` for the whole response.
    MalformedPayload { sensor_id: Option<String>, detail: String },
    InvalidTimestamp { sensor_id: String, raw: String },
    StorageFailure(String),
    ConfigurationError(String),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::NetworkFailure(_) => ErrorKind::NetworkFailure,
            IngestError::UpstreamError { .. } => ErrorKind::UpstreamError,
            IngestError::MalformedPayload { .. } => ErrorKind::MalformedPayload,
            IngestError::InvalidTimestamp { .. } => ErrorKind::InvalidTimestamp,
            IngestError::StorageFailure(_) => ErrorKind::StorageFailure,
            IngestError::ConfigurationError(_) => ErrorKind::ConfigurationError,
        }
    }

    pub fn sensor_id(&self) -> Option<&str> {
        match self {
            IngestError::MalformedPayload { sensor_id, .. } => sensor_id.as_deref(),
            IngestError::InvalidTimestamp { sensor_id, .. } => Some(sensor_id),
            _ => None,
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::NetworkFailure(s) => write!(f, "network failure: {}", s),
            IngestError::UpstreamError { status, message } => write!(f, "upstream error (http {}): {}", status, message),
            IngestError::MalformedPayload {
                sensor_id: Some(id),
                detail,
            } => write!(f, "malformed payload for sensor {}: {}", id, detail),
            IngestError::MalformedPayload { sensor_id: None, detail } => write!(f, "malformed payload: {}", detail),
            IngestError::InvalidTimestamp { sensor_id, raw } => {
                write!(f, "invalid timestamp for sensor {}: {}", sensor_id, raw)
            }
            IngestError::StorageFailure(s) => write!(f, "storage failure: {}", s),
            IngestError::ConfigurationError(s) => write!(f, "configuration error: {}", s),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<diesel::result::Error> for IngestError {
    fn from(value: diesel::result::Error) -> Self {
        IngestError::StorageFailure(value.to_string())
    }
}

impl From<diesel::ConnectionError> for IngestError {
    fn from(value: diesel::ConnectionError) -> Self {
        IngestError::StorageFailure(format!("connection failed: {}", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_labels() {
        let err = IngestError::InvalidTimestamp {
            sensor_id: "0123456789AB".into(),
            raw: "\"yesterday\"".into(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidTimestamp);
        assert_eq!(err.sensor_id(), Some("0123456789AB"));
        assert!(!err.kind().is_cycle_level());
        assert_eq!(
            err.to_string(),
            "invalid timestamp for sensor 0123456789AB: \"yesterday\""
        );

        let err = IngestError::UpstreamError {
            status: 503,
            message: "maintenance".into(),
        };
        assert!(err.kind().is_cycle_level());
        assert_eq!(err.kind().as_str(), "upstream_error");
    }

    #[test]
    fn diesel_errors_map_to_storage_failure() {
        let err: IngestError = diesel::result::Error::RollbackTransaction.into();
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
    }
}
