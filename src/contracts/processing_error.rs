/// Result classification for business processing of a message.
///
/// The variant decides where the message goes next:
/// - `Transient`: temporary failure, released again after the retry delay
///   (network issues, rate limits, a dependency that is restarting)
/// - `Permanent`: the message can never succeed and goes to the DLQ
///   (invalid schema, unsupported version, validation failure)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    #[error("Transient error: {reason}")]
    Transient { reason: String },

    #[error("Permanent error: {reason}")]
    Permanent { reason: String },
}

impl ProcessingError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient { reason } | Self::Permanent { reason } => reason,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
        }
    }
}

/// A payload that does not parse will not parse on redelivery either.
impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(format!("Invalid JSON payload: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_error() {
        let err = ProcessingError::transient("Network timeout");
        assert!(err.is_transient());
        assert_eq!(err.reason(), "Network timeout");
        assert_eq!(err.error_type(), "transient");
        assert_eq!(err.to_string(), "Transient error: Network timeout");
    }

    #[test]
    fn test_json_error_is_permanent() {
        let err: ProcessingError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(!err.is_transient());
        assert!(err.reason().starts_with("Invalid JSON payload"));
    }
}
