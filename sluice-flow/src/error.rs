//! Flow control error types.

/// Flow control error type.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Invalid configuration, detected when a controller is built.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    /// Rate limit exceeded and the controller is configured to reject.
    #[error("too many requests for {context}: limit {limit} per period, resets at {reset_at_ms}ms")]
    TooManyRequests {
        /// Description of the requests the limit applies to.
        context: String,
        /// Requests allowed per period.
        limit: u64,
        /// Start of the next period, epoch milliseconds.
        reset_at_ms: u64,
    },

    /// A blocked wait was cancelled because its blocker was closed.
    #[error("wait interrupted: blocker closed")]
    Interrupted,

    /// Configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be parsed.
    #[error("failed to parse configuration: {message}")]
    Parse {
        /// Parser message.
        message: String,
    },
}

impl FlowError {
    /// Shorthand for an `InvalidConfig` error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// HTTP status code a dispatcher should answer with.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::TooManyRequests { .. } => 429,
            Self::Interrupted => 503,
            Self::InvalidConfig { .. } | Self::Io { .. } | Self::Parse { .. } => 500,
        }
    }
}

impl From<sluice_core::Error> for FlowError {
    fn from(err: sluice_core::Error) -> Self {
        Self::InvalidConfig {
            message: err.to_string(),
        }
    }
}

/// Result type for flow control operations.
pub type FlowResult<T> = Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = FlowError::TooManyRequests {
            context: "wms.getmap".to_string(),
            limit: 10,
            reset_at_ms: 60_000,
        };
        assert_eq!(err.status_code(), 429);
        assert_eq!(FlowError::Interrupted.status_code(), 503);
        assert_eq!(FlowError::invalid_config("bad").status_code(), 500);
    }

    #[test]
    fn test_core_error_conversion() {
        let err: FlowError = sluice_core::Error::InvalidArgument {
            name: "capacity",
            reason: "must be positive",
        }
        .into();
        assert!(matches!(
            err,
            FlowError::InvalidConfig { ref message } if message.contains("capacity")
        ));
    }
}
