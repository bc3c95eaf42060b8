use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Failure reported by one of the three upstream services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// Socket closed, unreachable, or handshake refused.
    #[error("{service} transport error: {message}")]
    Transport { service: Service, message: String },

    /// Upstream sent something we could not understand.
    #[error("{service} protocol error: {message}")]
    Protocol { service: Service, message: String },

    /// Upstream refused the request for quota reasons.
    #[error("{service} rate limited: {message}")]
    RateLimited { service: Service, message: String },

    #[error("{service} timed out after {secs}s")]
    Timeout { service: Service, secs: u64 },

    /// Generation finished without any usable spoken text.
    #[error("{service} produced no usable output")]
    EmptyResult { service: Service },
}

impl UpstreamError {
    pub fn transport(service: Service, message: impl Into<String>) -> Self {
        Self::Transport {
            service,
            message: message.into(),
        }
    }

    pub fn protocol(service: Service, message: impl Into<String>) -> Self {
        Self::Protocol {
            service,
            message: message.into(),
        }
    }

    pub fn rate_limited(service: Service, message: impl Into<String>) -> Self {
        Self::RateLimited {
            service,
            message: message.into(),
        }
    }

    pub fn service(&self) -> Service {
        match self {
            Self::Transport { service, .. }
            | Self::Protocol { service, .. }
            | Self::RateLimited { service, .. }
            | Self::Timeout { service, .. }
            | Self::EmptyResult { service } => *service,
        }
    }

    /// Whether a connection attempt that failed this way may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Protocol { .. } => "protocol",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::EmptyResult { .. } => "empty_result",
        }
    }
}

/// The upstream a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Recognition,
    Generation,
    Synthesis,
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Recognition => "Recognition",
            Self::Generation => "Generation",
            Self::Synthesis => "Synthesis",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(UpstreamError::transport(Service::Synthesis, "refused").is_retryable());
        assert!(UpstreamError::Timeout {
            service: Service::Synthesis,
            secs: 10
        }
        .is_retryable());
        assert!(!UpstreamError::rate_limited(Service::Synthesis, "429").is_retryable());
        assert!(!UpstreamError::protocol(Service::Synthesis, "bad json").is_retryable());
    }

    #[test]
    fn test_display_names_service() {
        let err = UpstreamError::transport(Service::Recognition, "connection reset");
        assert_eq!(err.to_string(), "Recognition transport error: connection reset");
        assert_eq!(err.service(), Service::Recognition);
        assert_eq!(err.kind(), "transport");
    }
}
