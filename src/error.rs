use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    UnknownService(String),
    CircuitOpen(String),
    UpstreamStatus(u16),
    UpstreamTimeout,
    UpstreamConnect(String),
    BodyTooLarge,
    Config(String),
    Internal(String),
}

impl GatewayError {
    /// True for causes that count as a failed call against a breaker.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamStatus(_)
                | GatewayError::UpstreamTimeout
                | GatewayError::UpstreamConnect(_)
        )
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::UnknownService(id) => write!(f, "unknown service: {}", id),
            GatewayError::CircuitOpen(id) => write!(f, "circuit open for service: {}", id),
            GatewayError::UpstreamStatus(status) => write!(f, "upstream returned {}", status),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::BodyTooLarge => write!(f, "request body too large"),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_unknown_service() {
        assert_eq!(
            GatewayError::UnknownService("billing".to_string()).to_string(),
            "unknown service: billing"
        );
    }

    #[test]
    fn display_circuit_open() {
        assert_eq!(
            GatewayError::CircuitOpen("user-service".to_string()).to_string(),
            "circuit open for service: user-service"
        );
    }

    #[test]
    fn display_upstream_status() {
        assert_eq!(
            GatewayError::UpstreamStatus(503).to_string(),
            "upstream returned 503"
        );
    }

    #[test]
    fn display_upstream_timeout() {
        assert_eq!(GatewayError::UpstreamTimeout.to_string(), "upstream timeout");
    }

    #[test]
    fn display_upstream_connect() {
        assert_eq!(
            GatewayError::UpstreamConnect("conn refused".to_string()).to_string(),
            "upstream connect error: conn refused"
        );
    }

    #[test]
    fn display_config() {
        assert_eq!(
            GatewayError::Config("bad toml".to_string()).to_string(),
            "config error: bad toml"
        );
    }

    #[test]
    fn backend_failures_are_classified() {
        assert!(GatewayError::UpstreamStatus(500).is_backend_failure());
        assert!(GatewayError::UpstreamTimeout.is_backend_failure());
        assert!(GatewayError::UpstreamConnect("x".into()).is_backend_failure());
        assert!(!GatewayError::UnknownService("x".into()).is_backend_failure());
        assert!(!GatewayError::CircuitOpen("x".into()).is_backend_failure());
        assert!(!GatewayError::BodyTooLarge.is_backend_failure());
    }
}
