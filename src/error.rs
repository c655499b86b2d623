use http::StatusCode;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("duplicate registration: {name} at {host}:{port} is already active")]
    DuplicateRegistration {
        name: String,
        host: String,
        port: u16,
    },

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("no available instance for service: {0}")]
    NoAvailableInstance(String),

    #[error("circuit open for service: {0}")]
    CircuitOpen(String),

    #[error("health probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("service {service} blocked on dependency {dependency}")]
    DependencyUnavailable { service: String, dependency: String },

    #[error("no route matched {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("upstream timeout after {0:?}")]
    UpstreamTimeout(Duration),

    /// Upstream answered with a non-success status.
    #[error("upstream error: status {0}")]
    Upstream(u16),

    #[error("upstream connect error: {0}")]
    UpstreamConnect(String),

    #[error("rate limit exceeded for route: {0}")]
    RateLimitExceeded(String),

    #[error("shutdown of {service} timed out after {timeout:?}")]
    ShutdownTimeout { service: String, timeout: Duration },

    #[error("config error: {0}")]
    Config(String),
}

impl GatewayError {
    /// HTTP status a gateway client sees for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoAvailableInstance(_)
            | GatewayError::CircuitOpen(_)
            | GatewayError::UnknownService(_)
            | GatewayError::DependencyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout(_) | GatewayError::ProbeTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::Upstream(status) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
            GatewayError::DuplicateRegistration { .. } => StatusCode::CONFLICT,
            GatewayError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::CircularDependency(_)
            | GatewayError::ShutdownTimeout { .. }
            | GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code used in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            GatewayError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            GatewayError::NoAvailableInstance(_)
            | GatewayError::CircuitOpen(_)
            | GatewayError::UnknownService(_)
            | GatewayError::DependencyUnavailable { .. } => "SERVICE_UNAVAILABLE",
            GatewayError::UpstreamTimeout(_) | GatewayError::ProbeTimeout(_) => "GATEWAY_TIMEOUT",
            GatewayError::Upstream(_) => "UPSTREAM_ERROR",
            GatewayError::UpstreamConnect(_) => "BAD_GATEWAY",
            GatewayError::DuplicateRegistration { .. } => "DUPLICATE_REGISTRATION",
            GatewayError::InstanceNotFound(_) => "NOT_FOUND",
            GatewayError::CircularDependency(_) => "CIRCULAR_DEPENDENCY",
            GatewayError::ShutdownTimeout { .. } => "SHUTDOWN_TIMEOUT",
            GatewayError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Client-facing text. Never carries addresses or upstream detail.
    pub fn public_message(&self) -> &'static str {
        match self.status_code() {
            StatusCode::NOT_FOUND => "not found",
            StatusCode::TOO_MANY_REQUESTS => "too many requests",
            StatusCode::SERVICE_UNAVAILABLE => "service unavailable",
            StatusCode::GATEWAY_TIMEOUT => "gateway timeout",
            StatusCode::BAD_GATEWAY => "bad gateway",
            StatusCode::CONFLICT => "conflict",
            _ => "internal server error",
        }
    }

    /// `{"error":{"code":...,"message":...}}`
    pub fn to_json_body(&self) -> String {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_duplicate_registration() {
        let err = GatewayError::DuplicateRegistration {
            name: "auth".into(),
            host: "10.0.0.1".into(),
            port: 8080,
        };
        assert_eq!(
            err.to_string(),
            "duplicate registration: auth at 10.0.0.1:8080 is already active"
        );
    }

    #[test]
    fn display_circular_dependency() {
        let err = GatewayError::CircularDependency(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "circular dependency: a -> b -> a");
    }

    #[test]
    fn display_dependency_unavailable() {
        let err = GatewayError::DependencyUnavailable {
            service: "pricing".into(),
            dependency: "auth".into(),
        };
        assert_eq!(err.to_string(), "service pricing blocked on dependency auth");
    }

    #[test]
    fn display_route_not_found() {
        let err = GatewayError::RouteNotFound {
            method: "GET".into(),
            path: "/nope".into(),
        };
        assert_eq!(err.to_string(), "no route matched GET /nope");
    }

    #[test]
    fn status_mapping_for_request_path_errors() {
        assert_eq!(
            GatewayError::CircuitOpen("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::NoAvailableInstance("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::UpstreamTimeout(Duration::from_secs(1)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::RateLimitExceeded("r".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::Upstream(418).status_code(),
            StatusCode::IM_A_TEAPOT
        );
        assert_eq!(
            GatewayError::UpstreamConnect("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn json_body_does_not_leak_detail() {
        let err = GatewayError::UpstreamConnect("connection refused to 10.1.2.3:9000".into());
        let body = err.to_json_body();
        assert!(!body.contains("10.1.2.3"));
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["error"]["code"], "BAD_GATEWAY");
        assert_eq!(v["error"]["message"], "bad gateway");
    }

    #[test]
    fn circuit_open_and_no_instance_share_public_code() {
        let a = GatewayError::CircuitOpen("pricing".into());
        let b = GatewayError::NoAvailableInstance("pricing".into());
        assert_eq!(a.code(), b.code());
        assert!(!a.to_json_body().contains("pricing"));
    }
}
