use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayErrorKind {
    Authentication,
    Authorization,
    Validation,
    Security,
    Pool,
    Execution,
    Internal,
}

/// Severity attached to security violations; `Critical` is reserved for
/// requests that name an operation the policy table does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Audit-only payload. Never folded into the caller-visible message:
    /// it may carry the offending argument or the missing permission set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub retryable: bool,
}

impl GatewayError {
    pub fn new(
        kind: GatewayErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            severity: None,
            hint: None,
            details: None,
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(
            GatewayErrorKind::Authentication,
            "AUTHENTICATION_FAILED",
            message,
        )
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(
            GatewayErrorKind::Authorization,
            "AUTHORIZATION_DENIED",
            message,
        )
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Authorization, "RATE_LIMITED", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Validation, "VALIDATION_FAILED", message)
    }

    pub fn security(severity: Severity, message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Security, "SECURITY_VIOLATION", message)
            .with_severity(severity)
    }

    pub fn unknown_operation(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Security, "UNKNOWN_OPERATION", message)
            .with_severity(Severity::Critical)
    }

    pub fn pool(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Pool, code, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Pool, "CONNECTION_FAILED", message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Execution, "EXECUTION_FAILED", message)
    }

    pub fn execution_timeout(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Execution, "EXECUTION_TIMEOUT", message)
    }

    pub fn acquire_timeout(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Pool, "ACQUIRE_TIMEOUT", message).retryable()
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Internal, "INTERNAL", message)
    }

    /// True when the request must never be retried by the orchestrator:
    /// every security-boundary rejection is terminal for the request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            GatewayErrorKind::Authentication
                | GatewayErrorKind::Authorization
                | GatewayErrorKind::Validation
                | GatewayErrorKind::Security
        )
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for GatewayError {}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::internal(err.to_string())
    }
}
