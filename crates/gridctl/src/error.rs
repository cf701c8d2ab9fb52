use serde::Serialize;

/// One error kind per spec'd failure mode, never a transport-specific type.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("canceled")]
    Canceled,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("upstream error {code}: {message}")]
    Upstream { code: i64, message: String },

    #[error("downstream not ready: {0}")]
    NotReady(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl GatewayError {
    /// Stable string code, used both in JSON-RPC error data and in `/api/*` bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Canceled => "canceled",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Transport(_) => "transport",
            GatewayError::Protocol(_) => "protocol",
            GatewayError::UnknownServer(_) => "unknown_server",
            GatewayError::UnknownTool(_) => "unknown_tool",
            GatewayError::PermissionDenied(_) => "permission_denied",
            GatewayError::Validation(_) => "validation",
            GatewayError::Upstream { .. } => "upstream",
            GatewayError::NotReady(_) => "not_ready",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::Fatal(_) => "fatal",
        }
    }

    /// JSON-RPC 2.0 error code. Upstream errors preserve the downstream's own code
    /// when it falls outside the reserved range; everything else gets a server-error
    /// code in the -32000..-32099 band.
    pub fn rpc_code(&self) -> i64 {
        match self {
            GatewayError::Canceled => -32800,
            GatewayError::Timeout(_) => -32801,
            GatewayError::Transport(_) => -32001,
            GatewayError::Protocol(_) => -32700,
            GatewayError::UnknownServer(_) => -32002,
            GatewayError::UnknownTool(_) => -32601,
            GatewayError::PermissionDenied(_) => -32003,
            GatewayError::Validation(_) => -32602,
            GatewayError::Upstream { code, .. } => *code,
            GatewayError::NotReady(_) => -32004,
            GatewayError::Conflict(_) => -32005,
            GatewayError::Fatal(_) => -32006,
        }
    }

    /// Whether a single reinitialize-and-retry attempt is appropriate per spec §7.
    pub fn is_retryable_once(&self) -> bool {
        matches!(self, GatewayError::Transport(_) | GatewayError::Protocol(_))
    }

    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::PermissionDenied(_) => 403,
            GatewayError::UnknownServer(_) | GatewayError::UnknownTool(_) => 404,
            GatewayError::Validation(_) => 400,
            GatewayError::Conflict(_) => 409,
            GatewayError::NotReady(_) => 503,
            GatewayError::Timeout(_) => 504,
            GatewayError::Canceled => 499,
            GatewayError::Fatal(_) => 500,
            GatewayError::Transport(_) | GatewayError::Protocol(_) | GatewayError::Upstream { .. } => 502,
        }
    }
}

/// Body shape for `/api/*` error responses; also embedded in JSON-RPC `error.data`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl From<&GatewayError> for ErrorBody {
    fn from(e: &GatewayError) -> Self {
        ErrorBody {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
