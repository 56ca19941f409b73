use serde::{Deserialize, Serialize};

/// Status code attached to every RPC response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcStatus {
    Ok,
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    NotFound,
    InvalidArgument,
    Internal,
}

impl RpcStatus {
    /// Statuses retried by default. Callers may widen the set per call,
    /// e.g. output submission also retries `ResourceExhausted`.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Unavailable | Self::DeadlineExceeded)
    }
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::ResourceExhausted => "resource_exhausted",
            Self::NotFound => "not_found",
            Self::InvalidArgument => "invalid_argument",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}
