use chat_protocol::RpcError;
use thiserror::Error;

/// Failure taxonomy shared by the gateway, the HTTP routes and the socket.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("{0}")]
    Forbidden(String),
    #[error("sender is not a member of this conversation")]
    NotAMember,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Conflict(String),
    #[error("too many attempts, try again later")]
    RateLimited,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

impl ChatError {
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Stable machine readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NotAMember => "not_a_member",
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::Conflict(_) => "conflict",
            Self::RateLimited => "rate_limited",
            Self::Internal(_) => "internal",
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        let message = match self {
            // storage details stay in the logs
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        RpcError {
            kind: self.kind().into(),
            message,
        }
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<r2d2::Error> for ChatError {
    fn from(e: r2d2::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}
