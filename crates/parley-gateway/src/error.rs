use thiserror::Error;
use uuid::Uuid;

use parley_types::events::{ErrorCode, ServerEvent};

/// Failures surfaced by gateway operations. Operation errors are delivered
/// to the initiating connection only; other participants never observe a
/// partial broadcast. Only `Auth` closes the connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("access denied")]
    AccessDenied,

    #[error("not found")]
    NotFound,

    #[error("send failed: {0}")]
    SendFailed(anyhow::Error),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Auth(_) => ErrorCode::AuthError,
            Self::AccessDenied => ErrorCode::AccessDenied,
            Self::NotFound => ErrorCode::NotFound,
            Self::SendFailed(_) => ErrorCode::SendFailed,
            Self::BadRequest(_) => ErrorCode::BadRequest,
        }
    }

    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    pub fn to_event(&self, chat_id: Option<Uuid>) -> ServerEvent {
        ServerEvent::Error {
            code: self.code(),
            message: self.to_string(),
            chat_id,
        }
    }
}

/// Shorthand for wrapping store failures on the send path.
pub(crate) fn send_failed(err: impl Into<anyhow::Error>) -> GatewayError {
    GatewayError::SendFailed(err.into())
}
