use plugbus_core::{ErrorBody, ErrorCode, Value};

/// Failure of a single dispatched message. Never fatal to the broker.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    Routing(String),

    #[error("call {0} expired before a result arrived")]
    Expired(u64),

    #[error("call {0} orphaned: callee disconnected")]
    Orphaned(u64),

    #[error("{0}")]
    Internal(String),
}

impl DispatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::Authorization(_) => ErrorCode::Authorization,
            Self::Routing(_) => ErrorCode::Api,
            Self::Expired(_) => ErrorCode::CallExpired,
            Self::Orphaned(_) => ErrorCode::CallOrphaned,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Wire payload for the `error` slot of a Response.
    pub fn to_value(&self) -> Value {
        ErrorBody::new(self.code(), self.to_string()).to_value()
    }
}
