use std::fmt;

use crate::value::Value;

/// Wire-level error codes carried in the `code` field of an error payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Validation,
    Authorization,
    Api,
    CallExpired,
    CallOrphaned,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Authorization => "AUTHORIZATION_ERROR",
            Self::Api => "API_ERROR",
            Self::CallExpired => "CALL_EXPIRED",
            Self::CallOrphaned => "CALL_ORPHANED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "VALIDATION_ERROR" => Self::Validation,
            "AUTHORIZATION_ERROR" => Self::Authorization,
            "API_ERROR" => Self::Api,
            "CALL_EXPIRED" => Self::CallExpired,
            "CALL_ORPHANED" => Self::CallOrphaned,
            "INTERNAL_ERROR" => Self::Internal,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload placed in a Response: `{"code": ..., "message": ...}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::from("code"), Value::from(self.code.as_str())),
            (Value::from("message"), Value::from(self.message.as_str())),
        ])
    }

    /// Parse an error payload produced by [`ErrorBody::to_value`].
    pub fn from_value(value: &Value) -> Option<Self> {
        let code = value.get("code").and_then(Value::as_str).and_then(ErrorCode::parse)?;
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Some(Self { code, message })
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
