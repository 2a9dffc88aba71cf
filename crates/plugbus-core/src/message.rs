use crate::value::Value;

/// Wire discriminant, the first element of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Notification = 2,
}

impl MessageType {
    pub fn from_u64(n: u64) -> Option<Self> {
        match n {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Notification),
            _ => None,
        }
    }

    /// Number of elements in the frame array.
    pub fn arity(self) -> usize {
        match self {
            Self::Request | Self::Response => 4,
            Self::Notification => 3,
        }
    }
}

/// A msgpack-rpc envelope.
///
/// In a well-formed `Response` exactly one of `error` / `result` is `Some`,
/// and `error`, when present, is not `Nil`. Use [`Message::success`] and
/// [`Message::failure`] to build one.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request {
        call_id: u64,
        method: String,
        params: Vec<Value>,
    },
    Response {
        call_id: u64,
        error: Option<Value>,
        result: Option<Value>,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

impl Message {
    pub fn request(call_id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Request {
            call_id,
            method: method.into(),
            params,
        }
    }

    pub fn success(call_id: u64, result: Value) -> Self {
        Self::Response {
            call_id,
            error: None,
            result: Some(result),
        }
    }

    pub fn failure(call_id: u64, error: Value) -> Self {
        Self::Response {
            call_id,
            error: Some(error),
            result: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request { .. } => MessageType::Request,
            Self::Response { .. } => MessageType::Response,
            Self::Notification { .. } => MessageType::Notification,
        }
    }

    /// The msgid, absent for notifications.
    pub fn call_id(&self) -> Option<u64> {
        match self {
            Self::Request { call_id, .. } | Self::Response { call_id, .. } => Some(*call_id),
            Self::Notification { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    pub fn params(&self) -> Option<&[Value]> {
        match self {
            Self::Request { params, .. } | Self::Notification { params, .. } => Some(params),
            Self::Response { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Response { error: Some(_), .. })
    }
}
