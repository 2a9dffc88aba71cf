pub mod codec;
pub mod errors;
pub mod ids;
pub mod keys;
pub mod message;
pub mod value;

pub use codec::{decode, decode_frame, encode, CodecError, FrameScanner};
pub use errors::{ErrorBody, ErrorCode};
pub use ids::ConnectionId;
pub use keys::{KeyParseError, PluginKey, KEY_LEN};
pub use message::{Message, MessageType};
pub use value::{Integer, Value, ValueKind};
