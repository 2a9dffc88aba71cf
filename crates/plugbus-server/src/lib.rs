pub mod client;
pub mod codec;
pub mod server;

pub use client::{ConnectionRegistry, Inbound};
pub use codec::{FrameError, RpcCodec};
pub use server::{start, ServerConfig, ServerError, ServerHandle};
