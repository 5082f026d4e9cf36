//! JSON-RPC 2.0 wire layer shared by the protocol client and providers.
//!
//! Messages are single-line JSON objects separated by `\n`. [`framing`]
//! turns a raw byte stream back into lines; [`types`] classifies each line.

pub mod framing;
pub mod types;

pub use framing::LineBuffer;
pub use types::{
    IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
