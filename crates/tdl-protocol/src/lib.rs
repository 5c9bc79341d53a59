//! TDL Protocol - Wire protocol for trace daemon communication
//!
//! This crate provides the request/response message types, their
//! fixed-layout wire images, and a frame codec for the daemon side.
//! Both processes must be built against the same layout.

pub mod codec;
pub mod message;
pub mod wire;

pub use codec::{CodecError, DaemonServerCodec};
pub use message::{DaemonCommunicatorMessage, Request, Response, VariantType};
pub use wire::{
    decode_request, decode_response, encode_request, encode_response, WireError,
    REQUEST_WIRE_SIZE, RESPONSE_WIRE_SIZE,
};
