//! Daemon-side framing for stream transports.
//!
//! Requests and responses have fixed sizes, so a frame is simply the next
//! [`REQUEST_WIRE_SIZE`] bytes of the stream. Used with
//! `tokio_util::codec::Framed` by daemon implementations and test servers.

use std::io;

use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Request, Response};
use crate::wire::{self, WireError, REQUEST_WIRE_SIZE};

/// Errors produced while framing daemon traffic.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame: {0}")]
    Wire(#[from] WireError),
}

/// Decodes incoming requests and encodes outgoing responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DaemonServerCodec;

impl Decoder for DaemonServerCodec {
    type Item = Request;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < REQUEST_WIRE_SIZE {
            src.reserve(REQUEST_WIRE_SIZE - src.len());
            return Ok(None);
        }

        let frame = src.split_to(REQUEST_WIRE_SIZE);
        let request = wire::decode_request(&frame)?;
        Ok(Some(request))
    }
}

impl Encoder<Response> for DaemonServerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&wire::encode_response(&item));
        Ok(())
    }
}
