//! Fixed-layout wire images of requests and responses.
//!
//! Both sides of the link are built against the same layout; nothing is
//! negotiated at runtime beyond the one-byte message id. All integers are
//! little-endian.
//!
//! ```text
//! request  (264 bytes)              response (16 bytes)
//! ┌────┬─────────┬──────────────┐   ┌─────┬─────────┬─────────┐
//! │ id │ 7 x 0   │ payload(256) │   │ tag │ 7 x 0   │ value(8)│
//! └────┴─────────┴──────────────┘   └─────┴─────────┴─────────┘
//! ```

use thiserror::Error;

use tdl_core::{
    AppId, BindingType, ErrorCode, ProcessId, ShmHandle, ShmObjectHandle, TraceClientId,
    APP_ID_LENGTH,
};

use crate::message::{DaemonCommunicatorMessage, Request, Response, VariantType};

/// Offset of the payload inside both images.
pub const PAYLOAD_OFFSET: usize = 8;

/// Size of an encoded request.
pub const REQUEST_WIRE_SIZE: usize = PAYLOAD_OFFSET + 1 + APP_ID_LENGTH;

/// Size of an encoded response.
pub const RESPONSE_WIRE_SIZE: usize = PAYLOAD_OFFSET + 8;

pub type RequestImage = [u8; REQUEST_WIRE_SIZE];
pub type ResponseImage = [u8; RESPONSE_WIRE_SIZE];

/// Errors raised while decoding a wire image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Invalid image length: got {actual} bytes, expected {expected}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Unknown message id: {0:#04x}")]
    UnknownMessageId(u8),

    #[error("Message id {0} is not a request")]
    NotARequest(DaemonCommunicatorMessage),

    #[error("Unknown response variant: {0}")]
    UnknownVariant(u8),

    #[error("Invalid binding type: {0}")]
    InvalidBindingType(u8),
}

/// Encodes a request into its fixed-size image.
pub fn encode_request(request: &Request) -> RequestImage {
    let mut image = [0u8; REQUEST_WIRE_SIZE];
    put(&mut image, 0, &[request.message_id().as_raw()]);

    match request {
        Request::RegisterSharedMemoryObject { handle } => {
            put(&mut image, PAYLOAD_OFFSET, &handle.as_raw().to_le_bytes());
        }
        Request::UnregisterSharedMemoryObject { index } => {
            put(&mut image, PAYLOAD_OFFSET, &index.as_raw().to_le_bytes());
        }
        Request::RegisterClient {
            binding_type,
            app_id,
        } => {
            put(&mut image, PAYLOAD_OFFSET, &[binding_type.as_raw()]);
            put(&mut image, PAYLOAD_OFFSET + 1, app_id.as_bytes());
        }
        Request::DaemonProcessId | Request::LibraryTermination => {}
    }

    image
}

/// Decodes a request image.
pub fn decode_request(image: &[u8]) -> Result<Request, WireError> {
    let payload = payload_of(image, REQUEST_WIRE_SIZE)?;
    let raw_id = image.first().copied().unwrap_or_default();
    let message_id =
        DaemonCommunicatorMessage::from_raw(raw_id).ok_or(WireError::UnknownMessageId(raw_id))?;

    match message_id {
        DaemonCommunicatorMessage::SharedMemoryObjectRegistrationRequest => {
            Ok(Request::RegisterSharedMemoryObject {
                handle: ShmHandle::new(u64::from_le_bytes(read_array(payload)?)),
            })
        }
        DaemonCommunicatorMessage::SharedMemoryObjectUnregisterRequest => {
            Ok(Request::UnregisterSharedMemoryObject {
                index: ShmObjectHandle::new(i32::from_le_bytes(read_array(payload)?)),
            })
        }
        DaemonCommunicatorMessage::DaemonProcessIdRequest => Ok(Request::DaemonProcessId),
        DaemonCommunicatorMessage::RegisterClientRequest => {
            let raw_binding = payload.first().copied().unwrap_or_default();
            let binding_type = BindingType::from_raw(raw_binding)
                .ok_or(WireError::InvalidBindingType(raw_binding))?;
            let app_id: [u8; APP_ID_LENGTH] = read_array(payload.get(1..).unwrap_or_default())?;
            Ok(Request::RegisterClient {
                binding_type,
                app_id: AppId::from_bytes(app_id),
            })
        }
        DaemonCommunicatorMessage::LibraryTerminationRequest => Ok(Request::LibraryTermination),
        other @ (DaemonCommunicatorMessage::Undefined | DaemonCommunicatorMessage::Last) => {
            Err(WireError::NotARequest(other))
        }
    }
}

/// Encodes a response into its fixed-size image.
pub fn encode_response(response: &Response) -> ResponseImage {
    let mut image = [0u8; RESPONSE_WIRE_SIZE];
    put(&mut image, 0, &[response.variant_type().as_raw()]);

    match response {
        Response::DaemonProcessId(pid) => {
            put(&mut image, PAYLOAD_OFFSET, &pid.as_raw().to_le_bytes());
        }
        Response::RegisterSharedMemoryObject(index) => {
            put(&mut image, PAYLOAD_OFFSET, &index.as_raw().to_le_bytes());
        }
        Response::UnregisterSharedMemoryObject {
            is_unregister_successful,
        } => {
            put(&mut image, PAYLOAD_OFFSET, &[u8::from(*is_unregister_successful)]);
        }
        Response::RegisterClient(id) => {
            put(&mut image, PAYLOAD_OFFSET, &[id.as_raw()]);
        }
        Response::ErrorCode(code) => {
            put(&mut image, PAYLOAD_OFFSET, &code.as_wire().to_le_bytes());
        }
    }

    image
}

/// Decodes a response image.
pub fn decode_response(image: &[u8]) -> Result<Response, WireError> {
    let payload = payload_of(image, RESPONSE_WIRE_SIZE)?;
    let raw_tag = image.first().copied().unwrap_or_default();
    let variant = VariantType::from_raw(raw_tag).ok_or(WireError::UnknownVariant(raw_tag))?;
    let first = payload.first().copied().unwrap_or_default();

    let response = match variant {
        VariantType::DaemonProcessId => {
            Response::DaemonProcessId(ProcessId::new(i32::from_le_bytes(read_array(payload)?)))
        }
        VariantType::RegisterSharedMemoryObject => Response::RegisterSharedMemoryObject(
            ShmObjectHandle::new(i32::from_le_bytes(read_array(payload)?)),
        ),
        VariantType::UnregisterSharedMemoryObject => Response::UnregisterSharedMemoryObject {
            is_unregister_successful: first != 0,
        },
        VariantType::RegisterClient => Response::RegisterClient(TraceClientId::new(first)),
        VariantType::ErrorCode => {
            Response::ErrorCode(ErrorCode::from_wire(u16::from_le_bytes(read_array(payload)?)))
        }
    };
    Ok(response)
}

/// Copies `bytes` into `image` at `offset`. Offsets are layout constants
/// that always fit the image.
fn put(image: &mut [u8], offset: usize, bytes: &[u8]) {
    if let Some(slot) = image.get_mut(offset..offset + bytes.len()) {
        slot.copy_from_slice(bytes);
    }
}

fn payload_of(image: &[u8], expected: usize) -> Result<&[u8], WireError> {
    if image.len() != expected {
        return Err(WireError::InvalidLength {
            expected,
            actual: image.len(),
        });
    }
    image
        .get(PAYLOAD_OFFSET..)
        .ok_or(WireError::InvalidLength {
            expected,
            actual: image.len(),
        })
}

fn read_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], WireError> {
    bytes
        .get(..N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(WireError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        })
}
