//! TDL Core - Shared types for the trace daemon link
//!
//! This crate provides the identifiers and the error enumeration shared
//! between the wire protocol (tdl-protocol) and the client (tdl-client).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod types;

// Re-exports for convenience
pub use error::{ErrorCode, TraceResult};
pub use types::{
    AppId, BindingType, ProcessId, ShmHandle, ShmObjectHandle, TraceClientId, APP_ID_LENGTH,
};
