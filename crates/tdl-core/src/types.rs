//! Identifiers exchanged with the tracing daemon.
//!
//! All identifiers are small `Copy` newtypes so they can be embedded in the
//! fixed-layout wire images without any indirection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Process id of the daemon, as reported by the daemon itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(i32);

impl ProcessId {
    /// Sentinel for "no daemon process known".
    pub const INVALID: ProcessId = ProcessId(-1);

    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> i32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a shared-memory object inside the daemon's registry.
///
/// Returned by a successful registration and only meaningful for the
/// matching unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShmObjectHandle(i32);

impl ShmObjectHandle {
    /// Sentinel the daemon returns when it could not register an object.
    pub const INVALID: ShmObjectHandle = ShmObjectHandle(-1);

    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> i32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ShmObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// OS-level handle granting the daemon access to a shared-memory object.
///
/// Created locally from a file descriptor, scoped to the daemon's process id,
/// and carried inside the registration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmHandle(u64);

impl ShmHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Id the daemon assigns to a registered tracing client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceClientId(u8);

impl TraceClientId {
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u8 {
        self.0
    }
}

impl fmt::Display for TraceClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Middleware binding a tracing client registers for.
///
/// `Undefined` is the upper sentinel: every value at or beyond it is
/// rejected before anything is sent to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum BindingType {
    LoLa = 0,
    Vector = 1,
    VectorZeroCopy = 2,
    Undefined = 3,
}

impl BindingType {
    /// Returns true for every binding below the `Undefined` sentinel.
    pub fn is_defined(self) -> bool {
        self < BindingType::Undefined
    }

    pub const fn as_raw(self) -> u8 {
        self as u8
    }

    /// Decodes a raw binding value; anything unknown is `None`.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(BindingType::LoLa),
            1 => Some(BindingType::Vector),
            2 => Some(BindingType::VectorZeroCopy),
            3 => Some(BindingType::Undefined),
            _ => None,
        }
    }
}

impl FromStr for BindingType {
    type Err = ErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lola" => Ok(BindingType::LoLa),
            "vector" => Ok(BindingType::Vector),
            "vector-zero-copy" | "vector_zero_copy" => Ok(BindingType::VectorZeroCopy),
            _ => Err(ErrorCode::InvalidBindingTypeFatal),
        }
    }
}

impl fmt::Display for BindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindingType::LoLa => "lola",
            BindingType::Vector => "vector",
            BindingType::VectorZeroCopy => "vector-zero-copy",
            BindingType::Undefined => "undefined",
        };
        f.write_str(name)
    }
}

/// Maximum length of an application identifier, in bytes.
pub const APP_ID_LENGTH: usize = 255;

/// Fixed-size, NUL-padded application instance identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppId([u8; APP_ID_LENGTH]);

impl AppId {
    /// Builds an identifier from a string.
    ///
    /// Fails with [`ErrorCode::InvalidAppInstanceIdFatal`] if the string is
    /// empty, longer than [`APP_ID_LENGTH`] bytes, or contains a NUL byte.
    pub fn new(id: &str) -> Result<Self, ErrorCode> {
        let bytes = id.as_bytes();
        if bytes.is_empty() || bytes.len() > APP_ID_LENGTH || bytes.contains(&0) {
            return Err(ErrorCode::InvalidAppInstanceIdFatal);
        }
        let mut raw = [0u8; APP_ID_LENGTH];
        raw.get_mut(..bytes.len())
            .ok_or(ErrorCode::InvalidAppInstanceIdFatal)?
            .copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Wraps a raw wire image without validation.
    pub const fn from_bytes(raw: [u8; APP_ID_LENGTH]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; APP_ID_LENGTH] {
        &self.0
    }

    /// The identifier up to the first NUL byte, lossily decoded.
    pub fn to_string_lossy(&self) -> String {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(APP_ID_LENGTH);
        String::from_utf8_lossy(self.0.get(..end).unwrap_or(&[])).into_owned()
    }
}

impl Default for AppId {
    fn default() -> Self {
        Self([0u8; APP_ID_LENGTH])
    }
}

impl fmt::Debug for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AppId").field(&self.to_string_lossy()).finish()
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}
