//! Protocol message types for daemon communication.

use std::fmt;

use tdl_core::{AppId, BindingType, ErrorCode, ProcessId, ShmHandle, ShmObjectHandle, TraceClientId};

/// Wire message kinds understood by the daemon.
///
/// The discriminant is the one-byte message id at the start of every
/// request image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DaemonCommunicatorMessage {
    SharedMemoryObjectRegistrationRequest = 0,
    SharedMemoryObjectUnregisterRequest = 1,
    DaemonProcessIdRequest = 2,
    RegisterClientRequest = 3,
    /// Reserved. The client never sends it; kept so the id stays allocated.
    LibraryTerminationRequest = 4,
    #[default]
    Undefined = 0xFE,
    Last = 0xFF,
}

impl DaemonCommunicatorMessage {
    pub const fn as_raw(self) -> u8 {
        self as u8
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::SharedMemoryObjectRegistrationRequest),
            1 => Some(Self::SharedMemoryObjectUnregisterRequest),
            2 => Some(Self::DaemonProcessIdRequest),
            3 => Some(Self::RegisterClientRequest),
            4 => Some(Self::LibraryTerminationRequest),
            0xFE => Some(Self::Undefined),
            0xFF => Some(Self::Last),
            _ => None,
        }
    }
}

impl fmt::Display for DaemonCommunicatorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SharedMemoryObjectRegistrationRequest => "register-shm",
            Self::SharedMemoryObjectUnregisterRequest => "unregister-shm",
            Self::DaemonProcessIdRequest => "get-daemon-pid",
            Self::RegisterClientRequest => "register-client",
            Self::LibraryTerminationRequest => "library-termination",
            Self::Undefined => "undefined",
            Self::Last => "last",
        };
        f.write_str(name)
    }
}

/// Request sent from the library to the daemon.
///
/// The variant is the message id, so a payload can never disagree with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    RegisterSharedMemoryObject {
        handle: ShmHandle,
    },
    UnregisterSharedMemoryObject {
        index: ShmObjectHandle,
    },
    DaemonProcessId,
    RegisterClient {
        binding_type: BindingType,
        app_id: AppId,
    },
    LibraryTermination,
}

impl Request {
    /// Message id this request travels under.
    pub fn message_id(&self) -> DaemonCommunicatorMessage {
        match self {
            Request::RegisterSharedMemoryObject { .. } => {
                DaemonCommunicatorMessage::SharedMemoryObjectRegistrationRequest
            }
            Request::UnregisterSharedMemoryObject { .. } => {
                DaemonCommunicatorMessage::SharedMemoryObjectUnregisterRequest
            }
            Request::DaemonProcessId => DaemonCommunicatorMessage::DaemonProcessIdRequest,
            Request::RegisterClient { .. } => DaemonCommunicatorMessage::RegisterClientRequest,
            Request::LibraryTermination => DaemonCommunicatorMessage::LibraryTerminationRequest,
        }
    }

    pub fn register_shared_memory_object(handle: ShmHandle) -> Self {
        Request::RegisterSharedMemoryObject { handle }
    }

    pub fn unregister_shared_memory_object(index: ShmObjectHandle) -> Self {
        Request::UnregisterSharedMemoryObject { index }
    }

    pub fn daemon_process_id() -> Self {
        Request::DaemonProcessId
    }

    pub fn register_client(binding_type: BindingType, app_id: AppId) -> Self {
        Request::RegisterClient {
            binding_type,
            app_id,
        }
    }
}

/// Discriminant of a [`Response`], queryable without touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VariantType {
    DaemonProcessId = 0,
    RegisterSharedMemoryObject = 1,
    UnregisterSharedMemoryObject = 2,
    RegisterClient = 3,
    ErrorCode = 4,
}

impl VariantType {
    pub const fn as_raw(self) -> u8 {
        self as u8
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::DaemonProcessId),
            1 => Some(Self::RegisterSharedMemoryObject),
            2 => Some(Self::UnregisterSharedMemoryObject),
            3 => Some(Self::RegisterClient),
            4 => Some(Self::ErrorCode),
            _ => None,
        }
    }
}

/// Reply sent from the daemon to the library.
///
/// Callers create a sentinel response before each call (see the
/// constructors below); a failed round trip leaves it untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    DaemonProcessId(ProcessId),
    RegisterSharedMemoryObject(ShmObjectHandle),
    UnregisterSharedMemoryObject { is_unregister_successful: bool },
    RegisterClient(TraceClientId),
    ErrorCode(ErrorCode),
}

impl Response {
    /// Sentinel for the daemon pid round trip.
    pub fn unknown_daemon_process_id() -> Self {
        Response::DaemonProcessId(ProcessId::INVALID)
    }

    /// Sentinel for a registration: the invalid registry index.
    pub fn invalid_shared_memory_object() -> Self {
        Response::RegisterSharedMemoryObject(ShmObjectHandle::INVALID)
    }

    /// Sentinel for an unregistration: not successful.
    pub fn unregister_not_confirmed() -> Self {
        Response::UnregisterSharedMemoryObject {
            is_unregister_successful: false,
        }
    }

    /// Sentinel for a client registration.
    pub fn default_trace_client_id() -> Self {
        Response::RegisterClient(TraceClientId::default())
    }

    pub fn variant_type(&self) -> VariantType {
        match self {
            Response::DaemonProcessId(_) => VariantType::DaemonProcessId,
            Response::RegisterSharedMemoryObject(_) => VariantType::RegisterSharedMemoryObject,
            Response::UnregisterSharedMemoryObject { .. } => {
                VariantType::UnregisterSharedMemoryObject
            }
            Response::RegisterClient(_) => VariantType::RegisterClient,
            Response::ErrorCode(_) => VariantType::ErrorCode,
        }
    }

    pub fn daemon_process_id(&self) -> Option<ProcessId> {
        match self {
            Response::DaemonProcessId(pid) => Some(*pid),
            _ => None,
        }
    }

    pub fn shared_memory_object_index(&self) -> Option<ShmObjectHandle> {
        match self {
            Response::RegisterSharedMemoryObject(index) => Some(*index),
            _ => None,
        }
    }

    pub fn is_unregister_successful(&self) -> Option<bool> {
        match self {
            Response::UnregisterSharedMemoryObject {
                is_unregister_successful,
            } => Some(*is_unregister_successful),
            _ => None,
        }
    }

    pub fn trace_client_id(&self) -> Option<TraceClientId> {
        match self {
            Response::RegisterClient(id) => Some(*id),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Response::ErrorCode(code) => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_codes() {
        assert_eq!(
            DaemonCommunicatorMessage::SharedMemoryObjectRegistrationRequest.as_raw(),
            0
        );
        assert_eq!(
            DaemonCommunicatorMessage::SharedMemoryObjectUnregisterRequest.as_raw(),
            1
        );
        assert_eq!(DaemonCommunicatorMessage::DaemonProcessIdRequest.as_raw(), 2);
        assert_eq!(DaemonCommunicatorMessage::RegisterClientRequest.as_raw(), 3);
        assert_eq!(DaemonCommunicatorMessage::LibraryTerminationRequest.as_raw(), 4);
        assert_eq!(DaemonCommunicatorMessage::Undefined.as_raw(), 0xFE);
        assert_eq!(DaemonCommunicatorMessage::Last.as_raw(), 0xFF);
        assert_eq!(
            DaemonCommunicatorMessage::default(),
            DaemonCommunicatorMessage::Undefined
        );
    }

    #[test]
    fn test_message_id_from_raw() {
        assert_eq!(
            DaemonCommunicatorMessage::from_raw(3),
            Some(DaemonCommunicatorMessage::RegisterClientRequest)
        );
        assert_eq!(DaemonCommunicatorMessage::from_raw(5), None);
    }

    #[test]
    fn test_request_message_id_follows_variant() {
        let request = Request::register_client(BindingType::Vector, AppId::default());
        assert_eq!(
            request.message_id(),
            DaemonCommunicatorMessage::RegisterClientRequest
        );
        assert_eq!(
            Request::unregister_shared_memory_object(ShmObjectHandle::new(3)).message_id(),
            DaemonCommunicatorMessage::SharedMemoryObjectUnregisterRequest
        );
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(
            Response::invalid_shared_memory_object().shared_memory_object_index(),
            Some(ShmObjectHandle::INVALID)
        );
        assert_eq!(
            Response::unregister_not_confirmed().is_unregister_successful(),
            Some(false)
        );
        assert_eq!(
            Response::unknown_daemon_process_id().daemon_process_id(),
            Some(ProcessId::INVALID)
        );
    }

    #[test]
    fn test_accessors_reject_wrong_variant() {
        let response = Response::RegisterClient(TraceClientId::new(7));
        assert_eq!(response.variant_type(), VariantType::RegisterClient);
        assert_eq!(response.trace_client_id(), Some(TraceClientId::new(7)));
        assert_eq!(response.daemon_process_id(), None);
        assert_eq!(response.error_code(), None);
    }

    #[test]
    fn test_error_code_variant() {
        let response = Response::ErrorCode(ErrorCode::NoMoreSpaceForNewClientFatal);
        assert_eq!(response.variant_type(), VariantType::ErrorCode);
        assert_eq!(
            response.error_code(),
            Some(ErrorCode::NoMoreSpaceForNewClientFatal)
        );
    }
}
