//! Error codes shared between the tracing library and the daemon.
//!
//! Every operation of the daemon link reports failures through one
//! [`ErrorCode`]. The numeric values are part of the wire contract: the daemon
//! sends them back inside error-code responses, so they must never be
//! renumbered.
//!
//! Codes fall into two classes:
//! - **Fatal**: a precondition or the protocol was violated. Fix the cause
//!   (for example reconnect) before retrying.
//! - **Recoverable**: a transient transport-level failure. Retrying as-is is
//!   reasonable.

use thiserror::Error;

/// The single error enumeration of the daemon link.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    #[error("Daemon was unexpectedly disconnected")]
    DaemonNotConnectedFatal = 1,

    #[error("Invalid app instance ID")]
    InvalidAppInstanceIdFatal = 2,

    #[error("Invalid argument")]
    InvalidArgumentFatal = 3,

    #[error("Invalid binding type")]
    InvalidBindingTypeFatal = 4,

    #[error("Daemon is not yet available")]
    DaemonNotConnectedRecoverable = 13,

    #[error("Daemon connection failed")]
    DaemonConnectionFailedFatal = 23,

    #[error("Daemon communication is not supported on this platform")]
    DaemonCommunicatorNotSupportedFatal = 24,

    #[error("Server name open failed")]
    ServerConnectionNameOpenFailedFatal = 25,

    #[error("Daemon termination detection failed")]
    DaemonTerminationDetectionFailedFatal = 26,

    #[error("Client ID not found")]
    ClientNotFoundRecoverable = 27,

    #[error("Invalid SHM object handle")]
    InvalidShmObjectHandleFatal = 28,

    #[error("Failed to send the message")]
    MessageSendFailedRecoverable = 32,

    #[error("Failed to register a shared-memory object")]
    SharedMemoryObjectRegistrationFailedFatal = 33,

    #[error("Shared-memory object is already registered with this file descriptor/path")]
    SharedMemoryObjectAlreadyRegisteredRecoverable = 34,

    #[error("Request to register non typed-memory")]
    SharedMemoryObjectNotInTypedMemoryFatal = 35,

    #[error("Failed to unregister a shared-memory object")]
    SharedMemoryObjectUnregisterFailedFatal = 36,

    #[error("Failed to create a shared-memory object handle")]
    SharedMemoryObjectHandleCreationFailedFatal = 37,

    #[error("Failed to delete a shared-memory object handle")]
    SharedMemoryObjectHandleDeletionFailedFatal = 39,

    #[error("No more space for a new client")]
    NoMoreSpaceForNewClientFatal = 40,

    #[error("No more space for a new SHM object")]
    NoMoreSpaceForNewShmObjectFatal = 41,

    #[error("Wrong message id")]
    WrongMessageIdRecoverable = 42,

    #[error("Wrong client id")]
    WrongClientIdRecoverable = 43,

    #[error("Client name is already used by different process")]
    ClientNameAlreadyUsedRecoverable = 44,

    #[error("Bad file descriptor")]
    BadFileDescriptorFatal = 45,

    #[error("Channel creation failed")]
    ChannelCreationFailedFatal = 46,

    #[error("Daemon not available")]
    DaemonNotAvailableFatal = 53,

    #[error("Daemon is disconnected")]
    DaemonIsDisconnectedFatal = 57,

    #[error("Unknown generic error")]
    GenericErrorRecoverable = 59,

    #[error("Terminal fatal error")]
    TerminalFatal = 60,
}

impl ErrorCode {
    /// Returns true if retrying the failed operation as-is is reasonable.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorCode::DaemonNotConnectedRecoverable
                | ErrorCode::ClientNotFoundRecoverable
                | ErrorCode::MessageSendFailedRecoverable
                | ErrorCode::SharedMemoryObjectAlreadyRegisteredRecoverable
                | ErrorCode::WrongMessageIdRecoverable
                | ErrorCode::WrongClientIdRecoverable
                | ErrorCode::ClientNameAlreadyUsedRecoverable
                | ErrorCode::GenericErrorRecoverable
        )
    }

    /// Returns true if the caller must fix a precondition before retrying.
    pub fn is_fatal(self) -> bool {
        !self.is_recoverable()
    }

    /// Numeric value carried on the wire.
    pub fn as_wire(self) -> u16 {
        self as u16
    }

    /// Maps a daemon-reported numeric code back to an [`ErrorCode`].
    ///
    /// Codes this client does not know about collapse to
    /// [`ErrorCode::GenericErrorRecoverable`].
    pub fn from_wire(code: u16) -> Self {
        match code {
            1 => ErrorCode::DaemonNotConnectedFatal,
            2 => ErrorCode::InvalidAppInstanceIdFatal,
            3 => ErrorCode::InvalidArgumentFatal,
            4 => ErrorCode::InvalidBindingTypeFatal,
            13 => ErrorCode::DaemonNotConnectedRecoverable,
            23 => ErrorCode::DaemonConnectionFailedFatal,
            24 => ErrorCode::DaemonCommunicatorNotSupportedFatal,
            25 => ErrorCode::ServerConnectionNameOpenFailedFatal,
            26 => ErrorCode::DaemonTerminationDetectionFailedFatal,
            27 => ErrorCode::ClientNotFoundRecoverable,
            28 => ErrorCode::InvalidShmObjectHandleFatal,
            32 => ErrorCode::MessageSendFailedRecoverable,
            33 => ErrorCode::SharedMemoryObjectRegistrationFailedFatal,
            34 => ErrorCode::SharedMemoryObjectAlreadyRegisteredRecoverable,
            35 => ErrorCode::SharedMemoryObjectNotInTypedMemoryFatal,
            36 => ErrorCode::SharedMemoryObjectUnregisterFailedFatal,
            37 => ErrorCode::SharedMemoryObjectHandleCreationFailedFatal,
            39 => ErrorCode::SharedMemoryObjectHandleDeletionFailedFatal,
            40 => ErrorCode::NoMoreSpaceForNewClientFatal,
            41 => ErrorCode::NoMoreSpaceForNewShmObjectFatal,
            42 => ErrorCode::WrongMessageIdRecoverable,
            43 => ErrorCode::WrongClientIdRecoverable,
            44 => ErrorCode::ClientNameAlreadyUsedRecoverable,
            45 => ErrorCode::BadFileDescriptorFatal,
            46 => ErrorCode::ChannelCreationFailedFatal,
            53 => ErrorCode::DaemonNotAvailableFatal,
            57 => ErrorCode::DaemonIsDisconnectedFatal,
            60 => ErrorCode::TerminalFatal,
            _ => ErrorCode::GenericErrorRecoverable,
        }
    }
}

/// Result type for daemon link operations.
pub type TraceResult<T> = Result<T, ErrorCode>;
