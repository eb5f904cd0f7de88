use thiserror::Error;

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("elevation prompt cancelled by user")]
    ElevationCancelled,

    #[error("helper executable not found: {0}")]
    HelperNotFound(String),

    #[error("access denied launching helper: {0}")]
    AccessDenied(String),

    #[error("helper did not accept a connection within the retry budget")]
    ConnectTimeout,

    #[error("helper exited before the session was established (exit code {0})")]
    HelperExited(i32),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("cannot open device (error code {code}): {message}")]
    DeviceOpenFailed { code: u32, message: String },

    #[error("write to device failed: {0}")]
    WriteFailed(String),

    #[error("verification mismatch: expected {expected}, got {actual}")]
    VerificationMismatch { expected: String, actual: String },

    #[error("operation exceeded its deadline")]
    OperationTimeout,

    #[error("image customization failed: {0}")]
    CustomizationFailed(String),

    #[error("helper reported the command as failed")]
    CommandFailed,

    #[error("a session operation is already in progress")]
    Busy,

    #[error("no active session")]
    NotConnected,

    #[error("peer disconnected")]
    PeerDisconnected,
}
