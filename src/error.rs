use std::fmt;

/// Raw controller status byte, as returned in `Command Complete`, `Command Status`,
/// and most other completion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u8);

impl Status {
    pub const SUCCESS: Status = Status(0x00);

    pub fn is_success(self) -> bool {
        self.0 == 0x00
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status 0x{:02x}", self.0)
    }
}

/// The error taxonomy for the HCI core (§7). Every fallible public operation
/// returns `Result<T, HciError>`, synchronously or via the caller's callback.
#[derive(Debug, thiserror::Error)]
pub enum HciError {
    #[error("controller rejected command: {0}")]
    Protocol(Status),

    #[error("packet failed framing validation")]
    PacketMalformed,

    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),

    #[error("ACL data channel used before initialization")]
    NotReady,

    #[error("command timed out waiting for the controller")]
    Timeout,

    #[error("operation was canceled")]
    Canceled,

    #[error("BR/EDR encryption key size below the minimum required")]
    InsufficientSecurity,

    #[error("controller channel I/O error: {0}")]
    IoError(String),
}

impl HciError {
    pub fn invalid(msg: &'static str) -> Self {
        HciError::InvalidParameters(msg)
    }
}

pub type Result<T> = std::result::Result<T, HciError>;
