use std::io;

/// Terminal failure conditions. Any of these tears down the session that
/// observed it; none of them may leak across sessions.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    /// Frame length field out of range or otherwise unusable.
    BadFrame,
    /// Inbound staging buffer exhausted without a complete frame.
    PayloadTooLarge,
    /// The peer closed the connection.
    Closed,
    /// Resource acquisition failed (buffers, cursors).
    Resource,
    Io(io::ErrorKind),
}

/// Non-blocking plumbing result. `Wait` means the operation could not make
/// progress right now and should be retried on the next readiness event.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        match self {
            Err(NetworkError::Fatal(_)) => true,
            _ => false,
        }
    }
}
