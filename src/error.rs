//! Result classification for socket operations.

/// Classified result of a socket operation or I/O event.
///
/// Every OS failure is mapped to one of these kinds at the point it is
/// observed. Layers above forward the value unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum SocketError {
    #[error("end of file")]
    Eof,
    #[error("operation canceled")]
    Canceled,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("host down")]
    HostDown,
    #[error("ran out of resources")]
    NoResources,
    #[error("address not available")]
    AddressNotAvailable,
    #[error("address in use")]
    AddressInUse,
    #[error("permission denied")]
    PermissionDenied,
    #[error("socket is not connected")]
    NotConnected,
    #[error("connection reset")]
    ConnectionReset,
    #[error("timed out")]
    TimedOut,
    #[error("address family not supported")]
    FamilyNotSupported,
    #[error("address family mismatch")]
    FamilyMismatch,
    #[error("socket is already bound")]
    AlreadyBound,
    #[error("multicast address not allowed")]
    Multicast,
    #[error("operation would block")]
    WouldBlock,
    #[error("invalid socket id")]
    InvalidSocket,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("unexpected error (errno {0})")]
    Unexpected(i32),
}

pub type Result<T> = std::result::Result<T, SocketError>;

impl SocketError {
    /// Generic errno mapping used when an operation-specific table has no
    /// entry for the value.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EPIPE | libc::ECONNRESET | libc::ECONNABORTED => SocketError::ConnectionReset,
            libc::ENOTCONN => SocketError::NotConnected,
            libc::ETIMEDOUT => SocketError::TimedOut,
            libc::ENOBUFS | libc::ENOMEM | libc::EMFILE | libc::ENFILE => {
                SocketError::NoResources
            }
            libc::EACCES | libc::EPERM => SocketError::PermissionDenied,
            libc::EAFNOSUPPORT => SocketError::FamilyNotSupported,
            libc::ENETDOWN | libc::ENETUNREACH => SocketError::NetworkUnreachable,
            libc::EHOSTUNREACH => SocketError::HostUnreachable,
            libc::EHOSTDOWN => SocketError::HostDown,
            libc::EADDRINUSE => SocketError::AddressInUse,
            libc::EADDRNOTAVAIL => SocketError::AddressNotAvailable,
            libc::ECONNREFUSED => SocketError::ConnectionRefused,
            other => SocketError::Unexpected(other),
        }
    }

    /// Map an `io::Error`, falling back to `Unexpected(0)` when it carries
    /// no OS error code.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None => SocketError::Unexpected(0),
        }
    }

    /// True for the classifications produced by I/O failure, as opposed to
    /// end of file, cancellation or API misuse.
    pub fn is_hard(&self) -> bool {
        !matches!(
            self,
            SocketError::Eof
                | SocketError::Canceled
                | SocketError::WouldBlock
                | SocketError::InvalidSocket
                | SocketError::InvalidState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_mapping() {
        assert_eq!(SocketError::from_errno(libc::EPIPE), SocketError::ConnectionReset);
        assert_eq!(SocketError::from_errno(libc::EMFILE), SocketError::NoResources);
        assert_eq!(SocketError::from_errno(libc::ENETDOWN), SocketError::NetworkUnreachable);
        assert_eq!(SocketError::from_errno(libc::EBADF), SocketError::Unexpected(libc::EBADF));
    }

    #[test]
    fn from_io_without_errno() {
        let err = std::io::Error::other("boom");
        assert_eq!(SocketError::from_io(&err), SocketError::Unexpected(0));
        let err = std::io::Error::from_raw_os_error(libc::ETIMEDOUT);
        assert_eq!(SocketError::from_io(&err), SocketError::TimedOut);
    }

    #[test]
    fn hard_versus_terminal_markers() {
        assert!(SocketError::ConnectionRefused.is_hard());
        assert!(SocketError::Unexpected(5).is_hard());
        assert!(!SocketError::Eof.is_hard());
        assert!(!SocketError::Canceled.is_hard());
        assert_eq!(SocketError::Eof.to_string(), "end of file");
    }
}
