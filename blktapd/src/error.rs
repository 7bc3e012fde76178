use thiserror::Error;

/// Error taxonomy for the core (spec §7). Every layer below the frontends
/// reports one of these; frontends translate to their own wire status.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BlkError {
    /// Transient resource exhaustion (pool full, queue full). Retried silently.
    #[error("resource temporarily unavailable")]
    Busy,
    /// I/O failure from the kernel or a copy to/from guest memory. Retried with a warning.
    #[error("I/O error")]
    Io,
    /// Malformed request: bad sector range, too many segments, zero-length segment.
    #[error("invalid argument")]
    Invalid,
    /// Write issued against a read-only chain.
    #[error("operation not permitted")]
    Perm,
    /// Failed to open a driver read-write while it is already shared read-only.
    #[error("permission denied")]
    Access,
    /// Unknown frontend operation.
    #[error("operation not supported")]
    NotSupported,
    /// Malformed NBD option or unrecognised ring protocol tag.
    #[error("protocol error")]
    Proto,
    /// Ring protocol tag not one of Native/X86_32/X86_64.
    #[error("protocol not supported")]
    ProtoNotSupported,
    /// No parent in a driver chain; not a failure, a terminal chain marker.
    #[error("no parent")]
    NoParent,
}

impl BlkError {
    /// Whether the VBD request engine should retry a treq that failed with this error.
    pub fn is_retryable(self) -> bool {
        matches!(self, BlkError::Busy | BlkError::Io)
    }

    /// Whether a retried error should log at `warn` (`EIO`) vs stay silent (`EBUSY`).
    pub fn warn_on_retry(self) -> bool {
        matches!(self, BlkError::Io)
    }

    /// Negated-errno form, as returned on the (out of scope) control-plane socket.
    pub fn errno(self) -> i32 {
        match self {
            BlkError::Busy => libc::EBUSY,
            BlkError::Io => libc::EIO,
            BlkError::Invalid => libc::EINVAL,
            BlkError::Perm => libc::EPERM,
            BlkError::Access => libc::EACCES,
            BlkError::NotSupported => libc::EOPNOTSUPP,
            BlkError::Proto => libc::EPROTO,
            BlkError::ProtoNotSupported => libc::EPROTONOSUPPORT,
            BlkError::NoParent => 0,
        }
    }
}

impl From<BlkError> for std::io::Error {
    fn from(e: BlkError) -> Self {
        std::io::Error::from_raw_os_error(e.errno().max(1))
    }
}

impl From<std::io::Error> for BlkError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::EBUSY) | Some(libc::EAGAIN) => BlkError::Busy,
            Some(libc::EINVAL) => BlkError::Invalid,
            Some(libc::EPERM) => BlkError::Perm,
            Some(libc::EACCES) => BlkError::Access,
            _ => BlkError::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BlkError::Busy, true)]
    #[case(BlkError::Io, true)]
    #[case(BlkError::Invalid, false)]
    #[case(BlkError::Perm, false)]
    #[case(BlkError::Access, false)]
    #[case(BlkError::NotSupported, false)]
    #[case(BlkError::Proto, false)]
    #[case(BlkError::ProtoNotSupported, false)]
    #[case(BlkError::NoParent, false)]
    fn is_retryable_matches_busy_and_io_only(#[case] err: BlkError, #[case] retryable: bool) {
        assert_eq!(err.is_retryable(), retryable);
    }

    #[rstest]
    #[case(BlkError::Io, true)]
    #[case(BlkError::Busy, false)]
    #[case(BlkError::Invalid, false)]
    fn warn_on_retry_only_for_eio(#[case] err: BlkError, #[case] warns: bool) {
        assert_eq!(err.warn_on_retry(), warns);
    }

    #[rstest]
    #[case(BlkError::Busy, libc::EBUSY)]
    #[case(BlkError::Io, libc::EIO)]
    #[case(BlkError::Invalid, libc::EINVAL)]
    #[case(BlkError::Perm, libc::EPERM)]
    #[case(BlkError::Access, libc::EACCES)]
    #[case(BlkError::NotSupported, libc::EOPNOTSUPP)]
    #[case(BlkError::Proto, libc::EPROTO)]
    #[case(BlkError::ProtoNotSupported, libc::EPROTONOSUPPORT)]
    fn errno_matches_posix_code(#[case] err: BlkError, #[case] errno: i32) {
        assert_eq!(err.errno(), errno);
    }

    #[rstest]
    #[case(std::io::Error::from_raw_os_error(libc::EBUSY), BlkError::Busy)]
    #[case(std::io::Error::from_raw_os_error(libc::EAGAIN), BlkError::Busy)]
    #[case(std::io::Error::from_raw_os_error(libc::EINVAL), BlkError::Invalid)]
    #[case(std::io::Error::from_raw_os_error(libc::EPERM), BlkError::Perm)]
    #[case(std::io::Error::from_raw_os_error(libc::EACCES), BlkError::Access)]
    #[case(std::io::Error::from_raw_os_error(libc::ENOSPC), BlkError::Io)]
    fn from_io_error_classifies_raw_errno(#[case] io_err: std::io::Error, #[case] want: BlkError) {
        assert_eq!(BlkError::from(io_err), want);
    }
}
