//! Errno classification.
//!
//! Backends pass per-operation failures upward as negative errnos inside
//! completions; this module is the one place that decides what a given
//! errno means for retry and connection lifecycle. The mapping is a pure
//! function so both backends and the runtime agree on it.

/// Categorical outcome of a native errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrnoClass {
    /// Transient; the operation may be reissued (EAGAIN, EINPROGRESS).
    Retryable,
    /// The peer or the path is gone (EPIPE, ECONNRESET, ETIMEDOUT).
    ConnectionLost,
    /// Nobody listening (ECONNREFUSED).
    ConnectionRefused,
    /// Everything else.
    Other,
}

/// Distinct end-of-stream marker delivered in a completion's result.
///
/// Both backends normalize "peer closed the stream" to this value instead
/// of a raw `-1`, which would collide with `-EPERM`. Kept far outside the
/// errno range so it can never be misread as one.
pub const CONNECTION_CLOSED: i64 = -(1 << 30);

/// Classify a native errno. Accepts either sign; the absolute value is used.
pub fn classify(errno: i32) -> ErrnoClass {
    match errno.abs() {
        libc::EAGAIN | libc::EINPROGRESS => ErrnoClass::Retryable,
        libc::EPIPE | libc::ECONNRESET | libc::ETIMEDOUT => ErrnoClass::ConnectionLost,
        libc::ECONNREFUSED => ErrnoClass::ConnectionRefused,
        _ => ErrnoClass::Other,
    }
}

/// A short recovery hint for the class, suitable for handler causes.
pub fn hint(class: ErrnoClass) -> &'static str {
    match class {
        ErrnoClass::Retryable => "transient; retry the operation",
        ErrnoClass::ConnectionLost => "connection lost; reconnect before retrying",
        ErrnoClass::ConnectionRefused => "connection refused; check the remote endpoint",
        ErrnoClass::Other => "unrecoverable for this operation",
    }
}

/// Whether a completion result signals that the kernel rejected a fast-path
/// opcode (fixed buffer, zero-copy, buffer ring) as unsupported. These are
/// the Linux codes for EINVAL and EOPNOTSUPP; they are centralized here so
/// the retry predicate lives next to the classification it bypasses.
pub fn is_feature_unsupported(result: i64) -> bool {
    let e = result.abs();
    e == libc::EINVAL as i64 || e == libc::EOPNOTSUPP as i64
}

/// Whether a completion result is the end-of-stream marker. A bare `-1`
/// from a backend is also accepted for compatibility with read semantics
/// that report EOF that way.
pub fn is_connection_closed(result: i64) -> bool {
    result == CONNECTION_CLOSED || result == -1
}

/// Human-readable rendering of a negative completion result.
pub fn describe(result: i64) -> String {
    if is_connection_closed(result) {
        return "connection closed by peer".to_string();
    }
    let errno = result.unsigned_abs() as i32;
    let class = classify(errno);
    format!(
        "{} (errno {}): {}",
        std::io::Error::from_raw_os_error(errno),
        errno,
        hint(class)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes() {
        assert_eq!(classify(libc::EAGAIN), ErrnoClass::Retryable);
        assert_eq!(classify(-libc::EINPROGRESS), ErrnoClass::Retryable);
    }

    #[test]
    fn connection_lost_codes() {
        for e in [libc::EPIPE, libc::ECONNRESET, libc::ETIMEDOUT] {
            assert_eq!(classify(e), ErrnoClass::ConnectionLost);
            assert_eq!(classify(-e), ErrnoClass::ConnectionLost);
        }
    }

    #[test]
    fn refused_is_its_own_class() {
        assert_eq!(classify(-libc::ECONNREFUSED), ErrnoClass::ConnectionRefused);
    }

    #[test]
    fn everything_else_is_other() {
        assert_eq!(classify(libc::ENOMEM), ErrnoClass::Other);
        assert_eq!(classify(0), ErrnoClass::Other);
    }

    #[test]
    fn feature_probe_matches_einval_and_eopnotsupp() {
        assert!(is_feature_unsupported(-(libc::EINVAL as i64)));
        assert!(is_feature_unsupported(-(libc::EOPNOTSUPP as i64)));
        assert!(!is_feature_unsupported(-(libc::EAGAIN as i64)));
        assert!(!is_feature_unsupported(4));
    }

    #[test]
    fn closed_marker_is_not_an_errno() {
        assert!(is_connection_closed(CONNECTION_CLOSED));
        assert!(is_connection_closed(-1));
        assert!(!is_connection_closed(-(libc::EPIPE as i64)));
        assert_eq!(classify(libc::EPERM), ErrnoClass::Other);
    }
}
