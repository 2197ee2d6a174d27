/// Errors surfaced by a TLS session.
///
/// Sessions record the first non-transient failure and fail every subsequent
/// operation with a clone of it, so the type is `Clone` and carries owned
/// diagnostic strings rather than source errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TlsError {
    /// Malformed or inconsistent credential material. Fatal at build time.
    #[error("credential error: {reason}")]
    Credential { reason: String },

    /// Transport-level failure from the byte stream under the session.
    #[error("system error: {reason}")]
    System { errno: Option<i32>, reason: String },

    /// The engine returned a non-transient protocol status. `code` is one of
    /// the stable constants in [`crate::codes`].
    #[error("TLS protocol error: {reason}")]
    Protocol {
        code: i32,
        reason: String,
        details: Vec<String>,
    },

    /// Peer certificate verification failed.
    #[error("certificate verification failed: {reason}")]
    Verify {
        reason: String,
        subject: Option<String>,
        issuer: Option<String>,
    },

    /// The transport reached end of input before the session was usable.
    #[error("not connected")]
    NotConnected,

    /// Write attempted after the session was shut down.
    #[error("broken pipe: session is shut down")]
    PipeClosed,

    /// The close deadline fired before the shutdown exchange completed.
    #[error("shutdown timed out")]
    Timeout,
}

/// Coarse classification of a [`TlsError`], used by callers that only care
/// which family a failure belongs to (and by sticky-error assertions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Credential,
    System,
    Protocol,
    Verify,
    NotConnected,
    PipeClosed,
    Timeout,
}

impl TlsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TlsError::Credential { .. } => ErrorKind::Credential,
            TlsError::System { .. } => ErrorKind::System,
            TlsError::Protocol { .. } => ErrorKind::Protocol,
            TlsError::Verify { .. } => ErrorKind::Verify,
            TlsError::NotConnected => ErrorKind::NotConnected,
            TlsError::PipeClosed => ErrorKind::PipeClosed,
            TlsError::Timeout => ErrorKind::Timeout,
        }
    }

    /// The stable protocol code, when this is a protocol error.
    pub fn code(&self) -> Option<i32> {
        match self {
            TlsError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The transport `errno`, when this is a system error that carried one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            TlsError::System { errno, .. } => *errno,
            _ => None,
        }
    }
}

impl From<std::io::Error> for TlsError {
    fn from(err: std::io::Error) -> Self {
        TlsError::System {
            errno: err.raw_os_error(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes;

    #[test]
    fn test_display_simple_variants() {
        assert_eq!(TlsError::NotConnected.to_string(), "not connected");
        assert_eq!(
            TlsError::PipeClosed.to_string(),
            "broken pipe: session is shut down"
        );
        assert_eq!(TlsError::Timeout.to_string(), "shutdown timed out");
    }

    #[test]
    fn test_display_structured_variants() {
        let e = TlsError::Credential {
            reason: "key does not match certificate".into(),
        };
        assert_eq!(
            e.to_string(),
            "credential error: key does not match certificate"
        );

        let e = TlsError::Protocol {
            code: codes::ERROR_DECRYPTION_FAILED,
            reason: "bad record".into(),
            details: vec!["DecryptError".into()],
        };
        assert_eq!(e.to_string(), "TLS protocol error: bad record");
        assert_eq!(e.code(), Some(codes::ERROR_DECRYPTION_FAILED));
    }

    #[test]
    fn test_kind_classification() {
        let verify = TlsError::Verify {
            reason: "no certificate presented by peer".into(),
            subject: None,
            issuer: None,
        };
        assert_eq!(verify.kind(), ErrorKind::Verify);
        assert_eq!(TlsError::NotConnected.kind(), ErrorKind::NotConnected);
        assert!(verify.code().is_none());
    }

    #[test]
    fn test_from_io_error_preserves_errno() {
        let io = std::io::Error::from_raw_os_error(32);
        let e: TlsError = io.into();
        assert_eq!(e.kind(), ErrorKind::System);
        assert_eq!(e.errno(), Some(32));
    }

    #[test]
    fn test_sticky_clone_keeps_kind_and_message() {
        let original = TlsError::Protocol {
            code: codes::ERROR_PREMATURE_TERMINATION,
            reason: "peer closed without close_notify".into(),
            details: Vec::new(),
        };
        let replay = original.clone();
        assert_eq!(replay.kind(), original.kind());
        assert_eq!(replay.to_string(), original.to_string());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TlsError>();
    }
}
