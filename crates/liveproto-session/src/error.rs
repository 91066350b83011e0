use liveproto_storage::StorageError;
use liveproto_tl::TlError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(#[from] TlError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("corrupt session field {field}: {reason}")]
    Corrupt { field: String, reason: String },
    #[error("session not loaded")]
    NotLoaded,
}

impl Error {
    pub(crate) fn corrupt(field: &str, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the caller can carry on with the current session.
    ///
    /// Storage errors are recoverable once a session is established (a later
    /// save may succeed). Everything else leaves no usable state.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Protocol(e) => e.is_protocol_violation(),
            Error::Storage(_) => false,
            Error::Configuration(_) | Error::Corrupt { .. } | Error::NotLoaded => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Configuration("bad mode".into()).is_fatal());
        assert!(Error::Protocol(TlError::InvalidVector { found: 1 }).is_fatal());
        assert!(!Error::Protocol(TlError::UnsupportedWidth(7)).is_fatal());
        assert!(!Error::Storage(StorageError::LockPoisoned).is_fatal());
        assert!(Error::corrupt("dc", "missing").is_fatal());
    }

    #[test]
    fn test_messages() {
        let err = Error::corrupt("port", "expected integer");
        assert_eq!(
            err.to_string(),
            "corrupt session field port: expected integer"
        );
    }
}
