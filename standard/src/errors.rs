use std::io;

use thiserror::Error;

pub type Result<T, E = TetherError> = std::result::Result<T, E>;

/// Errors that cross the wire. Each kind has a public numeric code and a
/// 3-bit discriminant carried in the frame header's errno field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("server error: {0}")]
    Generic(String),

    #[error("Invalid Content: {0}")]
    ContentVerifyFailed(String),

    #[error("function not implemented: '{0}'")]
    FunctionNotImplemented(String),

    #[error("Internal Error: {0}")]
    RemoteInternal(String),

    #[error("Invalid Frame: {0}")]
    Frame(String),

    #[error("Can't pack or unpack body because of {0}")]
    PackUnpack(String),
}

impl RemoteError {
    /// Public numeric error code.
    pub fn code(&self) -> u16 {
        match self {
            RemoteError::Generic(_) => 100,
            RemoteError::ContentVerifyFailed(_) => 402,
            RemoteError::FunctionNotImplemented(_) => 404,
            RemoteError::RemoteInternal(_) => 500,
            RemoteError::Frame(_) => 509,
            RemoteError::PackUnpack(_) => 510,
        }
    }

    /// The discriminant written into the header's 3-bit errno field.
    pub fn wire_errno(&self) -> u8 {
        match self {
            RemoteError::Generic(_) => 1,
            RemoteError::ContentVerifyFailed(_) => 2,
            RemoteError::FunctionNotImplemented(_) => 3,
            RemoteError::RemoteInternal(_) => 4,
            RemoteError::Frame(_) => 5,
            RemoteError::PackUnpack(_) => 6,
        }
    }

    /// Rehydrate an error from a decoded errno. Unknown values fall back to
    /// the generic kind.
    pub fn from_wire(errno: u8, message: String) -> Self {
        match errno {
            2 => RemoteError::ContentVerifyFailed(message),
            3 => RemoteError::FunctionNotImplemented(message),
            4 => RemoteError::RemoteInternal(message),
            5 => RemoteError::Frame(message),
            6 => RemoteError::PackUnpack(message),
            _ => RemoteError::Generic(message),
        }
    }
}

#[derive(Error, Debug)]
pub enum TetherError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("connection lost")]
    ConnectionLost,

    #[error("request timed out")]
    Timeout,

    #[error("sequence id {0} is already in flight on this connection")]
    DuplicateSequence(u16),

    #[error("invalid declaration: {0}")]
    Declaration(String),
}

impl TetherError {
    /// Transport-class failures are the only ones the client retries.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TetherError::Io(_) | TetherError::ConnectionLost | TetherError::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let kinds = [
            (RemoteError::Generic("x".into()), 100, 1),
            (RemoteError::ContentVerifyFailed("x".into()), 402, 2),
            (RemoteError::FunctionNotImplemented("x".into()), 404, 3),
            (RemoteError::RemoteInternal("x".into()), 500, 4),
            (RemoteError::Frame("x".into()), 509, 5),
            (RemoteError::PackUnpack("x".into()), 510, 6),
        ];

        for (err, code, wire) in kinds {
            assert_eq!(err.code(), code);
            assert_eq!(err.wire_errno(), wire);
            let back = RemoteError::from_wire(wire, "x".into());
            assert_eq!(back.wire_errno(), err.wire_errno());
        }
    }

    #[test]
    fn test_unknown_wire_code_falls_back_to_generic() {
        let err = RemoteError::from_wire(7, "mystery".into());
        assert_eq!(err, RemoteError::Generic("mystery".into()));
        let err = RemoteError::from_wire(0, "zero".into());
        assert_eq!(err.code(), 100);
    }

    #[test]
    fn test_transport_classification() {
        assert!(TetherError::ConnectionLost.is_transport());
        assert!(TetherError::Timeout.is_transport());
        assert!(TetherError::Io(io::Error::new(io::ErrorKind::Other, "x")).is_transport());
        assert!(!TetherError::Remote(RemoteError::Generic("x".into())).is_transport());
        assert!(!TetherError::DuplicateSequence(9).is_transport());
    }

    #[test]
    fn test_message_formats() {
        let err = RemoteError::FunctionNotImplemented("nope".into());
        assert_eq!(err.to_string(), "function not implemented: 'nope'");

        let err = RemoteError::ContentVerifyFailed("missing argument: n".into());
        assert_eq!(err.to_string(), "Invalid Content: missing argument: n");
    }
}
