//! Coded Errors
//!
//! Every failure raised by the backing store, or by a protocol handler acting on
//! top of it, is a [`StoreError`]: a numeric code plus a message.
//!
//! The code space is split in two by [`ERROR_CODE_MAX`]:
//!
//! ```text
//!   0 ..= ERROR_CODE_MAX          generic backing-store errors
//!   ERROR_CODE_MAX + kind.code()  protocol-defined error kinds (ErrorKind)
//! ```
//!
//! The connection engine uses this split to decide whether an error is handed
//! to the protocol's own error formatter or reported as a generic server error.

use std::fmt;
use thiserror::Error;

/// Highest code reserved for generic backing-store errors.
pub const ERROR_CODE_MAX: u32 = 1024;

/// Generic backing-store error codes (all `<= ERROR_CODE_MAX`).
pub mod codes {
    /// Unclassified failure.
    pub const UNKNOWN: u32 = 0;
    /// Invalid parameters passed to a store call.
    pub const ILLEGAL_PARAMS: u32 = 1;
    /// A space with this id already exists.
    pub const SPACE_EXISTS: u32 = 10;
    /// The referenced space does not exist.
    pub const NO_SUCH_SPACE: u32 = 36;
}

/// Result type for backing-store and protocol operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error kinds understood by the wire protocols.
///
/// The discriminants match the memcached binary protocol status codes, so the
/// binary handler can put them on the wire as-is and the text handler maps
/// them onto its keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorKind {
    /// Key not found
    KeyNotFound = 0x01,
    /// Key exists (or CAS mismatch)
    KeyExists = 0x02,
    /// Value too large
    TooLarge = 0x03,
    /// Invalid arguments / malformed request
    InvalidArguments = 0x04,
    /// Item not stored
    NotStored = 0x05,
    /// Incr/decr on a non-numeric value
    DeltaBadValue = 0x06,
    /// Unknown command
    UnknownCommand = 0x81,
    /// Out of memory
    OutOfMemory = 0x82,
    /// Not supported (or disabled by configuration)
    NotSupported = 0x83,
    /// Internal server error
    ServerError = 0x84,
}

impl ErrorKind {
    const ALL: [ErrorKind; 10] = [
        ErrorKind::KeyNotFound,
        ErrorKind::KeyExists,
        ErrorKind::TooLarge,
        ErrorKind::InvalidArguments,
        ErrorKind::NotStored,
        ErrorKind::DeltaBadValue,
        ErrorKind::UnknownCommand,
        ErrorKind::OutOfMemory,
        ErrorKind::NotSupported,
        ErrorKind::ServerError,
    ];

    /// Wire status code of this kind.
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Looks up a kind by its wire status code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| u32::from(kind.code()) == code)
    }

    /// Default human-readable message for this kind.
    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::KeyNotFound => "Not found",
            ErrorKind::KeyExists => "Data exists for key",
            ErrorKind::TooLarge => "object too large for cache",
            ErrorKind::InvalidArguments => "bad command line format",
            ErrorKind::NotStored => "Not stored",
            ErrorKind::DeltaBadValue => "cannot increment or decrement non-numeric value",
            ErrorKind::UnknownCommand => "Unknown command",
            ErrorKind::OutOfMemory => "out of memory storing object",
            ErrorKind::NotSupported => "Not supported",
            ErrorKind::ServerError => "Internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A coded error raised by the backing store or a protocol handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("error {code}: {message}")]
pub struct StoreError {
    code: u32,
    message: String,
}

impl StoreError {
    /// Creates an error with an explicit code.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates a protocol-level error of the given kind.
    pub fn protocol(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(ERROR_CODE_MAX + u32::from(kind.code()), message)
    }

    /// Shorthand for a protocol error carrying the kind's default message.
    pub fn kind(kind: ErrorKind) -> Self {
        Self::protocol(kind, kind.message())
    }

    pub fn no_such_space(space: u32) -> Self {
        Self::new(codes::NO_SUCH_SPACE, format!("Space '{}' does not exist", space))
    }

    pub fn space_exists(space: u32) -> Self {
        Self::new(codes::SPACE_EXISTS, format!("Space '{}' already exists", space))
    }

    /// The numeric error code.
    pub fn code(&self) -> u32 {
        self.code
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the protocol error kind if the code lies above [`ERROR_CODE_MAX`].
    ///
    /// Codes above the boundary that do not name a known kind are reported as
    /// [`ErrorKind::ServerError`].
    pub fn protocol_kind(&self) -> Option<ErrorKind> {
        if self.code > ERROR_CODE_MAX {
            Some(ErrorKind::from_code(self.code - ERROR_CODE_MAX).unwrap_or(ErrorKind::ServerError))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_sit_above_boundary() {
        let err = StoreError::kind(ErrorKind::KeyNotFound);
        assert_eq!(err.code(), ERROR_CODE_MAX + 1);
        assert_eq!(err.protocol_kind(), Some(ErrorKind::KeyNotFound));
    }

    #[test]
    fn test_generic_errors_have_no_kind() {
        let err = StoreError::no_such_space(512);
        assert_eq!(err.code(), codes::NO_SUCH_SPACE);
        assert_eq!(err.protocol_kind(), None);

        let boundary = StoreError::new(ERROR_CODE_MAX, "edge");
        assert_eq!(boundary.protocol_kind(), None);
    }

    #[test]
    fn test_unknown_protocol_code_maps_to_server_error() {
        let err = StoreError::new(ERROR_CODE_MAX + 0x7f, "strange");
        assert_eq!(err.protocol_kind(), Some(ErrorKind::ServerError));
    }

    #[test]
    fn test_kind_codes_round_trip() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_code(u32::from(kind.code())), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(0), None);
    }

    #[test]
    fn test_display() {
        let err = StoreError::new(36, "Space '7' does not exist");
        assert_eq!(err.to_string(), "error 36: Space '7' does not exist");
    }
}
