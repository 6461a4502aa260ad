//! Error taxonomy shared across the node.
//!
//! Kinds are partitioned the way the public API reports them: fatal
//! startup errors surface from `start`, transport errors stay internal and
//! are logged, protocol violations are answered on the wire and fed to the
//! suspicious-node detector, and storage/crypto conflicts surface to the
//! caller of the operation that produced them.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Operation requires a state the node is not in (usually: not running).
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or out-of-contract message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message too big: {0} bytes")]
    MessageTooBig(usize),

    #[error("unknown method")]
    MethodUnknown,

    #[error("invalid signature")]
    InvalidSignature,

    /// Immutable record under an id that holds a mutable one, or vice versa.
    #[error("immutable substitution")]
    ImmutableSubstitution,

    #[error("sequence number not monotonic")]
    SequenceNotMonotonic,

    /// Compare-and-swap expectation did not match the stored sequence.
    #[error("cas failed")]
    CasFail,

    #[error("value not exists")]
    ValueNotExists,

    #[error("not the value owner")]
    NotValueOwner,

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("call timed out")]
    Timeout,

    /// Error message received from a remote node.
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("cancelled")]
    Cancelled,
}

/// Wire-level error codes carried in `e` bodies.
///
/// The numeric values are part of the protocol; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    ProtocolError = 201,
    ServerError = 202,
    MethodUnknown = 203,
    MessageTooBig = 204,
    InvalidSignature = 205,
    ImmutableSubstitutionFail = 206,
    SequenceNotMonotonic = 207,
    CasFail = 208,
    ValueNotExists = 209,
    NotValueOwner = 210,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        Some(match code {
            201 => Self::ProtocolError,
            202 => Self::ServerError,
            203 => Self::MethodUnknown,
            204 => Self::MessageTooBig,
            205 => Self::InvalidSignature,
            206 => Self::ImmutableSubstitutionFail,
            207 => Self::SequenceNotMonotonic,
            208 => Self::CasFail,
            209 => Self::ValueNotExists,
            210 => Self::NotValueOwner,
            _ => return None,
        })
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::ProtocolError => "protocol error",
            Self::ServerError => "server error",
            Self::MethodUnknown => "method unknown",
            Self::MessageTooBig => "message too big",
            Self::InvalidSignature => "invalid signature",
            Self::ImmutableSubstitutionFail => "immutable substitution fail",
            Self::SequenceNotMonotonic => "sequence not monotonic",
            Self::CasFail => "cas fail",
            Self::ValueNotExists => "value not exists",
            Self::NotValueOwner => "not value owner",
        }
    }
}

impl Error {
    /// Wire code for errors that are answered on the wire; `None` for
    /// purely local kinds.
    pub fn wire_code(&self) -> Option<ErrorCode> {
        Some(match self {
            Error::Protocol(_) => ErrorCode::ProtocolError,
            Error::MessageTooBig(_) => ErrorCode::MessageTooBig,
            Error::MethodUnknown => ErrorCode::MethodUnknown,
            Error::InvalidSignature => ErrorCode::InvalidSignature,
            Error::ImmutableSubstitution => ErrorCode::ImmutableSubstitutionFail,
            Error::SequenceNotMonotonic => ErrorCode::SequenceNotMonotonic,
            Error::CasFail => ErrorCode::CasFail,
            Error::ValueNotExists => ErrorCode::ValueNotExists,
            Error::NotValueOwner => ErrorCode::NotValueOwner,
            Error::Storage(_) => ErrorCode::ServerError,
            _ => return None,
        })
    }

    /// Map a remote error body back onto the local taxonomy.
    pub fn from_remote(code: i32, message: String) -> Self {
        match ErrorCode::from_i32(code) {
            Some(ErrorCode::InvalidSignature) => Error::InvalidSignature,
            Some(ErrorCode::ImmutableSubstitutionFail) => Error::ImmutableSubstitution,
            Some(ErrorCode::SequenceNotMonotonic) => Error::SequenceNotMonotonic,
            Some(ErrorCode::CasFail) => Error::CasFail,
            Some(ErrorCode::ValueNotExists) => Error::ValueNotExists,
            Some(ErrorCode::NotValueOwner) => Error::NotValueOwner,
            _ => Error::Remote { code, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trip() {
        for code in [
            ErrorCode::ProtocolError,
            ErrorCode::ServerError,
            ErrorCode::MethodUnknown,
            ErrorCode::MessageTooBig,
            ErrorCode::InvalidSignature,
            ErrorCode::ImmutableSubstitutionFail,
            ErrorCode::SequenceNotMonotonic,
            ErrorCode::CasFail,
            ErrorCode::ValueNotExists,
            ErrorCode::NotValueOwner,
        ] {
            assert_eq!(ErrorCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ErrorCode::from_i32(0), None);
    }

    #[test]
    fn storage_conflicts_map_to_wire_codes() {
        assert_eq!(
            Error::SequenceNotMonotonic.wire_code(),
            Some(ErrorCode::SequenceNotMonotonic)
        );
        assert_eq!(
            Error::ImmutableSubstitution.wire_code(),
            Some(ErrorCode::ImmutableSubstitutionFail)
        );
        assert!(Error::Timeout.wire_code().is_none());
    }

    #[test]
    fn remote_error_mapping() {
        let err = Error::from_remote(207, "seq".into());
        assert!(matches!(err, Error::SequenceNotMonotonic));
        let err = Error::from_remote(599, "odd".into());
        assert!(matches!(err, Error::Remote { code: 599, .. }));
    }
}
