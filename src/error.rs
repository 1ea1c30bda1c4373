//! Error types.


use thiserror::Error;


/// NT status codes the errors of this crate map onto.
pub mod nt_status {
    pub const SUCCESS: u32 = 0x0000_0000;
    pub const MORE_PROCESSING_REQUIRED: u32 = 0xC000_0016;
    pub const UNSUCCESSFUL: u32 = 0xC000_0001;
    pub const INVALID_PARAMETER: u32 = 0xC000_000D;
    pub const NO_MEMORY: u32 = 0xC000_0017;
    pub const ACCESS_DENIED: u32 = 0xC000_0022;
    pub const LOGON_FAILURE: u32 = 0xC000_006D;
    pub const INSUFFICIENT_RESOURCES: u32 = 0xC000_009A;
    pub const REQUEST_NOT_ACCEPTED: u32 = 0xC000_00D0;
}


/// An error that may occur while parsing data received from the peer.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum ParsingError {
    /// The buffer is shorter than the structure it should contain.
    #[error("buffer too short (expected at least {expected_min_len} bytes, obtained {obtained_len})")]
    ShortBuffer { expected_min_len: usize, obtained_len: usize },

    /// The protocol identifier does not match the expected one.
    #[error("mismatched protocol id (expected {expected:02x?}, obtained {obtained:02x?})")]
    MagicMismatch { expected: [u8; 4], obtained: [u8; 4] },

    /// The declared structure size is not the one defined by the protocol.
    #[error("unexpected structure size (expected {expected}, obtained {obtained})")]
    StructureSize { expected: u16, obtained: u16 },

    /// An offset or length points outside the message.
    #[error("offset {offset} with length {length} exceeds message of {message_len} bytes")]
    OutOfRange { offset: usize, length: usize, message_len: usize },

    /// A mandatory negotiate context appears the wrong number of times.
    #[error("expected exactly one negotiate context of type {context_type:#06x}, obtained {count}")]
    ContextCount { context_type: u16, count: usize },

    /// The peer offered no dialect we support.
    #[error("no common dialect")]
    NoCommonDialect,

    /// The peer offered no algorithm we support for a mandatory capability.
    #[error("no supported algorithm in context of type {context_type:#06x}")]
    NoCommonAlgorithm { context_type: u16 },

    /// The transform header flags carry a value we do not understand.
    #[error("unexpected transform flags {0:#06x}")]
    TransformFlags(u16),

    /// The original message size in a transform header disagrees with the payload.
    #[error("transform header announces {announced} bytes but {obtained} follow")]
    TransformSize { announced: usize, obtained: usize },

    /// A value does not fit the length field that has to describe it.
    #[error("{obtained_len} bytes exceed the maximum of {max_len}")]
    TooLong { max_len: usize, obtained_len: usize },

    /// A field value is not allowed in the current state.
    #[error("{0}")]
    Unexpected(&'static str),
}


/// An error that may occur while computing a challenge response.
#[derive(Clone, Copy, Debug, Eq, Error, Hash, PartialEq)]
pub enum CryptError {
    /// A transient buffer could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// A response slot was not reserved large enough for the selected algorithm.
    #[error("response blob not allocated for the selected crypter")]
    MissingBlob,
}


/// The crate-wide error type.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum Error {
    /// A transient allocation failed; the current attempt may be retried.
    #[error("out of memory")]
    OutOfMemory,

    /// The peer sent malformed negotiation data.
    #[error("invalid parameter: {0}")]
    InvalidParameter(#[from] ParsingError),

    /// Authentication failed.
    #[error("logon failure")]
    LogonFailure,

    /// A protected message failed its integrity check or belongs to no known session.
    #[error("access denied")]
    AccessDenied,

    /// No free user or handle slot.
    #[error("insufficient resources")]
    InsufficientResources,

    /// No free connection slot.
    #[error("request not accepted")]
    RequestNotAccepted,

    /// The operation is not valid in the current state.
    #[error("unsuccessful")]
    Unsuccessful,
}
impl Error {
    /// Returns the NT status code reported to the peer for this error.
    pub fn nt_status(&self) -> u32 {
        match self {
            Self::OutOfMemory => nt_status::NO_MEMORY,
            Self::InvalidParameter(_) => nt_status::INVALID_PARAMETER,
            Self::LogonFailure => nt_status::LOGON_FAILURE,
            Self::AccessDenied => nt_status::ACCESS_DENIED,
            Self::InsufficientResources => nt_status::INSUFFICIENT_RESOURCES,
            Self::RequestNotAccepted => nt_status::REQUEST_NOT_ACCEPTED,
            Self::Unsuccessful => nt_status::UNSUCCESSFUL,
        }
    }
}
impl From<CryptError> for Error {
    fn from(e: CryptError) -> Self {
        match e {
            CryptError::OutOfMemory => Self::OutOfMemory,
            CryptError::MissingBlob => Self::LogonFailure,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypt_errors_map_to_logon_statuses() {
        assert_eq!(Error::from(CryptError::OutOfMemory), Error::OutOfMemory);
        assert_eq!(Error::from(CryptError::MissingBlob), Error::LogonFailure);
        assert_eq!(Error::LogonFailure.nt_status(), 0xC000_006D);
    }

    #[test]
    fn parsing_errors_are_invalid_parameter() {
        let e: Error = ParsingError::ContextCount { context_type: 1, count: 2 }.into();
        assert_eq!(e.nt_status(), nt_status::INVALID_PARAMETER);
        assert_eq!(
            e.to_string(),
            "invalid parameter: expected exactly one negotiate context of type 0x0001, obtained 2",
        );
    }
}
