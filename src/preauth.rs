//! The SMB 3.1.1 pre-authentication integrity hash.
//!
//! Every negotiate and session-setup message is chained into a running SHA-512 value:
//! `H(n) = SHA-512(H(n-1) ∥ message)`, starting from 64 zero bytes. The final value feeds the
//! key derivation, binding the keys to the exact handshake.


use sha2::{Digest, Sha512};

use crate::error::Error;


/// The size of a pre-authentication integrity hash value.
pub const PREAUTH_HASH_LEN: usize = 64;

pub type PreauthHashValue = [u8; PREAUTH_HASH_LEN];


/// A hash algorithm usable for pre-authentication integrity.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum HashAlgorithm {
    Sha512,
}
impl HashAlgorithm {
    pub const SHA512_ID: u16 = 0x0001;

    /// Maps a wire identifier onto a supported algorithm.
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            Self::SHA512_ID => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn id(self) -> u16 {
        match self {
            Self::Sha512 => Self::SHA512_ID,
        }
    }
}


/// The running pre-authentication integrity hash of a connection or session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PreauthIntegrity {
    /// The dialect does not use pre-authentication integrity; updates are ignored.
    Unsupported,

    InProgress(PreauthHashValue),

    /// The handshake is complete; the value is frozen.
    Finished(PreauthHashValue),
}
impl Default for PreauthIntegrity {
    fn default() -> Self {
        Self::Unsupported
    }
}
impl PreauthIntegrity {
    /// Starts a fresh chain.
    pub fn begin() -> Self {
        Self::InProgress([0; PREAUTH_HASH_LEN])
    }

    /// Whether messages are currently being chained.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress(_))
    }

    /// Chains one complete message (header and body).
    pub fn update(&mut self, message: &[u8]) -> Result<(), Error> {
        match self {
            Self::InProgress(value) => {
                let mut hasher = Sha512::new();
                hasher.update(&value[..]);
                hasher.update(message);
                *value = hasher.finalize().into();
                Ok(())
            },
            Self::Unsupported => Ok(()),
            Self::Finished(_) => Err(Error::Unsuccessful),
        }
    }

    /// Stops chaining; later updates are refused.
    pub fn finish(&mut self) {
        if let Self::InProgress(value) = self {
            *self = Self::Finished(*value);
        }
    }

    /// The current value, if the dialect uses one.
    pub fn value(&self) -> Option<&PreauthHashValue> {
        match self {
            Self::InProgress(value) | Self::Finished(value) => Some(value),
            Self::Unsupported => None,
        }
    }

    /// A chain for a new session, continuing from this connection's current value.
    pub fn fork(&self) -> Self {
        match self {
            Self::InProgress(value) | Self::Finished(value) => Self::InProgress(*value),
            Self::Unsupported => Self::Unsupported,
        }
    }
}
