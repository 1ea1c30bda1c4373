//! Session security for SMB2 and SMB3.
//!
//! This crate covers what happens between opening a connection and exchanging protected
//! messages over it:
//!
//! * password hashing and the legacy LM/NTLM challenge responses ([`credential`], [`crypter`]),
//! * dialect, cipher and pre-authentication hash negotiation ([`negotiate`], [`preauth`]),
//! * session setup with per-level fallback and key derivation ([`logon`], [`kdf`], [`signing`]),
//! * encryption of whole messages under a transform header ([`transform`]).
//!
//! Message I/O and the SPNEGO token exchange are left to the caller, who plugs them in via
//! [`logon::SessionSetupTransport`] and [`logon::SpnegoEngine`].
//!
//! Sample usage:
//! ```
//! use smbsec::{Credential, Crypter, CrypterPair, HashedCredential};
//!
//! let creds = Credential::new("WORK", "alice", "Secr3t!");
//! let hashed = HashedCredential::hash(&creds)
//!     .expect("failed to hash credentials");
//!
//! // the server challenge comes from the negotiation
//! let server_challenge = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
//! let result = smbsec::crypter::encrypt(
//!     CrypterPair::new(Crypter::None, Crypter::NtlmV2),
//!     &creds,
//!     &hashed,
//!     &server_challenge,
//!     None,
//! ).expect("failed to compute response");
//!
//! // HMAC proof, then the 36-byte blob
//! assert_eq!(result.pass2().len(), 52);
//! assert_eq!(result.mac_key().len(), 16);
//! ```


#[cfg(windows)]
mod encoding_windows;

#[cfg(not(windows))]
mod encoding_utf8;

pub mod config;
pub mod credential;
pub mod crypter;
pub mod error;
pub mod kdf;
pub mod logon;
pub mod negotiate;
pub mod preauth;
pub mod registry;
pub mod signing;
pub mod transform;
mod wire;


pub use crate::config::SecurityConfig;
pub use crate::credential::{Credential, HashedCredential};
pub use crate::crypter::{CryptResult, Crypter, CrypterPair};
pub use crate::error::{CryptError, Error, ParsingError};
pub use crate::logon::{ClientConnection, LogonOrchestrator, SessionSetupTransport, SpnegoEngine};
pub use crate::negotiate::{Cipher, Dialect, NegotiationState};
pub use crate::registry::{SessionRegistry, UserSecurityState};
pub use crate::transform::{decrypt_message, encrypt_message};
