//! SMB3 key derivation.
//!
//! Keys are derived with the SP800-108 counter-mode KDF over HMAC-SHA256, one label/context
//! pair per key. SMB 3.1.1 uses the pre-authentication integrity hash as the context.


use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::Error;
use crate::negotiate::Dialect;
use crate::preauth::PreauthHashValue;


type HmacSha256 = Hmac<Sha256>;

/// The length of every derived key.
pub const DERIVED_KEY_LEN: usize = 16;

pub type DerivedKey = [u8; DERIVED_KEY_LEN];


/// Which end of the connection the keys are derived for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    Client,
    Server,
}


/// A label and context pair fed to the KDF.
struct KeyLabel {
    label: &'static [u8],
    context: &'static [u8],
}

const SMB30_SIGNING: KeyLabel = KeyLabel { label: b"SMB2AESCMAC\0", context: b"SmbSign\0" };
const SMB30_APPLICATION: KeyLabel = KeyLabel { label: b"SMB2APP\0", context: b"SmbRpc\0" };
const SMB30_SERVER_IN: KeyLabel = KeyLabel { label: b"SMB2AESCCM\0", context: b"ServerIn \0" };
const SMB30_SERVER_OUT: KeyLabel = KeyLabel { label: b"SMB2AESCCM\0", context: b"ServerOut\0" };

const SMB311_SIGNING: &[u8] = b"SMBSigningKey\0";
const SMB311_APPLICATION: &[u8] = b"SMBAppKey\0";
const SMB311_C2S_CIPHER: &[u8] = b"SMBC2SCipherKey\0";
const SMB311_S2C_CIPHER: &[u8] = b"SMBS2CCipherKey\0";


/// Derives a 128-bit key: `HMAC-SHA256(key, i ∥ label ∥ 0x00 ∥ context ∥ L)` with `i = 1`
/// and `L = 128`, both 32-bit big-endian.
pub fn kdf_hmac_sha256(key: &[u8], label: &[u8], context: &[u8]) -> DerivedKey {
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(&1u32.to_be_bytes());
    mac.update(label);
    mac.update(&[0x00]);
    mac.update(context);
    mac.update(&128u32.to_be_bytes());

    let mut ret = [0u8; DERIVED_KEY_LEN];
    ret.copy_from_slice(&mac.finalize().into_bytes()[..DERIVED_KEY_LEN]);
    ret
}


/// The keys protecting one SMB3 session, from the point of view of one role.
#[derive(Clone, Eq, PartialEq)]
pub struct SessionKeys {
    pub signing: DerivedKey,

    /// Encrypts what this role sends.
    pub encryption: DerivedKey,

    /// Decrypts what this role receives.
    pub decryption: DerivedKey,

    pub application: DerivedKey,
}
impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}
impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.signing.fill(0);
        self.encryption.fill(0);
        self.decryption.fill(0);
        self.application.fill(0);
    }
}


/// Derives the SMB3 keys of a session.
///
/// `session_key` is truncated or zero-padded to 16 bytes. Dialect 3.1.1 requires the
/// session's final pre-authentication hash; earlier SMB3 dialects use fixed contexts.
/// Dialects before 3.0 derive nothing and fail with `Unsuccessful`.
pub fn derive_session_keys(
    session_key: &[u8],
    dialect: Dialect,
    preauth_hash: Option<&PreauthHashValue>,
    role: Role,
) -> Result<SessionKeys, Error> {
    let mut key = [0u8; DERIVED_KEY_LEN];
    let take = session_key.len().min(DERIVED_KEY_LEN);
    key[..take].copy_from_slice(&session_key[..take]);

    let (signing, server_in, server_out, application) = match dialect {
        Dialect::Smb300 | Dialect::Smb302 => (
            kdf_hmac_sha256(&key, SMB30_SIGNING.label, SMB30_SIGNING.context),
            kdf_hmac_sha256(&key, SMB30_SERVER_IN.label, SMB30_SERVER_IN.context),
            kdf_hmac_sha256(&key, SMB30_SERVER_OUT.label, SMB30_SERVER_OUT.context),
            kdf_hmac_sha256(&key, SMB30_APPLICATION.label, SMB30_APPLICATION.context),
        ),
        Dialect::Smb311 => {
            let context = match preauth_hash {
                Some(value) => &value[..],
                None => {
                    key.fill(0);
                    return Err(Error::Unsuccessful);
                },
            };
            (
                kdf_hmac_sha256(&key, SMB311_SIGNING, context),
                kdf_hmac_sha256(&key, SMB311_C2S_CIPHER, context),
                kdf_hmac_sha256(&key, SMB311_S2C_CIPHER, context),
                kdf_hmac_sha256(&key, SMB311_APPLICATION, context),
            )
        },
        Dialect::Smb202 | Dialect::Smb210 | Dialect::Smb2Wildcard => {
            key.fill(0);
            return Err(Error::Unsuccessful);
        },
    };
    key.fill(0);

    let (encryption, decryption) = match role {
        Role::Client => (server_in, server_out),
        Role::Server => (server_out, server_in),
    };
    Ok(SessionKeys {
        signing,
        encryption,
        decryption,
        application,
    })
}
