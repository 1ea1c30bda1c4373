//! Plaintext credentials and the legacy password hashes derived from them.


use std::fmt;

use cipher::{BlockEncrypt, KeyInit};
use cipher::generic_array::GenericArray;
use des::Des;
use digest::Digest;
use hmac::{Hmac, Mac};
use md4::Md4;
use md5::Md5;

#[cfg(windows)]
use crate::encoding_windows::password_to_oem;

#[cfg(not(windows))]
use crate::encoding_utf8::password_to_oem;

use crate::error::Error;


/// The fixed plaintext encrypted by both halves of the LM hash.
const LM_MAGIC: [u8; 8] = *b"KGS!@#$%";


/// Plaintext logon credentials, consisting of domain, username and password.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Credential {
    /// The Kerberos-style realm, if the caller knows one.
    pub realm: Option<String>,

    /// The NetBIOS domain name. Empty for local accounts.
    pub domain: String,

    /// The username. May be a user principal name (`user@dns.domain`).
    pub username: String,

    /// The password.
    pub password: String,
}
impl Credential {
    /// The anonymous identity. A credential is anonymous iff it equals this value.
    pub const ANONYMOUS: Credential = Credential {
        realm: None,
        domain: String::new(),
        username: String::new(),
        password: String::new(),
    };

    /// Creates a credential without a realm.
    pub fn new(domain: &str, username: &str, password: &str) -> Self {
        Self {
            realm: None,
            domain: domain.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    /// Whether this is the anonymous identity.
    pub fn is_anonymous(&self) -> bool {
        *self == Self::ANONYMOUS
    }
}
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("realm", &self.realm)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}


/// The two legacy one-way password hashes every response algorithm is keyed with.
///
/// Both hashes are wiped when the value is dropped.
pub struct HashedCredential {
    /// The LAN Manager hash.
    pub lm: [u8; 16],

    /// The NT hash, MD4 over the UTF-16 password.
    pub ntlm: [u8; 16],
}
impl HashedCredential {
    /// Derives both hashes from the password of `credential`.
    ///
    /// Fails only if the transient OEM password buffer cannot be allocated.
    pub fn hash(credential: &Credential) -> Result<Self, Error> {
        let lm = lm_owf(&credential.password)?;
        let ntlm = nt_owf(&credential.password);
        Ok(Self { lm, ntlm })
    }
}
impl fmt::Debug for HashedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashedCredential").finish_non_exhaustive()
    }
}
impl Drop for HashedCredential {
    fn drop(&mut self) {
        self.lm.fill(0);
        self.ntlm.fill(0);
    }
}


/// Spreads 56 key bits over the eight bytes DES expects, leaving the parity bits clear.
pub(crate) fn des_key_from_7(key: &[u8; 7]) -> [u8; 8] {
    [
        key[0] & 0xFE,
        (key[0] << 7) | ((key[1] >> 1) & 0xFE),
        (key[1] << 6) | ((key[2] >> 2) & 0xFE),
        (key[2] << 5) | ((key[3] >> 3) & 0xFE),
        (key[3] << 4) | ((key[4] >> 4) & 0xFE),
        (key[4] << 3) | ((key[5] >> 5) & 0xFE),
        (key[5] << 2) | ((key[6] >> 6) & 0xFE),
        key[6] << 1,
    ]
}

/// Encrypts one block with a 56-bit key.
pub(crate) fn des_7(key: &[u8; 7], data: [u8; 8]) -> [u8; 8] {
    let mut full_key = des_key_from_7(key);
    let des = Des::new(&GenericArray::from(full_key));
    full_key.fill(0);

    let mut block = GenericArray::from(data);
    des.encrypt_block(&mut block);
    block.into()
}


/// Derives the LAN Manager hash from a password.
///
/// ```plain
/// uppercase ─ OEM encode ─ pad/truncate to 14 B ─ split 7|7 ─ DES("KGS!@#$%") each ─ join
/// ```
pub fn lm_owf(password: &str) -> Result<[u8; 16], Error> {
    let uppercase_password = password.to_uppercase();
    let mut oem = password_to_oem(&uppercase_password)
        .ok_or(Error::OutOfMemory)?;

    let mut padded = [0u8; 14];
    let take = oem.len().min(padded.len());
    padded[..take].copy_from_slice(&oem[..take]);
    oem.fill(0);

    let mut output = [0u8; 16];
    let mut half = [0u8; 7];
    half.copy_from_slice(&padded[0..7]);
    output[0..8].copy_from_slice(&des_7(&half, LM_MAGIC));
    half.copy_from_slice(&padded[7..14]);
    output[8..16].copy_from_slice(&des_7(&half, LM_MAGIC));

    half.fill(0);
    padded.fill(0);
    Ok(output)
}


/// Derives the NT hash from a password: MD4 over its UTF-16LE encoding.
pub fn nt_owf(password: &str) -> [u8; 16] {
    let mut password_bytes: Vec<u8> = password.encode_utf16()
        .flat_map(|p| p.to_le_bytes())
        .collect();
    let mut md4_state = <Md4 as Digest>::new();
    md4_state.update(&password_bytes);
    password_bytes.fill(0);
    md4_state.finalize().into()
}


/// Derives the v2 hash shared by LMv2 and NTLMv2.
///
/// HMAC-MD5 keyed with the NT hash over the uppercased UTF-16LE concatenation of username and
/// domain. A username in principal form (containing `@`) already names its domain, so the
/// domain is left out.
pub fn v2_owf(hashed: &HashedCredential, credential: &Credential) -> [u8; 16] {
    let mut identity = credential.username.clone();
    if !credential.username.contains('@') {
        identity.push_str(&credential.domain);
    }
    let identity_bytes: Vec<u8> = identity
        .to_uppercase()
        .encode_utf16()
        .flat_map(|p| p.to_le_bytes())
        .collect();

    let mut hmac_md5 = hmac_md5(&hashed.ntlm);
    hmac_md5.update(&identity_bytes);
    hmac_md5.finalize().into_bytes().into()
}


/// Creates an HMAC-MD5 instance; any key length is acceptable to HMAC.
pub(crate) fn hmac_md5(key: &[u8]) -> Hmac<Md5> {
    match <Hmac<Md5> as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    }
}
