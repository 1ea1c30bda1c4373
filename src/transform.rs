//! SMB3 message encryption.
//!
//! An encrypted message is a transform header followed by the ciphertext of the original
//! message:
//!
//! ```plain
//! 0           4            20       36         40      42      44           52
//! ├ FD 'SMB' ─┼ signature ─┼ nonce ─┼ orig len ┼ resv'd ┼ flags ┼ session id ┼ ciphertext...
//! ```
//!
//! The signature is the AEAD tag; the associated data is the header from the nonce onward.


use aes::Aes128;
use aes_gcm::Aes128Gcm;
use ccm::Ccm;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::aead::generic_array::GenericArray;
use ccm::consts::{U11, U16};

use crate::error::{Error, ParsingError};
use crate::negotiate::Cipher;
use crate::registry::{SessionRegistry, UserSecurityState};
use crate::wire::{array_at, u16_at, u32_at, u64_at};


/// The protocol identifier of a transform header.
pub const TRANSFORM_PROTOCOL_ID: [u8; 4] = [0xFD, b'S', b'M', b'B'];

pub const TRANSFORM_HEADER_LEN: usize = 52;

/// The header bytes before this offset are not authenticated.
pub const AAD_OFFSET: usize = 20;

/// `Flags` value of an encrypted message: AES-128-CCM before 3.1.1, "encrypted with the
/// negotiated cipher" from 3.1.1 on.
pub const TRANSFORM_FLAGS_ENCRYPTED: u16 = 0x0001;

type Aes128Ccm = Ccm<Aes128, U16, U11>;


/// The header prepended to an encrypted message.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TransformHeader {
    pub signature: [u8; 16],

    /// Only the first 11 (CCM) or 12 (GCM) bytes are significant.
    pub nonce: [u8; 16],
    pub original_message_size: u32,
    pub flags: u16,
    pub session_id: u64,
}
impl TransformHeader {
    pub fn to_bytes(&self) -> [u8; TRANSFORM_HEADER_LEN] {
        let mut ret = [0u8; TRANSFORM_HEADER_LEN];
        ret[0..4].copy_from_slice(&TRANSFORM_PROTOCOL_ID);
        ret[4..20].copy_from_slice(&self.signature);
        ret[20..36].copy_from_slice(&self.nonce);
        ret[36..40].copy_from_slice(&self.original_message_size.to_le_bytes());
        ret[42..44].copy_from_slice(&self.flags.to_le_bytes());
        ret[44..52].copy_from_slice(&self.session_id.to_le_bytes());
        ret
    }

    /// The authenticated part of the serialized header.
    pub fn associated_data(bytes: &[u8; TRANSFORM_HEADER_LEN]) -> &[u8] {
        &bytes[AAD_OFFSET..]
    }
}
impl TryFrom<&[u8]> for TransformHeader {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < TRANSFORM_HEADER_LEN {
            return Err(ParsingError::ShortBuffer { expected_min_len: TRANSFORM_HEADER_LEN, obtained_len: value.len() });
        }
        let protocol_id: [u8; 4] = array_at(value, 0)?;
        if protocol_id != TRANSFORM_PROTOCOL_ID {
            return Err(ParsingError::MagicMismatch { expected: TRANSFORM_PROTOCOL_ID, obtained: protocol_id });
        }
        Ok(Self {
            signature: array_at(value, 4)?,
            nonce: array_at(value, 20)?,
            original_message_size: u32_at(value, 36)?,
            flags: u16_at(value, 42)?,
            session_id: u64_at(value, 44)?,
        })
    }
}


fn seal(cipher: Cipher, key: &[u8], nonce: &[u8; 16], aad: &[u8], buffer: &mut [u8]) -> Result<[u8; 16], Error> {
    let nonce = &nonce[..cipher.nonce_len()];
    let tag = match cipher {
        Cipher::Aes128Ccm => Aes128Ccm::new_from_slice(key)
            .or(Err(Error::Unsuccessful))?
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer)
            .or(Err(Error::Unsuccessful))?,
        Cipher::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .or(Err(Error::Unsuccessful))?
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer)
            .or(Err(Error::Unsuccessful))?,
        Cipher::None => return Err(Error::Unsuccessful),
    };
    let mut ret = [0u8; 16];
    ret.copy_from_slice(&tag);
    Ok(ret)
}

fn open(cipher: Cipher, key: &[u8], nonce: &[u8; 16], aad: &[u8], buffer: &mut [u8], tag: &[u8; 16]) -> Result<(), Error> {
    let nonce = &nonce[..cipher.nonce_len()];
    let tag = GenericArray::from_slice(tag);
    let verified = match cipher {
        Cipher::Aes128Ccm => Aes128Ccm::new_from_slice(key)
            .or(Err(Error::AccessDenied))?
            .decrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer, tag),
        Cipher::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .or(Err(Error::AccessDenied))?
            .decrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer, tag),
        Cipher::None => return Err(Error::AccessDenied),
    };
    verified.or(Err(Error::AccessDenied))
}


/// Encrypts a complete SMB2 message for `user`'s session.
pub fn encrypt_message(plaintext: &[u8], user: &mut UserSecurityState) -> Result<Vec<u8>, Error> {
    let cipher = user.cipher();
    if cipher == Cipher::None || user.encryption_key().is_empty() {
        return Err(Error::Unsuccessful);
    }
    let original_message_size = u32::try_from(plaintext.len())
        .or(Err(Error::InvalidParameter(ParsingError::Unexpected("message too large to encrypt"))))?;

    let mut header = TransformHeader {
        signature: [0; 16],
        nonce: user.next_outgoing_nonce()?,
        original_message_size,
        flags: TRANSFORM_FLAGS_ENCRYPTED,
        session_id: user.session_id(),
    };
    let header_bytes = header.to_bytes();

    let mut message = Vec::new();
    message.try_reserve_exact(TRANSFORM_HEADER_LEN + plaintext.len())
        .or(Err(Error::OutOfMemory))?;
    message.extend_from_slice(&header_bytes);
    message.extend_from_slice(plaintext);

    header.signature = seal(
        cipher,
        user.encryption_key(),
        &header.nonce,
        TransformHeader::associated_data(&header_bytes),
        &mut message[TRANSFORM_HEADER_LEN..],
    )?;
    message[4..20].copy_from_slice(&header.signature);
    Ok(message)
}

/// Decrypts a transformed message received for one of the sessions in `registry`.
///
/// Unknown sessions and failed tag checks are `AccessDenied`; no plaintext is returned
/// unless the tag verifies.
pub fn decrypt_message(raw: &[u8], registry: &mut SessionRegistry) -> Result<Vec<u8>, Error> {
    let header = TransformHeader::try_from(raw)?;
    if header.flags != TRANSFORM_FLAGS_ENCRYPTED {
        return Err(ParsingError::TransformFlags(header.flags).into());
    }
    let payload = &raw[TRANSFORM_HEADER_LEN..];
    if header.original_message_size as usize != payload.len() {
        return Err(ParsingError::TransformSize {
            announced: header.original_message_size as usize,
            obtained: payload.len(),
        }.into());
    }

    let user = registry.find_by_session_id(header.session_id)
        .ok_or(Error::AccessDenied)?;
    let cipher = user.cipher();
    if cipher == Cipher::None || user.decryption_key().is_empty() {
        return Err(Error::AccessDenied);
    }

    let mut header_bytes = [0u8; TRANSFORM_HEADER_LEN];
    header_bytes.copy_from_slice(&raw[..TRANSFORM_HEADER_LEN]);

    let mut plaintext = Vec::new();
    plaintext.try_reserve_exact(payload.len())
        .or(Err(Error::OutOfMemory))?;
    plaintext.extend_from_slice(payload);

    let opened = open(
        cipher,
        user.decryption_key(),
        &header.nonce,
        TransformHeader::associated_data(&header_bytes),
        &mut plaintext,
        &header.signature,
    );
    match opened {
        Ok(()) => {
            user.record_incoming_nonce(&header.nonce);
            Ok(plaintext)
        },
        Err(e) => {
            plaintext.fill(0);
            Err(e)
        },
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{Role, derive_session_keys};
    use crate::negotiate::Dialect;

    const SESSION_ID: u64 = 0x0000_4400_0000_0015;

    fn registry_with(cipher: Cipher, role: Role) -> (SessionRegistry, u16) {
        let mut registry = SessionRegistry::open(2);
        let uid = registry.create_user(false).unwrap();
        let user = registry.user_mut(uid).unwrap();
        user.set_session_id(SESSION_ID);
        user.bind(Some(Dialect::Smb311), cipher);
        let keys = derive_session_keys(&[0x3C; 16], Dialect::Smb311, Some(&[0x11; 64]), role).unwrap();
        user.install_derived_keys(&keys).unwrap();
        (registry, uid)
    }

    #[test]
    fn header_layout() {
        let header = TransformHeader {
            signature: [0xAA; 16],
            nonce: [0xBB; 16],
            original_message_size: 0x0102_0304,
            flags: TRANSFORM_FLAGS_ENCRYPTED,
            session_id: 0x1122_3344_5566_7788,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"\xFDSMB");
        assert_eq!(&bytes[36..40], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[40..42], &[0, 0]);
        assert_eq!(&bytes[42..44], &[0x01, 0x00]);
        assert_eq!(&bytes[44..52], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(TransformHeader::associated_data(&bytes).len(), 32);
        assert_eq!(TransformHeader::try_from(&bytes[..]).unwrap(), header);
    }

    #[test]
    fn header_parsing_rejects_garbage() {
        assert!(matches!(
            TransformHeader::try_from(&[0u8; 51][..]),
            Err(ParsingError::ShortBuffer { .. }),
        ));
        let mut bytes = [0u8; 52];
        bytes[0..4].copy_from_slice(b"\xFESMB");
        assert!(matches!(
            TransformHeader::try_from(&bytes[..]),
            Err(ParsingError::MagicMismatch { .. }),
        ));
    }

    #[test]
    fn round_trip_between_roles() {
        for cipher in [Cipher::Aes128Ccm, Cipher::Aes128Gcm] {
            let (mut client, client_uid) = registry_with(cipher, Role::Client);
            let (mut server, _) = registry_with(cipher, Role::Server);

            let plaintext = b"\xFESMB read request".to_vec();
            let sealed = encrypt_message(&plaintext, client.user_mut(client_uid).unwrap()).unwrap();
            assert_eq!(sealed.len(), TRANSFORM_HEADER_LEN + plaintext.len());
            assert_ne!(&sealed[TRANSFORM_HEADER_LEN..], &plaintext[..]);

            assert_eq!(decrypt_message(&sealed, &mut server).unwrap(), plaintext);
            let server_user = server.find_by_session_id(SESSION_ID).unwrap();
            assert_eq!(server_user.encrypt_nonce(), &sealed[20..36]);
        }
    }

    #[test]
    fn forged_message_leaves_nonce_untouched() {
        let (mut client, client_uid) = registry_with(Cipher::Aes128Gcm, Role::Client);
        let (mut server, _) = registry_with(Cipher::Aes128Gcm, Role::Server);
        let first = encrypt_message(b"first", client.user_mut(client_uid).unwrap()).unwrap();
        decrypt_message(&first, &mut server).unwrap();

        let mut forged = encrypt_message(b"second", client.user_mut(client_uid).unwrap()).unwrap();
        let last = forged.len() - 1;
        forged[last] ^= 0x01;
        assert_eq!(decrypt_message(&forged, &mut server), Err(Error::AccessDenied));
        assert_eq!(server.find_by_session_id(SESSION_ID).unwrap().encrypt_nonce(), &first[20..36]);
    }

    #[test]
    fn nonce_length_follows_cipher() {
        let (mut ccm, uid) = registry_with(Cipher::Aes128Ccm, Role::Client);
        let sealed = encrypt_message(b"x", ccm.user_mut(uid).unwrap()).unwrap();
        assert_eq!(&sealed[20 + 11..36], &[0; 5]);

        let (mut gcm, uid) = registry_with(Cipher::Aes128Gcm, Role::Client);
        let first = encrypt_message(b"x", gcm.user_mut(uid).unwrap()).unwrap();
        let second = encrypt_message(b"x", gcm.user_mut(uid).unwrap()).unwrap();
        assert_eq!(&first[20 + 12..36], &[0; 4]);
        assert_ne!(&first[20..36], &second[20..36]);
    }

    #[test]
    fn own_direction_does_not_decrypt() {
        let (mut client, uid) = registry_with(Cipher::Aes128Gcm, Role::Client);
        let sealed = encrypt_message(b"hello", client.user_mut(uid).unwrap()).unwrap();
        assert_eq!(decrypt_message(&sealed, &mut client), Err(Error::AccessDenied));
    }

    #[test]
    fn unknown_session_is_denied() {
        let (mut client, uid) = registry_with(Cipher::Aes128Ccm, Role::Client);
        let (mut server, server_uid) = registry_with(Cipher::Aes128Ccm, Role::Server);
        server.user_mut(server_uid).unwrap().set_session_id(SESSION_ID + 1);
        let sealed = encrypt_message(b"hello", client.user_mut(uid).unwrap()).unwrap();
        assert_eq!(decrypt_message(&sealed, &mut server), Err(Error::AccessDenied));
    }

    #[test]
    fn bad_flags_and_sizes_are_invalid() {
        let (mut client, uid) = registry_with(Cipher::Aes128Ccm, Role::Client);
        let (mut server, _) = registry_with(Cipher::Aes128Ccm, Role::Server);
        let sealed = encrypt_message(b"hello", client.user_mut(uid).unwrap()).unwrap();

        let mut flags = sealed.clone();
        flags[42] = 0x02;
        assert_eq!(
            decrypt_message(&flags, &mut server),
            Err(Error::InvalidParameter(ParsingError::TransformFlags(0x0002))),
        );

        let truncated = &sealed[..sealed.len() - 1];
        assert!(matches!(
            decrypt_message(truncated, &mut server),
            Err(Error::InvalidParameter(ParsingError::TransformSize { announced: 5, obtained: 4 })),
        ));
    }

    #[test]
    fn encryption_requires_cipher_and_keys() {
        let mut registry = SessionRegistry::open(1);
        let uid = registry.create_user(false).unwrap();
        assert_eq!(encrypt_message(b"x", registry.user_mut(uid).unwrap()), Err(Error::Unsuccessful));
    }
}
