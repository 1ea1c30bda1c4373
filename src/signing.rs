//! SMB2 message signing.
//!
//! The signature occupies bytes 48..64 of the SMB2 header and is computed over the whole
//! message with that field zeroed: HMAC-SHA256 (truncated to 16 bytes) for 2.x dialects,
//! AES-128-CMAC for 3.x.


use aes::Aes128;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, ParsingError};
use crate::negotiate::{Dialect, SMB2_HEADER_SIZE};
use crate::wire::u32_at;


/// The `SMB2_FLAGS_SIGNED` header flag.
pub const SMB2_FLAGS_SIGNED: u32 = 0x0000_0008;

pub const SIGNATURE_LEN: usize = 16;

const FLAGS_OFFSET: usize = 16;
const SIGNATURE_OFFSET: usize = 48;


/// A message signing algorithm.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SigningAlgorithm {
    HmacSha256,
    AesCmac,
}
impl SigningAlgorithm {
    pub fn for_dialect(dialect: Dialect) -> Self {
        if dialect.is_smb3() {
            Self::AesCmac
        } else {
            Self::HmacSha256
        }
    }

    fn mac(self, key: &[u8]) -> Result<Box<dyn MacState>, Error> {
        match self {
            Self::HmacSha256 => Ok(Box::new(
                <Hmac<Sha256> as Mac>::new_from_slice(key).or(Err(Error::Unsuccessful))?,
            )),
            Self::AesCmac => Ok(Box::new(
                <Cmac<Aes128> as Mac>::new_from_slice(key).or(Err(Error::Unsuccessful))?,
            )),
        }
    }
}


trait MacState {
    fn feed(&mut self, data: &[u8]);
    fn finish(self: Box<Self>) -> [u8; SIGNATURE_LEN];
    fn check(self: Box<Self>, signature: &[u8]) -> bool;
}
impl<M: Mac> MacState for M {
    fn feed(&mut self, data: &[u8]) {
        self.update(data);
    }

    fn finish(self: Box<Self>) -> [u8; SIGNATURE_LEN] {
        let mut ret = [0u8; SIGNATURE_LEN];
        ret.copy_from_slice(&(*self).finalize().into_bytes()[..SIGNATURE_LEN]);
        ret
    }

    fn check(self: Box<Self>, signature: &[u8]) -> bool {
        (*self).verify_truncated_left(signature).is_ok()
    }
}


fn check_length(message: &[u8]) -> Result<(), Error> {
    if message.len() < SMB2_HEADER_SIZE {
        return Err(ParsingError::ShortBuffer { expected_min_len: SMB2_HEADER_SIZE, obtained_len: message.len() }.into());
    }
    Ok(())
}

fn mac_over_message(algorithm: SigningAlgorithm, key: &[u8], message: &[u8]) -> Result<Box<dyn MacState>, Error> {
    let mut mac = algorithm.mac(key)?;
    mac.feed(&message[..SIGNATURE_OFFSET]);
    mac.feed(&[0u8; SIGNATURE_LEN]);
    mac.feed(&message[SIGNATURE_OFFSET + SIGNATURE_LEN..]);
    Ok(mac)
}


/// Computes the signature of a message as if its signature field were zero.
pub fn compute_signature(algorithm: SigningAlgorithm, key: &[u8], message: &[u8]) -> Result<[u8; SIGNATURE_LEN], Error> {
    check_length(message)?;
    Ok(mac_over_message(algorithm, key, message)?.finish())
}

/// Sets the signed flag and writes the signature into the header.
pub fn sign_message(message: &mut [u8], key: &[u8], dialect: Dialect) -> Result<(), Error> {
    check_length(message)?;
    let flags = u32_at(message, FLAGS_OFFSET)? | SMB2_FLAGS_SIGNED;
    message[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&flags.to_le_bytes());

    let signature = compute_signature(SigningAlgorithm::for_dialect(dialect), key, message)?;
    message[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_LEN].copy_from_slice(&signature);
    Ok(())
}

/// Whether the header carries the signed flag.
pub fn is_signed(message: &[u8]) -> bool {
    u32_at(message, FLAGS_OFFSET).map_or(false, |flags| flags & SMB2_FLAGS_SIGNED != 0)
}

/// Checks a message's signature; a mismatch is `AccessDenied`.
pub fn verify_message(message: &[u8], key: &[u8], dialect: Dialect) -> Result<(), Error> {
    check_length(message)?;
    if key.is_empty() {
        return Err(Error::AccessDenied);
    }
    let mac = mac_over_message(SigningAlgorithm::for_dialect(dialect), key, message)?;
    if mac.check(&message[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_LEN]) {
        Ok(())
    } else {
        Err(Error::AccessDenied)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiate::smb2_message;

    const KEY: [u8; 16] = [0x42; 16];

    fn message() -> Vec<u8> {
        smb2_message(0x0001, 0x0000_0001, 0x0000_1000_0000_0041, b"session setup body")
    }

    #[test]
    fn signed_message_verifies() {
        for dialect in [Dialect::Smb210, Dialect::Smb300, Dialect::Smb311] {
            let mut msg = message();
            sign_message(&mut msg, &KEY, dialect).unwrap();
            assert!(is_signed(&msg));
            assert_ne!(&msg[48..64], &[0u8; 16]);
            verify_message(&msg, &KEY, dialect).unwrap();
        }
    }

    #[test]
    fn tampering_is_detected() {
        let mut msg = message();
        sign_message(&mut msg, &KEY, Dialect::Smb311).unwrap();

        let mut body_flip = msg.clone();
        let last = body_flip.len() - 1;
        body_flip[last] ^= 0x01;
        assert_eq!(verify_message(&body_flip, &KEY, Dialect::Smb311), Err(Error::AccessDenied));

        let mut sig_flip = msg.clone();
        sig_flip[50] ^= 0x80;
        assert_eq!(verify_message(&sig_flip, &KEY, Dialect::Smb311), Err(Error::AccessDenied));

        assert_eq!(verify_message(&msg, &[0x43; 16], Dialect::Smb311), Err(Error::AccessDenied));
    }

    #[test]
    fn algorithms_differ_by_dialect() {
        let msg = message();
        let hmac = compute_signature(SigningAlgorithm::HmacSha256, &KEY, &msg).unwrap();
        let cmac = compute_signature(SigningAlgorithm::AesCmac, &KEY, &msg).unwrap();
        assert_ne!(hmac, cmac);
        assert_eq!(SigningAlgorithm::for_dialect(Dialect::Smb202), SigningAlgorithm::HmacSha256);
        assert_eq!(SigningAlgorithm::for_dialect(Dialect::Smb302), SigningAlgorithm::AesCmac);
    }

    #[test]
    fn existing_signature_is_ignored_when_computing() {
        let mut msg = message();
        let before = compute_signature(SigningAlgorithm::AesCmac, &KEY, &msg).unwrap();
        msg[48..64].copy_from_slice(&[0xFF; 16]);
        assert_eq!(compute_signature(SigningAlgorithm::AesCmac, &KEY, &msg).unwrap(), before);
    }

    #[test]
    fn short_messages_and_missing_keys_are_rejected() {
        assert!(matches!(
            verify_message(&[0u8; 10], &KEY, Dialect::Smb210),
            Err(Error::InvalidParameter(ParsingError::ShortBuffer { .. })),
        ));
        assert_eq!(verify_message(&message(), &[], Dialect::Smb210), Err(Error::AccessDenied));
        assert_eq!(
            compute_signature(SigningAlgorithm::AesCmac, &[1; 5], &message()),
            Err(Error::Unsuccessful),
        );
    }
}
