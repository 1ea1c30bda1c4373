//! OEM encoding of passwords on operating systems other than Windows.
//!
//! There is no system-wide OEM codepage here. Characters in the ASCII range encode to
//! themselves, which covers every password the LM hash can represent faithfully; anything
//! else falls back to its UTF-8 bytes, matching what most non-Windows peers send.


/// Encodes the (already uppercased) password for the LM hash.
pub fn password_to_oem(password: &str) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(password.len()).ok()?;
    buf.extend_from_slice(password.as_bytes());
    Some(buf)
}
