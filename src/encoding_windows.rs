//! OEM encoding of passwords on Windows.
//!
//! The LM hash is computed over the password in the system's legacy codepage. Windows
//! converts via UTF-16, so we do the same.


use windows::Win32::Globalization::{CP_OEMCP, WC_COMPOSITECHECK, WideCharToMultiByte};


/// Encodes the (already uppercased) password for the LM hash.
pub fn password_to_oem(password: &str) -> Option<Vec<u8>> {
    if password.is_empty() {
        return Some(Vec::new());
    }

    let mut wide: Vec<u16> = password.encode_utf16().collect();

    // ask for the required size first
    let needed = unsafe {
        WideCharToMultiByte(CP_OEMCP, WC_COMPOSITECHECK, &wide, None, None, None)
    };
    let needed: usize = needed.try_into().ok()?;
    if needed == 0 {
        wide.fill(0);
        return None;
    }

    let mut buf = Vec::new();
    if buf.try_reserve_exact(needed).is_err() {
        wide.fill(0);
        return None;
    }
    buf.resize(needed, 0u8);
    let written = unsafe {
        WideCharToMultiByte(CP_OEMCP, WC_COMPOSITECHECK, &wide, Some(buf.as_mut_slice()), None, None)
    };
    wide.fill(0);

    let written: usize = written.try_into().ok()?;
    if written == 0 {
        buf.fill(0);
        return None;
    }
    buf.truncate(written);
    Some(buf)
}
