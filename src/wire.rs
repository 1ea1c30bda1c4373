//! Little-endian field access for wire structures.


use crate::error::ParsingError;


fn field(bytes: &[u8], offset: usize, length: usize) -> Result<&[u8], ParsingError> {
    offset.checked_add(length)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(ParsingError::OutOfRange { offset, length, message_len: bytes.len() })
}

pub(crate) fn slice_at(bytes: &[u8], offset: usize, length: usize) -> Result<&[u8], ParsingError> {
    field(bytes, offset, length)
}

pub(crate) fn u16_at(bytes: &[u8], offset: usize) -> Result<u16, ParsingError> {
    let b = field(bytes, offset, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

pub(crate) fn u32_at(bytes: &[u8], offset: usize) -> Result<u32, ParsingError> {
    let b = field(bytes, offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn u64_at(bytes: &[u8], offset: usize) -> Result<u64, ParsingError> {
    let b = field(bytes, offset, 8)?;
    let mut a = [0u8; 8];
    a.copy_from_slice(b);
    Ok(u64::from_le_bytes(a))
}

pub(crate) fn array_at<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N], ParsingError> {
    let b = field(bytes, offset, N)?;
    let mut a = [0u8; N];
    a.copy_from_slice(b);
    Ok(a)
}

/// Rounds `value` up to the next multiple of eight.
pub(crate) fn align8(value: usize) -> usize {
    (value + 7) & !7
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_bounds_checked() {
        let bytes = [1u8, 2, 3, 4, 5];
        assert_eq!(u16_at(&bytes, 0), Ok(0x0201));
        assert_eq!(u32_at(&bytes, 1), Ok(0x0504_0302));
        assert_eq!(
            u32_at(&bytes, 2),
            Err(ParsingError::OutOfRange { offset: 2, length: 4, message_len: 5 }),
        );
        assert!(slice_at(&bytes, usize::MAX, 2).is_err());
    }

    #[test]
    fn aligns_to_eight() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(130), 136);
    }
}
