//! Challenge-response computation for the legacy and NTLMSSP response algorithms.
//!
//! Legacy session setup carries two alternative responses in one request: the
//! case-insensitive (LM family) and the case-sensitive (NTLM family) password fields. A
//! [`CrypterPair`] picks the algorithm for each of the two slots; [`encrypt`] fills them.


use std::fmt;

use chrono::{NaiveDate, Utc};
use digest::Digest;
use hmac::Mac;
use md4::Md4;
use rand::Rng;
use rand::rngs::OsRng;

use crate::credential::{Credential, HashedCredential, des_7, hmac_md5, v2_owf};
use crate::error::{CryptError, ParsingError};


/// Upper bound for an NTLMv2 response including the target information it embeds.
pub const MAX_NTLMV2_RESPONSE_SIZE: usize = 1024;

/// Length of the fixed NTLMv2 blob fields preceding the target information.
pub const NTLMV2_BLOB_FIXED_LEN: usize = 28;

/// Length of the terminator written in place of absent target information.
pub const NTLMV2_BLOB_TERMINATOR_LEN: usize = 8;

/// Length of the HMAC-MD5 proof heading LMv2 and NTLMv2 responses.
const PROOF_LEN: usize = 16;

/// Response version and highest understood response version, each one byte, then padding.
const NTLMV2_BLOB_SIGNATURE: u32 = 0x0000_0101;


/// A response algorithm.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Crypter {
    None,
    Lm,
    LmV2,
    Ntlm,
    NtlmV2,
}
impl Crypter {
    /// Size of the response slot this algorithm needs reserved.
    pub fn blob_size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Lm | Self::LmV2 | Self::Ntlm => 24,
            Self::NtlmV2 => MAX_NTLMV2_RESPONSE_SIZE - 200,
        }
    }
}

/// The algorithms computing the two response slots.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CrypterPair {
    /// Fills the case-insensitive password field (`pass1`).
    pub first: Crypter,

    /// Fills the case-sensitive password field (`pass2`).
    pub second: Crypter,
}
impl CrypterPair {
    pub const fn new(first: Crypter, second: Crypter) -> Self {
        Self { first, second }
    }
}


/// The per-call random and time inputs of the v2 algorithms.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CrypterInputs {
    /// The 8-byte client nonce embedded in LMv2 and NTLMv2 responses.
    pub client_nonce: [u8; 8],

    /// Windows FILETIME embedded in the NTLMv2 blob.
    pub timestamp: i64,
}
impl CrypterInputs {
    /// Draws a fresh client nonce and reads the clock.
    pub fn generate() -> Self {
        let mut client_nonce = [0u8; 8];
        OsRng.fill(&mut client_nonce);
        Self {
            client_nonce,
            timestamp: nt_time_now(),
        }
    }
}


/// Obtains the current time as a Windows FILETIME (100 ns ticks since 1601-01-01 UTC).
pub fn nt_time_now() -> i64 {
    let windows_epoch = NaiveDate::from_ymd_opt(1601, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc());
    match windows_epoch {
        Some(epoch) => (Utc::now() - epoch)
            .num_microseconds()
            .map_or(0, |us| us * 10),
        None => 0,
    }
}


/// Performs the three-key DES expansion of a 16-byte hash over an 8-byte challenge.
pub fn des_long(key: &[u8; 16], data: [u8; 8]) -> [u8; 24] {
    let mut key0 = [0u8; 7];
    let mut key1 = [0u8; 7];
    key0.copy_from_slice(&key[0..7]);
    key1.copy_from_slice(&key[7..14]);
    let mut key2 = [key[14], key[15], 0, 0, 0, 0, 0];

    let mut ret = [0u8; 24];
    ret[0..8].copy_from_slice(&des_7(&key0, data));
    ret[8..16].copy_from_slice(&des_7(&key1, data));
    ret[16..24].copy_from_slice(&des_7(&key2, data));

    key0.fill(0);
    key1.fill(0);
    key2.fill(0);
    ret
}


/// Reserves exactly `size` bytes, reporting allocation failure instead of aborting.
fn reserve(size: usize) -> Result<Vec<u8>, CryptError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .or(Err(CryptError::OutOfMemory))?;
    Ok(buf)
}


/// A cursor over a reserved response slot that refuses to grow past the reservation.
struct SlotWriter<'a> {
    buf: &'a mut Vec<u8>,
    limit: usize,
}
impl<'a> SlotWriter<'a> {
    fn new(buf: &'a mut Vec<u8>, limit: usize) -> Self {
        buf.clear();
        Self { buf, limit }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), CryptError> {
        if self.buf.len() + bytes.len() > self.limit {
            return Err(CryptError::MissingBlob);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn put_zeros(&mut self, count: usize) -> Result<(), CryptError> {
        if self.buf.len() + count > self.limit {
            return Err(CryptError::MissingBlob);
        }
        self.buf.resize(self.buf.len() + count, 0);
        Ok(())
    }

    fn put_u32_le(&mut self, value: u32) -> Result<(), CryptError> {
        self.put(&value.to_le_bytes())
    }
}


/// A parsed view of the NTLMv2 client blob.
///
/// ```plain
/// 0       4        8           16            24         28
/// ├ 0x101 ┼ resv'd ┼ timestamp ┼ client nonce ┼ reserved ┼ target info | 8 zero bytes
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NtlmV2Blob<'a> {
    pub timestamp: i64,
    pub client_nonce: [u8; 8],

    /// Target information, or the terminator if none was supplied.
    pub trailer: &'a [u8],
}
impl<'a> NtlmV2Blob<'a> {
    /// Writes the blob into `writer`.
    fn write(writer: &mut SlotWriter<'_>, inputs: &CrypterInputs, target_info: Option<&[u8]>) -> Result<(), CryptError> {
        writer.put_u32_le(NTLMV2_BLOB_SIGNATURE)?;
        writer.put_zeros(4)?;
        writer.put_u32_le(inputs.timestamp as u32)?;
        writer.put_u32_le((inputs.timestamp >> 32) as u32)?;
        writer.put(&inputs.client_nonce)?;
        writer.put_zeros(4)?;
        match target_info {
            Some(ti) => writer.put(ti),
            None => writer.put_zeros(NTLMV2_BLOB_TERMINATOR_LEN),
        }
    }

    /// Extracts the blob from a full NTLMv2 response (proof followed by blob).
    pub fn from_response(response: &'a [u8]) -> Result<Self, ParsingError> {
        if response.len() < PROOF_LEN {
            return Err(ParsingError::ShortBuffer { expected_min_len: PROOF_LEN, obtained_len: response.len() });
        }
        Self::try_from(&response[PROOF_LEN..])
    }
}
impl<'a> TryFrom<&'a [u8]> for NtlmV2Blob<'a> {
    type Error = ParsingError;

    fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
        if value.len() < NTLMV2_BLOB_FIXED_LEN {
            return Err(ParsingError::ShortBuffer { expected_min_len: NTLMV2_BLOB_FIXED_LEN, obtained_len: value.len() });
        }
        let signature = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
        if signature != NTLMV2_BLOB_SIGNATURE {
            return Err(ParsingError::Unexpected("NTLMv2 blob signature mismatch"));
        }

        let mut timestamp_bytes = [0u8; 8];
        timestamp_bytes.copy_from_slice(&value[8..16]);
        let mut client_nonce = [0u8; 8];
        client_nonce.copy_from_slice(&value[16..24]);

        Ok(Self {
            timestamp: i64::from_le_bytes(timestamp_bytes),
            client_nonce,
            trailer: &value[NTLMV2_BLOB_FIXED_LEN..],
        })
    }
}

/// Extracts the client nonce from an LMv2 response (16-byte proof followed by the nonce).
pub fn lm_v2_client_nonce(response: &[u8]) -> Option<[u8; 8]> {
    if response.len() != PROOF_LEN + 8 {
        return None;
    }
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&response[PROOF_LEN..]);
    Some(nonce)
}


/// The type of an entry of target information (an `AV_PAIR`).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TargetInfoType {
    Terminator,
    NbComputerName,
    NbDomainName,
    DnsComputerName,
    DnsDomainName,
    DnsTreeName,
    Flags,
    Timestamp,
    SingleHost,
    TargetName,
    ChannelBindings,
    Unknown(u16),
}
impl From<TargetInfoType> for u16 {
    fn from(t: TargetInfoType) -> Self {
        match t {
            TargetInfoType::Terminator => 0x0000,
            TargetInfoType::NbComputerName => 0x0001,
            TargetInfoType::NbDomainName => 0x0002,
            TargetInfoType::DnsComputerName => 0x0003,
            TargetInfoType::DnsDomainName => 0x0004,
            TargetInfoType::DnsTreeName => 0x0005,
            TargetInfoType::Flags => 0x0006,
            TargetInfoType::Timestamp => 0x0007,
            TargetInfoType::SingleHost => 0x0008,
            TargetInfoType::TargetName => 0x0009,
            TargetInfoType::ChannelBindings => 0x000A,
            TargetInfoType::Unknown(w) => w,
        }
    }
}
impl From<u16> for TargetInfoType {
    fn from(w: u16) -> Self {
        match w {
            0x0000 => TargetInfoType::Terminator,
            0x0001 => TargetInfoType::NbComputerName,
            0x0002 => TargetInfoType::NbDomainName,
            0x0003 => TargetInfoType::DnsComputerName,
            0x0004 => TargetInfoType::DnsDomainName,
            0x0005 => TargetInfoType::DnsTreeName,
            0x0006 => TargetInfoType::Flags,
            0x0007 => TargetInfoType::Timestamp,
            0x0008 => TargetInfoType::SingleHost,
            0x0009 => TargetInfoType::TargetName,
            0x000A => TargetInfoType::ChannelBindings,
            other => TargetInfoType::Unknown(other),
        }
    }
}

/// An entry of target information naming the server or its domain.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TargetInfoEntry {
    pub entry_type: TargetInfoType,
    pub data: Vec<u8>,
}
impl TargetInfoEntry {
    /// Creates an entry holding `name` in UTF-16LE.
    pub fn from_name(entry_type: TargetInfoType, name: &str) -> Self {
        let data = name.encode_utf16()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        Self { entry_type, data }
    }

    /// Serializes the entry. Data that does not fit the 16-bit length field is refused.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParsingError> {
        let entry_type: u16 = self.entry_type.into();
        let data_len: u16 = self.data.len().try_into()
            .or(Err(ParsingError::TooLong { max_len: usize::from(u16::MAX), obtained_len: self.data.len() }))?;

        let mut ret = Vec::with_capacity(4 + self.data.len());
        ret.extend_from_slice(&entry_type.to_le_bytes());
        ret.extend_from_slice(&data_len.to_le_bytes());
        ret.extend_from_slice(&self.data);
        Ok(ret)
    }

    /// Deserializes one entry, returning it with the bytes that follow it.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<(Self, &[u8]), ParsingError> {
        if bytes.len() < 4 {
            return Err(ParsingError::ShortBuffer { expected_min_len: 4, obtained_len: bytes.len() });
        }
        let entry_type = TargetInfoType::from(u16::from_le_bytes([bytes[0], bytes[1]]));
        let length = usize::from(u16::from_le_bytes([bytes[2], bytes[3]]));
        if length + 4 > bytes.len() {
            return Err(ParsingError::OutOfRange { offset: 4, length, message_len: bytes.len() });
        }
        let entry = Self {
            entry_type,
            data: bytes[4..4 + length].to_vec(),
        };
        Ok((entry, &bytes[4 + length..]))
    }
}

/// Encodes `entries` followed by the terminating entry, as embedded into the NTLMv2 blob.
pub fn encode_target_info(entries: &[TargetInfoEntry]) -> Result<Vec<u8>, ParsingError> {
    let mut ret = Vec::new();
    for entry in entries.iter().filter(|e| e.entry_type != TargetInfoType::Terminator) {
        ret.extend_from_slice(&entry.to_bytes()?);
    }
    ret.extend_from_slice(&[0, 0, 0, 0]);
    Ok(ret)
}

/// Decodes target information up to and excluding its terminator.
pub fn decode_target_info(mut bytes: &[u8]) -> Result<Vec<TargetInfoEntry>, ParsingError> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        let (entry, rest) = TargetInfoEntry::try_from_bytes(bytes)?;
        if entry.entry_type == TargetInfoType::Terminator {
            break;
        }
        entries.push(entry);
        bytes = rest;
    }
    Ok(entries)
}


/// Which of the two response slots a crypter fills.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Slot {
    First,
    Second,
}


/// The output of one logon attempt's response computation.
///
/// All blobs are wiped and released by [`CryptResult::dispose`], which also runs on drop.
pub struct CryptResult {
    pass1: Vec<u8>,
    pass2: Vec<u8>,
    mac_key: Vec<u8>,
    response: Vec<u8>,
    client_nonce: Option<[u8; 8]>,

    /// The sizes requested for `pass1` and `pass2`.
    reserved: [usize; 2],
}
impl CryptResult {
    /// Reserves the blobs for the given crypter pair.
    pub fn allocate(pair: CrypterPair) -> Result<Self, CryptError> {
        let size1 = pair.first.blob_size();
        let size2 = pair.second.blob_size();
        Ok(Self {
            pass1: reserve(size1)?,
            pass2: reserve(size2)?,
            mac_key: reserve(16)?,
            response: reserve(size1.max(size2))?,
            client_nonce: None,
            reserved: [size1, size2],
        })
    }

    /// The case-insensitive (LM family) response.
    pub fn pass1(&self) -> &[u8] {
        &self.pass1
    }

    /// The case-sensitive (NTLM family) response.
    pub fn pass2(&self) -> &[u8] {
        &self.pass2
    }

    /// Session key material for message signing.
    pub fn mac_key(&self) -> &[u8] {
        &self.mac_key
    }

    /// The authoritative response: a copy of the slot filled last.
    pub fn response(&self) -> &[u8] {
        &self.response
    }

    /// The client nonce embedded by the v2 algorithms, if one ran.
    pub fn client_nonce(&self) -> Option<[u8; 8]> {
        self.client_nonce
    }

    /// Computes both slots into the reserved blobs.
    ///
    /// Either both slots are computed or the result is disposed and the error returned.
    pub fn compute(
        &mut self,
        pair: CrypterPair,
        credential: &Credential,
        hashed: &HashedCredential,
        server_challenge: &[u8; 8],
        target_info: Option<&[u8]>,
        inputs: &CrypterInputs,
    ) -> Result<(), CryptError> {
        for (slot, crypter) in [(Slot::First, pair.first), (Slot::Second, pair.second)] {
            if let Err(e) = self.compute_slot(slot, crypter, credential, hashed, server_challenge, target_info, inputs) {
                self.dispose();
                return Err(e);
            }
        }
        Ok(())
    }

    fn compute_slot(
        &mut self,
        slot: Slot,
        crypter: Crypter,
        credential: &Credential,
        hashed: &HashedCredential,
        server_challenge: &[u8; 8],
        target_info: Option<&[u8]>,
        inputs: &CrypterInputs,
    ) -> Result<(), CryptError> {
        if crypter == Crypter::None {
            return Ok(());
        }

        let (buf, limit) = match slot {
            Slot::First => (&mut self.pass1, self.reserved[0]),
            Slot::Second => (&mut self.pass2, self.reserved[1]),
        };
        if limit < crypter.blob_size() {
            return Err(CryptError::MissingBlob);
        }

        let mut mac_key = [0u8; 16];
        {
            let mut writer = SlotWriter::new(buf, limit);
            match crypter {
                Crypter::None => {},
                Crypter::Lm => {
                    let response = des_long(&hashed.lm, *server_challenge);
                    writer.put(&response)?;
                    mac_key[0..8].copy_from_slice(&response[0..8]);
                },
                Crypter::Ntlm => {
                    writer.put(&des_long(&hashed.ntlm, *server_challenge))?;
                    let mut md4 = <Md4 as Digest>::new();
                    md4.update(hashed.ntlm);
                    mac_key = md4.finalize().into();
                },
                Crypter::LmV2 => {
                    let mut v2_hash = v2_owf(hashed, credential);
                    let mut mac = hmac_md5(&v2_hash);
                    mac.update(server_challenge);
                    mac.update(&inputs.client_nonce);
                    let proof: [u8; 16] = mac.finalize().into_bytes().into();

                    writer.put(&proof)?;
                    writer.put(&inputs.client_nonce)?;

                    let mut mac = hmac_md5(&v2_hash);
                    mac.update(&proof);
                    mac_key = mac.finalize().into_bytes().into();
                    v2_hash.fill(0);
                    self.client_nonce = Some(inputs.client_nonce);
                },
                Crypter::NtlmV2 => {
                    writer.put_zeros(PROOF_LEN)?;
                    NtlmV2Blob::write(&mut writer, inputs, target_info)?;

                    let mut v2_hash = v2_owf(hashed, credential);
                    let mut mac = hmac_md5(&v2_hash);
                    mac.update(server_challenge);
                    mac.update(&writer.buf[PROOF_LEN..]);
                    let proof: [u8; 16] = mac.finalize().into_bytes().into();
                    writer.buf[0..PROOF_LEN].copy_from_slice(&proof);

                    let mut mac = hmac_md5(&v2_hash);
                    mac.update(&proof);
                    mac_key = mac.finalize().into_bytes().into();
                    v2_hash.fill(0);
                    self.client_nonce = Some(inputs.client_nonce);
                },
            }
        }

        let computed = match slot {
            Slot::First => &self.pass1,
            Slot::Second => &self.pass2,
        };
        self.response.fill(0);
        self.response.clear();
        if self.response.capacity() < computed.len() {
            self.response.try_reserve_exact(computed.len())
                .or(Err(CryptError::OutOfMemory))?;
        }
        self.response.extend_from_slice(computed);

        self.mac_key.fill(0);
        self.mac_key.clear();
        self.mac_key.extend_from_slice(&mac_key);
        mac_key.fill(0);
        Ok(())
    }

    /// Wipes and releases all blobs. Calling it again has no effect.
    pub fn dispose(&mut self) {
        for blob in [&mut self.pass1, &mut self.pass2, &mut self.mac_key, &mut self.response] {
            blob.fill(0);
            blob.clear();
            blob.shrink_to_fit();
        }
        self.client_nonce = None;
        self.reserved = [0, 0];
    }

    /// Whether all blobs have been released.
    pub fn is_disposed(&self) -> bool {
        self.pass1.capacity() == 0
            && self.pass2.capacity() == 0
            && self.mac_key.capacity() == 0
            && self.response.capacity() == 0
    }
}
impl fmt::Debug for CryptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptResult")
            .field("pass1_len", &self.pass1.len())
            .field("pass2_len", &self.pass2.len())
            .field("response_len", &self.response.len())
            .finish_non_exhaustive()
    }
}
impl Drop for CryptResult {
    fn drop(&mut self) {
        self.dispose();
    }
}


/// Computes the responses of `pair` with fresh client nonce and timestamp.
pub fn encrypt(
    pair: CrypterPair,
    credential: &Credential,
    hashed: &HashedCredential,
    server_challenge: &[u8; 8],
    target_info: Option<&[u8]>,
) -> Result<CryptResult, CryptError> {
    encrypt_with(pair, credential, hashed, server_challenge, target_info, &CrypterInputs::generate())
}

/// Computes the responses of `pair` with caller-provided nonce and timestamp.
pub fn encrypt_with(
    pair: CrypterPair,
    credential: &Credential,
    hashed: &HashedCredential,
    server_challenge: &[u8; 8],
    target_info: Option<&[u8]>,
    inputs: &CrypterInputs,
) -> Result<CryptResult, CryptError> {
    let mut result = CryptResult::allocate(pair)?;
    result.compute(pair, credential, hashed, server_challenge, target_info, inputs)?;
    Ok(result)
}
