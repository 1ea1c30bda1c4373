//! Dialect, cipher and pre-authentication hash negotiation (server side).
//!
//! A connection moves through [`NegotiationPhase`]s:
//!
//! ```plain
//! Idle ─ DialectOffered ─ DialectChosen ─ Frozen
//!          │    ▲
//!          └────┘ SMB1 "SMB 2.???" answered with the wildcard dialect, SMB2 NEGOTIATE follows
//! ```
//!
//! Once a dialect is chosen, further NEGOTIATE requests are refused.


use bitflags::bitflags;
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::debug;

use crate::config::SecurityConfig;
use crate::crypter::nt_time_now;
use crate::error::{Error, ParsingError};
use crate::preauth::{HashAlgorithm, PreauthIntegrity};
use crate::registry::SessionRegistry;
use crate::wire::{align8, array_at, slice_at, u16_at, u32_at};


/// The protocol identifier heading every SMB2 message.
pub const SMB2_PROTOCOL_ID: [u8; 4] = [0xFE, b'S', b'M', b'B'];

/// The size of the SMB2 sync header; body offsets are relative to its start.
pub const SMB2_HEADER_SIZE: usize = 64;

const NEGOTIATE_COMMAND: u16 = 0x0000;
const NEGOTIATE_REQUEST_STRUCTURE_SIZE: u16 = 36;
const NEGOTIATE_RESPONSE_STRUCTURE_SIZE: u16 = 65;
const NEGOTIATE_RESPONSE_FIXED_LEN: usize = 64;

/// Negotiate context type of `PREAUTH_INTEGRITY_CAPABILITIES`.
pub const PREAUTH_INTEGRITY_CAPABILITIES: u16 = 0x0001;

/// Negotiate context type of `ENCRYPTION_CAPABILITIES`.
pub const ENCRYPTION_CAPABILITIES: u16 = 0x0002;

/// Length of the salt sent in the preauth context of a response.
pub const PREAUTH_SALT_LEN: usize = 32;


/// An SMB2 dialect revision.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Dialect {
    Smb202,
    Smb210,

    /// Answer to an SMB1 "SMB 2.???" request; a real dialect is negotiated afterwards.
    Smb2Wildcard,

    Smb300,
    Smb302,
    Smb311,
}
impl Dialect {
    /// Dialects that may appear in an SMB2 NEGOTIATE request, lowest first.
    pub const NEGOTIABLE: [Dialect; 5] = [
        Dialect::Smb202,
        Dialect::Smb210,
        Dialect::Smb300,
        Dialect::Smb302,
        Dialect::Smb311,
    ];

    pub fn code(self) -> u16 {
        match self {
            Self::Smb202 => 0x0202,
            Self::Smb210 => 0x0210,
            Self::Smb2Wildcard => 0x02FF,
            Self::Smb300 => 0x0300,
            Self::Smb302 => 0x0302,
            Self::Smb311 => 0x0311,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0202 => Some(Self::Smb202),
            0x0210 => Some(Self::Smb210),
            0x02FF => Some(Self::Smb2Wildcard),
            0x0300 => Some(Self::Smb300),
            0x0302 => Some(Self::Smb302),
            0x0311 => Some(Self::Smb311),
            _ => None,
        }
    }

    pub fn is_smb3(self) -> bool {
        matches!(self, Self::Smb300 | Self::Smb302 | Self::Smb311)
    }

    /// Whether the dialect uses negotiate contexts and pre-authentication integrity.
    pub fn has_preauth_integrity(self) -> bool {
        self == Self::Smb311
    }

    fn is_enabled(self, config: &SecurityConfig) -> bool {
        config.smb2 && (!self.is_smb3() || config.smb3)
    }
}


/// An AEAD cipher for transform-header encryption.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Cipher {
    #[default]
    None,
    Aes128Ccm,
    Aes128Gcm,
}
impl Cipher {
    pub fn id(self) -> u16 {
        match self {
            Self::None => 0x0000,
            Self::Aes128Ccm => 0x0001,
            Self::Aes128Gcm => 0x0002,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x0001 => Some(Self::Aes128Ccm),
            0x0002 => Some(Self::Aes128Gcm),
            _ => None,
        }
    }

    /// The number of significant nonce bytes.
    pub fn nonce_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Aes128Ccm => 11,
            Self::Aes128Gcm => 12,
        }
    }
}


bitflags! {
    /// The `SecurityMode` field of NEGOTIATE and SESSION_SETUP.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialEq, PartialOrd)]
    pub struct SecurityMode: u16 {
        const SIGNING_ENABLED = 0x0001;
        const SIGNING_REQUIRED = 0x0002;
    }
}

bitflags! {
    /// Global capabilities exchanged in NEGOTIATE.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialEq, PartialOrd)]
    pub struct Capabilities: u32 {
        const DFS = 0x0000_0001;
        const LEASING = 0x0000_0002;
        const LARGE_MTU = 0x0000_0004;
        const MULTI_CHANNEL = 0x0000_0008;
        const PERSISTENT_HANDLES = 0x0000_0010;
        const DIRECTORY_LEASING = 0x0000_0020;
        const ENCRYPTION = 0x0000_0040;
    }
}


/// A dialect string of the SMB1 NEGOTIATE request.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Smb1Dialect {
    NtLm012,
    Smb2002,
    Smb2Wildcard,
}
impl Smb1Dialect {
    /// Recognized strings, in ascending preference.
    const ALL: [(Smb1Dialect, &'static str); 3] = [
        (Smb1Dialect::NtLm012, "NT LM 0.12"),
        (Smb1Dialect::Smb2002, "SMB 2.002"),
        (Smb1Dialect::Smb2Wildcard, "SMB 2.???"),
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NtLm012 => "NT LM 0.12",
            Self::Smb2002 => "SMB 2.002",
            Self::Smb2Wildcard => "SMB 2.???",
        }
    }

    fn is_smb2(self) -> bool {
        self != Self::NtLm012
    }
}

/// The dialect picked from an SMB1 dialect list and its index in that list.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Smb1DialectChoice {
    pub index: usize,
    pub dialect: Smb1Dialect,
}


/// Picks the preferred recognized dialect from an SMB1 dialect list.
///
/// The list is scanned once and, for each recognized string, the index of its *last*
/// occurrence is kept. SMB2 strings are only considered if `smb2_supported`.
pub fn select_dialect(offered: &[&str], smb2_supported: bool) -> Option<Smb1DialectChoice> {
    let mut last_index: [Option<usize>; 3] = [None; 3];
    for (index, name) in offered.iter().enumerate() {
        for (slot, (_, known)) in Smb1Dialect::ALL.iter().enumerate() {
            if name == known {
                last_index[slot] = Some(index);
            }
        }
    }

    Smb1Dialect::ALL.iter()
        .zip(last_index.iter())
        .rev()
        .filter(|((dialect, _), _)| smb2_supported || !dialect.is_smb2())
        .find_map(|((dialect, _), index)| index.map(|index| Smb1DialectChoice { index, dialect: *dialect }))
}


/// Picks the highest enabled dialect from an SMB2 dialect list, keeping the last occurrence
/// of each recognized code.
fn select_smb2_dialect(offered: &[u16], config: &SecurityConfig) -> Option<Dialect> {
    let mut last_index: [Option<usize>; 5] = [None; 5];
    for (index, code) in offered.iter().enumerate() {
        for (slot, dialect) in Dialect::NEGOTIABLE.iter().enumerate() {
            if dialect.code() == *code && dialect.is_enabled(config) {
                last_index[slot] = Some(index);
            }
        }
    }
    Dialect::NEGOTIABLE.iter()
        .zip(last_index.iter())
        .rev()
        .find_map(|(dialect, index)| index.map(|_| *dialect))
}


/// A negotiate context as found on the wire.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NegotiateContext {
    pub context_type: u16,
    pub data: Vec<u8>,
}
impl NegotiateContext {
    /// Serializes the context (without trailing alignment padding).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(8 + self.data.len());
        ret.extend_from_slice(&self.context_type.to_le_bytes());
        ret.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        ret.extend_from_slice(&[0, 0, 0, 0]);
        ret.extend_from_slice(&self.data);
        ret
    }

    /// Reads `count` 8-aligned contexts starting at `offset` of `message`.
    pub fn parse_list(message: &[u8], offset: usize, count: usize) -> Result<Vec<Self>, ParsingError> {
        let mut contexts = Vec::with_capacity(count.min(16));
        let mut pos = offset;
        for i in 0..count {
            if i > 0 {
                pos = align8(pos);
            }
            let context_type = u16_at(message, pos)?;
            let data_len = usize::from(u16_at(message, pos + 2)?);
            let data = slice_at(message, pos + 8, data_len)?.to_vec();
            contexts.push(Self { context_type, data });
            pos += 8 + data_len;
        }
        Ok(contexts)
    }
}

/// Serializes contexts, padding between them to 8-byte boundaries.
fn write_context_list(buf: &mut Vec<u8>, base: usize, contexts: &[NegotiateContext]) {
    for (i, context) in contexts.iter().enumerate() {
        if i > 0 {
            let padded = align8(base + buf.len()) - base;
            buf.resize(padded, 0);
        }
        buf.extend_from_slice(&context.to_bytes());
    }
}

/// Picks the hash algorithm of a `PREAUTH_INTEGRITY_CAPABILITIES` context.
///
/// All offered identifiers are scanned and the last SHA-512 entry wins.
fn select_hash_algorithm(data: &[u8]) -> Result<Option<HashAlgorithm>, ParsingError> {
    let count = usize::from(u16_at(data, 0)?);
    let _salt_len = u16_at(data, 2)?;
    let mut selected = None;
    for i in 0..count {
        let id = u16_at(data, 4 + 2 * i)?;
        if let Some(algorithm) = HashAlgorithm::from_id(id) {
            selected = Some(algorithm);
        }
    }
    Ok(selected)
}

/// Picks the cipher of an `ENCRYPTION_CAPABILITIES` context: GCM if offered, else CCM.
fn select_cipher(data: &[u8]) -> Result<Cipher, ParsingError> {
    let count = usize::from(u16_at(data, 0)?);
    let mut fallback = Cipher::None;
    for i in 0..count {
        match Cipher::from_id(u16_at(data, 2 + 2 * i)?) {
            Some(Cipher::Aes128Gcm) => return Ok(Cipher::Aes128Gcm),
            Some(Cipher::Aes128Ccm) => fallback = Cipher::Aes128Ccm,
            _ => {},
        }
    }
    Ok(fallback)
}

/// What the negotiate contexts of a 3.1.1 request settle.
struct SelectedContexts {
    hash_algorithm: HashAlgorithm,
    cipher: Cipher,
}

/// Evaluates the contexts of a 3.1.1 request.
///
/// Exactly one `PREAUTH_INTEGRITY_CAPABILITIES` context must be present and name a known
/// hash. Unknown context types are skipped; of several `ENCRYPTION_CAPABILITIES` contexts
/// the last one wins.
fn select_contexts(config: &SecurityConfig, request: &NegotiateRequest, message: &[u8]) -> Result<SelectedContexts, ParsingError> {
    let contexts = request.contexts(message)?;

    let preauth_contexts: Vec<&NegotiateContext> = contexts.iter()
        .filter(|c| c.context_type == PREAUTH_INTEGRITY_CAPABILITIES)
        .collect();
    if preauth_contexts.len() != 1 {
        return Err(ParsingError::ContextCount {
            context_type: PREAUTH_INTEGRITY_CAPABILITIES,
            count: preauth_contexts.len(),
        });
    }
    let hash_algorithm = select_hash_algorithm(&preauth_contexts[0].data)?
        .ok_or(ParsingError::NoCommonAlgorithm { context_type: PREAUTH_INTEGRITY_CAPABILITIES })?;

    let mut cipher = Cipher::None;
    if config.encryption_supported {
        for context in contexts.iter().filter(|c| c.context_type == ENCRYPTION_CAPABILITIES) {
            cipher = select_cipher(&context.data)?;
        }
    }
    Ok(SelectedContexts { hash_algorithm, cipher })
}


/// Checks the SMB2 header of `message` and that it carries `command`.
pub(crate) fn check_smb2_header(message: &[u8], command: u16) -> Result<(), ParsingError> {
    if message.len() < SMB2_HEADER_SIZE {
        return Err(ParsingError::ShortBuffer { expected_min_len: SMB2_HEADER_SIZE, obtained_len: message.len() });
    }
    let protocol_id: [u8; 4] = array_at(message, 0)?;
    if protocol_id != SMB2_PROTOCOL_ID {
        return Err(ParsingError::MagicMismatch { expected: SMB2_PROTOCOL_ID, obtained: protocol_id });
    }
    let structure_size = u16_at(message, 4)?;
    if usize::from(structure_size) != SMB2_HEADER_SIZE {
        return Err(ParsingError::StructureSize { expected: SMB2_HEADER_SIZE as u16, obtained: structure_size });
    }
    if u16_at(message, 12)? != command {
        return Err(ParsingError::Unexpected("unexpected SMB2 command"));
    }
    Ok(())
}


/// A parsed SMB2 NEGOTIATE request.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NegotiateRequest {
    pub security_mode: SecurityMode,
    pub capabilities: Capabilities,
    pub client_guid: [u8; 16],
    pub dialects: Vec<u16>,
    context_offset: usize,
    context_count: usize,
}
impl NegotiateRequest {
    /// Parses a complete NEGOTIATE request message (header and body).
    pub fn parse(message: &[u8]) -> Result<Self, ParsingError> {
        check_smb2_header(message, NEGOTIATE_COMMAND)?;
        let body = SMB2_HEADER_SIZE;

        let structure_size = u16_at(message, body)?;
        if structure_size != NEGOTIATE_REQUEST_STRUCTURE_SIZE {
            return Err(ParsingError::StructureSize { expected: NEGOTIATE_REQUEST_STRUCTURE_SIZE, obtained: structure_size });
        }
        let dialect_count = usize::from(u16_at(message, body + 2)?);
        let security_mode = SecurityMode::from_bits_truncate(u16_at(message, body + 4)?);
        let capabilities = Capabilities::from_bits_truncate(u32_at(message, body + 8)?);
        let client_guid = array_at(message, body + 12)?;
        let context_offset = u32_at(message, body + 28)? as usize;
        let context_count = usize::from(u16_at(message, body + 32)?);

        let dialect_bytes = slice_at(message, body + 36, dialect_count * 2)?;
        let dialects = dialect_bytes.chunks_exact(2)
            .map(|chk| u16::from_le_bytes([chk[0], chk[1]]))
            .collect();

        Ok(Self {
            security_mode,
            capabilities,
            client_guid,
            dialects,
            context_offset,
            context_count,
        })
    }

    /// Reads the negotiate contexts. Only meaningful when 3.1.1 was offered.
    pub fn contexts(&self, message: &[u8]) -> Result<Vec<NegotiateContext>, ParsingError> {
        if self.context_count == 0 {
            return Ok(Vec::new());
        }
        NegotiateContext::parse_list(message, self.context_offset, self.context_count)
    }
}


/// Where a connection stands in negotiation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NegotiationPhase {
    Idle,
    DialectOffered,
    DialectChosen,

    /// Session setup completed; negotiated values no longer change.
    Frozen,
}


/// The per-connection negotiation state of a server.
#[derive(Debug)]
pub struct NegotiationState {
    phase: NegotiationPhase,
    offered: Vec<u16>,
    dialect: Option<Dialect>,
    cipher: Cipher,
    hash_algorithm: Option<HashAlgorithm>,
    context_count: u16,
    preauth: PreauthIntegrity,
    encryption_key: [u8; 8],
    client_security_mode: SecurityMode,
    client_capabilities: Capabilities,
    signing_enabled: bool,
    signing_required: bool,
}
impl Default for NegotiationState {
    fn default() -> Self {
        Self::new()
    }
}
impl NegotiationState {
    /// A fresh connection with its random legacy challenge.
    pub fn new() -> Self {
        let mut encryption_key = [0u8; 8];
        OsRng.fill_bytes(&mut encryption_key);
        Self {
            phase: NegotiationPhase::Idle,
            offered: Vec::new(),
            dialect: None,
            cipher: Cipher::None,
            hash_algorithm: None,
            context_count: 0,
            preauth: PreauthIntegrity::Unsupported,
            encryption_key,
            client_security_mode: SecurityMode::empty(),
            client_capabilities: Capabilities::empty(),
            signing_enabled: false,
            signing_required: false,
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// The dialect codes of the last SMB2 NEGOTIATE request.
    pub fn offered(&self) -> &[u16] {
        &self.offered
    }

    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    pub fn hash_algorithm(&self) -> Option<HashAlgorithm> {
        self.hash_algorithm
    }

    /// The number of negotiate contexts the response carries.
    pub fn context_count(&self) -> u16 {
        self.context_count
    }

    /// The connection's running pre-authentication hash.
    pub fn preauth(&self) -> &PreauthIntegrity {
        &self.preauth
    }

    /// The connection-wide random challenge used by legacy logons.
    pub fn encryption_key(&self) -> &[u8; 8] {
        &self.encryption_key
    }

    pub fn client_capabilities(&self) -> Capabilities {
        self.client_capabilities
    }

    pub fn signing_enabled(&self) -> bool {
        self.signing_enabled
    }

    /// Whether either side requires signed sessions.
    pub fn signing_required(&self) -> bool {
        self.signing_required
    }

    fn ensure_open(&self, registry: &SessionRegistry) -> Result<(), Error> {
        match self.phase {
            NegotiationPhase::Idle | NegotiationPhase::DialectOffered => {},
            NegotiationPhase::DialectChosen | NegotiationPhase::Frozen => return Err(Error::Unsuccessful),
        }
        if !registry.has_free_slot() {
            return Err(Error::RequestNotAccepted);
        }
        Ok(())
    }

    /// Handles an SMB1 NEGOTIATE request's dialect list.
    ///
    /// Choosing "SMB 2.???" leaves the connection open for the SMB2 NEGOTIATE that follows;
    /// any other choice concludes negotiation.
    pub fn process_smb1_negotiate(
        &mut self,
        config: &SecurityConfig,
        registry: &SessionRegistry,
        offered: &[&str],
    ) -> Result<Smb1DialectChoice, Error> {
        if self.phase != NegotiationPhase::Idle {
            return Err(Error::Unsuccessful);
        }
        self.ensure_open(registry)?;

        let choice = select_dialect(offered, config.smb2)
            .ok_or(ParsingError::NoCommonDialect)?;
        debug!(dialect = choice.dialect.as_str(), index = choice.index, "selected SMB1 dialect");

        self.signing_enabled = config.signing_enabled || config.signing_required;
        self.signing_required = config.signing_required;
        let (dialect, phase) = match choice.dialect {
            Smb1Dialect::NtLm012 => (None, NegotiationPhase::DialectChosen),
            Smb1Dialect::Smb2002 => (Some(Dialect::Smb202), NegotiationPhase::DialectChosen),
            Smb1Dialect::Smb2Wildcard => (Some(Dialect::Smb2Wildcard), NegotiationPhase::DialectOffered),
        };
        self.dialect = dialect;
        self.phase = phase;
        Ok(choice)
    }

    /// Handles a complete SMB2 NEGOTIATE request message.
    ///
    /// For 3.1.1 the negotiate contexts are evaluated and the whole request is chained into
    /// the pre-authentication hash.
    pub fn process_negotiate(
        &mut self,
        config: &SecurityConfig,
        registry: &SessionRegistry,
        message: &[u8],
    ) -> Result<Dialect, Error> {
        self.ensure_open(registry)?;

        let request = NegotiateRequest::parse(message)?;
        let dialect = select_smb2_dialect(&request.dialects, config)
            .ok_or(ParsingError::NoCommonDialect)?;

        // nothing is committed until the contexts have been accepted
        let mut cipher = Cipher::None;
        let mut hash_algorithm = None;
        let mut context_count = 0;
        let mut preauth = PreauthIntegrity::Unsupported;
        if dialect.has_preauth_integrity() {
            let selected = select_contexts(config, &request, message)?;
            hash_algorithm = Some(selected.hash_algorithm);
            cipher = selected.cipher;
            context_count = if cipher == Cipher::None { 1 } else { 2 };
            preauth = PreauthIntegrity::begin();
            preauth.update(message)?;
        } else if dialect.is_smb3()
            && config.encryption_supported
            && request.capabilities.contains(Capabilities::ENCRYPTION)
        {
            cipher = Cipher::Aes128Ccm;
        }

        self.offered = request.dialects.clone();
        self.client_security_mode = request.security_mode;
        self.client_capabilities = request.capabilities;
        self.dialect = Some(dialect);
        self.phase = NegotiationPhase::DialectChosen;
        self.cipher = cipher;
        self.hash_algorithm = hash_algorithm;
        self.context_count = context_count;
        self.preauth = preauth;

        self.signing_enabled = config.signing_enabled || config.signing_required;
        self.signing_required = config.signing_required
            || request.security_mode.contains(SecurityMode::SIGNING_REQUIRED);

        debug!(dialect = ?dialect, cipher = ?self.cipher, hash = ?self.hash_algorithm, "negotiated");
        Ok(dialect)
    }

    /// Builds the NEGOTIATE response body (without SMB2 header) for the chosen dialect.
    ///
    /// Each call draws a fresh preauth salt.
    pub fn build_response(&self, config: &SecurityConfig, security_blob: &[u8]) -> Result<Vec<u8>, Error> {
        let dialect = self.dialect.ok_or(Error::Unsuccessful)?;

        let mut security_mode = SecurityMode::empty();
        if self.signing_enabled {
            security_mode |= SecurityMode::SIGNING_ENABLED;
        }
        if config.signing_required {
            security_mode |= SecurityMode::SIGNING_REQUIRED;
        }
        let mut capabilities = Capabilities::empty();
        if dialect != Dialect::Smb202 {
            capabilities |= Capabilities::LARGE_MTU;
        }
        if self.cipher != Cipher::None && dialect != Dialect::Smb311 {
            capabilities |= Capabilities::ENCRYPTION;
        }

        let security_offset = SMB2_HEADER_SIZE + NEGOTIATE_RESPONSE_FIXED_LEN;
        let security_len = u16::try_from(security_blob.len())
            .or(Err(Error::InvalidParameter(ParsingError::Unexpected("security blob too long"))))?;

        let contexts = if dialect.has_preauth_integrity() {
            self.response_contexts()?
        } else {
            Vec::new()
        };
        let context_offset = if contexts.is_empty() {
            0
        } else {
            align8(security_offset + security_blob.len())
        };

        let mut buf = Vec::with_capacity(NEGOTIATE_RESPONSE_FIXED_LEN + security_blob.len() + 128);
        buf.extend_from_slice(&NEGOTIATE_RESPONSE_STRUCTURE_SIZE.to_le_bytes());
        buf.extend_from_slice(&security_mode.bits().to_le_bytes());
        buf.extend_from_slice(&dialect.code().to_le_bytes());
        buf.extend_from_slice(&(contexts.len() as u16).to_le_bytes());
        buf.extend_from_slice(&config.server_guid);
        buf.extend_from_slice(&capabilities.bits().to_le_bytes());
        buf.extend_from_slice(&config.max_transact_size.to_le_bytes());
        buf.extend_from_slice(&config.max_read_size.to_le_bytes());
        buf.extend_from_slice(&config.max_write_size.to_le_bytes());
        buf.extend_from_slice(&nt_time_now().to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes()); // server start time
        buf.extend_from_slice(&(security_offset as u16).to_le_bytes());
        buf.extend_from_slice(&security_len.to_le_bytes());
        buf.extend_from_slice(&(context_offset as u32).to_le_bytes());
        buf.extend_from_slice(security_blob);

        if !contexts.is_empty() {
            buf.resize(context_offset - SMB2_HEADER_SIZE, 0);
            write_context_list(&mut buf, SMB2_HEADER_SIZE, &contexts);
        }
        Ok(buf)
    }

    fn response_contexts(&self) -> Result<Vec<NegotiateContext>, Error> {
        let hash_id = self.hash_algorithm.ok_or(Error::Unsuccessful)?.id();
        let mut salt = [0u8; PREAUTH_SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let mut preauth = Vec::with_capacity(6 + PREAUTH_SALT_LEN);
        preauth.extend_from_slice(&1u16.to_le_bytes());
        preauth.extend_from_slice(&(PREAUTH_SALT_LEN as u16).to_le_bytes());
        preauth.extend_from_slice(&hash_id.to_le_bytes());
        preauth.extend_from_slice(&salt);

        let mut contexts = vec![NegotiateContext { context_type: PREAUTH_INTEGRITY_CAPABILITIES, data: preauth }];
        if self.cipher != Cipher::None {
            let mut encryption = Vec::with_capacity(4);
            encryption.extend_from_slice(&1u16.to_le_bytes());
            encryption.extend_from_slice(&self.cipher.id().to_le_bytes());
            contexts.push(NegotiateContext { context_type: ENCRYPTION_CAPABILITIES, data: encryption });
        }
        Ok(contexts)
    }

    /// Chains the complete NEGOTIATE response message into the pre-authentication hash.
    pub fn record_response(&mut self, message: &[u8]) -> Result<(), Error> {
        self.preauth.update(message)
    }

    /// Concludes negotiation once session setup has completed.
    pub fn freeze(&mut self) {
        self.preauth.finish();
        self.phase = NegotiationPhase::Frozen;
    }
}


/// A parsed SMB2 NEGOTIATE response, as seen by a client.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NegotiateResponse {
    pub security_mode: SecurityMode,
    pub dialect: Dialect,
    pub capabilities: Capabilities,
    pub server_guid: [u8; 16],
    pub security_blob: Vec<u8>,
    pub cipher: Cipher,
    pub hash_algorithm: Option<HashAlgorithm>,
}
impl NegotiateResponse {
    /// Parses a complete NEGOTIATE response message (header and body).
    pub fn parse(message: &[u8]) -> Result<Self, ParsingError> {
        check_smb2_header(message, NEGOTIATE_COMMAND)?;
        let body = SMB2_HEADER_SIZE;

        let structure_size = u16_at(message, body)?;
        if structure_size != NEGOTIATE_RESPONSE_STRUCTURE_SIZE {
            return Err(ParsingError::StructureSize { expected: NEGOTIATE_RESPONSE_STRUCTURE_SIZE, obtained: structure_size });
        }
        let security_mode = SecurityMode::from_bits_truncate(u16_at(message, body + 2)?);
        let dialect = Dialect::from_code(u16_at(message, body + 4)?)
            .ok_or(ParsingError::NoCommonDialect)?;
        let context_count = usize::from(u16_at(message, body + 6)?);
        let server_guid = array_at(message, body + 8)?;
        let capabilities = Capabilities::from_bits_truncate(u32_at(message, body + 24)?);
        let security_offset = usize::from(u16_at(message, body + 56)?);
        let security_len = usize::from(u16_at(message, body + 58)?);
        let context_offset = u32_at(message, body + 60)? as usize;

        let security_blob = if security_len == 0 {
            Vec::new()
        } else {
            slice_at(message, security_offset, security_len)?.to_vec()
        };

        let mut cipher = Cipher::None;
        let mut hash_algorithm = None;
        if dialect.has_preauth_integrity() {
            for context in NegotiateContext::parse_list(message, context_offset, context_count)? {
                match context.context_type {
                    PREAUTH_INTEGRITY_CAPABILITIES => hash_algorithm = select_hash_algorithm(&context.data)?,
                    ENCRYPTION_CAPABILITIES => cipher = select_cipher(&context.data)?,
                    _ => {},
                }
            }
        } else if dialect.is_smb3() && capabilities.contains(Capabilities::ENCRYPTION) {
            cipher = Cipher::Aes128Ccm;
        }

        Ok(Self {
            security_mode,
            dialect,
            capabilities,
            server_guid,
            security_blob,
            cipher,
            hash_algorithm,
        })
    }
}


/// Assembles SMB2 NEGOTIATE requests; used by clients and by tests of the server side.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct NegotiateRequestBuilder {
    pub security_mode: SecurityMode,
    pub capabilities: Capabilities,
    pub client_guid: [u8; 16],
    pub dialects: Vec<u16>,
    pub contexts: Vec<NegotiateContext>,
}
impl NegotiateRequestBuilder {
    /// A `PREAUTH_INTEGRITY_CAPABILITIES` context offering `hash_ids` with a random salt.
    pub fn preauth_context(hash_ids: &[u16]) -> NegotiateContext {
        let mut salt = [0u8; PREAUTH_SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut data = Vec::with_capacity(4 + 2 * hash_ids.len() + PREAUTH_SALT_LEN);
        data.extend_from_slice(&(hash_ids.len() as u16).to_le_bytes());
        data.extend_from_slice(&(PREAUTH_SALT_LEN as u16).to_le_bytes());
        for id in hash_ids {
            data.extend_from_slice(&id.to_le_bytes());
        }
        data.extend_from_slice(&salt);
        NegotiateContext { context_type: PREAUTH_INTEGRITY_CAPABILITIES, data }
    }

    /// An `ENCRYPTION_CAPABILITIES` context offering `cipher_ids` in order.
    pub fn encryption_context(cipher_ids: &[u16]) -> NegotiateContext {
        let mut data = Vec::with_capacity(2 + 2 * cipher_ids.len());
        data.extend_from_slice(&(cipher_ids.len() as u16).to_le_bytes());
        for id in cipher_ids {
            data.extend_from_slice(&id.to_le_bytes());
        }
        NegotiateContext { context_type: ENCRYPTION_CAPABILITIES, data }
    }

    /// Serializes the request body (without SMB2 header).
    pub fn to_body(&self) -> Vec<u8> {
        let dialects_end = SMB2_HEADER_SIZE + 36 + 2 * self.dialects.len();
        let context_offset = if self.contexts.is_empty() { 0 } else { align8(dialects_end) };

        let mut buf = Vec::new();
        buf.extend_from_slice(&NEGOTIATE_REQUEST_STRUCTURE_SIZE.to_le_bytes());
        buf.extend_from_slice(&(self.dialects.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.security_mode.bits().to_le_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.capabilities.bits().to_le_bytes());
        buf.extend_from_slice(&self.client_guid);
        buf.extend_from_slice(&(context_offset as u32).to_le_bytes());
        buf.extend_from_slice(&(self.contexts.len() as u16).to_le_bytes());
        buf.extend_from_slice(&[0, 0]);
        for dialect in &self.dialects {
            buf.extend_from_slice(&dialect.to_le_bytes());
        }
        if !self.contexts.is_empty() {
            buf.resize(context_offset - SMB2_HEADER_SIZE, 0);
            write_context_list(&mut buf, SMB2_HEADER_SIZE, &self.contexts);
        }
        buf
    }
}


/// Prefixes an SMB2 message body with a minimal sync header.
pub fn smb2_message(command: u16, flags: u32, session_id: u64, body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(SMB2_HEADER_SIZE + body.len());
    msg.extend_from_slice(&SMB2_PROTOCOL_ID);
    msg.extend_from_slice(&(SMB2_HEADER_SIZE as u16).to_le_bytes());
    msg.extend_from_slice(&[0, 0]); // credit charge
    msg.extend_from_slice(&[0, 0, 0, 0]); // status
    msg.extend_from_slice(&command.to_le_bytes());
    msg.extend_from_slice(&1u16.to_le_bytes()); // credits
    msg.extend_from_slice(&flags.to_le_bytes());
    msg.extend_from_slice(&[0, 0, 0, 0]); // next command
    msg.extend_from_slice(&0u64.to_le_bytes()); // message id
    msg.extend_from_slice(&[0, 0, 0, 0]); // reserved
    msg.extend_from_slice(&[0, 0, 0, 0]); // tree id
    msg.extend_from_slice(&session_id.to_le_bytes());
    msg.extend_from_slice(&[0u8; 16]); // signature
    msg.extend_from_slice(body);
    msg
}
