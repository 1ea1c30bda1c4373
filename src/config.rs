//! Security configuration of a client or server endpoint.


/// The highest legacy security level tried by default.
pub const MAX_SECURITY_LEVEL: u8 = 4;

/// The largest MAC session key retained after an extended-security logon.
pub const DEFAULT_MAX_SIGNING_KEY_LEN: usize = 16;


/// Settings consulted during negotiation and logon.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityConfig {
    /// The first legacy security level tried when extended security is unavailable.
    pub max_security_level: u8,

    /// Whether the SPNEGO-wrapped logon is offered.
    pub extended_security: bool,

    /// Whether SMB2 dialects are negotiated at all.
    pub smb2: bool,

    /// Whether SMB 3.x dialects are negotiated.
    pub smb3: bool,

    pub signing_enabled: bool,
    pub signing_required: bool,

    /// Whether this endpoint can encrypt messages once a cipher is agreed.
    pub encryption_supported: bool,

    /// The MAC session key is cut to this length after an extended-security logon.
    pub max_signing_key_len: usize,

    /// Maximum number of concurrently registered users.
    pub max_users: usize,

    pub server_guid: [u8; 16],
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
}
impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_security_level: MAX_SECURITY_LEVEL,
            extended_security: cfg!(feature = "extended-security"),
            smb2: true,
            smb3: cfg!(feature = "smb3"),
            signing_enabled: true,
            signing_required: false,
            encryption_supported: cfg!(feature = "smb3"),
            max_signing_key_len: DEFAULT_MAX_SIGNING_KEY_LEN,
            max_users: 64,
            server_guid: [0; 16],
            max_transact_size: 0x0010_0000,
            max_read_size: 0x0010_0000,
            max_write_size: 0x0010_0000,
        }
    }
}
impl SecurityConfig {
    /// A configuration requiring signed sessions.
    pub fn signing_required() -> Self {
        Self {
            signing_required: true,
            ..Self::default()
        }
    }
}
