//! Client-side session setup.
//!
//! A [`LogonOrchestrator`] authenticates one registered user over one connection. With
//! extended security, the challenge/response exchange is left to a [`SpnegoEngine`]; without
//! it, legacy responses are tried from the highest configured security level down to 0.
//! Message I/O is left to a [`SessionSetupTransport`].


use std::fmt;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::config::SecurityConfig;
use crate::credential::{Credential, HashedCredential};
use crate::crypter::{self, Crypter, CrypterPair};
use crate::error::{Error, nt_status};
use crate::kdf::Role;
use crate::negotiate::{Capabilities, Cipher, Dialect, NegotiateResponse, SecurityMode};
use crate::preauth::PreauthIntegrity;
use crate::registry::{SessionRegistry, UserSecurityState};
use crate::signing::{is_signed, verify_message};


/// Legacy responses never carry more MAC key than this.
const LEGACY_MAX_MAC_KEY_LEN: usize = 16;


bitflags! {
    /// Response algorithms a SPNEGO engine may offer.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialEq, PartialOrd)]
    pub struct CrypterSet: u8 {
        const LM = 0x01;
        const LM_V2 = 0x02;
        const NTLM = 0x04;
        const NTLM_V2 = 0x08;
    }
}
impl CrypterSet {
    /// Whether `crypter` may be used. [`Crypter::None`] is always allowed.
    pub fn allows(self, crypter: Crypter) -> bool {
        match crypter {
            Crypter::None => true,
            Crypter::Lm => self.contains(Self::LM),
            Crypter::LmV2 => self.contains(Self::LM_V2),
            Crypter::Ntlm => self.contains(Self::NTLM),
            Crypter::NtlmV2 => self.contains(Self::NTLM_V2),
        }
    }
}

bitflags! {
    /// The `SessionFlags` of a SESSION_SETUP response.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialEq, PartialOrd)]
    pub struct SessionFlags: u16 {
        const IS_GUEST = 0x0001;
        const IS_NULL = 0x0002;
        const ENCRYPT_DATA = 0x0004;
    }
}


/// The response pair sent at each legacy security level.
pub fn crypters_for_level(level: u8) -> CrypterPair {
    match level {
        0 => CrypterPair::new(Crypter::Lm, Crypter::None),
        1 => CrypterPair::new(Crypter::Lm, Crypter::Ntlm),
        2 => CrypterPair::new(Crypter::None, Crypter::Ntlm),
        3 => CrypterPair::new(Crypter::LmV2, Crypter::NtlmV2),
        _ => CrypterPair::new(Crypter::None, Crypter::NtlmV2),
    }
}


/// One session-setup request handed to the transport.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SetupRequest<'a> {
    /// A round of an extended-security exchange.
    Extended { security_blob: &'a [u8] },

    /// A legacy logon at the given security level.
    Legacy {
        level: u8,
        lm_response: &'a [u8],
        nt_response: &'a [u8],
        user: &'a str,
        domain: &'a str,
    },
}

/// The server's answer to a [`SetupRequest`].
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct SetupReply {
    pub status: u32,
    pub session_id: u64,
    pub session_flags: SessionFlags,
    pub security_blob: Vec<u8>,

    /// The complete request message as sent, for the pre-authentication hash.
    pub request_message: Vec<u8>,

    /// The complete response message as received.
    pub response_message: Vec<u8>,
}
impl SetupReply {
    pub fn is_success(&self) -> bool {
        self.status == nt_status::SUCCESS
    }

    pub fn needs_more_processing(&self) -> bool {
        self.status == nt_status::MORE_PROCESSING_REQUIRED
    }
}


/// Sends session-setup requests and returns the server's reply.
pub trait SessionSetupTransport {
    fn exchange(&mut self, request: SetupRequest<'_>) -> Result<SetupReply, Error>;
}

/// The result of a completed SPNEGO exchange.
pub struct SpnegoOutcome {
    pub session_key: Vec<u8>,
    pub mac_session_key: Vec<u8>,

    /// The reply to the last request of the exchange.
    pub final_reply: SetupReply,
}
impl fmt::Debug for SpnegoOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpnegoOutcome")
            .field("final_reply", &self.final_reply)
            .finish_non_exhaustive()
    }
}
impl Drop for SpnegoOutcome {
    fn drop(&mut self) {
        self.session_key.fill(0);
        self.mac_session_key.fill(0);
    }
}

/// Runs an extended-security (SPNEGO) exchange, possibly over several rounds.
pub trait SpnegoEngine {
    fn authenticate(
        &mut self,
        credential: &Credential,
        allowed: CrypterSet,
        transport: &mut dyn SessionSetupTransport,
    ) -> Result<SpnegoOutcome, Error>;
}


/// Chains every request and every intermediate response into a session's preauth hash.
struct PreauthRecorder<'a> {
    inner: &'a mut dyn SessionSetupTransport,
    user: &'a mut UserSecurityState,
}
impl SessionSetupTransport for PreauthRecorder<'_> {
    fn exchange(&mut self, request: SetupRequest<'_>) -> Result<SetupReply, Error> {
        let reply = self.inner.exchange(request)?;
        self.user.record_setup_message(&reply.request_message)?;
        if reply.needs_more_processing() {
            self.user.record_setup_message(&reply.response_message)?;
        }
        Ok(reply)
    }
}


/// What a client knows about the connection it logs on over.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientConnection {
    /// The SMB2 dialect, or `None` for an SMB1 connection.
    pub dialect: Option<Dialect>,
    pub extended_security: bool,

    /// Whether the server authenticates users (rather than shares).
    pub user_level_security: bool,

    /// The server challenge of a legacy logon.
    pub server_challenge: [u8; 8],

    /// Target information to embed in NTLMv2 responses.
    pub target_info: Option<Vec<u8>>,

    pub server_security_mode: SecurityMode,
    pub server_capabilities: Capabilities,
    pub cipher: Cipher,

    /// The connection's pre-authentication hash after negotiation.
    pub preauth: PreauthIntegrity,

    use_signing: bool,
}
impl ClientConnection {
    /// A connection negotiated over SMB2.
    ///
    /// `request_message` and `response_message` are the complete NEGOTIATE messages; they
    /// seed the pre-authentication hash for 3.1.1.
    pub fn from_negotiate(response: &NegotiateResponse, request_message: &[u8], response_message: &[u8]) -> Result<Self, Error> {
        let mut preauth = PreauthIntegrity::Unsupported;
        if response.dialect.has_preauth_integrity() {
            preauth = PreauthIntegrity::begin();
            preauth.update(request_message)?;
            preauth.update(response_message)?;
            preauth.finish();
        }
        Ok(Self {
            dialect: Some(response.dialect),
            extended_security: true,
            user_level_security: true,
            server_challenge: [0; 8],
            target_info: None,
            server_security_mode: response.security_mode,
            server_capabilities: response.capabilities,
            cipher: response.cipher,
            preauth,
            use_signing: false,
        })
    }

    /// An SMB1 connection without extended security.
    pub fn legacy(server_challenge: [u8; 8], user_level_security: bool, server_security_mode: SecurityMode) -> Self {
        Self {
            dialect: None,
            extended_security: false,
            user_level_security,
            server_challenge,
            target_info: None,
            server_security_mode,
            server_capabilities: Capabilities::empty(),
            cipher: Cipher::None,
            preauth: PreauthIntegrity::Unsupported,
            use_signing: false,
        }
    }

    /// Whether messages on this connection are signed.
    pub fn use_signing(&self) -> bool {
        self.use_signing
    }

    fn signing_required(&self, config: &SecurityConfig) -> bool {
        config.signing_required || self.server_security_mode.contains(SecurityMode::SIGNING_REQUIRED)
    }

    fn signing_agreed(&self, config: &SecurityConfig) -> bool {
        self.signing_required(config)
            || (config.signing_enabled && self.server_security_mode.contains(SecurityMode::SIGNING_ENABLED))
    }

    /// The response algorithms the SPNEGO engine may offer.
    ///
    /// When both ends require signing, LM-family responses are excluded since their keys
    /// are too weak to sign with.
    pub fn allowed_crypters(&self, config: &SecurityConfig) -> CrypterSet {
        if config.signing_required && self.server_security_mode.contains(SecurityMode::SIGNING_REQUIRED) {
            CrypterSet::NTLM | CrypterSet::NTLM_V2
        } else {
            CrypterSet::all()
        }
    }
}


/// Drives session setup for the users of a connection.
pub struct LogonOrchestrator {
    config: SecurityConfig,
    spnego: Option<Box<dyn SpnegoEngine>>,
}
impl fmt::Debug for LogonOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogonOrchestrator")
            .field("config", &self.config)
            .field("spnego", &self.spnego.is_some())
            .finish()
    }
}
impl LogonOrchestrator {
    /// An orchestrator able to perform legacy logons only.
    pub fn new(config: SecurityConfig) -> Self {
        Self { config, spnego: None }
    }

    /// An orchestrator that hands extended-security logons to `engine`.
    pub fn with_spnego(config: SecurityConfig, engine: Box<dyn SpnegoEngine>) -> Self {
        Self { config, spnego: Some(engine) }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Logs the user `uid` on with `credential`.
    ///
    /// Returns immediately if the user is already logged on. On failure every key of the
    /// user is released.
    pub fn logon(
        &mut self,
        connection: &mut ClientConnection,
        registry: &mut SessionRegistry,
        uid: u16,
        credential: &Credential,
        transport: &mut dyn SessionSetupTransport,
    ) -> Result<(), Error> {
        let user = registry.user_mut(uid)
            .ok_or(Error::Unsuccessful)?;
        if user.is_logged() {
            return Ok(());
        }

        user.release_keys();
        user.set_anonymous(credential.is_anonymous());
        user.set_guest(false);
        user.bind(connection.dialect, connection.cipher);

        let result = if connection.extended_security && self.config.extended_security {
            self.extended_logon(connection, user, credential, transport)
        } else {
            self.legacy_logon(connection, user, credential, transport)
        };

        match result {
            Ok(()) => {
                user.mark_logged();
                if !user.is_anonymous() && !user.is_guest() && connection.signing_agreed(&self.config) {
                    connection.use_signing = true;
                }
                debug!(uid, session_id = user.session_id(), guest = user.is_guest(), "logon succeeded");
                Ok(())
            },
            Err(e) => {
                user.release_keys();
                user.finish_preauth();
                warn!(uid, "logon failed");
                Err(e)
            },
        }
    }

    /// Releases the user's keys and runs the logon again.
    pub fn reconnect(
        &mut self,
        connection: &mut ClientConnection,
        registry: &mut SessionRegistry,
        uid: u16,
        credential: &Credential,
        transport: &mut dyn SessionSetupTransport,
    ) -> Result<(), Error> {
        registry.user_mut(uid)
            .ok_or(Error::Unsuccessful)?
            .release_keys();
        self.logon(connection, registry, uid, credential, transport)
    }

    /// Marks the user as logging off and destroys its state.
    pub fn logoff(&self, registry: &mut SessionRegistry, uid: u16) -> Result<(), Error> {
        registry.logoff(uid)
    }

    fn extended_logon(
        &mut self,
        connection: &ClientConnection,
        user: &mut UserSecurityState,
        credential: &Credential,
        transport: &mut dyn SessionSetupTransport,
    ) -> Result<(), Error> {
        let allowed = connection.allowed_crypters(&self.config);
        let spnego = self.spnego.as_deref_mut()
            .ok_or(Error::LogonFailure)?;

        user.begin_preauth(&connection.preauth);
        let outcome = {
            let mut recorder = PreauthRecorder { inner: transport, user: &mut *user };
            spnego.authenticate(credential, allowed, &mut recorder)?
        };

        let reply = &outcome.final_reply;
        if !reply.is_success() {
            return Err(Error::LogonFailure);
        }
        user.set_session_id(reply.session_id);
        user.set_guest(reply.session_flags.contains(SessionFlags::IS_GUEST));
        if reply.session_flags.contains(SessionFlags::IS_NULL) {
            user.set_anonymous(true);
        }

        let mac_len = outcome.mac_session_key.len().min(self.config.max_signing_key_len);
        user.install_session_keys(&outcome.session_key, &outcome.mac_session_key[..mac_len])?;

        let dialect = match connection.dialect {
            Some(dialect) if dialect.is_smb3() && !user.session_key().is_empty() => dialect,
            _ => {
                user.finish_preauth();
                return Ok(());
            },
        };

        // 3.1.1 signs the final response with a key bound to the preauth hash
        user.derive_keys(Role::Client)?;
        user.finish_preauth();

        if dialect.has_preauth_integrity() && !user.is_anonymous() && !user.is_guest() {
            if !is_signed(&reply.response_message) {
                return Err(Error::LogonFailure);
            }
            verify_message(&reply.response_message, user.signing_key(), dialect)
                .or(Err(Error::LogonFailure))?;
        }
        Ok(())
    }

    fn legacy_logon(
        &self,
        connection: &ClientConnection,
        user: &mut UserSecurityState,
        credential: &Credential,
        transport: &mut dyn SessionSetupTransport,
    ) -> Result<(), Error> {
        let send_empty = user.is_anonymous() || !connection.user_level_security;
        let hashed = if send_empty {
            None
        } else {
            Some(HashedCredential::hash(credential)?)
        };

        for level in (0..=self.config.max_security_level).rev() {
            let attempt = match &hashed {
                None => Self::empty_attempt(level, user, credential, transport),
                Some(hashed) => Self::legacy_attempt(level, connection, user, credential, hashed, transport),
            };
            match attempt {
                Ok(()) => {
                    debug!(level, "legacy logon accepted");
                    return Ok(());
                },
                Err(Error::OutOfMemory) => return Err(Error::OutOfMemory),
                Err(_) => debug!(level, "legacy logon rejected"),
            }
        }
        Err(Error::LogonFailure)
    }

    fn empty_attempt(
        level: u8,
        user: &mut UserSecurityState,
        credential: &Credential,
        transport: &mut dyn SessionSetupTransport,
    ) -> Result<(), Error> {
        let reply = transport.exchange(SetupRequest::Legacy {
            level,
            lm_response: &[],
            nt_response: &[],
            user: &credential.username,
            domain: &credential.domain,
        })?;
        if !reply.is_success() {
            return Err(Error::LogonFailure);
        }
        user.set_session_id(reply.session_id);
        user.set_guest(reply.session_flags.contains(SessionFlags::IS_GUEST));
        Ok(())
    }

    fn legacy_attempt(
        level: u8,
        connection: &ClientConnection,
        user: &mut UserSecurityState,
        credential: &Credential,
        hashed: &HashedCredential,
        transport: &mut dyn SessionSetupTransport,
    ) -> Result<(), Error> {
        let pair = crypters_for_level(level);
        let result = crypter::encrypt(
            pair,
            credential,
            hashed,
            &connection.server_challenge,
            connection.target_info.as_deref(),
        )?;

        let reply = transport.exchange(SetupRequest::Legacy {
            level,
            lm_response: result.pass1(),
            nt_response: result.pass2(),
            user: &credential.username,
            domain: &credential.domain,
        })?;
        if !reply.is_success() {
            return Err(Error::LogonFailure);
        }

        let mac_key = result.mac_key();
        let mac_len = mac_key.len().min(LEGACY_MAX_MAC_KEY_LEN);
        user.install_session_keys(mac_key, &mac_key[..mac_len])?;
        user.set_session_id(reply.session_id);
        user.set_guest(reply.session_flags.contains(SessionFlags::IS_GUEST));
        Ok(())
    }
}
