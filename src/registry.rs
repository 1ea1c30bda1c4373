//! Per-user security state and the registry owning it.


use std::collections::BTreeMap;
use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, trace};

use crate::config::SecurityConfig;
use crate::error::Error;
use crate::kdf::{Role, SessionKeys, derive_session_keys};
use crate::negotiate::{Cipher, Dialect};
use crate::preauth::PreauthIntegrity;


/// Key material that is wiped when released or dropped.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct SecretBlob(Vec<u8>);
impl SecretBlob {
    pub fn new(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(bytes.len())
            .or(Err(Error::OutOfMemory))?;
        buf.extend_from_slice(bytes);
        Ok(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Wipes and releases the key. Calling it again has no effect.
    pub fn dispose(&mut self) {
        self.0.fill(0);
        self.0.clear();
        self.0.shrink_to_fit();
    }
}
impl fmt::Debug for SecretBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBlob({} bytes)", self.0.len())
    }
}
impl Drop for SecretBlob {
    fn drop(&mut self) {
        self.dispose();
    }
}


/// Length of the random per-session part of outgoing transform nonces.
const NONCE_SALT_LEN: usize = 4;


/// The security state of one logged-on user.
#[derive(Debug)]
pub struct UserSecurityState {
    uid: u16,
    session_id: u64,
    is_anonymous: bool,
    is_guest: bool,
    logged: bool,
    is_logging_off: bool,

    session_key: SecretBlob,
    mac_session_key: SecretBlob,
    signing_key: SecretBlob,
    encryption_key: SecretBlob,
    decryption_key: SecretBlob,
    application_key: SecretBlob,

    /// The nonce of the last message decrypted for this session.
    encrypt_nonce: [u8; 16],
    nonce_counter: u64,
    nonce_salt: [u8; NONCE_SALT_LEN],

    preauth: PreauthIntegrity,
    is_preauth_integ_on: bool,
    dialect: Option<Dialect>,
    cipher: Cipher,
}
impl UserSecurityState {
    fn new(uid: u16, is_anonymous: bool) -> Self {
        let mut nonce_salt = [0u8; NONCE_SALT_LEN];
        OsRng.fill_bytes(&mut nonce_salt);
        Self {
            uid,
            session_id: 0,
            is_anonymous,
            is_guest: false,
            logged: false,
            is_logging_off: false,
            session_key: SecretBlob::default(),
            mac_session_key: SecretBlob::default(),
            signing_key: SecretBlob::default(),
            encryption_key: SecretBlob::default(),
            decryption_key: SecretBlob::default(),
            application_key: SecretBlob::default(),
            encrypt_nonce: [0; 16],
            nonce_counter: 0,
            nonce_salt,
            preauth: PreauthIntegrity::Unsupported,
            is_preauth_integ_on: false,
            dialect: None,
            cipher: Cipher::None,
        }
    }

    pub fn uid(&self) -> u16 { self.uid }
    pub fn session_id(&self) -> u64 { self.session_id }
    pub fn is_anonymous(&self) -> bool { self.is_anonymous }
    pub fn is_guest(&self) -> bool { self.is_guest }
    pub fn is_logged(&self) -> bool { self.logged }
    pub fn is_logging_off(&self) -> bool { self.is_logging_off }
    pub fn session_key(&self) -> &[u8] { self.session_key.as_bytes() }
    pub fn mac_session_key(&self) -> &[u8] { self.mac_session_key.as_bytes() }
    pub fn signing_key(&self) -> &[u8] { self.signing_key.as_bytes() }
    pub fn encryption_key(&self) -> &[u8] { self.encryption_key.as_bytes() }
    pub fn decryption_key(&self) -> &[u8] { self.decryption_key.as_bytes() }
    pub fn application_key(&self) -> &[u8] { self.application_key.as_bytes() }
    pub fn encrypt_nonce(&self) -> &[u8; 16] { &self.encrypt_nonce }
    pub fn preauth(&self) -> &PreauthIntegrity { &self.preauth }
    pub fn is_preauth_integ_on(&self) -> bool { self.is_preauth_integ_on }
    pub fn dialect(&self) -> Option<Dialect> { self.dialect }
    pub fn cipher(&self) -> Cipher { self.cipher }

    pub fn set_session_id(&mut self, session_id: u64) {
        self.session_id = session_id;
    }

    pub fn set_anonymous(&mut self, is_anonymous: bool) {
        self.is_anonymous = is_anonymous;
    }

    pub fn set_guest(&mut self, is_guest: bool) {
        self.is_guest = is_guest;
    }

    /// Records the dialect and cipher of the connection the session is bound to.
    pub fn bind(&mut self, dialect: Option<Dialect>, cipher: Cipher) {
        self.dialect = dialect;
        self.cipher = cipher;
    }

    /// Starts the session's pre-authentication hash from the connection's value.
    pub fn begin_preauth(&mut self, connection: &PreauthIntegrity) {
        self.preauth = connection.fork();
        self.is_preauth_integ_on = self.preauth.is_active();
    }

    /// Chains a complete SESSION_SETUP request or response into the session's
    /// pre-authentication hash. A no-op for dialects without one; refused once finished.
    pub fn record_setup_message(&mut self, message: &[u8]) -> Result<(), Error> {
        self.preauth.update(message)
    }

    /// Stops chaining messages into the session's pre-authentication hash.
    pub fn finish_preauth(&mut self) {
        self.preauth.finish();
        self.is_preauth_integ_on = false;
    }

    pub fn mark_logged(&mut self) {
        self.logged = true;
    }

    /// Replaces the session and MAC keys, wiping the previous ones.
    pub fn install_session_keys(&mut self, session_key: &[u8], mac_session_key: &[u8]) -> Result<(), Error> {
        let session_key = SecretBlob::new(session_key)?;
        let mac_session_key = SecretBlob::new(mac_session_key)?;
        let signing_key = SecretBlob::new(session_key.as_bytes())?;
        self.session_key = session_key;
        self.mac_session_key = mac_session_key;
        self.signing_key = signing_key;
        Ok(())
    }

    /// Replaces the signing, cipher and application keys with derived SMB3 keys.
    pub fn install_derived_keys(&mut self, keys: &SessionKeys) -> Result<(), Error> {
        let signing_key = SecretBlob::new(&keys.signing)?;
        let encryption_key = SecretBlob::new(&keys.encryption)?;
        let decryption_key = SecretBlob::new(&keys.decryption)?;
        let application_key = SecretBlob::new(&keys.application)?;
        self.signing_key = signing_key;
        self.encryption_key = encryption_key;
        self.decryption_key = decryption_key;
        self.application_key = application_key;
        self.nonce_counter = 0;
        Ok(())
    }

    /// Derives the SMB3 keys for `role` from the session key and the session's own
    /// pre-authentication hash, and installs them.
    pub fn derive_keys(&mut self, role: Role) -> Result<(), Error> {
        let dialect = self.dialect.ok_or(Error::Unsuccessful)?;
        let keys = derive_session_keys(self.session_key.as_bytes(), dialect, self.preauth.value(), role)?;
        self.install_derived_keys(&keys)
    }

    /// Wipes every key and clears the logged flag. Calling it again has no effect.
    pub fn release_keys(&mut self) {
        for blob in [
            &mut self.session_key,
            &mut self.mac_session_key,
            &mut self.signing_key,
            &mut self.encryption_key,
            &mut self.decryption_key,
            &mut self.application_key,
        ] {
            blob.dispose();
        }
        self.encrypt_nonce = [0; 16];
        self.logged = false;
    }

    /// Produces a nonce for the next outgoing encrypted message.
    ///
    /// The nonce is the 64-bit message counter followed by the per-session salt, zero-padded
    /// to 16 bytes. Fails once the counter is exhausted.
    pub(crate) fn next_outgoing_nonce(&mut self) -> Result<[u8; 16], Error> {
        let counter = self.nonce_counter;
        self.nonce_counter = counter.checked_add(1)
            .ok_or(Error::Unsuccessful)?;

        let mut nonce = [0u8; 16];
        nonce[0..8].copy_from_slice(&counter.to_le_bytes());
        let salted = self.cipher.nonce_len().saturating_sub(8).min(NONCE_SALT_LEN);
        nonce[8..8 + salted].copy_from_slice(&self.nonce_salt[..salted]);
        Ok(nonce)
    }

    pub(crate) fn record_incoming_nonce(&mut self, nonce: &[u8; 16]) {
        self.encrypt_nonce = *nonce;
    }
}


/// Owns the security state of every user of an endpoint.
#[derive(Debug)]
pub struct SessionRegistry {
    users: BTreeMap<u16, UserSecurityState>,
    max_users: usize,
    next_uid: u16,
    open: bool,
}
impl SessionRegistry {
    /// Opens a registry with room for `max_users` users, at most one per non-zero uid.
    pub fn open(max_users: usize) -> Self {
        Self {
            users: BTreeMap::new(),
            max_users: max_users.min(usize::from(u16::MAX)),
            next_uid: 1,
            open: true,
        }
    }

    pub fn with_config(config: &SecurityConfig) -> Self {
        Self::open(config.max_users)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Wipes and drops every user; later registrations are refused.
    pub fn close(&mut self) {
        for user in self.users.values_mut() {
            user.is_logging_off = true;
            user.release_keys();
        }
        self.users.clear();
        self.open = false;
        debug!("session registry closed");
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Whether another user can be registered.
    pub fn has_free_slot(&self) -> bool {
        self.open && self.users.len() < self.max_users
    }

    /// Registers a new user and returns its uid.
    pub fn create_user(&mut self, is_anonymous: bool) -> Result<u16, Error> {
        if !self.open {
            return Err(Error::Unsuccessful);
        }
        if !self.has_free_slot() {
            return Err(Error::InsufficientResources);
        }

        let mut uid = self.next_uid;
        while uid == 0 || self.users.contains_key(&uid) {
            uid = uid.wrapping_add(1);
        }
        self.next_uid = uid.wrapping_add(1);

        self.users.insert(uid, UserSecurityState::new(uid, is_anonymous));
        trace!(uid, "user registered");
        Ok(uid)
    }

    pub fn user(&self, uid: u16) -> Option<&UserSecurityState> {
        self.users.get(&uid)
    }

    pub fn user_mut(&mut self, uid: u16) -> Option<&mut UserSecurityState> {
        self.users.get_mut(&uid)
    }

    /// Finds the user owning a session. Users being logged off are skipped.
    pub fn find_by_session_id(&mut self, session_id: u64) -> Option<&mut UserSecurityState> {
        if session_id == 0 {
            return None;
        }
        self.users.values_mut()
            .find(|u| u.session_id == session_id && !u.is_logging_off)
    }

    /// Wipes and removes a user.
    pub fn logoff(&mut self, uid: u16) -> Result<(), Error> {
        let user = self.users.get_mut(&uid)
            .ok_or(Error::Unsuccessful)?;
        user.is_logging_off = true;
        user.release_keys();
        self.users.remove(&uid);
        debug!(uid, "user logged off");
        Ok(())
    }
}
impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if self.open {
            self.close();
        }
    }
}
