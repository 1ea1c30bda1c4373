use std::cell::Cell;
use std::rc::Rc;

use hex_literal::hex;
use tracing_test::traced_test;

use smbsec::crypter::{self, CrypterInputs, NtlmV2Blob};
use smbsec::error::nt_status;
use smbsec::kdf::Role;
use smbsec::logon::{CrypterSet, SessionFlags, SetupReply, SetupRequest, SpnegoOutcome};
use smbsec::negotiate::{
    Capabilities, NegotiateRequestBuilder, NegotiateResponse, SecurityMode, smb2_message,
};
use smbsec::preauth::HashAlgorithm;
use smbsec::signing::sign_message;
use smbsec::{
    Cipher, ClientConnection, Credential, Crypter, CrypterPair, Dialect, Error, HashedCredential,
    LogonOrchestrator, NegotiationState, SecurityConfig, SessionRegistry, SessionSetupTransport,
    SpnegoEngine, decrypt_message, encrypt_message,
};


const NEGOTIATE: u16 = 0x0000;
const SESSION_SETUP: u16 = 0x0001;
const SERVER_TO_REDIR: u32 = 0x0000_0001;
const SESSION_ID: u64 = 0x0000_3000_0000_0009;
const SESSION_KEY: [u8; 16] = hex!("a1b2c3d4e5f60718293a4b5c6d7e8f90");


fn alice() -> Credential {
    Credential::new("WORK", "alice", "Secr3t!")
}


#[test]
fn ntlm_v2_response_for_work_alice() {
    let creds = alice();
    let hashed = HashedCredential::hash(&creds).unwrap();
    let inputs = CrypterInputs { client_nonce: hex!("ffffff0011223344"), timestamp: 0x01D0_0000_0000_0000 };
    let challenge = hex!("0102030405060708");

    let result = crypter::encrypt_with(
        CrypterPair::new(Crypter::None, Crypter::NtlmV2),
        &creds,
        &hashed,
        &challenge,
        None,
        &inputs,
    ).unwrap();

    // 16-byte proof, 28 fixed blob bytes, 8-byte terminator
    assert_eq!(result.response().len(), 52);
    assert_eq!(
        result.response(),
        hex!(
            "a7e1a057d6905fe542858eac4254ac5d"
            "0101000000000000000000000000d001ffffff0011223344"
            "000000000000000000000000"
        ),
    );
    assert_eq!(result.response(), result.pass2());
    assert_eq!(result.mac_key(), hex!("712d0b85d651e80e8349972784c5527b"));
    assert!(result.pass1().is_empty());

    let blob = NtlmV2Blob::from_response(result.response()).unwrap();
    assert_eq!(blob.client_nonce, inputs.client_nonce);
    assert_eq!(blob.timestamp, inputs.timestamp);
    assert_eq!(blob.trailer, &[0u8; 8]);

    let again = crypter::encrypt_with(
        CrypterPair::new(Crypter::None, Crypter::NtlmV2),
        &creds,
        &hashed,
        &challenge,
        None,
        &inputs,
    ).unwrap();
    assert_eq!(again.response(), result.response());
    assert_eq!(again.mac_key(), result.mac_key());
}


/// Accepts only NTLMv2 responses computed from its own copy of the password.
struct VerifyingServer {
    password: Credential,
    challenge: [u8; 8],
    levels: Vec<u8>,
}
impl SessionSetupTransport for VerifyingServer {
    fn exchange(&mut self, request: SetupRequest<'_>) -> Result<SetupReply, Error> {
        let SetupRequest::Legacy { level, nt_response, user, domain, .. } = request else {
            return Err(Error::Unsuccessful);
        };
        self.levels.push(level);

        let rejected = SetupReply { status: nt_status::LOGON_FAILURE, ..SetupReply::default() };
        let Ok(blob) = NtlmV2Blob::from_response(nt_response) else {
            return Ok(rejected);
        };
        let inputs = CrypterInputs { client_nonce: blob.client_nonce, timestamp: blob.timestamp };
        let claimed = Credential::new(domain, user, &self.password.password);
        let hashed = HashedCredential::hash(&claimed)?;
        let expected = crypter::encrypt_with(
            CrypterPair::new(Crypter::None, Crypter::NtlmV2),
            &claimed,
            &hashed,
            &self.challenge,
            None,
            &inputs,
        )?;
        if expected.pass2() != nt_response {
            return Ok(rejected);
        }
        Ok(SetupReply { status: nt_status::SUCCESS, session_id: 0x42, ..SetupReply::default() })
    }
}

#[test]
#[traced_test]
fn legacy_logon_against_verifying_server() {
    let challenge = hex!("0102030405060708");
    let config = SecurityConfig { extended_security: false, ..SecurityConfig::default() };
    let mut orchestrator = LogonOrchestrator::new(config);
    let mut connection = ClientConnection::legacy(challenge, true, SecurityMode::SIGNING_ENABLED);
    let mut registry = SessionRegistry::open(2);
    let uid = registry.create_user(false).unwrap();

    let mut server = VerifyingServer { password: alice(), challenge, levels: Vec::new() };
    orchestrator.logon(&mut connection, &mut registry, uid, &alice(), &mut server).unwrap();
    assert_eq!(server.levels, vec![4]);

    let user = registry.user(uid).unwrap();
    assert!(user.is_logged());
    assert_eq!(user.session_id(), 0x42);
    assert_eq!(user.mac_session_key().len(), 16);
    assert!(connection.use_signing());
    assert!(logs_contain("logon succeeded"));
}

#[test]
fn legacy_logon_with_wrong_password_exhausts_levels() {
    let challenge = hex!("0102030405060708");
    let config = SecurityConfig { extended_security: false, ..SecurityConfig::default() };
    let mut orchestrator = LogonOrchestrator::new(config);
    let mut connection = ClientConnection::legacy(challenge, true, SecurityMode::SIGNING_ENABLED);
    let mut registry = SessionRegistry::open(2);
    let uid = registry.create_user(false).unwrap();

    let mut server = VerifyingServer { password: alice(), challenge, levels: Vec::new() };
    let wrong = Credential::new("WORK", "alice", "secr3t!");
    assert_eq!(
        orchestrator.logon(&mut connection, &mut registry, uid, &wrong, &mut server),
        Err(Error::LogonFailure),
    );
    assert_eq!(server.levels, vec![4, 3, 2, 1, 0]);
    assert!(registry.user(uid).unwrap().session_key().is_empty());
    assert!(!connection.use_signing());
}


/// The server half of an SMB 3.1.1 session setup: answers two rounds, chaining every
/// message into its own session's preauth hash, and signs the final response with the key
/// derived from it.
struct SessionSetupServer {
    registry: SessionRegistry,
    uid: u16,
    round: usize,
    final_status: u32,
    tamper: bool,
}
impl SessionSetupTransport for SessionSetupServer {
    fn exchange(&mut self, request: SetupRequest<'_>) -> Result<SetupReply, Error> {
        let SetupRequest::Extended { security_blob } = request else {
            return Err(Error::Unsuccessful);
        };
        let user = self.registry.user_mut(self.uid).ok_or(Error::Unsuccessful)?;
        let request_message = smb2_message(SESSION_SETUP, 0, SESSION_ID, security_blob);
        user.record_setup_message(&request_message)?;
        self.round += 1;

        if self.round == 1 {
            let response_message = smb2_message(SESSION_SETUP, SERVER_TO_REDIR, SESSION_ID, b"challenge");
            user.record_setup_message(&response_message)?;
            return Ok(SetupReply {
                status: nt_status::MORE_PROCESSING_REQUIRED,
                session_id: SESSION_ID,
                security_blob: b"challenge".to_vec(),
                request_message,
                response_message,
                ..SetupReply::default()
            });
        }

        user.install_session_keys(&SESSION_KEY, &SESSION_KEY)?;
        user.derive_keys(Role::Server)?;
        user.finish_preauth();
        if self.final_status == nt_status::SUCCESS {
            user.mark_logged();
        }

        let mut response_message = smb2_message(SESSION_SETUP, SERVER_TO_REDIR, SESSION_ID, b"accept-completed");
        sign_message(&mut response_message, user.signing_key(), Dialect::Smb311)?;
        if self.tamper {
            let last = response_message.len() - 1;
            response_message[last] ^= 0x20;
        }
        Ok(SetupReply {
            status: self.final_status,
            session_id: SESSION_ID,
            session_flags: SessionFlags::empty(),
            security_blob: Vec::new(),
            request_message,
            response_message,
        })
    }
}


/// Two-round SPNEGO stand-in handing out a fixed session key and an over-long MAC key.
struct FakeSpnego {
    allowed: Rc<Cell<CrypterSet>>,
}
impl SpnegoEngine for FakeSpnego {
    fn authenticate(
        &mut self,
        _credential: &Credential,
        allowed: CrypterSet,
        transport: &mut dyn SessionSetupTransport,
    ) -> Result<SpnegoOutcome, Error> {
        self.allowed.set(allowed);
        let first = transport.exchange(SetupRequest::Extended { security_blob: b"negotiate" })?;
        if !first.needs_more_processing() {
            return Err(Error::LogonFailure);
        }
        let final_reply = transport.exchange(SetupRequest::Extended { security_blob: b"authenticate" })?;
        Ok(SpnegoOutcome {
            session_key: SESSION_KEY.to_vec(),
            mac_session_key: vec![0x5A; 32],
            final_reply,
        })
    }
}

struct Negotiated {
    server: NegotiationState,
    client: ClientConnection,
}

fn negotiate_311(config: &SecurityConfig, client_security_mode: SecurityMode) -> Negotiated {
    let builder = NegotiateRequestBuilder {
        security_mode: client_security_mode,
        capabilities: Capabilities::ENCRYPTION,
        client_guid: [0x33; 16],
        dialects: vec![0x0202, 0x0300, 0x0311],
        contexts: vec![
            NegotiateRequestBuilder::preauth_context(&[HashAlgorithm::SHA512_ID]),
            NegotiateRequestBuilder::encryption_context(&[0x0001, 0x0002]),
        ],
    };
    let request_message = smb2_message(NEGOTIATE, 0, 0, &builder.to_body());

    let registry = SessionRegistry::open(4);
    let mut server = NegotiationState::new();
    assert_eq!(server.process_negotiate(config, &registry, &request_message).unwrap(), Dialect::Smb311);
    let body = server.build_response(config, &[]).unwrap();
    let response_message = smb2_message(NEGOTIATE, SERVER_TO_REDIR, 0, &body);
    server.record_response(&response_message).unwrap();

    let response = NegotiateResponse::parse(&response_message).unwrap();
    let client = ClientConnection::from_negotiate(&response, &request_message, &response_message).unwrap();
    Negotiated { server, client }
}

fn setup_server(negotiated: &Negotiated, final_status: u32, tamper: bool) -> SessionSetupServer {
    let mut registry = SessionRegistry::open(4);
    let uid = registry.create_user(false).unwrap();
    let user = registry.user_mut(uid).unwrap();
    user.set_session_id(SESSION_ID);
    user.bind(Some(Dialect::Smb311), negotiated.server.cipher());
    user.begin_preauth(negotiated.server.preauth());
    SessionSetupServer { registry, uid, round: 0, final_status, tamper }
}

#[test]
#[traced_test]
fn smb311_logon_derives_keys_and_encrypts() {
    let config = SecurityConfig::default();
    let mut negotiated = negotiate_311(&config, SecurityMode::SIGNING_ENABLED);
    assert_eq!(negotiated.client.cipher, Cipher::Aes128Gcm);
    assert_eq!(negotiated.client.preauth.value(), negotiated.server.preauth().value());

    let allowed = Rc::new(Cell::new(CrypterSet::empty()));
    let mut orchestrator = LogonOrchestrator::with_spnego(
        config.clone(),
        Box::new(FakeSpnego { allowed: Rc::clone(&allowed) }),
    );
    let mut transport = setup_server(&negotiated, nt_status::SUCCESS, false);
    let mut client_registry = SessionRegistry::with_config(&config);
    let uid = client_registry.create_user(false).unwrap();

    orchestrator.logon(&mut negotiated.client, &mut client_registry, uid, &alice(), &mut transport).unwrap();
    assert_eq!(allowed.get(), CrypterSet::all());
    assert!(negotiated.client.use_signing());

    let user = client_registry.user(uid).unwrap();
    let server_user = transport.registry.user(transport.uid).unwrap();
    assert!(user.is_logged());
    assert!(server_user.is_logged());
    assert_eq!(user.session_id(), SESSION_ID);
    assert_eq!(user.session_key(), &SESSION_KEY);
    assert_eq!(user.mac_session_key(), &[0x5A; 16]);
    assert_eq!(user.preauth(), server_user.preauth());
    assert_eq!(user.signing_key(), server_user.signing_key());
    assert_eq!(user.encryption_key(), server_user.decryption_key());
    assert_eq!(user.decryption_key(), server_user.encryption_key());
    assert!(!user.is_preauth_integ_on());
    assert!(!server_user.is_preauth_integ_on());
    assert!(logs_contain("logon succeeded"));

    let server_uid = transport.uid;
    let mut server_registry = transport.registry;

    let request = smb2_message(0x0008, 0, SESSION_ID, b"read request");
    let sealed = encrypt_message(&request, client_registry.user_mut(uid).unwrap()).unwrap();
    assert_eq!(decrypt_message(&sealed, &mut server_registry).unwrap(), request);

    let reply = smb2_message(0x0008, SERVER_TO_REDIR, SESSION_ID, b"read response");
    let sealed = encrypt_message(&reply, server_registry.user_mut(server_uid).unwrap()).unwrap();
    assert_eq!(decrypt_message(&sealed, &mut client_registry).unwrap(), reply);
}

#[test]
fn tampered_final_response_fails_and_releases_keys() {
    let config = SecurityConfig::default();
    let mut negotiated = negotiate_311(&config, SecurityMode::SIGNING_ENABLED);
    let allowed = Rc::new(Cell::new(CrypterSet::empty()));
    let mut orchestrator = LogonOrchestrator::with_spnego(config.clone(), Box::new(FakeSpnego { allowed }));
    let mut transport = setup_server(&negotiated, nt_status::SUCCESS, true);
    let mut registry = SessionRegistry::with_config(&config);
    let uid = registry.create_user(false).unwrap();

    assert_eq!(
        orchestrator.logon(&mut negotiated.client, &mut registry, uid, &alice(), &mut transport),
        Err(Error::LogonFailure),
    );
    let user = registry.user(uid).unwrap();
    assert!(!user.is_logged());
    assert!(user.session_key().is_empty());
    assert!(user.mac_session_key().is_empty());
    assert!(user.encryption_key().is_empty());
    assert!(user.decryption_key().is_empty());
    assert!(user.application_key().is_empty());
    assert!(!negotiated.client.use_signing());
}

#[test]
fn rejected_final_response_fails() {
    let config = SecurityConfig::default();
    let mut negotiated = negotiate_311(&config, SecurityMode::SIGNING_ENABLED);
    let allowed = Rc::new(Cell::new(CrypterSet::empty()));
    let mut orchestrator = LogonOrchestrator::with_spnego(config.clone(), Box::new(FakeSpnego { allowed }));
    let mut transport = setup_server(&negotiated, nt_status::LOGON_FAILURE, false);
    let mut registry = SessionRegistry::with_config(&config);
    let uid = registry.create_user(false).unwrap();

    assert_eq!(
        orchestrator.logon(&mut negotiated.client, &mut registry, uid, &alice(), &mut transport),
        Err(Error::LogonFailure),
    );
    assert!(registry.user(uid).unwrap().session_key().is_empty());
}

#[test]
fn mandatory_signing_restricts_crypters() {
    let config = SecurityConfig::signing_required();
    let mut negotiated = negotiate_311(&config, SecurityMode::SIGNING_REQUIRED);

    let allowed = Rc::new(Cell::new(CrypterSet::empty()));
    let mut orchestrator = LogonOrchestrator::with_spnego(
        config.clone(),
        Box::new(FakeSpnego { allowed: Rc::clone(&allowed) }),
    );
    let mut transport = setup_server(&negotiated, nt_status::SUCCESS, false);
    let mut registry = SessionRegistry::with_config(&config);
    let uid = registry.create_user(false).unwrap();

    orchestrator.logon(&mut negotiated.client, &mut registry, uid, &alice(), &mut transport).unwrap();
    assert_eq!(allowed.get(), CrypterSet::NTLM | CrypterSet::NTLM_V2);
    assert!(negotiated.client.use_signing());
}

#[test]
fn logoff_destroys_the_user() {
    let config = SecurityConfig::default();
    let mut negotiated = negotiate_311(&config, SecurityMode::SIGNING_ENABLED);
    let allowed = Rc::new(Cell::new(CrypterSet::empty()));
    let mut orchestrator = LogonOrchestrator::with_spnego(config.clone(), Box::new(FakeSpnego { allowed }));
    let mut transport = setup_server(&negotiated, nt_status::SUCCESS, false);
    let mut registry = SessionRegistry::with_config(&config);
    let uid = registry.create_user(false).unwrap();

    orchestrator.logon(&mut negotiated.client, &mut registry, uid, &alice(), &mut transport).unwrap();
    orchestrator.logoff(&mut registry, uid).unwrap();
    assert!(registry.user(uid).is_none());
    assert!(registry.find_by_session_id(SESSION_ID).is_none());
}
