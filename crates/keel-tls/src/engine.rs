//! Narrow binding over the memory-based TLS engine.
//!
//! The engine operates purely on in-memory byte queues: ciphertext from the
//! peer is fed in, ciphertext for the peer is drained out, and plaintext
//! moves through `read_plaintext` / `write_plaintext`. All calls are
//! non-blocking; transient statuses tell the driver which direction of
//! transport I/O would unblock the engine.

use std::io::{Read, Write};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use keel_types::TlsError;

use crate::config::{ClientAuth, Credentials};
use crate::error::{feed_rejected, map_engine_error, premature_termination};
use crate::verify::{self, VerifyCell};
use crate::x509;
use crate::{Role, TlsOptions};

/// Outcome of a plaintext-side engine call.
#[derive(Debug)]
pub(crate) enum EngineIo<T> {
    Ready(T),
    NeedsRead,
    NeedsWrite,
    CleanEof,
    Fatal(TlsError),
}

/// Outcome of a shutdown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownStatus {
    /// Both directions are closed.
    Done,
    /// Our close_notify is flushed; the peer's has not arrived yet.
    Partial,
    /// Ciphertext is queued and must be pushed before progress.
    NeedsWrite,
}

#[derive(Debug)]
pub(crate) struct Engine {
    conn: Connection,
    cell: Arc<VerifyCell>,
    creds: Credentials,
    transport_eof: bool,
    peer_closed: bool,
    sent_close_notify: bool,
    plaintext_in: usize,
    failed: Option<TlsError>,
}

impl Engine {
    pub(crate) fn new(
        role: Role,
        creds: &Credentials,
        options: &TlsOptions,
    ) -> Result<Self, TlsError> {
        creds.resolve_system_trust();
        let provider = creds.session_provider()?;
        let cell = Arc::new(VerifyCell::new(creds.downgrade()));

        let conn = match role {
            Role::Client => {
                let config = client_config(creds, provider, Arc::clone(&cell))?;
                let name = validate_server_name(&options.server_name)?;
                Connection::Client(
                    ClientConnection::new(Arc::new(config), name)
                        .map_err(|e| map_engine_error(&e))?,
                )
            }
            Role::Server => {
                let config = server_config(creds, provider, Arc::clone(&cell))?;
                Connection::Server(
                    ServerConnection::new(Arc::new(config)).map_err(|e| map_engine_error(&e))?,
                )
            }
        };

        Ok(Self {
            conn,
            cell,
            creds: creds.clone(),
            transport_eof: false,
            peer_closed: false,
            sent_close_notify: false,
            plaintext_in: 0,
            failed: None,
        })
    }

    /// Append ciphertext from the transport to the engine's inbound queue,
    /// draining the consumed prefix from `buf`. Bytes the engine does not
    /// accept stay in `buf` for a later call.
    pub(crate) fn feed_ciphertext(&mut self, buf: &mut Vec<u8>) -> Result<(), TlsError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        while !buf.is_empty() {
            let mut input = &buf[..];
            let n = self.conn.read_tls(&mut input).map_err(|e| {
                let err = feed_rejected(&e);
                self.failed = Some(err.clone());
                err
            })?;
            if n == 0 {
                break;
            }
            buf.drain(..n);
            self.process()?;
        }
        Ok(())
    }

    /// Signal transport end-of-input to the engine.
    pub(crate) fn feed_eof(&mut self) {
        self.transport_eof = true;
        let _ = self.conn.read_tls(&mut std::io::empty());
        let _ = self.process();
    }

    fn process(&mut self) -> Result<(), TlsError> {
        match self.conn.process_new_packets() {
            Ok(state) => {
                self.plaintext_in = state.plaintext_bytes_to_read();
                if state.peer_has_closed() {
                    self.peer_closed = true;
                }
                Ok(())
            }
            Err(e) => {
                let err = self.enrich(map_engine_error(&e));
                self.failed = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Attach the peer's distinguished names to verification failures. The
    /// certificate was cached by the verifier before it rejected the chain.
    fn enrich(&self, err: TlsError) -> TlsError {
        let TlsError::Verify {
            reason,
            subject: None,
            issuer: None,
        } = &err
        else {
            return err;
        };
        let Some(der) = self.creds.cached_peer() else {
            return err;
        };
        match x509::extract_dn(der.as_ref()) {
            Ok(dn) => TlsError::Verify {
                reason: format!(
                    "{} (Issuer=[\"{}\"], Subject=[\"{}\"])",
                    reason, dn.issuer, dn.subject
                ),
                subject: Some(dn.subject),
                issuer: Some(dn.issuer),
            },
            Err(_) => err,
        }
    }

    /// Remove whatever ciphertext the engine has queued for the peer, as a
    /// list of chunks in emission order. The caller hands the whole group to
    /// the transport as one scattered push.
    pub(crate) fn drain_ciphertext(&mut self) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while self.conn.wants_write() {
            let mut chunk = Vec::new();
            // Writing into a Vec cannot fail.
            if self.conn.write_tls(&mut chunk).is_err() || chunk.is_empty() {
                break;
            }
            chunks.push(chunk);
        }
        chunks
    }

    pub(crate) fn write_plaintext(&mut self, data: &[u8]) -> EngineIo<usize> {
        if let Some(err) = &self.failed {
            return EngineIo::Fatal(err.clone());
        }
        if self.sent_close_notify {
            return EngineIo::CleanEof;
        }
        if self.conn.is_handshaking() {
            return if self.conn.wants_write() {
                EngineIo::NeedsWrite
            } else {
                EngineIo::NeedsRead
            };
        }
        match self.conn.writer().write(data) {
            Ok(n) => EngineIo::Ready(n),
            Err(e) => EngineIo::Fatal(TlsError::from(e)),
        }
    }

    pub(crate) fn read_plaintext(&mut self, max: usize) -> EngineIo<Vec<u8>> {
        if let Some(err) = &self.failed {
            return EngineIo::Fatal(err.clone());
        }
        if self.conn.is_handshaking() {
            if self.transport_eof {
                return EngineIo::CleanEof;
            }
            return if self.conn.wants_write() {
                EngineIo::NeedsWrite
            } else {
                EngineIo::NeedsRead
            };
        }
        let want = self.plaintext_in.clamp(1, max.max(1));
        let mut buf = vec![0u8; want];
        match self.conn.reader().read(&mut buf) {
            Ok(0) => {
                self.peer_closed = true;
                EngineIo::CleanEof
            }
            Ok(n) => {
                buf.truncate(n);
                self.plaintext_in = self.plaintext_in.saturating_sub(n);
                EngineIo::Ready(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => EngineIo::NeedsRead,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                EngineIo::Fatal(premature_termination())
            }
            Err(e) => EngineIo::Fatal(TlsError::from(e)),
        }
    }

    pub(crate) fn progress_handshake(&mut self) -> EngineIo<()> {
        if let Some(err) = &self.failed {
            return EngineIo::Fatal(err.clone());
        }
        if !self.conn.is_handshaking() {
            return EngineIo::Ready(());
        }
        if self.conn.wants_write() {
            return EngineIo::NeedsWrite;
        }
        if self.transport_eof {
            return EngineIo::CleanEof;
        }
        EngineIo::NeedsRead
    }

    pub(crate) fn initiate_shutdown(&mut self) -> ShutdownStatus {
        if !self.sent_close_notify {
            self.conn.send_close_notify();
            self.sent_close_notify = true;
        }
        if self.conn.wants_write() {
            ShutdownStatus::NeedsWrite
        } else if self.peer_closed || self.transport_eof {
            ShutdownStatus::Done
        } else {
            ShutdownStatus::Partial
        }
    }

    pub(crate) fn handshake_done(&self) -> bool {
        self.failed.is_none() && !self.conn.is_handshaking()
    }

    pub(crate) fn pending_plaintext(&self) -> bool {
        self.plaintext_in > 0
    }

    pub(crate) fn pending_ciphertext(&self) -> bool {
        self.conn.wants_write()
    }

    pub(crate) fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first().cloned())
    }

    pub(crate) fn verify_outcome(&self) -> Option<Result<(), String>> {
        self.cell.outcome()
    }
}

fn client_config(
    creds: &Credentials,
    provider: Arc<rustls::crypto::CryptoProvider>,
    cell: Arc<VerifyCell>,
) -> Result<ClientConfig, TlsError> {
    let verifier = verify::server_cert_verifier(
        creds.root_snapshot(),
        creds.crls(),
        provider.clone(),
        cell,
    )?;
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| map_engine_error(&e))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);
    match creds.identity() {
        Some((chain, key)) => {
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| TlsError::Credential {
                    reason: format!("failed to install client credentials: {e}"),
                })
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

fn server_config(
    creds: &Credentials,
    provider: Arc<rustls::crypto::CryptoProvider>,
    cell: Arc<VerifyCell>,
) -> Result<ServerConfig, TlsError> {
    let (chain, key) = creds.identity().ok_or_else(|| TlsError::Credential {
        reason: "cannot start session without certificate/key pair for server".into(),
    })?;
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| map_engine_error(&e))?;
    let builder = match creds.client_auth() {
        ClientAuth::None => builder.with_no_client_auth(),
        ClientAuth::Request => builder.with_client_cert_verifier(verify::client_cert_verifier(
            creds.root_snapshot(),
            creds.crls(),
            provider,
            cell,
            false,
        )?),
        ClientAuth::Require => builder.with_client_cert_verifier(verify::client_cert_verifier(
            creds.root_snapshot(),
            creds.crls(),
            provider,
            cell,
            true,
        )?),
    };
    builder
        .with_single_cert(chain, key)
        .map_err(|e| TlsError::Credential {
            reason: format!("failed to install server credentials: {e}"),
        })
}

/// Parse the SNI option into an engine server name. An empty option falls
/// back to a placeholder, matching sessions that offer no name and apply no
/// hostname policy.
pub(crate) fn validate_server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    let candidate = if name.is_empty() {
        "unaddressed.invalid"
    } else {
        name
    };
    ServerName::try_from(candidate.to_string()).map_err(|e| TlsError::Credential {
        reason: format!("invalid server name {candidate:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertFormat;

    fn identity_pem() -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["engine.test".to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "engine test");
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    fn client_creds() -> Credentials {
        Credentials::builder().build()
    }

    fn server_creds() -> Credentials {
        let (cert, key) = identity_pem();
        Credentials::builder()
            .key_and_cert(cert.as_bytes(), key.as_bytes(), CertFormat::Pem)
            .unwrap()
            .build()
    }

    #[test]
    fn test_client_engine_starts_wanting_write() {
        let options = TlsOptions {
            server_name: "engine.test".into(),
            ..Default::default()
        };
        let mut engine = Engine::new(Role::Client, &client_creds(), &options).unwrap();
        assert!(!engine.handshake_done());
        assert!(matches!(engine.progress_handshake(), EngineIo::NeedsWrite));
        let hello = engine.drain_ciphertext();
        assert!(!hello.is_empty());
        assert!(matches!(engine.progress_handshake(), EngineIo::NeedsRead));
    }

    #[test]
    fn test_server_engine_starts_wanting_read() {
        let mut engine =
            Engine::new(Role::Server, &server_creds(), &TlsOptions::default()).unwrap();
        assert!(!engine.handshake_done());
        assert!(matches!(engine.progress_handshake(), EngineIo::NeedsRead));
        assert!(!engine.pending_ciphertext());
    }

    #[test]
    fn test_server_engine_requires_identity() {
        let err = Engine::new(Role::Server, &client_creds(), &TlsOptions::default()).unwrap_err();
        assert_eq!(err.kind(), keel_types::ErrorKind::Credential);
    }

    #[test]
    fn test_garbage_ciphertext_is_fatal_and_sticky() {
        let mut engine =
            Engine::new(Role::Server, &server_creds(), &TlsOptions::default()).unwrap();
        let mut junk = b"this is definitely not a TLS record".to_vec();
        let err = engine.feed_ciphertext(&mut junk).unwrap_err();
        assert_eq!(err.kind(), keel_types::ErrorKind::Protocol);
        // later calls fail with the same error
        let again = match engine.read_plaintext(16) {
            EngineIo::Fatal(e) => e,
            other => panic!("expected fatal, got {other:?}"),
        };
        assert_eq!(again.kind(), err.kind());
    }

    #[test]
    fn test_eof_during_handshake_reports_clean_eof() {
        let mut engine =
            Engine::new(Role::Server, &server_creds(), &TlsOptions::default()).unwrap();
        engine.feed_eof();
        assert!(matches!(engine.progress_handshake(), EngineIo::CleanEof));
    }

    #[test]
    fn test_shutdown_before_peer_close_is_partial() {
        let options = TlsOptions {
            server_name: "engine.test".into(),
            ..Default::default()
        };
        let mut engine = Engine::new(Role::Client, &client_creds(), &options).unwrap();
        assert_eq!(engine.initiate_shutdown(), ShutdownStatus::NeedsWrite);
        let alert = engine.drain_ciphertext();
        assert!(!alert.is_empty());
        assert_eq!(engine.initiate_shutdown(), ShutdownStatus::Partial);
    }

    #[test]
    fn test_empty_server_name_uses_placeholder() {
        assert!(validate_server_name("").is_ok());
        assert!(validate_server_name("example.com").is_ok());
    }
}
