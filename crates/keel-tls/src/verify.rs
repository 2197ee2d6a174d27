//! Certificate verification hooks.
//!
//! The engine verifies peer certificates during the handshake; these
//! wrappers record the outcome and the observed end-entity certificate so
//! the session can answer verification and DN queries afterwards. The
//! certificate cache lives on the credentials and is reached through a weak
//! back-reference, keeping ownership one-directional
//! (credentials → engine config → engine).

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};

use keel_types::TlsError;

use crate::config::CredentialsInner;

/// Per-session verification state shared between the engine's verifier and
/// the session driver.
pub(crate) struct VerifyCell {
    creds: Weak<CredentialsInner>,
    outcome: Mutex<Option<Result<(), String>>>,
}

impl VerifyCell {
    pub(crate) fn new(creds: Weak<CredentialsInner>) -> Self {
        Self {
            creds,
            outcome: Mutex::new(None),
        }
    }

    fn observe(&self, end_entity: &CertificateDer<'_>) {
        if let Some(creds) = self.creds.upgrade() {
            creds.cache_peer(end_entity.clone().into_owned());
        }
    }

    fn record(&self, result: Result<(), String>) {
        if let Ok(mut outcome) = self.outcome.lock() {
            *outcome = Some(result);
        }
    }

    /// `None` until a verification has run for this session.
    pub(crate) fn outcome(&self) -> Option<Result<(), String>> {
        self.outcome.lock().ok().and_then(|outcome| outcome.clone())
    }
}

impl fmt::Debug for VerifyCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyCell").finish_non_exhaustive()
    }
}

/// Client-side verifier for the server's certificate.
///
/// Chain verification follows the trust store; a hostname mismatch is
/// downgraded to success because hostname policy is applied by the
/// application against the DN/SAN queries, not by the transport. With an
/// empty trust store every certificate is rejected as unknown-issuer.
pub(crate) struct PeerCertRecorder {
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    cell: Arc<VerifyCell>,
}

impl fmt::Debug for PeerCertRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerCertRecorder").finish_non_exhaustive()
    }
}

pub(crate) fn server_cert_verifier(
    roots: RootCertStore,
    crls: Vec<CertificateRevocationListDer<'static>>,
    provider: Arc<CryptoProvider>,
    cell: Arc<VerifyCell>,
) -> Result<Arc<dyn ServerCertVerifier>, TlsError> {
    let inner = if roots.is_empty() {
        None
    } else {
        let mut builder =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone());
        if !crls.is_empty() {
            builder = builder.with_crls(crls);
        }
        Some(builder.build().map_err(|e| TlsError::Credential {
            reason: format!("cannot build peer verifier: {e}"),
        })?)
    };
    Ok(Arc::new(PeerCertRecorder {
        inner,
        provider,
        cell,
    }))
}

fn is_hostname_mismatch(err: &rustls::Error) -> bool {
    matches!(
        err,
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

impl ServerCertVerifier for PeerCertRecorder {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.cell.observe(end_entity);
        let Some(inner) = &self.inner else {
            self.cell.record(Err("no trust anchors configured".into()));
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer,
            ));
        };
        match inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
            Ok(verified) => {
                self.cell.record(Ok(()));
                Ok(verified)
            }
            Err(err) if is_hostname_mismatch(&err) => {
                self.cell.record(Ok(()));
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => {
                self.cell.record(Err(err.to_string()));
                Err(err)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Server-side verifier for client certificates, delegating chain checks to
/// the webpki verifier while recording outcome and peer certificate.
pub(crate) struct ClientCertRecorder {
    inner: Arc<dyn ClientCertVerifier>,
    cell: Arc<VerifyCell>,
}

impl fmt::Debug for ClientCertRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertRecorder").finish_non_exhaustive()
    }
}

pub(crate) fn client_cert_verifier(
    roots: RootCertStore,
    crls: Vec<CertificateRevocationListDer<'static>>,
    provider: Arc<CryptoProvider>,
    cell: Arc<VerifyCell>,
    mandatory: bool,
) -> Result<Arc<dyn ClientCertVerifier>, TlsError> {
    if roots.is_empty() {
        return Err(TlsError::Credential {
            reason: "client authentication requires trust anchors".into(),
        });
    }
    let mut builder = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
    if !mandatory {
        builder = builder.allow_unauthenticated();
    }
    if !crls.is_empty() {
        builder = builder.with_crls(crls);
    }
    let inner = builder.build().map_err(|e| TlsError::Credential {
        reason: format!("cannot build client-certificate verifier: {e}"),
    })?;
    Ok(Arc::new(ClientCertRecorder { inner, cell }))
}

impl ClientCertVerifier for ClientCertRecorder {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.cell.observe(end_entity);
        match self.inner.verify_client_cert(end_entity, intermediates, now) {
            Ok(verified) => {
                self.cell.record(Ok(()));
                Ok(verified)
            }
            Err(err) => {
                self.cell.record(Err(err.to_string()));
                Err(err)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_records_last_outcome() {
        let cell = VerifyCell::new(Weak::new());
        assert!(cell.outcome().is_none());
        cell.record(Err("unknown issuer".into()));
        assert_eq!(cell.outcome(), Some(Err("unknown issuer".into())));
        cell.record(Ok(()));
        assert_eq!(cell.outcome(), Some(Ok(())));
    }

    #[test]
    fn test_observe_with_dead_credentials_is_inert() {
        let cell = VerifyCell::new(Weak::new());
        let cert = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x00]);
        cell.observe(&cert);
        assert!(cell.outcome().is_none());
    }

    #[test]
    fn test_client_verifier_requires_anchors() {
        let cell = Arc::new(VerifyCell::new(Weak::new()));
        let err = client_cert_verifier(
            RootCertStore::empty(),
            Vec::new(),
            crate::provider(),
            cell,
            true,
        )
        .unwrap_err();
        assert_eq!(err.kind(), keel_types::ErrorKind::Credential);
    }
}
