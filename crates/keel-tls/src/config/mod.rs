//! Credential store shared across sessions.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use zeroize::Zeroize;

use keel_types::{codes, TlsError};

use crate::Role;

/// Wire format of certificate, key, and CRL material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertFormat {
    Pem,
    Der,
}

/// Server policy towards client certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// Never ask for a client certificate.
    None,
    /// Ask for a certificate but accept its absence.
    Request,
    /// Ask for a certificate and fail verification without one.
    Require,
}

/// Callback invoked after successful peer verification with the session role
/// and the peer's subject and issuer distinguished names.
pub type DnCallback = Arc<dyn Fn(Role, &str, &str) + Send + Sync>;

/// Serial number and expiry of one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Raw serial number bytes, truncated to 160 bytes.
    pub serial: Vec<u8>,
    /// Expiry as unix seconds, `-1` when the certificate carries none.
    pub expiry: i64,
}

pub(crate) struct Identity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub info: Option<CertInfo>,
}

pub(crate) struct CredentialsInner {
    roots: Mutex<RootCertStore>,
    trust_infos: Mutex<Vec<CertInfo>>,
    crls: Vec<CertificateRevocationListDer<'static>>,
    identity: Option<Identity>,
    client_auth: ClientAuth,
    priority: Option<String>,
    system_trust_pending: Mutex<bool>,
    dn_callback: Option<DnCallback>,
    last_peer: Mutex<Option<CertificateDer<'static>>>,
}

/// Parsed certificate, key, trust, and policy material, built once and shared
/// by reference across any number of sessions.
#[derive(Clone)]
pub struct Credentials {
    inner: Arc<CredentialsInner>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("has_identity", &self.inner.identity.is_some())
            .field("client_auth", &self.inner.client_auth)
            .field("priority", &self.inner.priority)
            .field(
                "dn_callback",
                &self.inner.dn_callback.as_ref().map(|_| "<callback>"),
            )
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Create a builder for credentials.
    pub fn builder() -> CredentialsBuilder {
        CredentialsBuilder::default()
    }

    /// Serial and expiry of the configured end-entity certificate, if any.
    pub fn certificate_info(&self) -> Vec<CertInfo> {
        self.inner
            .identity
            .as_ref()
            .and_then(|id| id.info.clone())
            .into_iter()
            .collect()
    }

    /// Serial and expiry of every configured trust anchor.
    pub fn trust_info(&self) -> Vec<CertInfo> {
        self.inner
            .trust_infos
            .lock()
            .map(|infos| infos.clone())
            .unwrap_or_default()
    }

    /// Reject role/credential combinations that can never handshake.
    pub(crate) fn validate_for(&self, role: Role) -> Result<(), TlsError> {
        if role == Role::Server && self.inner.identity.is_none() {
            return Err(TlsError::Credential {
                reason: "cannot start session without certificate/key pair for server".into(),
            });
        }
        if role == Role::Server
            && self.inner.client_auth != ClientAuth::None
            && self.root_snapshot().is_empty()
            && !self.system_trust_pending()
        {
            return Err(TlsError::Credential {
                reason: "client authentication requires trust anchors".into(),
            });
        }
        // Surfaces priority-string problems before any transport I/O.
        self.session_provider().map(|_| ())
    }

    /// Load the bundled trust anchors into the shared store if the flag is
    /// still pending. Runs at most once per credentials.
    pub(crate) fn resolve_system_trust(&self) {
        let pending = self
            .inner
            .system_trust_pending
            .lock()
            .map(|mut flag| std::mem::replace(&mut *flag, false))
            .unwrap_or(false);
        if !pending {
            return;
        }
        if let Ok(mut roots) = self.inner.roots.lock() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    fn system_trust_pending(&self) -> bool {
        self.inner
            .system_trust_pending
            .lock()
            .map(|flag| *flag)
            .unwrap_or(false)
    }

    pub(crate) fn root_snapshot(&self) -> RootCertStore {
        self.inner
            .roots
            .lock()
            .map(|roots| roots.clone())
            .unwrap_or_else(|_| RootCertStore::empty())
    }

    pub(crate) fn crls(&self) -> Vec<CertificateRevocationListDer<'static>> {
        self.inner.crls.clone()
    }

    pub(crate) fn identity(
        &self,
    ) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        self.inner
            .identity
            .as_ref()
            .map(|id| (id.chain.clone(), id.key.clone_key()))
    }

    pub(crate) fn client_auth(&self) -> ClientAuth {
        self.inner.client_auth
    }

    pub(crate) fn dn_callback(&self) -> Option<DnCallback> {
        self.inner.dn_callback.clone()
    }

    /// Provider restricted by the priority string, or the process default.
    pub(crate) fn session_provider(&self) -> Result<Arc<CryptoProvider>, TlsError> {
        filtered_provider(self.inner.priority.as_deref())
    }

    /// The most recently verified peer certificate across every session built
    /// from these credentials. Stale until a verification has run.
    pub(crate) fn cached_peer(&self) -> Option<CertificateDer<'static>> {
        self.inner
            .last_peer
            .lock()
            .ok()
            .and_then(|last| last.clone())
    }

    pub(crate) fn downgrade(&self) -> Weak<CredentialsInner> {
        Arc::downgrade(&self.inner)
    }
}

impl CredentialsInner {
    pub(crate) fn cache_peer(&self, cert: CertificateDer<'static>) {
        if let Ok(mut last) = self.last_peer.lock() {
            *last = Some(cert);
        }
    }
}

/// Builder for [`Credentials`].
pub struct CredentialsBuilder {
    roots: RootCertStore,
    trust_infos: Vec<CertInfo>,
    crls: Vec<CertificateRevocationListDer<'static>>,
    identity: Option<Identity>,
    client_auth: ClientAuth,
    priority: Option<String>,
    load_system_trust: bool,
    dn_callback: Option<DnCallback>,
}

impl Default for CredentialsBuilder {
    fn default() -> Self {
        Self {
            roots: RootCertStore::empty(),
            trust_infos: Vec::new(),
            crls: Vec::new(),
            identity: None,
            client_auth: ClientAuth::None,
            priority: None,
            load_system_trust: false,
            dn_callback: None,
        }
    }
}

impl fmt::Debug for CredentialsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsBuilder")
            .field("trust_anchors", &self.roots.len())
            .field("client_auth", &self.client_auth)
            .finish_non_exhaustive()
    }
}

impl CredentialsBuilder {
    /// Add one or more CA certificates to the trust store.
    pub fn add_trust(mut self, data: &[u8], format: CertFormat) -> Result<Self, TlsError> {
        for cert in parse_certs(data, format)? {
            if let Some(info) = cert_info(&cert) {
                self.trust_infos.push(info);
            }
            self.roots.add(cert).map_err(|e| TlsError::Credential {
                reason: format!("rejected trust certificate: {e}"),
            })?;
        }
        Ok(self)
    }

    /// Add one or more certificate revocation lists.
    pub fn add_crl(mut self, data: &[u8], format: CertFormat) -> Result<Self, TlsError> {
        match format {
            CertFormat::Pem => {
                let mut reader = std::io::Cursor::new(data);
                let mut found = false;
                for crl in rustls_pemfile::crls(&mut reader) {
                    let crl = crl.map_err(|e| TlsError::Credential {
                        reason: format!("failed to parse CRL: {e}"),
                    })?;
                    self.crls.push(crl);
                    found = true;
                }
                if !found {
                    return Err(TlsError::Credential {
                        reason: "no revocation list found in PEM input".into(),
                    });
                }
            }
            CertFormat::Der => {
                self.crls
                    .push(CertificateRevocationListDer::from(data.to_vec()));
            }
        }
        Ok(self)
    }

    /// Install the end-entity certificate chain and its private key.
    ///
    /// The key is checked against the leaf certificate; a mismatch fails the
    /// call rather than the first handshake.
    pub fn key_and_cert(
        mut self,
        cert: &[u8],
        key: &[u8],
        format: CertFormat,
    ) -> Result<Self, TlsError> {
        let chain = parse_certs(cert, format)?;
        let key = parse_key(key, format)?;
        validate_keys_match(&chain, &key)?;
        let info = cert_info(&chain[0]);
        self.identity = Some(Identity { chain, key, info });
        Ok(self)
    }

    /// Decompose a PKCS#12 blob into end-entity certificate, key, and chain.
    /// The chain certificates are added to the trust store.
    pub fn pkcs12(mut self, data: &[u8], password: &str) -> Result<Self, TlsError> {
        let pfx = p12::PFX::parse(data).map_err(|e| TlsError::Credential {
            reason: format!("failed to parse pkcs12 blob: {e:?}"),
        })?;
        if !pfx.verify_mac(password) {
            return Err(TlsError::Credential {
                reason: "pkcs12 MAC verification failed".into(),
            });
        }
        let mut keys = pfx.key_bags(password).map_err(|e| TlsError::Credential {
            reason: format!("failed to extract keys from pkcs12 blob: {e:?}"),
        })?;
        let certs = pfx.cert_bags(password).map_err(|e| TlsError::Credential {
            reason: format!("failed to extract certificates from pkcs12 blob: {e:?}"),
        })?;

        if keys.is_empty() {
            return Err(TlsError::Credential {
                reason: "pkcs12 blob contains no private key".into(),
            });
        }
        let mut key_der = keys.remove(0);
        for extra in &mut keys {
            extra.zeroize();
        }
        let key = parse_key(&key_der, CertFormat::Der);
        key_der.zeroize();
        let key = key?;

        let mut certs = certs.into_iter().map(CertificateDer::from);
        let leaf = certs.next().ok_or_else(|| TlsError::Credential {
            reason: "pkcs12 blob contains no certificate".into(),
        })?;
        let chain = vec![leaf];
        validate_keys_match(&chain, &key)?;
        let info = cert_info(&chain[0]);
        self.identity = Some(Identity { chain, key, info });

        for ca in certs {
            if let Some(info) = cert_info(&ca) {
                self.trust_infos.push(info);
            }
            self.roots.add(ca).map_err(|e| TlsError::Credential {
                reason: format!("rejected pkcs12 chain certificate: {e}"),
            })?;
        }
        Ok(self)
    }

    /// Set the server's policy towards client certificates.
    pub fn client_auth(mut self, mode: ClientAuth) -> Self {
        self.client_auth = mode;
        self
    }

    /// Restrict cipher suites to a `:`-separated list of suite names.
    /// Unknown names are rejected when the credentials are first used.
    pub fn priority_string(mut self, priority: &str) -> Self {
        self.priority = Some(priority.to_string());
        self
    }

    /// Load the bundled system trust anchors on first session use.
    pub fn system_trust(mut self) -> Self {
        self.load_system_trust = true;
        self
    }

    /// Register a callback observing the peer DN after each successful
    /// verification.
    pub fn dn_callback(mut self, cb: DnCallback) -> Self {
        self.dn_callback = Some(cb);
        self
    }

    /// Accept Diffie-Hellman parameters. The engine selects key-exchange
    /// groups itself, so the material is not applied; the slot exists for
    /// callers that configure it unconditionally.
    pub fn dh_params(self, _data: &[u8], _format: CertFormat) -> Self {
        self
    }

    pub fn build(self) -> Credentials {
        Credentials {
            inner: Arc::new(CredentialsInner {
                roots: Mutex::new(self.roots),
                trust_infos: Mutex::new(self.trust_infos),
                crls: self.crls,
                identity: self.identity,
                client_auth: self.client_auth,
                priority: self.priority,
                system_trust_pending: Mutex::new(self.load_system_trust),
                dn_callback: self.dn_callback,
                last_peer: Mutex::new(None),
            }),
        }
    }
}

fn parse_certs(data: &[u8], format: CertFormat) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    match format {
        CertFormat::Pem => {
            let mut reader = std::io::Cursor::new(data);
            let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
                .collect::<Result<_, _>>()
                .map_err(|e| TlsError::Credential {
                    reason: format!("failed to parse PEM certificate: {e}"),
                })?;
            if certs.is_empty() {
                return Err(TlsError::Credential {
                    reason: "no certificate found in PEM input".into(),
                });
            }
            Ok(certs)
        }
        CertFormat::Der => Ok(vec![CertificateDer::from(data.to_vec())]),
    }
}

fn parse_key(data: &[u8], format: CertFormat) -> Result<PrivateKeyDer<'static>, TlsError> {
    match format {
        CertFormat::Pem => {
            let mut reader = std::io::Cursor::new(data);
            rustls_pemfile::private_key(&mut reader)
                .map_err(|e| TlsError::Credential {
                    reason: format!("failed to parse private key: {e}"),
                })?
                .ok_or_else(|| TlsError::Credential {
                    reason: "no private key found in PEM input".into(),
                })
        }
        CertFormat::Der => PrivateKeyDer::try_from(data)
            .map(|key| key.clone_key())
            .map_err(|e| TlsError::Credential {
                reason: format!("failed to parse private key: {e}"),
            }),
    }
}

fn validate_keys_match(
    chain: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
) -> Result<(), TlsError> {
    let provider = crate::provider();
    let signing = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| TlsError::Credential {
            reason: format!("unusable private key: {e}"),
        })?;
    let certified = CertifiedKey::new(chain.to_vec(), signing);
    match certified.keys_match() {
        Ok(()) => Ok(()),
        // The provider cannot derive a public key for every algorithm; an
        // undecidable pairing is accepted, only a provable mismatch fails.
        Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => Ok(()),
        Err(e) => Err(TlsError::Credential {
            reason: format!("private key does not match certificate: {e}"),
        }),
    }
}

fn cert_info(cert: &CertificateDer<'_>) -> Option<CertInfo> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let mut serial = parsed.raw_serial().to_vec();
    serial.truncate(160);
    Some(CertInfo {
        serial,
        expiry: parsed.validity().not_after.timestamp(),
    })
}

fn filtered_provider(priority: Option<&str>) -> Result<Arc<CryptoProvider>, TlsError> {
    let base = crate::provider();
    let Some(priority) = priority else {
        return Ok(base);
    };

    let mut selected: Vec<rustls::SupportedCipherSuite> = Vec::new();
    for token in priority.split([':', ' ']).filter(|t| !t.is_empty()) {
        let wanted = normalize_suite_name(token);
        let mut matched = false;
        for suite in &base.cipher_suites {
            let name = normalize_suite_name(&format!("{:?}", suite.suite()));
            // TLS 1.3 suites carry a TLS13_ prefix here but a TLS_ prefix in
            // the registry; accept either spelling.
            if name == wanted || name.replacen("TLS13_", "TLS_", 1) == wanted {
                if !selected.iter().any(|s| s.suite() == suite.suite()) {
                    selected.push(*suite);
                }
                matched = true;
            }
        }
        if !matched {
            return Err(TlsError::Protocol {
                code: codes::ERROR_UNKNOWN_CIPHER_SUITE,
                reason: format!("unknown cipher suite in priority string: {token:?}"),
                details: Vec::new(),
            });
        }
    }
    if selected.is_empty() {
        return Err(TlsError::Protocol {
            code: codes::ERROR_NO_CIPHER_SUITES,
            reason: "priority string selects no cipher suites".into(),
            details: Vec::new(),
        });
    }

    let mut provider = (*base).clone();
    provider.cipher_suites = selected;
    Ok(Arc::new(provider))
}

fn normalize_suite_name(name: &str) -> String {
    name.trim().replace('-', "_").to_ascii_uppercase()
}
