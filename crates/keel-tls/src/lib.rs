#![forbid(unsafe_code)]
#![doc = "Asynchronous TLS sessions over byte-stream transports."]

pub mod config;
mod engine;
mod error;
pub mod session;
mod transport;
mod verify;
pub mod x509;

use std::sync::{Arc, Once};

use tokio::io::{AsyncRead, AsyncWrite};

pub use config::{CertFormat, CertInfo, ClientAuth, Credentials, CredentialsBuilder, DnCallback};
pub use keel_types::{codes, ErrorKind, TlsError};
pub use session::TlsSession;
pub use x509::{SessionDn, SubjectAltName, SubjectAltNameType};

/// The role of a TLS endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Per-session options.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Server name sent in SNI (clients). Empty means no name is offered and
    /// no hostname policy can be applied by the application.
    pub server_name: String,
    /// Whether `close()` waits for the peer's end-of-stream after sending
    /// close_notify. Disable to make shutdown fire-and-forget on the read
    /// side as well.
    pub wait_for_eof_on_shutdown: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            wait_for_eof_on_shutdown: true,
        }
    }
}

/// Install the process-wide cryptographic provider.
///
/// Idempotent; call once at process start. Sessions work without it (each
/// engine falls back to a fresh provider), but installing the default avoids
/// clashing with other rustls users in the same process.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

pub(crate) fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Wrap `stream` in a client TLS session using the shared `creds`.
///
/// Configuration problems (an unusable priority string, a malformed server
/// name) surface here; the handshake itself runs on first use or via
/// [`TlsSession::handshake`].
pub fn build_client<S>(
    creds: Credentials,
    stream: S,
    options: TlsOptions,
) -> Result<TlsSession, TlsError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    creds.validate_for(Role::Client)?;
    engine::validate_server_name(&options.server_name)?;
    Ok(TlsSession::new(Role::Client, creds, stream, options))
}

/// Wrap `stream` in a server TLS session using the shared `creds`.
///
/// Servers must carry a certificate/key pair; that is checked here rather
/// than at first handshake.
pub fn build_server<S>(creds: Credentials, stream: S) -> Result<TlsSession, TlsError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    creds.validate_for(Role::Server)?;
    Ok(TlsSession::new(
        Role::Server,
        creds,
        stream,
        TlsOptions::default(),
    ))
}
