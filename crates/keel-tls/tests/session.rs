//! End-to-end client/server sessions over in-memory transports.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use keel_tls::{
    build_client, build_server, CertFormat, ClientAuth, Credentials, ErrorKind, Role,
    SubjectAltName, SubjectAltNameType, TlsOptions, TlsSession,
};

struct TestPki {
    ca_pem: String,
    server_cert_pem: String,
    server_key_pem: String,
    client_cert_pem: String,
    client_key_pem: String,
}

fn test_pki() -> TestPki {
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "keel test ca");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = rcgen::KeyPair::generate().unwrap();
    let mut server_params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    server_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "keel test server");
    server_params
        .subject_alt_names
        .push(rcgen::SanType::IpAddress("127.0.0.1".parse().unwrap()));
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .unwrap();

    let client_key = rcgen::KeyPair::generate().unwrap();
    let mut client_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    client_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "keel test client");
    let client_cert = client_params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .unwrap();

    TestPki {
        ca_pem: ca_cert.pem(),
        server_cert_pem: server_cert.pem(),
        server_key_pem: server_key.serialize_pem(),
        client_cert_pem: client_cert.pem(),
        client_key_pem: client_key.serialize_pem(),
    }
}

fn server_creds(pki: &TestPki, client_auth: ClientAuth) -> Credentials {
    Credentials::builder()
        .add_trust(pki.ca_pem.as_bytes(), CertFormat::Pem)
        .unwrap()
        .key_and_cert(
            pki.server_cert_pem.as_bytes(),
            pki.server_key_pem.as_bytes(),
            CertFormat::Pem,
        )
        .unwrap()
        .client_auth(client_auth)
        .build()
}

fn client_creds(pki: &TestPki, with_identity: bool) -> Credentials {
    let builder = Credentials::builder()
        .add_trust(pki.ca_pem.as_bytes(), CertFormat::Pem)
        .unwrap();
    let builder = if with_identity {
        builder
            .key_and_cert(
                pki.client_cert_pem.as_bytes(),
                pki.client_key_pem.as_bytes(),
                CertFormat::Pem,
            )
            .unwrap()
    } else {
        builder
    };
    builder.build()
}

fn options(server_name: &str) -> TlsOptions {
    TlsOptions {
        server_name: server_name.to_string(),
        ..Default::default()
    }
}

async fn read_exactly(session: &TlsSession, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        let chunk = session.read().await.unwrap();
        assert!(!chunk.is_empty(), "stream ended after {} bytes", out.len());
        out.extend_from_slice(&chunk);
    }
    assert_eq!(out.len(), len);
    out
}

/// Counts TLS application-data records (content type 23) written through it.
struct RecordCounter<S> {
    inner: S,
    app_records: Arc<AtomicUsize>,
    body_remaining: usize,
    header: Vec<u8>,
}

impl<S> RecordCounter<S> {
    fn new(inner: S) -> (Self, Arc<AtomicUsize>) {
        let app_records = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                app_records: Arc::clone(&app_records),
                body_remaining: 0,
                header: Vec::new(),
            },
            app_records,
        )
    }

    fn scan(&mut self, mut buf: &[u8]) {
        while !buf.is_empty() {
            if self.body_remaining > 0 {
                let take = self.body_remaining.min(buf.len());
                self.body_remaining -= take;
                buf = &buf[take..];
                continue;
            }
            let want = 5 - self.header.len();
            let take = want.min(buf.len());
            self.header.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            if self.header.len() == 5 {
                if self.header[0] == 23 {
                    self.app_records.fetch_add(1, Ordering::SeqCst);
                }
                self.body_remaining =
                    u16::from_be_bytes([self.header[3], self.header[4]]) as usize;
                self.header.clear();
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RecordCounter<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RecordCounter<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = self.get_mut();
        match Pin::new(&mut me.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                me.scan(&buf[..n]);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn session_pair(
    pki: &TestPki,
    client_auth: ClientAuth,
    client_identity: bool,
    server_name: &str,
) -> (TlsSession, TlsSession) {
    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
    let client = build_client(
        client_creds(pki, client_identity),
        client_stream,
        options(server_name),
    )
    .unwrap();
    let server = build_server(server_creds(pki, client_auth), server_stream).unwrap();
    (client, server)
}

fn counted_session_pair(pki: &TestPki) -> (TlsSession, TlsSession, Arc<AtomicUsize>) {
    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
    let (counted, records) = RecordCounter::new(client_stream);
    let client = build_client(client_creds(pki, false), counted, options("localhost")).unwrap();
    let server = build_server(server_creds(pki, ClientAuth::None), server_stream).unwrap();
    (client, server, records)
}

#[tokio::test]
async fn test_plain_echo_and_graceful_close() {
    keel_tls::init();
    let pki = test_pki();
    let (client, server) = session_pair(&pki, ClientAuth::None, false, "localhost");

    let (client_hs, server_hs) = tokio::join!(client.handshake(), server.handshake());
    client_hs.unwrap();
    server_hs.unwrap();

    client.write(b"ping").await.unwrap();
    assert_eq!(read_exactly(&server, 4).await, b"ping");

    server.write(b"pong").await.unwrap();
    assert_eq!(read_exactly(&client, 4).await, b"pong");

    // client closes; the server's next read resolves with empty bytes
    client.close();
    let trailing = server.read().await.unwrap();
    assert!(trailing.is_empty());
    server.close();

    // reads after EOF stay empty
    assert!(server.read().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_chunked_write_coalesces_into_one_record() {
    keel_tls::init();
    let pki = test_pki();
    let (client, server, records) = counted_session_pair(&pki);

    let (client_hs, server_hs) = tokio::join!(client.handshake(), server.handshake());
    client_hs.unwrap();
    server_hs.unwrap();

    let after_handshake = records.load(Ordering::SeqCst);
    client
        .write_vectored(&[b"he".as_slice(), b"ll".as_slice(), b"o".as_slice()])
        .await
        .unwrap();
    assert_eq!(read_exactly(&server, 5).await, b"hello");
    assert_eq!(
        records.load(Ordering::SeqCst) - after_handshake,
        1,
        "scattered small write must become a single record"
    );
}

#[tokio::test]
async fn test_large_write_spans_records() {
    keel_tls::init();
    let pki = test_pki();
    let (client, server, records) = counted_session_pair(&pki);

    let (client_hs, server_hs) = tokio::join!(client.handshake(), server.handshake());
    client_hs.unwrap();
    server_hs.unwrap();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let after_handshake = records.load(Ordering::SeqCst);

    let writer = {
        let client = client.clone();
        let payload = payload.clone();
        tokio::spawn(async move { client.write(&payload).await })
    };
    let received = read_exactly(&server, payload.len()).await;
    writer.await.unwrap().unwrap();

    assert_eq!(received, payload);
    let emitted = records.load(Ordering::SeqCst) - after_handshake;
    assert!(emitted >= 7, "expected at least 7 records, saw {emitted}");
}

#[tokio::test]
async fn test_server_requires_client_cert_client_has_none() {
    keel_tls::init();
    let pki = test_pki();
    let (client, server) = session_pair(&pki, ClientAuth::Require, false, "localhost");

    let (client_hs, server_hs) = tokio::join!(client.handshake(), server.handshake());

    let server_err = server_hs.unwrap_err();
    assert_eq!(server_err.kind(), ErrorKind::Verify);
    assert!(
        server_err
            .to_string()
            .contains("no certificate presented by peer"),
        "got: {server_err}"
    );

    // The client finishes its flight before the server rejects it; the
    // failure surfaces as a protocol error on the next operation at the
    // latest.
    let client_result = match client_hs {
        Err(e) => Err(e),
        Ok(()) => client.read().await.map(|_| ()),
    };
    let client_err = client_result.unwrap_err();
    assert_eq!(client_err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn test_mutual_tls_with_dn_callback() {
    keel_tls::init();
    let pki = test_pki();
    let observed: Arc<Mutex<Vec<(Role, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);

    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
    let server_credentials = Credentials::builder()
        .add_trust(pki.ca_pem.as_bytes(), CertFormat::Pem)
        .unwrap()
        .key_and_cert(
            pki.server_cert_pem.as_bytes(),
            pki.server_key_pem.as_bytes(),
            CertFormat::Pem,
        )
        .unwrap()
        .client_auth(ClientAuth::Require)
        .dn_callback(Arc::new(move |role, subject, issuer| {
            if let Ok(mut seen) = sink.lock() {
                seen.push((role, subject.to_string(), issuer.to_string()));
            }
        }))
        .build();

    let client = build_client(
        client_creds(&pki, true),
        client_stream,
        options("localhost"),
    )
    .unwrap();
    let server = build_server(server_credentials, server_stream).unwrap();

    let (client_hs, server_hs) = tokio::join!(client.handshake(), server.handshake());
    client_hs.unwrap();
    server_hs.unwrap();

    client.write(b"authed").await.unwrap();
    assert_eq!(read_exactly(&server, 6).await, b"authed");

    let seen = observed.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, Role::Server);
    assert!(seen[0].1.contains("keel test client"), "got {}", seen[0].1);
    assert!(seen[0].2.contains("keel test ca"), "got {}", seen[0].2);

    let dn = server.distinguished_name().await.unwrap().unwrap();
    assert!(dn.subject.contains("keel test client"));
}

#[tokio::test]
async fn test_wrong_sni_completes_transport_and_fails_name_check() {
    keel_tls::init();
    let pki = test_pki();
    let (client, server) = session_pair(&pki, ClientAuth::None, false, "wrong.example");

    // The transport-level handshake completes: chain verification passes
    // and hostname policy is left to the application.
    let (client_hs, server_hs) = tokio::join!(client.handshake(), server.handshake());
    client_hs.unwrap();
    server_hs.unwrap();

    let dn = client.distinguished_name().await.unwrap().unwrap();
    assert!(dn.subject.contains("keel test server"));
    assert!(dn.issuer.contains("keel test ca"));

    let names = client
        .subject_alt_names(&[SubjectAltNameType::DnsName])
        .await
        .unwrap();
    assert!(names.contains(&SubjectAltName::DnsName("localhost".into())));
    assert!(
        !names.contains(&SubjectAltName::DnsName("wrong.example".into())),
        "application-level hostname check must reject"
    );

    let ips = client
        .subject_alt_names(&[SubjectAltNameType::IpAddress])
        .await
        .unwrap();
    assert_eq!(
        ips,
        vec![SubjectAltName::IpAddress("127.0.0.1".parse().unwrap())]
    );
}

#[tokio::test]
async fn test_untrusted_server_fails_verification() {
    keel_tls::init();
    let pki = test_pki();
    let other = test_pki();

    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
    // client trusts a different CA than the one that signed the server
    let client = build_client(
        client_creds(&other, false),
        client_stream,
        options("localhost"),
    )
    .unwrap();
    let server = build_server(server_creds(&pki, ClientAuth::None), server_stream).unwrap();

    let (client_hs, _server_hs) = tokio::join!(client.handshake(), server.handshake());
    let err = client_hs.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Verify);
    // DNs of the rejected certificate are part of the message
    assert!(err.to_string().contains("keel test server"), "got: {err}");

    // verification failures are sticky
    let again = client.read().await.unwrap_err();
    assert_eq!(again.kind(), ErrorKind::Verify);
}

#[tokio::test]
async fn test_peer_hangup_mid_read_delivers_then_eof() {
    keel_tls::init();
    let pki = test_pki();
    let (client, server) = session_pair(&pki, ClientAuth::None, false, "localhost");

    let (client_hs, server_hs) = tokio::join!(client.handshake(), server.handshake());
    client_hs.unwrap();
    server_hs.unwrap();

    client.write(b"last words").await.unwrap();
    // vanish without close_notify
    drop(client);

    // decrypted plaintext is delivered first, then reads return empty
    assert_eq!(read_exactly(&server, 10).await, b"last words");
    assert!(server.read().await.unwrap().is_empty());
    assert!(server.read().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_garbage_from_peer_is_sticky_protocol_error() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    keel_tls::init();
    let pki = test_pki();

    let (client_stream, mut peer) = tokio::io::duplex(64 * 1024);
    let client = build_client(client_creds(&pki, false), client_stream, options("localhost"))
        .unwrap();

    let driver = tokio::spawn(async move {
        // swallow the ClientHello, answer with junk
        let mut buf = [0u8; 4096];
        let _ = peer.read(&mut buf).await;
        let _ = peer.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        peer
    });

    let first = client.read().await.unwrap_err();
    assert_eq!(first.kind(), ErrorKind::Protocol);

    let second = client.read().await.unwrap_err();
    assert_eq!(second.kind(), first.kind());
    let on_write = client.write(b"x").await.unwrap_err();
    assert_eq!(on_write.kind(), first.kind());

    drop(driver);
}
