//! The session I/O driver.
//!
//! A session interleaves three control flows — application writes,
//! application reads, and engine-driven transport I/O — over a non-blocking
//! engine that talks through two in-memory ciphertext queues. Two one-permit
//! locks serialize the plaintext paths; the handshake is a barrier holding
//! both (read acquired before write, always). Engine calls never happen
//! across an await point, so a cancelled caller cannot leave the engine
//! mid-record.

use std::io::IoSlice;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time;

use keel_types::{codes, TlsError};

use crate::config::{ClientAuth, Credentials};
use crate::engine::{Engine, EngineIo, ShutdownStatus};
use crate::transport::{self, Sink, Source};
use crate::x509::{self, SessionDn, SubjectAltName, SubjectAltNameType};
use crate::{Role, TlsOptions};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// One TLS record of plaintext. Scattered writes up to this size collapse
/// into a single record.
const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;
const READ_CHUNK: usize = 64 * 1024;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fresh,
    Handshaking,
    Established,
    ShuttingDown,
    Closed,
    Errored,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    eof_seen: bool,
    shutdown_requested: bool,
    last_error: Option<TlsError>,
}

#[derive(Debug)]
struct ReadState {
    source: Source,
    /// Ciphertext pulled from the transport but not yet accepted by the
    /// engine's inbound queue.
    inbound: Vec<u8>,
}

#[derive(Debug)]
struct WriteState {
    sink: Sink,
}

/// An established or establishing TLS session over a byte-stream transport.
///
/// The handle is cheap to clone; all clones drive the same session.
#[derive(Clone, Debug)]
pub struct TlsSession {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    role: Role,
    creds: Credentials,
    options: TlsOptions,
    state: StdMutex<State>,
    engine: StdMutex<Option<Engine>>,
    read_half: AsyncMutex<ReadState>,
    write_half: AsyncMutex<WriteState>,
}

impl TlsSession {
    pub(crate) fn new<S>(role: Role, creds: Credentials, stream: S, options: TlsOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (source, sink) = transport::split(stream);
        TlsSession {
            shared: Arc::new(Shared {
                role,
                creds,
                options,
                state: StdMutex::new(State {
                    phase: Phase::Fresh,
                    eof_seen: false,
                    shutdown_requested: false,
                    last_error: None,
                }),
                engine: StdMutex::new(None),
                read_half: AsyncMutex::new(ReadState {
                    source,
                    inbound: Vec::new(),
                }),
                write_half: AsyncMutex::new(WriteState { sink }),
            }),
        }
    }

    /// Drive the handshake to completion. Called implicitly by the first
    /// read or write; explicit calls are useful to surface handshake errors
    /// early or to serve renegotiation.
    pub async fn handshake(&self) -> Result<(), TlsError> {
        self.shared.handshake().await
    }

    /// Next chunk of decrypted plaintext, in peer-send order. An empty
    /// buffer signals end of stream.
    pub async fn read(&self) -> Result<Vec<u8>, TlsError> {
        self.shared.read().await
    }

    /// Encrypt and send `data`. Resolves when every byte has been handed to
    /// the transport; writes on one session complete in submission order.
    pub async fn write(&self, data: &[u8]) -> Result<(), TlsError> {
        self.shared.write(data).await
    }

    /// Write scattered fragments. Fragments totalling at most one record are
    /// coalesced so the wire carries a single record instead of one per
    /// fragment.
    pub async fn write_vectored(&self, bufs: &[&[u8]]) -> Result<(), TlsError> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if bufs.len() > 1 && total <= MAX_RECORD_PLAINTEXT {
            let mut joined = Vec::with_capacity(total);
            for buf in bufs {
                joined.extend_from_slice(buf);
            }
            return self.shared.write(&joined).await;
        }
        for buf in bufs {
            self.shared.write(buf).await?;
        }
        Ok(())
    }

    /// Flush buffered ciphertext down the transport.
    pub async fn flush(&self) -> Result<(), TlsError> {
        self.shared.flush().await
    }

    /// Begin orderly shutdown. Idempotent and fire-and-forget: the
    /// close-notify exchange runs in the background under a 10 second
    /// deadline, then the transport is closed, input before output. The
    /// session keeps itself alive for that tail even if every handle is
    /// dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn close(&self) {
        self.shared.close(Arc::clone(&self.shared));
    }

    /// Subject and issuer DN of the peer certificate, running the handshake
    /// first if needed.
    ///
    /// The certificate is read from a cache on the shared [`Credentials`]
    /// holding the most recently verified peer across all sessions built
    /// from them. Callers running many sessions per credentials should
    /// capture DNs per session via the DN callback instead.
    pub async fn distinguished_name(&self) -> Result<Option<SessionDn>, TlsError> {
        self.shared.ensure_usable().await?;
        match self.shared.creds.cached_peer() {
            Some(der) => x509::extract_dn(der.as_ref()).map(Some),
            None => Ok(None),
        }
    }

    /// Typed subject-alternative-name entries of the peer certificate,
    /// restricted to `filter` when non-empty. Same cache semantics as
    /// [`Self::distinguished_name`].
    pub async fn subject_alt_names(
        &self,
        filter: &[SubjectAltNameType],
    ) -> Result<Vec<SubjectAltName>, TlsError> {
        self.shared.ensure_usable().await?;
        match self.shared.creds.cached_peer() {
            Some(der) => x509::extract_alt_names(der.as_ref(), filter),
            None => Ok(Vec::new()),
        }
    }
}

impl Shared {
    fn state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }

    fn sticky(&self) -> Option<TlsError> {
        self.state(|s| s.last_error.clone())
    }

    /// Record the first non-transient failure; later calls keep the
    /// original. Returns the error that is now stored.
    fn fail(&self, err: TlsError) -> TlsError {
        self.state(|s| {
            if let Some(existing) = &s.last_error {
                existing.clone()
            } else {
                log::debug!("tls session failed: {err}");
                s.last_error = Some(err.clone());
                s.phase = Phase::Errored;
                err
            }
        })
    }

    fn mark_eof(&self) {
        self.state(|s| s.eof_seen = true);
    }

    fn eof_seen(&self) -> bool {
        self.state(|s| s.eof_seen)
    }

    fn shutdown_requested(&self) -> bool {
        self.state(|s| s.shutdown_requested)
    }

    fn set_phase(&self, phase: Phase) {
        self.state(|s| {
            if s.phase != Phase::Errored {
                s.phase = phase;
            }
        });
    }

    fn with_engine<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> Result<R, TlsError> {
        let mut slot = self.engine.lock().unwrap_or_else(|p| p.into_inner());
        match slot.as_mut() {
            Some(engine) => Ok(f(engine)),
            None => Err(TlsError::NotConnected),
        }
    }

    fn connected(&self) -> bool {
        let slot = self.engine.lock().unwrap_or_else(|p| p.into_inner());
        slot.as_ref().map(Engine::handshake_done).unwrap_or(false)
    }

    fn ensure_engine(&self) -> Result<(), TlsError> {
        let mut slot = self.engine.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(Engine::new(self.role, &self.creds, &self.options)?);
        }
        Ok(())
    }

    /// Drain whatever ciphertext the engine holds, tolerating a session
    /// whose engine was never built.
    fn drain_engine(&self) -> Vec<Vec<u8>> {
        let mut slot = self.engine.lock().unwrap_or_else(|p| p.into_inner());
        match slot.as_mut() {
            Some(engine) if engine.pending_ciphertext() => engine.drain_ciphertext(),
            _ => Vec::new(),
        }
    }

    /// Hand the engine's outbound ciphertext to the transport as one
    /// scattered push, awaiting it so the sink observes records in emission
    /// order. Returns whether anything was sent.
    async fn flush_outbound(&self, write: &mut WriteState) -> Result<bool, TlsError> {
        let chunks = self.drain_engine();
        if chunks.is_empty() {
            return Ok(false);
        }
        let slices: Vec<IoSlice<'_>> = chunks.iter().map(|c| IoSlice::new(c)).collect();
        write
            .sink
            .push_vectored(&slices)
            .await
            .map_err(|e| self.fail(TlsError::from(e)))?;
        Ok(true)
    }

    async fn flush_best_effort(&self, write: &mut WriteState) {
        let chunks = self.drain_engine();
        if !chunks.is_empty() {
            let slices: Vec<IoSlice<'_>> = chunks.iter().map(|c| IoSlice::new(c)).collect();
            let _ = write.sink.push_vectored(&slices).await;
        }
    }

    /// Pull from the transport when the inbound buffer is empty, then feed
    /// the engine. An empty pull marks end of input on both the session and
    /// the engine.
    async fn pull_and_feed(&self, read: &mut ReadState) -> Result<(), TlsError> {
        if read.inbound.is_empty() {
            let chunk = read
                .source
                .pull()
                .await
                .map_err(|e| self.fail(TlsError::from(e)))?;
            if chunk.is_empty() {
                self.mark_eof();
                let _ = self.with_engine(Engine::feed_eof);
                return Ok(());
            }
            read.inbound = chunk;
        }
        match self.with_engine(|e| e.feed_ciphertext(&mut read.inbound))? {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn handshake(&self) -> Result<(), TlsError> {
        if let Some(err) = self.sticky() {
            return Err(err);
        }
        if self.connected() {
            return Ok(());
        }
        let mut read = self.read_half.lock().await;
        let mut write = self.write_half.lock().await;
        self.do_handshake(&mut read, &mut write).await
    }

    /// Runs under both locks. Pump order is always write first, then read,
    /// which breaks the deadlock where both sides wait for the other's
    /// flight.
    async fn do_handshake(
        &self,
        read: &mut ReadState,
        write: &mut WriteState,
    ) -> Result<(), TlsError> {
        if let Some(err) = self.sticky() {
            return Err(err);
        }
        if self.connected() {
            return Ok(());
        }
        if self.eof_seen() {
            return Err(self.fail(TlsError::NotConnected));
        }
        self.ensure_engine().map_err(|e| self.fail(e))?;
        self.set_phase(Phase::Handshaking);
        log::trace!("{:?}: handshake", self.role);

        loop {
            match self.with_engine(Engine::progress_handshake)? {
                EngineIo::Ready(()) => {
                    self.verify()?;
                    self.set_phase(Phase::Established);
                    self.flush_outbound(write).await?;
                    log::trace!("{:?}: handshake complete", self.role);
                    return Ok(());
                }
                EngineIo::NeedsWrite => {
                    self.flush_outbound(write).await?;
                }
                EngineIo::NeedsRead => {
                    self.flush_outbound(write).await?;
                    match self.pull_and_feed(read).await {
                        Ok(()) => {
                            if self.eof_seen() {
                                log::trace!("{:?}: eof during handshake", self.role);
                                return Ok(());
                            }
                        }
                        Err(err) => {
                            self.flush_best_effort(write).await;
                            return Err(err);
                        }
                    }
                }
                EngineIo::CleanEof => {
                    self.mark_eof();
                    return Ok(());
                }
                EngineIo::Fatal(err) => {
                    // The engine queues a fatal alert; get it onto the wire
                    // before surfacing the failure.
                    self.flush_best_effort(write).await;
                    return Err(self.fail(err));
                }
            }
        }
    }

    /// Post-handshake verification per credential policy, plus the DN
    /// observation callback.
    fn verify(&self) -> Result<(), TlsError> {
        if let Some(Err(reason)) = self.with_engine(|e| e.verify_outcome())? {
            return Err(self.fail(self.verify_error(reason)));
        }
        let peer = self.with_engine(|e| e.peer_certificate())?;
        if peer.is_none() {
            if self.role == Role::Server && self.creds.client_auth() == ClientAuth::Require {
                return Err(self.fail(TlsError::Verify {
                    reason: "no certificate presented by peer".into(),
                    subject: None,
                    issuer: None,
                }));
            }
            return Ok(());
        }
        if let Some(callback) = self.creds.dn_callback() {
            if let Some(dn) = self
                .creds
                .cached_peer()
                .and_then(|der| x509::extract_dn(der.as_ref()).ok())
            {
                callback(self.role, &dn.subject, &dn.issuer);
            }
        }
        Ok(())
    }

    fn verify_error(&self, reason: String) -> TlsError {
        let dn = self
            .creds
            .cached_peer()
            .and_then(|der| x509::extract_dn(der.as_ref()).ok());
        match dn {
            Some(dn) => TlsError::Verify {
                reason: format!(
                    "{} (Issuer=[\"{}\"], Subject=[\"{}\"])",
                    reason, dn.issuer, dn.subject
                ),
                subject: Some(dn.subject),
                issuer: Some(dn.issuer),
            },
            None => TlsError::Verify {
                reason,
                subject: None,
                issuer: None,
            },
        }
    }

    async fn read(&self) -> Result<Vec<u8>, TlsError> {
        loop {
            if let Some(err) = self.sticky() {
                return Err(err);
            }
            if self.shutdown_requested() || self.eof_seen() {
                return Ok(Vec::new());
            }
            if !self.connected() {
                self.handshake().await?;
                continue;
            }

            let mut read = self.read_half.lock().await;
            if let Some(err) = self.sticky() {
                return Err(err);
            }
            if self.shutdown_requested() || self.eof_seen() {
                return Ok(Vec::new());
            }

            if !self.with_engine(|e| e.pending_plaintext())? {
                self.pull_and_feed(&mut read).await?;
            }
            match self.with_engine(|e| e.read_plaintext(READ_CHUNK))? {
                EngineIo::Ready(buf) => return Ok(buf),
                EngineIo::NeedsRead | EngineIo::NeedsWrite => {
                    // Renegotiation or incomplete record: release the read
                    // lock, run the handshake under both, retry.
                    drop(read);
                    self.handshake().await?;
                }
                EngineIo::CleanEof => {
                    self.mark_eof();
                    return Ok(Vec::new());
                }
                EngineIo::Fatal(err) => {
                    if err.code() == Some(codes::ERROR_PREMATURE_TERMINATION) {
                        // Peers that drop the link without close_notify are
                        // routine; treat as end of stream.
                        self.mark_eof();
                        return Ok(Vec::new());
                    }
                    return Err(self.fail(err));
                }
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TlsError> {
        let mut offset = 0;
        loop {
            if let Some(err) = self.sticky() {
                return Err(err);
            }
            if self.shutdown_requested() {
                return Err(TlsError::PipeClosed);
            }
            if !self.connected() {
                self.handshake().await?;
                continue;
            }

            let mut write = self.write_half.lock().await;
            if let Some(err) = self.sticky() {
                return Err(err);
            }
            if self.shutdown_requested() {
                return Err(TlsError::PipeClosed);
            }

            let mut renegotiate = false;
            while offset < data.len() {
                match self.with_engine(|e| e.write_plaintext(&data[offset..]))? {
                    EngineIo::Ready(n) => {
                        offset += n;
                        self.flush_outbound(&mut write).await?;
                    }
                    EngineIo::NeedsRead | EngineIo::NeedsWrite => {
                        renegotiate = true;
                        break;
                    }
                    EngineIo::CleanEof => {
                        self.mark_eof();
                        return Err(TlsError::PipeClosed);
                    }
                    EngineIo::Fatal(err) => {
                        self.flush_best_effort(&mut write).await;
                        return Err(self.fail(err));
                    }
                }
            }
            if !renegotiate {
                return Ok(());
            }
            // Release our lock, run the handshake under both, then retry
            // the remaining plaintext.
            drop(write);
            self.handshake().await?;
        }
    }

    async fn flush(&self) -> Result<(), TlsError> {
        if let Some(err) = self.sticky() {
            return Err(err);
        }
        let mut write = self.write_half.lock().await;
        self.flush_outbound(&mut write).await?;
        write
            .sink
            .flush()
            .await
            .map_err(|e| self.fail(TlsError::from(e)))
    }

    /// Handshake-if-needed guard shared by the DN/SAN queries.
    async fn ensure_usable(&self) -> Result<(), TlsError> {
        loop {
            if let Some(err) = self.sticky() {
                return Err(err);
            }
            if self.shutdown_requested() {
                return Err(TlsError::NotConnected);
            }
            if self.connected() {
                return Ok(());
            }
            self.handshake().await?;
            if self.eof_seen() && !self.connected() {
                return Err(TlsError::NotConnected);
            }
        }
    }

    fn close(&self, strong: Arc<Shared>) {
        let already = self.state(|s| std::mem::replace(&mut s.shutdown_requested, true));
        if already {
            return;
        }
        self.set_phase(Phase::ShuttingDown);
        log::trace!("{:?}: close", self.role);
        // The spawned tail owns a strong reference so shutdown survives the
        // caller dropping its handle.
        tokio::spawn(async move {
            if time::timeout(SHUTDOWN_TIMEOUT, strong.shutdown())
                .await
                .is_err()
            {
                log::debug!("{:?}: shutdown deadline hit, forcing close", strong.role);
            }
            strong.mark_eof();
            {
                let mut read = strong.read_half.lock().await;
                read.source.close();
            }
            {
                let mut write = strong.write_half.lock().await;
                write.sink.close().await;
            }
            strong.set_phase(Phase::Closed);
            log::trace!("{:?}: close complete", strong.role);
        });
    }

    /// Send close_notify and, when configured, drain the peer until EOF.
    /// Best-effort throughout: close never surfaces errors.
    async fn shutdown(&self) {
        {
            let mut write = self.write_half.lock().await;
            if self.sticky().is_none() && self.connected() {
                loop {
                    let status = match self.with_engine(Engine::initiate_shutdown) {
                        Ok(status) => status,
                        Err(_) => break,
                    };
                    match status {
                        ShutdownStatus::Done => break,
                        ShutdownStatus::NeedsWrite | ShutdownStatus::Partial => {
                            // No ciphertext produced means the peer already
                            // went away; stop instead of spinning.
                            match self.flush_outbound(&mut write).await {
                                Ok(true) => {}
                                Ok(false) | Err(_) => break,
                            }
                        }
                    }
                }
                let _ = write.sink.flush().await;
            }
        }
        self.wait_for_eof().await;
    }

    async fn wait_for_eof(&self) {
        if !self.options.wait_for_eof_on_shutdown {
            return;
        }
        let mut read = self.read_half.lock().await;
        if self.sticky().is_some() || !self.connected() {
            return;
        }
        while !self.eof_seen() {
            if self.drain_step(&mut read).await.is_err() {
                break;
            }
        }
    }

    /// One read-and-discard step of the EOF drain.
    async fn drain_step(&self, read: &mut ReadState) -> Result<(), TlsError> {
        if !self.with_engine(|e| e.pending_plaintext())? {
            self.pull_and_feed(read).await?;
        }
        match self.with_engine(|e| e.read_plaintext(READ_CHUNK))? {
            EngineIo::Ready(_) | EngineIo::NeedsRead | EngineIo::NeedsWrite => Ok(()),
            EngineIo::CleanEof => {
                self.mark_eof();
                Ok(())
            }
            EngineIo::Fatal(err) => {
                if err.code() == Some(codes::ERROR_PREMATURE_TERMINATION) {
                    self.mark_eof();
                    Ok(())
                } else {
                    Err(self.fail(err))
                }
            }
        }
    }
}
