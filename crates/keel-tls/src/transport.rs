//! Byte-stream halves under the session.
//!
//! The session enforces single-puller/single-pusher through its own locks;
//! these halves only move bytes.

use std::io::{self, IoSlice};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const PULL_CHUNK: usize = 16 * 1024;

pub(crate) struct Source {
    inner: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("inner", &self.inner.is_some())
            .finish()
    }
}

pub(crate) struct Sink {
    inner: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("inner", &self.inner.is_some())
            .finish()
    }
}

pub(crate) fn split<S>(stream: S) -> (Source, Sink)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (
        Source {
            inner: Some(Box::new(read)),
        },
        Sink {
            inner: Some(Box::new(write)),
        },
    )
}

impl Source {
    /// Next chunk from the peer; an empty buffer signals end of input.
    pub(crate) async fn pull(&mut self) -> io::Result<Vec<u8>> {
        let Some(read) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        let mut buf = vec![0u8; PULL_CHUNK];
        let n = read.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    pub(crate) fn close(&mut self) {
        self.inner = None;
    }
}

impl Sink {
    pub(crate) async fn push(&mut self, data: &[u8]) -> io::Result<()> {
        self.push_vectored(&[IoSlice::new(data)]).await
    }

    /// Write one scattered group of buffers to the peer, fully and in order.
    pub(crate) async fn push_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<()> {
        let mut remaining: Vec<&[u8]> = bufs
            .iter()
            .map(|b| &b[..])
            .filter(|b| !b.is_empty())
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }
        let Some(write) = self.inner.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport sink is closed",
            ));
        };
        while !remaining.is_empty() {
            let slices: Vec<IoSlice<'_>> = remaining.iter().map(|b| IoSlice::new(b)).collect();
            let mut n = write.write_vectored(&slices).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            while n > 0 {
                let first = remaining[0];
                if n >= first.len() {
                    n -= first.len();
                    remaining.remove(0);
                } else {
                    remaining[0] = &first[n..];
                    n = 0;
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(write) => write.flush().await,
            None => Ok(()),
        }
    }

    pub(crate) async fn close(&mut self) {
        if let Some(mut write) = self.inner.take() {
            let _ = write.shutdown().await;
        }
    }
}
