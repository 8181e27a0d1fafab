//! Framed TCP/TLS client transport for the control channel.
//!
//! One logical frame per [`TranClient::read_all`] call. The receive loop is
//! the only reader; writes from other tasks are serialized by the write-half
//! lock. Closed-detection is idempotent: the `closed` flag is written once
//! true per connection generation and reset by `connect`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_rustls::TlsConnector;

use crate::protocol::{MAGIC, MAX_FRAME_SIZE, VERSION};
use crate::tls;

#[derive(Debug, Error)]
pub enum TranError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport is closed")]
    Closed,
    #[error("transport is unauthorized")]
    Unauthorized,
    #[error("bad frame: {0}")]
    BadFrame(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// True when the error means the connection is gone and a reconnect is the
/// only way forward.
pub fn is_closed_err(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TranError>(), Some(TranError::Closed))
}

/// True when the error means the peer rejected us for lack of auth; the
/// caller should re-login in place without tearing the connection down.
pub fn is_unauthenticated_err(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TranError>(), Some(TranError::Unauthorized))
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct TranClient {
    host: String,
    port: u16,
    enable_tls: bool,
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    closed: AtomicBool,
    // close() flips this so a blocked read_all can bail out
    close_tx: watch::Sender<bool>,
    conn_time: parking_lot::Mutex<Option<Instant>>,
}

impl TranClient {
    pub fn new(host: impl Into<String>, port: u16, enable_tls: bool) -> Arc<Self> {
        let (close_tx, _) = watch::channel(true);
        Arc::new(Self {
            host: host.into(),
            port,
            enable_tls,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closed: AtomicBool::new(true),
            close_tx,
            conn_time: parking_lot::Mutex::new(None),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn conn_time(&self) -> Option<Instant> {
        *self.conn_time.lock()
    }

    /// Establish (or re-establish) the connection. Resets the closed flag
    /// for the new generation.
    pub async fn connect(&self) -> Result<()> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        tcp.set_nodelay(true).ok();

        let (r, w): (Reader, Writer) = if self.enable_tls {
            let cfg = Arc::new(tls::client_config(&self.host, self.port));
            let connector = TlsConnector::from(cfg);
            let stream = connector
                .connect(tls::server_name(&self.host), tcp)
                .await?;
            let (r, w) = tokio::io::split(stream);
            (Box::new(r), Box::new(w))
        } else {
            let (r, w) = tcp.into_split();
            (Box::new(r), Box::new(w))
        };

        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(w);
        *self.conn_time.lock() = Some(Instant::now());
        self.closed.store(false, Ordering::SeqCst);
        let _ = self.close_tx.send(false);
        tracing::debug!(host = %self.host, port = self.port, tls = self.enable_tls, "transport connected");
        Ok(())
    }

    /// Write one frame. Serialized against concurrent writers by the
    /// write-half lock.
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(TranError::Closed.into());
        }
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().ok_or(TranError::NotConnected)?;
        let res = async {
            w.write_all(&frame_header(payload.len())).await?;
            w.write_all(payload).await?;
            w.flush().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = res {
            self.mark_closed();
            return Err(TranError::Io(e).into());
        }
        Ok(())
    }

    /// Read exactly one logical frame, or fail. A failure marks the
    /// transport closed; callers distinguish "we closed it" from "peer
    /// closed it" via their own shutdown intent, not the transport flag.
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let mut close_rx = self.close_tx.subscribe();
        let mut guard = self.reader.lock().await;
        let r = guard.as_mut().ok_or(TranError::NotConnected)?;
        tokio::select! {
            _ = close_rx.wait_for(|closed| *closed) => Err(TranError::Closed.into()),
            res = read_frame(r) => match res {
                Ok(data) => Ok(data),
                Err(e) => {
                    self.mark_closed();
                    Err(e.into())
                }
            }
        }
    }

    /// Idempotent close. Shuts the write half down and releases it; the
    /// read half is released by the (sole) reader once it observes the
    /// close signal.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.close_tx.send(true);
        let mut guard = self.writer.lock().await;
        if let Some(w) = guard.as_mut() {
            let _ = w.shutdown().await;
        }
        *guard = None;
        tracing::debug!(host = %self.host, port = self.port, "transport closed");
        Ok(())
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.close_tx.send(true);
        }
    }
}

fn frame_header(payload_len: usize) -> [u8; 10] {
    let mut hdr = [0u8; 10];
    hdr[0..4].copy_from_slice(MAGIC);
    hdr[4..6].copy_from_slice(&VERSION.to_le_bytes());
    hdr[6..10].copy_from_slice(&(payload_len as u32).to_le_bytes());
    hdr
}

/// Encode a full frame. Exposed so fake servers in tests can speak the
/// protocol.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + payload.len());
    buf.extend_from_slice(&frame_header(payload.len()));
    buf.extend_from_slice(payload);
    buf
}

/// Read one frame from any async reader. Exposed for fake servers.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, TranError> {
    let mut hdr = [0u8; 10];
    r.read_exact(&mut hdr).await?;
    if &hdr[0..4] != MAGIC {
        return Err(TranError::BadFrame("bad magic".to_string()));
    }
    let _ver = u16::from_le_bytes([hdr[4], hdr[5]]);
    let len = u32::from_le_bytes([hdr[6], hdr[7], hdr[8], hdr[9]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TranError::BadFrame(format!("frame of {} bytes exceeds cap", len)));
    }
    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload).await?;
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listen() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn frame_roundtrip_over_tcp() {
        let (listener, port) = listen().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let got = read_frame(&mut sock).await.unwrap();
            assert_eq!(got, b"ping");
            sock.write_all(&encode_frame(b"pong")).await.unwrap();
        });

        let client = TranClient::new("127.0.0.1", port, false);
        client.connect().await.unwrap();
        assert!(!client.is_closed());
        client.write(b"ping").await.unwrap();
        let reply = client.read_all().await.unwrap();
        assert_eq!(reply, b"pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn peer_drop_marks_closed() {
        let (listener, port) = listen().await;
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });

        let client = TranClient::new("127.0.0.1", port, false);
        client.connect().await.unwrap();
        server.await.unwrap();
        let _err = client.read_all().await.unwrap_err();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let (listener, port) = listen().await;
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            // hold the socket open without sending anything
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let client = TranClient::new("127.0.0.1", port, false);
        client.connect().await.unwrap();
        let c2 = client.clone();
        let reader = tokio::spawn(async move { c2.read_all().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.close().await.unwrap();
        let err = reader.await.unwrap().unwrap_err();
        assert!(is_closed_err(&err));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let (listener, port) = listen().await;
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let client = TranClient::new("127.0.0.1", port, false);
        client.connect().await.unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap(); // idempotent
        let err = client.write(b"x").await.unwrap_err();
        assert!(is_closed_err(&err));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (listener, port) = listen().await;
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut hdr = [0u8; 10];
            hdr[0..4].copy_from_slice(MAGIC);
            hdr[4..6].copy_from_slice(&VERSION.to_le_bytes());
            hdr[6..10].copy_from_slice(&(u32::MAX).to_le_bytes());
            sock.write_all(&hdr).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });
        let client = TranClient::new("127.0.0.1", port, false);
        client.connect().await.unwrap();
        assert!(client.read_all().await.is_err());
        assert!(client.is_closed());
    }
}
