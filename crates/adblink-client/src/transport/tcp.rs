//! TCP channel with in-place TLS upgrade.
//!
//! The socket is split into read and write halves, each behind its own lock
//! so the dispatch task can block in `read` while callers write. The upgrade
//! takes both locks, rejoins the halves, runs the handshake on the same
//! socket and installs the encrypted halves before releasing either lock.

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use adblink_crypto::{tls, AdbKeyPair};

use super::{BoxedIo, Channel};
use crate::error::TransportError;

pub struct TcpChannel {
    host: String,
    peer: String,
    reader: Mutex<Option<ReadHalf<BoxedIo>>>,
    writer: Mutex<Option<WriteHalf<BoxedIo>>>,
    connected: AtomicBool,
    tls: AtomicBool,
    shutdown: CancellationToken,
}

impl TcpChannel {
    /// Connect to `host:port` with Nagle disabled.
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("{host}:{port}"));
        tracing::debug!(%peer, "tcp channel connected");

        let mut channel = Self::from_io(host, Box::new(stream));
        channel.peer = peer;
        Ok(channel)
    }

    /// Wrap an already connected stream. `host` is the TLS server name.
    pub fn from_io(host: impl Into<String>, io: BoxedIo) -> Self {
        let host = host.into();
        let (reader, writer) = tokio::io::split(io);
        Self {
            peer: host.clone(),
            host,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            tls: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    fn fail<T>(&self, err: TransportError) -> Result<T, TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Err(err)
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn write(&self, packet: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let half = guard.as_mut().ok_or(TransportError::Closed)?;
        tokio::select! {
            _ = self.shutdown.cancelled() => self.fail(TransportError::Closed),
            result = half.write_all(packet) => match result {
                Ok(()) => Ok(()),
                Err(e) => self.fail(e.into()),
            },
        }
    }

    async fn flush(&self) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let half = guard.as_mut().ok_or(TransportError::Closed)?;
        tokio::select! {
            _ = self.shutdown.cancelled() => self.fail(TransportError::Closed),
            result = half.flush() => match result {
                Ok(()) => Ok(()),
                Err(e) => self.fail(e.into()),
            },
        }
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut guard = self.reader.lock().await;
        let half = guard.as_mut().ok_or(TransportError::Closed)?;
        tokio::select! {
            _ = self.shutdown.cancelled() => self.fail(TransportError::Closed),
            result = half.read(buf) => match result {
                Ok(0) => self.fail(TransportError::Closed),
                Ok(n) => Ok(n),
                Err(e) => self.fail(e.into()),
            },
        }
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        if let Some(mut half) = self.writer.lock().await.take() {
            let _ = half.shutdown().await;
        }
        self.reader.lock().await.take();
        tracing::debug!(peer = %self.peer, "tcp channel closed");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn upgrade_to_tls(&self, keys: &AdbKeyPair) -> Result<(), TransportError> {
        let config = tls::build_client_config(keys)?;
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|_| TransportError::InvalidServerName(self.host.clone()))?;

        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        let io = match (reader.take(), writer.take()) {
            (Some(r), Some(w)) => r.unsplit(w),
            _ => return self.fail(TransportError::Closed),
        };

        let connector = TlsConnector::from(config);
        let stream = tokio::select! {
            _ = self.shutdown.cancelled() => return self.fail(TransportError::Closed),
            result = connector.connect(server_name, io) => match result {
                Ok(stream) => stream,
                Err(e) => return self.fail(TransportError::Tls(e)),
            },
        };

        let (r, w) = tokio::io::split(Box::new(stream) as BoxedIo);
        *reader = Some(r);
        *writer = Some(w);
        self.tls.store(true, Ordering::SeqCst);
        tracing::info!(peer = %self.peer, "tls established");
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.peer)
    }
}
