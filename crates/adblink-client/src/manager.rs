//! Connection manager -- holds at most one active connection.
//!
//! Connecting replaces (and closes) whatever connection was active before.
//! Keys come from a shared `KeyPairProvider` so a rotated key is picked up
//! by the next connection or pairing attempt.

use std::sync::Arc;
use tokio::sync::Mutex;

use adblink_crypto::KeyPairProvider;
use adblink_protocol::PeerInfo;

use crate::connection::{AdbConnection, ConnectionOptions};
use crate::error::AdbError;
use crate::pairing::PairingClient;
use crate::stream::AdbStream;
use crate::transport::{Channel, TcpChannel, UsbChannel};

pub struct ConnectionManager {
    keys: Arc<dyn KeyPairProvider>,
    options: ConnectionOptions,
    device_name: String,
    active: Mutex<Option<Arc<AdbConnection>>>,
}

impl ConnectionManager {
    pub fn new(keys: Arc<dyn KeyPairProvider>, options: ConnectionOptions, device_name: &str) -> Self {
        Self {
            keys,
            options,
            device_name: device_name.to_string(),
            active: Mutex::new(None),
        }
    }

    /// Connect over TCP, e.g. to a device in wireless debugging mode.
    pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<Arc<AdbConnection>, AdbError> {
        let channel = TcpChannel::connect(host, port).await?;
        self.connect_with(Box::new(channel)).await
    }

    /// Connect to the first USB device with an ADB interface, or the one
    /// with `serial`.
    pub async fn connect_usb(&self, serial: Option<&str>) -> Result<Arc<AdbConnection>, AdbError> {
        let channel = UsbChannel::open(serial)?;
        self.connect_with(Box::new(channel)).await
    }

    /// Run the handshake over `channel` and make it the active connection.
    pub async fn connect_with(&self, channel: Box<dyn Channel>) -> Result<Arc<AdbConnection>, AdbError> {
        self.disconnect().await;

        let keys = self.keys.current()?;
        let conn = Arc::new(AdbConnection::new(channel, keys, self.options.clone()));
        let abort = self.options.abort_on_unauthorised;
        match conn.connect(self.options.connect_timeout, abort).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(device = %conn.describe(), "handshake timed out");
                conn.close().await;
                return Err(AdbError::Timeout);
            }
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        }

        *self.active.lock().await = Some(conn.clone());
        Ok(conn)
    }

    /// The active connection, if it is still up.
    pub async fn current(&self) -> Option<Arc<AdbConnection>> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|c| c.is_established())
            .cloned()
    }

    /// Open a stream on the active connection.
    pub async fn open(&self, destination: &str) -> Result<AdbStream, AdbError> {
        let conn = self.current().await.ok_or(AdbError::NotConnected)?;
        conn.open(destination).await
    }

    /// Pair with a device's pairing port using the code it shows.
    pub async fn pair(&self, host: &str, port: u16, code: &str) -> Result<PeerInfo, AdbError> {
        let keys = self.keys.current()?;
        let mut client = PairingClient::new(host, port, code, keys, &self.device_name);
        Ok(client.pair().await?)
    }

    /// Close the active connection, if any.
    pub async fn disconnect(&self) {
        let previous = self.active.lock().await.take();
        if let Some(conn) = previous {
            tracing::debug!(device = %conn.describe(), "disconnecting");
            conn.close().await;
        }
    }
}
