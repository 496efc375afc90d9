//! Connection engine -- handshake, authentication and stream dispatch for
//! one ADB connection.
//!
//! `connect()` sends CNXN and spawns the dispatch task, which owns all
//! inbound processing:
//!   1. Read bytes from the channel and decode packets with `AdbCodec`.
//!   2. CNXN records the negotiated version, payload limit and features.
//!   3. AUTH is answered with a signature, then with the public key.
//!   4. STLS is acknowledged and the channel is upgraded to TLS in place.
//!   5. OKAY/WRTE/CLSE are routed to the stream table by local id.
//!
//! Any decode error, transport failure or protocol violation ends the task.
//! Teardown always force-closes every stream and records why the connection
//! ended, so callers blocked in `connect`, `open`, `read` or `write` get a
//! definitive answer.

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;

use adblink_crypto::AdbKeyPair;
use adblink_protocol::{
    AdbCodec, AuthType, Command, ConnectBanner, Message, A_VERSION, A_VERSION_MIN,
    FEATURE_DELAYED_ACK, MAX_PAYLOAD,
};

use crate::error::{AdbError, TransportError};
use crate::stream::{AdbStream, FlowControl, StreamShared};
use crate::transport::Channel;

/// Bytes requested from the channel per read.
const READ_CHUNK: usize = 64 * 1024;

/// Connection behaviour chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Offer delayed-ack; it is used only when the daemon offers it too.
    pub enable_delayed_ack: bool,
    /// Fail with `AuthenticationFailed` on a second AUTH challenge instead
    /// of sending the public key.
    pub abort_on_unauthorised: bool,
    /// Bound on waiting for the handshake. `None` waits forever.
    pub connect_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            enable_delayed_ack: true,
            abort_on_unauthorised: false,
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Connecting,
    Established,
    Closing,
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Failure {
    Closed,
    AuthenticationRejected,
    PairingRequired,
    Broken(String),
}

impl Failure {
    fn to_error(&self) -> AdbError {
        match self {
            Failure::Closed => AdbError::ConnectionClosed,
            Failure::AuthenticationRejected => AdbError::AuthenticationFailed,
            Failure::PairingRequired => AdbError::PairingRequired,
            Failure::Broken(reason) => AdbError::ConnectionFailed(reason.clone()),
        }
    }
}

/// Negotiated parameters and handshake progress.
#[derive(Debug)]
struct Handshake {
    protocol_version: u32,
    max_data: u32,
    banner: Option<ConnectBanner>,
    delayed_ack: bool,
    sent_signature: bool,
    abort_on_unauthorised: bool,
    failure: Option<Failure>,
}

impl Handshake {
    fn new() -> Self {
        Self {
            protocol_version: A_VERSION_MIN,
            max_data: MAX_PAYLOAD,
            banner: None,
            delayed_ack: false,
            sent_signature: false,
            abort_on_unauthorised: false,
            failure: None,
        }
    }
}

/// State shared by the connection handle, its streams and the dispatch task.
pub(crate) struct ConnectionInner {
    channel: Box<dyn Channel>,
    keys: Arc<AdbKeyPair>,
    options: ConnectionOptions,
    write_lock: tokio::sync::Mutex<()>,
    handshake: Mutex<Handshake>,
    phase: watch::Sender<Phase>,
    streams: DashMap<u32, Arc<StreamShared>>,
    next_local_id: AtomicU32,
}

impl ConnectionInner {
    /// Encode and send one packet. Header and payload of concurrent senders
    /// never interleave.
    pub(crate) async fn send(&self, msg: &Message) -> Result<(), AdbError> {
        let packet = {
            let hs = self.handshake.lock();
            AdbCodec::with_limits(hs.protocol_version, hs.max_data).to_bytes(msg)?
        };
        let _guard = self.write_lock.lock().await;
        self.channel.write(&packet).await?;
        self.channel.flush().await?;
        tracing::trace!(%msg, "sent");
        Ok(())
    }

    pub(crate) fn max_data(&self) -> u32 {
        self.handshake.lock().max_data
    }

    fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn is_established(&self) -> bool {
        self.phase() == Phase::Established
    }

    /// Record why the connection ended. The first reason wins.
    fn set_failure(&self, failure: Failure) {
        let mut hs = self.handshake.lock();
        if hs.failure.is_none() {
            hs.failure = Some(failure);
        }
    }

    fn failure_error(&self) -> AdbError {
        self.handshake
            .lock()
            .failure
            .as_ref()
            .map(Failure::to_error)
            .unwrap_or(AdbError::ConnectionClosed)
    }

    fn stream(&self, local_id: u32) -> Option<Arc<StreamShared>> {
        self.streams.get(&local_id).map(|s| s.value().clone())
    }

    /// Wait until the handshake settles. `Ok(false)` on timeout.
    async fn wait_for_connection(&self, timeout: Option<Duration>) -> Result<bool, AdbError> {
        let mut rx = self.phase.subscribe();
        let settled = async {
            rx.wait_for(|p| *p != Phase::Connecting)
                .await
                .map(|p| *p)
        };
        let phase = match timeout {
            Some(limit) => match tokio::time::timeout(limit, settled).await {
                Ok(phase) => phase,
                Err(_) => return Ok(false),
            },
            None => settled.await,
        };
        match phase.map_err(|_| AdbError::ConnectionClosed)? {
            Phase::Established => Ok(true),
            Phase::Created => Err(AdbError::NotConnected),
            Phase::Connecting | Phase::Closing | Phase::Closed => Err(self.failure_error()),
        }
    }

    /// Wait for establishment within the configured connect timeout.
    async fn established(&self) -> Result<(), AdbError> {
        if self.wait_for_connection(self.options.connect_timeout).await? {
            Ok(())
        } else {
            Err(AdbError::Timeout)
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn dispatch(&self) -> Result<(), Failure> {
        // Until CNXN settles the version, decode at the one we announce:
        // a current daemon already omits checksums on its AUTH and CNXN.
        let mut codec = AdbCodec::with_limits(A_VERSION, MAX_PAYLOAD);
        let mut buffered = BytesMut::with_capacity(READ_CHUNK);
        let mut scratch = vec![0u8; READ_CHUNK];

        loop {
            let n = self
                .channel
                .read(&mut scratch)
                .await
                .map_err(|e| self.classify(e))?;
            buffered.extend_from_slice(&scratch[..n]);

            loop {
                let msg = match codec.decode(&mut buffered) {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(channel = %self.channel.describe(), "undecodable packet: {e}");
                        return Err(Failure::Broken(e.to_string()));
                    }
                };
                tracing::trace!(%msg, "recv");
                let trailing = !buffered.is_empty();
                if let Err(e) = self.handle(msg, &mut codec, trailing).await {
                    return Err(self.failure_from(e));
                }
            }
        }
    }

    async fn handle(&self, msg: Message, codec: &mut AdbCodec, trailing: bool) -> Result<(), AdbError> {
        match msg.command {
            Command::Cnxn => self.on_connect(&msg, codec),
            Command::Auth => self.on_auth(&msg).await,
            Command::Stls => {
                if trailing {
                    return Err(AdbError::ProtocolViolation(
                        "data received after STLS before the tls handshake".into(),
                    ));
                }
                self.send(&Message::stls()).await?;
                self.channel.upgrade_to_tls(&self.keys).await?;
                tracing::info!(channel = %self.channel.describe(), "connection upgraded to tls");
                Ok(())
            }
            Command::Okay | Command::Wrte | Command::Clse if !self.is_established() => {
                tracing::debug!(%msg, "stream packet before handshake, ignored");
                Ok(())
            }
            Command::Okay => {
                let Some(stream) = self.stream(msg.arg1) else {
                    tracing::debug!(%msg, "OKAY for unknown stream");
                    return Ok(());
                };
                let acked = msg.acked_bytes()?;
                stream.on_okay(msg.arg0, acked)
            }
            Command::Wrte => {
                match self.stream(msg.arg1) {
                    Some(stream) => stream.on_write(msg.payload),
                    None => tracing::debug!(%msg, "WRTE for unknown stream"),
                }
                Ok(())
            }
            Command::Clse => {
                match self.streams.remove(&msg.arg1) {
                    Some((_, stream)) => stream.on_peer_close(),
                    None => tracing::debug!(%msg, "CLSE for unknown stream"),
                }
                Ok(())
            }
            Command::Open | Command::Sync => {
                tracing::debug!(%msg, "inbound service request ignored");
                Ok(())
            }
        }
    }

    fn on_connect(&self, msg: &Message, codec: &mut AdbCodec) -> Result<(), AdbError> {
        if msg.arg1 == 0 {
            return Err(AdbError::ProtocolViolation("CNXN with zero max payload".into()));
        }
        let banner = ConnectBanner::parse(&msg.payload);
        let version = msg.arg0.min(A_VERSION);
        let max_data = msg.arg1.min(MAX_PAYLOAD);
        let delayed_ack = self.options.enable_delayed_ack && banner.has_feature(FEATURE_DELAYED_ACK);

        codec.set_protocol_version(version);
        codec.set_max_data(max_data);

        tracing::info!(
            channel = %self.channel.describe(),
            system_type = %banner.system_type,
            version = %format!("{version:#010x}"),
            max_data,
            delayed_ack,
            features = banner.features.len(),
            "connection established"
        );
        {
            let mut hs = self.handshake.lock();
            hs.protocol_version = version;
            hs.max_data = max_data;
            hs.delayed_ack = delayed_ack;
            hs.banner = Some(banner);
        }
        self.phase.send_replace(Phase::Established);
        Ok(())
    }

    async fn on_auth(&self, msg: &Message) -> Result<(), AdbError> {
        if self.channel.is_tls() {
            tracing::debug!("AUTH after tls upgrade, ignored");
            return Ok(());
        }
        if AuthType::from_u32(msg.arg0) != Some(AuthType::Token) {
            tracing::debug!(kind = msg.arg0, "non-token AUTH ignored");
            return Ok(());
        }

        let (first, abort) = {
            let mut hs = self.handshake.lock();
            let first = !hs.sent_signature;
            hs.sent_signature = true;
            (first, hs.abort_on_unauthorised)
        };

        if first {
            let signature = self.keys.sign_token(&msg.payload)?;
            tracing::debug!("answering auth token with signature");
            self.send(&Message::auth(AuthType::Signature, signature)).await
        } else if abort {
            tracing::warn!("signature rejected, aborting");
            Err(AdbError::AuthenticationFailed)
        } else {
            let public_key = self.keys.android_public_key()?;
            tracing::info!(key_name = self.keys.key_name(), "signature rejected, sending public key; confirm on the device");
            self.send(&Message::auth(AuthType::RsaPublicKey, public_key)).await
        }
    }

    fn classify(&self, err: TransportError) -> Failure {
        if self.phase() == Phase::Closing {
            return Failure::Closed;
        }
        let tls_failure = self.channel.is_tls() || matches!(err, TransportError::Tls(_));
        if tls_failure && err.indicates_pairing_required() {
            tracing::warn!(channel = %self.channel.describe(), "tls refused, device needs pairing: {err}");
            return Failure::PairingRequired;
        }
        if matches!(err, TransportError::Closed) {
            tracing::info!(channel = %self.channel.describe(), "channel closed by peer");
        } else {
            tracing::warn!(channel = %self.channel.describe(), "channel failed: {err}");
        }
        Failure::Broken(err.to_string())
    }

    fn failure_from(&self, err: AdbError) -> Failure {
        match err {
            AdbError::AuthenticationFailed => Failure::AuthenticationRejected,
            AdbError::Transport(e) => self.classify(e),
            other => {
                tracing::warn!(channel = %self.channel.describe(), "dispatch stopped: {other}");
                Failure::Broken(other.to_string())
            }
        }
    }

    /// Unified exit path: record the failure, fail handshake waiters and
    /// force-close every stream.
    fn teardown(&self, failure: Failure) {
        self.set_failure(failure);
        self.handshake.lock().sent_signature = false;
        self.phase.send_replace(Phase::Closed);

        let ids: Vec<u32> = self.streams.iter().map(|s| *s.key()).collect();
        let mut closed = 0usize;
        for id in ids {
            if let Some((_, stream)) = self.streams.remove(&id) {
                stream.force_close();
                closed += 1;
            }
        }
        tracing::debug!(channel = %self.channel.describe(), streams = closed, "connection torn down");
    }
}

async fn run_dispatch(inner: Arc<ConnectionInner>) {
    let failure = match inner.dispatch().await {
        Ok(()) => Failure::Closed,
        Err(failure) => failure,
    };
    inner.teardown(failure);
    inner.channel.close().await;
}

/// One ADB connection over a transport channel.
pub struct AdbConnection {
    inner: Arc<ConnectionInner>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl AdbConnection {
    pub fn new(channel: Box<dyn Channel>, keys: Arc<AdbKeyPair>, options: ConnectionOptions) -> Self {
        let (phase, _) = watch::channel(Phase::Created);
        Self {
            inner: Arc::new(ConnectionInner {
                channel,
                keys,
                options,
                write_lock: tokio::sync::Mutex::new(()),
                handshake: Mutex::new(Handshake::new()),
                phase,
                streams: DashMap::new(),
                next_local_id: AtomicU32::new(1),
            }),
            dispatch: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase()
    }

    pub fn is_established(&self) -> bool {
        self.inner.is_established()
    }

    pub fn describe(&self) -> String {
        self.inner.channel.describe()
    }

    /// Start the handshake and wait for it up to `timeout`.
    ///
    /// Returns `Ok(false)` on timeout; the handshake keeps running so a
    /// pending authorisation on the device can still complete, and
    /// `wait_for_connection` may be called again.
    pub async fn connect(&self, timeout: Option<Duration>, throw_on_unauthorised: bool) -> Result<bool, AdbError> {
        let mut prior = Phase::Created;
        let started = self.inner.phase.send_if_modified(|phase| {
            prior = *phase;
            if *phase == Phase::Created {
                *phase = Phase::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(match prior {
                Phase::Closing | Phase::Closed => AdbError::ConnectionClosed,
                _ => AdbError::AlreadyConnected,
            });
        }

        self.inner.handshake.lock().abort_on_unauthorised =
            throw_on_unauthorised || self.inner.options.abort_on_unauthorised;

        let banner = ConnectBanner::host(self.inner.options.enable_delayed_ack);
        tracing::debug!(channel = %self.describe(), %banner, "sending CNXN");
        if let Err(e) = self.inner.send(&Message::connect(&banner)).await {
            let failure = match e {
                AdbError::Transport(t) => self.inner.classify(t),
                other => Failure::Broken(other.to_string()),
            };
            self.inner.teardown(failure);
            self.inner.channel.close().await;
            return Err(self.inner.failure_error());
        }

        let handle = tokio::spawn(run_dispatch(self.inner.clone()));
        *self.dispatch.lock() = Some(handle);

        self.inner.wait_for_connection(timeout).await
    }

    /// Wait for a handshake started by `connect`. `Ok(false)` on timeout.
    pub async fn wait_for_connection(&self, timeout: Option<Duration>) -> Result<bool, AdbError> {
        self.inner.wait_for_connection(timeout).await
    }

    /// Open a stream to `destination`, e.g. `shell:` or `sync:`.
    pub async fn open(&self, destination: &str) -> Result<AdbStream, AdbError> {
        self.inner.established().await?;

        let flow = if self.inner.handshake.lock().delayed_ack {
            FlowControl::DelayedAck
        } else {
            FlowControl::Legacy
        };
        let local_id = self.inner.next_local_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(StreamShared::new(local_id, destination, flow));

        // Registered before OPEN goes out so an immediate OKAY finds it.
        self.inner.streams.insert(local_id, shared.clone());
        if !self.inner.is_established() {
            self.inner.streams.remove(&local_id);
            return Err(self.inner.failure_error());
        }

        let open = Message::open(local_id, destination, flow == FlowControl::DelayedAck);
        if let Err(e) = self.inner.send(&open).await {
            self.inner.streams.remove(&local_id);
            return Err(e);
        }

        if shared.wait_open().await {
            let stream = AdbStream::new(shared, self.inner.clone());
            tracing::info!(local_id, remote_id = stream.remote_id(), destination, ?flow, "stream opened");
            return Ok(stream);
        }

        self.inner.streams.remove(&local_id);
        if !self.inner.is_established() {
            return Err(self.inner.failure_error());
        }
        tracing::debug!(local_id = shared.local_id(), destination, "stream rejected");
        Err(AdbError::StreamRejected {
            destination: destination.to_string(),
        })
    }

    pub async fn protocol_version(&self) -> Result<u32, AdbError> {
        self.inner.established().await?;
        Ok(self.inner.handshake.lock().protocol_version)
    }

    pub async fn max_data(&self) -> Result<u32, AdbError> {
        self.inner.established().await?;
        Ok(self.inner.max_data())
    }

    pub async fn has_feature(&self, feature: &str) -> Result<bool, AdbError> {
        self.inner.established().await?;
        let hs = self.inner.handshake.lock();
        Ok(hs.banner.as_ref().is_some_and(|b| b.has_feature(feature)))
    }

    pub async fn features(&self) -> Result<Vec<String>, AdbError> {
        self.inner.established().await?;
        let hs = self.inner.handshake.lock();
        Ok(hs
            .banner
            .as_ref()
            .map(|b| b.features.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// The daemon's CNXN banner.
    pub async fn banner(&self) -> Result<ConnectBanner, AdbError> {
        self.inner.established().await?;
        let hs = self.inner.handshake.lock();
        hs.banner.clone().ok_or(AdbError::NotConnected)
    }

    pub async fn is_delayed_ack_enabled(&self) -> Result<bool, AdbError> {
        self.inner.established().await?;
        Ok(self.inner.handshake.lock().delayed_ack)
    }

    /// Close the channel and wait for the dispatch task to finish teardown.
    pub async fn close(&self) {
        self.inner.set_failure(Failure::Closed);
        self.inner.phase.send_if_modified(|phase| {
            if *phase == Phase::Closed {
                false
            } else {
                *phase = Phase::Closing;
                true
            }
        });
        self.inner.channel.close().await;

        let handle = self.dispatch.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::warn!("dispatch task ended abnormally: {e}");
                    self.inner.teardown(Failure::Closed);
                }
            }
            None => self.inner.teardown(Failure::Closed),
        }
        tracing::info!(channel = %self.describe(), "connection closed");
    }
}

impl Drop for AdbConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatch.get_mut().take() {
            handle.abort();
        }
        if self.inner.phase() != Phase::Closed {
            self.inner.teardown(Failure::Closed);
        }
    }
}
