//! Streams -- one multiplexed channel over an ADB connection.
//!
//! The dispatch task owns the inbound side: it assigns the remote id,
//! applies acknowledgements to the write credit, queues WRTE payloads and
//! marks peer closes. Callers own the outbound side through `AdbStream`.
//!
//! Credit comes in two flavours, fixed when the stream is opened:
//!   - Legacy: one boolean. Each OKAY sets it, each WRTE consumes it, so at
//!     most one WRTE is ever in flight.
//!   - Delayed-ack: a byte count. Each OKAY adds its 4-byte payload, each
//!     WRTE subtracts what it carried.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

use adblink_protocol::Message;

use crate::connection::ConnectionInner;
use crate::error::AdbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    Legacy,
    DelayedAck,
}

/// Write credit a stream currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCredit {
    /// Legacy discipline: whether one WRTE may be sent.
    Ready(bool),
    /// Delayed-ack discipline: bytes the peer is ready to receive.
    Bytes(u64),
}

impl WriteCredit {
    fn initial(flow: FlowControl) -> Self {
        match flow {
            FlowControl::Legacy => WriteCredit::Ready(false),
            FlowControl::DelayedAck => WriteCredit::Bytes(0),
        }
    }
}

#[derive(Debug)]
struct StreamState {
    /// Zero until the first OKAY.
    remote_id: u32,
    /// Terminal. Set by a drained peer close or connection teardown.
    closed: bool,
    /// Peer sent CLSE while data was still queued.
    pending_close: bool,
    /// We sent CLSE.
    local_closed: bool,
    credit: WriteCredit,
    read_queue: VecDeque<Bytes>,
    read_buffer: Bytes,
}

/// Stream state shared between the dispatch task and the caller's handle.
pub(crate) struct StreamShared {
    local_id: u32,
    destination: String,
    flow: FlowControl,
    state: Mutex<StreamState>,
    opened: Notify,
    readable: Notify,
    writable: Notify,
    write_serial: tokio::sync::Mutex<()>,
}

impl StreamShared {
    pub(crate) fn new(local_id: u32, destination: &str, flow: FlowControl) -> Self {
        Self {
            local_id,
            destination: destination.to_string(),
            flow,
            state: Mutex::new(StreamState {
                remote_id: 0,
                closed: false,
                pending_close: false,
                local_closed: false,
                credit: WriteCredit::initial(flow),
                read_queue: VecDeque::new(),
                read_buffer: Bytes::new(),
            }),
            opened: Notify::new(),
            readable: Notify::new(),
            writable: Notify::new(),
            write_serial: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn local_id(&self) -> u32 {
        self.local_id
    }

    fn wake_all(&self) {
        self.opened.notify_waiters();
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    // ========================================================================
    // Inbound, driven by the dispatch task
    // ========================================================================

    /// OKAY addressed to this stream. The first one assigns the remote id.
    pub(crate) fn on_okay(&self, remote_id: u32, acked: Option<u32>) -> Result<(), AdbError> {
        let mut st = self.state.lock();
        if st.remote_id == 0 {
            if remote_id == 0 {
                return Err(AdbError::ProtocolViolation(format!(
                    "OKAY for stream {} carries remote id 0",
                    self.local_id
                )));
            }
            st.remote_id = remote_id;
            self.apply_ack(&mut st, acked)?;
            drop(st);
            tracing::debug!(local_id = self.local_id, remote_id, "stream remote id assigned");
            self.opened.notify_waiters();
            self.writable.notify_waiters();
            return Ok(());
        }

        if st.remote_id != remote_id {
            return Err(AdbError::ProtocolViolation(format!(
                "OKAY for stream {} from remote id {}, expected {}",
                self.local_id, remote_id, st.remote_id
            )));
        }
        self.apply_ack(&mut st, acked)?;
        drop(st);
        self.writable.notify_waiters();
        Ok(())
    }

    fn apply_ack(&self, st: &mut StreamState, acked: Option<u32>) -> Result<(), AdbError> {
        if st.closed || st.pending_close {
            return Ok(());
        }
        match (&mut st.credit, acked) {
            (WriteCredit::Ready(ready), None) => *ready = true,
            (WriteCredit::Bytes(avail), acked) => {
                let n = acked.unwrap_or(0);
                *avail += u64::from(n);
                tracing::trace!(local_id = self.local_id, acked = n, credit = *avail, "credit replenished");
            }
            (WriteCredit::Ready(_), Some(n)) => {
                return Err(AdbError::ProtocolViolation(format!(
                    "OKAY with {n} acked bytes on legacy stream {}",
                    self.local_id
                )));
            }
        }
        Ok(())
    }

    /// WRTE payload addressed to this stream.
    pub(crate) fn on_write(&self, payload: Bytes) {
        let mut st = self.state.lock();
        if st.closed || st.pending_close {
            tracing::debug!(local_id = self.local_id, len = payload.len(), "dropping data for closed stream");
            return;
        }
        st.read_queue.push_back(payload);
        drop(st);
        self.readable.notify_waiters();
    }

    /// CLSE from the peer. Queued data stays readable.
    pub(crate) fn on_peer_close(&self) {
        let mut st = self.state.lock();
        if st.read_queue.is_empty() {
            st.closed = true;
        } else {
            st.pending_close = true;
        }
        tracing::debug!(
            local_id = self.local_id,
            queued = st.read_queue.len(),
            "stream closed by peer"
        );
        drop(st);
        self.wake_all();
    }

    /// Connection teardown.
    pub(crate) fn force_close(&self) {
        self.state.lock().closed = true;
        self.wake_all();
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Wait until the peer accepts (true) or refuses (false) the OPEN.
    pub(crate) async fn wait_open(&self) -> bool {
        loop {
            let notified = self.opened.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.state.lock();
                if st.remote_id != 0 {
                    return true;
                }
                if st.closed || st.pending_close {
                    return false;
                }
            }
            notified.await;
        }
    }

    /// Wait for credit and take enough of it for the next WRTE.
    async fn acquire_credit(&self, remaining: usize, max_data: usize) -> Result<(u32, usize), AdbError> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                if st.closed || st.pending_close || st.local_closed {
                    return Err(AdbError::StreamClosed);
                }
                let remote_id = st.remote_id;
                match &mut st.credit {
                    WriteCredit::Ready(ready) if *ready => {
                        *ready = false;
                        return Ok((remote_id, remaining.min(max_data)));
                    }
                    WriteCredit::Bytes(avail) if *avail > 0 => {
                        let n = (remaining.min(max_data) as u64).min(*avail);
                        *avail -= n;
                        return Ok((remote_id, n as usize));
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }
}

/// Caller's handle to an open stream.
///
/// Reads and writes take `&self`; writes from concurrent tasks are
/// serialised so their chunks never interleave.
pub struct AdbStream {
    shared: Arc<StreamShared>,
    conn: Arc<ConnectionInner>,
}

impl AdbStream {
    pub(crate) fn new(shared: Arc<StreamShared>, conn: Arc<ConnectionInner>) -> Self {
        Self { shared, conn }
    }

    pub fn local_id(&self) -> u32 {
        self.shared.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.shared.state.lock().remote_id
    }

    pub fn destination(&self) -> &str {
        &self.shared.destination
    }

    pub fn flow_control(&self) -> FlowControl {
        self.shared.flow
    }

    pub fn write_credit(&self) -> WriteCredit {
        self.shared.state.lock().credit
    }

    /// True once the stream can deliver nothing more than what is buffered.
    pub fn is_closed(&self) -> bool {
        let st = self.shared.state.lock();
        st.closed || st.local_closed
    }

    /// Bytes readable without waiting.
    pub fn available(&self) -> usize {
        let st = self.shared.state.lock();
        st.read_buffer.len() + st.read_queue.iter().map(Bytes::len).sum::<usize>()
    }

    /// Write all of `data`, split into WRTE packets as credit allows.
    pub async fn write(&self, data: &[u8]) -> Result<(), AdbError> {
        if data.is_empty() {
            return Ok(());
        }
        let _serial = self.shared.write_serial.lock().await;
        let mut offset = 0;
        while offset < data.len() {
            let max_data = self.conn.max_data() as usize;
            let (remote_id, n) = self
                .shared
                .acquire_credit(data.len() - offset, max_data)
                .await?;
            let chunk = Bytes::copy_from_slice(&data[offset..offset + n]);
            self.conn
                .send(&Message::write(self.shared.local_id, remote_id, chunk))
                .await?;
            offset += n;
        }
        Ok(())
    }

    /// Every WRTE is handed to the channel as it is produced, so this only
    /// reports whether the stream can still be written.
    pub async fn flush(&self) -> Result<(), AdbError> {
        let st = self.shared.state.lock();
        if st.closed || st.pending_close || st.local_closed {
            return Err(AdbError::StreamClosed);
        }
        Ok(())
    }

    /// Read into `buf`. Returns `Ok(0)` at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, AdbError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let shared = &self.shared;
        loop {
            let notified = shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = {
                let mut st = shared.state.lock();
                let open = !(st.closed || st.pending_close || st.local_closed);

                if !st.read_buffer.is_empty() {
                    let n = st.read_buffer.len().min(buf.len());
                    buf[..n].copy_from_slice(&st.read_buffer[..n]);
                    let rest = st.read_buffer.slice(n..);
                    st.read_buffer = rest;
                    // Legacy credit was returned when the chunk was popped.
                    let ack = (open && shared.flow == FlowControl::DelayedAck)
                        .then(|| Message::okay(shared.local_id, st.remote_id, Some(n as u32)));
                    Some((n, ack))
                } else {
                    match st.read_queue.pop_front() {
                        Some(chunk) => {
                            let n = chunk.len().min(buf.len());
                            buf[..n].copy_from_slice(&chunk[..n]);
                            st.read_buffer = chunk.slice(n..);

                            let ack = open.then(|| {
                                let acked = match shared.flow {
                                    FlowControl::Legacy => None,
                                    FlowControl::DelayedAck => Some(n as u32),
                                };
                                Message::okay(shared.local_id, st.remote_id, acked)
                            });
                            if st.pending_close && st.read_queue.is_empty() {
                                st.closed = true;
                            }
                            Some((n, ack))
                        }
                        None if st.closed || st.local_closed => return Ok(0),
                        None if st.pending_close => {
                            st.closed = true;
                            return Ok(0);
                        }
                        None => None,
                    }
                }
            };

            let Some((n, ack)) = popped else {
                notified.await;
                continue;
            };
            if let Some(okay) = ack {
                if let Err(e) = self.conn.send(&okay).await {
                    tracing::debug!(local_id = shared.local_id, "ack not sent: {e}");
                }
            }
            // An empty WRTE still needs its ack but is not end of stream.
            if n == 0 {
                continue;
            }
            return Ok(n);
        }
    }

    /// Read until end of stream.
    pub async fn read_to_end(&self) -> Result<Vec<u8>, AdbError> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Send CLSE. Idempotent; the stream leaves the table when the peer's
    /// CLSE arrives.
    pub async fn close(&self) -> Result<(), AdbError> {
        let remote_id = {
            let mut st = self.shared.state.lock();
            if st.closed || st.local_closed {
                return Ok(());
            }
            st.local_closed = true;
            st.remote_id
        };
        self.shared.wake_all();
        tracing::debug!(local_id = self.shared.local_id, remote_id, "closing stream");
        self.conn
            .send(&Message::close(self.shared.local_id, remote_id))
            .await
    }
}

impl Drop for AdbStream {
    fn drop(&mut self) {
        let remote_id = {
            let mut st = self.shared.state.lock();
            if st.closed || st.local_closed {
                return;
            }
            st.local_closed = true;
            st.remote_id
        };
        self.shared.wake_all();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let conn = self.conn.clone();
            let local_id = self.shared.local_id;
            handle.spawn(async move {
                let _ = conn.send(&Message::close(local_id, remote_id)).await;
            });
        }
    }
}

impl std::fmt::Debug for AdbStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbStream")
            .field("local_id", &self.shared.local_id)
            .field("remote_id", &self.remote_id())
            .field("destination", &self.shared.destination)
            .field("flow", &self.shared.flow)
            .finish()
    }
}
