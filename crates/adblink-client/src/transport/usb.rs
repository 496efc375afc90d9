//! USB bulk channel for devices exposing the ADB interface
//! (class 0xff, subclass 0x42, protocol 0x01).
//!
//! Every packet goes out as two bulk transfers: the 24-byte header, then the
//! payload when there is one. Inbound reads keep a small pool of bulk IN
//! requests in flight and recycle their buffers.

use async_trait::async_trait;
use nusb::transfer::{Direction, EndpointType, Queue, RequestBuffer};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use adblink_protocol::codec::HEADER_SIZE;

use super::Channel;
use crate::error::TransportError;

pub const ADB_CLASS: u8 = 0xff;
pub const ADB_SUBCLASS: u8 = 0x42;
pub const ADB_PROTOCOL: u8 = 0x01;

/// Size of each bulk IN request.
const READ_SIZE: usize = 64 * 1024;

/// Bulk IN requests kept in flight.
const READ_POOL: usize = 4;

/// An attached device with an ADB interface.
#[derive(Debug, Clone)]
pub struct UsbDeviceSummary {
    pub serial: Option<String>,
    pub product: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Completed IN data not yet handed to the reader, plus recycled buffers.
#[derive(Default)]
struct ReadBuffer {
    spare: Vec<Vec<u8>>,
    leftover: Vec<u8>,
    offset: usize,
}

impl ReadBuffer {
    fn has_leftover(&self) -> bool {
        self.offset < self.leftover.len()
    }

    fn spare(&mut self) -> Vec<u8> {
        self.spare.pop().unwrap_or_default()
    }

    /// Copy as much of `data` as fits and keep the rest for the next read.
    fn deliver(&mut self, data: Vec<u8>, buf: &mut [u8]) -> usize {
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < data.len() {
            self.leftover = data;
            self.offset = n;
        } else {
            self.spare.push(data);
        }
        n
    }

    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let available = &self.leftover[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        if self.offset == self.leftover.len() {
            let done = std::mem::take(&mut self.leftover);
            self.spare.push(done);
            self.offset = 0;
        }
        n
    }
}

struct Inbound {
    queue: Queue<RequestBuffer>,
    buffer: ReadBuffer,
}

impl Inbound {
    fn refill(&mut self) {
        while self.queue.pending() < READ_POOL {
            let buf = self.buffer.spare();
            self.queue.submit(RequestBuffer::reuse(buf, READ_SIZE));
        }
    }
}

/// Split an encoded packet into its header transfer and, when the payload
/// is non-empty, a payload transfer.
fn bulk_transfers(packet: &[u8]) -> Result<(&[u8], Option<&[u8]>), TransportError> {
    if packet.len() < HEADER_SIZE {
        return Err(TransportError::Usb(format!(
            "packet of {} bytes is shorter than a header",
            packet.len()
        )));
    }
    let (header, payload) = packet.split_at(HEADER_SIZE);
    Ok((header, (!payload.is_empty()).then_some(payload)))
}

pub struct UsbChannel {
    interface: nusb::Interface,
    endpoint_out: u8,
    serial: String,
    inbound: Mutex<Inbound>,
    write_lock: Mutex<()>,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

fn has_adb_interface(info: &nusb::DeviceInfo) -> bool {
    info.interfaces().any(|i| {
        i.class() == ADB_CLASS && i.subclass() == ADB_SUBCLASS && i.protocol() == ADB_PROTOCOL
    })
}

impl UsbChannel {
    /// Attached devices that expose an ADB interface.
    pub fn list() -> Result<Vec<UsbDeviceSummary>, TransportError> {
        let devices = nusb::list_devices()?
            .filter(has_adb_interface)
            .map(|d| UsbDeviceSummary {
                serial: d.serial_number().map(str::to_string),
                product: d.product_string().map(str::to_string),
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
            })
            .collect();
        Ok(devices)
    }

    /// Open the first ADB device, or the one with `serial`.
    pub fn open(serial: Option<&str>) -> Result<Self, TransportError> {
        let info = nusb::list_devices()?
            .filter(has_adb_interface)
            .find(|d| serial.map_or(true, |s| d.serial_number() == Some(s)))
            .ok_or(TransportError::NoUsbDevice)?;
        Self::from_device_info(&info)
    }

    fn from_device_info(info: &nusb::DeviceInfo) -> Result<Self, TransportError> {
        let device = info.open()?;

        let (number, alt, endpoint_in, endpoint_out) = {
            let config = device
                .active_configuration()
                .map_err(|e| TransportError::Usb(e.to_string()))?;
            config
                .interface_alt_settings()
                .filter(|alt| {
                    alt.class() == ADB_CLASS
                        && alt.subclass() == ADB_SUBCLASS
                        && alt.protocol() == ADB_PROTOCOL
                })
                .find_map(|alt| {
                    let bulk = |dir: Direction| {
                        alt.endpoints()
                            .find(|ep| {
                                ep.transfer_type() == EndpointType::Bulk && ep.direction() == dir
                            })
                            .map(|ep| ep.address())
                    };
                    Some((
                        alt.interface_number(),
                        alt.alternate_setting(),
                        bulk(Direction::In)?,
                        bulk(Direction::Out)?,
                    ))
                })
                .ok_or_else(|| {
                    TransportError::Usb("adb interface has no bulk endpoint pair".into())
                })?
        };

        let interface = device.claim_interface(number)?;
        if alt != 0 {
            interface.set_alt_setting(alt)?;
        }

        let serial = info.serial_number().unwrap_or("unknown").to_string();
        tracing::info!(
            %serial,
            vendor_id = info.vendor_id(),
            product_id = info.product_id(),
            interface = number,
            "usb channel opened"
        );

        let queue = interface.bulk_in_queue(endpoint_in);
        Ok(Self {
            interface,
            endpoint_out,
            serial,
            inbound: Mutex::new(Inbound {
                queue,
                buffer: ReadBuffer::default(),
            }),
            write_lock: Mutex::new(()),
            connected: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        })
    }

    async fn bulk_out(&self, data: Vec<u8>) -> Result<(), TransportError> {
        let transfer = self.interface.bulk_out(self.endpoint_out, data);
        let completion = tokio::select! {
            _ = self.shutdown.cancelled() => return self.fail(TransportError::Closed),
            completion = transfer => completion,
        };
        match completion.into_result() {
            Ok(_) => Ok(()),
            Err(e) => self.fail(TransportError::Usb(e.to_string())),
        }
    }

    fn fail<T>(&self, err: TransportError) -> Result<T, TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Err(err)
    }
}

#[async_trait]
impl Channel for UsbChannel {
    async fn write(&self, packet: &[u8]) -> Result<(), TransportError> {
        let (header, payload) = bulk_transfers(packet)?;

        // Header and payload transfers of one packet must stay adjacent.
        let _guard = self.write_lock.lock().await;
        self.bulk_out(header.to_vec()).await?;
        if let Some(payload) = payload {
            self.bulk_out(payload.to_vec()).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut inbound = self.inbound.lock().await;
        if inbound.buffer.has_leftover() {
            return Ok(inbound.buffer.drain(buf));
        }

        inbound.refill();
        let completion = tokio::select! {
            _ = self.shutdown.cancelled() => return self.fail(TransportError::Closed),
            completion = inbound.queue.next_complete() => completion,
        };
        let data = match completion.into_result() {
            Ok(data) => data,
            Err(e) => return self.fail(TransportError::Usb(e.to_string())),
        };

        Ok(inbound.buffer.deliver(data, buf))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        let mut inbound = self.inbound.lock().await;
        inbound.queue.cancel_all();
        tracing::debug!(serial = %self.serial, "usb channel closed");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!("usb:{}", self.serial)
    }
}
