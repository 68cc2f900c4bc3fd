//! In-memory loopback transport.
//!
//! A datagram transport with no wire underneath: sent packets are
//! recorded (and optionally looped straight back in), and test or demo
//! code injects inbound packets with [`LoopTransport::deliver`].
//! Delivery always goes through the event queue, so received messages
//! surface from `handle_events` exactly like real network traffic:
//! packet bytes are re-parsed into a receive buffer and handed to the
//! configured sink.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::buffer::RxData;
use crate::error::Result;
use crate::ioqueue::EventQueue;
use crate::msg::HostPort;
use crate::transport::{Transport, TransportType};
use crate::util;

/// Consumer of re-parsed inbound packets; typically wraps
/// `Endpoint::receive`.
pub type RxSink = Box<dyn Fn(RxData) + Send + Sync>;

/// Loopback datagram transport.
pub struct LoopTransport {
    obj_name: String,
    local: SocketAddr,
    addr_name: HostPort,
    queue: Arc<EventQueue>,
    sink: Mutex<Option<Arc<RxSink>>>,
    sent: Mutex<Vec<(Bytes, Option<SocketAddr>)>>,
    loop_back: AtomicBool,
    self_weak: Weak<LoopTransport>,
}

impl LoopTransport {
    /// Create a loopback transport bound (nominally) to `local`.
    pub fn new(local: SocketAddr, queue: Arc<EventQueue>) -> Arc<LoopTransport> {
        let addr_name = HostPort::new(local.ip().to_string(), Some(local.port()));
        Self::with_addr_name(local, addr_name, queue)
    }

    /// Create a loopback transport with a published address name that
    /// differs from the bound address.
    pub fn with_addr_name(
        local: SocketAddr,
        addr_name: HostPort,
        queue: Arc<EventQueue>,
    ) -> Arc<LoopTransport> {
        Arc::new_cyclic(|weak| LoopTransport {
            obj_name: util::unique_string("tplo"),
            local,
            addr_name,
            queue,
            sink: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            loop_back: AtomicBool::new(false),
            self_weak: weak.clone(),
        })
    }

    /// Route inbound packets to `sink` after parsing.
    pub fn set_rx_sink(&self, sink: impl Fn(RxData) + Send + Sync + 'static) {
        *self.sink.lock().unwrap() = Some(Arc::new(Box::new(sink)));
    }

    /// When enabled, everything sent on this transport is delivered
    /// right back to it, as if the peer were ourselves.
    pub fn set_loopback(&self, on: bool) {
        self.loop_back.store(on, Ordering::Relaxed);
    }

    /// Inject an inbound packet. Parsing and sink dispatch happen when
    /// the event queue is polled.
    pub fn deliver(&self, packet: Bytes, src: SocketAddr) {
        let weak = self.self_weak.clone();
        self.queue.push(move || {
            let Some(tp) = weak.upgrade() else {
                return;
            };
            let sink = tp.sink.lock().unwrap().clone();
            let Some(sink) = sink else {
                tracing::warn!(transport = %tp.obj_name, "inbound packet with no rx sink, dropped");
                return;
            };
            let weak: Weak<dyn Transport> = tp.self_weak.clone();
            let rdata = RxData::from_wire(packet, src, weak);
            sink(rdata);
        });
    }

    /// Drain the record of sent packets.
    pub fn take_sent(&self) -> Vec<(Bytes, Option<SocketAddr>)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    /// Number of packets sent so far and not yet drained.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Transport for LoopTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn addr_name(&self) -> HostPort {
        self.addr_name.clone()
    }

    fn obj_name(&self) -> &str {
        &self.obj_name
    }

    fn send(&self, bytes: &[u8], remote: Option<SocketAddr>) -> Result<usize> {
        let packet = Bytes::copy_from_slice(bytes);
        self.sent.lock().unwrap().push((packet.clone(), remote));
        if self.loop_back.load(Ordering::Relaxed) {
            self.deliver(packet, remote.unwrap_or(self.local));
        }
        Ok(bytes.len())
    }
}
