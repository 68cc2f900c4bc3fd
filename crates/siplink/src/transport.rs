//! Transport abstraction and registry.
//!
//! Transports are shared by any number of transactions. The registry
//! keys live transports by (type, remote address), tracks an explicit
//! reference count per entry, and reclaims idle transports through a
//! grace timer: dropping the last [`TpHandle`] arms the timer, and a new
//! `acquire` before it fires revives the entry and cancels the reclaim.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::buffer::TxData;
use crate::config::{MAX_TRANSPORTS, TRANSPORT_IDLE_GRACE};
use crate::error::{Error, Result};
use crate::msg::HostPort;
use crate::timer::{TimerHeap, TimerToken};

/// Transport type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Udp,
    Tcp,
    Tls,
}

impl TransportType {
    /// Map a transport name ("UDP", "tcp", "TLS") to its tag.
    pub fn from_name(name: &str) -> Option<TransportType> {
        if name.eq_ignore_ascii_case("udp") {
            Some(TransportType::Udp)
        } else if name.eq_ignore_ascii_case("tcp") {
            Some(TransportType::Tcp)
        } else if name.eq_ignore_ascii_case("tls") {
            Some(TransportType::Tls)
        } else {
            None
        }
    }

    /// The canonical transport name, as it appears in Via.
    pub fn name(self) -> &'static str {
        match self {
            TransportType::Udp => "UDP",
            TransportType::Tcp => "TCP",
            TransportType::Tls => "TLS",
        }
    }

    /// The default SIP port for this transport.
    pub fn default_port(self) -> u16 {
        match self {
            TransportType::Udp | TransportType::Tcp => 5060,
            TransportType::Tls => 5061,
        }
    }

    /// Datagram transports serve many remotes from one entry.
    pub fn is_datagram(self) -> bool {
        matches!(self, TransportType::Udp)
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport flag set. `busy` is carried for transport implementations
/// that mark an in-flight queue operation; the core attaches no
/// semantics to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpFlags {
    pub reliable: bool,
    pub secure: bool,
    pub busy: bool,
}

impl TpFlags {
    /// The natural flags for a transport type.
    pub fn for_type(ttype: TransportType) -> TpFlags {
        TpFlags {
            reliable: matches!(ttype, TransportType::Tcp | TransportType::Tls),
            secure: matches!(ttype, TransportType::Tls),
            busy: false,
        }
    }
}

/// A bound wire endpoint. Implementations are external; the core only
/// needs the identity surface and a non-blocking send.
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// The address the socket is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// The published address of this transport. Differs from the bound
    /// address when a NAT traversal helper has discovered an external
    /// address; outgoing Via and Contact must prefer it.
    fn addr_name(&self) -> HostPort {
        let addr = self.local_addr();
        HostPort::new(addr.ip().to_string(), Some(addr.port()))
    }

    /// Remote address for connection-oriented transports; `None` for
    /// datagram transports.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn flags(&self) -> TpFlags {
        TpFlags::for_type(self.transport_type())
    }

    /// Debug name of this transport.
    fn obj_name(&self) -> &str;

    /// Write bytes to the wire. Returns the number of bytes written;
    /// `Ok(0)` means the stream has closed. Stream transports that
    /// cannot send everything return a partial count and queue the
    /// remainder themselves.
    fn send(&self, bytes: &[u8], remote: Option<SocketAddr>) -> Result<usize>;
}

/// Factory used by `acquire` to create a transport towards a remote.
pub trait TransportFactory: Send + Sync {
    fn transport_type(&self) -> TransportType;
    fn create(&self, remote: SocketAddr) -> Result<Arc<dyn Transport>>;
}

/// Registry key. Datagram transports register with `remote: None` and
/// serve every destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TpKey {
    pub ttype: TransportType,
    pub remote: Option<SocketAddr>,
}

struct Entry {
    tp: Arc<dyn Transport>,
    refcnt: usize,
    /// Entry identity; handles carry it so operations on a replaced
    /// entry under the same key are ignored.
    generation: u64,
    /// Bumped each time the idle timer is armed, so a stale reclaim
    /// callback cannot destroy a since-revived entry.
    arm_seq: u64,
    idle_timer: Option<TimerToken>,
    closing: bool,
}

struct TpmInner {
    entries: Mutex<HashMap<TpKey, Entry>>,
    factories: Mutex<HashMap<TransportType, Arc<dyn TransportFactory>>>,
    timer: Arc<TimerHeap>,
    idle_grace: Duration,
    generation: AtomicU64,
    self_weak: Mutex<Weak<TpmInner>>,
}

/// Reference-counted handle to a registered transport.
///
/// Cloning increments the registry count, dropping decrements it; the
/// transition to zero arms the idle reclaim timer. This keeps the
/// increment/decrement pairing structural.
pub struct TpHandle {
    tp: Arc<dyn Transport>,
    key: TpKey,
    generation: u64,
    mgr: Weak<TpmInner>,
}

impl TpHandle {
    /// A weak link suitable for storing on a receive buffer.
    pub fn weak(&self) -> Weak<dyn Transport> {
        Arc::downgrade(&self.tp)
    }

    pub fn key(&self) -> TpKey {
        self.key
    }
}

impl Deref for TpHandle {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &*self.tp
    }
}

impl Clone for TpHandle {
    fn clone(&self) -> Self {
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.add_ref(self.key, self.generation);
        }
        TpHandle {
            tp: self.tp.clone(),
            key: self.key,
            generation: self.generation,
            mgr: self.mgr.clone(),
        }
    }
}

impl Drop for TpHandle {
    fn drop(&mut self) {
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.dec_ref(self.key, self.generation);
        }
    }
}

impl fmt::Debug for TpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TpHandle")
            .field("key", &self.key)
            .field("obj_name", &self.tp.obj_name())
            .finish_non_exhaustive()
    }
}

impl TpmInner {
    fn add_ref(&self, key: TpKey, generation: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&key) {
            if entry.generation == generation {
                entry.refcnt += 1;
                if let Some(token) = entry.idle_timer.take() {
                    self.timer.cancel(token);
                }
            }
        }
    }

    fn dec_ref(&self, key: TpKey, generation: u64) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&key) else {
            return;
        };
        if entry.generation != generation || entry.refcnt == 0 {
            return;
        }
        entry.refcnt -= 1;
        if entry.refcnt > 0 {
            return;
        }

        entry.arm_seq += 1;
        let arm_seq = entry.arm_seq;
        let weak = self.self_weak.lock().unwrap().clone();
        let token = self.timer.schedule(self.idle_grace, move || {
            if let Some(inner) = weak.upgrade() {
                inner.reap(key, generation, arm_seq);
            }
        });
        match token {
            Ok(token) => entry.idle_timer = Some(token),
            Err(_) => {
                // Timer heap exhausted: reclaim immediately rather than
                // leaking the entry.
                let name = entry.tp.obj_name().to_owned();
                entries.remove(&key);
                tracing::warn!(transport = %name, "idle timer unavailable, transport destroyed");
            }
        }
    }

    fn reap(&self, key: TpKey, generation: u64, arm_seq: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(&key) {
            if entry.generation == generation && entry.arm_seq == arm_seq && entry.refcnt == 0 {
                tracing::debug!(transport = %entry.tp.obj_name(), ?key, "idle transport destroyed");
                entries.remove(&key);
            }
        }
    }
}

/// Registry of live transports, shared across the endpoint.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<TpmInner>,
}

impl TransportManager {
    pub fn new(timer: Arc<TimerHeap>) -> Self {
        Self::with_idle_grace(timer, TRANSPORT_IDLE_GRACE)
    }

    /// Create a manager with a custom idle reclaim grace.
    pub fn with_idle_grace(timer: Arc<TimerHeap>, idle_grace: Duration) -> Self {
        let inner = Arc::new(TpmInner {
            entries: Mutex::new(HashMap::new()),
            factories: Mutex::new(HashMap::new()),
            timer,
            idle_grace,
            generation: AtomicU64::new(0),
            self_weak: Mutex::new(Weak::new()),
        });
        *inner.self_weak.lock().unwrap() = Arc::downgrade(&inner);
        TransportManager { inner }
    }

    /// Register a factory for on-demand transport creation.
    pub fn register_factory(&self, factory: Arc<dyn TransportFactory>) {
        self.inner
            .factories
            .lock()
            .unwrap()
            .insert(factory.transport_type(), factory);
    }

    /// Register an already-bound transport (a listener or datagram
    /// socket) and take the first reference on it.
    pub fn register_transport(&self, tp: Arc<dyn Transport>) -> Result<TpHandle> {
        let key = TpKey {
            ttype: tp.transport_type(),
            remote: tp.remote_addr(),
        };
        let mut entries = self.inner.entries.lock().unwrap();
        if entries.len() >= MAX_TRANSPORTS {
            return Err(Error::TooMany("transport table"));
        }
        if entries.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("transport {:?}", key)));
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key,
            Entry {
                tp: tp.clone(),
                refcnt: 1,
                generation,
                arm_seq: 0,
                idle_timer: None,
                closing: false,
            },
        );
        tracing::debug!(transport = %tp.obj_name(), ?key, "transport registered");
        Ok(TpHandle {
            tp,
            key,
            generation,
            mgr: Arc::downgrade(&self.inner),
        })
    }

    /// Find or create a transport for the destination.
    ///
    /// An existing entry keyed by (type, remote) is reused unless it is
    /// marked for close; datagram lookups key on the type alone. With no
    /// live entry, the registered factory for the type creates one;
    /// without a factory the destination is unreachable.
    pub fn acquire(&self, ttype: TransportType, remote: SocketAddr) -> Result<TpHandle> {
        let key = TpKey {
            ttype,
            remote: if ttype.is_datagram() {
                None
            } else {
                Some(remote)
            },
        };

        let mut entries = self.inner.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&key) {
            if !entry.closing {
                entry.refcnt += 1;
                if let Some(token) = entry.idle_timer.take() {
                    self.inner.timer.cancel(token);
                }
                return Ok(TpHandle {
                    tp: entry.tp.clone(),
                    key,
                    generation: entry.generation,
                    mgr: Arc::downgrade(&self.inner),
                });
            }
        }

        if entries.len() >= MAX_TRANSPORTS {
            return Err(Error::TooMany("transport table"));
        }

        let factory = {
            let factories = self.inner.factories.lock().unwrap();
            factories.get(&ttype).cloned()
        };
        let Some(factory) = factory else {
            return Err(Error::NoRoute(ttype.name()));
        };

        let tp = factory.create(remote)?;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key,
            Entry {
                tp: tp.clone(),
                refcnt: 1,
                generation,
                arm_seq: 0,
                idle_timer: None,
                closing: false,
            },
        );
        tracing::debug!(transport = %tp.obj_name(), ?key, "transport created");
        Ok(TpHandle {
            tp,
            key,
            generation,
            mgr: Arc::downgrade(&self.inner),
        })
    }

    /// Mark a transport so `acquire` no longer hands it out. The entry
    /// itself is reclaimed once the last holder drops.
    pub fn mark_closing(&self, handle: &TpHandle) {
        let mut entries = self.inner.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&handle.key) {
            if entry.generation == handle.generation {
                entry.closing = true;
            }
        }
    }

    /// Print the message (filling the tx cache if needed) and hand the
    /// bytes to the transport.
    ///
    /// The topmost Via of an outgoing request is stamped with the
    /// transport's published address name, so a NAT-discovered external
    /// address wins over the bound one.
    pub fn send(
        &self,
        tp: &TpHandle,
        tdata: &Arc<TxData>,
        remote: Option<SocketAddr>,
    ) -> Result<usize> {
        if tdata.with_msg(crate::msg::Message::is_request) {
            let addr_name = tp.addr_name();
            let stale = tdata.with_msg(|msg| {
                msg.headers
                    .via_top()
                    .is_some_and(|via| via.sent_by != addr_name)
            });
            // Leave the print cache alone when the Via is already
            // right, so retransmits keep reusing it.
            if stale {
                tdata.modify_msg(|msg| {
                    if let Some(via) = msg.headers.via_top_mut() {
                        via.sent_by = addr_name;
                    }
                });
            }
        }

        let bytes = tdata.print()?;

        if tp.transport_type().is_datagram() {
            if remote.is_none() {
                return Err(Error::InvalidArg(
                    "datagram send requires a remote address".into(),
                ));
            }
        } else if let (Some(requested), Some(connected)) = (remote, tp.remote_addr()) {
            if requested != connected {
                return Err(Error::InvalidArg(format!(
                    "stream transport is connected to {}, not {}",
                    connected, requested
                )));
            }
        }

        let written = tp.send(&bytes, remote)?;
        tracing::trace!(
            transport = %tp.obj_name(),
            bytes = bytes.len(),
            written,
            "message sent"
        );
        Ok(written)
    }

    /// Current reference count of the entry for (type, remote), if it
    /// exists.
    pub fn ref_count(&self, ttype: TransportType, remote: Option<SocketAddr>) -> Option<usize> {
        let entries = self.inner.entries.lock().unwrap();
        entries.get(&TpKey { ttype, remote }).map(|e| e.refcnt)
    }

    /// Number of live entries.
    pub fn transport_count(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    /// Snapshot of the registry for the endpoint dump.
    pub fn snapshot(&self) -> Vec<TransportInfo> {
        let entries = self.inner.entries.lock().unwrap();
        entries
            .values()
            .map(|e| TransportInfo {
                obj_name: e.tp.obj_name().to_owned(),
                ttype: e.tp.transport_type(),
                local_addr: e.tp.local_addr(),
                addr_name: e.tp.addr_name(),
                refcnt: e.refcnt,
                flags: e.tp.flags(),
                closing: e.closing,
            })
            .collect()
    }
}

/// One registry entry as reported by [`TransportManager::snapshot`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "output", derive(serde::Serialize))]
pub struct TransportInfo {
    pub obj_name: String,
    #[cfg_attr(feature = "output", serde(serialize_with = "serialize_ttype"))]
    pub ttype: TransportType,
    pub local_addr: SocketAddr,
    #[cfg_attr(feature = "output", serde(serialize_with = "serialize_host_port"))]
    pub addr_name: HostPort,
    pub refcnt: usize,
    #[cfg_attr(feature = "output", serde(skip))]
    pub flags: TpFlags,
    pub closing: bool,
}

#[cfg(feature = "output")]
fn serialize_ttype<S: serde::Serializer>(t: &TransportType, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(t.name())
}

#[cfg(feature = "output")]
fn serialize_host_port<S: serde::Serializer>(hp: &HostPort, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hp.to_string())
}

/// Inert transport that swallows everything it is asked to send. Used
/// where a transport is structurally required but no wire exists.
pub struct NullTransport {
    obj_name: String,
}

impl NullTransport {
    pub fn new() -> Self {
        NullTransport {
            obj_name: crate::util::unique_string("tpnull"),
        }
    }
}

impl Default for NullTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for NullTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        "0.0.0.0:0".parse().unwrap()
    }

    fn obj_name(&self) -> &str {
        &self.obj_name
    }

    fn send(&self, bytes: &[u8], _remote: Option<SocketAddr>) -> Result<usize> {
        Ok(bytes.len())
    }
}
