//! The endpoint: module registry, capabilities, and the event loop.
//!
//! The endpoint is the centerpiece of the stack. It owns the timer heap,
//! the I/O queue, the resolver, and the transport registry, and it runs
//! the single poll loop that drains timers and network readiness. Parsed
//! messages are distributed to modules in priority order; outgoing
//! messages pass the modules in reverse order before the transport
//! manager prints and writes them.
//!
//! `Endpoint` is a cheap clone over shared internals, so it can be
//! stored wherever a backreference is needed — but it must never be
//! stored inside one of its own modules, or the cycle keeps everything
//! alive.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::buffer::{RxData, TxData};
use crate::config::{MAX_MODULE, MAX_NET_EVENTS, MAX_TIMED_OUT_ENTRIES, MAX_TIMER_COUNT};
use crate::error::{Error, Result};
use crate::ioqueue::{EventQueue, IoQueue};
use crate::module::Module;
use crate::msg::{Header, HostPort, Message, Method, StatusCode};
use crate::resolver::{ResolveCallback, Resolver, StaticResolver};
use crate::timer::{TimerHeap, TimerToken};
use crate::transport::{TpHandle, TransportManager, TransportType};

/// Which capability header a tag set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Accept,
    Allow,
    Supported,
}

struct OrderEntry {
    priority: u32,
    id: usize,
}

struct ModuleRegistry {
    slots: Vec<Option<Arc<dyn Module>>>,
    /// Module ids sorted by (priority, registration order).
    order: Vec<OrderEntry>,
}

impl ModuleRegistry {
    fn new() -> Self {
        ModuleRegistry {
            slots: (0..MAX_MODULE).map(|_| None).collect(),
            order: Vec::new(),
        }
    }
}

struct Inner {
    name: String,
    strict_sent_by: bool,
    modules: RwLock<ModuleRegistry>,
    caps: Mutex<Vec<Header>>,
    req_hdrs: Mutex<Vec<Header>>,
    timer: Arc<TimerHeap>,
    ioqueue: Arc<dyn IoQueue>,
    event_queue: Option<Arc<EventQueue>>,
    resolver: Arc<dyn Resolver>,
    tpmgr: TransportManager,
    ioq_last_err: Mutex<Option<String>>,
}

/// The SIP endpoint. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("inner_refcount", &Arc::strong_count(&self.inner))
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Construct a new [`EndpointBuilder`].
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    /// The endpoint name, used as the warn-agent in Warning headers.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // --- module registry -------------------------------------------------

    /// Register a module.
    ///
    /// The module is assigned the lowest free id, its `load` and `start`
    /// hooks run (either failing aborts the registration), and it is
    /// inserted into the dispatch order before the first module with a
    /// strictly greater priority.
    pub fn register_module(&self, module: Arc<dyn Module>) -> Result<usize> {
        let mut reg = self.inner.modules.write().unwrap();

        if reg
            .slots
            .iter()
            .flatten()
            .any(|m| Arc::ptr_eq(m, &module))
        {
            return Err(Error::AlreadyExists(format!(
                "module \"{}\" is already registered",
                module.name()
            )));
        }
        if reg
            .slots
            .iter()
            .flatten()
            .any(|m| m.name().eq_ignore_ascii_case(module.name()))
        {
            return Err(Error::AlreadyExists(format!(
                "module name \"{}\" is taken",
                module.name()
            )));
        }

        let id = reg
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::TooMany("module table"))?;

        module.load(self)?;
        module.start()?;

        reg.slots[id] = Some(module.clone());
        let pos = reg
            .order
            .iter()
            .position(|e| e.priority > module.priority())
            .unwrap_or(reg.order.len());
        reg.order.insert(
            pos,
            OrderEntry {
                priority: module.priority(),
                id,
            },
        );

        tracing::debug!(module = %module.name(), id, "module registered");
        Ok(id)
    }

    /// Unregister a module. `stop` and `unload` run first; if either
    /// fails the module stays registered and the error propagates.
    pub fn unregister_module(&self, module: &Arc<dyn Module>) -> Result<()> {
        let mut reg = self.inner.modules.write().unwrap();

        let id = reg
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|m| Arc::ptr_eq(m, module)))
            .ok_or(Error::NotFound("module"))?;

        if let Err(e) = module.stop().and_then(|()| module.unload()) {
            tracing::warn!(module = %module.name(), error = %e, "module can not be unregistered");
            return Err(e);
        }

        reg.slots[id] = None;
        reg.order.retain(|e| e.id != id);

        tracing::debug!(module = %module.name(), id, "module unregistered");
        Ok(())
    }

    /// Shut the endpoint down: unregister every module, lowest priority
    /// first. A module that refuses to stop is left in place and the
    /// teardown stops there.
    pub fn destroy(&self) {
        tracing::debug!(name = %self.inner.name, "destroying endpoint");
        loop {
            let module = {
                let reg = self.inner.modules.read().unwrap();
                reg.order.last().and_then(|e| reg.slots[e.id].clone())
            };
            let Some(module) = module else {
                break;
            };
            if self.unregister_module(&module).is_err() {
                break;
            }
        }
    }

    /// Registered modules as (id, name, priority), in dispatch order.
    pub fn modules_snapshot(&self) -> Vec<(usize, String, u32)> {
        let reg = self.inner.modules.read().unwrap();
        reg.order
            .iter()
            .filter_map(|e| {
                reg.slots[e.id]
                    .as_ref()
                    .map(|m| (e.id, m.name().to_owned(), e.priority))
            })
            .collect()
    }

    // --- capabilities and standing headers --------------------------------

    /// Add tags to a capability header, creating the header on first
    /// use. Tags already present (case-insensitively) are skipped.
    pub fn add_capability(&self, kind: CapabilityKind, tags: &[&str]) -> Result<()> {
        if tags.is_empty() {
            return Err(Error::InvalidArg("no capability tags given".into()));
        }

        let mut caps = self.inner.caps.lock().unwrap();
        let pos = caps.iter().position(|h| {
            matches!(
                (kind, h),
                (CapabilityKind::Accept, Header::Accept(_))
                    | (CapabilityKind::Allow, Header::Allow(_))
                    | (CapabilityKind::Supported, Header::Supported(_))
            )
        });
        let pos = match pos {
            Some(pos) => pos,
            None => {
                caps.push(match kind {
                    CapabilityKind::Accept => Header::Accept(Vec::new()),
                    CapabilityKind::Allow => Header::Allow(Vec::new()),
                    CapabilityKind::Supported => Header::Supported(Vec::new()),
                });
                caps.len() - 1
            }
        };
        let (Header::Accept(values) | Header::Allow(values) | Header::Supported(values)) =
            &mut caps[pos]
        else {
            return Err(Error::InvalidArg("capability slot mismatch".into()));
        };

        for tag in tags {
            if !values.iter().any(|v| v.eq_ignore_ascii_case(tag)) {
                values.push((*tag).to_owned());
            }
        }
        Ok(())
    }

    /// The tags of a capability header, or `None` if it was never
    /// created.
    pub fn capability(&self, kind: CapabilityKind) -> Option<Vec<String>> {
        let caps = self.inner.caps.lock().unwrap();
        caps.iter().find_map(|h| match (kind, h) {
            (CapabilityKind::Accept, Header::Accept(v))
            | (CapabilityKind::Allow, Header::Allow(v))
            | (CapabilityKind::Supported, Header::Supported(v)) => Some(v.clone()),
            _ => None,
        })
    }

    /// Clones of all capability headers, for message building.
    pub fn capability_headers(&self) -> Vec<Header> {
        self.inner.caps.lock().unwrap().clone()
    }

    /// Standing headers stamped on every outgoing request (Max-Forwards
    /// and friends).
    pub fn request_headers(&self) -> Vec<Header> {
        self.inner.req_hdrs.lock().unwrap().clone()
    }

    // --- event loop --------------------------------------------------------

    /// Run one turn of the event loop and return the number of events
    /// processed.
    ///
    /// Due timer callbacks run first, then the I/O queue is polled with
    /// the smaller of the next timer deadline and `max_wait`. Immediate
    /// events are drained with zero-timeout re-polls, bounded so timer
    /// work is not starved. A failing poll sleeps out the planned delay
    /// and surfaces the OS error.
    pub fn handle_events(&self, max_wait: Option<Duration>) -> Result<usize> {
        let (timer_count, next_delay) = self.inner.timer.poll(Instant::now());
        let mut count = timer_count;

        let mut timeout = match (next_delay, max_wait) {
            (Some(t), Some(m)) => Some(t.min(m)),
            (Some(t), None) => Some(t),
            (None, m) => m,
        };

        let mut net_count = 0;
        loop {
            match self.inner.ioqueue.poll(timeout) {
                Err(e) => {
                    *self.inner.ioq_last_err.lock().unwrap() = Some(e.to_string());
                    std::thread::sleep(timeout.unwrap_or(Duration::ZERO));
                    return Err(Error::Socket(e));
                }
                Ok(0) => break,
                Ok(c) => {
                    count += c;
                    net_count += c;
                    if net_count >= MAX_NET_EVENTS {
                        break;
                    }
                    timeout = Some(Duration::ZERO);
                }
            }
        }

        Ok(count)
    }

    /// Schedule a one-shot timer on the endpoint heap.
    pub fn schedule_timer(
        &self,
        delay: Duration,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<TimerToken> {
        self.inner.timer.schedule(delay, cb)
    }

    /// Cancel a previously scheduled timer.
    pub fn cancel_timer(&self, token: TimerToken) -> bool {
        self.inner.timer.cancel(token)
    }

    /// Resolve a target asynchronously; the continuation fires with the
    /// addresses or the failure.
    pub fn resolve(&self, target: &HostPort, cb: ResolveCallback) {
        self.inner.resolver.resolve(target, cb)
    }

    /// The in-memory event queue, when the endpoint was built with one.
    /// Loopback transports push their readiness events here.
    pub fn event_queue(&self) -> Option<Arc<EventQueue>> {
        self.inner.event_queue.clone()
    }

    /// The transport registry.
    pub fn transports(&self) -> &TransportManager {
        &self.inner.tpmgr
    }

    /// Find or create a transport for the destination.
    pub fn acquire_transport(&self, ttype: TransportType, remote: SocketAddr) -> Result<TpHandle> {
        self.inner.tpmgr.acquire(ttype, remote)
    }

    /// Wrap a message in a fresh transmit buffer.
    pub fn create_tdata(&self, msg: Message) -> Arc<TxData> {
        TxData::new(msg)
    }

    /// Build a response to a received request: the request's Via chain,
    /// From, To, Call-ID and CSeq are copied over.
    pub fn create_response(
        &self,
        rdata: &RxData,
        code: StatusCode,
        reason: Option<&str>,
    ) -> Result<Arc<TxData>> {
        let msg = rdata
            .msg()
            .ok_or_else(|| Error::InvalidArg("no parsed message in rx buffer".into()))?;
        if !msg.is_request() {
            return Err(Error::InvalidArg("cannot respond to a response".into()));
        }
        if msg.method() == Some(&Method::Ack) {
            return Err(Error::InvalidArg("cannot respond to ACK".into()));
        }

        let mut resp = Message::response(code, reason.map(str::to_owned));
        for hdr in msg.headers.iter() {
            match hdr {
                Header::Via(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CallId(_)
                | Header::CSeq(_) => resp.headers.push(hdr.clone()),
                _ => {}
            }
        }

        let tdata = TxData::new(resp);
        tdata.set_rx_timestamp(rdata.timestamp());
        Ok(tdata)
    }

    // --- dispatch ----------------------------------------------------------

    /// Distribute a received message to the modules.
    ///
    /// Returns whether any module claimed the message. Messages with
    /// parse errors or missing base headers are logged and dropped, as
    /// are responses whose topmost Via does not match the receiving
    /// transport (see [`EndpointBuilder::strict_sent_by`]).
    pub fn receive(&self, rdata: RxData) -> bool {
        if rdata.msg().is_none() || !rdata.parse_errors().is_empty() {
            tracing::error!(
                src = %rdata.src_addr(),
                errors = ?rdata.parse_errors(),
                packet = %String::from_utf8_lossy(rdata.packet()),
                "error processing packet"
            );
            return false;
        }

        if let Some(indicator) = rdata.missing_headers() {
            tracing::error!(
                src = %rdata.src_addr(),
                missing = %indicator,
                "dropping message with missing headers"
            );
            return false;
        }

        tracing::trace!(info = %rdata.info(), "processing incoming message");

        let is_request = rdata.msg().map(Message::is_request).unwrap_or(false);
        if !is_request && self.response_sent_by_mismatch(&rdata) {
            tracing::debug!(
                info = %rdata.info(),
                src = %rdata.src_addr(),
                "dropping response because sent-by is mismatch"
            );
            return false;
        }

        if let (Some(cseq), Some(via)) = (&rdata.views().cseq, &rdata.views().via) {
            let branch = via.branch().unwrap_or_default();
            rdata.set_tsx_key(format!("{}${}", cseq.method, branch));
        }

        // The walk itself runs on a snapshot taken under the reader
        // lock, so a hook may send (and re-enter the tx walk) without
        // holding the registry lock.
        let walk = self.module_walk();
        let mut handled = false;
        for module in &walk {
            handled = if is_request {
                module.on_rx_request(self, &rdata)
            } else {
                module.on_rx_response(self, &rdata)
            };
            if handled {
                break;
            }
        }

        if !handled {
            tracing::warn!(
                info = %rdata.info(),
                src = %rdata.src_addr(),
                "message was dropped/unhandled by any modules"
            );
        }

        // The buffer may be recycled by the transport once dispatch
        // returns; nothing of this turn may survive in it.
        rdata.clear_scratch();
        handled
    }

    /// RFC 3261 §18.1.2 check on received responses. Lenient by
    /// default: a response is dropped only when both the sent-by port
    /// and the `rport` parameter disagree with the transport's local
    /// name. Strict mode also drops on a sent-by host mismatch.
    fn response_sent_by_mismatch(&self, rdata: &RxData) -> bool {
        let Some(via) = &rdata.views().via else {
            return false;
        };
        let Some(tp) = rdata.transport() else {
            return false;
        };

        let local = tp.addr_name();
        let default_port = tp.transport_type().default_port();
        let sent_port = via.sent_by.port_or(default_port);
        let local_port = local.port_or(default_port);

        if !via.sent_by.same_host(&local.host) {
            // Some proxies rewrite sent-by on the way out, so a host
            // mismatch alone is tolerated unless strict checking is on.
            if self.inner.strict_sent_by {
                return true;
            }
        } else if sent_port != local_port {
            if via.rport() != Some(local_port) {
                return true;
            }
            tracing::debug!(
                info = %rdata.info(),
                src = %rdata.src_addr(),
                "mismatch port in sent-by but the rport parameter is correct"
            );
        }
        false
    }

    /// The registered modules in dispatch order, snapshotted under the
    /// reader lock.
    fn module_walk(&self) -> Vec<Arc<dyn Module>> {
        let reg = self.inner.modules.read().unwrap();
        reg.order
            .iter()
            .filter_map(|e| reg.slots[e.id].clone())
            .collect()
    }

    /// Pass an outgoing message through the module tx hooks, lowest
    /// priority first. The first failure stops the send.
    pub fn dispatch_tx(&self, tdata: &Arc<TxData>) -> Result<()> {
        let is_request = tdata.with_msg(Message::is_request);
        let walk = self.module_walk();
        for module in walk.iter().rev() {
            if is_request {
                module.on_tx_request(self, tdata)?;
            } else {
                module.on_tx_response(self, tdata)?;
            }
        }
        Ok(())
    }

    /// Send a message: module tx hooks first, then the transport manager
    /// prints and writes the bytes.
    pub fn send(
        &self,
        tp: &TpHandle,
        tdata: &Arc<TxData>,
        remote: Option<SocketAddr>,
    ) -> Result<usize> {
        self.dispatch_tx(tdata)?;
        self.inner.tpmgr.send(tp, tdata, remote)
    }

    // --- reporting ---------------------------------------------------------

    /// Log an error with sender context.
    pub fn log_error(&self, sender: &str, error: &Error, context: &str) {
        tracing::error!(sender, error = %error, "{}", context);
    }

    /// Snapshot the endpoint state and log a summary.
    pub fn dump(&self) -> EndpointDump {
        let dump = EndpointDump {
            name: self.inner.name.clone(),
            modules: self
                .modules_snapshot()
                .into_iter()
                .map(|(id, name, priority)| ModuleInfo { id, name, priority })
                .collect(),
            transports: self.inner.tpmgr.snapshot(),
            pending_timers: self.inner.timer.len(),
            last_poll_error: self.inner.ioq_last_err.lock().unwrap().clone(),
        };
        tracing::info!(
            name = %dump.name,
            modules = dump.modules.len(),
            transports = dump.transports.len(),
            pending_timers = dump.pending_timers,
            "endpoint dump"
        );
        dump
    }

    /// Render the endpoint snapshot as JSON.
    #[cfg(feature = "output")]
    pub fn dump_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.dump())?)
    }
}

/// One registered module, as reported by [`Endpoint::dump`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "output", derive(serde::Serialize))]
pub struct ModuleInfo {
    pub id: usize,
    pub name: String,
    pub priority: u32,
}

/// Snapshot of the endpoint state.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "output", derive(serde::Serialize))]
pub struct EndpointDump {
    pub name: String,
    pub modules: Vec<ModuleInfo>,
    pub transports: Vec<crate::transport::TransportInfo>,
    pub pending_timers: usize,
    pub last_poll_error: Option<String>,
}

/// Builder for [`Endpoint`].
pub struct EndpointBuilder {
    name: Option<String>,
    strict_sent_by: bool,
    ioqueue: Option<Arc<dyn IoQueue>>,
    resolver: Option<Arc<dyn Resolver>>,
    idle_grace: Duration,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            name: None,
            strict_sent_by: false,
            ioqueue: None,
            resolver: None,
            idle_grace: crate::config::TRANSPORT_IDLE_GRACE,
        }
    }

    /// Name the endpoint; defaults to "localhost".
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Drop received responses whose Via sent-by host does not match the
    /// receiving transport. Off by default for interop with proxies
    /// that rewrite sent-by.
    pub fn strict_sent_by(mut self, strict: bool) -> Self {
        self.strict_sent_by = strict;
        self
    }

    /// Use a custom I/O queue instead of the built-in in-memory one.
    pub fn io_queue(mut self, ioqueue: Arc<dyn IoQueue>) -> Self {
        self.ioqueue = Some(ioqueue);
        self
    }

    /// Use a custom resolver.
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Grace period before an unreferenced transport is reclaimed.
    pub fn transport_idle_grace(mut self, grace: Duration) -> Self {
        self.idle_grace = grace;
        self
    }

    /// Build the endpoint.
    pub fn build(self) -> Endpoint {
        let timer = Arc::new(TimerHeap::new(MAX_TIMER_COUNT, MAX_TIMED_OUT_ENTRIES));
        let tpmgr = TransportManager::with_idle_grace(timer.clone(), self.idle_grace);

        let (ioqueue, event_queue): (Arc<dyn IoQueue>, Option<Arc<EventQueue>>) =
            match self.ioqueue {
                Some(q) => (q, None),
                None => {
                    let q = Arc::new(EventQueue::new());
                    (q.clone(), Some(q))
                }
            };

        let resolver = self.resolver.unwrap_or_else(|| match &event_queue {
            Some(q) => Arc::new(StaticResolver::with_queue(q.clone())),
            None => Arc::new(StaticResolver::new()),
        });

        let req_hdrs = vec![Header::MaxForwards(crate::config::MAX_FORWARDS_VALUE)];

        Endpoint {
            inner: Arc::new(Inner {
                name: self.name.unwrap_or_else(|| "localhost".into()),
                strict_sent_by: self.strict_sent_by,
                modules: RwLock::new(ModuleRegistry::new()),
                caps: Mutex::new(Vec::new()),
                req_hdrs: Mutex::new(req_hdrs),
                timer,
                ioqueue,
                event_queue,
                resolver,
                tpmgr,
                ioq_last_err: Mutex::new(None),
            }),
        }
    }
}
