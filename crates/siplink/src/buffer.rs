//! Transmit and receive message buffers.
//!
//! A [`TxData`] is shared by everything that may still need the printed
//! bytes (a retransmitting transaction, the transport write path); it is
//! held through `Arc`, and the printed wire form is cached until the
//! structured message mutates. An [`RxData`] lives for exactly one
//! dispatch turn: the transport fills it, the endpoint walks it through
//! the modules, and it is dropped.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::config::MAX_PKT_LEN;
use crate::error::{Error, Result};
use crate::msg::{CSeq, Message, NameAddr, Via};
use crate::parse;
use crate::transport::Transport;
use crate::util;

/// Outgoing message buffer with a cached wire representation.
pub struct TxData {
    obj_name: String,
    /// For responses: when the request being answered was received.
    rx_timestamp: Mutex<Option<Instant>>,
    msg: Mutex<Message>,
    print_cache: Mutex<Option<Bytes>>,
}

impl TxData {
    /// Wrap a message in a fresh shared buffer.
    pub fn new(msg: Message) -> Arc<TxData> {
        Arc::new(TxData {
            obj_name: util::unique_string("tdta"),
            rx_timestamp: Mutex::new(None),
            msg: Mutex::new(msg),
            print_cache: Mutex::new(None),
        })
    }

    /// Debug name of this buffer.
    pub fn obj_name(&self) -> &str {
        &self.obj_name
    }

    pub fn set_rx_timestamp(&self, ts: Instant) {
        *self.rx_timestamp.lock().unwrap() = Some(ts);
    }

    pub fn rx_timestamp(&self) -> Option<Instant> {
        *self.rx_timestamp.lock().unwrap()
    }

    /// Read the message.
    pub fn with_msg<R>(&self, f: impl FnOnce(&Message) -> R) -> R {
        f(&self.msg.lock().unwrap())
    }

    /// Mutate the message. The print cache is invalidated afterwards so
    /// the next send re-prints.
    pub fn modify_msg<R>(&self, f: impl FnOnce(&mut Message) -> R) -> R {
        let r = f(&mut self.msg.lock().unwrap());
        self.invalidate();
        r
    }

    /// Drop the cached wire bytes. Safe to call any number of times.
    pub fn invalidate(&self) {
        *self.print_cache.lock().unwrap() = None;
    }

    /// The cached wire bytes, if the cache is filled.
    pub fn cached(&self) -> Option<Bytes> {
        self.print_cache.lock().unwrap().clone()
    }

    /// Print the message to wire form, filling the cache if empty.
    pub fn print(&self) -> Result<Bytes> {
        let msg = self.msg.lock().unwrap();
        let mut cache = self.print_cache.lock().unwrap();
        if let Some(bytes) = &*cache {
            return Ok(bytes.clone());
        }
        let mut buf = BytesMut::new();
        msg.print_into(&mut buf)?;
        if buf.len() > MAX_PKT_LEN {
            return Err(Error::PacketTooLarge {
                len: buf.len(),
                max: MAX_PKT_LEN,
            });
        }
        let bytes = buf.freeze();
        *cache = Some(bytes.clone());
        Ok(bytes)
    }

    /// One-line description for log output.
    pub fn info(&self) -> String {
        format!("{} [{}]", self.with_msg(|m| m.info()), self.obj_name)
    }
}

impl fmt::Debug for TxData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxData")
            .field("obj_name", &self.obj_name)
            .field("cached", &self.print_cache.lock().unwrap().is_some())
            .finish_non_exhaustive()
    }
}

/// Header views cached off the parsed message when the buffer is built,
/// so dispatch code does not rescan the header list.
#[derive(Debug, Default, Clone)]
pub struct HeaderViews {
    pub call_id: Option<String>,
    pub from: Option<NameAddr>,
    pub from_tag: Option<String>,
    pub to: Option<NameAddr>,
    pub to_tag: Option<String>,
    /// Topmost Via.
    pub via: Option<Via>,
    pub cseq: Option<CSeq>,
}

impl HeaderViews {
    fn extract(msg: &Message) -> Self {
        let from = msg.headers.from().cloned();
        let to = msg.headers.to().cloned();
        HeaderViews {
            call_id: msg.headers.call_id().map(str::to_owned),
            from_tag: from.as_ref().and_then(|a| a.tag()).map(str::to_owned),
            to_tag: to.as_ref().and_then(|a| a.tag()).map(str::to_owned),
            from,
            to,
            via: msg.headers.via_top().cloned(),
            cseq: msg.headers.cseq().cloned(),
        }
    }
}

/// Incoming message buffer. Lifetime is one dispatch turn; modules may
/// borrow it during their hook but never own it.
pub struct RxData {
    timestamp: Instant,
    packet: Bytes,
    src_addr: SocketAddr,
    transport: Weak<dyn Transport>,
    msg: Option<Message>,
    parse_errors: Vec<String>,
    views: HeaderViews,
    tsx_key: Mutex<Option<String>>,
    /// Per-module scratch, keyed by module id. Cleared when dispatch
    /// returns, before the buffer is recycled.
    scratch: Mutex<HashMap<usize, String>>,
}

impl RxData {
    /// Build a receive buffer from an already-parsed message.
    pub fn new(msg: Message, src_addr: SocketAddr, transport: Weak<dyn Transport>) -> RxData {
        let views = HeaderViews::extract(&msg);
        RxData {
            timestamp: Instant::now(),
            packet: Bytes::new(),
            src_addr,
            transport,
            msg: Some(msg),
            parse_errors: Vec::new(),
            views,
            tsx_key: Mutex::new(None),
            scratch: Mutex::new(HashMap::new()),
        }
    }

    /// Build a receive buffer from raw wire bytes.
    ///
    /// Parse failures do not error out: the buffer is returned with no
    /// message and the failure recorded, so the endpoint can log the
    /// packet and drop it.
    pub fn from_wire(packet: Bytes, src_addr: SocketAddr, transport: Weak<dyn Transport>) -> RxData {
        let mut parse_errors = Vec::new();
        let msg = match std::str::from_utf8(&packet) {
            Ok(text) => match parse::parse_message(text) {
                Ok((msg, errors)) => {
                    parse_errors = errors;
                    Some(msg)
                }
                Err(e) => {
                    parse_errors.push(e.to_string());
                    None
                }
            },
            Err(_) => {
                parse_errors.push("packet is not valid UTF-8".into());
                None
            }
        };

        let views = msg.as_ref().map(HeaderViews::extract).unwrap_or_default();
        RxData {
            timestamp: Instant::now(),
            packet,
            src_addr,
            transport,
            msg,
            parse_errors,
            views,
            tsx_key: Mutex::new(None),
            scratch: Mutex::new(HashMap::new()),
        }
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn packet(&self) -> &Bytes {
        &self.packet
    }

    pub fn src_addr(&self) -> SocketAddr {
        self.src_addr
    }

    /// The transport this packet arrived on, if it is still alive.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.upgrade()
    }

    pub fn msg(&self) -> Option<&Message> {
        self.msg.as_ref()
    }

    pub fn parse_errors(&self) -> &[String] {
        &self.parse_errors
    }

    pub fn views(&self) -> &HeaderViews {
        &self.views
    }

    /// Names of the required base headers this message lacks, as an
    /// indicator string ("Call-ID From Via"), or `None` when complete.
    pub fn missing_headers(&self) -> Option<String> {
        let mut missing = Vec::new();
        if self.views.call_id.is_none() {
            missing.push("Call-ID");
        }
        if self.views.from.is_none() {
            missing.push("From");
        }
        if self.views.to.is_none() {
            missing.push("To");
        }
        if self.views.via.is_none() {
            missing.push("Via");
        }
        if self.views.cseq.is_none() {
            missing.push("CSeq");
        }
        if missing.is_empty() {
            None
        } else {
            Some(missing.join(" "))
        }
    }

    pub fn set_tsx_key(&self, key: String) {
        *self.tsx_key.lock().unwrap() = Some(key);
    }

    pub fn tsx_key(&self) -> Option<String> {
        self.tsx_key.lock().unwrap().clone()
    }

    /// Stash per-module scratch data for the duration of the dispatch.
    pub fn set_scratch(&self, module_id: usize, value: String) {
        self.scratch.lock().unwrap().insert(module_id, value);
    }

    pub fn scratch(&self, module_id: usize) -> Option<String> {
        self.scratch.lock().unwrap().get(&module_id).cloned()
    }

    /// Clear the scratch area. The endpoint calls this when dispatch
    /// returns, before the buffer is recycled.
    pub fn clear_scratch(&self) {
        self.scratch.lock().unwrap().clear();
    }

    /// One-line description for log output.
    pub fn info(&self) -> String {
        match &self.msg {
            Some(msg) => msg.info(),
            None => format!("unparsed packet ({} bytes)", self.packet.len()),
        }
    }
}

impl fmt::Debug for RxData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxData")
            .field("src_addr", &self.src_addr)
            .field("info", &self.info())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Header, HostPort, Method, SipUri};

    fn request() -> Message {
        let mut msg = Message::request(Method::Notify, SipUri::new(Some("a"), "x.example", None));
        msg.headers.push(Header::Via(Via::new(
            "UDP",
            HostPort::new("y.example", Some(5060)),
            "z9hG4bK-t".into(),
        )));
        let mut from = NameAddr::new(SipUri::new(Some("b"), "y.example", None));
        from.set_tag("ft");
        msg.headers.push(Header::From(from));
        msg.headers
            .push(Header::To(NameAddr::new(SipUri::new(Some("a"), "x.example", None))));
        msg.headers.push(Header::CallId("c1".into()));
        msg.headers.push(Header::CSeq(CSeq {
            seq: 7,
            method: Method::Notify,
        }));
        msg
    }

    #[test]
    fn test_print_cache_refreshes_after_mutation() {
        let tdata = TxData::new(request());
        assert!(tdata.cached().is_none());

        let first = tdata.print().unwrap();
        assert_eq!(tdata.cached().as_deref(), Some(first.as_ref()));

        // Mutation through modify_msg empties the cache.
        tdata.modify_msg(|m| {
            m.headers.push(Header::Expires(60));
        });
        assert!(tdata.cached().is_none());

        let second = tdata.print().unwrap();
        assert_ne!(first, second);
        assert!(std::str::from_utf8(&second).unwrap().contains("Expires: 60"));
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let tdata = TxData::new(request());
        tdata.print().unwrap();
        tdata.invalidate();
        let after_once = tdata.cached();
        tdata.invalidate();
        assert_eq!(after_once, tdata.cached());
        assert!(after_once.is_none());
    }

    #[test]
    fn test_rx_views_extracted() {
        let src = "198.51.100.2:5060".parse().unwrap();
        let rdata = RxData::new(request(), src, Weak::<crate::transport::NullTransport>::new());
        let views = rdata.views();
        assert_eq!(views.call_id.as_deref(), Some("c1"));
        assert_eq!(views.from_tag.as_deref(), Some("ft"));
        assert_eq!(views.to_tag, None);
        assert_eq!(views.cseq.as_ref().unwrap().seq, 7);
        assert!(rdata.missing_headers().is_none());
    }

    #[test]
    fn test_missing_headers_indicator() {
        let mut msg = Message::request(Method::Notify, SipUri::new(None, "x", None));
        msg.headers.push(Header::CallId("c".into()));
        let src = "198.51.100.2:5060".parse().unwrap();
        let rdata = RxData::new(msg, src, Weak::<crate::transport::NullTransport>::new());
        assert_eq!(rdata.missing_headers().as_deref(), Some("From To Via CSeq"));
    }

    #[test]
    fn test_from_wire_records_parse_failure() {
        let src = "198.51.100.2:5060".parse().unwrap();
        let rdata = RxData::from_wire(
            Bytes::from_static(b"not a sip message\r\n\r\n"),
            src,
            Weak::<crate::transport::NullTransport>::new(),
        );
        assert!(rdata.msg().is_none());
        assert!(!rdata.parse_errors().is_empty());
    }

    #[test]
    fn test_scratch_cleared() {
        let src = "198.51.100.2:5060".parse().unwrap();
        let rdata = RxData::new(request(), src, Weak::<crate::transport::NullTransport>::new());
        rdata.set_scratch(3, "tsx-key".into());
        assert_eq!(rdata.scratch(3).as_deref(), Some("tsx-key"));
        rdata.clear_scratch();
        assert_eq!(rdata.scratch(3), None);
    }
}
