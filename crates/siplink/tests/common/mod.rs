//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once, Weak};

use siplink::buffer::RxData;
use siplink::endpoint::Endpoint;
use siplink::evsub::EvsubModule;
use siplink::msg::{CSeq, Header, HostPort, Message, Method, NameAddr, SipUri, Via};
use siplink::presence;
use siplink::transport::{NullTransport, Transport};

static TRACING: Once = Once::new();

/// Install a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// An endpoint with the subscription module and presence package wired
/// up.
pub fn presence_endpoint(name: &str) -> (Endpoint, Arc<EvsubModule>) {
    init_tracing();
    let endpt = Endpoint::builder().name(name).build();
    let module = EvsubModule::new();
    presence::init(&module).unwrap();
    endpt.register_module(module.clone()).unwrap();
    (endpt, module)
}

pub fn src_addr() -> SocketAddr {
    "192.0.2.50:5060".parse().unwrap()
}

/// A dialog-initiating SUBSCRIBE from watcher@x.example towards
/// presentity@y.example.
pub struct SubscribeOpts {
    pub event: Option<String>,
    pub accept: Option<Vec<String>>,
    pub expires: Option<u32>,
}

impl Default for SubscribeOpts {
    fn default() -> Self {
        SubscribeOpts {
            event: Some("presence".into()),
            accept: Some(vec![
                "application/pidf+xml".into(),
                "application/xpidf+xml".into(),
            ]),
            expires: Some(300),
        }
    }
}

pub fn subscribe_msg(opts: SubscribeOpts) -> Message {
    let mut msg = Message::request(
        Method::Subscribe,
        SipUri::new(Some("presentity"), "y.example", None),
    );
    msg.headers.push(Header::Via(Via::new(
        "UDP",
        HostPort::new("x.example", Some(5060)),
        "z9hG4bK-sub-1".into(),
    )));
    let mut from = NameAddr::new(SipUri::new(Some("watcher"), "x.example", None));
    from.set_tag("watcher-tag-1");
    msg.headers.push(Header::From(from));
    msg.headers.push(Header::To(NameAddr::new(SipUri::new(
        Some("presentity"),
        "y.example",
        None,
    ))));
    msg.headers.push(Header::CallId("sub-call-1".into()));
    msg.headers.push(Header::CSeq(CSeq {
        seq: 1,
        method: Method::Subscribe,
    }));
    msg.headers.push(Header::Contact(NameAddr::new(SipUri::new(
        Some("watcher"),
        "x.example",
        None,
    ))));
    if let Some(event) = opts.event {
        msg.headers
            .push(Header::Event(siplink::msg::EventHdr::new(&event)));
    }
    if let Some(accept) = opts.accept {
        msg.headers.push(Header::Accept(accept));
    }
    if let Some(expires) = opts.expires {
        msg.headers.push(Header::Expires(expires));
    }
    msg
}

/// Wrap a message in a receive buffer with no live transport.
pub fn rdata(msg: Message) -> RxData {
    RxData::new(msg, src_addr(), Weak::<NullTransport>::new())
}

/// Wrap a message in a receive buffer arriving on `tp`.
pub fn rdata_on(msg: Message, tp: &Arc<dyn Transport>) -> RxData {
    RxData::new(msg, src_addr(), Arc::downgrade(tp))
}

/// First sent packet whose start-line begins with `prefix`, as text.
pub fn find_sent(sent: &[(bytes::Bytes, Option<SocketAddr>)], prefix: &str) -> Option<String> {
    sent.iter()
        .map(|(bytes, _)| String::from_utf8_lossy(bytes).into_owned())
        .find(|text| text.starts_with(prefix))
}
