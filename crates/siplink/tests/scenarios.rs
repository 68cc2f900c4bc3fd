//! Endpoint dispatch scenarios: module priorities, response sent-by
//! checking, and timer/I-O fairness in the event loop.

mod common;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use siplink::buffer::RxData;
use siplink::config::MAX_NET_EVENTS;
use siplink::endpoint::Endpoint;
use siplink::ioqueue::{EventQueue, IoQueue};
use siplink::loopback::LoopTransport;
use siplink::module::Module;
use siplink::msg::{
    CSeq, Header, HostPort, Message, Method, NameAddr, SipUri, StatusCode, Via,
};
use siplink::transport::Transport;

/// A module that records the rx walk and optionally claims messages.
struct Probe {
    name: String,
    priority: u32,
    claims: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl Probe {
    fn new(name: &str, priority: u32, claims: bool, log: &Arc<Mutex<Vec<String>>>) -> Arc<Probe> {
        Arc::new(Probe {
            name: name.into(),
            priority,
            claims,
            log: log.clone(),
        })
    }
}

impl Module for Probe {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn on_rx_request(&self, _endpt: &Endpoint, _rdata: &RxData) -> bool {
        self.log.lock().unwrap().push(self.name.clone());
        self.claims
    }

    fn on_rx_response(&self, _endpt: &Endpoint, _rdata: &RxData) -> bool {
        self.log.lock().unwrap().push(self.name.clone());
        self.claims
    }
}

fn base_request() -> Message {
    let mut msg = Message::request(Method::Options, SipUri::new(Some("a"), "x.example", None));
    msg.headers.push(Header::Via(Via::new(
        "UDP",
        HostPort::new("y.example", Some(5060)),
        "z9hG4bK-s1".into(),
    )));
    let mut from = NameAddr::new(SipUri::new(Some("b"), "y.example", None));
    from.set_tag("ft");
    msg.headers
        .push(Header::From(from));
    msg.headers
        .push(Header::To(NameAddr::new(SipUri::new(Some("a"), "x.example", None))));
    msg.headers.push(Header::CallId("scen-1".into()));
    msg.headers.push(Header::CSeq(CSeq {
        seq: 1,
        method: Method::Options,
    }));
    msg
}

fn base_response(via: Via) -> Message {
    let mut msg = Message::response(StatusCode::OK, None);
    msg.headers.push(Header::Via(via));
    let mut from = NameAddr::new(SipUri::new(Some("a"), "x.example", None));
    from.set_tag("ft");
    msg.headers.push(Header::From(from));
    let mut to = NameAddr::new(SipUri::new(Some("b"), "y.example", None));
    to.set_tag("tt");
    msg.headers.push(Header::To(to));
    msg.headers.push(Header::CallId("scen-2".into()));
    msg.headers.push(Header::CSeq(CSeq {
        seq: 1,
        method: Method::Options,
    }));
    msg
}

#[test]
fn registration_order_vs_priority() {
    common::init_tracing();
    let endpt = Endpoint::builder().name("scen").build();
    let log = Arc::new(Mutex::new(Vec::new()));

    // A and C claim requests, B declines; B has the lowest priority.
    endpt
        .register_module(Probe::new("mod-a", 10, true, &log))
        .unwrap();
    endpt
        .register_module(Probe::new("mod-b", 5, false, &log))
        .unwrap();
    endpt
        .register_module(Probe::new("mod-c", 10, true, &log))
        .unwrap();

    let names: Vec<String> = endpt
        .modules_snapshot()
        .into_iter()
        .map(|(_, name, _)| name)
        .collect();
    assert_eq!(names, vec!["mod-b", "mod-a", "mod-c"]);

    let handled = endpt.receive(common::rdata(base_request()));
    assert!(handled);
    // B is offered the request first and declines, A claims it, C is
    // never called.
    assert_eq!(*log.lock().unwrap(), vec!["mod-b", "mod-a"]);
}

#[test]
fn response_dropped_on_sent_by_mismatch_when_strict() {
    common::init_tracing();
    let endpt = Endpoint::builder().name("scen").strict_sent_by(true).build();
    let log = Arc::new(Mutex::new(Vec::new()));
    endpt
        .register_module(Probe::new("mod-resp", 10, true, &log))
        .unwrap();

    let queue = Arc::new(EventQueue::new());
    let tp = LoopTransport::with_addr_name(
        "127.0.0.1:5060".parse().unwrap(),
        HostPort::new("right.example", Some(5060)),
        queue,
    );
    let tp_dyn: Arc<dyn Transport> = tp;

    // sent-by host disagrees with the transport, no rport to rescue it
    let via = Via::new("UDP", HostPort::new("wrong.example", Some(5060)), "z9hG4bK-s5".into());
    let handled = endpt.receive(common::rdata_on(base_response(via), &tp_dyn));
    assert!(!handled, "mismatched response must be dropped silently");
    assert!(log.lock().unwrap().is_empty(), "no module dispatch happened");
}

#[test]
fn response_host_mismatch_tolerated_by_default() {
    common::init_tracing();
    let endpt = Endpoint::builder().name("scen").build();
    let log = Arc::new(Mutex::new(Vec::new()));
    endpt
        .register_module(Probe::new("mod-resp", 10, true, &log))
        .unwrap();

    let queue = Arc::new(EventQueue::new());
    let tp = LoopTransport::with_addr_name(
        "127.0.0.1:5060".parse().unwrap(),
        HostPort::new("right.example", Some(5060)),
        queue,
    );
    let tp_dyn: Arc<dyn Transport> = tp;

    let via = Via::new("UDP", HostPort::new("wrong.example", Some(5060)), "z9hG4bK-s5".into());
    let handled = endpt.receive(common::rdata_on(base_response(via), &tp_dyn));
    assert!(handled, "lenient mode lets the host mismatch through");
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn response_dropped_on_port_mismatch_without_rport() {
    common::init_tracing();
    let endpt = Endpoint::builder().name("scen").build();
    let log = Arc::new(Mutex::new(Vec::new()));
    endpt
        .register_module(Probe::new("mod-resp", 10, true, &log))
        .unwrap();

    let queue = Arc::new(EventQueue::new());
    let tp = LoopTransport::with_addr_name(
        "127.0.0.1:5060".parse().unwrap(),
        HostPort::new("right.example", Some(5060)),
        queue,
    );
    let tp_dyn: Arc<dyn Transport> = tp;

    // host matches but the port is wrong and there is no rport
    let via = Via::new("UDP", HostPort::new("right.example", Some(5062)), "z9hG4bK-s5".into());
    assert!(!endpt.receive(common::rdata_on(base_response(via), &tp_dyn)));
    assert!(log.lock().unwrap().is_empty());

    // the same wrong port with a correct rport is let through
    let mut via = Via::new("UDP", HostPort::new("right.example", Some(5062)), "z9hG4bK-s5".into());
    via.params.push(("rport".into(), Some("5060".into())));
    assert!(endpt.receive(common::rdata_on(base_response(via), &tp_dyn)));
    assert_eq!(log.lock().unwrap().len(), 1);
}

/// An I/O queue that always has another event ready.
struct BusyQueue {
    events: AtomicUsize,
}

impl IoQueue for BusyQueue {
    fn poll(&self, _timeout: Option<Duration>) -> io::Result<usize> {
        self.events.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }
}

#[test]
fn timers_run_before_bounded_io_drain() {
    common::init_tracing();
    let busy = Arc::new(BusyQueue {
        events: AtomicUsize::new(0),
    });
    let endpt = Endpoint::builder()
        .name("scen")
        .io_queue(busy.clone())
        .build();

    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let fired = fired.clone();
        endpt
            .schedule_timer(Duration::ZERO, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    std::thread::sleep(Duration::from_millis(2));

    let count = endpt.handle_events(None).unwrap();

    // All five timer callbacks ran, and the continuously readable queue
    // was drained at most MAX_NET_EVENTS times before returning.
    assert_eq!(fired.load(Ordering::SeqCst), 5);
    assert_eq!(busy.events.load(Ordering::SeqCst), MAX_NET_EVENTS);
    assert_eq!(count, 5 + MAX_NET_EVENTS);
}

/// A queue whose poll fails like the OS would.
struct FailingQueue;

impl IoQueue for FailingQueue {
    fn poll(&self, _timeout: Option<Duration>) -> io::Result<usize> {
        Err(io::Error::other("poll exploded"))
    }
}

#[test]
fn poll_error_surfaces_and_endpoint_survives() {
    common::init_tracing();
    let endpt = Endpoint::builder()
        .name("scen")
        .io_queue(Arc::new(FailingQueue))
        .build();

    assert!(endpt.handle_events(Some(Duration::ZERO)).is_err());

    // The endpoint stays usable: timers still run on the next turn.
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    endpt
        .schedule_timer(Duration::ZERO, move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    std::thread::sleep(Duration::from_millis(2));
    let _ = endpt.handle_events(Some(Duration::ZERO));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
