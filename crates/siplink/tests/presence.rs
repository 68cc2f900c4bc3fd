//! Presence package scenarios: notifier admission, NOTIFY bodies in
//! both directions, and the tentative/committed status handshake.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use siplink::Error;
use siplink::buffer::RxData;
use siplink::dialog::Dialog;
use siplink::endpoint::Endpoint;
use siplink::evsub::{Evsub, EvsubState, NotifyResponse};
use siplink::loopback::LoopTransport;
use siplink::msg::{
    Body, CSeq, ContentType, Header, HostPort, Message, Method, NameAddr, SipUri, StatusCode,
    SubscriptionState, Via,
};
use siplink::presence::{
    NullPresUser, Pres, PresContent, PresUser, PresenceInfo, PresenceStatus,
};
use siplink::transport::Transport;

use common::{SubscribeOpts, presence_endpoint, rdata, rdata_on, subscribe_msg};

fn admitted(
    endpt: &Endpoint,
    module: &Arc<siplink::evsub::EvsubModule>,
    opts: SubscribeOpts,
) -> Result<(Pres, RxData), Error> {
    let rx = rdata(subscribe_msg(opts));
    let dlg = Dialog::create_uas(endpt, &rx)?;
    let pres = Pres::create_uas(module, dlg, Arc::new(NullPresUser), &rx)?;
    Ok((pres, rx))
}

#[test]
fn notifier_admits_pidf_subscription() {
    let (endpt, module) = presence_endpoint("notifier.example");
    let (pres, _rx) = admitted(&endpt, &module, SubscribeOpts::default()).unwrap();

    assert_eq!(pres.content(), PresContent::Pidf);
    assert_eq!(pres.sub().expires(), 300);
    assert_eq!(pres.sub().state(), EvsubState::Accepted);

    // Once a status is published, the NOTIFY body is PIDF.
    pres.set_status(&PresenceStatus::basic(true)).unwrap();
    let tdata = pres.notify(EvsubState::Active, None, None).unwrap();
    let text = String::from_utf8(tdata.print().unwrap().to_vec()).unwrap();
    assert!(text.contains("Content-Type: application/pidf+xml"));
    assert!(text.contains("Subscription-State: active;expires=300"));
    assert!(text.contains("entity=\"sip:presentity@y.example\""));
    assert!(text.contains("<basic>open</basic>"));
    assert_eq!(pres.sub().state(), EvsubState::Active);
}

#[test]
fn notifier_defaults_to_pidf_without_accept() {
    let (endpt, module) = presence_endpoint("notifier.example");
    let opts = SubscribeOpts {
        accept: None,
        ..Default::default()
    };
    let (pres, _rx) = admitted(&endpt, &module, opts).unwrap();
    assert_eq!(pres.content(), PresContent::Pidf);
}

#[cfg(feature = "xpidf")]
#[test]
fn notifier_negotiates_xpidf_when_offered_first() {
    let (endpt, module) = presence_endpoint("notifier.example");
    let opts = SubscribeOpts {
        accept: Some(vec!["application/xpidf+xml".into()]),
        ..Default::default()
    };
    let (pres, _rx) = admitted(&endpt, &module, opts).unwrap();
    assert_eq!(pres.content(), PresContent::Xpidf);

    pres.set_status(&PresenceStatus::basic(false)).unwrap();
    let tdata = pres.notify(EvsubState::Active, None, None).unwrap();
    let text = String::from_utf8(tdata.print().unwrap().to_vec()).unwrap();
    assert!(text.contains("Content-Type: application/xpidf+xml"));
    assert!(text.contains("<presentity"));
}

#[test]
fn notifier_rejects_interval_too_brief() {
    let (endpt, module) = presence_endpoint("notifier.example");
    let opts = SubscribeOpts {
        expires: Some(4),
        ..Default::default()
    };
    let err = admitted(&endpt, &module, opts).unwrap_err();
    assert!(matches!(err, Error::IntervalTooBrief { min: 5 }));
    assert_eq!(err.status_code(), Some(StatusCode::INTERVAL_TOO_BRIEF));
}

#[test]
fn notifier_rejects_unknown_event_package() {
    let (endpt, module) = presence_endpoint("notifier.example");
    let opts = SubscribeOpts {
        event: Some("winfo".into()),
        ..Default::default()
    };
    let err = admitted(&endpt, &module, opts).unwrap_err();
    assert!(matches!(err, Error::BadEvent(ref pkg) if pkg == "winfo"));
    assert_eq!(err.status_code(), Some(StatusCode::BAD_EVENT));
}

#[test]
fn notifier_rejects_unsupported_accept_list() {
    let (endpt, module) = presence_endpoint("notifier.example");
    let opts = SubscribeOpts {
        accept: Some(vec!["application/cpim-pidf+xml".into()]),
        ..Default::default()
    };
    let err = admitted(&endpt, &module, opts).unwrap_err();
    assert!(matches!(err, Error::NotAcceptable));
    assert_eq!(err.status_code(), Some(StatusCode::NOT_ACCEPTABLE));
}

#[test]
fn notify_requires_presence_info() {
    let (endpt, module) = presence_endpoint("notifier.example");
    let (pres, _rx) = admitted(&endpt, &module, SubscribeOpts::default()).unwrap();
    let err = pres.notify(EvsubState::Active, None, None).unwrap_err();
    assert!(matches!(err, Error::NoPresenceInfo));
}

#[test]
fn set_status_generates_missing_tuple_ids() {
    let (endpt, module) = presence_endpoint("notifier.example");
    let (pres, _rx) = admitted(&endpt, &module, SubscribeOpts::default()).unwrap();

    pres.set_status(&PresenceStatus {
        info: vec![
            PresenceInfo {
                id: String::new(),
                contact: "sip:a@x".into(),
                basic_open: true,
            },
            PresenceInfo {
                id: "fixed".into(),
                contact: String::new(),
                basic_open: false,
            },
        ],
    })
    .unwrap();

    let status = pres.status();
    assert!(!status.info[0].id.is_empty());
    assert_eq!(status.info[1].id, "fixed");
}

// ---------------------------------------------------------------------
// Subscriber-side NOTIFY processing
// ---------------------------------------------------------------------

/// A watcher application that records what it saw inside the NOTIFY
/// hook and optionally refuses the NOTIFY.
struct WatcherApp {
    seen_in_hook: Mutex<Vec<PresenceStatus>>,
    refuse: Mutex<bool>,
}

impl WatcherApp {
    fn new() -> Arc<WatcherApp> {
        Arc::new(WatcherApp {
            seen_in_hook: Mutex::new(Vec::new()),
            refuse: Mutex::new(false),
        })
    }
}

impl PresUser for WatcherApp {
    fn on_rx_notify(&self, sub: &Arc<Evsub>, _rdata: &RxData, resp: &mut NotifyResponse) {
        let pres = Pres::from_sub(sub.clone()).unwrap();
        // While the hook runs, the tentative status is what reads back.
        self.seen_in_hook.lock().unwrap().push(pres.status());
        if *self.refuse.lock().unwrap() {
            resp.code = StatusCode::BAD_REQUEST;
        }
    }
}

struct WatcherSide {
    endpt: Endpoint,
    pres: Pres,
    app: Arc<WatcherApp>,
    tp: Arc<LoopTransport>,
    tp_dyn: Arc<dyn Transport>,
}

/// A subscriber that has sent SUBSCRIBE and seen the 200, so NOTIFYs
/// are in-dialog.
fn watcher_side() -> WatcherSide {
    let (endpt, module) = presence_endpoint("watcher.example");
    let queue = endpt.event_queue().unwrap();
    let tp = LoopTransport::new("127.0.0.1:5060".parse().unwrap(), queue);
    let tp_dyn: Arc<dyn Transport> = tp.clone();

    let dlg = Dialog::create_uac(
        &endpt,
        SipUri::new(Some("watcher"), "x.example", None),
        SipUri::new(Some("presentity"), "y.example", None),
    );
    let app = WatcherApp::new();
    let pres = Pres::create_uac(&module, dlg, app.clone()).unwrap();

    let tdata = pres.initiate(300).unwrap();
    pres.send_request(&tdata).unwrap();
    assert_eq!(pres.sub().state(), EvsubState::Sent);

    // 200 to the SUBSCRIBE moves the subscription to ACCEPTED.
    let ok = {
        let dlg = pres.sub().dialog();
        let mut msg = Message::response(StatusCode::OK, None);
        msg.headers.push(Header::Via(Via::new(
            "UDP",
            HostPort::new("x.example", Some(5060)),
            "z9hG4bK-r".into(),
        )));
        msg.headers.push(Header::From(dlg.local()));
        let mut to = dlg.remote();
        to.set_tag("notifier-tag-1");
        msg.headers.push(Header::To(to));
        msg.headers.push(Header::CallId(dlg.call_id()));
        msg.headers.push(Header::CSeq(CSeq {
            seq: 1,
            method: Method::Subscribe,
        }));
        msg.headers.push(Header::Expires(300));
        msg
    };
    assert!(endpt.receive(rdata_on(ok, &tp_dyn)));
    assert_eq!(pres.sub().state(), EvsubState::Accepted);

    WatcherSide {
        endpt,
        pres,
        app,
        tp,
        tp_dyn,
    }
}

fn notify_msg(pres: &Pres, body: Option<Body>, cseq: u32) -> Message {
    let dlg = pres.sub().dialog();
    let mut msg = Message::request(
        Method::Notify,
        SipUri::new(Some("watcher"), "x.example", None),
    );
    msg.headers.push(Header::Via(Via::new(
        "UDP",
        HostPort::new("y.example", Some(5060)),
        "z9hG4bK-n".into(),
    )));
    let mut from = dlg.remote();
    from.set_tag("notifier-tag-1");
    msg.headers.push(Header::From(from));
    msg.headers.push(Header::To(dlg.local()));
    msg.headers.push(Header::CallId(dlg.call_id()));
    msg.headers.push(Header::CSeq(CSeq {
        seq: cseq,
        method: Method::Notify,
    }));
    msg.headers.push(Header::Event(siplink::msg::EventHdr::new("presence")));
    msg.headers.push(Header::SubscriptionState(SubscriptionState::active(240)));
    if let Some(body) = body {
        msg.set_body(body);
    }
    msg
}

fn pidf_body(tuples: &[(&str, &str, bool)]) -> Body {
    let mut doc = siplink::pidf::create("sip:presentity@y.example");
    for (id, contact, open) in tuples {
        let tuple = siplink::pidf::add_tuple(&mut doc, id);
        if !contact.is_empty() {
            siplink::pidf::set_contact(tuple, contact);
        }
        siplink::pidf::set_basic(tuple, *open);
    }
    Body::new(ContentType::pidf(), doc)
}

#[test]
fn notify_commits_tentative_status_on_2xx() {
    let side = watcher_side();

    let body = pidf_body(&[("id1", "sip:a@x", true), ("id2", "sip:b@y", false)]);
    let msg = notify_msg(&side.pres, Some(body), 1);
    assert!(side.endpt.receive(rdata_on(msg, &side.tp_dyn)));

    // The hook observed the tentative status; it is now committed.
    let seen = side.app.seen_in_hook.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].info.len(), 2);
    assert_eq!(seen[0], side.pres.status());

    let status = side.pres.status();
    assert_eq!(status.info[0].id, "id1");
    assert_eq!(status.info[0].contact, "sip:a@x");
    assert!(status.info[0].basic_open);
    assert_eq!(status.info[1].id, "id2");
    assert!(!status.info[1].basic_open);

    assert_eq!(side.pres.sub().state(), EvsubState::Active);

    // The 200 went out on the arrival transport.
    let sent = side.tp.take_sent();
    assert!(common::find_sent(&sent, "SIP/2.0 200").is_some());
}

#[test]
fn notify_refused_by_hook_keeps_committed_status() {
    let side = watcher_side();

    let first = notify_msg(&side.pres, Some(pidf_body(&[("id1", "sip:a@x", true)])), 1);
    assert!(side.endpt.receive(rdata_on(first, &side.tp_dyn)));
    let committed = side.pres.status();
    assert_eq!(committed.info.len(), 1);

    *side.app.refuse.lock().unwrap() = true;
    let second = notify_msg(&side.pres, Some(pidf_body(&[("id9", "sip:z@z", false)])), 2);
    assert!(side.endpt.receive(rdata_on(second, &side.tp_dyn)));

    // Refused NOTIFY: tentative status was visible in the hook but was
    // not committed, and the tentative flag is clear again.
    let seen = side.app.seen_in_hook.lock().unwrap();
    assert_eq!(seen[1].info[0].id, "id9");
    assert_eq!(side.pres.status(), committed);

    let sent = side.tp.take_sent();
    assert!(common::find_sent(&sent, "SIP/2.0 400").is_some());
}

#[test]
fn notify_with_unsupported_content_answers_406() {
    let side = watcher_side();

    let body = Body::new(
        ContentType::new("application", "cpim-pidf+xml"),
        bytes::Bytes::from_static(b"<pidf/>"),
    );
    let msg = notify_msg(&side.pres, Some(body), 1);
    assert!(side.endpt.receive(rdata_on(msg, &side.tp_dyn)));

    let sent = side.tp.take_sent();
    let resp = common::find_sent(&sent, "SIP/2.0 406 Not Acceptable Here").unwrap();
    assert!(resp.contains("Accept: application/pidf+xml, application/xpidf+xml"));
    assert!(resp.contains("Warning: 399 watcher.example"));

    // The subscription state is untouched and nothing was committed.
    assert_eq!(side.pres.sub().state(), EvsubState::Accepted);
    assert!(side.pres.status().info.is_empty());
    assert!(side.app.seen_in_hook.lock().unwrap().is_empty());
}

#[test]
fn notify_without_body_answers_400_with_warning() {
    let side = watcher_side();

    let msg = notify_msg(&side.pres, None, 1);
    assert!(side.endpt.receive(rdata_on(msg, &side.tp_dyn)));

    let sent = side.tp.take_sent();
    let resp = common::find_sent(&sent, "SIP/2.0 400").unwrap();
    assert!(resp.contains("Warning: 399 watcher.example \"Message body is not present\""));
}

#[cfg(feature = "xpidf")]
#[test]
fn notify_with_xpidf_body_yields_single_tuple() {
    let side = watcher_side();

    let body = Body::new(
        ContentType::xpidf(),
        siplink::xpidf::create("sip:presentity@y.example", true),
    );
    let msg = notify_msg(&side.pres, Some(body), 1);
    assert!(side.endpt.receive(rdata_on(msg, &side.tp_dyn)));

    let status = side.pres.status();
    assert_eq!(status.info.len(), 1);
    assert_eq!(status.info[0].contact, "sip:presentity@y.example");
    assert!(status.info[0].basic_open);
    assert!(status.info[0].id.is_empty());
}

// ---------------------------------------------------------------------
// Refresh handling on the notifier side
// ---------------------------------------------------------------------

fn refresh_msg(pres: &Pres, expires: u32, cseq: u32) -> Message {
    let dlg = pres.sub().dialog();
    let mut msg = Message::request(
        Method::Subscribe,
        SipUri::new(Some("presentity"), "y.example", None),
    );
    msg.headers.push(Header::Via(Via::new(
        "UDP",
        HostPort::new("x.example", Some(5060)),
        "z9hG4bK-rf".into(),
    )));
    msg.headers.push(Header::From(dlg.remote()));
    msg.headers.push(Header::To(dlg.local()));
    msg.headers.push(Header::CallId(dlg.call_id()));
    msg.headers.push(Header::CSeq(CSeq {
        seq: cseq,
        method: Method::Subscribe,
    }));
    msg.headers.push(Header::Event(siplink::msg::EventHdr::new("presence")));
    msg.headers.push(Header::Expires(expires));
    msg
}

#[test]
fn unsubscribe_triggers_terminating_notify_with_body() {
    let (endpt, module) = presence_endpoint("notifier.example");
    let queue = endpt.event_queue().unwrap();
    let tp = LoopTransport::new("127.0.0.1:5062".parse().unwrap(), queue);
    let tp_dyn: Arc<dyn Transport> = tp.clone();

    let (pres, _rx) = admitted(&endpt, &module, SubscribeOpts::default()).unwrap();
    pres.set_status(&PresenceStatus::basic(true)).unwrap();

    // Attach the wire so package-emitted NOTIFYs are observable.
    let handle = endpt.transports().register_transport(tp_dyn.clone()).unwrap();
    pres.sub()
        .set_transport(handle, "192.0.2.50:5060".parse().unwrap());

    // A refresh with Expires: 0 unsubscribes; the package default sends
    // the terminating NOTIFY.
    let msg = refresh_msg(&pres, 0, 2);
    assert!(endpt.receive(rdata_on(msg, &tp_dyn)));

    assert_eq!(pres.sub().state(), EvsubState::Terminated);
    assert_eq!(pres.sub().termination_reason().as_deref(), Some("timeout"));

    let sent = tp.take_sent();
    let notify = common::find_sent(&sent, "NOTIFY").unwrap();
    assert!(notify.contains("Subscription-State: terminated;reason=timeout"));
    assert!(notify.contains("Content-Type: application/pidf+xml"));
    let ok = common::find_sent(&sent, "SIP/2.0 200").unwrap();
    assert!(ok.contains("Expires: 0"));
}

#[test]
fn refresh_resets_expiry_and_sends_current_notify() {
    let (endpt, module) = presence_endpoint("notifier.example");
    let queue = endpt.event_queue().unwrap();
    let tp = LoopTransport::new("127.0.0.1:5063".parse().unwrap(), queue);
    let tp_dyn: Arc<dyn Transport> = tp.clone();

    let (pres, _rx) = admitted(&endpt, &module, SubscribeOpts::default()).unwrap();
    pres.set_status(&PresenceStatus::basic(true)).unwrap();
    let handle = endpt.transports().register_transport(tp_dyn.clone()).unwrap();
    pres.sub()
        .set_transport(handle, "192.0.2.50:5060".parse().unwrap());

    // Move to ACTIVE first, as a notifier normally would.
    let tdata = pres.notify(EvsubState::Active, None, None).unwrap();
    pres.send_request(&tdata).unwrap();
    tp.take_sent();

    let msg = refresh_msg(&pres, 120, 2);
    assert!(endpt.receive(rdata_on(msg, &tp_dyn)));

    assert_eq!(pres.sub().expires(), 120);
    assert_eq!(pres.sub().state(), EvsubState::Active);

    let sent = tp.take_sent();
    let ok = common::find_sent(&sent, "SIP/2.0 200").unwrap();
    assert!(ok.contains("Expires: 120"));
    let notify = common::find_sent(&sent, "NOTIFY").unwrap();
    assert!(notify.contains("Subscription-State: active;expires=120"));
    assert!(notify.contains("<basic>open</basic>"));
}

// ---------------------------------------------------------------------
// Client-side automatic refresh
// ---------------------------------------------------------------------

#[test]
fn client_auto_refresh_resubscribes() {
    let side = watcher_side();

    // Attach a wire so the automatic SUBSCRIBE is observable, then
    // shrink the expiry so the refresh timer fires quickly: 6s expiry
    // refreshes 5s early, i.e. after one second.
    let handle = side
        .endpt
        .transports()
        .register_transport(side.tp_dyn.clone())
        .unwrap();
    side.pres
        .sub()
        .set_transport(handle, "192.0.2.50:5060".parse().unwrap());

    let mut msg = notify_msg(&side.pres, Some(pidf_body(&[("id1", "sip:a@x", true)])), 1);
    msg.headers.retain(|h| !matches!(h, Header::SubscriptionState(_)));
    msg.headers
        .push(Header::SubscriptionState(SubscriptionState::active(6)));
    assert!(side.endpt.receive(rdata_on(msg, &side.tp_dyn)));
    side.tp.take_sent();

    std::thread::sleep(Duration::from_millis(1100));
    side.endpt.handle_events(Some(Duration::ZERO)).unwrap();

    let sent = side.tp.take_sent();
    let resub = common::find_sent(&sent, "SUBSCRIBE").unwrap();
    assert!(resub.contains("Event: presence"));
    assert!(resub.contains("Expires: 600"));
    assert!(resub.contains("CSeq: 2 SUBSCRIBE"));
}
