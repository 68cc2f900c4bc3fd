//! Full subscribe/notify flow between two endpoints over loopback
//! transports, with packets ferried between the two wires the way a
//! network would.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use siplink::dialog::Dialog;
use siplink::endpoint::Endpoint;
use siplink::evsub::EvsubState;
use siplink::loopback::LoopTransport;
use siplink::msg::{Method, SipUri, StatusCode};
use siplink::presence::{NullPresUser, Pres, PresenceInfo, PresenceStatus};
use siplink::transport::Transport;

fn drain(endpt: &Endpoint) {
    while endpt.handle_events(Some(Duration::ZERO)).unwrap() > 0 {}
}

/// Carry everything one side sent onto the other side's wire.
fn ferry(from: &Arc<LoopTransport>, to: &Arc<LoopTransport>) -> usize {
    let sent = from.take_sent();
    let count = sent.len();
    for (bytes, _remote) in sent {
        to.deliver(bytes, "192.0.2.99:5060".parse().unwrap());
    }
    count
}

#[test]
fn subscribe_notify_roundtrip_between_endpoints() {
    // Watcher side.
    let (w_endpt, w_module) = common::presence_endpoint("watcher.example");
    let w_tp = LoopTransport::with_addr_name(
        "127.0.0.1:5060".parse().unwrap(),
        siplink::msg::HostPort::new("x.example", Some(5060)),
        w_endpt.event_queue().unwrap(),
    );
    {
        let endpt = w_endpt.clone();
        w_tp.set_rx_sink(move |rdata| {
            endpt.receive(rdata);
        });
    }
    let w_tp_dyn: Arc<dyn Transport> = w_tp.clone();
    let w_handle = w_endpt.transports().register_transport(w_tp_dyn).unwrap();

    // Notifier side: the sink is the application layer, admitting
    // dialog-initiating SUBSCRIBEs and answering them; everything else
    // goes through the regular module walk.
    let (n_endpt, n_module) = common::presence_endpoint("presentity.example");
    let n_tp = LoopTransport::with_addr_name(
        "127.0.0.1:5061".parse().unwrap(),
        siplink::msg::HostPort::new("y.example", Some(5060)),
        n_endpt.event_queue().unwrap(),
    );
    let n_tp_dyn: Arc<dyn Transport> = n_tp.clone();
    let n_handle = n_endpt.transports().register_transport(n_tp_dyn).unwrap();

    let n_pres: Arc<Mutex<Option<Pres>>> = Arc::new(Mutex::new(None));
    {
        let endpt = n_endpt.clone();
        let module = n_module.clone();
        let admitted = n_pres.clone();
        let handle = n_handle.clone();
        n_tp.set_rx_sink(move |rdata| {
            let is_initial_subscribe = rdata
                .msg()
                .is_some_and(|m| m.method() == Some(&Method::Subscribe))
                && rdata.views().to_tag.is_none();
            if !is_initial_subscribe {
                endpt.receive(rdata);
                return;
            }

            let dlg = Dialog::create_uas(&endpt, &rdata).unwrap();
            let pres =
                Pres::create_uas(&module, dlg, Arc::new(NullPresUser), &rdata).unwrap();
            pres.set_status(&PresenceStatus {
                info: vec![PresenceInfo {
                    id: "pc".into(),
                    contact: "sip:presentity@y.example".into(),
                    basic_open: true,
                }],
            })
            .unwrap();
            pres.sub()
                .set_transport(handle.clone(), rdata.src_addr());

            pres.accept(&rdata, StatusCode::ACCEPTED, &[]).unwrap();
            let tdata = pres.notify(EvsubState::Active, None, None).unwrap();
            pres.send_request(&tdata).unwrap();
            *admitted.lock().unwrap() = Some(pres);
        });
    }

    // The watcher subscribes.
    let dlg = Dialog::create_uac(
        &w_endpt,
        SipUri::new(Some("watcher"), "x.example", None),
        SipUri::new(Some("presentity"), "y.example", None),
    );
    let w_pres = Pres::create_uac(&w_module, dlg, Arc::new(NullPresUser)).unwrap();
    w_pres
        .sub()
        .set_transport(w_handle, "192.0.2.99:5060".parse().unwrap());
    let tdata = w_pres.initiate(300).unwrap();
    w_pres.send_request(&tdata).unwrap();
    assert_eq!(w_pres.sub().state(), EvsubState::Sent);

    // SUBSCRIBE crosses the wire; the notifier admits it and emits 202
    // plus an immediate NOTIFY.
    assert_eq!(ferry(&w_tp, &n_tp), 1);
    drain(&n_endpt);

    let n_side = n_pres.lock().unwrap().clone().unwrap();
    assert_eq!(n_side.sub().state(), EvsubState::Active);
    assert_eq!(n_side.sub().expires(), 300);

    // The 202 and the NOTIFY reach the watcher.
    assert_eq!(ferry(&n_tp, &w_tp), 2);
    drain(&w_endpt);

    assert_eq!(w_pres.sub().state(), EvsubState::Active);
    let status = w_pres.status();
    assert_eq!(status.info.len(), 1);
    assert_eq!(status.info[0].contact, "sip:presentity@y.example");
    assert!(status.info[0].basic_open);

    // The watcher answered the NOTIFY with a 200.
    let answered = ferry(&w_tp, &n_tp);
    assert_eq!(answered, 1);
    drain(&n_endpt);

    // Both dialogs agree on the identity triple by now.
    let w_dlg = w_pres.sub().dialog();
    let n_dlg = n_side.sub().dialog();
    assert_eq!(w_dlg.call_id(), n_dlg.call_id());
    assert_eq!(w_dlg.local_tag(), n_dlg.remote_tag());
    assert_eq!(w_dlg.remote_tag(), n_dlg.local_tag());
}
