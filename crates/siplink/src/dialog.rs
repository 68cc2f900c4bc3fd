//! Minimal dialog surface for subscriptions.
//!
//! The full dialog layer is an external consumer of the module
//! interface; what lives here is the slice the subscription engine
//! needs: the dialog identity triple (Call-ID plus both tags), the local
//! CSeq counter, the remote target and route set, and request
//! templating. The dialog owns the lock that serializes subscription
//! state; hooks run without it, so state reads from inside a hook are
//! advisory.

use std::sync::{Arc, Mutex};

use crate::buffer::{RxData, TxData};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::msg::{CSeq, Header, Message, Method, NameAddr, SipUri, Via};
use crate::util;

/// Routing and identity key of a dialog: Call-ID plus the local tag.
/// In-dialog requests match on (Call-ID, to-tag), responses on
/// (Call-ID, from-tag); both resolve to the local tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogKey {
    pub call_id: String,
    pub local_tag: String,
}

struct DialogState {
    local: NameAddr,
    remote: NameAddr,
    call_id: String,
    local_cseq: u32,
    remote_cseq: Option<u32>,
    /// Request target: the peer's Contact once known, else its URI.
    target: SipUri,
    route_set: Vec<NameAddr>,
    local_contact: NameAddr,
}

/// A peer-to-peer signaling relationship.
pub struct Dialog {
    endpt: Endpoint,
    state: Mutex<DialogState>,
}

impl Dialog {
    /// Start a dialog as the caller: fresh Call-ID and local tag, remote
    /// side untagged until a dialog-establishing response arrives.
    pub fn create_uac(endpt: &Endpoint, local_uri: SipUri, remote_uri: SipUri) -> Arc<Dialog> {
        let mut local = NameAddr::new(local_uri.clone());
        local.set_tag(util::unique_string("tag"));
        let remote = NameAddr::new(remote_uri.clone());

        Arc::new(Dialog {
            endpt: endpt.clone(),
            state: Mutex::new(DialogState {
                local: local.clone(),
                remote,
                call_id: util::unique_string("cid"),
                local_cseq: 0,
                remote_cseq: None,
                target: remote_uri,
                route_set: Vec::new(),
                local_contact: NameAddr::new(local_uri),
            }),
        })
    }

    /// Establish a dialog from a received dialog-initiating request. The
    /// local side is the request's To identity with a generated tag; the
    /// route set is captured from Record-Route as received.
    pub fn create_uas(endpt: &Endpoint, rdata: &RxData) -> Result<Arc<Dialog>> {
        let msg = rdata
            .msg()
            .ok_or_else(|| Error::InvalidArg("no parsed message in rx buffer".into()))?;
        let views = rdata.views();

        let (Some(to), Some(from), Some(call_id)) =
            (&views.to, &views.from, &views.call_id)
        else {
            return Err(Error::MissingHeader(
                rdata.missing_headers().unwrap_or_default(),
            ));
        };

        let mut local = to.clone();
        local.set_tag(util::unique_string("tag"));

        let target = msg
            .headers
            .contact()
            .map(|c| c.uri.clone())
            .unwrap_or_else(|| from.uri.clone());

        Ok(Arc::new(Dialog {
            endpt: endpt.clone(),
            state: Mutex::new(DialogState {
                local_contact: NameAddr::new(local.uri.clone()),
                local,
                remote: from.clone(),
                call_id: call_id.clone(),
                local_cseq: 0,
                remote_cseq: views.cseq.as_ref().map(|c| c.seq),
                target,
                route_set: msg.headers.record_routes().cloned().collect(),
            }),
        }))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpt
    }

    pub fn call_id(&self) -> String {
        self.state.lock().unwrap().call_id.clone()
    }

    pub fn local(&self) -> NameAddr {
        self.state.lock().unwrap().local.clone()
    }

    pub fn remote(&self) -> NameAddr {
        self.state.lock().unwrap().remote.clone()
    }

    /// The local URI, used as the entity of published presence
    /// documents.
    pub fn local_uri(&self) -> SipUri {
        self.state.lock().unwrap().local.uri.clone()
    }

    pub fn local_tag(&self) -> Option<String> {
        self.state.lock().unwrap().local.tag().map(str::to_owned)
    }

    pub fn remote_tag(&self) -> Option<String> {
        self.state.lock().unwrap().remote.tag().map(str::to_owned)
    }

    /// Record the remote tag once a dialog-establishing response or
    /// request supplies it.
    pub fn set_remote_tag(&self, tag: &str) {
        let mut state = self.state.lock().unwrap();
        if state.remote.tag().is_none() {
            state.remote.set_tag(tag);
        }
    }

    /// Last CSeq number seen from the peer, for in-dialog ordering.
    pub fn remote_cseq(&self) -> Option<u32> {
        self.state.lock().unwrap().remote_cseq
    }

    pub fn note_remote_cseq(&self, seq: u32) {
        self.state.lock().unwrap().remote_cseq = Some(seq);
    }

    pub fn key(&self) -> Result<DialogKey> {
        let state = self.state.lock().unwrap();
        let local_tag = state
            .local
            .tag()
            .ok_or_else(|| Error::InvalidArg("dialog has no local tag".into()))?
            .to_owned();
        Ok(DialogKey {
            call_id: state.call_id.clone(),
            local_tag,
        })
    }

    /// Build an in-dialog request: From/To with tags, Call-ID, the next
    /// CSeq, the standing request headers, Contact, and the route set.
    pub fn create_request(&self, method: Method) -> Arc<TxData> {
        let mut state = self.state.lock().unwrap();
        state.local_cseq += 1;

        let mut msg = Message::request(method.clone(), state.target.clone());
        msg.headers.push(Header::Via(Via::new(
            "UDP",
            state.local.uri.host_port.clone(),
            util::unique_branch(),
        )));
        for hdr in state.route_set.iter() {
            msg.headers.push(Header::Route(hdr.clone()));
        }
        msg.headers.push(Header::From(state.local.clone()));
        msg.headers.push(Header::To(state.remote.clone()));
        msg.headers.push(Header::CallId(state.call_id.clone()));
        msg.headers.push(Header::CSeq(CSeq {
            seq: state.local_cseq,
            method,
        }));
        for hdr in self.endpt.request_headers() {
            msg.headers.push(hdr);
        }
        msg.headers
            .push(Header::Contact(state.local_contact.clone()));

        TxData::new(msg)
    }

    /// Stamp a response built from a received request with this dialog's
    /// local tag.
    pub fn stamp_response(&self, tdata: &Arc<TxData>) {
        let tag = self.local_tag();
        if let Some(tag) = tag {
            tdata.modify_msg(|msg| {
                if let Some(to) = msg.headers.to_mut() {
                    if to.tag().is_none() {
                        to.set_tag(tag);
                    }
                }
            });
        }
    }
}

impl std::fmt::Debug for Dialog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Dialog")
            .field("call_id", &state.call_id)
            .field("local", &state.local.to_string())
            .field("remote", &state.remote.to_string())
            .finish_non_exhaustive()
    }
}
