//! Event subscription engine (RFC 3265).
//!
//! A generic SUBSCRIBE/NOTIFY state machine that event packages build
//! on. The [`EvsubModule`] plugs into the endpoint and routes in-dialog
//! requests and responses to their subscription; packages register
//! themselves with a name, a default expiry, and the content types they
//! accept, and observe the subscription through the [`EvsubUser`]
//! capability hooks.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::buffer::{RxData, TxData};
use crate::config::REFRESH_MARGIN;
use crate::dialog::{Dialog, DialogKey};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::module::{Module, priority};
use crate::msg::{
    Body, Header, Message, Method, StatusCode, SubscriptionState, Warning,
};
use crate::timer::TimerToken;
use crate::transport::TpHandle;

/// Subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvsubState {
    /// Created, nothing sent or received yet.
    Null,
    /// Initial SUBSCRIBE sent, no final answer.
    Sent,
    /// SUBSCRIBE answered 2xx, no NOTIFY processed yet.
    Accepted,
    /// Notifier reports the subscription awaits authorization.
    Pending,
    /// Subscription is live.
    Active,
    /// Over. Absorbing; the object stays until the dialog releases it.
    Terminated,
}

impl EvsubState {
    pub fn as_str(self) -> &'static str {
        match self {
            EvsubState::Null => "NULL",
            EvsubState::Sent => "SENT",
            EvsubState::Accepted => "ACCEPTED",
            EvsubState::Pending => "PENDING",
            EvsubState::Active => "ACTIVE",
            EvsubState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for EvsubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn transition_allowed(old: EvsubState, new: EvsubState) -> bool {
    use EvsubState::*;
    matches!(
        (old, new),
        (Null, Sent | Accepted | Terminated)
            | (Sent, Accepted | Terminated)
            | (Accepted, Pending | Active | Terminated)
            | (Pending, Active | Terminated)
            | (Active, Active | Terminated)
    )
}

/// Subscription role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvsubRole {
    /// Subscriber (client).
    Uac,
    /// Notifier (server).
    Uas,
}

/// The response a hook shapes for a received SUBSCRIBE or NOTIFY.
#[derive(Debug)]
pub struct NotifyResponse {
    pub code: StatusCode,
    pub reason: Option<String>,
    pub headers: Vec<Header>,
    pub body: Option<Body>,
}

impl Default for NotifyResponse {
    fn default() -> Self {
        NotifyResponse {
            code: StatusCode::OK,
            reason: None,
            headers: Vec::new(),
            body: None,
        }
    }
}

/// Transaction edges the engine itself observes; the full transaction
/// layer is external.
pub enum TsxEvent<'a> {
    RxRequest(&'a RxData),
    RxResponse(&'a RxData),
    TxMsg(&'a Arc<TxData>),
}

/// Capability hooks a package or application implements. Every hook has
/// a no-op default.
pub trait EvsubUser: Send + Sync {
    /// Subscription state changed.
    fn on_evsub_state(&self, _sub: &Arc<Evsub>, _old: EvsubState, _new: EvsubState) {}

    /// A transaction edge involving this subscription.
    fn on_tsx_state(&self, _sub: &Arc<Evsub>, _event: &TsxEvent<'_>) {}

    /// A refresh SUBSCRIBE arrived (notifier side). May adjust the
    /// response.
    fn on_rx_refresh(&self, _sub: &Arc<Evsub>, _rdata: &RxData, _resp: &mut NotifyResponse) {}

    /// A NOTIFY arrived (subscriber side). May adjust the response.
    fn on_rx_notify(&self, _sub: &Arc<Evsub>, _rdata: &RxData, _resp: &mut NotifyResponse) {}

    /// The refresh timer fired (subscriber side). Return `true` when
    /// handled; `false` requests the automatic re-SUBSCRIBE.
    fn on_client_refresh(&self, _sub: &Arc<Evsub>) -> bool {
        false
    }

    /// The expiry timer fired without a refresh (notifier side). Return
    /// `true` when handled; `false` requests the default terminating
    /// NOTIFY.
    fn on_server_timeout(&self, _sub: &Arc<Evsub>) -> bool {
        false
    }
}

/// No hooks at all.
pub struct NullUser;

impl EvsubUser for NullUser {}

#[derive(Debug, Clone)]
struct Package {
    name: String,
    default_expires: u32,
    accepts: Vec<String>,
}

/// The subscription module: package registry plus routing of in-dialog
/// SUBSCRIBE/NOTIFY traffic to the owning subscription.
pub struct EvsubModule {
    packages: Mutex<HashMap<String, Package>>,
    subs: Mutex<HashMap<DialogKey, Weak<Evsub>>>,
}

impl EvsubModule {
    pub fn new() -> Arc<EvsubModule> {
        Arc::new(EvsubModule {
            packages: Mutex::new(HashMap::new()),
            subs: Mutex::new(HashMap::new()),
        })
    }

    /// Register an event package.
    pub fn register_pkg(
        &self,
        name: &str,
        default_expires: u32,
        accepts: &[&str],
    ) -> Result<()> {
        let key = name.to_ascii_lowercase();
        let mut packages = self.packages.lock().unwrap();
        if packages.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("event package \"{}\"", name)));
        }
        packages.insert(
            key,
            Package {
                name: name.to_owned(),
                default_expires,
                accepts: accepts.iter().map(|a| (*a).to_owned()).collect(),
            },
        );
        tracing::debug!(package = name, default_expires, "event package registered");
        Ok(())
    }

    fn package(&self, name: &str) -> Option<Package> {
        self.packages
            .lock()
            .unwrap()
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    fn attach(&self, sub: &Arc<Evsub>) -> Result<()> {
        let key = sub.dialog().key()?;
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|_, weak| weak.strong_count() > 0);
        subs.insert(key, Arc::downgrade(sub));
        Ok(())
    }

    fn lookup(&self, key: &DialogKey) -> Option<Arc<Evsub>> {
        self.subs.lock().unwrap().get(key).and_then(Weak::upgrade)
    }

    /// Number of live subscriptions attached to the module.
    pub fn sub_count(&self) -> usize {
        self.subs
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl Module for EvsubModule {
    fn name(&self) -> &str {
        "mod-evsub"
    }

    fn priority(&self) -> u32 {
        priority::DIALOG_USAGE
    }

    fn on_rx_request(&self, _endpt: &Endpoint, rdata: &RxData) -> bool {
        let views = rdata.views();
        let (Some(call_id), Some(to_tag)) = (&views.call_id, &views.to_tag) else {
            // Dialog-initiating requests are admitted by the
            // application, not routed here.
            return false;
        };
        let key = DialogKey {
            call_id: call_id.clone(),
            local_tag: to_tag.clone(),
        };
        let Some(sub) = self.lookup(&key) else {
            return false;
        };

        match rdata.msg().and_then(Message::method) {
            Some(Method::Subscribe) => {
                if let Err(e) = sub.handle_refresh(rdata) {
                    tracing::warn!(error = %e, "failed to process refresh SUBSCRIBE");
                }
                true
            }
            Some(Method::Notify) => {
                if let Err(e) = sub.handle_notify(rdata) {
                    tracing::warn!(error = %e, "failed to process NOTIFY");
                }
                true
            }
            _ => false,
        }
    }

    fn on_rx_response(&self, _endpt: &Endpoint, rdata: &RxData) -> bool {
        let views = rdata.views();
        let (Some(call_id), Some(from_tag)) = (&views.call_id, &views.from_tag) else {
            return false;
        };
        let key = DialogKey {
            call_id: call_id.clone(),
            local_tag: from_tag.clone(),
        };
        let Some(sub) = self.lookup(&key) else {
            return false;
        };
        sub.process_response(rdata)
    }
}

struct SubCore {
    state: EvsubState,
    term_reason: Option<String>,
    expires: u32,
    expiry_timer: Option<TimerToken>,
    transport: Option<TpHandle>,
    remote: Option<std::net::SocketAddr>,
}

/// One event subscription.
pub struct Evsub {
    endpt: Endpoint,
    dlg: Arc<Dialog>,
    pkg: Package,
    role: EvsubRole,
    user: Arc<dyn EvsubUser>,
    core: Mutex<SubCore>,
    /// Per-package user data, keyed by package name.
    mod_data: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    self_weak: Weak<Evsub>,
}

impl Evsub {
    /// Create a subscriber-side subscription under the dialog.
    pub fn create_uac(
        module: &Arc<EvsubModule>,
        dlg: Arc<Dialog>,
        user: Arc<dyn EvsubUser>,
        pkg_name: &str,
    ) -> Result<Arc<Evsub>> {
        let pkg = module
            .package(pkg_name)
            .ok_or(Error::NotFound("event package"))?;
        let default_expires = pkg.default_expires;
        let sub = Arc::new_cyclic(|self_weak| Evsub {
            endpt: dlg.endpoint().clone(),
            dlg,
            pkg,
            role: EvsubRole::Uac,
            user,
            core: Mutex::new(SubCore {
                state: EvsubState::Null,
                term_reason: None,
                expires: default_expires,
                expiry_timer: None,
                transport: None,
                remote: None,
            }),
            mod_data: Mutex::new(HashMap::new()),
            self_weak: self_weak.clone(),
        });
        module.attach(&sub)?;
        Ok(sub)
    }

    /// Create a notifier-side subscription from a dialog-initiating
    /// SUBSCRIBE. The Event header must name the package; the requested
    /// expiry is clamped to the package default. The subscription
    /// starts in ACCEPTED and its expiry timer runs.
    pub fn create_uas(
        module: &Arc<EvsubModule>,
        dlg: Arc<Dialog>,
        user: Arc<dyn EvsubUser>,
        rdata: &RxData,
        pkg_name: &str,
    ) -> Result<Arc<Evsub>> {
        let msg = rdata
            .msg()
            .ok_or_else(|| Error::InvalidArg("no parsed message in rx buffer".into()))?;
        if msg.method() != Some(&Method::Subscribe) {
            return Err(Error::InvalidArg("request is not SUBSCRIBE".into()));
        }

        let event = msg
            .headers
            .event()
            .ok_or_else(|| Error::BadEvent("missing Event header".into()))?;
        if !event.event_type.eq_ignore_ascii_case(pkg_name) {
            return Err(Error::BadEvent(event.event_type.clone()));
        }

        let pkg = module
            .package(pkg_name)
            .ok_or(Error::NotFound("event package"))?;
        let expires = msg
            .headers
            .expires()
            .unwrap_or(pkg.default_expires)
            .min(pkg.default_expires);

        let sub = Arc::new_cyclic(|self_weak| Evsub {
            endpt: dlg.endpoint().clone(),
            dlg,
            pkg,
            role: EvsubRole::Uas,
            user,
            core: Mutex::new(SubCore {
                state: EvsubState::Accepted,
                term_reason: None,
                expires,
                expiry_timer: None,
                transport: None,
                remote: None,
            }),
            mod_data: Mutex::new(HashMap::new()),
            self_weak: self_weak.clone(),
        });
        module.attach(&sub)?;
        sub.schedule_expiry(expires);
        tracing::debug!(
            package = %sub.pkg.name,
            expires,
            call_id = %sub.dlg.call_id(),
            "server subscription created"
        );
        Ok(sub)
    }

    /// A strong handle to this subscription, for hook invocations and
    /// timer closures. `None` only while the object is being dropped.
    fn strong(&self) -> Option<Arc<Evsub>> {
        self.self_weak.upgrade()
    }

    pub fn state(&self) -> EvsubState {
        self.core.lock().unwrap().state
    }

    pub fn termination_reason(&self) -> Option<String> {
        self.core.lock().unwrap().term_reason.clone()
    }

    /// Current (negotiated) expiry in seconds.
    pub fn expires(&self) -> u32 {
        self.core.lock().unwrap().expires
    }

    pub fn role(&self) -> EvsubRole {
        self.role
    }

    pub fn package_name(&self) -> &str {
        &self.pkg.name
    }

    pub fn dialog(&self) -> &Arc<Dialog> {
        &self.dlg
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpt
    }

    /// Attach per-package user data.
    pub fn set_mod_data(&self, pkg: &str, data: Arc<dyn Any + Send + Sync>) {
        self.mod_data.lock().unwrap().insert(pkg.to_owned(), data);
    }

    pub fn mod_data(&self, pkg: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.mod_data.lock().unwrap().get(pkg).cloned()
    }

    /// Attach a wire for outgoing requests. Without one, requests stop
    /// after the module tx walk (the transaction layer owns delivery).
    pub fn set_transport(&self, tp: TpHandle, remote: std::net::SocketAddr) {
        let mut core = self.core.lock().unwrap();
        core.transport = Some(tp);
        core.remote = Some(remote);
    }

    /// Build the initial or refresh SUBSCRIBE. A negative expiry selects
    /// the package default.
    pub fn initiate(&self, expires: i32) -> Result<Arc<TxData>> {
        if self.role != EvsubRole::Uac {
            return Err(Error::InvalidArg(
                "initiate is a subscriber-side operation".into(),
            ));
        }
        let expires = if expires < 0 {
            self.pkg.default_expires
        } else {
            expires as u32
        };
        self.core.lock().unwrap().expires = expires;

        let tdata = self.dlg.create_request(Method::Subscribe);
        let event = crate::msg::EventHdr::new(&self.pkg.name);
        let accepts = self.pkg.accepts.clone();
        tdata.modify_msg(|msg| {
            msg.headers.push(Header::Event(event));
            msg.headers.push(Header::Expires(expires));
            if !accepts.is_empty() {
                msg.headers.push(Header::Accept(accepts));
            }
        });
        Ok(tdata)
    }

    /// Answer the initial SUBSCRIBE (notifier side) with 200 or 202 and
    /// send the response.
    pub fn accept(
        &self,
        rdata: &RxData,
        code: StatusCode,
        extra: &[Header],
    ) -> Result<Arc<TxData>> {
        if self.role != EvsubRole::Uas {
            return Err(Error::InvalidArg("accept is a notifier-side operation".into()));
        }
        if !code.is_success() {
            return Err(Error::InvalidArg(format!(
                "subscription accept status must be 2xx, got {}",
                code
            )));
        }

        let expires = self.expires();
        let tdata = self.endpt.create_response(rdata, code, None)?;
        self.dlg.stamp_response(&tdata);
        let extra = extra.to_vec();
        tdata.modify_msg(|msg| {
            msg.headers.push(Header::Expires(expires));
            for hdr in extra {
                msg.headers.push(hdr);
            }
        });
        self.send_response(&tdata, rdata)?;
        Ok(tdata)
    }

    /// Build a NOTIFY that moves the subscription to `state`. The
    /// Subscription-State header carries the remaining expiry for
    /// active/pending and the reason for terminated; `state_str`
    /// substitutes an extension state token.
    pub fn notify(
        &self,
        state: EvsubState,
        state_str: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Arc<TxData>> {
        if self.role != EvsubRole::Uas {
            return Err(Error::InvalidArg("notify is a notifier-side operation".into()));
        }

        let expires = self.expires();
        let mut ss = match state {
            EvsubState::Active => SubscriptionState::active(expires),
            EvsubState::Pending | EvsubState::Accepted => SubscriptionState::pending(expires),
            EvsubState::Terminated => SubscriptionState::terminated(reason),
            EvsubState::Null | EvsubState::Sent => {
                return Err(Error::InvalidArg(format!(
                    "cannot build NOTIFY for state {}",
                    state
                )));
            }
        };
        if let Some(token) = state_str {
            ss.state = token.to_owned();
        }

        let tdata = self.dlg.create_request(Method::Notify);
        let event = crate::msg::EventHdr::new(&self.pkg.name);
        tdata.modify_msg(|msg| {
            msg.headers.push(Header::Event(event));
            msg.headers.push(Header::SubscriptionState(ss));
        });

        self.change_state(state, reason);
        Ok(tdata)
    }

    /// Build a NOTIFY reflecting the current state.
    pub fn current_notify(&self) -> Result<Arc<TxData>> {
        let (state, reason) = {
            let core = self.core.lock().unwrap();
            (core.state, core.term_reason.clone())
        };
        self.notify(state, None, reason.as_deref())
    }

    /// Hand an outgoing request to the module tx walk and, when a wire
    /// is attached, to the transport.
    pub fn send_request(&self, tdata: &Arc<TxData>) -> Result<()> {
        let is_subscribe =
            tdata.with_msg(|m| m.method() == Some(&Method::Subscribe));
        if is_subscribe && self.state() == EvsubState::Null {
            self.change_state(EvsubState::Sent, None);
        }

        if let Some(this) = self.strong() {
            self.user.on_tsx_state(&this, &TsxEvent::TxMsg(tdata));
        }
        self.endpt.dispatch_tx(tdata)?;

        let (tp, remote) = {
            let core = self.core.lock().unwrap();
            (core.transport.clone(), core.remote)
        };
        if let Some(tp) = tp {
            self.endpt.transports().send(&tp, tdata, remote)?;
        }
        Ok(())
    }

    /// Force the subscription into TERMINATED.
    pub fn terminate(&self, reason: Option<&str>) {
        self.cancel_expiry();
        self.change_state(EvsubState::Terminated, reason);
    }

    /// Process a refresh SUBSCRIBE (notifier side): re-clamp the expiry,
    /// restart or stop the expiry timer, let the package shape the
    /// response, and send it.
    pub fn handle_refresh(&self, rdata: &RxData) -> Result<Arc<TxData>> {
        if self.role != EvsubRole::Uas {
            return Err(Error::InvalidArg("refresh received on a subscriber".into()));
        }
        let msg = rdata
            .msg()
            .ok_or_else(|| Error::InvalidArg("no parsed message in rx buffer".into()))?;
        if let Some(cseq) = &rdata.views().cseq {
            self.dlg.note_remote_cseq(cseq.seq);
        }

        let expires = msg
            .headers
            .expires()
            .unwrap_or(self.pkg.default_expires)
            .min(self.pkg.default_expires);
        self.core.lock().unwrap().expires = expires;

        if expires == 0 {
            self.cancel_expiry();
            self.change_state(EvsubState::Terminated, Some("timeout"));
        } else {
            self.schedule_expiry(expires);
        }

        if let Some(this) = self.strong() {
            self.user.on_tsx_state(&this, &TsxEvent::RxRequest(rdata));
        }

        let mut resp = NotifyResponse::default();
        if let Some(this) = self.strong() {
            self.user.on_rx_refresh(&this, rdata, &mut resp);
        }

        let tdata = self
            .endpt
            .create_response(rdata, resp.code, resp.reason.as_deref())?;
        self.dlg.stamp_response(&tdata);
        let extra = resp.headers;
        let body = resp.body;
        tdata.modify_msg(|msg| {
            msg.headers.push(Header::Expires(expires));
            for hdr in extra {
                msg.headers.push(hdr);
            }
            if let Some(body) = body {
                msg.set_body(body);
            }
        });
        self.send_response(&tdata, rdata)?;
        Ok(tdata)
    }

    /// Process a NOTIFY (subscriber side): the Subscription-State header
    /// is mandatory, the package and application shape the response, and
    /// a 2xx answer commits the state transition the header announces.
    pub fn handle_notify(&self, rdata: &RxData) -> Result<Arc<TxData>> {
        if self.role != EvsubRole::Uac {
            return Err(Error::InvalidArg("NOTIFY received on a notifier".into()));
        }
        let msg = rdata
            .msg()
            .ok_or_else(|| Error::InvalidArg("no parsed message in rx buffer".into()))?;
        if let Some(cseq) = &rdata.views().cseq {
            self.dlg.note_remote_cseq(cseq.seq);
        }
        if let Some(from_tag) = &rdata.views().from_tag {
            self.dlg.set_remote_tag(from_tag);
        }

        let Some(ss) = msg.headers.subscription_state().cloned() else {
            let tdata =
                self.endpt
                    .create_response(rdata, StatusCode::BAD_REQUEST, None)?;
            self.dlg.stamp_response(&tdata);
            let warning = Warning::miscellaneous(
                self.endpt.name(),
                "Missing Subscription-State header",
            );
            tdata.modify_msg(|msg| msg.headers.push(Header::Warning(warning)));
            self.send_response(&tdata, rdata)?;
            return Ok(tdata);
        };

        if let Some(this) = self.strong() {
            self.user.on_tsx_state(&this, &TsxEvent::RxRequest(rdata));
        }

        let mut resp = NotifyResponse::default();
        if let Some(this) = self.strong() {
            self.user.on_rx_notify(&this, rdata, &mut resp);
        }
        let accepted = resp.code.is_success();

        let tdata = self
            .endpt
            .create_response(rdata, resp.code, resp.reason.as_deref())?;
        self.dlg.stamp_response(&tdata);
        let extra = resp.headers;
        let body = resp.body;
        tdata.modify_msg(|msg| {
            for hdr in extra {
                msg.headers.push(hdr);
            }
            if let Some(body) = body {
                msg.set_body(body);
            }
        });
        self.send_response(&tdata, rdata)?;

        if accepted {
            match ss.state.as_str() {
                s if s.eq_ignore_ascii_case("active") => {
                    self.change_state(EvsubState::Active, None)
                }
                s if s.eq_ignore_ascii_case("pending") => {
                    self.change_state(EvsubState::Pending, None)
                }
                s if s.eq_ignore_ascii_case("terminated") => {
                    self.cancel_expiry();
                    self.change_state(EvsubState::Terminated, ss.reason.as_deref());
                }
                other => {
                    tracing::debug!(state = other, "NOTIFY carries extension state, keeping current");
                }
            }
            if self.state() != EvsubState::Terminated {
                if let Some(expires) = ss.expires {
                    self.core.lock().unwrap().expires = expires;
                    self.schedule_client_refresh(expires);
                }
            }
        }

        Ok(tdata)
    }

    /// Process a response to one of our requests (subscriber side).
    pub fn process_response(&self, rdata: &RxData) -> bool {
        let Some(cseq) = rdata.views().cseq.clone() else {
            return false;
        };
        let Some(code) = rdata.msg().and_then(Message::status) else {
            return false;
        };

        match cseq.method {
            Method::Subscribe => {
                if let Some(this) = self.strong() {
                    self.user.on_tsx_state(&this, &TsxEvent::RxResponse(rdata));
                }
                if code.0 < 200 {
                    return true;
                }
                if code.is_success() {
                    if let Some(to_tag) = &rdata.views().to_tag {
                        self.dlg.set_remote_tag(to_tag);
                    }
                    let expires = rdata
                        .msg()
                        .and_then(|m| m.headers.expires())
                        .unwrap_or(self.expires())
                        .min(self.pkg.default_expires);
                    self.core.lock().unwrap().expires = expires;
                    if self.state() == EvsubState::Sent {
                        self.change_state(EvsubState::Accepted, None);
                    }
                    self.schedule_client_refresh(expires);
                } else {
                    self.cancel_expiry();
                    self.change_state(
                        EvsubState::Terminated,
                        Some(&code.to_string()),
                    );
                }
                true
            }
            Method::Notify => {
                if let Some(this) = self.strong() {
                    self.user.on_tsx_state(&this, &TsxEvent::RxResponse(rdata));
                }
                true
            }
            _ => false,
        }
    }

    /// The refresh timer fired: let the user take over, else re-issue
    /// SUBSCRIBE with the package default expiry.
    fn client_refresh(&self) {
        if self.state() == EvsubState::Terminated {
            return;
        }
        let Some(this) = self.strong() else {
            return;
        };
        if self.user.on_client_refresh(&this) {
            return;
        }
        let sent = self
            .initiate(-1)
            .and_then(|tdata| self.send_request(&tdata));
        if let Err(e) = sent {
            tracing::warn!(error = %e, "automatic subscription refresh failed");
        }
    }

    /// The server-side expiry fired without a refresh: terminate, then
    /// let the user take over, else emit the default terminating NOTIFY.
    fn server_timeout(&self) {
        if self.state() == EvsubState::Terminated {
            return;
        }
        self.change_state(EvsubState::Terminated, Some("timeout"));
        let Some(this) = self.strong() else {
            return;
        };
        if self.user.on_server_timeout(&this) {
            return;
        }
        let sent = self
            .notify(EvsubState::Terminated, None, Some("timeout"))
            .and_then(|tdata| self.send_request(&tdata));
        if let Err(e) = sent {
            tracing::warn!(error = %e, "terminating NOTIFY failed");
        }
    }

    fn schedule_expiry(&self, expires: u32) {
        self.cancel_expiry();
        let weak = self.self_weak.clone();
        let token = self
            .endpt
            .schedule_timer(Duration::from_secs(expires as u64), move || {
                if let Some(sub) = weak.upgrade() {
                    sub.server_timeout();
                }
            });
        match token {
            Ok(token) => self.core.lock().unwrap().expiry_timer = Some(token),
            Err(e) => tracing::warn!(error = %e, "could not arm subscription expiry timer"),
        }
    }

    fn schedule_client_refresh(&self, expires: u32) {
        self.cancel_expiry();
        let delay = expires.saturating_sub(REFRESH_MARGIN).max(1);
        let weak = self.self_weak.clone();
        let token = self
            .endpt
            .schedule_timer(Duration::from_secs(delay as u64), move || {
                if let Some(sub) = weak.upgrade() {
                    sub.client_refresh();
                }
            });
        match token {
            Ok(token) => self.core.lock().unwrap().expiry_timer = Some(token),
            Err(e) => tracing::warn!(error = %e, "could not arm subscription refresh timer"),
        }
    }

    fn cancel_expiry(&self) {
        let token = self.core.lock().unwrap().expiry_timer.take();
        if let Some(token) = token {
            self.endpt.cancel_timer(token);
        }
    }

    fn change_state(&self, new: EvsubState, reason: Option<&str>) {
        let old = {
            let mut core = self.core.lock().unwrap();
            let old = core.state;
            if old == new && new != EvsubState::Active {
                return;
            }
            if !transition_allowed(old, new) {
                tracing::warn!(
                    old = %old,
                    new = %new,
                    "subscription state transition not allowed, ignored"
                );
                return;
            }
            core.state = new;
            if let Some(reason) = reason {
                core.term_reason = Some(reason.to_owned());
            }
            old
        };
        tracing::debug!(
            package = %self.pkg.name,
            call_id = %self.dlg.call_id(),
            %old,
            %new,
            "subscription state changed"
        );
        if let Some(this) = self.strong() {
            self.user.on_evsub_state(&this, old, new);
        }
    }

    /// Send a response over the transport the request arrived on.
    fn send_response(&self, tdata: &Arc<TxData>, rdata: &RxData) -> Result<()> {
        self.endpt.dispatch_tx(tdata)?;
        if let Some(tp) = rdata.transport() {
            let bytes = tdata.print()?;
            tp.send(&bytes, Some(rdata.src_addr()))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Evsub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evsub")
            .field("package", &self.pkg.name)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
