//! Presence event package (RFC 3856).
//!
//! Builds on the subscription engine: the notifier side admits
//! SUBSCRIBE requests (Event, Accept, Expires), publishes PIDF or XPIDF
//! bodies in its NOTIFYs, and the subscriber side parses received
//! bodies into a tentative status that is committed once the
//! application accepts the NOTIFY.

use std::sync::{Arc, Mutex};

use crate::buffer::{RxData, TxData};
use crate::config::{MAX_URL_SIZE, PRES_DEFAULT_EXPIRES, PRES_MIN_EXPIRES, PRES_STATUS_MAX_INFO};
use crate::dialog::Dialog;
use crate::error::{Error, Result};
use crate::evsub::{Evsub, EvsubModule, EvsubState, EvsubUser, NotifyResponse, TsxEvent};
use crate::msg::{Body, ContentType, Header, StatusCode, Warning};
use crate::{pidf, util};

#[cfg(feature = "xpidf")]
use crate::xpidf;

/// The event package name.
pub const EVENT_PACKAGE: &str = "presence";

/// PIDF media type.
pub const PIDF_TYPE: &str = "application/pidf+xml";

/// XPIDF media type.
pub const XPIDF_TYPE: &str = "application/xpidf+xml";

const MOD_DATA_KEY: &str = "presence";

fn supported_types() -> Vec<String> {
    #[cfg(feature = "xpidf")]
    {
        vec![PIDF_TYPE.to_owned(), XPIDF_TYPE.to_owned()]
    }
    #[cfg(not(feature = "xpidf"))]
    {
        vec![PIDF_TYPE.to_owned()]
    }
}

/// Register the presence package with the subscription module.
pub fn init(module: &Arc<EvsubModule>) -> Result<()> {
    let types = supported_types();
    let accepts: Vec<&str> = types.iter().map(String::as_str).collect();
    module.register_pkg(EVENT_PACKAGE, PRES_DEFAULT_EXPIRES, &accepts)
}

/// Negotiated body format for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresContent {
    None,
    Pidf,
    Xpidf,
}

/// One presence observation: tuple id, contact, and the basic
/// open/closed flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceInfo {
    pub id: String,
    pub contact: String,
    pub basic_open: bool,
}

/// A presentity's full status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceStatus {
    pub info: Vec<PresenceInfo>,
}

impl PresenceStatus {
    /// A single-tuple status with the given flag.
    pub fn basic(open: bool) -> PresenceStatus {
        PresenceStatus {
            info: vec![PresenceInfo {
                basic_open: open,
                ..Default::default()
            }],
        }
    }
}

/// Application hooks for a presence subscription. Every hook has a no-op
/// default; hooks returning `bool` report whether they handled the event
/// (`false` selects the package default behavior).
pub trait PresUser: Send + Sync {
    fn on_evsub_state(&self, _sub: &Arc<Evsub>, _old: EvsubState, _new: EvsubState) {}

    fn on_tsx_state(&self, _sub: &Arc<Evsub>, _event: &TsxEvent<'_>) {}

    /// A refresh SUBSCRIBE arrived. Default: the package answers it and
    /// sends a NOTIFY reflecting the current state.
    fn on_rx_refresh(&self, _sub: &Arc<Evsub>, _rdata: &RxData, _resp: &mut NotifyResponse) -> bool {
        false
    }

    /// A NOTIFY with a parsed presence body arrived; the tentative
    /// status is readable through [`Pres::status`]. The hook decides the
    /// response code (2xx commits the tentative status).
    fn on_rx_notify(&self, _sub: &Arc<Evsub>, _rdata: &RxData, _resp: &mut NotifyResponse) {}

    /// The refresh timer fired. Default: automatic re-SUBSCRIBE.
    fn on_client_refresh(&self, _sub: &Arc<Evsub>) -> bool {
        false
    }

    /// The subscription expired without a refresh. Default: terminating
    /// NOTIFY with reason "timeout".
    fn on_server_timeout(&self, _sub: &Arc<Evsub>) -> bool {
        false
    }
}

/// No application hooks.
pub struct NullPresUser;

impl PresUser for NullPresUser {}

struct StatusStore {
    committed: PresenceStatus,
    tmp: PresenceStatus,
    tmp_valid: bool,
}

struct PresCtx {
    content: Mutex<PresContent>,
    status: Mutex<StatusStore>,
    user: Arc<dyn PresUser>,
}

fn ctx_of(sub: &Arc<Evsub>) -> Option<Arc<PresCtx>> {
    sub.mod_data(MOD_DATA_KEY)
        .and_then(|data| data.downcast::<PresCtx>().ok())
}

/// A presence subscription handle, wrapping the underlying event
/// subscription.
#[derive(Clone)]
pub struct Pres {
    sub: Arc<Evsub>,
}

impl std::fmt::Debug for Pres {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pres").finish_non_exhaustive()
    }
}

impl Pres {
    /// Create a subscriber-side presence subscription under the dialog.
    pub fn create_uac(
        module: &Arc<EvsubModule>,
        dlg: Arc<Dialog>,
        user: Arc<dyn PresUser>,
    ) -> Result<Pres> {
        let sub = Evsub::create_uac(module, dlg, Arc::new(PresGlue), EVENT_PACKAGE)?;
        sub.set_mod_data(
            MOD_DATA_KEY,
            Arc::new(PresCtx {
                content: Mutex::new(PresContent::None),
                status: Mutex::new(StatusStore {
                    committed: PresenceStatus::default(),
                    tmp: PresenceStatus::default(),
                    tmp_valid: false,
                }),
                user,
            }),
        );
        Ok(Pres { sub })
    }

    /// Admit a dialog-initiating SUBSCRIBE and create the notifier-side
    /// subscription.
    ///
    /// Admission: the Event header must name "presence" (else the
    /// request deserves 489); the Accept list, scanned in order, must
    /// offer PIDF or XPIDF (else 406), defaulting to PIDF when absent;
    /// an Expires below the minimum deserves 423, and the granted
    /// expiry is clamped to the package default.
    pub fn create_uas(
        module: &Arc<EvsubModule>,
        dlg: Arc<Dialog>,
        user: Arc<dyn PresUser>,
        rdata: &RxData,
    ) -> Result<Pres> {
        let msg = rdata
            .msg()
            .ok_or_else(|| Error::InvalidArg("no parsed message in rx buffer".into()))?;
        if msg.method() != Some(&crate::msg::Method::Subscribe) {
            return Err(Error::InvalidArg("request is not SUBSCRIBE".into()));
        }

        let event = msg
            .headers
            .event()
            .ok_or_else(|| Error::BadEvent("missing Event header".into()))?;
        if !event.event_type.eq_ignore_ascii_case(EVENT_PACKAGE) {
            return Err(Error::BadEvent(event.event_type.clone()));
        }

        let content = match msg.headers.accept() {
            Some(values) => {
                let mut chosen = None;
                for value in values {
                    let media = value.split(';').next().unwrap_or(value).trim();
                    if media.eq_ignore_ascii_case(PIDF_TYPE) {
                        chosen = Some(PresContent::Pidf);
                        break;
                    }
                    #[cfg(feature = "xpidf")]
                    if media.eq_ignore_ascii_case(XPIDF_TYPE) {
                        chosen = Some(PresContent::Xpidf);
                        break;
                    }
                }
                chosen.ok_or(Error::NotAcceptable)?
            }
            None => PresContent::Pidf,
        };

        if let Some(expires) = msg.headers.expires() {
            if expires < PRES_MIN_EXPIRES {
                return Err(Error::IntervalTooBrief {
                    min: PRES_MIN_EXPIRES,
                });
            }
        }

        let sub = Evsub::create_uas(module, dlg, Arc::new(PresGlue), rdata, EVENT_PACKAGE)?;
        sub.set_mod_data(
            MOD_DATA_KEY,
            Arc::new(PresCtx {
                content: Mutex::new(content),
                status: Mutex::new(StatusStore {
                    committed: PresenceStatus::default(),
                    tmp: PresenceStatus::default(),
                    tmp_valid: false,
                }),
                user,
            }),
        );
        Ok(Pres { sub })
    }

    /// Wrap an existing subscription that carries a presence context.
    pub fn from_sub(sub: Arc<Evsub>) -> Result<Pres> {
        if ctx_of(&sub).is_none() {
            return Err(Error::NotFound("presence context"));
        }
        Ok(Pres { sub })
    }

    pub fn sub(&self) -> &Arc<Evsub> {
        &self.sub
    }

    /// The negotiated body format.
    pub fn content(&self) -> PresContent {
        ctx_of(&self.sub)
            .map(|ctx| *ctx.content.lock().unwrap())
            .unwrap_or(PresContent::None)
    }

    /// Build the initial or refresh SUBSCRIBE (`-1` selects the package
    /// default expiry).
    pub fn initiate(&self, expires: i32) -> Result<Arc<TxData>> {
        self.sub.initiate(expires)
    }

    /// Answer the initial SUBSCRIBE with 200 or 202.
    pub fn accept(
        &self,
        rdata: &RxData,
        code: StatusCode,
        extra: &[Header],
    ) -> Result<Arc<TxData>> {
        self.sub.accept(rdata, code, extra)
    }

    /// Hand a request to the transmit path.
    pub fn send_request(&self, tdata: &Arc<TxData>) -> Result<()> {
        self.sub.send_request(tdata)
    }

    /// Publish a new committed status. Tuples without an id get a
    /// generated one.
    pub fn set_status(&self, status: &PresenceStatus) -> Result<()> {
        if status.info.len() > PRES_STATUS_MAX_INFO {
            return Err(Error::InvalidArg(format!(
                "too many presence tuples: {} (max {})",
                status.info.len(),
                PRES_STATUS_MAX_INFO
            )));
        }
        let ctx = ctx_of(&self.sub).ok_or(Error::NotFound("presence context"))?;
        let mut committed = status.clone();
        for info in &mut committed.info {
            if info.id.is_empty() {
                info.id = util::unique_string("tuple");
            }
        }
        ctx.status.lock().unwrap().committed = committed;
        Ok(())
    }

    /// The current status: the tentative one while a NOTIFY is being
    /// processed and not yet answered, else the committed one.
    pub fn status(&self) -> PresenceStatus {
        match ctx_of(&self.sub) {
            Some(ctx) => {
                let store = ctx.status.lock().unwrap();
                if store.tmp_valid {
                    store.tmp.clone()
                } else {
                    store.committed.clone()
                }
            }
            None => PresenceStatus::default(),
        }
    }

    /// Build a NOTIFY that moves the subscription to `state` and carries
    /// the committed status in the negotiated body format.
    pub fn notify(
        &self,
        state: EvsubState,
        state_str: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Arc<TxData>> {
        let ctx = ctx_of(&self.sub).ok_or(Error::NotFound("presence context"))?;
        if ctx.status.lock().unwrap().committed.info.is_empty() {
            return Err(Error::NoPresenceInfo);
        }

        let tdata = self.sub.notify(state, state_str, reason)?;
        let body = create_body(&ctx, self.sub.dialog())?;
        tdata.modify_msg(|msg| msg.set_body(body));
        Ok(tdata)
    }

    /// Build a NOTIFY reflecting the current state.
    pub fn current_notify(&self) -> Result<Arc<TxData>> {
        let state = self.sub.state();
        let reason = self.sub.termination_reason();
        self.notify(state, None, reason.as_deref())
    }
}

fn create_body(ctx: &Arc<PresCtx>, dlg: &Arc<Dialog>) -> Result<Body> {
    let entity = dlg.local_uri().to_string();
    if entity.len() > MAX_URL_SIZE {
        return Err(Error::InvalidArg(format!(
            "entity URI exceeds {} bytes",
            MAX_URL_SIZE
        )));
    }

    let content = *ctx.content.lock().unwrap();
    let store = ctx.status.lock().unwrap();

    match content {
        PresContent::Pidf => {
            let mut doc = pidf::create(&entity);
            for info in &store.committed.info {
                let tuple = pidf::add_tuple(&mut doc, &info.id);
                if !info.contact.is_empty() {
                    pidf::set_contact(tuple, &info.contact);
                }
                pidf::set_basic(tuple, info.basic_open);
            }
            Ok(Body::new(ContentType::pidf(), doc))
        }
        #[cfg(feature = "xpidf")]
        PresContent::Xpidf => {
            tracing::warn!("XPIDF format is not fully supported");
            let open = store
                .committed
                .info
                .first()
                .map(|i| i.basic_open)
                .unwrap_or(false);
            Ok(Body::new(ContentType::xpidf(), xpidf::create(&entity, open)))
        }
        #[cfg(not(feature = "xpidf"))]
        PresContent::Xpidf => Err(Error::BadContent(XPIDF_TYPE.into())),
        PresContent::None => Err(Error::BadContent(
            "no negotiated presence content type".into(),
        )),
    }
}

fn parse_pidf_body(text: &str) -> Result<PresenceStatus> {
    let doc = pidf::parse(text)?;
    let mut status = PresenceStatus::default();
    for tuple in pidf::tuples(&doc) {
        if status.info.len() == PRES_STATUS_MAX_INFO {
            tracing::warn!(
                max = PRES_STATUS_MAX_INFO,
                "PIDF document carries more tuples than the status can hold"
            );
            break;
        }
        status.info.push(PresenceInfo {
            id: pidf::tuple_id(tuple).to_owned(),
            contact: pidf::contact(tuple).unwrap_or("").to_owned(),
            basic_open: pidf::basic_open(tuple),
        });
    }
    Ok(status)
}

#[cfg(feature = "xpidf")]
fn parse_xpidf_body(text: &str) -> Result<PresenceStatus> {
    let doc = xpidf::parse(text)?;
    Ok(PresenceStatus {
        info: vec![PresenceInfo {
            id: String::new(),
            contact: xpidf::uri(&doc).unwrap_or("").to_owned(),
            basic_open: xpidf::status_open(&doc),
        }],
    })
}

fn parse_body(ctype: &ContentType, body: &Body) -> Result<PresenceStatus> {
    let bytes = body.print()?;
    let text = std::str::from_utf8(&bytes)
        .map_err(|_| Error::BadContent("body is not valid UTF-8".into()))?;

    if ContentType::pidf().matches(&ctype.to_string()) {
        return parse_pidf_body(text);
    }
    #[cfg(feature = "xpidf")]
    if ContentType::xpidf().matches(&ctype.to_string()) {
        return parse_xpidf_body(text);
    }
    Err(Error::BadContent(ctype.to_string()))
}

/// Glue between the subscription engine and the presence context: runs
/// the package defaults and forwards to the application hooks.
struct PresGlue;

impl EvsubUser for PresGlue {
    fn on_evsub_state(&self, sub: &Arc<Evsub>, old: EvsubState, new: EvsubState) {
        if let Some(ctx) = ctx_of(sub) {
            ctx.user.on_evsub_state(sub, old, new);
        }
    }

    fn on_tsx_state(&self, sub: &Arc<Evsub>, event: &TsxEvent<'_>) {
        if let Some(ctx) = ctx_of(sub) {
            ctx.user.on_tsx_state(sub, event);
        }
    }

    fn on_rx_refresh(&self, sub: &Arc<Evsub>, rdata: &RxData, resp: &mut NotifyResponse) {
        let Some(ctx) = ctx_of(sub) else {
            return;
        };
        if ctx.user.on_rx_refresh(sub, rdata, resp) {
            return;
        }

        // Default refresh behavior: a NOTIFY must go out reflecting the
        // state the refresh produced.
        let Ok(pres) = Pres::from_sub(sub.clone()) else {
            return;
        };
        let built = if sub.state() == EvsubState::Terminated {
            pres.notify(EvsubState::Terminated, None, Some("timeout"))
        } else {
            pres.current_notify()
        };
        match built.and_then(|tdata| pres.send_request(&tdata)) {
            Ok(()) => {}
            Err(e) => tracing::warn!(error = %e, "refresh NOTIFY failed"),
        }
    }

    fn on_rx_notify(&self, sub: &Arc<Evsub>, rdata: &RxData, resp: &mut NotifyResponse) {
        let Some(ctx) = ctx_of(sub) else {
            return;
        };
        let Some(msg) = rdata.msg() else {
            return;
        };

        let endpt_name = sub.endpoint().name().to_owned();
        let (ctype, body) = (msg.headers.content_type(), msg.body.as_ref());
        let (Some(ctype), Some(body)) = (ctype, body) else {
            resp.code = StatusCode::BAD_REQUEST;
            resp.headers.push(Header::Warning(Warning::miscellaneous(
                &endpt_name,
                "Message body is not present",
            )));
            return;
        };

        match parse_body(ctype, body) {
            Ok(status) => {
                {
                    let mut store = ctx.status.lock().unwrap();
                    store.tmp = status;
                    store.tmp_valid = true;
                }

                ctx.user.on_rx_notify(sub, rdata, resp);

                let mut store = ctx.status.lock().unwrap();
                if resp.code.is_success() {
                    store.committed = store.tmp.clone();
                }
                store.tmp_valid = false;
            }
            Err(e) => {
                resp.code = StatusCode::NOT_ACCEPTABLE;
                resp.reason = Some("Not Acceptable Here".into());
                resp.headers.push(Header::Accept(supported_types()));
                resp.headers.push(Header::Warning(Warning::miscellaneous(
                    &endpt_name,
                    &e.to_string(),
                )));
            }
        }
    }

    fn on_client_refresh(&self, sub: &Arc<Evsub>) -> bool {
        match ctx_of(sub) {
            Some(ctx) => ctx.user.on_client_refresh(sub),
            None => false,
        }
    }

    fn on_server_timeout(&self, sub: &Arc<Evsub>) -> bool {
        let Some(ctx) = ctx_of(sub) else {
            return false;
        };
        if ctx.user.on_server_timeout(sub) {
            return true;
        }

        let Ok(pres) = Pres::from_sub(sub.clone()) else {
            return false;
        };
        match pres
            .notify(EvsubState::Terminated, None, Some("timeout"))
            .and_then(|tdata| pres.send_request(&tdata))
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "timeout NOTIFY failed");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pidf_status_roundtrip() {
        let status = PresenceStatus {
            info: vec![
                PresenceInfo {
                    id: "id1".into(),
                    contact: "sip:a@x".into(),
                    basic_open: true,
                },
                PresenceInfo {
                    id: "id2".into(),
                    contact: "sip:b@y".into(),
                    basic_open: false,
                },
            ],
        };

        let mut doc = pidf::create("sip:alice@example.com");
        for info in &status.info {
            let tuple = pidf::add_tuple(&mut doc, &info.id);
            pidf::set_contact(tuple, &info.contact);
            pidf::set_basic(tuple, info.basic_open);
        }

        let recovered = parse_pidf_body(&doc.print()).unwrap();
        assert_eq!(recovered, status);
    }

    #[cfg(feature = "xpidf")]
    #[test]
    fn test_xpidf_status_roundtrip() {
        let doc = xpidf::create("sip:bob@example.net", true);
        let recovered = parse_xpidf_body(&doc.print()).unwrap();
        assert_eq!(recovered.info.len(), 1);
        assert_eq!(recovered.info[0].contact, "sip:bob@example.net");
        assert!(recovered.info[0].basic_open);
        // id is lost by the legacy format
        assert!(recovered.info[0].id.is_empty());
    }

    #[test]
    fn test_parse_body_rejects_unknown_type() {
        let body = Body::new(
            ContentType::new("application", "cpim-pidf+xml"),
            bytes::Bytes::from_static(b"<presence/>"),
        );
        let err = parse_body(&ContentType::new("application", "cpim-pidf+xml"), &body).unwrap_err();
        assert!(matches!(err, Error::BadContent(_)));
        assert_eq!(err.status_code(), Some(StatusCode::NOT_ACCEPTABLE));
    }

    #[test]
    fn test_parse_body_rejects_bad_pidf() {
        let body = Body::new(
            ContentType::pidf(),
            bytes::Bytes::from_static(b"this is not xml"),
        );
        let err = parse_body(&ContentType::pidf(), &body).unwrap_err();
        assert!(matches!(err, Error::BadPidf(_)));
    }

    #[test]
    fn test_status_basic_helper() {
        let status = PresenceStatus::basic(true);
        assert_eq!(status.info.len(), 1);
        assert!(status.info[0].basic_open);
    }
}
