//! Structured SIP message model.
//!
//! This is the contract surface between the core and the external
//! parser/printer: requests and responses with a typed header list and an
//! optional body. The full SIP grammar lives outside the core; what is
//! modeled here is exactly the set of headers the endpoint, the
//! subscription engine, and the presence package read and write.
//!
//! Messages print themselves to wire form with [`Message::print_into`];
//! `Content-Length` is computed at print time, never stored.

use std::fmt;

use bytes::BytesMut;

use crate::error::{Error, Result};

/// SIP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Subscribe,
    Notify,
    Message,
    /// Any other method, stored verbatim.
    Other(String),
}

impl Method {
    /// The canonical (upper-case) method token.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Register => "REGISTER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Message => "MESSAGE",
            Method::Other(s) => s,
        }
    }

    /// Map a method token to the typed variant. Method names are
    /// case-sensitive on the wire; unknown tokens land in `Other`.
    pub fn from_token(token: &str) -> Method {
        match token {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "REGISTER" => Method::Register,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "MESSAGE" => Method::Message,
            other => Method::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SIP response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const TRYING: StatusCode = StatusCode(100);
    pub const OK: StatusCode = StatusCode(200);
    pub const ACCEPTED: StatusCode = StatusCode(202);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const NOT_ACCEPTABLE: StatusCode = StatusCode(406);
    pub const INTERVAL_TOO_BRIEF: StatusCode = StatusCode(423);
    pub const CALL_OR_TSX_DOES_NOT_EXIST: StatusCode = StatusCode(481);
    pub const BAD_EVENT: StatusCode = StatusCode(489);
    pub const SERVER_ERROR: StatusCode = StatusCode(500);

    /// True for 2xx codes.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }

    /// The default reason phrase for this code.
    pub fn reason_phrase(self) -> &'static str {
        match self.0 {
            100 => "Trying",
            180 => "Ringing",
            200 => "OK",
            202 => "Accepted",
            400 => "Bad Request",
            404 => "Not Found",
            406 => "Not Acceptable",
            408 => "Request Timeout",
            423 => "Interval Too Brief",
            481 => "Call/Transaction Does Not Exist",
            489 => "Bad Event",
            500 => "Server Internal Error",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A host with an optional port, as it appears in URIs and Via sent-by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: Option<u16>,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        HostPort {
            host: host.into(),
            port,
        }
    }

    /// The port, or the given default when absent.
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    /// Case-insensitive host comparison.
    pub fn same_host(&self, other: &str) -> bool {
        self.host.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(p) => write!(f, "{}:{}", self.host, p),
            None => f.write_str(&self.host),
        }
    }
}

/// A sip:/sips: URI, reduced to the parts the core routes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub secure: bool,
    pub user: Option<String>,
    pub host_port: HostPort,
}

impl SipUri {
    pub fn new(user: Option<&str>, host: &str, port: Option<u16>) -> Self {
        SipUri {
            secure: false,
            user: user.map(str::to_owned),
            host_port: HostPort::new(host, port),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.secure { "sips:" } else { "sip:" })?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host_port)
    }
}

/// A name-addr with parameters: From, To, Contact, Route, Record-Route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display: Option<String>,
    pub uri: SipUri,
    /// Header parameters after the closing angle bracket.
    pub params: Vec<(String, Option<String>)>,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        NameAddr {
            display: None,
            uri,
            params: Vec::new(),
        }
    }

    /// Look up a parameter value by name, case-insensitively.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// The `tag` parameter.
    pub fn tag(&self) -> Option<&str> {
        self.param("tag")
    }

    /// Set or replace the `tag` parameter.
    pub fn set_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        for (n, v) in &mut self.params {
            if n.eq_ignore_ascii_case("tag") {
                *v = Some(tag);
                return;
            }
        }
        self.params.push(("tag".into(), Some(tag)));
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(d) = &self.display {
            write!(f, "\"{}\" ", d)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (n, v) in &self.params {
            match v {
                Some(v) => write!(f, ";{}={}", n, v)?,
                None => write!(f, ";{}", n)?,
            }
        }
        Ok(())
    }
}

/// A Via header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    /// Transport token, e.g. "UDP".
    pub transport: String,
    pub sent_by: HostPort,
    pub params: Vec<(String, Option<String>)>,
}

impl Via {
    pub fn new(transport: &str, sent_by: HostPort, branch: String) -> Self {
        Via {
            transport: transport.to_owned(),
            sent_by,
            params: vec![("branch".into(), Some(branch))],
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch")
    }

    /// The `rport` parameter value, when present and numeric.
    pub fn rport(&self) -> Option<u16> {
        self.param("rport").and_then(|v| v.parse().ok())
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by)?;
        for (n, v) in &self.params {
            match v {
                Some(v) => write!(f, ";{}={}", n, v)?,
                None => write!(f, ";{}", n)?,
            }
        }
        Ok(())
    }
}

/// A CSeq header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// A media type, e.g. `application/pidf+xml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub mtype: String,
    pub subtype: String,
}

impl ContentType {
    pub fn new(mtype: &str, subtype: &str) -> Self {
        ContentType {
            mtype: mtype.to_owned(),
            subtype: subtype.to_owned(),
        }
    }

    /// `application/pidf+xml`
    pub fn pidf() -> Self {
        ContentType::new("application", "pidf+xml")
    }

    /// `application/xpidf+xml`
    pub fn xpidf() -> Self {
        ContentType::new("application", "xpidf+xml")
    }

    /// Case-insensitive comparison against a `type/subtype` string.
    pub fn matches(&self, full: &str) -> bool {
        full.split_once('/').is_some_and(|(t, s)| {
            self.mtype.eq_ignore_ascii_case(t) && self.subtype.eq_ignore_ascii_case(s)
        })
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mtype, self.subtype)
    }
}

/// An Event header value (RFC 3265).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHdr {
    pub event_type: String,
    pub id: Option<String>,
}

impl EventHdr {
    pub fn new(event_type: &str) -> Self {
        EventHdr {
            event_type: event_type.to_owned(),
            id: None,
        }
    }
}

impl fmt::Display for EventHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.event_type)?;
        if let Some(id) = &self.id {
            write!(f, ";id={}", id)?;
        }
        Ok(())
    }
}

/// A Subscription-State header value (RFC 3265).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    /// State token: `active`, `pending`, `terminated`, or an extension.
    pub state: String,
    pub expires: Option<u32>,
    pub reason: Option<String>,
}

impl SubscriptionState {
    pub fn active(expires: u32) -> Self {
        SubscriptionState {
            state: "active".into(),
            expires: Some(expires),
            reason: None,
        }
    }

    pub fn pending(expires: u32) -> Self {
        SubscriptionState {
            state: "pending".into(),
            expires: Some(expires),
            reason: None,
        }
    }

    pub fn terminated(reason: Option<&str>) -> Self {
        SubscriptionState {
            state: "terminated".into(),
            expires: None,
            reason: reason.map(str::to_owned),
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.state)?;
        if let Some(e) = self.expires {
            write!(f, ";expires={}", e)?;
        }
        if let Some(r) = &self.reason {
            write!(f, ";reason={}", r)?;
        }
        Ok(())
    }
}

/// A Warning header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub code: u16,
    /// Warn-agent, conventionally the endpoint name.
    pub agent: String,
    pub text: String,
}

impl Warning {
    /// The catch-all miscellaneous warning code used for package-level
    /// rejections.
    pub fn miscellaneous(agent: &str, text: &str) -> Self {
        Warning {
            code: 399,
            agent: agent.to_owned(),
            text: text.to_owned(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} \"{}\"", self.code, self.agent, self.text)
    }
}

/// One typed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Via(Via),
    From(NameAddr),
    To(NameAddr),
    Contact(NameAddr),
    Route(NameAddr),
    RecordRoute(NameAddr),
    CallId(String),
    CSeq(CSeq),
    MaxForwards(u32),
    Expires(u32),
    MinExpires(u32),
    Event(EventHdr),
    SubscriptionState(SubscriptionState),
    ContentType(ContentType),
    Accept(Vec<String>),
    Allow(Vec<String>),
    Supported(Vec<String>),
    Warning(Warning),
    /// Any header the core does not interpret, stored verbatim.
    Other(String, String),
}

impl Header {
    /// The wire name of this header.
    pub fn name(&self) -> &str {
        match self {
            Header::Via(_) => "Via",
            Header::From(_) => "From",
            Header::To(_) => "To",
            Header::Contact(_) => "Contact",
            Header::Route(_) => "Route",
            Header::RecordRoute(_) => "Record-Route",
            Header::CallId(_) => "Call-ID",
            Header::CSeq(_) => "CSeq",
            Header::MaxForwards(_) => "Max-Forwards",
            Header::Expires(_) => "Expires",
            Header::MinExpires(_) => "Min-Expires",
            Header::Event(_) => "Event",
            Header::SubscriptionState(_) => "Subscription-State",
            Header::ContentType(_) => "Content-Type",
            Header::Accept(_) => "Accept",
            Header::Allow(_) => "Allow",
            Header::Supported(_) => "Supported",
            Header::Warning(_) => "Warning",
            Header::Other(name, _) => name,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.name())?;
        match self {
            Header::Via(v) => write!(f, "{}", v),
            Header::From(a) | Header::To(a) | Header::Contact(a) | Header::Route(a)
            | Header::RecordRoute(a) => write!(f, "{}", a),
            Header::CallId(s) => f.write_str(s),
            Header::CSeq(c) => write!(f, "{}", c),
            Header::MaxForwards(n) | Header::Expires(n) | Header::MinExpires(n) => {
                write!(f, "{}", n)
            }
            Header::Event(e) => write!(f, "{}", e),
            Header::SubscriptionState(s) => write!(f, "{}", s),
            Header::ContentType(c) => write!(f, "{}", c),
            Header::Accept(v) | Header::Allow(v) | Header::Supported(v) => {
                f.write_str(&v.join(", "))
            }
            Header::Warning(w) => write!(f, "{}", w),
            Header::Other(_, value) => f.write_str(value),
        }
    }
}

/// Ordered header list with typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, hdr: Header) {
        self.0.push(hdr);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Replace the first header matching `pred`, or append.
    pub fn replace(&mut self, hdr: Header, pred: impl Fn(&Header) -> bool) {
        match self.0.iter_mut().find(|h| pred(h)) {
            Some(slot) => *slot = hdr,
            None => self.0.push(hdr),
        }
    }

    /// Remove all headers matching `pred`.
    pub fn retain(&mut self, pred: impl Fn(&Header) -> bool) {
        self.0.retain(pred);
    }

    pub fn call_id(&self) -> Option<&str> {
        self.0.iter().find_map(|h| match h {
            Header::CallId(id) => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn from(&self) -> Option<&NameAddr> {
        self.0.iter().find_map(|h| match h {
            Header::From(a) => Some(a),
            _ => None,
        })
    }

    pub fn to(&self) -> Option<&NameAddr> {
        self.0.iter().find_map(|h| match h {
            Header::To(a) => Some(a),
            _ => None,
        })
    }

    pub fn to_mut(&mut self) -> Option<&mut NameAddr> {
        self.0.iter_mut().find_map(|h| match h {
            Header::To(a) => Some(a),
            _ => None,
        })
    }

    pub fn contact(&self) -> Option<&NameAddr> {
        self.0.iter().find_map(|h| match h {
            Header::Contact(a) => Some(a),
            _ => None,
        })
    }

    /// The topmost Via.
    pub fn via_top(&self) -> Option<&Via> {
        self.0.iter().find_map(|h| match h {
            Header::Via(v) => Some(v),
            _ => None,
        })
    }

    pub fn via_top_mut(&mut self) -> Option<&mut Via> {
        self.0.iter_mut().find_map(|h| match h {
            Header::Via(v) => Some(v),
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<&CSeq> {
        self.0.iter().find_map(|h| match h {
            Header::CSeq(c) => Some(c),
            _ => None,
        })
    }

    pub fn expires(&self) -> Option<u32> {
        self.0.iter().find_map(|h| match h {
            Header::Expires(e) => Some(*e),
            _ => None,
        })
    }

    pub fn event(&self) -> Option<&EventHdr> {
        self.0.iter().find_map(|h| match h {
            Header::Event(e) => Some(e),
            _ => None,
        })
    }

    pub fn subscription_state(&self) -> Option<&SubscriptionState> {
        self.0.iter().find_map(|h| match h {
            Header::SubscriptionState(s) => Some(s),
            _ => None,
        })
    }

    pub fn content_type(&self) -> Option<&ContentType> {
        self.0.iter().find_map(|h| match h {
            Header::ContentType(c) => Some(c),
            _ => None,
        })
    }

    /// Values of the first Accept header, if any.
    pub fn accept(&self) -> Option<&[String]> {
        self.0.iter().find_map(|h| match h {
            Header::Accept(v) => Some(v.as_slice()),
            _ => None,
        })
    }

    /// Record-Route entries in message order.
    pub fn record_routes(&self) -> impl Iterator<Item = &NameAddr> {
        self.0.iter().filter_map(|h| match h {
            Header::RecordRoute(a) => Some(a),
            _ => None,
        })
    }

    /// An uninterpreted header value by name, case-insensitively.
    pub fn other(&self, name: &str) -> Option<&str> {
        self.0.iter().find_map(|h| match h {
            Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.as_str()),
            _ => None,
        })
    }
}

/// Pluggable payload behind a message body: knows how to print itself to
/// the wire and how to deep-copy itself.
pub trait BodyPayload: Send + Sync {
    /// Append the wire form of the payload.
    fn print_into(&self, buf: &mut BytesMut) -> Result<()>;

    /// Deep-copy the payload.
    fn clone_payload(&self) -> Box<dyn BodyPayload>;
}

impl BodyPayload for bytes::Bytes {
    fn print_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.extend_from_slice(self);
        Ok(())
    }

    fn clone_payload(&self) -> Box<dyn BodyPayload> {
        Box::new(self.clone())
    }
}

/// A message body: media type plus payload.
pub struct Body {
    pub content_type: ContentType,
    payload: Box<dyn BodyPayload>,
}

impl Body {
    pub fn new(content_type: ContentType, payload: impl BodyPayload + 'static) -> Self {
        Body {
            content_type,
            payload: Box::new(payload),
        }
    }

    /// Print the payload to bytes.
    pub fn print(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        self.payload.print_into(&mut buf)?;
        Ok(buf)
    }

    /// Borrow the payload for downcasting by body codecs.
    pub fn payload(&self) -> &dyn BodyPayload {
        &*self.payload
    }
}

impl Clone for Body {
    fn clone(&self) -> Self {
        Body {
            content_type: self.content_type.clone(),
            payload: self.payload.clone_payload(),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Request line or status line.
#[derive(Debug, Clone)]
pub enum MessageLine {
    Request {
        method: Method,
        uri: SipUri,
    },
    Status {
        code: StatusCode,
        reason: Option<String>,
    },
}

impl MessageLine {
    pub fn is_request(&self) -> bool {
        matches!(self, MessageLine::Request { .. })
    }
}

/// A structured SIP message.
#[derive(Debug, Clone)]
pub struct Message {
    pub line: MessageLine,
    pub headers: Headers,
    pub body: Option<Body>,
}

impl Message {
    /// A request skeleton with an empty header list.
    pub fn request(method: Method, uri: SipUri) -> Self {
        Message {
            line: MessageLine::Request { method, uri },
            headers: Headers::new(),
            body: None,
        }
    }

    /// A response skeleton with an empty header list.
    pub fn response(code: StatusCode, reason: Option<String>) -> Self {
        Message {
            line: MessageLine::Status { code, reason },
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.line.is_request()
    }

    /// The request method, when this is a request.
    pub fn method(&self) -> Option<&Method> {
        match &self.line {
            MessageLine::Request { method, .. } => Some(method),
            MessageLine::Status { .. } => None,
        }
    }

    /// The response status code, when this is a response.
    pub fn status(&self) -> Option<StatusCode> {
        match &self.line {
            MessageLine::Status { code, .. } => Some(*code),
            MessageLine::Request { .. } => None,
        }
    }

    /// Attach a body and keep the Content-Type header in sync.
    pub fn set_body(&mut self, body: Body) {
        let ctype = body.content_type.clone();
        self.headers.replace(Header::ContentType(ctype), |h| {
            matches!(h, Header::ContentType(_))
        });
        self.body = Some(body);
    }

    /// A one-line description of the message for log output,
    /// e.g. `Request msg NOTIFY/cseq=2 (call-id abc)`.
    pub fn info(&self) -> String {
        let cseq = self
            .headers
            .cseq()
            .map(|c| c.seq.to_string())
            .unwrap_or_else(|| "?".into());
        let call_id = self.headers.call_id().unwrap_or("?");
        match &self.line {
            MessageLine::Request { method, .. } => {
                format!("Request msg {}/cseq={} (call-id {})", method, cseq, call_id)
            }
            MessageLine::Status { code, .. } => {
                format!("Response msg {}/cseq={} (call-id {})", code, cseq, call_id)
            }
        }
    }

    /// Print the message to wire form. `Content-Length` is computed from
    /// the printed body.
    pub fn print_into(&self, buf: &mut BytesMut) -> Result<()> {
        use std::fmt::Write;

        let mut head = String::new();
        match &self.line {
            MessageLine::Request { method, uri } => {
                write!(head, "{} {} SIP/2.0\r\n", method, uri)
            }
            MessageLine::Status { code, reason } => {
                let reason = reason.as_deref().unwrap_or_else(|| code.reason_phrase());
                write!(head, "SIP/2.0 {} {}\r\n", code, reason)
            }
        }
        .map_err(|e| Error::InvalidArg(e.to_string()))?;

        for hdr in self.headers.iter() {
            write!(head, "{}\r\n", hdr).map_err(|e| Error::InvalidArg(e.to_string()))?;
        }

        let body = match &self.body {
            Some(body) => Some(body.print()?),
            None => None,
        };
        let body_len = body.as_ref().map(|b| b.len()).unwrap_or(0);
        write!(head, "Content-Length: {}\r\n\r\n", body_len)
            .map_err(|e| Error::InvalidArg(e.to_string()))?;

        buf.extend_from_slice(head.as_bytes());
        if let Some(body) = body {
            buf.extend_from_slice(&body);
        }
        Ok(())
    }
}
