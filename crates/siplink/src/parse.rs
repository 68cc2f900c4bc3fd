//! Parser combinators for typed header values.
//!
//! The full SIP grammar is an external collaborator; these parsers cover
//! exactly the header values the core interprets (Via, CSeq, name-addr,
//! Event, Subscription-State, Content-Type) plus a minimal whole-message
//! reader used by the loopback transport and the test harness.
//!
//! Parsers are free functions in winnow style: they advance a mutable
//! `&str` reference and return the parsed value.

use winnow::ascii::digit1;
use winnow::combinator::opt;
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::{take_till, take_while};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::msg::{
    Body, CSeq, ContentType, EventHdr, Header, HostPort, Message, MessageLine, Method, NameAddr,
    SipUri, StatusCode, SubscriptionState, Via, Warning,
};

/// Result type for winnow parsers.
pub type PResult<T> = core::result::Result<T, ErrMode<ContextError>>;

fn cut<T>() -> PResult<T> {
    Err(ErrMode::Cut(ContextError::new()))
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_'
}

/// Parse a token (RFC 3261 `token`).
pub fn parse_token<'a>(input: &mut &'a str) -> PResult<&'a str> {
    take_while(1.., is_token_char).parse_next(input)
}

/// Parse a decimal number.
pub fn parse_u32(input: &mut &str) -> PResult<u32> {
    let digits: &str = digit1.parse_next(input)?;
    digits.parse().map_or_else(|_| cut(), Ok)
}

fn parse_u16(input: &mut &str) -> PResult<u16> {
    let digits: &str = digit1.parse_next(input)?;
    digits.parse().map_or_else(|_| cut(), Ok)
}

/// Parse `host[:port]`.
pub fn parse_host_port(input: &mut &str) -> PResult<HostPort> {
    let host: &str = take_while(1.., is_host_char).parse_next(input)?;
    let port = opt((':', parse_u16)).parse_next(input)?.map(|(_, p)| p);
    Ok(HostPort::new(host, port))
}

/// Parse `;name[=value]` parameter lists until the input ends or a
/// non-parameter character is hit.
fn parse_params(input: &mut &str) -> PResult<Vec<(String, Option<String>)>> {
    let mut params = Vec::new();
    while input.starts_with(';') {
        let _ = ';'.parse_next(input)?;
        let name = parse_token.parse_next(input)?;
        let value = opt(('=', take_till(0.., [';', '>', ',']))).parse_next(input)?;
        params.push((
            name.to_owned(),
            value.map(|(_, v): (char, &str)| v.trim().to_owned()),
        ));
    }
    Ok(params)
}

/// Parse a sip:/sips: URI down to user and host-port; URI parameters are
/// consumed and discarded.
pub fn parse_sip_uri(input: &mut &str) -> PResult<SipUri> {
    let secure = if input.starts_with("sips:") {
        let _ = "sips:".parse_next(input)?;
        true
    } else {
        let _ = "sip:".parse_next(input)?;
        false
    };

    // user part is present iff an '@' occurs before the URI ends
    let uri_end = input
        .find(['>', ';', ',', ' ', '\r'])
        .unwrap_or(input.len());
    let user = if input[..uri_end].contains('@') {
        let user: &str = take_while(1.., |c| c != '@').parse_next(input)?;
        let _ = '@'.parse_next(input)?;
        Some(user.to_owned())
    } else {
        None
    };

    let host_port = parse_host_port.parse_next(input)?;
    let _ = parse_params(input)?;

    Ok(SipUri {
        secure,
        user,
        host_port,
    })
}

/// Parse a name-addr: optional quoted display name, `<uri>`, parameters.
/// A bare URI (addr-spec) is accepted as well.
pub fn parse_name_addr(input: &mut &str) -> PResult<NameAddr> {
    *input = input.trim_start();

    let display = if input.starts_with('"') {
        let _ = '"'.parse_next(input)?;
        let name: &str = take_till(0.., '"').parse_next(input)?;
        let _ = '"'.parse_next(input)?;
        *input = input.trim_start();
        Some(name.to_owned())
    } else {
        None
    };

    let uri = if input.starts_with('<') {
        let _ = '<'.parse_next(input)?;
        let uri = parse_sip_uri.parse_next(input)?;
        let _ = '>'.parse_next(input)?;
        uri
    } else {
        parse_sip_uri.parse_next(input)?
    };

    let params = parse_params(input)?;

    Ok(NameAddr {
        display,
        uri,
        params,
    })
}

/// Parse a Via value: `SIP/2.0/UDP host:port;params`.
pub fn parse_via(input: &mut &str) -> PResult<Via> {
    let _ = "SIP/2.0/".parse_next(input)?;
    let transport = parse_token.parse_next(input)?;
    *input = input.trim_start();
    let sent_by = parse_host_port.parse_next(input)?;
    let params = parse_params(input)?;
    Ok(Via {
        transport: transport.to_owned(),
        sent_by,
        params,
    })
}

/// Parse a CSeq value: `42 SUBSCRIBE`.
pub fn parse_cseq(input: &mut &str) -> PResult<CSeq> {
    let seq = parse_u32.parse_next(input)?;
    *input = input.trim_start();
    let method = parse_token.parse_next(input)?;
    Ok(CSeq {
        seq,
        method: Method::from_token(method),
    })
}

/// Parse a Content-Type value down to `type/subtype`; media parameters
/// are discarded.
pub fn parse_content_type(input: &mut &str) -> PResult<ContentType> {
    let mtype = parse_token.parse_next(input)?;
    let _ = '/'.parse_next(input)?;
    let subtype = parse_token.parse_next(input)?;
    let _ = parse_params(input)?;
    Ok(ContentType {
        mtype: mtype.to_owned(),
        subtype: subtype.to_owned(),
    })
}

/// Parse an Event value: `presence;id=abc`.
pub fn parse_event(input: &mut &str) -> PResult<EventHdr> {
    let event_type = parse_token.parse_next(input)?;
    let params = parse_params(input)?;
    let id = params
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("id"))
        .and_then(|(_, v)| v);
    Ok(EventHdr {
        event_type: event_type.to_owned(),
        id,
    })
}

/// Parse a Subscription-State value: `active;expires=240`,
/// `terminated;reason=timeout`.
pub fn parse_subscription_state(input: &mut &str) -> PResult<SubscriptionState> {
    let state = parse_token.parse_next(input)?;
    let params = parse_params(input)?;
    let mut expires = None;
    let mut reason = None;
    for (name, value) in params {
        if name.eq_ignore_ascii_case("expires") {
            expires = value.as_deref().and_then(|v| v.parse().ok());
        } else if name.eq_ignore_ascii_case("reason") {
            reason = value;
        }
    }
    Ok(SubscriptionState {
        state: state.to_owned(),
        expires,
        reason,
    })
}

/// Parse a Warning value: `399 host "text"`.
pub fn parse_warning(input: &mut &str) -> PResult<Warning> {
    let code = parse_u16.parse_next(input)?;
    *input = input.trim_start();
    let agent: &str = take_till(1.., ' ').parse_next(input)?;
    *input = input.trim_start();
    let _ = '"'.parse_next(input)?;
    let text: &str = take_till(0.., '"').parse_next(input)?;
    let _ = '"'.parse_next(input)?;
    Ok(Warning {
        code,
        agent: agent.to_owned(),
        text: text.to_owned(),
    })
}

fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect()
}

fn typed_header(name: &str, value: &str, errors: &mut Vec<String>) -> Header {
    fn run<T>(
        parser: impl Fn(&mut &str) -> PResult<T>,
        name: &str,
        value: &str,
        errors: &mut Vec<String>,
        wrap: impl Fn(T) -> Header,
    ) -> Header {
        let mut input = value;
        match parser(&mut input) {
            Ok(v) => wrap(v),
            Err(e) => {
                errors.push(format!("bad {} header: {}", name, e));
                Header::Other(name.to_owned(), value.to_owned())
            }
        }
    }

    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "via" | "v" => run(parse_via, "Via", value, errors, Header::Via),
        "from" | "f" => run(parse_name_addr, "From", value, errors, Header::From),
        "to" | "t" => run(parse_name_addr, "To", value, errors, Header::To),
        "contact" | "m" => run(parse_name_addr, "Contact", value, errors, Header::Contact),
        "route" => run(parse_name_addr, "Route", value, errors, Header::Route),
        "record-route" => run(
            parse_name_addr,
            "Record-Route",
            value,
            errors,
            Header::RecordRoute,
        ),
        "call-id" | "i" => Header::CallId(value.to_owned()),
        "cseq" => run(parse_cseq, "CSeq", value, errors, Header::CSeq),
        "max-forwards" => run(parse_u32, "Max-Forwards", value, errors, Header::MaxForwards),
        "expires" => run(parse_u32, "Expires", value, errors, Header::Expires),
        "min-expires" => run(parse_u32, "Min-Expires", value, errors, Header::MinExpires),
        "event" | "o" => run(parse_event, "Event", value, errors, Header::Event),
        "subscription-state" => run(
            parse_subscription_state,
            "Subscription-State",
            value,
            errors,
            Header::SubscriptionState,
        ),
        "content-type" | "c" => run(
            parse_content_type,
            "Content-Type",
            value,
            errors,
            Header::ContentType,
        ),
        "accept" => Header::Accept(comma_list(value)),
        "allow" => Header::Allow(comma_list(value)),
        "supported" | "k" => Header::Supported(comma_list(value)),
        "warning" => run(parse_warning, "Warning", value, errors, Header::Warning),
        _ => Header::Other(name.to_owned(), value.to_owned()),
    }
}

fn parse_start_line(line: &str) -> Result<MessageLine> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let (code, reason) = rest
            .split_once(' ')
            .map(|(c, r)| (c, Some(r.to_owned())))
            .unwrap_or((rest, None));
        let code: u16 = code
            .parse()
            .map_err(|_| Error::Parse(format!("bad status line: {}", line)))?;
        return Ok(MessageLine::Status {
            code: StatusCode(code),
            reason,
        });
    }

    let mut parts = line.split(' ');
    let (Some(method), Some(uri), Some("SIP/2.0")) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Parse(format!("bad request line: {}", line)));
    };
    let mut uri_input = uri;
    let uri = parse_sip_uri(&mut uri_input)
        .map_err(|e| Error::Parse(format!("bad request uri: {}", e)))?;
    Ok(MessageLine::Request {
        method: Method::from_token(method),
        uri,
    })
}

/// Parse a whole message from wire text.
///
/// Returns the structured message together with the list of per-header
/// parse errors; a header whose value fails to parse is kept verbatim as
/// an uninterpreted header and reported in the error list, matching the
/// keep-going contract of the external parser. A malformed start line is
/// fatal.
pub fn parse_message(input: &str) -> Result<(Message, Vec<String>)> {
    let (head, body_text) = input
        .split_once("\r\n\r\n")
        .ok_or_else(|| Error::Parse("missing header terminator".into()))?;

    let mut lines = head.split("\r\n");
    let start = lines
        .next()
        .ok_or_else(|| Error::Parse("empty message".into()))?;
    let line = parse_start_line(start)?;

    let mut errors = Vec::new();
    let mut msg = Message {
        line,
        headers: Default::default(),
        body: None,
    };

    let mut content_length: Option<usize> = None;
    for raw in lines {
        if raw.is_empty() {
            continue;
        }
        let Some((name, value)) = raw.split_once(':') else {
            errors.push(format!("malformed header line: {}", raw));
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("content-length") || name == "l" {
            content_length = value.parse().ok();
            continue;
        }
        msg.headers.push(typed_header(name, value, &mut errors));
    }

    let body_len = content_length.unwrap_or(body_text.len()).min(body_text.len());
    if body_len > 0 {
        let ctype = msg
            .headers
            .content_type()
            .cloned()
            .unwrap_or_else(|| ContentType::new("text", "plain"));
        msg.body = Some(Body::new(
            ctype,
            Bytes::copy_from_slice(&body_text.as_bytes()[..body_len]),
        ));
    }

    Ok((msg, errors))
}
