//! Minimal XML element tree for presence document bodies.
//!
//! Covers exactly what PIDF and XPIDF need: elements, attributes, child
//! elements, and character data with the five predefined entities. No
//! namespaces beyond verbatim attribute storage, no CDATA, no comments.
//! The reader is a winnow recursive-descent parser; the writer emits a
//! compact document.

use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::{take_till, take_while};

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::msg::BodyPayload;

type PResult<T> = core::result::Result<T, ErrMode<ContextError>>;

/// One XML element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    /// Concatenated character data, entity-decoded, whitespace-trimmed
    /// per text run.
    pub text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Element {
        Element {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set or replace an attribute.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        for (n, v) in &mut self.attrs {
            if *n == name {
                *v = value;
                return;
            }
        }
        self.attrs.push((name, value));
    }

    /// First child element with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All child elements with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Append a child and return a handle to it.
    pub fn add_child(&mut self, child: Element) -> &mut Element {
        self.children.push(child);
        self.children.last_mut().unwrap()
    }

    /// Descend along a path of child names.
    pub fn find(&self, path: &[&str]) -> Option<&Element> {
        let mut cur = self;
        for name in path {
            cur = cur.child(name)?;
        }
        Some(cur)
    }

    /// Serialize compactly, without a document prolog.
    pub fn print(&self) -> String {
        let mut out = String::new();
        self.print_into(&mut out);
        out
    }

    fn print_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (n, v) in &self.attrs {
            out.push(' ');
            out.push_str(n);
            out.push_str("=\"");
            out.push_str(&escape(v));
            out.push('"');
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(&self.text));
        for child in &self.children {
            child.print_into(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Parse a document. An XML declaration prolog is skipped.
    pub fn parse(input: &str) -> Result<Element> {
        let mut rest = input.trim_start();
        if rest.starts_with("<?") {
            match rest.find("?>") {
                Some(end) => rest = rest[end + 2..].trim_start(),
                None => return Err(Error::Parse("unterminated XML declaration".into())),
            }
        }
        let mut rest_ref = rest;
        let element = parse_element(&mut rest_ref)
            .map_err(|e| Error::Parse(format!("bad XML document: {}", e)))?;
        Ok(element)
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let entity = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&apos;", '\''),
        ]
        .iter()
        .find(|(e, _)| rest.starts_with(e));
        match entity {
            Some((e, c)) => {
                out.push(*c);
                rest = &rest[e.len()..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':' || c == '.'
}

fn parse_name<'a>(input: &mut &'a str) -> PResult<&'a str> {
    take_while(1.., is_name_char).parse_next(input)
}

fn skip_ws(input: &mut &str) {
    *input = input.trim_start();
}

fn parse_attr(input: &mut &str) -> PResult<(String, String)> {
    let name = parse_name.parse_next(input)?;
    skip_ws(input);
    let _ = '='.parse_next(input)?;
    skip_ws(input);
    let _ = '"'.parse_next(input)?;
    let value: &str = take_till(0.., '"').parse_next(input)?;
    let _ = '"'.parse_next(input)?;
    Ok((name.to_owned(), unescape(value)))
}

fn parse_element(input: &mut &str) -> PResult<Element> {
    let _ = '<'.parse_next(input)?;
    let name = parse_name.parse_next(input)?;
    let mut element = Element::new(name);

    loop {
        skip_ws(input);
        if input.starts_with("/>") {
            let _ = "/>".parse_next(input)?;
            return Ok(element);
        }
        if input.starts_with('>') {
            let _ = '>'.parse_next(input)?;
            break;
        }
        let attr = parse_attr.parse_next(input)?;
        element.attrs.push(attr);
    }

    // element content: character data and child elements until the
    // closing tag
    loop {
        if input.starts_with("</") {
            let _ = "</".parse_next(input)?;
            let close = parse_name.parse_next(input)?;
            if close != element.name {
                return Err(ErrMode::Cut(ContextError::new()));
            }
            skip_ws(input);
            let _ = '>'.parse_next(input)?;
            return Ok(element);
        }
        if input.starts_with('<') {
            let child = parse_element.parse_next(input)?;
            element.children.push(child);
            continue;
        }
        let text: &str = take_till(1.., '<').parse_next(input)?;
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            element.text.push_str(&unescape(trimmed));
        }
    }
}

impl BodyPayload for Element {
    fn print_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.extend_from_slice(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        buf.extend_from_slice(self.print().as_bytes());
        Ok(())
    }

    fn clone_payload(&self) -> Box<dyn BodyPayload> {
        Box::new(self.clone())
    }
}
