//! PIDF (RFC 3863) presence document helpers.
//!
//! Thin typed layer over the XML element tree: building a `<presence>`
//! document tuple by tuple, and reading tuples back out of a received
//! one.

use crate::error::{Error, Result};
use crate::xml::Element;

/// The PIDF namespace.
pub const XMLNS: &str = "urn:ietf:params:xml:ns:pidf";

/// Create an empty `<presence>` document for the given entity.
pub fn create(entity: &str) -> Element {
    let mut doc = Element::new("presence");
    doc.set_attr("xmlns", XMLNS);
    doc.set_attr("entity", entity);
    doc
}

/// Parse a PIDF document.
pub fn parse(text: &str) -> Result<Element> {
    let doc = Element::parse(text).map_err(|e| Error::BadPidf(e.to_string()))?;
    if doc.name != "presence" {
        return Err(Error::BadPidf(format!(
            "root element is <{}>, not <presence>",
            doc.name
        )));
    }
    Ok(doc)
}

/// The document entity.
pub fn entity(doc: &Element) -> Option<&str> {
    doc.attr("entity")
}

/// Append a `<tuple>` with the given id and return a handle to it.
pub fn add_tuple<'a>(doc: &'a mut Element, id: &str) -> &'a mut Element {
    let mut tuple = Element::new("tuple");
    tuple.set_attr("id", id);
    doc.add_child(tuple)
}

/// All `<tuple>` children.
pub fn tuples(doc: &Element) -> impl Iterator<Item = &Element> {
    doc.children_named("tuple")
}

/// Set a tuple's `<contact>`.
pub fn set_contact(tuple: &mut Element, contact: &str) {
    if let Some(el) = tuple.children.iter_mut().find(|c| c.name == "contact") {
        el.text = contact.to_owned();
        return;
    }
    let mut el = Element::new("contact");
    el.text = contact.to_owned();
    tuple.add_child(el);
}

/// Set a tuple's `<status><basic>` to open or closed.
pub fn set_basic(tuple: &mut Element, open: bool) {
    let text = if open { "open" } else { "closed" };
    if let Some(status) = tuple.children.iter_mut().find(|c| c.name == "status") {
        if let Some(basic) = status.children.iter_mut().find(|c| c.name == "basic") {
            basic.text = text.into();
            return;
        }
        let mut basic = Element::new("basic");
        basic.text = text.into();
        status.add_child(basic);
        return;
    }
    let mut status = Element::new("status");
    let mut basic = Element::new("basic");
    basic.text = text.into();
    status.add_child(basic);
    tuple.add_child(status);
}

/// A tuple's id attribute; empty when absent.
pub fn tuple_id(tuple: &Element) -> &str {
    tuple.attr("id").unwrap_or("")
}

/// A tuple's `<contact>` text.
pub fn contact(tuple: &Element) -> Option<&str> {
    tuple.child("contact").map(|c| c.text.as_str())
}

/// A tuple's `<status><basic>` value. Absent status reads as closed.
pub fn basic_open(tuple: &Element) -> bool {
    tuple
        .find(&["status", "basic"])
        .is_some_and(|b| b.text.eq_ignore_ascii_case("open"))
}
