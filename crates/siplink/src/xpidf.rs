//! XPIDF legacy presence document helpers.
//!
//! The pre-standard single-status format some deployed peers still
//! speak. Support is deliberately partial: one presentity, one address,
//! an open/closed flag. Preferred output is PIDF; this codec exists for
//! interop and sits behind the `xpidf` feature.

use crate::error::{Error, Result};
use crate::util;
use crate::xml::Element;

/// Create an XPIDF document carrying a single basic status.
pub fn create(publisher_uri: &str, open: bool) -> Element {
    let mut doc = Element::new("presence");

    let mut presentity = Element::new("presentity");
    presentity.set_attr("uri", format!("{};method=SUBSCRIBE", publisher_uri));
    doc.add_child(presentity);

    let mut atom = Element::new("atom");
    atom.set_attr("id", util::unique_string("atom"));

    let mut address = Element::new("address");
    address.set_attr("uri", publisher_uri);
    let mut status = Element::new("status");
    status.set_attr("status", if open { "open" } else { "closed" });
    address.add_child(status);
    let mut msnsub = Element::new("msnsubstatus");
    msnsub.set_attr("substatus", if open { "online" } else { "offline" });
    address.add_child(msnsub);

    atom.add_child(address);
    doc.add_child(atom);
    doc
}

/// Parse an XPIDF document.
pub fn parse(text: &str) -> Result<Element> {
    let doc = Element::parse(text).map_err(|e| Error::BadXpidf(e.to_string()))?;
    if doc.name != "presence" {
        return Err(Error::BadXpidf(format!(
            "root element is <{}>, not <presence>",
            doc.name
        )));
    }
    if doc.child("presentity").is_none() && doc.child("atom").is_none() {
        return Err(Error::BadXpidf(
            "document has neither <presentity> nor <atom>".into(),
        ));
    }
    Ok(doc)
}

/// The publisher URI: the address URI when present, else the presentity
/// URI with its method suffix stripped.
pub fn uri(doc: &Element) -> Option<&str> {
    if let Some(address) = doc.find(&["atom", "address"]) {
        if let Some(uri) = address.attr("uri") {
            return Some(uri);
        }
    }
    doc.child("presentity")
        .and_then(|p| p.attr("uri"))
        .map(|u| u.split(';').next().unwrap_or(u))
}

/// The basic status flag.
pub fn status_open(doc: &Element) -> bool {
    doc.find(&["atom", "address", "status"])
        .and_then(|s| s.attr("status"))
        .is_some_and(|s| s.eq_ignore_ascii_case("open"))
}
