//! SIP signaling core: endpoint event loop, transport registry, event
//! subscriptions, and presence.
//!
//! The crate provides the engine room of a SIP stack. An [`Endpoint`]
//! owns the timer heap, the I/O queue, the resolver, and the transport
//! registry, and distributes parsed messages through a priority-ordered
//! module pipeline; the [`evsub`] module implements the RFC 3265
//! SUBSCRIBE/NOTIFY state machine on top of it, and [`presence`] is the
//! RFC 3856 package with PIDF/XPIDF bodies. The raw SIP grammar, the
//! transaction and dialog layers, and concrete sockets are external
//! collaborators reached through the traits in [`module`],
//! [`transport`], [`ioqueue`], and [`resolver`].
//!
//! # Example
//!
//! ```ignore
//! use siplink::{Endpoint, evsub::EvsubModule, presence};
//!
//! let endpt = Endpoint::builder().name("alice.example").build();
//! let module = EvsubModule::new();
//! presence::init(&module)?;
//! endpt.register_module(module.clone())?;
//!
//! loop {
//!     endpt.handle_events(Some(std::time::Duration::from_millis(100)))?;
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod dialog;
mod error;
pub mod endpoint;
pub mod evsub;
pub mod ioqueue;
pub mod loopback;
pub mod module;
pub mod msg;
pub mod parse;
pub mod pidf;
pub mod presence;
pub mod resolver;
pub mod timer;
pub mod transport;
mod util;
pub mod xml;
#[cfg(feature = "xpidf")]
pub mod xpidf;

pub use buffer::{RxData, TxData};
pub use endpoint::{CapabilityKind, Endpoint, EndpointBuilder};
pub use error::{Error, Result};
pub use module::Module;
pub use msg::{Header, Message, Method, StatusCode};
pub use transport::{Transport, TransportManager, TransportType};
