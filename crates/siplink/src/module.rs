//! Pluggable endpoint modules.
//!
//! A module participates in message dispatch: received messages are
//! offered to modules in priority order until one claims them, and
//! outgoing messages pass every module in reverse priority order before
//! they reach the wire. Transaction layers, dialog usages, and
//! applications all plug in through this one trait.

use std::sync::Arc;

use crate::buffer::{RxData, TxData};
use crate::endpoint::Endpoint;
use crate::error::Result;

/// Standard priority tiers. Lower values are offered received messages
/// earlier; ties keep registration order.
pub mod priority {
    /// Transaction layer.
    pub const TSX_LAYER: u32 = 8;
    /// UA and proxy layers.
    pub const UA_PROXY_LAYER: u32 = 16;
    /// Dialog usages (event subscriptions and friends).
    pub const DIALOG_USAGE: u32 = 24;
    /// Applications.
    pub const APPLICATION: u32 = 32;
}

/// An endpoint module. All hooks are optional; the defaults decline
/// received messages and pass outgoing ones through.
///
/// Rx and tx hooks run under the endpoint's module lock: a hook must not
/// register or unregister modules.
pub trait Module: Send + Sync {
    /// Stable module name, unique case-insensitively among registered
    /// modules.
    fn name(&self) -> &str;

    /// Dispatch priority; see [`priority`].
    fn priority(&self) -> u32;

    /// Called while the module is being registered.
    fn load(&self, _endpt: &Endpoint) -> Result<()> {
        Ok(())
    }

    /// Called after `load` during registration.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the module is being unregistered. A failure keeps the
    /// module registered.
    fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Called after `stop` during unregistration. A failure keeps the
    /// module registered.
    fn unload(&self) -> Result<()> {
        Ok(())
    }

    /// Offer a received request. Return `true` to claim it and stop the
    /// walk.
    fn on_rx_request(&self, _endpt: &Endpoint, _rdata: &RxData) -> bool {
        false
    }

    /// Offer a received response. Return `true` to claim it and stop the
    /// walk.
    fn on_rx_response(&self, _endpt: &Endpoint, _rdata: &RxData) -> bool {
        false
    }

    /// Inspect or amend an outgoing request. An error stops the send and
    /// propagates to the sender.
    fn on_tx_request(&self, _endpt: &Endpoint, _tdata: &Arc<TxData>) -> Result<()> {
        Ok(())
    }

    /// Inspect or amend an outgoing response. An error stops the send
    /// and propagates to the sender.
    fn on_tx_response(&self, _endpt: &Endpoint, _tdata: &Arc<TxData>) -> Result<()> {
        Ok(())
    }
}
