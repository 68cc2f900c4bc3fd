//! Compile-time tunables for the signaling core.
//!
//! These mirror the classic SIP stack knobs: bounded tables, per-poll
//! fairness limits, and the presence package defaults. Runtime-adjustable
//! settings (strict sent-by checking, transport idle grace) live on the
//! endpoint builder instead.

use std::time::Duration;

/// Maximum number of simultaneously registered modules.
pub const MAX_MODULE: usize = 32;

/// Maximum number of pending entries in the timer heap.
pub const MAX_TIMER_COUNT: usize = 1024;

/// Maximum timer callbacks executed in a single poll.
pub const MAX_TIMED_OUT_ENTRIES: usize = 10;

/// Maximum network events processed per `handle_events` call, so timer
/// work is not starved by a continuously readable transport.
pub const MAX_NET_EVENTS: usize = 16;

/// Maximum number of live transports in the registry.
pub const MAX_TRANSPORTS: usize = 64;

/// Maximum printed packet length in bytes.
pub const MAX_PKT_LEN: usize = 1500;

/// Maximum printed URL length in bytes.
pub const MAX_URL_SIZE: usize = 256;

/// Maximum object (debug) name length.
pub const MAX_OBJ_NAME: usize = 32;

/// Value stamped into the standing Max-Forwards request header.
pub const MAX_FORWARDS_VALUE: u32 = 70;

/// Default subscription expiry for the presence package, seconds.
pub const PRES_DEFAULT_EXPIRES: u32 = 600;

/// Minimum acceptable subscription expiry, seconds. Below this the
/// notifier answers 423 Interval Too Brief.
pub const PRES_MIN_EXPIRES: u32 = 5;

/// Maximum tuples carried in one presence status.
pub const PRES_STATUS_MAX_INFO: usize = 8;

/// Margin subtracted from the negotiated expiry when scheduling a client
/// refresh, seconds.
pub const REFRESH_MARGIN: u32 = 5;

/// Grace period an unreferenced transport lingers before reclaim.
pub const TRANSPORT_IDLE_GRACE: Duration = Duration::from_secs(30);
