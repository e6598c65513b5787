//! Fencing client engine.
//!
//! Two halves:
//!
//! - [`action`] runs fence agents locally: argument building, process-group
//!   management with SIGTERM/SIGKILL escalation, retry within a time budget,
//!   and result classification.
//! - [`client`] talks to the fencing coordinator over its Unix socket:
//!   registration, synchronous and asynchronous commands, per-call callbacks
//!   with timers, and event subscriptions.

pub mod action;
pub mod client;
pub mod config;
pub mod error;

pub use action::{ActionOutcome, AgentNamespace, FenceAction, Victim};
pub use client::{CallOptions, ConnectionMode, FencerClient, NodeRef};
pub use config::{AgentSettings, FencingConfig};
pub use error::{FenceError, Result};
