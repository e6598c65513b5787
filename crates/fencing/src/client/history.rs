//! One-shot helpers built on the client: fence a node, or ask when it was last fenced.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tracing::{error, info};

use super::message::{HistoryEntry, HistoryState};
use super::options::CallOptions;
use super::{ConnectionMode, FencerClient};
use crate::config::FencingConfig;
use crate::error::Result;

const HISTORY_TIMEOUT: Duration = Duration::from_secs(120);

/// A node, by name or by cluster node id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    Name(String),
    Id(u32),
}

impl NodeRef {
    /// Target string sent to the fencer, plus the option bits it needs.
    fn target(&self, options: CallOptions) -> (String, CallOptions) {
        match self {
            Self::Name(name) => (name.clone(), options),
            Self::Id(id) => (id.to_string(), options.with_cs_nodeid(true)),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Id(id) => write!(f, "node id {id}"),
        }
    }
}

/// When the node behind `entries` was last fenced.
///
/// With `in_progress`, an operation still pending counts as happening `now`.
/// Otherwise the latest completion of a successful operation is returned.
pub fn last_fenced(
    entries: &[HistoryEntry],
    in_progress: bool,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if in_progress {
        return entries
            .iter()
            .any(|e| e.state == HistoryState::Pending)
            .then_some(now);
    }
    entries
        .iter()
        .filter(|e| e.state == HistoryState::Done)
        .filter_map(|e| e.completed)
        .max()
}

/// Connect, fence `node` with `reboot` (or `off`), and disconnect.
pub async fn kick(
    config: &FencingConfig,
    node: &NodeRef,
    timeout: Duration,
    off: bool,
) -> Result<()> {
    let action = if off { "off" } else { "reboot" };
    let client = FencerClient::new(config.clone());
    if let Err(e) = client.connect(ConnectionMode::Command).await {
        error!(node = %node, action, error = %e, "Connection failed, could not kick node");
        return Err(e);
    }

    let (target, options) = node.target(CallOptions::sync().with_allow_suicide(true));
    let result = client
        .fence(options, &target, action, timeout, Duration::ZERO)
        .await
        .map(|_| ());
    match &result {
        Ok(()) => info!(node = %node, action, "Node kicked"),
        Err(e) => error!(node = %node, action, error = %e, "Could not kick node"),
    }

    client.disconnect();
    result
}

/// Ask the fencer when `node` was last fenced. See [`last_fenced`].
pub async fn last_fenced_time(
    config: &FencingConfig,
    node: &NodeRef,
    in_progress: bool,
) -> Result<Option<DateTime<Utc>>> {
    let client = FencerClient::new(config.clone());
    client.connect(ConnectionMode::Command).await?;

    let (target, options) = node.target(CallOptions::sync());
    let history = client.history(options, Some(&target), HISTORY_TIMEOUT).await;
    client.disconnect();

    let entries = history.map_err(|e| {
        error!(node = %node, error = %e, "Could not retrieve fence history");
        e
    })?;
    let pending = entries
        .iter()
        .filter(|e| e.state == HistoryState::Pending)
        .count();
    info!(
        node = %node,
        entries = entries.len(),
        pending,
        "Retrieved fence history"
    );

    let when = last_fenced(&entries, in_progress, Utc::now());
    if let Some(when) = when {
        info!(node = %node, at = %when, "Node last kicked");
    }
    Ok(when)
}
