//! Argument blob handed to fence agents on stdin.
//!
//! Agents receive no command-line arguments; everything they need arrives as
//! newline-delimited `key=value` pairs.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, trace};

/// Prefix of parameters implemented by the cluster rather than the agent.
pub const RESERVED_PREFIX: &str = "pcmk_";

/// Prefix of resource meta-attributes.
const META_PREFIX: &str = "CRM_meta";

/// Exact keys that are never forwarded.
const RESERVED_KEYS: &[&str] = &["crm_feature_set"];

/// Key carrying the action verb.
pub const ACTION_KEY: &str = "action";

/// Device parameter naming the agent's port parameter.
pub const HOST_ARGUMENT_KEY: &str = "pcmk_host_argument";

/// Port parameter used when the device does not configure one.
const DEFAULT_PORT_PARAM: &str = "port";

/// Marks a port parameter the engine should fill in per victim.
const DYNAMIC_VALUE: &str = "dynamic";

/// Disables the port parameter entirely.
const NO_PORT: &str = "none";

/// Legacy agent wrapper that identifies the victim by other means.
const LEGACY_AGENT: &str = "fence_legacy";

/// Node targeted by an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victim {
    /// Cluster node name.
    pub name: String,
    /// Numeric cluster node id, 0 when unknown.
    pub node_id: u32,
}

impl Victim {
    pub fn new(name: impl Into<String>, node_id: u32) -> Self {
        Self {
            name: name.into(),
            node_id,
        }
    }
}

/// Whether a device parameter may be passed through to the agent.
pub fn is_forwarded(key: &str) -> bool {
    !(key.starts_with(RESERVED_PREFIX)
        || key.starts_with(META_PREFIX)
        || RESERVED_KEYS.contains(&key)
        || key == ACTION_KEY)
}

/// Action the agent should actually perform, honouring `pcmk_<action>_action`.
pub fn effective_action<'a>(action: &'a str, device_args: &'a BTreeMap<String, String>) -> &'a str {
    let key = format!("{RESERVED_PREFIX}{action}_action");
    match device_args.get(&key) {
        Some(replacement) => {
            info!(
                requested = action,
                substitute = %replacement,
                "Substituting configured action"
            );
            replacement.as_str()
        }
        None => action,
    }
}

/// Maximum attempts for an action, honouring `pcmk_<action>_retries`.
pub fn max_retries_for(action: &str, device_args: &BTreeMap<String, String>, default: u32) -> u32 {
    let key = format!("{RESERVED_PREFIX}{action}_retries");
    device_args
        .get(&key)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

/// Build the argument blob for one agent invocation.
///
/// The requested action comes first, followed by the victim's identity and
/// then every forwardable device parameter in key order. Explicitly configured
/// port values are never overwritten unless set to `dynamic`.
pub fn make_args(
    agent: &str,
    action: &str,
    victim: Option<&Victim>,
    device_args: &BTreeMap<String, String>,
    port_map: &HashMap<String, String>,
) -> String {
    let mut args = String::new();
    let action = effective_action(action, device_args);
    append_arg(&mut args, ACTION_KEY, action);

    // Port parameter filled in from the victim, replacing any `dynamic` value.
    let mut substituted = None;

    if let Some(victim) = victim {
        let alias = port_map
            .get(&victim.name)
            .map_or(victim.name.as_str(), String::as_str);

        append_arg(&mut args, "nodename", &victim.name);
        if victim.node_id != 0 {
            info!(
                action,
                victim = %victim.name,
                nodeid = victim.node_id,
                "Adding nodeid to agent parameters"
            );
            append_arg(&mut args, "nodeid", &victim.node_id.to_string());
        }

        if let Some(param) = port_param(agent, device_args) {
            let current = device_args.get(param).map(String::as_str);
            if current.is_none() || current == Some(DYNAMIC_VALUE) {
                debug!(action, victim = %victim.name, "Performing action as '{param}={alias}'");
                append_arg(&mut args, param, alias);
                substituted = Some(param);
            }
        }
    }

    for (key, value) in device_args {
        if substituted == Some(key.as_str()) {
            continue;
        }
        if is_forwarded(key) {
            append_arg(&mut args, key, value);
        }
    }

    args
}

fn configured_port(device_args: &BTreeMap<String, String>) -> Option<&str> {
    device_args.get(HOST_ARGUMENT_KEY).map(String::as_str)
}

/// Name of the parameter carrying the victim's port, if any.
fn port_param<'a>(agent: &str, device_args: &'a BTreeMap<String, String>) -> Option<&'a str> {
    if agent == LEGACY_AGENT {
        return None;
    }
    match configured_port(device_args) {
        None => Some(DEFAULT_PORT_PARAM),
        Some(NO_PORT) => None,
        Some(param) => Some(param),
    }
}

fn append_arg(args: &mut String, key: &str, value: &str) {
    if !is_forwarded(key) && key != ACTION_KEY {
        return;
    }
    trace!("Appending: {key}={value}");
    args.push_str(key);
    args.push('=');
    args.push_str(value);
    args.push('\n');
}
