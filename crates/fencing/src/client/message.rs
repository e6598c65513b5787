//! Wire frames exchanged with the fencer.
//!
//! Frames are JSON objects, one per line, discriminated by `"type"`:
//!
//! | type       | direction        | purpose                                    |
//! |------------|------------------|--------------------------------------------|
//! | `command`  | client -> fencer | request                                    |
//! | `response` | fencer -> client | direct answer to a request expecting one   |
//! | `reply`    | fencer -> client | result of an asynchronous call             |
//! | `notify`   | fencer -> client | event pushed to subscribers                |
//! | `timeout`  | fencer -> client | new deadline for a pending call            |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::options::CallOptions;
use crate::action::AgentNamespace;
use crate::error::{FenceError, Result};

/// Operation names understood by the fencer.
pub mod ops {
    pub const REGISTER: &str = "register";
    pub const DEVICE_ADD: &str = "st_device_register";
    pub const DEVICE_DEL: &str = "st_device_remove";
    pub const LEVEL_ADD: &str = "st_level_add";
    pub const LEVEL_DEL: &str = "st_level_remove";
    pub const QUERY: &str = "st_query";
    pub const EXEC: &str = "st_execute";
    pub const FENCE: &str = "st_fence";
    pub const FENCE_HISTORY: &str = "st_fence_history";
    pub const NOTIFY: &str = "st_notify";
}

/// Event names subscribers can ask for.
pub mod events {
    /// A fencing operation finished somewhere in the cluster.
    pub const FENCE: &str = "st_notify_fence";
    pub const DEVICE_REGISTER: &str = "st_device_register";
    pub const DEVICE_UNREGISTER: &str = "st_device_remove";
    pub const HISTORY: &str = "st_notify_history";
    /// Synthesised locally when the connection goes away.
    pub const DISCONNECT: &str = "st_notify_disconnect";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Command(Request),
    Response(Response),
    Reply(Reply),
    Notify(Notification),
    Timeout(TimeoutUpdate),
}

impl Frame {
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub operation: String,
    pub call_id: i32,
    #[serde(default)]
    pub call_options: CallOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    /// Only set on registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Seconds; 0 means none.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub call_id: Option<i32>,
    #[serde(default)]
    pub result_code: Option<i32>,
    /// Registration token, set in answer to `register`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub call_id: i32,
    #[serde(default)]
    pub result_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Event name.
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default)]
    pub result_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutUpdate {
    pub call_id: i32,
    /// Seconds.
    pub timeout: u64,
}

/// Event record handed to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FenceEvent {
    /// Event name the record was published under.
    pub event: String,
    pub operation: Option<String>,
    pub result_code: i32,
    /// Node that asked for the operation.
    pub origin: Option<String>,
    pub action: Option<String>,
    pub target: Option<String>,
    /// Node that carried the operation out.
    pub executioner: Option<String>,
    /// Cluster-wide operation id.
    pub id: Option<String>,
    /// Client that asked for the operation.
    pub client_origin: Option<String>,
    pub device: Option<String>,
}

/// Payload of a fence event push.
#[derive(Debug, Clone, Default, Deserialize)]
struct FenceEventData {
    origin: Option<String>,
    action: Option<String>,
    target: Option<String>,
    delegate: Option<String>,
    remote_op_id: Option<String>,
    client_name: Option<String>,
    device: Option<String>,
}

impl FenceEvent {
    /// Decode the event carried by a push.
    ///
    /// Only fence events carry a detailed record; a fence event without one
    /// is still delivered with empty details. A record that does not decode
    /// is an error.
    pub fn from_notification(notification: &Notification) -> Result<Self> {
        let mut event = Self {
            event: notification.subtype.clone(),
            operation: notification.operation.clone(),
            result_code: notification.result_code,
            ..Self::default()
        };
        if notification.subtype != events::FENCE {
            return Ok(event);
        }
        let Some(payload) = &notification.payload else {
            tracing::error!(event = %notification.subtype, "No data for fence event");
            return Ok(event);
        };
        let data: FenceEventData = serde_json::from_value(payload.clone())?;
        event.origin = data.origin;
        event.action = data.action;
        event.target = data.target;
        event.executioner = data.delegate;
        event.id = data.remote_op_id;
        event.client_origin = data.client_name;
        event.device = data.device;
        Ok(event)
    }

    /// Local notification sent when the connection is lost or closed.
    pub fn disconnected() -> Self {
        Self {
            event: events::DISCONNECT.to_string(),
            ..Self::default()
        }
    }
}

/// Where a fencing operation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryState {
    Pending,
    Done,
    Failed,
}

/// One fencing operation as recorded by the fencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub target: String,
    pub action: String,
    #[serde(default)]
    pub origin: Option<String>,
    /// Node that executed the operation.
    #[serde(default)]
    pub delegate: Option<String>,
    /// Client that asked for it.
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    pub state: HistoryState,
}

/// Body of `st_device_register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub id: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<AgentNamespace>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl DeviceRegistration {
    /// Registration for `agent` under `namespace`.
    ///
    /// Linux-HA agents run through the `fence_legacy` wrapper, which is told
    /// the real agent in its `plugin` parameter.
    pub fn new(
        id: &str,
        namespace: AgentNamespace,
        agent: &str,
        params: &BTreeMap<String, String>,
    ) -> Self {
        let mut params = params.clone();
        let agent = if namespace == AgentNamespace::Heartbeat {
            params.insert("plugin".to_string(), agent.to_string());
            "fence_legacy".to_string()
        } else {
            agent.to_string()
        };
        Self {
            id: id.to_string(),
            agent,
            namespace: (namespace != AgentNamespace::Any).then_some(namespace),
            params,
        }
    }
}

/// Node selection for a topology level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelTarget {
    Node(String),
    /// Regular expression matched against node names.
    Pattern(String),
    /// Nodes whose attribute `name` equals `value`.
    Attribute { name: String, value: String },
}

impl LevelTarget {
    fn validate(&self) -> Result<()> {
        let empty = match self {
            Self::Node(v) | Self::Pattern(v) => v.is_empty(),
            Self::Attribute { name, value } => name.is_empty() || value.is_empty(),
        };
        if empty {
            return Err(FenceError::InvalidArgument(
                "topology level needs a node, pattern or attribute".to_string(),
            ));
        }
        Ok(())
    }
}

/// Body of `st_level_add` and `st_level_remove`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRegistration {
    pub target: LevelTarget,
    pub index: u32,
    /// Comma-separated device ids; empty for removal.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub devices: String,
}

impl LevelRegistration {
    pub fn new(target: LevelTarget, index: u32, devices: &[String]) -> Result<Self> {
        target.validate()?;
        Ok(Self {
            target,
            index,
            devices: devices.join(","),
        })
    }
}

/// Body of `st_execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub device: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Body of `st_fence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceRequest {
    pub target: String,
    pub action: String,
    pub timeout: u64,
    /// Seconds within which an earlier fencing of the target counts as this one.
    pub tolerance: u64,
}

/// Body of `st_query`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub target: String,
    pub action: String,
}

/// Body of `st_fence_history`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Body of `st_notify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyToggle {
    Activate(String),
    Deactivate(String),
}

/// Device matched by a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMatch {
    pub id: String,
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub devices: Vec<QueryMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryList {
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Serialize a request body.
pub fn to_payload<T: Serialize>(body: &T) -> Result<Value> {
    Ok(serde_json::to_value(body)?)
}

/// Deserialize a response body, treating a missing body as empty.
pub fn from_payload<T>(payload: Option<Value>) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match payload {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_layout() {
        let frame = Frame::Command(Request {
            operation: ops::FENCE.to_string(),
            call_id: 7,
            call_options: CallOptions::sync(),
            client_token: Some("tok".to_string()),
            client_name: None,
            timeout: 30,
            payload: None,
        });
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["call_id"], 7);
        assert_eq!(value["call_options"], 0x1000);
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_response_without_call_id_decodes() {
        let frame = Frame::decode(r#"{"type":"response","result_code":0}"#).unwrap();
        let Frame::Response(response) = frame else {
            panic!("expected a response");
        };
        assert_eq!(response.call_id, None);
    }

    #[test]
    fn test_fence_event_decoding() {
        let notification = Notification {
            subtype: events::FENCE.to_string(),
            operation: Some(ops::FENCE.to_string()),
            result_code: 0,
            payload: Some(json!({
                "target": "node2",
                "action": "reboot",
                "delegate": "node1",
                "origin": "node3",
                "remote_op_id": "abc",
                "client_name": "controller"
            })),
        };
        let event = FenceEvent::from_notification(&notification).unwrap();
        assert_eq!(event.target.as_deref(), Some("node2"));
        assert_eq!(event.executioner.as_deref(), Some("node1"));
        assert_eq!(event.client_origin.as_deref(), Some("controller"));
        assert_eq!(event.id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_malformed_fence_event_is_rejected() {
        let notification = Notification {
            subtype: events::FENCE.to_string(),
            operation: None,
            result_code: 0,
            payload: Some(json!("not a record")),
        };
        assert!(FenceEvent::from_notification(&notification).is_err());
    }

    #[test]
    fn test_heartbeat_devices_use_legacy_wrapper() {
        let reg = DeviceRegistration::new(
            "dev1",
            AgentNamespace::Heartbeat,
            "external/ipmi",
            &BTreeMap::new(),
        );
        assert_eq!(reg.agent, "fence_legacy");
        assert_eq!(reg.params.get("plugin").map(String::as_str), Some("external/ipmi"));

        let any = DeviceRegistration::new("dev2", AgentNamespace::Any, "fence_virsh", &BTreeMap::new());
        assert!(any.namespace.is_none());
    }

    #[test]
    fn test_level_needs_a_target() {
        assert!(LevelRegistration::new(LevelTarget::Node(String::new()), 1, &[]).is_err());
        let level = LevelRegistration::new(
            LevelTarget::Pattern("node[0-9]".to_string()),
            2,
            &["ipmi".to_string(), "pdu".to_string()],
        )
        .unwrap();
        assert_eq!(level.devices, "ipmi,pdu");
    }

    #[test]
    fn test_history_entry_states() {
        let list: HistoryList = from_payload(Some(json!({
            "history": [
                {"target": "n1", "action": "off", "state": "done",
                 "completed": "2024-05-01T10:00:00Z"},
                {"target": "n1", "action": "reboot", "state": "pending"}
            ]
        })))
        .unwrap();
        assert_eq!(list.history.len(), 2);
        assert_eq!(list.history[1].state, HistoryState::Pending);
        assert!(list.history[1].completed.is_none());
    }
}
