//! JSON envelope exchanged with the agent over the channel.
//!
//! Wire format (both directions, UTF-8 JSON text frames):
//!
//! ```text
//! {"action"|"command": "...", "instance"?, "tableName"?, "fieldName"?,
//!  "sys_id"?, "content"?, "agentRequestId"?, "error"?: {"detail": "..."}, ...}
//! ```
//!
//! Keys the engine does not model are kept in `extra` and written back
//! verbatim.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Maximum frame size (50MB) accepted from the agent.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Error payload carried by agent-reported failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub detail: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ErrorDetail {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            extra: Map::new(),
        }
    }
}

/// Agents are not always consistent: accept `"error": "text"` as well.
fn lenient_error<'de, D>(deserializer: D) -> Result<Option<ErrorDetail>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Detail(ErrorDetail),
        Text(String),
        Other(Value),
    }

    Ok(match Option::<Wire>::deserialize(deserializer)? {
        None => None,
        Some(Wire::Detail(detail)) => Some(detail),
        Some(Wire::Text(text)) => Some(ErrorDetail::new(text)),
        Some(Wire::Other(Value::Null)) => None,
        Some(Wire::Other(other)) => Some(ErrorDetail::new(other.to_string())),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Instance settings object, or just the instance name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(rename = "sys_id", default, skip_serializing_if = "Option::is_none")]
    pub sys_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_request_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_error",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<ErrorDetail>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChannelMessage {
    /// Outbound request for `command`.
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    /// Outbound push identified by `action`.
    pub fn action(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Default::default()
        }
    }

    /// Set an unmodelled key.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Dispatch name: `action`, falling back to `command`.
    pub fn name(&self) -> Option<&str> {
        self.action.as_deref().or(self.command.as_deref())
    }

    /// Instance name, whether `instance` is a string or a settings object.
    pub fn instance_name(&self) -> Option<&str> {
        match self.instance.as_ref()? {
            Value::String(name) => Some(name),
            Value::Object(settings) => settings.get("name")?.as_str(),
            _ => None,
        }
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.detail.as_str())
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key)?.as_str()
    }

    /// The `result` payload of a response, if any.
    pub fn result(&self) -> Option<&Value> {
        self.extra.get("result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_agent_message() {
        let raw = br#"{
            "action": "writeRecord",
            "instance": {"name": "acme", "url": "https://acme.example.com"},
            "tableName": "sys_script_include",
            "fieldName": "script",
            "sys_id": "0123456789abcdef0123456789abcdef",
            "content": "x=1",
            "name": "Util"
        }"#;
        let msg = ChannelMessage::from_json(raw).unwrap();

        assert_eq!(msg.name(), Some("writeRecord"));
        assert_eq!(msg.instance_name(), Some("acme"));
        assert_eq!(msg.table_name.as_deref(), Some("sys_script_include"));
        assert_eq!(msg.sys_id.as_deref(), Some("0123456789abcdef0123456789abcdef"));
        assert_eq!(msg.extra_str("name"), Some("Util"));
        assert!(msg.error.is_none());
    }

    #[test]
    fn test_command_falls_back_for_name() {
        let msg = ChannelMessage::from_json(br#"{"command":"saveAck","instance":"acme"}"#).unwrap();
        assert_eq!(msg.name(), Some("saveAck"));
        assert_eq!(msg.instance_name(), Some("acme"));
    }

    #[test]
    fn test_error_shapes() {
        let object =
            ChannelMessage::from_json(br#"{"action":"error","error":{"detail":"ACL denied"}}"#)
                .unwrap();
        assert_eq!(object.error_detail(), Some("ACL denied"));

        let text = ChannelMessage::from_json(br#"{"error":"session expired"}"#).unwrap();
        assert_eq!(text.error_detail(), Some("session expired"));

        let null = ChannelMessage::from_json(br#"{"error":null}"#).unwrap();
        assert!(null.error.is_none());
    }

    #[test]
    fn test_serialize_skips_absent_fields_and_keeps_extra() {
        let msg = ChannelMessage::command("getScope")
            .with("scopeId", "abc")
            .with("fields", json!({"script": "x=1"}));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({"command": "getScope", "scopeId": "abc", "fields": {"script": "x=1"}})
        );
    }

    #[test]
    fn test_not_json_is_error() {
        assert!(ChannelMessage::from_json(b"not json").is_err());
        assert!(ChannelMessage::from_json(b"[1,2]").is_err());
    }
}
