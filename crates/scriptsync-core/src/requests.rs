//! File-based requests for non-interactive callers.
//!
//! A caller drops `{id, command, params}` into `.scriptsync/requests/` and
//! later finds `{id, command, status, result?, error?}` at
//! `.scriptsync/responses/<id>.json`. The id becomes a file name, so it is
//! restricted to a safe character set and the resulting path is checked to
//! stay inside the workspace.
//!
//! Agent-reported errors are also persisted to `.scriptsync/last_error.json`
//! for external observers.

use crate::message::ChannelMessage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Component, Path};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const STATE_DIR: &str = ".scriptsync";
pub const REQUESTS_DIR: &str = ".scriptsync/requests";
pub const RESPONSES_DIR: &str = ".scriptsync/responses";
pub const LAST_ERROR_FILE: &str = ".scriptsync/last_error.json";

const MAX_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Invalid request id {0:?}: use 1-64 of [A-Za-z0-9_-]")]
    InvalidId(String),

    #[error("Response path escapes the workspace: {0}")]
    OutsideWorkspace(String),

    #[error("Invalid request file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Request has an empty command")]
    MissingCommand,
}

pub type Result<T> = std::result::Result<T, RequestError>;

pub fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RequestError::InvalidId(id.to_string()))
    }
}

/// True when `path` (relative, normal components only) stays below the root.
pub fn is_contained(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Workspace-relative response path for a request id.
pub fn response_path(id: &str) -> Result<String> {
    validate_id(id)?;
    let path = format!("{}/{}.json", RESPONSES_DIR, id);
    if !is_contained(&path) {
        return Err(RequestError::OutsideWorkspace(path));
    }
    Ok(path)
}

/// True for files the request watcher should pick up.
pub fn is_request_path(path: &str) -> bool {
    path.strip_prefix(REQUESTS_DIR)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|name| !name.contains('/') && name.ends_with(".json"))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileRequest {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl FileRequest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(data)?;
        validate_id(&request.id)?;
        if request.command.trim().is_empty() {
            return Err(RequestError::MissingCommand);
        }
        Ok(request)
    }

    /// Envelope forwarded to the agent: `params` become top-level keys.
    pub fn to_message(&self) -> Result<ChannelMessage> {
        let mut object = self.params.clone();
        object.remove("agentRequestId");
        object.insert("command".into(), Value::String(self.command.clone()));
        Ok(serde_json::from_value(Value::Object(object))?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResponse {
    pub id: String,
    pub command: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileResponse {
    pub fn success(id: &str, command: &str, result: Option<Value>) -> Self {
        Self {
            id: id.to_string(),
            command: command.to_string(),
            status: ResponseStatus::Success,
            result,
            error: None,
        }
    }

    pub fn error(id: &str, command: &str, error: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            command: command.to_string(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Build the response for an agent reply to a forwarded request.
    pub fn from_reply(id: &str, command: &str, reply: &ChannelMessage) -> Self {
        match reply.error_detail() {
            Some(detail) => Self::error(id, command, detail),
            None => {
                let result = reply.result().cloned().or_else(|| {
                    let mut value = serde_json::to_value(reply).ok()?;
                    if let Value::Object(map) = &mut value {
                        map.remove("agentRequestId");
                    }
                    Some(value)
                });
                Self::success(id, command, result)
            }
        }
    }
}

/// What `.scriptsync/last_error.json` holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub timestamp_ms: u64,
}

impl LastError {
    pub fn from_message(message: &ChannelMessage, detail: &str) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            detail: detail.to_string(),
            instance: message.instance_name().map(str::to_string),
            action: message.name().map(str::to_string),
            timestamp_ms,
        }
    }
}
