//! Request/response correlation over the single agent channel.
//!
//! Every outbound request is tagged with a fresh `agentRequestId` and
//! remembered as a [`PendingOperation`] until a message carrying the same id
//! comes back. Messages without a known id are unsolicited pushes and are
//! handed back to the caller for dispatch by name.
//!
//! The correlator does no I/O: serialized frames collect in an outbox that
//! the transport drains after each event. What a caller wants done when its
//! operation completes is the opaque `C` it supplies with the request.

use crate::message::ChannelMessage;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelatorError {
    #[error("No agent connected. Open the sync page in a browser tab")]
    NotConnected,

    #[error("Connection to the agent was lost")]
    ConnectionLost,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Sync engine stopped")]
    Stopped,

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// An in-flight request awaiting its response.
#[derive(Debug)]
pub struct PendingOperation<C> {
    pub id: String,
    pub command: String,
    pub sent_at: Instant,
    /// Instance the request concerns, for error relay.
    pub instance: Option<String>,
    pub completion: C,
}

/// A failed send hands the completion back so the caller can fail it.
#[derive(Debug)]
pub struct SendError<C> {
    pub error: CorrelatorError,
    pub completion: C,
}

/// Classification of an inbound frame.
#[derive(Debug)]
pub enum Inbound<C> {
    /// Response to one of our requests; the operation is no longer pending.
    Resolved {
        operation: PendingOperation<C>,
        message: ChannelMessage,
    },
    /// Push from the agent, to be routed by `action`/`command`.
    Unsolicited(ChannelMessage),
    /// Not a JSON envelope.
    Malformed(String),
}

#[derive(Debug)]
pub struct Correlator<C> {
    connected: bool,
    pending: HashMap<String, PendingOperation<C>>,
    outbox: VecDeque<String>,
}

impl<C> Default for Correlator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Correlator<C> {
    pub fn new() -> Self {
        Self {
            connected: false,
            pending: HashMap::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn connect(&mut self) {
        self.connected = true;
    }

    /// Mark the channel down and hand back every pending operation so the
    /// caller can fail them. Frames not yet transmitted are discarded.
    pub fn disconnect(&mut self) -> Vec<PendingOperation<C>> {
        self.connected = false;
        self.outbox.clear();
        self.take_all()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().simple().to_string();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Tag `message`, record it as pending and queue it for transmission.
    pub fn send(
        &mut self,
        mut message: ChannelMessage,
        completion: C,
        now: Instant,
    ) -> Result<String, SendError<C>> {
        if !self.connected {
            return Err(SendError {
                error: CorrelatorError::NotConnected,
                completion,
            });
        }

        let id = self.fresh_id();
        message.agent_request_id = Some(id.clone());
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                return Err(SendError {
                    error: CorrelatorError::Encode(e.to_string()),
                    completion,
                });
            }
        };

        let command = message.name().unwrap_or("unknown").to_string();
        debug!("-> {} ({})", command, id);
        self.pending.insert(
            id.clone(),
            PendingOperation {
                id: id.clone(),
                command,
                sent_at: now,
                instance: message.instance_name().map(str::to_string),
                completion,
            },
        );
        self.outbox.push_back(frame);
        Ok(id)
    }

    /// Queue a message that expects no response.
    pub fn post(&mut self, message: &ChannelMessage) -> Result<(), CorrelatorError> {
        if !self.connected {
            return Err(CorrelatorError::NotConnected);
        }
        let frame = message
            .to_json()
            .map_err(|e| CorrelatorError::Encode(e.to_string()))?;
        self.outbox.push_back(frame);
        Ok(())
    }

    /// Classify an inbound frame, resolving the matching pending operation.
    pub fn on_message(&mut self, raw: &[u8]) -> Inbound<C> {
        let message = match ChannelMessage::from_json(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed agent message: {}", e);
                return Inbound::Malformed(e.to_string());
            }
        };

        let operation = message
            .agent_request_id
            .as_deref()
            .and_then(|id| self.pending.remove(id));

        match operation {
            Some(operation) => {
                debug!(
                    "<- {} ({}) after {:?}",
                    operation.command,
                    operation.id,
                    operation.sent_at.elapsed()
                );
                Inbound::Resolved { operation, message }
            }
            None => Inbound::Unsolicited(message),
        }
    }

    /// Remove every pending operation.
    pub fn take_all(&mut self) -> Vec<PendingOperation<C>> {
        let mut operations: Vec<_> = self.pending.drain().map(|(_, op)| op).collect();
        operations.sort_by_key(|op| op.sent_at);
        operations
    }

    /// Remove pending operations concerning `instance`.
    pub fn take_instance(&mut self, instance: &str) -> Vec<PendingOperation<C>> {
        let ids: Vec<String> = self
            .pending
            .values()
            .filter(|op| op.instance.as_deref() == Some(instance))
            .map(|op| op.id.clone())
            .collect();
        let mut operations: Vec<_> = ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        operations.sort_by_key(|op| op.sent_at);
        operations
    }

    /// Frames waiting to be written to the channel, oldest first.
    pub fn drain_outbox(&mut self) -> Vec<String> {
        self.outbox.drain(..).collect()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connected() -> Correlator<&'static str> {
        let mut correlator = Correlator::new();
        correlator.connect();
        correlator
    }

    fn response_for(id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({"agentRequestId": id, "result": {"ok": true}})).unwrap()
    }

    #[test]
    fn test_send_tags_and_queues_frame() {
        let mut correlator = connected();
        let id = correlator
            .send(ChannelMessage::command("getScope"), "scope", Instant::now())
            .unwrap();

        let frames = correlator.drain_outbox();
        assert_eq!(frames.len(), 1);
        let sent: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(sent["agentRequestId"], json!(id));
        assert_eq!(sent["command"], json!("getScope"));
        assert!(correlator.is_pending(&id));
    }

    #[test]
    fn test_send_without_agent_fails_immediately() {
        let mut correlator: Correlator<&str> = Correlator::new();
        let err = correlator
            .send(ChannelMessage::command("saveRecord"), "save", Instant::now())
            .unwrap_err();
        assert_eq!(err.error, CorrelatorError::NotConnected);
        assert_eq!(err.completion, "save");
        assert_eq!(correlator.pending_count(), 0);
        assert!(correlator.drain_outbox().is_empty());
    }

    #[test]
    fn test_ids_are_unique_and_responses_resolve_out_of_order() {
        let mut correlator = connected();
        let now = Instant::now();
        let first = correlator.send(ChannelMessage::command("a"), "first", now).unwrap();
        let second = correlator.send(ChannelMessage::command("b"), "second", now).unwrap();
        assert_ne!(first, second);

        match correlator.on_message(&response_for(&second)) {
            Inbound::Resolved { operation, message } => {
                assert_eq!(operation.completion, "second");
                assert_eq!(operation.command, "b");
                assert_eq!(message.result(), Some(&json!({"ok": true})));
            }
            other => panic!("expected resolution, got {:?}", other),
        }
        assert!(correlator.is_pending(&first));
        assert!(!correlator.is_pending(&second));

        // A duplicate response no longer matches anything.
        assert!(matches!(
            correlator.on_message(&response_for(&second)),
            Inbound::Unsolicited(_)
        ));
    }

    #[test]
    fn test_unsolicited_and_malformed() {
        let mut correlator = connected();
        match correlator.on_message(br#"{"action":"tokenRefresh","instance":"acme"}"#) {
            Inbound::Unsolicited(message) => assert_eq!(message.name(), Some("tokenRefresh")),
            other => panic!("expected unsolicited, got {:?}", other),
        }
        assert!(matches!(correlator.on_message(b"hello"), Inbound::Malformed(_)));
    }

    #[test]
    fn test_disconnect_fails_everything() {
        let mut correlator = connected();
        let now = Instant::now();
        correlator.send(ChannelMessage::command("a"), "first", now).unwrap();
        correlator.send(ChannelMessage::command("b"), "second", now).unwrap();

        let failed = correlator.disconnect();
        assert_eq!(failed.len(), 2);
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.is_connected());
        assert!(correlator.drain_outbox().is_empty());
    }

    #[test]
    fn test_take_instance() {
        let mut correlator = connected();
        let now = Instant::now();
        let acme = ChannelMessage {
            instance: Some(json!({"name": "acme"})),
            ..ChannelMessage::command("saveRecord")
        };
        let other = ChannelMessage {
            instance: Some(json!("other")),
            ..ChannelMessage::command("saveRecord")
        };
        correlator.send(acme, "acme", now).unwrap();
        correlator.send(other, "other", now).unwrap();

        let failed = correlator.take_instance("acme");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].completion, "acme");
        assert_eq!(correlator.pending_count(), 1);
    }
}
