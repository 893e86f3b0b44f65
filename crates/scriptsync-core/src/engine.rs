//! SyncEngine: drives local edits to the agent and remote writes to disk.
//!
//! The engine owns every store (name mappings, scope cache, debounce queue,
//! pending operations) and is fed one input at a time through `&mut self`
//! handlers. It never reads a clock or touches a socket: callers pass `now`,
//! ask [`SyncEngine::next_deadline`] when to call back, and move frames from
//! [`SyncEngine::drain_outbox`] onto the channel after each input.
//!
//! Local side: a change to a mapped file is queued and, once the settle delay
//! passes, saved together with every other queued field of the same record.
//! A manual save skips the queue. A file with no record id is created
//! remotely right away and its id recorded in `_map.json` when the agent
//! answers.
//!
//! Remote side: `writeRecord` pushes land on disk at the record's canonical
//! path. When the record's scope is not known yet the write waits for a
//! `getScope` lookup and is retried on a fixed schedule.

use crate::correlator::{Correlator, CorrelatorError, Inbound, PendingOperation};
use crate::echo::EchoFilter;
use crate::events::{EngineEvent, EventBus};
use crate::fs::{FileSystem, FsError};
use crate::host::HostEditor;
use crate::mapping::{MappingError, NameMapping};
use crate::message::{ChannelMessage, ErrorDetail};
use crate::queue::{DebounceQueue, QueueEntry};
use crate::record::{
    extension_for_field_type, is_identifier, is_record_id, sanitize_name, FolderRecordTables,
    RecordReference, TableKey, GLOBAL_SCOPE, MAP_FILE, SETTINGS_FILE,
};
use crate::requests::{
    is_request_path, response_path, FileRequest, FileResponse, LastError, RequestError,
    LAST_ERROR_FILE,
};
use crate::resolver::{IdentityResolver, RenameOutcome};
use crate::scope::{RetryPolicy, RetrySchedule, ScopeCache, ScopeError};
use futures::channel::oneshot;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default settle delay before queued changes are sent.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(3000);

/// Version announced to the agent on connect.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Name mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Scope cache error: {0}")]
    Scope(#[from] ScopeError),

    #[error("Request file error: {0}")]
    Request(#[from] RequestError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Reply delivered to in-process callers of [`SyncEngine::request`].
pub type Reply = std::result::Result<ChannelMessage, CorrelatorError>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub settle_delay: Duration,
    /// When false, changes are tracked but only sent by an explicit flush.
    pub monitoring: bool,
    pub folder_tables: FolderRecordTables,
    pub scope_retry: RetryPolicy,
    /// Ask the host to open files written by the agent.
    pub open_on_write: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            monitoring: true,
            folder_tables: FolderRecordTables::default(),
            scope_retry: RetryPolicy::default(),
            open_on_write: false,
        }
    }
}

/// What to do when a pending operation completes or fails.
#[derive(Debug)]
pub enum Continuation {
    /// `saveRecord` for one record. Entries are restored if it fails.
    Save {
        table: TableKey,
        record_id: String,
        entries: Vec<QueueEntry>,
    },
    /// `createRecord` for a file that had no record id.
    Create {
        path: String,
        table: TableKey,
        name: String,
    },
    /// `getScope` for a write waiting on an unknown scope.
    ScopeLookup { instance: String, scope_id: String },
    /// Request forwarded from `.scriptsync/requests/`.
    ResponseFile { id: String, command: String },
    /// In-process caller holding the receiving end.
    Caller(oneshot::Sender<Reply>),
}

/// Everything that can drive the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineInput {
    FileChanged { path: String, content: String },
    FileSaved { path: String, content: String },
    FileRenamed { from: String, to: String },
    FileDeleted { path: String },
    AgentConnected,
    AgentDisconnected,
    AgentMessage(Vec<u8>),
    Timer,
    Flush,
    TogglePause,
    ClearQueue,
}

pub struct SyncEngine<F: FileSystem> {
    fs: F,
    config: EngineConfig,
    resolver: IdentityResolver,
    scopes: ScopeCache,
    queue: DebounceQueue,
    correlator: Correlator<Continuation>,
    retries: RetrySchedule<ChannelMessage>,
    /// `(instance, scope_id)` pairs with a `getScope` in flight.
    scope_lookups: HashSet<(String, String)>,
    /// Records with a `createRecord` in flight, keyed by table and name,
    /// with content saved since for any of their field files.
    creating: HashMap<(TableKey, String), BTreeMap<String, String>>,
    /// Our own writes and renames, so the watcher's echo is ignored.
    echoes: EchoFilter,
    offline_reported: bool,
    host: Box<dyn HostEditor>,
    events: Arc<EventBus>,
}

/// Outcome of applying a `writeRecord` push.
enum RemoteWrite {
    Written { path: String, length: usize },
    /// The scope id is not known yet.
    Deferred { instance: String, scope_id: String },
    /// The message cannot be mapped onto a workspace path.
    Refused(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingsUpdate {
    Replace,
    Merge,
    Refresh,
}

/// `instance/scope/table/_map.json` → its table.
fn map_file_key(path: &str) -> Option<TableKey> {
    let segments: Vec<&str> = path.split('/').collect();
    match segments.as_slice() {
        [instance, scope, table, file] if *file == MAP_FILE => {
            Some(TableKey::new(*instance, *scope, *table))
        }
        _ => None,
    }
}

fn scope_name(result: &Value) -> Option<&str> {
    match result.get("scope")? {
        Value::String(name) => Some(name),
        Value::Object(scope) => scope.get("name")?.as_str(),
        _ => None,
    }
}

impl<F: FileSystem> SyncEngine<F> {
    pub fn new(fs: F, host: impl HostEditor + 'static, config: EngineConfig) -> Self {
        Self {
            resolver: IdentityResolver::new(config.folder_tables.clone(), NameMapping::new()),
            scopes: ScopeCache::new(),
            queue: DebounceQueue::new(config.settle_delay, config.monitoring),
            correlator: Correlator::new(),
            retries: RetrySchedule::new(config.scope_retry),
            scope_lookups: HashSet::new(),
            creating: HashMap::new(),
            echoes: EchoFilter::default(),
            offline_reported: false,
            host: Box::new(host),
            events: Arc::new(EventBus::new()),
            config,
            fs,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &DebounceQueue {
        &self.queue
    }

    pub fn is_connected(&self) -> bool {
        self.correlator.is_connected()
    }

    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Frames to write to the agent channel, oldest first.
    pub fn drain_outbox(&mut self) -> Vec<String> {
        self.correlator.drain_outbox()
    }

    /// When [`on_timer`](Self::on_timer) next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.queue.deadline(), self.retries.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub async fn handle(&mut self, input: EngineInput, now: Instant) -> Result<()> {
        match input {
            EngineInput::FileChanged { path, content } => {
                self.on_file_changed(&path, content, now).await
            }
            EngineInput::FileSaved { path, content } => {
                self.on_file_saved(&path, content, now).await
            }
            EngineInput::FileRenamed { from, to } => self.on_file_renamed(&from, &to, now).await,
            EngineInput::FileDeleted { path } => {
                self.on_file_deleted(&path, now);
                Ok(())
            }
            EngineInput::AgentConnected => {
                self.on_agent_connected();
                Ok(())
            }
            EngineInput::AgentDisconnected => {
                self.on_agent_disconnected(now).await;
                Ok(())
            }
            EngineInput::AgentMessage(raw) => self.on_agent_message(&raw, now).await,
            EngineInput::Timer => self.on_timer(now).await,
            EngineInput::Flush => self.flush(now).await.map(|_| ()),
            EngineInput::TogglePause => {
                self.toggle_pause(now);
                Ok(())
            }
            EngineInput::ClearQueue => {
                self.clear_queue(now);
                Ok(())
            }
        }
    }

    // ---- local side ----

    /// A file's content changed on disk (auto-save, external tool, watcher).
    pub async fn on_file_changed(&mut self, path: &str, content: String, now: Instant) -> Result<()> {
        if is_request_path(path) {
            return self.on_request_file(path, &content, now).await;
        }
        if let Some(key) = map_file_key(path) {
            self.resolver.invalidate(&key);
            return Ok(());
        }
        if self.echoes.take_write(path, &content, now) {
            debug!("Ignoring echo of remote write to {}", path);
            return Ok(());
        }

        let Some(reference) = self.resolver.resolve(&self.fs, path).await? else {
            return Ok(());
        };
        match reference.record_id {
            Some(_) => {
                self.queue.enqueue(path, content, now);
                self.emit_queue(now);
                Ok(())
            }
            None => self.create_record(path, reference, content, now).await,
        }
    }

    /// An explicit save: sent immediately, superseding anything queued.
    pub async fn on_file_saved(&mut self, path: &str, content: String, now: Instant) -> Result<()> {
        if is_request_path(path) || map_file_key(path).is_some() {
            return self.on_file_changed(path, content, now).await;
        }
        self.echoes.forget_write(path);

        let Some(reference) = self.resolver.resolve(&self.fs, path).await? else {
            return Ok(());
        };
        if self.queue.remove(path).is_some() {
            self.emit_queue(now);
        }

        let Some(record_id) = reference.record_id.clone() else {
            return self.create_record(path, reference, content, now).await;
        };
        let entry = QueueEntry {
            path: path.to_string(),
            content,
        };
        if !self.correlator.is_connected() {
            self.queue.restore_paused(vec![entry]);
            self.report_offline();
            self.emit_queue(now);
            return Ok(());
        }
        self.send_save(reference.table, record_id, vec![(reference.field_name, entry)], now)
            .await
    }

    pub async fn on_file_renamed(&mut self, from: &str, to: &str, now: Instant) -> Result<()> {
        if self.echoes.take_rename(from, to, now) {
            debug!("Ignoring echo of our own rename {} -> {}", from, to);
            return Ok(());
        }
        match self.resolver.on_rename(&self.fs, from, to).await? {
            RenameOutcome::Accepted {
                old_name,
                new_name,
                record_id,
            } => {
                if self.queue.rename(from, to) {
                    self.emit_queue(now);
                }
                if old_name != new_name {
                    info!(
                        "Renamed {:?} to {:?} ({})",
                        old_name,
                        new_name,
                        record_id.as_deref().unwrap_or("not created yet")
                    );
                }
            }
            RenameOutcome::Rejected(reason) => {
                warn!("Reverting rename {} -> {}: {}", from, to, reason);
                self.host.show_error(&format!("Rename reverted: {}", reason));
                if self.fs.exists(to).await? {
                    match self.host.revert_rename(to, from).await {
                        Ok(()) => self.echoes.note_rename(to, from, now),
                        Err(e) => warn!("Could not revert rename of {}: {}", to, e),
                    }
                }
                self.events.emit(EngineEvent::RenameReverted {
                    old_path: from.to_string(),
                    new_path: to.to_string(),
                    reason: reason.to_string(),
                });
            }
            RenameOutcome::Ignored => {}
        }
        Ok(())
    }

    pub fn on_file_deleted(&mut self, path: &str, now: Instant) {
        self.echoes.forget_write(path);
        if self.queue.remove(path).is_some() {
            debug!("Dropped queued change for deleted {}", path);
            self.emit_queue(now);
        }
    }

    /// Process whatever is due: an expired queue and scope retries.
    pub async fn on_timer(&mut self, now: Instant) -> Result<()> {
        if self.queue.poll_expired(now) {
            self.flush(now).await?;
        }
        for (message, attempt) in self.retries.take_due(now) {
            if let Err(e) = self.apply_remote_write(message, attempt, now).await {
                warn!("Retried remote write failed: {}", e);
            }
        }
        Ok(())
    }

    /// Send everything queued, one `saveRecord` per record. Returns how many
    /// saves went out.
    ///
    /// Entries that cannot be sent are put back in the queue, paused.
    pub async fn flush(&mut self, now: Instant) -> Result<usize> {
        let entries = self.queue.drain();
        if entries.is_empty() {
            return Ok(0);
        }
        if !self.correlator.is_connected() {
            self.queue.restore_paused(entries);
            self.report_offline();
            self.emit_queue(now);
            return Ok(0);
        }

        let mut groups: Vec<(TableKey, String, Vec<(String, QueueEntry)>)> = Vec::new();
        let mut held = Vec::new();
        for entry in entries {
            let reference = match self.resolver.resolve(&self.fs, &entry.path).await {
                Ok(Some(reference)) => reference,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Could not resolve {}: {}", entry.path, e);
                    held.push(entry);
                    continue;
                }
            };
            let Some(record_id) = reference.record_id.clone() else {
                // The mapping lost this name while it was queued.
                if let Err(e) = self
                    .create_record(&entry.path, reference, entry.content.clone(), now)
                    .await
                {
                    warn!("Could not create {}: {}", entry.path, e);
                    held.push(entry);
                }
                continue;
            };
            match groups
                .iter_mut()
                .find(|(table, id, _)| *table == reference.table && *id == record_id)
            {
                Some((_, _, fields)) => fields.push((reference.field_name, entry)),
                None => groups.push((reference.table, record_id, vec![(reference.field_name, entry)])),
            }
        }

        let mut sent = 0;
        let mut failed = held.len();
        for (table, record_id, fields) in groups {
            let count = fields.len();
            match self.send_save(table, record_id, fields, now).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!("Could not save queued changes: {}", e);
                    failed += count;
                }
            }
        }
        if !held.is_empty() {
            self.queue.restore_paused(held);
        }
        if failed > 0 {
            self.host.show_error(&format!(
                "{} change(s) could not be sent and are held in the paused queue",
                failed
            ));
        }
        self.emit_queue(now);
        Ok(sent)
    }

    pub fn toggle_pause(&mut self, now: Instant) -> bool {
        let paused = self.queue.toggle_pause(now);
        self.emit_queue(now);
        paused
    }

    pub fn resume(&mut self, now: Instant) -> bool {
        let resumed = self.queue.resume(now);
        if resumed {
            self.emit_queue(now);
        }
        resumed
    }

    pub fn clear_queue(&mut self, now: Instant) -> usize {
        let cleared = self.queue.clear();
        if cleared > 0 {
            info!("Discarded {} queued change(s)", cleared);
            self.emit_queue(now);
        }
        cleared
    }

    /// Envelope with the instance settings, table and scope of `table`.
    async fn outbound(&mut self, command: &str, table: &TableKey) -> Result<ChannelMessage> {
        let instance = self.instance_settings(&table.instance).await?;
        let scope_id = self
            .scopes
            .id_for_name(&self.fs, &table.instance, &table.scope)
            .await?;
        let mut message = ChannelMessage {
            instance: Some(instance),
            table_name: Some(table.table.clone()),
            ..ChannelMessage::command(command)
        }
        .with("scopeName", table.scope.as_str());
        if let Some(scope_id) = scope_id {
            message = message.with("scope", scope_id);
        }
        Ok(message)
    }

    async fn instance_settings(&self, instance: &str) -> Result<Value> {
        let path = format!("{}/{}", instance, SETTINGS_FILE);
        let settings = match self.fs.read_string_opt(&path).await? {
            Some(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(mut settings)) => {
                    settings
                        .entry("name")
                        .or_insert_with(|| Value::String(instance.to_string()));
                    Value::Object(settings)
                }
                _ => {
                    warn!("Ignoring unreadable {}", path);
                    json!({ "name": instance })
                }
            },
            None => json!({ "name": instance }),
        };
        Ok(settings)
    }

    async fn send_save(
        &mut self,
        table: TableKey,
        record_id: String,
        fields: Vec<(String, QueueEntry)>,
        now: Instant,
    ) -> Result<()> {
        let field_names: Vec<String> = fields.iter().map(|(field, _)| field.clone()).collect();
        let field_map: Map<String, Value> = fields
            .iter()
            .map(|(field, entry)| (field.clone(), Value::String(entry.content.clone())))
            .collect();

        let mut message = match self.outbound("saveRecord", &table).await {
            Ok(message) => message,
            Err(e) => {
                self.queue
                    .restore_paused(fields.into_iter().map(|(_, entry)| entry).collect());
                self.emit_queue(now);
                return Err(e);
            }
        };
        message.sys_id = Some(record_id.clone());
        let message = message.with("fields", Value::Object(field_map));

        let completion = Continuation::Save {
            table: table.clone(),
            record_id: record_id.clone(),
            entries: fields.into_iter().map(|(_, entry)| entry).collect(),
        };
        match self.correlator.send(message, completion, now) {
            Ok(id) => {
                info!("Saving {} {} [{}] ({})", table, record_id, field_names.join(", "), id);
                self.events.emit(EngineEvent::SaveDispatched {
                    table: table.to_string(),
                    record_id,
                    fields: field_names,
                });
            }
            Err(e) => self.fail(e.completion, e.error, now).await,
        }
        Ok(())
    }

    async fn create_record(
        &mut self,
        path: &str,
        reference: RecordReference,
        content: String,
        now: Instant,
    ) -> Result<()> {
        let key = (reference.table.clone(), reference.name.clone());
        if let Some(held) = self.creating.get_mut(&key) {
            debug!("{} waits for the create of {:?}", path, reference.name);
            held.insert(path.to_string(), content);
            return Ok(());
        }
        if !self.correlator.is_connected() {
            self.report_offline();
            return Ok(());
        }

        let mut message = self.outbound("createRecord", &reference.table).await?;
        message.field_name = Some(reference.field_name.clone());
        message.content = Some(content);
        let message = message.with("name", reference.name.as_str());

        let completion = Continuation::Create {
            path: path.to_string(),
            table: reference.table.clone(),
            name: reference.name.clone(),
        };
        match self.correlator.send(message, completion, now) {
            Ok(id) => {
                info!("Creating {:?} in {} ({})", reference.name, reference.table, id);
                self.creating.insert(key, BTreeMap::new());
            }
            Err(e) => self.fail(e.completion, e.error, now).await,
        }
        Ok(())
    }

    // ---- channel side ----

    pub fn on_agent_connected(&mut self) {
        self.correlator.connect();
        self.offline_reported = false;
        let greeting = ChannelMessage::action("connected").with("version", VERSION);
        if let Err(e) = self.correlator.post(&greeting) {
            warn!("Could not greet agent: {}", e);
        }
        info!("Agent connected");
        self.events.emit(EngineEvent::AgentConnected);

        if self.queue.is_paused() {
            self.host.show_info(&format!(
                "{} change(s) are waiting in the paused queue",
                self.queue.len()
            ));
        }
    }

    /// Fail everything in flight. Shown to the user once per disconnect.
    pub async fn on_agent_disconnected(&mut self, now: Instant) {
        let failed = self.correlator.disconnect();
        let count = failed.len();
        for operation in failed {
            self.fail(operation.completion, CorrelatorError::ConnectionLost, now)
                .await;
        }
        warn!("Agent disconnected ({} pending operation(s) failed)", count);
        self.host.show_error(&CorrelatorError::ConnectionLost.to_string());
        self.offline_reported = true;
        self.events.emit(EngineEvent::AgentDisconnected { failed: count });
    }

    pub async fn on_agent_message(&mut self, raw: &[u8], now: Instant) -> Result<()> {
        match self.correlator.on_message(raw) {
            Inbound::Resolved { operation, message } => self.complete(operation, message, now).await,
            Inbound::Unsolicited(message) => self.dispatch(message, now).await,
            Inbound::Malformed(_) => Ok(()),
        }
    }

    /// Send `message` and get its reply through a oneshot.
    pub fn request(&mut self, message: ChannelMessage, now: Instant) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.correlator.send(message, Continuation::Caller(tx), now) {
            if let Continuation::Caller(tx) = e.completion {
                let _ = tx.send(Err(e.error));
            }
        }
        rx
    }

    /// Fail every pending operation. Returns how many there were.
    pub async fn stop(&mut self, now: Instant) -> usize {
        let failed = self.correlator.disconnect();
        let count = failed.len();
        for operation in failed {
            self.fail(operation.completion, CorrelatorError::Stopped, now).await;
        }
        count
    }

    async fn complete(
        &mut self,
        operation: PendingOperation<Continuation>,
        message: ChannelMessage,
        now: Instant,
    ) -> Result<()> {
        match operation.completion {
            Continuation::Caller(tx) => {
                let reply = match message.error_detail() {
                    Some(detail) => Err(CorrelatorError::Remote(detail.to_string())),
                    None => Ok(message),
                };
                let _ = tx.send(reply);
            }
            Continuation::ResponseFile { id, command } => {
                self.write_response(FileResponse::from_reply(&id, &command, &message))
                    .await;
            }
            completion if message.error.is_some() => {
                let detail = message.error_detail().unwrap_or_default().to_string();
                warn!("{} rejected: {}", operation.command, detail);
                self.record_error(&message, &detail).await;
                self.fail(completion, CorrelatorError::Remote(detail), now).await;
            }
            Continuation::Save {
                table, record_id, ..
            } => {
                debug!("Save of {} {} confirmed", table, record_id);
                self.events.emit(EngineEvent::SaveAcknowledged {
                    table: Some(table.table),
                    record_id: Some(record_id),
                });
            }
            Continuation::Create { path, table, name } => {
                self.finish_create(path, table, name, &message, now).await?;
            }
            Continuation::ScopeLookup { instance, scope_id } => {
                self.finish_scope_lookup(instance, scope_id, &message).await?;
            }
        }
        Ok(())
    }

    async fn finish_create(
        &mut self,
        path: String,
        table: TableKey,
        name: String,
        message: &ChannelMessage,
        now: Instant,
    ) -> Result<()> {
        let held = self
            .creating
            .remove(&(table.clone(), name.clone()))
            .unwrap_or_default();
        let record_id = message
            .result()
            .and_then(|result| result.get("sys_id"))
            .and_then(Value::as_str)
            .or(message.sys_id.as_deref())
            .filter(|id| is_record_id(id))
            .map(str::to_string);
        let Some(record_id) = record_id else {
            let detail = format!("The agent did not return a record id for {}", path);
            warn!("{}", detail);
            self.host.show_error(&detail);
            self.hold_unsent(held, now);
            return Ok(());
        };

        let final_name = self
            .resolver
            .assign_name(&self.fs, &table, &record_id, &name)
            .await?;
        let mut current = path;
        let mut held: Vec<QueueEntry> = held
            .into_iter()
            .map(|(path, content)| QueueEntry { path, content })
            .collect();
        if final_name != name {
            // The name was claimed while the create was in flight. Every
            // field file of the record moves to the name it was given.
            let created = current;
            current = self.move_to_name(&created, &final_name, now).await?;
            for entry in &mut held {
                entry.path = if entry.path == created {
                    current.clone()
                } else {
                    self.move_to_name(&entry.path, &final_name, now).await?
                };
            }
            self.host.show_info(&format!(
                "{:?} is already taken in {}; saved as {:?}",
                name, table, final_name
            ));
        }

        info!("Created {} as {}", current, record_id);
        self.events.emit(EngineEvent::RecordCreated {
            path: current,
            record_id: record_id.clone(),
            name: final_name,
        });
        if held.is_empty() {
            return Ok(());
        }

        let mut fields = Vec::new();
        for entry in held {
            match self.resolver.resolve(&self.fs, &entry.path).await? {
                Some(reference) => fields.push((reference.field_name, entry)),
                None => warn!("Dropping held change to {}: no longer a record file", entry.path),
            }
        }
        if fields.is_empty() {
            return Ok(());
        }
        if !self.correlator.is_connected() {
            self.hold_unsent_entries(fields.into_iter().map(|(_, entry)| entry).collect(), now);
            return Ok(());
        }
        self.send_save(table, record_id, fields, now).await
    }

    /// Move the record file at `path` to the same field under `name`.
    async fn move_to_name(&mut self, path: &str, name: &str, now: Instant) -> Result<String> {
        let Some(mut reference) = self.resolver.resolve(&self.fs, path).await? else {
            return Ok(path.to_string());
        };
        reference.name = name.to_string();
        let renamed = reference.canonical_path();
        match self.fs.rename(path, &renamed).await {
            Ok(()) => {
                self.echoes.note_rename(path, &renamed, now);
                Ok(renamed)
            }
            Err(FsError::NotFound(_)) => Ok(renamed),
            Err(e) => Err(e.into()),
        }
    }

    /// Park content that was waiting on a create that did not finish.
    fn hold_unsent(&mut self, held: BTreeMap<String, String>, now: Instant) {
        let entries = held
            .into_iter()
            .map(|(path, content)| QueueEntry { path, content })
            .collect();
        self.hold_unsent_entries(entries, now);
    }

    fn hold_unsent_entries(&mut self, entries: Vec<QueueEntry>, now: Instant) {
        if entries.is_empty() {
            return;
        }
        self.queue.restore_paused(entries);
        self.emit_queue(now);
    }

    async fn finish_scope_lookup(
        &mut self,
        instance: String,
        scope_id: String,
        message: &ChannelMessage,
    ) -> Result<()> {
        self.scope_lookups
            .remove(&(instance.clone(), scope_id.clone()));
        let name = message
            .result()
            .and_then(scope_name)
            .map(sanitize_name)
            .filter(|name| !name.is_empty());
        match name {
            Some(name) => {
                debug!("Scope {} on {} is {:?}", scope_id, instance, name);
                self.scopes
                    .insert(&self.fs, &instance, &name, &scope_id)
                    .await?;
            }
            None => warn!("getScope for {} on {} returned no name", scope_id, instance),
        }
        Ok(())
    }

    /// Route an unsolicited message by `action`, falling back to `command`.
    async fn dispatch(&mut self, message: ChannelMessage, now: Instant) -> Result<()> {
        if message.error.is_some() {
            self.relay_error(message, now).await;
            return Ok(());
        }
        let name = message.name().unwrap_or_default().to_string();
        match name.as_str() {
            "error" => {
                self.relay_error(message, now).await;
                Ok(())
            }
            "writeRecord" => self.apply_remote_write(message, 0, now).await,
            "instanceSettings" => {
                self.save_instance_settings(&message, SettingsUpdate::Replace)
                    .await
            }
            "tokenRefresh" => {
                self.save_instance_settings(&message, SettingsUpdate::Refresh)
                    .await
            }
            "saveAck" => {
                self.events.emit(EngineEvent::SaveAcknowledged {
                    table: message.table_name,
                    record_id: message.sys_id,
                });
                Ok(())
            }
            "openFile" => self.open_remote(&message).await,
            _ => {
                debug!("Ignoring agent message {:?}", name);
                Ok(())
            }
        }
    }

    /// Show, persist and act on an agent-reported error.
    async fn relay_error(&mut self, message: ChannelMessage, now: Instant) {
        let detail = message
            .error_detail()
            .or_else(|| message.extra_str("message"))
            .unwrap_or("The agent reported an error")
            .to_string();
        warn!("Agent error: {}", detail);
        self.record_error(&message, &detail).await;

        if let Some(instance) = message.instance_name() {
            for operation in self.correlator.take_instance(instance) {
                self.fail(operation.completion, CorrelatorError::Remote(detail.clone()), now)
                    .await;
            }
        }
        if self.queue.pause_for_error(now) {
            self.host
                .show_info("Sync queue paused. Resume it once the problem is fixed");
            self.emit_queue(now);
        }
    }

    async fn record_error(&self, message: &ChannelMessage, detail: &str) {
        self.host.show_error(detail);
        self.events.emit(EngineEvent::ErrorSurfaced {
            message: detail.to_string(),
        });

        let last = LastError::from_message(message, detail);
        let written = match serde_json::to_vec_pretty(&last) {
            Ok(bytes) => self.fs.write(LAST_ERROR_FILE, &bytes).await.map_err(EngineError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            warn!("Could not write {}: {}", LAST_ERROR_FILE, e);
        }
    }

    /// Persist `instance/settings.json`.
    ///
    /// `Replace` keeps only what the agent reported. `Merge` layers the
    /// reported instance object over what is on disk. `Refresh` additionally
    /// takes the message's loose keys (new tokens).
    async fn save_instance_settings(
        &mut self,
        message: &ChannelMessage,
        mode: SettingsUpdate,
    ) -> Result<()> {
        let Some(instance) = message.instance_name().map(sanitize_name) else {
            warn!("Instance settings without an instance name");
            return Ok(());
        };
        let path = format!("{}/{}", instance, SETTINGS_FILE);

        let mut settings = Map::new();
        if mode != SettingsUpdate::Replace {
            if let Value::Object(existing) = self.instance_settings(&instance).await? {
                settings = existing;
            }
        }
        if let Some(Value::Object(reported)) = &message.instance {
            settings.extend(reported.clone());
        }
        if mode == SettingsUpdate::Refresh {
            settings.extend(message.extra.clone());
        }
        settings
            .entry("name")
            .or_insert_with(|| Value::String(instance.clone()));

        self.fs
            .write(&path, &serde_json::to_vec_pretty(&Value::Object(settings))?)
            .await?;
        debug!("Updated {}", path);
        Ok(())
    }

    /// Write one remote field to disk. `attempt` counts scope retries.
    ///
    /// Every outcome except a deferral is answered with `writeRecordResult`.
    async fn apply_remote_write(
        &mut self,
        message: ChannelMessage,
        attempt: u32,
        now: Instant,
    ) -> Result<()> {
        match self.write_remote(&message, attempt, now).await {
            Ok(RemoteWrite::Written { path, length }) => {
                self.ack_write(&message, Some((&path, length)), None);
                Ok(())
            }
            Ok(RemoteWrite::Deferred { instance, scope_id }) => {
                self.defer_write(message, instance, scope_id, attempt, now)
                    .await;
                Ok(())
            }
            Ok(RemoteWrite::Refused(reason)) => {
                warn!("Ignoring writeRecord: {}", reason);
                self.ack_write(&message, None, Some(&reason));
                Ok(())
            }
            Err(e) => {
                self.ack_write(&message, None, Some(&e.to_string()));
                Err(e)
            }
        }
    }

    async fn write_remote(
        &mut self,
        message: &ChannelMessage,
        attempt: u32,
        now: Instant,
    ) -> Result<RemoteWrite> {
        let (Some(instance), Some(table), Some(record_id), Some(field)) = (
            message.instance_name().map(sanitize_name),
            message.table_name.clone(),
            message.sys_id.clone(),
            message.field_name.clone(),
        ) else {
            return Ok(RemoteWrite::Refused("incomplete writeRecord message".into()));
        };
        if instance.is_empty() || instance.starts_with('.') {
            return Ok(RemoteWrite::Refused(format!("invalid instance name {:?}", instance)));
        }
        if !is_identifier(&table) {
            return Ok(RemoteWrite::Refused(format!("invalid table name {:?}", table)));
        }
        if !is_identifier(&field) {
            return Ok(RemoteWrite::Refused(format!("invalid field name {:?}", field)));
        }
        if !is_record_id(&record_id) {
            return Ok(RemoteWrite::Refused(format!("invalid sys_id {:?}", record_id)));
        }

        if attempt == 0 && matches!(message.instance, Some(Value::Object(_))) {
            self.save_instance_settings(message, SettingsUpdate::Merge)
                .await?;
        }

        let scope_id = message
            .extra_str("scope")
            .filter(|id| !id.is_empty())
            .unwrap_or(GLOBAL_SCOPE)
            .to_string();
        if let Some(known) = message.extra_str("scopeName").map(sanitize_name) {
            let cached = self
                .scopes
                .name_for_id(&self.fs, &instance, &scope_id)
                .await?;
            if !known.is_empty() && !known.starts_with('.') && cached.is_none() {
                self.scopes
                    .insert(&self.fs, &instance, &known, &scope_id)
                    .await?;
            }
        }

        let Some(scope) = self
            .scopes
            .name_for_id(&self.fs, &instance, &scope_id)
            .await?
        else {
            return Ok(RemoteWrite::Deferred { instance, scope_id });
        };

        let display_name = sanitize_name(message.extra_str("name").unwrap_or_default());
        let extension = extension_for_field_type(message.extra_str("fieldType").unwrap_or_default());
        let reference = self
            .resolver
            .reference_for_remote(
                &self.fs,
                TableKey::new(instance, scope, table),
                &record_id,
                &display_name,
                &field,
                extension,
            )
            .await?;

        let path = reference.canonical_path();
        let content = message.content.clone().unwrap_or_default();
        self.fs.write(&path, content.as_bytes()).await?;
        let length = content.len();
        self.echoes.note_write(&path, content, now);
        if self.queue.remove(&path).is_some() {
            debug!("Remote write to {} replaced a queued local change", path);
            self.emit_queue(now);
        }

        info!("Wrote {} ({} bytes)", path, length);
        self.events
            .emit(EngineEvent::RecordWritten { path: path.clone() });
        if self.config.open_on_write {
            self.host.open_file(&path).await;
        }
        Ok(RemoteWrite::Written { path, length })
    }

    /// Park a write whose scope is unknown, looking the scope up if needed.
    async fn defer_write(
        &mut self,
        message: ChannelMessage,
        instance: String,
        scope_id: String,
        attempt: u32,
        now: Instant,
    ) {
        let lookup = (instance.clone(), scope_id.clone());
        if !self.scope_lookups.contains(&lookup) && self.correlator.is_connected() {
            let request = ChannelMessage {
                instance: message.instance.clone(),
                ..ChannelMessage::command("getScope")
            }
            .with("scopeId", scope_id.as_str());
            let completion = Continuation::ScopeLookup {
                instance: instance.clone(),
                scope_id: scope_id.clone(),
            };
            match self.correlator.send(request, completion, now) {
                Ok(_) => {
                    self.scope_lookups.insert(lookup.clone());
                }
                Err(e) => self.fail(e.completion, e.error, now).await,
            }
        }

        let table = message.table_name.clone().unwrap_or_default();
        let record_id = message.sys_id.clone().unwrap_or_default();
        match self.retries.schedule(message, attempt, now) {
            Ok(next) => debug!(
                "Scope {} unknown on {}; retry {} of {} for {} {}",
                scope_id,
                instance,
                next,
                self.retries.policy().limit,
                table,
                record_id
            ),
            Err(message) => {
                // A lookup that never got an answer must not block the next write.
                self.scope_lookups.remove(&lookup);
                let reason = format!("scope {} is unknown on {}", scope_id, instance);
                warn!("Dropping write of {} {}: {}", table, record_id, reason);
                self.events.emit(EngineEvent::WriteDropped {
                    table,
                    record_id,
                    reason: reason.clone(),
                });
                self.ack_write(&message, None, Some(&reason));
            }
        }
    }

    /// Answer a `writeRecord`, echoing its `agentRequestId`.
    fn ack_write(
        &mut self,
        request: &ChannelMessage,
        written: Option<(&str, usize)>,
        error: Option<&str>,
    ) {
        if !self.correlator.is_connected() {
            return;
        }
        let mut ack = ChannelMessage {
            instance: request
                .instance_name()
                .map(|name| Value::String(name.to_string())),
            table_name: request.table_name.clone(),
            field_name: request.field_name.clone(),
            sys_id: request.sys_id.clone(),
            agent_request_id: request.agent_request_id.clone(),
            error: error.map(ErrorDetail::new),
            ..ChannelMessage::action("writeRecordResult")
        };
        if let Some((path, length)) = written {
            ack = ack.with("fileName", path).with("contentLength", length);
        }
        if let Err(e) = self.correlator.post(&ack) {
            warn!("Could not acknowledge write: {}", e);
        }
    }

    async fn open_remote(&mut self, message: &ChannelMessage) -> Result<()> {
        let (Some(instance), Some(table), Some(record_id)) = (
            message.instance_name().map(sanitize_name),
            message.table_name.clone(),
            message.sys_id.clone(),
        ) else {
            debug!("openFile without instance, table or sys_id");
            return Ok(());
        };
        let scope_id = message.extra_str("scope").unwrap_or(GLOBAL_SCOPE);
        let Some(scope) = self
            .scopes
            .name_for_id(&self.fs, &instance, scope_id)
            .await?
        else {
            self.host
                .show_info(&format!("Scope {} has not been synced yet", scope_id));
            return Ok(());
        };

        let key = TableKey::new(instance, scope, table);
        match self.resolver.name_for(&self.fs, &key, &record_id).await? {
            Some(name) => {
                let reference = RecordReference {
                    folder: self.resolver.folder_tables().contains(&key.table),
                    table: key,
                    record_id: Some(record_id),
                    field_name: message.field_name.clone().unwrap_or_else(|| "script".into()),
                    name,
                    extension: extension_for_field_type(
                        message.extra_str("fieldType").unwrap_or_default(),
                    )
                    .to_string(),
                };
                self.host.open_file(&reference.canonical_path()).await;
            }
            None => self.host.show_info(&format!(
                "Record {} has not been synced to this workspace",
                record_id
            )),
        }
        Ok(())
    }

    // ---- request files ----

    async fn on_request_file(&mut self, path: &str, content: &str, now: Instant) -> Result<()> {
        if content.trim().is_empty() {
            return Ok(());
        }
        let request = match FileRequest::parse(content.as_bytes()) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring request file {}: {}", path, e);
                return Ok(());
            }
        };
        match self.fs.delete(path).await {
            Ok(()) | Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let message = match request.to_message() {
            Ok(message) => message,
            Err(e) => {
                self.write_response(FileResponse::error(&request.id, &request.command, e.to_string()))
                    .await;
                return Ok(());
            }
        };
        let completion = Continuation::ResponseFile {
            id: request.id.clone(),
            command: request.command.clone(),
        };
        match self.correlator.send(message, completion, now) {
            Ok(id) => debug!("Forwarded request {} as {}", request.id, id),
            Err(e) => self.fail(e.completion, e.error, now).await,
        }
        Ok(())
    }

    async fn write_response(&self, response: FileResponse) {
        let result = async {
            let path = response_path(&response.id)?;
            let bytes = serde_json::to_vec_pretty(&response)?;
            self.fs.write(&path, &bytes).await?;
            Ok::<_, EngineError>(path)
        }
        .await;
        match result {
            Ok(path) => debug!("Wrote {}", path),
            Err(e) => warn!("Could not write response for {}: {}", response.id, e),
        }
    }

    // ---- shared ----

    async fn fail(&mut self, completion: Continuation, error: CorrelatorError, now: Instant) {
        match completion {
            Continuation::Save {
                table,
                record_id,
                entries,
            } => {
                debug!("Save of {} {} failed: {}", table, record_id, error);
                self.queue.restore_paused(entries);
                if error == CorrelatorError::NotConnected {
                    self.report_offline();
                }
                self.emit_queue(now);
            }
            Continuation::Create { path, table, name } => {
                // Still unmapped: the next save tries again.
                debug!("Create of {} failed: {}", path, error);
                let held = self.creating.remove(&(table, name)).unwrap_or_default();
                self.hold_unsent(held, now);
                if error == CorrelatorError::NotConnected {
                    self.report_offline();
                }
            }
            Continuation::ScopeLookup { instance, scope_id } => {
                self.scope_lookups.remove(&(instance, scope_id));
            }
            Continuation::ResponseFile { id, command } => {
                self.write_response(FileResponse::error(&id, &command, error.to_string()))
                    .await;
            }
            Continuation::Caller(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }

    fn report_offline(&mut self) {
        if self.offline_reported {
            return;
        }
        let message = CorrelatorError::NotConnected.to_string();
        warn!("{}", message);
        self.host.show_error(&message);
        self.events.emit(EngineEvent::ErrorSurfaced { message });
        self.offline_reported = true;
    }

    fn emit_queue(&self, now: Instant) {
        self.events.emit(EngineEvent::QueueChanged {
            pending: self.queue.entries().iter().map(|e| e.path.clone()).collect(),
            paused: self.queue.is_paused(),
            remaining_ms: self.queue.remaining(now).map(|d| d.as_millis() as u64),
        });
    }
}
