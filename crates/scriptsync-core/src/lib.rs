//! scriptsync-core: synchronization engine between a local file tree and
//! remote script records reached through a browser-side agent.
//!
//! This crate provides:
//! - The path grammar and name mapping that give each file a record identity
//! - A debounce queue that coalesces file changes into record saves
//! - A correlator multiplexing requests over the single agent channel
//! - Scope resolution with bounded retry
//! - `SyncEngine`, which drives all of the above without I/O of its own

pub mod correlator;
pub mod echo;
pub mod engine;
pub mod events;
pub mod fs;
pub mod host;
pub mod mapping;
pub mod message;
pub mod queue;
pub mod record;
pub mod requests;
pub mod resolver;
pub mod scope;

pub use correlator::{Correlator, CorrelatorError, Inbound, PendingOperation};
pub use echo::EchoFilter;
pub use engine::{Continuation, EngineConfig, EngineError, EngineInput, Reply, SyncEngine};
pub use events::{EngineEvent, EventBus, Subscription};
pub use fs::{FileSystem, FsError, InMemoryFs};
pub use host::HostEditor;
#[cfg(any(test, feature = "test-util"))]
pub use host::{HostCall, RecordingHost};
pub use mapping::NameMapping;
pub use message::{ChannelMessage, ErrorDetail, MAX_MESSAGE_SIZE};
pub use queue::{DebounceQueue, QueueEntry, QueueState};
pub use record::{FolderRecordTables, RecordPath, RecordReference, TableKey};
pub use requests::{FileRequest, FileResponse};
pub use resolver::{IdentityResolver, RenameOutcome, RenameRejection};
pub use scope::{RetryPolicy, RetrySchedule, ScopeCache};
