//! Scope cache and the bounded retry used when a scope is not yet known.
//!
//! Remote writes name their scope by id, but files live under the scope's
//! directory name. `instance/scopes.json` maps directory name → scope id.
//! A miss triggers a lookup over the channel; the write itself is retried a
//! fixed number of times after a fixed delay and then dropped.

use crate::fs::{FileSystem, FsError};
use crate::record::{GLOBAL_SCOPE, SCOPES_FILE};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Corrupt scope cache {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScopeError>;

pub const DEFAULT_RETRY_LIMIT: u32 = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(2500);

fn scopes_path(instance: &str) -> String {
    format!("{}/{}", instance, SCOPES_FILE)
}

/// Per-instance scope name ↔ id tables, loaded lazily from `scopes.json`.
#[derive(Debug, Default)]
pub struct ScopeCache {
    instances: HashMap<String, BTreeMap<String, String>>,
}

impl ScopeCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn read<F: FileSystem + ?Sized>(
        fs: &F,
        instance: &str,
    ) -> Result<BTreeMap<String, String>> {
        let path = scopes_path(instance);
        match fs.read_string_opt(&path).await? {
            Some(text) if !text.trim().is_empty() => {
                serde_json::from_str(&text).map_err(|source| ScopeError::Parse { path, source })
            }
            _ => Ok(BTreeMap::new()),
        }
    }

    async fn scopes<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        instance: &str,
    ) -> Result<&BTreeMap<String, String>> {
        if !self.instances.contains_key(instance) {
            let scopes = Self::read(fs, instance).await?;
            self.instances.insert(instance.to_string(), scopes);
        }
        Ok(&self.instances[instance])
    }

    /// Directory name for a scope id.
    pub async fn name_for_id<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        instance: &str,
        scope_id: &str,
    ) -> Result<Option<String>> {
        if scope_id == GLOBAL_SCOPE {
            return Ok(Some(GLOBAL_SCOPE.to_string()));
        }
        Ok(self
            .scopes(fs, instance)
            .await?
            .iter()
            .find(|(_, id)| id.as_str() == scope_id)
            .map(|(name, _)| name.clone()))
    }

    /// Scope id for a directory name.
    pub async fn id_for_name<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        instance: &str,
        name: &str,
    ) -> Result<Option<String>> {
        if name == GLOBAL_SCOPE {
            return Ok(Some(GLOBAL_SCOPE.to_string()));
        }
        Ok(self.scopes(fs, instance).await?.get(name).cloned())
    }

    /// Record a scope, merging into whatever is on disk.
    pub async fn insert<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        instance: &str,
        name: &str,
        scope_id: &str,
    ) -> Result<()> {
        let mut scopes = Self::read(fs, instance).await?;
        scopes.insert(name.to_string(), scope_id.to_string());
        fs.write(&scopes_path(instance), &serde_json::to_vec_pretty(&scopes)?)
            .await?;
        self.instances.insert(instance.to_string(), scopes);
        Ok(())
    }
}

/// How often and how long to retry a write blocked on an unknown scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub limit: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RETRY_LIMIT,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug)]
struct Scheduled<T> {
    due: Instant,
    attempt: u32,
    item: T,
}

/// Writes waiting for a scope lookup, ordered by due time.
#[derive(Debug)]
pub struct RetrySchedule<T> {
    policy: RetryPolicy,
    pending: Vec<Scheduled<T>>,
}

impl<T> RetrySchedule<T> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Schedule another attempt after `attempt` failed.
    ///
    /// Returns the item back when the retry budget is spent.
    pub fn schedule(&mut self, item: T, attempt: u32, now: Instant) -> std::result::Result<u32, T> {
        if attempt >= self.policy.limit {
            return Err(item);
        }
        let next = attempt + 1;
        self.pending.push(Scheduled {
            due: now + self.policy.delay,
            attempt: next,
            item,
        });
        Ok(next)
    }

    /// Remove and return everything due at `now`, oldest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<(T, u32)> {
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|s| s.due <= now);
        self.pending = waiting;
        let mut due = due;
        due.sort_by_key(|s| s.due);
        due.into_iter().map(|s| (s.item, s.attempt)).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|s| s.due).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    #[tokio::test]
    async fn test_global_never_needs_lookup() {
        let fs = InMemoryFs::new();
        let mut cache = ScopeCache::new();
        assert_eq!(
            cache.name_for_id(&fs, "acme", "global").await.unwrap().as_deref(),
            Some("global")
        );
        assert_eq!(
            cache.id_for_name(&fs, "acme", "global").await.unwrap().as_deref(),
            Some("global")
        );
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let fs = InMemoryFs::new();
        fs.write("acme/scopes.json", br#"{"x_old":"id_old"}"#)
            .await
            .unwrap();
        let mut cache = ScopeCache::new();

        assert_eq!(cache.name_for_id(&fs, "acme", "id_new").await.unwrap(), None);
        cache.insert(&fs, "acme", "x_new", "id_new").await.unwrap();

        assert_eq!(
            cache.name_for_id(&fs, "acme", "id_new").await.unwrap().as_deref(),
            Some("x_new")
        );
        assert_eq!(
            cache.id_for_name(&fs, "acme", "x_old").await.unwrap().as_deref(),
            Some("id_old")
        );

        let on_disk: BTreeMap<String, String> =
            serde_json::from_str(&fs.contents("acme/scopes.json").unwrap()).unwrap();
        assert_eq!(on_disk.len(), 2);
    }

    #[test]
    fn test_retry_budget() {
        let mut schedule = RetrySchedule::new(RetryPolicy::default());
        let start = Instant::now();

        assert_eq!(schedule.schedule("write", 0, start), Ok(1));
        assert!(schedule.take_due(start).is_empty());
        assert_eq!(schedule.next_deadline(), Some(start + DEFAULT_RETRY_DELAY));

        let due = schedule.take_due(start + DEFAULT_RETRY_DELAY);
        assert_eq!(due, vec![("write", 1)]);

        assert_eq!(schedule.schedule("write", 1, start), Ok(2));
        schedule.take_due(start + DEFAULT_RETRY_DELAY);
        assert_eq!(schedule.schedule("write", 2, start), Err("write"));
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_take_due_orders_by_deadline() {
        let policy = RetryPolicy {
            limit: 5,
            delay: Duration::from_millis(10),
        };
        let mut schedule = RetrySchedule::new(policy);
        let start = Instant::now();
        schedule.schedule("late", 0, start + Duration::from_millis(5)).unwrap();
        schedule.schedule("early", 0, start).unwrap();

        let due = schedule.take_due(start + Duration::from_millis(100));
        assert_eq!(due, vec![("early", 1), ("late", 1)]);
    }
}
