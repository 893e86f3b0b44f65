//! Persistent display-name → record-id tables.
//!
//! Each `{instance, scope, table}` folder carries a `_map.json`. Tables are
//! loaded lazily on first lookup. Every mutation re-reads the file, applies
//! the change on top of what is on disk and writes the result back, so keys
//! added by another process in the meantime survive.

use crate::fs::{FileSystem, FsError};
use crate::record::TableKey;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Corrupt name mapping {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MappingError>;

type Table = BTreeMap<String, String>;

/// Suffix appended to a colliding name: first and last two characters of the
/// record id, upper-cased.
pub fn collision_suffix(record_id: &str) -> String {
    let chars: Vec<char> = record_id.chars().collect();
    if chars.len() <= 4 {
        return record_id.to_uppercase();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}", head, tail).to_uppercase()
}

/// Pick a name for `record_id` that is free in `table`.
fn resolve_collision(table: &Table, requested: &str, record_id: &str) -> String {
    let is_free = |name: &str| table.get(name).is_none_or(|id| id == record_id);

    if is_free(requested) {
        return requested.to_string();
    }

    let suffixed = format!("{}_{}", requested, collision_suffix(record_id));
    if is_free(&suffixed) {
        return suffixed;
    }

    (2u32..)
        .map(|n| format!("{}_{}", suffixed, n))
        .find(|candidate| is_free(candidate))
        .unwrap_or(suffixed)
}

/// Outcome of rewriting a mapping key after an on-disk rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRename {
    /// The old key moved to the new one.
    Moved { record_id: String },
    /// The new key already pointed at the same record.
    AlreadyCurrent { record_id: String },
    /// Neither name is mapped; nothing to rewrite.
    Unmapped,
    /// The new name belongs to a different record.
    Taken { owner: String },
}

/// Cache of every name mapping table touched so far.
#[derive(Debug, Default)]
pub struct NameMapping {
    tables: HashMap<TableKey, Table>,
}

impl NameMapping {
    pub fn new() -> Self {
        Self::default()
    }

    async fn read_table<F: FileSystem + ?Sized>(fs: &F, key: &TableKey) -> Result<Table> {
        let path = key.map_path();
        match fs.read_string_opt(&path).await? {
            Some(text) if text.trim().is_empty() => Ok(Table::new()),
            Some(text) => {
                serde_json::from_str(&text).map_err(|source| MappingError::Parse { path, source })
            }
            None => Ok(Table::new()),
        }
    }

    async fn table<F: FileSystem + ?Sized>(&mut self, fs: &F, key: &TableKey) -> Result<&Table> {
        if !self.tables.contains_key(key) {
            let table = Self::read_table(fs, key).await?;
            debug!("Loaded name mapping for {} ({} entries)", key, table.len());
            self.tables.insert(key.clone(), table);
        }
        Ok(&self.tables[key])
    }

    /// Re-read from disk, apply `change`, write back and refresh the cache.
    async fn update<F, T>(
        &mut self,
        fs: &F,
        key: &TableKey,
        change: impl FnOnce(&mut Table) -> (T, bool),
    ) -> Result<T>
    where
        F: FileSystem + ?Sized,
    {
        let mut table = Self::read_table(fs, key).await?;
        let (out, dirty) = change(&mut table);
        if dirty {
            let bytes = serde_json::to_vec_pretty(&table)?;
            fs.write(&key.map_path(), &bytes).await?;
        }
        self.tables.insert(key.clone(), table);
        Ok(out)
    }

    pub async fn record_id_for<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        key: &TableKey,
        name: &str,
    ) -> Result<Option<String>> {
        Ok(self.table(fs, key).await?.get(name).cloned())
    }

    /// Reverse lookup: the display name currently bound to `record_id`.
    pub async fn name_for<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        key: &TableKey,
        record_id: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .table(fs, key)
            .await?
            .iter()
            .find(|(_, id)| id.as_str() == record_id)
            .map(|(name, _)| name.clone()))
    }

    /// Bind `record_id` to `requested` (or a collision-free variant of it).
    ///
    /// A record that already has a name keeps it.
    pub async fn assign_name<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        key: &TableKey,
        record_id: &str,
        requested: &str,
    ) -> Result<String> {
        let requested = if requested.trim().is_empty() {
            record_id
        } else {
            requested
        };

        let name = self
            .update(fs, key, |table| {
                if let Some((existing, _)) = table.iter().find(|(_, id)| id.as_str() == record_id) {
                    return (existing.clone(), false);
                }
                let name = resolve_collision(table, requested, record_id);
                table.insert(name.clone(), record_id.to_string());
                (name, true)
            })
            .await?;

        if name != requested {
            debug!(
                "Name {:?} taken in {}, record {} stored as {:?}",
                requested, key, record_id, name
            );
        }
        Ok(name)
    }

    /// Move the key `old` to `new`, keeping the record id.
    pub async fn rename_key<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        key: &TableKey,
        old: &str,
        new: &str,
    ) -> Result<KeyRename> {
        self.update(fs, key, |table| {
            let old_id = table.get(old).cloned();
            match (old_id, table.get(new).cloned()) {
                (_, Some(record_id)) if old == new => (KeyRename::AlreadyCurrent { record_id }, false),
                (Some(old_id), Some(new_id)) if old_id == new_id => {
                    table.remove(old);
                    (KeyRename::AlreadyCurrent { record_id: new_id }, true)
                }
                (Some(_), Some(owner)) => (KeyRename::Taken { owner }, false),
                (Some(record_id), None) => {
                    table.remove(old);
                    table.insert(new.to_string(), record_id.clone());
                    (KeyRename::Moved { record_id }, true)
                }
                (None, Some(record_id)) => (KeyRename::AlreadyCurrent { record_id }, false),
                (None, None) => (KeyRename::Unmapped, false),
            }
        })
        .await
    }

    /// Forget cached tables so the next lookup re-reads from disk.
    pub fn invalidate(&mut self, key: &TableKey) {
        self.tables.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    const ID_A: &str = "aa11111111111111111111111111b2c3";
    const ID_B: &str = "9f00000000000000000000000000000d";
    const ID_C: &str = "9f0000000000000000000000000000ff";

    fn key() -> TableKey {
        TableKey::new("acme", "global", "sys_script_include")
    }

    #[test]
    fn test_collision_suffix() {
        assert_eq!(collision_suffix(ID_A), "AAC3");
        assert_eq!(collision_suffix("ab"), "AB");
    }

    #[tokio::test]
    async fn test_assign_and_lookup() {
        let fs = InMemoryFs::new();
        let mut mapping = NameMapping::new();

        let name = mapping.assign_name(&fs, &key(), ID_A, "Util").await.unwrap();
        assert_eq!(name, "Util");
        assert_eq!(
            mapping.record_id_for(&fs, &key(), "Util").await.unwrap(),
            Some(ID_A.to_string())
        );
        assert_eq!(
            mapping.name_for(&fs, &key(), ID_A).await.unwrap(),
            Some("Util".to_string())
        );

        let on_disk: Table =
            serde_json::from_str(&fs.contents(&key().map_path()).unwrap()).unwrap();
        assert_eq!(on_disk.get("Util").map(String::as_str), Some(ID_A));
    }

    #[tokio::test]
    async fn test_collision_never_overwrites() {
        let fs = InMemoryFs::new();
        let mut mapping = NameMapping::new();

        let first = mapping.assign_name(&fs, &key(), ID_A, "Util").await.unwrap();
        let second = mapping.assign_name(&fs, &key(), ID_B, "Util").await.unwrap();
        let third = mapping.assign_name(&fs, &key(), ID_C, "Util").await.unwrap();

        assert_eq!(first, "Util");
        assert_eq!(second, "Util_9F0D");
        assert_eq!(third, "Util_9FFF");

        // Shares ID_C's suffix, so it falls through to a counter.
        let fourth_id = "9f0000000000000000000000000000fF";
        let fourth = mapping
            .assign_name(&fs, &key(), fourth_id, "Util")
            .await
            .unwrap();
        assert_eq!(fourth, "Util_9FFF_2");

        assert_eq!(
            mapping.record_id_for(&fs, &key(), "Util").await.unwrap(),
            Some(ID_A.to_string())
        );
    }

    #[tokio::test]
    async fn test_collisions_are_deterministic() {
        let mut runs = Vec::new();
        for _ in 0..2 {
            let fs = InMemoryFs::new();
            let mut mapping = NameMapping::new();
            let mut names = Vec::new();
            for id in [ID_A, ID_B, ID_C] {
                names.push(mapping.assign_name(&fs, &key(), id, "Util").await.unwrap());
            }
            runs.push(names);
        }
        assert_eq!(runs[0], runs[1]);
        let unique: std::collections::BTreeSet<_> = runs[0].iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[tokio::test]
    async fn test_existing_record_keeps_its_name() {
        let fs = InMemoryFs::new();
        let mut mapping = NameMapping::new();

        mapping.assign_name(&fs, &key(), ID_A, "Util").await.unwrap();
        let again = mapping.assign_name(&fs, &key(), ID_A, "Other").await.unwrap();
        assert_eq!(again, "Util");
    }

    #[tokio::test]
    async fn test_empty_name_falls_back_to_record_id() {
        let fs = InMemoryFs::new();
        let mut mapping = NameMapping::new();

        let name = mapping.assign_name(&fs, &key(), ID_A, "  ").await.unwrap();
        assert_eq!(name, ID_A);
    }

    #[tokio::test]
    async fn test_write_merges_external_edits() {
        let fs = InMemoryFs::new();
        let mut mapping = NameMapping::new();

        mapping.assign_name(&fs, &key(), ID_A, "Util").await.unwrap();

        // Another process adds an entry behind our back.
        let external = format!(r#"{{"Util":"{}","Other":"{}"}}"#, ID_A, ID_B);
        fs.write(&key().map_path(), external.as_bytes()).await.unwrap();

        mapping.assign_name(&fs, &key(), ID_C, "Third").await.unwrap();

        let on_disk: Table =
            serde_json::from_str(&fs.contents(&key().map_path()).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 3);
        assert_eq!(on_disk.get("Other").map(String::as_str), Some(ID_B));
    }

    #[tokio::test]
    async fn test_rename_key() {
        let fs = InMemoryFs::new();
        let mut mapping = NameMapping::new();
        mapping.assign_name(&fs, &key(), ID_A, "Util").await.unwrap();
        mapping.assign_name(&fs, &key(), ID_B, "Taken").await.unwrap();

        let moved = mapping.rename_key(&fs, &key(), "Util", "Helper").await.unwrap();
        assert_eq!(moved, KeyRename::Moved { record_id: ID_A.to_string() });
        assert_eq!(mapping.record_id_for(&fs, &key(), "Util").await.unwrap(), None);
        assert_eq!(
            mapping.record_id_for(&fs, &key(), "Helper").await.unwrap(),
            Some(ID_A.to_string())
        );

        let taken = mapping.rename_key(&fs, &key(), "Helper", "Taken").await.unwrap();
        assert_eq!(taken, KeyRename::Taken { owner: ID_B.to_string() });

        let again = mapping.rename_key(&fs, &key(), "Util", "Helper").await.unwrap();
        assert_eq!(again, KeyRename::AlreadyCurrent { record_id: ID_A.to_string() });

        let unmapped = mapping.rename_key(&fs, &key(), "Nope", "Nada").await.unwrap();
        assert_eq!(unmapped, KeyRename::Unmapped);
    }

    #[tokio::test]
    async fn test_corrupt_map_is_an_error() {
        let fs = InMemoryFs::new();
        fs.write(&key().map_path(), b"{not json").await.unwrap();
        let mut mapping = NameMapping::new();

        let err = mapping.record_id_for(&fs, &key(), "Util").await.unwrap_err();
        assert!(matches!(err, MappingError::Parse { .. }));
    }
}
