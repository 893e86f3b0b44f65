//! Two-way translation between workspace paths and record references.

use crate::fs::FileSystem;
use crate::mapping::{KeyRename, NameMapping, Result};
use crate::record::{FolderRecordTables, PathParts, RecordPath, RecordReference, TableKey};
use thiserror::Error;
use tracing::debug;

/// Why an on-disk rename cannot be applied to the remote record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenameRejection {
    #[error("the field segment encodes the remote field and cannot change ({from} -> {to})")]
    FieldChanged { from: String, to: String },

    #[error("the extension encodes the field type and cannot change (.{from} -> .{to})")]
    ExtensionChanged { from: String, to: String },

    #[error("records cannot move between instances, scopes or tables ({from} -> {to})")]
    LocationChanged { from: String, to: String },

    #[error("the new path is not a valid record file name")]
    NotARecordPath,

    #[error("the name {name:?} already belongs to record {owner}")]
    NameTaken { name: String, owner: String },
}

/// Result of validating a rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameOutcome {
    /// Mapping updated (or nothing to update). `record_id` is known when the
    /// record exists remotely.
    Accepted {
        old_name: String,
        new_name: String,
        record_id: Option<String>,
    },
    /// The rename must be reverted on disk.
    Rejected(RenameRejection),
    /// The old path was never a record file.
    Ignored,
}

/// Path ↔ record translation backed by the name mapping tables.
#[derive(Debug)]
pub struct IdentityResolver {
    folder_tables: FolderRecordTables,
    mapping: NameMapping,
}

impl IdentityResolver {
    pub fn new(folder_tables: FolderRecordTables, mapping: NameMapping) -> Self {
        Self {
            folder_tables,
            mapping,
        }
    }

    pub fn folder_tables(&self) -> &FolderRecordTables {
        &self.folder_tables
    }

    pub fn parse(&self, path: &str) -> RecordPath {
        RecordPath::parse(path, &self.folder_tables)
    }

    /// Drop the cached mapping for a table whose `_map.json` changed on disk.
    pub fn invalidate(&mut self, key: &TableKey) {
        self.mapping.invalidate(key);
    }

    /// Resolve a workspace path. `Ok(None)` means "not a record file".
    pub async fn resolve<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        path: &str,
    ) -> Result<Option<RecordReference>> {
        let Some((parts, folder)) = self.parse(path).into_parts() else {
            return Ok(None);
        };
        let record_id = self
            .mapping
            .record_id_for(fs, &parts.table, &parts.name)
            .await?;
        let PathParts {
            table,
            name,
            field,
            extension,
        } = parts;
        Ok(Some(RecordReference {
            table,
            record_id,
            field_name: field,
            name,
            extension,
            folder,
        }))
    }

    /// Record id for a display name, `None` when the record must be created.
    pub async fn record_id_for<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        key: &TableKey,
        name: &str,
    ) -> Result<Option<String>> {
        self.mapping.record_id_for(fs, key, name).await
    }

    pub async fn name_for<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        key: &TableKey,
        record_id: &str,
    ) -> Result<Option<String>> {
        self.mapping.name_for(fs, key, record_id).await
    }

    /// Bind a record id to a name. The returned name may differ from the
    /// requested one when it collides.
    pub async fn assign_name<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        key: &TableKey,
        record_id: &str,
        requested: &str,
    ) -> Result<String> {
        self.mapping.assign_name(fs, key, record_id, requested).await
    }

    /// Build the reference a remote record's field should be written to.
    pub async fn reference_for_remote<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        key: TableKey,
        record_id: &str,
        display_name: &str,
        field_name: &str,
        extension: &str,
    ) -> Result<RecordReference> {
        let name = self
            .mapping
            .assign_name(fs, &key, record_id, display_name)
            .await?;
        let folder = self.folder_tables.contains(&key.table);
        Ok(RecordReference {
            table: key,
            record_id: Some(record_id.to_string()),
            field_name: field_name.to_string(),
            name,
            extension: extension.to_string(),
            folder,
        })
    }

    /// Validate a rename and rewrite the mapping key when it is allowed.
    pub async fn on_rename<F: FileSystem + ?Sized>(
        &mut self,
        fs: &F,
        old_path: &str,
        new_path: &str,
    ) -> Result<RenameOutcome> {
        let Some(old) = self.parse(old_path).parts().cloned() else {
            return Ok(RenameOutcome::Ignored);
        };
        let Some(new) = self.parse(new_path).parts().cloned() else {
            return Ok(RenameOutcome::Rejected(RenameRejection::NotARecordPath));
        };

        if old.table != new.table {
            return Ok(RenameOutcome::Rejected(RenameRejection::LocationChanged {
                from: old.table.to_string(),
                to: new.table.to_string(),
            }));
        }
        if old.field != new.field {
            return Ok(RenameOutcome::Rejected(RenameRejection::FieldChanged {
                from: old.field,
                to: new.field,
            }));
        }
        if old.extension != new.extension {
            return Ok(RenameOutcome::Rejected(RenameRejection::ExtensionChanged {
                from: old.extension,
                to: new.extension,
            }));
        }

        let record_id = match self
            .mapping
            .rename_key(fs, &old.table, &old.name, &new.name)
            .await?
        {
            KeyRename::Moved { record_id } => {
                debug!(
                    "Renamed {} in {}: {:?} -> {:?}",
                    record_id, old.table, old.name, new.name
                );
                Some(record_id)
            }
            KeyRename::AlreadyCurrent { record_id } => Some(record_id),
            KeyRename::Unmapped => None,
            KeyRename::Taken { owner } => {
                return Ok(RenameOutcome::Rejected(RenameRejection::NameTaken {
                    name: new.name,
                    owner,
                }));
            }
        };

        Ok(RenameOutcome::Accepted {
            old_name: old.name,
            new_name: new.name,
            record_id,
        })
    }
}
