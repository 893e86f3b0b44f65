//! Record references and the workspace path grammar.
//!
//! A synced file lives at one of two shapes below the workspace root:
//!
//! ```text
//! instance/scope/table/name.field.ext     (flat tables)
//! instance/scope/table/name/field.ext     (folder-record tables)
//! ```
//!
//! Which shape applies is decided purely by the table name: tables listed in
//! [`FolderRecordTables`] get one directory per record. Anything that does
//! not parse is [`RecordPath::NotARecord`] and is ignored by the engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Length of a remote `sys_id`.
pub const RECORD_ID_LEN: usize = 32;

/// Name-mapping file kept in every table folder.
pub const MAP_FILE: &str = "_map.json";

/// Per-instance file holding scope name → scope id.
pub const SCOPES_FILE: &str = "scopes.json";

/// Per-instance file holding whatever the agent reported about the instance.
pub const SETTINGS_FILE: &str = "settings.json";

/// The scope that never needs a lookup.
pub const GLOBAL_SCOPE: &str = "global";

const DEFAULT_FOLDER_TABLES: [&str; 3] = ["sp_widget", "sp_header_footer", "sys_ui_page"];

/// True when `value` looks like a remote record identifier.
pub fn is_record_id(value: &str) -> bool {
    value.len() == RECORD_ID_LEN && value.chars().all(|c| c.is_ascii_alphanumeric())
}

/// True when `value` can stand as a table or field name in a record path.
pub fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('_')
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// File extension used on disk for a remote field type.
pub fn extension_for_field_type(field_type: &str) -> &'static str {
    match field_type {
        "script" | "script_plain" | "script_server" | "script_client" | "email_script"
        | "condition_string" | "expression" => "js",
        "html" | "html_script" | "html_template" | "template" | "translated_html" => "html",
        "xml" => "xml",
        "json" | "json_translations" => "json",
        "css" => "scss",
        "graphql_schema" => "graphql",
        "string" | "conditions" => "txt",
        _ => "js",
    }
}

/// Replace characters that cannot appear in a single path segment.
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Static set of tables whose records are sharded into their own directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderRecordTables(BTreeSet<String>);

impl FolderRecordTables {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tables.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, table: &str) -> bool {
        self.0.contains(table)
    }
}

impl Default for FolderRecordTables {
    fn default() -> Self {
        Self::new(DEFAULT_FOLDER_TABLES)
    }
}

/// One `{instance, scope, table}` folder. Each has its own name mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey {
    pub instance: String,
    pub scope: String,
    pub table: String,
}

impl TableKey {
    pub fn new(
        instance: impl Into<String>,
        scope: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            instance: instance.into(),
            scope: scope.into(),
            table: table.into(),
        }
    }

    /// Workspace-relative table directory.
    pub fn dir(&self) -> String {
        format!("{}/{}/{}", self.instance, self.scope, self.table)
    }

    /// Workspace-relative path of this table's `_map.json`.
    pub fn map_path(&self) -> String {
        format!("{}/{}", self.dir(), MAP_FILE)
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.instance, self.scope, self.table)
    }
}

/// The components shared by both path shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathParts {
    pub table: TableKey,
    pub name: String,
    pub field: String,
    pub extension: String,
}

/// Result of parsing a workspace-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPath {
    /// `instance/scope/table/name.field.ext`
    Flat(PathParts),
    /// `instance/scope/table/name/field.ext`
    Folder(PathParts),
    NotARecord,
}

impl RecordPath {
    pub fn parse(path: &str, folder_tables: &FolderRecordTables) -> Self {
        let normalized = path.replace('\\', "/");
        let segments: Vec<&str> = normalized.trim_matches('/').split('/').collect();

        if segments
            .iter()
            .any(|s| s.is_empty() || s.starts_with('.'))
        {
            return RecordPath::NotARecord;
        }

        match segments.as_slice() {
            [instance, scope, table, leaf] if !folder_tables.contains(table) => {
                if leaf.starts_with('_') {
                    return RecordPath::NotARecord;
                }
                let mut parts = leaf.rsplitn(3, '.');
                let (Some(extension), Some(field), Some(name)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return RecordPath::NotARecord;
                };
                if name.is_empty() || field.is_empty() || extension.is_empty() {
                    return RecordPath::NotARecord;
                }
                RecordPath::Flat(PathParts {
                    table: TableKey::new(*instance, *scope, *table),
                    name: name.to_string(),
                    field: field.to_string(),
                    extension: extension.to_string(),
                })
            }
            [instance, scope, table, name, leaf] if folder_tables.contains(table) => {
                if leaf.starts_with('_') {
                    return RecordPath::NotARecord;
                }
                match leaf.split('.').collect::<Vec<_>>().as_slice() {
                    [field, extension] if !field.is_empty() && !extension.is_empty() => {
                        RecordPath::Folder(PathParts {
                            table: TableKey::new(*instance, *scope, *table),
                            name: name.to_string(),
                            field: field.to_string(),
                            extension: extension.to_string(),
                        })
                    }
                    _ => RecordPath::NotARecord,
                }
            }
            _ => RecordPath::NotARecord,
        }
    }

    pub fn parts(&self) -> Option<&PathParts> {
        match self {
            RecordPath::Flat(parts) | RecordPath::Folder(parts) => Some(parts),
            RecordPath::NotARecord => None,
        }
    }

    pub fn into_parts(self) -> Option<(PathParts, bool)> {
        match self {
            RecordPath::Flat(parts) => Some((parts, false)),
            RecordPath::Folder(parts) => Some((parts, true)),
            RecordPath::NotARecord => None,
        }
    }
}

/// Identity tuple locating one field of one remote record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordReference {
    pub table: TableKey,
    /// `None` until the name mapping knows this record.
    pub record_id: Option<String>,
    pub field_name: String,
    pub name: String,
    pub extension: String,
    pub folder: bool,
}

impl RecordReference {
    pub fn instance(&self) -> &str {
        &self.table.instance
    }

    pub fn scope(&self) -> &str {
        &self.table.scope
    }

    pub fn table_name(&self) -> &str {
        &self.table.table
    }

    /// Workspace-relative path this reference is stored at.
    pub fn canonical_path(&self) -> String {
        if self.folder {
            format!(
                "{}/{}/{}.{}",
                self.table.dir(),
                self.name,
                self.field_name,
                self.extension
            )
        } else {
            format!(
                "{}/{}.{}.{}",
                self.table.dir(),
                self.name,
                self.field_name,
                self.extension
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(path: &str) -> RecordPath {
        RecordPath::parse(path, &FolderRecordTables::default())
    }

    #[test]
    fn test_flat_path() {
        let parsed = parse("acme/global/sys_script_include/Util.script.js");
        let parts = match parsed {
            RecordPath::Flat(parts) => parts,
            other => panic!("expected flat path, got {:?}", other),
        };
        assert_eq!(parts.table, TableKey::new("acme", "global", "sys_script_include"));
        assert_eq!(parts.name, "Util");
        assert_eq!(parts.field, "script");
        assert_eq!(parts.extension, "js");
    }

    #[test]
    fn test_flat_name_may_contain_dots() {
        let parsed = parse("acme/x_app/sys_script/My.Helper.v2.script.js");
        assert_eq!(parsed.parts().unwrap().name, "My.Helper.v2");
    }

    #[test]
    fn test_folder_path() {
        let parsed = parse("acme/global/sp_widget/Cart/client_script.js");
        let parts = match parsed {
            RecordPath::Folder(parts) => parts,
            other => panic!("expected folder path, got {:?}", other),
        };
        assert_eq!(parts.name, "Cart");
        assert_eq!(parts.field, "client_script");
        assert_eq!(parts.extension, "js");
    }

    #[test]
    fn test_shape_is_decided_by_table_name() {
        // A flat-shaped file inside a folder-record table is not a record.
        assert_eq!(parse("acme/global/sp_widget/Cart.script.js"), RecordPath::NotARecord);
        // And a folder-shaped file inside a flat table is not either.
        assert_eq!(
            parse("acme/global/sys_script/Thing/script.js"),
            RecordPath::NotARecord
        );
    }

    #[test]
    fn test_not_a_record() {
        for path in [
            "",
            "acme",
            "acme/settings.json",
            "acme/global/sys_script/_map.json",
            "acme/global/sys_script/readme",
            "acme/global/sys_script/name.js",
            ".scriptsync/requests/a.json",
            "acme/global/sys_script/.hidden.script.js",
            "acme//sys_script/a.script.js",
            "acme/global/sp_widget/Cart/a.b.js",
        ] {
            assert_eq!(parse(path), RecordPath::NotARecord, "path {:?}", path);
        }
    }

    #[test]
    fn test_canonical_path_inverts_parse() {
        for path in [
            "acme/global/sys_script_include/Util.script.js",
            "acme/global/sp_widget/Cart/css.scss",
        ] {
            let (parts, folder) = parse(path).into_parts().unwrap();
            let reference = RecordReference {
                table: parts.table,
                record_id: None,
                field_name: parts.field,
                name: parts.name,
                extension: parts.extension,
                folder,
            };
            assert_eq!(reference.canonical_path(), path);
        }
    }

    #[test]
    fn test_extension_for_field_type() {
        assert_eq!(extension_for_field_type("script_server"), "js");
        assert_eq!(extension_for_field_type("css"), "scss");
        assert_eq!(extension_for_field_type("html_template"), "html");
        assert_eq!(extension_for_field_type("string"), "txt");
        assert_eq!(extension_for_field_type("something_new"), "js");
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name(" a/b:c "), "a_b_c");
    }

    #[test]
    fn test_is_record_id() {
        assert!(is_record_id("0123456789abcdef0123456789abcdef"));
        assert!(!is_record_id("short"));
        assert!(!is_record_id("0123456789abcdef0123456789abcde!"));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("sys_script_include"));
        assert!(is_identifier("client_script"));
        for value in ["", "a.b", "a/b", "..", "_map", "x y"] {
            assert!(!is_identifier(value), "{:?}", value);
        }
    }
}
