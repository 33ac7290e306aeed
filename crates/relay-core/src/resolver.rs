//! External-to-internal repository name resolution.

use std::path::Path;

use relay_state::MappingTable;

use crate::error::{Result, TransferError};

/// Resolves external repository names against a mapping table loaded once
/// per batch. Lookups are exact and case-sensitive.
#[derive(Debug, Clone)]
pub struct NameResolver {
    table: MappingTable,
    namespace: Option<String>,
}

impl NameResolver {
    pub fn new(table: MappingTable) -> Self {
        Self {
            table,
            namespace: None,
        }
    }

    /// Namespace prefixed to internal names that carry none.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace
            .map(|ns| ns.trim_matches('/').to_string())
            .filter(|ns| !ns.is_empty());
        self
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    /// Internal name mapped to `external`.
    pub fn resolve(&self, external: &str) -> Result<String> {
        self.table
            .get(external)
            .map(|entry| entry.internal_name.clone())
            .ok_or_else(|| TransferError::Unmapped(external.to_string()))
    }

    /// Full destination path (`namespace/name`) for `external`.
    pub fn target_path(&self, external: &str) -> Result<String> {
        let internal = self.resolve(external)?;
        qualify(&internal, self.namespace.as_deref())
    }
}

/// Prefix `name` with `namespace` unless it already has one.
pub fn qualify(name: &str, namespace: Option<&str>) -> Result<String> {
    let name = name.trim_matches('/');
    if name.contains('/') {
        return Ok(name.to_string());
    }
    match namespace {
        Some(ns) if !ns.is_empty() => Ok(format!("{}/{name}", ns.trim_matches('/'))),
        _ => Err(TransferError::InvalidConfig(format!(
            "target '{name}' has no namespace and none is configured"
        ))),
    }
}

/// Submodule path -> destination project path overrides.
#[derive(Debug, Clone, Default)]
pub struct SubmoduleMap {
    table: Option<MappingTable>,
}

impl SubmoduleMap {
    /// Load a mapping file keyed by submodule path. Accepts the same shapes
    /// as profile mapping files.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            table: Some(MappingTable::load_file(path)?),
        })
    }

    pub fn from_table(table: MappingTable) -> Self {
        Self { table: Some(table) }
    }

    pub fn get(&self, submodule_path: &str) -> Option<&str> {
        self.table
            .as_ref()
            .and_then(|t| t.get(submodule_path))
            .map(|e| e.internal_name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_state::MappingEntry;

    fn resolver() -> NameResolver {
        let table =
            MappingTable::from_json_slice("default", br#"{"alpha":{"internal_name":"sec/alpha"}}"#)
                .unwrap();
        NameResolver::new(table)
    }

    #[test]
    fn test_resolve_mapped_and_unmapped() {
        let r = resolver();
        assert_eq!(r.resolve("alpha").unwrap(), "sec/alpha");
        assert!(matches!(r.resolve("beta"), Err(TransferError::Unmapped(ref n)) if n == "beta"));
        assert!(r.resolve("Alpha").is_err());
    }

    #[test]
    fn test_unqualified_names_take_the_namespace() {
        let mut table = MappingTable::new("default");
        table.insert(MappingEntry::new("widget", "widget-int", None));
        let r = NameResolver::new(table).with_namespace(Some("/secure/team/".to_string()));
        assert_eq!(r.target_path("widget").unwrap(), "secure/team/widget-int");

        let bare = NameResolver::new(r.table().clone());
        assert!(matches!(
            bare.target_path("widget"),
            Err(TransferError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_submodule_map_lookup() {
        let table = MappingTable::from_json_slice("subs", br#"{"vendor/lib":"mirror/lib"}"#).unwrap();
        let map = SubmoduleMap::from_table(table);
        assert_eq!(map.get("vendor/lib"), Some("mirror/lib"));
        assert_eq!(map.get("docs"), None);
        assert_eq!(SubmoduleMap::default().get("vendor/lib"), None);
    }
}
