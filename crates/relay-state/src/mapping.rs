//! Name-mapping tables and their profile-scoped on-disk store.
//!
//! Directory layout managed by [`MappingStore`]:
//!
//! ```text
//! <config_dir>/
//! ├── profiles.json      registered profiles + the active one
//! ├── mappings/
//! │   ├── default.json
//! │   └── <profile>.json
//! └── backups/
//!     └── <profile>_<YYYYMMDDTHHMMSSZ>.json
//! ```
//!
//! Every add/remove copies the current mapping file into `backups/` before
//! the new table is written. Deleting a profile backs its table up too.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StateError;
use crate::persist::write_json_atomic;
use crate::storage_traits::StateResult;

/// Profile that always exists in a store.
pub const DEFAULT_PROFILE: &str = "default";

/// Profile registry file inside the config directory.
pub const PROFILES_FILE: &str = "profiles.json";

/// A named set of mappings, usually one per team or destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(name: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            description: description.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Contents of `profiles.json`.
#[derive(Debug, Serialize, Deserialize)]
struct ProfileRegistry {
    #[serde(default = "default_profile_name")]
    active_profile: String,
    #[serde(default)]
    profiles: BTreeMap<String, Profile>,
}

fn default_profile_name() -> String {
    DEFAULT_PROFILE.to_string()
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            DEFAULT_PROFILE.to_string(),
            Profile::new(DEFAULT_PROFILE, "Default profile"),
        );
        Self {
            active_profile: default_profile_name(),
            profiles,
        }
    }
}

/// A profile together with its mappings, as carried between config
/// directories by `export_profile` / `import_profile`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileExport {
    pub profile: Profile,
    #[serde(default)]
    pub mappings: BTreeMap<String, MappingEntry>,
}

/// One external → internal name translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Key of the entry; carried by the enclosing map on disk.
    #[serde(skip)]
    pub external_name: String,
    pub internal_name: String,
    #[serde(default = "Utc::now")]
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl MappingEntry {
    pub fn new(external: &str, internal: &str, notes: Option<String>) -> Self {
        Self {
            external_name: external.to_string(),
            internal_name: internal.to_string(),
            added_at: Utc::now(),
            notes: notes.filter(|n| !n.is_empty()),
        }
    }
}

#[derive(Serialize)]
struct MappingFileOut<'a> {
    profile: &'a str,
    mappings: &'a BTreeMap<String, MappingEntry>,
}

/// Keyed lookup table for one profile.
///
/// Keys are unique and compared exactly (case-sensitive).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingTable {
    profile: String,
    entries: BTreeMap<String, MappingEntry>,
}

impl MappingTable {
    pub fn new(profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
            entries: BTreeMap::new(),
        }
    }

    /// Parse a mapping document.
    ///
    /// Accepted shapes:
    /// - `{"mappings": {ext: {"internal_name": ..., "added_at": ..., "notes": ...}}}`
    /// - `{ext: {"internal_name": ...}}`
    /// - `{ext: "internal"}`
    pub fn from_json_slice(profile: &str, bytes: &[u8]) -> StateResult<Self> {
        let doc: Value = serde_json::from_slice(bytes)?;
        let object = match doc {
            Value::Object(mut obj) => match obj.remove("mappings") {
                Some(Value::Object(inner)) => inner,
                Some(other) => {
                    return Err(StateError::InvalidMapping {
                        external: "mappings".to_string(),
                        detail: format!("expected object, found {}", json_kind(&other)),
                    })
                }
                None => obj,
            },
            other => {
                return Err(StateError::InvalidMapping {
                    external: String::new(),
                    detail: format!("mapping document must be an object, found {}", json_kind(&other)),
                })
            }
        };

        let mut table = MappingTable::new(profile);
        for (external, value) in object {
            let entry = match value {
                Value::String(internal) => MappingEntry::new(&external, &internal, None),
                Value::Object(_) => {
                    let mut entry: MappingEntry = serde_json::from_value(value).map_err(|e| {
                        StateError::InvalidMapping {
                            external: external.clone(),
                            detail: e.to_string(),
                        }
                    })?;
                    entry.external_name = external.clone();
                    entry
                }
                other => {
                    return Err(StateError::InvalidMapping {
                        detail: format!("expected object or string, found {}", json_kind(&other)),
                        external,
                    })
                }
            };
            table.entries.insert(external, entry);
        }
        Ok(table)
    }

    /// Load a standalone mapping file (no profile directory involved).
    pub fn load_file(path: &Path) -> StateResult<Self> {
        let bytes = fs::read(path)?;
        let profile = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        Self::from_json_slice(&profile, &bytes)
    }

    /// Render in the canonical `{"profile", "mappings"}` shape.
    pub fn to_json(&self) -> StateResult<Value> {
        Ok(serde_json::to_value(MappingFileOut {
            profile: &self.profile,
            mappings: &self.entries,
        })?)
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn get(&self, external: &str) -> Option<&MappingEntry> {
        self.entries.get(external)
    }

    pub fn insert(&mut self, entry: MappingEntry) -> Option<MappingEntry> {
        self.entries.insert(entry.external_name.clone(), entry)
    }

    pub fn remove(&mut self, external: &str) -> Option<MappingEntry> {
        self.entries.remove(external)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Profile-scoped mapping files under a configuration directory.
///
/// Single-writer: concurrent edits from separate processes are not merged.
pub struct MappingStore {
    mappings_dir: PathBuf,
    backups_dir: PathBuf,
    profiles_path: PathBuf,
}

impl MappingStore {
    /// Open the store rooted at `config_dir`, creating the layout, the
    /// profile registry and the default profile's empty table if missing.
    pub fn open(config_dir: impl AsRef<Path>) -> StateResult<Self> {
        let root = config_dir.as_ref();
        let store = Self {
            mappings_dir: root.join("mappings"),
            backups_dir: root.join("backups"),
            profiles_path: root.join(PROFILES_FILE),
        };
        fs::create_dir_all(&store.mappings_dir)?;
        fs::create_dir_all(&store.backups_dir)?;

        let default_path = store.mapping_path(DEFAULT_PROFILE)?;
        if !default_path.exists() {
            write_json_atomic(&default_path, &MappingTable::new(DEFAULT_PROFILE).to_json()?)?;
        }
        if !store.profiles_path.exists() {
            write_json_atomic(&store.profiles_path, &ProfileRegistry::default())?;
        }
        Ok(store)
    }

    /// Path of a profile's mapping file.
    pub fn mapping_path(&self, profile: &str) -> StateResult<PathBuf> {
        validate_profile_name(profile)?;
        Ok(self.mappings_dir.join(format!("{profile}.json")))
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Load a profile's table; a missing file is an empty table.
    pub fn load(&self, profile: &str) -> StateResult<MappingTable> {
        let path = self.mapping_path(profile)?;
        match fs::read(&path) {
            Ok(bytes) => MappingTable::from_json_slice(profile, &bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MappingTable::new(profile)),
            Err(e) => Err(e.into()),
        }
    }

    /// Add (or replace) a mapping, backing up the prior table first.
    pub fn add_mapping(
        &self,
        profile: &str,
        external: &str,
        internal: &str,
        notes: Option<String>,
    ) -> StateResult<MappingEntry> {
        if external.is_empty() || internal.is_empty() {
            return Err(StateError::InvalidMapping {
                external: external.to_string(),
                detail: "external and internal names must be non-empty".to_string(),
            });
        }
        let path = self.mapping_path(profile)?;
        self.backup(&path)?;

        let mut table = self.load(profile)?;
        let entry = MappingEntry::new(external, internal, notes);
        table.insert(entry.clone());
        write_json_atomic(&path, &table.to_json()?)?;
        self.register(profile)?;
        info!(profile, external, internal, "mapping added");
        Ok(entry)
    }

    /// Remove a mapping. Returns `false` if it was not present.
    pub fn remove_mapping(&self, profile: &str, external: &str) -> StateResult<bool> {
        let path = self.mapping_path(profile)?;
        self.backup(&path)?;

        let mut table = self.load(profile)?;
        if table.remove(external).is_none() {
            return Ok(false);
        }
        write_json_atomic(&path, &table.to_json()?)?;
        info!(profile, external, "mapping removed");
        Ok(true)
    }

    /// Names of all registered profiles and all profiles with a mapping
    /// file, sorted.
    pub fn list_profiles(&self) -> StateResult<Vec<String>> {
        let mut profiles: BTreeSet<String> = self.read_registry()?.profiles.into_keys().collect();
        for entry in fs::read_dir(&self.mappings_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    profiles.insert(stem.to_string_lossy().into_owned());
                }
            }
        }
        Ok(profiles.into_iter().collect())
    }

    // -----------------------------------------------------------------------
    // Profiles
    // -----------------------------------------------------------------------

    /// Registered profiles, sorted by name.
    pub fn profiles(&self) -> StateResult<Vec<Profile>> {
        Ok(self.read_registry()?.profiles.into_values().collect())
    }

    /// A registered profile. A profile that only has a mapping file (written
    /// by hand or by an older release) is reported with an empty description.
    pub fn profile(&self, name: &str) -> StateResult<Option<Profile>> {
        let path = self.mapping_path(name)?;
        if let Some(profile) = self.read_registry()?.profiles.remove(name) {
            return Ok(Some(profile));
        }
        Ok(path.exists().then(|| Profile::new(name, "")))
    }

    /// Register a new profile with an empty mapping table.
    pub fn create_profile(&self, name: &str, description: &str) -> StateResult<Profile> {
        let path = self.mapping_path(name)?;
        let mut registry = self.read_registry()?;
        if registry.profiles.contains_key(name) || path.exists() {
            return Err(StateError::ProfileExists(name.to_string()));
        }
        write_json_atomic(&path, &MappingTable::new(name).to_json()?)?;
        let profile = Profile::new(name, description);
        registry.profiles.insert(name.to_string(), profile.clone());
        self.write_registry(&registry)?;
        info!(profile = name, "profile created");
        Ok(profile)
    }

    /// Replace a profile's description.
    pub fn update_profile(&self, name: &str, description: &str) -> StateResult<Profile> {
        let mut registry = self.read_registry()?;
        let mut profile = match registry.profiles.remove(name) {
            Some(profile) => profile,
            None => self
                .profile(name)?
                .ok_or_else(|| StateError::ProfileNotFound(name.to_string()))?,
        };
        profile.description = description.to_string();
        profile.updated_at = Utc::now();
        registry.profiles.insert(name.to_string(), profile.clone());
        self.write_registry(&registry)?;
        Ok(profile)
    }

    /// Delete a profile and its mapping table (backed up first).
    ///
    /// Returns `false` if no such profile exists. If it was active, the
    /// default profile becomes active.
    pub fn delete_profile(&self, name: &str) -> StateResult<bool> {
        if name == DEFAULT_PROFILE {
            return Err(StateError::DefaultProfile);
        }
        let path = self.mapping_path(name)?;
        let mut registry = self.read_registry()?;
        let registered = registry.profiles.remove(name).is_some();
        if !registered && !path.exists() {
            return Ok(false);
        }

        if self.backup(&path)?.is_some() {
            fs::remove_file(&path)?;
        }
        if registry.active_profile == name {
            registry.active_profile = default_profile_name();
        }
        self.write_registry(&registry)?;
        info!(profile = name, "profile deleted");
        Ok(true)
    }

    /// Profile used when a command names none.
    pub fn active_profile(&self) -> StateResult<String> {
        let active = self.read_registry()?.active_profile;
        match self.profile(&active) {
            Ok(Some(_)) => Ok(active),
            _ => Ok(default_profile_name()),
        }
    }

    pub fn set_active_profile(&self, name: &str) -> StateResult<()> {
        if self.profile(name)?.is_none() {
            return Err(StateError::ProfileNotFound(name.to_string()));
        }
        let mut registry = self.read_registry()?;
        registry.active_profile = name.to_string();
        self.write_registry(&registry)
    }

    /// A profile and its full mapping table.
    pub fn export_profile(&self, name: &str) -> StateResult<ProfileExport> {
        let profile = self
            .profile(name)?
            .ok_or_else(|| StateError::ProfileNotFound(name.to_string()))?;
        let table = self.load(name)?;
        Ok(ProfileExport {
            profile,
            mappings: table.entries,
        })
    }

    /// Register an exported profile with its mappings. The profile must not
    /// exist yet; every mapping needs a non-empty internal name.
    pub fn import_profile(&self, export: ProfileExport) -> StateResult<Profile> {
        let name = export.profile.name.clone();
        let path = self.mapping_path(&name)?;
        let mut registry = self.read_registry()?;
        if registry.profiles.contains_key(&name) || path.exists() {
            return Err(StateError::ProfileExists(name));
        }

        let mut table = MappingTable::new(&name);
        for (external, mut entry) in export.mappings {
            if external.is_empty() || entry.internal_name.is_empty() {
                return Err(StateError::InvalidMapping {
                    external,
                    detail: "external and internal names must be non-empty".to_string(),
                });
            }
            entry.external_name = external;
            table.insert(entry);
        }
        write_json_atomic(&path, &table.to_json()?)?;

        let mut profile = Profile::new(&name, &export.profile.description);
        profile.created_at = export.profile.created_at;
        registry.profiles.insert(name.clone(), profile.clone());
        self.write_registry(&registry)?;
        info!(profile = %name, mappings = table.len(), "profile imported");
        Ok(profile)
    }

    fn read_registry(&self) -> StateResult<ProfileRegistry> {
        match fs::read(&self.profiles_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
                path: self.profiles_path.clone(),
                detail: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProfileRegistry::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_registry(&self, registry: &ProfileRegistry) -> StateResult<()> {
        write_json_atomic(&self.profiles_path, registry)
    }

    /// Add `name` to the registry if a mapping edit created it implicitly.
    fn register(&self, name: &str) -> StateResult<()> {
        let mut registry = self.read_registry()?;
        if registry.profiles.contains_key(name) {
            return Ok(());
        }
        registry
            .profiles
            .insert(name.to_string(), Profile::new(name, ""));
        self.write_registry(&registry)
    }

    /// Check a profile's mapping file, returning human-readable problems.
    pub fn validate(&self, profile: &str) -> StateResult<Vec<String>> {
        let path = self.mapping_path(profile)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(vec![format!("mapping file not found: {}", path.display())])
            }
            Err(e) => return Err(e.into()),
        };

        let doc: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => return Ok(vec![format!("invalid JSON syntax: {e}")]),
        };
        let Some(mappings) = doc.get("mappings") else {
            return Ok(vec!["missing 'mappings' key".to_string()]);
        };
        let Some(mappings) = mappings.as_object() else {
            return Ok(vec!["'mappings' must be an object".to_string()]);
        };

        let mut problems = Vec::new();
        for (external, entry) in mappings {
            match entry.as_object() {
                None => problems.push(format!("invalid entry for '{external}': expected object")),
                Some(obj) => match obj.get("internal_name") {
                    Some(Value::String(s)) if !s.is_empty() => {}
                    Some(_) => problems.push(format!("empty or non-string 'internal_name' for '{external}'")),
                    None => problems.push(format!("missing 'internal_name' for '{external}'")),
                },
            }
        }
        Ok(problems)
    }

    /// Copy `path` into the backups directory. No-op if it does not exist.
    fn backup(&self, path: &Path) -> StateResult<Option<PathBuf>> {
        if !path.exists() {
            return Ok(None);
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mappings".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");

        let mut target = self.backups_dir.join(format!("{stem}_{stamp}.json"));
        let mut n = 1;
        while target.exists() {
            target = self.backups_dir.join(format!("{stem}_{stamp}-{n}.json"));
            n += 1;
        }
        fs::copy(path, &target)?;
        debug!(backup = %target.display(), "mapping table backed up");
        Ok(Some(target))
    }
}

fn validate_profile_name(profile: &str) -> StateResult<()> {
    let ok = !profile.is_empty()
        && !profile.starts_with('.')
        && profile
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StateError::InvalidProfile(profile.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, MappingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MappingStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn parses_flat_object_entries() {
        let table = MappingTable::from_json_slice(
            "default",
            br#"{"alpha":{"internal_name":"sec/alpha"}}"#,
        )
        .unwrap();
        assert_eq!(table.get("alpha").unwrap().internal_name, "sec/alpha");
        assert_eq!(table.get("alpha").unwrap().external_name, "alpha");
        assert!(table.get("beta").is_none());
    }

    #[test]
    fn parses_wrapped_and_legacy_string_entries() {
        let wrapped = MappingTable::from_json_slice(
            "team",
            br#"{"profile":"team","mappings":{"a":{"internal_name":"x/a","notes":"n"}}}"#,
        )
        .unwrap();
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped.get("a").unwrap().notes.as_deref(), Some("n"));

        let legacy = MappingTable::from_json_slice("team", br#"{"a":"x/a","b":"x/b"}"#).unwrap();
        assert_eq!(legacy.get("b").unwrap().internal_name, "x/b");
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let table =
            MappingTable::from_json_slice("default", br#"{"Alpha":"sec/alpha"}"#).unwrap();
        assert!(table.get("Alpha").is_some());
        assert!(table.get("alpha").is_none());
    }

    #[test]
    fn rejects_entry_without_internal_name() {
        let err = MappingTable::from_json_slice("default", br#"{"a":{"notes":"x"}}"#).unwrap_err();
        assert!(matches!(err, StateError::InvalidMapping { ref external, .. } if external == "a"));
    }

    #[test]
    fn open_creates_default_profile() {
        let (dir, store) = make_store();
        assert!(dir.path().join("mappings/default.json").exists());
        assert_eq!(store.list_profiles().unwrap(), vec!["default".to_string()]);
        assert!(store.load(DEFAULT_PROFILE).unwrap().is_empty());
    }

    #[test]
    fn add_then_remove_writes_backups() {
        let (_dir, store) = make_store();

        store
            .add_mapping("default", "alpha", "sec/alpha", Some("first".to_string()))
            .unwrap();
        assert_eq!(
            store.load("default").unwrap().get("alpha").unwrap().internal_name,
            "sec/alpha"
        );

        assert!(store.remove_mapping("default", "alpha").unwrap());
        assert!(!store.remove_mapping("default", "alpha").unwrap());
        assert!(store.load("default").unwrap().is_empty());

        // One backup per edit (including the no-op remove).
        let backups = std::fs::read_dir(store.backups_dir()).unwrap().count();
        assert_eq!(backups, 3);
    }

    #[test]
    fn backup_holds_prior_state() {
        let (_dir, store) = make_store();
        store.add_mapping("default", "a", "x/a", None).unwrap();
        store.add_mapping("default", "b", "x/b", None).unwrap();

        let mut newest_backup: Option<MappingTable> = None;
        for entry in std::fs::read_dir(store.backups_dir()).unwrap() {
            let t = MappingTable::load_file(&entry.unwrap().path()).unwrap();
            if t.len() == 1 {
                newest_backup = Some(t);
            }
        }
        let prior = newest_backup.expect("backup with one entry");
        assert!(prior.get("a").is_some());
        assert!(prior.get("b").is_none());
    }

    #[test]
    fn rejects_path_like_profile_names() {
        let (_dir, store) = make_store();
        assert!(matches!(
            store.load("../escape"),
            Err(StateError::InvalidProfile(_))
        ));
        assert!(matches!(store.load(""), Err(StateError::InvalidProfile(_))));
    }

    #[test]
    fn validate_reports_missing_internal_name() {
        let (dir, store) = make_store();
        std::fs::write(
            dir.path().join("mappings/team.json"),
            br#"{"mappings":{"a":{"notes":"x"},"b":"x/b","c":{"internal_name":"x/c"}}}"#,
        )
        .unwrap();

        let problems = store.validate("team").unwrap();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("'a'")));
        assert!(problems.iter().any(|p| p.contains("'b'")));
        assert!(store.validate("default").unwrap().is_empty());
    }

    #[test]
    fn create_update_delete_profile() {
        let (dir, store) = make_store();
        assert!(dir.path().join(PROFILES_FILE).exists());

        let created = store.create_profile("team-a", "Team A mirrors").unwrap();
        assert_eq!(created.description, "Team A mirrors");
        assert!(store.load("team-a").unwrap().is_empty());
        assert!(matches!(
            store.create_profile("team-a", ""),
            Err(StateError::ProfileExists(_))
        ));
        assert_eq!(store.list_profiles().unwrap(), vec!["default", "team-a"]);

        let updated = store.update_profile("team-a", "renamed").unwrap();
        assert_eq!(updated.description, "renamed");
        assert_eq!(updated.created_at, created.created_at);
        assert!(matches!(
            store.update_profile("ghost", "x"),
            Err(StateError::ProfileNotFound(_))
        ));

        store.add_mapping("team-a", "alpha", "sec/alpha", None).unwrap();
        store.set_active_profile("team-a").unwrap();
        assert_eq!(store.active_profile().unwrap(), "team-a");

        assert!(store.delete_profile("team-a").unwrap());
        assert!(!store.delete_profile("team-a").unwrap());
        assert!(!dir.path().join("mappings/team-a.json").exists());
        assert_eq!(store.active_profile().unwrap(), DEFAULT_PROFILE);
        assert!(matches!(
            store.delete_profile(DEFAULT_PROFILE),
            Err(StateError::DefaultProfile)
        ));
    }

    #[test]
    fn mapping_edit_registers_profile() {
        let (_dir, store) = make_store();
        store.add_mapping("ops", "tool", "ops/tool", None).unwrap();
        let names: Vec<String> = store.profiles().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["default", "ops"]);
    }

    #[test]
    fn export_then_import_into_another_store() {
        let (_src_dir, src) = make_store();
        src.create_profile("team-a", "Team A").unwrap();
        src.add_mapping("team-a", "alpha", "sec/alpha", Some("from upstream".to_string()))
            .unwrap();
        src.add_mapping("team-a", "beta", "sec/beta", None).unwrap();

        let exported = src.export_profile("team-a").unwrap();
        let bytes = serde_json::to_vec(&exported).unwrap();

        let (_dst_dir, dst) = make_store();
        let parsed: ProfileExport = serde_json::from_slice(&bytes).unwrap();
        let imported = dst.import_profile(parsed.clone()).unwrap();
        assert_eq!(imported.name, "team-a");
        assert_eq!(imported.description, "Team A");

        let table = dst.load("team-a").unwrap();
        assert_eq!(table.len(), 2);
        let alpha = table.get("alpha").unwrap();
        assert_eq!(alpha.external_name, "alpha");
        assert_eq!(alpha.internal_name, "sec/alpha");
        assert_eq!(alpha.notes.as_deref(), Some("from upstream"));

        assert!(matches!(
            dst.import_profile(parsed),
            Err(StateError::ProfileExists(_))
        ));
        assert!(matches!(
            src.export_profile("ghost"),
            Err(StateError::ProfileNotFound(_))
        ));
    }

    #[test]
    fn import_rejects_empty_internal_name() {
        let (_dir, store) = make_store();
        let export: ProfileExport = serde_json::from_value(serde_json::json!({
            "profile": {"name": "bad"},
            "mappings": {"alpha": {"internal_name": ""}}
        }))
        .unwrap();
        assert!(matches!(
            store.import_profile(export),
            Err(StateError::InvalidMapping { .. })
        ));
        assert!(store.profile("bad").unwrap().is_none());
    }

    #[test]
    fn canonical_json_roundtrips() {
        let mut table = MappingTable::new("team");
        table.insert(MappingEntry::new("ext", "int/ext", Some("note".to_string())));
        let bytes = serde_json::to_vec(&table.to_json().unwrap()).unwrap();
        let back = MappingTable::from_json_slice("team", &bytes).unwrap();
        assert_eq!(back, table);
    }
}
