use crate::associations::{Association, AssociationTable};
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    thread,
};

pub const FAILED_LOOKUPS_FILE: &str = "failed_esi_requests.json";
pub const NAME_CACHE_FILE: &str = "character_cache.json";
pub const ASSOCIATIONS_FILE: &str = "associations.json";
pub const SELECTIONS_FILE: &str = "userSelections.json";

/// Resolved character names plus the file paths whose lookup failed for good.
#[derive(Debug, Default)]
pub struct CacheStore {
    data_dir: PathBuf,
    names: BTreeMap<String, String>,
    failed: BTreeMap<String, bool>,
}

impl CacheStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            names: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    pub fn is_failed(&self, path: &Path) -> bool {
        self.failed
            .get(path_key(path).as_str())
            .copied()
            .unwrap_or(false)
    }

    pub fn cached_name(&self, character_id: &str) -> Option<&str> {
        self.names.get(character_id).map(String::as_str)
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Updates memory first, so a failed flush still serves the name this run.
    pub fn record_name(&mut self, character_id: &str, name: &str) -> Result<()> {
        self.names.insert(character_id.to_string(), name.to_string());
        write_json(&self.data_dir.join(NAME_CACHE_FILE), &self.names)
            .context("save character name cache")
    }

    pub fn record_failure(&mut self, path: &Path) -> Result<()> {
        self.failed.insert(path_key(path), true);
        write_json(&self.data_dir.join(FAILED_LOOKUPS_FILE), &self.failed)
            .context("save failed lookup cache")
    }
}

/// Everything read from the data dir at startup.
#[derive(Debug)]
pub struct LoadedState {
    pub cache: CacheStore,
    pub associations: AssociationTable,
    /// Fallbacks taken while loading, for the application log.
    pub notes: Vec<String>,
}

/// Loads the three state files concurrently. Each one falls back to its
/// empty value on its own when missing or malformed.
pub fn load_state(data_dir: &Path) -> LoadedState {
    let failed_path = data_dir.join(FAILED_LOOKUPS_FILE);
    let names_path = data_dir.join(NAME_CACHE_FILE);
    let associations_path = data_dir.join(ASSOCIATIONS_FILE);

    let (failed, names, associations) = thread::scope(|scope| {
        let failed = scope.spawn(|| read_json::<BTreeMap<String, bool>>(&failed_path));
        let names = scope.spawn(|| read_json::<BTreeMap<String, String>>(&names_path));
        let associations = scope.spawn(|| read_json::<Value>(&associations_path));
        (
            join_load(failed),
            join_load(names),
            join_load(associations),
        )
    });

    let mut notes = Vec::new();
    let failed = settle(failed, FAILED_LOOKUPS_FILE, &mut notes);
    let names = settle(names, NAME_CACHE_FILE, &mut notes);
    let raw_associations = settle(associations, ASSOCIATIONS_FILE, &mut notes);

    let mut reset_associations = false;
    let entries = match raw_associations {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match serde_json::from_value::<Association>(item) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    notes.push(format!(
                        "{ASSOCIATIONS_FILE}: skipping malformed entry {index} ({err})"
                    ));
                    None
                }
            })
            .collect(),
        Some(_) => {
            notes.push(format!(
                "{ASSOCIATIONS_FILE} is not an array; resetting to empty list"
            ));
            reset_associations = true;
            Vec::new()
        }
    };

    let associations = AssociationTable::from_entries(associations_path, entries);
    if reset_associations {
        if let Err(err) = associations.save() {
            notes.push(format!("Associations reset failed: {err:#}"));
        }
    }

    let mut cache = CacheStore::new(data_dir);
    cache.names = names.unwrap_or_default();
    cache.failed = failed.unwrap_or_default();

    LoadedState {
        cache,
        associations,
        notes,
    }
}

pub fn load_selections(data_dir: &Path) -> Value {
    match read_json::<Value>(&data_dir.join(SELECTIONS_FILE)) {
        Ok(Some(value @ Value::Object(_))) => value,
        _ => Value::Object(Default::default()),
    }
}

pub fn save_selections(data_dir: &Path, selections: &Value) -> Result<()> {
    write_json(&data_dir.join(SELECTIONS_FILE), selections).context("save user selections")
}

/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", path.display()));
        }
    };
    let value = serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

/// Pretty JSON through a temp file and rename.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().context("state file parent")?;
    fs::create_dir_all(parent).context("create data dir")?;
    let raw = serde_json::to_string_pretty(value).context("serialize state")?;
    let mut temp_name = path.file_name().context("state file name")?.to_os_string();
    temp_name.push(".tmp");
    let temp = parent.join(temp_name);
    fs::write(&temp, raw).with_context(|| format!("write {}", temp.display()))?;
    fs::rename(&temp, path).with_context(|| format!("finalize {}", path.display()))?;
    Ok(())
}

pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn join_load<T>(handle: thread::ScopedJoinHandle<'_, Result<Option<T>>>) -> Result<Option<T>> {
    handle
        .join()
        .unwrap_or_else(|_| Err(anyhow::anyhow!("state loader thread panicked")))
}

fn settle<T>(loaded: Result<Option<T>>, label: &str, notes: &mut Vec<String>) -> Option<T> {
    match loaded {
        Ok(value) => value,
        Err(err) => {
            notes.push(format!("{label} unreadable ({err:#}); using empty value"));
            None
        }
    }
}
