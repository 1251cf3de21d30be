use serde::Serialize;
use std::{
    collections::HashMap,
    fs,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub const SETTINGS_PREFIX: &str = "settings_";
pub const ACCOUNT_PREFIX: &str = "core_user_";
pub const CHARACTER_PREFIX: &str = "core_char_";
pub const STATE_FILE_SUFFIX: &str = ".dat";
pub const RECENCY_THRESHOLD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingMode {
    /// Only `settings_*` directories, reported by their full name.
    Settings,
    /// Every directory, reported without the `settings_` prefix.
    Mappings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateFile {
    Account(String),
    Character(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountFile {
    pub profile: String,
    pub account_id: String,
    pub file_name: String,
    /// Unix milliseconds.
    pub modified_ms: i64,
}

impl AccountFile {
    /// Accounts have no remote identity; the id is the name.
    pub fn display_name(&self) -> &str {
        &self.account_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacterFile {
    pub profile: String,
    pub character_id: String,
    pub file_name: String,
    pub modified_ms: i64,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileDirectory {
    pub name: String,
    pub account_files: Vec<AccountFile>,
    pub character_files: Vec<CharacterFile>,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub profiles: Vec<ProfileDirectory>,
    pub warnings: Vec<String>,
}

/// Something discovered on disk that carries an id and a modification time.
pub trait Discovered {
    fn id(&self) -> &str;
    fn modified_ms(&self) -> i64;
}

impl Discovered for AccountFile {
    fn id(&self) -> &str {
        &self.account_id
    }

    fn modified_ms(&self) -> i64 {
        self.modified_ms
    }
}

impl Discovered for CharacterFile {
    fn id(&self) -> &str {
        &self.character_id
    }

    fn modified_ms(&self) -> i64 {
        self.modified_ms
    }
}

pub fn account_file_name(account_id: &str) -> String {
    format!("{ACCOUNT_PREFIX}{account_id}{STATE_FILE_SUFFIX}")
}

pub fn character_file_name(character_id: &str) -> String {
    format!("{CHARACTER_PREFIX}{character_id}{STATE_FILE_SUFFIX}")
}

/// Any `core_user_*.dat`, numeric or not. Sync targets use this looser match.
pub fn is_account_file(name: &str) -> bool {
    name.starts_with(ACCOUNT_PREFIX) && name.ends_with(STATE_FILE_SUFFIX)
}

pub fn is_character_file(name: &str) -> bool {
    name.starts_with(CHARACTER_PREFIX) && name.ends_with(STATE_FILE_SUFFIX)
}

/// Classifies a file name; ids must be a non-empty digit run.
pub fn parse_state_file(name: &str) -> Option<StateFile> {
    if let Some(id) = numeric_id(name, CHARACTER_PREFIX) {
        return Some(StateFile::Character(id.to_string()));
    }
    if let Some(id) = numeric_id(name, ACCOUNT_PREFIX) {
        return Some(StateFile::Account(id.to_string()));
    }
    None
}

fn numeric_id<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let id = name.strip_prefix(prefix)?.strip_suffix(STATE_FILE_SUFFIX)?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(id)
}

/// Walks the direct child directories of `root`. A bad entry only costs a
/// warning; the scan always returns whatever it could read.
pub fn scan<F>(root: &Path, mode: ListingMode, mut resolve_name: F) -> ScanReport
where
    F: FnMut(&str, &Path) -> Option<String>,
{
    let mut report = ScanReport::default();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            report.warnings.push(format!(
                "Error reading settings directory {}: {err}",
                root.display()
            ));
            return report;
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| mode == ListingMode::Mappings || name.starts_with(SETTINGS_PREFIX))
        .collect();
    names.sort();

    for name in names {
        let dir = root.join(&name);
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => continue,
            Err(err) => {
                report
                    .warnings
                    .push(format!("Error getting stats for subdirectory {}: {err}", dir.display()));
                continue;
            }
        }

        let label = match mode {
            ListingMode::Settings => name.clone(),
            ListingMode::Mappings => name
                .strip_prefix(SETTINGS_PREFIX)
                .unwrap_or(&name)
                .to_string(),
        };
        let profile = scan_profile(&dir, label, &mut resolve_name, &mut report.warnings);
        report.profiles.push(profile);
    }

    report
}

fn scan_profile<F>(
    dir: &Path,
    label: String,
    resolve_name: &mut F,
    warnings: &mut Vec<String>,
) -> ProfileDirectory
where
    F: FnMut(&str, &Path) -> Option<String>,
{
    let mut profile = ProfileDirectory {
        name: label,
        account_files: Vec::new(),
        character_files: Vec::new(),
    };

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warnings.push(format!("Error reading directory {}: {err}", dir.display()));
            return profile;
        }
    };
    let mut files: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    files.sort();

    for file_name in files {
        let Some(kind) = parse_state_file(&file_name) else {
            continue;
        };
        let full_path = dir.join(&file_name);
        let modified_ms = match fs::metadata(&full_path).and_then(|meta| meta.modified()) {
            Ok(time) => unix_millis(time),
            Err(err) => {
                warnings.push(format!(
                    "Error getting stats for file {}: {err}",
                    full_path.display()
                ));
                continue;
            }
        };

        match kind {
            StateFile::Character(character_id) => {
                let display_name = resolve_name(&character_id, &full_path)
                    .unwrap_or_else(|| format!("Unknown ({character_id})"));
                profile.character_files.push(CharacterFile {
                    profile: profile.name.clone(),
                    character_id,
                    file_name,
                    modified_ms,
                    display_name,
                });
            }
            StateFile::Account(account_id) => {
                profile.account_files.push(AccountFile {
                    profile: profile.name.clone(),
                    account_id,
                    file_name,
                    modified_ms,
                });
            }
        }
    }

    profile
}

/// One entry per id, keeping the strictly newer modification time. Order
/// follows the first appearance of each id.
pub fn latest_by_id<T: Discovered>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<T> = Vec::new();
    for item in items {
        match index.get(item.id()) {
            Some(&slot) => {
                if item.modified_ms() > out[slot].modified_ms() {
                    out[slot] = item;
                }
            }
            None => {
                index.insert(item.id().to_string(), out.len());
                out.push(item);
            }
        }
    }
    out
}

/// Sorts by modification time and starts a new group whenever the gap to
/// the previous entry exceeds `threshold`.
pub fn group_by_recency<T: Discovered>(mut items: Vec<T>, threshold: Duration) -> Vec<Vec<T>> {
    let threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
    items.sort_by_key(|item| item.modified_ms());

    let mut groups: Vec<Vec<T>> = Vec::new();
    let mut current: Vec<T> = Vec::new();
    for item in items {
        if let Some(last) = current.last() {
            if item.modified_ms().abs_diff(last.modified_ms()) > threshold_ms {
                groups.push(std::mem::take(&mut current));
            }
        }
        current.push(item);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

pub fn unix_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        Err(err) => -i64::try_from(err.duration().as_millis()).unwrap_or(i64::MAX),
    }
}
