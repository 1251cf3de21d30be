use crate::{
    associations::{Association, AssociationTable},
    backup::{self, BackupEntry},
    config::{self, AppConfig, SettingsRoot},
    error::{validate_id, OpResult},
    resolver::{EsiLookup, NameLookup, NameResolver},
    scanner::{self, AccountFile, CharacterFile, Discovered, ListingMode, ProfileDirectory},
    store::{self, CacheStore},
    sync::{self, SyncReport},
};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

const LOG_CAPACITY: usize = 500;
const LOG_FILE: &str = "profilesync.log";

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// How much of the log is echoed to stderr as it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

#[derive(Debug, Serialize)]
pub struct SettingsListing {
    pub settings_dir: Option<PathBuf>,
    pub is_default_dir: bool,
    pub profiles: Vec<ProfileDirectory>,
    pub associations: Vec<Association>,
}

#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub data_dir: PathBuf,
    pub settings_dir: Option<PathBuf>,
    pub is_default_dir: bool,
    pub default_dir: Option<PathBuf>,
    pub cached_names: usize,
    pub failed_lookups: usize,
    pub associations: usize,
}

/// Account/character overview across every profile, newest copy of each id.
#[derive(Debug, Serialize)]
pub struct MappingsView {
    pub accounts: Vec<AccountFile>,
    pub available_characters: Vec<CharacterFile>,
    pub associations: Vec<Association>,
    /// `profile/file` labels of files modified close together.
    pub recency_groups: Vec<Vec<String>>,
}

enum ListedFile {
    Account(AccountFile),
    Character(CharacterFile),
}

impl ListedFile {
    fn label(&self) -> String {
        let (profile, file_name) = match self {
            ListedFile::Account(file) => (&file.profile, &file.file_name),
            ListedFile::Character(file) => (&file.profile, &file.file_name),
        };
        format!("{profile}/{file_name}")
    }
}

impl Discovered for ListedFile {
    fn id(&self) -> &str {
        match self {
            ListedFile::Account(file) => file.id(),
            ListedFile::Character(file) => file.id(),
        }
    }

    fn modified_ms(&self) -> i64 {
        match self {
            ListedFile::Account(file) => file.modified_ms,
            ListedFile::Character(file) => file.modified_ms,
        }
    }
}

/// Application context: owns every piece of mutable state and funnels each
/// user operation into an [`OpResult`].
pub struct App {
    pub data_dir: PathBuf,
    pub config: AppConfig,
    settings_root: SettingsRoot,
    cache: CacheStore,
    associations: AssociationTable,
    resolver: NameResolver,
    logs: Vec<LogEntry>,
    log_path: PathBuf,
    verbosity: Verbosity,
}

impl App {
    pub fn initialize(verbosity: Verbosity) -> Result<Self> {
        let data_dir = config::ensure_data_dir()?;
        Self::with_lookup(data_dir, Box::new(EsiLookup::new()), verbosity)
    }

    pub fn with_lookup(
        data_dir: PathBuf,
        lookup: Box<dyn NameLookup>,
        verbosity: Verbosity,
    ) -> Result<Self> {
        fs::create_dir_all(&data_dir).context("create app data dir")?;
        let config = AppConfig::load(&data_dir);
        let settings_root = SettingsRoot::resolve(&config);
        let state = store::load_state(&data_dir);
        let log_path = data_dir.join(LOG_FILE);

        let mut app = Self {
            data_dir,
            config,
            settings_root,
            cache: state.cache,
            associations: state.associations,
            resolver: NameResolver::new(lookup),
            logs: Vec::new(),
            log_path,
            verbosity,
        };
        for note in state.notes {
            app.log_warn(note);
        }
        match &app.settings_root {
            SettingsRoot::Saved(path) => {
                let message = format!("Using saved directory: {}", path.display());
                app.log_info(message);
            }
            SettingsRoot::Default(path) => {
                let message = format!("Using default directory: {}", path.display());
                app.log_info(message);
            }
            SettingsRoot::Unset => {
                app.log_warn("No settings directory configured and no default found".to_string());
            }
        }
        Ok(app)
    }

    pub fn settings_dir(&self) -> Option<&Path> {
        self.settings_root.path()
    }

    pub fn is_default_dir(&self) -> bool {
        match &self.settings_root {
            SettingsRoot::Default(_) => true,
            SettingsRoot::Saved(path) => config::is_default_dir(path),
            SettingsRoot::Unset => false,
        }
    }

    /// Points this run at `path` without saving it.
    pub fn use_settings_dir(&mut self, path: PathBuf) {
        self.settings_root = SettingsRoot::Saved(path);
    }

    /// Log entries written during this run, oldest first.
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn associations(&self) -> &[Association] {
        self.associations.entries()
    }

    pub fn choose_settings_dir(&mut self, path: PathBuf) -> OpResult {
        if !path.is_dir() {
            return self.failure(format!("Directory does not exist: {}", path.display()));
        }
        self.config.settings_dir = Some(path.clone());
        if let Err(err) = self.config.save(&self.data_dir) {
            return self.failure(format!("Error saving settings directory: {err:#}"));
        }
        self.settings_root = SettingsRoot::Saved(path.clone());
        self.success(format!("Settings directory changed to: {}", path.display()))
    }

    pub fn reset_to_default_dir(&mut self) -> OpResult {
        let Some(default) = config::default_settings_dir() else {
            return self.failure("Could not determine the default directory".to_string());
        };
        if !default.is_dir() {
            return self.failure(format!(
                "Default directory does not exist: {}",
                default.display()
            ));
        }
        self.config.settings_dir = Some(default.clone());
        if let Err(err) = self.config.save(&self.data_dir) {
            return self.failure(format!("Error saving settings directory: {err:#}"));
        }
        self.settings_root = SettingsRoot::Default(default.clone());
        self.success(format!("Reset to default directory: {}", default.display()))
    }

    pub fn status(&self) -> StatusOutput {
        StatusOutput {
            data_dir: self.data_dir.clone(),
            settings_dir: self.settings_dir().map(Path::to_path_buf),
            is_default_dir: self.is_default_dir(),
            default_dir: config::default_settings_dir(),
            cached_names: self.cache.name_count(),
            failed_lookups: self.cache.failed_count(),
            associations: self.associations.entries().len(),
        }
    }

    /// `settings_*` profiles with resolved character names.
    pub fn load_settings(&mut self) -> SettingsListing {
        let profiles = self.scan(ListingMode::Settings);
        let failed = self.resolver.take_failed_requests();
        if failed > 0 {
            self.log_warn(format!(
                "Total failed HTTP requests (character names not found): {failed}"
            ));
        }
        SettingsListing {
            settings_dir: self.settings_dir().map(Path::to_path_buf),
            is_default_dir: self.is_default_dir(),
            profiles,
            associations: self.associations.entries().to_vec(),
        }
    }

    pub fn load_mappings(&mut self) -> MappingsView {
        let profiles = self.scan(ListingMode::Mappings);
        let accounts = scanner::latest_by_id(
            profiles
                .iter()
                .flat_map(|profile| profile.account_files.iter().cloned()),
        );
        let characters = scanner::latest_by_id(
            profiles
                .iter()
                .flat_map(|profile| profile.character_files.iter().cloned()),
        );
        let available_characters = self.associations.filter_available(characters);

        let listed: Vec<ListedFile> = accounts
            .iter()
            .cloned()
            .map(ListedFile::Account)
            .chain(available_characters.iter().cloned().map(ListedFile::Character))
            .collect();
        let recency_groups = scanner::group_by_recency(listed, scanner::RECENCY_THRESHOLD)
            .into_iter()
            .map(|group| group.iter().map(ListedFile::label).collect())
            .collect();

        MappingsView {
            accounts,
            available_characters,
            associations: self.associations.entries().to_vec(),
            recency_groups,
        }
    }

    pub fn associate(&mut self, account_id: &str, character_id: &str) -> OpResult {
        if let Err(err) = validate_id("account", account_id)
            .and_then(|_| validate_id("character", character_id))
        {
            return self.failure(err.to_string());
        }
        if let Err(err) = self.associations.check(account_id, character_id) {
            return self.failure(err.to_string());
        }
        let display_name = self
            .scan(ListingMode::Mappings)
            .iter()
            .flat_map(|profile| profile.character_files.iter())
            .find(|file| file.character_id == character_id)
            .map(|file| file.display_name.clone())
            .unwrap_or_else(|| "Unknown".to_string());

        match self
            .associations
            .associate(account_id, character_id, &display_name)
        {
            Ok(_) => self.success(format!(
                "Character ID {character_id} associated with User ID {account_id}."
            )),
            Err(err) => self.failure(format!("{err:#}")),
        }
    }

    pub fn unassociate(&mut self, account_id: &str, character_id: &str) -> OpResult {
        match self.associations.unassociate(account_id, character_id) {
            Ok(_) => self.success(format!(
                "Character ID {character_id} has been unassociated from User ID {account_id}."
            )),
            Err(err) => self.failure(format!("{err:#}")),
        }
    }

    pub fn sync_subdirectory(
        &mut self,
        sub_dir: &str,
        account_id: &str,
        character_id: &str,
    ) -> OpResult {
        let Some(root) = self.settings_dir().map(Path::to_path_buf) else {
            return self.failure("Settings directory is not set".to_string());
        };
        match sync::sync_local(&root, sub_dir, account_id, character_id) {
            Ok(report) => {
                self.log_report_warnings(&report);
                self.success(format!(
                    "Synchronization complete in \"{sub_dir}\", {} user files copied and {} character files copied.",
                    report.account_files, report.character_files
                ))
            }
            Err(err) => self.failure(format!("{err:#}")),
        }
    }

    pub fn sync_all_subdirectories(
        &mut self,
        sub_dir: &str,
        account_id: &str,
        character_id: &str,
    ) -> OpResult {
        let Some(root) = self.settings_dir().map(Path::to_path_buf) else {
            return self.failure("Settings directory is not set".to_string());
        };
        self.log_info(format!(
            "Syncing all subdirectories using files from subdirectory: {sub_dir}"
        ));
        match sync::sync_global(&root, sub_dir, account_id, character_id) {
            Ok(report) => {
                self.log_report_warnings(&report);
                self.success(format!(
                    "Sync completed for all subdirectories: {} user files copied and {} character files copied, based on user/char files from \"{sub_dir}\".",
                    report.account_files, report.character_files
                ))
            }
            Err(err) => self.failure(format!("{err:#}")),
        }
    }

    /// Backs up `target`, or the settings root when none is given.
    pub fn backup_directory(&mut self, target: Option<&Path>) -> OpResult {
        let target = match target.or_else(|| self.settings_dir()) {
            Some(path) => path.to_path_buf(),
            None => return self.failure("Backup failed: no directory to back up".to_string()),
        };
        match backup::create_backup(&target, &self.data_dir) {
            Ok(path) => self.success(format!(
                "Backup created successfully at: {}",
                path.display()
            )),
            Err(err) => self.failure(format!("Error creating backup: {err:#}")),
        }
    }

    pub fn delete_backups(&mut self) -> OpResult {
        let report = match backup::delete_backups(&self.data_dir) {
            Ok(report) => report,
            Err(err) => return self.failure(format!("Failed to delete backups: {err:#}")),
        };
        for name in &report.deleted {
            self.log_info(format!("Deleted backup file: {name}"));
        }
        if report.failures.is_empty() {
            return self.success(format!(
                "All backups deleted successfully ({} removed).",
                report.deleted.len()
            ));
        }
        self.failure(format!(
            "Deleted {} backup(s); {} could not be removed: {}",
            report.deleted.len(),
            report.failures.len(),
            report.failures.join("; ")
        ))
    }

    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        backup::list_backups(&self.data_dir)
    }

    pub fn load_selections(&self) -> Value {
        store::load_selections(&self.data_dir)
    }

    pub fn save_selections(&mut self, selections: &Value) -> OpResult {
        match store::save_selections(&self.data_dir, selections) {
            Ok(()) => self.success("Selections saved.".to_string()),
            Err(err) => self.failure(format!("Error saving user selections: {err:#}")),
        }
    }

    pub fn set_selection(&mut self, key: &str, value: Value) -> OpResult {
        let mut selections = self.load_selections();
        if let Value::Object(map) = &mut selections {
            map.insert(key.to_string(), value);
        }
        self.save_selections(&selections)
    }

    pub fn log_info(&mut self, message: String) {
        self.push_log(LogLevel::Info, message);
    }

    pub fn log_warn(&mut self, message: String) {
        self.push_log(LogLevel::Warn, message);
    }

    pub fn log_error(&mut self, message: String) {
        self.push_log(LogLevel::Error, message);
    }

    pub fn log_tail_text(&self, lines: usize) -> Result<String> {
        if lines == 0 {
            return Ok(String::new());
        }
        let raw = if self.log_path.exists() {
            fs::read_to_string(&self.log_path).context("read log file")?
        } else {
            String::new()
        };
        let entries: Vec<&str> = raw.lines().collect();
        let start = entries.len().saturating_sub(lines);
        Ok(entries[start..].join("\n"))
    }

    fn scan(&mut self, mode: ListingMode) -> Vec<ProfileDirectory> {
        let Some(root) = self.settings_dir().map(Path::to_path_buf) else {
            self.log_warn("Settings directory is not set".to_string());
            return Vec::new();
        };
        let cache = &mut self.cache;
        let resolver = &mut self.resolver;
        let report = scanner::scan(&root, mode, |character_id, path| {
            resolver.resolve(cache, character_id, path)
        });
        for warning in self.resolver.drain_warnings() {
            self.log_warn(warning);
        }
        for warning in report.warnings {
            self.log_error(warning);
        }
        report.profiles
    }

    fn log_report_warnings(&mut self, report: &SyncReport) {
        for warning in &report.warnings {
            self.log_warn(warning.clone());
        }
    }

    fn success(&mut self, message: String) -> OpResult {
        self.log_info(message.clone());
        OpResult::ok(message)
    }

    fn failure(&mut self, message: String) -> OpResult {
        self.log_error(message.clone());
        OpResult::fail(message)
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        let echo = match self.verbosity {
            Verbosity::Quiet => false,
            Verbosity::Normal => level >= LogLevel::Warn,
            Verbosity::Verbose => true,
        };
        if echo {
            eprintln!("[{}] {message}", log_level_label(level));
        }

        let _ = append_log_file(&self.log_path, level, &message);
        self.logs.push(LogEntry { level, message });
        if self.logs.len() > LOG_CAPACITY {
            let overflow = self.logs.len() - LOG_CAPACITY;
            self.logs.drain(0..overflow);
        }
    }
}

fn log_level_label(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "INFO",
        LogLevel::Warn => "WARN",
        LogLevel::Error => "ERROR",
    }
}

fn append_log_file(path: &Path, level: LogLevel, message: &str) -> std::io::Result<()> {
    let label = log_level_label(level);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "[{label}] {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::fake::FakeLookup;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        app: App,
        lookup: FakeLookup,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("eve");
        let data_dir = temp.path().join("appdata");
        let lookup = FakeLookup::with_names(&[("9001", "Alpha"), ("9002", "Bravo")]);
        let mut app =
            App::with_lookup(data_dir, Box::new(lookup.clone()), Verbosity::Quiet).unwrap();
        fs::create_dir_all(&root).unwrap();
        app.use_settings_dir(root.clone());
        Fixture {
            _temp: temp,
            root,
            app,
            lookup,
        }
    }

    fn put(dir: &Path, name: &str, contents: &str, secs: i64) {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn settings_listing_resolves_names_once() {
        let mut fx = fixture();
        let main = fx.root.join("settings_Default");
        put(&main, "core_char_9001.dat", "a", 100);
        put(&main, "core_char_404.dat", "b", 100);
        put(&main, "core_user_1.dat", "c", 100);

        let first = fx.app.load_settings();
        let second = fx.app.load_settings();
        assert_eq!(first.profiles.len(), 1);
        let names: Vec<&str> = second.profiles[0]
            .character_files
            .iter()
            .map(|c| c.display_name.as_str())
            .collect();
        assert_eq!(names, vec!["Unknown (404)", "Alpha"]);
        assert_eq!(fx.lookup.calls(), 2);
        assert!(fx
            .app
            .logs()
            .iter()
            .any(|entry| entry.message.contains("Total failed HTTP requests")));
    }

    #[test]
    fn mappings_dedupe_and_hide_associated_characters() {
        let mut fx = fixture();
        put(&fx.root.join("settings_a"), "core_char_9001.dat", "old", 100);
        put(&fx.root.join("settings_b"), "core_char_9001.dat", "new", 500);
        put(&fx.root.join("settings_b"), "core_char_9002.dat", "x", 520);
        put(&fx.root.join("settings_a"), "core_user_1.dat", "u", 110);

        let result = fx.app.associate("1", "9002");
        assert!(result.success, "{}", result.message);
        assert_eq!(fx.app.associations()[0].display_name, "Bravo");

        let view = fx.app.load_mappings();
        assert_eq!(view.accounts.len(), 1);
        assert_eq!(view.available_characters.len(), 1);
        assert_eq!(view.available_characters[0].profile, "b");
        assert_eq!(
            view.recency_groups,
            vec![
                vec!["a/core_user_1.dat".to_string()],
                vec!["b/core_char_9001.dat".to_string()]
            ]
        );
    }

    #[test]
    fn associate_reports_failures_as_results() {
        let mut fx = fixture();
        for id in ["11", "12", "13"] {
            assert!(fx.app.associate("1", id).success);
        }
        assert_eq!(fx.app.associations()[0].display_name, "Unknown");

        let full = fx.app.associate("1", "14");
        assert!(!full.success);
        assert!(full.message.contains("maximum of 3"));
        let taken = fx.app.associate("2", "11");
        assert!(!taken.success);
        assert!(taken.message.contains("already associated"));
        let missing = fx.app.unassociate("2", "11");
        assert!(!missing.success);
        assert!(fx.app.unassociate("1", "11").success);
        assert!(!fx.app.associate("x", "11").success);
    }

    #[test]
    fn sync_messages_report_counts() {
        let mut fx = fixture();
        let p1 = fx.root.join("settings_p1");
        put(&p1, "core_user_1.dat", "U1", 1);
        put(&p1, "core_user_2.dat", "U2", 1);
        put(&p1, "core_char_10.dat", "C1", 1);
        put(&p1, "core_char_20.dat", "C2", 1);
        put(&fx.root.join("settings_p2"), "core_user_3.dat", "U3", 1);

        let local = fx.app.sync_subdirectory("settings_p1", "1", "10");
        assert!(local.success);
        assert!(local.message.contains("1 user files copied and 1 character files"));

        let global = fx.app.sync_all_subdirectories("settings_p1", "1", "10");
        assert!(global.success);
        assert!(global.message.contains("1 user files copied and 0 character files"));
        assert_eq!(
            fs::read_to_string(fx.root.join("settings_p2/core_user_3.dat")).unwrap(),
            "U1"
        );

        let missing = fx.app.sync_all_subdirectories("settings_p1", "1", "99");
        assert!(!missing.success);
    }

    #[test]
    fn backups_live_in_the_data_dir() {
        let mut fx = fixture();
        put(&fx.root.join("settings_a"), "core_user_1.dat", "u", 1);

        let created = fx.app.backup_directory(None);
        assert!(created.success, "{}", created.message);
        assert_eq!(fx.app.list_backups().unwrap().len(), 1);

        let deleted = fx.app.delete_backups();
        assert!(deleted.success);
        assert!(fx.app.list_backups().unwrap().is_empty());
        assert!(fx.app.data_dir.join(LOG_FILE).exists());
    }

    #[test]
    fn selections_and_settings_dir_persist() {
        let mut fx = fixture();
        assert!(fx.app.set_selection("settings_a", serde_json::json!({"user": "1"})).success);
        assert_eq!(fx.app.load_selections()["settings_a"]["user"], "1");

        let chosen = fx.app.choose_settings_dir(fx.root.clone());
        assert!(chosen.success);
        let config = AppConfig::load(&fx.app.data_dir);
        assert_eq!(config.settings_dir.as_deref(), Some(fx.root.as_path()));
        assert!(!fx.app.choose_settings_dir(fx.root.join("absent")).success);
    }

    #[test]
    fn log_tail_returns_last_lines() {
        let mut fx = fixture();
        fx.app.log_info("one".to_string());
        fx.app.log_info("two".to_string());
        let tail = fx.app.log_tail_text(1).unwrap();
        assert_eq!(tail, "[INFO] two");
        assert_eq!(fx.app.log_tail_text(0).unwrap(), "");
    }
}
