use crate::{
    error::{validate_id, ProfileSyncError},
    scanner::{account_file_name, character_file_name, is_account_file, is_character_file},
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub account_files: usize,
    pub character_files: usize,
    pub warnings: Vec<String>,
}

/// Overwrites every other account and character file inside `sub_dir` with
/// the selected pair. Either source may be missing; that half is skipped.
pub fn sync_local(
    root: &Path,
    sub_dir: &str,
    account_id: &str,
    character_id: &str,
) -> Result<SyncReport> {
    validate_id("account", account_id)?;
    validate_id("character", character_id)?;
    let dir = profile_dir(root, sub_dir)?;
    let mut report = SyncReport::default();

    let account_name = account_file_name(account_id);
    let character_name = character_file_name(character_id);
    let account_bytes = read_optional_source(&dir.join(&account_name), "user", &mut report);
    let character_bytes = read_optional_source(&dir.join(&character_name), "character", &mut report);

    let files = list_files(&dir).with_context(|| format!("read {}", dir.display()))?;
    for file_name in files {
        let target = dir.join(&file_name);
        let (source, counter) = if is_account_file(&file_name) {
            if file_name == account_name {
                continue;
            }
            (&account_bytes, &mut report.account_files)
        } else if is_character_file(&file_name) {
            if file_name == character_name {
                continue;
            }
            (&character_bytes, &mut report.character_files)
        } else {
            continue;
        };

        let Some(bytes) = source else {
            report.warnings.push(format!(
                "Source content unavailable, skipping file: {}",
                target.display()
            ));
            continue;
        };
        match fs::write(&target, bytes) {
            Ok(()) => *counter += 1,
            Err(err) => report
                .warnings
                .push(format!("Error copying to file {}: {err}", target.display())),
        }
    }

    Ok(report)
}

/// Copies the selected pair over every account and character file in every
/// other profile directory, whatever id those files carry. Both sources
/// must be readable before anything is written.
pub fn sync_global(
    root: &Path,
    sub_dir: &str,
    account_id: &str,
    character_id: &str,
) -> Result<SyncReport> {
    validate_id("account", account_id)?;
    validate_id("character", character_id)?;
    let dir = profile_dir(root, sub_dir)?;

    let account_bytes = read_required_source(&dir.join(account_file_name(account_id)))?;
    let character_bytes = read_required_source(&dir.join(character_file_name(character_id)))?;

    let mut others: Vec<String> = fs::read_dir(root)
        .with_context(|| format!("read {}", root.display()))?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name != sub_dir)
        .collect();
    others.sort();

    let mut report = SyncReport::default();
    'profiles: for other in others {
        let other_dir = root.join(&other);
        let files = match list_files(&other_dir) {
            Ok(files) => files,
            Err(err) => {
                report.warnings.push(format!(
                    "Error syncing files for subdirectory \"{other}\": {err}"
                ));
                continue;
            }
        };

        for file_name in files {
            let (bytes, counter) = if is_account_file(&file_name) {
                (&account_bytes, &mut report.account_files)
            } else if is_character_file(&file_name) {
                (&character_bytes, &mut report.character_files)
            } else {
                continue;
            };
            let target = other_dir.join(&file_name);
            if let Err(err) = fs::write(&target, bytes) {
                report.warnings.push(format!(
                    "Error syncing files for subdirectory \"{other}\" at {}: {err}",
                    target.display()
                ));
                continue 'profiles;
            }
            *counter += 1;
        }
    }

    Ok(report)
}

/// Resolves a profile directory name under `root`, refusing anything that
/// could point outside of it.
pub fn profile_dir(root: &Path, sub_dir: &str) -> Result<PathBuf, ProfileSyncError> {
    let mut components = Path::new(sub_dir).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single_normal || sub_dir.contains(['/', '\\', '\0']) {
        return Err(ProfileSyncError::NotFound(format!(
            "Invalid subdirectory name: {sub_dir:?}"
        )));
    }
    let dir = root.join(sub_dir);
    if !dir.is_dir() {
        return Err(ProfileSyncError::NotFound(format!(
            "Subdirectory does not exist: {}",
            dir.display()
        )));
    }
    Ok(dir)
}

fn read_optional_source(path: &Path, label: &str, report: &mut SyncReport) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            report.warnings.push(format!(
                "Selected {label} file does not exist: {}",
                path.display()
            ));
            None
        }
        Err(err) => {
            report.warnings.push(format!(
                "Selected {label} file could not be read: {}: {err}",
                path.display()
            ));
            None
        }
    }
}

fn read_required_source(path: &Path) -> Result<Vec<u8>, ProfileSyncError> {
    fs::read(path).map_err(|source| ProfileSyncError::FatalIo {
        path: path.to_path_buf(),
        source,
    })
}

/// Names of the regular files in `dir`, sorted.
fn list_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), contents).unwrap();
    }

    fn read(dir: &Path, name: &str) -> String {
        fs::read_to_string(dir.join(name)).unwrap()
    }

    fn fixture() -> TempDir {
        let temp = TempDir::new().unwrap();
        let p1 = temp.path().join("p1");
        write(&p1, "core_user_1.dat", "user-one");
        write(&p1, "core_user_2.dat", "user-two");
        write(&p1, "core_char_10.dat", "char-ten");
        write(&p1, "core_char_20.dat", "char-twenty");
        write(&p1, "prefs.ini", "untouched");
        temp
    }

    fn domain(err: &anyhow::Error) -> Option<&ProfileSyncError> {
        err.downcast_ref::<ProfileSyncError>()
    }

    #[test]
    fn local_sync_overwrites_siblings_only() {
        let temp = fixture();
        let p1 = temp.path().join("p1");

        let report = sync_local(temp.path(), "p1", "1", "10").unwrap();
        assert_eq!(report.account_files, 1);
        assert_eq!(report.character_files, 1);
        assert!(report.warnings.is_empty());
        assert_eq!(read(&p1, "core_user_2.dat"), "user-one");
        assert_eq!(read(&p1, "core_char_20.dat"), "char-ten");
        assert_eq!(read(&p1, "core_user_1.dat"), "user-one");
        assert_eq!(read(&p1, "core_char_10.dat"), "char-ten");
        assert_eq!(read(&p1, "prefs.ini"), "untouched");
    }

    #[test]
    fn local_sync_is_idempotent() {
        let temp = fixture();
        let p1 = temp.path().join("p1");
        let first = sync_local(temp.path(), "p1", "1", "10").unwrap();
        let snapshot: Vec<String> = ["core_user_1.dat", "core_user_2.dat", "core_char_10.dat", "core_char_20.dat"]
            .iter()
            .map(|name| read(&p1, name))
            .collect();

        let second = sync_local(temp.path(), "p1", "1", "10").unwrap();
        let again: Vec<String> = ["core_user_1.dat", "core_user_2.dat", "core_char_10.dat", "core_char_20.dat"]
            .iter()
            .map(|name| read(&p1, name))
            .collect();
        assert_eq!(snapshot, again);
        assert_eq!(first, second);
    }

    #[test]
    fn local_sync_skips_missing_half() {
        let temp = fixture();
        let p1 = temp.path().join("p1");

        let report = sync_local(temp.path(), "p1", "1", "99").unwrap();
        assert_eq!(report.account_files, 1);
        assert_eq!(report.character_files, 0);
        assert_eq!(read(&p1, "core_user_2.dat"), "user-one");
        assert_eq!(read(&p1, "core_char_20.dat"), "char-twenty");
        assert!(report.warnings[0].contains("core_char_99.dat"));
        assert_eq!(report.warnings.len(), 3);
    }

    #[test]
    fn local_sync_rejects_unknown_or_escaping_directory() {
        let temp = fixture();
        let err = sync_local(temp.path(), "missing", "1", "10").unwrap_err();
        assert!(matches!(domain(&err), Some(ProfileSyncError::NotFound(_))));
        let err = sync_local(temp.path(), "../p1", "1", "10").unwrap_err();
        assert!(matches!(domain(&err), Some(ProfileSyncError::NotFound(_))));
        let err = sync_local(temp.path(), "p1", "1x", "10").unwrap_err();
        assert!(matches!(domain(&err), Some(ProfileSyncError::InvalidId { .. })));
    }

    #[test]
    fn global_sync_copies_to_every_other_profile() {
        let temp = fixture();
        let p2 = temp.path().join("p2");
        let p3 = temp.path().join("p3");
        write(&p2, "core_user_5.dat", "old");
        write(&p2, "core_user_6.dat", "old");
        write(&p2, "core_char_50.dat", "old");
        write(&p3, "core_char_60.dat", "old");
        write(&p3, "other.dat", "old");
        fs::write(temp.path().join("loose_file"), "x").unwrap();

        let report = sync_global(temp.path(), "p1", "1", "10").unwrap();
        assert_eq!(report.account_files, 2);
        assert_eq!(report.character_files, 2);
        assert_eq!(read(&p2, "core_user_5.dat"), "user-one");
        assert_eq!(read(&p2, "core_user_6.dat"), "user-one");
        assert_eq!(read(&p2, "core_char_50.dat"), "char-ten");
        assert_eq!(read(&p3, "core_char_60.dat"), "char-ten");
        assert_eq!(read(&p3, "other.dat"), "old");
        assert_eq!(read(&temp.path().join("p1"), "core_user_2.dat"), "user-two");
    }

    #[test]
    fn global_sync_aborts_without_writes_when_source_missing() {
        let temp = fixture();
        let p2 = temp.path().join("p2");
        write(&p2, "core_user_5.dat", "old");
        write(&p2, "core_char_50.dat", "old");

        let err = sync_global(temp.path(), "p1", "1", "99").unwrap_err();
        assert!(matches!(domain(&err), Some(ProfileSyncError::FatalIo { .. })));
        assert_eq!(read(&p2, "core_user_5.dat"), "old");
        assert_eq!(read(&p2, "core_char_50.dat"), "old");
    }

    #[cfg(unix)]
    #[test]
    fn global_sync_continues_past_unreadable_profile() {
        use std::os::unix::fs::PermissionsExt;

        let temp = fixture();
        let locked = temp.path().join("a_locked");
        let open = temp.path().join("b_open");
        write(&locked, "core_user_5.dat", "old");
        write(&open, "core_user_6.dat", "old");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        let probe = fs::read_dir(&locked).is_ok();

        let report = sync_global(temp.path(), "p1", "1", "10").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(read(&open, "core_user_6.dat"), "user-one");
        if !probe {
            assert_eq!(report.account_files, 1);
            assert_eq!(report.warnings.len(), 1);
            assert!(report.warnings[0].contains("a_locked"));
        }
    }
}
