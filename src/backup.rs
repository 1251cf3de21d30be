use crate::scanner::unix_millis;
use anyhow::{bail, Context, Result};
use flate2::{write::GzEncoder, Compression};
use serde::Serialize;
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};
use time::{macros::format_description, OffsetDateTime};
use walkdir::WalkDir;

pub const BACKUP_SUFFIX: &str = ".bak.tar.gz";

#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified_ms: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failures: Vec<String>,
}

/// Archives `target` into `backup_dir` as `<name>_<local time>.bak.tar.gz`.
/// Entries are stored relative to the parent of `target`. Any failure
/// aborts and removes the partial archive.
pub fn create_backup(target: &Path, backup_dir: &Path) -> Result<PathBuf> {
    let source = target
        .canonicalize()
        .with_context(|| format!("resolve backup source {}", target.display()))?;
    if !source.is_dir() {
        bail!("Backup source is not a directory: {}", source.display());
    }
    let base_name = source
        .file_name()
        .context("backup source has no name")?
        .to_os_string();
    let parent = source.parent().context("backup source has no parent")?;

    fs::create_dir_all(backup_dir).context("create backup dir")?;
    let backup_root = backup_dir.canonicalize().context("resolve backup dir")?;
    if backup_root.starts_with(&source) {
        bail!(
            "Backup location {} is inside the directory being backed up",
            backup_root.display()
        );
    }

    let archive_name = format!(
        "{}_{}{BACKUP_SUFFIX}",
        base_name.to_string_lossy(),
        backup_timestamp()
    );
    let archive_path = backup_root.join(archive_name);

    if let Err(err) = write_archive(&source, parent, &archive_path) {
        let _ = fs::remove_file(&archive_path);
        return Err(err);
    }
    Ok(archive_path)
}

fn write_archive(source: &Path, parent: &Path, archive_path: &Path) -> Result<()> {
    let file = File::create(archive_path)
        .with_context(|| format!("create archive {}", archive_path.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.context("walk backup source")?;
        let relative = entry
            .path()
            .strip_prefix(parent)
            .context("backup entry outside source")?;
        if entry.file_type().is_dir() {
            builder
                .append_dir(relative, entry.path())
                .with_context(|| format!("archive {}", entry.path().display()))?;
        } else {
            builder
                .append_path_with_name(entry.path(), relative)
                .with_context(|| format!("archive {}", entry.path().display()))?;
        }
    }

    let encoder = builder.into_inner().context("finish tar stream")?;
    encoder.finish().context("finish gzip stream")?;
    Ok(())
}

/// Local time, second resolution; UTC when the local offset is unknown.
pub fn backup_timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format_timestamp(now)
}

fn format_timestamp(at: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    at.format(&format).unwrap_or_else(|_| {
        format!(
            "{:04}-{:02}-{:02}_{:02}-{:02}-{:02}",
            at.year(),
            at.month() as u8,
            at.day(),
            at.hour(),
            at.minute(),
            at.second()
        )
    })
}

/// Backups in `backup_dir`, newest first.
pub fn list_backups(backup_dir: &Path) -> Result<Vec<BackupEntry>> {
    if !backup_dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(backup_dir).context("read backup dir")? {
        let entry = entry.context("read backup entry")?;
        let Ok(file_name) = entry.file_name().into_string() else {
            continue;
        };
        if !file_name.ends_with(BACKUP_SUFFIX) {
            continue;
        }
        let meta = entry.metadata().context("stat backup")?;
        if !meta.is_file() {
            continue;
        }
        out.push(BackupEntry {
            file_name,
            path: entry.path(),
            size: meta.len(),
            modified_ms: meta.modified().map(unix_millis).unwrap_or(0),
        });
    }
    out.sort_by(|a, b| {
        b.modified_ms
            .cmp(&a.modified_ms)
            .then_with(|| b.file_name.cmp(&a.file_name))
    });
    Ok(out)
}

/// Removes every `*.bak.tar.gz` file in `backup_dir`. One failed delete does
/// not stop the others.
pub fn delete_backups(backup_dir: &Path) -> Result<DeleteReport> {
    let mut report = DeleteReport::default();
    if !backup_dir.exists() {
        return Ok(report);
    }
    let mut names: Vec<String> = fs::read_dir(backup_dir)
        .context("read backup dir")?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(BACKUP_SUFFIX))
        .collect();
    names.sort();

    remove_each(backup_dir, names, &mut report, |path| fs::remove_file(path));
    Ok(report)
}

fn remove_each<F>(dir: &Path, names: Vec<String>, report: &mut DeleteReport, mut remove: F)
where
    F: FnMut(&Path) -> std::io::Result<()>,
{
    for name in names {
        match remove(&dir.join(&name)) {
            Ok(()) => report.deleted.push(name),
            Err(err) => report.failures.push(format!("{name}: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn settings_tree(temp: &TempDir) -> PathBuf {
        let root = temp.path().join("c_ccp_eve_online_tq_tranquility");
        let profile = root.join("settings_Default");
        fs::create_dir_all(&profile).unwrap();
        fs::write(profile.join("core_user_1.dat"), b"user").unwrap();
        fs::write(profile.join("core_char_2.dat"), b"char").unwrap();
        root
    }

    #[test]
    fn timestamp_is_filesystem_safe() {
        let at = datetime!(2024-03-09 07:05:01 UTC);
        assert_eq!(format_timestamp(at), "2024-03-09_07-05-01");
    }

    #[test]
    fn archive_is_rooted_at_directory_name() {
        let temp = TempDir::new().unwrap();
        let root = settings_tree(&temp);
        let store = temp.path().join("appdata");

        let archive = create_backup(&root, &store).unwrap();
        let name = archive.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("c_ccp_eve_online_tq_tranquility_"));
        assert!(name.ends_with(BACKUP_SUFFIX));

        let mut reader = tar::Archive::new(GzDecoder::new(File::open(&archive).unwrap()));
        let paths: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(paths
            .iter()
            .all(|path| path.starts_with("c_ccp_eve_online_tq_tranquility")));
        assert!(paths.contains(
            &"c_ccp_eve_online_tq_tranquility/settings_Default/core_user_1.dat".to_string()
        ));
    }

    #[test]
    fn backup_inside_source_is_refused() {
        let temp = TempDir::new().unwrap();
        let root = settings_tree(&temp);
        assert!(create_backup(&root, &root.join("backups")).is_err());
        assert!(create_backup(&temp.path().join("missing"), temp.path()).is_err());
    }

    #[test]
    fn delete_only_touches_backup_files() {
        let temp = TempDir::new().unwrap();
        let store = temp.path();
        fs::write(store.join("a_2024-01-01_00-00-00.bak.tar.gz"), b"1").unwrap();
        fs::write(store.join("b_2024-01-02_00-00-00.bak.tar.gz"), b"2").unwrap();
        fs::write(store.join("associations.json"), b"[]").unwrap();
        fs::write(store.join("notes.tar.gz"), b"keep").unwrap();

        assert_eq!(list_backups(store).unwrap().len(), 2);
        let report = delete_backups(store).unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert!(report.failures.is_empty());
        assert!(store.join("associations.json").exists());
        assert!(store.join("notes.tar.gz").exists());
        assert!(list_backups(store).unwrap().is_empty());
    }

    #[test]
    fn failed_delete_does_not_stop_the_rest() {
        let temp = TempDir::new().unwrap();
        let names: Vec<String> = ["a", "b", "c"]
            .iter()
            .map(|base| format!("{base}_2024-01-01_00-00-00{BACKUP_SUFFIX}"))
            .collect();
        for name in &names {
            fs::write(temp.path().join(name), b"x").unwrap();
        }

        let mut report = DeleteReport::default();
        remove_each(temp.path(), names.clone(), &mut report, |path| {
            if path.ends_with(&names[1]) {
                return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"));
            }
            fs::remove_file(path)
        });

        assert_eq!(report.deleted, vec![names[0].clone(), names[2].clone()]);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with(&names[1]));
        assert!(report.failures[0].contains("locked"));
        assert!(temp.path().join(&names[1]).exists());
        assert!(!temp.path().join(&names[2]).exists());
    }
}
