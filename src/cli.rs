use crate::{
    app::{App, LogEntry, Verbosity},
    error::OpResult,
};
use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;
use std::{path::PathBuf, process::ExitCode};

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

struct GlobalOptions {
    format: OutputFormat,
    settings_dir: Option<PathBuf>,
    verbosity: Verbosity,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Settings,
    Mappings,
    Associations,
    Associate { account_id: String, character_id: String },
    Unassociate { account_id: String, character_id: String },
    Sync {
        sub_dir: String,
        account_id: String,
        character_id: String,
        all: bool,
    },
    Backup(Option<PathBuf>),
    BackupsList,
    BackupsDelete,
    DirShow,
    DirSet(PathBuf),
    DirReset,
    Status,
    SelectionsShow,
    SelectionsSet { key: String, value: String },
    Log { lines: usize },
    Help,
    Version,
}

pub fn run() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, tokens) = parse_global_options(&args)?;
    let command = parse_command(&tokens)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Version => {
            println!("profilesync v{}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let mut app = App::initialize(global.verbosity)?;
            if let Some(dir) = global.settings_dir {
                app.use_settings_dir(dir);
            }
            run_command(&mut app, command, global.format)
        }
    }
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut format = OutputFormat::Text;
    let mut settings_dir = None;
    let mut verbosity = Verbosity::Normal;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            format = parse_format(value)?;
            continue;
        }
        if let Some(value) = arg.strip_prefix("--dir=") {
            settings_dir = Some(PathBuf::from(value));
            continue;
        }
        match arg.as_str() {
            "--format" => {
                let Some(value) = iter.next() else {
                    bail!("--format requires a value");
                };
                format = parse_format(value)?;
            }
            "--dir" => {
                let Some(value) = iter.next() else {
                    bail!("--dir requires a path");
                };
                settings_dir = Some(PathBuf::from(value));
            }
            "-q" | "--quiet" => verbosity = Verbosity::Quiet,
            "-v" | "--verbose" => verbosity = Verbosity::Verbose,
            _ => tokens.push(arg.to_string()),
        }
    }

    Ok((
        GlobalOptions {
            format,
            settings_dir,
            verbosity,
        },
        tokens,
    ))
}

fn parse_format(value: &str) -> Result<OutputFormat> {
    match OutputFormat::parse(value) {
        Some(format) => Ok(format),
        None => bail!("Unknown format: {value} (use 'text' or 'json')"),
    }
}

fn parse_command(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let rest = &tokens[1..];
    let command = match head.as_str() {
        "help" | "--help" | "-h" => CliCommand::Help,
        "version" | "--version" | "-V" => CliCommand::Version,
        "settings" => CliCommand::Settings,
        "mappings" => CliCommand::Mappings,
        "associations" => CliCommand::Associations,
        "associate" | "unassociate" => {
            let [account_id, character_id] = rest else {
                bail!("{head} requires <user-id> <char-id>");
            };
            let account_id = account_id.to_string();
            let character_id = character_id.to_string();
            if head == "associate" {
                CliCommand::Associate {
                    account_id,
                    character_id,
                }
            } else {
                CliCommand::Unassociate {
                    account_id,
                    character_id,
                }
            }
        }
        "sync" => {
            let all = rest.iter().any(|arg| arg == "--all");
            let positional: Vec<&String> = rest.iter().filter(|arg| *arg != "--all").collect();
            let [sub_dir, account_id, character_id] = positional.as_slice() else {
                bail!("sync requires <subdir> <user-id> <char-id> [--all]");
            };
            CliCommand::Sync {
                sub_dir: sub_dir.to_string(),
                account_id: account_id.to_string(),
                character_id: character_id.to_string(),
                all,
            }
        }
        "backup" => CliCommand::Backup(rest.first().map(PathBuf::from)),
        "backups" => match rest.first().map(String::as_str).unwrap_or("list") {
            "list" => CliCommand::BackupsList,
            "delete" => CliCommand::BackupsDelete,
            other => bail!("Unknown backups command: {other} (use 'list' or 'delete')"),
        },
        "dir" => match rest.first().map(String::as_str).unwrap_or("show") {
            "show" => CliCommand::DirShow,
            "set" => {
                let Some(path) = rest.get(1) else {
                    bail!("dir set requires a path");
                };
                CliCommand::DirSet(PathBuf::from(path))
            }
            "reset" => CliCommand::DirReset,
            other => bail!("Unknown dir command: {other} (use 'show', 'set', or 'reset')"),
        },
        "status" => CliCommand::Status,
        "selections" => match rest.first().map(String::as_str).unwrap_or("show") {
            "show" => CliCommand::SelectionsShow,
            "set" => {
                let (Some(key), Some(value)) = (rest.get(1), rest.get(2)) else {
                    bail!("selections set requires <key> <value>");
                };
                CliCommand::SelectionsSet {
                    key: key.to_string(),
                    value: value.to_string(),
                }
            }
            other => bail!("Unknown selections command: {other} (use 'show' or 'set')"),
        },
        "log" => {
            let mut lines = 40;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                let value = match arg.strip_prefix("--lines=") {
                    Some(value) => value,
                    None if arg == "--lines" || arg == "-n" => match iter.next() {
                        Some(value) => value.as_str(),
                        None => bail!("--lines requires a value"),
                    },
                    None => continue,
                };
                lines = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid line count: {value}"))?;
            }
            CliCommand::Log { lines }
        }
        other => bail!("Unknown command: {other} (see 'profilesync help')"),
    };
    Ok(command)
}

fn run_command(app: &mut App, command: CliCommand, format: OutputFormat) -> Result<ExitCode> {
    match command {
        CliCommand::Settings => list_settings(app, format),
        CliCommand::Mappings => list_mappings(app, format),
        CliCommand::Associations => list_associations(app, format),
        CliCommand::Associate {
            account_id,
            character_id,
        } => {
            let result = app.associate(&account_id, &character_id);
            report(app, result, format)
        }
        CliCommand::Unassociate {
            account_id,
            character_id,
        } => {
            let result = app.unassociate(&account_id, &character_id);
            report(app, result, format)
        }
        CliCommand::Sync {
            sub_dir,
            account_id,
            character_id,
            all,
        } => {
            let result = if all {
                app.sync_all_subdirectories(&sub_dir, &account_id, &character_id)
            } else {
                app.sync_subdirectory(&sub_dir, &account_id, &character_id)
            };
            report(app, result, format)
        }
        CliCommand::Backup(target) => {
            let result = app.backup_directory(target.as_deref());
            report(app, result, format)
        }
        CliCommand::BackupsList => list_backups(app, format),
        CliCommand::BackupsDelete => {
            let result = app.delete_backups();
            report(app, result, format)
        }
        CliCommand::DirShow => show_status(app, format),
        CliCommand::DirSet(path) => {
            let result = app.choose_settings_dir(path);
            report(app, result, format)
        }
        CliCommand::DirReset => {
            let result = app.reset_to_default_dir();
            report(app, result, format)
        }
        CliCommand::Status => show_status(app, format),
        CliCommand::SelectionsShow => {
            println!("{}", serde_json::to_string_pretty(&app.load_selections())?);
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::SelectionsSet { key, value } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let result = app.set_selection(&key, value);
            report(app, result, format)
        }
        CliCommand::Log { lines } => {
            let tail = app.log_tail_text(lines)?;
            if !tail.is_empty() {
                println!("{tail}");
            }
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Help | CliCommand::Version => Ok(ExitCode::SUCCESS),
    }
}

#[derive(Serialize)]
struct ReportOutput<'a> {
    #[serde(flatten)]
    result: &'a OpResult,
    log: &'a [LogEntry],
}

fn report(app: &App, result: OpResult, format: OutputFormat) -> Result<ExitCode> {
    match format {
        OutputFormat::Json => {
            let output = ReportOutput {
                result: &result,
                log: app.logs(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => println!("{}", result.message),
    }
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(ExitCode::SUCCESS)
}

fn list_settings(app: &mut App, format: OutputFormat) -> Result<ExitCode> {
    let listing = app.load_settings();
    if format == OutputFormat::Json {
        return print_json(&listing);
    }

    match &listing.settings_dir {
        Some(dir) => {
            let marker = if listing.is_default_dir { " (default)" } else { "" };
            println!("Settings directory: {}{marker}", dir.display());
        }
        None => println!("Settings directory: not set (use 'profilesync dir set <path>')"),
    }
    if listing.profiles.is_empty() {
        println!("No settings_* profiles found.");
    }
    for profile in &listing.profiles {
        println!("{}", profile.name);
        for file in &profile.account_files {
            println!(
                "  user {:<12} {} {}",
                file.display_name(),
                format_date_cell(file.modified_ms),
                file.file_name
            );
        }
        for file in &profile.character_files {
            println!(
                "  char {:<12} {} {} ({})",
                file.character_id,
                format_date_cell(file.modified_ms),
                file.display_name,
                file.file_name
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn list_mappings(app: &mut App, format: OutputFormat) -> Result<ExitCode> {
    let view = app.load_mappings();
    if format == OutputFormat::Json {
        return print_json(&view);
    }

    println!("Accounts:");
    for account in &view.accounts {
        let linked: Vec<String> = view
            .associations
            .iter()
            .filter(|entry| entry.account_id == account.account_id)
            .map(|entry| format!("{} ({})", entry.display_name, entry.character_id))
            .collect();
        let linked = if linked.is_empty() {
            "-".to_string()
        } else {
            linked.join(", ")
        };
        println!(
            "  {:<12} {} [{}] {linked}",
            account.account_id,
            format_date_cell(account.modified_ms),
            account.profile
        );
    }
    println!("Available characters:");
    for character in &view.available_characters {
        println!(
            "  {:<12} {} [{}] {}",
            character.character_id,
            format_date_cell(character.modified_ms),
            character.profile,
            character.display_name
        );
    }
    println!("Modified together:");
    for (index, group) in view.recency_groups.iter().enumerate() {
        println!("  #{:<3} {}", index + 1, group.join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

fn list_associations(app: &App, format: OutputFormat) -> Result<ExitCode> {
    let associations = app.associations();
    if format == OutputFormat::Json {
        return print_json(&associations);
    }
    if associations.is_empty() {
        println!("No associations.");
    }
    for entry in associations {
        println!(
            "{:<12} -> {:<12} {}",
            entry.account_id, entry.character_id, entry.display_name
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn list_backups(app: &App, format: OutputFormat) -> Result<ExitCode> {
    let backups = app.list_backups()?;
    if format == OutputFormat::Json {
        return print_json(&backups);
    }
    if backups.is_empty() {
        println!("No backups in {}", app.data_dir.display());
    }
    for entry in backups {
        println!("{:>10} {}", entry.size, entry.path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn show_status(app: &App, format: OutputFormat) -> Result<ExitCode> {
    let status = app.status();
    if format == OutputFormat::Json {
        return print_json(&status);
    }
    let settings = status
        .settings_dir
        .as_ref()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|| "not set".to_string());
    let default = status
        .default_dir
        .as_ref()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("Data dir: {}", status.data_dir.display());
    println!(
        "Settings dir: {settings}{}",
        if status.is_default_dir { " (default)" } else { "" }
    );
    println!("Default dir: {default}");
    println!("Cached names: {}", status.cached_names);
    println!("Failed lookups: {}", status.failed_lookups);
    println!("Associations: {}", status.associations);
    Ok(ExitCode::SUCCESS)
}

fn print_help() {
    println!("profilesync v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  profilesync settings                          List settings_* profiles and their files");
    println!("  profilesync mappings                          Accounts, unassigned characters, recency groups");
    println!("  profilesync associations                      List account/character associations");
    println!("  profilesync associate <user> <char>           Associate a character with an account");
    println!("  profilesync unassociate <user> <char>         Remove an association");
    println!("  profilesync sync <subdir> <user> <char>       Copy the pair over siblings in <subdir>");
    println!("  profilesync sync <subdir> <user> <char> --all Copy the pair into every other profile");
    println!("  profilesync backup [<dir>]                    Archive the settings directory");
    println!("  profilesync backups [list|delete]             List or delete backup archives");
    println!("  profilesync dir [show|set <path>|reset]       Show or change the settings directory");
    println!("  profilesync selections [show|set <k> <v>]     Saved selections");
    println!("  profilesync status                            Paths and cache counters");
    println!("  profilesync log [--lines N]                   Show the operation log");
    println!();
    println!("Global options:");
    println!("  --format <json|text>            Output format");
    println!("  --dir <path>                    Settings directory for this run only");
    println!("  -q, --quiet                     Do not echo log messages");
    println!("  -v, --verbose                   Echo every log message");
    println!("  -h, --help                      Show help");
    println!("  -V, --version                   Show version");
}

fn format_date_cell(modified_ms: i64) -> String {
    let nanos = i128::from(modified_ms) * 1_000_000;
    let Ok(at) = time::OffsetDateTime::from_unix_timestamp_nanos(nanos) else {
        return "---------- --:--".to_string();
    };
    let at = time::UtcOffset::current_local_offset()
        .map(|offset| at.to_offset(offset))
        .unwrap_or(at);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute()
    )
}
