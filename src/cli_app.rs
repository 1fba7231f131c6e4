//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use availability_ledger::coalesce::checkpoint::{FsStateStore, StateStore};
use availability_ledger::core::config::Config;
use availability_ledger::core::dates::{day_range, format_timestamp, parse_day};
use availability_ledger::core::errors::AvlError;
use availability_ledger::identity::keys::{ExternalKey, scrub_legacy_key};
use availability_ledger::ingest::feed::Feed;
use availability_ledger::logger::dual::{DualLoggerConfig, spawn_logger};
use availability_ledger::logger::jsonl::JsonlConfig;
use availability_ledger::logger::sqlite::SqliteLogger;
use availability_ledger::output::aggregate::{AGGREGATE_FILE, aggregate_slots};
use availability_ledger::output::csv_sink::{IDS_FILE, LOCATIONS_FILE, read_ids, read_locations};
use availability_ledger::pipeline::driver::{Driver, RunOptions, RunSummary};

/// Availability ledger: ingest availability feeds into interval tables.
#[derive(Debug, Parser)]
#[command(
    name = "avl",
    author,
    version,
    about = "Availability ledger - coalesce vaccine availability feeds into interval tables",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Process a range of days of raw input into interval tables.
    Process(ProcessArgs),
    /// Inspect checkpointed open intervals.
    State(StateArgs),
    /// Query the external id map.
    Ids(IdsArgs),
    /// Fold the daily slot tables into one table.
    AggregateSlots(AggregateArgs),
    /// Show recently processed days from the run ledger.
    History(HistoryArgs),
    /// View and validate configuration.
    Config(ConfigArgs),
    /// Show version and optional build metadata.
    Version(VersionArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct ProcessArgs {
    /// First day to process (YYYY-MM-DD).
    #[arg(long, value_name = "DAY")]
    start: String,
    /// Last day to process, inclusive. Defaults to the start day.
    #[arg(long, value_name = "DAY")]
    end: Option<String>,
    /// Input feed. Defaults to `run.feed` from the config.
    #[arg(long, value_enum)]
    feed: Option<Feed>,
    /// Skip slot-level intervals.
    #[arg(long)]
    no_slots: bool,
    /// Emit every open interval after the last day instead of checkpointing.
    #[arg(long)]
    flush: bool,
    /// Ignore the id map and location table of earlier runs; seed them from
    /// the newest raw snapshot instead.
    #[arg(long)]
    clean_run: bool,
    /// Do not write to the activity log or run ledger.
    #[arg(long)]
    no_log: bool,
}

#[derive(Debug, Clone, Args)]
struct StateArgs {
    #[command(subcommand)]
    command: StateCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum StateCommand {
    /// Show the checkpoint that a run of DAY would resume from.
    Show(StateShowArgs),
}

#[derive(Debug, Clone, Args)]
struct StateShowArgs {
    /// Day whose checkpoint to read (YYYY-MM-DD).
    day: String,
    /// Show slot intervals instead of location intervals.
    #[arg(long)]
    slots: bool,
    /// Maximum number of entries to print.
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Clone, Args)]
struct IdsArgs {
    #[command(subcommand)]
    command: IdsCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum IdsCommand {
    /// Look up an external key (`scheme:value`) in the id map.
    Lookup(IdsLookupArgs),
}

#[derive(Debug, Clone, Args)]
struct IdsLookupArgs {
    /// External key, e.g. `vtsgeo:1234` or `uuid:<location id>`.
    key: String,
}

#[derive(Debug, Clone, Args)]
struct AggregateArgs {
    /// Directory holding `slots_<day>.csv` files. Defaults to the output dir.
    #[arg(long, value_name = "DIR")]
    in_dir: Option<PathBuf>,
    /// Output file. Defaults to `slots_grouped_all.csv` in the input dir.
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct HistoryArgs {
    /// Number of days to show.
    #[arg(long, default_value_t = 10)]
    limit: u32,
    /// Also list recent warnings and errors.
    #[arg(long)]
    events: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args, Default)]
struct VersionArgs {
    /// Include additional build metadata fields.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Input data or environment failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

impl From<AvlError> for CliError {
    fn from(err: AvlError) -> Self {
        match err {
            AvlError::InvalidConfig { .. }
            | AvlError::MissingConfig { .. }
            | AvlError::ConfigParse { .. }
            | AvlError::DateRange { .. }
            | AvlError::MalformedKey { .. } => Self::User(err.to_string()),
            _ => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Process(args) => run_process(cli, args),
        Command::State(args) => match &args.command {
            StateCommand::Show(show) => run_state_show(cli, show),
        },
        Command::Ids(args) => match &args.command {
            IdsCommand::Lookup(lookup) => run_ids_lookup(cli, lookup),
        },
        Command::AggregateSlots(args) => run_aggregate(cli, args),
        Command::History(args) => run_history(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Version(args) => emit_version(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// process
// ---------------------------------------------------------------------------

fn run_process(cli: &Cli, args: &ProcessArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let start = parse_day(&args.start)?;
    let end = args.end.as_deref().map(parse_day).transpose()?;
    let days = day_range(start, end)?;
    let feed = args.feed.unwrap_or(config.run.feed);

    let options = RunOptions {
        days,
        slots: config.run.slots && !args.no_slots,
        flush: args.flush || config.coalesce.flush_on_last_day,
        clean_run: args.clean_run,
        verbose: cli.verbose,
    };

    let logger = if args.no_log {
        None
    } else {
        let logger_config = DualLoggerConfig {
            sqlite_path: Some(config.paths.sqlite_db.clone()),
            jsonl_config: JsonlConfig {
                path: config.paths.jsonl_log.clone(),
                ..JsonlConfig::default()
            },
            channel_capacity: 1024,
        };
        Some(spawn_logger(logger_config)?)
    };

    let mut driver = Driver::from_config(config, feed)?;
    if let Some((handle, _)) = &logger {
        driver = driver.with_logger(handle.clone());
    }
    let outcome = driver.run(&options);

    if let Some((handle, join)) = logger {
        let dropped = handle.dropped_events();
        handle.shutdown();
        if join.join().is_err() {
            return Err(CliError::Internal("logger thread panicked".to_string()));
        }
        if dropped > 0 && !cli.quiet {
            eprintln!("[AVL-RUN] {dropped} activity log events dropped");
        }
    }

    let summary = outcome?;
    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                print_run_summary(&summary);
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "process",
                "summary": serde_json::to_value(&summary)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn print_run_summary(summary: &RunSummary) {
    println!(
        "{} {} day(s) of {} (config {})",
        "Processed".green().bold(),
        summary.days.len(),
        summary.feed,
        summary.config_hash
    );
    println!(
        "  {:<12} {:>8} {:>10} {:>8} {:>8} {:>8} {:>6}",
        "day", "records", "observed", "avs", "slots", "open", "skip"
    );
    for day in &summary.days {
        let skipped = if day.skipped_records > 0 {
            day.skipped_records.to_string().yellow().to_string()
        } else {
            "0".to_string()
        };
        println!(
            "  {:<12} {:>8} {:>10} {:>8} {:>8} {:>8} {:>6}",
            day.day,
            day.records,
            day.observations,
            day.avs_emitted,
            day.slots_emitted,
            day.open_avs + day.open_slots,
            skipped
        );
    }
    println!(
        "  ids: {} keys -> {} internal ids, {} locations",
        summary.external_keys, summary.internal_ids, summary.locations
    );
    if summary.legacy_keys_rewritten > 0 {
        println!("  legacy keys rewritten: {}", summary.legacy_keys_rewritten);
    }
}

// ---------------------------------------------------------------------------
// state / ids
// ---------------------------------------------------------------------------

fn run_state_show(cli: &Cli, args: &StateShowArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let day = parse_day(&args.day)?;
    let store = FsStateStore::new(config.paths.state_dir.clone());

    let (path, entries): (PathBuf, Option<Vec<Value>>) = if args.slots {
        let state = store.load_slots(day, config.coalesce.slot_retention_days)?;
        let entries = state.map(|state| {
            state
                .iter()
                .map(|((id, slot), open)| {
                    json!({
                        "id": id,
                        "slot": slot.to_string(),
                        "first_seen": format_timestamp(open.first_seen),
                        "last_seen": format_timestamp(open.last_seen),
                        "offset": open.utc_offset,
                        "available": open.value.as_flag(),
                    })
                })
                .collect()
        });
        (store.slots_path(day), entries)
    } else {
        let state = store.load_avs(day)?;
        let entries = state.map(|state| {
            state
                .iter()
                .map(|(id, open)| {
                    json!({
                        "id": id,
                        "first_seen": format_timestamp(open.first_seen),
                        "last_seen": format_timestamp(open.last_seen),
                        "offset": open.utc_offset,
                        "value": open.value.to_string(),
                    })
                })
                .collect()
        });
        (store.avs_path(day), entries)
    };

    let Some(entries) = entries else {
        return Err(CliError::User(format!(
            "no checkpoint for {day} at {}",
            path.display()
        )));
    };

    match output_mode(cli) {
        OutputMode::Human => {
            println!("{} ({} open)", path.display(), entries.len());
            for entry in entries.iter().take(args.limit) {
                println!("  {entry}");
            }
            if entries.len() > args.limit {
                println!("  ... {} more", entries.len() - args.limit);
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "state show",
                "day": day.to_string(),
                "path": path.to_string_lossy(),
                "open": entries.len(),
                "entries": entries.into_iter().take(args.limit).collect::<Vec<_>>(),
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_ids_lookup(cli: &Cli, args: &IdsLookupArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let key = ExternalKey::parse(&scrub_legacy_key(args.key.trim()))?;
    let ids_path = config.paths.out_dir.join(IDS_FILE);
    let Some(pairs) = read_ids(&ids_path)? else {
        return Err(CliError::User(format!(
            "no id map at {}; run `avl process` first",
            ids_path.display()
        )));
    };

    let Some(id) = pairs
        .iter()
        .find_map(|(candidate, id)| (*candidate == key).then_some(*id))
    else {
        return Err(CliError::User(format!("{key} is not mapped to an internal id")));
    };
    let aliases: Vec<String> = pairs
        .iter()
        .filter(|(_, other)| *other == id)
        .map(|(alias, _)| alias.to_string())
        .collect();
    let location = read_locations(&config.paths.out_dir.join(LOCATIONS_FILE))?
        .and_then(|rows| rows.into_iter().find(|(row_id, _)| *row_id == id))
        .map(|(_, record)| record);

    match output_mode(cli) {
        OutputMode::Human => {
            println!("{key} -> {}", id.to_string().bold());
            println!("  keys: {}", aliases.join(", "));
            if let Some(location) = &location {
                let field = |value: &Option<String>| value.clone().unwrap_or_default();
                println!(
                    "  location: {} | {} | {}, {} {}",
                    field(&location.name),
                    field(&location.address),
                    field(&location.city),
                    field(&location.state),
                    field(&location.zip)
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "ids lookup",
                "key": key.to_string(),
                "id": id,
                "keys": aliases,
                "location": serde_json::to_value(&location)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// aggregate-slots / history
// ---------------------------------------------------------------------------

fn run_aggregate(cli: &Cli, args: &AggregateArgs) -> Result<(), CliError> {
    let in_dir = match &args.in_dir {
        Some(dir) => dir.clone(),
        None => Config::load(cli.config.as_deref())?.paths.out_dir,
    };
    let out = args
        .out
        .clone()
        .unwrap_or_else(|| in_dir.join(AGGREGATE_FILE));
    let summary = aggregate_slots(&in_dir, &out)?;

    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                println!(
                    "{} {} rows from {} files into {} rows: {}",
                    "Aggregated".green().bold(),
                    summary.rows_in,
                    summary.files,
                    summary.rows_out,
                    out.display()
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "aggregate-slots",
                "out": out.to_string_lossy(),
                "summary": serde_json::to_value(summary)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_history(cli: &Cli, args: &HistoryArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let db_path = &config.paths.sqlite_db;
    if !db_path.exists() {
        return Err(CliError::User(format!(
            "no run ledger at {}",
            db_path.display()
        )));
    }
    let db = SqliteLogger::open(db_path)?;
    let days = db.recent_days(args.limit)?;
    let events = if args.events {
        db.recent_activity(args.limit)?
            .into_iter()
            .filter(|row| row.severity != "info")
            .collect()
    } else {
        Vec::new()
    };

    match output_mode(cli) {
        OutputMode::Human => {
            if days.is_empty() {
                println!("No processed days recorded.");
            }
            for day in &days {
                let status = if day.skipped_records > 0 || day.merge_conflicts > 0 {
                    "warn".yellow()
                } else {
                    "ok".green()
                };
                println!(
                    "{} {} {:<18} records={} avs={} slots={} open={} ({} ms) [{}]",
                    day.run_at,
                    day.day,
                    day.feed,
                    day.records,
                    day.avs_emitted,
                    day.slots_emitted,
                    day.open_avs,
                    day.duration_ms,
                    status
                );
            }
            for event in &events {
                println!(
                    "  {} {} {} {}",
                    event.timestamp,
                    event.severity.red(),
                    event.event_type,
                    event
                        .error_message
                        .as_deref()
                        .or(event.details.as_deref())
                        .unwrap_or("")
                );
            }
        }
        OutputMode::Json => {
            let events: Vec<Value> = events
                .iter()
                .map(|event| {
                    json!({
                        "timestamp": event.timestamp,
                        "event_type": event.event_type,
                        "severity": event.severity,
                        "day": event.day,
                        "key": event.ext_key,
                        "ids": event.ids,
                        "error_code": event.error_code,
                        "message": event.error_message.as_ref().or(event.details.as_ref()),
                    })
                })
                .collect();
            let payload = json!({
                "command": "history",
                "days": serde_json::to_value(&days)?,
                "events": events,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config / version
// ---------------------------------------------------------------------------

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

fn emit_version(cli: &Cli, args: &VersionArgs) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let target = option_env!("TARGET").unwrap_or("unknown");
    let profile = option_env!("PROFILE").unwrap_or("unknown");
    let git_sha = option_env!("GIT_SHA").unwrap_or("unknown");

    match output_mode(cli) {
        OutputMode::Human => {
            println!("avl {version}");
            if args.verbose {
                println!("package: {package}");
                println!("target: {target}");
                println!("profile: {profile}");
                println!("git_sha: {git_sha}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "binary": "avl",
                "version": version,
                "package": package,
                "build": {
                    "target": target,
                    "profile": profile,
                    "git_sha": git_sha,
                }
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("AVL_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_before_and_after_subcommand() {
        let before = Cli::try_parse_from([
            "avl",
            "--config",
            "/tmp/avl.toml",
            "--json",
            "--no-color",
            "-v",
            "process",
            "--start",
            "2021-05-01",
        ]);
        assert!(before.is_ok());

        let after = Cli::try_parse_from(["avl", "history", "--json", "--no-color", "-q"]);
        assert!(after.is_ok());
    }

    #[test]
    fn parses_every_subcommand() {
        let cases = [
            vec!["avl", "process", "--start", "2021-05-01", "--end", "2021-05-03"],
            vec!["avl", "process", "--start", "2021-05-01", "--feed", "univaf_log", "--no-slots"],
            vec!["avl", "process", "--start", "2021-05-01", "--feed", "vaccinespotter", "--flush"],
            vec!["avl", "process", "--start", "2021-05-01", "--clean-run", "--no-log"],
            vec!["avl", "state", "show", "2021-05-02", "--slots", "--limit", "5"],
            vec!["avl", "ids", "lookup", "vtsgeo:1234"],
            vec!["avl", "aggregate-slots", "--in-dir", "/data/clean", "--out", "/tmp/all.csv"],
            vec!["avl", "history", "--limit", "3", "--events"],
            vec!["avl", "config", "path"],
            vec!["avl", "config", "show"],
            vec!["avl", "config", "validate"],
            vec!["avl", "version", "--verbose"],
        ];

        for case in cases {
            let parsed = Cli::try_parse_from(case.clone());
            assert!(parsed.is_ok(), "failed to parse case: {case:?}");
        }
    }

    #[test]
    fn process_requires_a_start_day_and_a_known_feed() {
        assert!(Cli::try_parse_from(["avl", "process"]).is_err());
        assert!(
            Cli::try_parse_from(["avl", "process", "--start", "2021-05-01", "--feed", "rss"])
                .is_err()
        );
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["avl", "-v", "-q", "history"]).is_err());
    }

    #[test]
    fn completions_support_bash_zsh_and_fish() {
        for shell in ["bash", "zsh", "fish"] {
            let parsed = Cli::try_parse_from(["avl", "completions", shell]);
            assert!(parsed.is_ok(), "failed shell parse for {shell}");
        }
    }

    #[test]
    fn output_mode_resolution() {
        assert_eq!(resolve_output_mode(true, None, true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, None, true), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, None, false), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some(" HUMAN "), false), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, Some("json"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("auto"), true), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, Some("bogus"), false), OutputMode::Json);
    }

    #[test]
    fn exit_codes_follow_error_class() {
        let user: CliError = AvlError::DateRange {
            details: "end before start".to_string(),
        }
        .into();
        assert_eq!(user.exit_code(), 1);

        let runtime: CliError = AvlError::MissingLocation { id: 3 }.into();
        assert_eq!(runtime.exit_code(), 2);

        assert_eq!(CliError::Internal("x".to_string()).exit_code(), 3);
    }
}
