use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use serde_json::Value;
use study_integrity_core::{
    default_report_file_name, run_check, CheckOptions, Config, CutoverRules, ScheduleRegistry,
    StudyVariant,
};
use study_integrity_store_sqlite::{SqliteEventSource, TaskLogQuery};
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod csv_io;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "si")]
#[command(about = "Study task-log integrity checks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a study's task log against its reference schedule.
    Check(CheckArgs),
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("source").required(true).args(["input", "db"])))]
struct CheckArgs {
    #[arg(long)]
    study: String,
    /// Task-log CSV export.
    #[arg(long)]
    input: Option<PathBuf>,
    /// SQLite export of the research database.
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, requires = "db")]
    study_extension: Option<String>,
    #[arg(long, requires = "db")]
    min_participant_id: Option<i64>,
    /// Keep test and admin accounts when reading from --db.
    #[arg(long, requires = "db")]
    include_test_accounts: bool,
    #[arg(long, default_value_t = false)]
    no_cutover_rules: bool,
}

#[derive(Debug, Subcommand)]
enum ScheduleCommand {
    List(ConfigArgs),
    Show(StudyArgs),
}

#[derive(Debug, Subcommand)]
enum RulesCommand {
    Show(StudyArgs),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Validate(RequiredConfigArgs),
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RequiredConfigArgs {
    #[arg(long)]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct StudyArgs {
    #[arg(long)]
    study: String,
    #[arg(long)]
    config: Option<PathBuf>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Check(args) => run_check_command(&args),
        Command::Schedule { command } => run_schedule(command),
        Command::Rules { command } => run_rules(command),
        Command::Config { command } => run_config(command),
    }
}

/// Built-in schedules and rules with the optional config layered on top.
fn load_registry(config: Option<&Path>) -> Result<(ScheduleRegistry, CutoverRules)> {
    let registry = ScheduleRegistry::builtin();
    let rules = CutoverRules::builtin();
    let Some(path) = config else {
        return Ok((registry, rules));
    };
    let config = Config::from_path(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    Ok(config.apply(registry, rules)?)
}

fn resolve_variant(registry: &ScheduleRegistry, key: &str) -> Result<StudyVariant> {
    Ok(registry.get_schedule(key)?.variant)
}

fn run_check_command(args: &CheckArgs) -> Result<()> {
    let (registry, rules) = load_registry(args.config.as_deref())?;
    let variant = resolve_variant(&registry, &args.study)?;

    let (source, raw_events) = if let Some(input) = &args.input {
        let events = csv_io::read_task_log(input)?;
        (serde_json::json!({ "kind": "csv", "path": input }), events)
    } else if let Some(db) = &args.db {
        let mut query = TaskLogQuery::for_variant(variant);
        if let Some(extension) = &args.study_extension {
            query.study_extension = Some(extension.clone());
        }
        if let Some(min_participant_id) = args.min_participant_id {
            query.min_participant_id = Some(min_participant_id);
        }
        if args.include_test_accounts {
            query.include_test_accounts = true;
        }
        let events = SqliteEventSource::open(db)?.fetch_task_log(&query)?;
        (serde_json::json!({ "kind": "sqlite", "path": db, "query": query }), events)
    } else {
        anyhow::bail!("either --input or --db is required");
    };

    let options = CheckOptions { apply_cutover_rules: !args.no_cutover_rules };
    let outcome = run_check(&registry, &rules, variant.as_str(), &raw_events, options)?;

    let report_path = args.out.clone().unwrap_or_else(|| {
        PathBuf::from(default_report_file_name(variant, OffsetDateTime::now_utc().date()))
    });
    let report_sha256 = csv_io::write_report(&report_path, &outcome.rows)?;

    emit_json(serde_json::json!({
        "study": variant.as_str(),
        "source": source,
        "cutover_rules_applied": options.apply_cutover_rules,
        "normalization": {
            "total": outcome.normalization.total,
            "accepted": outcome.normalization.accepted,
            "administrative": outcome.normalization.administrative,
            "excluded_sessions": outcome.normalization.excluded_sessions,
            "malformed": outcome.normalization.malformed_total(),
            "malformed_by_field": outcome.normalization.malformed,
        },
        "participants": outcome.scan.participants,
        "flagged": outcome.flagged,
        "flagged_by_scope": {
            "session_order": outcome.scan.session_order_flags,
            "task_order": outcome.scan.task_order_flags,
            "unrecognized_session": outcome.scan.unrecognized_sessions,
        },
        "suppressed": outcome.suppressed.len(),
        "suppressed_by_rule": outcome.suppressed_by_rule(),
        "reported": outcome.rows.len(),
        "report_path": report_path,
        "report_sha256": report_sha256,
    }))
}

fn run_schedule(command: ScheduleCommand) -> Result<()> {
    match command {
        ScheduleCommand::List(args) => {
            let (registry, _) = load_registry(args.config.as_deref())?;
            let studies = registry
                .schedules()
                .map(|schedule| {
                    serde_json::json!({
                        "study": schedule.variant.as_str(),
                        "sessions": schedule.session_names(),
                        "task_count": schedule
                            .sessions
                            .iter()
                            .map(|session| session.tasks.len())
                            .sum::<usize>(),
                    })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({ "studies": studies }))
        }
        ScheduleCommand::Show(args) => {
            let (registry, _) = load_registry(args.config.as_deref())?;
            let schedule = registry.get_schedule(&args.study)?;
            emit_json(serde_json::json!({
                "study": schedule.variant.as_str(),
                "checked_sessions": schedule.checked_session_names(),
                "sessions": schedule.sessions,
            }))
        }
    }
}

fn run_rules(command: RulesCommand) -> Result<()> {
    match command {
        RulesCommand::Show(args) => {
            let (registry, rules) = load_registry(args.config.as_deref())?;
            let variant = resolve_variant(&registry, &args.study)?;
            emit_json(serde_json::json!({
                "study": variant.as_str(),
                "rules": rules.for_variant(variant),
            }))
        }
    }
}

fn run_config(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Validate(args) => {
            let config = Config::from_path(&args.config)
                .with_context(|| format!("failed to load config {}", args.config.display()))?;
            let schedule_overrides = config
                .schedules
                .iter()
                .map(|schedule| schedule.variant.as_str())
                .collect::<Vec<_>>();
            let rule_overrides = config
                .cutover_rules
                .iter()
                .map(|entry| {
                    serde_json::json!({
                        "study": entry.variant.as_str(),
                        "rules": entry.rules.len(),
                    })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({
                "config_path": args.config,
                "valid": true,
                "schedule_overrides": schedule_overrides,
                "cutover_rule_overrides": rule_overrides,
            }))
        }
    }
}
