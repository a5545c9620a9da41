use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rollback_core::{CorrelationId, EngineConfig, Event, EventPayload, FsmState};
use rollback_kernel::logging::{self, LogFormat};
use rollback_kernel::{transition, FileStateStore, Guards, RecoveryPlan, RetentionPolicy, StateStore};
use std::path::{Path, PathBuf};

fn cli() -> Command {
    Command::new("rollbackctl")
        .version(rollback_kernel::VERSION)
        .about("Inspect and operate the rollback engine's persisted attempts")
        .subcommand_required(true)
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .global(true)
                .default_value("rollback-state")
                .value_parser(value_parser!(PathBuf))
                .help("Directory of the file-backed state store"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("text")
                .value_parser(value_parser!(LogFormat))
                .help("Log output: text or json"),
        )
        .subcommand(
            Command::new("status").about("List stored attempts").arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Output as JSON"),
            ),
        )
        .subcommand(
            Command::new("reset")
                .about("Return an aborted attempt to idle")
                .arg(
                    Arg::new("id")
                        .required(true)
                        .value_parser(value_parser!(CorrelationId))
                        .help("Correlation id of the attempt"),
                )
                .arg(
                    Arg::new("operator")
                        .long("operator")
                        .default_value("rollbackctl")
                        .help("Who performed the reset"),
                ),
        )
        .subcommand(
            Command::new("purge").about("Delete finished attempts past retention").arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(value_parser!(PathBuf))
                    .help("Engine config to read retention from"),
            ),
        )
        .subcommand(
            Command::new("recover-plan")
                .about("Show what recovery would do with each in-flight attempt")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Engine config to read the staleness bound from"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("check-config").about("Load and validate an engine config").arg(
                Arg::new("path")
                    .required(true)
                    .value_parser(value_parser!(PathBuf))
                    .help("TOML config file"),
            ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let format = matches.get_one::<LogFormat>("log-format").copied().unwrap_or_default();
    logging::init(format, "info");

    let state_dir = matches
        .get_one::<PathBuf>("state-dir")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("rollback-state"));

    match matches.subcommand() {
        Some(("status", sub)) => status(&open(&state_dir)?, sub.get_flag("json")).await,
        Some(("reset", sub)) => reset(&open(&state_dir)?, sub).await,
        Some(("purge", sub)) => {
            let config = load_config(sub)?;
            let store = open(&state_dir)?;
            let purged = store
                .purge_expired(chrono::Utc::now(), &RetentionPolicy::from_config(&config))
                .await?;
            println!("purged {} attempt(s)", purged.len());
            for id in purged {
                println!("  {id}");
            }
            Ok(())
        }
        Some(("recover-plan", sub)) => {
            let config = load_config(sub)?;
            let store = open(&state_dir)?;
            let attempts = store.list().await?;
            let plan = RecoveryPlan::build(&attempts, chrono::Utc::now(), config.stale_after());
            if sub.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else if plan.is_empty() {
                println!("no in-flight attempts");
            } else {
                for entry in &plan.entries {
                    println!(
                        "{}  {:<24} {:<24} age {:>7}s  {}",
                        entry.correlation_id,
                        entry.app.key(),
                        entry.state,
                        entry.age_secs,
                        entry.decision.as_str()
                    );
                }
            }
            Ok(())
        }
        Some(("check-config", sub)) => {
            let path = sub.get_one::<PathBuf>("path").context("missing config path")?;
            let config = EngineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
            config.validate().with_context(|| format!("validating {}", path.display()))?;
            println!("{}: ok ({} app(s))", path.display(), config.apps.len());
            Ok(())
        }
        _ => bail!("unknown command"),
    }
}

fn open(dir: &Path) -> Result<FileStateStore> {
    FileStateStore::open(dir).with_context(|| format!("opening state store at {}", dir.display()))
}

fn load_config(sub: &ArgMatches) -> Result<EngineConfig> {
    match sub.get_one::<PathBuf>("config") {
        Some(path) => {
            let config = EngineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
            config.validate()?;
            Ok(config)
        }
        None => Ok(EngineConfig::default()),
    }
}

async fn status(store: &FileStateStore, json: bool) -> Result<()> {
    let attempts = store.list().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&attempts)?);
        return Ok(());
    }
    if attempts.is_empty() {
        println!("no attempts");
        return Ok(());
    }
    for a in &attempts {
        let target = a.target_revision.as_deref().unwrap_or("-");
        let note = match (&a.abort_reason, a.retired) {
            (Some(reason), _) => reason.to_string(),
            (None, true) => "retired".to_string(),
            (None, false) => String::new(),
        };
        println!(
            "{}  {:<24} {:<24} {} -> {}  {}",
            a.correlation_id,
            a.app.key(),
            a.fsm_state,
            a.current_revision,
            target,
            note
        );
    }
    Ok(())
}

/// Apply `ResetRequested` through the transition table while the engine is down
async fn reset(store: &FileStateStore, sub: &ArgMatches) -> Result<()> {
    let id = *sub.get_one::<CorrelationId>("id").context("missing correlation id")?;
    let operator = sub
        .get_one::<String>("operator")
        .cloned()
        .unwrap_or_else(|| "rollbackctl".to_string());
    let Some(mut attempt) = store.get(id).await? else {
        bail!("no attempt {id}");
    };
    if attempt.retired {
        bail!("attempt {id} is already retired");
    }

    let now = chrono::Utc::now();
    let payload = EventPayload::ResetRequested { operator: operator.clone() };
    let guards = Guards {
        environment: attempt.app.environment,
    };
    let t = transition(attempt.fsm_state, &payload, &guards)
        .with_context(|| format!("attempt {id} cannot be reset"))?;

    let mut event = Event::new(id, now, payload);
    event.sequence = store.max_sequence().await? + 1;
    attempt.applied_events.insert(event.key());
    attempt.enter(t.next, now);
    attempt.retired = t.next == FsmState::Idle;
    store.put(&attempt).await?;

    tracing::info!(correlation_id = %id, %operator, "attempt reset offline");
    println!("{id} reset to {}", attempt.fsm_state);
    Ok(())
}
