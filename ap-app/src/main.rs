//! Autopilot binary: runtime host and operator CLI.

mod commands;
mod config;
mod notify;
mod runtime;

use clap::{Parser, Subcommand};
use config::AutopilotConfig;
use runtime::Autopilot;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "autopilot", version, about = "Decision autopilot with review, queue and rollback")]
struct Cli {
    /// Config file (default: ~/.autopilot/config.toml).
    #[arg(long, global = true, env = "AUTOPILOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run workers and the maintenance loop (default).
    Serve,
    /// Validate config and report storage, providers and guard state.
    Doctor,
    /// Run an analysis JSON document through the decision pipeline.
    Ingest { path: PathBuf },
    /// Queue AI analysis of a target.
    Analyze {
        target_id: String,
        #[arg(long)]
        instructions: Option<String>,
        /// Bill this actor's credits instead of the global pool.
        #[arg(long)]
        actor: Option<String>,
    },
    /// List decisions, newest first.
    Decisions {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Approve {
        hash: String,
        #[arg(long, env = "AUTOPILOT_OPERATOR")]
        actor: String,
    },
    Reject {
        hash: String,
        #[arg(long, env = "AUTOPILOT_OPERATOR")]
        actor: String,
        #[arg(long, default_value = "rejected by operator")]
        reason: String,
    },
    /// Queue an approved (or failed) decision for execution.
    Apply {
        hash: String,
        #[arg(long, env = "AUTOPILOT_OPERATOR")]
        actor: String,
    },
    /// Applied/failed/rejected counts and the current pause state.
    Health {
        #[arg(long)]
        days: Option<u32>,
    },
    Pause {
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    Resume {
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Make a pending task due immediately.
    Retry { task_id: String },
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Restore a target from a snapshot.
    Rollback { snapshot_id: String },
    /// Undo whatever a task wrote.
    RollbackTask { task_id: String },
    Credits {
        #[command(subcommand)]
        command: CreditsCommand,
    },
    /// Recent audit log entries.
    Audit {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
enum CreditsCommand {
    Grant {
        amount: i64,
        #[arg(long)]
        actor: Option<String>,
    },
    Show {
        #[arg(long)]
        actor: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let (cfg, cfg_path) = AutopilotConfig::load_with_path(cli.config).await?;
    let app = Autopilot::build(cfg)?;

    let command = cli.command.unwrap_or(Command::Serve);
    match command {
        Command::Serve => Arc::new(app).serve().await,
        Command::Doctor => commands::doctor(&app, &cfg_path),
        Command::Ingest { path } => commands::ingest(&app, &path).await,
        Command::Analyze {
            target_id,
            instructions,
            actor,
        } => commands::analyze(&app, &target_id, instructions.as_deref(), actor.as_deref()),
        Command::Decisions { status, limit } => {
            commands::decisions(&app, status.as_deref(), limit)
        }
        Command::Approve { hash, actor } => commands::approve(&app, &hash, &actor).await,
        Command::Reject {
            hash,
            actor,
            reason,
        } => commands::reject(&app, &hash, &actor, &reason).await,
        Command::Apply { hash, actor } => commands::apply(&app, &hash, &actor).await,
        Command::Health { days } => commands::health(&app, days),
        Command::Pause { reason } => commands::pause(&app, &reason).await,
        Command::Resume { reason } => commands::resume(&app, &reason).await,
        Command::Retry { task_id } => commands::retry(&app, &task_id),
        Command::DeadLetters { limit } => commands::dead_letters(&app, limit),
        Command::Rollback { snapshot_id } => commands::rollback(&app, &snapshot_id).await,
        Command::RollbackTask { task_id } => commands::rollback_task(&app, &task_id).await,
        Command::Credits { command } => match command {
            CreditsCommand::Grant { amount, actor } => {
                commands::credits_grant(&app, amount, actor.as_deref())
            }
            CreditsCommand::Show { actor } => commands::credits_show(&app, actor.as_deref()),
        },
        Command::Audit { limit } => commands::audit(&app, limit),
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,autopilot=debug,ap_app=debug,ap_core=debug,ap_actions=debug,ap_llm=debug",
        ),
    };
    let log_format = std::env::var("AUTOPILOT_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    match log_format.as_str() {
        "json" => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported AUTOPILOT_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::debug!(log_format = %log_format, "tracing initialized");
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
