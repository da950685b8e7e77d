// src/cli.rs

use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sqlx::PgPool;
use tokio::net::TcpListener;

use crate::config::{AppConfig, ConfigError};
use crate::db::{self, locks::PgTaskLocks};
use crate::error::CoreError;
use crate::scheduler::{Scheduler, TaskContext, TaskKind, TaskStats};
use crate::services::settings::{self, ConfigPatch};
use crate::services::{archiver, classifier, erp, notify};
use crate::AppState;

#[derive(Parser, Debug)]
#[command(
    name = "mes-core",
    about = "Work-order completion and production reporting core",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP service and the scheduler (default command)
    Serve(ServeArgs),
    #[command(flatten)]
    Admin(AdminCommand),
}

#[derive(Subcommand, Debug)]
pub enum AdminCommand {
    /// Register or reschedule the single-accumulator comparison check
    #[command(name = "setup_completion_check_task")]
    SetupCompletionCheckTask(TaskArgs),
    /// Register or reschedule the dual-accumulator completion evaluator
    #[command(name = "setup_completion_trigger_task")]
    SetupCompletionTriggerTask(TaskArgs),
    /// Register, reschedule or remove report auto-approval
    #[command(name = "setup_auto_approval_task")]
    SetupAutoApprovalTask(AutoApprovalArgs),
    /// Re-derive report_type on every stored report
    #[command(name = "reclassify_rd_samples")]
    ReclassifyRdSamples {
        /// Put SMT and operator rows back to `normal` instead
        #[arg(long)]
        revert: bool,
    },
    /// Move legacy audit tables under their canonical names
    #[command(name = "rename_allocation_tables")]
    RenameAllocationTables,
    /// Promote staged ERP orders to pending work-orders
    #[command(name = "promote_erp_orders")]
    PromoteErpOrders,
    /// Physically delete live rows of long-archived work-orders
    #[command(name = "purge_archived")]
    PurgeArchived {
        #[arg(long)]
        older_than_days: i32,
    },
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub port: Option<u16>,
    /// Serve HTTP only; periodic tasks run elsewhere
    #[arg(long)]
    pub no_scheduler: bool,
}

#[derive(Args, Debug)]
pub struct TaskArgs {
    /// Minutes between runs; the task's default when omitted
    #[arg(long)]
    pub interval: Option<i32>,
    #[arg(long, conflicts_with = "disabled")]
    pub enabled: bool,
    #[arg(long)]
    pub disabled: bool,
}

impl TaskArgs {
    fn flag(&self) -> Option<bool> {
        match (self.enabled, self.disabled) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

#[derive(Args, Debug)]
pub struct AutoApprovalArgs {
    #[arg(long)]
    pub interval: Option<i32>,
    #[arg(long, conflicts_with = "interval")]
    pub remove: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl CliError {
    /// 1 for configuration and input errors, 2 for everything that failed at runtime.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Core(CoreError::InvalidInput(_)) => 1,
            _ => 2,
        }
    }
}

pub async fn run(cli: Cli, config: AppConfig) -> Result<(), CliError> {
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => serve(args, config).await,
        Command::Admin(admin) => {
            let pool = db::connect(&config.database_url).await.map_err(CoreError::from)?;
            db::migrate(&pool).await.map_err(CoreError::from)?;
            run_admin(admin, &pool, &config).await
        }
    }
}

async fn run_admin(command: AdminCommand, pool: &PgPool, config: &AppConfig) -> Result<(), CliError> {
    match command {
        AdminCommand::SetupCompletionCheckTask(args) => {
            let kind = TaskKind::LegacyCompletionCheck;
            let interval = args.interval.unwrap_or(kind.default_interval_minutes());
            print(&settings::upsert_task(pool, kind.as_str(), interval, args.flag()).await?)
        }
        AdminCommand::SetupCompletionTriggerTask(args) => {
            let kind = TaskKind::CompletionTrigger;
            let interval = args.interval.unwrap_or(kind.default_interval_minutes());
            let row = settings::upsert_task(pool, kind.as_str(), interval, args.flag()).await?;
            // The evaluator's interval and on/off switch live in the config row as well.
            settings::update_config(
                pool,
                ConfigPatch {
                    enabled: args.flag(),
                    interval_minutes: Some(interval),
                    ..Default::default()
                },
            )
            .await?;
            print(&row)
        }
        AdminCommand::SetupAutoApprovalTask(args) => {
            let kind = TaskKind::AutoApprove;
            if args.remove {
                let removed = settings::remove_task(pool, kind.as_str()).await?;
                return print(&serde_json::json!({ "task": kind.as_str(), "removed": removed }));
            }
            let interval = args.interval.unwrap_or(kind.default_interval_minutes());
            print(&settings::upsert_task(pool, kind.as_str(), interval, None).await?)
        }
        AdminCommand::ReclassifyRdSamples { revert } => {
            let summary = if revert {
                classifier::revert_reclassification(pool).await?
            } else {
                classifier::reclassify_all(pool).await?
            };
            print(&summary)
        }
        AdminCommand::RenameAllocationTables => print(&classifier::rename_allocation_tables(pool).await?),
        AdminCommand::PromoteErpOrders => {
            print(&erp::promote_erp_orders(pool, &config.default_processes).await?)
        }
        AdminCommand::PurgeArchived { older_than_days } => {
            print(&archiver::purge_archived(pool, older_than_days).await?)
        }
    }
}

fn print<T: Serialize>(value: &T) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value).context("serialize command output")?;
    println!("{text}");
    Ok(())
}

// ─── serve ──────────────────────────────────────────────────────────────────

async fn serve(args: ServeArgs, mut config: AppConfig) -> Result<(), CliError> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let addr = config.server.socket_addr()?;

    let pool = db::connect(&config.database_url).await.map_err(CoreError::from)?;
    db::migrate(&pool).await.map_err(CoreError::from)?;
    register_default_tasks(&pool).await?;

    let notifier: Arc<dyn notify::Notifier> =
        Arc::from(notify::from_config(config.notify_webhook_url.as_deref()));
    let config = Arc::new(config);
    let task_stats = TaskStats::default();

    if config.scheduler.enabled && !args.no_scheduler {
        let scheduler = Scheduler::new(
            TaskContext {
                pool: pool.clone(),
                timezone: config.timezone,
                default_processes: config.default_processes.clone(),
                notifier: notifier.clone(),
            },
            Arc::new(PgTaskLocks::new(pool.clone())),
            task_stats.clone(),
            config.scheduler.tick_secs,
        );
        tokio::spawn(scheduler.run());
    } else {
        tracing::info!("scheduler disabled on this node");
    }

    let app = crate::router(AppState {
        pool,
        config,
        notifier,
        task_stats,
    });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;
    Ok(())
}

/// Inserts every known task with its default interval; existing registrations are kept.
async fn register_default_tasks(pool: &PgPool) -> Result<(), CoreError> {
    for kind in TaskKind::ALL {
        sqlx::query(
            r#"INSERT INTO system_periodic_task (name, interval_minutes, enabled)
               VALUES ($1, $2, $3)
               ON CONFLICT (name) DO NOTHING"#,
        )
        .bind(kind.as_str())
        .bind(kind.default_interval_minutes())
        // The comparison check is opt-in.
        .bind(kind != TaskKind::LegacyCompletionCheck)
        .execute(pool)
        .await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_has_no_subcommand() {
        let cli = Cli::try_parse_from(["mes-core"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn task_setup_flags() {
        let cli = Cli::try_parse_from([
            "mes-core",
            "setup_completion_trigger_task",
            "--interval",
            "10",
            "--disabled",
        ])
        .expect("parse");
        match cli.command {
            Some(Command::Admin(AdminCommand::SetupCompletionTriggerTask(args))) => {
                assert_eq!(args.interval, Some(10));
                assert_eq!(args.flag(), Some(false));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(Cli::try_parse_from([
            "mes-core",
            "setup_completion_check_task",
            "--enabled",
            "--disabled",
        ])
        .is_err());
    }

    #[test]
    fn auto_approval_remove_excludes_interval() {
        assert!(Cli::try_parse_from(["mes-core", "setup_auto_approval_task", "--remove"]).is_ok());
        assert!(Cli::try_parse_from([
            "mes-core",
            "setup_auto_approval_task",
            "--remove",
            "--interval",
            "5",
        ])
        .is_err());
    }

    #[test]
    fn purge_needs_a_horizon() {
        assert!(Cli::try_parse_from(["mes-core", "purge_archived"]).is_err());
        let cli = Cli::try_parse_from(["mes-core", "purge_archived", "--older-than-days", "30"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Some(Command::Admin(AdminCommand::PurgeArchived { older_than_days: 30 }))
        ));
    }

    #[test]
    fn exit_codes_split_config_from_runtime() {
        assert_eq!(CliError::from(ConfigError::MissingDatabaseUrl).exit_code(), 1);
        assert_eq!(
            CliError::from(CoreError::invalid("interval must be positive")).exit_code(),
            1
        );
        assert_eq!(CliError::from(CoreError::Fatal("x".into())).exit_code(), 2);
        assert_eq!(
            CliError::from(anyhow::anyhow!("bind 0.0.0.0:8080")).exit_code(),
            2
        );
    }
}
