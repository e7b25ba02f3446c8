//! APGMS CLI - Main entry point

use apgms_cli::{commands, context, AppContext};
use apgms_core::{ContributionSource, ObligationType};
use apgms_ledger::LedgerError;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "apgms")]
#[command(about = "APGMS - designated account ledger", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database URL, overrides the configuration
    #[arg(short, long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a contribution to a designated account
    Contribute {
        tenant: String,
        /// PAYGW or GST
        #[arg(value_parser = parse_obligation)]
        obligation: ObligationType,
        /// Amount in minor units (cents)
        #[arg(allow_negative_numbers = true)]
        amount: i64,
        /// Idempotency key
        #[arg(long)]
        key: String,
        /// payroll_system, pos_system or manual
        #[arg(long, value_parser = parse_source)]
        source: Option<ContributionSource>,
        /// Required amount to check coverage against, in minor units
        #[arg(long)]
        required: Option<i64>,
        #[arg(long)]
        actor: Option<String>,
    },

    /// Re-evaluate an account's lock against a required amount
    Coverage {
        tenant: String,
        #[arg(value_parser = parse_obligation)]
        obligation: ObligationType,
        #[arg(long)]
        required: i64,
        #[arg(long)]
        actor: Option<String>,
    },

    /// Show a tenant's designated accounts
    Balance { tenant: String },

    /// Audit chain operations
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },

    /// Compare balances with the banking partner
    Reconcile {
        /// Only this tenant
        #[arg(long)]
        tenant: Option<String>,
        /// JSON bank statement snapshot
        #[arg(long)]
        bank_snapshot: Option<PathBuf>,
        /// Keep running on the configured interval
        #[arg(long, conflicts_with = "tenant")]
        watch: bool,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Verify the hash chain
    Verify { tenant: String },
    /// Print the audit entries
    Log { tenant: String },
    /// Release a quarantined chain after repair
    Release {
        tenant: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        reason: String,
    },
}

fn parse_obligation(value: &str) -> Result<ObligationType, String> {
    ObligationType::parse_code(value).map_err(|e| e.to_string())
}

fn parse_source(value: &str) -> Result<ContributionSource, String> {
    ContributionSource::parse_code(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error [{}]: {:#}", commands::error_code(&e), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = context::load_config(cli.config.as_deref(), cli.database.as_deref())?;
    let ctx = AppContext::new(config).await?;

    let result = dispatch(&ctx, cli.command).await;
    ctx.shutdown().await;
    result
}

async fn dispatch(ctx: &AppContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Contribute {
            tenant,
            obligation,
            amount,
            key,
            source,
            required,
            actor,
        } => {
            commands::contribute(ctx, &tenant, obligation, amount, &key, source, required, actor.as_deref())
                .await?;
        }

        Commands::Coverage {
            tenant,
            obligation,
            required,
            actor,
        } => {
            commands::coverage(ctx, &tenant, obligation, required, actor.as_deref()).await?;
        }

        Commands::Balance { tenant } => {
            commands::balance(ctx, &tenant).await?;
        }

        Commands::Audit { command } => match command {
            AuditCommands::Verify { tenant } => {
                let verification = commands::audit_verify(ctx, &tenant).await?;
                if !verification.valid {
                    return Err(LedgerError::AuditChainIntegrityViolation {
                        tenant_id: tenant,
                        broken_at_entry_id: verification.broken_at_entry_id,
                        reason: verification.reason.unwrap_or_default(),
                    }
                    .into());
                }
            }
            AuditCommands::Log { tenant } => {
                commands::audit_log(ctx, &tenant).await?;
            }
            AuditCommands::Release { tenant, actor, reason } => {
                commands::audit_release(ctx, &tenant, &actor, &reason).await?;
            }
        },

        Commands::Reconcile {
            tenant,
            bank_snapshot,
            watch,
        } => {
            if watch {
                commands::reconcile_watch(ctx, bank_snapshot.as_deref()).await?;
            } else {
                let outcomes = commands::reconcile(ctx, tenant.as_deref(), bank_snapshot.as_deref()).await?;
                let total = outcomes.len();
                let failed = outcomes.iter().filter(|o| !o.is_success()).count();
                if let Some(e) = outcomes.into_iter().find_map(|o| o.result.err()) {
                    return Err(anyhow::Error::new(e)
                        .context(format!("{} of {} tenants failed to reconcile", failed, total)));
                }
            }
        }
    }

    Ok(())
}
