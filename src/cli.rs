use crate::config::Config;
use crate::scheduler::Scheduler;
use crate::service::ServiceManager;
use crate::{queue, store};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "campanile",
    version,
    about = "Background service scheduler and identity sync engine"
)]
pub struct Cli {
    /// Workspace directory (default: ~/.campanile)
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler daemon until interrupted
    Run,
    /// List attached services and their status
    Services {
        /// Restrict to one owner
        #[arg(long)]
        owner: Option<String>,
    },
    /// List queued and terminally failed jobs
    Jobs,
    /// List available service drivers
    Catalog,
}

pub async fn dispatch(cli: Cli, config: Config) -> Result<()> {
    let config = Arc::new(config);

    match cli.command {
        Commands::Run => {
            let scheduler = Arc::new(Scheduler::with_builtin_registries(Arc::clone(&config))?);
            let handle = scheduler.start();

            tokio::signal::ctrl_c().await?;
            println!("Shutting down...");
            handle.shutdown().await?;
            Ok(())
        }
        Commands::Services { owner } => {
            let services = match owner {
                Some(owner) => store::services::list_services(&config, &owner)?,
                None => store::services::list_all_services(&config)?,
            };
            if services.is_empty() {
                println!("No services attached yet.");
                return Ok(());
            }

            println!("Services ({}):", services.len());
            for service in services {
                let reason = service
                    .failure_reason
                    .map_or_else(String::new, |r| format!("\n    reason: {r}"));
                println!(
                    "- {} | {} | {} | every {}ms | updated {}{}",
                    service.id,
                    service.type_tag,
                    service.status,
                    service.interval_ms,
                    service.last_updated.to_rfc3339(),
                    reason
                );
            }
            Ok(())
        }
        Commands::Jobs => {
            let pending = queue::list_pending(&config)?;
            let failed = queue::list_failed(&config)?;

            if pending.is_empty() && failed.is_empty() {
                println!("Queue is empty.");
                return Ok(());
            }

            if !pending.is_empty() {
                println!("Pending ({}):", pending.len());
                for job in pending {
                    println!(
                        "- {} | service {} | due {} | attempt {}/{}",
                        job.id,
                        job.service_id,
                        job.due_at.to_rfc3339(),
                        job.attempts,
                        job.max_attempts
                    );
                }
            }
            if !failed.is_empty() {
                println!("Failed ({}):", failed.len());
                for job in failed {
                    println!(
                        "- {} | service {} | {}",
                        job.id,
                        job.service_id,
                        job.last_error.unwrap_or_else(|| "n/a".into())
                    );
                }
            }
            Ok(())
        }
        Commands::Catalog => {
            let scheduler = Arc::new(Scheduler::with_builtin_registries(Arc::clone(&config))?);
            let manager = ServiceManager::new(Arc::clone(&config), scheduler);

            println!("Available drivers:");
            for descriptor in manager.catalog() {
                let refresh = if descriptor.interval_ms > 0 {
                    format!("every {}ms", descriptor.interval_ms)
                } else {
                    "on demand".into()
                };
                println!(
                    "- {} ({}) | {} | identities: {} | {}",
                    descriptor.type_tag,
                    descriptor.category,
                    descriptor.name,
                    descriptor.identity_types.join(", "),
                    refresh
                );
            }
            Ok(())
        }
    }
}
