//! Process model repository service binary.
//!
//! # Responsibility
//! - Load configuration, initialize logging, and wire collaborators.
//! - Run the service until Ctrl-C, or run one maintenance task and exit.

use clap::{Parser, Subcommand};
use log::{error, info};
use procmodel_core::source::log::CommandLog;
use procmodel_core::{
    exit_process_on_fatal, init_logging, run_permission_backfill, start, Collaborators,
    Materializer, Reconciler, ServiceConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "procmodel", version, about = "Process model repository service")]
struct Cli {
    /// JSON config file; `PMR_*` environment variables override its fields.
    #[arg(long, env = "PMR_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run consumers and the cleanup loop until interrupted (default).
    Serve,
    /// Run a single reconciliation pass and exit.
    Cleanup,
    /// Seed owner grants for documents the authority does not know, then exit.
    Backfill,
    /// Print the effective configuration as JSON.
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = match ServiceConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("procmodel: {err}");
            return ExitCode::FAILURE;
        }
    };
    let command = cli.command.unwrap_or(Commands::Serve);
    if matches!(command, Commands::Config) {
        return match serde_json::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("{rendered}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("procmodel: {err}");
                ExitCode::FAILURE
            }
        };
    }

    config.log_dir = config.log_dir.take().map(absolute_dir);
    if let Err(err) = init_logging(&config.log_level, config.log_dir.as_deref()) {
        eprintln!("procmodel: {err}");
        return ExitCode::FAILURE;
    }

    match run(command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_exit module=cli status=error error={}", err);
            log::logger().flush();
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: &ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let collaborators = Collaborators::from_config(config).await?;
    match command {
        Commands::Serve | Commands::Config => {
            let handle = start(config, collaborators, exit_process_on_fatal()).await?;
            tokio::signal::ctrl_c().await?;
            info!("event=cli_signal module=cli status=ok signal=ctrl_c");
            let exits = handle.shutdown().await;
            info!(
                "event=cli_exit module=cli status=ok consumers_stopped={}",
                exits.len()
            );
        }
        Commands::Cleanup => {
            if config.uses_local_authority() {
                collaborators.log.close().await?;
                return Err(
                    "cleanup needs a remote permission authority; the in-memory one holds no grants in a one-shot run"
                        .into(),
                );
            }
            let reconciler = Reconciler::new(
                Materializer::new(collaborators.repo),
                collaborators.authority,
                config.process_topic.as_str(),
            )
            .with_grace(config.cleanup_grace())
            .with_page_size(config.cleanup_page_size);
            let report = reconciler.cleanup().await;
            collaborators.log.close().await?;
            let report = report?;
            println!(
                "permissions_removed={} documents_removed={}",
                report.permissions_removed, report.documents_removed
            );
        }
        Commands::Backfill => {
            let report = run_permission_backfill(
                &Materializer::new(collaborators.repo),
                collaborators.authority.as_ref(),
                &config.process_topic,
            )
            .await?;
            collaborators.log.close().await?;
            println!("scanned={} granted={}", report.scanned, report.granted);
        }
    }
    Ok(())
}

fn absolute_dir(dir: String) -> String {
    let path = PathBuf::from(&dir);
    if path.is_absolute() {
        return dir;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path).display().to_string())
        .unwrap_or(dir)
}
