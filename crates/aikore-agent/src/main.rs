use std::{path::PathBuf, sync::Arc};

use aikore_agent::{
    api,
    config::AgentConfig,
    manager::InstanceManager,
    plan_executor::{self, ShutdownSignals},
};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "aikore-agent")]
#[command(about = "Supervises AI application instances on this host")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a persistent-mode launch plan as the instance's process group anchor
    Supervise {
        /// Path to the launch plan JSON file
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AgentConfig::from_env()?;

    if let Some(Command::Supervise { plan }) = cli.command {
        return plan_executor::supervise(&plan, cfg.stop_grace).await;
    }

    let mut signals = ShutdownSignals::install()?;
    let addr = cfg.listen_addr;
    let manager = Arc::new(InstanceManager::from_config(cfg)?);

    let report = manager.reconcile_on_boot().await?;
    tracing::info!(
        reset = report.reset.len(),
        swept_rules = report.swept_rules,
        autostarted = report.autostarted.len(),
        autostart_failed = report.autostart_failed.len(),
        "boot reconciliation finished"
    );

    let app = api::router(manager.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "aikore-agent listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let sig = signals.recv().await;
            tracing::info!(signal = sig, "shutdown requested");
        })
        .await?;

    tracing::info!("shutting down; stopping supervised instances");
    manager.stop_all().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn supervise_takes_a_plan_path() {
        let cli = Cli::try_parse_from(["aikore-agent", "supervise", "/data/app/launch-plan.json"]).unwrap();
        match cli.command {
            Some(Command::Supervise { plan }) => {
                assert_eq!(plan, PathBuf::from("/data/app/launch-plan.json"));
            }
            None => panic!("expected supervise"),
        }

        assert!(Cli::try_parse_from(["aikore-agent"]).unwrap().command.is_none());
        assert!(Cli::try_parse_from(["aikore-agent", "supervise"]).is_err());
        assert!(Cli::try_parse_from(["aikore-agent", "bogus"]).is_err());
    }
}
