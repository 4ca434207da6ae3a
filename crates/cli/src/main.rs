mod processors;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use deploy_core::{Attachable, Phase};
use deployer::keys::SUB_DEPLOYMENTS;
use deployer::{Deployer, DeployerChains, DeployerConfig, DeploymentSpec, DeploymentStatus};
use events::{Event, EventEnvelope};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::processors::{builtin_chains, MODULE_DEPENDENCIES};

const DEFAULT_CONFIG_FILE: &str = "deployer.toml";

#[derive(Parser)]
#[command(name = "deployctl")]
#[command(about = "Run deployments through the phase pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Deployer configuration (TOML)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a single archive or exploded directory
    Deploy {
        path: PathBuf,

        /// Deployment name, defaults to the last path component
        #[arg(long)]
        name: Option<String>,

        /// Skip every processor of this subsystem
        #[arg(long = "exclude")]
        excluded_subsystems: Vec<String>,

        /// Drop this module from the resolved dependencies
        #[arg(long = "exclude-dependency")]
        excluded_dependencies: Vec<String>,

        /// Undeploy again once the deployment settled
        #[arg(long)]
        undeploy: bool,
    },
    /// Deploy everything listed in the configuration
    Run {
        #[arg(long)]
        undeploy: bool,
    },
    /// Print the phase order and the processors registered for each phase
    Phases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DeployerConfig::read(&cli.config)
        .await
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    init_tracing(&config.log_filter);

    match cli.command {
        Commands::Deploy {
            path,
            name,
            excluded_subsystems,
            excluded_dependencies,
            undeploy,
        } => {
            let mut spec = match name {
                Some(name) => DeploymentSpec::new(name, path),
                None => DeploymentSpec::from_path(path)?,
            };
            spec.excluded_subsystems.extend(excluded_subsystems);
            spec.excluded_dependencies.extend(excluded_dependencies);
            let config = DeployerConfig {
                deployments: vec![spec],
                ..config
            };
            run(config, undeploy).await
        }
        Commands::Run { undeploy } => {
            if config.deployments.is_empty() {
                bail!("No deployments configured in {}", cli.config.display());
            }
            run(config, undeploy).await
        }
        Commands::Phases => {
            print_phases(&builtin_chains());
            Ok(())
        }
    }
}

async fn run(config: DeployerConfig, undeploy: bool) -> Result<()> {
    let deployer = Deployer::new(builtin_chains(), config)?;
    let mut events = deployer.events().subscribe();

    deployer.deploy_configured()?;
    deployer
        .await_stability()
        .await
        .context("Deployments did not settle")?;

    print_warnings(&mut events);
    let failed = print_statuses(&deployer);

    if undeploy {
        for name in deployer.deployments() {
            deployer.undeploy(&name)?;
        }
        deployer.await_stability().await?;
        println!();
        println!("Undeployed:");
        print_statuses(&deployer);
    }

    deployer.shutdown().await;

    if failed > 0 {
        bail!("{} deployment(s) failed", failed);
    }
    Ok(())
}

fn print_warnings(events: &mut broadcast::Receiver<EventEnvelope>) {
    loop {
        match events.try_recv() {
            Ok(envelope) => {
                if let Event::ValidationWarning { unit, message } = envelope.event {
                    println!("warning: {}: {}", unit.name, message);
                }
            }
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event subscriber lagged");
            }
            Err(_) => break,
        }
    }
}

/// Print one line per deployment and return how many failed.
fn print_statuses(deployer: &Deployer) -> usize {
    let mut failed = 0;
    println!();
    for name in deployer.config().deployments.iter().map(|d| &d.name) {
        let status = deployer.status(name);
        if matches!(status, DeploymentStatus::Failed(_)) {
            failed += 1;
        }
        println!("  {:<32} {}", name, status);

        let Some(unit) = deployer.unit(name) else {
            continue;
        };
        let mut subs: Vec<_> = unit.get_attachment_list(&SUB_DEPLOYMENTS);
        subs.sort_by(|a, b| a.name().cmp(b.name()));
        for sub in subs {
            println!(
                "    └ {:<28} dependencies: {}",
                sub.name(),
                sub.get_attachment_list(&MODULE_DEPENDENCIES).join(", ")
            );
        }
    }
    println!();
    failed
}

fn print_phases(chains: &DeployerChains) {
    for phase in Phase::ALL {
        println!("{}", phase);
        for registered in chains.chain(phase) {
            println!(
                "  {:>6}  {:<10} {}",
                registered.priority(),
                registered.subsystem().unwrap_or("-"),
                registered.processor_name()
            );
        }
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
