mod config;
mod demo;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::OpsMeshConfig;
use opsmesh_core::Payload;
use opsmesh_gateway::GatewayServer;
use opsmesh_orchestrator::Coordinator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "opsmesh", about = "OpsMesh: agent coordination for patient operations")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "opsmesh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List built-in and configured flow definitions
    Flows,
    /// Check the config file and every flow definition in it
    Validate,
    /// Run one flow in-process against the demo agents and print the result
    Run {
        /// Flow definition id
        flow: String,
        /// Initial payload as a JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = OpsMeshConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Flows => {
            let flows = config.all_flows();
            println!("Flow definitions:");
            for def in &flows {
                let category = def.category().unwrap_or("-");
                println!("  {} ({}, v{})", def.id, category, def.version);
                for step in &def.steps {
                    let deps = if step.depends_on.is_empty() {
                        String::new()
                    } else {
                        format!(" after {}", step.depends_on.join(", "))
                    };
                    println!(
                        "    {} -> {}:{}{}",
                        step.step_id, step.target_capability, step.action, deps
                    );
                }
            }
            Ok(())
        }
        Commands::Validate => {
            let mut failed = 0;
            for def in config.all_flows() {
                match def.validate() {
                    Ok(()) => println!("ok      {}", def.id),
                    Err(e) => {
                        failed += 1;
                        println!("invalid {}: {}", def.id, e);
                    }
                }
            }
            for agent in &config.agents {
                if let Err(e) = agent.to_record().validate() {
                    failed += 1;
                    println!("invalid agent {}: {}", agent.id, e);
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} invalid entries in {}", cli.config.display());
            }
            Ok(())
        }
        Commands::Run { flow, payload } => run_once(config, &flow, &payload).await,
    }
}

/// Starts a coordinator with every configured flow and agent.
async fn bootstrap(config: &OpsMeshConfig, with_demo: bool) -> anyhow::Result<Arc<Coordinator>> {
    let coordinator = Arc::new(
        Coordinator::start(config.registry.clone(), config.orchestrator.clone()).await?,
    );

    for def in config.all_flows() {
        let id = def.id.clone();
        coordinator
            .orchestrator()
            .register_flow(def)
            .with_context(|| format!("flow '{id}' is invalid"))?;
    }
    info!(
        count = coordinator.orchestrator().definitions().len(),
        "Flow definitions registered"
    );

    for agent in &config.agents {
        if let Err(e) = coordinator.attach_remote(agent.to_record()) {
            warn!(agent_id = %agent.id, error = %e, "Skipping configured agent");
        }
    }

    if with_demo {
        for (record, handler) in demo::agents(config.queue.clone()) {
            coordinator.attach_local(record, handler)?;
        }
        info!("Demo agents attached");
    }

    Ok(coordinator)
}

async fn serve(config: OpsMeshConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    let coordinator = bootstrap(&config, config.demo_agents).await?;
    let app = GatewayServer::build(coordinator.clone(), config.queue.clone());

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("OpsMesh gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    info!("Shutting down");
    coordinator.shutdown().await;
    Ok(())
}

async fn run_once(config: OpsMeshConfig, flow: &str, raw_payload: &str) -> anyhow::Result<()> {
    let payload: Payload =
        serde_json::from_str(raw_payload).context("--payload must be a JSON object")?;

    let coordinator = bootstrap(&config, true).await?;
    let orchestrator = coordinator.orchestrator();
    let instance_id = orchestrator.start_flow(flow, payload).await?;
    let instance = orchestrator.wait_for_terminal(instance_id).await?;

    println!("{}", serde_json::to_string_pretty(&instance)?);
    coordinator.shutdown().await;
    Ok(())
}
