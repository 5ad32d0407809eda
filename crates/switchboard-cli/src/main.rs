//! Switchboard command-line runner.

mod echo;

use clap::{Parser, Subcommand, ValueEnum};
use echo::EchoAgent;
use std::path::PathBuf;
use std::sync::Arc;
use switchboard_core::{InMemoryKnowledgeBase, SwitchboardConfig, TaskEventKind, TaskId};
use switchboard_orchestrator::{AgentRegistry, InProcessTransport, Orchestrator, TaskManager};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard: agent task orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "switchboard.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator with in-process echo agents until interrupted
    Run {
        /// Exit once every bootstrap task has finished
        #[arg(long)]
        once: bool,
    },
    /// Validate the config file and print what it declares
    Check,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = SwitchboardConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Check => {
            println!("Config '{}' is valid.", cli.config.display());
            println!("Agents:");
            for agent in &config.agents {
                let skills: Vec<&str> = agent.skills.iter().map(|s| s.id.as_str()).collect();
                println!("  {} [{}]", agent.id, skills.join(", "));
            }
            println!("Bootstrap tasks: {}", config.bootstrap.len());
            println!("Schedules:");
            for job in &config.schedules {
                let state = if job.enabled { "enabled" } else { "disabled" };
                println!("  {} ({}) -> {} [{state}]", job.name, job.cron_expression, job.task.skill);
            }
        }
        Commands::Run { once } => run(config, once).await?,
    }

    Ok(())
}

async fn run(config: SwitchboardConfig, once: bool) -> anyhow::Result<()> {
    let registry = Arc::new(AgentRegistry::new());
    let transport = Arc::new(InProcessTransport::new());
    let knowledge = Arc::new(InMemoryKnowledgeBase::new());

    let manager = Arc::new(
        TaskManager::builder(registry, transport.clone())
            .config(&config.orchestrator)
            .knowledge_base(knowledge)
            .build(),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        TaskManager::clone(&manager),
        transport.clone(),
        &config,
    )?);

    orchestrator.register_agents(&config.agents)?;
    for agent in &config.agents {
        transport.attach(agent.id.as_str(), Arc::new(EchoAgent::new(&manager)));
    }
    info!(agents = config.agents.len(), "Agents registered");

    // Submitted here so their ids are known; the loop will not repeat them.
    let bootstrap = orchestrator.submit_bootstrap().await;
    let handle = Arc::clone(&orchestrator).start();

    if once {
        for id in bootstrap {
            report(&manager, id).await;
        }
    } else {
        info!("Orchestrator running; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    handle.stop().await;
    info!(dead_letters = manager.dead_letters().len(), "Orchestrator stopped");
    Ok(())
}

/// Waits for a task's terminal event and logs it.
async fn report(manager: &TaskManager, id: TaskId) {
    let mut sub = match manager.subscribe(id).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(task_id = %id, error = %e, "Cannot follow task");
            return;
        }
    };
    while let Some(event) = sub.next().await {
        match event.kind {
            TaskEventKind::Completed { result } => {
                info!(task_id = %id, result = %result, "Task completed");
            }
            TaskEventKind::Failed { error } => {
                warn!(task_id = %id, error = ?error, "Task failed");
            }
            TaskEventKind::Canceled => info!(task_id = %id, "Task canceled"),
            _ => {}
        }
    }
}
