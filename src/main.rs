use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use foreman::brain::{linear_proposal, NodeBehavior, Reasoning, CommandBrain, ScriptedBrain, ScriptedPropose};
use foreman::bus::{Bus, BusConfig};
use foreman::core::task::Task;
use foreman::decompose::Decomposer;
use foreman::error::WorkflowError;
use foreman::events;
use foreman::executor::Executor;
use foreman::healing::HealingCoordinator;
use foreman::hierarchy::HierarchyManager;
use foreman::registry::{AgentId, Registry};
use foreman::store::StateStore;
use foreman::worker::WorkerHost;
use foreman::{log, EngineConfig, Error, Result};

/// Foreman - hierarchical task orchestration for autonomous agent teams
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1     Enable debug logging")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Submit a task and execute it to completion
    Run {
        /// The task description in natural language
        prompt: String,

        /// Use the built-in scripted brain instead of the configured
        /// external command (useful to try the engine without one)
        #[arg(long)]
        demo: bool,
    },

    /// List persisted workflow runs
    Status,

    /// Print the active configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    log::init_with_debug(cli.debug);

    match cli.command {
        Command::Run { prompt, demo } => run_task(&prompt, demo).await,
        Command::Status => show_status(),
        Command::Config { init } => show_config(init),
    }
}

async fn run_task(prompt: &str, demo: bool) -> Result<()> {
    let config = EngineConfig::load()?;
    let store = StateStore::open(config.state_dir()?)?;

    let (event_tx, mut event_rx) = events::channel(1024);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            tracing::info!(?event, "engine event");
        }
    });

    let bus = Bus::new(
        BusConfig {
            queue_high_water: config.queue_high_water,
            escalation_window: config.escalation_window(),
            max_escalation_hops: config.max_escalation_hops,
        },
        event_tx.clone(),
    );
    bus.start_watchdog(config.escalation_window() / 4);

    let brain: Arc<dyn Reasoning> = if demo {
        Arc::new(demo_brain())
    } else {
        let command = config.brain_command.clone().unwrap_or_else(|| "claude".to_string());
        Arc::new(CommandBrain::new(&command)?)
    };

    let health_endpoint = AgentId::new();
    let host = Arc::new(WorkerHost::new(
        Arc::clone(&brain),
        bus.clone(),
        health_endpoint,
        config.heartbeat_interval(),
    ));

    // A corrupt registry snapshot halts task acceptance instead of
    // silently starting over with an empty pool.
    let registry = match store.load_registry() {
        Ok(snapshot) => snapshot.map(Registry::from_snapshot).unwrap_or_default(),
        Err(err) => {
            return Err(Error::Halted(format!("registry store unreadable: {}", err)));
        }
    };
    let hierarchy = Arc::new(
        HierarchyManager::with_registry(registry, &config, event_tx.clone())
            .with_spawner(Arc::clone(&host) as _),
    );

    let healing = HealingCoordinator::new(
        config.clone(),
        bus.clone(),
        Arc::clone(&hierarchy),
        health_endpoint,
    );
    let healing_cancel = healing.cancel_token();
    let healing_handle = healing.start().await;

    let task = Task::new(prompt, &whoami());
    tracing::info!(task = %task.id.short(), "task submitted");
    events::emit(&event_tx, events::EngineEvent::TaskSubmitted { task_id: task.id });

    let decomposer = Decomposer::new(Arc::clone(&brain), &config, event_tx.clone());
    let dag = decomposer.decompose(&task).await.map_err(Error::from)?;
    store.save_dag(&dag.snapshot())?;

    let mut executor =
        Executor::new(config.clone(), dag, Arc::clone(&hierarchy), bus.clone(), event_tx).await;

    let cancel = executor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let outcome = executor.execute().await;

    store.save_run(executor.run())?;
    store.save_dag(&executor.dag().snapshot())?;
    store.save_registry(&hierarchy.registry().read().await.snapshot())?;

    healing_cancel.cancel();
    let _ = healing_handle.await;
    bus.shutdown();
    host.kill_all().await;

    match outcome {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&json!({
                "task": task.id.to_string(),
                "run": executor.run().id.to_string(),
                "status": "completed",
                "output": output,
            }))?);
            Ok(())
        }
        Err(WorkflowError::Cancelled) => {
            println!("{}", serde_json::to_string_pretty(&json!({
                "task": task.id.to_string(),
                "run": executor.run().id.to_string(),
                "status": "cancelled",
            }))?);
            Ok(())
        }
        Err(err) => {
            // Partial results are part of the run record; surface them.
            println!("{}", serde_json::to_string_pretty(&json!({
                "task": task.id.to_string(),
                "run": executor.run().id.to_string(),
                "status": "failed",
                "error": err.to_string(),
                "partial_output": executor.run().result,
            }))?);
            Err(err.into())
        }
    }
}

fn show_status() -> Result<()> {
    let config = EngineConfig::load()?;
    let store = StateStore::open(config.state_dir()?)?;
    let mut runs = store.list_runs()?;
    runs.sort_by_key(|run| run.started_at);

    if runs.is_empty() {
        println!("no runs recorded");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {}  task {}  recoveries {}",
            run.id.short(),
            run.status,
            run.task_id.short(),
            run.recovery_log.len()
        );
    }
    Ok(())
}

fn show_config(init: bool) -> Result<()> {
    let path = EngineConfig::config_path()?;
    if init && !path.exists() {
        EngineConfig::default().save()?;
        println!("wrote {}", path.display());
    }
    let config = EngineConfig::load()?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// A scripted brain so `run --demo` exercises the whole engine without
/// an external agent binary.
fn demo_brain() -> ScriptedBrain {
    let brain = ScriptedBrain::new();
    brain.push_proposal(ScriptedPropose::Propose(linear_proposal(&[
        "gather",
        "analyze",
        "summarize",
    ])));
    brain.set_behavior("gather", NodeBehavior::succeed(json!({"sources": 3})));
    brain.set_behavior("analyze", NodeBehavior::succeed(json!({"findings": ["a", "b"]})));
    brain.set_behavior(
        "summarize",
        NodeBehavior::succeed(json!({"summary": "two findings across three sources"})),
    );
    brain
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "local".to_string())
}
