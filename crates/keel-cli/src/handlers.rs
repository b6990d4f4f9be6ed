//! Command handlers.

use crate::config::SystemDefinition;
use keel_agent::{AgentService, RecipeExecutor};
use keel_bus::FnListener;
use keel_core::events::{Event, EventKind, EventPayload};
use keel_core::ids::ProjectId;
use keel_core::result::{BuildResult, ResultState};
use keel_core::revision::Revision;
use keel_master::{InMemoryStore, MasterServer};
use keel_scm::LocalScm;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

type CliResult = Result<(), Box<dyn std::error::Error>>;

struct System {
    server: Arc<MasterServer>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl System {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn load(path: Option<PathBuf>) -> Result<SystemDefinition, Box<dyn std::error::Error>> {
    let path = SystemDefinition::resolve_path(path)?;
    let system = SystemDefinition::load(&path)?;
    let problems = system.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("  - {}", problem);
        }
        return Err(format!("{} has {} problem(s)", path.display(), problems.len()).into());
    }
    Ok(system)
}

/// Start the master and every local agent.
async fn start(definition: SystemDefinition) -> Result<System, Box<dyn std::error::Error>> {
    let scm = Arc::new(LocalScm::new());
    let store = Arc::new(InMemoryStore::new());
    for resource in definition.resources {
        store.add_resource(resource).await;
    }

    let server = Arc::new(MasterServer::new(definition.master, scm.clone(), store));
    for project in definition.projects {
        server.add_project(project.project, project.triggers).await?;
    }

    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    for agent in &definition.agents {
        let executor = RecipeExecutor::new(agent)?.with_scm(scm.clone());
        let endpoint = server.connect_agent(&agent.name, agent.capabilities.clone());
        info!(agent_id = %endpoint.id, name = %agent.name, "Local agent started");
        let service = AgentService::new(executor);
        tasks.push(tokio::spawn(service.run(
            endpoint.inbound,
            endpoint.outbound,
            shutdown_rx.clone(),
        )));
    }

    let master = Arc::clone(&server);
    let master_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        master.run(master_shutdown).await;
    }));

    Ok(System {
        server,
        shutdown,
        tasks,
    })
}

pub fn validate(path: Option<PathBuf>) -> CliResult {
    let system = load(path)?;
    println!(
        "✓ {} project(s), {} agent(s), {} resource(s)",
        system.projects.len(),
        system.agents.len(),
        system.resources.len()
    );
    Ok(())
}

pub async fn run(path: Option<PathBuf>) -> CliResult {
    let system = start(load(path)?).await?;
    println!("Keel running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    system.stop().await;
    Ok(())
}

pub async fn build(
    path: Option<PathBuf>,
    project: String,
    revision: Option<String>,
    timeout_secs: u64,
    json: bool,
) -> CliResult {
    let system = start(load(path)?).await?;

    let (tx, mut completed) = mpsc::unbounded_channel::<BuildResult>();
    system.server.bus().subscribe(
        &[EventKind::BuildCompleted],
        Arc::new(FnListener::new("cli", move |event: &Event| {
            if let EventPayload::BuildCompleted { build } = &event.payload {
                let _ = tx.send(build.clone());
            }
            Ok(())
        })),
    );

    let build_id = system
        .server
        .request_build(&ProjectId::new(project), revision.map(Revision::new))
        .await?;
    println!("Build {} started", build_id);

    let wait = async {
        while let Some(build) = completed.recv().await {
            if build.id == build_id {
                return Some(build);
            }
        }
        None
    };
    let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), wait).await;
    system.stop().await;

    let build = match outcome {
        Ok(Some(build)) => build,
        Ok(None) => return Err("master stopped before the build finished".into()),
        Err(_) => return Err(format!("build {} did not finish in {}s", build_id, timeout_secs).into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&build)?);
    } else {
        print_build(&build);
    }

    if build.state == ResultState::Success {
        Ok(())
    } else {
        Err(format!("build {} finished with state '{}'", build.id, build.state).into())
    }
}

fn print_build(build: &BuildResult) {
    println!("Build {} of {} at {}: {}", build.id, build.project, build.revision, build.state);
    for stage in &build.stages {
        println!("  {} ({}): {}", stage.name, stage.recipe.recipe, stage.recipe.state);
        if let Some(error) = &stage.recipe.error {
            println!("    error: {}", error);
        }
        for command in &stage.recipe.commands {
            let exit = command
                .exit_code
                .map(|c| format!(" (exit {})", c))
                .unwrap_or_default();
            println!("    {}: {}{}", command.name, command.state, exit);
            for feature in &command.features {
                println!("      > {}", feature);
            }
        }
    }
}
