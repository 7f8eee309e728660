//! Conductor
//!
//! Splits a coding task into role-specific subtasks and runs one worker
//! agent per subtask in its own git worktree.
//!
//! User-facing output uses writeln! to stdout; logs go to stderr.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use conductor_core::config::{self, Config};
use conductor_engine::console::spawn_console_responder;
use conductor_engine::orchestration::{ExecutionPlan, PlanResult, ProjectContext};
use conductor_engine::{Orchestrator, RunReport};

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about = "Conductor - parallel coding agents in isolated worktrees")]
struct Cli {
    /// Project (git repository) root
    #[arg(short = 'C', long, default_value = ".", env = "CONDUCTOR_PROJECT_DIR", global = true)]
    project_dir: PathBuf,

    /// Project kind passed to the worker prompt
    #[arg(long, default_value = "generic", env = "CONDUCTOR_PROJECT_TYPE", global = true)]
    project_type: String,

    /// Maximum concurrent agents (overrides config)
    #[arg(long, global = true)]
    max_agents: Option<usize>,

    /// Never prompt; pending decisions resolve to their default
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Log level filter (e.g. "info", "debug")
    #[arg(long, default_value = "info", env = "CONDUCTOR_LOG_LEVEL", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "CONDUCTOR_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show how a task would be split into phases
    Plan {
        task: String,
    },
    /// Decompose a task and spawn its agents
    Run {
        task: String,
        /// Keep monitoring agent health until every agent finished
        #[arg(long)]
        monitor: bool,
    },
    /// Show the session and resource usage
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Mark agents whose process is gone as stopped
    Reconcile,
    /// Run the health monitor until interrupted
    Monitor,
    /// Gracefully stop one agent
    Stop {
        pid: u32,
    },
    /// Continue paused agents (every paused agent without a pid)
    Resume {
        pid: Option<u32>,
    },
    /// Reconcile and remove leftovers of finished agents
    Cleanup,
    /// Archive the session and start fresh
    Archive,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("conductor_engine={0},conductor_core={0}", cli.log_level);
    conductor_core::tracing_init::init_tracing(&log_filter, cli.log_json);

    let project_dir = std::fs::canonicalize(&cli.project_dir)?;
    let mut config = config::load_config(Some(&project_dir))?;
    if let Some(n) = cli.max_agents {
        config.limits.max_agents = n;
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        project = %project_dir.display(),
        max_agents = config.limits.max_agents,
        "Starting conductor"
    );

    let project = ProjectContext::new(cli.project_type.clone(), &project_dir);
    let orchestrator = Orchestrator::new(&config, project);
    let mut out = io::stdout();

    match cli.command {
        Commands::Plan { task } => {
            write_plan(&mut out, &orchestrator.plan(&task))?;
        }
        Commands::Run { task, monitor } => {
            let report = orchestrator.run(&task).await?;
            write_run(&mut out, &report)?;
            if monitor {
                supervise(&orchestrator, &config, cli.non_interactive, true).await?;
            }
        }
        Commands::Status { json } => {
            let status = orchestrator.status().await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&status)?)?;
            } else {
                let s = &status.session;
                writeln!(out, "Session {} ({:?})", s.id, s.status)?;
                writeln!(out, "Task: {}", s.task_description)?;
                writeln!(
                    out,
                    "{:<36}  {:<8}  {:<8}  {:<10}  {:<6}",
                    "AGENT", "ROLE", "PID", "STATUS", "DIRECT"
                )?;
                for a in &s.agents {
                    writeln!(
                        out,
                        "{:<36}  {:<8}  {:<8}  {:<10}  {:<6}",
                        a.id,
                        a.role.to_string(),
                        a.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                        if a.paused { "paused".to_string() } else { a.status.to_string() },
                        if a.executed_directly { "yes" } else { "no" },
                    )?;
                }
                let r = &status.resources;
                writeln!(
                    out,
                    "Agents {}/{}  memory {} MB  disk {} MB  load {:.2}",
                    r.active_agents, r.max_agents, r.memory_usage_mb, r.disk_usage_mb, r.system_load
                )?;
            }
        }
        Commands::Reconcile => {
            let report = orchestrator.reconcile().await?;
            if report.is_empty() {
                writeln!(out, "Session already consistent.")?;
            } else {
                writeln!(
                    out,
                    "Stopped {} dead agent(s), closed {} orphaned record(s).",
                    report.stopped.len(),
                    report.orphaned.len()
                )?;
            }
        }
        Commands::Monitor => {
            supervise(&orchestrator, &config, cli.non_interactive, false).await?;
        }
        Commands::Stop { pid } => {
            orchestrator.stop(pid).await?;
            writeln!(out, "Stopped agent with pid {pid}.")?;
        }
        Commands::Resume { pid } => {
            let resumed = orchestrator.resume(pid).await?;
            if resumed.is_empty() {
                writeln!(out, "No paused agents.")?;
            }
            for agent in &resumed {
                writeln!(out, "Resumed {} ({})", agent.id, agent.role)?;
            }
        }
        Commands::Cleanup => {
            let report = orchestrator.sweep().await?;
            writeln!(
                out,
                "Released {} workspace(s), removed {} orphan(s).",
                report.released.len(),
                report.orphans.len()
            )?;
            for step in report.cleanup.unsuccessful() {
                writeln!(out, "  {}: {:?}", step.step, step.status)?;
            }
        }
        Commands::Archive => {
            let path = orchestrator.archive().await?;
            writeln!(out, "Archived session to {}", path.display())?;
        }
    }

    Ok(())
}

/// Run the health loop until a shutdown signal, or until no agent is left
/// when `until_idle` is set. Workers are never stopped here.
async fn supervise(
    orchestrator: &Orchestrator,
    config: &Config,
    non_interactive: bool,
    until_idle: bool,
) -> anyhow::Result<()> {
    let responder = (!non_interactive).then(|| spawn_console_responder(orchestrator.interrupts().clone()));
    let mut timer = orchestrator.start_monitor();

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let idle = async {
        if !until_idle {
            std::future::pending::<()>().await;
        }
        let mut tick = tokio::time::interval(config.monitor.poll_interval().max(Duration::from_secs(1)));
        loop {
            tick.tick().await;
            match orchestrator.complete_if_idle().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Idle check failed"),
            }
        }
    };

    tokio::select! {
        () = idle => info!("Every agent finished"),
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, stopping monitor"),
        _ = sigterm_future => info!("Received SIGTERM, stopping monitor"),
    }

    timer.cancel().await;
    if let Some(handle) = responder {
        handle.abort();
    }
    info!("Monitor stopped; agents keep running");
    Ok(())
}

fn write_plan(out: &mut impl Write, plan: &ExecutionPlan) -> io::Result<()> {
    if let Some(task_type) = plan.task_type {
        writeln!(out, "Task type: {task_type}")?;
    }
    for phase in &plan.phases {
        writeln!(out, "Phase {}:", phase.index + 1)?;
        for s in &phase.subtasks {
            let deps = if s.dependencies.is_empty() {
                String::new()
            } else {
                let deps: Vec<&str> = s.dependencies.iter().map(String::as_str).collect();
                format!(" (after {})", deps.join(", "))
            };
            writeln!(out, "  [{}] {}{deps}", s.role, s.id)?;
        }
    }
    if !plan.unscheduled.is_empty() {
        writeln!(out, "Unschedulable (dependency cycle): {}", plan.unscheduled_ids().join(", "))?;
    }
    Ok(())
}

fn write_run(out: &mut impl Write, report: &RunReport) -> io::Result<()> {
    writeln!(out, "Session {}", report.session_id)?;
    write_plan(out, &report.plan)?;
    write_result(out, &report.result)?;
    if let Some(deadlock) = &report.deadlock {
        writeln!(out, "Deadlock resolution: {}", deadlock.option)?;
    }
    Ok(())
}

fn write_result(out: &mut impl Write, result: &PlanResult) -> io::Result<()> {
    let succeeded = result.succeeded();
    writeln!(out, "Started: {}", if succeeded.is_empty() { "-".to_string() } else { succeeded.join(", ") })?;
    for phase in &result.phases {
        for failed in &phase.failed {
            writeln!(out, "Failed: {} ({})", failed.id, failed.reason)?;
        }
    }
    if !result.not_started.is_empty() {
        writeln!(out, "Not started: {}", result.not_started.join(", "))?;
    }
    Ok(())
}
