//! Troupe CLI - goal orchestration across role-specific workers
//!
//! Usage:
//!   troupe init [path]              Write a default .troupe/config.toml
//!   troupe plan <file>              Validate a plan and show its execution order
//!   troupe dry-run <file>           Run a plan through the kernel with scripted workers

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use troupe_agent::{RunKind, ScriptedReply, ScriptedRuntime};
use troupe_core::{KernelConfig, Plan};
use troupe_orchestrator::Kernel;
use troupe_planning::{execution_order, parse_plan, plan_to_wire};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "troupe")]
#[command(author, version, about = "Goal orchestration across role-specific workers")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init {
        /// Project path (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Parse and validate a plan file
    Plan {
        /// Plan file: JSON, or text containing a ```json block
        file: PathBuf,

        /// Print the normalized plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute a plan against scripted workers
    DryRun {
        /// Plan file: JSON, or text containing a ```json block
        file: PathBuf,

        /// Goal text handed to the kernel
        #[arg(long, default_value = "Dry run")]
        goal: String,

        /// Project path holding .troupe/config.toml
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Override max_concurrent_tasks
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Stop launching tasks after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Make this task's runs fail (repeatable)
        #[arg(long = "fail", value_name = "TASK")]
        fail: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays clean
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { path, force } => cmd_init(path, force).await,
        Commands::Plan { file, json } => cmd_plan(file, json).await,
        Commands::DryRun {
            file,
            goal,
            root,
            max_concurrent,
            fail_fast,
            fail,
        } => cmd_dry_run(file, goal, root, max_concurrent, fail_fast, fail).await,
    }
}

async fn cmd_init(path: PathBuf, force: bool) -> Result<()> {
    let config_path = path.join(".troupe/config.toml");
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    info!("Initializing Troupe in {:?}", path);
    KernelConfig::write_default(&path).context("Failed to write configuration")?;

    println!("Initialized Troupe in {:?}", path);
    println!("Created:");
    println!("  .troupe/config.toml");
    println!("\nNext steps:");
    println!("  1. Add [[roles]] entries for the workers you already have");
    println!("  2. Run 'troupe plan <file>' to check a plan");
    println!("  3. Run 'troupe dry-run <file>' to rehearse it");
    Ok(())
}

async fn read_plan(file: &Path) -> Result<(String, Plan)> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let plan = parse_plan(&raw).with_context(|| format!("Invalid plan in {}", file.display()))?;
    Ok((raw, plan))
}

async fn cmd_plan(file: PathBuf, json: bool) -> Result<()> {
    let (_, plan) = read_plan(&file).await?;
    let order = execution_order(&plan)?;

    if json {
        println!("{}", plan_to_wire(&plan)?);
        return Ok(());
    }

    println!("Plan: {}", plan.summary);
    println!("=====");
    for task in &plan.tasks {
        println!("  {} [{}] {}", task.id, task.role, task.title);
        if !task.depends_on.is_empty() {
            println!("      after: {}", task.depends_on.join(", "));
        }
    }

    println!("\nExecution order:");
    for (i, id) in order.iter().enumerate() {
        println!("  {}. {}", i + 1, id);
    }

    let roles = plan.roles();
    println!("\nRoles: {}", roles.join(", "));
    Ok(())
}

async fn cmd_dry_run(
    file: PathBuf,
    goal: String,
    root: PathBuf,
    max_concurrent: Option<usize>,
    fail_fast: bool,
    fail: Vec<String>,
) -> Result<()> {
    let (raw, plan) = read_plan(&file).await?;

    let mut config = KernelConfig::load_or_default(&root)?.with_poll_interval_ms(5);
    if let Some(max) = max_concurrent {
        config = config.with_max_concurrent_tasks(max);
    }
    if fail_fast {
        config = config.with_fail_fast(true);
    }

    let failing: HashSet<String> = fail.into_iter().collect();
    for id in &failing {
        if plan.task(id).is_none() {
            bail!("--fail {}: no such task in the plan", id);
        }
    }

    let runtime = Arc::new(ScriptedRuntime::new(move |req| match req.kind() {
        Some(RunKind::Plan) | Some(RunKind::PlanRepair) => ScriptedReply::complete(raw.clone()),
        Some(RunKind::RolePrompt) => {
            ScriptedReply::complete("You are a scripted worker used for dry runs.")
        }
        Some(RunKind::Summary) => ScriptedReply::complete("Dry run finished."),
        _ => match req.task_id() {
            Some(id) if failing.contains(id) => {
                ScriptedReply::fail(format!("task {} was told to fail", id))
            }
            Some(id) => ScriptedReply::complete(format!("{} done", id)),
            None => ScriptedReply::complete(""),
        },
    }));

    let kernel = Kernel::with_runtime(config, runtime).await?;
    info!("Dry run of {} tasks", plan.tasks.len());

    let result = kernel.execute(&goal).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    let metrics = kernel.metrics().snapshot().await;
    info!(
        "Attempts: {}, retries: {}, success rate: {:.0}%",
        metrics.task_attempts,
        metrics.task_retries,
        metrics.task_success_rate() * 100.0
    );

    if !result.is_success() {
        bail!(
            "goal failed: {}",
            result.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}
