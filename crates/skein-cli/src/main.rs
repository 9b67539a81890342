//! skein CLI - manager を 1 プロセス内で動かすデモ
//!
//! ```text
//! skein run --tasks 5 --workers 2
//! skein workflow --fail-step extract
//! skein --config skein.toml health
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use skein_core::domain::{TaskArgs, TaskPriority};
use skein_core::observability::init_tracing;
use skein_core::typed::{Handler, HandlerError, TypedTask};
use skein_core::workflow::WorkflowStep;
use skein_core::{ManagerBuilder, ManagerConfig, TaskQueueManager, TaskRequest};

#[derive(Parser)]
#[command(name = "skein", about = "In-process task queue demo")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Default log filter (RUST_LOG overrides it)
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit greeting tasks and print their results
    Run {
        /// Number of tasks
        #[arg(long, default_value_t = 3)]
        tasks: usize,
        /// Number of workers on the default queue
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Failures before each greeting succeeds (exercises retries)
        #[arg(long, default_value_t = 0)]
        flaky: u32,
    },
    /// Run an extract -> (clean, stats) -> report workflow
    Workflow {
        /// Step that should fail
        #[arg(long)]
        fail_step: Option<String>,
    },
    /// Print the health report
    Health,
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
}

impl TypedTask for Greet {
    const NAME: &'static str = "demo.greet.v1";
    type Output = String;
}

/// 指定回数だけ失敗してから成功する
struct GreetHandler {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl Handler<Greet> for GreetHandler {
    async fn handle(&self, task: Greet) -> Result<String, HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!(
                "intentional failure (left={left})"
            )));
        }
        Ok(format!("Hello, {}!", task.name))
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ManagerConfig> {
    Ok(match path {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::default(),
    })
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run {
            tasks,
            workers,
            flaky,
        } => cmd_run(config, tasks, workers, flaky).await,
        Command::Workflow { fail_step } => cmd_workflow(config, fail_step).await,
        Command::Health => {
            let manager = ManagerBuilder::new().config(config).build()?;
            manager.start_worker("worker-1", "default", false)?;
            print_json(&manager.health_check().await)?;
            manager.shutdown().await;
            Ok(())
        }
        Command::Config => print_json(&config),
    }
}

async fn cmd_run(
    config: ManagerConfig,
    tasks: usize,
    workers: usize,
    flaky: u32,
) -> anyhow::Result<()> {
    let task_config = config
        .default_task
        .clone()
        .with_retries(flaky, Duration::from_millis(100));
    let queue_name = task_config.queue_name.clone();

    let manager = ManagerBuilder::new()
        .config(config)
        .register_typed::<Greet, _>(GreetHandler {
            remaining_failures: AtomicU32::new(flaky),
        })?
        .expect_tasks(&[Greet::NAME])
        .build()?;

    for n in 0..workers.max(1) {
        manager.start_worker(format!("worker-{}", n + 1), &queue_name, false)?;
    }

    let mut ids = Vec::with_capacity(tasks);
    for n in 0..tasks {
        let priority = match n % 3 {
            0 => TaskPriority::Low,
            1 => TaskPriority::Normal,
            _ => TaskPriority::High,
        };
        let request = TaskRequest::typed(&Greet {
            name: format!("skein-{n}"),
        })?
        .with_config(task_config.clone().with_priority(priority));
        ids.push(manager.submit_task(request).await);
    }
    info!(submitted = ids.len(), "waiting for results");

    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
        results.push(manager.get_task_result(id, Duration::from_secs(10)).await?);
    }
    print_json(&results)?;
    print_json(&manager.stats().await)?;

    manager.shutdown().await;
    Ok(())
}

fn step_handler(
    manager: &TaskQueueManager,
    name: &'static str,
    fail: bool,
) -> anyhow::Result<()> {
    manager.register_fn(name, move |args: TaskArgs| async move {
        if fail {
            return Err(HandlerError::new(format!("{name} failed on purpose")));
        }
        Ok(json!({ "step": name, "input": args.positional(0).cloned().unwrap_or(Value::Null) }))
    })?;
    Ok(())
}

async fn cmd_workflow(config: ManagerConfig, fail_step: Option<String>) -> anyhow::Result<()> {
    let manager = ManagerBuilder::new().config(config).build()?;
    for name in ["extract", "clean", "stats", "report"] {
        step_handler(&manager, name, fail_step.as_deref() == Some(name))?;
    }

    let steps: Vec<WorkflowStep> = vec![
        manager
            .workflow_step("extract", "extract")?
            .with_args(TaskArgs::new().arg("input.csv")),
        manager
            .workflow_step("clean", "clean")?
            .depends_on(["extract"]),
        manager
            .workflow_step("stats", "stats")?
            .depends_on(["extract"]),
        manager
            .workflow_step("report", "report")?
            .depends_on(["clean", "stats"]),
    ];
    let workflow = manager.new_workflow("etl", steps)?;
    let id = manager.submit_workflow(workflow);

    let view = manager
        .wait_for_workflow(id, Duration::from_secs(10))
        .await?;
    print_json(&view)?;
    Ok(())
}
