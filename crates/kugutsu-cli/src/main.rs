//! CLI entry point: parses arguments, loads and validates configuration,
//! reads a pre-planned task list, and drives a `PipelineCoordinator` run
//! through to completion.

mod observer;
mod shell_agent;
mod task_file;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use kugutsu_core::{resolve_tasks, PipelineConfig, PipelineCoordinator};
use kugutsu_git::WorktreeManager;
use tracing_subscriber::EnvFilter;

use observer::StdoutObserver;
use shell_agent::{AutoApproveReviewAgent, ShellEngineerFactory};

/// Runs a multi-agent Develop/Review/Merge pipeline over one git repository.
#[derive(Parser, Debug)]
#[command(name = "kugutsu", version, about)]
struct Args {
    /// Free-text description of the work to plan and execute. Ignored by the
    /// fixture task source beyond being echoed into logs; required unless
    /// `--cleanup` is given.
    #[arg(required_unless_present = "cleanup")]
    user_request: Option<String>,

    /// JSON file holding the pre-planned task list, in place of the (out of
    /// scope) planning agent.
    #[arg(long, default_value = "tasks.json")]
    tasks: PathBuf,

    /// Shell command run inside each task's worktree as the development
    /// step, in place of a real coding agent.
    #[arg(long, default_value = "true")]
    agent_command: String,

    #[arg(long)]
    max_engineers: Option<u32>,

    #[arg(long)]
    max_turns: Option<u32>,

    #[arg(long)]
    base_branch: Option<String>,

    #[arg(long)]
    base_repo: Option<PathBuf>,

    #[arg(long)]
    worktree_base: Option<PathBuf>,

    #[arg(long)]
    use_remote: bool,

    /// Sweep `--worktree-base` of every task worktree and exit, without
    /// running the pipeline. For recovering disk after a killed run.
    #[arg(long)]
    cleanup: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("kugutsu: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let base_repo = match args.base_repo.clone() {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let worktree_base = args
        .worktree_base
        .clone()
        .unwrap_or_else(|| base_repo.join(".kugutsu").join("worktrees"));

    if args.cleanup {
        let base_branch = args.base_branch.clone().unwrap_or_else(|| "main".to_string());
        let worktrees = WorktreeManager::new(base_repo, worktree_base, base_branch);
        worktrees.cleanup_all_task_worktrees()?;
        println!("kugutsu: cleaned up task worktrees");
        return Ok(ExitCode::SUCCESS);
    }

    let mut defaults = PipelineConfig::defaults(base_repo.clone(), worktree_base.clone());
    if let Some(v) = args.max_engineers {
        defaults.max_concurrent_engineers = v;
    }
    if let Some(v) = args.max_turns {
        defaults.max_turns = v;
    }
    if let Some(v) = &args.base_branch {
        defaults.base_branch = v.clone();
    }
    defaults.use_remote = args.use_remote;

    let config = PipelineConfig::load_merged(defaults)?;
    config.validate()?;

    let user_request = args.user_request.as_deref().unwrap_or_default();
    let raw_output = task_file::load(&args.tasks)?;
    let tasks = resolve_tasks(&raw_output)?;

    println!(
        "kugutsu: planning \"{user_request}\" -> {} task(s) ({})",
        tasks.len(),
        raw_output.summary
    );

    let worktrees = Arc::new(WorktreeManager::new(
        config.base_repo.clone(),
        config.worktree_base.clone(),
        config.base_branch.clone(),
    ));
    worktrees.git().validate_repo(&config.base_repo)?;

    let factory = Arc::new(ShellEngineerFactory::new(args.agent_command.clone()));
    let reviewer = Arc::new(AutoApproveReviewAgent);
    let observer = Arc::new(StdoutObserver);

    let mut coordinator = PipelineCoordinator::new(
        worktrees,
        factory,
        reviewer,
        observer,
        config.max_concurrent_engineers as usize,
        config.max_dev_retries,
        config.max_review_retries,
        config.max_merge_retries,
    );

    coordinator.initialize(tasks)?;
    coordinator.start()?;
    coordinator.wait_for_completion().await;

    let failed = coordinator.failed_tasks();
    let completed = coordinator.reporter().completed_count();
    let total = coordinator.reporter().total();

    coordinator.cleanup(true);

    println!("kugutsu: {completed}/{total} tasks merged, {} failed", failed.len());
    for (task_id, title) in &failed {
        println!("  failed: {title} ({task_id})");
    }

    if failed.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
