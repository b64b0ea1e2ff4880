use anyhow::{Context, Result, bail};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use task_review::cli::{self, Commands, DiffArgs, RunArgs, StatArgs};
use task_review::config::{self, Config};
use task_review::controller::ReviewController;
use task_review::document::FsDocument;
use task_review::review::{TaskReview, build_task_diffs};
use task_review::snapshot::{FsWorkspace, Snapshot};
use task_review::stat::diff_stat;
use task_review::{ChangeType, FileAction, FileDiff, TaskId};

const AGENT_TASK: TaskId = 1;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    let config_path = args.config.clone().unwrap_or_else(config::default_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    init_tracing(&config);

    match args.command {
        Commands::Diff(diff_args) => handle_diff(&diff_args)?,
        Commands::Stat(stat_args) => handle_stat(&stat_args)?,
        Commands::Run(run_args) => handle_run(&run_args, &config).await?,
    }

    Ok(())
}

/// Log to stderr; `RUST_LOG` wins over the configured filter.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Read a file, treating a missing file as absent.
fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn handle_diff(args: &DiffArgs) -> Result<()> {
    let before = read_optional(&args.before)?;
    let after = read_optional(&args.after)?;
    if before.is_none() && after.is_none() {
        bail!(
            "neither {} nor {} exists",
            args.before.display(),
            args.after.display()
        );
    }

    let label = args.after.display().to_string();
    let baseline: Snapshot = before.map(|c| (label.clone(), c)).into_iter().collect();
    let current: Snapshot = after.map(|c| (label.clone(), c)).into_iter().collect();
    let files = build_task_diffs(&baseline, &current);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }
    if files.is_empty() {
        println!("No changes");
        return Ok(());
    }
    for file in &files {
        print_file_diff(file);
    }
    Ok(())
}

fn handle_stat(args: &StatArgs) -> Result<()> {
    let before = read_optional(&args.before)?.unwrap_or_default();
    let after = read_optional(&args.after)?.unwrap_or_default();
    let stat = diff_stat(&before, &after);
    println!("{} insertions(+), {} deletions(-)", stat.added, stat.removed);
    Ok(())
}

/// Run the command as the agent, then apply the requested decision.
async fn handle_run(args: &RunArgs, config: &Config) -> Result<()> {
    let Some((program, program_args)) = args.command.split_first() else {
        bail!("no command given");
    };
    let dir = args
        .dir
        .canonicalize()
        .with_context(|| format!("workspace {} not found", args.dir.display()))?;
    let interval = args
        .interval
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.interval());

    let workspace = Arc::new(FsWorkspace::new(&dir, config.ignore.clone()));
    let document = Arc::new(FsDocument::new(&dir));
    let mut controller = ReviewController::new(workspace, document)
        .with_interval(interval)
        .with_change_detection(config.change_detection);

    let agent = tokio::process::Command::new(program)
        .args(program_args)
        .current_dir(&dir)
        .status();
    let status = controller
        .supervise(AGENT_TASK, agent)
        .await
        .context("task review failed")?
        .with_context(|| format!("failed to run {program}"))?;
    if !status.success() {
        warn!(%status, "agent command exited unsuccessfully");
    }

    if args.keep_all {
        controller.keep_all().await.context("keep all failed")?;
    } else if args.revert_all {
        controller.revert_all().await.context("revert all failed")?;
    } else {
        for path in &args.revert {
            controller
                .revert_file(path)
                .await
                .with_context(|| format!("revert {path} failed"))?;
        }
    }
    info!(status = ?controller.review().status, "review complete");

    if args.json {
        println!("{}", serde_json::to_string_pretty(controller.review())?);
    } else {
        print_review(controller.review());
    }
    Ok(())
}

fn print_review(review: &TaskReview) {
    let summary = review.summary();
    if summary.total_files == 0 {
        println!("No changes to review");
        return;
    }
    println!("Task review: {:?}", summary.status);
    println!(
        "  Files:   {} ({} pending)",
        summary.total_files, summary.files_pending
    );
    println!(
        "  Blocks:  {} ({} pending, {} kept, {} reverted)",
        summary.total_blocks, summary.pending, summary.kept, summary.reverted
    );
    println!("  Changes: +{} -{}", summary.stat.added, summary.stat.removed);
    println!();
    for file in &review.files {
        println!(
            "  {} {}  +{} -{}  [{}]",
            change_marker(file.change_type),
            file.path,
            file.stat.added,
            file.stat.removed,
            action_label(file.action())
        );
    }
}

fn print_file_diff(file: &FileDiff) {
    println!(
        "{} {} (+{} -{})",
        change_marker(file.change_type),
        file.path,
        file.stat.added,
        file.stat.removed
    );
    for block in &file.blocks {
        println!(
            "@@ -{},{} +{},{} @@ {}",
            block.before_start + 1,
            block.before_lines.len(),
            block.after_start + 1,
            block.after_lines.len(),
            block.id
        );
        for line in &block.before_lines {
            println!("-{line}");
        }
        for line in &block.after_lines {
            println!("+{line}");
        }
    }
}

fn change_marker(change_type: ChangeType) -> char {
    match change_type {
        ChangeType::Added => 'A',
        ChangeType::Deleted => 'D',
        ChangeType::Modified => 'M',
    }
}

fn action_label(action: FileAction) -> &'static str {
    match action {
        FileAction::Pending => "pending",
        FileAction::Kept => "kept",
        FileAction::Reverted => "reverted",
        FileAction::Mixed => "mixed",
    }
}

