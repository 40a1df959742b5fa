use std::path::PathBuf;

use clap::{Parser, Subcommand};

use hive::commands::{
    self, default_collect_dir, run_cleanup, run_collect, run_kill, run_spawn, run_status, run_sync,
};
use hive::distribute::DistributionMode;
use hive::gitsync::SyncOptions;
use hive::instance::GitOptions;
use hive::{hlog, Result};

/// Hive - sandboxed swarm orchestrator for parallel coding agents
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    HIVE_DEBUG=1      Enable debug logging (alternative to --debug)\n    HIVE_API_KEY      Sandbox provider API key\n    HIVE_API_BASE     Sandbox provider base URL\n    HIVE_AGENT_KEY    API key forwarded to agents inside sandboxes\n    GITHUB_TOKEN      Used for git pushes and PR creation"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.hive/hive.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Spawn a swarm of sandboxed agents over a task list
    Spawn {
        /// Git remote URL, or a local directory with --local
        source: String,

        /// Treat SOURCE as a local directory to upload
        #[arg(long)]
        local: bool,

        /// Branch to clone (repo sources only)
        #[arg(long)]
        branch: Option<String>,

        /// Branch to create before syncing changes back
        #[arg(long)]
        new_branch: Option<String>,

        /// Task source: inline JSON, a file, a directory, or a named list
        #[arg(long, default_value = "tasks")]
        tasks: String,

        /// Number of instances to spawn
        #[arg(long, short = 'n', default_value_t = 1)]
        count: usize,

        /// Task distribution mode: all, round-robin, or by-dependency
        #[arg(long, default_value = "round-robin")]
        mode: DistributionMode,

        /// Glob-ish patterns to exclude from local uploads (repeatable)
        #[arg(long)]
        exclude: Vec<String>,

        /// Patterns to re-include past the default excludes (repeatable)
        #[arg(long)]
        include: Vec<String>,

        /// Commit agent changes automatically during sync
        #[arg(long)]
        commit: bool,

        /// Push agent changes automatically during sync
        #[arg(long)]
        push: bool,

        /// Open a pull request automatically during sync
        #[arg(long)]
        create_pr: bool,

        /// Title for commits and pull requests
        #[arg(long)]
        pr_title: Option<String>,

        /// Base branch for pull requests
        #[arg(long)]
        pr_base: Option<String>,
    },

    /// Reconcile and show instance status
    Status {
        /// Instance id prefix or status name to filter by
        filter: Option<String>,
    },

    /// Collect agent output and task results into a directory
    Collect {
        /// Instance id prefix or status name to filter by
        filter: Option<String>,

        /// Directory to write per-instance results into
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Kill matching instances and their sandboxes
    Kill {
        /// Instance id prefix or status name to filter by
        filter: Option<String>,
    },

    /// Commit, push, and open PRs for completed repo-sourced instances
    Sync {
        /// Instance id prefix or status name to filter by
        filter: Option<String>,

        /// Commit changes
        #[arg(long)]
        commit: bool,

        /// Push changes
        #[arg(long)]
        push: bool,

        /// Open a pull request
        #[arg(long)]
        create_pr: bool,
    },

    /// Prune old terminal instances from persisted state
    Cleanup {
        /// Retention age in days (default 7)
        #[arg(long)]
        days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    hive::log::init_with_debug(cli.debug);
    hlog!("hive starting");

    match cli.command {
        Command::Spawn {
            source,
            local,
            branch,
            new_branch,
            tasks,
            count,
            mode,
            exclude,
            include,
            commit,
            push,
            create_pr,
            pr_title,
            pr_base,
        } => {
            run_spawn(commands::SpawnArgs {
                source,
                local,
                branch,
                new_branch,
                task_source: tasks,
                count,
                mode,
                exclude,
                include,
                git: GitOptions {
                    auto_commit: commit,
                    auto_push: push,
                    create_pr,
                    pr_title,
                    pr_base,
                },
            })
            .await
        }
        Command::Status { filter } => run_status(filter).await,
        Command::Collect { filter, output } => {
            let dir = match output {
                Some(dir) => dir,
                None => default_collect_dir()?,
            };
            run_collect(dir, filter).await
        }
        Command::Kill { filter } => run_kill(filter).await,
        Command::Sync {
            filter,
            commit,
            push,
            create_pr,
        } => {
            run_sync(
                filter,
                SyncOptions {
                    commit,
                    push,
                    create_pr,
                },
            )
            .await
        }
        Command::Cleanup { days } => run_cleanup(days).await,
    }
}
