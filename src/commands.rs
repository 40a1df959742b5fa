//! Command layer: thin composition of loader, distributor, manager,
//! state store, and git sync per operator action.
//!
//! Batch commands degrade gracefully: per-instance failures are
//! recorded on the instance and counted, and the process exit status
//! reflects whether the command itself ran, not whether every instance
//! succeeded. Task-loading and configuration errors are fatal since no
//! per-instance isolation exists before instances are created.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cleanup::{prune_state, PruneSummary, DEFAULT_RETENTION_DAYS};
use crate::config::Config;
use crate::distribute::{distribute_tasks, DistributionMode};
use crate::gitsync::{GitSync, SyncOptions};
use crate::instance::{GitOptions, InstanceStatus, SourceType, SwarmInstance};
use crate::sandbox::HttpSandbox;
use crate::state::{StateStore, SwarmState};
use crate::swarm::{SpawnOptions, SwarmManager};
use crate::tasks::{load_tasks, validate_tasks};
use crate::{hlog, hlog_error, hlog_warn, Error, Result};

const DEFAULT_API_BASE: &str = "http://127.0.0.1:8700";

/// Everything `hive spawn` needs, already parsed.
#[derive(Debug, Clone)]
pub struct SpawnArgs {
    pub source: String,
    pub local: bool,
    pub branch: Option<String>,
    pub new_branch: Option<String>,
    pub task_source: String,
    pub count: usize,
    pub mode: DistributionMode,
    pub exclude: Vec<String>,
    pub include: Vec<String>,
    pub git: GitOptions,
}

fn build_manager(config: &Config) -> Result<SwarmManager> {
    let api_key = config.require_api_key()?.to_string();
    let base = config
        .api_base
        .clone()
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    let api = Arc::new(HttpSandbox::new(&base, &api_key));
    Ok(SwarmManager::new(api, config.clone()))
}

/// Merge updated instance records into a state document by id,
/// appending records the document has never seen.
fn merge_instances(state: &mut SwarmState, updated: &[SwarmInstance]) {
    for inst in updated {
        match state.instances.iter_mut().find(|i| i.id == inst.id) {
            Some(slot) => *slot = inst.clone(),
            None => state.instances.push(inst.clone()),
        }
    }
}

/// Persist updated instances under optimistic concurrency: reload,
/// merge, save, and retry on a version conflict.
fn persist(store: &StateStore, updated: &[SwarmInstance]) -> Result<()> {
    let mut last = None;
    for _ in 0..3 {
        let mut fresh = store.load();
        merge_instances(&mut fresh, updated);
        match store.save(&mut fresh) {
            Ok(()) => return Ok(()),
            Err(e @ Error::StateConflict { .. }) => {
                hlog_warn!("persist: state conflict, retrying");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| Error::Sandbox("state save retries exhausted".into())))
}

fn print_instance_line(inst: &SwarmInstance) {
    let detail = inst
        .error
        .as_deref()
        .map(|e| format!("  ({})", e))
        .unwrap_or_default();
    println!(
        "{}  {:<12} {:<5} tasks={}{}",
        inst.short_id(),
        inst.status.to_string(),
        inst.source_type.to_string(),
        inst.tasks.len(),
        detail
    );
}

/// Spawn a batch of instances across sandboxes.
pub async fn run_spawn(args: SpawnArgs) -> Result<()> {
    Config::ensure_dirs()?;
    let config = Config::load()?;

    if args.count == 0 {
        return Err(Error::Validation("instance count must be at least 1".into()));
    }
    if args.count > config.max_instances {
        return Err(Error::Config(format!(
            "requested {} instances, max_instances is {}",
            args.count, config.max_instances
        )));
    }

    let raw = load_tasks(&args.task_source)?;
    let tasks = validate_tasks(raw)?;
    let buckets = distribute_tasks(&tasks, args.count, args.mode);

    let manager = build_manager(&config)?;
    let opts = SpawnOptions {
        source: args.source.clone(),
        source_type: if args.local {
            SourceType::Local
        } else {
            SourceType::Repo
        },
        branch: args.branch.clone(),
        new_branch: args.new_branch.clone(),
        buckets,
        exclude: args.exclude.clone(),
        include: args.include.clone(),
        git: args.git.clone(),
    };

    hlog!(
        "spawn: {} tasks across {} instances (mode={})",
        tasks.len(),
        args.count,
        args.mode
    );
    let instances = manager.spawn(&opts).await?;

    let store = StateStore::at_default_path()?;
    persist(&store, &instances)?;

    let running = instances
        .iter()
        .filter(|i| i.status == InstanceStatus::Running)
        .count();
    for inst in &instances {
        print_instance_line(inst);
    }
    println!(
        "spawned {} instances: {} running, {} failed",
        instances.len(),
        running,
        instances.len() - running
    );
    Ok(())
}

/// Reconcile and print matching instances.
///
/// Instances are checked sequentially for deterministic output ordering
/// and to avoid hammering the sandbox API.
pub async fn run_status(filter: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let store = StateStore::at_default_path()?;
    let mut state = store.load();

    let indices = state.matching_indices(filter.as_deref());
    if indices.is_empty() {
        println!("no instances match");
        return Ok(());
    }

    let manager = build_manager(&config)?;
    let mut updated = Vec::new();
    for idx in indices {
        let inst = &mut state.instances[idx];
        if let Err(e) = manager.check_instance(inst).await {
            hlog_error!("status: check failed for {}: {}", inst.short_id(), e);
        }
        print_instance_line(inst);
        updated.push(inst.clone());
    }
    persist(&store, &updated)?;

    let completed = updated
        .iter()
        .filter(|i| i.status == InstanceStatus::Completed)
        .count();
    let failed = updated
        .iter()
        .filter(|i| i.status == InstanceStatus::Failed)
        .count();
    println!(
        "{} instances: {} completed, {} failed, {} in flight",
        updated.len(),
        completed,
        failed,
        updated.len() - completed - failed
    );
    Ok(())
}

/// Reconcile, collect results into per-instance files, and write a
/// summary document.
pub async fn run_collect(output_dir: PathBuf, filter: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let store = StateStore::at_default_path()?;
    let mut state = store.load();

    let indices = state.matching_indices(filter.as_deref());
    if indices.is_empty() {
        println!("no instances match");
        return Ok(());
    }

    std::fs::create_dir_all(&output_dir)?;
    let manager = build_manager(&config)?;

    let mut updated = Vec::new();
    let mut collected = 0usize;
    let mut errors = 0usize;
    let mut summary_rows = Vec::new();

    for idx in indices {
        let inst = &mut state.instances[idx];
        if let Err(e) = manager.check_instance(inst).await {
            hlog_error!("collect: check failed for {}: {}", inst.short_id(), e);
        }
        match manager.collect_results(inst).await {
            Ok(result) => {
                let done = result
                    .tasks
                    .iter()
                    .filter(|t| t.status == crate::tasks::TaskStatus::Completed)
                    .count();
                let path = output_dir.join(format!("{}.json", inst.short_id()));
                std::fs::write(&path, serde_json::to_string_pretty(&result)?)?;
                summary_rows.push(serde_json::json!({
                    "id": inst.id,
                    "status": inst.status,
                    "tasksCompleted": done,
                    "tasksTotal": result.tasks.len(),
                }));
                collected += 1;
            }
            Err(e) => {
                hlog_error!("collect: {} failed: {}", inst.short_id(), e);
                errors += 1;
            }
        }
        updated.push(inst.clone());
    }

    let summary = serde_json::json!({
        "total": updated.len(),
        "collected": collected,
        "errors": errors,
        "instances": summary_rows,
    });
    std::fs::write(
        output_dir.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;
    persist(&store, &updated)?;

    println!(
        "collected {} of {} instances into {} ({} errors)",
        collected,
        updated.len(),
        output_dir.display(),
        errors
    );
    Ok(())
}

/// Force-terminate matching instances.
pub async fn run_kill(filter: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let store = StateStore::at_default_path()?;
    let mut state = store.load();

    let indices = state.matching_indices(filter.as_deref());
    if indices.is_empty() {
        println!("no instances match");
        return Ok(());
    }

    let manager = build_manager(&config)?;
    let mut updated = Vec::new();
    let mut killed = 0usize;
    for idx in indices {
        let inst = &mut state.instances[idx];
        let before = inst.status;
        if let Err(e) = manager.kill(inst).await {
            hlog_error!("kill: {} failed: {}", inst.short_id(), e);
        } else if before != inst.status {
            killed += 1;
        }
        updated.push(inst.clone());
    }
    persist(&store, &updated)?;

    println!("killed {} of {} matching instances", killed, updated.len());
    Ok(())
}

/// Run the git sync sub-chain for matching repo-sourced instances.
pub async fn run_sync(filter: Option<String>, cli: SyncOptions) -> Result<()> {
    let config = Config::load()?;
    let store = StateStore::at_default_path()?;
    let mut state = store.load();

    let indices = state.matching_indices(filter.as_deref());
    if indices.is_empty() {
        println!("no instances match");
        return Ok(());
    }

    let manager = build_manager(&config)?;
    let sync = GitSync::new(manager.api());

    let mut updated = Vec::new();
    let mut synced = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;

    for idx in indices {
        let inst = &mut state.instances[idx];
        if inst.source_type != SourceType::Repo {
            hlog_warn!("sync: skipping local-sourced instance {}", inst.short_id());
            skipped += 1;
            continue;
        }
        if inst.status != InstanceStatus::Completed {
            hlog_warn!(
                "sync: skipping instance {} in status {}",
                inst.short_id(),
                inst.status
            );
            skipped += 1;
            continue;
        }

        let opts = SyncOptions::for_instance(inst, cli);
        match sync.sync_instance(inst, opts).await {
            Ok(()) if inst.status == InstanceStatus::Completed => synced += 1,
            Ok(()) => failed += 1,
            Err(e) => {
                hlog_error!("sync: {} failed: {}", inst.short_id(), e);
                failed += 1;
            }
        }
        if let Some(url) = &inst.pr_url {
            println!("{}  PR: {}", inst.short_id(), url);
        }
        updated.push(inst.clone());
    }
    persist(&store, &updated)?;

    println!(
        "synced {} instances, {} failed, {} skipped",
        synced, failed, skipped
    );
    Ok(())
}

/// Prune terminal instances older than the retention age.
pub async fn run_cleanup(days: Option<i64>) -> Result<()> {
    let store = StateStore::at_default_path()?;
    let mut state = store.load();
    let age = chrono::Duration::days(days.unwrap_or(DEFAULT_RETENTION_DAYS));
    let summary: PruneSummary = prune_state(&mut state, age);
    store.save(&mut state)?;

    if summary.is_empty() {
        println!("nothing to prune");
    } else {
        println!(
            "pruned {} instances ({})",
            summary.removed,
            summary.removed_ids.join(", ")
        );
    }
    Ok(())
}

/// Resolve a user-supplied output directory, defaulting next to the
/// exports directory.
pub fn default_collect_dir() -> Result<PathBuf> {
    Ok(Config::exports_dir()?.join("collected"))
}
