//! Git sync tests: commit/push/PR chain over the sandbox fake.

use std::sync::Arc;

use hive::gitsync::{GitSync, SyncOptions};
use hive::swarm::SwarmManager;
use hive::{Error, InstanceStatus, SwarmInstance};

use crate::fixtures::{exec_fail, exec_ok, repo_spawn_options, task, test_config, FakeSandbox};

const DIRTY_STATUS: &str = "## main...origin/main\n M src/app.rs\n?? notes.md\n";

async fn completed_repo_instance(api: &Arc<FakeSandbox>) -> SwarmInstance {
    let manager = SwarmManager::new(api.clone(), test_config());
    let opts = repo_spawn_options(vec![vec![task("1", "change something")]]);
    let mut instances = manager.spawn(&opts).await.unwrap();
    let mut inst = instances.remove(0);
    inst.complete(Some("done".to_string()));
    inst
}

#[tokio::test]
async fn test_full_sync_chain_resolves_completed() {
    let api = Arc::new(FakeSandbox::new());
    let mut inst = completed_repo_instance(&api).await;

    api.script("git status --porcelain", exec_ok(DIRTY_STATUS));
    api.script(
        "gh pr create",
        exec_ok("Creating pull request for main\nhttps://github.com/acme/widget/pull/42\n"),
    );

    let sync = GitSync::new(api.as_ref());
    let opts = SyncOptions {
        commit: true,
        push: true,
        create_pr: true,
    };
    sync.sync_instance(&mut inst, opts).await.unwrap();

    assert_eq!(inst.status, InstanceStatus::Completed);
    assert!(inst.committed);
    assert!(inst.pushed);
    assert_eq!(
        inst.pr_url.as_deref(),
        Some("https://github.com/acme/widget/pull/42")
    );
    assert!(api.ran("git add -A"));
    assert!(api.ran("git push -u origin HEAD"));
}

#[tokio::test]
async fn test_sync_push_failure_fails_instance() {
    let api = Arc::new(FakeSandbox::new());
    let mut inst = completed_repo_instance(&api).await;

    api.script("git status --porcelain", exec_ok(DIRTY_STATUS));
    api.script("git push", exec_fail(1, "remote: permission denied"));

    let sync = GitSync::new(api.as_ref());
    let opts = SyncOptions {
        commit: true,
        push: true,
        create_pr: true,
    };
    sync.sync_instance(&mut inst, opts).await.unwrap();

    assert_eq!(inst.status, InstanceStatus::Failed);
    let err = inst.error.as_deref().unwrap();
    assert!(err.contains("push failed"), "unexpected error: {}", err);
    assert!(inst.committed);
    assert!(!inst.pushed);
    assert!(inst.pr_url.is_none());
    // The chain stops at the failing step.
    assert!(!api.ran("gh pr create"));
}

#[tokio::test]
async fn test_sync_clean_tree_short_circuits() {
    let api = Arc::new(FakeSandbox::new());
    let mut inst = completed_repo_instance(&api).await;

    api.script("git status --porcelain", exec_ok("## main...origin/main\n"));

    let sync = GitSync::new(api.as_ref());
    let opts = SyncOptions {
        commit: true,
        push: true,
        create_pr: false,
    };
    sync.sync_instance(&mut inst, opts).await.unwrap();

    assert_eq!(inst.status, InstanceStatus::Completed);
    assert!(!inst.committed);
    assert!(!api.ran("git add -A"));
}

#[tokio::test]
async fn test_sync_rejects_local_source() {
    let api = Arc::new(FakeSandbox::new());
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("f.txt"), "x").unwrap();

    let manager = SwarmManager::new(api.clone(), test_config());
    let opts = crate::fixtures::local_spawn_options(dir.path(), vec![vec![task("1", "w")]]);
    let mut instances = manager.spawn(&opts).await.unwrap();
    let mut inst = instances.remove(0);
    inst.complete(None);

    let sync = GitSync::new(api.as_ref());
    let result = sync.sync_instance(&mut inst, SyncOptions::default()).await;
    assert!(matches!(result, Err(Error::Sync(_))));
}

#[tokio::test]
async fn test_sync_creates_branch_first() {
    let api = Arc::new(FakeSandbox::new());
    let mut inst = completed_repo_instance(&api).await;
    inst.new_branch = Some("hive/batch-1".to_string());

    api.script("git status --porcelain", exec_ok(DIRTY_STATUS));

    let sync = GitSync::new(api.as_ref());
    let opts = SyncOptions {
        commit: true,
        push: false,
        create_pr: false,
    };
    sync.sync_instance(&mut inst, opts).await.unwrap();

    assert_eq!(inst.status, InstanceStatus::Completed);
    assert!(api.ran("git checkout -b hive/batch-1"));
}

#[tokio::test]
async fn test_sync_branch_failure_fails_instance() {
    let api = Arc::new(FakeSandbox::new());
    let mut inst = completed_repo_instance(&api).await;
    inst.new_branch = Some("hive/batch-1".to_string());

    api.script("git status --porcelain", exec_ok(DIRTY_STATUS));
    api.script("git checkout -b", exec_fail(128, "fatal: a branch named 'hive/batch-1' already exists"));

    let sync = GitSync::new(api.as_ref());
    let opts = SyncOptions {
        commit: true,
        push: true,
        create_pr: false,
    };
    sync.sync_instance(&mut inst, opts).await.unwrap();

    assert_eq!(inst.status, InstanceStatus::Failed);
    let err = inst.error.as_deref().unwrap();
    assert!(err.contains("branch creation failed"), "unexpected error: {}", err);
    assert!(inst.completed_at.is_some());
    assert!(!inst.committed);
    // Nothing past the failed branch step runs.
    assert!(!api.ran("git add -A"));
    assert!(!api.ran("git push"));
}

#[tokio::test]
async fn test_sync_push_only_from_completed() {
    let api = Arc::new(FakeSandbox::new());
    let mut inst = completed_repo_instance(&api).await;

    api.script("git status --porcelain", exec_ok(DIRTY_STATUS));

    let sync = GitSync::new(api.as_ref());
    let opts = SyncOptions {
        commit: false,
        push: true,
        create_pr: false,
    };
    sync.sync_instance(&mut inst, opts).await.unwrap();

    assert_eq!(inst.status, InstanceStatus::Completed);
    assert!(inst.pushed);
    assert!(!inst.committed);
}
