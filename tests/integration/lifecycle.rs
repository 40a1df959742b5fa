//! Instance lifecycle tests: spawn, reconcile, collect, kill.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hive::swarm::manager::{OUTPUT_FILE, PID_FILE, PROMPT_FILE};
use hive::swarm::SwarmManager;
use hive::tasks::TaskStatus;
use hive::InstanceStatus;

use crate::fixtures::{
    exec_fail, exec_ok, local_spawn_options, repo_spawn_options, task, test_config, FakeSandbox,
};

#[tokio::test]
async fn test_spawn_repo_source_reaches_running() {
    let api = Arc::new(FakeSandbox::new());
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = repo_spawn_options(vec![
        vec![task("1", "fix parser"), task("2", "add tests")],
        vec![task("3", "update docs")],
    ]);
    let instances = manager.spawn(&opts).await.unwrap();

    assert_eq!(instances.len(), 2);
    for inst in &instances {
        assert_eq!(inst.status, InstanceStatus::Running);
        assert!(!inst.sandbox_id.is_empty());
        assert!(inst.error.is_none());
    }
    assert!(api.ran("git clone --depth 1"));
    assert!(api.ran("nohup claude"));

    // Task files and the prompt land in each sandbox.
    let first = &instances[0];
    assert!(api.file(&first.sandbox_id, "/workspace/tasks/task-1.json").is_some());
    assert!(api.file(&first.sandbox_id, "/workspace/tasks/task-2.json").is_some());
    let prompt = api.file(&first.sandbox_id, PROMPT_FILE).unwrap();
    let prompt = String::from_utf8(prompt).unwrap();
    assert!(prompt.contains("task-1.json: fix parser"));
}

#[tokio::test]
async fn test_spawn_clone_failure_recorded_not_raised() {
    let api = Arc::new(FakeSandbox::new());
    api.script("git clone", exec_fail(128, "fatal: repository not found"));
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = repo_spawn_options(vec![vec![task("1", "anything")]]);
    let instances = manager.spawn(&opts).await.unwrap();

    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, InstanceStatus::Failed);
    let err = instances[0].error.as_deref().unwrap();
    assert!(err.contains("clone failed"), "unexpected error: {}", err);
    assert!(err.contains("repository not found"));
}

#[tokio::test]
async fn test_spawn_local_source_uploads_filtered_tree() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
    std::fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
    std::fs::create_dir(dir.path().join("node_modules")).unwrap();
    std::fs::write(dir.path().join("node_modules").join("pkg.js"), "x").unwrap();
    std::fs::write(dir.path().join("blob.bin"), vec![0u8; 2 * 1024 * 1024]).unwrap();

    let api = Arc::new(FakeSandbox::new());
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = local_spawn_options(dir.path(), vec![vec![task("1", "port the tool")]]);
    let instances = manager.spawn(&opts).await.unwrap();

    let inst = &instances[0];
    assert_eq!(inst.status, InstanceStatus::Running);
    assert!(api.file(&inst.sandbox_id, "/workspace/main.rs").is_some());
    assert!(api.file(&inst.sandbox_id, "/workspace/.env").is_none());
    assert!(api.file(&inst.sandbox_id, "/workspace/node_modules/pkg.js").is_none());
    assert!(api.file(&inst.sandbox_id, "/workspace/blob.bin").is_none());
    // main.rs plus the task file and prompt written during setup.
    assert_eq!(api.file_count(&inst.sandbox_id), 3);
}

#[tokio::test]
async fn test_check_stays_running_without_pid_marker() {
    let api = Arc::new(FakeSandbox::new());
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = repo_spawn_options(vec![vec![task("1", "slow work")]]);
    let mut instances = manager.spawn(&opts).await.unwrap();
    let inst = &mut instances[0];

    // The agent has not written its pid yet.
    manager.check_instance(inst).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_check_completes_on_agent_exit() {
    let api = Arc::new(FakeSandbox::new());
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = repo_spawn_options(vec![vec![task("1", "quick work")]]);
    let mut instances = manager.spawn(&opts).await.unwrap();
    let inst = &mut instances[0];

    api.seed_file(&inst.sandbox_id, PID_FILE, "4242\n");
    api.seed_file(&inst.sandbox_id, OUTPUT_FILE, "all tasks done\n");
    api.script("kill -0 4242", exec_fail(1, ""));

    manager.check_instance(inst).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Completed);
    assert_eq!(inst.output.as_deref(), Some("all tasks done\n"));
    assert!(inst.completed_at.is_some());
}

#[tokio::test]
async fn test_check_is_idempotent_on_terminal() {
    let api = Arc::new(FakeSandbox::new());
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = repo_spawn_options(vec![vec![task("1", "work")]]);
    let mut instances = manager.spawn(&opts).await.unwrap();
    let inst = &mut instances[0];
    inst.fail("simulated earlier failure");
    let completed_at = inst.completed_at;

    manager.check_instance(inst).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Failed);
    assert_eq!(inst.completed_at, completed_at);
}

#[tokio::test]
async fn test_check_marks_failed_on_lost_connectivity() {
    let api = Arc::new(FakeSandbox::new());
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = repo_spawn_options(vec![vec![task("1", "work")]]);
    let mut instances = manager.spawn(&opts).await.unwrap();
    let inst = &mut instances[0];

    api.fail_connect.store(true, Ordering::SeqCst);
    manager.check_instance(inst).await.unwrap();

    assert_eq!(inst.status, InstanceStatus::Failed);
    assert!(inst
        .error
        .as_deref()
        .unwrap()
        .contains("lost connectivity"));
}

#[tokio::test]
async fn test_wait_until_terminal_polls_to_completion() {
    let api = Arc::new(FakeSandbox::new());
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = repo_spawn_options(vec![vec![task("1", "work")]]);
    let mut instances = manager.spawn(&opts).await.unwrap();
    let inst = &mut instances[0];

    api.seed_file(&inst.sandbox_id, PID_FILE, "7\n");
    api.seed_file(&inst.sandbox_id, OUTPUT_FILE, "done");
    api.script("kill -0 7", exec_fail(1, ""));

    manager
        .wait_until_terminal(inst, Duration::from_millis(5))
        .await
        .unwrap();
    assert_eq!(inst.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_collect_reads_back_mutated_task_files() {
    let api = Arc::new(FakeSandbox::new());
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = repo_spawn_options(vec![vec![task("1", "first"), task("2", "second")]]);
    let mut instances = manager.spawn(&opts).await.unwrap();
    let inst = &mut instances[0];

    // Simulate the agent finishing task 1 and leaving task 2 pending.
    let mut done = task("1", "first");
    done.status = TaskStatus::Completed;
    api.seed_file(
        &inst.sandbox_id,
        "/workspace/tasks/task-1.json",
        &serde_json::to_string(&done).unwrap(),
    );
    api.seed_file(&inst.sandbox_id, OUTPUT_FILE, "finished first task");
    api.script("ls /workspace/tasks", exec_ok("task-1.json\ntask-2.json\n"));

    let result = manager.collect_results(inst).await.unwrap();
    assert_eq!(result.output.as_deref(), Some("finished first task"));
    assert_eq!(result.tasks.len(), 2);
    assert_eq!(result.tasks[0].status, TaskStatus::Completed);
    assert_eq!(result.tasks[1].status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_collect_falls_back_to_stored_tasks() {
    let api = Arc::new(FakeSandbox::new());
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = repo_spawn_options(vec![vec![task("1", "first")]]);
    let instances = manager.spawn(&opts).await.unwrap();
    let inst = &instances[0];

    api.script("ls /workspace/tasks", exec_fail(2, "no such directory"));

    let result = manager.collect_results(inst).await.unwrap();
    assert_eq!(result.tasks.len(), 1);
    assert_eq!(result.tasks[0].id, "1");
}

#[tokio::test]
async fn test_kill_unprovisioned_is_noop() {
    let api = Arc::new(FakeSandbox::new());
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = repo_spawn_options(vec![vec![task("1", "work")]]);
    let mut instances = manager.spawn(&opts).await.unwrap();
    let inst = &mut instances[0];
    let status = inst.status;
    inst.sandbox_id = String::new();

    manager.kill(inst).await.unwrap();
    assert_eq!(inst.status, status);
    assert!(api.killed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_kill_terminates_and_fails_instance() {
    let api = Arc::new(FakeSandbox::new());
    let manager = SwarmManager::new(api.clone(), test_config());

    let opts = repo_spawn_options(vec![vec![task("1", "work")]]);
    let mut instances = manager.spawn(&opts).await.unwrap();
    let inst = &mut instances[0];
    let sandbox_id = inst.sandbox_id.clone();

    manager.kill(inst).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Failed);
    assert_eq!(inst.error.as_deref(), Some("Killed by user"));
    assert_eq!(*api.killed.lock().unwrap(), vec![sandbox_id]);
}
