use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use backlog_core::git::{Branch, BranchSource, GitCli};
use backlog_core::task::{TaskSource, VariantKey};
use backlog_core::task_ops::TaskPatch;
use backlog_core::{StoreError, TaskStore};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn git(repo: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args([
            "-c",
            "user.name=Backlog Tests",
            "-c",
            "user.email=tests@example.com",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .status()
        .expect("run git");
    assert!(status.success(), "git {:?} failed", args);
}

fn write(path: PathBuf, text: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
    fs::write(path, text).expect("write");
}

/// `main` holds task-1; `feature` edits task-1 and adds task-2.
fn fixture() -> TempDir {
    let temp = TempDir::new().expect("tempdir");
    let repo = temp.path();
    git(repo, &["init", "-q"]);
    git(repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);

    let tasks = repo.join("backlog").join("tasks");
    write(
        tasks.join("task-1 - Shared.md"),
        "---\nid: task-1\ntitle: Shared\nstatus: To Do\nupdated_date: '2025-01-01'\n---\n",
    );
    git(repo, &["add", "."]);
    git(repo, &["commit", "-q", "-m", "main backlog"]);

    git(repo, &["checkout", "-q", "-b", "feature"]);
    write(
        tasks.join("task-1 - Shared.md"),
        "---\nid: task-1\ntitle: Shared\nstatus: Done\nupdated_date: '2025-03-01'\n---\n",
    );
    write(
        tasks.join("task-2 - Branch work.md"),
        "---\nid: task-2\ntitle: Branch work\nstatus: In Progress\n---\n",
    );
    git(repo, &["add", "."]);
    git(repo, &["commit", "-q", "-m", "feature backlog"]);
    git(repo, &["checkout", "-q", "main"]);
    temp
}

#[test]
fn git_cli_lists_other_branches_and_reads_files() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let temp = fixture();
    let backlog = temp.path().join("backlog");
    let git = GitCli::discover(&backlog).expect("discover");

    let branches = git.list_qualifying_branches(30).expect("branches");
    let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["feature"]);
    assert!(branches[0].last_activity.is_some());

    let files = git.list_files(&branches[0], "tasks").expect("files");
    assert_eq!(
        files,
        vec![
            PathBuf::from("tasks/task-1 - Shared.md"),
            PathBuf::from("tasks/task-2 - Branch work.md"),
        ]
    );
    let text = git
        .read_file_at_ref(&branches[0], Path::new("tasks/task-2 - Branch work.md"))
        .expect("read")
        .expect("exists");
    assert!(String::from_utf8_lossy(&text).contains("id: task-2"));
    assert!(git
        .read_file_at_ref(&branches[0], Path::new("tasks/missing.md"))
        .expect("read")
        .is_none());
}

#[test]
fn store_merges_branch_tasks_read_only() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let temp = fixture();
    let backlog = temp.path().join("backlog");
    let mut store = TaskStore::open(&backlog).expect("open").with_git_branches();
    store.load().expect("load");

    let local = store.get_task("task-1").expect("task-1");
    assert_eq!(local.source, TaskSource::Local);
    assert_eq!(local.status, "To Do");
    assert!(!local.is_read_only());

    let key = VariantKey {
        id: "task-1".to_string(),
        file_path: PathBuf::from("feature:tasks/task-1 - Shared.md"),
        branch: Some("feature".to_string()),
    };
    let shadow = store.get_variant(&key).expect("branch variant");
    assert_eq!(shadow.status, "Done");
    assert!(shadow.is_read_only());
    assert_eq!(store.variants("task-1").len(), 2);

    let remote = store.get_task("task-2").expect("branch-only task");
    assert_eq!(remote.branch(), Some("feature"));
    assert!(remote.is_read_only());
    let remote_path = remote.file_path.clone();

    let err = store.update_task("task-2", &remote_path, &TaskPatch::status("Done"));
    assert!(matches!(err, Err(StoreError::ReadOnlyViolation { .. })));
    assert!(!backlog.join(&remote_path).exists());
}

#[test]
fn disabled_branch_check_loads_local_only() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let temp = fixture();
    let backlog = temp.path().join("backlog");
    fs::write(backlog.join("config.yml"), "check_active_branches: false\n").expect("config");
    let mut store = TaskStore::open(&backlog).expect("open").with_git_branches();
    store.load().expect("load");

    assert!(store.get_task("task-2").is_none());
    assert!(store.duplicates().is_empty());
}

/// Two branches carrying the same task file at the same path.
struct TwinBranches;

impl BranchSource for TwinBranches {
    fn list_qualifying_branches(&self, _active_days: u32) -> anyhow::Result<Vec<Branch>> {
        Ok(vec![Branch::new("a-branch"), Branch::new("b-branch")])
    }

    fn list_files(&self, _branch: &Branch, dir: &str) -> anyhow::Result<Vec<PathBuf>> {
        Ok(if dir == "tasks" {
            vec![PathBuf::from("tasks/task-5.md")]
        } else {
            Vec::new()
        })
    }

    fn read_file_at_ref(&self, branch: &Branch, path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
        let status = if branch.name == "a-branch" { "To Do" } else { "Done" };
        Ok((path == Path::new("tasks/task-5.md")).then(|| {
            format!("---\nid: task-5\ntitle: Twin\nstatus: {}\n---\n", status).into_bytes()
        }))
    }
}

#[test]
fn same_file_on_two_branches_stays_two_variants() {
    let temp = TempDir::new().expect("tempdir");
    let mut store = TaskStore::open(temp.path())
        .expect("open")
        .with_branch_source(Box::new(TwinBranches));
    store.load().expect("load");

    let variants: Vec<(Option<String>, PathBuf)> = store
        .variants("task-5")
        .iter()
        .map(|task| (task.branch().map(str::to_string), task.file_path.clone()))
        .collect();
    assert_eq!(variants.len(), 2);
    assert_ne!(variants[0].1, variants[1].1);

    for (branch, path) in &variants {
        let found = store.get_task_variant("task-5", path).expect("variant");
        assert_eq!(found.branch(), branch.as_deref());
    }
    let b_copy = store
        .get_task_variant("task-5", Path::new("b-branch:tasks/task-5.md"))
        .expect("b-branch copy");
    assert_eq!(b_copy.status, "Done");
    assert!(store
        .get_task_variant("task-5", Path::new("tasks/task-5.md"))
        .is_none());
}
