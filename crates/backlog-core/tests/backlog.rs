use std::path::{Path, PathBuf};

use tempfile::TempDir;

use backlog_core::backlog::{is_backlog_root, locate_backlog_dir};
use backlog_core::TaskStore;

fn create_tasks_dir(path: &Path) {
    std::fs::create_dir_all(path).expect("create tasks dir");
}

fn canonical(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path).unwrap_or(path)
}

#[test]
fn locate_backlog_dir_finds_backlog_from_child() {
    let temp = TempDir::new().expect("tempdir");
    let backlog_dir = temp.path().join("backlog");
    create_tasks_dir(&backlog_dir.join("tasks"));

    let child = backlog_dir.join("tasks");
    let resolved = locate_backlog_dir(&child).expect("resolve");
    // Windows can surface different path representations (verbatim prefix, 8.3 short names).
    assert_eq!(canonical(resolved), canonical(backlog_dir));
}

#[test]
fn locate_backlog_dir_prefers_visible_backlog() {
    let temp = TempDir::new().expect("tempdir");
    create_tasks_dir(&temp.path().join("backlog").join("tasks"));
    create_tasks_dir(&temp.path().join(".backlog").join("tasks"));

    let resolved = locate_backlog_dir(temp.path()).expect("resolve");
    assert_eq!(canonical(resolved), canonical(temp.path().join("backlog")));
}

#[test]
fn backlog_root_needs_config_or_tasks() {
    let temp = TempDir::new().expect("tempdir");
    assert!(!is_backlog_root(temp.path()));
    std::fs::write(temp.path().join("config.yml"), "statuses: [Open, Closed]\n").expect("config");
    assert!(is_backlog_root(temp.path()));
}

#[test]
fn discover_opens_and_loads_store() {
    let temp = TempDir::new().expect("tempdir");
    let backlog_dir = temp.path().join("backlog");
    create_tasks_dir(&backlog_dir.join("tasks"));
    std::fs::write(
        backlog_dir.join("tasks").join("task-1 - First.md"),
        "---\nid: task-1\ntitle: First\nstatus: To Do\n---\n",
    )
    .expect("write task");

    let store = TaskStore::discover(&backlog_dir.join("tasks")).expect("discover");
    assert_eq!(store.tasks().len(), 1);
    assert_eq!(store.get_task("task-1").map(|t| t.title.as_str()), Some("First"));
}
