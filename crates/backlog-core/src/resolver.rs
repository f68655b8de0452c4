//! Merges task observations from the working tree and other branches into one
//! id space.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{BacklogConfig, TaskResolutionStrategy};
use crate::git::{Branch, BranchSource};
use crate::task::{compare_ids, id_key, parse_task_text, Task, TaskFolder, TaskSource};

#[derive(Debug, Clone, Default)]
pub struct Resolved {
    /// Local tasks plus one read-only representative per branch-only id.
    pub tasks: Vec<Task>,
    /// Every other branch observation, always read-only.
    pub duplicates: Vec<Task>,
    /// SHA-256 of each local task file that was read.
    pub fingerprints: BTreeMap<PathBuf, String>,
}

pub struct CrossBranchResolver<'a> {
    backlog_dir: &'a Path,
    config: &'a BacklogConfig,
    branch_source: Option<&'a dyn BranchSource>,
}

impl<'a> CrossBranchResolver<'a> {
    pub fn new(backlog_dir: &'a Path, config: &'a BacklogConfig) -> Self {
        Self {
            backlog_dir,
            config,
            branch_source: None,
        }
    }

    pub fn with_branch_source(mut self, source: &'a dyn BranchSource) -> Self {
        self.branch_source = Some(source);
        self
    }

    pub fn resolve(&self) -> Resolved {
        let (mut local, fingerprints) = load_local(self.backlog_dir);
        local.sort_by(|a, b| a.folder.cmp(&b.folder).then_with(|| a.file_path.cmp(&b.file_path)));
        warn_local_duplicates(&local);

        let remote = self.load_branches();
        let local_ids: HashSet<String> = local.iter().map(|task| id_key(&task.id)).collect();

        let mut duplicates = Vec::new();
        let mut branch_only: HashMap<String, Vec<Task>> = HashMap::new();
        for task in remote {
            if local_ids.contains(&id_key(&task.id)) {
                duplicates.push(task);
            } else {
                branch_only.entry(id_key(&task.id)).or_default().push(task);
            }
        }

        let mut tasks = local;
        for (_, mut variants) in branch_only {
            variants.sort_by(|a, b| self.compare_candidates(a, b));
            let mut variants = variants.into_iter();
            if let Some(winner) = variants.next() {
                debug!(id = %winner.id, branch = ?winner.branch(), "branch-only task");
                tasks.push(winner);
            }
            duplicates.extend(variants);
        }

        tasks.sort_by(|a, b| {
            a.folder
                .cmp(&b.folder)
                .then_with(|| compare_ids(&a.id, &b.id))
                .then_with(|| a.file_path.cmp(&b.file_path))
        });
        duplicates.sort_by(|a, b| {
            compare_ids(&a.id, &b.id)
                .then_with(|| a.branch().cmp(&b.branch()))
                .then_with(|| a.file_path.cmp(&b.file_path))
        });
        fill_subtasks(&mut tasks);

        Resolved {
            tasks,
            duplicates,
            fingerprints,
        }
    }

    fn load_branches(&self) -> Vec<Task> {
        if !self.config.check_active_branches {
            return Vec::new();
        }
        let Some(source) = self.branch_source else {
            return Vec::new();
        };
        let branches = match source.list_qualifying_branches(self.config.active_branch_days) {
            Ok(branches) => branches,
            Err(err) => {
                warn!(error = %err, "branch enumeration failed; using local tasks only");
                return Vec::new();
            }
        };

        let mut tasks = Vec::new();
        for branch in &branches {
            match self.load_branch(source, branch) {
                Ok(found) => {
                    info!(branch = %branch.name, tasks = found.len(), "loaded branch tasks");
                    tasks.extend(found);
                }
                Err(err) => {
                    warn!(branch = %branch.name, error = %err, "skipping branch");
                }
            }
        }
        tasks
    }

    fn load_branch(&self, source: &dyn BranchSource, branch: &Branch) -> anyhow::Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for folder in TaskFolder::ALL {
            let mut files = source.list_files(branch, folder.relative_dir())?;
            files.retain(|path| is_markdown(path) && TaskFolder::from_path(self.backlog_dir, path) == Some(folder));
            files.sort();
            for path in files {
                let Some(bytes) = source.read_file_at_ref(branch, &path)? else {
                    continue;
                };
                let Ok(text) = String::from_utf8(bytes) else {
                    warn!(branch = %branch.name, path = %path.display(), "task file is not UTF-8");
                    continue;
                };
                let task_source = TaskSource::Branch {
                    name: branch.name.clone(),
                };
                let variant_path = branch_variant_path(&branch.name, &path);
                match parse_task_text(&text, variant_path, folder, task_source) {
                    Ok(task) => tasks.push(task),
                    Err(err) => warn!(branch = %branch.name, error = %err, "skipping task file"),
                }
            }
        }
        Ok(tasks)
    }

    /// Best candidate first.
    fn compare_candidates(&self, a: &Task, b: &Task) -> Ordering {
        let progressed = match self.config.task_resolution_strategy {
            TaskResolutionStrategy::MostRecent => Ordering::Equal,
            TaskResolutionStrategy::MostProgressed => {
                let rank = |task: &Task| self.config.status_index(&task.status);
                rank(b).cmp(&rank(a))
            }
        };
        progressed
            .then_with(|| activity_date(b).cmp(&activity_date(a)))
            .then_with(|| a.branch().cmp(&b.branch()))
            .then_with(|| a.file_path.cmp(&b.file_path))
    }
}

fn load_local(backlog_dir: &Path) -> (Vec<Task>, BTreeMap<PathBuf, String>) {
    let mut tasks = Vec::new();
    let mut fingerprints = BTreeMap::new();
    for (folder, path) in local_task_files(backlog_dir) {
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read task file");
                continue;
            }
        };
        fingerprints.insert(path.clone(), fingerprint(&bytes));
        let Ok(text) = String::from_utf8(bytes) else {
            warn!(path = %path.display(), "task file is not UTF-8");
            continue;
        };
        match parse_task_text(&text, path.clone(), folder, TaskSource::Local) {
            Ok(task) => {
                if task.parse_degraded {
                    warn!(path = %path.display(), "front matter unreadable; task rebuilt from filename");
                }
                tasks.push(task);
            }
            Err(err) => warn!(error = %err, "skipping task file"),
        }
    }
    (tasks, fingerprints)
}

/// Markdown files directly inside each task folder, sorted per folder.
pub fn local_task_files(backlog_dir: &Path) -> Vec<(TaskFolder, PathBuf)> {
    let mut files = Vec::new();
    for folder in TaskFolder::ALL {
        let dir = folder.dir(backlog_dir);
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && is_markdown(path))
            .collect();
        paths.sort();
        files.extend(paths.into_iter().map(|path| (folder, path)));
    }
    files
}

/// `<branch>:<backlog-relative path>`, the `file_path` of a branch variant.
/// Copies of one file on different branches never share a path.
pub fn branch_variant_path(branch: &str, path: &Path) -> PathBuf {
    PathBuf::from(format!("{}:{}", branch, path.to_string_lossy().replace('\\', "/")))
}

pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("md"))
        .unwrap_or(false)
}

fn warn_local_duplicates(local: &[Task]) {
    let mut seen: HashMap<String, &Path> = HashMap::new();
    for task in local {
        if let Some(first) = seen.get(&id_key(&task.id)) {
            warn!(
                id = %task.id,
                first = %first.display(),
                other = %task.file_path.display(),
                "duplicate local task id"
            );
        } else {
            seen.insert(id_key(&task.id), &task.file_path);
        }
    }
}

fn fill_subtasks(tasks: &mut [Task]) {
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for task in tasks.iter() {
        if let Some(parent) = task.parent_task_id.as_deref() {
            children.entry(id_key(parent)).or_default().push(task.id.clone());
        }
    }
    for task in tasks.iter_mut() {
        if !task.subtask_ids.is_empty() {
            continue;
        }
        if let Some(ids) = children.get(&id_key(&task.id)) {
            let mut ids = ids.clone();
            ids.sort_by(|a, b| compare_ids(a, b));
            ids.dedup_by(|a, b| id_key(a) == id_key(b));
            task.subtask_ids = ids;
        }
    }
}

/// `updated_date`, else `created_date`, as a comparable timestamp.
pub fn activity_date(task: &Task) -> Option<NaiveDateTime> {
    task.updated_date
        .as_deref()
        .and_then(parse_task_date)
        .or_else(|| task.created_date.as_deref().and_then(parse_task_date))
}

pub fn parse_task_date(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    for format in ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}
