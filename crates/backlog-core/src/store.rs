//! The task store: one loaded view of the backlog plus the write path.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backlog::{locate_backlog_dir, BacklogError};
use crate::config::{load_config, BacklogConfig, ConfigError};
use crate::frontmatter;
use crate::git::{BranchSource, GitCli};
use crate::ordinal::{self, Card, OrdinalUpdate};
use crate::resolver::{fingerprint, CrossBranchResolver};
use crate::sections::{self, ChecklistKind};
use crate::task::{
    compare_for_column, compare_ids, ids_equal, parse_task_text, Order, Task, TaskFolder,
    TaskSource, VariantKey,
};
use crate::task_ops::{next_task_id, render_new_task, stamp_updated_date, task_filename, NewTask, TaskPatch};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Front matter of {id} ({path}) cannot be parsed; refusing to rewrite it")]
    ParseDegraded { id: String, path: PathBuf },
    #[error("Task not found: {0}")]
    NotFound(String),
    #[error("Task {id} on branch {branch} is read-only")]
    ReadOnlyViolation { id: String, branch: String },
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Task {id} has no {kind} item #{sequential_id}")]
    InvalidChecklistItem {
        id: String,
        kind: &'static str,
        sequential_id: u32,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backlog(#[from] BacklogError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Local files that appeared, vanished or changed content since the last load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub changed: Vec<PathBuf>,
}

impl ReloadSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ReorderOutcome {
    pub applied: Vec<OrdinalUpdate>,
    pub failed: Vec<(OrdinalUpdate, StoreError)>,
}

impl ReorderOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub struct MoveOutcome {
    pub task: Task,
    pub reordered: ReorderOutcome,
    /// Updates aimed at read-only cards, left unwritten.
    pub skipped: Vec<OrdinalUpdate>,
    pub rebalanced: bool,
    /// False when the card did not land at the requested index, e.g. because
    /// an unordered read-only card above it could not be given an ordinal.
    pub position_kept: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Column<'a> {
    pub status: String,
    pub tasks: Vec<&'a Task>,
}

fn system_clock() -> NaiveDateTime {
    Local::now().naive_local()
}

pub struct TaskStore {
    backlog_dir: PathBuf,
    config: BacklogConfig,
    branch_source: Option<Box<dyn BranchSource>>,
    tasks: Vec<Task>,
    duplicates: Vec<Task>,
    fingerprints: BTreeMap<PathBuf, String>,
    clock: fn() -> NaiveDateTime,
}

impl TaskStore {
    /// Reads `config.yml`; tasks are not loaded until [`TaskStore::load`].
    pub fn open(backlog_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let backlog_dir = backlog_dir.into();
        let config = load_config(&backlog_dir)?;
        Ok(Self {
            backlog_dir,
            config,
            branch_source: None,
            tasks: Vec::new(),
            duplicates: Vec::new(),
            fingerprints: BTreeMap::new(),
            clock: system_clock,
        })
    }

    /// Finds the backlog above `start`, opens it with git branch reading
    /// when it sits in a repository, and loads it.
    pub fn discover(start: &Path) -> Result<Self, StoreError> {
        let backlog_dir = locate_backlog_dir(start)?;
        let mut store = Self::open(backlog_dir)?.with_git_branches();
        store.load()?;
        Ok(store)
    }

    pub fn with_branch_source(mut self, source: Box<dyn BranchSource>) -> Self {
        self.branch_source = Some(source);
        self
    }

    pub fn with_git_branches(self) -> Self {
        match GitCli::discover(&self.backlog_dir) {
            Ok(git) => self.with_branch_source(Box::new(git)),
            Err(err) => {
                debug!(error = %err, "no git repository; branch tasks disabled");
                self
            }
        }
    }

    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn backlog_dir(&self) -> &Path {
        &self.backlog_dir
    }

    /// Rebuilds every task record from disk and branches.
    pub fn load(&mut self) -> Result<usize, StoreError> {
        self.config = load_config(&self.backlog_dir)?;
        let mut resolver = CrossBranchResolver::new(&self.backlog_dir, &self.config);
        if let Some(source) = self.branch_source.as_deref() {
            resolver = resolver.with_branch_source(source);
        }
        let resolved = resolver.resolve();
        info!(
            tasks = resolved.tasks.len(),
            duplicates = resolved.duplicates.len(),
            "backlog loaded"
        );
        self.tasks = resolved.tasks;
        self.duplicates = resolved.duplicates;
        self.fingerprints = resolved.fingerprints;
        Ok(self.tasks.len())
    }

    /// Full reload after a file-change signal. Files last written by this
    /// store are not reported unless they changed again since.
    pub fn files_changed(&mut self) -> Result<ReloadSummary, StoreError> {
        let previous = std::mem::take(&mut self.fingerprints);
        if let Err(err) = self.load() {
            self.fingerprints = previous;
            return Err(err);
        }
        let mut summary = ReloadSummary::default();
        for (path, hash) in &self.fingerprints {
            match previous.get(path) {
                None => summary.added.push(path.clone()),
                Some(old) if old != hash => summary.changed.push(path.clone()),
                Some(_) => {}
            }
        }
        summary.removed = previous
            .keys()
            .filter(|path| !self.fingerprints.contains_key(*path))
            .cloned()
            .collect();
        if !summary.is_empty() {
            debug!(
                added = summary.added.len(),
                removed = summary.removed.len(),
                changed = summary.changed.len(),
                "backlog changed on disk"
            );
        }
        Ok(summary)
    }

    pub fn get_config(&self) -> &BacklogConfig {
        &self.config
    }

    /// Authoritative tasks: local ones plus branch-only representatives.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Branch observations shadowed by another variant.
    pub fn duplicates(&self) -> &[Task] {
        &self.duplicates
    }

    pub fn list_tasks(&self, folder: TaskFolder) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.iter().filter(|task| task.folder == folder).collect();
        tasks.sort_by(|a, b| compare_ids(&a.id, &b.id).then_with(|| a.file_path.cmp(&b.file_path)));
        tasks
    }

    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| ids_equal(&task.id, id))
    }

    pub fn get_task_variant(&self, id: &str, file_path: &Path) -> Option<&Task> {
        self.all_variants().find(|task| task.is_variant(id, file_path))
    }

    pub fn get_variant(&self, key: &VariantKey) -> Option<&Task> {
        self.all_variants().find(|task| task.matches_key(key))
    }

    /// Every observation of `id`, authoritative first.
    pub fn variants(&self, id: &str) -> Vec<&Task> {
        self.all_variants().filter(|task| ids_equal(&task.id, id)).collect()
    }

    fn all_variants(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().chain(self.duplicates.iter())
    }

    /// Cards of one status column in display order.
    pub fn column(&self, status: &str) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|task| task.folder == TaskFolder::Tasks && same_status(&task.status, status))
            .collect();
        tasks.sort_by(|a, b| compare_for_column(a, b));
        tasks
    }

    /// Configured columns in workflow order, then any other status in use.
    pub fn board(&self) -> Vec<Column<'_>> {
        let mut statuses = self.config.statuses.clone();
        let extra: BTreeSet<String> = self
            .tasks
            .iter()
            .filter(|task| task.folder == TaskFolder::Tasks && !task.status.is_empty())
            .filter(|task| self.config.status_index(&task.status).is_none())
            .map(|task| task.status.clone())
            .collect();
        statuses.extend(extra);
        statuses
            .into_iter()
            .map(|status| Column {
                tasks: self.column(&status),
                status,
            })
            .collect()
    }

    pub fn statuses(&self) -> &[String] {
        &self.config.statuses
    }

    pub fn labels(&self) -> Vec<String> {
        merge_names(
            &self.config.labels,
            self.tasks.iter().flat_map(|task| task.labels.iter()),
        )
    }

    pub fn milestones(&self) -> Vec<String> {
        merge_names(
            &self.config.milestones,
            self.tasks.iter().filter_map(|task| task.milestone.as_ref()),
        )
    }

    pub fn assignees(&self) -> Vec<String> {
        merge_names(&[], self.tasks.iter().flat_map(|task| task.assignee.iter()))
    }

    /// Applies the fields present in `patch` to the file of `(id, file_path)`
    /// and stamps `updated_date`.
    pub fn update_task(&mut self, id: &str, file_path: &Path, patch: &TaskPatch) -> Result<Task, StoreError> {
        if patch.is_empty() {
            return self.writable(id, file_path).cloned();
        }
        self.write_patch(id, file_path, patch)
    }

    /// Writes each ordinal independently; one failure does not stop the rest.
    pub fn reorder(&mut self, updates: &[OrdinalUpdate]) -> ReorderOutcome {
        let mut outcome = ReorderOutcome::default();
        for update in updates {
            let patch = TaskPatch::ordinal(update.new_ordinal);
            match self.write_patch(&update.task_id, &update.file_path, &patch) {
                Ok(_) => outcome.applied.push(update.clone()),
                Err(err) => {
                    warn!(id = %update.task_id, error = %err, "ordinal update failed");
                    outcome.failed.push((update.clone(), err));
                }
            }
        }
        outcome
    }

    /// Flips one checklist box. Only that character of the file changes.
    pub fn toggle_checklist_item(
        &mut self,
        id: &str,
        file_path: &Path,
        kind: ChecklistKind,
        sequential_id: u32,
    ) -> Result<Task, StoreError> {
        let (task_id, folder, path) = {
            let task = self.writable(id, file_path)?;
            (task.id.clone(), task.folder, task.file_path.clone())
        };
        let text = fs::read_to_string(&path).map_err(io_error(&path))?;
        let degraded = || StoreError::ParseDegraded {
            id: task_id.clone(),
            path: path.clone(),
        };
        if frontmatter::parse(&text).is_degraded() {
            return Err(degraded());
        }
        let split = frontmatter::split_front_matter(&text).map_err(|_| degraded())?;
        let (head, body) = text.split_at(split.body_start);
        let toggled = sections::toggle_checklist_item(body, kind.section(), sequential_id).ok_or_else(|| {
            StoreError::InvalidChecklistItem {
                id: task_id.clone(),
                kind: kind.label(),
                sequential_id,
            }
        })?;
        let updated = format!("{}{}", head, toggled);
        self.write_file(&path, &updated)?;
        debug!(id = %task_id, item = sequential_id, "toggled checklist item");
        self.refresh(&path, &updated, folder)
    }

    /// Drops a card into `target_status` at `drop_index` of that column's
    /// current order and writes every ordinal the drop requires.
    pub fn move_card(
        &mut self,
        id: &str,
        file_path: &Path,
        target_status: &str,
        drop_index: usize,
    ) -> Result<MoveOutcome, StoreError> {
        let dropped = self.writable(id, file_path)?.clone();
        let status = self
            .config
            .canonical_status(target_status)
            .unwrap_or_else(|| target_status.trim())
            .to_string();

        let existing: Vec<Card> = self
            .column(&status)
            .into_iter()
            .filter(|task| !task.is_variant(&dropped.id, &dropped.file_path))
            .map(|task| Card::new(task.id.clone(), task.file_path.clone(), task.order))
            .collect();
        let dropped_card = Card::new(dropped.id.clone(), dropped.file_path.clone(), dropped.order);
        let plan = ordinal::plan_drop(&existing, &dropped_card, drop_index);

        let mut updates = plan.updates.clone();
        if plan.needs_rebalance {
            info!(status = %status, "ordinal gap exhausted; rebalancing column");
            for update in rebalance_after_drop(&existing, &dropped_card, drop_index, &plan.updates) {
                match updates
                    .iter_mut()
                    .find(|u| u.task_id == update.task_id && u.file_path == update.file_path)
                {
                    Some(existing) => existing.new_ordinal = update.new_ordinal,
                    None => updates.push(update),
                }
            }
        }

        let (own, others): (Vec<OrdinalUpdate>, Vec<OrdinalUpdate>) = updates
            .into_iter()
            .partition(|u| u.task_id == dropped.id && u.file_path == dropped.file_path);
        let ordinal = own.first().map(|u| u.new_ordinal).or(dropped.order.value());
        let patch = TaskPatch {
            status: (!same_status(&dropped.status, &status)).then(|| status.clone()),
            ordinal: ordinal.map(Order::Explicit),
            ..TaskPatch::default()
        };
        let task = self.write_patch(&dropped.id, &dropped.file_path, &patch)?;

        let (skipped, writable): (Vec<OrdinalUpdate>, Vec<OrdinalUpdate>) =
            others.into_iter().partition(|u| {
                self.get_task_variant(&u.task_id, &u.file_path)
                    .map(Task::is_read_only)
                    .unwrap_or(false)
            });
        for update in &skipped {
            warn!(id = %update.task_id, "not reordering read-only branch task");
        }
        let reordered = self.reorder(&writable);

        let landed = self
            .column(&status)
            .iter()
            .position(|card| card.is_variant(&task.id, &task.file_path));
        let position_kept = landed == Some(drop_index.min(existing.len()));
        if !position_kept {
            warn!(id = %task.id, requested = drop_index, landed = ?landed, "card did not land at requested position");
        }
        Ok(MoveOutcome {
            task,
            reordered,
            skipped,
            rebalanced: plan.needs_rebalance,
            position_kept,
        })
    }

    /// Re-spaces a column's ordinals at even steps, skipping read-only cards.
    pub fn rebalance_column(&mut self, status: &str) -> ReorderOutcome {
        let cards: Vec<Card> = self
            .column(status)
            .into_iter()
            .map(|task| Card::new(task.id.clone(), task.file_path.clone(), task.order))
            .collect();
        let updates: Vec<OrdinalUpdate> = ordinal::rebalance(&cards)
            .into_iter()
            .filter(|u| {
                let read_only = self
                    .get_task_variant(&u.task_id, &u.file_path)
                    .map(Task::is_read_only)
                    .unwrap_or(false);
                if read_only {
                    warn!(id = %u.task_id, "not rebalancing read-only branch task");
                }
                !read_only
            })
            .collect();
        self.reorder(&updates)
    }

    /// Writes a new task file under `tasks/` (or `drafts/`) with the next id.
    pub fn create_task(&mut self, draft: NewTask) -> Result<Task, StoreError> {
        let id = next_task_id(
            &self.config.task_prefix,
            self.all_variants().map(|task| task.id.as_str()),
            draft.parent_task_id.as_deref(),
        );
        let folder = if draft.draft {
            TaskFolder::Drafts
        } else {
            TaskFolder::Tasks
        };
        let dir = folder.dir(&self.backlog_dir);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        let path = dir.join(task_filename(&id, &draft.title));
        let text = render_new_task(&id, &draft, &self.config.default_status, (self.clock)());

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(io_error(&path))?;
        file.write_all(text.as_bytes()).map_err(io_error(&path))?;
        self.fingerprints.insert(path.clone(), fingerprint(text.as_bytes()));
        info!(id = %id, path = %path.display(), "created task");

        let task = self.refresh(&path, &text, folder)?;
        self.tasks.sort_by(|a, b| {
            a.folder
                .cmp(&b.folder)
                .then_with(|| compare_ids(&a.id, &b.id))
                .then_with(|| a.file_path.cmp(&b.file_path))
        });
        Ok(task)
    }

    /// The variant at `(id, file_path)` when this store may rewrite it.
    fn writable(&self, id: &str, file_path: &Path) -> Result<&Task, StoreError> {
        let task = self
            .get_task_variant(id, file_path)
            .ok_or_else(|| StoreError::NotFound(format!("{} at {}", id, file_path.display())))?;
        if task.is_read_only() {
            return Err(StoreError::ReadOnlyViolation {
                id: task.id.clone(),
                branch: task.branch().unwrap_or_default().to_string(),
            });
        }
        if task.parse_degraded {
            return Err(StoreError::ParseDegraded {
                id: task.id.clone(),
                path: task.file_path.clone(),
            });
        }
        Ok(task)
    }

    /// Re-reads one file, applies `patch` and stamps `updated_date` when
    /// anything changed.
    fn write_patch(&mut self, id: &str, file_path: &Path, patch: &TaskPatch) -> Result<Task, StoreError> {
        let (task_id, folder, path) = {
            let task = self.writable(id, file_path)?;
            (task.id.clone(), task.folder, task.file_path.clone())
        };
        let text = fs::read_to_string(&path).map_err(io_error(&path))?;
        let mut doc = frontmatter::parse(&text);
        if doc.is_degraded() {
            return Err(StoreError::ParseDegraded { id: task_id, path });
        }
        patch.apply(&mut doc);
        if doc.render() == text {
            return self.refresh(&path, &text, folder);
        }
        stamp_updated_date(&mut doc, (self.clock)());
        let updated = doc.render();
        self.write_file(&path, &updated)?;
        debug!(id = %task_id, path = %path.display(), "task written");
        self.refresh(&path, &updated, folder)
    }

    fn write_file(&mut self, path: &Path, text: &str) -> Result<(), StoreError> {
        fs::write(path, text).map_err(io_error(path))?;
        self.fingerprints.insert(path.to_path_buf(), fingerprint(text.as_bytes()));
        Ok(())
    }

    /// Replaces the in-memory record of a local file with its new contents.
    fn refresh(&mut self, path: &Path, text: &str, folder: TaskFolder) -> Result<Task, StoreError> {
        let mut task = parse_task_text(text, path.to_path_buf(), folder, TaskSource::Local)
            .map_err(|err| StoreError::NotFound(err.to_string()))?;
        match self
            .tasks
            .iter_mut()
            .find(|existing| existing.is_local() && existing.file_path == path)
        {
            Some(slot) => {
                if task.subtask_ids.is_empty() {
                    task.subtask_ids = slot.subtask_ids.clone();
                }
                *slot = task.clone();
            }
            None => self.tasks.push(task.clone()),
        }
        Ok(task)
    }
}

/// Ordinals for the column as it looks after the drop, re-spaced evenly.
fn rebalance_after_drop(
    existing: &[Card],
    dropped: &Card,
    drop_index: usize,
    planned: &[OrdinalUpdate],
) -> Vec<OrdinalUpdate> {
    let planned_order = |card: &Card| {
        planned
            .iter()
            .find(|u| u.task_id == card.id && u.file_path == card.file_path)
            .map(|u| Order::Explicit(u.new_ordinal))
            .unwrap_or(card.order)
    };
    let mut arrangement: Vec<Card> = existing
        .iter()
        .map(|card| Card::new(card.id.clone(), card.file_path.clone(), planned_order(card)))
        .collect();
    let dropped = Card::new(dropped.id.clone(), dropped.file_path.clone(), planned_order(dropped));
    arrangement.insert(drop_index.min(arrangement.len()), dropped);
    ordinal::rebalance(&arrangement)
}

fn same_status(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Configured names first, then the rest in use, sorted; case-insensitive.
fn merge_names<'a>(configured: &[String], found: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut names = Vec::new();
    for name in configured {
        let name = name.trim();
        if !name.is_empty() && seen.insert(name.to_lowercase()) {
            names.push(name.to_string());
        }
    }
    let mut rest: Vec<String> = Vec::new();
    for name in found {
        let name = name.trim();
        if !name.is_empty() && seen.insert(name.to_lowercase()) {
            rest.push(name.to_string());
        }
    }
    rest.sort_by_key(|name| name.to_lowercase());
    names.extend(rest);
    names
}
