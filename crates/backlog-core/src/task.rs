use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Serialize, Serializer};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::frontmatter::{self, value_to_string, Document, CANONICAL_KEYS};
use crate::sections::{self, ChecklistItem};

#[derive(Debug, Error)]
pub enum TaskParseError {
    #[error("Failed to read task file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No task id in front matter or filename of {0}")]
    MissingId(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Position of a card among its siblings. `Explicit` always sorts before
/// `Unordered`, whatever its value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Order {
    Explicit(f64),
    #[default]
    Unordered,
}

impl Order {
    pub fn value(self) -> Option<f64> {
        match self {
            Order::Explicit(value) => Some(value),
            Order::Unordered => None,
        }
    }

    pub fn is_explicit(self) -> bool {
        matches!(self, Order::Explicit(_))
    }

    pub fn cmp_position(self, other: Order) -> Ordering {
        match (self, other) {
            (Order::Explicit(a), Order::Explicit(b)) => a.total_cmp(&b),
            (Order::Explicit(_), Order::Unordered) => Ordering::Less,
            (Order::Unordered, Order::Explicit(_)) => Ordering::Greater,
            (Order::Unordered, Order::Unordered) => Ordering::Equal,
        }
    }

    fn from_value(value: Option<&Value>) -> Self {
        let number = match value {
            Some(Value::Number(num)) => num.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match number {
            Some(n) if n.is_finite() => Order::Explicit(n),
            _ => Order::Unordered,
        }
    }

    pub fn to_value(self) -> Option<Value> {
        let value = self.value()?;
        if value.fract() == 0.0 && value.abs() < 9.0e15 {
            Some(Value::from(value as i64))
        } else {
            Some(Value::from(value))
        }
    }
}

impl From<Option<f64>> for Order {
    fn from(value: Option<f64>) -> Self {
        value.map(Order::Explicit).unwrap_or(Order::Unordered)
    }
}

impl Serialize for Order {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value().serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TaskSource {
    Local,
    Branch { name: String },
}

impl TaskSource {
    pub fn branch_name(&self) -> Option<&str> {
        match self {
            TaskSource::Local => None,
            TaskSource::Branch { name } => Some(name.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskFolder {
    Tasks,
    Drafts,
    Completed,
    Archive,
}

impl TaskFolder {
    pub const ALL: [TaskFolder; 4] = [
        TaskFolder::Tasks,
        TaskFolder::Drafts,
        TaskFolder::Completed,
        TaskFolder::Archive,
    ];

    pub fn relative_dir(self) -> &'static str {
        match self {
            TaskFolder::Tasks => "tasks",
            TaskFolder::Drafts => "drafts",
            TaskFolder::Completed => "completed",
            TaskFolder::Archive => "archive/tasks",
        }
    }

    pub fn dir(self, backlog_dir: &Path) -> PathBuf {
        self.relative_dir()
            .split('/')
            .fold(backlog_dir.to_path_buf(), |acc, part| acc.join(part))
    }

    /// Folder a path lives in, relative to the backlog directory or absolute.
    pub fn from_path(backlog_dir: &Path, path: &Path) -> Option<TaskFolder> {
        let relative = path.strip_prefix(backlog_dir).unwrap_or(path);
        let parent = relative.parent()?;
        let parent = parent
            .components()
            .map(|part| part.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        TaskFolder::ALL
            .into_iter()
            .find(|folder| folder.relative_dir() == parent)
    }
}

/// Addresses one concrete observation of a task id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VariantKey {
    pub id: String,
    pub file_path: PathBuf,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: String,
    pub priority: Option<Priority>,
    pub milestone: Option<String>,
    pub labels: Vec<String>,
    pub assignee: Vec<String>,
    pub reporter: Option<String>,
    pub dependencies: Vec<String>,
    pub references: Vec<String>,
    pub documentation: Vec<String>,
    pub parent_task_id: Option<String>,
    pub subtask_ids: Vec<String>,
    pub description: String,
    pub plan: String,
    pub notes: String,
    pub final_summary: String,
    pub acceptance_criteria: Vec<ChecklistItem>,
    pub definition_of_done: Vec<ChecklistItem>,
    #[serde(rename = "ordinal")]
    pub order: Order,
    pub created_date: Option<String>,
    pub updated_date: Option<String>,
    pub extra: Mapping,
    pub file_path: PathBuf,
    pub folder: TaskFolder,
    pub source: TaskSource,
    pub read_only: bool,
    pub parse_degraded: bool,
    #[serde(skip)]
    pub body: String,
}

impl Task {
    /// Builds a task from a parsed document. Degraded documents still yield a
    /// task when the filename carries an id.
    pub fn from_document(
        doc: &Document,
        file_path: PathBuf,
        folder: TaskFolder,
        source: TaskSource,
    ) -> Option<Task> {
        let fm = &doc.front_matter;
        let id = string_field(fm, "id").or_else(|| id_from_filename(&file_path))?;
        let title = string_field(fm, "title")
            .or_else(|| title_from_filename(&file_path))
            .unwrap_or_default();
        let body = &doc.body;
        let read_only = matches!(source, TaskSource::Branch { .. });

        let mut extra = Mapping::new();
        for (key, value) in fm {
            let known = key
                .as_str()
                .map(|name| CANONICAL_KEYS.contains(&name))
                .unwrap_or(false);
            if !known {
                extra.insert(key.clone(), value.clone());
            }
        }

        Some(Task {
            id,
            title,
            status: string_field(fm, "status").unwrap_or_default(),
            priority: string_field(fm, "priority").and_then(|p| Priority::parse(&p)),
            milestone: string_field(fm, "milestone"),
            labels: parse_list_value(fm.get("labels")),
            assignee: parse_list_value(fm.get("assignee")),
            reporter: string_field(fm, "reporter"),
            dependencies: parse_list_value(fm.get("dependencies")),
            references: parse_list_value(fm.get("references")),
            documentation: parse_list_value(fm.get("documentation")),
            parent_task_id: string_field(fm, "parent_task_id"),
            subtask_ids: parse_list_value(fm.get("subtasks")),
            description: sections::read(body, &sections::DESCRIPTION).unwrap_or_default(),
            plan: sections::read(body, &sections::PLAN).unwrap_or_default(),
            notes: sections::read(body, &sections::NOTES).unwrap_or_default(),
            final_summary: sections::read(body, &sections::FINAL_SUMMARY).unwrap_or_default(),
            acceptance_criteria: sections::parse_checklist(body, &sections::ACCEPTANCE_CRITERIA),
            definition_of_done: sections::parse_checklist(body, &sections::DEFINITION_OF_DONE),
            order: Order::from_value(fm.get("ordinal")),
            created_date: string_field(fm, "created_date"),
            updated_date: string_field(fm, "updated_date"),
            extra,
            file_path,
            folder,
            source,
            read_only,
            parse_degraded: doc.is_degraded(),
            body: body.clone(),
        })
    }

    pub fn branch(&self) -> Option<&str> {
        self.source.branch_name()
    }

    pub fn is_local(&self) -> bool {
        self.source == TaskSource::Local
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn variant_key(&self) -> VariantKey {
        VariantKey {
            id: self.id.clone(),
            file_path: self.file_path.clone(),
            branch: self.branch().map(str::to_string),
        }
    }

    pub fn matches_key(&self, key: &VariantKey) -> bool {
        ids_equal(&self.id, &key.id)
            && self.file_path == key.file_path
            && self.branch() == key.branch.as_deref()
    }

    pub fn is_variant(&self, id: &str, file_path: &Path) -> bool {
        ids_equal(&self.id, id) && self.file_path == file_path
    }
}

pub fn parse_task_text(
    text: &str,
    file_path: PathBuf,
    folder: TaskFolder,
    source: TaskSource,
) -> Result<Task, TaskParseError> {
    let doc = frontmatter::parse(text);
    Task::from_document(&doc, file_path.clone(), folder, source)
        .ok_or(TaskParseError::MissingId(file_path))
}

pub fn parse_task_file(path: &Path, folder: TaskFolder) -> Result<Task, TaskParseError> {
    let text = fs::read_to_string(path).map_err(|source| TaskParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_task_text(&text, path.to_path_buf(), folder, TaskSource::Local)
}

pub fn ids_equal(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

pub fn id_key(id: &str) -> String {
    id.trim().to_lowercase()
}

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z][A-Za-z0-9_]*)-(\d+(?:\.\d+)*)").expect("regex"))
}

/// Lowercased prefix and numeric segments, e.g. `TASK-2.10` -> ("task", [2, 10]).
pub fn id_parts(id: &str) -> Option<(String, Vec<u64>)> {
    let caps = id_pattern().captures(id.trim())?;
    let prefix = caps.get(1)?.as_str().to_lowercase();
    let numbers = caps
        .get(2)?
        .as_str()
        .split('.')
        .map(|part| part.parse::<u64>().unwrap_or(u64::MAX))
        .collect();
    Some((prefix, numbers))
}

/// Natural ordering: prefix, then numeric segments, then raw text.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (id_parts(a), id_parts(b)) {
        (Some(pa), Some(pb)) => pa.cmp(&pb).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)),
    }
}

/// Column display order: explicit ordinals ascending, then the rest by id.
pub fn compare_for_column(a: &Task, b: &Task) -> Ordering {
    a.order
        .cmp_position(b.order)
        .then_with(|| compare_ids(&a.id, &b.id))
        .then_with(|| a.file_path.cmp(&b.file_path))
}

fn id_from_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    id_pattern()
        .captures(stem)
        .and_then(|cap| cap.get(0))
        .map(|m| m.as_str().to_string())
}

fn title_from_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    stem.split_once(" - ")
        .map(|(_, title)| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

fn string_field(fm: &Mapping, key: &str) -> Option<String> {
    fm.get(key)
        .and_then(value_to_string)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn parse_list_value(value: Option<&Value>) -> Vec<String> {
    match value {
        None => Vec::new(),
        Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .filter_map(value_to_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => parse_list_string(s),
        Some(other) => value_to_string(other)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(|s| vec![s])
            .unwrap_or_default(),
    }
}

fn parse_list_string(value: &str) -> Vec<String> {
    let raw = value.trim();
    let inner = raw
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(raw)
        .trim();
    if inner.is_empty() {
        return Vec::new();
    }
    inner
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

pub fn tasks_to_json(tasks: &[&Task]) -> String {
    serde_json::to_string_pretty(tasks).unwrap_or_else(|_| "[]".to_string())
}
