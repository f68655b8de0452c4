use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::frontmatter::{self, Document};
use crate::sections::{self, ChecklistItem};
use crate::task::{id_parts, ids_equal, Order, Priority};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Partial update of a task. `None` leaves a field untouched; for optional
/// scalars `Some(None)` removes the key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub status: Option<String>,
    pub priority: Option<Option<Priority>>,
    pub milestone: Option<Option<String>>,
    pub labels: Option<Vec<String>>,
    pub assignee: Option<Vec<String>>,
    pub dependencies: Option<Vec<String>>,
    pub references: Option<Vec<String>>,
    pub documentation: Option<Vec<String>>,
    pub ordinal: Option<Order>,
    pub description: Option<String>,
    pub plan: Option<String>,
    pub notes: Option<String>,
    pub final_summary: Option<String>,
    pub acceptance_criteria: Option<Vec<ChecklistItem>>,
    pub definition_of_done: Option<Vec<ChecklistItem>>,
}

impl TaskPatch {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Self::default()
        }
    }

    pub fn ordinal(value: f64) -> Self {
        Self {
            ordinal: Some(Order::Explicit(value)),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies present fields to the document. Keys keep their position when
    /// replaced; unknown keys are never touched.
    pub fn apply(&self, doc: &mut Document) {
        let fm = &mut doc.front_matter;
        if let Some(title) = &self.title {
            set_value(fm, "title", Some(Value::String(title.trim().to_string())));
        }
        if let Some(status) = &self.status {
            set_value(fm, "status", Some(Value::String(status.trim().to_string())));
        }
        if let Some(priority) = &self.priority {
            set_value(fm, "priority", priority.map(|p| Value::String(p.as_str().to_string())));
        }
        if let Some(milestone) = &self.milestone {
            let milestone = milestone
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(|m| Value::String(m.to_string()));
            set_value(fm, "milestone", milestone);
        }
        for (key, list) in [
            ("labels", &self.labels),
            ("assignee", &self.assignee),
            ("dependencies", &self.dependencies),
            ("references", &self.references),
            ("documentation", &self.documentation),
        ] {
            if let Some(list) = list {
                set_value(fm, key, Some(list_value(list)));
            }
        }
        if let Some(order) = self.ordinal {
            set_value(fm, "ordinal", order.to_value());
        }

        let mut body = std::mem::take(&mut doc.body);
        for (spec, content) in [
            (&sections::DESCRIPTION, &self.description),
            (&sections::PLAN, &self.plan),
            (&sections::NOTES, &self.notes),
            (&sections::FINAL_SUMMARY, &self.final_summary),
        ] {
            if let Some(content) = content {
                body = sections::write(&body, spec, content);
            }
        }
        for (spec, items) in [
            (&sections::ACCEPTANCE_CRITERIA, &self.acceptance_criteria),
            (&sections::DEFINITION_OF_DONE, &self.definition_of_done),
        ] {
            if let Some(items) = items {
                body = sections::write_checklist(&body, spec, items);
            }
        }
        doc.body = body;
    }
}

pub fn set_value(fm: &mut Mapping, key: &str, value: Option<Value>) {
    match value {
        Some(value) => {
            fm.insert(Value::String(key.to_string()), value);
        }
        None if fm.contains_key(key) => {
            *fm = fm
                .iter()
                .filter(|(k, _)| k.as_str() != Some(key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        None => {}
    }
}

pub fn list_value(items: &[String]) -> Value {
    Value::Sequence(
        items
            .iter()
            .map(|item| item.trim())
            .filter(|item| !item.is_empty())
            .map(|item| Value::String(item.to_string()))
            .collect(),
    )
}

/// Writes `updated_date` in the style the file already uses for its dates.
pub fn stamp_updated_date(doc: &mut Document, now: NaiveDateTime) {
    let existing = ["updated_date", "created_date"]
        .iter()
        .find_map(|key| doc.get(key).and_then(frontmatter::value_to_string));
    let format = match existing {
        Some(date) if !date.contains(':') => DATE_FORMAT,
        _ => DATETIME_FORMAT,
    };
    set_value(
        &mut doc.front_matter,
        "updated_date",
        Some(Value::String(now.format(format).to_string())),
    );
}

/// Input for a new task file.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub status: Option<String>,
    pub priority: Option<Priority>,
    pub milestone: Option<String>,
    pub labels: Vec<String>,
    pub assignee: Vec<String>,
    pub dependencies: Vec<String>,
    pub parent_task_id: Option<String>,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub ordinal: Option<f64>,
    /// Written to `drafts/` instead of `tasks/`.
    pub draft: bool,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Next free id: `<prefix>-<max+1>` at top level, `<parent>.<max+1>` for a
/// subtask.
pub fn next_task_id<'a>(
    prefix: &str,
    existing: impl IntoIterator<Item = &'a str>,
    parent: Option<&str>,
) -> String {
    let existing: Vec<&str> = existing.into_iter().collect();
    if let Some(parent) = parent {
        let parent = parent.trim();
        let next = existing
            .iter()
            .filter_map(|id| {
                let (head, tail) = id.trim().rsplit_once('.')?;
                if !ids_equal(head, parent) {
                    return None;
                }
                tail.parse::<u64>().ok()
            })
            .max()
            .unwrap_or(0)
            + 1;
        return format!("{}.{}", parent, next);
    }

    let wanted = prefix.trim().to_lowercase();
    let next = existing
        .iter()
        .filter_map(|id| id_parts(id))
        .filter(|(found, _)| *found == wanted)
        .filter_map(|(_, numbers)| numbers.first().copied())
        .filter(|number| *number != u64::MAX)
        .max()
        .unwrap_or(0)
        + 1;
    format!("{}-{}", prefix.trim(), next)
}

pub fn task_filename(id: &str, title: &str) -> String {
    format!("{} - {}.md", id, slug_title(title))
}

/// Canonical text of a new task file.
pub fn render_new_task(id: &str, task: &NewTask, default_status: &str, now: NaiveDateTime) -> String {
    let mut fm = Mapping::new();
    let status = task
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_status);
    set_value(&mut fm, "id", Some(Value::String(id.to_string())));
    set_value(&mut fm, "title", Some(Value::String(task.title.trim().to_string())));
    set_value(&mut fm, "status", Some(Value::String(status.to_string())));
    set_value(&mut fm, "assignee", Some(list_value(&task.assignee)));
    set_value(
        &mut fm,
        "created_date",
        Some(Value::String(now.format(DATETIME_FORMAT).to_string())),
    );
    set_value(&mut fm, "labels", Some(list_value(&task.labels)));
    if let Some(milestone) = task.milestone.as_deref().filter(|m| !m.trim().is_empty()) {
        set_value(&mut fm, "milestone", Some(Value::String(milestone.trim().to_string())));
    }
    set_value(&mut fm, "dependencies", Some(list_value(&task.dependencies)));
    if let Some(parent) = task.parent_task_id.as_deref() {
        set_value(&mut fm, "parent_task_id", Some(Value::String(parent.trim().to_string())));
    }
    if let Some(priority) = task.priority {
        set_value(&mut fm, "priority", Some(Value::String(priority.as_str().to_string())));
    }
    if let Some(ordinal) = task.ordinal {
        set_value(&mut fm, "ordinal", Order::Explicit(ordinal).to_value());
    }

    let mut body = sections::write("", &sections::DESCRIPTION, &task.description);
    if !task.acceptance_criteria.is_empty() {
        let items: Vec<ChecklistItem> = task
            .acceptance_criteria
            .iter()
            .map(|text| ChecklistItem::new(text.as_str(), false))
            .collect();
        body = sections::write_checklist(&body, &sections::ACCEPTANCE_CRITERIA, &items);
    }
    frontmatter::serialize(&fm, &body)
}

pub fn slug_title(title: &str) -> String {
    static STRIP: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();
    let strip = STRIP.get_or_init(|| Regex::new(r"[^a-zA-Z0-9\s\-]").expect("regex"));
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").expect("regex"));
    let cleaned = strip.replace_all(title, "");
    let cleaned = cleaned.trim().to_lowercase();
    let cleaned = spaces.replace_all(&cleaned, " ").to_string();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use crate::task::{Task, TaskFolder, TaskSource};
    use std::path::PathBuf;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 5)
            .and_then(|d| d.and_hms_opt(h, m, 0))
            .expect("datetime")
    }

    #[test]
    fn apply_touches_only_present_fields() {
        let text = "---\nid: task-1\ntitle: Old\nstatus: To Do\ncustom: stays\npriority: low\n---\n\nBody\n";
        let mut doc = frontmatter::parse(text);
        let patch = TaskPatch {
            status: Some("Done".to_string()),
            priority: Some(None),
            labels: Some(vec!["ui".to_string(), " ".to_string()]),
            ..TaskPatch::default()
        };
        patch.apply(&mut doc);
        assert_eq!(
            doc.render(),
            "---\nid: task-1\ntitle: Old\nstatus: Done\nlabels:\n  - ui\ncustom: stays\n---\n\nBody\n"
        );
    }

    #[test]
    fn apply_writes_sections_and_checklists() {
        let mut doc = frontmatter::parse("---\nid: task-1\n---\n");
        let patch = TaskPatch {
            description: Some("What to build".to_string()),
            acceptance_criteria: Some(vec![
                ChecklistItem::new("First", true),
                ChecklistItem::new("Second", false),
            ]),
            ordinal: Some(Order::Explicit(1500.0)),
            ..TaskPatch::default()
        };
        patch.apply(&mut doc);
        let task = Task::from_document(&doc, PathBuf::from("tasks/task-1.md"), TaskFolder::Tasks, TaskSource::Local)
            .expect("task");
        assert_eq!(task.description, "What to build");
        assert_eq!(task.acceptance_criteria.len(), 2);
        assert_eq!(task.acceptance_criteria[1].sequential_id, 2);
        assert_eq!(task.order, Order::Explicit(1500.0));
        assert!(doc.render().contains("ordinal: 1500\n"));
    }

    #[test]
    fn unordered_patch_removes_ordinal_key() {
        let mut doc = frontmatter::parse("---\nid: task-1\nordinal: 3000\n---\n");
        TaskPatch {
            ordinal: Some(Order::Unordered),
            ..TaskPatch::default()
        }
        .apply(&mut doc);
        assert_eq!(doc.render(), "---\nid: task-1\n---\n");
    }

    #[test]
    fn stamp_matches_existing_date_style() {
        let mut date_only = frontmatter::parse("---\nid: task-1\ncreated_date: '2025-01-01'\n---\n");
        stamp_updated_date(&mut date_only, at(9, 30));
        assert_eq!(
            date_only.get("updated_date"),
            Some(&Value::String("2025-06-05".to_string()))
        );

        let mut with_time = frontmatter::parse("---\nid: task-1\nupdated_date: '2025-01-01 08:00'\n---\n");
        stamp_updated_date(&mut with_time, at(9, 30));
        assert_eq!(
            with_time.get("updated_date"),
            Some(&Value::String("2025-06-05 09:30".to_string()))
        );
    }

    #[test]
    fn next_task_id_uses_max_plus_one() {
        let ids = ["task-1", "TASK-7", "task-3.4", "other-99"];
        assert_eq!(next_task_id("task", ids.iter().copied(), None), "task-8");
        assert_eq!(next_task_id("task", ids.iter().copied(), Some("task-3")), "task-3.5");
        assert_eq!(next_task_id("task", std::iter::empty(), Some("task-9")), "task-9.1");
        assert_eq!(next_task_id("feat", std::iter::empty(), None), "feat-1");
    }

    #[test]
    fn render_new_task_parses_back() {
        let draft = NewTask {
            description: "Explain it".to_string(),
            acceptance_criteria: vec!["Works".to_string()],
            labels: vec!["core".to_string()],
            priority: Some(Priority::High),
            ..NewTask::new("Add: board view!")
        };
        let text = render_new_task("task-4", &draft, "To Do", at(12, 0));
        let doc = frontmatter::parse(&text);
        assert!(!doc.is_degraded());
        let task = Task::from_document(&doc, PathBuf::from("tasks/x.md"), TaskFolder::Tasks, TaskSource::Local)
            .expect("task");
        assert_eq!(task.id, "task-4");
        assert_eq!(task.title, "Add: board view!");
        assert_eq!(task.status, "To Do");
        assert_eq!(task.created_date.as_deref(), Some("2025-06-05 12:00"));
        assert_eq!(task.description, "Explain it");
        assert_eq!(task.acceptance_criteria[0].text, "Works");
        assert_eq!(frontmatter::parse(&text).render(), text);
    }

    #[test]
    fn slug_title_strips_punctuation() {
        assert_eq!(slug_title("Add: board   view!"), "add board view");
        assert_eq!(slug_title("!!!"), "untitled");
        assert_eq!(task_filename("task-2", "Fix it"), "task-2 - fix it.md");
    }
}
