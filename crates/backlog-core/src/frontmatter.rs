//! Lossless front matter codec for task files.
//!
//! A task file is an optional YAML block delimited by `---` lines followed by a
//! Markdown body. Parsing never fails: anything that cannot be read as a YAML
//! mapping degrades to an empty front matter and the whole input as body.
//!
//! A parsed block keeps its source lines. Rendering writes untouched keys,
//! comments and line endings back as they were and re-emits only the keys
//! whose values changed, the way a line-level edit would.

use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;
use serde_yaml::{Mapping, Value};

pub const DELIMITER: &str = "---";

/// Known keys, in the order they are written back.
pub const CANONICAL_KEYS: [&str; 16] = [
    "id",
    "title",
    "status",
    "assignee",
    "reporter",
    "created_date",
    "updated_date",
    "labels",
    "milestone",
    "dependencies",
    "references",
    "documentation",
    "parent_task_id",
    "subtasks",
    "priority",
    "ordinal",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseDegraded {
    MissingFrontMatter,
    MissingFrontMatterEnd,
    InvalidYaml,
    NotAMapping,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub front_matter: Mapping,
    pub body: String,
    pub degraded: Option<ParseDegraded>,
    layout: Option<Layout>,
}

impl Document {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.front_matter.get(key)
    }

    /// Line ending of the front matter block, `\n` when there is none.
    pub fn line_ending(&self) -> &'static str {
        self.layout.as_ref().map(|layout| layout.eol).unwrap_or("\n")
    }

    pub fn render(&self) -> String {
        match &self.layout {
            Some(layout) => layout.render(&self.front_matter, &self.body),
            None => serialize(&self.front_matter, &self.body),
        }
    }
}

/// Source text of a parsed block, split into top-level entries.
#[derive(Debug, Clone, PartialEq)]
struct Layout {
    open: String,
    segments: Vec<Segment>,
    close: String,
    eol: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    /// A key line and its indented continuation, with the value it parsed to.
    Entry { key: Value, value: Value, text: String },
    /// Comments and blank lines between entries.
    Verbatim(String),
}

impl Layout {
    fn read(text: &str, split: &Split<'_>, front_matter: &Mapping) -> Option<Layout> {
        let mut segments = Vec::new();
        let mut entry: Option<String> = None;
        let mut blanks = String::new();
        for line in split.front.split_inclusive('\n') {
            if let Some(current) = entry.as_mut() {
                if is_continuation(line) {
                    current.push_str(&blanks);
                    current.push_str(line);
                    blanks.clear();
                    continue;
                }
                if line.trim().is_empty() {
                    blanks.push_str(line);
                    continue;
                }
            }
            if let Some(done) = entry.take() {
                segments.push(entry_segment(done)?);
            }
            if !blanks.is_empty() {
                segments.push(Segment::Verbatim(std::mem::take(&mut blanks)));
            }
            if line.trim().is_empty() || line.starts_with('#') || is_continuation(line) {
                segments.push(Segment::Verbatim(line.to_string()));
            } else {
                entry = Some(line.to_string());
            }
        }
        if let Some(done) = entry.take() {
            segments.push(entry_segment(done)?);
        }
        if !blanks.is_empty() {
            segments.push(Segment::Verbatim(blanks));
        }

        // Each entry must stand alone and agree with the whole-block parse,
        // otherwise (anchors, odd indentation) fall back to canonical output.
        let mut entries = 0;
        for segment in &segments {
            if let Segment::Entry { key, value, .. } = segment {
                if front_matter.get(key) != Some(value) {
                    return None;
                }
                entries += 1;
            }
        }
        if entries != front_matter.len() {
            return None;
        }

        let open = &text[..split.front_start];
        let eol = if open.ends_with("\r\n") { "\r\n" } else { "\n" };
        Some(Layout {
            open: open.to_string(),
            segments,
            close: text[split.front_start + split.front.len()..split.body_start].to_string(),
            eol,
        })
    }

    fn render(&self, front_matter: &Mapping, body: &str) -> String {
        let mut blocks: Vec<(Option<&Value>, String)> = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Verbatim(text) => blocks.push((None, text.clone())),
                Segment::Entry { key, value, text } => match front_matter.get(key) {
                    Some(current) if current == value => blocks.push((Some(key), text.clone())),
                    Some(current) => blocks.push((Some(key), self.entry_text(key, current))),
                    None => {}
                },
            }
        }
        for (key, value) in ordered_entries(front_matter) {
            if blocks.iter().any(|(existing, _)| *existing == Some(key)) {
                continue;
            }
            let at = insertion_point(&blocks, key);
            blocks.insert(at, (Some(key), self.entry_text(key, value)));
        }

        let mut out = self.open.clone();
        for (_, text) in &blocks {
            out.push_str(text);
        }
        out.push_str(&self.close);
        out.push_str(body);
        out
    }

    fn entry_text(&self, key: &Value, value: &Value) -> String {
        let mut out = String::new();
        emit_entry(&mut out, key, value);
        if self.eol == "\n" {
            out
        } else {
            out.replace('\n', self.eol)
        }
    }
}

fn entry_segment(text: String) -> Option<Segment> {
    let map: Mapping = serde_yaml::from_str(&text).ok()?;
    if map.len() != 1 {
        return None;
    }
    let (key, value) = map.into_iter().next()?;
    Some(Segment::Entry { key, value, text })
}

fn is_continuation(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t') || line.starts_with('-')
}

/// Known keys go after the closest earlier known key, unknown keys after the
/// last entry.
fn insertion_point(blocks: &[(Option<&Value>, String)], key: &Value) -> usize {
    let after_last_entry = blocks
        .iter()
        .rposition(|(existing, _)| existing.is_some())
        .map(|idx| idx + 1)
        .unwrap_or(blocks.len());
    let Some(rank) = canonical_rank(key) else {
        return after_last_entry;
    };
    blocks
        .iter()
        .rposition(|(existing, _)| {
            existing
                .and_then(canonical_rank)
                .map(|other| other < rank)
                .unwrap_or(false)
        })
        .map(|idx| idx + 1)
        .unwrap_or_else(|| {
            blocks
                .iter()
                .position(|(existing, _)| existing.is_some())
                .unwrap_or(blocks.len())
        })
}

fn canonical_rank(key: &Value) -> Option<usize> {
    let name = key.as_str()?;
    CANONICAL_KEYS.iter().position(|known| *known == name)
}

/// Raw delimiter positions of a front matter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split<'a> {
    pub front: &'a str,
    pub front_start: usize,
    pub body_start: usize,
}

pub fn split_front_matter(text: &str) -> Result<Split<'_>, ParseDegraded> {
    let first_end = match text.find('\n') {
        Some(idx) => idx,
        None => {
            return Err(if is_delimiter(text) {
                ParseDegraded::MissingFrontMatterEnd
            } else {
                ParseDegraded::MissingFrontMatter
            })
        }
    };
    if !is_delimiter(&text[..first_end]) {
        return Err(ParseDegraded::MissingFrontMatter);
    }

    let front_start = first_end + 1;
    let mut offset = front_start;
    while offset < text.len() {
        let line_end = text[offset..]
            .find('\n')
            .map(|idx| offset + idx)
            .unwrap_or(text.len());
        if is_delimiter(&text[offset..line_end]) {
            let body_start = (line_end + 1).min(text.len());
            return Ok(Split {
                front: &text[front_start..offset],
                front_start,
                body_start,
            });
        }
        offset = line_end + 1;
    }
    Err(ParseDegraded::MissingFrontMatterEnd)
}

pub fn parse(text: &str) -> Document {
    let split = match split_front_matter(text) {
        Ok(split) => split,
        Err(reason) => return degraded(text, reason),
    };
    let front_matter = match serde_yaml::from_str::<Value>(split.front) {
        Ok(Value::Mapping(map)) => map,
        Ok(Value::Null) => Mapping::new(),
        Ok(_) => return degraded(text, ParseDegraded::NotAMapping),
        Err(_) => return degraded(text, ParseDegraded::InvalidYaml),
    };
    let layout = Layout::read(text, &split, &front_matter);
    Document {
        front_matter,
        body: text[split.body_start..].to_string(),
        degraded: None,
        layout,
    }
}

/// Writes known keys in canonical order, then unknown keys in insertion order.
/// An empty mapping produces the body alone. Used for new files and for
/// blocks whose source lines could not be kept.
pub fn serialize(front_matter: &Mapping, body: &str) -> String {
    if front_matter.is_empty() {
        return body.to_string();
    }
    let mut out = String::new();
    out.push_str(DELIMITER);
    out.push('\n');
    for (key, value) in ordered_entries(front_matter) {
        emit_entry(&mut out, key, value);
    }
    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(body);
    out
}

pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(val) => Some(val.clone()),
        Value::Number(num) => Some(num.to_string()),
        Value::Bool(val) => Some(val.to_string()),
        Value::Null => None,
        _ => serde_yaml::to_string(value).ok().map(|s| s.trim().to_string()),
    }
}

fn degraded(text: &str, reason: ParseDegraded) -> Document {
    Document {
        front_matter: Mapping::new(),
        body: text.to_string(),
        degraded: Some(reason),
        layout: None,
    }
}

fn is_delimiter(line: &str) -> bool {
    line.trim_end() == DELIMITER
}

fn ordered_entries(map: &Mapping) -> Vec<(&Value, &Value)> {
    let mut entries = Vec::with_capacity(map.len());
    for key in CANONICAL_KEYS {
        if let Some((k, v)) = map.iter().find(|(k, _)| k.as_str() == Some(key)) {
            entries.push((k, v));
        }
    }
    for (k, v) in map {
        let known = k
            .as_str()
            .map(|name| CANONICAL_KEYS.contains(&name))
            .unwrap_or(false);
        if !known {
            entries.push((k, v));
        }
    }
    entries
}

fn emit_entry(out: &mut String, key: &Value, value: &Value) {
    let key = render_scalar(key).unwrap_or_else(|| "''".to_string());
    match value {
        Value::Null => {
            let _ = writeln!(out, "{}:", key);
        }
        Value::Sequence(items) if items.is_empty() => {
            let _ = writeln!(out, "{}: []", key);
        }
        Value::Mapping(map) if map.is_empty() => {
            let _ = writeln!(out, "{}: {{}}", key);
        }
        Value::Sequence(items) if items.iter().all(|item| render_scalar(item).is_some()) => {
            let _ = writeln!(out, "{}:", key);
            for item in items.iter().filter_map(render_scalar) {
                let _ = writeln!(out, "  - {}", item);
            }
        }
        other => match render_scalar(other) {
            Some(scalar) => {
                let _ = writeln!(out, "{}: {}", key, scalar);
            }
            None => emit_nested(out, &key, other),
        },
    }
}

fn emit_nested(out: &mut String, key: &str, value: &Value) {
    let rendered = serde_yaml::to_string(value).unwrap_or_else(|_| "~\n".to_string());
    let lines: Vec<&str> = rendered.lines().collect();
    // Tagged scalars stay inline; collections always go block style.
    if lines.len() == 1 && matches!(value, Value::Tagged(_)) {
        let _ = writeln!(out, "{}: {}", key, lines[0]);
        return;
    }
    let _ = writeln!(out, "{}:", key);
    for line in lines {
        let _ = writeln!(out, "  {}", line);
    }
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("null".to_string()),
        Value::Bool(val) => Some(val.to_string()),
        Value::Number(num) => Some(num.to_string()),
        Value::String(s) => Some(quote_string(s)),
        _ => None,
    }
}

/// Plain when unambiguous, single-quoted otherwise, double-quoted only for
/// strings carrying control characters.
pub fn quote_string(s: &str) -> String {
    if s.chars().any(char::is_control) {
        return double_quoted(s);
    }
    if is_plain_safe(s) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "''"))
}

fn double_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn is_plain_safe(s: &str) -> bool {
    let Some(first) = s.chars().next() else {
        return false;
    };
    if s.trim() != s {
        return false;
    }
    if "-?:,[]{}#&*!|>'\"%@`".contains(first) {
        return false;
    }
    if s.contains(": ") || s.contains(" #") || s.ends_with(':') {
        return false;
    }
    if looks_like_other_type(s) {
        return false;
    }
    matches!(serde_yaml::from_str::<Value>(s), Ok(Value::String(parsed)) if parsed == s)
}

// YAML 1.1 readers resolve these as booleans or timestamps.
fn looks_like_other_type(s: &str) -> bool {
    const BOOLISH: [&str; 8] = ["y", "n", "yes", "no", "on", "off", "true", "false"];
    if BOOLISH.iter().any(|word| s.eq_ignore_ascii_case(word)) {
        return true;
    }
    static DATE: OnceLock<Regex> = OnceLock::new();
    DATE.get_or_init(|| Regex::new(r"^\d{4}-\d{1,2}-\d{1,2}").expect("regex"))
        .is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn split_front_matter_finds_body_offset() {
        let text = "---\nid: task-1\n---\nBody\n";
        let split = split_front_matter(text).expect("split");
        assert_eq!(split.front, "id: task-1\n");
        assert_eq!(&text[split.body_start..], "Body\n");
    }

    #[test]
    fn missing_opening_delimiter_degrades_to_body() {
        let doc = parse("# Just markdown\n");
        assert!(doc.front_matter.is_empty());
        assert_eq!(doc.body, "# Just markdown\n");
        assert_eq!(doc.degraded, Some(ParseDegraded::MissingFrontMatter));
    }

    #[test]
    fn missing_closing_delimiter_degrades_to_body() {
        let text = "---\nid: task-1\ntitle: Open\n";
        let doc = parse(text);
        assert!(doc.front_matter.is_empty());
        assert_eq!(doc.body, text);
        assert_eq!(doc.degraded, Some(ParseDegraded::MissingFrontMatterEnd));
    }

    #[test]
    fn invalid_yaml_degrades_to_body() {
        let text = "---\nid: [unclosed\n---\nBody\n";
        let doc = parse(text);
        assert!(doc.front_matter.is_empty());
        assert_eq!(doc.body, text);
        assert_eq!(doc.degraded, Some(ParseDegraded::InvalidYaml));
    }

    #[test]
    fn scalar_front_matter_is_not_a_mapping() {
        let doc = parse("---\njust a string\n---\nBody\n");
        assert_eq!(doc.degraded, Some(ParseDegraded::NotAMapping));
    }

    #[test]
    fn serialize_orders_known_keys_before_unknown() {
        let doc = parse("---\ncustom: keep\nstatus: To Do\nid: task-1\nzeta: 2\n---\nBody\n");
        let rendered = serialize(&doc.front_matter, &doc.body);
        assert_eq!(
            rendered,
            "---\nid: task-1\nstatus: To Do\ncustom: keep\nzeta: 2\n---\nBody\n"
        );
    }

    #[test]
    fn canonical_text_round_trips_byte_identically() {
        let text = "---\n\
id: task-7\n\
title: 'Fix: parser'\n\
status: In Progress\n\
assignee:\n  - '@alice'\n\
created_date: '2025-06-04 14:00'\n\
labels: []\n\
dependencies:\n  - task-3\n\
ordinal: 1500\n\
custom_flag: true\n\
---\n\n## Description\n\nBody text\n";
        assert_eq!(parse(text).render(), text);
    }

    #[test]
    fn serialization_reaches_fixed_point_after_one_pass() {
        let text = "---\nlabels: [a, b]\ntitle: \"Quoted\"\nid: task-2\nextra:\n  nested: [1, 2]\n  deep:\n    key: value\nnote: \"line one\\nline two\"\n---\nBody";
        let once = parse(text).render();
        let twice = parse(&once).render();
        assert_eq!(once, twice);
        assert_eq!(parse(&once).front_matter, parse(text).front_matter);
    }

    #[test]
    fn quote_string_picks_consistent_style() {
        assert_eq!(quote_string("To Do"), "To Do");
        assert_eq!(quote_string("yes"), "'yes'");
        assert_eq!(quote_string("123"), "'123'");
        assert_eq!(quote_string("2025-01-02"), "'2025-01-02'");
        assert_eq!(quote_string("a: b"), "'a: b'");
        assert_eq!(quote_string("it's"), "it's");
        assert_eq!(quote_string("'quoted'"), "'''quoted'''");
        assert_eq!(quote_string("two\nlines"), "\"two\\nlines\"");
        assert_eq!(quote_string(""), "''");
    }

    #[test]
    fn empty_mapping_serializes_to_body_only() {
        assert_eq!(serialize(&Mapping::new(), "Body\n"), "Body\n");
        let doc = parse("plain body");
        assert_eq!(doc.render(), "plain body");
    }

    #[test]
    fn nested_values_are_written_block_style() {
        let doc = parse("---\nid: task-1\nmeta: {a: 1}\nlinks: [{url: x}]\n---\n");
        assert_eq!(
            serialize(&doc.front_matter, &doc.body),
            "---\nid: task-1\nmeta:\n  a: 1\nlinks:\n  - url: x\n---\n"
        );
    }

    #[test]
    fn null_values_keep_key_presence() {
        let doc = parse("---\nid: task-1\nmilestone:\n---\n");
        assert_eq!(doc.render(), "---\nid: task-1\nmilestone:\n---\n");
    }

    #[test]
    fn untouched_lines_and_comments_survive_an_edit() {
        let text = "---\nid: task-1\n# owner: platform team\nstatus: To Do\nlabels: [a, b]\nnotes: |\n  first\n\n  second\n---\nBody\n";
        let mut doc = parse(text);
        assert_eq!(doc.render(), text);

        doc.front_matter
            .insert(Value::from("status"), Value::from("Done"));
        doc.front_matter
            .insert(Value::from("updated_date"), Value::from("2025-06-05"));
        assert_eq!(
            doc.render(),
            "---\nid: task-1\n# owner: platform team\nstatus: Done\nupdated_date: '2025-06-05'\nlabels: [a, b]\nnotes: |\n  first\n\n  second\n---\nBody\n"
        );
    }

    #[test]
    fn removed_keys_drop_their_continuation_lines() {
        let mut doc = parse("---\nid: task-1\nlabels:\n- a\n- b\ncustom: 1\n---\n");
        doc.front_matter.remove("labels");
        assert_eq!(doc.render(), "---\nid: task-1\ncustom: 1\n---\n");
    }

    #[test]
    fn empty_block_keeps_its_delimiters() {
        let text = "---\n---\nBody\n";
        let doc = parse(text);
        assert!(!doc.is_degraded());
        assert!(doc.front_matter.is_empty());
        assert_eq!(doc.render(), text);

        let mut doc = parse(text);
        doc.front_matter.insert(Value::from("id"), Value::from("task-1"));
        assert_eq!(doc.render(), "---\nid: task-1\n---\nBody\n");
    }

    #[test]
    fn crlf_files_keep_crlf_front_matter() {
        let text = "---\r\nid: task-1\r\nstatus: To Do\r\n---\r\nBody\r\n";
        let mut doc = parse(text);
        assert_eq!(doc.line_ending(), "\r\n");
        assert_eq!(doc.render(), text);

        doc.front_matter
            .insert(Value::from("status"), Value::from("In Progress"));
        doc.front_matter
            .insert(Value::from("labels"), Value::Sequence(vec![Value::from("ui")]));
        assert_eq!(
            doc.render(),
            "---\r\nid: task-1\r\nstatus: In Progress\r\nlabels:\r\n  - ui\r\n---\r\nBody\r\n"
        );
    }

    #[test]
    fn unkeepable_blocks_fall_back_to_canonical_output() {
        let doc = parse("---\nbase: &b 1\nid: task-1\nother: *b\n---\n");
        assert!(!doc.is_degraded());
        assert_eq!(doc.render(), "---\nid: task-1\nbase: 1\nother: 1\n---\n");
    }
}
