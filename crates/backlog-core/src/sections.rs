//! Marked-section editing over a Markdown task body.
//!
//! Sections are bounded by `<!-- <MARKER>:BEGIN -->` / `<!-- <MARKER>:END -->`
//! comment pairs. Bodies written by hand or by older tools may only carry a
//! `## Heading`, so every operation falls back to heading detection.

use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    AfterFrontMatter,
    EndOfBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionSpec {
    pub heading: &'static str,
    pub marker: &'static str,
    pub placement: Placement,
}

impl SectionSpec {
    pub fn begin_marker(&self) -> String {
        format!("<!-- {}:BEGIN -->", self.marker)
    }

    pub fn end_marker(&self) -> String {
        format!("<!-- {}:END -->", self.marker)
    }
}

pub const DESCRIPTION: SectionSpec = SectionSpec {
    heading: "Description",
    marker: "SECTION:DESCRIPTION",
    placement: Placement::AfterFrontMatter,
};

pub const PLAN: SectionSpec = SectionSpec {
    heading: "Implementation Plan",
    marker: "SECTION:PLAN",
    placement: Placement::EndOfBody,
};

pub const NOTES: SectionSpec = SectionSpec {
    heading: "Implementation Notes",
    marker: "SECTION:NOTES",
    placement: Placement::EndOfBody,
};

pub const FINAL_SUMMARY: SectionSpec = SectionSpec {
    heading: "Final Summary",
    marker: "SECTION:FINAL_SUMMARY",
    placement: Placement::EndOfBody,
};

pub const ACCEPTANCE_CRITERIA: SectionSpec = SectionSpec {
    heading: "Acceptance Criteria",
    marker: "AC",
    placement: Placement::EndOfBody,
};

pub const DEFINITION_OF_DONE: SectionSpec = SectionSpec {
    heading: "Definition of Done",
    marker: "DOD",
    placement: Placement::EndOfBody,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistKind {
    AcceptanceCriteria,
    DefinitionOfDone,
}

impl ChecklistKind {
    pub fn section(self) -> &'static SectionSpec {
        match self {
            ChecklistKind::AcceptanceCriteria => &ACCEPTANCE_CRITERIA,
            ChecklistKind::DefinitionOfDone => &DEFINITION_OF_DONE,
        }
    }

    pub fn label(self) -> &'static str {
        self.section().heading
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecklistItem {
    pub sequential_id: u32,
    pub text: String,
    pub checked: bool,
}

impl ChecklistItem {
    pub fn new(text: impl Into<String>, checked: bool) -> Self {
        Self {
            sequential_id: 0,
            text: text.into(),
            checked,
        }
    }
}

/// Byte range of a section's editable content within the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub content: Range<usize>,
    pub marked: bool,
}

#[derive(Debug, Clone, Copy)]
struct Line {
    start: usize,
    end: usize,
    next: usize,
}

fn lines(body: &str) -> Vec<Line> {
    let mut result = Vec::new();
    let mut start = 0;
    while start < body.len() {
        let end = body[start..]
            .find('\n')
            .map(|idx| start + idx)
            .unwrap_or(body.len());
        let next = (end + 1).min(body.len());
        result.push(Line { start, end, next });
        start = end + 1;
    }
    result
}

fn is_heading(text: &str) -> bool {
    text.trim_start().starts_with("## ")
}

fn heading_matches(text: &str, heading: &str) -> bool {
    text.trim_start()
        .strip_prefix("## ")
        .map(|rest| rest.trim().eq_ignore_ascii_case(heading))
        .unwrap_or(false)
}

pub fn locate(body: &str, spec: &SectionSpec) -> Option<Region> {
    let lines = lines(body);
    let begin = spec.begin_marker();
    let end = spec.end_marker();

    let begin_idx = lines
        .iter()
        .position(|line| body[line.start..line.end].trim() == begin);
    if let Some(begin_idx) = begin_idx {
        let end_line = lines
            .iter()
            .skip(begin_idx + 1)
            .find(|line| body[line.start..line.end].trim() == end);
        if let Some(end_line) = end_line {
            return Some(Region {
                content: lines[begin_idx].next..end_line.start,
                marked: true,
            });
        }
    }

    let heading_idx = lines
        .iter()
        .position(|line| heading_matches(&body[line.start..line.end], spec.heading))?;
    let start = lines[heading_idx].next;
    let stop = lines
        .iter()
        .skip(heading_idx + 1)
        .find(|line| is_heading(&body[line.start..line.end]))
        .map(|line| line.start)
        .unwrap_or(body.len());
    Some(Region {
        content: start..stop,
        marked: false,
    })
}

pub fn read(body: &str, spec: &SectionSpec) -> Option<String> {
    let region = locate(body, spec)?;
    let content = &body[region.content];
    Some(content.trim_matches(|c| c == '\n' || c == '\r').to_string())
}

/// Replaces a section's content: between existing markers, under an existing
/// heading (adding markers), or in a newly appended section.
pub fn write(body: &str, spec: &SectionSpec, content: &str) -> String {
    let content = content.trim_matches(|c| c == '\n' || c == '\r');
    let inner = if content.is_empty() {
        String::new()
    } else {
        format!("{}\n", content)
    };
    let marked_block = format!("{}\n{}{}\n", spec.begin_marker(), inner, spec.end_marker());

    match locate(body, spec) {
        Some(region) if region.marked => {
            let mut out = String::with_capacity(body.len() + inner.len());
            out.push_str(&body[..region.content.start]);
            out.push_str(&inner);
            out.push_str(&body[region.content.end..]);
            out
        }
        Some(region) => {
            let prefix = &body[..region.content.start];
            let rest = &body[region.content.end..];
            let mut out = String::with_capacity(body.len() + marked_block.len());
            out.push_str(prefix);
            if !prefix.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
            out.push_str(&marked_block);
            if !rest.is_empty() {
                out.push('\n');
            }
            out.push_str(rest);
            out
        }
        None => append(body, spec, &marked_block),
    }
}

fn append(body: &str, spec: &SectionSpec, marked_block: &str) -> String {
    let block = format!("## {}\n\n{}", spec.heading, marked_block);
    match spec.placement {
        Placement::AfterFrontMatter => {
            let rest = body.trim_start_matches(|c| c == '\n' || c == '\r');
            if rest.is_empty() {
                format!("\n{}", block)
            } else {
                format!("\n{}\n{}", block, rest)
            }
        }
        Placement::EndOfBody => {
            let mut out = body.to_string();
            if out.trim().is_empty() {
                out.clear();
            } else {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                if !out.ends_with("\n\n") {
                    out.push('\n');
                }
            }
            if out.is_empty() {
                out.push('\n');
            }
            out.push_str(&block);
            out
        }
    }
}

fn checklist_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*- \[([ xX])\]\s+(?:#\d+\s+)?(.*?)\s*$").expect("regex")
    })
}

/// Checklist items in positional order, numbered from 1.
pub fn parse_checklist(body: &str, spec: &SectionSpec) -> Vec<ChecklistItem> {
    let Some(region) = locate(body, spec) else {
        return Vec::new();
    };
    let re = checklist_line();
    body[region.content]
        .lines()
        .filter_map(|line| re.captures(line))
        .enumerate()
        .map(|(idx, caps)| ChecklistItem {
            sequential_id: idx as u32 + 1,
            text: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            checked: caps.get(1).map(|m| m.as_str() != " ").unwrap_or(false),
        })
        .collect()
}

pub fn render_checklist(items: &[ChecklistItem]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            format!(
                "- [{}] #{} {}",
                if item.checked { 'x' } else { ' ' },
                idx + 1,
                item.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn write_checklist(body: &str, spec: &SectionSpec, items: &[ChecklistItem]) -> String {
    write(body, spec, &render_checklist(items))
}

/// Flips the checkbox of the `sequential_id`-th checklist line. Every other
/// byte of the body is left as is.
pub fn toggle_checklist_item(body: &str, spec: &SectionSpec, sequential_id: u32) -> Option<String> {
    if sequential_id == 0 {
        return None;
    }
    let region = locate(body, spec)?;
    let re = checklist_line();
    let mut seen = 0u32;
    for line in lines(&body[region.content.clone()]) {
        let start = region.content.start + line.start;
        let end = region.content.start + line.end;
        let Some(caps) = re.captures(&body[start..end]) else {
            continue;
        };
        seen += 1;
        if seen != sequential_id {
            continue;
        }
        let mark = caps.get(1)?;
        let at = start + mark.start();
        let flipped = if mark.as_str() == " " { "x" } else { " " };
        let mut out = String::with_capacity(body.len());
        out.push_str(&body[..at]);
        out.push_str(flipped);
        out.push_str(&body[at + 1..]);
        return Some(out);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MARKED: &str = "\n## Description\n\n<!-- SECTION:DESCRIPTION:BEGIN -->\nOld text\n<!-- SECTION:DESCRIPTION:END -->\n\n## Acceptance Criteria\n<!-- AC:BEGIN -->\n- [ ] #1 First\n- [x] #2 Second item\n- [ ] #3 Third\n<!-- AC:END -->\n";

    #[test]
    fn read_prefers_markers() {
        assert_eq!(read(MARKED, &DESCRIPTION).as_deref(), Some("Old text"));
        assert_eq!(read(MARKED, &PLAN), None);
    }

    #[test]
    fn read_falls_back_to_heading() {
        let body = "## Description\n\nLegacy words\nmore\n\n## Notes\n- x\n";
        assert_eq!(read(body, &DESCRIPTION).as_deref(), Some("Legacy words\nmore"));
    }

    #[test]
    fn write_replaces_strictly_between_markers() {
        let updated = write(MARKED, &DESCRIPTION, "New text\nsecond line");
        assert_eq!(
            updated,
            MARKED.replace("Old text\n", "New text\nsecond line\n")
        );
    }

    #[test]
    fn write_wraps_legacy_heading_in_markers() {
        let body = "## Description\nLegacy\n\n## Implementation Plan\n1. Step\n";
        let updated = write(body, &DESCRIPTION, "Fresh");
        assert_eq!(
            updated,
            "## Description\n\n<!-- SECTION:DESCRIPTION:BEGIN -->\nFresh\n<!-- SECTION:DESCRIPTION:END -->\n\n## Implementation Plan\n1. Step\n"
        );
        assert_eq!(read(&updated, &PLAN).as_deref(), Some("1. Step"));
    }

    #[test]
    fn write_inserts_description_after_front_matter() {
        let updated = write("Some legacy text\n", &DESCRIPTION, "Hello");
        assert_eq!(
            updated,
            "\n## Description\n\n<!-- SECTION:DESCRIPTION:BEGIN -->\nHello\n<!-- SECTION:DESCRIPTION:END -->\n\nSome legacy text\n"
        );
    }

    #[test]
    fn write_appends_other_sections_at_end() {
        let updated = write("Intro\n", &FINAL_SUMMARY, "Shipped");
        assert_eq!(
            updated,
            "Intro\n\n## Final Summary\n\n<!-- SECTION:FINAL_SUMMARY:BEGIN -->\nShipped\n<!-- SECTION:FINAL_SUMMARY:END -->\n"
        );
    }

    #[test]
    fn repeated_writes_are_idempotent() {
        for body in ["", "Intro\n", "## Implementation Plan\nold\n", MARKED] {
            let once = write(body, &PLAN, "1. Do it");
            let twice = write(&once, &PLAN, "1. Do it");
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn parse_checklist_numbers_positionally() {
        let body = "## Acceptance Criteria\n<!-- AC:BEGIN -->\n- [ ] #4 First\nnot an item\n- [X] Second\n<!-- AC:END -->\n";
        let items = parse_checklist(body, &ACCEPTANCE_CRITERIA);
        assert_eq!(
            items,
            vec![
                ChecklistItem { sequential_id: 1, text: "First".to_string(), checked: false },
                ChecklistItem { sequential_id: 2, text: "Second".to_string(), checked: true },
            ]
        );
    }

    #[test]
    fn checklists_do_not_leak_across_sections() {
        let body = format!("{}\n## Definition of Done\n<!-- DOD:BEGIN -->\n- [ ] #1 Docs\n<!-- DOD:END -->\n", MARKED);
        assert_eq!(parse_checklist(&body, &ACCEPTANCE_CRITERIA).len(), 3);
        assert_eq!(parse_checklist(&body, &DEFINITION_OF_DONE).len(), 1);
    }

    #[test]
    fn toggle_flips_only_the_checkbox_character() {
        let toggled = toggle_checklist_item(MARKED, &ACCEPTANCE_CRITERIA, 2).expect("toggle");
        assert_eq!(toggled, MARKED.replace("- [x] #2 Second item", "- [ ] #2 Second item"));
        let again = toggle_checklist_item(&toggled, &ACCEPTANCE_CRITERIA, 3).expect("toggle");
        assert_eq!(
            again,
            toggled.replace("- [ ] #3 Third", "- [x] #3 Third")
        );
    }

    #[test]
    fn toggle_out_of_range_is_none() {
        assert_eq!(toggle_checklist_item(MARKED, &ACCEPTANCE_CRITERIA, 0), None);
        assert_eq!(toggle_checklist_item(MARKED, &ACCEPTANCE_CRITERIA, 4), None);
        assert_eq!(toggle_checklist_item(MARKED, &DEFINITION_OF_DONE, 1), None);
    }

    #[test]
    fn render_checklist_renumbers_from_one() {
        let items = vec![
            ChecklistItem { sequential_id: 9, text: "a".to_string(), checked: true },
            ChecklistItem::new("b", false),
        ];
        assert_eq!(render_checklist(&items), "- [x] #1 a\n- [ ] #2 b");
    }
}
