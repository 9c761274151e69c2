//! Slot display rendering and the reverse rep lookup.
//!
//! The rendered string is a stable contract: it is injected into the voice
//! agent's context, and when the agent books a slot the chosen time is
//! parsed back against the same string to recover the owning rep. Three
//! layouts exist depending on how many reps are in play.

use super::Slot;
use crate::timeloc::{italian_weekday, utc_to_italian};
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

const LETTERS: [char; 3] = ['A', 'B', 'C'];

/// Typed layout behind the rendered availability string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotDisplay {
    /// All slots belong to one rep; a single trailer names them.
    SingleRep { rep_id: String },
    /// Two or three reps; times carry a letter suffix resolved by a legend.
    Lettered { legend: Vec<(char, String)> },
    /// Four or more reps; each rep gets its own dated section.
    GroupedByRep,
}

impl SlotDisplay {
    /// Pick the layout for a slot set. Rep order follows first appearance
    /// in the (already chronological) slot list.
    pub fn for_slots(slots: &[Slot]) -> SlotDisplay {
        let reps = distinct_reps(slots);
        match reps.len() {
            0 | 1 => SlotDisplay::SingleRep {
                rep_id: reps.first().cloned().unwrap_or_default(),
            },
            2 | 3 => SlotDisplay::Lettered {
                legend: reps
                    .into_iter()
                    .zip(LETTERS.iter())
                    .map(|(rep, &letter)| (letter, rep))
                    .collect(),
            },
            _ => SlotDisplay::GroupedByRep,
        }
    }

    /// Render the availability string for the agent (and the queue row).
    pub fn render(&self, slots: &[Slot]) -> String {
        match self {
            SlotDisplay::SingleRep { rep_id } => {
                let mut out = render_date_lines(slots, |_| String::new());
                out.push_str(&format!("\nSales Rep: {}", rep_id));
                out
            }
            SlotDisplay::Lettered { legend } => {
                let suffix_of = |rep: &str| -> String {
                    legend
                        .iter()
                        .find(|(_, r)| r == rep)
                        .map(|(letter, _)| format!(" ({})", letter))
                        .unwrap_or_default()
                };
                let mut out = render_date_lines(slots, |slot| suffix_of(&slot.rep_id));
                let entries: Vec<String> = legend
                    .iter()
                    .map(|(letter, rep)| format!("{} = {}", letter, rep))
                    .collect();
                out.push_str(&format!("\nSales Reps: {}", entries.join(", ")));
                out
            }
            SlotDisplay::GroupedByRep => {
                let mut sections = Vec::new();
                for rep in distinct_reps(slots) {
                    let own: Vec<Slot> =
                        slots.iter().filter(|s| s.rep_id == rep).cloned().collect();
                    sections.push(format!(
                        "Sales Rep {}:\n{}",
                        rep,
                        render_date_lines(&own, |_| String::new())
                    ));
                }
                sections.join("\n")
            }
        }
    }
}

/// Reps in order of first appearance.
fn distinct_reps(slots: &[Slot]) -> Vec<String> {
    let mut seen = Vec::new();
    for slot in slots {
        if !seen.contains(&slot.rep_id) {
            seen.push(slot.rep_id.clone());
        }
    }
    seen
}

/// One line per Rome-local date: "lunedì 17-03-2025: 09:00, 10:30".
fn render_date_lines(slots: &[Slot], suffix: impl Fn(&Slot) -> String) -> String {
    let mut per_date: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();
    for slot in slots {
        let rome = utc_to_italian(slot.datetime_utc);
        per_date
            .entry(rome.date_naive())
            .or_default()
            .push(format!("{}{}", rome.format("%H:%M"), suffix(slot)));
    }

    per_date
        .into_iter()
        .map(|(date, times)| {
            format!(
                "{} {}: {}",
                italian_weekday(date.weekday()),
                date.format("%d-%m-%Y"),
                times.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

static SUFFIX_LETTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(([A-Z])\)\s*$").unwrap());
static SINGLE_TRAILER: Lazy<Regex> = Lazy::new(|| Regex::new(r"Sales Rep: (\S+)\s*$").unwrap());
static GROUP_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Sales Rep (\S+):\s*$").unwrap());
static TIME_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,2}:\d{2})").unwrap());
static DATE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{2}-\d{2}-\d{4}|\d{4}-\d{2}-\d{2})").unwrap());

/// Recover the rep that owns the time the agent chose.
///
/// Resolution order mirrors the layouts: a `(X)` suffix goes through the
/// legend, a `Sales Rep: <id>` trailer wins for single-rep text, and the
/// grouped layout is scanned for the section containing the time. Returns
/// None rather than ever guessing a wrong rep.
pub fn resolve_rep(chosen: &str, slot_text: &str) -> Option<String> {
    if let Some(caps) = SUFFIX_LETTER.captures(chosen.trim()) {
        let letter = caps[1].chars().next()?;
        return legend_lookup(slot_text, letter);
    }

    if let Some(caps) = SINGLE_TRAILER.captures(slot_text.trim_end()) {
        return Some(caps[1].to_string());
    }

    grouped_lookup(chosen, slot_text)
}

fn legend_lookup(slot_text: &str, letter: char) -> Option<String> {
    let legend_line = slot_text
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with("Sales Reps:"))?;
    let entry = Regex::new(&format!(r"\b{} = ([^,\s]+)", letter)).ok()?;
    entry
        .captures(legend_line)
        .map(|caps| caps[1].to_string())
}

fn grouped_lookup(chosen: &str, slot_text: &str) -> Option<String> {
    let time = TIME_TOKEN.captures(chosen).map(|c| c[1].to_string())?;
    let date = DATE_TOKEN
        .captures(chosen)
        .map(|c| normalize_date(&c[1]));
    let time_re = Regex::new(&format!(r"\b{}\b", regex::escape(&time))).ok()?;

    // When the agent named a date, the section line must carry the same
    // date; matching the time alone on another day would hand the booking
    // to the wrong rep.
    let mut current_rep: Option<String> = None;
    for line in slot_text.lines() {
        if let Some(caps) = GROUP_HEADER.captures(line.trim()) {
            current_rep = Some(caps[1].to_string());
            continue;
        }
        if !time_re.is_match(line) {
            continue;
        }
        if let Some(want) = &date {
            let line_date = DATE_TOKEN.captures(line).map(|c| normalize_date(&c[1]));
            if line_date.as_deref() != Some(want.as_str()) {
                continue;
            }
        }
        if let Some(rep) = &current_rep {
            return Some(rep.clone());
        }
    }
    None
}

/// Normalize either date form to DD-MM-YYYY for comparison.
fn normalize_date(raw: &str) -> String {
    if raw.len() == 10 && raw.as_bytes()[4] == b'-' {
        // YYYY-MM-DD
        let (y, rest) = raw.split_at(4);
        let (m, d) = rest[1..].split_at(2);
        format!("{}-{}-{}", &d[1..], m, y)
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn slot(day: u32, hour: u32, rep: &str) -> Slot {
        Slot {
            // March 2025, before the DST switch: Rome = UTC+1.
            datetime_utc: Utc.with_ymd_and_hms(2025, 3, day, hour - 1, 0, 0).unwrap(),
            rep_id: rep.to_string(),
        }
    }

    #[test]
    fn single_rep_layout_renders_trailer() {
        let slots = vec![slot(17, 9, "u1"), slot(17, 10, "u1"), slot(18, 14, "u1")];
        let display = SlotDisplay::for_slots(&slots);
        let text = display.render(&slots);
        assert_eq!(
            text,
            "lunedì 17-03-2025: 09:00, 10:00\nmartedì 18-03-2025: 14:00\nSales Rep: u1"
        );
    }

    #[test]
    fn lettered_layout_suffixes_and_legend() {
        let slots = vec![slot(17, 9, "u1"), slot(17, 10, "u2"), slot(18, 14, "u1")];
        let display = SlotDisplay::for_slots(&slots);
        let text = display.render(&slots);
        assert!(text.contains("09:00 (A), 10:00 (B)"));
        assert!(text.ends_with("Sales Reps: A = u1, B = u2"));
    }

    #[test]
    fn grouped_layout_for_four_reps() {
        let slots = vec![
            slot(17, 9, "u1"),
            slot(17, 10, "u2"),
            slot(17, 11, "u3"),
            slot(17, 12, "u4"),
        ];
        let display = SlotDisplay::for_slots(&slots);
        assert_eq!(display, SlotDisplay::GroupedByRep);
        let text = display.render(&slots);
        assert!(text.contains("Sales Rep u1:\nlunedì 17-03-2025: 09:00"));
        assert!(text.contains("Sales Rep u4:\nlunedì 17-03-2025: 12:00"));
    }

    #[test]
    fn resolve_from_single_rep_trailer() {
        let slots = vec![slot(17, 9, "u1")];
        let text = SlotDisplay::for_slots(&slots).render(&slots);
        assert_eq!(resolve_rep("17-03-2025 09:00", &text), Some("u1".into()));
    }

    #[test]
    fn resolve_from_letter_suffix() {
        let slots = vec![slot(17, 9, "u1"), slot(17, 10, "u2")];
        let text = SlotDisplay::for_slots(&slots).render(&slots);
        assert_eq!(resolve_rep("17-03-2025 10:00 (B)", &text), Some("u2".into()));
        assert_eq!(resolve_rep("09:00 (A)", &text), Some("u1".into()));
    }

    #[test]
    fn resolve_from_grouped_sections() {
        let slots = vec![
            slot(17, 9, "u1"),
            slot(17, 10, "u2"),
            slot(18, 10, "u3"),
            slot(17, 12, "u4"),
        ];
        let text = SlotDisplay::for_slots(&slots).render(&slots);
        assert_eq!(resolve_rep("17-03-2025 10:00", &text), Some("u2".into()));
        // Same wall-clock time on another date belongs to another rep.
        assert_eq!(resolve_rep("18-03-2025 10:00", &text), Some("u3".into()));
        // ISO date form resolves identically.
        assert_eq!(resolve_rep("2025-03-18 10:00", &text), Some("u3".into()));
    }

    #[test]
    fn unknown_letter_never_guesses() {
        let slots = vec![slot(17, 9, "u1"), slot(17, 10, "u2")];
        let text = SlotDisplay::for_slots(&slots).render(&slots);
        assert_eq!(resolve_rep("17-03-2025 10:00 (Z)", &text), None);
    }

    #[test]
    fn unknown_time_in_grouped_text_is_none() {
        let slots = vec![
            slot(17, 9, "u1"),
            slot(17, 10, "u2"),
            slot(17, 11, "u3"),
            slot(17, 12, "u4"),
        ];
        let text = SlotDisplay::for_slots(&slots).render(&slots);
        assert_eq!(resolve_rep("17-03-2025 15:45", &text), None);
    }
}
