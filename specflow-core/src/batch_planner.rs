//! Deterministic parser over the project's emitted task list.
//!
//! Grounded on `agents.rs`'s line-scanning markdown fallback parser
//! (`parse_tasks_from_markdown`), adapted from bullet-list scanning to
//! `##`-heading/task-id scanning, and on `scheduler.rs`'s static-method
//! style (`BatchPlanner` carries no state; every operation is a pure
//! function of its inputs).

use std::collections::HashSet;

use regex::Regex;
use std::sync::OnceLock;

use crate::model::{BatchPlan, PlannedBatch};

const UNCATEGORIZED: &str = "Uncategorized";

fn task_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b[A-Za-z]+-?\d{2,}\b").unwrap())
}

fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^##\s+(.+?)\s*$").unwrap())
}

pub struct BatchPlanner;

impl BatchPlanner {
    /// Parses a task document per spec section 4.5:
    /// 1. Scan for `##` headings; within each, collect well-formed task ids
    ///    in document order.
    /// 2. If at least one heading yields a non-empty list, those sections
    ///    (in order) are the batches.
    /// 3. Otherwise fall back to fixed-size chunks of `batch_size_fallback`.
    pub fn plan(task_document: &str, batch_size_fallback: usize) -> BatchPlan {
        let sectioned = Self::parse_sections(task_document);
        let has_non_empty_section = sectioned.iter().any(|(_, ids)| !ids.is_empty());

        if has_non_empty_section {
            let batches = sectioned
                .into_iter()
                .filter(|(_, ids)| !ids.is_empty())
                .map(|(section, task_ids)| PlannedBatch { section, task_ids })
                .collect();
            return BatchPlan {
                batches,
                used_fallback: false,
            };
        }

        let flat = Self::parse_flat(task_document);
        if flat.is_empty() {
            return BatchPlan {
                batches: Vec::new(),
                used_fallback: true,
            };
        }

        let chunk_size = batch_size_fallback.max(1);
        let batches = flat
            .chunks(chunk_size)
            .map(|chunk| PlannedBatch {
                section: UNCATEGORIZED.to_string(),
                task_ids: chunk.to_vec(),
            })
            .collect();

        BatchPlan {
            batches,
            used_fallback: true,
        }
    }

    /// Returns `(section_name, deduplicated_task_ids_in_order)` pairs, plus
    /// a synthetic trailing `"Uncategorized"` section for any task id found
    /// before the first heading (spec section 4.5 edge case).
    fn parse_sections(document: &str) -> Vec<(String, Vec<String>)> {
        let mut sections: Vec<(String, Vec<String>)> = Vec::new();
        let mut current: Option<(String, Vec<String>, HashSet<String>)> = None;
        let mut preamble: (Vec<String>, HashSet<String>) = (Vec::new(), HashSet::new());

        for line in document.lines() {
            if let Some(captures) = heading_pattern().captures(line) {
                if let Some((name, ids, _)) = current.take() {
                    sections.push((name, ids));
                }
                let name = captures[1].to_string();
                current = Some((name, Vec::new(), HashSet::new()));
                continue;
            }

            for m in task_id_pattern().find_iter(line) {
                let id = m.as_str().to_string();
                match current.as_mut() {
                    Some((_, ids, seen)) => {
                        if seen.insert(id.clone()) {
                            ids.push(id);
                        }
                    }
                    None => {
                        if preamble.1.insert(id.clone()) {
                            preamble.0.push(id);
                        }
                    }
                }
            }
        }

        if let Some((name, ids, _)) = current.take() {
            sections.push((name, ids));
        }

        if !preamble.0.is_empty() {
            sections.push((UNCATEGORIZED.to_string(), preamble.0));
        }

        sections
    }

    /// Flat, deduplicated, in-document-order list of task ids, ignoring any
    /// heading structure. Used by the fallback path.
    fn parse_flat(document: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for m in task_id_pattern().find_iter(document) {
            let id = m.as_str().to_string();
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sectioned_document_yields_one_batch_per_heading() {
        let doc = "## A\nT001\nT002\n\n## B\nT003\n\n## C\nT004\nT005\n";
        let plan = BatchPlanner::plan(doc, 15);
        assert!(!plan.used_fallback);
        assert_eq!(plan.batches.len(), 3);
        assert_eq!(plan.batches[0].section, "A");
        assert_eq!(plan.batches[0].task_ids, vec!["T001", "T002"]);
        assert_eq!(plan.batches[2].task_ids, vec!["T004", "T005"]);
    }

    #[test]
    fn flat_list_falls_back_to_fixed_size_chunks() {
        let ids: Vec<String> = (1..=32).map(|n| format!("T{:03}", n)).collect();
        let doc = ids.join("\n");
        let plan = BatchPlanner::plan(&doc, 15);
        assert!(plan.used_fallback);
        assert_eq!(plan.batches.len(), 3);
        assert_eq!(plan.batches[0].task_ids.len(), 15);
        assert_eq!(plan.batches[1].task_ids.len(), 15);
        assert_eq!(plan.batches[2].task_ids.len(), 2);
    }

    #[test]
    fn empty_document_yields_empty_plan_with_fallback_flag() {
        let plan = BatchPlanner::plan("", 15);
        assert!(plan.batches.is_empty());
        assert!(plan.used_fallback);
    }

    #[test]
    fn duplicate_ids_within_a_section_are_deduplicated() {
        let doc = "## A\nT001\nT001\nT002\n";
        let plan = BatchPlanner::plan(doc, 15);
        assert_eq!(plan.batches[0].task_ids, vec!["T001", "T002"]);
    }

    #[test]
    fn tasks_before_first_heading_become_uncategorized() {
        let doc = "T000\n\n## A\nT001\n";
        let plan = BatchPlanner::plan(doc, 15);
        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.batches[1].section, "Uncategorized");
        assert_eq!(plan.batches[1].task_ids, vec!["T000"]);
    }

    #[test]
    fn empty_sections_are_dropped() {
        let doc = "## Empty\n\n## A\nT001\n";
        let plan = BatchPlanner::plan(doc, 15);
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].section, "A");
    }

    #[test]
    fn planning_is_deterministic() {
        let doc = "## A\nT001\nT002\n## B\nT003\n";
        let first = BatchPlanner::plan(doc, 15);
        let second = BatchPlanner::plan(doc, 15);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn single_batch_when_total_at_or_under_fallback_size() {
        let ids: Vec<String> = (1..=10).map(|n| format!("T{:03}", n)).collect();
        let doc = ids.join("\n");
        let plan = BatchPlanner::plan(&doc, 15);
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].task_ids.len(), 10);
    }
}
