//! Diff Analyzer: partitions a document's chunks into added, modified,
//! unchanged and removed, and judges the semantic impact of the change.
//!
//! Matching runs in three passes over the new chunking:
//!
//! 1. same chunk id and same chunk hash: unchanged;
//! 2. same hash as a not-yet-matched previous chunk (boundaries moved but
//!    the text is byte-identical): unchanged, recorded as a relocation so
//!    the previous vector is reused;
//! 3. the id existed before: modified; otherwise added.
//!
//! Previous chunks matched by neither id nor hash are removed.
//!
//! Impact comes from the changed fraction
//! `(added + modified + removed) / max(previous, current)`, escalated to
//! high when the document's category or the text of any changed chunk
//! hits an escalation rule. A first observation has no previous chunk set:
//! everything is added and the impact is the insert impact of the source
//! type.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::ClassifierConfig;
use crate::models::{Chunk, ChunkDiff, ChunkId, Impact, SourceType};

/// What the analyzer knows about the document besides its chunks.
#[derive(Debug, Clone, Copy)]
pub struct DiffContext<'a> {
    pub source_type: SourceType,
    pub category: Option<&'a str>,
}

/// Compare the previous chunk set (if any) with the current chunking.
///
/// An empty previous set is treated like a missing one.
pub fn analyze(
    previous: Option<&[Chunk]>,
    current: &[Chunk],
    ctx: DiffContext<'_>,
    rules: &ClassifierConfig,
) -> ChunkDiff {
    let previous = match previous {
        Some(p) if !p.is_empty() => p,
        _ => return first_observation(current, ctx, rules),
    };

    let prev_by_id: HashMap<&ChunkId, &Chunk> = previous.iter().map(|c| (&c.id, c)).collect();
    let mut consumed: HashSet<&ChunkId> = HashSet::new();
    let mut matched: Vec<bool> = vec![false; current.len()];
    let mut diff = ChunkDiff::default();

    // Pass 1: identical id and text.
    for (i, chunk) in current.iter().enumerate() {
        if let Some(prev) = prev_by_id.get(&chunk.id) {
            if prev.hash == chunk.hash {
                consumed.insert(&prev.id);
                matched[i] = true;
                diff.unchanged.push(chunk.id.clone());
            }
        }
    }

    // Pass 2: identical text under a shifted boundary.
    let mut by_hash: HashMap<&str, VecDeque<&ChunkId>> = HashMap::new();
    for prev in previous {
        if !consumed.contains(&prev.id) {
            by_hash.entry(prev.hash.as_str()).or_default().push_back(&prev.id);
        }
    }
    for (i, chunk) in current.iter().enumerate() {
        if matched[i] {
            continue;
        }
        if let Some(from) = by_hash.get_mut(chunk.hash.as_str()).and_then(|q| q.pop_front()) {
            consumed.insert(from);
            matched[i] = true;
            diff.unchanged.push(chunk.id.clone());
            diff.relocated.push((from.clone(), chunk.id.clone()));
        }
    }

    // Pass 3: whatever is left changed.
    let current_ids: HashSet<&ChunkId> = current.iter().map(|c| &c.id).collect();
    let mut changed_text: Vec<&str> = Vec::new();
    for (i, chunk) in current.iter().enumerate() {
        if matched[i] {
            continue;
        }
        if prev_by_id.contains_key(&chunk.id) {
            diff.modified.push(chunk.id.clone());
        } else {
            diff.added.push(chunk.id.clone());
        }
        changed_text.push(&chunk.text);
    }

    for prev in previous {
        if !consumed.contains(&prev.id) && !current_ids.contains(&prev.id) {
            diff.removed.push(prev.id.clone());
            changed_text.push(&prev.text);
        }
    }
    // Old text replaced in place also counts toward escalation.
    for id in &diff.modified {
        if let Some(prev) = prev_by_id.get(id) {
            changed_text.push(&prev.text);
        }
    }

    let changed = diff.added.len() + diff.modified.len() + diff.removed.len();
    let denominator = previous.len().max(current.len()).max(1);
    let fraction = changed as f64 / denominator as f64;

    let mut impact = if changed == 0 {
        Impact::Low
    } else if fraction >= rules.high_fraction {
        Impact::High
    } else if fraction >= rules.medium_fraction {
        Impact::Medium
    } else {
        Impact::Low
    };
    if changed > 0 && escalates(ctx.category, &changed_text, rules) {
        impact = Impact::High;
    }

    diff.impact = Some(impact);
    diff
}

/// Every previous chunk removed.
pub fn analyze_delete(previous: &[Chunk]) -> ChunkDiff {
    ChunkDiff {
        removed: previous.iter().map(|c| c.id.clone()).collect(),
        impact: Some(Impact::High),
        ..Default::default()
    }
}

fn first_observation(current: &[Chunk], ctx: DiffContext<'_>, rules: &ClassifierConfig) -> ChunkDiff {
    let texts: Vec<&str> = current.iter().map(|c| c.text.as_str()).collect();
    let mut impact = rules.insert_impact_for(ctx.source_type);
    if escalates(ctx.category, &texts, rules) {
        impact = Impact::High;
    }
    ChunkDiff {
        added: current.iter().map(|c| c.id.clone()).collect(),
        impact: Some(impact),
        ..Default::default()
    }
}

fn escalates(category: Option<&str>, texts: &[&str], rules: &ClassifierConfig) -> bool {
    if let Some(category) = category {
        if rules
            .escalation_categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
        {
            return true;
        }
    }
    let keywords: Vec<String> = rules
        .escalation_keywords
        .iter()
        .map(|k| k.to_lowercase())
        .collect();
    texts.iter().any(|text| {
        let lower = text.to_lowercase();
        keywords.iter().any(|k| !k.is_empty() && lower.contains(k.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::hash_text;
    use crate::models::{DocumentId, Span};

    /// One chunk per paragraph, offsets as the chunker would assign them.
    fn chunks(body: &str) -> Vec<Chunk> {
        let doc = DocumentId::from("d1");
        let mut out = Vec::new();
        let mut offset = 0;
        for (i, para) in body.split("\n\n").enumerate() {
            out.push(Chunk {
                id: ChunkId::new(&doc, offset),
                document_id: doc.clone(),
                chunk_index: i as i64,
                span: Span {
                    start: offset,
                    end: offset + para.len(),
                },
                text: para.to_string(),
                hash: hash_text(para),
            });
            offset += para.len() + 2;
        }
        out
    }

    fn ctx() -> DiffContext<'static> {
        DiffContext {
            source_type: SourceType::File,
            category: None,
        }
    }

    fn five(paras: [&str; 5]) -> String {
        paras.join("\n\n")
    }

    #[test]
    fn first_observation_adds_everything_at_insert_impact() {
        let rules = ClassifierConfig::default();
        let current = chunks("alpha one\n\nbeta two");
        let diff = analyze(None, &current, ctx(), &rules);
        assert_eq!(diff.added.len(), 2);
        assert_eq!(diff.impact, Some(Impact::Medium));

        let db = DiffContext {
            source_type: SourceType::DatabaseRow,
            category: None,
        };
        assert_eq!(analyze(Some(&[]), &current, db, &rules).impact, Some(Impact::High));
    }

    #[test]
    fn two_of_five_modified_is_medium() {
        let rules = ClassifierConfig::default();
        let before = chunks(&five(["aaaa", "bbbb", "cccc", "dddd", "eeee"]));
        let after = chunks(&five(["aaaa", "BBBB", "cccc", "DDDD", "eeee"]));
        assert_eq!(before.len(), 5);

        let diff = analyze(Some(&before), &after, ctx(), &rules);
        assert_eq!(diff.modified.len(), 2);
        assert_eq!(diff.unchanged.len(), 3);
        assert!(diff.added.is_empty() && diff.removed.is_empty());
        assert_eq!(diff.impact, Some(Impact::Medium));
    }

    #[test]
    fn shifted_boundaries_with_identical_text_are_unchanged() {
        let rules = ClassifierConfig::default();
        let before = chunks("intro\n\nbody text\n\nfooter");
        // A new first paragraph shifts every offset.
        let after = chunks("new lead\n\nintro\n\nbody text\n\nfooter");

        let diff = analyze(Some(&before), &after, ctx(), &rules);
        assert_eq!(diff.unchanged.len(), 3);
        assert_eq!(diff.relocated.len(), 3);
        assert!(diff.removed.is_empty());
        // Offset 0 is reused by the new lead paragraph.
        assert_eq!(diff.modified, vec![ChunkId::from("d1#0")]);
        assert!(diff.added.is_empty());
        assert_eq!(diff.needs_embedding().count(), 1);
        // Vacated offsets the new chunking does not reuse are tombstoned.
        let tombstones = diff.tombstones();
        assert_eq!(tombstones.len(), 2);
        for id in tombstones {
            assert!(!after.iter().any(|c| c.id == id));
        }
    }

    #[test]
    fn removed_chunks_are_reported() {
        let rules = ClassifierConfig::default();
        let before = chunks("one\n\ntwo\n\nthree\n\nfour");
        let after = chunks("one\n\ntwo\n\nthree");
        let diff = analyze(Some(&before), &after, ctx(), &rules);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.impact, Some(Impact::Medium));
    }

    #[test]
    fn small_change_is_low_unless_keyword_escalates() {
        let rules = ClassifierConfig::default();
        let paras = ["p0", "p1", "p2", "p3", "p4", "p5", "p6", "p7", "p8", "p9"];
        let before = chunks(&paras.join("\n\n"));

        let mut edited = paras;
        edited[4] = "px";
        let after = chunks(&edited.join("\n\n"));
        assert_eq!(analyze(Some(&before), &after, ctx(), &rules).impact, Some(Impact::Low));

        edited[4] = "GDPR";
        let after = chunks(&edited.join("\n\n"));
        assert_eq!(analyze(Some(&before), &after, ctx(), &rules).impact, Some(Impact::High));
    }

    #[test]
    fn compliance_category_always_escalates() {
        let rules = ClassifierConfig::default();
        let paras: Vec<String> = (0..10).map(|i| format!("p{}", i)).collect();
        let before = chunks(&paras.join("\n\n"));
        let mut edited = paras.clone();
        edited[0] = "q0".to_string();
        let after = chunks(&edited.join("\n\n"));

        let compliance = DiffContext {
            source_type: SourceType::File,
            category: Some("Compliance"),
        };
        assert_eq!(analyze(Some(&before), &after, compliance, &rules).impact, Some(Impact::High));
        // No change at all never escalates.
        assert_eq!(analyze(Some(&before), &before, compliance, &rules).impact, Some(Impact::Low));
    }

    #[test]
    fn identical_content_is_a_noop() {
        let rules = ClassifierConfig::default();
        let c = chunks("same\n\ncontent");
        let diff = analyze(Some(&c), &c, ctx(), &rules);
        assert!(diff.is_noop());
        assert!(diff.tombstones().is_empty());
    }

    #[test]
    fn delete_removes_every_chunk() {
        let c = chunks("a\n\nb");
        let diff = analyze_delete(&c);
        assert_eq!(diff.removed.len(), 2);
        assert_eq!(diff.impact, Some(Impact::High));
    }
}
