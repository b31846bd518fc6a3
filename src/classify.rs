//! Priority classification.
//!
//! `classify` is a pure function of the event's operation, source type,
//! category and the diff impact. Categories can raise the class above
//! what the impact alone gives; nothing lowers it.
//!
//! | Input | Class |
//! |-------|-------|
//! | category in `critical_categories` | critical |
//! | delete, or category in `high_categories` | at least high |
//! | impact high / medium / low | high / medium / low |
//! | no impact yet | insert impact of the source type |

use crate::config::ClassifierConfig;
use crate::models::{ChangeEvent, ChangeOp, Impact, PriorityClass, SourceType};

pub fn classify(event: &ChangeEvent, rules: &ClassifierConfig) -> PriorityClass {
    let impact = event.diff.as_ref().and_then(|d| d.impact);
    class_for(
        event.op,
        event.source_type,
        event.category.as_deref(),
        impact,
        rules,
    )
}

/// Class used before the diff is known, e.g. to pick a debounce window.
pub fn provisional(
    op: ChangeOp,
    source_type: SourceType,
    category: Option<&str>,
    rules: &ClassifierConfig,
) -> PriorityClass {
    class_for(op, source_type, category, None, rules)
}

fn class_for(
    op: ChangeOp,
    source_type: SourceType,
    category: Option<&str>,
    impact: Option<Impact>,
    rules: &ClassifierConfig,
) -> PriorityClass {
    let impact = impact.unwrap_or_else(|| rules.insert_impact_for(source_type));
    let mut class = PriorityClass::from(impact);

    if op == ChangeOp::Delete {
        class = class.max(PriorityClass::High);
    }
    if let Some(category) = category {
        if contains(&rules.critical_categories, category) {
            class = PriorityClass::Critical;
        } else if contains(&rules.high_categories, category) {
            class = class.max(PriorityClass::High);
        }
    }
    class
}

fn contains(list: &[String], category: &str) -> bool {
    list.iter().any(|c| c.eq_ignore_ascii_case(category))
}
