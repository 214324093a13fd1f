//! Sieve export of learned sender rules.
//!
//! Confident sender and domain rules can be handed to the mail server as a
//! Sieve script so mail is filed on delivery, before this daemon sees it.

use std::fmt::Write;

use crate::rules::{LearnedRule, RuleScope};
use crate::taxonomy::Taxonomy;

/// Render `fileinto` rules for sender and domain rules.
///
/// A rule is exported when its confidence clears both `min_confidence` and
/// its category threshold, and its category has a folder. Subject keyword
/// rules are never exported.
#[must_use]
pub fn export_sieve(rules: &[LearnedRule], taxonomy: &Taxonomy, min_confidence: f64) -> String {
    let mut selected: Vec<(&LearnedRule, &str)> = rules
        .iter()
        .filter(|r| matches!(r.scope, RuleScope::SenderExact | RuleScope::Domain))
        .filter(|r| r.confidence >= min_confidence && taxonomy.accepts(&r.category, r.confidence))
        .filter_map(|r| taxonomy.folder(&r.category).map(|folder| (r, folder)))
        .collect();
    selected.sort_by(|(a, _), (b, _)| {
        a.scope
            .cmp(&b.scope)
            .then_with(|| b.confidence.total_cmp(&a.confidence))
            .then_with(|| a.pattern.cmp(&b.pattern))
    });

    let mut script = String::from("require [\"fileinto\"];\n");
    for (rule, folder) in selected {
        let test = match rule.scope {
            RuleScope::SenderExact => "address :is \"from\"",
            _ => "address :domain :is \"from\"",
        };
        let _ = write!(
            script,
            "\n# {} -> {} ({:.2})\nif {test} \"{}\" {{\n    fileinto \"{}\";\n    stop;\n}}\n",
            rule.scope,
            rule.category,
            rule.confidence,
            escape(&rule.pattern),
            escape(folder),
        );
    }
    script
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
