use crate::analysis::Analysis;
use crate::decision::{DecisionAction, LinkSuggestion, Priority, ProposedDecision};
use crate::knowledge::{KnowledgeSource, NoKnowledge};
use std::collections::HashSet;
use std::sync::Arc;

/// Schema types safe enough to add without a human looking first.
pub const AUTO_SCHEMA_TYPES: &[&str] = &[
    "Article",
    "BreadcrumbList",
    "FAQPage",
    "WebPage",
    "Organization",
];

/// Deterministic gap finder: compares what an analysis recommends with what
/// the target already has and proposes one decision per gap.
#[derive(Clone)]
pub struct DecisionGenerator {
    knowledge: Arc<dyn KnowledgeSource>,
}

impl Default for DecisionGenerator {
    fn default() -> Self {
        Self::new(Arc::new(NoKnowledge))
    }
}

impl DecisionGenerator {
    pub fn new(knowledge: Arc<dyn KnowledgeSource>) -> Self {
        Self { knowledge }
    }

    /// Pure with respect to `analysis` and the knowledge source. Proposals
    /// that fail validation are dropped and logged; the rest of the batch
    /// is kept.
    pub fn generate(&self, analysis: &Analysis) -> Vec<ProposedDecision> {
        let mut out = Vec::new();
        self.section_gaps(analysis, &mut out);
        self.schema_gaps(analysis, &mut out);
        meta_gap(analysis, &mut out);
        link_gaps(analysis, &mut out);

        out.retain(|p| match p.action.validate() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    target_id = %p.target_id,
                    source = %p.source,
                    error = %e,
                    "dropping invalid proposal"
                );
                false
            }
        });
        out
    }

    fn section_gaps(&self, analysis: &Analysis, out: &mut Vec<ProposedDecision>) {
        let mut seen: HashSet<String> = analysis
            .existing
            .headings
            .iter()
            .map(|h| normalize(&h.text))
            .chain(
                self.knowledge
                    .known_headings(&analysis.target_id)
                    .iter()
                    .map(|h| normalize(h)),
            )
            .collect();

        for s in &analysis.recommendations.sections {
            let key = normalize(&s.heading);
            if key.is_empty() || !seen.insert(key) {
                continue;
            }
            out.push(ProposedDecision {
                target_id: analysis.target_id.clone(),
                action: DecisionAction::AddSection {
                    heading: s.heading.trim().to_string(),
                    level: s.level,
                    body: s.body.clone(),
                },
                priority: if s.level == 2 {
                    Priority::High
                } else {
                    Priority::Medium
                },
                auto: false,
                source: "ai:section_gap".to_string(),
                confidence: analysis.confidence,
            });
        }
    }

    fn schema_gaps(&self, analysis: &Analysis, out: &mut Vec<ProposedDecision>) {
        let mut seen: HashSet<String> = analysis
            .existing
            .schema_types
            .iter()
            .map(|s| normalize(s))
            .chain(
                self.knowledge
                    .known_schema_types(&analysis.target_id)
                    .iter()
                    .map(|s| normalize(s)),
            )
            .collect();

        for schema_type in &analysis.recommendations.schema_types {
            let key = normalize(schema_type);
            if key.is_empty() || !seen.insert(key) {
                continue;
            }
            let schema_type = canonical_schema_type(schema_type.trim());
            out.push(ProposedDecision {
                target_id: analysis.target_id.clone(),
                auto: AUTO_SCHEMA_TYPES.contains(&schema_type.as_str()),
                action: DecisionAction::AddSchema { schema_type },
                priority: Priority::Medium,
                source: "ai:schema_gap".to_string(),
                confidence: analysis.confidence,
            });
        }
    }
}

fn meta_gap(analysis: &Analysis, out: &mut Vec<ProposedDecision>) {
    let differs = |want: &Option<String>, have: &Option<String>| -> Option<String> {
        let want = want.as_deref().map(str::trim).filter(|w| !w.is_empty())?;
        match have.as_deref() {
            Some(have) if normalize(have) == normalize(want) => None,
            _ => Some(want.to_string()),
        }
    };
    let rec = &analysis.recommendations;
    let title = differs(&rec.title, &analysis.existing.title);
    let description = differs(&rec.description, &analysis.existing.description);
    if title.is_none() && description.is_none() {
        return;
    }
    out.push(ProposedDecision {
        target_id: analysis.target_id.clone(),
        action: DecisionAction::UpdateMeta { title, description },
        priority: Priority::Medium,
        auto: false,
        source: "ai:meta_gap".to_string(),
        confidence: analysis.confidence,
    });
}

fn link_gaps(analysis: &Analysis, out: &mut Vec<ProposedDecision>) {
    let mut seen: HashSet<String> = analysis
        .existing
        .links
        .iter()
        .map(|l| normalize(l))
        .collect();
    let links: Vec<LinkSuggestion> = analysis
        .recommendations
        .internal_links
        .iter()
        .filter(|l| {
            let key = normalize(&l.url);
            !key.is_empty() && seen.insert(key)
        })
        .map(|l| LinkSuggestion {
            url: l.url.trim().to_string(),
            anchor: l.anchor.trim().to_string(),
        })
        .collect();
    if links.is_empty() {
        return;
    }
    out.push(ProposedDecision {
        target_id: analysis.target_id.clone(),
        action: DecisionAction::InternalLinks { links },
        priority: Priority::Low,
        auto: false,
        source: "ai:link_gap".to_string(),
        confidence: analysis.confidence,
    });
}

/// Lowercase and collapse whitespace; the comparison key for dedup.
fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Map case variants of allow-listed types onto their canonical spelling so
/// "faqpage" and "FAQPage" hash the same.
fn canonical_schema_type(s: &str) -> String {
    AUTO_SCHEMA_TYPES
        .iter()
        .find(|t| t.eq_ignore_ascii_case(s))
        .map_or_else(|| s.to_string(), |t| (*t).to_string())
}
