/// Optional source of facts about a target beyond what the analysis saw.
///
/// Anything reported here counts as already present when the generator
/// looks for gaps. Resolved once at construction; [`NoKnowledge`] is the
/// default.
pub trait KnowledgeSource: Send + Sync {
    fn known_headings(&self, _target_id: &str) -> Vec<String> {
        Vec::new()
    }

    fn known_schema_types(&self, _target_id: &str) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoKnowledge;

impl KnowledgeSource for NoKnowledge {}
