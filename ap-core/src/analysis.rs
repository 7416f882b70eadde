//! Page analysis payload: what a target already has and what the analysis
//! recommends it should have.

use crate::decision::LinkSuggestion;
use crate::error::{AutopilotError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heading {
    pub text: String,
    #[serde(default = "default_level")]
    pub level: u8,
}

fn default_level() -> u8 {
    2
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExistingContent {
    pub headings: Vec<Heading>,
    pub schema_types: Vec<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Link targets already present on the page.
    pub links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSuggestion {
    pub heading: String,
    #[serde(default = "default_level")]
    pub level: u8,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recommendations {
    pub sections: Vec<SectionSuggestion>,
    pub schema_types: Vec<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub internal_links: Vec<LinkSuggestion>,
}

impl Recommendations {
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
            && self.schema_types.is_empty()
            && self.title.is_none()
            && self.description.is_none()
            && self.internal_links.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub target_id: String,
    /// Provenance of the analysis, e.g. a provider name or `"import"`.
    #[serde(default = "default_source")]
    pub source: String,
    /// Model-reported confidence in `[0, 1]`, when the analysis came from AI.
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub existing: ExistingContent,
    #[serde(default)]
    pub recommendations: Recommendations,
}

fn default_source() -> String {
    "import".to_string()
}

impl Analysis {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            source: default_source(),
            confidence: None,
            existing: ExistingContent::default(),
            recommendations: Recommendations::default(),
        }
    }

    /// Build an analysis from a provider's structured reply.
    ///
    /// The reply carries the recommendation fields at top level plus an
    /// optional `confidence`; existing content comes from the caller, who
    /// read the target before asking. Fields are read one by one: a null or
    /// malformed field, or a malformed list entry, is dropped with a warning
    /// and the rest of the reply is kept.
    pub fn from_ai_value(
        target_id: &str,
        provider: &str,
        existing: ExistingContent,
        value: &Value,
    ) -> Result<Self> {
        let Some(obj) = value.as_object() else {
            return Err(AutopilotError::InvalidDecision(
                "analysis reply must be a JSON object".to_string(),
            ));
        };
        let recommendations = Recommendations {
            sections: lenient_list(obj, "sections"),
            schema_types: lenient_list(obj, "schema_types"),
            title: lenient_text(obj, "title"),
            description: lenient_text(obj, "description"),
            internal_links: lenient_list(obj, "internal_links"),
        };
        let confidence = obj
            .get("confidence")
            .and_then(serde_json::Value::as_f64)
            .map(|c| c.clamp(0.0, 1.0));
        Ok(Self {
            target_id: target_id.to_string(),
            source: format!("ai:{provider}"),
            confidence,
            existing,
            recommendations,
        })
    }
}

/// A list field; a lone value counts as a one-item list.
fn lenient_list<T: DeserializeOwned>(obj: &Map<String, Value>, field: &str) -> Vec<T> {
    let items = match obj.get(field) {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items.as_slice(),
        Some(single) => std::slice::from_ref(single),
    };
    items
        .iter()
        .filter_map(|item| match T::deserialize(item) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(field, error = %e, "dropping malformed analysis entry");
                None
            }
        })
        .collect()
}

fn lenient_text(obj: &Map<String, Value>, field: &str) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            tracing::warn!(field, value = %other, "ignoring non-string analysis field");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ai_reply_with_partial_fields() {
        let reply = json!({
            "sections": [{ "heading": "Pricing", "level": 2 }, { "heading": "Limits" }],
            "schema_types": ["FAQPage"],
            "confidence": 1.4,
            "unknown_field": true
        });
        let analysis = Analysis::from_ai_value("docs/a", "openai", ExistingContent::default(), &reply)
            .expect("parse reply");
        assert_eq!(analysis.source, "ai:openai");
        assert_eq!(analysis.confidence, Some(1.0));
        assert_eq!(analysis.recommendations.sections.len(), 2);
        assert_eq!(analysis.recommendations.sections[1].level, 2);
        assert!(analysis.recommendations.title.is_none());
    }

    #[test]
    fn malformed_fields_do_not_discard_the_reply() {
        let reply = json!({
            "schema_types": ["FAQPage", 7],
            "sections": null,
            "title": 42,
            "description": "Plans and limits",
            "internal_links": [{ "url": "/pricing", "anchor": "Pricing" }, "oops"]
        });
        let analysis = Analysis::from_ai_value("home", "openai", ExistingContent::default(), &reply)
            .expect("partial reply is usable");
        let rec = &analysis.recommendations;
        assert_eq!(rec.schema_types, vec!["FAQPage".to_string()]);
        assert!(rec.sections.is_empty());
        assert!(rec.title.is_none());
        assert_eq!(rec.description.as_deref(), Some("Plans and limits"));
        assert_eq!(rec.internal_links.len(), 1);
        assert_eq!(analysis.confidence, None);

        let single = json!({ "schema_types": "HowTo", "sections": { "heading": "Steps" } });
        let analysis = Analysis::from_ai_value("home", "openai", ExistingContent::default(), &single)
            .expect("lone values");
        assert_eq!(analysis.recommendations.schema_types, vec!["HowTo".to_string()]);
        assert_eq!(analysis.recommendations.sections[0].level, 2);
    }

    #[test]
    fn non_object_reply_is_rejected() {
        let err = Analysis::from_ai_value("t", "gemini", ExistingContent::default(), &json!([1, 2]))
            .expect_err("array is not an analysis");
        assert!(matches!(err, AutopilotError::InvalidDecision(_)));
    }

    #[test]
    fn imported_payload_defaults_missing_sections() {
        let analysis: Analysis =
            serde_json::from_value(json!({ "target_id": "home" })).expect("parse");
        assert_eq!(analysis.source, "import");
        assert!(analysis.recommendations.is_empty());
        assert!(analysis.existing.headings.is_empty());
    }
}
