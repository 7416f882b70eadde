//! Decision records: one proposed mutation, hashed and carried through the
//! review/approval state machine.

use crate::error::{AutopilotError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    AddSchema,
    AddSection,
    UpdateMeta,
    InternalLinks,
    CleanupSnapshots,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddSchema => "add_schema",
            Self::AddSection => "add_section",
            Self::UpdateMeta => "update_meta",
            Self::InternalLinks => "internal_links",
            Self::CleanupSnapshots => "cleanup_snapshots",
        }
    }
}

impl FromStr for DecisionType {
    type Err = AutopilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add_schema" => Ok(Self::AddSchema),
            "add_section" => Ok(Self::AddSection),
            "update_meta" => Ok(Self::UpdateMeta),
            "internal_links" => Ok(Self::InternalLinks),
            "cleanup_snapshots" => Ok(Self::CleanupSnapshots),
            other => Err(AutopilotError::InvalidDecision(format!(
                "unknown decision type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = AutopilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(AutopilotError::InvalidDecision(format!(
                "unknown priority: {other}"
            ))),
        }
    }
}

/// Lifecycle of a decision.
///
/// Transitions: `Planned → Approved | Rejected`, `Approved → Applied | Failed | Dead`,
/// `Failed → Applied | Failed | Dead`. `Failed` means the backing task is
/// waiting for a retry; `Rejected`, `Applied` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Planned,
    Approved,
    Rejected,
    Applied,
    Failed,
    Dead,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Applied | Self::Dead)
    }

    pub fn can_transition_to(&self, next: DecisionStatus) -> bool {
        use DecisionStatus::*;
        matches!(
            (self, next),
            (Planned, Approved)
                | (Planned, Rejected)
                | (Approved, Applied)
                | (Approved, Failed)
                | (Approved, Dead)
                | (Failed, Applied)
                | (Failed, Failed)
                | (Failed, Dead)
        )
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionStatus {
    type Err = AutopilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "planned" => Ok(Self::Planned),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(AutopilotError::InvalidDecision(format!(
                "unknown decision status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSuggestion {
    pub url: String,
    pub anchor: String,
}

/// What a decision would do, one variant per decision type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionAction {
    AddSchema {
        schema_type: String,
    },
    AddSection {
        heading: String,
        level: u8,
        #[serde(default)]
        body: String,
    },
    UpdateMeta {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    InternalLinks {
        links: Vec<LinkSuggestion>,
    },
    CleanupSnapshots {
        keep_latest: usize,
    },
}

impl DecisionAction {
    pub fn decision_type(&self) -> DecisionType {
        match self {
            Self::AddSchema { .. } => DecisionType::AddSchema,
            Self::AddSection { .. } => DecisionType::AddSection,
            Self::UpdateMeta { .. } => DecisionType::UpdateMeta,
            Self::InternalLinks { .. } => DecisionType::InternalLinks,
            Self::CleanupSnapshots { .. } => DecisionType::CleanupSnapshots,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::AddSchema { schema_type } => {
                if schema_type.trim().is_empty() {
                    return Err(AutopilotError::InvalidDecision(
                        "add_schema requires a schema_type".to_string(),
                    ));
                }
            }
            Self::AddSection { heading, level, .. } => {
                if heading.trim().is_empty() {
                    return Err(AutopilotError::InvalidDecision(
                        "add_section requires a heading".to_string(),
                    ));
                }
                if !(2..=6).contains(level) {
                    return Err(AutopilotError::InvalidDecision(format!(
                        "add_section level must be 2..=6, got {level}"
                    )));
                }
            }
            Self::UpdateMeta { title, description } => {
                let blank = |v: &Option<String>| v.as_deref().is_none_or(|s| s.trim().is_empty());
                if blank(title) && blank(description) {
                    return Err(AutopilotError::InvalidDecision(
                        "update_meta requires a title or description".to_string(),
                    ));
                }
            }
            Self::InternalLinks { links } => {
                if links.is_empty() {
                    return Err(AutopilotError::InvalidDecision(
                        "internal_links requires at least one link".to_string(),
                    ));
                }
                if let Some(bad) = links.iter().find(|l| l.url.trim().is_empty()) {
                    return Err(AutopilotError::InvalidDecision(format!(
                        "internal_links entry has empty url (anchor {:?})",
                        bad.anchor
                    )));
                }
            }
            Self::CleanupSnapshots { keep_latest } => {
                if *keep_latest == 0 {
                    return Err(AutopilotError::InvalidDecision(
                        "cleanup_snapshots must keep at least one snapshot".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Generator output before hashing and persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedDecision {
    pub target_id: String,
    pub action: DecisionAction,
    pub priority: Priority,
    pub auto: bool,
    pub source: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub hash: String,
    pub decision_type: DecisionType,
    pub target_id: String,
    pub action: DecisionAction,
    pub priority: Priority,
    pub auto: bool,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub source: String,
    pub status: DecisionStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_by: Option<String>,
}

impl Decision {
    pub fn planned(proposed: ProposedDecision, now: DateTime<Utc>) -> Result<Self> {
        proposed.action.validate()?;
        let decision_type = proposed.action.decision_type();
        let hash = decision_hash(decision_type, &proposed.target_id, &proposed.action)?;
        Ok(Self {
            hash,
            decision_type,
            target_id: proposed.target_id,
            action: proposed.action,
            priority: proposed.priority,
            auto: proposed.auto,
            confidence: proposed.confidence,
            source: proposed.source,
            status: DecisionStatus::Planned,
            reason: None,
            created_at: now,
            decided_at: None,
            decided_by: None,
        })
    }
}

/// Stable digest of type, target and content; the decision's idempotency key.
pub fn decision_hash(
    decision_type: DecisionType,
    target_id: &str,
    action: &DecisionAction,
) -> Result<String> {
    let content = serde_json::to_string(action)?;
    let mut hasher = Sha256::new();
    hasher.update(decision_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(target_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    Ok(bytes_to_hex(&hasher.finalize()))
}

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(nibble_to_hex(byte >> 4));
        out.push(nibble_to_hex(byte & 0x0f));
    }
    out
}

fn nibble_to_hex(nibble: u8) -> char {
    match nibble {
        0..=9 => (b'0' + nibble) as char,
        10..=15 => (b'a' + (nibble - 10)) as char,
        _ => '0',
    }
}
