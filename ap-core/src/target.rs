//! Mutable targets (pages) that actions edit and snapshots capture.

use crate::analysis::{ExistingContent, Heading};
use crate::decision::{LinkSuggestion, bytes_to_hex};
use crate::error::{AutopilotError, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Replacement content for a target, or `None` to leave it as is.
pub type TargetEdit<'a> = &'a mut dyn FnMut(Option<&str>) -> Result<Option<String>>;

/// Verbatim read/write access to a target's content.
pub trait TargetStore: Send + Sync {
    /// `None` when the target has never been written.
    fn read(&self, target_id: &str) -> Result<Option<String>>;
    fn write(&self, target_id: &str, content: &str) -> Result<()>;

    /// Read-modify-write with no other `update` or `write` of the same
    /// target in between. Returns whether content was written.
    fn update(&self, target_id: &str, edit: TargetEdit<'_>) -> Result<bool>;
}

/// One mutex per target id; entries live as long as the store.
#[derive(Debug, Default, Clone)]
struct TargetLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl TargetLocks {
    fn get(&self, target_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(target_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}

fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    docs: DashMap<String, String>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TargetStore for MemoryTargetStore {
    fn read(&self, target_id: &str) -> Result<Option<String>> {
        Ok(self.docs.get(target_id).map(|v| v.value().clone()))
    }

    fn write(&self, target_id: &str, content: &str) -> Result<()> {
        self.docs.insert(target_id.to_string(), content.to_string());
        Ok(())
    }

    fn update(&self, target_id: &str, edit: TargetEdit<'_>) -> Result<bool> {
        // The entry holds the shard lock until it drops.
        let entry = self.docs.entry(target_id.to_string());
        match entry {
            Entry::Occupied(mut slot) => match edit(Some(slot.get().as_str()))? {
                Some(next) => {
                    slot.insert(next);
                    Ok(true)
                }
                None => Ok(false),
            },
            Entry::Vacant(slot) => match edit(None)? {
                Some(next) => {
                    slot.insert(next);
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }
}

/// One JSON document per target under `root`.
#[derive(Debug, Clone)]
pub struct FsTargetStore {
    root: PathBuf,
    locks: TargetLocks,
}

impl FsTargetStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: TargetLocks::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Readable prefix plus a short digest, so distinct ids never collide
    /// after sanitizing.
    fn path_for(&self, target_id: &str) -> PathBuf {
        let mut stem: String = target_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(64)
            .collect();
        let digest = Sha256::digest(target_id.as_bytes());
        stem.push('-');
        stem.push_str(&bytes_to_hex(&digest[..4]));
        self.root.join(format!("{stem}.json"))
    }

    fn read_path(path: &Path) -> Result<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Each write stages into its own temp file, then renames over `path`.
    fn write_path(path: &Path, content: &str) -> Result<()> {
        let tmp = path.with_extension(format!("{}.tmp", ulid::Ulid::new()));
        if let Err(e) = std::fs::write(&tmp, content) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl TargetStore for FsTargetStore {
    fn read(&self, target_id: &str) -> Result<Option<String>> {
        Self::read_path(&self.path_for(target_id))
    }

    fn write(&self, target_id: &str, content: &str) -> Result<()> {
        let lock = self.locks.get(target_id);
        let _held = hold(&lock);
        Self::write_path(&self.path_for(target_id), content)
    }

    fn update(&self, target_id: &str, edit: TargetEdit<'_>) -> Result<bool> {
        let lock = self.locks.get(target_id);
        let _held = hold(&lock);
        let path = self.path_for(target_id);
        let current = Self::read_path(&path)?;
        match edit(current.as_deref())? {
            Some(next) => {
                Self::write_path(&path, &next)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSection {
    pub heading: String,
    pub level: u8,
    #[serde(default)]
    pub body: String,
}

/// Structured page document stored as a target's content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Page {
    pub title: Option<String>,
    pub description: Option<String>,
    pub sections: Vec<PageSection>,
    pub schema_types: Vec<String>,
    pub links: Vec<LinkSuggestion>,
}

impl Page {
    /// Blank content parses as an empty page.
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(content).map_err(|e| {
            AutopilotError::Serialization(format!("target content is not a page document: {e}"))
        })
    }

    pub fn to_content(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn existing(&self) -> ExistingContent {
        ExistingContent {
            headings: self
                .sections
                .iter()
                .map(|s| Heading {
                    text: s.heading.clone(),
                    level: s.level,
                })
                .collect(),
            schema_types: self.schema_types.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            links: self.links.iter().map(|l| l.url.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_store_round_trips_and_reports_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsTargetStore::new(dir.path()).expect("open store");
        assert_eq!(store.read("docs/a b").expect("read missing"), None);

        store.write("docs/a b", "{\"title\":\"A\"}").expect("write");
        assert_eq!(
            store.read("docs/a b").expect("read").as_deref(),
            Some("{\"title\":\"A\"}")
        );
        assert_ne!(store.path_for("docs/a b"), store.path_for("docs/a_b"));
    }

    fn append_line(store: &dyn TargetStore, target_id: &str, line: &str) {
        store
            .update(target_id, &mut |current: Option<&str>| {
                let mut next = current.unwrap_or_default().to_string();
                next.push_str(line);
                next.push('\n');
                Ok(Some(next))
            })
            .expect("update");
    }

    #[test]
    fn concurrent_updates_to_one_target_all_land() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = FsTargetStore::new(dir.path()).expect("open store");
        let memory = MemoryTargetStore::new();
        let stores: [&dyn TargetStore; 2] = [&fs, &memory];
        for store in stores {
            std::thread::scope(|scope| {
                for worker in 0..8 {
                    scope.spawn(move || {
                        for n in 0..25 {
                            append_line(store, "home", &format!("{worker}-{n}"));
                        }
                    });
                }
            });
            let content = store.read("home").expect("read").expect("written");
            assert_eq!(content.lines().count(), 200);
        }
        let leftovers = std::fs::read_dir(dir.path())
            .expect("list dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn update_returning_none_leaves_target_untouched() {
        let store = MemoryTargetStore::new();
        let wrote = store.update("fresh", &mut |_: Option<&str>| Ok(None)).expect("update");
        assert!(!wrote);
        assert_eq!(store.read("fresh").expect("read"), None);
    }

    #[test]
    fn page_exposes_existing_content() {
        let page = Page::parse(
            r#"{"title":"Pricing","sections":[{"heading":"Plans","level":2}],
                "links":[{"url":"/about","anchor":"About"}]}"#,
        )
        .expect("parse page");
        let existing = page.existing();
        assert_eq!(existing.headings[0].text, "Plans");
        assert_eq!(existing.links, vec!["/about".to_string()]);
        assert_eq!(Page::parse("  ").expect("blank"), Page::default());
        assert!(Page::parse("not json").is_err());
    }
}
