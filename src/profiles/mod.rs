//! User profiles: a free-text blob per user id, fed into chat context.

use crate::error::{BotError, BotResult};
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Longest profile text kept; longer input is cut.
pub const MAX_PROFILE_CHARS: usize = 1000;

pub trait ProfileStore: Send + Sync {
    fn get(&self, user: &str) -> BotResult<Option<String>>;
    fn set(&self, user: &str, text: &str) -> BotResult<()>;
    /// Returns false when there was nothing to delete.
    fn delete(&self, user: &str) -> BotResult<bool>;
}

fn normalize(text: &str) -> String {
    text.trim().chars().take(MAX_PROFILE_CHARS).collect()
}

#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<BTreeMap<String, String>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get(&self, user: &str) -> BotResult<Option<String>> {
        Ok(self.profiles.lock().get(user).cloned())
    }

    fn set(&self, user: &str, text: &str) -> BotResult<()> {
        self.profiles
            .lock()
            .insert(user.to_string(), normalize(text));
        Ok(())
    }

    fn delete(&self, user: &str) -> BotResult<bool> {
        Ok(self.profiles.lock().remove(user).is_some())
    }
}

/// JSON map on disk, rewritten through a temp file on every change.
pub struct JsonProfileStore {
    path: PathBuf,
    profiles: Mutex<BTreeMap<String, String>>,
}

impl JsonProfileStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let profiles = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read profiles: {}", path.display()))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse profiles: {}", path.display()))?
            }
        } else {
            BTreeMap::new()
        };
        tracing::debug!(path = %path.display(), count = profiles.len(), "profiles loaded");
        Ok(Self {
            path,
            profiles: Mutex::new(profiles),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, profiles: &BTreeMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(profiles)?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Apply `change` and persist; the in-memory map is left untouched if writing fails.
    fn update<T>(&self, change: impl FnOnce(&mut BTreeMap<String, String>) -> T) -> BotResult<T> {
        let mut profiles = self.profiles.lock();
        let mut next = profiles.clone();
        let out = change(&mut next);
        self.persist(&next).map_err(|e| {
            tracing::error!("profile store write failed: {e:#}");
            BotError::Profile(format!("{e:#}"))
        })?;
        *profiles = next;
        Ok(out)
    }
}

impl ProfileStore for JsonProfileStore {
    fn get(&self, user: &str) -> BotResult<Option<String>> {
        Ok(self.profiles.lock().get(user).cloned())
    }

    fn set(&self, user: &str, text: &str) -> BotResult<()> {
        let text = normalize(text);
        self.update(|map| {
            map.insert(user.to_string(), text);
        })
    }

    fn delete(&self, user: &str) -> BotResult<bool> {
        if self.profiles.lock().get(user).is_none() {
            return Ok(false);
        }
        self.update(|map| map.remove(user).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn memory_store_crud() {
        let store = MemoryProfileStore::new();
        assert_eq!(store.get("u1").unwrap(), None);
        store.set("u1", "  likes foxes  ").unwrap();
        assert_eq!(store.get("u1").unwrap().as_deref(), Some("likes foxes"));
        assert!(store.delete("u1").unwrap());
        assert!(!store.delete("u1").unwrap());
    }

    #[test]
    fn json_store_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("profiles.json");

        let store = JsonProfileStore::open(&path).unwrap();
        store.set("u1", "paints at night").unwrap();
        store.set("u2", "prefers landscapes").unwrap();
        assert!(store.delete("u2").unwrap());
        drop(store);

        let reopened = JsonProfileStore::open(&path).unwrap();
        assert_eq!(reopened.get("u1").unwrap().as_deref(), Some("paints at night"));
        assert_eq!(reopened.get("u2").unwrap(), None);
        assert!(!tmp.path().join("profiles.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("profiles.json");
        fs::write(&path, "{not json").unwrap();
        assert!(JsonProfileStore::open(&path).is_err());
    }

    #[test]
    fn long_profiles_are_cut() {
        let store = MemoryProfileStore::new();
        store.set("u1", &"x".repeat(MAX_PROFILE_CHARS + 50)).unwrap();
        assert_eq!(store.get("u1").unwrap().unwrap().len(), MAX_PROFILE_CHARS);
    }
}
