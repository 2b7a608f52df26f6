//! The user profile: a single JSON document shared by every conversation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key_facts: Vec<String>,
    #[serde(default)]
    pub main_goals: Vec<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "User".to_string(),
            key_facts: vec!["I am the user of this AI assistant.".to_string()],
            main_goals: vec!["To use this assistant to learn and be more productive.".to_string()],
        }
    }
}

pub struct ProfileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ProfileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        };
        if !store.path.exists() {
            tracing::info!("Seeding default profile at {:?}", store.path);
            store.replace(&Profile::default())?;
        }
        Ok(store)
    }

    pub fn load(&self) -> Result<Profile> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read profile from {:?}", self.path))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse profile in {:?}", self.path))
    }

    pub fn replace(&self, profile: &Profile) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| anyhow::anyhow!("Profile store lock poisoned: {}", e))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(profile)?)
            .with_context(|| format!("Failed to write profile to {:?}", self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_default_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::open(dir.path().join("profile.json")).unwrap();
        let profile = store.load().unwrap();
        assert_eq!(profile.name, "User");
        assert_eq!(profile.key_facts, vec!["I am the user of this AI assistant."]);
    }

    #[test]
    fn load_after_replace_returns_submitted_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::open(dir.path().join("nested/profile.json")).unwrap();
        let submitted = Profile {
            name: "Ada".to_string(),
            key_facts: vec!["Writes Rust".to_string(), "Lives in Lisbon".to_string()],
            main_goals: Vec::new(),
        };
        store.replace(&submitted).unwrap();
        assert_eq!(store.load().unwrap(), submitted);
        assert_eq!(store.load().unwrap(), submitted);
    }

    #[test]
    fn existing_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        fs::write(&path, r#"{"name":"Sam","key_facts":["a"]}"#).unwrap();
        let profile = ProfileStore::open(&path).unwrap().load().unwrap();
        assert_eq!(profile.name, "Sam");
        assert!(profile.main_goals.is_empty());
    }

    #[test]
    fn missing_name_loads_as_blank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        fs::write(&path, r#"{"key_facts":["Has a dog"],"main_goals":[]}"#).unwrap();

        let profile = ProfileStore::open(&path).unwrap().load().unwrap();
        assert_eq!(profile.name, "");
        assert_eq!(profile.key_facts, vec!["Has a dog"]);
        assert!(crate::agent::context::format_profile(&profile).contains("Name: N/A"));
    }
}
