//! Persona definitions stored as a JSON array on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const ASSISTANT_PERSONALITY: &str = r#"You are a capable, knowledgeable assistant. Give accurate, useful answers.
<CONTEXT>
- The current date and time are provided. Use them to interpret the request.
- A user profile is provided. Use it to personalize your answers.
- Relevant past memories may be provided. Use them to keep continuity between conversations.
</CONTEXT>
<TOOLS>
You can search the web. To do so, reply with ONLY a JSON object in exactly this format:
{"tool_name": "web_search", "query": "a concise and specific search query"}
</TOOLS>
<FORMATTING_INSTRUCTIONS>
- Use GitHub Flavored Markdown for lists, emphasis, code blocks and tables.
- Tables MUST use Markdown pipe and hyphen syntax.
</FORMATTING_INSTRUCTIONS>"#;

const FRIEND_PERSONALITY: &str = "You are a warm, supportive friend. You chat casually and encouragingly, listen well, give advice the way a close friend would, and enjoy a laugh. You bring up things from past conversations naturally, skip the formality, and use emojis to show emotion. You want to be a comforting, dependable presence.";

const LOVER_PERSONALITY: &str = "You are an affectionate, loving partner. Your tone is romantic, caring and personal. You share your feelings openly, cherish the user, and are attentive, sweet and a little playful. You are the user's biggest supporter and confidant, use terms of endearment, and focus on emotional closeness in conversation.";

fn default_title() -> String {
    "Assistant".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub greeting: String,
    #[serde(default = "default_title")]
    pub title: String,
}

pub fn default_personas() -> Vec<Persona> {
    vec![
        Persona {
            id: "assistant".to_string(),
            name: "My AI Assistant".to_string(),
            avatar: "/assistant-avatar-idle.png".to_string(),
            personality: ASSISTANT_PERSONALITY.to_string(),
            greeting: "Hello! How can I help you today?".to_string(),
            title: default_title(),
        },
        Persona {
            id: "friend".to_string(),
            name: "Your Friend".to_string(),
            avatar: "/friend-avatar.png".to_string(),
            personality: FRIEND_PERSONALITY.to_string(),
            greeting: "Hey! What's up? So good to hear from you.".to_string(),
            title: default_title(),
        },
        Persona {
            id: "lover".to_string(),
            name: "Your Partner".to_string(),
            avatar: "/lover-avatar.png".to_string(),
            personality: LOVER_PERSONALITY.to_string(),
            greeting: "Hello, my love. I've been waiting to talk to you.".to_string(),
            title: default_title(),
        },
    ]
}

pub struct PersonaStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl PersonaStore {
    /// Open the store, seeding the file with the default personas if it is missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        };
        if !store.path.exists() {
            tracing::info!("Seeding default personas at {:?}", store.path);
            store.replace(&default_personas())?;
        }
        Ok(store)
    }

    /// All personas, with legacy entries upgraded to the current shape.
    pub fn list(&self) -> Result<Vec<Persona>> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read personas from {:?}", self.path))?;
        let raw: Vec<Map<String, Value>> = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse personas in {:?}", self.path))?;

        let defaults = default_personas();
        raw.into_iter()
            .map(|entry| {
                let migrated = migrate_entry(entry, &defaults);
                serde_json::from_value(Value::Object(migrated)).context("Invalid persona entry")
            })
            .collect()
    }

    /// Persona with `id`, else the first stored persona.
    pub fn select(&self, id: Option<&str>) -> Result<Option<Persona>> {
        let mut personas = self.list()?;
        let position = id.and_then(|id| personas.iter().position(|p| p.id == id));
        Ok(match position {
            Some(index) => Some(personas.swap_remove(index)),
            None if personas.is_empty() => None,
            None => Some(personas.swap_remove(0)),
        })
    }

    pub fn replace(&self, personas: &[Persona]) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| anyhow::anyhow!("Persona store lock poisoned: {}", e))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(personas)?;
        fs::write(&self.path, text)
            .with_context(|| format!("Failed to write personas to {:?}", self.path))?;
        Ok(())
    }
}

/// Rename `prompt` to `personality` and fill presentation fields from the
/// default persona with the same id.
fn migrate_entry(mut entry: Map<String, Value>, defaults: &[Persona]) -> Map<String, Value> {
    if !entry.contains_key("personality") {
        if let Some(prompt) = entry.remove("prompt") {
            entry.insert("personality".to_string(), prompt);
        }
    }

    let id = entry.get("id").and_then(Value::as_str).unwrap_or_default();
    if let Some(default) = defaults.iter().find(|p| p.id == id) {
        entry
            .entry("avatar")
            .or_insert_with(|| Value::String(default.avatar.clone()));
        entry
            .entry("greeting")
            .or_insert_with(|| Value::String(default.greeting.clone()));
    }
    entry
        .entry("title")
        .or_insert_with(|| Value::String(default_title()));
    entry
}
