//! Builds the system prompt for a fresh turn.
//!
//! Order is fixed: persona personality, profile block, current time, then
//! retrieved memories, separated by blank lines. Memory retrieval is
//! best-effort; an unavailable store or embedder yields an empty block.

use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::embedding::Embedder;
use crate::llm_client::{ChatMessage, ChatRole};
use crate::memory::MemoryStore;
use crate::personas::{default_personas, Persona, PersonaStore};
use crate::profile::{Profile, ProfileStore};

pub fn format_profile(profile: &Profile) -> String {
    let name = if profile.name.trim().is_empty() {
        "N/A"
    } else {
        profile.name.as_str()
    };
    format!(
        "--- CORE MEMORY: USER PROFILE ---\nName: {}\nKey Facts: {}\nGoals: {}\n--- END USER PROFILE ---",
        name,
        profile.key_facts.join("; "),
        profile.main_goals.join("; ")
    )
}

pub fn format_time(now: &NaiveDateTime) -> String {
    format!(
        "Current date and time: {}.",
        now.format("%A, %B %d, %Y at %I:%M %p")
    )
}

/// Empty when there is nothing to show.
pub fn format_memories(memories: &[String]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    format!(
        "--- PAST MEMORIES ---\n{}\n--- END MEMORIES ---",
        memories.join("\n")
    )
}

pub fn compose_system_prompt(personality: &str, profile: &str, time: &str, memories: &str) -> String {
    format!("{}\n\n{}\n\n{}\n\n{}", personality, profile, time, memories)
}

/// Put `prompt` in slot 0, replacing an existing system message or inserting one.
pub fn install_system_prompt(history: &mut Vec<ChatMessage>, prompt: String) {
    match history.first_mut() {
        Some(first) if first.role == ChatRole::System => first.content = prompt,
        _ => history.insert(0, ChatMessage::system(prompt)),
    }
}

/// Text used for memory retrieval: the newest user message, else the newest message.
pub fn retrieval_query(history: &[ChatMessage]) -> Option<&str> {
    history
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .or_else(|| history.last())
        .map(|m| m.content.as_str())
}

pub struct ContextAssembler {
    memory: Arc<dyn MemoryStore>,
    embedder: Arc<dyn Embedder>,
    personas: Arc<PersonaStore>,
    profile: Arc<ProfileStore>,
    top_k: usize,
}

impl ContextAssembler {
    pub fn new(
        memory: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
        personas: Arc<PersonaStore>,
        profile: Arc<ProfileStore>,
        top_k: usize,
    ) -> Self {
        Self {
            memory,
            embedder,
            personas,
            profile,
            top_k,
        }
    }

    pub async fn assemble(&self, persona_id: &str, query: &str, now: &NaiveDateTime) -> String {
        let personality = self
            .persona(persona_id)
            .map(|p| p.personality)
            .unwrap_or_default();
        let profile = self.profile.load().unwrap_or_else(|e| {
            tracing::warn!("Profile unavailable, using defaults: {:#}", e);
            Profile::default()
        });
        let memories = self.relevant_memories(query).await;

        compose_system_prompt(
            &personality,
            &format_profile(&profile),
            &format_time(now),
            &format_memories(&memories),
        )
    }

    fn persona(&self, persona_id: &str) -> Option<Persona> {
        match self.personas.select(Some(persona_id)) {
            Ok(persona) => persona,
            Err(e) => {
                tracing::warn!("Persona store unavailable, using built-in personas: {:#}", e);
                let mut defaults = default_personas();
                let index = defaults
                    .iter()
                    .position(|p| p.id == persona_id)
                    .unwrap_or(0);
                Some(defaults.swap_remove(index))
            }
        }
    }

    /// Top-k memory texts for `query`; empty when the store is empty or unreachable.
    pub async fn relevant_memories(&self, query: &str) -> Vec<String> {
        match self.memory.count().await {
            Ok(0) => return Vec::new(),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Memory store unavailable: {:#}", e);
                return Vec::new();
            }
        }

        let embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!("Skipping memory retrieval, embedding failed: {:#}", e);
                return Vec::new();
            }
        };

        match self.memory.query(embedding, self.top_k).await {
            Ok(memories) => {
                tracing::debug!("Retrieved {} memories", memories.len());
                memories
            }
            Err(e) => {
                tracing::warn!("Memory query failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::DownStore;
    use crate::memory::SqliteMemoryStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    struct ConstantEmbedder;

    #[async_trait]
    impl Embedder for ConstantEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            anyhow::bail!("embedding service down")
        }
    }

    fn fixed_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(14, 7, 0)
            .unwrap()
    }

    fn assembler(
        dir: &tempfile::TempDir,
        memory: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
    ) -> ContextAssembler {
        ContextAssembler::new(
            memory,
            embedder,
            Arc::new(PersonaStore::open(dir.path().join("personas.json")).unwrap()),
            Arc::new(ProfileStore::open(dir.path().join("profile.json")).unwrap()),
            3,
        )
    }

    #[test]
    fn profile_block_format() {
        let profile = Profile {
            name: "Ada".to_string(),
            key_facts: vec!["Writes Rust".to_string(), "Has a cat".to_string()],
            main_goals: vec!["Ship v1".to_string()],
        };
        assert_eq!(
            format_profile(&profile),
            "--- CORE MEMORY: USER PROFILE ---\nName: Ada\nKey Facts: Writes Rust; Has a cat\nGoals: Ship v1\n--- END USER PROFILE ---"
        );

        let unnamed = Profile {
            name: String::new(),
            key_facts: Vec::new(),
            main_goals: Vec::new(),
        };
        assert!(format_profile(&unnamed).contains("Name: N/A\nKey Facts: \nGoals: \n"));
    }

    #[test]
    fn time_line_format() {
        assert_eq!(
            format_time(&fixed_time()),
            "Current date and time: Tuesday, March 05, 2024 at 02:07 PM."
        );
    }

    #[test]
    fn memory_block_format() {
        assert_eq!(format_memories(&[]), "");
        assert_eq!(
            format_memories(&["a".to_string(), "b".to_string()]),
            "--- PAST MEMORIES ---\na\nb\n--- END MEMORIES ---"
        );
    }

    #[test]
    fn system_prompt_replaces_or_inserts_slot_zero() {
        let mut history = vec![ChatMessage::system("old"), ChatMessage::user("Hi")];
        install_system_prompt(&mut history, "new".to_string());
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "new");

        let mut history = vec![ChatMessage::user("Hi")];
        install_system_prompt(&mut history, "new".to_string());
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], ChatMessage::system("new"));
        assert_eq!(history[1].content, "Hi");
    }

    #[test]
    fn retrieval_uses_latest_user_message() {
        let history = vec![
            ChatMessage::system("s"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
            ChatMessage::tool("results"),
        ];
        assert_eq!(retrieval_query(&history), Some("second"));
        assert_eq!(retrieval_query(&[ChatMessage::system("only")]), Some("only"));
        assert_eq!(retrieval_query(&[]), None);
    }

    #[tokio::test]
    async fn empty_memory_store_leaves_memory_section_empty() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(SqliteMemoryStore::open_in_memory().unwrap());
        let assembler = assembler(&dir, memory, Arc::new(ConstantEmbedder));

        let prompt = assembler.assemble("assistant", "Hi", &fixed_time()).await;

        assert!(prompt.starts_with("You are a capable, knowledgeable assistant."));
        assert!(prompt.contains("--- CORE MEMORY: USER PROFILE ---\nName: User"));
        assert!(prompt.contains("Current date and time: Tuesday, March 05, 2024 at 02:07 PM."));
        assert!(!prompt.contains("PAST MEMORIES"));
        assert!(prompt.ends_with("02:07 PM.\n\n"));
    }

    #[tokio::test]
    async fn stored_memories_are_appended_last() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(SqliteMemoryStore::open_in_memory().unwrap());
        memory
            .insert("m1", "User's cat is named Miso.", vec![1.0, 0.0])
            .await
            .unwrap();
        let assembler = assembler(&dir, memory, Arc::new(ConstantEmbedder));

        let prompt = assembler.assemble("friend", "cat?", &fixed_time()).await;

        assert!(prompt.starts_with("You are a warm, supportive friend."));
        assert!(prompt.ends_with(
            "--- PAST MEMORIES ---\nUser's cat is named Miso.\n--- END MEMORIES ---"
        ));
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_no_memories() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(SqliteMemoryStore::open_in_memory().unwrap());
        memory.insert("m1", "fact", vec![1.0, 0.0]).await.unwrap();
        let assembler = assembler(&dir, memory, Arc::new(BrokenEmbedder));

        assert!(assembler.relevant_memories("anything").await.is_empty());
    }

    #[tokio::test]
    async fn unavailable_memory_store_leaves_memory_section_empty() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = assembler(&dir, Arc::new(DownStore), Arc::new(ConstantEmbedder));

        assert!(assembler.relevant_memories("cat?").await.is_empty());
        let prompt = assembler.assemble("assistant", "cat?", &fixed_time()).await;
        assert!(!prompt.contains("PAST MEMORIES"));
        assert!(prompt.contains("--- CORE MEMORY: USER PROFILE ---"));
        assert!(prompt.ends_with("02:07 PM.\n\n"));
    }

    #[tokio::test]
    async fn unreadable_persona_file_falls_back_to_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(SqliteMemoryStore::open_in_memory().unwrap());
        let assembler = assembler(&dir, memory, Arc::new(ConstantEmbedder));
        std::fs::write(dir.path().join("personas.json"), "not json").unwrap();

        let prompt = assembler.assemble("lover", "hi", &fixed_time()).await;
        assert!(prompt.starts_with("You are an affectionate, loving partner."));
    }
}
