//! Terminal chat loop.
//!
//! The backend keeps no conversation state, so the session here owns the
//! history and resends it every turn. Pending confirmations are answered
//! with a y/n prompt and sent back as the matching continuation.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use companion_backend::agent::{TurnRequest, TurnResponse, TurnSettings};
use companion_backend::llm_client::{ChatMessage, ChatRole};
use companion_backend::personas::Persona;
use companion_backend::tools::approval::{Confirmation, Continuation};
use companion_backend::tools::web_search::SearchProvider;

use crate::api::ApiClient;

const HELP: &str = "Commands: /quit, /new, /persona <id>, /personas, /profile, /save <title>, \
/chats, /load <id>, /delete <id>, /memories, /forget <memory id>, /search on|off, /provider brave|ddgs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    Help,
    New,
    Persona(String),
    Personas,
    Profile,
    Save(String),
    Chats,
    Load(i64),
    Delete(i64),
    Memories,
    Forget(String),
    Search(bool),
    Provider(SearchProvider),
    Message(String),
}

/// Parse one input line. Anything not starting with `/` is a chat message.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Message(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let required = |usage: &str| -> Result<String, String> {
        if arg.is_empty() {
            Err(format!("usage: {}", usage))
        } else {
            Ok(arg.to_string())
        }
    };
    let chat_id = |usage: &str| -> Result<i64, String> {
        required(usage)?
            .parse::<i64>()
            .map_err(|_| format!("usage: {} (id must be a number)", usage))
    };

    match name.to_ascii_lowercase().as_str() {
        "quit" | "exit" => Ok(Command::Quit),
        "help" => Ok(Command::Help),
        "new" => Ok(Command::New),
        "persona" => Ok(Command::Persona(required("/persona <id>")?)),
        "personas" => Ok(Command::Personas),
        "profile" => Ok(Command::Profile),
        "save" => Ok(Command::Save(required("/save <title>")?)),
        "chats" => Ok(Command::Chats),
        "load" => Ok(Command::Load(chat_id("/load <id>")?)),
        "delete" => Ok(Command::Delete(chat_id("/delete <id>")?)),
        "memories" => Ok(Command::Memories),
        "forget" => Ok(Command::Forget(required("/forget <memory id>")?)),
        "search" => match arg.to_ascii_lowercase().as_str() {
            "on" => Ok(Command::Search(true)),
            "off" => Ok(Command::Search(false)),
            _ => Err("usage: /search on|off".to_string()),
        },
        "provider" => SearchProvider::parse(arg)
            .map(Command::Provider)
            .ok_or_else(|| "usage: /provider brave|ddgs".to_string()),
        other => Err(format!("unknown command '/{}' (try /help)", other)),
    }
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// The continuation that answers `confirmation`.
pub fn continuation_for(confirmation: &Confirmation, approved: bool) -> Continuation {
    match (confirmation, approved) {
        (Confirmation::Search { query }, true) => Continuation::ApprovedSearch {
            query: query.clone(),
        },
        (Confirmation::Search { .. }, false) => Continuation::DeniedSearch,
        (Confirmation::Memory { summary }, true) => Continuation::SaveMemory {
            summary: summary.clone(),
        },
        (Confirmation::Memory { .. }, false) => Continuation::DontSaveMemory,
    }
}

fn provider_name(provider: SearchProvider) -> &'static str {
    match provider {
        SearchProvider::Brave => "brave",
        SearchProvider::Ddgs => "ddgs",
    }
}

/// Client-side conversation state.
#[derive(Debug, Clone)]
pub struct Session {
    pub history: Vec<ChatMessage>,
    pub persona_id: String,
    pub settings: TurnSettings,
    pub chat_id: Option<i64>,
}

impl Session {
    pub fn new(persona_id: String) -> Self {
        Self {
            history: vec![ChatMessage::system("")],
            persona_id,
            settings: TurnSettings::default(),
            chat_id: None,
        }
    }

    pub fn reset(&mut self) {
        self.history = vec![ChatMessage::system("")];
        self.chat_id = None;
    }

    pub fn request(&self, continuation: Option<Continuation>) -> TurnRequest {
        TurnRequest {
            history: self.history.clone(),
            continuation,
            settings: Some(self.settings.clone()),
            persona_id: Some(self.persona_id.clone()),
        }
    }

    pub fn last_assistant_reply(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::Assistant)
            .map(|m| m.content.as_str())
    }

    /// History to store in a saved chat. The server rebuilds the system
    /// prompt every fresh turn, so slot 0 is saved empty.
    pub fn persistable_history(&self) -> Vec<ChatMessage> {
        let mut history = self.history.clone();
        match history.first_mut() {
            Some(first) if first.role == ChatRole::System => first.content.clear(),
            _ => history.insert(0, ChatMessage::system("")),
        }
        history
    }

    /// Number of user/assistant messages, for listings.
    pub fn visible_len(&self) -> usize {
        self.history
            .iter()
            .filter(|m| matches!(m.role, ChatRole::User | ChatRole::Assistant))
            .count()
    }
}

pub struct Repl {
    api: ApiClient,
    session: Session,
    personas: Vec<Persona>,
    input: Lines<BufReader<Stdin>>,
}

impl Repl {
    pub fn new(api: ApiClient, persona_id: String) -> Self {
        Self {
            api,
            session: Session::new(persona_id),
            personas: Vec::new(),
            input: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        match self.api.list_personas().await {
            Ok(personas) => self.personas = personas,
            Err(e) => tracing::warn!("Could not load personas: {:#}", e),
        }
        if let Some(persona) = self.active_persona() {
            println!("{}: {}", persona.name, persona.greeting);
        }
        println!("{}", HELP);

        loop {
            let Some(line) = self.prompt("> ").await? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let command = match parse_command(&line) {
                Ok(command) => command,
                Err(message) => {
                    println!("{}", message);
                    continue;
                }
            };

            if command == Command::Quit {
                break;
            }
            if let Err(e) = self.handle(command).await {
                println!("[error] {:#}", e);
            }
        }
        Ok(())
    }

    async fn prompt(&mut self, label: &str) -> Result<Option<String>> {
        use std::io::Write;
        print!("{}", label);
        std::io::stdout().flush()?;
        Ok(self.input.next_line().await?)
    }

    fn active_persona(&self) -> Option<&Persona> {
        self.personas
            .iter()
            .find(|p| p.id == self.session.persona_id)
            .or_else(|| self.personas.first())
    }

    fn speaker(&self) -> String {
        self.active_persona()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "Assistant".to_string())
    }

    async fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Quit => {}
            Command::Help => println!("{}", HELP),
            Command::New => {
                self.session.reset();
                if let Some(persona) = self.active_persona() {
                    println!("{}: {}", persona.name, persona.greeting);
                }
            }
            Command::Persona(id) => {
                if self.personas.iter().any(|p| p.id == id) {
                    self.session.persona_id = id;
                    if let Some(persona) = self.active_persona() {
                        println!("{}: {}", persona.name, persona.greeting);
                    }
                } else {
                    println!("No persona with id '{}' (see /personas)", id);
                }
            }
            Command::Personas => {
                self.personas = self.api.list_personas().await?;
                for persona in &self.personas {
                    let marker = if persona.id == self.session.persona_id { "*" } else { " " };
                    println!("{} {} - {} ({})", marker, persona.id, persona.name, persona.title);
                }
            }
            Command::Profile => {
                let profile = self.api.get_profile().await?;
                println!("Name: {}", profile.name);
                println!("Key facts: {}", profile.key_facts.join("; "));
                println!("Goals: {}", profile.main_goals.join("; "));
            }
            Command::Save(title) => match self.session.chat_id {
                Some(id) => {
                    self.api
                        .update_chat(id, &self.session.persistable_history(), &self.session.persona_id)
                        .await?;
                    println!("[Chat {} updated]", id);
                }
                None => {
                    let saved = self
                        .api
                        .save_chat(&title, &self.session.persistable_history(), &self.session.persona_id)
                        .await?;
                    self.session.chat_id = Some(saved.id);
                    println!("[Saved as chat {}: {}]", saved.id, saved.title);
                }
            },
            Command::Chats => {
                let chats = self.api.list_chats().await?;
                if chats.is_empty() {
                    println!("No saved chats.");
                }
                for chat in chats {
                    println!("{:>4}  {}", chat.id, chat.title);
                }
            }
            Command::Load(id) => {
                let transcript = self.api.load_chat(id).await?;
                self.session.history = transcript.messages;
                if self.session.history.first().map(|m| m.role) != Some(ChatRole::System) {
                    self.session.history.insert(0, ChatMessage::system(""));
                }
                if let Some(persona_id) = transcript.persona_id {
                    self.session.persona_id = persona_id;
                }
                self.session.chat_id = Some(id);
                println!("[Loaded chat {} with {} messages]", id, self.session.visible_len());
                if let Some(reply) = self.session.last_assistant_reply() {
                    println!("{}: {}", self.speaker(), reply);
                }
            }
            Command::Delete(id) => {
                self.api.delete_chat(id).await?;
                if self.session.chat_id == Some(id) {
                    self.session.chat_id = None;
                }
                println!("[Chat {} deleted]", id);
            }
            Command::Memories => {
                let memories = self.api.list_memories().await?;
                if memories.is_empty() {
                    println!("No memories stored.");
                }
                for memory in memories {
                    println!(
                        "{}  {}  {}",
                        memory.id,
                        memory.created_at.format("%Y-%m-%d"),
                        memory.text
                    );
                }
            }
            Command::Forget(id) => {
                self.api.delete_memory(&id).await?;
                println!("[Memory {} forgotten]", id);
            }
            Command::Search(enabled) => {
                self.session.settings.web_search_enabled = enabled;
                println!("[Web search {}]", if enabled { "enabled" } else { "disabled" });
            }
            Command::Provider(provider) => {
                self.session.settings.provider = provider_name(provider).to_string();
                println!("[Search provider: {}]", provider_name(provider));
            }
            Command::Message(text) => self.chat(text).await?,
        }
        Ok(())
    }

    async fn chat(&mut self, text: String) -> Result<()> {
        self.session.history.push(ChatMessage::user(text));
        let mut response = match self.send(None).await {
            Ok(response) => response,
            Err(e) => {
                self.session.history.pop();
                return Err(e);
            }
        };
        self.print_reply();

        while let Some(confirmation) = response.confirmation.take() {
            let approved = self.confirm(&confirmation).await?;
            response = self.send(Some(continuation_for(&confirmation, approved))).await?;
            match (&confirmation, approved) {
                (Confirmation::Search { .. }, _) => self.print_reply(),
                (Confirmation::Memory { .. }, true) => println!("[Memory saved.]"),
                (Confirmation::Memory { .. }, false) => println!("[Memory not saved.]"),
            }
        }
        Ok(())
    }

    async fn send(&mut self, continuation: Option<Continuation>) -> Result<TurnResponse> {
        let response = self.api.send_turn(&self.session.request(continuation)).await?;
        self.session.history = response.history.clone();
        Ok(response)
    }

    fn print_reply(&self) {
        if let Some(reply) = self.session.last_assistant_reply() {
            println!("{}: {}", self.speaker(), reply);
        }
    }

    async fn confirm(&mut self, confirmation: &Confirmation) -> Result<bool> {
        let label = match confirmation {
            Confirmation::Search { query } => {
                println!("[The assistant wants to search the web for: '{}']", query);
                "Allow web search? (y/n): "
            }
            Confirmation::Memory { summary } => {
                println!("[The assistant wants to remember: '{}']", summary);
                "Save this memory? (y/n): "
            }
        };
        Ok(self.prompt(label).await?.map(|a| is_yes(&a)).unwrap_or(false))
    }
}
