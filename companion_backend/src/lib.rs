pub mod agent;
pub mod config;
pub mod database;
pub mod embedding;
pub mod http_client;
pub mod llm_client;
pub mod memory;
pub mod personas;
pub mod profile;
pub mod runtime;
pub mod server;
pub mod tools;
