pub mod compression;
pub mod config;
pub mod database;
pub mod dedupe;
pub mod edit;
pub mod engine;
pub mod error;
pub mod events;
pub mod generation;
pub mod http_client;
pub mod llm_client;
pub mod message_log;
pub mod prompt;
pub mod retrieval;
pub mod runtime;
pub mod server;

#[cfg(test)]
mod testing;
