pub mod agent;
pub mod cache;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod graph;
pub mod index;
pub mod llm;
pub mod ontology;
pub mod schema;
pub mod service;
pub mod tools;

pub use agent::{AgentState, ChatResponse};
pub use config::Config;
pub use error::{ErrorInfo, KgragError, Result};
pub use service::{BuildAck, BuildStatus, HealthReport, KnowledgeService};
