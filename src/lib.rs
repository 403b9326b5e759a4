// Memoria Library
// Exports core modules for use by both the chat loop and the CLI binary

pub mod config;
pub mod context;
pub mod controller;
pub mod remote;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use config::{AppConfig, ConfigError, EstimatorKind, MemoryConfig, RemoteConfig};
pub use context::{
    estimator_for, AssembledContext, BudgetStatus, ClassificationReport, CompactionOutcome, KnowledgeOutcome,
    ThresholdStatus, TokenEstimator, Verdict,
};
pub use controller::{ContextPreview, SessionController, TurnError, TurnOutcome, TurnPhase};
pub use remote::{ChatClient, ChatModel, RemoteError};
pub use session::{KnowledgeRecord, Message, MessageId, Role, Session, SessionId, StyleRecord};
pub use store::{InMemoryStore, JsonFileStore, MessageQuery, MessageStore, StoreError};
