//! Chat core: sessions, token-budgeted context windows, and the send flow.
//!
//! Submodules:
//! - `tokens`: Token counting shared by every context window
//! - `types`: Messages, sessions, context-window config, generation state
//! - `context`: Per-session context window (token accounting, trimming)
//! - `store`: Durable session store interface
//! - `database`: SQLite store plus token-usage analytics
//! - `manager`: Session lifecycle and persistence coordination
//! - `orchestrator`: Send / stop generation flow
//! - `errors`: Chat-level error types

pub mod context;
pub mod database;
pub mod errors;
pub mod manager;
pub mod orchestrator;
pub mod store;
pub mod tokens;
pub mod types;

pub use context::{ContextSelector, ContextWindow, RecentMessages};
pub use database::{DailyUsage, ModelUsage, RoleUsage, SessionStats, SqliteSessionStore};
pub use errors::ChatError;
pub use manager::SessionManager;
pub use orchestrator::ChatService;
pub use store::SessionStore;
pub use tokens::{HeuristicTokenCounter, TokenCounter};
pub use types::{
    ContextWindowConfig, GenerationOutcome, GenerationState, Message, Role, Session,
};
