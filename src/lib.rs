//! coderelay: an OpenAI-compatible HTTP gateway backed by locally installed
//! CLI generation agents.
//!
//! The gateway exposes `/v1/responses` and `/v1/chat/completions`, routes
//! each request to the Codex or Gemini CLI by model id, persists results and
//! API keys in SQLite, and can publish itself over a cloudflared tunnel.

pub mod agent;
pub mod error;
pub mod locate;
pub mod proc;
pub mod router;
pub mod server;
pub mod store;
pub mod tunnel;

pub use agent::{AgentKind, AgentManager, AgentStatus, ChatTurn};
pub use error::RelayError;
pub use locate::{CliLocator, Location};
pub use router::{ModelRouter, Provider, PromptBackend, provider_for};
pub use server::{AppState, build_router, serve};
pub use store::{Store, StoredResponse};
pub use tunnel::{TunnelManager, TunnelMode, TunnelStatus};
