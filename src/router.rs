//! Model-based routing between agent backends.
//!
//! Pure mapping and dispatch; no subprocess logic lives here. Backends are
//! injected as trait objects so the gateway can be exercised with fakes, and
//! adding a third backend is one new manager plus one predicate in
//! [`provider_for`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::agent::{AgentManager, AgentStatus, ChatTurn, StreamEvent, compose_history};
use crate::error::RelayError;

/// Public model ids served by the chat provider, including display aliases.
const GEMINI_FAMILY: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.5-flash-lite",
    "gemini-pro",
    "gemini-flash",
    "gemini-flash-lite",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Codex,
    Gemini,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }
}

/// Total mapping from a public model id to its provider. Every input
/// resolves; nothing is rejected at this layer.
pub fn provider_for(model: &str) -> Provider {
    let lower = model.trim().to_ascii_lowercase();
    if lower.starts_with("gemini") || GEMINI_FAMILY.contains(&lower.as_str()) {
        Provider::Gemini
    } else {
        Provider::Codex
    }
}

/// Registry entry for `/v1/models` and canonical-token resolution.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub canonical: String,
    pub provider: Provider,
}

/// Static per-provider registry. Unknown ids fall back to the provider's
/// default mid tier rather than erroring.
pub fn model_info(model: &str) -> ModelInfo {
    let provider = provider_for(model);
    let (id, display_name, canonical) = match (provider, model) {
        (Provider::Codex, "gpt-5") => ("gpt-5", "GPT-5", "gpt-5"),
        (Provider::Codex, "codex-mini") | (Provider::Codex, "gpt-5-codex-mini") => {
            ("gpt-5-codex-mini", "GPT-5 Codex Mini", "gpt-5-codex-mini")
        }
        (Provider::Codex, "gpt-5-codex") | (Provider::Codex, "codex") => {
            ("gpt-5-codex", "GPT-5 Codex", "gpt-5-codex")
        }
        (Provider::Codex, _) => ("gpt-5-codex", "GPT-5 Codex", "gpt-5-codex"),
        (Provider::Gemini, "gemini-2.5-pro") | (Provider::Gemini, "gemini-pro") => {
            ("gemini-2.5-pro", "Gemini 2.5 Pro", "gemini-2.5-pro")
        }
        (Provider::Gemini, "gemini-2.5-flash-lite") | (Provider::Gemini, "gemini-flash-lite") => (
            "gemini-2.5-flash-lite",
            "Gemini 2.5 Flash Lite",
            "gemini-2.5-flash-lite",
        ),
        (Provider::Gemini, _) => ("gemini-2.5-flash", "Gemini 2.5 Flash", "gemini-2.5-flash"),
    };
    ModelInfo {
        id: id.to_owned(),
        display_name: display_name.to_owned(),
        canonical: canonical.to_owned(),
        provider,
    }
}

/// Registry dump for `/v1/models`.
pub fn list_models() -> Vec<ModelInfo> {
    [
        "gpt-5-codex",
        "gpt-5",
        "gpt-5-codex-mini",
        "gemini-2.5-pro",
        "gemini-2.5-flash",
        "gemini-2.5-flash-lite",
    ]
    .iter()
    .map(|id| model_info(id))
    .collect()
}

/// Callable generation capability, implemented by [`AgentManager`] and by
/// test stubs.
#[async_trait]
pub trait PromptBackend: Send + Sync {
    async fn run_prompt(
        &self,
        prompt: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<String, RelayError>;

    async fn run_with_history(
        &self,
        turns: &[ChatTurn],
        model: &str,
        timeout: Duration,
    ) -> Result<String, RelayError>;

    async fn spawn_stream(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<(String, mpsc::Receiver<StreamEvent>), RelayError>;

    async fn status(&self, force_refresh: bool) -> AgentStatus;
}

#[async_trait]
impl PromptBackend for AgentManager {
    async fn run_prompt(
        &self,
        prompt: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<String, RelayError> {
        AgentManager::run_prompt(self, prompt, model, timeout).await
    }

    async fn run_with_history(
        &self,
        turns: &[ChatTurn],
        model: &str,
        timeout: Duration,
    ) -> Result<String, RelayError> {
        AgentManager::run_with_history(self, turns, model, timeout).await
    }

    async fn spawn_stream(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<(String, mpsc::Receiver<StreamEvent>), RelayError> {
        AgentManager::spawn_stream(self, prompt, model).await
    }

    async fn status(&self, force_refresh: bool) -> AgentStatus {
        AgentManager::status(self, force_refresh).await
    }
}

/// Normalized result shape regardless of which backend answered.
#[derive(Debug, Clone)]
pub struct RoutedOutput {
    pub output: String,
    pub provider: Provider,
}

/// Streaming counterpart: the tracked process id, the event feed, and the
/// backend that is producing it.
pub struct RoutedStream {
    pub id: String,
    pub events: mpsc::Receiver<StreamEvent>,
    pub provider: Provider,
}

pub struct ModelRouter {
    code: Arc<dyn PromptBackend>,
    chat: Arc<dyn PromptBackend>,
}

impl ModelRouter {
    pub fn new(code: Arc<dyn PromptBackend>, chat: Arc<dyn PromptBackend>) -> Self {
        Self { code, chat }
    }

    fn backend(&self, provider: Provider) -> &Arc<dyn PromptBackend> {
        match provider {
            Provider::Codex => &self.code,
            Provider::Gemini => &self.chat,
        }
    }

    pub async fn run_prompt(
        &self,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<RoutedOutput, RelayError> {
        let provider = provider_for(model);
        let output = self
            .backend(provider)
            .run_prompt(prompt, model, timeout)
            .await?;
        Ok(RoutedOutput { output, provider })
    }

    pub async fn run_with_history(
        &self,
        model: &str,
        turns: &[ChatTurn],
        timeout: Duration,
    ) -> Result<RoutedOutput, RelayError> {
        let provider = provider_for(model);
        let output = self
            .backend(provider)
            .run_with_history(turns, model, timeout)
            .await?;
        Ok(RoutedOutput { output, provider })
    }

    pub async fn run_with_history_stream(
        &self,
        model: &str,
        turns: &[ChatTurn],
    ) -> Result<RoutedStream, RelayError> {
        let provider = provider_for(model);
        let prompt = compose_history(turns);
        let (id, events) = self.backend(provider).spawn_stream(&prompt, model).await?;
        Ok(RoutedStream {
            id,
            events,
            provider,
        })
    }

    pub async fn code_status(&self, force_refresh: bool) -> AgentStatus {
        self.code.status(force_refresh).await
    }

    pub async fn chat_status(&self, force_refresh: bool) -> AgentStatus {
        self.chat.status(force_refresh).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_family_routes_to_chat_provider() {
        for model in GEMINI_FAMILY {
            assert_eq!(provider_for(model), Provider::Gemini, "model {model}");
        }
        assert_eq!(provider_for("gemini-3.0-future"), Provider::Gemini);
        assert_eq!(provider_for("  Gemini-Pro  "), Provider::Gemini);
    }

    #[test]
    fn everything_else_routes_to_code_provider() {
        for model in ["gpt-5-codex", "gpt-4o", "claude-3", "", "💥", "random-id"] {
            assert_eq!(provider_for(model), Provider::Codex, "model {model:?}");
        }
    }

    #[test]
    fn unknown_ids_fall_back_to_mid_tier() {
        assert_eq!(model_info("gpt-9000").canonical, "gpt-5-codex");
        assert_eq!(model_info("gemini-9000").canonical, "gemini-2.5-flash");
    }

    #[test]
    fn registry_lists_both_providers() {
        let models = list_models();
        assert!(models.iter().any(|m| m.provider == Provider::Codex));
        assert!(models.iter().any(|m| m.provider == Provider::Gemini));
    }
}
