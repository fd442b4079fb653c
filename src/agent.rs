//! External agent CLI management.
//!
//! An [`AgentManager`] represents one installed generation CLI as a callable
//! capability: install/version/auth probes, one-shot prompt runs with
//! structured-output parsing, a streaming variant, and best-effort
//! termination of tracked children. The two concrete kinds (Codex for code
//! generation, Gemini for chat) differ only in argument shape and the model
//! alias tables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::locate::CliLocator;
use crate::proc::{forward_lines, run_checked};

/// Wall clock budget for one generation call.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(120);
/// Budget for `--version` and similar probes.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a composed status stays fresh before it is recomputed.
const STATUS_CACHE_TTL: Duration = Duration::from_secs(30);

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+\.\d+").expect("version regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Code-generation agent (Codex CLI).
    Codex,
    /// Chat agent (Gemini CLI).
    Gemini,
}

impl AgentKind {
    pub fn command_name(self) -> &'static str {
        match self {
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
        }
    }

    pub fn provider_name(self) -> &'static str {
        match self {
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
        }
    }

    fn api_key_env(self) -> &'static str {
        match self {
            AgentKind::Codex => "OPENAI_API_KEY",
            AgentKind::Gemini => "GEMINI_API_KEY",
        }
    }

    fn config_dir_name(self) -> &'static str {
        match self {
            AgentKind::Codex => ".codex",
            AgentKind::Gemini => ".gemini",
        }
    }

    /// Model id the CLI itself understands. Unknown public ids fall back to
    /// the provider's mid tier instead of erroring.
    pub fn canonical_model(self, model: &str) -> &'static str {
        match self {
            AgentKind::Codex => match model {
                "gpt-5" => "gpt-5",
                "gpt-5-codex" | "codex" => "gpt-5-codex",
                "codex-mini" | "gpt-5-codex-mini" => "gpt-5-codex-mini",
                _ => "gpt-5-codex",
            },
            AgentKind::Gemini => match model {
                "gemini-2.5-pro" | "gemini-pro" => "gemini-2.5-pro",
                "gemini-2.5-flash" | "gemini-flash" | "gemini" => "gemini-2.5-flash",
                "gemini-2.5-flash-lite" | "gemini-flash-lite" => "gemini-2.5-flash-lite",
                _ => "gemini-2.5-flash",
            },
        }
    }

    /// Single-shot generation invocation with structured output enabled.
    fn generation_args(self, canonical_model: &str, prompt: &str) -> Vec<String> {
        match self {
            AgentKind::Codex => vec![
                "exec".into(),
                "--json".into(),
                "--model".into(),
                canonical_model.into(),
                prompt.into(),
            ],
            AgentKind::Gemini => vec![
                "--prompt".into(),
                prompt.into(),
                "--model".into(),
                canonical_model.into(),
                "--output-format".into(),
                "json".into(),
            ],
        }
    }
}

/// How the CLI appears to be authenticated. Best effort by design: the
/// external tools expose no reliable introspection API for login state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Session,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub installed: bool,
    pub version: Option<String>,
    pub authenticated: bool,
    pub auth_method: AuthMethod,
    pub message: Option<String>,
}

/// One role-tagged turn of a multi-turn exchange.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Events emitted by the streaming path.
#[derive(Debug)]
pub enum StreamEvent {
    Data(String),
    End { exit_code: Option<i32> },
    Error(String),
}

struct CachedStatus {
    computed_at: Instant,
    status: AgentStatus,
}

pub struct AgentManager {
    kind: AgentKind,
    locator: CliLocator,
    status_cache: Mutex<Option<CachedStatus>>,
    // Shared with detached reader tasks, which deregister their child on exit.
    children: Arc<Mutex<HashMap<String, Arc<Mutex<Child>>>>>,
}

impl AgentManager {
    pub fn new(kind: AgentKind, override_path: Option<PathBuf>) -> Self {
        Self {
            kind,
            locator: CliLocator::new(kind.command_name(), override_path),
            status_cache: Mutex::new(None),
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// First success wins: locator resolution, then a direct version call
    /// through PATH.
    pub async fn is_installed(&self) -> bool {
        if self.locator.locate().await.is_resolved() {
            return true;
        }
        self.version().await.is_some()
    }

    /// Semver extracted from `--version`; raw trimmed text when the output
    /// does not match; `None` when the probe itself fails.
    pub async fn version(&self) -> Option<String> {
        let location = self.locator.locate().await;
        let output = run_checked(
            &location.command_path(),
            &["--version"],
            VERSION_PROBE_TIMEOUT,
        )
        .await
        .ok()?;
        let text = output.stdout.trim();
        match VERSION_RE.find(text) {
            Some(found) => Some(found.as_str().to_owned()),
            None if !text.is_empty() => Some(text.to_owned()),
            None => None,
        }
    }

    /// Auth heuristic: provider env var implies key auth, a provider config
    /// directory implies a session login, and a versioned CLI with neither
    /// signal is optimistically reported available with an unknown method.
    fn classify_auth(has_env_key: bool, has_config_dir: bool, versioned: bool) -> (bool, AuthMethod) {
        if has_env_key {
            (true, AuthMethod::ApiKey)
        } else if has_config_dir {
            (true, AuthMethod::Session)
        } else {
            (versioned, AuthMethod::Unknown)
        }
    }

    fn auth_signals(&self) -> (bool, bool) {
        let has_env_key = std::env::var(self.kind.api_key_env())
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        let has_config_dir = dirs::home_dir()
            .map(|home| home.join(self.kind.config_dir_name()).is_dir())
            .unwrap_or(false);
        (has_env_key, has_config_dir)
    }

    /// Composed install/version/auth status, cached for 30 s. An explicit
    /// refresh bypasses the cache.
    pub async fn status(&self, force_refresh: bool) -> AgentStatus {
        {
            let cache = self.status_cache.lock().await;
            if !force_refresh {
                if let Some(cached) = cache.as_ref() {
                    if cached.computed_at.elapsed() < STATUS_CACHE_TTL {
                        return cached.status.clone();
                    }
                }
            }
        }

        let status = self.compute_status().await;
        *self.status_cache.lock().await = Some(CachedStatus {
            computed_at: Instant::now(),
            status: status.clone(),
        });
        status
    }

    async fn compute_status(&self) -> AgentStatus {
        let version = self.version().await;
        let installed = version.is_some() || self.locator.locate().await.is_resolved();
        if !installed {
            return AgentStatus {
                installed: false,
                version: None,
                authenticated: false,
                auth_method: AuthMethod::Unknown,
                message: Some(format!(
                    "{} CLI not found; install it or set an explicit binary path",
                    self.kind.command_name()
                )),
            };
        }

        let (has_env_key, has_config_dir) = self.auth_signals();
        let (authenticated, auth_method) =
            Self::classify_auth(has_env_key, has_config_dir, version.is_some());
        let message = match auth_method {
            AuthMethod::Unknown if authenticated => {
                Some("no explicit auth signal; assuming a CLI-managed session".to_owned())
            }
            AuthMethod::Unknown => Some(format!(
                "run `{} login` or export {}",
                self.kind.command_name(),
                self.kind.api_key_env()
            )),
            _ => None,
        };

        AgentStatus {
            installed,
            version,
            authenticated,
            auth_method,
            message,
        }
    }

    /// One-shot generation. Structured output is parsed when possible and
    /// falls back to raw trimmed text; output-format drift alone never fails
    /// a request.
    pub async fn run_prompt(
        &self,
        prompt: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<String, RelayError> {
        let location = self.locator.locate().await;
        let canonical = self.kind.canonical_model(model);
        let args = self.kind.generation_args(canonical, prompt);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = run_checked(&location.command_path(), &arg_refs, timeout).await?;
        match parse_structured_output(self.kind, &output.stdout) {
            Ok(text) => Ok(text),
            Err(err) => {
                debug!(agent = self.kind.command_name(), %err, "structured parse failed; using raw output");
                Ok(output.stdout.trim().to_owned())
            }
        }
    }

    /// The underlying CLIs have no native multi-turn memory in single-shot
    /// mode, so the turns are flattened into one prompt.
    pub async fn run_with_history(
        &self,
        turns: &[ChatTurn],
        model: &str,
        timeout: Duration,
    ) -> Result<String, RelayError> {
        let prompt = compose_history(turns);
        self.run_prompt(&prompt, model, timeout).await
    }

    /// Non-blocking streaming variant. Returns a generated process id plus a
    /// channel of incremental output; the child stays tracked until it ends
    /// so it can be cancelled via [`AgentManager::kill_process`].
    pub async fn spawn_stream(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<(String, mpsc::Receiver<StreamEvent>), RelayError> {
        let location = self.locator.locate().await;
        let canonical = self.kind.canonical_model(model);
        let args = self.kind.generation_args(canonical, prompt);

        let mut child = Command::new(location.command_path())
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    RelayError::ExecutableNotFound(self.kind.command_name().to_owned())
                } else {
                    RelayError::Io(err)
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::Io(std::io::Error::other("child stdout missing")))?;
        let stderr = child.stderr.take();

        let id = format!("proc_{}", nanoid::nanoid!(10));
        let handle = Arc::new(Mutex::new(child));
        self.children.lock().await.insert(id.clone(), handle.clone());

        // Both pipes feed one line channel; a chatty stderr must never fill
        // its pipe and wedge the child.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        forward_lines(stdout, line_tx.clone());
        if let Some(stderr) = stderr {
            forward_lines(stderr, line_tx);
        }

        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        let children = self.children.clone();
        let proc_id = id.clone();
        tokio::spawn(async move {
            let mut receiver_gone = false;
            while let Some(line) = line_rx.recv().await {
                if receiver_gone {
                    continue;
                }
                if tx.send(StreamEvent::Data(line)).await.is_err() {
                    // Nobody is listening; stop the child instead of
                    // streaming into the void.
                    receiver_gone = true;
                    let _ = handle.lock().await.start_kill();
                }
            }

            let exit_code = {
                let mut child = handle.lock().await;
                match child.wait().await {
                    Ok(status) => status.code(),
                    Err(err) => {
                        let _ = tx.send(StreamEvent::Error(err.to_string())).await;
                        None
                    }
                }
            };
            let _ = tx.send(StreamEvent::End { exit_code }).await;
            children.lock().await.remove(&proc_id);
        });

        Ok((id, rx))
    }

    /// Best-effort kill of one tracked child. Unknown ids are a no-op.
    pub async fn kill_process(&self, id: &str) -> bool {
        let handle = self.children.lock().await.remove(id);
        match handle {
            Some(child) => {
                let mut child = child.lock().await;
                if let Err(err) = child.start_kill() {
                    warn!(%id, %err, "failed to kill tracked child");
                }
                true
            }
            None => false,
        }
    }

    /// Best-effort sweep over every tracked child.
    pub async fn kill_all_processes(&self) -> usize {
        let drained: Vec<_> = self.children.lock().await.drain().collect();
        let mut killed = 0;
        for (id, child) in drained {
            let mut child = child.lock().await;
            match child.start_kill() {
                Ok(()) => killed += 1,
                Err(err) => warn!(%id, %err, "failed to kill tracked child"),
            }
        }
        killed
    }
}

/// Flatten role-tagged turns into the single prompt shape the CLIs accept.
pub fn compose_history(turns: &[ChatTurn]) -> String {
    let mut prompt = String::new();
    for turn in turns {
        prompt.push_str(&turn.role);
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant:");
    prompt
}

/// Extract the assistant text from an agent CLI's structured output.
///
/// Codex emits JSONL events; the final `agent_message` item carries the
/// answer. Gemini emits one JSON document with a `response` field. Anything
/// else is a [`RelayError::ParseFailure`], which callers treat as non-fatal.
pub fn parse_structured_output(kind: AgentKind, stdout: &str) -> Result<String, RelayError> {
    match kind {
        AgentKind::Codex => {
            let mut last_message: Option<String> = None;
            for line in stdout.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                if let Some(text) = codex_agent_message(&event) {
                    last_message = Some(text);
                }
            }
            last_message.ok_or_else(|| RelayError::ParseFailure {
                context: "codex JSONL output".into(),
                detail: "no agent_message event found".into(),
            })
        }
        AgentKind::Gemini => {
            let value: Value =
                serde_json::from_str(stdout.trim()).map_err(|err| RelayError::ParseFailure {
                    context: "gemini JSON output".into(),
                    detail: err.to_string(),
                })?;
            value
                .get("response")
                .and_then(|v| v.as_str())
                .map(|s| s.to_owned())
                .ok_or_else(|| RelayError::ParseFailure {
                    context: "gemini JSON output".into(),
                    detail: "missing 'response' field".into(),
                })
        }
    }
}

fn codex_agent_message(event: &Value) -> Option<String> {
    // `{"type":"item.completed","item":{"type":"agent_message","text":…}}`
    if let Some(item) = event.get("item") {
        if item.get("type").and_then(|v| v.as_str()) == Some("agent_message") {
            return item
                .get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_owned());
        }
    }
    // Older CLIs emit the flat form `{"type":"agent_message","message":…}`.
    if event.get("type").and_then(|v| v.as_str()) == Some("agent_message") {
        return event
            .get("message")
            .and_then(|v| v.as_str())
            .map(|s| s.to_owned());
    }
    None
}
