//! Outbound tunnel lifecycle (cloudflared).
//!
//! Manages a single relay child exposing the local API publicly. Quick mode
//! discovers the random public hostname by scanning the relay's output;
//! token mode waits for the connection-registered marker and takes the URL
//! from configuration, since a named tunnel's hostname is registered out of
//! band. The CLI has no documented local signaling channel, so URL discovery
//! is output-scraping, kept behind the pure and independently tested
//! [`detect_public_url`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::RelayError;
use crate::locate::CliLocator;
use crate::proc::{forward_lines, run_command};

/// Startup race: the child is killed if no URL is detected in time.
pub const START_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(2);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

const RELAY_TOOL: &str = "cloudflared";
/// Token-mode marker: printed once the relay registers its first connection.
const REGISTERED_MARKER: &str = "Registered tunnel connection";

static QUICK_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://[a-zA-Z0-9][a-zA-Z0-9-]*\.trycloudflare\.com").expect("tunnel url regex")
});

/// Pure output-scrape for the quick-tunnel hostname.
pub fn detect_public_url(output: &str) -> Option<Url> {
    let found = QUICK_URL_RE.find(output)?;
    Url::parse(found.as_str()).ok()
}

#[derive(Debug, Clone)]
pub enum TunnelMode {
    /// Random ephemeral `trycloudflare.com` hostname.
    Quick,
    /// Pre-registered custom domain bound via a long-lived credential.
    Token { token: String, hostname: String },
}

/// Transient, in-memory state; exactly one instance lives inside the single
/// [`TunnelManager`].
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub active: bool,
    pub url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TunnelStatus {
    fn idle() -> Self {
        Self {
            active: false,
            url: None,
            started_at: None,
            error: None,
        }
    }

    fn errored(message: impl Into<String>) -> Self {
        Self {
            active: false,
            url: None,
            started_at: None,
            error: Some(message.into()),
        }
    }
}

struct TunnelInner {
    child: Option<Child>,
    status: TunnelStatus,
    /// A launch is in flight; the lock is not held across the startup race.
    starting: bool,
}

pub struct TunnelManager {
    local_port: u16,
    mode: TunnelMode,
    locator: CliLocator,
    /// Managed install dir used when the relay binary is self-downloaded.
    bin_dir: PathBuf,
    inner: Mutex<TunnelInner>,
}

impl TunnelManager {
    pub fn new(local_port: u16, mode: TunnelMode, override_path: Option<PathBuf>) -> Self {
        let bin_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("coderelay")
            .join("bin");
        Self {
            local_port,
            mode,
            locator: CliLocator::new(RELAY_TOOL, override_path),
            bin_dir,
            inner: Mutex::new(TunnelInner {
                child: None,
                status: TunnelStatus::idle(),
                starting: false,
            }),
        }
    }

    pub async fn status(&self) -> TunnelStatus {
        self.inner.lock().await.status.clone()
    }

    /// Capability check; never hard-fails the host.
    pub async fn is_installed(&self) -> bool {
        self.locator.locate().await.is_resolved() || self.managed_binary().is_file()
    }

    fn managed_binary(&self) -> PathBuf {
        let name = if cfg!(windows) {
            "cloudflared.exe"
        } else {
            "cloudflared"
        };
        self.bin_dir.join(name)
    }

    /// Resolve the relay binary, self-downloading the platform artifact when
    /// it is absent everywhere else.
    async fn resolve_binary(&self) -> Result<PathBuf, RelayError> {
        let location = self.locator.locate().await;
        if location.is_resolved() {
            return Ok(location.command_path());
        }
        let managed = self.managed_binary();
        if managed.is_file() {
            return Ok(managed);
        }
        self.download().await?;
        Ok(self.managed_binary())
    }

    /// Fetch the platform/arch artifact into the managed bin dir, extracting
    /// archives and setting the executable bit on unix.
    pub async fn download(&self) -> Result<(), RelayError> {
        let url = artifact_url();
        info!(%url, "downloading relay binary");
        tokio::fs::create_dir_all(&self.bin_dir).await?;

        let bytes = reqwest::Client::new()
            .get(url.as_str())
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let target = self.managed_binary();
        if url.ends_with(".tgz") {
            let archive = self.bin_dir.join("cloudflared.tgz");
            tokio::fs::write(&archive, &bytes).await?;
            let dir = self.bin_dir.display().to_string();
            let archive_str = archive.display().to_string();
            run_command(
                &PathBuf::from("tar"),
                &["-xzf", &archive_str, "-C", &dir],
                DOWNLOAD_TIMEOUT,
            )
            .await?;
            let _ = tokio::fs::remove_file(&archive).await;
        } else {
            tokio::fs::write(&target, &bytes).await?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&target).await?.permissions();
            perms.set_mode(0o755);
            tokio::fs::set_permissions(&target, perms).await?;
        }

        Ok(())
    }

    /// Start the relay. A no-op returning the current status when already
    /// active; failures degrade to a reported error status instead of an Err
    /// so the host process never crashes over tunnel trouble.
    ///
    /// The lock is released during the launch itself, so `status()` and
    /// `stop()` stay responsive throughout the startup race; a second caller
    /// arriving mid-launch gets the pre-launch status back.
    pub async fn start(&self) -> TunnelStatus {
        {
            let mut inner = self.inner.lock().await;
            if inner.child.is_some() && inner.status.active {
                return inner.status.clone();
            }
            if inner.starting {
                return inner.status.clone();
            }
            inner.starting = true;
        }

        let outcome = self.launch().await;

        let mut inner = self.inner.lock().await;
        inner.starting = false;
        match outcome {
            Ok((child, status)) => {
                inner.child = Some(child);
                inner.status = status;
            }
            Err(err) => {
                warn!(%err, "tunnel startup failed");
                inner.status = TunnelStatus::errored(err.to_string());
            }
        }
        inner.status.clone()
    }

    async fn launch(&self) -> Result<(Child, TunnelStatus), RelayError> {
        let binary = self.resolve_binary().await?;

        let args: Vec<String> = match &self.mode {
            TunnelMode::Quick => vec![
                "tunnel".into(),
                "--url".into(),
                format!("http://localhost:{}", self.local_port),
            ],
            TunnelMode::Token { token, .. } => {
                vec!["tunnel".into(), "run".into(), "--token".into(), token.clone()]
            }
        };

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RelayError::Tunnel(format!("failed to spawn relay: {err}")))?;

        // Combined stdout/stderr line feed; cloudflared logs to stderr.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, line_tx);
        }

        let url = match self.await_public_url(&mut line_rx).await {
            Ok(url) => url,
            Err(err) => {
                let _ = child.start_kill();
                return Err(err);
            }
        };

        // Keep draining so the child never blocks on a full pipe.
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                debug!(target: "coderelay::tunnel", "{line}");
            }
        });

        info!(%url, "tunnel active");
        let status = TunnelStatus {
            active: true,
            url: Some(url),
            started_at: Some(Utc::now()),
            error: None,
        };
        Ok((child, status))
    }

    async fn await_public_url(
        &self,
        lines: &mut mpsc::Receiver<String>,
    ) -> Result<String, RelayError> {
        let deadline = tokio::time::Instant::now() + START_TIMEOUT;
        loop {
            let line = tokio::time::timeout_at(deadline, lines.recv())
                .await
                .map_err(|_| RelayError::Tunnel(format!(
                    "no public URL detected within {}s",
                    START_TIMEOUT.as_secs()
                )))?
                .ok_or_else(|| RelayError::Tunnel("relay exited before reporting a URL".into()))?;

            match &self.mode {
                TunnelMode::Quick => {
                    if let Some(url) = detect_public_url(&line) {
                        return Ok(url.to_string());
                    }
                }
                TunnelMode::Token { hostname, .. } => {
                    if line.contains(REGISTERED_MARKER) {
                        return Ok(format!("https://{hostname}"));
                    }
                }
            }
        }
    }

    /// Graceful stop: SIGTERM, a 2 s grace window probed with signal-0, then
    /// a force kill. Clears cached state regardless of outcome; stopping an
    /// already-stopped tunnel is a no-op.
    pub async fn stop(&self) -> TunnelStatus {
        let mut inner = self.inner.lock().await;
        let Some(mut child) = inner.child.take() else {
            inner.status = TunnelStatus::idle();
            return inner.status.clone();
        };

        terminate_gracefully(&mut child).await;
        inner.status = TunnelStatus::idle();
        inner.status.clone()
    }

    /// OS-level kill-by-name sweep for crash recovery; independent of local
    /// ownership tracking and always best-effort.
    pub async fn force_kill_all(&self) {
        let result = if cfg!(windows) {
            run_command(
                &PathBuf::from("taskkill"),
                &["/IM", "cloudflared.exe", "/F"],
                Duration::from_secs(5),
            )
            .await
        } else {
            run_command(
                &PathBuf::from("pkill"),
                &["-x", RELAY_TOOL],
                Duration::from_secs(5),
            )
            .await
        };
        if let Err(err) = result {
            debug!(%err, "force kill sweep found nothing to do");
        }
        let mut inner = self.inner.lock().await;
        // The sweep matches by name only; the owned child is killed directly
        // so it cannot be left running under a different binary name.
        if let Some(mut child) = inner.child.take() {
            let _ = child.start_kill();
        }
        inner.status = TunnelStatus::idle();
    }
}

#[cfg(unix)]
async fn terminate_gracefully(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(raw_pid) = child.id() else {
        return;
    };
    let pid = Pid::from_raw(raw_pid as i32);

    if kill(pid, Signal::SIGTERM).is_err() {
        // Already gone.
        let _ = child.wait().await;
        return;
    }

    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while tokio::time::Instant::now() < deadline {
        // Signal-0 probe: checks liveness without delivering anything.
        if kill(pid, None).is_err() {
            let _ = child.wait().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    warn!(pid = raw_pid, "relay ignored SIGTERM; force killing");
    let _ = child.kill().await;
}

#[cfg(not(unix))]
async fn terminate_gracefully(child: &mut Child) {
    let _ = child.kill().await;
}

/// Platform/arch-specific release artifact. macOS ships a tarball, the
/// others a bare binary.
fn artifact_url() -> String {
    const BASE: &str = "https://github.com/cloudflare/cloudflared/releases/latest/download";
    let file = if cfg!(target_os = "macos") {
        if cfg!(target_arch = "aarch64") {
            "cloudflared-darwin-arm64.tgz"
        } else {
            "cloudflared-darwin-amd64.tgz"
        }
    } else if cfg!(target_os = "windows") {
        "cloudflared-windows-amd64.exe"
    } else if cfg!(target_arch = "aarch64") {
        "cloudflared-linux-arm64"
    } else {
        "cloudflared-linux-amd64"
    };
    format!("{BASE}/{file}")
}
