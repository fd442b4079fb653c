//! Executable discovery for external agent CLIs.
//!
//! GUI-launched processes often start with a truncated PATH, so resolution
//! walks an ordered probe list and falls back to the bare command name.
//! Discovery never fails: an unresolved tool degrades to a "not found"
//! status at the health-check layer rather than an error here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::proc::run_command;

/// Wall clock bound for probes that shell out (`npm`, login-shell `which`).
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a lookup. `Fallback` carries the bare command name and relies
/// on PATH resolution at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Found(PathBuf),
    Fallback(String),
}

impl Location {
    /// Path handed to `Command::new`; either form is spawnable.
    pub fn command_path(&self) -> PathBuf {
        match self {
            Location::Found(path) => path.clone(),
            Location::Fallback(name) => PathBuf::from(name),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Location::Found(_))
    }
}

#[derive(Debug, Clone, Copy)]
enum Probe {
    Override,
    KnownDirs,
    PackageManagerBin,
    LoginShellWhich,
}

// Ordered first-match strategy; adding or removing a probe is a one-line
// change here.
const PROBES: &[Probe] = &[
    Probe::Override,
    Probe::KnownDirs,
    Probe::PackageManagerBin,
    Probe::LoginShellWhich,
];

/// Locator for one logical tool name, with an optional user override.
#[derive(Debug, Clone)]
pub struct CliLocator {
    tool: String,
    override_path: Option<PathBuf>,
}

impl CliLocator {
    pub fn new(tool: impl Into<String>, override_path: Option<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            override_path,
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub async fn locate(&self) -> Location {
        for probe in PROBES {
            if let Some(path) = self.run_probe(*probe).await {
                debug!(tool = %self.tool, probe = ?probe, path = %path.display(), "resolved executable");
                return Location::Found(path);
            }
        }
        Location::Fallback(self.tool.clone())
    }

    async fn run_probe(&self, probe: Probe) -> Option<PathBuf> {
        match probe {
            Probe::Override => self
                .override_path
                .clone()
                .filter(|path| path.is_file()),
            Probe::KnownDirs => known_install_dirs()
                .into_iter()
                .map(|dir| dir.join(executable_name(&self.tool)))
                .find(|candidate| candidate.is_file()),
            Probe::PackageManagerBin => {
                let bin_dir = npm_global_bin().await?;
                let candidate = bin_dir.join(executable_name(&self.tool));
                candidate.is_file().then_some(candidate)
            }
            Probe::LoginShellWhich => login_shell_which(&self.tool).await,
        }
    }
}

fn executable_name(tool: &str) -> String {
    if cfg!(windows) {
        format!("{tool}.cmd")
    } else {
        tool.to_owned()
    }
}

/// Well-known install directories, cheapest probes first. The nvm tree is
/// enumerated dynamically since each node version carries its own bin dir.
fn known_install_dirs() -> Vec<PathBuf> {
    let mut dirs_list: Vec<PathBuf> = Vec::new();

    if cfg!(unix) {
        dirs_list.push(PathBuf::from("/usr/local/bin"));
        dirs_list.push(PathBuf::from("/opt/homebrew/bin"));
        dirs_list.push(PathBuf::from("/usr/bin"));
    }

    if let Some(home) = dirs::home_dir() {
        dirs_list.push(home.join(".local/bin"));
        dirs_list.push(home.join(".npm-global/bin"));
        dirs_list.push(home.join(".volta/bin"));
        dirs_list.push(home.join(".bun/bin"));
        dirs_list.extend(nvm_bin_dirs(&home.join(".nvm/versions/node")));
    }

    if cfg!(windows) {
        if let Some(data) = dirs::data_dir() {
            dirs_list.push(data.join("npm"));
        }
    }

    dirs_list
}

fn nvm_bin_dirs(versions_root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(versions_root) else {
        return Vec::new();
    };
    let mut bins: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path().join("bin"))
        .filter(|path| path.is_dir())
        .collect();
    // Newest version first so a freshly installed tool wins.
    bins.sort();
    bins.reverse();
    bins
}

/// Ask the active package manager for its global bin directory.
async fn npm_global_bin() -> Option<PathBuf> {
    let output = run_command(
        &PathBuf::from(if cfg!(windows) { "npm.cmd" } else { "npm" }),
        &["prefix", "-g"],
        PROBE_TIMEOUT,
    )
    .await
    .ok()?;
    if !output.success() {
        return None;
    }
    let prefix = output.stdout.trim();
    if prefix.is_empty() {
        return None;
    }
    let prefix = PathBuf::from(prefix);
    Some(if cfg!(windows) {
        prefix
    } else {
        prefix.join("bin")
    })
}

/// `which`/`where` inside a full login shell, so user rc-file PATH entries
/// are visible even when our own environment was truncated.
async fn login_shell_which(tool: &str) -> Option<PathBuf> {
    let output = if cfg!(windows) {
        run_command(&PathBuf::from("where"), &[tool], PROBE_TIMEOUT)
            .await
            .ok()?
    } else {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_owned());
        let lookup = format!("which {tool}");
        run_command(&PathBuf::from(shell), &["-l", "-c", &lookup], PROBE_TIMEOUT)
            .await
            .ok()?
    };
    if !output.success() {
        return None;
    }
    let path = PathBuf::from(output.stdout.lines().next()?.trim());
    path.is_file().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn override_wins_when_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-agent");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"#!/bin/sh\n")
            .unwrap();

        let locator = CliLocator::new("fake-agent", Some(path.clone()));
        assert_eq!(locator.locate().await, Location::Found(path));
    }

    #[tokio::test]
    async fn missing_override_is_skipped() {
        let locator = CliLocator::new(
            "tool-that-does-not-exist-xyz",
            Some(PathBuf::from("/nonexistent/override/path")),
        );
        // Degrades to the bare name; never errors.
        match locator.locate().await {
            Location::Fallback(name) => assert_eq!(name, "tool-that-does-not-exist-xyz"),
            Location::Found(path) => panic!("unexpected resolution: {}", path.display()),
        }
    }

    #[test]
    fn nvm_dirs_prefer_newest_version() {
        let root = tempfile::tempdir().unwrap();
        for version in ["v18.2.0", "v20.11.1"] {
            std::fs::create_dir_all(root.path().join(version).join("bin")).unwrap();
        }
        let dirs = nvm_bin_dirs(root.path());
        assert_eq!(dirs.len(), 2);
        assert!(dirs[0].to_string_lossy().contains("v20.11.1"));
    }

    #[test]
    fn fallback_is_spawnable() {
        let location = Location::Fallback("codex".into());
        assert_eq!(location.command_path(), PathBuf::from("codex"));
        assert!(!location.is_resolved());
    }
}
