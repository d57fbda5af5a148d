//! Chromium process launcher.
//!
//! Starts a Chromium-family binary with a remote debugging port and reads
//! the browser-level DevTools URL from its stderr banner:
//!
//! ```text
//! DevTools listening on ws://127.0.0.1:40123/devtools/browser/3f1c...
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::config::LaunchOptions;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// How long the browser has to print its DevTools banner.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix of the DevTools banner line.
const DEVTOOLS_BANNER: &str = "DevTools listening on ";

// ============================================================================
// ProcessGuard
// ============================================================================

/// Kills the child process when dropped.
#[derive(Debug)]
struct ProcessGuard {
    child: Option<Child>,
    pid: u32,
}

impl ProcessGuard {
    fn new(child: Child) -> Self {
        let pid = child.id().unwrap_or(0);
        debug!(pid, "Process guard created");
        Self {
            child: Some(child),
            pid,
        }
    }

    async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!(pid = self.pid, "Killing browser process");
            if let Err(e) = child.kill().await {
                debug!(pid = self.pid, error = %e, "Failed to kill process");
            }
            if let Err(e) = child.wait().await {
                debug!(pid = self.pid, error = %e, "Failed to wait for process");
            }
            info!(pid = self.pid, "Browser process terminated");
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take()
            && let Err(e) = child.start_kill()
        {
            debug!(pid = self.pid, error = %e, "Failed to send kill signal in Drop");
        }
    }
}

// ============================================================================
// BrowserProcess
// ============================================================================

/// A launched browser and its profile directory.
///
/// The process is killed on [`kill`](Self::kill) or drop; a temporary
/// profile is removed with it.
#[derive(Debug)]
pub struct BrowserProcess {
    guard: ProcessGuard,
    ws_url: String,
    _profile: Option<TempDir>,
}

impl BrowserProcess {
    /// Launches the browser and waits for its DevTools URL.
    ///
    /// # Errors
    ///
    /// [`Error::ProcessLaunchFailed`] if the binary cannot start or exits
    /// before printing the banner, [`Error::ConnectionTimeout`] if the banner
    /// does not appear in time.
    pub async fn launch(options: &LaunchOptions) -> Result<Self> {
        let temp_profile = match &options.user_data_dir {
            Some(_) => None,
            None => Some(TempDir::with_prefix("goofish-browser-")?),
        };
        let profile_dir = options
            .user_data_dir
            .as_deref()
            .or_else(|| temp_profile.as_ref().map(TempDir::path))
            .ok_or_else(|| Error::config("no profile directory"))?;

        let mut child = Command::new(&options.binary)
            .args(launch_args(options, profile_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::process_launch_failed(format!("{}: {e}", options.binary.display()))
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::process_launch_failed("stderr not captured"))?;
        let guard = ProcessGuard::new(child);
        let mut lines = BufReader::new(stderr).lines();

        let ws_url = timeout(LAUNCH_TIMEOUT, async {
            while let Some(line) = lines.next_line().await? {
                trace!(%line, "browser stderr");
                if let Some(url) = devtools_url(&line) {
                    return Ok(url.to_string());
                }
            }
            Err(Error::process_launch_failed(
                "browser exited before printing its DevTools URL",
            ))
        })
        .await
        .map_err(|_| Error::connection_timeout(LAUNCH_TIMEOUT.as_millis() as u64))??;

        // Keep draining so the pipe never fills.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(%line, "browser stderr");
            }
        });

        info!(pid = guard.pid, url = %ws_url, "Browser launched");
        Ok(Self {
            guard,
            ws_url,
            _profile: temp_profile,
        })
    }

    /// Browser-level DevTools WebSocket URL.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Process id, `0` if unknown.
    #[inline]
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.guard.pid
    }

    /// Kills the process and waits for it to exit.
    pub async fn kill(&mut self) {
        self.guard.kill().await;
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Builds the command line for `options`.
fn launch_args(options: &LaunchOptions, profile_dir: &Path) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", options.debug_port.unwrap_or(0)),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        format!(
            "--window-size={},{}",
            options.window_size.0, options.window_size.1
        ),
    ];
    if options.headless {
        args.push("--headless=new".to_string());
    }
    if let Some(proxy) = &options.proxy {
        args.push(format!("--proxy-server={proxy}"));
    }
    args.extend(options.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

/// Extracts the URL from a DevTools banner line.
fn devtools_url(line: &str) -> Option<&str> {
    let url = line.trim().strip_prefix(DEVTOOLS_BANNER)?.trim();
    url.starts_with("ws://").then_some(url)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devtools_banner_parsing() {
        assert_eq!(
            devtools_url("DevTools listening on ws://127.0.0.1:9222/devtools/browser/ab\n"),
            Some("ws://127.0.0.1:9222/devtools/browser/ab")
        );
        assert_eq!(devtools_url("[1234:ERROR] something else"), None);
        assert_eq!(devtools_url("DevTools listening on http://x"), None);
    }

    #[test]
    fn test_launch_args() {
        let mut options = LaunchOptions::new("chromium")
            .with_headless()
            .with_debug_port(9333)
            .with_arg("--mute-audio");
        options.proxy = Some("http://127.0.0.1:8080".into());

        let args = launch_args(&options, Path::new("/tmp/profile"));
        assert_eq!(args[0], "--remote-debugging-port=9333");
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--proxy-server=http://127.0.0.1:8080".to_string()));
        assert!(args.contains(&"--mute-audio".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
    }

    #[test]
    fn test_default_port_is_random() {
        let args = launch_args(&LaunchOptions::default(), Path::new("/p"));
        assert_eq!(args[0], "--remote-debugging-port=0");
        assert!(!args.contains(&"--headless=new".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_fails() {
        let options = LaunchOptions::new("/nonexistent/goofish-test-browser");
        let err = BrowserProcess::launch(&options).await.unwrap_err();
        assert!(matches!(err, Error::ProcessLaunchFailed { .. }));
    }
}
