//! Fetching media with an external downloader.

use crate::cache::{EvictionHook, HookError};
use async_trait::async_trait;
use haul_core::config::FetcherConfig;
use rand::RngCore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// A downloaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchResult {
    /// Path of the downloaded file.
    pub artifact_path: PathBuf,
    pub title: String,
    /// Directory owned by this download, removed together with the artifact.
    #[serde(skip)]
    pub scratch_dir: Option<PathBuf>,
}

impl FetchResult {
    /// File name of the artifact, as recorded in the job ledger.
    pub fn file_name(&self) -> String {
        self.artifact_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to run downloader: {0}")]
    Io(#[from] std::io::Error),

    #[error("downloader exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("unexpected downloader output: {0}")]
    Output(String),

    #[error("download timed out after {0:?}")]
    Timeout(Duration),

    #[error("download cancelled")]
    Cancelled,
}

/// Something that turns a URL into a local artifact.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `url`. `credentials` is the matching filter's credentials reference.
    async fn fetch(
        &self,
        url: &str,
        credentials: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<FetchResult, FetchError>;
}

/// Runs a yt-dlp compatible command per download.
///
/// Each download gets its own scratch directory under `work_dir`, so
/// removing one cached artifact never touches another.
pub struct CommandFetcher {
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
    timeout: Duration,
}

impl CommandFetcher {
    pub fn new(config: &FetcherConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            work_dir: config.work_dir.clone(),
            timeout: config.timeout(),
        }
    }

    fn command(&self, url: &str, credentials: Option<&str>, scratch: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--no-simulate")
            .args(["--print", "title", "--print", "after_move:filepath"])
            .arg("-P")
            .arg(scratch);
        if let Some(cookies) = credentials {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        url: &str,
        credentials: Option<&str>,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, FetchError> {
        let child = self.command(url, credentials, scratch).spawn()?;

        let output = tokio::select! {
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(output) => output?,
                Err(_) => return Err(FetchError::Timeout(self.timeout)),
            },
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Exit {
                status: output.status.to_string(),
                stderr: last_line(&stderr).to_string(),
            });
        }

        let (title, path) = parse_output(&String::from_utf8_lossy(&output.stdout))?;
        Ok(FetchResult {
            artifact_path: path,
            title,
            scratch_dir: Some(scratch.to_path_buf()),
        })
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(
        &self,
        url: &str,
        credentials: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<FetchResult, FetchError> {
        let scratch = self.work_dir.join(scratch_name());
        tokio::fs::create_dir_all(&scratch).await?;

        tracing::info!(url, scratch = %scratch.display(), "Starting download");
        let result = self.run(url, credentials, &scratch, &cancel).await;
        match &result {
            Ok(fetched) => {
                tracing::info!(url, file = %fetched.artifact_path.display(), "Download finished")
            }
            Err(e) => {
                tracing::error!(url, error = %e, "Download failed");
                if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
                    tracing::warn!(path = %scratch.display(), error = %e, "Failed to remove scratch directory");
                }
            }
        }
        result
    }
}

fn scratch_name() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

/// The downloader prints the title, then the final file path.
fn parse_output(stdout: &str) -> Result<(String, PathBuf), FetchError> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).rev();
    match (lines.next(), lines.next()) {
        (Some(path), Some(title)) => Ok((title.to_string(), PathBuf::from(path))),
        _ => Err(FetchError::Output(format!(
            "expected title and file path, got {:?}",
            stdout.trim()
        ))),
    }
}

/// Eviction hook deleting the artifact of an expired result.
pub struct RemoveArtifact;

#[async_trait]
impl EvictionHook<FetchResult> for RemoveArtifact {
    async fn on_evict(&self, key: &str, value: &FetchResult) -> Result<(), HookError> {
        let removed = match &value.scratch_dir {
            Some(dir) => tokio::fs::remove_dir_all(dir).await,
            None => tokio::fs::remove_file(&value.artifact_path).await,
        };
        match removed {
            Ok(()) => {
                tracing::debug!(key, path = %value.artifact_path.display(), "Removed expired artifact");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output_takes_last_two_lines() {
        let stdout = "[info] noise\nMy Video\n/tmp/x/My Video.mp4\n\n";
        let (title, path) = parse_output(stdout).unwrap();
        assert_eq!(title, "My Video");
        assert_eq!(path, PathBuf::from("/tmp/x/My Video.mp4"));
        assert!(parse_output("only-one-line\n").is_err());
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("a\nERROR: gone\n\n"), "ERROR: gone");
        assert_eq!(last_line(""), "");
    }

    #[tokio::test]
    async fn test_remove_artifact_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("abc");
        std::fs::create_dir_all(&scratch).unwrap();
        let artifact = scratch.join("a.mp4");
        std::fs::write(&artifact, b"data").unwrap();

        let result = FetchResult {
            artifact_path: artifact.clone(),
            title: "a".to_string(),
            scratch_dir: Some(scratch.clone()),
        };
        RemoveArtifact.on_evict("k", &result).await.unwrap();
        assert!(!scratch.exists());

        // second eviction of the same artifact is not an error
        RemoveArtifact.on_evict("k", &result).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_fetcher_reports_exit_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = CommandFetcher::new(&FetcherConfig {
            program: "false".to_string(),
            args: Vec::new(),
            work_dir: dir.path().to_path_buf(),
            timeout_secs: 5,
        });

        let err = fetcher
            .fetch("https://example.com/v", None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Exit { .. } | FetchError::Io(_)));
        // failed downloads leave no scratch directories behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
