//! Resource fetch backends
//!
//! A fetcher materializes a remote locator as a local file inside a
//! scratch directory. The scratch directory travels with the result and
//! is deleted when the pipeline drops it after decoding.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use syncbox_common::Locator;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("syncbox/", env!("CARGO_PKG_VERSION"));

/// A fetched resource on local disk
#[derive(Debug)]
pub struct FetchedResource {
    /// File to hand to the decoder
    pub path: PathBuf,
    /// Human readable label for the cached list
    pub label: String,
    /// Scratch storage owning `path`; removed on drop
    pub scratch: Option<TempDir>,
}

/// Fetch backend
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Download `locator` to local storage
    async fn fetch(&self, locator: &Locator) -> Result<FetchedResource>;
}

/// Create a scratch directory, under `base` if given
pub fn scratch_dir(base: Option<&Path>) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("syncbox-");
    let dir = match base {
        Some(base) => builder.tempdir_in(base),
        None => builder.tempdir(),
    };
    dir.map_err(|e| Error::Fetch(format!("Failed to create scratch directory: {}", e)))
}

/// Fetches plain HTTP(S) URLs with reqwest
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
    scratch_base: Option<PathBuf>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: u64, scratch_base: Option<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            client,
            max_bytes,
            scratch_base,
        })
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<FetchedResource> {
        let url = reqwest::Url::parse(locator.as_str())
            .map_err(|e| Error::InvalidLocator(format!("{}: {}", locator, e)))?;
        let label = label_from_url(&url);

        debug!(locator = %locator, "HTTP fetch");

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("HTTP {} for {}", status.as_u16(), locator)));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(Error::Fetch(format!(
                    "Resource is {} bytes, limit is {}",
                    length, self.max_bytes
                )));
            }
        }

        let scratch = scratch_dir(self.scratch_base.as_deref())?;
        let path = scratch.path().join(file_name_from_url(&url));
        let mut file = tokio::fs::File::create(&path).await?;

        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::Fetch(format!("Body read failed: {}", e)))?
        {
            written += chunk.len() as u64;
            if written > self.max_bytes {
                return Err(Error::Fetch(format!(
                    "Resource exceeds {} byte limit",
                    self.max_bytes
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        info!(locator = %locator, bytes = written, "Fetched resource");

        Ok(FetchedResource {
            path,
            label,
            scratch: Some(scratch),
        })
    }
}

/// Runs an external downloader into a scratch directory
///
/// Argument templates may contain `{locator}` and `{output_dir}`. The
/// downloader must leave exactly one file behind; its stem is the label.
pub struct CommandFetcher {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    scratch_base: Option<PathBuf>,
}

impl CommandFetcher {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        scratch_base: Option<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            scratch_base,
        }
    }

    /// yt-dlp audio extraction
    ///
    /// The locator follows `--` so it is never parsed as an option.
    pub fn default_args() -> Vec<String> {
        [
            "-x",
            "--audio-format",
            "mp3",
            "--no-playlist",
            "-o",
            "{output_dir}/%(title)s.%(ext)s",
            "--",
            "{locator}",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
    }

    fn expand_args(&self, locator: &Locator, output_dir: &Path) -> Vec<String> {
        let output_dir = output_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{locator}", locator.as_str())
                    .replace("{output_dir}", &output_dir)
            })
            .collect()
    }
}

#[async_trait]
impl ResourceFetcher for CommandFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<FetchedResource> {
        let scratch = scratch_dir(self.scratch_base.as_deref())?;
        let args = self.expand_args(locator, scratch.path());

        debug!(program = %self.program, ?args, "Running downloader");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                Error::Fetch(format!(
                    "{} timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| Error::Fetch(format!("Failed to execute {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fetch(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let path = single_file_in(scratch.path()).await?;
        let label = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| locator.to_string());

        info!(locator = %locator, file = %path.display(), "Downloaded resource");

        Ok(FetchedResource {
            path,
            label,
            scratch: Some(scratch),
        })
    }
}

/// The one regular file the downloader produced
async fn single_file_in(dir: &Path) -> Result<PathBuf> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    match files.len() {
        0 => Err(Error::Fetch("Downloader produced no file".to_string())),
        1 => Ok(files.remove(0)),
        n => Err(Error::Fetch(format!("Downloader produced {} files, expected one", n))),
    }
}

fn label_from_url(url: &reqwest::Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|segment| segment.to_string())
        .or_else(|| url.host_str().map(|host| host.to_string()))
        .unwrap_or_else(|| url.to_string())
}

/// Scratch file name, keeping the extension as a decoder hint
fn file_name_from_url(url: &reqwest::Url) -> String {
    let ext = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .and_then(|segment| Path::new(segment).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase());

    match ext {
        Some(ext) => format!("resource.{}", ext),
        None => "resource".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_from_url() {
        let url = reqwest::Url::parse("https://example.com/music/song.mp3").unwrap();
        assert_eq!(label_from_url(&url), "song.mp3");

        let url = reqwest::Url::parse("https://example.com/music/").unwrap();
        assert_eq!(label_from_url(&url), "music");

        let url = reqwest::Url::parse("https://example.com/").unwrap();
        assert_eq!(label_from_url(&url), "example.com");
    }

    #[test]
    fn test_file_name_keeps_extension() {
        let url = reqwest::Url::parse("http://host/a/b.FLAC?x=1").unwrap();
        assert_eq!(file_name_from_url(&url), "resource.flac");

        let url = reqwest::Url::parse("http://host/watch?v=abc").unwrap();
        assert_eq!(file_name_from_url(&url), "resource");
    }

    #[test]
    fn test_expand_args() {
        let fetcher = CommandFetcher::new(
            "yt-dlp",
            CommandFetcher::default_args(),
            Duration::from_secs(1),
            None,
        );
        let args = fetcher.expand_args(&Locator::from("https://v/1"), Path::new("/tmp/x"));
        assert_eq!(args.last().map(String::as_str), Some("https://v/1"));
        assert!(args.contains(&"/tmp/x/%(title)s.%(ext)s".to_string()));
    }

    #[test]
    fn test_dash_locator_stays_positional() {
        let fetcher = CommandFetcher::new(
            "yt-dlp",
            CommandFetcher::default_args(),
            Duration::from_secs(1),
            None,
        );
        let args = fetcher.expand_args(&Locator::from("--exec=touch /tmp/x"), Path::new("/tmp/x"));
        let n = args.len();
        assert_eq!(args[n - 2], "--");
        assert_eq!(args[n - 1], "--exec=touch /tmp/x");
    }

    #[tokio::test]
    async fn test_single_file_in() {
        let dir = TempDir::new().unwrap();
        assert!(single_file_in(dir.path()).await.is_err());

        std::fs::write(dir.path().join("one.mp3"), b"x").unwrap();
        let found = single_file_in(dir.path()).await.unwrap();
        assert_eq!(found.file_name().unwrap(), "one.mp3");

        std::fs::write(dir.path().join("two.mp3"), b"x").unwrap();
        assert!(single_file_in(dir.path()).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_fetcher_runs_program() {
        let fetcher = CommandFetcher::new(
            "sh",
            vec![
                "-c".to_string(),
                "printf data > \"$0/Track Title.mp3\"".to_string(),
                "{output_dir}".to_string(),
            ],
            Duration::from_secs(10),
            None,
        );

        let fetched = fetcher.fetch(&Locator::from("https://v/1")).await.unwrap();
        assert_eq!(fetched.label, "Track Title");
        assert!(fetched.path.exists());

        let scratch_path = fetched.scratch.as_ref().unwrap().path().to_path_buf();
        drop(fetched);
        assert!(!scratch_path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_fetcher_failure_status() {
        let fetcher = CommandFetcher::new(
            "sh",
            vec!["-c".to_string(), "echo nope >&2; exit 3".to_string()],
            Duration::from_secs(10),
            None,
        );

        let err = fetcher.fetch(&Locator::from("https://v/1")).await.unwrap_err();
        assert!(matches!(err, Error::Fetch(ref msg) if msg.contains("nope")));
    }
}
