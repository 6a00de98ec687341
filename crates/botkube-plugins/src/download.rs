//! Index and binary downloads into the local cache.
//!
//! Binaries are streamed into a `.downloading` sibling of the destination,
//! hashed on the fly, verified and only then renamed into place, so the
//! launcher never sees a partial or corrupt binary at the final path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{PluginError, PluginResult};

/// Default upper bound for a single download (256 MiB).
pub const MAX_DOWNLOAD_SIZE: u64 = 256 * 1024 * 1024;

/// Suffix of the in-progress download next to the destination.
pub const TEMP_SUFFIX: &str = ".downloading";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const USER_AGENT: &str = concat!("botkube-agent/", env!("CARGO_PKG_VERSION"));
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Fetches repository indexes and plugin binaries over HTTP(S) or `file://`.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    max_size: u64,
}

/// The path a download is staged at before promotion.
#[must_use]
pub fn temp_path(dest: &Path) -> PathBuf {
    let mut staged = dest.as_os_str().to_owned();
    staged.push(TEMP_SUFFIX);
    PathBuf::from(staged)
}

impl Downloader {
    /// Create a downloader with the default size limit.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] if the HTTP client cannot be built.
    pub fn new() -> PluginResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PluginError::Transport {
                url: String::new(),
                message: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            max_size: MAX_DOWNLOAD_SIZE,
        })
    }

    /// Override the maximum download size.
    #[must_use]
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Fetch a repository index into memory.
    ///
    /// # Errors
    ///
    /// Returns a retryable error on network failure or a non-success status,
    /// or [`PluginError::TooLarge`] past the size limit.
    pub async fn fetch_index(&self, url: &str) -> PluginResult<Vec<u8>> {
        debug!(url = %url, "fetching repository index");
        let mut body = self.open(url).await?;
        let mut bytes = Vec::new();

        while let Some(chunk) = body.next_chunk(url).await? {
            bytes.extend_from_slice(&chunk);
            if u64::try_from(bytes.len()).unwrap_or(u64::MAX) > self.max_size {
                return Err(PluginError::TooLarge {
                    url: url.to_owned(),
                    limit: self.max_size,
                });
            }
        }

        Ok(bytes)
    }

    /// Download a binary to `dest`, verifying `checksum` when given.
    ///
    /// The binary is made executable and appears at `dest` only once the
    /// transfer and verification succeeded. A stale staging file or
    /// directory from an interrupted run is removed first.
    ///
    /// # Errors
    ///
    /// Returns a retryable error on network failure or a non-success status,
    /// [`PluginError::ChecksumMismatch`] if verification fails, or an I/O
    /// error. No file is left at `dest` or its staging path on failure.
    pub async fn fetch_binary(
        &self,
        url: &str,
        dest: &Path,
        checksum: Option<&str>,
    ) -> PluginResult<()> {
        let expected = checksum.map(parse_checksum).transpose()?;
        let staged = temp_path(dest);

        remove_stale(&staged).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PluginError::fs(parent, e))?;
        }

        let digest = match self.stream_to_file(url, &staged).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(e);
            },
        };

        if let Some(expected) = expected
            && !bool::from(digest.as_slice().ct_eq(expected.as_slice()))
        {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(PluginError::ChecksumMismatch {
                url: url.to_owned(),
                expected: hex::encode(expected),
                actual: hex::encode(digest),
            });
        }

        if let Err(e) = promote(&staged, dest).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }

        info!(url = %url, path = %dest.display(), "downloaded plugin binary");
        Ok(())
    }

    /// Stream `url` into `path`, returning the SHA-256 of the content.
    async fn stream_to_file(&self, url: &str, path: &Path) -> PluginResult<Vec<u8>> {
        let mut body = self.open(url).await?;
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| PluginError::fs(path, e))?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(chunk) = body.next_chunk(url).await? {
            written = written.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
            if written > self.max_size {
                return Err(PluginError::TooLarge {
                    url: url.to_owned(),
                    limit: self.max_size,
                });
            }
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| PluginError::fs(path, e))?;
        }

        file.flush().await.map_err(|e| PluginError::fs(path, e))?;
        file.sync_all().await.map_err(|e| PluginError::fs(path, e))?;
        Ok(hasher.finalize().to_vec())
    }

    async fn open(&self, url: &str) -> PluginResult<Body> {
        if let Some(path) = file_url_path(url) {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| PluginError::Transport {
                    url: url.to_owned(),
                    message: e.to_string(),
                })?;
            return Ok(Body::File(file));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PluginError::Transport {
                url: url.to_owned(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PluginError::HttpStatus {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }

        if let Some(len) = response.content_length()
            && len > self.max_size
        {
            return Err(PluginError::TooLarge {
                url: url.to_owned(),
                limit: self.max_size,
            });
        }

        Ok(Body::Http(response))
    }
}

/// A response body being read chunk by chunk.
enum Body {
    Http(reqwest::Response),
    File(tokio::fs::File),
}

impl Body {
    async fn next_chunk(&mut self, url: &str) -> PluginResult<Option<Vec<u8>>> {
        match self {
            Self::Http(response) => response
                .chunk()
                .await
                .map(|chunk| chunk.map(|c| c.to_vec()))
                .map_err(|e| PluginError::Transport {
                    url: url.to_owned(),
                    message: e.to_string(),
                }),
            Self::File(file) => {
                let mut buf = vec![0u8; FILE_CHUNK_SIZE];
                let n = file.read(&mut buf).await.map_err(|e| PluginError::Transport {
                    url: url.to_owned(),
                    message: e.to_string(),
                })?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf))
            },
        }
    }
}

/// Local path of a `file://` URL.
fn file_url_path(raw: &str) -> Option<PathBuf> {
    let parsed = url::Url::parse(raw).ok()?;
    if parsed.scheme() != "file" {
        return None;
    }
    parsed.to_file_path().ok()
}

/// Parse `sha256:<hex>` or bare hex into digest bytes.
fn parse_checksum(raw: &str) -> PluginResult<Vec<u8>> {
    let trimmed = raw.trim();
    let hex_part = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed);

    match hex::decode(hex_part) {
        Ok(bytes) if bytes.len() == 32 => Ok(bytes),
        _ => Err(PluginError::InvalidChecksum(raw.to_owned())),
    }
}

/// Remove a leftover staging file or directory.
async fn remove_stale(staged: &Path) -> PluginResult<()> {
    let metadata = match tokio::fs::symlink_metadata(staged).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PluginError::fs(staged, e)),
    };

    debug!(path = %staged.display(), "removing stale download");
    let removed = if metadata.is_dir() {
        tokio::fs::remove_dir_all(staged).await
    } else {
        tokio::fs::remove_file(staged).await
    };
    removed.map_err(|e| PluginError::fs(staged, e))
}

/// Make the staged file executable and move it to its final path.
async fn promote(staged: &Path, dest: &Path) -> PluginResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(staged, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| PluginError::fs(staged, e))?;
    }

    tokio::fs::rename(staged, dest)
        .await
        .map_err(|e| PluginError::fs(dest, e))
}
