//! File transfer between the caller and the container.
//!
//! Transfers are whole-file: the destination either ends up with the
//! complete content or is left untouched.

use crate::client::{b64, DesktopPath, DirNode, FileEntry, RecordingArtifact};
use crate::error::{Result, SessionError};
use crate::session::Session;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Bytes per push/pull call.
pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// Response budget for a server-side URL download.
const FETCH_TIMEOUT: Duration = Duration::from_secs(330);

#[derive(Deserialize)]
struct PushOutcome {
    written: u64,
    committed: bool,
}

#[derive(Deserialize)]
struct PullChunk {
    #[serde(with = "b64")]
    data: Vec<u8>,
    total_size: u64,
    eof: bool,
}

#[derive(Deserialize)]
struct Fetched {
    size: u64,
}

#[derive(Deserialize)]
struct Listing {
    entries: Vec<FileEntry>,
}

impl Session {
    /// Copy a local file into the container.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns a `Transfer` error if the local file cannot be read or the
    /// destination cannot be written. On failure the remote path is left as
    /// it was.
    pub async fn upload(&self, local: impl AsRef<Path>, remote: &str) -> Result<u64> {
        let local = local.as_ref();
        let transfer_id = uuid::Uuid::new_v4().simple().to_string();
        let start = std::time::Instant::now();
        tracing::debug!(session_id = %self.id(), local = %local.display(), remote = %remote, "Uploading file");

        let mut file = tokio::fs::File::open(local).await.map_err(|e| SessionError::Transfer {
            message: format!("cannot open {}: {e}", local.display()),
            status: None,
        })?;
        let size = file.metadata().await?.len();

        match self.push_all(&mut file, size, remote, &transfer_id).await {
            Ok(written) => {
                tracing::info!(
                    session_id = %self.id(),
                    remote = %remote,
                    bytes = written,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Upload complete"
                );
                Ok(written)
            }
            Err(e) => {
                let params = json!({"path": remote, "transfer_id": transfer_id});
                if let Err(abort) = self
                    .call("abort_push", params, self.config().rpc_timeout)
                    .await
                {
                    tracing::warn!(session_id = %self.id(), error = %abort, "Failed to abort upload");
                }
                Err(e)
            }
        }
    }

    async fn push_all(
        &self,
        file: &mut tokio::fs::File,
        size: u64,
        remote: &str,
        transfer_id: &str,
    ) -> Result<u64> {
        let mut offset = 0u64;
        loop {
            let want = CHUNK_SIZE.min(size - offset);
            let mut chunk = vec![0u8; want as usize];
            file.read_exact(&mut chunk).await?;
            let last = offset + want >= size;

            let params = json!({
                "path": remote,
                "transfer_id": transfer_id,
                "offset": offset,
                "data": base64_encode(&chunk),
                "last": last,
            });
            let value = self
                .call("push_file", params, self.config().rpc_timeout)
                .await?;
            let outcome: PushOutcome = serde_json::from_value(value)?;
            offset += want;
            tracing::trace!(session_id = %self.id(), written = outcome.written, "Chunk pushed");

            if last {
                if !outcome.committed {
                    return Err(SessionError::Transfer {
                        message: format!("{remote}: server did not commit the upload"),
                        status: None,
                    });
                }
                return Ok(outcome.written);
            }
        }
    }

    /// Copy a file out of the container.
    ///
    /// Content is staged in a temporary file next to `local` and moved into
    /// place once complete. Returns the number of bytes written.
    pub async fn download(&self, remote: &str, local: impl AsRef<Path>) -> Result<u64> {
        let local = local.as_ref();
        let start = std::time::Instant::now();
        tracing::debug!(session_id = %self.id(), remote = %remote, local = %local.display(), "Downloading file");

        let dir = match local.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await?;
        let (staging, staging_path) = tempfile::NamedTempFile::new_in(&dir)?.into_parts();
        let mut staging = tokio::fs::File::from_std(staging);

        let mut offset = 0u64;
        loop {
            let params = json!({"path": remote, "offset": offset, "length": CHUNK_SIZE});
            let value = self
                .call("pull_file", params, self.config().rpc_timeout)
                .await?;
            let chunk: PullChunk = serde_json::from_value(value)?;
            staging.write_all(&chunk.data).await?;
            offset += chunk.data.len() as u64;

            if chunk.eof {
                break;
            }
            if chunk.data.is_empty() {
                return Err(SessionError::Transfer {
                    message: format!(
                        "{remote}: no data at offset {offset} of {}",
                        chunk.total_size
                    ),
                    status: None,
                });
            }
        }
        staging.sync_all().await?;
        drop(staging);

        staging_path.persist(local).map_err(|e| SessionError::Transfer {
            message: format!("cannot write {}: {}", local.display(), e.error),
            status: None,
        })?;
        tracing::info!(
            session_id = %self.id(),
            remote = %remote,
            bytes = offset,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Download complete"
        );
        Ok(offset)
    }

    /// Download a URL into the container using the container's network.
    ///
    /// Returns the size of the downloaded file.
    ///
    /// # Errors
    ///
    /// Returns a `Transfer` error carrying the HTTP status for non-success
    /// responses.
    pub async fn fetch_url(&self, url: &str, remote: &str) -> Result<u64> {
        tracing::debug!(session_id = %self.id(), url = %url, remote = %remote, "Fetching URL in container");
        let value = self
            .call("fetch_url", json!({"url": url, "path": remote}), FETCH_TIMEOUT)
            .await?;
        let fetched: Fetched = serde_json::from_value(value)?;
        tracing::info!(session_id = %self.id(), url = %url, bytes = fetched.size, "URL fetched");
        Ok(fetched.size)
    }

    /// List a directory inside the container.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>> {
        let value = self
            .call("list_dir", json!({"path": path}), self.config().rpc_timeout)
            .await?;
        let listing: Listing = serde_json::from_value(value)?;
        Ok(listing.entries)
    }

    /// Recursive listing of a directory inside the container, descending at
    /// most `max_depth` levels below `path`.
    pub async fn directory_tree(&self, path: &str, max_depth: u32) -> Result<DirNode> {
        let value = self
            .call(
                "directory_tree",
                json!({"path": path, "max_depth": max_depth}),
                self.config().rpc_timeout,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Locate the session user's desktop directory.
    ///
    /// # Errors
    ///
    /// Returns a `Transfer` error if the container has no desktop directory.
    pub async fn desktop_path(&self) -> Result<DesktopPath> {
        let value = self
            .call("desktop_path", json!({}), self.config().rpc_timeout)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Stop the active recording and download it to `local`.
    ///
    /// # Errors
    ///
    /// Fails if no recording was started through this session.
    pub async fn end_recording(&self, local: impl AsRef<Path>) -> Result<RecordingArtifact> {
        let recording_id = self
            .recording_guard()
            .clone()
            .ok_or_else(|| SessionError::Recording("no recording in progress".into()))?;

        let value = self
            .call(
                "stop_recording",
                json!({"recording_id": recording_id}),
                self.config().rpc_timeout,
            )
            .await?;
        self.recording_guard().take();
        let artifact: RecordingArtifact = serde_json::from_value(value)?;
        tracing::info!(
            session_id = %self.id(),
            recording_id = %artifact.recording_id,
            size = artifact.size,
            "Recording stopped"
        );

        self.download(&artifact.path, local).await?;
        Ok(artifact)
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
