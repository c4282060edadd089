//! File transfer operations for deskbox-server.
//!
//! Pushes are staged next to the destination and renamed into place on the
//! last chunk, so the destination path only ever holds a complete file.

use crate::protocol::{DirNode, FileEntry, RpcFailure, TransferFailure};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Largest chunk a single `pull_file` returns (1 MB).
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024;

/// Attempts for `fetch_url` when the network fails before a response.
const FETCH_ATTEMPTS: u32 = 3;

/// Result of a `push_file` chunk.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PushOutcome {
    /// Bytes staged so far, including this chunk.
    pub written: u64,
    /// True once the file has been moved to its destination.
    pub committed: bool,
}

/// Result of a `pull_file` range read.
#[derive(Debug, Serialize)]
pub struct PullChunk {
    #[serde(with = "crate::protocol::b64")]
    pub data: Vec<u8>,
    pub total_size: u64,
    pub eof: bool,
}

/// Result of `desktop_path`.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DesktopPath {
    pub path: String,
    pub writable: bool,
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Staging path for an in-progress transfer: `<dir>/.<name>.<id>.part`.
///
/// # Errors
/// Returns `INVALID_PARAMS` for paths without a file name or ids that could
/// escape the destination directory.
pub fn staging_path(dest: &Path, transfer_id: &str) -> Result<PathBuf, RpcFailure> {
    if transfer_id.is_empty()
        || !transfer_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RpcFailure::invalid_params(format!(
            "invalid transfer id: {transfer_id:?}"
        )));
    }
    let name = dest
        .file_name()
        .ok_or_else(|| RpcFailure::invalid_params(format!("not a file path: {}", dest.display())))?;
    let mut staged = std::ffi::OsString::from(".");
    staged.push(name);
    staged.push(format!(".{transfer_id}.part"));
    Ok(dest.with_file_name(staged))
}

fn io_failure(context: &str, path: &Path, e: std::io::Error) -> RpcFailure {
    let reason = if e.kind() == ErrorKind::NotFound {
        TransferFailure::NotFound
    } else {
        TransferFailure::Io
    };
    RpcFailure::transfer(reason, format!("{context} '{}': {e}", path.display()))
}

/// Append one chunk to a staged upload, committing it when `last` is set.
///
/// Offset 0 starts (or restarts) the transfer. Any other offset must equal
/// the bytes staged so far.
///
/// # Errors
/// Returns `TRANSFER_ERROR` on I/O failure or a non-contiguous offset.
pub async fn push_chunk(
    path: &str,
    transfer_id: &str,
    offset: u64,
    data: &[u8],
    last: bool,
) -> Result<PushOutcome, RpcFailure> {
    let dest = expand_path(path);
    let staging = staging_path(&dest, transfer_id)?;

    let mut file = if offset == 0 {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure("failed to create directories for", &dest, e))?;
        }
        fs::File::create(&staging)
            .await
            .map_err(|e| io_failure("failed to create", &staging, e))?
    } else {
        let file = fs::OpenOptions::new()
            .append(true)
            .open(&staging)
            .await
            .map_err(|e| io_failure("no transfer in progress for", &dest, e))?;
        let staged = file
            .metadata()
            .await
            .map_err(|e| io_failure("failed to stat", &staging, e))?
            .len();
        if staged != offset {
            return Err(RpcFailure::transfer(
                TransferFailure::Io,
                format!("offset mismatch for '{}': expected {staged}, got {offset}", dest.display()),
            ));
        }
        file
    };

    file.write_all(data)
        .await
        .map_err(|e| io_failure("failed to write", &staging, e))?;
    file.flush()
        .await
        .map_err(|e| io_failure("failed to write", &staging, e))?;
    let written = offset + data.len() as u64;

    if last {
        file.sync_all()
            .await
            .map_err(|e| io_failure("failed to sync", &staging, e))?;
        drop(file);
        if let Err(e) = fs::rename(&staging, &dest).await {
            let _ = fs::remove_file(&staging).await;
            return Err(io_failure("failed to commit", &dest, e));
        }
        info!(path = %dest.display(), size = written, "upload committed");
    } else {
        debug!(path = %dest.display(), written, "chunk staged");
    }

    Ok(PushOutcome {
        written,
        committed: last,
    })
}

/// Discard a staged upload. Missing staging files are not an error.
///
/// # Errors
/// Returns `TRANSFER_ERROR` if the staging file exists but cannot be removed.
pub async fn abort_push(path: &str, transfer_id: &str) -> Result<(), RpcFailure> {
    let staging = staging_path(&expand_path(path), transfer_id)?;
    match fs::remove_file(&staging).await {
        Ok(()) => {
            debug!(path = %staging.display(), "staged upload discarded");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_failure("failed to remove", &staging, e)),
    }
}

/// Read up to `length` bytes of a file starting at `offset`.
///
/// # Errors
/// Returns `TRANSFER_ERROR` (`not_found` for missing files).
pub async fn pull_chunk(path: &str, offset: u64, length: u64) -> Result<PullChunk, RpcFailure> {
    let path = expand_path(path);
    let mut file = fs::File::open(&path)
        .await
        .map_err(|e| io_failure("failed to open", &path, e))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|e| io_failure("failed to stat", &path, e))?;
    if metadata.is_dir() {
        return Err(RpcFailure::transfer(
            TransferFailure::Io,
            format!("'{}' is a directory", path.display()),
        ));
    }
    let total_size = metadata.len();

    let start = offset.min(total_size);
    let want = length.min(MAX_CHUNK_SIZE).min(total_size - start);
    file.seek(std::io::SeekFrom::Start(start))
        .await
        .map_err(|e| io_failure("failed to seek", &path, e))?;
    let mut data = Vec::with_capacity(want as usize);
    (&mut file)
        .take(want)
        .read_to_end(&mut data)
        .await
        .map_err(|e| io_failure("failed to read", &path, e))?;

    let eof = start + data.len() as u64 >= total_size;
    Ok(PullChunk {
        data,
        total_size,
        eof,
    })
}

/// Download `url` into `path` inside the container.
///
/// The body streams into a staging file that is renamed on success and
/// removed on failure. Connection failures are retried; HTTP error statuses
/// are not.
///
/// # Errors
/// Returns `TRANSFER_ERROR` with reason `network`, `http_status` or `io`.
pub async fn fetch_url(
    client: &reqwest::Client,
    url: &str,
    path: &str,
) -> Result<u64, RpcFailure> {
    let dest = expand_path(path);
    let staging = staging_path(&dest, &uuid::Uuid::new_v4().simple().to_string())?;

    let mut attempt = 1;
    let result = loop {
        match download(client, url, &dest, &staging).await {
            Err(failure) if is_network(&failure) && attempt < FETCH_ATTEMPTS => {
                warn!(url, attempt, error = %failure, "download failed, retrying");
                let _ = fs::remove_file(&staging).await;
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                attempt += 1;
            }
            other => break other,
        }
    };

    match result {
        Ok(size) => {
            if let Err(e) = fs::rename(&staging, &dest).await {
                let _ = fs::remove_file(&staging).await;
                return Err(io_failure("failed to commit", &dest, e));
            }
            info!(url, path = %dest.display(), size, "download complete");
            Ok(size)
        }
        Err(failure) => {
            let _ = fs::remove_file(&staging).await;
            Err(failure)
        }
    }
}

fn is_network(failure: &RpcFailure) -> bool {
    failure
        .data
        .as_ref()
        .and_then(|d| d.get("reason"))
        .and_then(|r| r.as_str())
        == Some("network")
}

async fn download(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    staging: &Path,
) -> Result<u64, RpcFailure> {
    let network = |e: reqwest::Error| {
        RpcFailure::transfer(TransferFailure::Network, format!("failed to fetch {url}: {e}"))
    };

    let mut response = client.get(url).send().await.map_err(network)?;
    let status = response.status();
    if !status.is_success() {
        return Err(RpcFailure::transfer(
            TransferFailure::HttpStatus,
            format!("GET {url} returned {status}"),
        )
        .with_data(serde_json::json!({
            "reason": TransferFailure::HttpStatus,
            "status": status.as_u16(),
        })));
    }

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_failure("failed to create directories for", dest, e))?;
    }
    let mut file = fs::File::create(staging)
        .await
        .map_err(|e| io_failure("failed to create", staging, e))?;

    let mut size = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(network)? {
        file.write_all(&chunk)
            .await
            .map_err(|e| io_failure("failed to write", staging, e))?;
        size += chunk.len() as u64;
    }
    file.sync_all()
        .await
        .map_err(|e| io_failure("failed to sync", staging, e))?;
    Ok(size)
}

/// List contents of a directory, sorted by name.
///
/// # Errors
/// Returns `TRANSFER_ERROR` if the directory cannot be read.
pub async fn list_dir(path: &str) -> Result<Vec<FileEntry>, RpcFailure> {
    let path = expand_path(path);
    let mut entries = fs::read_dir(&path)
        .await
        .map_err(|e| io_failure("failed to read directory", &path, e))?;

    let mut result = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_failure("failed to read entry in", &path, e))?
    {
        let metadata = entry
            .metadata()
            .await
            .map_err(|e| io_failure("failed to get metadata in", &path, e))?;

        result.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: if metadata.is_file() { metadata.len() } else { 0 },
        });
    }

    result.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(result)
}

/// The desktop directory of the session user, `$HOME/Desktop`.
///
/// # Errors
/// Returns `TRANSFER_ERROR` with reason `not_found` if it does not exist.
pub fn desktop_path() -> Result<DesktopPath, RpcFailure> {
    let home = std::env::var_os("HOME")
        .ok_or_else(|| RpcFailure::transfer(TransferFailure::NotFound, "HOME is not set"))?;
    desktop_path_in(Path::new(&home))
}

fn desktop_path_in(home: &Path) -> Result<DesktopPath, RpcFailure> {
    let desktop = home.join("Desktop");
    if !desktop.is_dir() {
        return Err(RpcFailure::transfer(
            TransferFailure::NotFound,
            format!("no desktop directory at '{}'", desktop.display()),
        ));
    }
    Ok(DesktopPath {
        writable: is_writable(&desktop),
        path: desktop.to_string_lossy().into_owned(),
    })
}

fn is_writable(path: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

/// Walk a directory into a tree, descending at most `max_depth` levels.
///
/// Subdirectories that cannot be read are reported in their `error` field
/// instead of failing the whole walk.
///
/// # Errors
/// Returns `TRANSFER_ERROR` if `path` itself cannot be read.
pub async fn directory_tree(path: &str, max_depth: u32) -> Result<DirNode, RpcFailure> {
    let root = expand_path(path);
    tokio::task::spawn_blocking(move || {
        let metadata = std::fs::metadata(&root)
            .map_err(|e| io_failure("failed to stat", &root, e))?;
        if !metadata.is_dir() {
            return Err(RpcFailure::transfer(
                TransferFailure::Io,
                format!("not a directory: '{}'", root.display()),
            ));
        }
        let children = read_tree(&root, max_depth)
            .map_err(|e| io_failure("failed to read directory", &root, e))?;
        Ok(DirNode {
            name: root.to_string_lossy().into_owned(),
            is_dir: true,
            size: 0,
            children: Some(children),
            error: None,
        })
    })
    .await
    .map_err(|e| RpcFailure::internal(format!("directory walk failed: {e}")))?
}

fn read_tree(dir: &Path, depth: u32) -> std::io::Result<Vec<DirNode>> {
    let mut nodes = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // Symlinks are listed but never followed.
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let (children, error) = if depth == 0 {
                (None, None)
            } else {
                match read_tree(&entry.path(), depth - 1) {
                    Ok(children) => (Some(children), None),
                    Err(e) => (None, Some(e.to_string())),
                }
            };
            nodes.push(DirNode {
                name,
                is_dir: true,
                size: 0,
                children,
                error,
            });
        } else {
            let size = if file_type.is_file() {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            } else {
                0
            };
            nodes.push(DirNode {
                name,
                is_dir: false,
                size,
                children: None,
                error: None,
            });
        }
    }
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(nodes)
}
