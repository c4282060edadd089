//! Screen recording.
//!
//! One capture process at a time writes straight to a file under the
//! recording directory. Stopping sends `SIGINT` so the encoder can finalise
//! the container format, then falls back to `SIGKILL`.

use crate::config::Dimensions;
use crate::exec::signal_group;
use crate::protocol::{error_codes, RpcFailure};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// How long the encoder gets to finalise after `SIGINT`.
pub const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Returned by `start_recording`.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingInfo {
    pub recording_id: String,
    pub path: String,
    pub started_at: DateTime<Utc>,
}

/// Returned by `stop_recording`.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingArtifact {
    pub recording_id: String,
    pub path: String,
    pub size: u64,
}

struct ActiveRecording {
    info: RecordingInfo,
    child: Child,
}

/// Owns the capture process, if any.
pub struct Recorder {
    dir: PathBuf,
    argv: Vec<String>,
    active: Mutex<Option<ActiveRecording>>,
}

impl Recorder {
    /// `argv` may contain `{output}`, `{size}` and `{display}` placeholders.
    pub fn new(dir: impl Into<PathBuf>, argv: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            argv,
            active: Mutex::new(None),
        }
    }

    /// Whether a capture is running.
    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Start capturing the display.
    ///
    /// # Errors
    /// `RECORDING_ACTIVE` if a capture is already running; `ACTION_FAILED`
    /// if the capture process cannot be started.
    pub async fn start(
        &self,
        size: Dimensions,
        display: &str,
    ) -> Result<RecordingInfo, RpcFailure> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Err(RpcFailure::new(
                error_codes::RECORDING_ACTIVE,
                format!("recording {} already in progress", current.info.recording_id),
            ));
        }

        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| RpcFailure::internal("recording command is empty"))?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            RpcFailure::action_failed(format!(
                "failed to create {}: {e}",
                self.dir.display()
            ))
        })?;

        let recording_id = uuid::Uuid::new_v4().simple().to_string();
        let path = self.dir.join(format!("recording-{recording_id}.mp4"));
        let output = path.to_string_lossy().into_owned();
        let size = size.to_string();
        let args = args.iter().map(|arg| {
            arg.replace("{output}", &output)
                .replace("{size}", &size)
                .replace("{display}", display)
        });

        let child = Command::new(program)
            .args(args)
            .env("DISPLAY", display)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RpcFailure::action_failed(format!("failed to start {program}: {e}")))?;

        let info = RecordingInfo {
            recording_id,
            path: output,
            started_at: Utc::now(),
        };
        info!(recording_id = %info.recording_id, path = %info.path, pid = ?child.id(), "recording started");
        *active = Some(ActiveRecording {
            info: info.clone(),
            child,
        });
        Ok(info)
    }

    /// Stop the capture and return the finished artifact.
    ///
    /// # Errors
    /// `NOT_RECORDING` if nothing (or a different id) is recording;
    /// `ACTION_FAILED` if no artifact was produced.
    pub async fn stop(&self, recording_id: &str) -> Result<RecordingArtifact, RpcFailure> {
        let mut active = self.active.lock().await;
        match active.as_ref() {
            Some(current) if current.info.recording_id == recording_id => {}
            Some(_) => {
                return Err(RpcFailure::new(
                    error_codes::NOT_RECORDING,
                    format!("no recording with id {recording_id}"),
                ))
            }
            None => {
                return Err(RpcFailure::new(
                    error_codes::NOT_RECORDING,
                    "no recording in progress",
                ))
            }
        }
        let Some(recording) = active.take() else {
            return Err(RpcFailure::new(error_codes::NOT_RECORDING, "no recording in progress"));
        };
        drop(active);

        let info = recording.info;
        finalize(recording.child).await;

        let size = match tokio::fs::metadata(&info.path).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            Ok(_) | Err(_) => {
                return Err(RpcFailure::action_failed(format!(
                    "recording {} produced no output",
                    info.recording_id
                )))
            }
        };
        info!(recording_id = %info.recording_id, path = %info.path, size, "recording stopped");
        Ok(RecordingArtifact {
            recording_id: info.recording_id,
            path: info.path,
            size,
        })
    }

    /// Stop any active capture, ignoring failures.
    pub async fn shutdown(&self) {
        let recording_id = match self.active.lock().await.as_ref() {
            Some(current) => current.info.recording_id.clone(),
            None => return,
        };
        if let Err(e) = self.stop(&recording_id).await {
            warn!(recording_id = %recording_id, error = %e, "failed to stop recording on shutdown");
        }
    }
}

async fn finalize(mut child: Child) {
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = signal_group(pid, libc::SIGINT) {
        warn!(pid, error = %e, "SIGINT to recorder failed");
    }
    match tokio::time::timeout(FINALIZE_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => info!(pid, status = %status, "recorder exited"),
        Ok(Err(e)) => warn!(pid, error = %e, "failed to wait for recorder"),
        Err(_) => {
            warn!(pid, "recorder did not finalise in time, killing");
            let _ = signal_group(pid, libc::SIGKILL);
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SIZE: Dimensions = Dimensions {
        width: 640,
        height: 480,
    };

    fn fake_recorder(dir: &TempDir) -> Recorder {
        let argv = ["sh", "-c", "printf frame > \"$1\"; exec sleep 30", "sh", "{output}"];
        Recorder::new(dir.path(), argv.iter().map(|s| s.to_string()).collect())
    }

    async fn wait_for_file(path: &str) {
        for _ in 0..100 {
            if std::fs::metadata(path).is_ok_and(|m| m.len() > 0) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{path} never appeared");
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let dir = TempDir::new().unwrap();
        let recorder = fake_recorder(&dir);

        let info = recorder.start(SIZE, ":99").await.unwrap();
        assert!(recorder.is_active().await);
        wait_for_file(&info.path).await;

        let artifact = recorder.stop(&info.recording_id).await.unwrap();
        assert_eq!(artifact.path, info.path);
        assert_eq!(artifact.size, 5);
        assert!(!recorder.is_active().await);
    }

    #[tokio::test]
    async fn test_second_start_rejected_first_survives() {
        let dir = TempDir::new().unwrap();
        let recorder = fake_recorder(&dir);

        let first = recorder.start(SIZE, ":99").await.unwrap();
        let err = recorder.start(SIZE, ":99").await.unwrap_err();
        assert_eq!(err.code, error_codes::RECORDING_ACTIVE);

        wait_for_file(&first.path).await;
        let artifact = recorder.stop(&first.recording_id).await.unwrap();
        assert_eq!(artifact.recording_id, first.recording_id);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let dir = TempDir::new().unwrap();
        let recorder = fake_recorder(&dir);
        let err = recorder.stop("nope").await.unwrap_err();
        assert_eq!(err.code, error_codes::NOT_RECORDING);
    }

    #[tokio::test]
    async fn test_stop_wrong_id_keeps_recording() {
        let dir = TempDir::new().unwrap();
        let recorder = fake_recorder(&dir);
        let info = recorder.start(SIZE, ":99").await.unwrap();

        let err = recorder.stop("other").await.unwrap_err();
        assert_eq!(err.code, error_codes::NOT_RECORDING);
        assert!(recorder.is_active().await);

        recorder.shutdown().await;
        assert!(!recorder.is_active().await);
        assert!(info.path.ends_with(".mp4"));
    }

    #[tokio::test]
    async fn test_missing_artifact_is_action_failure() {
        let dir = TempDir::new().unwrap();
        let recorder = Recorder::new(dir.path(), vec!["sleep".to_string(), "30".to_string()]);
        let info = recorder.start(SIZE, ":99").await.unwrap();

        let err = recorder.stop(&info.recording_id).await.unwrap_err();
        assert_eq!(err.code, error_codes::ACTION_FAILED);
    }

    #[tokio::test]
    async fn test_placeholders_substituted() {
        let dir = TempDir::new().unwrap();
        let argv = [
            "sh",
            "-c",
            "printf '%s %s' \"$1\" \"$2\" > \"$3\"; exec sleep 30",
            "sh",
            "{size}",
            "{display}",
            "{output}",
        ];
        let recorder = Recorder::new(dir.path(), argv.iter().map(|s| s.to_string()).collect());

        let info = recorder.start(SIZE, ":42").await.unwrap();
        wait_for_file(&info.path).await;
        recorder.stop(&info.recording_id).await.unwrap();
        assert_eq!(std::fs::read_to_string(&info.path).unwrap(), "640x480 :42");
    }
}
