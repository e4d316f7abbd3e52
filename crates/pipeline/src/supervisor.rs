//! Worker process supervision.
//!
//! [`WorkerSupervisor::execute`] launches the external translation worker
//! with the input path as its only positional argument, streams parsed
//! progress lines into a channel, enforces cancellation and the optional
//! timeout, and finally locates the produced artifact by naming convention.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use manga_core::file_kind::FileKind;
use manga_core::paths::{identity_mapper, PathMapper};
use manga_core::progress::{parse_line, ProgressLine};
use manga_core::types::RequestId;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SupervisorError;

/// Number of trailing stderr lines kept for failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// How to launch the worker.
#[derive(Clone)]
pub struct SupervisorConfig {
    /// Interpreter or executable, e.g. `python`.
    pub program: String,
    /// Script passed before the input path, if the program needs one.
    pub script: Option<PathBuf>,
    /// Child working directory; single-image output is written here.
    pub working_dir: PathBuf,
    /// Parent directory of per-job scratch directories.
    pub scratch_root: PathBuf,
    /// Kill the worker after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Maps intake paths onto the paths the worker sees.
    pub path_mapper: PathMapper,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        let working_dir = working_dir.into();
        Self {
            program: program.into(),
            script: None,
            scratch_root: working_dir.join("temp"),
            working_dir,
            timeout: None,
            path_mapper: identity_mapper(),
        }
    }
}

/// Per-job execution context handed down from the queue.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub request_id: RequestId,
    pub file_kind: FileKind,
    /// Cancelling kills the worker.
    pub cancel: CancellationToken,
}

/// One produced page, as reported by the worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOutput {
    pub page_number: u32,
    pub original_path: PathBuf,
    pub translated_path: PathBuf,
}

/// What a successful worker run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutput {
    /// The translated archive, or the translated image.
    pub artifact: PathBuf,
    /// Declared pages; empty for archive jobs, which the cataloger unpacks.
    pub pages: Vec<PageOutput>,
}

/// Launches and watches one worker process per call.
#[derive(Clone)]
pub struct WorkerSupervisor {
    config: SupervisorConfig,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run the worker on `input_path` and return its output.
    ///
    /// Every line of stdout that parses as progress is sent on `progress`.
    /// Once this returns, nothing more is sent: on cancellation the drain
    /// tasks are stopped before returning.
    pub async fn execute(
        &self,
        ctx: &JobContext,
        input_path: &str,
        progress: mpsc::UnboundedSender<ProgressLine>,
    ) -> Result<WorkerOutput, SupervisorError> {
        let request_id = ctx.request_id;
        let resolved = (self.config.path_mapper)(input_path);
        let input = std::path::absolute(&resolved).unwrap_or(resolved);

        let script = match &self.config.script {
            Some(script) => {
                if !is_file(script).await {
                    return Err(SupervisorError::WorkerNotFound(script.display().to_string()));
                }
                Some(std::path::absolute(script).unwrap_or_else(|_| script.clone()))
            }
            None => None,
        };

        let scratch = ScratchDir::create(&self.config.scratch_root)
            .await
            .map_err(|e| {
                SupervisorError::StartFailure(format!("Failed to create scratch directory: {e}"))
            })?;

        tracing::info!(
            request_id = %request_id,
            input = %input.display(),
            scratch = %scratch.path().display(),
            "Starting worker",
        );

        let mut cmd = Command::new(&self.config.program);
        if let Some(script) = &script {
            cmd.arg(script);
        }
        cmd.arg(&input)
            .current_dir(&self.config.working_dir)
            .env("TEMP_DIR", scratch.path())
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                SupervisorError::WorkerNotFound(self.config.program.clone())
            }
            _ => SupervisorError::StartFailure(e.to_string()),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(drain_stdout(stdout, request_id, progress));
        let stderr_task = tokio::spawn(drain_stderr(stderr, request_id));

        let timeout = self.config.timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        // `Err` carries the reason the worker has to be killed.
        let exit = tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => Err("job cancelled".to_string()),
            _ = deadline => Err(format!(
                "timed out after {}s",
                timeout.map_or(0, |t| t.as_secs())
            )),
            status = child.wait() => Ok(status),
        };

        let status = match exit {
            Ok(status) => status.map_err(|e| SupervisorError::StartFailure(e.to_string()))?,
            Err(reason) => {
                tracing::warn!(request_id = %request_id, reason = %reason, "Killing worker");
                if let Err(e) = child.kill().await {
                    tracing::warn!(request_id = %request_id, error = %e, "Failed to kill worker");
                }
                stdout_task.abort();
                stderr_task.abort();
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(SupervisorError::Cancelled(reason));
            }
        };

        let stderr_tail = stderr_task.await.unwrap_or_default();
        if let Err(e) = stdout_task.await {
            tracing::warn!(request_id = %request_id, error = %e, "Worker stdout drain failed");
        }
        if !status.success() {
            tracing::warn!(
                request_id = %request_id,
                exit_code = ?status.code(),
                "Worker exited unsuccessfully",
            );
            return Err(SupervisorError::RuntimeFailure {
                exit_code: status.code(),
                stderr: stderr_tail.join("\n"),
            });
        }

        let output = locate_output(&input, ctx.file_kind, &self.config.working_dir).await?;
        tracing::info!(
            request_id = %request_id,
            artifact = %output.artifact.display(),
            "Worker finished",
        );
        Ok(output)
    }
}

/// Find the artifact a successful run must have produced.
///
/// Archive jobs write `{stem}_translated.{ext}` next to the input. Image
/// jobs write `translated_{stem}.{ext}` into the worker directory, where
/// the worker may re-encode to `.jpg`.
async fn locate_output(
    input: &Path,
    kind: FileKind,
    working_dir: &Path,
) -> Result<WorkerOutput, SupervisorError> {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = input
        .extension()
        .map(|s| s.to_string_lossy().into_owned());

    match kind {
        FileKind::Archive => {
            let expected = input.with_file_name(format!(
                "{stem}_translated.{}",
                ext.as_deref().unwrap_or("zip")
            ));
            if is_file(&expected).await {
                Ok(WorkerOutput {
                    artifact: expected,
                    pages: Vec::new(),
                })
            } else {
                Err(SupervisorError::OutputMissing(expected))
            }
        }
        FileKind::Image => {
            let mut candidates = Vec::with_capacity(2);
            if let Some(ext) = ext.as_deref() {
                candidates.push(working_dir.join(format!("translated_{stem}.{ext}")));
            }
            candidates.push(working_dir.join(format!("translated_{stem}.jpg")));

            for candidate in &candidates {
                if is_file(candidate).await {
                    return Ok(WorkerOutput {
                        artifact: candidate.clone(),
                        pages: vec![PageOutput {
                            page_number: 1,
                            original_path: input.to_path_buf(),
                            translated_path: candidate.clone(),
                        }],
                    });
                }
            }
            Err(SupervisorError::OutputMissing(candidates.swap_remove(0)))
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

/// Read `reader` line by line, tolerating invalid UTF-8.
async fn for_each_line<R, F>(reader: R, mut f: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                f(line.trim_end_matches(['\n', '\r']).to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, "Worker output read failed");
                break;
            }
        }
    }
}

async fn drain_stdout<R: AsyncRead + Unpin>(
    stdout: Option<R>,
    request_id: RequestId,
    progress: mpsc::UnboundedSender<ProgressLine>,
) {
    let Some(stdout) = stdout else { return };
    for_each_line(stdout, |line| {
        tracing::debug!(request_id = %request_id, line = %line, "Worker stdout");
        if let Some(parsed) = parse_line(&line) {
            // A closed receiver only means nobody is listening anymore;
            // keep draining so the worker never blocks on a full pipe.
            let _ = progress.send(parsed);
        }
    })
    .await;
}

async fn drain_stderr<R: AsyncRead + Unpin>(stderr: Option<R>, request_id: RequestId) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    if let Some(stderr) = stderr {
        for_each_line(stderr, |line| {
            tracing::warn!(request_id = %request_id, line = %line, "Worker stderr");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        })
        .await;
    }
    tail.into()
}

/// Job-scoped scratch directory, removed when dropped.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    async fn create(root: &Path) -> std::io::Result<Self> {
        let path = root.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
