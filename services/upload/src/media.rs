//! External media tool capability.
//!
//! The pipeline only needs two things from the outside world: a stream
//! report for a file, and a faststart remux of a file. [`FfmpegToolkit`]
//! shells out to `ffprobe`/`ffmpeg`; [`ScriptedToolkit`] stands in for it
//! in tests.

use crate::config::ToolsConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

/// Stream section of an `ffprobe -show_streams` JSON report
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeReport {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeStream {
    #[serde(default)]
    pub display_aspect_ratio: Option<String>,
}

impl ProbeReport {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| PipelineError::processing("Failed to parse ffprobe output", e))
    }

    /// Display aspect ratio of the first reported stream; empty when absent
    pub fn first_display_aspect_ratio(&self) -> &str {
        self.streams
            .first()
            .and_then(|s| s.display_aspect_ratio.as_deref())
            .unwrap_or("")
    }
}

/// Inspection and remux operations the pipeline needs
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Report the streams of `input`
    async fn probe(&self, input: &Path) -> Result<ProbeReport>;

    /// Copy all streams of `input` into `output` with the index moved to the front
    async fn remux_faststart(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Runs the real `ffprobe` and `ffmpeg` binaries.
///
/// Children are killed when the awaiting future is dropped, and a semaphore
/// bounds how many run at once.
pub struct FfmpegToolkit {
    ffprobe_path: String,
    ffmpeg_path: String,
    permits: Arc<Semaphore>,
}

impl FfmpegToolkit {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            ffprobe_path: config.ffprobe_path.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_processes.max(1))),
        }
    }

    async fn run(&self, tool: &'static str, program: &str, args: Vec<OsString>) -> Result<Output> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| PipelineError::processing("Process limiter closed", e))?;

        let start = Instant::now();
        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::processing(&format!("Failed to execute {tool}"), e))?;

        metrics::histogram!("upload.tool.duration_seconds", "tool" => tool)
            .record(start.elapsed().as_secs_f64());

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Processing(format!(
                "{tool} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    #[instrument(skip(self), fields(tool = "ffprobe"))]
    async fn probe(&self, input: &Path) -> Result<ProbeReport> {
        let args = vec![
            "-v".into(),
            "error".into(),
            "-print_format".into(),
            "json".into(),
            "-show_streams".into(),
            input.as_os_str().to_owned(),
        ];

        let output = self.run("ffprobe", &self.ffprobe_path, args).await?;
        let report = ProbeReport::parse(&output.stdout)?;

        debug!(streams = report.streams.len(), "Probe completed");
        Ok(report)
    }

    #[instrument(skip(self), fields(tool = "ffmpeg"))]
    async fn remux_faststart(&self, input: &Path, output: &Path) -> Result<()> {
        let args = vec![
            "-v".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            input.as_os_str().to_owned(),
            "-c".into(),
            "copy".into(),
            "-movflags".into(),
            "faststart".into(),
            "-f".into(),
            "mp4".into(),
            output.as_os_str().to_owned(),
        ];

        self.run("ffmpeg", &self.ffmpeg_path, args).await?;
        Ok(())
    }
}

/// Deterministic toolkit used by the pipeline test suites.
///
/// Probing reports a single stream with the configured aspect ratio (or no
/// streams at all); remuxing copies the input byte for byte.
#[derive(Debug, Default)]
pub struct ScriptedToolkit {
    aspect_ratio: Option<String>,
    probe_failure: Option<String>,
    remux_failure: Option<String>,
    skip_remux_output: bool,
    probes: AtomicUsize,
    remuxes: AtomicUsize,
}

impl ScriptedToolkit {
    pub fn with_aspect_ratio(ratio: &str) -> Self {
        Self {
            aspect_ratio: Some(ratio.to_string()),
            ..Default::default()
        }
    }

    /// Probe reports zero streams
    pub fn without_streams() -> Self {
        Self::default()
    }

    pub fn failing_probe(mut self, message: &str) -> Self {
        self.probe_failure = Some(message.to_string());
        self
    }

    pub fn failing_remux(mut self, message: &str) -> Self {
        self.remux_failure = Some(message.to_string());
        self
    }

    /// Remux "succeeds" without writing an output file
    pub fn skipping_remux_output(mut self) -> Self {
        self.skip_remux_output = true;
        self
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn remuxes(&self) -> usize {
        self.remuxes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaToolkit for ScriptedToolkit {
    async fn probe(&self, _input: &Path) -> Result<ProbeReport> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(ref message) = self.probe_failure {
            return Err(PipelineError::Processing(message.clone()));
        }

        let streams = self
            .aspect_ratio
            .iter()
            .map(|ratio| ProbeStream {
                display_aspect_ratio: Some(ratio.clone()),
            })
            .collect();

        Ok(ProbeReport { streams })
    }

    async fn remux_faststart(&self, input: &Path, output: &Path) -> Result<()> {
        self.remuxes.fetch_add(1, Ordering::SeqCst);
        if let Some(ref message) = self.remux_failure {
            return Err(PipelineError::Processing(message.clone()));
        }
        if self.skip_remux_output {
            return Ok(());
        }

        tokio::fs::copy(input, output)
            .await
            .map_err(|e| PipelineError::processing("Failed to copy remux output", e))?;
        Ok(())
    }
}
