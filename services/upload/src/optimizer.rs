use crate::error::{PipelineError, Result};
use crate::media::MediaToolkit;
use crate::staging::StagedArtifact;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Rewrites a staged video for progressive playback without re-encoding
#[derive(Clone)]
pub struct ContainerOptimizer {
    toolkit: Arc<dyn MediaToolkit>,
}

impl ContainerOptimizer {
    pub fn new(toolkit: Arc<dyn MediaToolkit>) -> Self {
        Self { toolkit }
    }

    /// Remux `input` next to itself and return the output as a new artifact.
    ///
    /// The output path is claimed before the tool starts, so a partial file
    /// written by a failing remux is removed as well.
    #[instrument(skip(self, input), fields(path = %input.path().display()))]
    pub async fn optimize(&self, input: &StagedArtifact) -> Result<StagedArtifact> {
        let output = StagedArtifact::claim(optimized_path(input.path()))
            .map_err(|e| PipelineError::storage("Failed to claim remux output path", e))?;

        self.toolkit
            .remux_faststart(input.path(), output.path())
            .await?;

        let size = output
            .size()
            .await
            .map_err(|e| PipelineError::processing("Remux produced no output file", e))?;
        if size == 0 {
            return Err(PipelineError::Processing(
                "Remux produced an empty output file".to_string(),
            ));
        }

        debug!(output = %output.path().display(), size_bytes = size, "Container optimized");
        Ok(output)
    }
}

/// `<input>.processing`
fn optimized_path(input: &Path) -> PathBuf {
    let mut path = OsString::from(input.as_os_str());
    path.push(".processing");
    PathBuf::from(path)
}
