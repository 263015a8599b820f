use crate::error::{PipelineError, Result};
use crate::media::MediaToolkit;
use crate::staging::StagedArtifact;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Coarse orientation bucket, used as the storage key prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AspectClassification {
    Landscape,
    Portrait,
    Other,
}

impl AspectClassification {
    /// Map a `W:H` display aspect ratio; `None` for an empty ratio
    pub fn from_display_aspect_ratio(ratio: &str) -> Option<Self> {
        match ratio {
            "" => None,
            "16:9" => Some(AspectClassification::Landscape),
            "9:16" => Some(AspectClassification::Portrait),
            _ => Some(AspectClassification::Other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AspectClassification::Landscape => "landscape",
            AspectClassification::Portrait => "portrait",
            AspectClassification::Other => "other",
        }
    }
}

impl fmt::Display for AspectClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies staged videos by the display aspect ratio of their first stream
#[derive(Clone)]
pub struct AspectRatioClassifier {
    toolkit: Arc<dyn MediaToolkit>,
}

impl AspectRatioClassifier {
    pub fn new(toolkit: Arc<dyn MediaToolkit>) -> Self {
        Self { toolkit }
    }

    #[instrument(skip(self, artifact), fields(path = %artifact.path().display()))]
    pub async fn classify(&self, artifact: &StagedArtifact) -> Result<AspectClassification> {
        let report = self.toolkit.probe(artifact.path()).await?;
        let ratio = report.first_display_aspect_ratio();

        let classification = AspectClassification::from_display_aspect_ratio(ratio)
            .ok_or_else(|| {
                PipelineError::Processing("Could not determine display aspect ratio".to_string())
            })?;

        debug!(ratio = %ratio, classification = %classification, "Video classified");
        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ScriptedToolkit;

    #[test]
    fn test_ratio_mapping() {
        use AspectClassification::*;

        assert_eq!(AspectClassification::from_display_aspect_ratio("16:9"), Some(Landscape));
        assert_eq!(AspectClassification::from_display_aspect_ratio("9:16"), Some(Portrait));
        assert_eq!(AspectClassification::from_display_aspect_ratio("4:3"), Some(Other));
        assert_eq!(AspectClassification::from_display_aspect_ratio("1:1"), Some(Other));
        assert_eq!(AspectClassification::from_display_aspect_ratio("0:1"), Some(Other));
        assert_eq!(AspectClassification::from_display_aspect_ratio(" 16:9"), Some(Other));
        assert_eq!(AspectClassification::from_display_aspect_ratio(""), None);
    }

    #[test]
    fn test_display_is_key_prefix() {
        assert_eq!(AspectClassification::Landscape.to_string(), "landscape");
        assert_eq!(
            serde_json::to_string(&AspectClassification::Portrait).unwrap(),
            "\"portrait\""
        );
    }

    fn artifact(dir: &tempfile::TempDir) -> StagedArtifact {
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"clip").unwrap();
        StagedArtifact::claim(path).unwrap()
    }

    #[tokio::test]
    async fn test_classify_landscape() {
        let dir = tempfile::tempdir().unwrap();
        let classifier =
            AspectRatioClassifier::new(Arc::new(ScriptedToolkit::with_aspect_ratio("16:9")));

        let classification = classifier.classify(&artifact(&dir)).await.unwrap();
        assert_eq!(classification, AspectClassification::Landscape);
    }

    #[tokio::test]
    async fn test_classify_zero_streams_fails() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = AspectRatioClassifier::new(Arc::new(ScriptedToolkit::without_streams()));

        let err = classifier.classify(&artifact(&dir)).await.unwrap_err();
        assert_eq!(err.category(), "processing");
    }

    #[tokio::test]
    async fn test_classify_propagates_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let toolkit = ScriptedToolkit::with_aspect_ratio("16:9").failing_probe("ffprobe crashed");
        let classifier = AspectRatioClassifier::new(Arc::new(toolkit));

        let err = classifier.classify(&artifact(&dir)).await.unwrap_err();
        assert!(err.to_string().contains("ffprobe crashed"));
    }
}
