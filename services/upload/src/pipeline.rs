//! Upload pipeline orchestration.
//!
//! A run walks `Validated → Staged → Classified → Optimized → Published →
//! Persisted` and stops at the first failure. Scratch files created along the
//! way are removed on every exit path; if the run future is dropped they are
//! removed by their handles and any running tool process is killed.
//!
//! Publication is not rolled back. When the metadata update fails after a
//! successful upload the object stays in the bucket and is logged as orphaned.

use crate::classifier::{AspectClassification, AspectRatioClassifier};
use crate::error::{PipelineError, Result};
use crate::media::MediaToolkit;
use crate::metadata_store::{VideoRecord, VideoStore};
use crate::optimizer::ContainerOptimizer;
use crate::publisher::{ObjectPublisher, StorageObjectReference};
use crate::receiver::{UploadReceiver, UploadRequest};
use crate::staging::{cleanup, StagedArtifact, StagingStore};
use bytes::Bytes;
use futures::Stream;
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Per-run values shared by every stage
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub video_id: Uuid,
    /// Accepted media type, attached to the published object
    pub media_type: String,
}

/// Stages of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Validated,
    Staged,
    Classified,
    Optimized,
    Published,
    Persisted,
    Failed,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Validated => "validated",
            RunStage::Staged => "staged",
            RunStage::Classified => "classified",
            RunStage::Optimized => "optimized",
            RunStage::Published => "published",
            RunStage::Persisted => "persisted",
            RunStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Last stage a run reached
#[derive(Debug, Default)]
struct RunProgress {
    reached: Option<RunStage>,
}

impl RunProgress {
    fn advance(&mut self, stage: RunStage) {
        info!(stage = %stage, "Upload stage completed");
        self.reached = Some(stage);
    }

    fn label(&self) -> String {
        self.reached
            .map(|s| s.to_string())
            .unwrap_or_else(|| "received".to_string())
    }
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub video: VideoRecord,
    pub reference: StorageObjectReference,
    pub classification: AspectClassification,
}

/// Sequences receiver, staging, classifier, optimizer, publisher and metadata update
pub struct UploadPipeline {
    receiver: UploadReceiver,
    staging: StagingStore,
    classifier: AspectRatioClassifier,
    optimizer: ContainerOptimizer,
    publisher: ObjectPublisher,
    videos: Arc<dyn VideoStore>,
}

impl UploadPipeline {
    pub fn new(
        receiver: UploadReceiver,
        staging: StagingStore,
        toolkit: Arc<dyn MediaToolkit>,
        publisher: ObjectPublisher,
        videos: Arc<dyn VideoStore>,
    ) -> Self {
        Self {
            receiver,
            staging,
            classifier: AspectRatioClassifier::new(toolkit.clone()),
            optimizer: ContainerOptimizer::new(toolkit),
            publisher,
            videos,
        }
    }

    /// Fetch the record and check that `user_id` owns it
    pub async fn authorize(&self, user_id: Uuid, video_id: Uuid) -> Result<VideoRecord> {
        let video = self
            .videos
            .get_video(video_id)
            .await?
            .ok_or(PipelineError::NotFound(video_id))?;

        if video.user_id != user_id {
            return Err(PipelineError::Authorization { user_id, video_id });
        }

        Ok(video)
    }

    /// Execute one upload run to completion or first failure
    #[instrument(
        skip_all,
        fields(video_id = %request.video_id, user_id = %request.user_id, run_id = tracing::field::Empty)
    )]
    pub async fn run<S>(&self, request: UploadRequest<S>) -> Result<UploadOutcome>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let mut progress = RunProgress::default();

        match self.execute(request, &mut progress).await {
            Ok(outcome) => {
                metrics::counter!(
                    "upload.runs.completed",
                    "classification" => outcome.classification.as_str()
                )
                .increment(1);
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    stage = %RunStage::Failed,
                    last_stage = %progress.label(),
                    category = e.category(),
                    error = %e,
                    "Upload run failed"
                );
                metrics::counter!(
                    "upload.runs.failed",
                    "stage" => progress.label(),
                    "category" => e.category()
                )
                .increment(1);
                Err(e)
            }
        }
    }

    async fn execute<S>(
        &self,
        request: UploadRequest<S>,
        progress: &mut RunProgress,
    ) -> Result<UploadOutcome>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let UploadRequest {
            user_id,
            video_id,
            content_type,
            body,
        } = request;

        let video = self.authorize(user_id, video_id).await?;
        let accepted = self.receiver.accept(&content_type, body)?;

        let ctx = PipelineContext {
            run_id: Uuid::new_v4(),
            user_id,
            video_id,
            media_type: accepted.media_type,
        };
        tracing::Span::current().record("run_id", tracing::field::display(ctx.run_id));
        progress.advance(RunStage::Validated);

        let staged = self.staging.stage(ctx.video_id, accepted.body).await?;
        progress.advance(RunStage::Staged);

        let result = self.process(&ctx, &staged, video, progress).await;
        cleanup(vec![staged]).await;
        result
    }

    async fn process(
        &self,
        ctx: &PipelineContext,
        staged: &StagedArtifact,
        video: VideoRecord,
        progress: &mut RunProgress,
    ) -> Result<UploadOutcome> {
        let classification = self.classifier.classify(staged).await?;
        progress.advance(RunStage::Classified);

        let optimized = self.optimizer.optimize(staged).await?;
        progress.advance(RunStage::Optimized);

        let result = self
            .publish_and_persist(ctx, &optimized, classification, video, progress)
            .await;
        cleanup(vec![optimized]).await;
        result
    }

    async fn publish_and_persist(
        &self,
        ctx: &PipelineContext,
        optimized: &StagedArtifact,
        classification: AspectClassification,
        mut video: VideoRecord,
        progress: &mut RunProgress,
    ) -> Result<UploadOutcome> {
        let reference = self
            .publisher
            .publish(optimized, classification, ctx.video_id, &ctx.media_type)
            .await?;
        progress.advance(RunStage::Published);

        video.video_url = Some(reference.to_string());
        if let Err(e) = self.videos.update_video(&video).await {
            error!(
                bucket = %reference.bucket,
                key = %reference.key,
                error = %e,
                "Metadata update failed after publication; stored object is orphaned"
            );
            metrics::counter!("upload.objects.orphaned").increment(1);
            return Err(match e {
                PipelineError::Persistence(_) => e,
                other => PipelineError::Persistence(other.to_string()),
            });
        }
        progress.advance(RunStage::Persisted);

        Ok(UploadOutcome {
            video,
            reference,
            classification,
        })
    }
}
