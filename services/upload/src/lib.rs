//! Video Upload Service
//!
//! Accepts user-submitted MP4 uploads, classifies them by display aspect
//! ratio, remuxes them for progressive playback and publishes them to S3.
//! The video record keeps a stable `<bucket>,<key>` reference; signed URLs
//! are derived from it whenever the record is read.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP multipart          scratch dir             ffprobe / ffmpeg
//! ┌──────────────┐       ┌──────────────┐        ┌──────────────┐
//! │ Upload       │──────▶│ Staging      │───────▶│ Classifier   │
//! │ Receiver     │       │ Store        │        └──────────────┘
//! └──────────────┘       └──────────────┘               │
//!                                                       ▼
//! ┌──────────────┐       ┌──────────────┐        ┌──────────────┐
//! │ Metadata     │◀──────│ Object       │◀───────│ Container    │
//! │ Store (PG)   │       │ Publisher    │        │ Optimizer    │
//! └──────────────┘       └──────────────┘        └──────────────┘
//!        │                      │ S3: {landscape|portrait|other}/{video_id}
//!        ▼                      │
//! ┌──────────────┐              │
//! │ Reference    │◀─────────────┘
//! │ Resolver     │  presigned GET, 15 min
//! └──────────────┘
//! ```

pub mod api;
pub mod classifier;
pub mod config;
pub mod error;
pub mod media;
pub mod metadata_store;
pub mod optimizer;
pub mod pipeline;
pub mod publisher;
pub mod receiver;
pub mod resolver;
pub mod staging;

pub use classifier::{AspectClassification, AspectRatioClassifier};
pub use config::Config;
pub use error::PipelineError;
pub use media::{FfmpegToolkit, MediaToolkit, ProbeReport, ScriptedToolkit};
pub use metadata_store::{PgVideoStore, VideoRecord, VideoStore};
pub use optimizer::ContainerOptimizer;
pub use pipeline::{PipelineContext, RunStage, UploadOutcome, UploadPipeline};
pub use publisher::{ObjectPublisher, ObjectStore, S3Store, StorageObjectReference};
pub use receiver::{UploadReceiver, UploadRequest};
pub use resolver::{ReferenceResolver, SignedUrl, SignedVideo};
pub use staging::{StagedArtifact, StagingStore};
