//! Data models for inference jobs and volumetric results

pub mod inference_job;
pub mod volumetric;

pub use inference_job::{
    FailureKind, FusionCoverage, InferenceJob, InputRefs, JobState, JobUpdate, ModelType,
    RetryAction, UpdateSource,
};
pub use volumetric::{
    ChannelData, DecodedVolume, VisualizationState, Volume3D, VolumeEncoding, VolumeRequest,
    VolumeShape, VolumetricPayload,
};
