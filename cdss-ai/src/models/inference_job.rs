//! Inference job state machine
//!
//! A job moves Submitted → Polling → {Completed | Failed | Cancelled}.
//! Cached submissions jump straight from Submitted to Completed. Terminal
//! states are final: the merger rejects every later transition.

use cdss_common::events::RemoteStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::InferenceError;

/// Inference model family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Single-modality MRI analysis
    SingleModality,
    /// Gene-expression analysis
    GeneExpression,
    /// Multi-modal fusion of imaging, genomic and proteomic inputs
    MultiModal,
}

/// Input slots accepted by the fusion model
pub const FUSION_SLOTS: [&str; 3] = ["mri_ocs_id", "gene_ocs_id", "protein_ocs_id"];

/// Input slot of the single-input models
pub const SINGLE_SLOT: &str = "ocs_id";

impl ModelType {
    /// Model code understood by the backend scheduler
    pub fn code(&self) -> &'static str {
        match self {
            ModelType::SingleModality => "M1",
            ModelType::GeneExpression => "MG",
            ModelType::MultiModal => "MM",
        }
    }

    /// Parse either the wire tag (`single_modality`) or the model code (`M1`)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single_modality" | "single-modality" | "m1" | "mri" => Some(ModelType::SingleModality),
            "gene_expression" | "gene-expression" | "mg" | "gene" => Some(ModelType::GeneExpression),
            "multi_modal" | "multi-modal" | "mm" | "fusion" => Some(ModelType::MultiModal),
            _ => None,
        }
    }

    fn allowed_slots(&self) -> &'static [&'static str] {
        match self {
            ModelType::SingleModality | ModelType::GeneExpression => &[SINGLE_SLOT],
            ModelType::MultiModal => &FUSION_SLOTS,
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// How many fusion inputs a multi-modal job carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionCoverage {
    /// Single-input model, coverage does not apply
    NotApplicable,
    /// One or two of the three fusion slots
    Partial,
    /// All three fusion slots
    Full,
}

/// Named input slots mapped to opaque source-record identifiers
///
/// Null identifiers are treated as absent slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputRefs(BTreeMap<String, Value>);

impl InputRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style slot assignment
    pub fn with(mut self, slot: impl Into<String>, id: impl Into<Value>) -> Self {
        self.insert(slot, id);
        self
    }

    pub fn insert(&mut self, slot: impl Into<String>, id: impl Into<Value>) {
        self.0.insert(slot.into(), id.into());
    }

    /// Identifier of a slot, `None` for absent or null slots
    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.0.get(slot).filter(|v| !v.is_null())
    }

    /// Number of non-null slots
    pub fn filled(&self) -> usize {
        self.0.values().filter(|v| !v.is_null()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Check the slots against the model's requirements
    ///
    /// Single-input models need `ocs_id`. Fusion needs at least one of its
    /// three slots; full coverage requires all three. Slots the model does
    /// not know are rejected rather than silently forwarded.
    pub fn validate(&self, model: ModelType) -> Result<FusionCoverage, InferenceError> {
        let allowed = model.allowed_slots();
        if let Some(unknown) = self.0.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(InferenceError::InvalidInput(format!(
                "slot '{}' is not accepted by model {} (expected one of: {})",
                unknown,
                model.code(),
                allowed.join(", ")
            )));
        }

        match model {
            ModelType::SingleModality | ModelType::GeneExpression => {
                if self.get(SINGLE_SLOT).is_none() {
                    return Err(InferenceError::InvalidInput(format!(
                        "model {} requires slot '{}'",
                        model.code(),
                        SINGLE_SLOT
                    )));
                }
                Ok(FusionCoverage::NotApplicable)
            }
            ModelType::MultiModal => {
                let present = FUSION_SLOTS.iter().filter(|s| self.get(s).is_some()).count();
                match present {
                    0 => Err(InferenceError::InvalidInput(format!(
                        "fusion requires at least one of: {}",
                        FUSION_SLOTS.join(", ")
                    ))),
                    3 => Ok(FusionCoverage::Full),
                    _ => Ok(FusionCoverage::Partial),
                }
            }
        }
    }
}

/// Client-side job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submission issued, no status observed yet
    Submitted,
    /// Reconciliation running, non-terminal status observed
    Polling,
    /// Result available
    Completed,
    /// Terminal failure (see [`FailureKind`])
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// Why a job ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Gateway call failed, no job handle was issued
    Submission,
    /// Status lookups kept failing
    LookupFailed,
    /// Attempts exhausted without a terminal status
    TimedOut,
    /// Backend reported the job as failed
    ServerReported,
}

/// Channel that produced a job update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    /// Synchronous cached result at submission
    Cache,
    /// Polling reconciler
    Poll,
    /// Push reconciler
    Push,
    /// Client-side decision (submission failure, user cancel)
    Local,
}

/// Retry offered to the user after an unsuccessful job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    /// Poll the existing job again without resubmitting
    Repoll,
    /// Submit a new job
    Resubmit,
}

/// One update offered to the merger
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// Reconcilers started; no status observed yet
    Reconciling,
    /// Non-terminal status observed
    Progress {
        status: RemoteStatus,
        source: UpdateSource,
    },
    /// Terminal success
    Completed { result: Value, source: UpdateSource },
    /// Terminal failure
    Failed {
        kind: FailureKind,
        message: String,
        source: UpdateSource,
    },
    /// Terminal user cancel
    Cancelled,
}

impl JobUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobUpdate::Reconciling | JobUpdate::Progress { .. })
    }

    pub fn source(&self) -> UpdateSource {
        match self {
            JobUpdate::Progress { source, .. }
            | JobUpdate::Completed { source, .. }
            | JobUpdate::Failed { source, .. } => *source,
            JobUpdate::Reconciling | JobUpdate::Cancelled => UpdateSource::Local,
        }
    }

    /// Map a backend status report to an update
    ///
    /// A `Completed` report without a result carries `null`. A `Failed` report
    /// without a message gets a generic one; a provided message is passed
    /// through verbatim.
    pub fn from_remote(
        status: RemoteStatus,
        result: Option<Value>,
        error: Option<String>,
        source: UpdateSource,
    ) -> Self {
        match status {
            RemoteStatus::Completed => JobUpdate::Completed {
                result: result.unwrap_or(Value::Null),
                source,
            },
            RemoteStatus::Failed => JobUpdate::Failed {
                kind: FailureKind::ServerReported,
                message: error.unwrap_or_else(|| "inference job failed".to_string()),
                source,
            },
            other => JobUpdate::Progress {
                status: other,
                source,
            },
        }
    }
}

/// Snapshot of one inference job, as shown to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceJob {
    /// Server-assigned identifier; absent if submission failed before one was issued
    pub job_id: Option<String>,
    pub model_type: ModelType,
    pub input_refs: InputRefs,
    pub state: JobState,
    /// True if the result came back synchronously at submission
    pub cached: bool,
    /// Present only when `Completed`
    pub result: Option<Value>,
    /// Present only when `Failed`
    pub error_message: Option<String>,
    /// Present only when `Failed`
    pub failure: Option<FailureKind>,
    /// Latest non-terminal status reported by either channel
    pub last_status: Option<RemoteStatus>,
    /// Channel that delivered the terminal state
    pub source: Option<UpdateSource>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl InferenceJob {
    pub fn new(model_type: ModelType, input_refs: InputRefs, job_id: Option<String>) -> Self {
        Self {
            job_id,
            model_type,
            input_refs,
            state: JobState::Submitted,
            cached: false,
            result: None,
            error_message: None,
            failure: None,
            last_status: None,
            source: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Retry offered for this job, if any
    ///
    /// Failed and cancelled jobs can be retried: against the same job id
    /// when one was issued, by resubmission otherwise.
    pub fn retry_action(&self) -> Option<RetryAction> {
        match self.state {
            JobState::Failed | JobState::Cancelled => Some(if self.job_id.is_some() {
                RetryAction::Repoll
            } else {
                RetryAction::Resubmit
            }),
            _ => None,
        }
    }

    /// Apply an update in place; returns whether anything changed
    ///
    /// Rejects every update once terminal.
    pub(crate) fn apply(&mut self, update: JobUpdate) -> bool {
        if self.is_terminal() {
            return false;
        }

        match update {
            JobUpdate::Reconciling => {
                let changed = self.state == JobState::Submitted;
                self.state = JobState::Polling;
                changed
            }
            JobUpdate::Progress { status, .. } => {
                let changed = self.state != JobState::Polling || self.last_status != Some(status);
                self.state = JobState::Polling;
                self.last_status = Some(status);
                changed
            }
            JobUpdate::Completed { result, source } => {
                self.state = JobState::Completed;
                self.result = Some(result);
                self.cached = source == UpdateSource::Cache;
                self.finish(source);
                true
            }
            JobUpdate::Failed {
                kind,
                message,
                source,
            } => {
                self.state = JobState::Failed;
                self.failure = Some(kind);
                self.error_message = Some(message);
                self.finish(source);
                true
            }
            JobUpdate::Cancelled => {
                self.state = JobState::Cancelled;
                self.finish(UpdateSource::Local);
                true
            }
        }
    }

    fn finish(&mut self, source: UpdateSource) {
        self.source = Some(source);
        self.finished_at = Some(Utc::now());
    }
}
