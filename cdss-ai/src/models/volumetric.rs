//! Volumetric transport types
//!
//! A volumetric payload is fetched per completed job, decoded once, and held
//! only for the visualization session of the screen that requested it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Volume dimensions `[X, Y, Z]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeShape(pub [usize; 3]);

impl VolumeShape {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Self([x, y, z])
    }

    pub fn x(&self) -> usize {
        self.0[0]
    }

    pub fn y(&self) -> usize {
        self.0[1]
    }

    pub fn z(&self) -> usize {
        self.0[2]
    }

    /// Total element count, `None` on overflow
    pub fn element_count(&self) -> Option<usize> {
        self.0[0].checked_mul(self.0[1])?.checked_mul(self.0[2])
    }

    /// Row-major flat index of `(x, y, z)`
    pub fn flat_index(&self, x: usize, y: usize, z: usize) -> usize {
        x * self.0[1] * self.0[2] + y * self.0[2] + z
    }
}

impl std::fmt::Display for VolumeShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Channel encoding declared by the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeEncoding {
    /// Base64 of little-endian float32, row-major
    Base64,
    /// JSON number arrays, flat or nested
    Raw,
}

impl std::fmt::Display for VolumeEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeEncoding::Base64 => write!(f, "base64"),
            VolumeEncoding::Raw => write!(f, "raw"),
        }
    }
}

/// One channel as sent on the wire
///
/// Which variants are legal is decided by the payload's [`VolumeEncoding`],
/// not by the JSON shape. Raw numbers are kept as `f64` until decode so
/// values outside float32 range can be rejected instead of becoming `inf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelData {
    Encoded(String),
    Flat(Vec<f64>),
    Nested(Vec<Vec<Vec<f64>>>),
}

impl ChannelData {
    /// Short name of the wire shape, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelData::Encoded(_) => "string",
            ChannelData::Flat(_) => "flat array",
            ChannelData::Nested(_) => "nested array",
        }
    }
}

/// Volumetric fetch request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
    pub job_id: String,
    /// Always `"binary"` from this client
    pub encoding_preference: String,
}

impl VolumeRequest {
    pub fn binary(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            encoding_preference: "binary".to_string(),
        }
    }
}

/// Volumetric fetch response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumetricPayload {
    pub shape: VolumeShape,
    pub encoding: VolumeEncoding,
    pub channels: BTreeMap<String, ChannelData>,
    /// Channels carrying class indices; when absent the client default applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_channels: Option<Vec<String>>,
}

/// Decoded 3-D array, indexed `[x][y][z]`
#[derive(Debug, Clone, PartialEq)]
pub struct Volume3D {
    shape: VolumeShape,
    data: Vec<Vec<Vec<f32>>>,
}

impl Volume3D {
    /// Build from a flat row-major buffer; the caller guarantees the length
    pub(crate) fn from_flat(shape: VolumeShape, flat: &[f32]) -> Self {
        let (ny, nz) = (shape.y(), shape.z());
        let data = flat
            .chunks_exact(ny * nz)
            .map(|plane| plane.chunks_exact(nz).map(|row| row.to_vec()).collect())
            .collect();
        Self { shape, data }
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f32> {
        self.data.get(x)?.get(y)?.get(z).copied()
    }

    /// Nested `[x][y][z]` view
    pub fn as_nested(&self) -> &[Vec<Vec<f32>>] {
        &self.data
    }

    pub fn into_nested(self) -> Vec<Vec<Vec<f32>>> {
        self.data
    }

    /// Row-major flat copy
    pub fn flatten(&self) -> Vec<f32> {
        self.data.iter().flatten().flatten().copied().collect()
    }

    /// Distinct integer labels present, ascending (meaningful for label channels)
    pub fn distinct_labels(&self) -> Vec<i64> {
        let mut labels: Vec<i64> = self
            .data
            .iter()
            .flatten()
            .flatten()
            .map(|v| *v as i64)
            .collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }
}

/// All channels of one payload, decoded
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedVolume {
    pub shape: VolumeShape,
    pub channels: BTreeMap<String, Volume3D>,
    /// Names of the channels decoded with integer rounding
    pub label_channels: Vec<String>,
}

/// Visualization availability for a completed job
#[derive(Debug, Clone, PartialEq)]
pub enum VisualizationState {
    /// Result carries no volumetric data
    NotApplicable,
    /// Volume fetched and decoded
    Ready(DecodedVolume),
    /// Fetch or decode failed; the clinical result is still valid
    Unavailable(String),
}

impl VisualizationState {
    pub fn is_ready(&self) -> bool {
        matches!(self, VisualizationState::Ready(_))
    }
}
