//! Volumetric decoder
//!
//! Converts the server's compact volume encoding into nested 3-D arrays.
//!
//! **Wire format:** base64 (standard alphabet) of a row-major buffer of
//! little-endian IEEE-754 float32 values. Element `(x, y, z)` sits at flat
//! index `x*Y*Z + y*Z + z`. Label channels are sent as float32 too and are
//! rounded back to class indices on decode (0 = background, 1..N = classes).
//!
//! Every function here is pure: inputs are borrowed, never mutated, and a
//! buffer that does not match its declared shape is an error, never a
//! truncated or zero-padded volume.

use base64::{engine::general_purpose, Engine as _};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::{
    ChannelData, DecodedVolume, Volume3D, VolumeEncoding, VolumeShape, VolumetricPayload,
};

const F32_BYTES: usize = 4;

/// Volumetric decode errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Input is not valid base64
    #[error("Invalid base64: {0}")]
    InvalidBase64(String),

    /// Byte length is not a whole number of float32 values
    #[error("Buffer of {0} bytes is not a multiple of 4")]
    MisalignedBuffer(usize),

    /// Element count does not match the declared shape
    #[error("Shape mismatch: shape {shape} needs {expected} values, buffer holds {actual}")]
    ShapeMismatch {
        shape: VolumeShape,
        expected: usize,
        actual: usize,
    },

    /// Zero or overflowing dimension
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// Channel decode failed (wraps the underlying cause with the channel name)
    #[error("Channel '{channel}': {reason}")]
    Channel { channel: String, reason: String },

    /// Channel wire shape disagrees with the payload's declared encoding
    #[error("Encoding mismatch: payload declares {declared}, channel is a {found}")]
    EncodingMismatch {
        declared: VolumeEncoding,
        found: &'static str,
    },

    /// Raw value is not finite or does not fit in float32
    #[error("Value at flat index {0} is not a finite float32")]
    OutOfRange(usize),

    /// Payload declares no channels
    #[error("Payload has no channels")]
    NoChannels,
}

/// Decode one base64 channel into a 3-D array
///
/// With `round_to_int` every value is rounded to the nearest integer
/// (halves away from zero) before storage.
pub fn decode_volume(
    encoded: &str,
    shape: VolumeShape,
    round_to_int: bool,
) -> Result<Volume3D, DecodeError> {
    let expected = expected_len(shape)?;

    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;

    if bytes.len() % F32_BYTES != 0 {
        return Err(DecodeError::MisalignedBuffer(bytes.len()));
    }

    let actual = bytes.len() / F32_BYTES;
    if actual != expected {
        return Err(DecodeError::ShapeMismatch {
            shape,
            expected,
            actual,
        });
    }

    let flat: Vec<f32> = bytes
        .chunks_exact(F32_BYTES)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .map(|v| if round_to_int { v.round() } else { v })
        .collect();

    Ok(Volume3D::from_flat(shape, &flat))
}

/// Decode a raw (JSON array) channel, flat row-major or already nested
///
/// Values are narrowed to float32; a non-finite or out-of-range value is an
/// error. A base64 string is not a raw channel.
pub fn decode_raw_volume(
    data: &ChannelData,
    shape: VolumeShape,
    round_to_int: bool,
) -> Result<Volume3D, DecodeError> {
    let expected = expected_len(shape)?;

    let wide: Vec<f64> = match data {
        ChannelData::Flat(values) => values.clone(),
        ChannelData::Nested(planes) => {
            let nested_ok = planes.len() == shape.x()
                && planes.iter().all(|p| {
                    p.len() == shape.y() && p.iter().all(|row| row.len() == shape.z())
                });
            if !nested_ok {
                let actual = planes.iter().flatten().map(|row| row.len()).sum();
                return Err(DecodeError::ShapeMismatch {
                    shape,
                    expected,
                    actual,
                });
            }
            planes.iter().flatten().flatten().copied().collect()
        }
        ChannelData::Encoded(_) => {
            return Err(DecodeError::EncodingMismatch {
                declared: VolumeEncoding::Raw,
                found: data.kind(),
            })
        }
    };

    if wide.len() != expected {
        return Err(DecodeError::ShapeMismatch {
            shape,
            expected,
            actual: wide.len(),
        });
    }

    let flat = wide
        .iter()
        .enumerate()
        .map(|(index, v)| {
            if !v.is_finite() || v.abs() > f64::from(f32::MAX) {
                return Err(DecodeError::OutOfRange(index));
            }
            let v = *v as f32;
            Ok(if round_to_int { v.round() } else { v })
        })
        .collect::<Result<Vec<f32>, _>>()?;

    Ok(Volume3D::from_flat(shape, &flat))
}

/// Encode a volume into the wire format (inverse of [`decode_volume`])
pub fn encode_volume(volume: &Volume3D) -> String {
    encode_flat(&volume.flatten())
}

/// Encode a flat row-major buffer into the wire format
pub fn encode_flat(values: &[f32]) -> String {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    general_purpose::STANDARD.encode(bytes)
}

/// Decode every channel of a payload
///
/// The payload's `encoding` selects the decoder; a channel whose wire shape
/// disagrees with it fails the decode. Label channels come from the payload's own `labelChannels` list when
/// present, else from `default_labels`. The first failing channel aborts the
/// whole decode; a partially decoded payload is never returned.
pub fn decode_payload(
    payload: &VolumetricPayload,
    default_labels: &[String],
) -> Result<DecodedVolume, DecodeError> {
    if payload.channels.is_empty() {
        return Err(DecodeError::NoChannels);
    }

    let labels: &[String] = payload.label_channels.as_deref().unwrap_or(default_labels);

    let mut channels = BTreeMap::new();
    let mut label_channels = Vec::new();

    for (name, data) in &payload.channels {
        let is_label = labels.iter().any(|l| l == name);
        let decoded = match (payload.encoding, data) {
            (VolumeEncoding::Base64, ChannelData::Encoded(encoded)) => {
                decode_volume(encoded, payload.shape, is_label)
            }
            (VolumeEncoding::Base64, other) => Err(DecodeError::EncodingMismatch {
                declared: VolumeEncoding::Base64,
                found: other.kind(),
            }),
            (VolumeEncoding::Raw, raw) => decode_raw_volume(raw, payload.shape, is_label),
        };
        let volume = decoded.map_err(|e| DecodeError::Channel {
            channel: name.clone(),
            reason: e.to_string(),
        })?;

        if is_label {
            label_channels.push(name.clone());
        }
        channels.insert(name.clone(), volume);
    }

    tracing::debug!(
        shape = %payload.shape,
        channels = channels.len(),
        labels = label_channels.len(),
        "Volumetric payload decoded"
    );

    Ok(DecodedVolume {
        shape: payload.shape,
        channels,
        label_channels,
    })
}

fn expected_len(shape: VolumeShape) -> Result<usize, DecodeError> {
    if shape.0.iter().any(|d| *d == 0) {
        return Err(DecodeError::InvalidShape(format!(
            "dimensions must be positive, got {}",
            shape
        )));
    }
    let count = shape
        .element_count()
        .ok_or_else(|| DecodeError::InvalidShape(format!("{} overflows", shape)))?;
    count
        .checked_mul(F32_BYTES)
        .ok_or_else(|| DecodeError::InvalidShape(format!("{} overflows", shape)))?;
    Ok(count)
}
