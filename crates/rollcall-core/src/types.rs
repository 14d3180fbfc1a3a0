use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of components in a face encoding.
pub const ENCODING_DIM: usize = 128;

/// Size of the persisted encoding blob: 128 little-endian f64 values.
pub const ENCODING_BYTES: usize = ENCODING_DIM * std::mem::size_of::<f64>();

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("expected 128-dim encoding, got {0}")]
    WrongDimension(usize),
    #[error("expected 1024-byte encoding blob, got {0}")]
    WrongByteLength(usize),
    #[error("encoding component {index} is not finite")]
    NonFinite { index: usize },
}

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face encoding: a fixed-length vector of 128 f64 values.
///
/// Produced by an external embedder and never mutated afterwards. Encodings
/// are compared only by Euclidean distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Encoding {
    values: Vec<f64>,
}

impl Encoding {
    /// Build an encoding, rejecting wrong lengths and non-finite components.
    pub fn new(values: Vec<f64>) -> Result<Self, EncodingError> {
        if values.len() != ENCODING_DIM {
            return Err(EncodingError::WrongDimension(values.len()));
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(EncodingError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Compute Euclidean distance between two encodings.
    pub fn euclidean_distance(&self, other: &Encoding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Elementwise mean of a set of encodings. `None` for an empty slice.
    pub fn mean(samples: &[Encoding]) -> Option<Encoding> {
        if samples.is_empty() {
            return None;
        }
        let mut acc = vec![0.0f64; ENCODING_DIM];
        for sample in samples {
            for (sum, v) in acc.iter_mut().zip(sample.values.iter()) {
                *sum += v;
            }
        }
        let n = samples.len() as f64;
        for sum in acc.iter_mut() {
            *sum /= n;
        }
        Some(Encoding { values: acc })
    }

    /// Serialize to the persisted blob format (little-endian f64s).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCODING_BYTES);
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Parse the persisted blob format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.len() != ENCODING_BYTES {
            return Err(EncodingError::WrongByteLength(bytes.len()));
        }
        let values = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        Self::new(values)
    }
}

impl TryFrom<Vec<f64>> for Encoding {
    type Error = EncodingError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Encoding> for Vec<f64> {
    fn from(encoding: Encoding) -> Self {
        encoding.values
    }
}

/// An enrolled person: externally assigned id, display name and encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub encoding: Encoding,
}

/// One face found in a frame by the external detector/embedder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub encoding: Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Present" => Ok(AttendanceStatus::Present),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// A persisted "present" event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub identity_id: String,
    pub timestamp: NaiveDateTime,
    pub status: AttendanceStatus,
}

/// An attendance row joined with the identity's display name, for reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub identity_id: String,
    pub display_name: String,
    pub timestamp: NaiveDateTime,
    pub status: AttendanceStatus,
}

#[cfg(test)]
pub(crate) fn encoding_at(first: f64) -> Encoding {
    let mut values = vec![0.0; ENCODING_DIM];
    values[0] = first;
    Encoding::new(values).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_rejects_wrong_dimension() {
        let err = Encoding::new(vec![0.0; 3]).unwrap_err();
        assert_eq!(err, EncodingError::WrongDimension(3));
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut values = vec![0.0; ENCODING_DIM];
        values[7] = f64::NAN;
        assert_eq!(Encoding::new(values).unwrap_err(), EncodingError::NonFinite { index: 7 });
    }

    #[test]
    fn test_euclidean_distance() {
        let mut a = vec![0.0; ENCODING_DIM];
        let mut b = vec![0.0; ENCODING_DIM];
        a[0] = 3.0;
        b[1] = 4.0;
        let a = Encoding::new(a).unwrap();
        let b = Encoding::new(b).unwrap();
        assert_abs_diff_eq!(a.euclidean_distance(&b), 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_mean_is_elementwise() {
        let samples: Vec<Encoding> = (1..=5).map(|i| encoding_at(i as f64)).collect();
        let mean = Encoding::mean(&samples).unwrap();
        assert_abs_diff_eq!(mean.values()[0], 3.0, epsilon = 1e-12);
        assert!(mean.values()[1..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_mean_of_nothing() {
        assert!(Encoding::mean(&[]).is_none());
    }

    #[test]
    fn test_blob_layout_is_little_endian() {
        let enc = encoding_at(1.5);
        let bytes = enc.to_bytes();
        assert_eq!(bytes.len(), ENCODING_BYTES);
        assert_eq!(&bytes[..8], &1.5f64.to_le_bytes());
        assert_eq!(Encoding::from_bytes(&bytes).unwrap(), enc);
    }

    #[test]
    fn test_blob_wrong_length() {
        assert_eq!(
            Encoding::from_bytes(&[0u8; 16]).unwrap_err(),
            EncodingError::WrongByteLength(16)
        );
    }

    #[test]
    fn test_deserialize_validates_length() {
        let err = serde_json::from_str::<Encoding>("[1.0, 2.0]");
        assert!(err.is_err());

        let json = serde_json::to_string(&vec![0.25f64; ENCODING_DIM]).unwrap();
        let enc: Encoding = serde_json::from_str(&json).unwrap();
        assert_eq!(enc.values()[0], 0.25);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(AttendanceStatus::Present.to_string(), "Present");
        assert_eq!("Present".parse::<AttendanceStatus>(), Ok(AttendanceStatus::Present));
        assert!("Absent".parse::<AttendanceStatus>().is_err());
    }
}
