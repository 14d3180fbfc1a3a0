//! Replay of pre-computed detections from a JSON-lines file.
//!
//! Each non-blank line is one frame:
//! `{"faces": [{"bbox": {"x":0,"y":0,"width":80,"height":80}, "encoding": [..128 floats..]}]}`

use anyhow::{Context, Result};
use rollcall_core::capture::{CaptureError, EmbedError};
use rollcall_core::{Detection, FaceEmbedder, FrameSource};
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayFrame {
    #[serde(default)]
    pub faces: Vec<Detection>,
}

pub struct ReplaySource {
    reader: Box<dyn BufRead + Send>,
    line_no: usize,
    pace: Option<Duration>,
}

impl ReplaySource {
    /// Open a replay file, or stdin for `-`.
    pub fn open(path: &Path, pace: Option<Duration>) -> Result<Self> {
        let reader: Box<dyn BufRead + Send> = if path == Path::new("-") {
            Box::new(BufReader::new(std::io::stdin()))
        } else {
            let file = std::fs::File::open(path)
                .with_context(|| format!("opening replay {}", path.display()))?;
            Box::new(BufReader::new(file))
        };
        Ok(Self::from_reader(reader, pace))
    }

    pub fn from_reader(reader: Box<dyn BufRead + Send>, pace: Option<Duration>) -> Self {
        Self {
            reader,
            line_no: 0,
            pace,
        }
    }
}

impl FrameSource for ReplaySource {
    type Frame = ReplayFrame;

    fn next_frame(&mut self) -> Result<Option<ReplayFrame>, CaptureError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| CaptureError::SourceFailed(format!("read error: {e}")))?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if !line.trim().is_empty() {
                break;
            }
        }

        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }

        serde_json::from_str(line.trim())
            .map(Some)
            .map_err(|e| CaptureError::SourceFailed(format!("line {}: {e}", self.line_no)))
    }
}

/// Detections in a replay frame are already embedded.
pub struct PrecomputedEmbedder;

impl FaceEmbedder for PrecomputedEmbedder {
    type Frame = ReplayFrame;

    fn detect_and_embed(&mut self, frame: &ReplayFrame) -> Result<Vec<Detection>, EmbedError> {
        Ok(frame.faces.clone())
    }
}
