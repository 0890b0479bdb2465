//! Newline-delimited JSON frame ingestion.
//!
//! Each line describes one frame of one channel:
//!
//! ```json
//! {"channel": 0, "image_path": "/frames/0001.jpg",
//!  "frame_rate": {"num": 30000, "den": 1001},
//!  "detections": [{"class_id": 2, "score": 0.91, "bbox": [10, 20, 50, 80]}]}
//! ```
//!
//! Malformed lines and unreadable images are logged and skipped.

use crate::detection::{Detection, Frame, FrameInput, FrameRate};
use crate::worker::{DispatchError, Dispatcher};
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised while turning an input line into a frame.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Malformed frame envelope: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Input read failed: {0}")]
    Io(#[from] io::Error),

    #[error("Decoder task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// One input line.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameEnvelope {
    pub channel: i32,
    pub image_path: PathBuf,
    #[serde(default)]
    pub frame_rate: Option<FrameRate>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl FrameEnvelope {
    pub fn parse(line: &str) -> Result<Self, IngestError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Load the referenced image and build the processing input.
    pub fn into_input(self) -> Result<FrameInput, IngestError> {
        let image = image::open(&self.image_path)
            .map_err(|source| IngestError::Decode {
                path: self.image_path.clone(),
                source,
            })?
            .to_rgb8();

        let mut frame = Frame::new(image);
        if let Some(rate) = self.frame_rate {
            frame = frame.with_frame_rate(rate);
        }

        Ok(FrameInput::new(self.channel, frame, self.detections))
    }
}

/// Counters for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub dispatched: u64,
    pub skipped: u64,
}

/// Read envelopes until EOF or cancellation and hand them to the dispatcher.
pub async fn pump_frames<R>(
    reader: R,
    dispatcher: &mut Dispatcher,
    token: &CancellationToken,
) -> Result<IngestStats, IngestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = IngestStats::default();

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => {
                debug!("Ingestion cancelled");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => {
                    info!(lines = stats.lines, "Input closed");
                    break;
                }
            },
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.lines += 1;

        let input = match decode_line(line.to_string()).await {
            Ok(input) => input,
            Err(e) => {
                warn!(line = stats.lines, error = %e, "Skipping input line");
                stats.skipped += 1;
                continue;
            }
        };

        match dispatcher.dispatch(input).await {
            Ok(()) => stats.dispatched += 1,
            Err(DispatchError::ShuttingDown) => break,
            Err(e) => {
                warn!(error = %e, "Dropping frame");
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}

async fn decode_line(line: String) -> Result<FrameInput, IngestError> {
    let envelope = FrameEnvelope::parse(&line)?;
    tokio::task::spawn_blocking(move || envelope.into_input()).await?
}
