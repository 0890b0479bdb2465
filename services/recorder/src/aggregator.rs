//! Event aggregation for a segment.
//!
//! Several classes may fire while one segment is open. Each gets its own
//! snapshot, and all of them are reported together, sharing the segment
//! video, once the segment closes.

use crate::reporter::Alarm;
use chrono::{DateTime, TimeZone};
use image::{ImageFormat, RgbImage};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while writing a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to create snapshot directory: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode snapshot: {0}")]
    Encode(#[from] image::ImageError),
}

/// Writes still images to disk.
pub trait SnapshotWriter: Send + Sync {
    fn write(&self, image: &RgbImage, path: &Path) -> Result<(), SnapshotError>;
}

/// JPEG snapshots through the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegSnapshotWriter;

impl SnapshotWriter for JpegSnapshotWriter {
    fn write(&self, image: &RgbImage, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        image.save_with_format(path, ImageFormat::Jpeg)?;
        Ok(())
    }
}

/// File names for one fire event on one channel.
///
/// Layout: `<save_dir>/ch_<channel>/<YYYYmmdd_HHMMSS>_type<type>.{mp4,jpg}`
/// and `<YYYYmmdd_HHMMSS>_cls<class>_type<type>.jpg` for secondary snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNaming {
    dir: PathBuf,
    stamp: String,
    resolved_type: i32,
}

impl EventNaming {
    pub fn new<Tz: TimeZone>(
        save_dir: &Path,
        channel: i32,
        at: &DateTime<Tz>,
        resolved_type: i32,
    ) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        Self {
            dir: save_dir.join(format!("ch_{channel}")),
            stamp: at.format("%Y%m%d_%H%M%S").to_string(),
            resolved_type,
        }
    }

    pub fn video_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}_type{}.mp4", self.stamp, self.resolved_type))
    }

    pub fn primary_snapshot(&self) -> PathBuf {
        self.dir
            .join(format!("{}_type{}.jpg", self.stamp, self.resolved_type))
    }

    pub fn class_snapshot(&self, class_id: i32) -> PathBuf {
        self.dir.join(format!(
            "{}_cls{}_type{}.jpg",
            self.stamp, class_id, self.resolved_type
        ))
    }

    pub fn resolved_type(&self) -> i32 {
        self.resolved_type
    }
}

/// An event waiting for its segment to close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub class_id: i32,
    pub resolved_type: i32,
    pub snapshot_path: PathBuf,
    pub datetime: String,
}

/// Events and suppressed classes of the current segment.
#[derive(Debug, Default)]
pub struct EventAggregator {
    pending: Vec<PendingEvent>,
    suppressed: HashSet<i32>,
}

impl EventAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything about the previous segment.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.suppressed.clear();
    }

    pub fn suppressed(&self) -> &HashSet<i32> {
        &self.suppressed
    }

    pub fn pending(&self) -> &[PendingEvent] {
        &self.pending
    }

    /// Buffer events for classes that fired while a segment is open.
    ///
    /// The first event of a segment takes the primary snapshot name; every
    /// other event gets a per-class name.
    pub fn record(
        &mut self,
        naming: &EventNaming,
        snapshots: &dyn SnapshotWriter,
        image: &RgbImage,
        classes: &[i32],
        datetime: &str,
    ) {
        for &class_id in classes {
            if self.suppressed.contains(&class_id) {
                continue;
            }

            let snapshot_path = if self.pending.is_empty() {
                naming.primary_snapshot()
            } else {
                naming.class_snapshot(class_id)
            };

            write_snapshot(snapshots, image, &snapshot_path);

            self.pending.push(PendingEvent {
                class_id,
                resolved_type: naming.resolved_type(),
                snapshot_path,
                datetime: datetime.to_string(),
            });
            self.suppressed.insert(class_id);
        }
    }

    /// Alarms for a fire event that has no segment to attach to.
    ///
    /// All classes share one primary snapshot and carry no video.
    pub fn bypass(
        channel: i32,
        naming: &EventNaming,
        snapshots: &dyn SnapshotWriter,
        image: &RgbImage,
        classes: &[i32],
        datetime: &str,
    ) -> Vec<Alarm> {
        let snapshot_path = naming.primary_snapshot();
        write_snapshot(snapshots, image, &snapshot_path);

        classes
            .iter()
            .map(|&class_id| Alarm {
                channel,
                class_id,
                resolved_type: naming.resolved_type(),
                image_path: snapshot_path.clone(),
                video_path: None,
                datetime: datetime.to_string(),
            })
            .collect()
    }

    /// Drain buffered events into alarms sharing `video_path`.
    ///
    /// A segment without events has nothing worth keeping, so its video is
    /// deleted.
    pub fn flush(&mut self, channel: i32, video_path: &Path) -> Vec<Alarm> {
        if self.pending.is_empty() {
            match fs::remove_file(video_path) {
                Ok(()) => info!(
                    channel,
                    video = %video_path.display(),
                    "Segment ended without events, video removed"
                ),
                Err(e) => warn!(
                    channel,
                    video = %video_path.display(),
                    error = %e,
                    "Segment ended without events, failed to remove video"
                ),
            }
            metrics::counter!("recorder_segments_discarded_total").increment(1);
            self.suppressed.clear();
            return Vec::new();
        }

        info!(
            channel,
            video = %video_path.display(),
            events = self.pending.len(),
            classes = ?self.pending.iter().map(|e| e.class_id).collect::<Vec<_>>(),
            "Segment ended"
        );

        let alarms = self
            .pending
            .drain(..)
            .map(|event| Alarm {
                channel,
                class_id: event.class_id,
                resolved_type: event.resolved_type,
                image_path: event.snapshot_path,
                video_path: Some(video_path.to_path_buf()),
                datetime: event.datetime,
            })
            .collect();
        self.suppressed.clear();
        alarms
    }
}

fn write_snapshot(snapshots: &dyn SnapshotWriter, image: &RgbImage, path: &Path) {
    if let Err(e) = snapshots.write(image, path) {
        warn!(path = %path.display(), error = %e, "Failed to write snapshot");
    }
}
