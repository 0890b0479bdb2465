//! Storage retention.
//!
//! A background task that periodically walks the save directory and deletes
//! media files by age, then oldest-first until the total size fits the cap.
//! Files that belong to a segment still being written are never touched.

use crate::segment::ActiveSegments;
use metrics::counter;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Shortest allowed pause between two sweeps.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
const MEDIA_EXTENSIONS: [&str; 3] = ["mp4", "jpg", "jpeg"];

/// Limits applied on every sweep. Zero disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
    pub max_total_bytes: u64,
    pub poll_interval: Duration,
}

impl RetentionPolicy {
    pub fn new(max_age_days: u32, max_total_bytes: u64, poll_interval: Duration) -> Self {
        Self {
            max_age_days,
            max_total_bytes,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_age_days > 0 || self.max_total_bytes > 0
    }

    fn max_age(&self) -> Option<Duration> {
        (self.max_age_days > 0)
            .then(|| Duration::from_secs(u64::from(self.max_age_days) * SECONDS_PER_DAY))
    }
}

/// Extension check, case-insensitive.
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            MEDIA_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted_by_age: usize,
    pub deleted_by_size: usize,
    pub bytes_freed: u64,
    /// Total size of media left on disk
    pub remaining_bytes: u64,
}

impl SweepReport {
    pub fn deleted(&self) -> usize {
        self.deleted_by_age + self.deleted_by_size
    }
}

#[derive(Debug)]
struct MediaFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Periodic cleanup of the recorder's storage root.
#[derive(Debug, Clone)]
pub struct RetentionService {
    root: PathBuf,
    policy: RetentionPolicy,
    active: ActiveSegments,
}

impl RetentionService {
    pub fn new(root: impl Into<PathBuf>, policy: RetentionPolicy, active: ActiveSegments) -> Self {
        Self {
            root: root.into(),
            policy,
            active,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Run one cleanup pass as of `now`.
    pub fn sweep(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        let mut files = self.collect();
        report.scanned = files.len();

        if let Some(max_age) = self.policy.max_age() {
            files.retain(|file| {
                let age = now.duration_since(file.modified).unwrap_or_default();
                if age <= max_age || self.active.contains(&file.path) {
                    return true;
                }
                if self.remove(file) {
                    report.deleted_by_age += 1;
                    report.bytes_freed += file.size;
                    false
                } else {
                    true
                }
            });
        }

        let mut total: u64 = files.iter().map(|f| f.size).sum();

        if self.policy.max_total_bytes > 0 && total > self.policy.max_total_bytes {
            files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
            for file in &files {
                if total <= self.policy.max_total_bytes {
                    break;
                }
                if self.active.contains(&file.path) {
                    continue;
                }
                if self.remove(file) {
                    report.deleted_by_size += 1;
                    report.bytes_freed += file.size;
                    total -= file.size;
                }
            }
        }

        report.remaining_bytes = total;

        if report.deleted() > 0 {
            counter!("retention_files_deleted_total").increment(report.deleted() as u64);
            counter!("retention_bytes_freed_total").increment(report.bytes_freed);
            info!(
                root = %self.root.display(),
                scanned = report.scanned,
                deleted_by_age = report.deleted_by_age,
                deleted_by_size = report.deleted_by_size,
                bytes_freed = report.bytes_freed,
                remaining_bytes = report.remaining_bytes,
                "Retention sweep completed"
            );
        } else {
            debug!(scanned = report.scanned, "Retention sweep found nothing to delete");
        }

        report
    }

    fn collect(&self) -> Vec<MediaFile> {
        if !self.root.is_dir() {
            debug!(root = %self.root.display(), "Storage root missing, nothing to sweep");
            return Vec::new();
        }

        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry during retention sweep");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && is_media_file(entry.path()))
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                Some(MediaFile {
                    path: entry.into_path(),
                    size: metadata.len(),
                    modified: metadata.modified().ok()?,
                })
            })
            .collect()
    }

    fn remove(&self, file: &MediaFile) -> bool {
        match fs::remove_file(&file.path) {
            Ok(()) => {
                debug!(path = %file.path.display(), size = file.size, "Deleted media file");
                true
            }
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "Failed to delete media file");
                false
            }
        }
    }

    /// Start the periodic sweep. The first pass runs immediately.
    pub fn spawn(self, token: CancellationToken) -> RetentionHandle {
        let child = token.clone();
        let join = tokio::spawn(async move {
            info!(
                root = %self.root.display(),
                max_age_days = self.policy.max_age_days,
                max_total_bytes = self.policy.max_total_bytes,
                interval_secs = self.policy.poll_interval.as_secs(),
                "Retention service started"
            );

            // The interval runs from the end of each sweep
            loop {
                let service = self.clone();
                let result =
                    tokio::task::spawn_blocking(move || service.sweep(SystemTime::now())).await;
                if let Err(e) = result {
                    error!(error = %e, "Retention sweep panicked");
                }

                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(self.policy.poll_interval) => {}
                }
            }

            info!("Retention service stopped");
        });

        RetentionHandle { token, join }
    }
}

/// Running retention task.
pub struct RetentionHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl RetentionHandle {
    /// Signal the task and wait for it. An in-flight sweep finishes first.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "Retention task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    const HOUR: Duration = Duration::from_secs(3600);

    fn write_file(dir: &Path, name: &str, size: usize, modified: SystemTime) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, vec![0u8; size]).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
        path
    }

    #[test]
    fn test_policy_clamps_interval() {
        let policy = RetentionPolicy::new(1, 0, Duration::from_secs(1));
        assert_eq!(policy.poll_interval, MIN_POLL_INTERVAL);
        assert!(policy.is_enabled());
        assert!(!RetentionPolicy::new(0, 0, MIN_POLL_INTERVAL).is_enabled());
    }

    #[test]
    fn test_media_extensions() {
        assert!(is_media_file(Path::new("a/b.mp4")));
        assert!(is_media_file(Path::new("a/b.JPG")));
        assert!(is_media_file(Path::new("b.jpeg")));
        assert!(!is_media_file(Path::new("b.txt")));
        assert!(!is_media_file(Path::new("mp4")));
    }

    #[test]
    fn test_age_pass_deletes_old_media_only() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let old_video = write_file(dir.path(), "ch_0/old.mp4", 10, now - 48 * HOUR);
        let old_note = write_file(dir.path(), "ch_0/old.txt", 10, now - 48 * HOUR);
        let fresh = write_file(dir.path(), "ch_1/fresh.jpg", 10, now - HOUR / 2);

        let service = RetentionService::new(
            dir.path(),
            RetentionPolicy::new(1, 0, MIN_POLL_INTERVAL),
            ActiveSegments::new(),
        );
        let report = service.sweep(now);

        assert_eq!(report.scanned, 2);
        assert_eq!(report.deleted_by_age, 1);
        assert_eq!(report.bytes_freed, 10);
        assert!(!old_video.exists());
        assert!(old_note.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_capacity_pass_deletes_oldest_until_under_cap() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let a = write_file(dir.path(), "ch_0/a.mp4", 100, now - 3 * HOUR);
        let b = write_file(dir.path(), "ch_0/b.jpg", 100, now - 2 * HOUR);
        let c = write_file(dir.path(), "ch_0/c.mp4", 100, now - HOUR);

        let service = RetentionService::new(
            dir.path(),
            RetentionPolicy::new(0, 250, MIN_POLL_INTERVAL),
            ActiveSegments::new(),
        );
        let report = service.sweep(now);

        assert_eq!(report.deleted_by_size, 1);
        assert_eq!(report.remaining_bytes, 200);
        assert!(!a.exists());
        assert!(b.exists());
        assert!(c.exists());
    }

    #[test]
    fn test_active_segment_is_never_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let active_video = write_file(dir.path(), "ch_0/live.mp4", 100, now - 72 * HOUR);
        let other = write_file(dir.path(), "ch_0/other.mp4", 100, now - HOUR);

        let active = ActiveSegments::new();
        active.insert(&active_video);

        let service = RetentionService::new(
            dir.path(),
            RetentionPolicy::new(1, 50, MIN_POLL_INTERVAL),
            active,
        );
        let report = service.sweep(now);

        assert!(active_video.exists());
        assert!(!other.exists());
        assert_eq!(report.deleted_by_size, 1);
        assert_eq!(report.remaining_bytes, 100);
    }

    #[test]
    fn test_missing_root_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let service = RetentionService::new(
            dir.path().join("absent"),
            RetentionPolicy::new(1, 1, MIN_POLL_INTERVAL),
            ActiveSegments::new(),
        );
        assert_eq!(service.sweep(SystemTime::now()), SweepReport::default());
    }

    #[tokio::test]
    async fn test_spawned_service_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let old = write_file(dir.path(), "old.jpg", 1, now - 96 * HOUR);

        let service = RetentionService::new(
            dir.path(),
            RetentionPolicy::new(1, 0, MIN_POLL_INTERVAL),
            ActiveSegments::new(),
        );
        let handle = service.spawn(CancellationToken::new());

        // First tick fires immediately
        for _ in 0..50 {
            if !old.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!old.exists());

        handle.stop().await;
    }

    /// Let spawned tasks run and poll in real time, so the paused clock does
    /// not move while the blocking pool works.
    async fn settle_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_sweep_waits_full_interval_after_previous() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let first = write_file(dir.path(), "first.mp4", 1, now - 96 * HOUR);

        let service = RetentionService::new(
            dir.path(),
            RetentionPolicy::new(1, 0, MIN_POLL_INTERVAL),
            ActiveSegments::new(),
        );
        let handle = service.spawn(CancellationToken::new());

        assert!(settle_until(|| !first.exists()).await);
        // Let the task observe the finished sweep and start its wait
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let second = write_file(dir.path(), "second.mp4", 1, now - 96 * HOUR);
        tokio::time::sleep(MIN_POLL_INTERVAL - Duration::from_secs(1)).await;
        std::thread::sleep(Duration::from_millis(100));
        assert!(second.exists());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(settle_until(|| !second.exists()).await);

        handle.stop().await;
    }
}
