//! Per-channel trigger state machine.
//!
//! The registry owns one [`ChannelState`] per channel id, created on the
//! first frame for that id. Each frame runs through:
//!
//! ```text
//! detections -> candidates -> streak counters -> fired classes
//!                                                    |
//!                      idle: open segment (or bypass) / recording: add events
//!                                                    |
//!                      recording: append frame, close + flush at deadline
//! ```
//!
//! Processing is synchronous. Alarms produced by a frame are returned to the
//! caller, which reports them before handing over the next frame.

use crate::aggregator::{EventAggregator, EventNaming, SnapshotWriter};
use crate::config::RecorderSettings;
use crate::detection::FrameInput;
use crate::reporter::Alarm;
use crate::segment::{ActiveSegments, SegmentRecorder, VideoSink};
use crate::trigger::ConsecutiveCounters;
use crate::type_resolver::resolve_type;
use chrono::{DateTime, Local};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything the recorder knows about one channel.
#[derive(Default)]
pub struct ChannelState {
    pub(crate) recorder: SegmentRecorder,
    pub(crate) counters: ConsecutiveCounters,
    pub(crate) events: EventAggregator,
    /// Video shared by every event of the open (or just closed) segment
    pub(crate) pending_video_path: Option<PathBuf>,
}

impl ChannelState {
    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn pending_video_path(&self) -> Option<&PathBuf> {
        self.pending_video_path.as_ref()
    }
}

/// Registry of channel states plus the collaborators they drive.
pub struct ChannelRegistry {
    settings: Arc<RecorderSettings>,
    sink: Arc<dyn VideoSink>,
    snapshots: Arc<dyn SnapshotWriter>,
    active: ActiveSegments,
    channels: Mutex<HashMap<i32, Arc<Mutex<ChannelState>>>>,
}

impl ChannelRegistry {
    pub fn new(
        settings: Arc<RecorderSettings>,
        sink: Arc<dyn VideoSink>,
        snapshots: Arc<dyn SnapshotWriter>,
        active: ActiveSegments,
    ) -> Self {
        Self {
            settings,
            sink,
            snapshots,
            active,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_segments(&self) -> &ActiveSegments {
        &self.active
    }

    /// Number of channels seen so far.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// State of a channel, created on first use.
    ///
    /// The registry lock is held only for the lookup.
    pub fn channel(&self, channel: i32) -> Arc<Mutex<ChannelState>> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel)
            .or_insert_with(|| {
                debug!(channel, "Creating channel state");
                Arc::new(Mutex::new(ChannelState::default()))
            })
            .clone()
    }

    /// Process one frame at the current time.
    pub fn process_frame(&self, input: &FrameInput) -> Vec<Alarm> {
        self.process_frame_at(input, Instant::now(), Local::now())
    }

    /// Process one frame. `now` drives segment deadlines, `wall` names files
    /// and stamps alarms.
    pub fn process_frame_at(
        &self,
        input: &FrameInput,
        now: Instant,
        wall: DateTime<Local>,
    ) -> Vec<Alarm> {
        counter!("recorder_frames_processed_total").increment(1);

        let channel = input.channel;
        let handle = self.channel(channel);
        let mut guard = handle.lock();
        let state = &mut *guard;

        let rules = &self.settings.trigger;
        let candidates = rules.candidates(&input.detections);
        let fired = state
            .counters
            .observe(rules, &candidates, state.events.suppressed());

        let mut alarms = Vec::new();

        if !fired.is_empty() {
            info!(
                channel,
                fired = ?fired,
                counters = ?state.counters.snapshot(),
                "Trigger fired"
            );
            alarms.extend(self.on_fire(channel, state, input, &fired, now, &wall));
        }

        if state.recorder.is_recording() {
            state.recorder.append(&input.frame);
            if state.recorder.is_due(now) {
                alarms.extend(self.close_segment(channel, state));
            }
        }

        alarms
    }

    fn on_fire(
        &self,
        channel: i32,
        state: &mut ChannelState,
        input: &FrameInput,
        fired: &[i32],
        now: Instant,
        wall: &DateTime<Local>,
    ) -> Vec<Alarm> {
        let resolved_type = resolve_type(&self.settings.type_policy, &input.detections);
        let naming = EventNaming::new(&self.settings.save_dir, channel, wall, resolved_type);
        let datetime = wall.format("%Y-%m-%d %H:%M:%S").to_string();

        if state.recorder.is_recording() {
            state.events.record(
                &naming,
                self.snapshots.as_ref(),
                &input.frame.image,
                fired,
                &datetime,
            );
            return Vec::new();
        }

        let video_path = naming.video_path();
        let opened = state.recorder.open(
            self.sink.as_ref(),
            &self.active,
            &video_path,
            &input.frame,
            now,
            self.settings.record_duration,
        );
        state.events.reset();

        match opened {
            Ok(_) => {
                state.pending_video_path = Some(video_path.clone());
                counter!("recorder_segments_opened_total").increment(1);
                info!(
                    channel,
                    video = %video_path.display(),
                    classes = ?fired,
                    resolved_type,
                    "Segment started"
                );
                state.events.record(
                    &naming,
                    self.snapshots.as_ref(),
                    &input.frame.image,
                    fired,
                    &datetime,
                );
                Vec::new()
            }
            Err(e) => {
                warn!(
                    channel,
                    video = %video_path.display(),
                    error = %e,
                    "Failed to open segment writer, reporting without video"
                );
                EventAggregator::bypass(
                    channel,
                    &naming,
                    self.snapshots.as_ref(),
                    &input.frame.image,
                    fired,
                    &datetime,
                )
            }
        }
    }

    fn close_segment(&self, channel: i32, state: &mut ChannelState) -> Vec<Alarm> {
        let closed = state.recorder.close(&self.active);
        let Some(video_path) = state.pending_video_path.clone().or(closed) else {
            state.events.reset();
            return Vec::new();
        };

        let alarms = state.events.flush(channel, &video_path);
        state.events.reset();
        alarms
    }

    /// Close a channel's open segment, if any, and return its alarms.
    ///
    /// Used on shutdown; best-effort like everything else on that path.
    pub fn close_channel(&self, channel: i32) -> Vec<Alarm> {
        let handle = {
            let channels = self.channels.lock();
            match channels.get(&channel) {
                Some(handle) => handle.clone(),
                None => return Vec::new(),
            }
        };

        let mut guard = handle.lock();
        let state = &mut *guard;
        if !state.recorder.is_recording() {
            return Vec::new();
        }
        info!(channel, "Closing open segment on shutdown");
        self.close_segment(channel, state)
    }
}
