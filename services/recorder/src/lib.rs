//! Event Recorder
//!
//! Event-triggered video recording and alarm reporting for multi-channel
//! detection streams. Every channel carries decoded frames together with the
//! object detections found on them. When a class of interest stays in view
//! long enough, the recorder captures a snapshot, records a fixed-length video
//! segment and, once the segment closes, posts one alarm per triggering class
//! to a remote HTTP endpoint. A background sweeper keeps the storage directory
//! within an age and size budget.
//!
//! ## Features
//!
//! - **Per-class Debouncing**: Consecutive-frame thresholds, globally or per class
//! - **Segment Sharing**: Classes firing while a segment is open join it instead
//!   of starting a new one
//! - **Aggregated Alarms**: One report per class, all pointing at the same video
//! - **Storage Retention**: Age and capacity limits that never touch a segment
//!   still being written
//!
//! ## Architecture
//!
//! ```text
//! stdin (NDJSON)
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────────────────────┐
//! │ Frame        │───▶│ Dispatcher   │───▶│ Channel worker (per channel) │
//! │ Envelopes    │    │              │    │  trigger -> segment -> events│
//! └──────────────┘    └──────────────┘    └──────────────────────────────┘
//!                                              │               │
//!                                              ▼               ▼
//!                                       ┌──────────────┐ ┌──────────────┐
//!                                       │ ffmpeg       │ │ Alarm        │
//!                                       │ + JPEG       │ │ Reporter     │──▶ HTTP
//!                                       └──────────────┘ └──────────────┘
//!                                              │
//!                                              ▼
//!                                       ┌──────────────┐
//!                                       │ Retention    │
//!                                       │ Sweeper      │
//!                                       └──────────────┘
//! ```

pub mod aggregator;
pub mod channel;
pub mod config;
pub mod detection;
pub mod endpoint;
pub mod ingest;
pub mod reporter;
pub mod retention;
pub mod segment;
pub mod trigger;
pub mod type_resolver;
pub mod worker;

pub use aggregator::{EventAggregator, EventNaming, JpegSnapshotWriter, SnapshotWriter};
pub use channel::{ChannelRegistry, ChannelState};
pub use config::{Config, Settings};
pub use detection::{Detection, Frame, FrameInput, FrameRate};
pub use endpoint::ServerEndpoint;
pub use reporter::{Alarm, AlarmReporter, HttpAlarmTransport, ReportOutcome};
pub use retention::{RetentionHandle, RetentionPolicy, RetentionService};
pub use segment::{ActiveSegments, FfmpegSink, VideoSink};
pub use trigger::{Thresholds, TriggerRules};
pub use type_resolver::TypePolicy;
pub use worker::Dispatcher;
