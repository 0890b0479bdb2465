//! Per-channel workers.
//!
//! Each channel gets its own bounded queue and task, so frames of one channel
//! are processed strictly in order while channels run in parallel. A worker
//! finishes reporting the alarms of a frame before it takes the next one.

use crate::channel::ChannelRegistry;
use crate::detection::FrameInput;
use crate::reporter::{Alarm, AlarmReporter};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors raised when handing a frame to a worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Worker for channel {0} is gone")]
    WorkerGone(i32),
}

struct ChannelWorker {
    tx: mpsc::Sender<FrameInput>,
    join: JoinHandle<()>,
}

/// Routes frames to per-channel workers, spawning them on demand.
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    reporter: Arc<AlarmReporter>,
    queue_size: usize,
    token: CancellationToken,
    workers: HashMap<i32, ChannelWorker>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        reporter: Arc<AlarmReporter>,
        queue_size: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            reporter,
            queue_size: queue_size.max(1),
            token,
            workers: HashMap::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a frame for its channel. Waits while the queue is full.
    pub async fn dispatch(&mut self, input: FrameInput) -> Result<(), DispatchError> {
        if self.token.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        let channel = input.channel;
        let worker = self.workers.entry(channel).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.queue_size);
            let join = tokio::spawn(run_channel_worker(
                channel,
                rx,
                self.registry.clone(),
                self.reporter.clone(),
                self.token.clone(),
            ));
            info!(channel, "Channel worker started");
            ChannelWorker { tx, join }
        });

        worker
            .tx
            .send(input)
            .await
            .map_err(|_| DispatchError::WorkerGone(channel))
    }

    /// Close every queue and wait for the workers.
    ///
    /// Frames already queued are still processed unless the token was
    /// cancelled. Open segments are closed and their alarms reported.
    pub async fn shutdown(self) {
        let count = self.workers.len();
        info!(workers = count, "Stopping channel workers");

        for (channel, worker) in self.workers {
            drop(worker.tx);
            if let Err(e) = worker.join.await {
                error!(channel, error = %e, "Channel worker failed");
            }
        }

        info!(workers = count, "Channel workers stopped");
    }
}

async fn run_channel_worker(
    channel: i32,
    mut rx: mpsc::Receiver<FrameInput>,
    registry: Arc<ChannelRegistry>,
    reporter: Arc<AlarmReporter>,
    token: CancellationToken,
) {
    loop {
        let input = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(channel, "Channel worker cancelled");
                break;
            }
            next = rx.recv() => match next {
                Some(input) => input,
                None => break,
            },
        };

        let registry = registry.clone();
        let alarms = match tokio::task::spawn_blocking(move || registry.process_frame(&input)).await {
            Ok(alarms) => alarms,
            Err(e) => {
                error!(channel, error = %e, "Frame processing panicked");
                continue;
            }
        };

        report_all(&reporter, &alarms).await;
    }

    let closing = registry.clone();
    match tokio::task::spawn_blocking(move || closing.close_channel(channel)).await {
        Ok(alarms) => report_all(&reporter, &alarms).await,
        Err(e) => warn!(channel, error = %e, "Failed to close channel on shutdown"),
    }
}

async fn report_all(reporter: &AlarmReporter, alarms: &[Alarm]) {
    for alarm in alarms {
        reporter.report(alarm).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::FakeSnapshots;
    use crate::config::RecorderSettings;
    use crate::detection::{Detection, Frame};
    use crate::endpoint::ServerEndpoint;
    use crate::reporter::{
        AlarmPayload, AlarmTransport, FileLinker, ReportFields, TransportError, VideoUrlField,
    };
    use crate::segment::tests::FakeSink;
    use crate::segment::ActiveSegments;
    use crate::trigger::{Thresholds, TriggerRules};
    use async_trait::async_trait;
    use image::RgbImage;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CollectingTransport {
        sent: Mutex<Vec<AlarmPayload>>,
    }

    #[async_trait]
    impl AlarmTransport for CollectingTransport {
        async fn post_json(
            &self,
            _endpoint: &ServerEndpoint,
            payload: &AlarmPayload,
        ) -> Result<u16, TransportError> {
            self.sent.lock().push(payload.clone());
            Ok(200)
        }
    }

    fn dispatcher(
        dir: &tempfile::TempDir,
        token: CancellationToken,
    ) -> (Dispatcher, Arc<CollectingTransport>) {
        let settings = RecorderSettings {
            save_dir: dir.path().to_path_buf(),
            record_duration: Duration::from_secs(3600),
            trigger: TriggerRules::new([1], Thresholds::new(1)),
            ..RecorderSettings::default()
        };
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(settings),
            Arc::new(FakeSink::default()),
            Arc::new(FakeSnapshots::default()),
            ActiveSegments::new(),
        ));
        let transport = Arc::new(CollectingTransport::default());
        let reporter = Arc::new(AlarmReporter::new(
            Some(ServerEndpoint::parse("http://127.0.0.1:9000/alarm").unwrap()),
            ReportFields::default(),
            VideoUrlField::SafetyUrl,
            FileLinker::new(dir.path(), None),
            transport.clone(),
        ));
        (Dispatcher::new(registry, reporter, 4, token), transport)
    }

    fn frame(channel: i32, classes: &[i32]) -> FrameInput {
        FrameInput::new(
            channel,
            Frame::new(RgbImage::new(8, 8)),
            classes.iter().copied().map(Detection::new).collect(),
        )
    }

    #[tokio::test]
    async fn test_workers_spawned_per_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dispatcher, transport) = dispatcher(&dir, CancellationToken::new());

        dispatcher.dispatch(frame(0, &[1])).await.unwrap();
        dispatcher.dispatch(frame(0, &[1])).await.unwrap();
        dispatcher.dispatch(frame(5, &[2])).await.unwrap();
        assert_eq!(dispatcher.worker_count(), 2);

        dispatcher.shutdown().await;

        // Channel 0 had an open segment, closed and reported on shutdown
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].alarm_type, 1);
        assert!(sent[0].safety_url.ends_with(".mp4"));
    }

    #[tokio::test]
    async fn test_dispatch_rejected_after_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let (mut dispatcher, _transport) = dispatcher(&dir, token.clone());

        token.cancel();
        assert!(matches!(
            dispatcher.dispatch(frame(0, &[1])).await,
            Err(DispatchError::ShuttingDown)
        ));
        dispatcher.shutdown().await;
    }
}
