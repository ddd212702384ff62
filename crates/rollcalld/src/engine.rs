use crate::config::Config;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use rollcall_core::pipeline::EnrollSample;
use rollcall_core::worker::{FrameQueue, Resequencer};
use rollcall_core::{
    Analyzer, ArcfaceExtractor, AttendanceRecorder, DecisionEngine, EmbeddingExtractor, FaceLocator,
    Frame, FrameAnalysis, FrameSource, ModelManifest, ScrfdLocator, ServiceHealth, Session,
    SessionWindow, SharedGallery,
};
use rollcall_hw::camera::CaptureSettings;
use rollcall_hw::{Camera, StillsSource};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Enrollment requests allowed to wait for a worker.
const REQUEST_BACKLOG: usize = 4;
/// Consecutive capture failures before the capture thread gives up.
const MAX_CAPTURE_ERRORS: u32 = 50;
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("frame source unavailable: {0}")]
    Source(String),
    #[error("detector error: {0}")]
    Detector(#[from] rollcall_core::detector::DetectorError),
    #[error("extractor error: {0}")]
    Extractor(#[from] rollcall_core::extractor::ExtractionError),
    #[error("face locator failed: {0}")]
    LocatorFailed(String),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("too many enrollment requests in flight")]
    Busy,
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the analysis workers.
enum EngineRequest {
    Enroll {
        frame: Frame,
        reply: oneshot::Sender<Result<EnrollSample, EngineError>>,
    },
}

/// What the decision thread learns about each capture sequence number.
enum Stage {
    Analyzed(u64, FrameAnalysis),
    /// Evicted from the queue before any worker saw it.
    Skipped(u64),
}

/// Counters shared between the pipeline threads and the status call.
#[derive(Debug, Default)]
struct EngineStats {
    frames_captured: AtomicU64,
    frames_analyzed: AtomicU64,
    live_tracks: AtomicUsize,
    degraded: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub health: ServiceHealth,
    pub frames_captured: u64,
    pub frames_analyzed: u64,
    pub frames_dropped: u64,
    pub queue_len: usize,
    pub live_tracks: usize,
}

/// Pipeline shape, independent of where frames and models come from.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub queue_depth: usize,
    /// Maps a frame timestamp to its attendance window.
    pub window_for: fn(u64) -> SessionWindow,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_depth: 4,
            window_for: SessionWindow::daily_local,
        }
    }
}

/// Clone-safe handle to the running pipeline.
#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<EngineRequest>,
    queue: Arc<FrameQueue<Frame>>,
    stats: Arc<EngineStats>,
    shutdown: Arc<AtomicBool>,
    /// Dropped on shutdown; workers watch for the disconnect.
    stop: Arc<Mutex<Option<Sender<()>>>>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl EngineHandle {
    /// Find and embed the most confident face in `frame` on an analysis worker.
    pub async fn enroll(&self, frame: Frame) -> Result<EnrollSample, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(EngineRequest::Enroll { frame, reply: reply_tx })
            .map_err(|e| match e {
                TrySendError::Full(_) => EngineError::Busy,
                TrySendError::Disconnected(_) => EngineError::ChannelClosed,
            })?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn status(&self) -> StatusSnapshot {
        let health = if self.stats.degraded.load(Ordering::Relaxed) {
            ServiceHealth::Degraded
        } else {
            ServiceHealth::Healthy
        };
        StatusSnapshot {
            health,
            frames_captured: self.stats.frames_captured.load(Ordering::Relaxed),
            frames_analyzed: self.stats.frames_analyzed.load(Ordering::Relaxed),
            frames_dropped: self.queue.dropped(),
            queue_len: self.queue.len(),
            live_tracks: self.stats.live_tracks.load(Ordering::Relaxed),
        }
    }

    /// Ask every pipeline thread to stop. Frames already queued are still analyzed.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Block until every pipeline thread has exited.
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for thread in threads {
            let name = thread.thread().name().unwrap_or("?").to_string();
            if thread.join().is_err() {
                tracing::error!(thread = %name, "pipeline thread panicked");
            }
        }
    }
}

/// Spawn the production pipeline: camera (or still replay), SCRFD + ArcFace
/// workers, and the decision thread.
///
/// Models are loaded up front, one pair per worker, so a bad asset fails
/// startup instead of the first frame.
pub fn spawn_engine(
    config: &Config,
    manifest: &ModelManifest,
    gallery: SharedGallery,
    recorder: AttendanceRecorder,
) -> Result<(EngineHandle, mpsc::UnboundedReceiver<ServiceHealth>), EngineError> {
    let mut analyzers = Vec::with_capacity(config.worker_count);
    for _ in 0..config.worker_count {
        let locator = ScrfdLocator::load(&manifest.detector, config.locator_config())?;
        let extractor = ArcfaceExtractor::load(&manifest.extractor, 2)?;
        analyzers.push(Analyzer::new(locator, extractor, config.min_detection_confidence));
    }
    tracing::info!(workers = analyzers.len(), "analysis models loaded");

    let session = Session::new(
        DecisionEngine::new(config.decision, gallery),
        recorder,
        config.degraded_after,
    );
    let settings = PipelineSettings {
        queue_depth: config.queue_depth,
        ..PipelineSettings::default()
    };

    match &config.replay_dir {
        Some(dir) => {
            let dir = dir.clone();
            let interval_ms = config.replay_interval_ms;
            spawn_pipeline(
                move || StillsSource::from_dir(&dir, interval_ms).map_err(|e| e.to_string()),
                analyzers,
                session,
                settings,
            )
        }
        None => {
            let device = config.camera_device.clone();
            let capture = CaptureSettings {
                width: config.capture_width,
                height: config.capture_height,
                ..CaptureSettings::default()
            };
            let warmup = config.warmup_frames;
            spawn_pipeline(
                move || {
                    let mut camera = Camera::open(&device, capture).map_err(|e| e.to_string())?;
                    camera.warm_up(warmup);
                    Ok(camera)
                },
                analyzers,
                session,
                settings,
            )
        }
    }
}

/// Spawn capture, one thread per analyzer, and the decision thread.
///
/// `open_source` runs on the capture thread, since some sources cannot move
/// between threads; its failure is reported back before this returns.
pub fn spawn_pipeline<S, F, L, E>(
    open_source: F,
    analyzers: Vec<Analyzer<L, E>>,
    session: Session,
    settings: PipelineSettings,
) -> Result<(EngineHandle, mpsc::UnboundedReceiver<ServiceHealth>), EngineError>
where
    S: FrameSource,
    F: FnOnce() -> Result<S, String> + Send + 'static,
    L: FaceLocator + Send + 'static,
    E: EmbeddingExtractor + Send + 'static,
{
    let queue = Arc::new(FrameQueue::new(settings.queue_depth));
    let stats = Arc::new(EngineStats::default());
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut threads = Vec::new();

    // One token per queued frame; capacity matches the queue so tokens never
    // fall behind frames.
    let (ready_tx, ready_rx) = channel::bounded::<()>(queue.capacity());
    let (stage_tx, stage_rx) = channel::unbounded::<Stage>();

    // Capture
    let (opened_tx, opened_rx) = std::sync::mpsc::sync_channel::<Result<(), String>>(1);
    {
        let queue = Arc::clone(&queue);
        let stats = Arc::clone(&stats);
        let shutdown = Arc::clone(&shutdown);
        let gaps = stage_tx.clone();
        threads.push(
            std::thread::Builder::new()
                .name("rollcall-capture".into())
                .spawn(move || match open_source() {
                    Ok(source) => {
                        let _ = opened_tx.send(Ok(()));
                        capture_loop(source, &queue, &ready_tx, &gaps, &stats, &shutdown);
                    }
                    Err(reason) => {
                        let _ = opened_tx.send(Err(reason));
                    }
                })?,
        );
    }
    match opened_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => return Err(EngineError::Source(reason)),
        Err(_) => return Err(EngineError::Source("capture thread exited during open".into())),
    }

    // Analysis
    let (request_tx, request_rx) = channel::bounded::<EngineRequest>(REQUEST_BACKLOG);
    let (stop_tx, stop_rx) = channel::bounded::<()>(0);
    for (index, analyzer) in analyzers.into_iter().enumerate() {
        let channels = WorkerChannels {
            queue: Arc::clone(&queue),
            ready: ready_rx.clone(),
            requests: request_rx.clone(),
            stop: stop_rx.clone(),
            results: stage_tx.clone(),
        };
        threads.push(
            std::thread::Builder::new()
                .name(format!("rollcall-worker-{index}"))
                .spawn(move || worker_loop(analyzer, channels))?,
        );
    }
    drop(stage_tx);

    // Decision
    let (health_tx, health_rx) = mpsc::unbounded_channel();
    {
        let stats = Arc::clone(&stats);
        threads.push(
            std::thread::Builder::new()
                .name("rollcall-decision".into())
                .spawn(move || decision_loop(session, stage_rx, health_tx, &stats, settings.window_for))?,
        );
    }

    let handle = EngineHandle {
        tx: request_tx,
        queue,
        stats,
        shutdown,
        stop: Arc::new(Mutex::new(Some(stop_tx))),
        threads: Arc::new(Mutex::new(threads)),
    };
    Ok((handle, health_rx))
}

fn capture_loop<S: FrameSource>(
    mut source: S,
    queue: &FrameQueue<Frame>,
    ready: &Sender<()>,
    gaps: &Sender<Stage>,
    stats: &EngineStats,
    shutdown: &AtomicBool,
) {
    tracing::info!("capture thread started");
    let mut failures = 0u32;
    while !shutdown.load(Ordering::SeqCst) {
        match source.next_frame() {
            Ok(Some(frame)) => {
                failures = 0;
                stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                let (_, evicted) = queue.push(frame);
                if let Some((seq, frame)) = evicted {
                    tracing::debug!(seq, frame = frame.sequence, "analysis backlog full; dropped oldest frame");
                    let _ = gaps.send(Stage::Skipped(seq));
                }
                // A full token channel already covers every queued frame
                let _ = ready.try_send(());
            }
            Ok(None) => {
                tracing::info!("frame source exhausted");
                break;
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_CAPTURE_ERRORS {
                    tracing::error!(error = %e, failures, "capture failing persistently; stopping");
                    break;
                }
                tracing::warn!(error = %e, "frame capture failed");
                std::thread::sleep(CAPTURE_RETRY_DELAY);
            }
        }
    }
    tracing::info!("capture thread exiting");
}

struct WorkerChannels {
    queue: Arc<FrameQueue<Frame>>,
    /// Disconnects when capture ends.
    ready: Receiver<()>,
    requests: Receiver<EngineRequest>,
    /// Disconnects on shutdown.
    stop: Receiver<()>,
    results: Sender<Stage>,
}

enum WorkerEvent {
    Request(Option<EngineRequest>),
    /// A frame was queued, or `false` once capture has ended.
    Frame(bool),
    Stop,
}

fn worker_loop<L: FaceLocator, E: EmbeddingExtractor>(mut analyzer: Analyzer<L, E>, channels: WorkerChannels) {
    tracing::debug!("analysis worker started");
    let WorkerChannels {
        queue,
        mut ready,
        requests,
        stop,
        results,
    } = channels;
    let mut results = Some(results);

    loop {
        let event = channel::select! {
            recv(requests) -> request => WorkerEvent::Request(request.ok()),
            recv(ready) -> token => WorkerEvent::Frame(token.is_ok()),
            recv(stop) -> _ => WorkerEvent::Stop,
        };
        match event {
            WorkerEvent::Request(Some(EngineRequest::Enroll { frame, reply })) => {
                let _ = reply.send(enroll_guarded(&mut analyzer, &frame));
            }
            WorkerEvent::Request(None) => break,
            WorkerEvent::Frame(true) => {
                if let Some((seq, frame)) = queue.pop() {
                    let analysis = analyze_guarded(&mut analyzer, seq, frame);
                    deliver(&mut results, seq, analysis);
                }
            }
            WorkerEvent::Frame(false) => {
                // Live stream finished; stay up for enrollment until shutdown
                drain(&mut analyzer, &queue, &mut results);
                results = None;
                ready = channel::never();
            }
            WorkerEvent::Stop => {
                drain(&mut analyzer, &queue, &mut results);
                break;
            }
        }
    }
    tracing::debug!("analysis worker exiting");
}

fn drain<L: FaceLocator, E: EmbeddingExtractor>(
    analyzer: &mut Analyzer<L, E>,
    queue: &FrameQueue<Frame>,
    results: &mut Option<Sender<Stage>>,
) {
    while results.is_some() {
        let Some((seq, frame)) = queue.pop() else {
            break;
        };
        let analysis = analyze_guarded(analyzer, seq, frame);
        deliver(results, seq, analysis);
    }
}

fn deliver(results: &mut Option<Sender<Stage>>, seq: u64, analysis: FrameAnalysis) {
    let Some(sink) = results.as_ref() else {
        return;
    };
    if sink.send(Stage::Analyzed(seq, analysis)).is_err() {
        tracing::warn!("decision thread gone; discarding analysis");
        *results = None;
    }
}

/// A panic inside the models costs one frame, not the worker.
fn analyze_guarded<L: FaceLocator, E: EmbeddingExtractor>(
    analyzer: &mut Analyzer<L, E>,
    seq: u64,
    frame: Frame,
) -> FrameAnalysis {
    let timestamp_ms = frame.timestamp_ms;
    match panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(frame))) {
        Ok(analysis) => analysis,
        Err(_) => {
            tracing::error!(seq, timestamp_ms, "frame analysis panicked; frame skipped");
            FrameAnalysis::DetectorUnavailable {
                timestamp_ms,
                reason: "frame analysis panicked".into(),
            }
        }
    }
}

fn enroll_guarded<L: FaceLocator, E: EmbeddingExtractor>(
    analyzer: &mut Analyzer<L, E>,
    frame: &Frame,
) -> Result<EnrollSample, EngineError> {
    match panic::catch_unwind(AssertUnwindSafe(|| analyzer.enroll_sample(frame))) {
        Ok(Ok(Some(sample))) => Ok(sample),
        Ok(Ok(None)) => Err(EngineError::NoFaceDetected),
        Ok(Err(reason)) => Err(EngineError::LocatorFailed(reason)),
        Err(_) => {
            tracing::error!("enrollment analysis panicked");
            Err(EngineError::LocatorFailed("enrollment analysis panicked".into()))
        }
    }
}

fn decision_loop(
    mut session: Session,
    stages: Receiver<Stage>,
    health_tx: mpsc::UnboundedSender<ServiceHealth>,
    stats: &EngineStats,
    window_for: fn(u64) -> SessionWindow,
) {
    tracing::info!("decision thread started");
    let mut reorder = Resequencer::new();
    for stage in stages {
        let released = match stage {
            Stage::Analyzed(seq, analysis) => reorder.push(seq, analysis),
            Stage::Skipped(seq) => reorder.skip(seq),
        };
        for analysis in released {
            let window = window_for(analysis.timestamp_ms());
            let report = session.apply(analysis, &window);

            stats.frames_analyzed.fetch_add(1, Ordering::Relaxed);
            stats
                .live_tracks
                .store(session.engine().tracks().count(), Ordering::Relaxed);
            if let Some(health) = report.health_change {
                stats
                    .degraded
                    .store(health == ServiceHealth::Degraded, Ordering::Relaxed);
                let _ = health_tx.send(health);
            }
        }
    }
    if reorder.backlog() > 0 {
        tracing::warn!(backlog = reorder.backlog(), "analyses left unreleased at shutdown");
    }
    tracing::info!("decision thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::detector::DetectorError;
    use rollcall_core::extractor::ExtractionError;
    use rollcall_core::{BoundingBox, DecisionConfig, Embedding, FaceRegion, Gallery, GalleryConfig, PersonId, Reference};
    use std::convert::Infallible;

    /// Yields `remaining` identical frames 100 ms apart.
    struct SyntheticSource {
        remaining: u32,
        sequence: u32,
    }

    impl FrameSource for SyntheticSource {
        type Error = Infallible;

        fn next_frame(&mut self) -> Result<Option<Frame>, Infallible> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            let sequence = self.sequence;
            self.sequence += 1;
            Ok(Some(frame(sequence, 1_000 + u64::from(sequence) * 100)))
        }
    }

    /// A `SyntheticSource` that sleeps before each frame.
    struct PacedSource(SyntheticSource);

    impl FrameSource for PacedSource {
        type Error = Infallible;

        fn next_frame(&mut self) -> Result<Option<Frame>, Infallible> {
            std::thread::sleep(Duration::from_millis(1));
            self.0.next_frame()
        }
    }

    /// One centered face per frame, or a failure when `broken`.
    struct FixedLocator {
        broken: bool,
    }

    impl FaceLocator for FixedLocator {
        fn locate(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, DetectorError> {
            if self.broken {
                return Err(DetectorError::Unavailable("session lost".into()));
            }
            Ok(vec![FaceRegion {
                timestamp_ms: frame.timestamp_ms,
                bbox: BoundingBox::new(10.0, 10.0, 40.0, 40.0),
                confidence: 0.9,
                landmarks: None,
            }])
        }
    }

    /// Like `FixedLocator`, but panics on one frame sequence number.
    struct PanickingLocator {
        panic_at: u32,
    }

    impl FaceLocator for PanickingLocator {
        fn locate(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, DetectorError> {
            if frame.sequence == self.panic_at {
                panic!("corrupt model output");
            }
            FixedLocator { broken: false }.locate(frame)
        }
    }

    struct FixedExtractor;

    impl EmbeddingExtractor for FixedExtractor {
        fn embed(&mut self, _frame: &Frame, region: &FaceRegion) -> Result<Embedding, ExtractionError> {
            Ok(Embedding::new(vec![1.0, 0.0, 0.0], region.timestamp_ms))
        }
    }

    fn frame(sequence: u32, timestamp_ms: u64) -> Frame {
        Frame {
            data: vec![128u8; 64 * 64],
            width: 64,
            height: 64,
            timestamp_ms,
            sequence,
        }
    }

    fn test_window(_ts: u64) -> SessionWindow {
        SessionWindow::new("test-window")
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            queue_depth: 32,
            window_for: test_window,
        }
    }

    fn session(recorder: AttendanceRecorder, degraded_after: u32) -> Session {
        let gallery = SharedGallery::new(Gallery::new(GalleryConfig::default()));
        gallery
            .enroll(
                &PersonId::from("alice"),
                Reference::new(Embedding::new(vec![1.0, 0.0, 0.0], 0), None),
            )
            .unwrap();
        let config = DecisionConfig {
            match_threshold: 0.3,
            confirm_run: 3,
            holdout_run: 2,
            track_timeout_ms: 5_000,
            max_displacement_px: 100.0,
        };
        Session::new(DecisionEngine::new(config, gallery), recorder, degraded_after)
    }

    fn analyzers(count: usize, broken: bool) -> Vec<Analyzer<FixedLocator, FixedExtractor>> {
        (0..count)
            .map(|_| Analyzer::new(FixedLocator { broken }, FixedExtractor, 0.5))
            .collect()
    }

    #[test]
    fn test_pipeline_records_attendance_once() {
        let (recorder, mut events) = AttendanceRecorder::channel();
        let (handle, _health) = spawn_pipeline(
            || Ok(SyntheticSource { remaining: 12, sequence: 0 }),
            analyzers(2, false),
            session(recorder, 10),
            settings(),
        )
        .unwrap();

        let event = events.blocking_recv().unwrap();
        assert_eq!(event.person_id.as_str(), "alice");
        assert_eq!(event.window.as_str(), "test-window");

        handle.shutdown();
        handle.join();
        assert!(events.try_recv().is_err());
        assert!(handle.status().frames_analyzed >= 3);
    }

    #[test]
    fn test_pipeline_survives_analysis_panic() {
        let (recorder, mut events) = AttendanceRecorder::channel();
        let (handle, _health) = spawn_pipeline(
            || Ok(SyntheticSource { remaining: 12, sequence: 0 }),
            vec![Analyzer::new(PanickingLocator { panic_at: 1 }, FixedExtractor, 0.5)],
            session(recorder, 10),
            settings(),
        )
        .unwrap();

        // Three matches are needed and only frame 0 precedes the panic, so
        // the event proves later frames were still analyzed and released.
        let event = events.blocking_recv().unwrap();
        assert_eq!(event.person_id.as_str(), "alice");

        handle.shutdown();
        handle.join();
        assert!(handle.status().frames_analyzed >= 4);
    }

    #[test]
    fn test_pipeline_with_single_slot_queue() {
        let (recorder, mut events) = AttendanceRecorder::channel();
        let (handle, _health) = spawn_pipeline(
            || Ok(PacedSource(SyntheticSource { remaining: 200, sequence: 0 })),
            analyzers(2, false),
            session(recorder, 10),
            PipelineSettings {
                queue_depth: 1,
                window_for: test_window,
            },
        )
        .unwrap();

        let event = events.blocking_recv().unwrap();
        assert_eq!(event.person_id.as_str(), "alice");

        handle.shutdown();
        handle.join();
        let status = handle.status();
        assert!(status.frames_analyzed + status.frames_dropped <= status.frames_captured);
    }

    #[test]
    fn test_pipeline_reports_degraded_detector() {
        let (recorder, _events) = AttendanceRecorder::channel();
        let (handle, mut health) = spawn_pipeline(
            || Ok(SyntheticSource { remaining: 5, sequence: 0 }),
            analyzers(1, true),
            session(recorder, 3),
            settings(),
        )
        .unwrap();

        assert_eq!(health.blocking_recv(), Some(ServiceHealth::Degraded));
        handle.shutdown();
        handle.join();
        assert_eq!(handle.status().health, ServiceHealth::Degraded);
    }

    #[test]
    fn test_source_open_failure_is_reported() {
        let result = spawn_pipeline::<SyntheticSource, _, _, _>(
            || Err("no such device".to_string()),
            analyzers(1, false),
            session(AttendanceRecorder::new(), 10),
            settings(),
        );
        assert!(matches!(result, Err(EngineError::Source(reason)) if reason == "no such device"));
    }

    #[tokio::test]
    async fn test_enroll_runs_on_worker() {
        let (handle, _health) = spawn_pipeline(
            || Ok(SyntheticSource { remaining: 0, sequence: 0 }),
            analyzers(1, false),
            session(AttendanceRecorder::new(), 10),
            settings(),
        )
        .unwrap();

        let sample = handle.enroll(frame(0, 42)).await.unwrap();
        assert_eq!(sample.embedding.values, vec![1.0, 0.0, 0.0]);
        assert!((sample.region.confidence - 0.9).abs() < 1e-6);

        handle.shutdown();
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_enroll_without_face() {
        let (handle, _health) = spawn_pipeline(
            || Ok(SyntheticSource { remaining: 0, sequence: 0 }),
            analyzers(1, true),
            session(AttendanceRecorder::new(), 10),
            settings(),
        )
        .unwrap();

        let result = handle.enroll(frame(0, 42)).await;
        assert!(matches!(result, Err(EngineError::LocatorFailed(_))));

        handle.shutdown();
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap();
    }
}
