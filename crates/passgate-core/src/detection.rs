//! Frame-driven detection loop.
//!
//! One tokio task per loop pulls a frame, awaits the descriptor extractor,
//! matches every detected face and reports the outcome. At most one extractor
//! call is in flight. The loop owns the video source from `start` until it
//! exits and releases it on every exit path.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_ACCEPT_THRESHOLD};
use crate::source::{DescriptorExtractor, ExtractorError, SourceError, VideoSource};
use crate::types::{BoundingBox, DetectedFace, Frame, MatchResult, ProfileSet};

/// Roughly one display refresh at 60 Hz.
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);
const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("detection loop can only be started once (current state: {0:?})")]
    AlreadyStarted(LoopState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
    Matched,
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Distance below which a face is accepted as an enrolled identity.
    pub accept_threshold: f32,
    /// Pause between the end of one cycle and the start of the next.
    pub frame_interval: Duration,
    /// Upper bound on a single extractor call. `None` waits indefinitely.
    pub cycle_timeout: Option<Duration>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            cycle_timeout: Some(DEFAULT_CYCLE_TIMEOUT),
        }
    }
}

/// Per-face result of one cycle, for overlay rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceOutcome {
    pub bounding_box: BoundingBox,
    pub matched: bool,
    /// Display name of the accepted identity.
    pub name: Option<String>,
    pub distance: Option<f32>,
}

/// Handle to a detection loop.
///
/// Dropping the handle cancels a running loop.
pub struct DetectionLoop {
    config: LoopConfig,
    matcher: Arc<dyn Matcher>,
    state: Arc<Mutex<LoopState>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl DetectionLoop {
    pub fn new(config: LoopConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            matcher: Arc::new(EuclideanMatcher),
            state: Arc::new(Mutex::new(LoopState::Idle)),
            stop_tx,
            task: None,
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn state(&self) -> LoopState {
        *lock(&self.state)
    }

    /// Start polling `source`.
    ///
    /// `on_frame` sees the outcome of every completed cycle. `on_match` is
    /// called once, with the first accepted face in detection order, after
    /// which the loop is `Matched` and stops scheduling cycles.
    ///
    /// Must be called within a tokio runtime.
    pub fn start<M, F>(
        &mut self,
        source: Box<dyn VideoSource>,
        extractor: Arc<dyn DescriptorExtractor>,
        profiles: ProfileSet,
        on_match: M,
        on_frame: F,
    ) -> Result<(), LoopError>
    where
        M: FnOnce(MatchResult) + Send + 'static,
        F: Fn(&[FaceOutcome]) + Send + 'static,
    {
        // Guard first so a refused start still releases the source.
        let source = SourceGuard::new(source);

        {
            let mut state = lock(&self.state);
            if *state != LoopState::Idle {
                return Err(LoopError::AlreadyStarted(*state));
            }
            *state = LoopState::Running;
        }

        tracing::info!(
            profiles = profiles.len(),
            threshold = self.config.accept_threshold,
            "detection loop started"
        );

        let worker = Worker {
            config: self.config.clone(),
            matcher: Arc::clone(&self.matcher),
            extractor,
            profiles,
            state: Arc::clone(&self.state),
            on_match: Some(on_match),
            on_frame,
        };
        let stop_rx = self.stop_tx.subscribe();
        self.task = Some(tokio::spawn(worker.run(source, stop_rx)));
        Ok(())
    }

    /// Cancel the loop and wait for it to release the video source.
    ///
    /// Idempotent. An extractor call still in flight is dropped and its result
    /// discarded; once this returns `on_match` can no longer fire.
    pub async fn stop(&mut self) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, LoopState::Idle | LoopState::Running) {
                *state = LoopState::Stopped;
            }
        }
        self.stop_tx.send_replace(true);

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "detection task ended abnormally");
            }
            tracing::debug!("detection loop stopped");
        }
    }
}

impl Drop for DetectionLoop {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

fn lock(state: &Mutex<LoopState>) -> std::sync::MutexGuard<'_, LoopState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the video source exactly once, when dropped at the latest.
struct SourceGuard {
    source: Box<dyn VideoSource>,
    released: bool,
}

impl SourceGuard {
    fn new(source: Box<dyn VideoSource>) -> Self {
        Self { source, released: false }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.source.release();
            tracing::debug!("video source released");
        }
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

struct Worker<M, F> {
    config: LoopConfig,
    matcher: Arc<dyn Matcher>,
    extractor: Arc<dyn DescriptorExtractor>,
    profiles: ProfileSet,
    state: Arc<Mutex<LoopState>>,
    on_match: Option<M>,
    on_frame: F,
}

impl<M, F> Worker<M, F>
where
    M: FnOnce(MatchResult) + Send + 'static,
    F: Fn(&[FaceOutcome]) + Send + 'static,
{
    async fn run(mut self, mut source: SourceGuard, mut stop_rx: watch::Receiver<bool>) {
        let mut cycle: u64 = 0;

        loop {
            if *stop_rx.borrow() {
                break;
            }
            cycle += 1;

            let frame = tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                frame = source.source.next_frame() => frame,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(SourceError::Ended) => {
                    tracing::info!(cycle, "video stream ended");
                    self.mark_stopped();
                    break;
                }
                Err(e) => {
                    tracing::warn!(cycle, error = %e, "frame capture failed; retrying");
                    if !pause(&mut stop_rx, self.config.frame_interval).await {
                        break;
                    }
                    continue;
                }
            };

            let detections = tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                result = extract(self.extractor.as_ref(), self.config.cycle_timeout, &frame) => result,
            };

            // A result that resolved after stop was requested is discarded.
            if *stop_rx.borrow() {
                break;
            }

            let faces = detections.unwrap_or_else(|e| {
                tracing::warn!(cycle, error = %e, "detection cycle failed; treating as no detections");
                Vec::new()
            });

            let (outcomes, first_match) = self.evaluate(&faces);
            tracing::debug!(
                cycle,
                sequence = frame.sequence,
                faces = outcomes.len(),
                matched = first_match.is_some(),
                "cycle complete"
            );
            (self.on_frame)(&outcomes);

            if let Some(result) = first_match {
                if self.claim_match(result) {
                    tracing::info!(cycle, "detection loop matched");
                }
                break;
            }

            if !pause(&mut stop_rx, self.config.frame_interval).await {
                break;
            }
        }

        source.release();
    }

    fn mark_stopped(&self) {
        let mut state = lock(&self.state);
        if *state == LoopState::Running {
            *state = LoopState::Stopped;
        }
    }

    /// Match every face; the first accepted face in detection order wins.
    fn evaluate(&self, faces: &[DetectedFace]) -> (Vec<FaceOutcome>, Option<MatchResult>) {
        let mut first_match = None;
        let outcomes = faces
            .iter()
            .map(|face| {
                let result = self.matcher.find_best_match(
                    &face.descriptor,
                    &self.profiles,
                    self.config.accept_threshold,
                );
                let outcome = FaceOutcome {
                    bounding_box: face.bounding_box,
                    matched: result.is_some(),
                    name: result.as_ref().map(|r| r.profile.display_name.clone()),
                    distance: result.as_ref().map(|r| r.distance),
                };
                if first_match.is_none() {
                    first_match = result;
                }
                outcome
            })
            .collect();
        (outcomes, first_match)
    }

    /// Transition `Running -> Matched` and fire `on_match` under the state lock,
    /// so a concurrent `stop()` either happens-before (no callback) or after.
    fn claim_match(&mut self, result: MatchResult) -> bool {
        let mut state = lock(&self.state);
        if *state != LoopState::Running {
            return false;
        }
        *state = LoopState::Matched;
        if let Some(on_match) = self.on_match.take() {
            on_match(result);
        }
        true
    }
}

async fn extract(
    extractor: &dyn DescriptorExtractor,
    timeout: Option<Duration>,
    frame: &Frame,
) -> Result<Vec<DetectedFace>, ExtractorError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, extractor.detect(frame))
            .await
            .map_err(|_| ExtractorError::TimedOut(limit.as_millis()))?,
        None => extractor.detect(frame).await,
    }
}

/// Sleep between cycles. Returns `false` if the loop was stopped meanwhile.
async fn pause(stop_rx: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        biased;
        _ = stop_rx.changed() => false,
        _ = tokio::time::sleep(interval) => !*stop_rx.borrow(),
    }
}
