//! Pass-request session: `AwaitingMatch -> Granted -> Returning`, or
//! `Abandoned` when the caller leaves (or the camera stream ends) first.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::detection::{DetectionLoop, FaceOutcome, LoopConfig, LoopError, LoopState};
use crate::profile_store::ProfileStore;
use crate::source::{
    DescriptorExtractor, NotificationSink, PassRecord, SourceError, VideoDevice,
};
use crate::types::{MatchResult, ReferenceProfile};

const DEFAULT_GRANT_DWELL: Duration = Duration::from_secs(3);
const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no identities enrolled")]
    NoIdentitiesEnrolled,
    #[error("camera unavailable: {0}")]
    Resource(#[from] SourceError),
    #[error(transparent)]
    Loop(#[from] LoopError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub detection: LoopConfig,
    /// How long the granted pass stays on screen before returning home.
    pub grant_dwell: Duration,
    /// How long `run` waits for the grant notification to be delivered.
    pub notify_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            detection: LoopConfig::default(),
            grant_dwell: DEFAULT_GRANT_DWELL,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingMatch,
    Granted,
    Returning,
    Abandoned,
}

/// A granted pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub identity: ReferenceProfile,
    pub pass_type: String,
    pub granted_at: DateTime<Local>,
    pub distance: f32,
    /// `(1 - distance) * 100`, rounded to one decimal.
    pub confidence: f32,
}

impl Grant {
    pub fn confidence_label(&self) -> String {
        format!("{:.1}", self.confidence)
    }

    /// Notification payload for this grant.
    pub fn record(&self) -> PassRecord {
        PassRecord {
            identity: self.identity.display_name.clone(),
            pass_type: self.pass_type.clone(),
            time: self.granted_at.format("%-I:%M:%S %p").to_string(),
            confidence: self.confidence_label(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Pass granted; the dwell has elapsed and control returns to the caller.
    Granted(Grant),
    Abandoned,
}

/// One pass request, from camera start to grant or abandonment.
///
/// Dropping a session that is still detecting only signals the loop to stop;
/// await [`abandon`](Session::abandon) before reloading the profile store.
pub struct Session {
    id: Uuid,
    pass_type: String,
    state: SessionState,
    grant: Option<Grant>,
    detection: DetectionLoop,
    matches: mpsc::UnboundedReceiver<MatchResult>,
    sink: Arc<dyn NotificationSink>,
    notification: Option<JoinHandle<()>>,
    grant_dwell: Duration,
    notify_timeout: Duration,
}

impl Session {
    /// Open the camera and start detecting.
    ///
    /// Fails with [`SessionError::NoIdentitiesEnrolled`] before touching the
    /// camera when the store is empty.
    pub async fn start<F>(
        pass_type: impl Into<String>,
        store: &ProfileStore,
        device: &dyn VideoDevice,
        extractor: Arc<dyn DescriptorExtractor>,
        sink: Arc<dyn NotificationSink>,
        config: SessionConfig,
        on_frame: F,
    ) -> Result<Self, SessionError>
    where
        F: Fn(&[FaceOutcome]) + Send + 'static,
    {
        let pass_type = pass_type.into();
        let id = Uuid::new_v4();

        if store.is_empty() {
            tracing::warn!(session = %id, pass_type = %pass_type, "no identities enrolled; session refused");
            return Err(SessionError::NoIdentitiesEnrolled);
        }

        let source = device.open().await.map_err(|e| {
            tracing::error!(session = %id, error = %e, "failed to open video source");
            e
        })?;

        let (tx, matches) = mpsc::unbounded_channel();
        let mut detection = DetectionLoop::new(config.detection);
        detection.start(
            source,
            extractor,
            store.snapshot(),
            move |result| {
                let _ = tx.send(result);
            },
            on_frame,
        )?;

        tracing::info!(
            session = %id,
            pass_type = %pass_type,
            profiles = store.len(),
            "pass session started"
        );

        Ok(Self {
            id,
            pass_type,
            state: SessionState::AwaitingMatch,
            grant: None,
            detection,
            matches,
            sink,
            notification: None,
            grant_dwell: config.grant_dwell,
            notify_timeout: config.notify_timeout,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pass_type(&self) -> &str {
        &self.pass_type
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn grant(&self) -> Option<&Grant> {
        self.grant.as_ref()
    }

    pub fn detection_state(&self) -> LoopState {
        self.detection.state()
    }

    /// `AwaitingMatch -> Granted`.
    ///
    /// One-shot: returns `false` and does nothing in any other state. Stops the
    /// detection loop, records the grant and notifies the sink in the
    /// background; notification failures never undo the grant. `run` waits up
    /// to `notify_timeout` for delivery before returning.
    pub async fn handle_match(&mut self, result: MatchResult) -> bool {
        if self.state != SessionState::AwaitingMatch {
            tracing::debug!(
                session = %self.id,
                state = ?self.state,
                identity = %result.profile.display_name,
                "duplicate match ignored"
            );
            return false;
        }

        self.detection.stop().await;

        let grant = Grant {
            confidence: result.confidence(),
            distance: result.distance,
            identity: result.profile,
            pass_type: self.pass_type.clone(),
            granted_at: Local::now(),
        };
        tracing::info!(
            session = %self.id,
            identity = %grant.identity.display_name,
            pass_type = %grant.pass_type,
            distance = grant.distance,
            confidence = %grant.confidence_label(),
            "pass granted"
        );

        let record = grant.record();
        let sink = Arc::clone(&self.sink);
        let session = self.id;
        self.notification = Some(tokio::spawn(async move {
            if let Err(e) = sink.notify(&record).await {
                tracing::warn!(session = %session, error = %e, "pass notification failed");
            }
        }));

        self.grant = Some(grant);
        self.state = SessionState::Granted;
        true
    }

    /// Leave the session before a grant. Stops the loop and releases the camera.
    pub async fn abandon(&mut self) {
        self.detection.stop().await;
        if self.state == SessionState::AwaitingMatch {
            tracing::info!(session = %self.id, "pass session abandoned");
            self.state = SessionState::Abandoned;
        }
    }

    /// Drive the session to completion.
    pub async fn run(&mut self) -> SessionOutcome {
        self.run_until(std::future::pending()).await
    }

    /// Drive the session until it completes or `cancel` resolves.
    ///
    /// Cancelling while awaiting a match abandons the session; cancelling
    /// during the grant dwell cuts the dwell short. A granted session does not
    /// return before its notification is delivered or `notify_timeout` passes.
    pub async fn run_until<C>(&mut self, cancel: C) -> SessionOutcome
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);

        if self.state == SessionState::AwaitingMatch {
            let next = tokio::select! {
                result = self.matches.recv() => Some(result),
                _ = &mut cancel => None,
            };
            match next {
                Some(Some(result)) => {
                    self.handle_match(result).await;
                }
                Some(None) => {
                    tracing::info!(session = %self.id, "video stream ended before a match");
                    self.abandon().await;
                }
                None => self.abandon().await,
            }
        }

        if self.state == SessionState::Granted {
            tokio::select! {
                _ = tokio::time::sleep(self.grant_dwell) => {}
                _ = &mut cancel => {}
            }
            self.flush_notification().await;
            self.state = SessionState::Returning;
            tracing::info!(session = %self.id, "returning to pass selection");
        }

        match (&self.state, &self.grant) {
            (SessionState::Returning, Some(grant)) => SessionOutcome::Granted(grant.clone()),
            _ => SessionOutcome::Abandoned,
        }
    }

    /// Wait for the grant notification, bounded by `notify_timeout`.
    ///
    /// A notification still pending afterwards keeps running detached.
    async fn flush_notification(&mut self) {
        let Some(mut task) = self.notification.take() else {
            return;
        };
        match tokio::time::timeout(self.notify_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(session = %self.id, error = %e, "pass notification task ended abnormally");
            }
            Err(_) => {
                tracing::warn!(
                    session = %self.id,
                    timeout_ms = self.notify_timeout.as_millis() as u64,
                    "pass notification still pending; returning without it"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::NotifyError;
    use crate::types::Descriptor;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn notify(&self, _record: &PassRecord) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected("endpoint down".into()))
        }
    }

    fn grant_at(distance: f32) -> Grant {
        let result = MatchResult {
            profile: ReferenceProfile::from_source("jane_doe", Descriptor::new(vec![0.0])),
            distance,
        };
        Grant {
            confidence: result.confidence(),
            distance,
            identity: result.profile,
            pass_type: "Nurse".into(),
            granted_at: Local.with_ymd_and_hms(2024, 3, 5, 14, 5, 9).unwrap(),
        }
    }

    #[test]
    fn test_grant_record_fields() {
        let record = grant_at(0.25).record();
        assert_eq!(record.identity, "Jane Doe");
        assert_eq!(record.pass_type, "Nurse");
        assert_eq!(record.time, "2:05:09 PM");
        assert_eq!(record.confidence, "75.0");
    }

    #[test]
    fn test_confidence_label_perfect_match() {
        assert_eq!(grant_at(0.0).confidence_label(), "100.0");
    }

    #[tokio::test]
    async fn test_empty_store_refuses_before_opening_camera() {
        struct PanicDevice;

        #[async_trait]
        impl VideoDevice for PanicDevice {
            async fn open(&self) -> Result<Box<dyn crate::source::VideoSource>, SourceError> {
                panic!("camera must not be opened without enrolled identities");
            }
        }

        struct NoExtractor;

        #[async_trait]
        impl DescriptorExtractor for NoExtractor {
            async fn detect(
                &self,
                _frame: &crate::types::Frame,
            ) -> Result<Vec<crate::types::DetectedFace>, crate::source::ExtractorError> {
                Ok(vec![])
            }
        }

        let result = Session::start(
            "Bathroom",
            &ProfileStore::empty(),
            &PanicDevice,
            Arc::new(NoExtractor),
            Arc::new(FailingSink),
            SessionConfig::default(),
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(SessionError::NoIdentitiesEnrolled)));
        assert_eq!(
            SessionError::NoIdentitiesEnrolled.to_string(),
            "no identities enrolled"
        );
    }
}
