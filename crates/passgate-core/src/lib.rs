//! passgate-core: face match engine and pass session state machine.
//!
//! Holds the enrolled reference descriptors, matches per-frame face
//! descriptors against them, and grants at most one pass per session.

pub mod detection;
pub mod matcher;
pub mod naming;
pub mod profile_store;
pub mod session;
pub mod source;
pub mod types;

pub use detection::{DetectionLoop, FaceOutcome, LoopConfig, LoopState};
pub use matcher::{find_best_match, EuclideanMatcher, Matcher, DEFAULT_ACCEPT_THRESHOLD};
pub use profile_store::ProfileStore;
pub use session::{Grant, Session, SessionConfig, SessionError, SessionOutcome, SessionState};
pub use source::{
    DescriptorExtractor, EnrollmentSource, NotificationSink, PassRecord, TracingSink, VideoDevice,
    VideoSource,
};
pub use types::{BoundingBox, Descriptor, DetectedFace, Frame, MatchResult, ProfileSet, ReferenceProfile};
