//! passgate-io: filesystem and scripted adapters for passgate-core.

pub mod audit;
pub mod directory;
pub mod replay;

pub use audit::JsonlSink;
pub use directory::{DescriptorSidecar, DirectoryError, ProfileDirectory};
pub use replay::{ReplayError, ReplayFeed, ReplayScript};
