pub mod baseline;
pub mod config;
pub mod detector;
pub mod error;
pub mod events;
pub mod frame;
pub mod lifecycle;
pub mod maintenance;
pub mod pipeline;
pub mod service;
pub mod similarity;
pub mod status;

#[cfg(feature = "server")]
pub mod server;

pub use baseline::{Baseline, BaselineStore, Establishment};
pub use config::{DetectorKind, PresenceConfig};
pub use detector::{build_detector, DetectionResult, Detector, StaticDetector};
pub use error::{PresenceError, Result};
pub use events::{EventRecord, EventStore, NewEvent, StoredEvent};
pub use frame::Frame;
pub use lifecycle::{Artifact, ArtifactKind, FileLifecycle, StagedFrame};
pub use maintenance::{CleanupResult, UploadCleaner};
pub use pipeline::{DecisionPipeline, Verdict};
pub use service::{PresenceService, ProcessOutcome, Recording};
pub use similarity::{ssim, Comparison, FallbackComparator};
pub use status::StatusPublisher;

#[cfg(feature = "server")]
pub use server::{PresenceServer, PresenceServerBuilder};
