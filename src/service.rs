use crate::baseline::BaselineStore;
use crate::config::PresenceConfig;
use crate::detector::{build_detector, Detector};
use crate::error::{PresenceError, Result};
use crate::events::{EventStore, NewEvent, StoredEvent};
use crate::frame::Frame;
use crate::lifecycle::{Artifact, ArtifactKind, FileLifecycle, StagedFrame};
use crate::pipeline::{DecisionPipeline, Verdict};
use crate::similarity::FallbackComparator;
use crate::status::StatusPublisher;
use bytes::Bytes;
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Whether the verdict made it into durable storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recording {
    Recorded { id: i64, try_id: i64 },
    /// Verdict reached, but neither artifact nor event was kept
    NotRecorded { reason: String },
}

/// Everything a caller learns about one processed upload
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub verdict: Verdict,
    pub artifact: Option<Artifact>,
    pub recording: Recording,
}

impl ProcessOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self.recording, Recording::Recorded { .. })
    }
}

/// One deployment: detector, optional fallback, storage and status wired
/// together. Shared by all request handlers.
pub struct PresenceService {
    pipeline: DecisionPipeline,
    lifecycle: Arc<FileLifecycle>,
    events: Arc<EventStore>,
    status: StatusPublisher,
    baselines: Option<Arc<BaselineStore>>,
}

impl PresenceService {
    /// Build the detector from configuration and wire the service around it
    pub fn from_config(config: &PresenceConfig) -> Result<Self> {
        let detector = build_detector(&config.detector)?;
        Self::with_detector(config, detector)
    }

    pub fn with_detector(config: &PresenceConfig, detector: Arc<dyn Detector>) -> Result<Self> {
        let label = detector.label().to_string();

        let lifecycle = FileLifecycle::new(&config.storage, &label);
        lifecycle.prepare()?;

        let baselines = if config.fallback.enabled {
            Some(Arc::new(BaselineStore::open(
                config.storage.reference_image_path(),
            )?))
        } else {
            None
        };
        let fallback = baselines
            .as_ref()
            .map(|store| FallbackComparator::new(Arc::clone(store), config.fallback.threshold));

        let pipeline = DecisionPipeline::from_config(config, detector, fallback);
        let events = Arc::new(EventStore::open(config.storage.database_path())?);
        let status = StatusPublisher::open(config.storage.status_file_path());

        info!(
            "Presence service ready: method '{}', fallback {}",
            label,
            if pipeline.has_fallback() {
                format!("enabled (threshold {:.2})", config.fallback.threshold)
            } else {
                "disabled".to_string()
            }
        );

        Ok(Self {
            pipeline,
            lifecycle: Arc::new(lifecycle),
            events,
            status,
            baselines,
        })
    }

    pub fn detector_label(&self) -> &str {
        self.pipeline.detector_label()
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    pub fn status(&self) -> &StatusPublisher {
        &self.status
    }

    pub fn baselines(&self) -> Option<&Arc<BaselineStore>> {
        self.baselines.as_ref()
    }

    /// Decode and process one upload. Only input errors are returned as
    /// `Err`; everything past decoding yields an outcome.
    pub async fn process(&self, raw: Bytes) -> Result<ProcessOutcome> {
        let frame = blocking(move || Frame::decode(raw)).await?;
        Ok(self.process_frame(frame).await)
    }

    pub async fn process_frame(&self, frame: Frame) -> ProcessOutcome {
        let frame = Arc::new(frame);

        let staged = {
            let lifecycle = Arc::clone(&self.lifecycle);
            let frame = Arc::clone(&frame);
            blocking(move || lifecycle.stage(&frame)).await
        };

        let verdict = self.pipeline.decide(frame).await;

        let persisted = match staged {
            Ok(staged) => {
                let lifecycle = Arc::clone(&self.lifecycle);
                let events = Arc::clone(&self.events);
                let verdict = verdict.clone();
                blocking(move || persist(&lifecycle, &events, staged, &verdict)).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.status.publish(verdict.presence) {
            warn!("Status not written: {}", e);
        }

        let (artifact, recording) = match persisted {
            Ok((artifact, stored)) => (
                Some(artifact),
                Recording::Recorded {
                    id: stored.id,
                    try_id: stored.try_id,
                },
            ),
            Err(e) => {
                error!("Verdict for {} was not recorded: {}", verdict.method, e);
                (
                    None,
                    Recording::NotRecorded {
                        reason: e.to_string(),
                    },
                )
            }
        };

        ProcessOutcome {
            verdict,
            artifact,
            recording,
        }
    }
}

/// Commit the artifact, then log the event. An artifact whose event could
/// not be written is removed again so every kept file has exactly one row.
fn persist(
    lifecycle: &FileLifecycle,
    events: &EventStore,
    staged: StagedFrame,
    verdict: &Verdict,
) -> Result<(Artifact, StoredEvent)> {
    let artifact = lifecycle.commit(staged, verdict)?;

    match events.record(&NewEvent::from_verdict(verdict, &artifact.filename)) {
        Ok(stored) => {
            debug!(
                "{} -> event {} (try {})",
                artifact.filename, stored.id, stored.try_id
            );
            Ok((artifact, stored))
        }
        Err(e) => {
            if let (ArtifactKind::Primary | ArtifactKind::Fallback, Some(path)) =
                (artifact.kind, artifact.path.as_ref())
            {
                if let Err(remove_err) = fs::remove_file(path) {
                    warn!("Failed to roll back {}: {}", path.display(), remove_err);
                }
            }
            Err(e)
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PresenceError::system(format!("blocking task failed: {}", e)))?
}
