use crate::config::StorageConfig;
use crate::error::{PresenceError, Result};
use crate::frame::Frame;
use crate::pipeline::Verdict;
use chrono::{DateTime, Local};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// An upload written to its own uniquely named staging file.
///
/// The file is removed when the guard drops unless [`FileLifecycle::commit`]
/// already moved it, so no exit path leaves staging debris behind.
#[derive(Debug)]
pub struct StagedFrame {
    path: PathBuf,
}

impl StagedFrame {
    pub fn write(staging_dir: &Path, bytes: &[u8]) -> Result<Self> {
        fs::create_dir_all(staging_dir)?;
        let path = staging_dir.join(format!("{}.upload", uuid::Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| staging_error(&path, e))?;
        let staged = Self { path };

        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| staging_error(&staged.path, e))?;

        debug!("Staged {} bytes at {}", bytes.len(), staged.path.display());
        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFrame {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed staging file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staging file {}: {}", self.path.display(), e),
        }
    }
}

fn staging_error(path: &Path, e: io::Error) -> PresenceError {
    PresenceError::storage(
        "file_lifecycle".to_string(),
        format!("failed to stage {}: {}", path.display(), e),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Kept in the primary store
    Primary,
    /// Moved to the fallback area
    Fallback,
    /// Deleted; only the would-be name survives in the event log
    Discarded,
}

/// Outcome of committing one staged frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Name recorded in the event log
    pub filename: String,
    /// Where the frame now lives, unless discarded
    pub path: Option<PathBuf>,
}

/// Turns a staged frame plus its verdict into exactly one stored outcome
#[derive(Debug, Clone)]
pub struct FileLifecycle {
    upload_dir: PathBuf,
    fallback_dir: PathBuf,
    staging_dir: PathBuf,
    retain_negative_frames: bool,
    label: String,
}

impl FileLifecycle {
    pub fn new(storage: &StorageConfig, detector_label: &str) -> Self {
        Self {
            upload_dir: storage.upload_dir(),
            fallback_dir: storage.fallback_dir(),
            staging_dir: storage.staging_dir(),
            retain_negative_frames: storage.retain_negative_frames,
            label: sanitize_label(detector_label),
        }
    }

    /// Create the storage directories
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.upload_dir, &self.fallback_dir, &self.staging_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                PresenceError::storage(
                    "file_lifecycle".to_string(),
                    format!("cannot create {}: {}", dir.display(), e),
                )
            })?;
        }
        Ok(())
    }

    pub fn stage(&self, frame: &Frame) -> Result<StagedFrame> {
        StagedFrame::write(&self.staging_dir, &frame.raw)
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn fallback_dir(&self) -> &Path {
        &self.fallback_dir
    }

    /// Commit `staged` according to `verdict`. The staging file is gone
    /// afterwards whether this succeeds or fails.
    pub fn commit(&self, staged: StagedFrame, verdict: &Verdict) -> Result<Artifact> {
        let stamp = artifact_stamp(&verdict.timestamp);

        let (kind, dir, prefix) = match (verdict.presence, verdict.fallback_used) {
            (true, true) => (ArtifactKind::Fallback, &self.fallback_dir, "fallback"),
            (true, false) => (ArtifactKind::Primary, &self.upload_dir, "capture"),
            (false, _) if self.retain_negative_frames => {
                (ArtifactKind::Primary, &self.upload_dir, "capture")
            }
            (false, _) => {
                let filename = artifact_name("capture", &self.label, &stamp, None, false);
                info!("Discarded negative frame (logged as {})", filename);
                drop(staged);
                return Ok(Artifact {
                    kind: ArtifactKind::Discarded,
                    filename,
                    path: None,
                });
            }
        };

        fs::create_dir_all(dir)?;
        let path = place_without_clobber(staged.path(), dir, |n| {
            artifact_name(prefix, &self.label, &stamp, n, verdict.presence)
        })?;
        drop(staged);

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        info!("Stored {:?} artifact {}", kind, path.display());

        Ok(Artifact {
            kind,
            filename,
            path: Some(path),
        })
    }
}

pub fn artifact_stamp(timestamp: &DateTime<Local>) -> String {
    timestamp.format("%Y%m%d_%H%M%S_%3f").to_string()
}

fn artifact_name(
    prefix: &str,
    label: &str,
    stamp: &str,
    disambiguator: Option<u32>,
    presence: bool,
) -> String {
    let suffix = disambiguator.map(|n| format!("-{}", n)).unwrap_or_default();
    format!(
        "{}_{}_{}{}_presence_{}.jpg",
        prefix,
        label,
        stamp,
        suffix,
        u8::from(presence)
    )
}

/// Path separators and whitespace would break the artifact name
fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Give `source` a name in `dir` that nothing else holds yet.
///
/// Hard links fail instead of replacing an existing target, which makes the
/// claim atomic; filesystems without links get an exclusive-create copy.
fn place_without_clobber<F>(source: &Path, dir: &Path, name: F) -> Result<PathBuf>
where
    F: Fn(Option<u32>) -> String,
{
    const MAX_ATTEMPTS: u32 = 1000;

    for attempt in 0..MAX_ATTEMPTS {
        let target = dir.join(name((attempt > 0).then_some(attempt)));
        match claim(source, &target) {
            Ok(()) => return Ok(target),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("{} exists, trying another name", target.display());
            }
            Err(e) => {
                return Err(PresenceError::storage(
                    "file_lifecycle".to_string(),
                    format!("failed to store {}: {}", target.display(), e),
                ))
            }
        }
    }

    Err(PresenceError::storage(
        "file_lifecycle".to_string(),
        format!("no free artifact name in {}", dir.display()),
    ))
}

fn claim(source: &Path, target: &Path) -> io::Result<()> {
    match fs::hard_link(source, target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            debug!("hard link unavailable ({}), copying instead", e);
            let mut out = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(target)?;
            let mut input = fs::File::open(source)?;
            io::copy(&mut input, &mut out)?;
            out.sync_all()
        }
    }
}
