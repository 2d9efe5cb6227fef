use crate::error::{PresenceError, Result};
use crate::frame::Frame;
use chrono::{DateTime, Local};
use image::RgbImage;
use parking_lot::RwLock;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reference frame that the similarity fallback measures drift against
#[derive(Debug)]
pub struct Baseline {
    pub pixels: Arc<RgbImage>,
    pub established_at: DateTime<Local>,
}

/// Result of an establishment attempt
#[derive(Debug, Clone)]
pub enum Establishment {
    /// This call wrote the baseline
    Established(Arc<Baseline>),
    /// A baseline already existed (set earlier, by another worker, or by
    /// another process sharing the file); it was left untouched
    AlreadyPresent(Arc<Baseline>),
}

impl Establishment {
    pub fn baseline(&self) -> &Arc<Baseline> {
        match self {
            Establishment::Established(b) | Establishment::AlreadyPresent(b) => b,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Establishment::Established(_))
    }
}

/// Holds the single baseline of one deployment.
///
/// First writer wins, both in-process (write lock around check-and-create)
/// and across processes (the reference file is published with a hard link,
/// which refuses to replace an existing file). Once set, the baseline is
/// immutable and every reader sees the same pixels.
pub struct BaselineStore {
    path: PathBuf,
    current: RwLock<Option<Arc<Baseline>>>,
}

impl BaselineStore {
    /// Open the store, adopting a reference image left by an earlier run.
    ///
    /// An unreadable reference file is not fatal: the store starts empty and
    /// the next establishment replaces the file.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let current = if path.exists() {
            match load_baseline(&path) {
                Ok(baseline) => {
                    info!("Loaded reference baseline from {}", path.display());
                    Some(Arc::new(baseline))
                }
                Err(e) => {
                    warn!("Ignoring reference baseline {}: {}", path.display(), e);
                    None
                }
            }
        } else {
            debug!("No reference baseline at {} yet", path.display());
            None
        };

        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Option<Arc<Baseline>> {
        self.current.read().clone()
    }

    /// Make `frame` the baseline unless one exists already
    pub fn establish(&self, frame: &Frame) -> Result<Establishment> {
        if let Some(existing) = self.get() {
            return Ok(Establishment::AlreadyPresent(existing));
        }

        let mut slot = self.current.write();
        if let Some(existing) = slot.as_ref() {
            return Ok(Establishment::AlreadyPresent(Arc::clone(existing)));
        }

        let outcome = match self.publish_or_adopt(frame)? {
            Some(adopted) => Establishment::AlreadyPresent(Arc::new(adopted)),
            None => {
                info!(
                    "Reference baseline established from {}x{} frame at {}",
                    frame.width(),
                    frame.height(),
                    self.path.display()
                );
                Establishment::Established(Arc::new(Baseline {
                    pixels: Arc::clone(&frame.pixels),
                    established_at: frame.received_at,
                }))
            }
        };

        *slot = Some(Arc::clone(outcome.baseline()));
        Ok(outcome)
    }

    /// Publish `frame`, or load the baseline some other writer published.
    /// `None` means this call won. A reference file that cannot be decoded
    /// is replaced once; a second failure is returned to the caller.
    fn publish_or_adopt(&self, frame: &Frame) -> Result<Option<Baseline>> {
        if publish_exclusive(&self.path, &frame.raw)? {
            return Ok(None);
        }

        match load_baseline(&self.path) {
            Ok(existing) => {
                warn!(
                    "Reference baseline {} was created concurrently; adopting it",
                    self.path.display()
                );
                return Ok(Some(existing));
            }
            Err(e) => warn!("Replacing reference baseline: {}", e),
        }

        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        if publish_exclusive(&self.path, &frame.raw)? {
            Ok(None)
        } else {
            load_baseline(&self.path).map(Some)
        }
    }
}

fn load_baseline(path: &Path) -> Result<Baseline> {
    let bytes = fs::read(path)?;
    let pixels = image::load_from_memory(&bytes)
        .map_err(|e| {
            PresenceError::storage(
                "baseline".to_string(),
                format!("unreadable reference image {}: {}", path.display(), e),
            )
        })?
        .to_rgb8();

    let established_at = fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Local>::from)
        .unwrap_or_else(|_| Local::now());

    Ok(Baseline {
        pixels: Arc::new(pixels),
        established_at,
    })
}

/// Write `bytes` to `path` only if nothing is there. Returns false when
/// another writer got there first. Readers never observe a partial file.
fn publish_exclusive(path: &Path, bytes: &[u8]) -> Result<bool> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(".baseline-{}.tmp", uuid::Uuid::new_v4()));
    let written = (|| -> io::Result<bool> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        match fs::hard_link(&tmp, path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    })();

    if let Err(e) = fs::remove_file(&tmp) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", tmp.display(), e);
        }
    }

    written.map_err(|e| {
        PresenceError::storage(
            "baseline".to_string(),
            format!("failed to write {}: {}", path.display(), e),
        )
    })
}
