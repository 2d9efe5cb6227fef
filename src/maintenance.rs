use crate::config::StorageConfig;
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info};

/// Upload cleanup result
#[derive(Debug, Clone, Default)]
pub struct CleanupResult {
    pub files_deleted: usize,
    pub files_kept: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
    pub duration: Duration,
}

/// Deletes stored frames while leaving the deployment's own state alone
pub struct UploadCleaner {
    root: PathBuf,
    protected: Vec<PathBuf>,
    older_than: Option<Duration>,
}

impl UploadCleaner {
    /// The reference baseline and the status file are never deleted, nor is
    /// anything whose name starts with a dot
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            root: storage.upload_dir(),
            protected: vec![storage.reference_image_path(), storage.status_file_path()],
            older_than: None,
        }
    }

    /// Only delete files last modified more than `days` ago
    pub fn older_than_days(mut self, days: u32) -> Self {
        self.older_than = Some(Duration::from_secs(days as u64 * 24 * 3600));
        self
    }

    pub fn run(&self) -> Result<CleanupResult> {
        let start = Instant::now();
        let mut result = CleanupResult::default();

        if !self.root.exists() {
            info!("Upload directory {} does not exist; nothing to clean", self.root.display());
            return Ok(result);
        }

        let cutoff = self.older_than.and_then(|age| SystemTime::now().checked_sub(age));
        self.sweep(&self.root, cutoff, &mut result)?;

        result.duration = start.elapsed();
        info!(
            "Upload cleanup removed {} files ({} bytes), kept {}, {} errors in {:?}",
            result.files_deleted,
            result.bytes_freed,
            result.files_kept,
            result.errors.len(),
            result.duration
        );
        Ok(result)
    }

    fn sweep(&self, dir: &Path, cutoff: Option<SystemTime>, result: &mut CleanupResult) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    result.errors.push(format!("Failed to read {}: {}", dir.display(), e));
                    continue;
                }
            };
            let path = entry.path();

            // staging area and in-flight temp files belong to live writers
            if entry.file_name().to_string_lossy().starts_with('.') {
                debug!("Skipping {}", path.display());
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    result.errors.push(format!("Failed to stat {}: {}", path.display(), e));
                    continue;
                }
            };

            if metadata.is_dir() {
                if let Err(e) = self.sweep(&path, cutoff, result) {
                    result.errors.push(format!("Failed to clean {}: {}", path.display(), e));
                }
                continue;
            }

            if self.protected.iter().any(|p| p == &path) {
                debug!("Keeping {}", path.display());
                result.files_kept += 1;
                continue;
            }

            let recent = match (cutoff, metadata.modified()) {
                (Some(cutoff), Ok(modified)) => modified > cutoff,
                _ => false,
            };
            if recent {
                result.files_kept += 1;
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Deleted {}", path.display());
                    result.files_deleted += 1;
                    result.bytes_freed += metadata.len();
                }
                Err(e) => {
                    let msg = format!("Failed to delete {}: {}", path.display(), e);
                    error!("{}", msg);
                    result.errors.push(msg);
                }
            }
        }
        Ok(())
    }
}
