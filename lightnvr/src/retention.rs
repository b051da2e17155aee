//! Retention policy sweep.
//!
//! Periodically deletes recordings past the age limit and, when a storage
//! cap is configured, the oldest recordings until the total is back under
//! the cap. Every deletion removes the file and its catalog row in the
//! same logical operation, so the catalog never points at ghosts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use recording_catalog::Catalog;
use shutdown_coordinator::{ComponentKind, ComponentState, ShutdownCoordinator};
use tracing::{debug, info, warn};

/// Retention runs late in teardown; recorders (priority 10) go first.
const SWEEPER_PRIORITY: u8 = 50;

/// Floor on the sweep interval.
const MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Rows fetched per size-based deletion round.
const DELETE_BATCH: usize = 32;

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    /// 0 = unlimited.
    pub max_storage_bytes: u64,
    /// 0 = keep forever.
    pub retention_days: u32,
    pub auto_delete_oldest: bool,
    pub interval: Duration,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted_by_age: usize,
    pub deleted_by_size: usize,
    pub freed_bytes: u64,
}

/// Spawn the periodic sweep thread. It applies the policy once at startup
/// and then on every interval until shutdown.
pub fn spawn_sweeper(
    catalog: Arc<Catalog>,
    coordinator: Arc<ShutdownCoordinator>,
    storage_root: PathBuf,
    settings: RetentionSettings,
) -> std::io::Result<JoinHandle<()>> {
    let component = coordinator.register("retention", ComponentKind::RetentionSweeper, SWEEPER_PRIORITY);
    std::thread::Builder::new()
        .name("retention".to_string())
        .spawn(move || {
            let interval = settings.interval.max(MIN_INTERVAL);
            coordinator.update_state(component, ComponentState::Running);
            info!(interval_secs = interval.as_secs(), "retention sweeper started");
            loop {
                match apply_retention(&catalog, &settings) {
                    Ok(report) if report.freed_bytes > 0 => info!(
                        deleted_by_age = report.deleted_by_age,
                        deleted_by_size = report.deleted_by_size,
                        freed_bytes = report.freed_bytes,
                        "retention sweep complete"
                    ),
                    Ok(_) => debug!("retention sweep found nothing to delete"),
                    Err(e) => warn!(error = %e, "retention sweep failed"),
                }
                match disk_usage_percent(&storage_root) {
                    Ok(usage) => debug!(usage_percent = usage, "storage volume usage"),
                    Err(e) => warn!(error = %e, "could not read disk usage"),
                }

                let start = Instant::now();
                while start.elapsed() < interval {
                    if coordinator.is_shutdown_initiated() {
                        info!("retention sweeper stopping");
                        coordinator.update_state(component, ComponentState::Stopped);
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(500));
                }
            }
        })
}

/// Apply the retention policy once.
pub fn apply_retention(
    catalog: &Catalog,
    settings: &RetentionSettings,
) -> Result<SweepReport, recording_catalog::CatalogError> {
    let mut report = SweepReport::default();

    if settings.retention_days > 0 {
        let cutoff = Local::now().timestamp() - i64::from(settings.retention_days) * 86_400;
        for row in catalog.recordings_older_than(cutoff)? {
            if delete_recording(catalog, row.id, &row.file_path)? {
                report.deleted_by_age += 1;
                report.freed_bytes += row.size_bytes;
            }
        }
    }

    if settings.max_storage_bytes > 0 && settings.auto_delete_oldest {
        'size: while catalog.total_recorded_bytes()? > settings.max_storage_bytes {
            let batch = catalog.oldest_complete(DELETE_BATCH)?;
            if batch.is_empty() {
                warn!("over the storage limit but no sealed recordings left to delete");
                break;
            }
            for row in batch {
                if delete_recording(catalog, row.id, &row.file_path)? {
                    report.deleted_by_size += 1;
                    report.freed_bytes += row.size_bytes;
                }
                if catalog.total_recorded_bytes()? <= settings.max_storage_bytes {
                    break 'size;
                }
            }
        }
    }

    Ok(report)
}

/// Remove a recording's file and row together. A missing file still drops
/// the row.
fn delete_recording(
    catalog: &Catalog,
    id: i64,
    path: &Path,
) -> Result<bool, recording_catalog::CatalogError> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(id, path = %path.display(), "deleted recording file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(id, path = %path.display(), "recording file already missing")
        }
        Err(e) => {
            warn!(id, path = %path.display(), error = %e, "failed to delete recording file");
            return Ok(false);
        }
    }
    catalog.delete_recording_row(id)
}

/// Filesystem usage of the volume holding `path`, in percent.
pub fn disk_usage_percent(path: &Path) -> std::io::Result<u8> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    let total = stat.blocks();
    if total == 0 {
        return Err(std::io::Error::other("filesystem reports zero blocks"));
    }
    let used = total - stat.blocks_available();
    Ok(((used as f64 / total as f64) * 100.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn settings() -> RetentionSettings {
        RetentionSettings {
            max_storage_bytes: 0,
            retention_days: 0,
            auto_delete_oldest: true,
            interval: Duration::from_secs(3600),
        }
    }

    fn add_sealed(catalog: &Catalog, dir: &TempDir, name: &str, end_time: i64, size: usize) -> (i64, PathBuf) {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![0u8; size]).unwrap();
        let id = catalog
            .begin_recording("front", &path, end_time - 30)
            .unwrap();
        catalog
            .update_recording(id, end_time, size as u64, true)
            .unwrap();
        (id, path)
    }

    #[test]
    fn test_no_policy_is_noop() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        add_sealed(&catalog, &dir, "a.mp4", Local::now().timestamp(), 100);
        let report = apply_retention(&catalog, &settings()).unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn test_age_based_deletion() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let now = Local::now().timestamp();

        let (old_id, old_path) = add_sealed(&catalog, &dir, "old.mp4", now - 10 * 86_400, 100);
        let (new_id, new_path) = add_sealed(&catalog, &dir, "new.mp4", now - 86_400, 100);

        let mut settings = settings();
        settings.retention_days = 7;
        let report = apply_retention(&catalog, &settings).unwrap();

        assert_eq!(report.deleted_by_age, 1);
        assert_eq!(report.freed_bytes, 100);
        assert!(!old_path.exists());
        assert!(new_path.exists());
        assert!(catalog.get_recording(old_id).unwrap().is_none());
        assert!(catalog.get_recording(new_id).unwrap().is_some());
    }

    #[test]
    fn test_size_based_deletion_oldest_first() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let now = Local::now().timestamp();

        let (a_id, a_path) = add_sealed(&catalog, &dir, "a.mp4", now - 300, 600);
        let (b_id, b_path) = add_sealed(&catalog, &dir, "b.mp4", now - 200, 600);
        let (c_id, c_path) = add_sealed(&catalog, &dir, "c.mp4", now - 100, 600);

        let mut settings = settings();
        settings.max_storage_bytes = 1000;
        let report = apply_retention(&catalog, &settings).unwrap();

        // Deleting the two oldest gets us to 600 <= 1000.
        assert_eq!(report.deleted_by_size, 2);
        assert!(!a_path.exists() && !b_path.exists());
        assert!(c_path.exists());
        assert!(catalog.get_recording(a_id).unwrap().is_none());
        assert!(catalog.get_recording(b_id).unwrap().is_none());
        assert!(catalog.get_recording(c_id).unwrap().is_some());
    }

    #[test]
    fn test_size_based_deletion_respects_opt_out() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let now = Local::now().timestamp();
        add_sealed(&catalog, &dir, "a.mp4", now, 500);

        let mut settings = settings();
        settings.max_storage_bytes = 100;
        settings.auto_delete_oldest = false;
        let report = apply_retention(&catalog, &settings).unwrap();
        assert_eq!(report.deleted_by_size, 0);
    }

    #[test]
    fn test_missing_file_still_drops_row() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let now = Local::now().timestamp();
        let (id, path) = add_sealed(&catalog, &dir, "gone.mp4", now - 10 * 86_400, 100);
        std::fs::remove_file(&path).unwrap();

        let mut settings = settings();
        settings.retention_days = 7;
        let report = apply_retention(&catalog, &settings).unwrap();
        assert_eq!(report.deleted_by_age, 1);
        assert!(catalog.get_recording(id).unwrap().is_none());
    }

    #[test]
    fn test_open_recordings_are_never_deleted() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let path = dir.path().join("open.mp4");
        std::fs::write(&path, vec![0u8; 500]).unwrap();
        let id = catalog
            .begin_recording("front", &path, Local::now().timestamp() - 30 * 86_400)
            .unwrap();
        catalog.update_size(id, 500).unwrap();

        let mut settings = settings();
        settings.retention_days = 7;
        settings.max_storage_bytes = 100;
        let report = apply_retention(&catalog, &settings).unwrap();

        assert_eq!(report.deleted_by_age, 0);
        assert_eq!(report.deleted_by_size, 0);
        assert!(path.exists());
    }

    #[test]
    fn test_disk_usage_percent() {
        let usage = disk_usage_percent(Path::new("/tmp"));
        if let Ok(usage) = usage {
            assert!(usage <= 100);
        }
    }
}
