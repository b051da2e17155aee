//! The stream supervisor.
//!
//! Seeds the catalog from the config file, runs the startup recovery
//! sweep, spawns one recorder per enabled stream, and watches the catalog
//! for configuration changes. Duration and audio changes are picked up by
//! the recorders themselves at segment boundaries; URL and output
//! directory changes get the recorder stopped and respawned here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use recording_catalog::{Catalog, StreamConfig};
use rtsp_recorder::recorder::{spawn_recorder, RecorderHandle, STOP_DEADLINE};
use shutdown_coordinator::{ComponentId, ComponentKind, ComponentState, ShutdownCoordinator};
use tracing::{error, info, warn};

use crate::config::Config;

/// How often the watch loop reconciles against the catalog.
const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// The supervisor tears down after every worker it manages.
const SUPERVISOR_PRIORITY: u8 = 90;

struct RecorderEntry {
    handle: RecorderHandle,
    /// The configuration the recorder was spawned with, for change
    /// detection.
    spawned: StreamConfig,
    /// Set once a restart-worthy change was seen and a stop requested.
    restarting: bool,
}

pub struct Supervisor {
    catalog: Arc<Catalog>,
    coordinator: Arc<ShutdownCoordinator>,
    runtime: tokio::runtime::Handle,
    component: ComponentId,
    recorders: HashMap<String, RecorderEntry>,
}

impl Supervisor {
    pub fn new(
        catalog: Arc<Catalog>,
        coordinator: Arc<ShutdownCoordinator>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let component = coordinator.register("supervisor", ComponentKind::Supervisor, SUPERVISOR_PRIORITY);
        Self {
            catalog,
            coordinator,
            runtime,
            component,
            recorders: HashMap::new(),
        }
    }

    /// Copy the config file's stream entries into the catalog. The file is
    /// authoritative at boot; afterwards the catalog is.
    pub fn seed_catalog(
        &self,
        config: &Config,
        storage_root: &std::path::Path,
    ) -> Result<(), recording_catalog::CatalogError> {
        for entry in &config.streams {
            let stream = entry.to_stream_config(storage_root);
            info!(
                stream = %stream.name,
                enabled = stream.enabled,
                segment_duration = stream.segment_duration,
                "seeding stream configuration"
            );
            self.catalog.upsert_stream(&stream)?;
        }
        Ok(())
    }

    /// Seal or delete catalog rows orphaned by an unclean exit.
    pub fn recover_catalog(&self) {
        match self.catalog.recover_orphans() {
            Ok((0, 0)) => info!("catalog clean, no orphaned recordings"),
            Ok((sealed, deleted)) => info!(sealed, deleted, "recovered orphaned recordings"),
            Err(e) => error!(error = %e, "startup catalog recovery failed"),
        }
    }

    /// Spawn recorders for every enabled stream.
    pub fn start(&mut self) {
        self.coordinator
            .update_state(self.component, ComponentState::Running);
        self.reconcile();
        info!(recorders = self.recorders.len(), "supervisor started");
    }

    /// Watch loop; returns when shutdown is initiated.
    pub fn run(&mut self) {
        while !self.coordinator.is_shutdown_initiated() {
            let tick = Instant::now();
            while tick.elapsed() < WATCH_INTERVAL {
                if self.coordinator.is_shutdown_initiated() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            self.reconcile();
        }
    }

    /// Bring running recorders in line with the catalog.
    fn reconcile(&mut self) {
        let streams = match self.catalog.list_streams() {
            Ok(streams) => streams,
            Err(e) => {
                warn!(error = %e, "failed to list streams, skipping reconcile");
                return;
            }
        };

        // Reap exited workers (disabled streams stop themselves).
        self.recorders.retain(|name, entry| {
            if entry.handle.is_finished() {
                info!(stream = %name, "recorder exited");
                false
            } else {
                true
            }
        });

        for stream in &streams {
            match self.recorders.get_mut(&stream.name) {
                Some(entry) => {
                    let needs_restart = entry.spawned.url != stream.url
                        || entry.spawned.output_dir != stream.output_dir;
                    if (needs_restart || !stream.enabled) && !entry.restarting {
                        if needs_restart {
                            info!(stream = %stream.name, "configuration changed, restarting recorder");
                        }
                        entry.handle.request_stop();
                        entry.restarting = true;
                        // Respawned by a later reconcile once the old
                        // worker is reaped.
                    }
                }
                None if stream.enabled => self.spawn(stream.clone()),
                None => {}
            }
        }

        // Streams deleted from the catalog: their recorders notice the
        // missing row and exit on their own; nothing to do here.
    }

    fn spawn(&mut self, stream: StreamConfig) {
        info!(stream = %stream.name, url = %stream.url, "spawning recorder");
        let name = stream.name.clone();
        match spawn_recorder(
            stream.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.coordinator),
            self.runtime.clone(),
        ) {
            Ok(handle) => {
                self.recorders.insert(
                    name,
                    RecorderEntry {
                        handle,
                        spawned: stream,
                        restarting: false,
                    },
                );
            }
            Err(e) => error!(stream = %name, error = %e, "failed to spawn recorder thread"),
        }
    }

    /// Stop every recorder in coordinator teardown order and mark the
    /// supervisor stopped.
    pub fn shutdown(&mut self) {
        info!(recorders = self.recorders.len(), "stopping recorders");
        for entry in self.recorders.values() {
            entry.handle.request_stop();
        }
        for (_, name) in self.coordinator.teardown_order() {
            if let Some(entry) = self.recorders.remove(&name) {
                if !entry.handle.stop(STOP_DEADLINE) {
                    warn!(stream = %name, "recorder detached after missing stop deadline");
                }
            }
        }
        for (name, entry) in self.recorders.drain() {
            if !entry.handle.stop(STOP_DEADLINE) {
                warn!(stream = %name, "recorder detached after missing stop deadline");
            }
        }
        self.coordinator
            .update_state(self.component, ComponentState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamEntry;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_setup() -> (Arc<Catalog>, Arc<ShutdownCoordinator>, tokio::runtime::Runtime) {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let coordinator = ShutdownCoordinator::new();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        (catalog, coordinator, runtime)
    }

    fn test_app_config(storage: &Path) -> Config {
        Config {
            storage_path: storage.to_path_buf(),
            db_path: None,
            max_storage_gb: 0,
            retention_days: 30,
            auto_delete_oldest: true,
            retention_check_interval_secs: 3600,
            streams: vec![
                StreamEntry {
                    name: "front".to_string(),
                    url: "rtsp://127.0.0.1:1/front".to_string(),
                    segment_duration: 30,
                    record_audio: true,
                    enabled: true,
                },
                StreamEntry {
                    name: "yard".to_string(),
                    url: "rtsp://127.0.0.1:1/yard".to_string(),
                    segment_duration: 10,
                    record_audio: false,
                    enabled: false,
                },
            ],
        }
    }

    #[test]
    fn test_seed_catalog() {
        let dir = TempDir::new().unwrap();
        let (catalog, coordinator, runtime) = test_setup();
        let supervisor = Supervisor::new(
            Arc::clone(&catalog),
            Arc::clone(&coordinator),
            runtime.handle().clone(),
        );

        supervisor
            .seed_catalog(&test_app_config(dir.path()), dir.path())
            .unwrap();

        let streams = catalog.list_streams().unwrap();
        assert_eq!(streams.len(), 2);
        let front = catalog.get_stream_config("front").unwrap().unwrap();
        assert!(front.enabled);
        assert!(front.record_audio);
        assert_eq!(front.output_dir, dir.path().join("front"));
        let yard = catalog.get_stream_config("yard").unwrap().unwrap();
        assert!(!yard.enabled);
    }

    #[test]
    fn test_recovery_sweep_runs_on_startup() {
        let dir = TempDir::new().unwrap();
        let (catalog, coordinator, runtime) = test_setup();

        // An orphan from a previous run.
        let orphan = dir.path().join("orphan.mp4");
        std::fs::write(&orphan, vec![0u8; 1000]).unwrap();
        let id = catalog.begin_recording("front", &orphan, 1000).unwrap();

        let supervisor = Supervisor::new(catalog.clone(), coordinator, runtime.handle().clone());
        supervisor.recover_catalog();

        let row = catalog.get_recording(id).unwrap().unwrap();
        assert!(row.is_complete);
        assert_eq!(row.size_bytes, 1000);
    }

    /// End to end against an unreachable camera: the recorder spawns,
    /// opens its catalog row, fails to connect, and seals cleanly on
    /// shutdown.
    #[test]
    fn test_spawns_only_enabled_streams_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let (catalog, coordinator, runtime) = test_setup();
        let mut supervisor = Supervisor::new(
            Arc::clone(&catalog),
            Arc::clone(&coordinator),
            runtime.handle().clone(),
        );
        supervisor
            .seed_catalog(&test_app_config(dir.path()), dir.path())
            .unwrap();

        supervisor.start();
        assert_eq!(supervisor.recorders.len(), 1);
        assert!(supervisor.recorders.contains_key("front"));

        // Give the worker a moment to open its row against the
        // connection-refused URL.
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(catalog.open_recordings_for("front").unwrap().len(), 1);

        coordinator.initiate_shutdown();
        supervisor.shutdown();
        assert!(coordinator.wait_for_quiescence(Duration::from_secs(2)));
        assert!(catalog.open_recordings_for("front").unwrap().is_empty());
    }
}
