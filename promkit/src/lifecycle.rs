//! Process-wide lifecycle of the metrics exporter.
//!
//! A single atomic state machine (`Uninitialized → Running → ShuttingDown
//! → Stopped`) gates every public API call. The active backend (config,
//! registry, exposer, mux role) lives behind a read-write lock; hot paths
//! only load two atomics and clone an `Arc`.

use crate::mux::{self, MuxCollector, WorkerEndpoint};
use crate::registry::MetricRegistry;
use crate::server::{Collectable, Exposer};
use crate::settings::{Config, ExporterMode, Settings};
use crate::BootstrapResult;
use anyhow::Context as _;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

const UNINITIALIZED: u8 = 0;
const RUNNING: u8 = 1;
const SHUTTING_DOWN: u8 = 2;
const STOPPED: u8 = 3;

static STATE: AtomicU8 = AtomicU8::new(UNINITIALIZED);
static ENABLED: AtomicBool = AtomicBool::new(false);
static ACTIVE: RwLock<Option<Arc<ActiveBackend>>> = RwLock::new(None);

pub(crate) struct ActiveBackend {
    registry: Arc<MetricRegistry>,
    // Kept alive for its background server; dropped on shutdown.
    _exposer: Exposer,
    worker_descriptor: Option<PathBuf>,
}

impl ActiveBackend {
    pub(crate) fn registry(&self) -> &MetricRegistry {
        &self.registry
    }
}

/// Fast gate for hot-path calls: the backend is returned only while the
/// exporter is enabled and running.
#[inline]
pub(crate) fn active() -> Option<Arc<ActiveBackend>> {
    if !ENABLED.load(Ordering::Acquire) || STATE.load(Ordering::Acquire) != RUNNING {
        return None;
    }

    ACTIVE.read().clone()
}

pub(crate) fn is_running() -> bool {
    ENABLED.load(Ordering::Acquire) && STATE.load(Ordering::Acquire) == RUNNING
}

pub(crate) fn init(config: Config) -> bool {
    if STATE.load(Ordering::Acquire) == RUNNING {
        shutdown();
    }

    ENABLED.store(config.enabled, Ordering::Release);

    if !config.enabled {
        STATE.store(STOPPED, Ordering::Release);
        return true;
    }

    match bootstrap(config) {
        Ok(backend) => {
            *ACTIVE.write() = Some(Arc::new(backend));
            STATE.store(RUNNING, Ordering::Release);
            true
        }
        Err(err) => {
            warn!("metrics exporter initialization failed: {err:#}");
            STATE.store(STOPPED, Ordering::Release);
            false
        }
    }
}

pub(crate) fn init_from_toml(path: &Path) -> bool {
    let settings = match Settings::from_toml_file(path) {
        Ok(settings) => settings,
        Err(err) => {
            warn!("metrics exporter config rejected: {err:#}");
            return false;
        }
    };

    if !init(settings.config()) {
        return false;
    }

    if let Some(backend) = active() {
        backend.registry.pre_register(&settings);
    }

    true
}

pub(crate) fn shutdown() {
    STATE.store(SHUTTING_DOWN, Ordering::Release);
    ENABLED.store(false, Ordering::Release);

    let backend = ACTIVE.write().take();
    if let Some(backend) = backend {
        backend.registry.close();

        if let Some(file) = &backend.worker_descriptor {
            if let Err(err) = std::fs::remove_file(file) {
                debug!("failed to remove worker descriptor {}: {err}", file.display());
            }
        }

        // Last reference drops the exposer, draining in-flight scrapes.
        drop(backend);
    }

    STATE.store(STOPPED, Ordering::Release);
}

fn bootstrap(mut config: Config) -> BootstrapResult<ActiveBackend> {
    if config.mode == ExporterMode::Mux {
        // Workers of one component are told apart by this label; the
        // resolved name also goes into the worker descriptor.
        let component = mux_component_name(&config);
        config.labels.insert("component".to_owned(), component);
    }

    let registry = Arc::new(MetricRegistry::new(&config.prefix, config.labels.clone()));

    match config.mode {
        ExporterMode::Single => {
            let exposer = Exposer::bind(&format!("{}:{}", config.host, config.port))?;
            exposer.register_collector(
                config.metrics_path(),
                Arc::clone(&registry) as Arc<dyn Collectable>,
            );

            Ok(ActiveBackend {
                registry,
                _exposer: exposer,
                worker_descriptor: None,
            })
        }
        ExporterMode::Mux => init_mux(config, registry),
    }
}

/// Mux election: whoever binds the public port aggregates; everyone else
/// serves an ephemeral loopback port and advertises it through a
/// descriptor file.
fn init_mux(config: Config, registry: Arc<MetricRegistry>) -> BootstrapResult<ActiveBackend> {
    let dir = mux::mux_dir(&config.prefix);
    let component = config
        .labels
        .get("component")
        .cloned()
        .unwrap_or_default();

    match Exposer::bind(&format!("{}:{}", config.host, config.port)) {
        Ok(exposer) => {
            info!(
                "mux election won; aggregating on {}:{}",
                config.host, config.port
            );

            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating descriptor directory {}", dir.display()))?;

            let mut collector = MuxCollector::new();
            collector.set_directory(&dir);
            collector.set_own_registry(&registry, component);
            exposer.register_collector(config.metrics_path(), Arc::new(collector));

            Ok(ActiveBackend {
                registry,
                _exposer: exposer,
                worker_descriptor: None,
            })
        }
        Err(err) => {
            debug!("public port taken ({err:#}); continuing as mux worker");

            let exposer = Exposer::bind("127.0.0.1:0").context("binding ephemeral worker port")?;
            exposer.register_collector(
                config.metrics_path(),
                Arc::clone(&registry) as Arc<dyn Collectable>,
            );

            let endpoint = WorkerEndpoint {
                host: "127.0.0.1".into(),
                port: exposer.listening_port(),
                component,
                pid: std::process::id() as i32,
                path: config.metrics_path().to_owned(),
            };
            let file = mux::write_descriptor(&dir, &endpoint)
                .context("advertising worker endpoint")?;

            info!(
                "serving mux worker metrics on 127.0.0.1:{}",
                endpoint.port
            );

            Ok(ActiveBackend {
                registry,
                _exposer: exposer,
                worker_descriptor: Some(file),
            })
        }
    }
}

fn mux_component_name(config: &Config) -> String {
    match config.labels.get("component") {
        Some(component) if !component.is_empty() => component.clone(),
        _ => format!("component-{}", std::process::id()),
    }
}
