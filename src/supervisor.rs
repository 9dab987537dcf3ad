//! Stream unit orchestration
//!
//! The supervisor turns the active camera list into stream units and runs
//! them side by side. Units share nothing but the device lease registry; one
//! unit failing never takes down another.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::capture::{CameraBackend, CaptureConfig, CaptureError, CaptureExit, CaptureLoop};
use crate::config::{CameraConfig, CameraKind, ConfigError, ServerConfig};
use crate::frame_buffer::FrameBuffer;
use crate::lease::DeviceLeaseRegistry;
use crate::server::StreamingServer;

/// Index used when opening the built-in camera
const BUILTIN_INDEX: u32 = 0;

#[derive(Error, Debug)]
pub enum UnitError {
    #[error("no available camera device: {0}")]
    DeviceUnavailable(String),

    #[error("failed to open camera: {0}")]
    Capture(#[from] CaptureError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Server(#[source] std::io::Error),

    #[error("camera open task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Camera backends by camera kind
#[derive(Clone)]
pub struct Backends {
    pub builtin: Arc<dyn CameraBackend>,
    pub external: Arc<dyn CameraBackend>,
}

impl Backends {
    fn for_kind(&self, kind: &CameraKind) -> Option<&Arc<dyn CameraBackend>> {
        match kind {
            CameraKind::BuiltIn => Some(&self.builtin),
            CameraKind::External => Some(&self.external),
            CameraKind::Unknown(_) => None,
        }
    }
}

/// Which configs will start and which were skipped
#[derive(Debug, Clone, Default)]
pub struct StartPlan {
    pub start: Vec<CameraConfig>,
    pub skipped: Vec<CameraConfig>,
}

/// Outcome of a supervisor run, by camera name
///
/// `spawned` lists every unit that was launched, including ones that later
/// failed to open their device; those also appear in `failed`.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub spawned: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// Check the active list and decide what to start
///
/// Built-in cameras after the first are skipped with a warning and take no
/// further part in validation. Fails on any unknown camera type, or on a bad
/// field, duplicate name or duplicate port among the cameras that will start.
pub fn plan(configs: &[CameraConfig]) -> Result<StartPlan, ConfigError> {
    if let Some(bad) = configs
        .iter()
        .find(|c| matches!(c.kind, CameraKind::Unknown(_)))
    {
        return Err(ConfigError::UnknownCameraType {
            camera: bad.name.clone(),
            kind: bad.kind.to_string(),
        });
    }

    let mut plan = StartPlan::default();
    let mut builtin_used = false;
    for camera in configs {
        if camera.kind.is_builtin() {
            if builtin_used {
                warn!(
                    camera = %camera.name,
                    "Too many built-in cameras configured, skipping config"
                );
                plan.skipped.push(camera.clone());
                continue;
            }
            builtin_used = true;
        }
        plan.start.push(camera.clone());
    }

    {
        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for camera in &plan.start {
            camera.validate()?;
            if !names.insert(camera.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "camera '{}' listed twice",
                    camera.name
                )));
            }
            if !ports.insert(camera.port) {
                return Err(ConfigError::Invalid(format!(
                    "{}: port {} already used by another camera",
                    camera.name, camera.port
                )));
            }
        }
    }

    Ok(plan)
}

/// One camera's capture loop plus its HTTP server
pub struct StreamUnit {
    camera: CameraConfig,
    buffer: Arc<FrameBuffer>,
    backend: Arc<dyn CameraBackend>,
    registry: DeviceLeaseRegistry,
    settings: ServerConfig,
}

impl StreamUnit {
    pub fn new(
        camera: CameraConfig,
        backend: Arc<dyn CameraBackend>,
        registry: DeviceLeaseRegistry,
        settings: ServerConfig,
    ) -> Self {
        Self {
            camera,
            buffer: Arc::new(FrameBuffer::new()),
            backend,
            registry,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.camera.name
    }

    pub fn buffer(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Lease (external cameras only) and open the device on a blocking thread
    async fn open_capture(&self) -> Result<CaptureLoop, UnitError> {
        let camera = self.camera.clone();
        let backend = Arc::clone(&self.backend);
        let registry = self.registry.clone();
        let buffer = Arc::clone(&self.buffer);
        let config = CaptureConfig::from_camera(&camera, self.settings.jpeg_quality);
        let max_index = self.settings.max_device_index;

        tokio::task::spawn_blocking(move || -> Result<CaptureLoop, UnitError> {
            if camera.kind.is_builtin() {
                return Ok(CaptureLoop::open(
                    backend.as_ref(),
                    BUILTIN_INDEX,
                    None,
                    config,
                    buffer,
                )?);
            }

            let candidates = registry.available_devices(backend.as_ref(), max_index);
            let lease = registry
                .acquire_first_available(&candidates)
                .ok_or_else(|| {
                    UnitError::DeviceUnavailable(format!(
                        "all of {:?} are in use or absent",
                        candidates
                    ))
                })?;
            let index = lease.index();
            Ok(CaptureLoop::open(
                backend.as_ref(),
                index,
                Some(lease),
                config,
                buffer,
            )?)
        })
        .await?
    }

    /// Open the camera, bind the port and serve until the server stops
    ///
    /// If the capture loop dies the server keeps running; clients then see
    /// no new frames. Dropping this future stops the capture loop.
    pub async fn run(self) -> Result<(), UnitError> {
        let capture = self.open_capture().await?;
        let _capture_guard = capture.guard();

        let addr = format!("{}:{}", self.settings.bind_ip, self.camera.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| UnitError::Bind {
                addr: addr.clone(),
                source,
            })?;

        info!(
            camera = %self.camera.name,
            kind = %self.camera.kind,
            device = ?capture.device_index(),
            addr = %addr,
            "Stream unit started"
        );

        let camera = self.camera.name.clone();
        let capture_task = tokio::task::spawn_blocking(move || capture.run());
        tokio::spawn(async move {
            match capture_task.await {
                Ok(CaptureExit::Stopped) => info!(camera = %camera, "Capture stopped"),
                Ok(CaptureExit::ReadFailed(e)) => error!(
                    camera = %camera,
                    error = %e,
                    "Capture loop died, stream will serve no new frames"
                ),
                Err(e) => error!(camera = %camera, error = %e, "Capture thread panicked"),
            }
        });

        StreamingServer::new(self.camera, self.buffer)
            .serve(listener)
            .await
            .map_err(UnitError::Server)
    }
}

/// Starts and watches every stream unit
pub struct Supervisor {
    backends: Backends,
    registry: DeviceLeaseRegistry,
    settings: ServerConfig,
}

impl Supervisor {
    pub fn new(backends: Backends, settings: ServerConfig) -> Self {
        Self {
            backends,
            registry: DeviceLeaseRegistry::new(),
            settings,
        }
    }

    pub fn registry(&self) -> &DeviceLeaseRegistry {
        &self.registry
    }

    /// Validate the active list and build a unit per camera to start
    pub fn units(
        &self,
        configs: &[CameraConfig],
    ) -> Result<(Vec<StreamUnit>, StartPlan), SupervisorError> {
        let plan = plan(configs)?;
        let units = plan
            .start
            .iter()
            .filter_map(|camera| {
                let backend = self.backends.for_kind(&camera.kind)?;
                Some(StreamUnit::new(
                    camera.clone(),
                    Arc::clone(backend),
                    self.registry.clone(),
                    self.settings.clone(),
                ))
            })
            .collect();
        Ok((units, plan))
    }

    /// Run until every unit has ended
    pub async fn run(&self, configs: &[CameraConfig]) -> Result<RunSummary, SupervisorError> {
        self.run_until(configs, std::future::pending()).await
    }

    /// Run until every unit has ended or `shutdown` resolves
    ///
    /// A configuration error is returned before any unit starts.
    pub async fn run_until<F>(
        &self,
        configs: &[CameraConfig],
        shutdown: F,
    ) -> Result<RunSummary, SupervisorError>
    where
        F: Future<Output = ()>,
    {
        let (units, plan) = self.units(configs)?;

        let mut summary = RunSummary {
            skipped: plan.skipped.into_iter().map(|c| c.name).collect(),
            ..RunSummary::default()
        };

        let mut set = JoinSet::new();
        for unit in units {
            let name = unit.name().to_string();
            info!(camera = %name, "Starting stream unit");
            summary.spawned.push(name.clone());
            set.spawn(async move { (name, unit.run().await) });
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(())))) => info!(camera = %name, "Stream unit finished"),
                    Some(Ok((name, Err(e)))) => {
                        error!(camera = %name, error = %e, "Stream unit failed");
                        summary.failed.push(name);
                    }
                    Some(Err(e)) => error!(error = %e, "Stream unit task panicked"),
                },
                _ = &mut shutdown => {
                    info!(units = set.len(), "Shutting down stream units");
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    break;
                }
            }
        }

        Ok(summary)
    }
}
