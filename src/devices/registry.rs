// Camera registry: discovered sources and their active pipelines
//
// Lifecycle per source:
//
//   inactive -> starting -> active -> stopping -> closed
//
// `activate` covers inactive..active, `deactivate` covers stopping..closed.
// A source-fatal error inside the pipeline clears the instance's `active`
// flag; `housekeeping` notices and reclaims it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use super::{discover_sources, SourceDescriptor, SourceKind};
use crate::config::{Config, ExternalSourceConfig};
use crate::pipeline::{PipelineSettings, SourceInstance};
use crate::video::process::SupervisorSettings;
use crate::video::{
    DeviceError, FrameDecoder, FrameSource, JpegDecoder, OpenError, ProcessCommand,
    ProcessSource, V4l2Source,
};

/// Opens frame sources. The seam between the registry and real hardware.
pub trait SourceBackend: Send + Sync {
    /// Enumerate reachable sources
    fn discover(&self) -> Vec<SourceDescriptor>;

    /// Open a source at the requested size. The returned source is not
    /// started yet and may report a different resolution.
    fn open(
        &self,
        descriptor: &SourceDescriptor,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn FrameSource>, OpenError>;
}

/// V4L2 nodes and external capture processes
pub struct SystemBackend {
    framerate: u32,
    external: ExternalSourceConfig,
}

impl SystemBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            framerate: config.capture.framerate,
            external: config.external.clone(),
        }
    }
}

impl SourceBackend for SystemBackend {
    fn discover(&self) -> Vec<SourceDescriptor> {
        discover_sources(&self.external)
    }

    fn open(
        &self,
        descriptor: &SourceDescriptor,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn FrameSource>, OpenError> {
        match descriptor.kind {
            SourceKind::V4l2 => {
                let source = V4l2Source::open(&descriptor.path, width, height, self.framerate)?;
                Ok(Box::new(source))
            }
            SourceKind::ExternalProcess => {
                let camera = descriptor
                    .external_camera()
                    .ok_or_else(|| OpenError::UnknownSource(descriptor.path.clone()))?;
                let command = ProcessCommand::rpicam(
                    &self.external.program,
                    camera,
                    width,
                    height,
                    self.framerate,
                );
                Ok(Box::new(ProcessSource::new(
                    &descriptor.path,
                    command,
                    SupervisorSettings::from(&self.external),
                    width,
                    height,
                )))
            }
        }
    }
}

/// Error type for activating a source
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error("Failed to start {path}: {source}")]
    Start {
        path: String,
        #[source]
        source: DeviceError,
    },

    #[error("Failed to spawn pipeline threads for {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// An instance the registry reclaimed because its source failed
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub descriptor: SourceDescriptor,
    pub reason: String,
}

/// Registry entry for one descriptor path
enum Entry {
    /// Open/start in progress outside the lock
    Activating,
    Running(Arc<SourceInstance>),
}

impl Entry {
    fn instance(&self) -> Option<&Arc<SourceInstance>> {
        match self {
            Entry::Activating => None,
            Entry::Running(instance) => Some(instance),
        }
    }
}

/// Owns the descriptor list and at most one instance per descriptor.
///
/// The instance map lock only covers lookups and inserts. Opening a device,
/// spawning a process and joining pipeline threads all happen outside it,
/// so the render tick never waits on another camera's activation.
pub struct CameraRegistry {
    backend: Box<dyn SourceBackend>,
    decoder: Arc<dyn FrameDecoder>,
    settings: PipelineSettings,
    grace: Duration,
    descriptors: RwLock<Vec<SourceDescriptor>>,
    instances: Mutex<HashMap<String, Entry>>,
    activation_done: Condvar,
}

/// Clears an `Activating` marker that was not replaced by a running
/// instance, also when activation unwinds
struct ActivationMarker<'a> {
    registry: &'a CameraRegistry,
    path: &'a str,
}

impl Drop for ActivationMarker<'_> {
    fn drop(&mut self) {
        let mut instances = self.registry.instances.lock();
        if matches!(instances.get(self.path), Some(Entry::Activating)) {
            instances.remove(self.path);
        }
        self.registry.activation_done.notify_all();
    }
}

impl CameraRegistry {
    pub fn new(
        backend: Box<dyn SourceBackend>,
        decoder: Arc<dyn FrameDecoder>,
        settings: PipelineSettings,
        grace: Duration,
    ) -> Self {
        Self {
            backend,
            decoder,
            settings,
            grace,
            descriptors: RwLock::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
            activation_done: Condvar::new(),
        }
    }

    /// Real hardware, JPEG decoding, tuning from `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Box::new(SystemBackend::new(config)),
            Arc::new(JpegDecoder),
            PipelineSettings::from(&config.pipeline),
            config.pipeline.deactivate_grace(),
        )
    }

    /// Rediscover sources, replacing the descriptor list
    pub fn discover(&self) -> Vec<SourceDescriptor> {
        let mut found = self.backend.discover();
        found.sort_by_key(|d| d.index);
        *self.descriptors.write() = found.clone();
        found
    }

    pub fn descriptors(&self) -> Vec<SourceDescriptor> {
        self.descriptors.read().clone()
    }

    /// Descriptor selected by number key
    pub fn descriptor_by_index(&self, index: u32) -> Option<SourceDescriptor> {
        self.descriptors
            .read()
            .iter()
            .find(|d| d.index == index)
            .cloned()
    }

    /// Start a source, or return its running instance.
    ///
    /// The source is opened at `width`x`height`; if it negotiates another
    /// size that one is used. On error nothing stays open or running. A
    /// concurrent activation of the same source waits for the first one and
    /// shares its result.
    pub fn activate(
        &self,
        descriptor: &SourceDescriptor,
        width: u32,
        height: u32,
    ) -> Result<Arc<SourceInstance>, ActivationError> {
        let path = descriptor.path.as_str();

        let dead = {
            let mut instances = self.instances.lock();
            loop {
                match instances.get(path) {
                    Some(Entry::Running(existing)) if existing.is_active() => {
                        log::debug!("{} already active", path);
                        return Ok(existing.clone());
                    }
                    Some(Entry::Activating) => {}
                    _ => break,
                }
                self.activation_done.wait(&mut instances);
            }
            let dead = instances.remove(path).and_then(|e| e.instance().cloned());
            instances.insert(path.to_string(), Entry::Activating);
            dead
        };
        let _marker = ActivationMarker {
            registry: self,
            path,
        };

        // A dead instance still holds its device; reclaim it first
        if let Some(dead) = dead {
            log::info!("{}: reclaiming failed instance before reactivation", path);
            dead.shutdown(self.grace);
        }

        let instance = self.start_instance(descriptor, width, height)?;
        self.instances
            .lock()
            .insert(path.to_string(), Entry::Running(instance.clone()));
        Ok(instance)
    }

    fn start_instance(
        &self,
        descriptor: &SourceDescriptor,
        width: u32,
        height: u32,
    ) -> Result<Arc<SourceInstance>, ActivationError> {
        log::info!("Activating {} at {}x{}", descriptor, width, height);
        let mut source = self.backend.open(descriptor, width, height)?;

        let (mut actual_width, mut actual_height) = source.resolution();
        if actual_width == 0 || actual_height == 0 {
            actual_width = width;
            actual_height = height;
        }

        source.start().map_err(|source| ActivationError::Start {
            path: descriptor.path.clone(),
            source,
        })?;

        let instance = Arc::new(SourceInstance::new(
            descriptor.clone(),
            actual_width,
            actual_height,
        ));
        instance
            .start(source, self.decoder.clone(), &self.settings)
            .map_err(|source| ActivationError::Spawn {
                path: descriptor.path.clone(),
                source,
            })?;
        Ok(instance)
    }

    /// Stop a source and release its device. Returns false if it was not
    /// active.
    pub fn deactivate(&self, descriptor: &SourceDescriptor) -> bool {
        self.deactivate_path(&descriptor.path)
    }

    /// Deactivate by path. An activation in progress is waited for first.
    pub fn deactivate_path(&self, path: &str) -> bool {
        let instance = {
            let mut instances = self.instances.lock();
            while matches!(instances.get(path), Some(Entry::Activating)) {
                self.activation_done.wait(&mut instances);
            }
            match instances.remove(path).and_then(|e| e.instance().cloned()) {
                Some(instance) => instance,
                None => return false,
            }
        };

        log::info!("Deactivating {}", instance.descriptor());
        if !instance.shutdown(self.grace) {
            log::warn!("{}: pipeline left running past grace period", path);
        }
        instance.slot().clear();
        true
    }

    /// Deactivate everything (shutdown)
    pub fn deactivate_all(&self) {
        let paths: Vec<String> = self.instances.lock().keys().cloned().collect();
        for path in paths {
            self.deactivate_path(&path);
        }
    }

    /// Reclaim instances that stopped on their own. Returns what changed.
    pub fn housekeeping(&self) -> Vec<StatusChange> {
        let dead: Vec<Arc<SourceInstance>> = {
            let mut instances = self.instances.lock();
            let paths: Vec<String> = instances
                .iter()
                .filter(|(_, entry)| entry.instance().is_some_and(|i| !i.is_active()))
                .map(|(path, _)| path.clone())
                .collect();
            paths
                .iter()
                .filter_map(|path| instances.remove(path))
                .filter_map(|entry| entry.instance().cloned())
                .collect()
        };

        dead.into_iter()
            .map(|instance| {
                instance.shutdown(self.grace);
                let reason = instance
                    .failure()
                    .unwrap_or_else(|| "stopped".to_string());
                log::warn!("{} went inactive: {}", instance.descriptor(), reason);
                StatusChange {
                    descriptor: instance.descriptor().clone(),
                    reason,
                }
            })
            .collect()
    }

    /// Registered instance for `path`, active or not yet reclaimed
    pub fn instance(&self, path: &str) -> Option<Arc<SourceInstance>> {
        self.instances.lock().get(path)?.instance().cloned()
    }

    pub fn is_active(&self, path: &str) -> bool {
        self.instance(path).map(|i| i.is_active()).unwrap_or(false)
    }

    pub fn current_frame(&self, path: &str) -> Option<Arc<crate::video::DecodedFrame>> {
        self.instance(path)?.current_frame()
    }

    pub fn dropped_count(&self, path: &str) -> Option<u64> {
        self.instance(path).map(|i| i.dropped_count())
    }

    /// Active instances, ordered by index
    pub fn active_sources(&self) -> Vec<Arc<SourceInstance>> {
        let mut active: Vec<_> = self
            .instances
            .lock()
            .values()
            .filter_map(Entry::instance)
            .filter(|i| i.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|i| i.descriptor().index);
        active
    }
}

impl Drop for CameraRegistry {
    fn drop(&mut self) {
        self.deactivate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::video::RawFrame;

    /// Source that times out forever
    struct IdleSource;

    impl FrameSource for IdleSource {
        fn start(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, DeviceError> {
            std::thread::sleep(timeout);
            Err(DeviceError::Timeout)
        }

        fn stop(&mut self) {}

        fn resolution(&self) -> (u32, u32) {
            (320, 240)
        }
    }

    /// Source whose start fails
    struct BrokenSource;

    impl FrameSource for BrokenSource {
        fn start(&mut self) -> Result<(), DeviceError> {
            Err(DeviceError::SourceFailed("no sensor".into()))
        }

        fn next_frame(&mut self, _timeout: Duration) -> Result<RawFrame, DeviceError> {
            Err(DeviceError::NotStarted)
        }

        fn stop(&mut self) {}

        fn resolution(&self) -> (u32, u32) {
            (0, 0)
        }
    }

    const SLOW_OPEN: Duration = Duration::from_millis(400);

    struct TestBackend {
        opens: Arc<AtomicUsize>,
    }

    impl SourceBackend for TestBackend {
        fn discover(&self) -> Vec<SourceDescriptor> {
            vec![
                SourceDescriptor::external(0, "RPi Camera: imx708", 1),
                SourceDescriptor::v4l2("/dev/video0", "Idle", 0),
                SourceDescriptor::v4l2("/dev/video4", "Broken", 1),
            ]
        }

        fn open(
            &self,
            descriptor: &SourceDescriptor,
            _width: u32,
            _height: u32,
        ) -> Result<Box<dyn FrameSource>, OpenError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match descriptor.path.as_str() {
                "/dev/video0" => Ok(Box::new(IdleSource)),
                "/dev/video4" => Ok(Box::new(BrokenSource)),
                "/dev/video6" => {
                    std::thread::sleep(SLOW_OPEN);
                    Ok(Box::new(IdleSource))
                }
                other => Err(OpenError::UnknownSource(other.to_string())),
            }
        }
    }

    fn registry() -> (CameraRegistry, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let settings = PipelineSettings {
            frame_timeout: Duration::from_millis(10),
            decode_timeout: Duration::from_millis(10),
            ..PipelineSettings::default()
        };
        let registry = CameraRegistry::new(
            Box::new(TestBackend { opens: opens.clone() }),
            Arc::new(JpegDecoder),
            settings,
            Duration::from_secs(2),
        );
        (registry, opens)
    }

    #[test]
    fn discover_sorts_stably_by_index() {
        let (registry, _) = registry();
        let paths: Vec<_> = registry.discover().into_iter().map(|d| d.path).collect();
        assert_eq!(paths, vec!["/dev/video0", "rpicam:0", "/dev/video4"]);
        assert_eq!(
            registry.descriptor_by_index(0).map(|d| d.path),
            Some("/dev/video0".to_string())
        );
    }

    #[test]
    fn activation_uses_negotiated_resolution() {
        let (registry, _) = registry();
        let desc = SourceDescriptor::v4l2("/dev/video0", "Idle", 0);
        let inst = registry.activate(&desc, 640, 480).unwrap();
        assert_eq!(inst.resolution(), (320, 240));
        assert!(registry.is_active("/dev/video0"));
        assert!(registry.deactivate(&desc));
        assert!(!registry.deactivate(&desc));
    }

    #[test]
    fn failed_start_leaves_nothing_behind() {
        let (registry, opens) = registry();
        let desc = SourceDescriptor::v4l2("/dev/video4", "Broken", 1);
        let result = registry.activate(&desc, 640, 480);
        assert!(matches!(result, Err(ActivationError::Start { .. })));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(registry.instance("/dev/video4").is_none());
        assert!(registry.active_sources().is_empty());
    }

    #[test]
    fn open_errors_are_returned() {
        let (registry, _) = registry();
        let desc = SourceDescriptor::external(0, "RPi Camera: imx708", 1);
        let result = registry.activate(&desc, 640, 480);
        assert!(matches!(
            result,
            Err(ActivationError::Open(OpenError::UnknownSource(_)))
        ));
    }

    #[test]
    fn housekeeping_reports_nothing_for_healthy_sources() {
        let (registry, _) = registry();
        let desc = SourceDescriptor::v4l2("/dev/video0", "Idle", 0);
        registry.activate(&desc, 640, 480).unwrap();
        assert!(registry.housekeeping().is_empty());
        assert_eq!(registry.active_sources().len(), 1);
        // Every timeout counts as a drop
        std::thread::sleep(Duration::from_millis(50));
        assert!(registry.dropped_count("/dev/video0").unwrap() > 0);
    }

    #[test]
    fn system_backend_rejects_malformed_external_path() {
        let backend = SystemBackend::new(&Config::default());
        let desc = SourceDescriptor {
            path: "rpicam:x".to_string(),
            name: "bad".to_string(),
            index: 0,
            kind: SourceKind::ExternalProcess,
        };
        assert!(matches!(
            backend.open(&desc, 640, 480),
            Err(OpenError::UnknownSource(_))
        ));
    }

    fn wait_for_opens(opens: &AtomicUsize, n: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while opens.load(Ordering::SeqCst) < n && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(opens.load(Ordering::SeqCst), n);
    }

    #[test]
    fn slow_activation_does_not_block_other_sources() {
        let (registry, opens) = registry();
        let idle = SourceDescriptor::v4l2("/dev/video0", "Idle", 0);
        let slow = SourceDescriptor::v4l2("/dev/video6", "Slow", 6);
        registry.activate(&idle, 640, 480).unwrap();

        std::thread::scope(|scope| {
            let activation = scope.spawn(|| registry.activate(&slow, 640, 480).is_ok());
            wait_for_opens(&opens, 2);

            let started = std::time::Instant::now();
            assert!(registry.instance("/dev/video0").is_some());
            assert!(registry.current_frame("/dev/video0").is_none());
            assert_eq!(registry.active_sources().len(), 1);
            assert!(registry.housekeeping().is_empty());
            assert!(started.elapsed() < SLOW_OPEN / 2);

            // Still opening: not visible as an instance yet
            assert!(registry.instance("/dev/video6").is_none());
            assert!(activation.join().unwrap());
        });

        assert_eq!(registry.active_sources().len(), 2);
    }

    #[test]
    fn concurrent_activation_opens_once() {
        let (registry, opens) = registry();
        let slow = SourceDescriptor::v4l2("/dev/video6", "Slow", 6);

        let (a, b) = std::thread::scope(|scope| {
            let first = scope.spawn(|| registry.activate(&slow, 640, 480).ok());
            wait_for_opens(&opens, 1);
            let second = scope.spawn(|| registry.activate(&slow, 640, 480).ok());
            (first.join().unwrap(), second.join().unwrap())
        });

        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deactivate_waits_for_activation_in_progress() {
        let (registry, opens) = registry();
        let slow = SourceDescriptor::v4l2("/dev/video6", "Slow", 6);

        std::thread::scope(|scope| {
            let activation = scope.spawn(|| registry.activate(&slow, 640, 480).ok());
            wait_for_opens(&opens, 1);
            assert!(registry.deactivate(&slow));
            let instance = activation.join().unwrap().unwrap();
            assert!(!instance.is_active());
        });

        assert!(registry.instance("/dev/video6").is_none());
    }

    #[test]
    fn failed_activation_releases_waiters() {
        let (registry, _) = registry();
        let broken = SourceDescriptor::v4l2("/dev/video4", "Broken", 1);
        assert!(registry.activate(&broken, 640, 480).is_err());
        // The marker is gone, so a second attempt opens again instead of waiting
        assert!(registry.activate(&broken, 640, 480).is_err());
        assert!(!registry.deactivate(&broken));
    }
}
