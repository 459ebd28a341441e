// camview - multi-camera V4L2 viewer core
// Main library entry point

pub mod cli;
pub mod config;
pub mod devices;
pub mod pipeline;
pub mod presentation;
pub mod video;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::bail;

use crate::cli::Options;
use crate::config::Config;
use crate::devices::{CameraRegistry, SourceDescriptor, StallEvent, StallMonitor};
use crate::presentation::{Presenter, StatsSink};

/// How often housekeeping and stall checks run
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Application state, owned by the caller and passed by reference
pub struct AppContext {
    pub config: Config,
    pub registry: CameraRegistry,
}

impl AppContext {
    /// Context backed by real hardware
    pub fn new(config: Config) -> Self {
        let registry = CameraRegistry::from_config(&config);
        Self { config, registry }
    }

    /// Context with a caller-provided registry (tests, embedding)
    pub fn with_registry(config: Config, registry: CameraRegistry) -> Self {
        Self { config, registry }
    }

    pub fn load(config_path: &Path) -> Self {
        Self::new(Config::load_or_default(config_path))
    }

    /// Descriptors for the requested indices, or the first source when none
    /// were requested
    pub fn select_sources(&self, indices: &[u32]) -> anyhow::Result<Vec<SourceDescriptor>> {
        let descriptors = self.registry.descriptors();
        if indices.is_empty() {
            return match descriptors.into_iter().next() {
                Some(first) => Ok(vec![first]),
                None => bail!("No cameras found"),
            };
        }

        let mut selected = Vec::new();
        for index in indices {
            match self.registry.descriptor_by_index(*index) {
                Some(desc) if !selected.contains(&desc) => selected.push(desc),
                Some(_) => {}
                None => bail!("No camera with index {}", index),
            }
        }
        Ok(selected)
    }

    /// Activate `sources` and attach a statistics sink to each one that
    /// started. Activation failures are logged and skipped.
    pub fn activate_all(
        &self,
        sources: &[SourceDescriptor],
        presenter: &mut Presenter,
        scale: u32,
    ) {
        let width = self.config.capture.width;
        let height = self.config.capture.height;
        let interval = Duration::from_secs(self.config.presentation.stats_interval_secs);

        for desc in sources {
            match self.registry.activate(desc, width, height) {
                Ok(instance) => {
                    let (w, h) = instance.resolution();
                    log::info!("{} active at {}x{}", desc, w, h);
                    presenter.attach_scaled(
                        &desc.path,
                        Box::new(StatsSink::new(desc.name.clone(), interval)),
                        scale,
                    );
                }
                Err(e) => log::error!("Could not activate {}: {}", desc, e),
            }
        }
    }

    /// Render loop: tick the presenter, reclaim failed sources and watch for
    /// stalls until `duration` elapses or no source is left active.
    pub fn present(&self, presenter: &mut Presenter, duration: Option<Duration>) -> u64 {
        let tick = self.config.presentation.tick();
        let started = Instant::now();
        let mut last_housekeeping = Instant::now();
        let mut monitor = StallMonitor::default();
        let mut uploads = 0u64;

        loop {
            uploads += presenter.tick(&self.registry) as u64;

            if last_housekeeping.elapsed() >= HOUSEKEEPING_INTERVAL {
                last_housekeeping = Instant::now();
                for change in self.registry.housekeeping() {
                    log::warn!("{} stopped: {}", change.descriptor, change.reason);
                }
                for event in monitor.check(&self.registry.active_sources()) {
                    if let StallEvent::Stalled { path } = event {
                        log::warn!("{}: stalled", path);
                    }
                }
            }

            if self.registry.active_sources().is_empty() {
                log::info!("No active cameras left");
                break;
            }
            if duration.is_some_and(|d| started.elapsed() >= d) {
                break;
            }

            std::thread::sleep(tick);
        }

        uploads
    }
}

/// Run the viewer for parsed command line options
pub fn run(options: &Options) -> anyhow::Result<()> {
    let config_path = options
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let mut config = Config::load_or_default(&config_path);
    if let Some(width) = options.width {
        config.capture.width = width;
    }
    if let Some(height) = options.height {
        config.capture.height = height;
    }

    let ctx = AppContext::new(config);
    let sources = ctx.registry.discover();

    if options.list {
        print_sources(&sources, options.json)?;
        return Ok(());
    }

    let selected = ctx.select_sources(&options.cameras)?;
    let mut presenter = Presenter::new();
    ctx.activate_all(&selected, &mut presenter, options.scale);
    if ctx.registry.active_sources().is_empty() {
        bail!("No camera could be activated");
    }

    let duration = (options.seconds > 0).then(|| Duration::from_secs(options.seconds));
    let uploads = ctx.present(&mut presenter, duration);

    for instance in ctx.registry.active_sources() {
        log::info!(
            "{}: {} decoded, {} dropped",
            instance.descriptor(),
            instance.decoded_count(),
            instance.dropped_count()
        );
    }
    ctx.registry.deactivate_all();
    log::info!("Presented {} frame(s)", uploads);
    Ok(())
}

fn print_sources(sources: &[SourceDescriptor], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(sources)?);
        return Ok(());
    }

    if sources.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }
    println!("Cameras ({}):", sources.len());
    for source in sources {
        println!("  {}", source);
    }
    Ok(())
}
