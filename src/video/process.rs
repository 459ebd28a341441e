// External-process frame source
//
// Some cameras have no V4L2 capture node (Raspberry Pi libcamera stacks) and
// are only reachable through a helper program that writes MJPEG to stdout.
// This source runs that program, reframes its output and keeps it alive:
//
//   Stopped -> Spawning -> Streaming -> (Stopped | Restarting -> Spawning ...)
//
// A supervisor thread owns the child process and a reader thread owns its
// stdout pipe. The reader feeds an MjpegFramer and pushes complete frames into
// a bounded channel, dropping the newest frame when the channel is full. The
// supervisor restarts the process when it exits or stays silent for longer
// than the watchdog interval, with exponential backoff and a bounded number of
// consecutive failed runs.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;

use super::mjpeg::MjpegFramer;
use super::source::FrameSource;
use super::{DeviceError, RawFrame};
use crate::config::ExternalSourceConfig;
use crate::pipeline::join_with_grace;

/// Size of a single stdout read
const READ_CHUNK_BYTES: usize = 256 * 1024;

/// How often the supervisor checks the child and the watchdog
const SUPERVISOR_POLL: Duration = Duration::from_millis(50);

/// How long to wait for the reader thread once the child has been killed
const READER_JOIN_GRACE: Duration = Duration::from_secs(2);

/// Program and arguments for one capture process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `rpicam-vid` streaming MJPEG to stdout forever, no preview window
    pub fn rpicam(program: &str, camera: u32, width: u32, height: u32, fps: u32) -> Self {
        let args = vec![
            "-t".to_string(),
            "0".to_string(),
            "--camera".to_string(),
            camera.to_string(),
            "--codec".to_string(),
            "mjpeg".to_string(),
            "--width".to_string(),
            width.to_string(),
            "--height".to_string(),
            height.to_string(),
            "--framerate".to_string(),
            fps.to_string(),
            "-n".to_string(),
            "-o".to_string(),
            "-".to_string(),
        ];
        Self::new(program, args)
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
    }
}

/// Restart and watchdog policy
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Restart the process when no frame arrives for this long
    pub watchdog: Duration,
    /// First delay before a restart
    pub restart_delay: Duration,
    /// Backoff ceiling
    pub max_restart_delay: Duration,
    /// Give up after this many runs in a row that produced no frame
    pub max_consecutive_failures: u32,
    /// Frames buffered between the reader and the capture thread
    pub queue_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            max_restart_delay: Duration::from_secs(8),
            max_consecutive_failures: 5,
            queue_capacity: 10,
        }
    }
}

impl From<&ExternalSourceConfig> for SupervisorSettings {
    fn from(config: &ExternalSourceConfig) -> Self {
        Self {
            watchdog: Duration::from_secs(config.watchdog_secs.max(1)),
            restart_delay: Duration::from_millis(config.restart_delay_ms),
            max_restart_delay: Duration::from_millis(
                config.max_restart_delay_ms.max(config.restart_delay_ms),
            ),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            queue_capacity: config.queue_capacity.max(1),
        }
    }
}

/// Lifecycle of the capture process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Spawning,
    Streaming,
    Restarting,
}

/// State shared between the source, its supervisor and its reader
struct ProcessShared {
    name: String,
    running: AtomicBool,
    state: Mutex<ProcessState>,
    failure: Mutex<Option<String>>,
    /// Frames the reader dropped because the channel was full
    dropped: AtomicU64,
    /// Number of restarts performed
    restarts: AtomicU64,
    last_frame: Mutex<Option<Instant>>,
}

impl ProcessShared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ProcessState) {
        let mut current = self.state.lock();
        if *current != state {
            log::debug!("{}: {:?} -> {:?}", self.name, *current, state);
            *current = state;
        }
    }

    fn fail(&self, reason: String) {
        log::error!("{}: giving up: {}", self.name, reason);
        *self.failure.lock() = Some(reason);
    }

    fn mark_frame(&self) {
        *self.last_frame.lock() = Some(Instant::now());
    }

    /// Sleep in short steps so a stop request is noticed promptly
    fn sleep_while_running(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(SUPERVISOR_POLL));
        }
    }
}

/// Why a streaming run ended
#[derive(Debug)]
enum RunEnd {
    StopRequested,
    Exited(Option<i32>),
    Stalled,
    StreamClosed,
}

/// Frame source backed by an external capture process
pub struct ProcessSource {
    command: ProcessCommand,
    settings: SupervisorSettings,
    width: u32,
    height: u32,
    frames: Option<Receiver<RawFrame>>,
    shared: Arc<ProcessShared>,
    supervisor: Option<JoinHandle<()>>,
    sequence: u64,
    dropped_reported: u64,
}

impl ProcessSource {
    pub fn new(
        name: &str,
        command: ProcessCommand,
        settings: SupervisorSettings,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            command,
            settings,
            width,
            height,
            frames: None,
            shared: Arc::new(ProcessShared {
                name: name.to_string(),
                running: AtomicBool::new(false),
                state: Mutex::new(ProcessState::Stopped),
                failure: Mutex::new(None),
                dropped: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
                last_frame: Mutex::new(None),
            }),
            supervisor: None,
            sequence: 0,
            dropped_reported: 0,
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.shared.state.lock()
    }

    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::Relaxed)
    }

    fn failure_reason(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }
}

impl FrameSource for ProcessSource {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.supervisor.is_some() {
            return Ok(());
        }

        // The first spawn is synchronous so a missing or broken program is
        // reported to the activating caller
        self.shared.set_state(ProcessState::Spawning);
        let child = self.command.spawn().map_err(|e| {
            self.shared.set_state(ProcessState::Stopped);
            DeviceError::SourceFailed(format!("failed to start {}: {}", self.command.program, e))
        })?;

        log::info!(
            "{}: started {} {:?} (pid {})",
            self.shared.name,
            self.command.program,
            self.command.args,
            child.id()
        );

        let (tx, rx) = bounded::<RawFrame>(self.settings.queue_capacity);
        self.shared.running.store(true, Ordering::Release);
        *self.shared.failure.lock() = None;

        let shared = self.shared.clone();
        let command = self.command.clone();
        let settings = self.settings.clone();
        let handle = std::thread::Builder::new()
            .name("camview-proc-supervisor".into())
            .spawn(move || supervise(child, command, settings, shared, tx))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                self.shared.set_state(ProcessState::Stopped);
                DeviceError::SourceFailed(format!("failed to spawn supervisor thread: {}", e))
            })?;

        self.frames = Some(rx);
        self.supervisor = Some(handle);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, DeviceError> {
        let rx = self.frames.as_ref().ok_or(DeviceError::NotStarted)?;

        match rx.recv_timeout(timeout) {
            Ok(mut frame) => {
                // Sequence numbers restart with every process run; renumber
                // so they stay monotonic for the instance
                frame.sequence = self.sequence;
                self.sequence += 1;
                Ok(frame)
            }
            Err(RecvTimeoutError::Timeout) => match self.failure_reason() {
                Some(reason) => Err(DeviceError::SourceFailed(reason)),
                None => Err(DeviceError::Timeout),
            },
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::SourceFailed(
                self.failure_reason()
                    .unwrap_or_else(|| "capture process supervisor exited".to_string()),
            )),
        }
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                log::error!("{}: supervisor thread panicked", self.shared.name);
            }
        }
        self.frames = None;
        self.shared.set_state(ProcessState::Stopped);
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn take_dropped(&mut self) -> u64 {
        let total = self.shared.dropped.load(Ordering::Relaxed);
        let delta = total - self.dropped_reported;
        self.dropped_reported = total;
        delta
    }
}

impl Drop for ProcessSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Supervisor thread: run, watch and restart the capture process
fn supervise(
    first_child: Child,
    command: ProcessCommand,
    settings: SupervisorSettings,
    shared: Arc<ProcessShared>,
    tx: Sender<RawFrame>,
) {
    let mut next_child = Some(first_child);
    let mut consecutive_failures = 0u32;
    let mut delay = settings.restart_delay;

    while shared.running() {
        let child = match next_child.take() {
            Some(child) => child,
            None => {
                shared.set_state(ProcessState::Spawning);
                match command.spawn() {
                    Ok(child) => {
                        log::info!(
                            "{}: restarted {} (pid {})",
                            shared.name,
                            command.program,
                            child.id()
                        );
                        child
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        log::warn!(
                            "{}: failed to start {} ({}/{}): {}",
                            shared.name,
                            command.program,
                            consecutive_failures,
                            settings.max_consecutive_failures,
                            e
                        );
                        if consecutive_failures >= settings.max_consecutive_failures {
                            shared.fail(format!("{} failed to start: {}", command.program, e));
                            break;
                        }
                        shared.set_state(ProcessState::Restarting);
                        shared.sleep_while_running(delay);
                        delay = (delay * 2).min(settings.max_restart_delay);
                        continue;
                    }
                }
            }
        };

        shared.set_state(ProcessState::Streaming);
        let (end, frames) = run_once(child, &settings, &shared, &tx);

        if !shared.running() {
            break;
        }

        if frames > 0 {
            consecutive_failures = 0;
            delay = settings.restart_delay;
        } else {
            consecutive_failures += 1;
        }

        log::warn!(
            "{}: capture process ended ({:?}) after {} frame(s)",
            shared.name,
            end,
            frames
        );

        if consecutive_failures >= settings.max_consecutive_failures {
            shared.fail(format!(
                "{} produced no frames in {} consecutive runs",
                command.program, consecutive_failures
            ));
            break;
        }

        shared.set_state(ProcessState::Restarting);
        shared.restarts.fetch_add(1, Ordering::Relaxed);
        log::info!("{}: restarting in {:?}", shared.name, delay);
        shared.sleep_while_running(delay);
        if frames == 0 {
            delay = (delay * 2).min(settings.max_restart_delay);
        }
    }

    shared.set_state(ProcessState::Stopped);
    // Dropping `tx` here disconnects the channel once the last reader is gone
}

/// Stream from one child until it exits, stalls or a stop is requested.
/// The child is always killed and reaped before returning.
fn run_once(
    mut child: Child,
    settings: &SupervisorSettings,
    shared: &Arc<ProcessShared>,
    tx: &Sender<RawFrame>,
) -> (RunEnd, u64) {
    let reader = child.stdout.take().and_then(|stdout| {
        let tx = tx.clone();
        let reader_shared = shared.clone();
        std::thread::Builder::new()
            .name("camview-proc-reader".into())
            .spawn(move || read_stream(stdout, tx, reader_shared))
            .map_err(|e| log::error!("{}: failed to spawn reader thread: {}", shared.name, e))
            .ok()
    });

    let started = Instant::now();
    let end = loop {
        if !shared.running() {
            break RunEnd::StopRequested;
        }

        match child.try_wait() {
            Ok(Some(status)) => break RunEnd::Exited(status.code()),
            Ok(None) => {}
            Err(e) => {
                log::warn!("{}: failed to poll capture process: {}", shared.name, e);
                break RunEnd::Exited(None);
            }
        }

        match &reader {
            Some(handle) if handle.is_finished() => break RunEnd::StreamClosed,
            None => break RunEnd::StreamClosed,
            _ => {}
        }

        let last_activity = shared
            .last_frame
            .lock()
            .map(|t| t.max(started))
            .unwrap_or(started);
        if last_activity.elapsed() > settings.watchdog {
            log::warn!(
                "{}: no frames for {:?}, restarting capture process",
                shared.name,
                settings.watchdog
            );
            break RunEnd::Stalled;
        }

        std::thread::sleep(SUPERVISOR_POLL);
    };

    if let Err(e) = child.kill() {
        // Already exited is the common case here
        log::debug!("{}: kill: {}", shared.name, e);
    }
    if let Err(e) = child.wait() {
        log::warn!("{}: failed to reap capture process: {}", shared.name, e);
    }

    let frames = reader
        .and_then(|handle| join_with_grace(handle, READER_JOIN_GRACE))
        .unwrap_or(0);

    (end, frames)
}

/// Reader thread: pipe bytes -> framer -> bounded channel
fn read_stream(mut stdout: ChildStdout, tx: Sender<RawFrame>, shared: Arc<ProcessShared>) -> u64 {
    let mut framer = MjpegFramer::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut frames = 0u64;

    while shared.running() {
        let n = match stdout.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("{}: error reading capture process output: {}", shared.name, e);
                break;
            }
        };

        for frame in framer.push(&chunk[..n]) {
            frames += 1;
            shared.mark_frame();
            match tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => return frames,
            }
        }
    }

    log::debug!(
        "{}: stream reader finished after {} frame(s), {} stray byte(s)",
        shared.name,
        frames,
        framer.discarded_bytes()
    );
    frames
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            watchdog: Duration::from_millis(300),
            restart_delay: Duration::from_millis(10),
            max_restart_delay: Duration::from_millis(40),
            max_consecutive_failures: 2,
            queue_capacity: 4,
        }
    }

    fn sh(script: &str) -> ProcessCommand {
        ProcessCommand::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    /// Poll until the source reports something other than a timeout
    fn next_non_timeout(
        source: &mut ProcessSource,
        deadline: Duration,
    ) -> Result<RawFrame, DeviceError> {
        let until = Instant::now() + deadline;
        loop {
            match source.next_frame(Duration::from_millis(50)) {
                Err(DeviceError::Timeout) if Instant::now() < until => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn rpicam_arguments() {
        let cmd = ProcessCommand::rpicam("rpicam-vid", 1, 640, 480, 30);
        assert_eq!(cmd.program, "rpicam-vid");
        let joined = cmd.args.join(" ");
        assert_eq!(
            joined,
            "-t 0 --camera 1 --codec mjpeg --width 640 --height 480 --framerate 30 -n -o -"
        );
    }

    #[test]
    fn streams_frames_from_process_stdout() {
        let mut source = ProcessSource::new(
            "test",
            sh(r"printf '\377\330abc\377\331junk\377\330de\377\331'; exec sleep 5"),
            fast_settings(),
            640,
            480,
        );
        source.start().unwrap();

        let first = next_non_timeout(&mut source, Duration::from_secs(3)).unwrap();
        assert_eq!(first.data, vec![0xFF, 0xD8, b'a', b'b', b'c', 0xFF, 0xD9]);
        assert_eq!(first.sequence, 0);

        let second = next_non_timeout(&mut source, Duration::from_secs(3)).unwrap();
        assert_eq!(second.data, vec![0xFF, 0xD8, b'd', b'e', 0xFF, 0xD9]);
        assert_eq!(second.sequence, 1);

        let stop_started = Instant::now();
        source.stop();
        assert!(stop_started.elapsed() < Duration::from_secs(3));
        assert_eq!(source.state(), ProcessState::Stopped);
    }

    #[test]
    fn missing_program_fails_start() {
        let mut source = ProcessSource::new(
            "test",
            ProcessCommand::new("/nonexistent/camview-capture", Vec::new()),
            fast_settings(),
            640,
            480,
        );
        assert!(matches!(source.start(), Err(DeviceError::SourceFailed(_))));
        assert_eq!(source.state(), ProcessState::Stopped);
    }

    #[test]
    fn crashing_process_exhausts_restart_budget() {
        let mut source = ProcessSource::new("test", sh("exit 3"), fast_settings(), 640, 480);
        source.start().unwrap();

        let result = next_non_timeout(&mut source, Duration::from_secs(5));
        assert!(matches!(result, Err(DeviceError::SourceFailed(_))), "got {:?}", result);
        assert!(source.restarts() >= 1);
    }

    #[test]
    fn silent_process_trips_the_watchdog() {
        let mut source = ProcessSource::new("test", sh("exec sleep 30"), fast_settings(), 640, 480);
        source.start().unwrap();

        let started = Instant::now();
        let result = next_non_timeout(&mut source, Duration::from_secs(10));
        assert!(matches!(result, Err(DeviceError::SourceFailed(_))), "got {:?}", result);
        // Two watchdog periods must have passed before giving up
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn process_that_produced_frames_is_restarted() {
        let mut source = ProcessSource::new(
            "test",
            sh(r"printf '\377\330x\377\331'; exit 0"),
            fast_settings(),
            640,
            480,
        );
        source.start().unwrap();

        // Each run yields one frame; three frames means at least two restarts
        for expected in 0..3u64 {
            let frame = next_non_timeout(&mut source, Duration::from_secs(5)).unwrap();
            assert_eq!(frame.sequence, expected);
            assert_eq!(frame.data, vec![0xFF, 0xD8, b'x', 0xFF, 0xD9]);
        }
        assert!(source.restarts() >= 2);
        source.stop();
    }
}
