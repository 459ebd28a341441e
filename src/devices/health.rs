// Source health monitoring: detects pipelines whose frames stopped flowing
//
// A USB camera that is yanked mid-stream does not always return an error;
// often the driver just stops delivering buffers. Watching the decoded-frame
// counter of every active source catches that case without touching the
// device.

use std::collections::{HashMap, HashSet};

use crate::pipeline::SourceInstance;

/// Stall detection state for one pipeline
#[derive(Debug, Default)]
struct StallState {
    last_frame_count: u64,
    /// True once we've seen at least one frame (avoids false positives during startup)
    has_seen_frames: bool,
    /// How many consecutive checks the counter hasn't changed
    stall_ticks: u32,
    /// Whether a stall was reported and not yet cleared
    reported: bool,
}

/// Health transition of one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallEvent {
    Stalled { path: String },
    Recovered { path: String },
}

/// Frame-counter stall detector, checked once per housekeeping tick
#[derive(Debug)]
pub struct StallMonitor {
    threshold: u32,
    states: HashMap<String, StallState>,
}

impl StallMonitor {
    /// A source is stalled after `threshold` checks without a new frame
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            states: HashMap::new(),
        }
    }

    /// Feed the current counters. Sources absent from `counts` are forgotten.
    pub fn check_counts<'a>(
        &mut self,
        counts: impl IntoIterator<Item = (&'a str, u64)>,
    ) -> Vec<StallEvent> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();

        for (path, count) in counts {
            seen.insert(path.to_string());
            let state = self.states.entry(path.to_string()).or_default();

            if count > state.last_frame_count {
                // Frames are flowing
                state.has_seen_frames = true;
                state.stall_ticks = 0;
                if state.reported {
                    state.reported = false;
                    log::info!("{}: frames resumed", path);
                    events.push(StallEvent::Recovered {
                        path: path.to_string(),
                    });
                }
            } else if state.has_seen_frames {
                state.stall_ticks += 1;
            }
            // Still starting up: don't count stalls
            state.last_frame_count = count;

            if state.stall_ticks >= self.threshold && !state.reported {
                state.reported = true;
                log::warn!(
                    "{}: no new frames for {} checks, source looks stalled",
                    path,
                    state.stall_ticks
                );
                events.push(StallEvent::Stalled {
                    path: path.to_string(),
                });
            }
        }

        // Clean up state for sources no longer active
        self.states.retain(|path, _| seen.contains(path));
        events
    }

    /// Check every active instance
    pub fn check(&mut self, instances: &[std::sync::Arc<SourceInstance>]) -> Vec<StallEvent> {
        self.check_counts(
            instances
                .iter()
                .map(|inst| (inst.path(), inst.decoded_count())),
        )
    }

    /// Whether `path` is currently reported as stalled
    pub fn is_stalled(&self, path: &str) -> bool {
        self.states.get(path).map(|s| s.reported).unwrap_or(false)
    }
}

impl Default for StallMonitor {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAM: &str = "/dev/video0";

    #[test]
    fn startup_without_frames_is_not_a_stall() {
        let mut monitor = StallMonitor::new(3);
        for _ in 0..10 {
            assert!(monitor.check_counts([(CAM, 0)]).is_empty());
        }
        assert!(!monitor.is_stalled(CAM));
    }

    #[test]
    fn stall_is_reported_once_then_recovers() {
        let mut monitor = StallMonitor::new(3);
        assert!(monitor.check_counts([(CAM, 10)]).is_empty());
        assert!(monitor.check_counts([(CAM, 10)]).is_empty());
        assert!(monitor.check_counts([(CAM, 10)]).is_empty());

        let events = monitor.check_counts([(CAM, 10)]);
        assert_eq!(events, vec![StallEvent::Stalled { path: CAM.into() }]);
        assert!(monitor.is_stalled(CAM));

        // No repeat while still stalled
        assert!(monitor.check_counts([(CAM, 10)]).is_empty());

        let events = monitor.check_counts([(CAM, 11)]);
        assert_eq!(events, vec![StallEvent::Recovered { path: CAM.into() }]);
        assert!(!monitor.is_stalled(CAM));
    }

    #[test]
    fn inactive_sources_are_forgotten() {
        let mut monitor = StallMonitor::new(1);
        monitor.check_counts([(CAM, 5)]);
        monitor.check_counts([(CAM, 5)]);
        assert!(monitor.is_stalled(CAM));

        monitor.check_counts(std::iter::empty());
        assert!(!monitor.is_stalled(CAM));
    }
}
