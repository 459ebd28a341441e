// Camera enumeration
//
// Two discovery paths feed one list:
// - V4L2 capture nodes under /dev, named by their card string
// - cameras reported by the external capture program (`rpicam-vid`)

use std::path::Path;
use std::process::{Command, Stdio};

use v4l::video::Capture;
use v4l::Device;

use super::SourceDescriptor;
use crate::config::ExternalSourceConfig;

const DEV_DIR: &str = "/dev";

/// Name used when the capture program works but lists nothing
const FALLBACK_EXTERNAL_NAME: &str = "Raspberry Pi Camera";

/// Enumerate every reachable camera, sorted by index
pub fn discover_sources(external: &ExternalSourceConfig) -> Vec<SourceDescriptor> {
    let v4l2 = enumerate_v4l2_sources(Path::new(DEV_DIR));
    let external = if external.enabled {
        enumerate_external_sources(&external.program)
    } else {
        Vec::new()
    };

    let sources = merge_sources(v4l2, external);
    log::info!("Discovered {} camera source(s)", sources.len());
    for source in &sources {
        log::debug!("  {}", source);
    }
    sources
}

/// Scan `dir` for `videoN` nodes that can capture video.
///
/// Each node is opened only long enough to read its card name. Nodes that
/// cannot be opened (busy, permission denied, gone) are skipped.
pub fn enumerate_v4l2_sources(dir: &Path) -> Vec<SourceDescriptor> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("Cannot read {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut nodes: Vec<(u32, String)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let number = parse_video_node_name(name.to_str()?)?;
            Some((number, entry.path().to_str()?.to_string()))
        })
        .collect();
    nodes.sort_by_key(|(number, _)| *number);

    nodes
        .into_iter()
        .filter_map(|(number, path)| probe_v4l2_node(&path, number))
        .collect()
}

fn probe_v4l2_node(path: &str, number: u32) -> Option<SourceDescriptor> {
    let device = match Device::with_path(path) {
        Ok(device) => device,
        Err(e) => {
            log::debug!("Skipping {}: {}", path, e);
            return None;
        }
    };

    let caps = match device.query_caps() {
        Ok(caps) => caps,
        Err(e) => {
            log::debug!("Skipping {}: query caps failed: {}", path, e);
            return None;
        }
    };

    // Metadata and output nodes reject a capture format query
    if let Err(e) = device.format() {
        log::debug!("Skipping {} ({}): not a capture node: {}", path, caps.card, e);
        return None;
    }

    Some(SourceDescriptor::v4l2(path, display_name(&caps.card, number), number))
}

/// `video12` -> 12. Anything else (`video`, `video-x`, `vbi0`) is not a node.
pub fn parse_video_node_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("video")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Card name, or `Camera N` when the driver reports none
pub fn display_name(card: &str, number: u32) -> String {
    let card = card.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if card.is_empty() {
        format!("Camera {}", number)
    } else {
        card.to_string()
    }
}

/// Ask the capture program which cameras it can drive. Returns
/// (camera number, display name) pairs.
pub fn enumerate_external_sources(program: &str) -> Vec<(u32, String)> {
    let output = match Command::new(program)
        .arg("--list-cameras")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            log::debug!("{} not available: {}", program, e);
            return Vec::new();
        }
    };

    // Some builds print the list on stdout, older ones exit non-zero with no
    // cameras; only trust the parse.
    let cameras = parse_camera_list(&String::from_utf8_lossy(&output.stdout));
    if !cameras.is_empty() {
        return cameras;
    }

    if probe_external_capture(program) {
        vec![(0, FALLBACK_EXTERNAL_NAME.to_string())]
    } else {
        Vec::new()
    }
}

/// Run a one-millisecond capture to see whether any camera works at all
fn probe_external_capture(program: &str) -> bool {
    Command::new(program)
        .args(["-t", "1", "--nopreview", "-o", "/dev/null"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Parse `--list-cameras` output:
///
/// ```text
/// Available cameras
/// -----------------
/// 0 : imx708 [4608x2592 10-bit RGGB] (/base/soc/i2c0mux/i2c@1/imx708@1a)
///     Modes: 'SRGGB10_CSI2P' : 1536x864 [120.03 fps - (768, 432)/3072x1728 crop]
/// ```
pub fn parse_camera_list(output: &str) -> Vec<(u32, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (number, rest) = line.trim().split_once(':')?;
            let number: u32 = number.trim().parse().ok()?;
            let sensor = rest.split_whitespace().next()?;
            Some((number, format!("RPi Camera: {}", sensor)))
        })
        .collect()
}

/// Combine both discovery paths. External cameras are numbered after the
/// highest V4L2 node number in the order they were listed, so every source
/// has its own number key. The result is stably sorted by index.
pub fn merge_sources(
    v4l2: Vec<SourceDescriptor>,
    external: Vec<(u32, String)>,
) -> Vec<SourceDescriptor> {
    let base = v4l2.iter().map(|d| d.index + 1).max().unwrap_or(0);
    let mut sources = v4l2;
    sources.extend(
        external
            .into_iter()
            .enumerate()
            .map(|(i, (camera, name))| SourceDescriptor::external(camera, name, base + i as u32)),
    );
    sources.sort_by_key(|s| s.index);
    sources
}
