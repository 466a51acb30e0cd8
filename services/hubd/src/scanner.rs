//! Platform enumeration of locally attached capture devices.
//!
//! `PlatformScanner` shells out to the per-OS tooling (v4l2-ctl / arecord /
//! pactl on Linux, ffmpeg device listings on macOS and Windows) and parses
//! the output.  Everything here is best-effort: a missing tool or an
//! unparseable line just means fewer devices reported.  The parsing is kept
//! in pure functions so it is testable on captured output from any host.

use async_trait::async_trait;
use av_core::{CaptureDriver, DeviceKind, DeviceScanner, DeviceStatus, LocalDevice};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

pub struct PlatformScanner;

#[async_trait]
impl DeviceScanner for PlatformScanner {
    async fn scan_video_devices(&self) -> HashMap<String, LocalDevice> {
        match std::env::consts::OS {
            "linux" => scan_linux_video().await,
            "macos" => scan_avfoundation(DeviceKind::Video).await,
            "windows" => scan_dshow(DeviceKind::Video).await,
            other => {
                warn!(os = other, "unsupported platform for video device scan");
                HashMap::new()
            }
        }
    }

    async fn scan_audio_devices(&self) -> HashMap<String, LocalDevice> {
        match std::env::consts::OS {
            "linux" => scan_linux_audio().await,
            "macos" => scan_avfoundation(DeviceKind::Audio).await,
            "windows" => scan_dshow(DeviceKind::Audio).await,
            other => {
                warn!(os = other, "unsupported platform for audio device scan");
                HashMap::new()
            }
        }
    }
}

/// Run a command and hand back combined stdout+stderr (ffmpeg prints its
/// device listings on stderr).  `None` when the tool cannot be run at all.
async fn command_output(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output().await {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Some(text)
        }
        Err(e) => {
            debug!(program, error = %e, "device scan tool unavailable");
            None
        }
    }
}

fn online(mut device: LocalDevice) -> LocalDevice {
    device.status = DeviceStatus::Online;
    device.last_check = Some(Instant::now());
    device
}

// ---------------------------------------------------------------------------
// Linux
// ---------------------------------------------------------------------------

async fn scan_linux_video() -> HashMap<String, LocalDevice> {
    let mut devices = HashMap::new();
    for node in video_nodes(Path::new("/dev")) {
        let device_id = format!("video:{node}");
        let all = command_output("v4l2-ctl", &["--device", &node, "--all"]).await;
        let name = all
            .as_deref()
            .and_then(parse_card_type)
            .unwrap_or_else(|| format!("Camera {node}"));

        let mut device = LocalDevice::new(&device_id, name, DeviceKind::Video, &node, CaptureDriver::V4l2);
        if let Some(formats) =
            command_output("v4l2-ctl", &["--device", &node, "--list-formats-ext"]).await
        {
            device.formats = parse_pixel_formats(&formats);
            device.resolutions = parse_discrete_resolutions(&formats);
        }
        devices.insert(device_id, online(device));
    }
    devices
}

fn video_nodes(dev: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dev) else {
        return Vec::new();
    };
    let mut nodes: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with("video") && name["video".len()..].chars().all(|c| c.is_ascii_digit()))
        .map(|name| dev.join(name).to_string_lossy().into_owned())
        .collect();
    nodes.sort();
    nodes
}

async fn scan_linux_audio() -> HashMap<String, LocalDevice> {
    let mut devices = HashMap::new();

    if let Some(output) = command_output("arecord", &["-l"]).await {
        for (alsa_id, name) in parse_arecord_cards(&output) {
            let device_id = format!("alsa:{alsa_id}");
            let device =
                LocalDevice::new(&device_id, name, DeviceKind::Audio, &alsa_id, CaptureDriver::Alsa);
            devices.insert(device_id, online(device));
        }
    }

    if let Some(output) = command_output("pactl", &["list", "sources"]).await {
        for (source_name, description) in parse_pactl_sources(&output) {
            let device_id = format!("pulse:{source_name}");
            let device = LocalDevice::new(
                &device_id,
                description,
                DeviceKind::Audio,
                &source_name,
                CaptureDriver::Pulse,
            );
            devices.insert(device_id, online(device));
        }
    }

    devices
}

/// "Card type     : Integrated Camera" -> device name.
fn parse_card_type(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (label, value) = line.split_once(':')?;
        if label.trim() == "Card type" {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_owned())
        } else {
            None
        }
    })
}

/// "PixelFormat : 'YUYV'" occurrences, deduplicated in order.
fn parse_pixel_formats(output: &str) -> Vec<String> {
    let mut formats = Vec::new();
    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        if !label.trim().starts_with("PixelFormat") {
            continue;
        }
        if let Some(start) = value.find('\'')
            && let Some(end) = value[start + 1..].find('\'')
        {
            let format = value[start + 1..start + 1 + end].to_owned();
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
    }
    formats
}

/// "Size: Discrete 1280x720" occurrences, deduplicated in order.
fn parse_discrete_resolutions(output: &str) -> Vec<String> {
    let mut resolutions = Vec::new();
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix("Size: Discrete ") else {
            continue;
        };
        let res = rest.trim();
        if res.split('x').count() == 2
            && res.split('x').all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
            && !resolutions.contains(&res.to_owned())
        {
            resolutions.push(res.to_owned());
        }
    }
    resolutions
}

/// `arecord -l` card lines -> (alsa id "hw:C,D", card name).
fn parse_arecord_cards(output: &str) -> Vec<(String, String)> {
    let mut cards = Vec::new();
    for line in output.lines() {
        let Some(rest) = line.strip_prefix("card ") else {
            continue;
        };
        // "0: PCH [HDA Intel PCH], device 0: ALC892 Analog [ALC892 Analog]"
        let Some((card_id, rest)) = rest.split_once(':') else {
            continue;
        };
        let Some((card_part, device_part)) = rest.split_once(", device ") else {
            continue;
        };
        let Some((device_num, _)) = device_part.split_once(':') else {
            continue;
        };
        let card_id = card_id.trim();
        let device_num = device_num.trim();
        if !card_id.chars().all(|c| c.is_ascii_digit())
            || !device_num.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        let name = match (card_part.find('['), card_part.find(']')) {
            (Some(open), Some(close)) if close > open => card_part[open + 1..close].to_owned(),
            _ => card_part.trim().to_owned(),
        };
        cards.push((format!("hw:{card_id},{device_num}"), name));
    }
    cards
}

/// `pactl list sources` blocks -> (source name, human description).
fn parse_pactl_sources(output: &str) -> Vec<(String, String)> {
    fn flush(
        name: &mut Option<String>,
        description: &mut Option<String>,
        out: &mut Vec<(String, String)>,
    ) {
        if let Some(n) = name.take() {
            let d = description.take().unwrap_or_else(|| n.clone());
            out.push((n, d));
        }
        *description = None;
    }

    let mut sources = Vec::new();
    let mut name: Option<String> = None;
    let mut description: Option<String> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Source #") {
            flush(&mut name, &mut description, &mut sources);
        } else if let Some(value) = trimmed.strip_prefix("Name:") {
            name = Some(value.trim().to_owned());
        } else if let Some(value) = trimmed.strip_prefix("Description:") {
            description = Some(value.trim().to_owned());
        }
    }
    flush(&mut name, &mut description, &mut sources);
    sources
}

// ---------------------------------------------------------------------------
// macOS (ffmpeg -f avfoundation -list_devices)
// ---------------------------------------------------------------------------

async fn scan_avfoundation(kind: DeviceKind) -> HashMap<String, LocalDevice> {
    let Some(output) =
        command_output("ffmpeg", &["-f", "avfoundation", "-list_devices", "true", "-i", ""]).await
    else {
        return HashMap::new();
    };
    let mut devices = HashMap::new();
    for (index, name) in parse_avfoundation_devices(&output, kind) {
        let device_id = format!("avfoundation:{}:{}", kind.as_str(), index);
        let device =
            LocalDevice::new(&device_id, name, kind, index.to_string(), CaptureDriver::AvFoundation);
        devices.insert(device_id, online(device));
    }
    devices
}

/// Entries of the requested section, as (capture index, name).
fn parse_avfoundation_devices(output: &str, kind: DeviceKind) -> Vec<(u32, String)> {
    let mut devices = Vec::new();
    let mut in_section = false;
    for line in output.lines() {
        if line.contains("AVFoundation video devices") {
            in_section = kind == DeviceKind::Video;
            continue;
        }
        if line.contains("AVFoundation audio devices") {
            in_section = kind == DeviceKind::Audio;
            continue;
        }
        if !in_section {
            continue;
        }
        // "[AVFoundation indev @ 0x...] [0] FaceTime HD Camera"
        let Some(open) = line.rfind('[') else { continue };
        let Some(close_offset) = line[open..].find(']') else {
            continue;
        };
        let index_str = &line[open + 1..open + close_offset];
        let Ok(index) = index_str.parse::<u32>() else {
            continue;
        };
        let name = line[open + close_offset + 1..].trim();
        if !name.is_empty() {
            devices.push((index, name.to_owned()));
        }
    }
    devices
}

// ---------------------------------------------------------------------------
// Windows (ffmpeg -f dshow -list_devices)
// ---------------------------------------------------------------------------

async fn scan_dshow(kind: DeviceKind) -> HashMap<String, LocalDevice> {
    let Some(output) =
        command_output("ffmpeg", &["-f", "dshow", "-list_devices", "true", "-i", "dummy"]).await
    else {
        return HashMap::new();
    };
    let mut devices = HashMap::new();
    for name in parse_dshow_devices(&output, kind) {
        let device_id = format!("dshow:{}:{}", kind.as_str(), name);
        let device = LocalDevice::new(&device_id, &name, kind, &name, CaptureDriver::Dshow);
        devices.insert(device_id, online(device));
    }
    devices
}

/// Quoted device names from lines tagged "(video)" / "(audio)".
fn parse_dshow_devices(output: &str, kind: DeviceKind) -> Vec<String> {
    let tag = match kind {
        DeviceKind::Video => "(video)",
        DeviceKind::Audio => "(audio)",
    };
    let mut names = Vec::new();
    for line in output.lines() {
        if !line.contains(tag) {
            continue;
        }
        if let Some(open) = line.find('"')
            && let Some(close_offset) = line[open + 1..].find('"')
        {
            names.push(line[open + 1..open + 1 + close_offset].to_owned());
        }
    }
    names
}
