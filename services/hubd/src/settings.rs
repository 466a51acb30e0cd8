//! Typed settings extracted from the layered config store.
//!
//! The store stays stringly-keyed; everything the daemon actually runs on is
//! validated into these structs in one place, defaults filled where a key is
//! absent or out of range.

use av_config::ConfigStore;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    pub storage_path: PathBuf,
    pub log_level: String,
    pub local: LocalSettings,
    pub network: NetworkSettings,
    pub streaming: StreamingSettings,
}

#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub enable_video: bool,
    pub enable_audio: bool,
    pub scan_interval: Duration,
    pub auto_start: bool,
}

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub scan_interval: Duration,
    pub discovery_enabled: bool,
    pub discovery_methods: Vec<String>,
}

/// Stream orchestration knobs: per-protocol port bases, external binaries,
/// and the bounded operational timeouts.
#[derive(Debug, Clone)]
pub struct StreamingSettings {
    pub rtsp_port_start: u16,
    pub rtmp_port_start: u16,
    pub webrtc_port_start: u16,
    pub stun_server: String,
    /// ffmpeg (RTSP/RTMP transcoding).
    pub transcoder: String,
    /// gst-launch (WebRTC pipelines).
    pub webrtc_transcoder: String,
    /// Embedded RTMP server binary.
    pub rtmp_server: String,
    /// Static HTTP server binary for the WebRTC page.
    pub http_server: String,
    /// Post-launch liveness grace for the transcoder.
    pub startup_grace: Duration,
    /// Post-launch grace for ancillary servers.
    pub ancillary_grace: Duration,
    /// Graceful-termination wait before a hard kill.
    pub stop_timeout: Duration,
    /// Per-port TCP probe bound during allocation.
    pub port_probe_timeout: Duration,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        StreamingSettings {
            rtsp_port_start: 8554,
            rtmp_port_start: 1935,
            webrtc_port_start: 8080,
            stun_server: "stun://stun.l.google.com:19302".to_owned(),
            transcoder: "ffmpeg".to_owned(),
            webrtc_transcoder: "gst-launch-1.0".to_owned(),
            rtmp_server: "nginx".to_owned(),
            http_server: "python3".to_owned(),
            startup_grace: Duration::from_secs(2),
            ancillary_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
            port_probe_timeout: Duration::from_millis(100),
        }
    }
}

impl Settings {
    pub fn from_config(cfg: &ConfigStore) -> Self {
        let defaults = StreamingSettings::default();
        Settings {
            storage_path: PathBuf::from(cfg.str_or("system.storage_path", "storage")),
            log_level: cfg.str_or("system.log_level", "INFO"),
            local: LocalSettings {
                enable_video: cfg.bool_or("local_devices.enable_video", true),
                enable_audio: cfg.bool_or("local_devices.enable_audio", true),
                scan_interval: seconds_or(cfg, "local_devices.scan_interval", 60),
                auto_start: cfg.bool_or("local_devices.auto_start", false),
            },
            network: NetworkSettings {
                scan_interval: seconds_or(cfg, "network_devices.scan_interval", 60),
                discovery_enabled: cfg.bool_or("network_devices.discovery_enabled", true),
                discovery_methods: cfg
                    .str_list_or("network_devices.discovery_methods", &["onvif", "upnp", "mdns"]),
            },
            streaming: StreamingSettings {
                rtsp_port_start: port_or(cfg, "streaming.rtsp.port_start", 8554),
                rtmp_port_start: port_or(cfg, "streaming.rtmp.port_start", 1935),
                webrtc_port_start: port_or(cfg, "streaming.webrtc.port_start", 8080),
                stun_server: cfg.str_or("streaming.webrtc.stun_server", &defaults.stun_server),
                transcoder: cfg.str_or("streaming.transcoder", &defaults.transcoder),
                webrtc_transcoder: cfg
                    .str_or("streaming.webrtc.transcoder", &defaults.webrtc_transcoder),
                rtmp_server: cfg.str_or("streaming.rtmp.server", &defaults.rtmp_server),
                http_server: cfg.str_or("streaming.webrtc.http_server", &defaults.http_server),
                ..defaults
            },
        }
    }
}

fn seconds_or(cfg: &ConfigStore, path: &str, default: u64) -> Duration {
    let raw = cfg.int_or(path, default as i64);
    let secs = if raw > 0 { raw as u64 } else { default };
    Duration::from_secs(secs)
}

fn port_or(cfg: &ConfigStore, path: &str, default: u16) -> u16 {
    let raw = cfg.int_or(path, i64::from(default));
    u16::try_from(raw).unwrap_or(default)
}
