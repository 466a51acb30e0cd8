//! Per-protocol transcoder argument construction.
//!
//! Three stateless strategies, one per published protocol.  RTSP and RTMP
//! drive ffmpeg; WebRTC drives a GStreamer pipeline ending in `webrtcbin`.
//! Everything is a deterministic argument vector — no shell strings, no
//! interpolation beyond device attributes.
//!
//! The OS is a parameter (not `cfg!`) so the whole driver matrix stays
//! testable on any host.

use crate::settings::StreamingSettings;
use av_core::{CaptureDriver, Device, DeviceKind, LocalDevice, NetworkDevice, StreamProtocol, TransportProtocol};
use std::path::Path;

/// Input-stage arguments for the transcoder, or `None` when the
/// platform/driver combination is unsupported.
pub fn input_args(protocol: StreamProtocol, device: &Device, os: &str) -> Option<Vec<String>> {
    match (protocol, device) {
        (StreamProtocol::Webrtc, Device::Local(local)) => gst_capture_pipeline(local, os),
        (StreamProtocol::Webrtc, Device::Network(remote)) => Some(gst_source_pipeline(remote)),
        (_, Device::Local(local)) => ffmpeg_capture_args(local, os),
        (_, Device::Network(remote)) => Some(ffmpeg_source_args(remote)),
    }
}

/// Output-stage arguments, terminating in the protocol's destination.
pub fn output_args(
    protocol: StreamProtocol,
    kind: DeviceKind,
    port: u16,
    stream_id: &str,
    stun_server: &str,
) -> Vec<String> {
    match protocol {
        StreamProtocol::Rtsp => {
            let mut args = ffmpeg_encoder_args(kind);
            args.extend(strings(&["-f", "rtsp"]));
            args.push(stream_url(protocol, port, stream_id));
            args
        }
        StreamProtocol::Rtmp => {
            let mut args = ffmpeg_encoder_args(kind);
            args.extend(strings(&["-f", "flv"]));
            args.push(stream_url(protocol, port, stream_id));
            args
        }
        StreamProtocol::Webrtc => {
            let mut args = vec!["!".to_owned()];
            args.extend(gst_encoding_pipeline(kind));
            args.extend(strings(&["!", "webrtcbin", "name=webrtcbin"]));
            args.push(format!("stun-server={stun_server}"));
            args
        }
    }
}

/// The externally reachable endpoint for a stream.
pub fn stream_url(protocol: StreamProtocol, port: u16, stream_id: &str) -> String {
    match protocol {
        StreamProtocol::Rtsp => format!("rtsp://localhost:{port}/{stream_id}"),
        StreamProtocol::Rtmp => format!("rtmp://localhost:{port}/live/{stream_id}"),
        StreamProtocol::Webrtc => {
            format!("http://localhost:{port}/webrtc.html?stream={stream_id}")
        }
    }
}

/// Fixed arguments the transcoder binary takes before the input stage.
pub fn transcoder_args_prefix(protocol: StreamProtocol) -> Vec<String> {
    match protocol {
        StreamProtocol::Rtsp | StreamProtocol::Rtmp => strings(&["-hide_banner"]),
        StreamProtocol::Webrtc => strings(&["-v"]),
    }
}

/// The helper process some protocols need next to the transcoder:
/// an RTMP server, or a static HTTP server for the WebRTC page.
pub fn ancillary_command(
    protocol: StreamProtocol,
    port: u16,
    output_dir: &Path,
    settings: &StreamingSettings,
) -> Option<(String, Vec<String>)> {
    match protocol {
        StreamProtocol::Rtsp => None,
        StreamProtocol::Rtmp => Some((
            settings.rtmp_server.clone(),
            vec![
                "-c".to_owned(),
                output_dir.join("nginx.conf").to_string_lossy().into_owned(),
                "-p".to_owned(),
                output_dir.to_string_lossy().into_owned(),
            ],
        )),
        StreamProtocol::Webrtc => Some((
            settings.http_server.clone(),
            vec![
                "-m".to_owned(),
                "http.server".to_owned(),
                port.to_string(),
                "--directory".to_owned(),
                output_dir.to_string_lossy().into_owned(),
            ],
        )),
    }
}

/// Files to materialize in the stream's output directory before launch.
pub fn config_files(
    protocol: StreamProtocol,
    device: &Device,
    port: u16,
    stream_id: &str,
    stun_server: &str,
) -> Vec<(&'static str, String)> {
    match protocol {
        StreamProtocol::Rtsp => Vec::new(),
        StreamProtocol::Rtmp => vec![("nginx.conf", nginx_rtmp_config(port))],
        StreamProtocol::Webrtc => vec![
            (
                "webrtc_config.json",
                webrtc_config_json(device, port, stream_id, stun_server),
            ),
            ("webrtc.html", webrtc_client_page(stream_id, stun_server)),
        ],
    }
}

// ---------------------------------------------------------------------------
// ffmpeg argument building (RTSP / RTMP)
// ---------------------------------------------------------------------------

fn ffmpeg_capture_args(device: &LocalDevice, os: &str) -> Option<Vec<String>> {
    let path = &device.system_path;
    let args = match (device.kind, os, device.driver) {
        (DeviceKind::Video, "linux", CaptureDriver::V4l2) => {
            vec!["-f".into(), "v4l2".into(), "-i".into(), path.clone()]
        }
        (DeviceKind::Video, "macos", CaptureDriver::AvFoundation) => vec![
            "-f".into(),
            "avfoundation".into(),
            "-framerate".into(),
            "30".into(),
            "-i".into(),
            format!("{path}:none"),
        ],
        (DeviceKind::Video, "windows", CaptureDriver::Dshow) => vec![
            "-f".into(),
            "dshow".into(),
            "-i".into(),
            format!("video={path}"),
        ],
        (DeviceKind::Audio, "linux", CaptureDriver::Alsa) => {
            vec!["-f".into(), "alsa".into(), "-i".into(), path.clone()]
        }
        (DeviceKind::Audio, "linux", CaptureDriver::Pulse) => {
            vec!["-f".into(), "pulse".into(), "-i".into(), path.clone()]
        }
        (DeviceKind::Audio, "macos", CaptureDriver::AvFoundation) => vec![
            "-f".into(),
            "avfoundation".into(),
            "-i".into(),
            format!("none:{path}"),
        ],
        (DeviceKind::Audio, "windows", CaptureDriver::Dshow) => vec![
            "-f".into(),
            "dshow".into(),
            "-i".into(),
            format!("audio={path}"),
        ],
        _ => return None,
    };
    Some(args)
}

fn ffmpeg_source_args(device: &NetworkDevice) -> Vec<String> {
    let url = device.source_url();
    match device.protocol {
        TransportProtocol::Rtsp => {
            vec!["-rtsp_transport".into(), "tcp".into(), "-i".into(), url]
        }
        TransportProtocol::Rtmp | TransportProtocol::Http => vec!["-i".into(), url],
    }
}

/// Low-latency H.264 plus AAC for video; AAC alone for audio-only.
fn ffmpeg_encoder_args(kind: DeviceKind) -> Vec<String> {
    match kind {
        DeviceKind::Video => strings(&[
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-c:a",
            "aac",
            "-b:a",
            "128k",
        ]),
        DeviceKind::Audio => strings(&["-c:a", "aac", "-b:a", "128k"]),
    }
}

// ---------------------------------------------------------------------------
// GStreamer pipeline building (WebRTC)
// ---------------------------------------------------------------------------

fn gst_capture_pipeline(device: &LocalDevice, os: &str) -> Option<Vec<String>> {
    let path = &device.system_path;
    let source = match (device.kind, os, device.driver) {
        (DeviceKind::Video, "linux", CaptureDriver::V4l2) => vec![
            format!("v4l2src device={path}"),
            "!".to_owned(),
            "video/x-raw,width=640,height=480".to_owned(),
            "!".to_owned(),
            "videoconvert".to_owned(),
        ],
        (DeviceKind::Video, "macos", CaptureDriver::AvFoundation) => vec![
            format!("avfvideosrc device-index={path}"),
            "!".to_owned(),
            "video/x-raw,width=640,height=480".to_owned(),
            "!".to_owned(),
            "videoconvert".to_owned(),
        ],
        (DeviceKind::Video, "windows", CaptureDriver::Dshow) => vec![
            format!("dshowvideosrc device-name={path}"),
            "!".to_owned(),
            "video/x-raw,width=640,height=480".to_owned(),
            "!".to_owned(),
            "videoconvert".to_owned(),
        ],
        (DeviceKind::Audio, "linux", CaptureDriver::Alsa) => vec![
            format!("alsasrc device={path}"),
            "!".to_owned(),
            "audioconvert".to_owned(),
        ],
        (DeviceKind::Audio, "linux", CaptureDriver::Pulse) => vec![
            format!("pulsesrc device={path}"),
            "!".to_owned(),
            "audioconvert".to_owned(),
        ],
        (DeviceKind::Audio, "macos", CaptureDriver::AvFoundation) => vec![
            format!("osxaudiosrc device={path}"),
            "!".to_owned(),
            "audioconvert".to_owned(),
        ],
        (DeviceKind::Audio, "windows", CaptureDriver::Dshow) => vec![
            format!("dshowaudiosrc device-name={path}"),
            "!".to_owned(),
            "audioconvert".to_owned(),
        ],
        _ => return None,
    };
    Some(source)
}

fn gst_source_pipeline(device: &NetworkDevice) -> Vec<String> {
    let url = device.source_url();
    let mut args = match device.protocol {
        TransportProtocol::Rtsp => vec![
            format!("rtspsrc location={url}"),
            "!".to_owned(),
            "rtpjitterbuffer".to_owned(),
        ],
        TransportProtocol::Rtmp => vec![
            format!("rtmpsrc location={url}"),
            "!".to_owned(),
            "flvdemux".to_owned(),
        ],
        TransportProtocol::Http => vec![format!("uridecodebin uri={url}")],
    };
    args.push("!".to_owned());
    args.push("decodebin".to_owned());
    match device.kind {
        DeviceKind::Video => args.extend(strings(&["!", "videoconvert"])),
        DeviceKind::Audio => args.extend(strings(&["!", "audioconvert"])),
    }
    args
}

fn gst_encoding_pipeline(kind: DeviceKind) -> Vec<String> {
    match kind {
        DeviceKind::Video => strings(&["x264enc", "tune=zerolatency", "!", "rtph264pay"]),
        DeviceKind::Audio => strings(&[
            "audioconvert",
            "!",
            "audioresample",
            "!",
            "opusenc",
            "!",
            "rtpopuspay",
        ]),
    }
}

// ---------------------------------------------------------------------------
// Generated ancillary files
// ---------------------------------------------------------------------------

/// Minimal nginx config: one RTMP server, one live application.
fn nginx_rtmp_config(port: u16) -> String {
    format!(
        "worker_processes 1;\n\
         events {{\n\
         \x20   worker_connections 1024;\n\
         }}\n\
         rtmp {{\n\
         \x20   server {{\n\
         \x20       listen {port};\n\
         \x20       chunk_size 4096;\n\
         \x20       application live {{\n\
         \x20           live on;\n\
         \x20           record off;\n\
         \x20       }}\n\
         \x20   }}\n\
         }}\n"
    )
}

fn webrtc_config_json(device: &Device, port: u16, stream_id: &str, stun_server: &str) -> String {
    serde_json::to_string_pretty(&serde_json::json!({
        "port": port,
        "stream_id": stream_id,
        "device_id": device.id(),
        "device_type": device.kind(),
        "stun_server": stun_server,
    }))
    .unwrap_or_default()
}

/// The static page the WebRTC HTTP server roots at the output directory.
fn webrtc_client_page(stream_id: &str, stun_server: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>avhub stream {stream_id}</title>
</head>
<body>
<video id="remote" autoplay playsinline controls></video>
<script>
const streamId = "{stream_id}";
const pc = new RTCPeerConnection({{ iceServers: [{{ urls: "{stun_server}" }}] }});
pc.ontrack = (event) => {{
  document.getElementById("remote").srcObject = event.streams[0];
}};
const signaling = new WebSocket(`ws://${{location.host}}/signaling?stream=${{streamId}}`);
signaling.onmessage = async (message) => {{
  const data = JSON.parse(message.data);
  if (data.sdp) {{
    await pc.setRemoteDescription(new RTCSessionDescription(data.sdp));
    if (data.sdp.type === "offer") {{
      const answer = await pc.createAnswer();
      await pc.setLocalDescription(answer);
      signaling.send(JSON.stringify({{ sdp: pc.localDescription }}));
    }}
  }} else if (data.ice) {{
    await pc.addIceCandidate(new RTCIceCandidate(data.ice));
  }}
}};
pc.onicecandidate = (event) => {{
  if (event.candidate) {{
    signaling.send(JSON.stringify({{ ice: event.candidate }}));
  }}
}};
</script>
</body>
</html>
"#
    )
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}
