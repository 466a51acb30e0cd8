//! Stream orchestration: port assignment, child-process launch and
//! supervision, and the per-manager stream registry.
//!
//! The stream map, port allocation, process launches, and registry insertion
//! all happen under one async mutex, so two concurrent starts for the same
//! `(device, protocol)` pair either both observe the existing stream or one
//! creates it and the other finds it.  Process handles never leave this
//! module; callers see `StreamSnapshot`s.
//!
//! There is no background liveness monitor: a dead transcoder is noticed on
//! the next start (reaped and relaunched) or stop.

use crate::launcher;
use crate::settings::StreamingSettings;
use av_core::{Device, DeviceKind, StreamProtocol, StreamSnapshot};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Ports probed above the per-protocol base before giving up.
const PORT_SCAN_SPAN: u16 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no transcoder input arguments for device '{device_id}' on {os}")]
    UnsupportedDevice { device_id: String, os: String },
    #[error("no free port in range {base}-{limit}")]
    OutOfPorts { base: u16, limit: u16 },
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("ancillary process exited during startup ({status})")]
    AncillaryExited { status: std::process::ExitStatus },
    #[error("transcoder exited during startup ({status})")]
    TranscoderExited { status: std::process::ExitStatus },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a start request.
#[derive(Debug)]
pub enum StartOutcome {
    /// A new stream was created; the caller should emit a start event.
    Started(StreamSnapshot),
    /// A live stream already served this `(device, protocol)` pair.
    AlreadyRunning { url: String },
}

/// On-demand liveness of a registered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Running,
    Stopped,
    NotFound,
}

struct Stream {
    stream_id: String,
    device_id: String,
    kind: DeviceKind,
    protocol: StreamProtocol,
    url: String,
    port: u16,
    output_dir: PathBuf,
    transcoder: Child,
    ancillary: Option<Child>,
}

impl Stream {
    fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            stream_id: self.stream_id.clone(),
            device_id: self.device_id.clone(),
            kind: self.kind,
            protocol: self.protocol,
            url: self.url.clone(),
            port: self.port,
        }
    }

    /// Still-running means the transcoder has not reported an exit status.
    fn is_alive(&mut self) -> bool {
        matches!(self.transcoder.try_wait(), Ok(None))
    }

    async fn terminate_all(&mut self, grace: Duration) {
        terminate_child(&mut self.transcoder, grace).await;
        if let Some(ancillary) = self.ancillary.as_mut() {
            terminate_child(ancillary, grace).await;
        }
    }
}

pub struct StreamOrchestrator {
    settings: StreamingSettings,
    streams_dir: PathBuf,
    streams: Mutex<HashMap<String, Stream>>,
}

impl StreamOrchestrator {
    pub fn new(settings: StreamingSettings, streams_dir: PathBuf) -> Self {
        StreamOrchestrator {
            settings,
            streams_dir,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Start a stream for `device` over `protocol`, or return the URL of the
    /// live one already covering that pair.
    pub async fn start_stream(
        &self,
        device: &Device,
        protocol: StreamProtocol,
    ) -> Result<StartOutcome, OrchestratorError> {
        let mut streams = self.streams.lock().await;

        // One stream per (device, protocol).  A dead one is reaped here —
        // this is the only place short of stop where liveness is observed.
        let existing_id = streams
            .iter()
            .find(|(_, s)| s.device_id == device.id() && s.protocol == protocol)
            .map(|(id, _)| id.clone());
        if let Some(id) = existing_id {
            let alive = match streams.get_mut(&id) {
                Some(stream) => stream.is_alive(),
                None => false,
            };
            if alive {
                let stream = streams.get_mut(&id).expect("checked alive above");
                let url = stream.url.clone();
                debug!(device_id = %device.id(), %protocol, "stream already running");
                return Ok(StartOutcome::AlreadyRunning { url });
            } else if let Some(mut dead) = streams.remove(&id) {
                warn!(stream_id = %id, "reaping dead stream before restart");
                dead.terminate_all(self.settings.stop_timeout).await;
            }
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let output_dir = self.streams_dir.join(&stream_id);
        tokio::fs::create_dir_all(&output_dir).await?;

        let in_use: HashSet<u16> = streams.values().map(|s| s.port).collect();
        let base = self.port_base(protocol);
        let port = find_free_port(base, PORT_SCAN_SPAN, &in_use, self.settings.port_probe_timeout)
            .await?;

        let os = std::env::consts::OS;
        let input = launcher::input_args(protocol, device, os).ok_or_else(|| {
            OrchestratorError::UnsupportedDevice {
                device_id: device.id().to_owned(),
                os: os.to_owned(),
            }
        })?;
        let output = launcher::output_args(
            protocol,
            device.kind(),
            port,
            &stream_id,
            &self.settings.stun_server,
        );

        for (filename, contents) in
            launcher::config_files(protocol, device, port, &stream_id, &self.settings.stun_server)
        {
            tokio::fs::write(output_dir.join(filename), contents).await?;
        }

        // The output directory is kept on failure for post-mortem.
        let mut ancillary = match launcher::ancillary_command(protocol, port, &output_dir, &self.settings)
        {
            Some((program, args)) => {
                let mut child = spawn_quiet(&program, &args)?;
                tokio::time::sleep(self.settings.ancillary_grace).await;
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(OrchestratorError::AncillaryExited { status });
                }
                Some(child)
            }
            None => None,
        };

        let program = self.transcoder_program(protocol);
        let mut args = launcher::transcoder_args_prefix(protocol);
        args.extend(input);
        args.extend(output);
        debug!(%program, ?args, "launching transcoder");

        let mut transcoder = match spawn_quiet(program, &args) {
            Ok(child) => child,
            Err(e) => {
                if let Some(child) = ancillary.as_mut() {
                    terminate_child(child, self.settings.stop_timeout).await;
                }
                return Err(e);
            }
        };
        tokio::time::sleep(self.settings.startup_grace).await;
        if let Ok(Some(status)) = transcoder.try_wait() {
            if let Some(child) = ancillary.as_mut() {
                terminate_child(child, self.settings.stop_timeout).await;
            }
            return Err(OrchestratorError::TranscoderExited { status });
        }

        let url = launcher::stream_url(protocol, port, &stream_id);
        let stream = Stream {
            stream_id: stream_id.clone(),
            device_id: device.id().to_owned(),
            kind: device.kind(),
            protocol,
            url,
            port,
            output_dir,
            transcoder,
            ancillary,
        };
        let snapshot = stream.snapshot();
        streams.insert(stream_id.clone(), stream);
        info!(
            stream_id = %stream_id,
            device_id = %device.id(),
            %protocol,
            port,
            url = %snapshot.url,
            "stream started"
        );
        Ok(StartOutcome::Started(snapshot))
    }

    /// Stop a stream: graceful termination (bounded), then removal.  `None`
    /// for an unknown id, so repeated stops are safe.
    pub async fn stop_stream(&self, stream_id: &str) -> Option<StreamSnapshot> {
        let mut streams = self.streams.lock().await;
        let mut stream = streams.remove(stream_id)?;
        stream.terminate_all(self.settings.stop_timeout).await;
        let snapshot = stream.snapshot();
        info!(
            stream_id,
            device_id = %snapshot.device_id,
            output_dir = %stream.output_dir.display(),
            "stream stopped"
        );
        Some(snapshot)
    }

    /// Stop every stream; used at manager shutdown.  Returns what was
    /// stopped so the caller can publish the events.
    pub async fn shutdown(&self) -> Vec<StreamSnapshot> {
        let ids = self.stream_ids().await;
        let mut stopped = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(snapshot) = self.stop_stream(&id).await {
                stopped.push(snapshot);
            }
        }
        stopped
    }

    pub async fn stream_ids(&self) -> Vec<String> {
        self.streams.lock().await.keys().cloned().collect()
    }

    /// Current streams as snapshots (`get_streams`).
    pub async fn snapshots(&self) -> HashMap<String, StreamSnapshot> {
        self.streams
            .lock()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.snapshot()))
            .collect()
    }

    /// Query a stream's liveness.  This is one of the only two places (with
    /// start's reap) where a transcoder exit becomes observable.
    pub async fn stream_status(&self, stream_id: &str) -> StreamStatus {
        let mut streams = self.streams.lock().await;
        match streams.get_mut(stream_id) {
            Some(stream) => {
                if stream.is_alive() {
                    StreamStatus::Running
                } else {
                    StreamStatus::Stopped
                }
            }
            None => StreamStatus::NotFound,
        }
    }

    /// The live stream covering `(device_id, protocol)`, if any.
    pub async fn find_stream(&self, device_id: &str, protocol: StreamProtocol) -> Option<StreamSnapshot> {
        self.streams
            .lock()
            .await
            .values()
            .find(|s| s.device_id == device_id && s.protocol == protocol)
            .map(Stream::snapshot)
    }

    fn port_base(&self, protocol: StreamProtocol) -> u16 {
        match protocol {
            StreamProtocol::Rtsp => self.settings.rtsp_port_start,
            StreamProtocol::Rtmp => self.settings.rtmp_port_start,
            StreamProtocol::Webrtc => self.settings.webrtc_port_start,
        }
    }

    fn transcoder_program(&self, protocol: StreamProtocol) -> &str {
        match protocol {
            StreamProtocol::Rtsp | StreamProtocol::Rtmp => &self.settings.transcoder,
            StreamProtocol::Webrtc => &self.settings.webrtc_transcoder,
        }
    }
}

/// First port at or above `base` (bounded by `base + span`) that no live
/// stream owns and nothing on the host answers on.  The probe-then-bind race
/// against other processes is accepted; live-stream ports are excluded
/// outright because a just-started transcoder may not be listening yet.
pub(crate) async fn find_free_port(
    base: u16,
    span: u16,
    in_use: &HashSet<u16>,
    probe_timeout: Duration,
) -> Result<u16, OrchestratorError> {
    let limit = base.saturating_add(span);
    for port in base..limit {
        if in_use.contains(&port) {
            continue;
        }
        let connect = TcpStream::connect(("127.0.0.1", port));
        let bound = match tokio::time::timeout(probe_timeout, connect).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(_)) | Err(_) => false,
        };
        if !bound {
            return Ok(port);
        }
    }
    Err(OrchestratorError::OutOfPorts { base, limit })
}

fn spawn_quiet(program: &str, args: &[String]) -> Result<Child, OrchestratorError> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| OrchestratorError::Spawn {
            program: program.to_owned(),
            source,
        })
}

/// Graceful stop: SIGTERM (unix), bounded wait, then a hard kill.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: signalling a pid we spawned and still hold a handle to.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("child ignored graceful termination; killing");
            let _ = child.kill().await;
        }
    }
}
