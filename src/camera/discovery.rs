//! Camera discovery and environment probing.
//!
//! Everything here is best-effort: a failed directory listing, a missing
//! system tool or a timeout degrades to an empty or default value.

use crate::camera::gstreamer;
use crate::camera::session::open_backend;
use crate::camera::source::CaptureTuning;
use crate::common::DeviceBackend;
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const TOOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a device entry was found, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiscoverySource {
    ByPath,
    ById,
    GlobFallback,
}

impl DiscoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoverySource::ByPath => "by-path",
            DiscoverySource::ById => "by-id",
            DiscoverySource::GlobFallback => "video-glob",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    pub path: PathBuf,
    pub display_name: String,
    pub source: DiscoverySource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraEnvironment {
    pub v4l2_available: bool,
    pub pipewire_running: bool,
    pub alternate_backend_available: bool,
    pub devices_by_path: Vec<String>,
    pub devices_by_id: Vec<String>,
}

/// Result of opening a device and reading one frame from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProbe {
    pub success: bool,
    pub is_gray: bool,
    pub error: Option<String>,
}

impl DeviceProbe {
    fn failed(error: impl Into<String>) -> Self {
        Self { success: false, is_gray: false, error: Some(error.into()) }
    }
}

/// Host queries that shell out to system tools.
pub trait SystemProbe {
    /// Human-readable product name of a device node, if known.
    fn device_name(&self, path: &Path) -> Option<String>;

    /// Whether a process with exactly this name is running.
    fn service_running(&self, name: &str) -> bool;
}

/// `udevadm` and `pgrep` on the real host, each bounded by a timeout.
pub struct HostProbe {
    timeout: Duration,
}

impl Default for HostProbe {
    fn default() -> Self {
        Self { timeout: TOOL_TIMEOUT }
    }
}

impl SystemProbe for HostProbe {
    fn device_name(&self, path: &Path) -> Option<String> {
        let mut command = Command::new("udevadm");
        command.args(["info", "-r", "--query=all", "-n"]).arg(path);
        let output = run_with_timeout(command, self.timeout)?;
        if !output.status.success() {
            return None;
        }
        parse_product_name(&String::from_utf8_lossy(&output.stdout))
    }

    fn service_running(&self, name: &str) -> bool {
        let mut command = Command::new("pgrep");
        command.args(["-x", name]);
        run_with_timeout(command, self.timeout)
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

/// Runs a command, killing it if it outlives `timeout`. Stdout is drained on
/// a reader thread while the child runs.
fn run_with_timeout(mut command: Command, timeout: Duration) -> Option<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    let mut stdout = child.stdout.take()?;
    let reader = thread::spawn(move || {
        let mut buffer = Vec::new();
        stdout.read_to_end(&mut buffer).map(|_| buffer)
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
        }
    };

    // The pipe closes once the child is gone, so the reader always finishes
    let stdout = reader.join().ok()?.ok()?;
    Some(Output { status: status?, stdout, stderr: Vec::new() })
}

/// First `...product...=<name>` line of `udevadm info` output.
pub fn parse_product_name(udevadm: &str) -> Option<String> {
    udevadm.lines().find_map(|line| {
        let product_at = line.to_ascii_lowercase().find("product")?;
        let eq_at = line.rfind('=')?;
        (eq_at > product_at).then(|| line[eq_at + 1..].to_string())
    })
}

pub struct DeviceLocator {
    dev_root: PathBuf,
    probe: Box<dyn SystemProbe>,
}

impl DeviceLocator {
    /// Locator over the real `/dev` tree.
    pub fn host() -> Self {
        Self::new("/dev", Box::new(HostProbe::default()))
    }

    pub fn new(dev_root: impl Into<PathBuf>, probe: Box<dyn SystemProbe>) -> Self {
        Self { dev_root: dev_root.into(), probe }
    }

    pub fn detect_environment(&self) -> CameraEnvironment {
        let devices_by_path = sorted_entries(&self.dev_root.join("v4l/by-path"));
        let devices_by_id = sorted_entries(&self.dev_root.join("v4l/by-id"));

        CameraEnvironment {
            v4l2_available: !devices_by_path.is_empty() || !devices_by_id.is_empty(),
            pipewire_running: self.probe.service_running("pipewire"),
            alternate_backend_available: gstreamer::is_available(),
            devices_by_path,
            devices_by_id,
        }
    }

    /// Devices from by-path, then by-id, then `video*` nodes, one per real path.
    pub fn discover_devices(&self) -> Vec<CameraDevice> {
        let mut devices = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for (dir, source) in [
            (self.dev_root.join("v4l/by-path"), DiscoverySource::ByPath),
            (self.dev_root.join("v4l/by-id"), DiscoverySource::ById),
        ] {
            for entry in sorted_entries(&dir) {
                let real_path = real_path(&dir.join(&entry));
                if !seen.insert(real_path.clone()) {
                    continue;
                }
                devices.push(CameraDevice {
                    display_name: self.display_name(&real_path),
                    path: real_path,
                    source,
                });
            }
        }

        for entry in sorted_entries(&self.dev_root) {
            if !entry.starts_with("video") {
                continue;
            }
            let dev_path = self.dev_root.join(&entry);
            if !seen.insert(real_path(&dev_path)) {
                continue;
            }
            devices.push(CameraDevice {
                display_name: self.display_name(&dev_path),
                path: dev_path,
                source: DiscoverySource::GlobFallback,
            });
        }

        devices
    }

    fn display_name(&self, path: &Path) -> String {
        self.probe.device_name(path).unwrap_or_else(|| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        })
    }
}

fn sorted_entries(dir: &Path) -> Vec<String> {
    let mut entries: Vec<String> = fs::read_dir(dir)
        .map(|read_dir| {
            read_dir
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    entries.sort();
    entries
}

fn real_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Opens `path`, reads exactly one frame and releases the device again.
pub fn test_device_open(path: &Path, backend: Option<DeviceBackend>) -> DeviceProbe {
    let backend = backend.unwrap_or_default();
    let mut source = match open_backend(path, backend, &CaptureTuning::default()) {
        Ok(source) => source,
        Err(e) => {
            tracing::debug!(
                "Test open of {} with {} failed: {:#}",
                path.display(),
                backend.as_str(),
                e
            );
            return DeviceProbe::failed("Camera could not be opened");
        }
    };

    let frame = source.read();
    drop(source);

    match frame.map_err(|e| e.to_string()).and_then(|raw| raw.decode().map_err(|e| e.to_string())) {
        Ok(image) => DeviceProbe {
            success: true,
            is_gray: crate::camera::decode::is_gray_frame(&image),
            error: None,
        },
        Err(e) => {
            tracing::debug!("Test read of {} failed: {}", path.display(), e);
            DeviceProbe::failed("Failed to read a frame")
        }
    }
}
