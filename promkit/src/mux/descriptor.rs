//! Worker descriptor files.
//!
//! A worker advertises its ephemeral loopback endpoint by writing
//! `<mux root>/<namespace>/port.<pid>`, a key-per-line text file:
//!
//! ```text
//! endpoint 127.0.0.1:43211
//! component gateway-1
//! pid 43192
//! path /metrics
//! ```
//!
//! Lines with unknown prefixes are ignored and the order is not
//! significant. The aggregator scans the directory on every scrape and
//! removes descriptors whose pid is no longer alive.

use crate::BootstrapResult;
use anyhow::Context as _;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-host root of the descriptor directories.
pub const MUX_ROOT: &str = "/tmp/promkit-mux";

/// A worker endpoint advertised through the descriptor directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerEndpoint {
    /// Host part of the advertised endpoint.
    pub host: String,

    /// Loopback port serving the worker's metrics.
    pub port: u16,

    /// Value of the worker's `component` label.
    pub component: String,

    /// Pid of the worker process; used for liveness pruning.
    pub pid: i32,

    /// URL path serving the text exposition.
    pub path: String,
}

impl Default for WorkerEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            component: String::new(),
            pid: 0,
            path: "/metrics".into(),
        }
    }
}

/// Descriptor directory for a namespace: `<MUX_ROOT>/<ns>`, where an empty
/// namespace maps to `default`.
pub(crate) fn mux_dir(namespace: &str) -> PathBuf {
    let ns = if namespace.is_empty() { "default" } else { namespace };
    Path::new(MUX_ROOT).join(ns)
}

/// Writes the descriptor for `endpoint`, creating the directory if needed.
/// Returns the descriptor path so it can be removed on shutdown.
pub(crate) fn write_descriptor(dir: &Path, endpoint: &WorkerEndpoint) -> BootstrapResult<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating descriptor directory {}", dir.display()))?;

    let file = dir.join(format!("port.{}", endpoint.pid));
    let body = format!(
        "endpoint 127.0.0.1:{}\ncomponent {}\npid {}\npath {}\n",
        endpoint.port, endpoint.component, endpoint.pid, endpoint.path
    );
    fs::write(&file, body).with_context(|| format!("writing descriptor {}", file.display()))?;

    Ok(file)
}

fn parse_descriptor(contents: &str) -> WorkerEndpoint {
    let mut endpoint = WorkerEndpoint::default();

    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("endpoint ") {
            if let Some((host, port)) = rest.split_once(':') {
                endpoint.host = host.to_owned();
                endpoint.port = port.trim().parse().unwrap_or(0);
            }
        } else if let Some(rest) = line.strip_prefix("component ") {
            endpoint.component = rest.to_owned();
        } else if let Some(rest) = line.strip_prefix("pid ") {
            endpoint.pid = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("path ") {
            endpoint.path = rest.to_owned();
        }
    }

    endpoint
}

/// Reads every descriptor in `dir`, pruning files whose pid is dead.
/// Descriptors without a usable port or component are dropped.
pub(crate) fn scan_dir(dir: &Path) -> Vec<WorkerEndpoint> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(contents) = fs::read_to_string(&path) else {
            continue;
        };

        let endpoint = parse_descriptor(&contents);

        if endpoint.pid > 0 && !pid_alive(endpoint.pid) {
            if let Err(err) = fs::remove_file(&path) {
                debug!("failed to prune stale descriptor {}: {err}", path.display());
            }
            continue;
        }

        if endpoint.port > 0 && !endpoint.component.is_empty() {
            out.push(endpoint);
        }
    }

    out
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = WorkerEndpoint {
            host: "127.0.0.1".into(),
            port: 43211,
            component: "gateway-1".into(),
            pid: std::process::id() as i32,
            path: "/metrics".into(),
        };

        let file = write_descriptor(dir.path(), &endpoint).unwrap();
        assert_eq!(
            file.file_name().unwrap().to_str().unwrap(),
            format!("port.{}", endpoint.pid)
        );

        let scanned = scan_dir(dir.path());
        assert_eq!(scanned, vec![endpoint]);
    }

    #[test]
    fn unknown_prefixes_are_ignored() {
        let endpoint = parse_descriptor(
            "endpoint 127.0.0.1:9000\nflavor vanilla\ncomponent c1\npid 1\npath /m\nx\n",
        );

        assert_eq!(endpoint.port, 9000);
        assert_eq!(endpoint.component, "c1");
        assert_eq!(endpoint.pid, 1);
        assert_eq!(endpoint.path, "/m");
    }

    #[test]
    fn dead_pid_descriptor_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("port.999999");
        std::fs::write(
            &file,
            "endpoint 127.0.0.1:9000\ncomponent ghost\npid 999999\npath /metrics\n",
        )
        .unwrap();

        assert!(scan_dir(dir.path()).is_empty());
        assert!(!file.exists());
    }

    #[test]
    fn incomplete_descriptors_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("port.0"), "endpoint 127.0.0.1:9000\n").unwrap();
        std::fs::write(dir.path().join("port.1"), "component nameless\n").unwrap();

        assert!(scan_dir(dir.path()).is_empty());
    }
}
