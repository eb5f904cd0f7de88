//! Optional startup diagnostics.
//!
//! A small marker file in the temp directory records that a helper instance
//! started, which mode it runs in, and when. Purely for post-mortem
//! debugging of launches whose console is hidden behind the elevation
//! boundary. Correctness never depends on it and every failure here is
//! swallowed.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use serde::Serialize;

#[derive(Serialize)]
struct RunMarker<'a> {
    pid: u32,
    mode: &'a str,
    version: &'a str,
    started_at: u64,
}

fn marker_path() -> PathBuf {
    std::env::temp_dir().join(format!("rpi-imager-helper-{}.json", std::process::id()))
}

/// Drop a marker file for this run. Returns the path so a clean exit can
/// remove it again.
pub fn write_start_marker(mode: &str) -> Option<PathBuf> {
    let marker = RunMarker {
        pid: std::process::id(),
        mode,
        version: env!("APP_VERSION"),
        started_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    };

    let path = marker_path();
    let json = serde_json::to_string_pretty(&marker).ok()?;
    match std::fs::write(&path, json) {
        Ok(()) => Some(path),
        Err(e) => {
            debug!("could not write start marker: {e}");
            None
        }
    }
}

/// Remove the marker written at startup.
pub fn remove_start_marker(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trip() {
        let path = write_start_marker("test").expect("temp dir should be writable");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"mode\": \"test\""));
        remove_start_marker(&path);
        assert!(!path.exists());
    }
}
