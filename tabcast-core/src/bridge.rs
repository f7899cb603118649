//! USB bridge adapter.
//!
//! Drives an Android Debug Bridge–compatible helper so a USB-attached
//! tablet can reach the host through reverse port forwarding
//! (`adb reverse tcp:<port> tcp:<port>`). Every failure here downgrades
//! to a log line — the client can always fall back to Wi-Fi.

use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, info, warn};

/// Well-known adb locations probed after `$PATH`.
const FALLBACK_LOCATIONS: &[&str] = &[
    "~/Android/Sdk/platform-tools/adb",
    "~/.android/sdk/platform-tools/adb",
    "/usr/local/bin/adb",
    "/usr/bin/adb",
    "/opt/android-sdk/platform-tools/adb",
];

// ── UsbBridge ────────────────────────────────────────────────────

pub struct UsbBridge {
    adb: Option<PathBuf>,
    port: u16,
    reversed: bool,
}

impl UsbBridge {
    /// Locate the adb helper; `setup` does the actual forwarding.
    pub fn new(port: u16) -> Self {
        let adb = locate_adb();
        match &adb {
            Some(path) => debug!(adb = %path.display(), "adb found"),
            None => info!("adb not found; USB connections unavailable"),
        }
        Self {
            adb,
            port,
            reversed: false,
        }
    }

    /// Set up reverse forwarding when a device is attached.
    pub fn setup(&mut self) {
        let Some(adb) = self.adb.clone() else { return };

        if !self.device_connected() {
            info!("no Android device on USB");
            return;
        }

        let spec = format!("tcp:{}", self.port);
        let ok = Command::new(&adb)
            .args(["reverse", &spec, &spec])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);

        if ok {
            self.reversed = true;
            info!(port = self.port, "USB reverse forwarding active");
        } else {
            warn!(port = self.port, "adb reverse failed; Wi-Fi only");
        }
    }

    /// Remove the forwarding set up by [`setup`](Self::setup).
    pub fn teardown(&mut self) {
        if !self.reversed {
            return;
        }
        if let Some(adb) = &self.adb {
            let spec = format!("tcp:{}", self.port);
            let _ = Command::new(adb)
                .args(["reverse", "--remove", &spec])
                .output();
        }
        self.reversed = false;
    }

    fn device_connected(&self) -> bool {
        let Some(adb) = &self.adb else { return false };
        Command::new(adb)
            .arg("devices")
            .output()
            .map(|out| has_device(&String::from_utf8_lossy(&out.stdout)))
            .unwrap_or(false)
    }
}

impl Drop for UsbBridge {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn locate_adb() -> Option<PathBuf> {
    // `adb version` succeeding means $PATH resolution works.
    if Command::new("adb")
        .arg("version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
    {
        return Some(PathBuf::from("adb"));
    }

    for location in FALLBACK_LOCATIONS {
        let expanded = expand_home(location);
        if expanded.is_file() {
            return Some(expanded);
        }
    }
    None
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

/// True when `adb devices` lists at least one authorised device.
fn has_device(output: &str) -> bool {
    output
        .lines()
        .skip(1) // "List of devices attached"
        .any(|line| line.split_whitespace().nth(1) == Some("device"))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_authorised_device() {
        let out = "List of devices attached\nR58M123ABC\tdevice\n";
        assert!(has_device(out));
    }

    #[test]
    fn ignores_unauthorised_and_offline_devices() {
        let out = "List of devices attached\n\
                   R58M123ABC\tunauthorized\n\
                   emulator-5554\toffline\n";
        assert!(!has_device(out));
    }

    #[test]
    fn empty_device_list() {
        assert!(!has_device("List of devices attached\n\n"));
    }

    #[test]
    fn home_expansion() {
        let expanded = expand_home("~/Android/Sdk/platform-tools/adb");
        assert!(!expanded.to_string_lossy().starts_with('~') || dirs::home_dir().is_none());
        assert_eq!(expand_home("/usr/bin/adb"), PathBuf::from("/usr/bin/adb"));
    }
}
