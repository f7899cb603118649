//! Virtual display adapter.
//!
//! Creates a secondary monitor for the tablet to mirror by enabling a
//! disconnected output with a freshly generated mode (`cvt` modeline +
//! `xrandr --newmode/--addmode/--output`). Creation failure is
//! non-fatal — the supervisor falls back to capturing the primary
//! monitor.
//!
//! The display position survives restarts via a small key=value file
//! in the user config directory so the virtual monitor reappears where
//! the user left it.

use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{Result, TabcastError};

/// Output name prefixes preferred when picking a disconnected output.
const PREFERRED_OUTPUTS: &[&str] = &["VIRTUAL", "DUMMY", "None"];

// ── VirtualDisplay ───────────────────────────────────────────────

pub struct VirtualDisplay {
    created: bool,
    output: String,
    mode: String,
    width: u32,
    height: u32,
    refresh: u32,
}

impl VirtualDisplay {
    pub fn new() -> Self {
        Self {
            created: false,
            output: String::new(),
            mode: String::new(),
            width: 0,
            height: 0,
            refresh: 0,
        }
    }

    /// Create and enable the virtual output.
    pub fn create(&mut self, width: u32, height: u32, refresh: u32) -> Result<()> {
        if self.created {
            self.destroy();
        }

        self.width = width;
        self.height = height;
        self.refresh = refresh;

        let query = run_capture("xrandr", &["--query"])
            .ok_or_else(|| TabcastError::TransientIo("xrandr not available".into()))?;
        let output = pick_unused_output(&query).ok_or_else(|| {
            TabcastError::TransientIo("no disconnected output available".into())
        })?;

        let cvt = run_capture(
            "cvt",
            &[&width.to_string(), &height.to_string(), &refresh.to_string()],
        )
        .ok_or_else(|| TabcastError::TransientIo("cvt not available".into()))?;
        let (mode, params) = parse_modeline(&cvt)
            .ok_or_else(|| TabcastError::TransientIo("unparsable cvt modeline".into()))?;

        // The mode may survive from a previous crash; addmode decides.
        let mut newmode_args = vec!["--newmode".to_string(), mode.clone()];
        newmode_args.extend(params);
        if !run_status("xrandr", &to_refs(&newmode_args)) {
            debug!(mode = %mode, "newmode failed (mode may already exist)");
        }

        if !run_status("xrandr", &["--addmode", &output, &mode]) {
            run_status("xrandr", &["--rmmode", &mode]);
            return Err(TabcastError::TransientIo(format!(
                "cannot add mode {mode} to {output}"
            )));
        }

        // Place right of the primary; plain enable as a fallback.
        let placed = match primary_output(&query) {
            Some(primary) => run_status(
                "xrandr",
                &["--output", &output, "--mode", &mode, "--right-of", &primary],
            ),
            None => false,
        };
        if !placed && !run_status("xrandr", &["--output", &output, "--mode", &mode]) {
            run_status("xrandr", &["--delmode", &output, &mode]);
            run_status("xrandr", &["--rmmode", &mode]);
            return Err(TabcastError::TransientIo(format!(
                "cannot enable output {output}"
            )));
        }

        self.output = output;
        self.mode = mode;
        self.created = true;
        info!(
            output = %self.output,
            width,
            height,
            refresh,
            "virtual display created"
        );
        Ok(())
    }

    /// Disable the output and delete the mode. Idempotent.
    pub fn destroy(&mut self) {
        if !self.created {
            return;
        }

        run_status("xrandr", &["--output", &self.output, "--off"]);
        run_status("xrandr", &["--delmode", &self.output, &self.mode]);
        run_status("xrandr", &["--rmmode", &self.mode]);

        info!(output = %self.output, "virtual display destroyed");
        self.output.clear();
        self.mode.clear();
        self.created = false;
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// 0-based monitor index of the virtual output — what the frame
    /// source targets.
    pub fn display_index(&self) -> Option<usize> {
        if !self.created {
            return None;
        }
        let monitors = run_capture("xrandr", &["--listmonitors"])?;
        parse_monitor_index(&monitors, &self.output)
    }

    /// Persist the current output position for the next session.
    pub fn save_position(&self) {
        if !self.created {
            return;
        }
        let Some(query) = run_capture("xrandr", &["--query"]) else {
            return;
        };
        let Some((x, y)) = parse_output_position(&query, &self.output) else {
            return;
        };

        let Some(path) = position_file() else { return };
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let contents = format!(
            "output={}\npos_x={x}\npos_y={y}\nwidth={}\nheight={}\nrefresh={}\n",
            self.output, self.width, self.height, self.refresh
        );
        if let Err(e) = std::fs::write(&path, contents) {
            warn!("cannot save display position: {e}");
        }
    }

    /// Restore a previously saved position, if it matches this output.
    pub fn restore_position(&self) {
        if !self.created {
            return;
        }
        let Some(path) = position_file() else { return };
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return;
        };
        let Some((output, x, y)) = parse_position_file(&contents) else {
            return;
        };
        if output != self.output {
            return;
        }
        run_status(
            "xrandr",
            &["--output", &self.output, "--pos", &format!("{x}x{y}")],
        );
    }
}

impl Default for VirtualDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VirtualDisplay {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ── Parsing helpers ──────────────────────────────────────────────

/// Disconnected outputs from `xrandr --query`, preferred names first.
fn pick_unused_output(query: &str) -> Option<String> {
    let disconnected: Vec<&str> = query
        .lines()
        .filter(|line| line.contains(" disconnected"))
        .filter_map(|line| line.split_whitespace().next())
        .collect();

    for prefix in PREFERRED_OUTPUTS {
        if let Some(name) = disconnected.iter().find(|n| n.starts_with(prefix)) {
            return Some((*name).to_string());
        }
    }
    disconnected.first().map(|n| (*n).to_string())
}

/// The `connected primary` output from `xrandr --query`.
fn primary_output(query: &str) -> Option<String> {
    query
        .lines()
        .find(|line| line.contains(" connected primary"))
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

/// Mode name and timing parameters from `cvt` output:
/// `Modeline "1920x1200_120.00"  317.00  1920 ...`.
fn parse_modeline(cvt: &str) -> Option<(String, Vec<String>)> {
    let line = cvt.lines().find(|l| l.trim_start().starts_with("Modeline"))?;
    let rest = line.trim_start().strip_prefix("Modeline")?.trim_start();

    let first_quote = rest.find('"')?;
    let second_quote = rest[first_quote + 1..].find('"')? + first_quote + 1;
    let name = rest[first_quote + 1..second_quote].to_string();
    let params: Vec<String> = rest[second_quote + 1..]
        .split_whitespace()
        .map(str::to_string)
        .collect();

    if name.is_empty() || params.is_empty() {
        return None;
    }
    Some((name, params))
}

/// 0-based monitor index from `xrandr --listmonitors` output.
fn parse_monitor_index(monitors: &str, output: &str) -> Option<usize> {
    for line in monitors.lines() {
        if !line.contains(output) {
            continue;
        }
        let (index, _) = line.trim_start().split_once(':')?;
        return index.trim().parse().ok();
    }
    None
}

/// Position `(x, y)` of a connected output from `xrandr --query`:
/// `VIRTUAL1 connected 1920x1200+3840+0 ...`.
fn parse_output_position(query: &str, output: &str) -> Option<(String, String)> {
    let line = query
        .lines()
        .find(|l| l.starts_with(output) && l.contains(" connected"))?;
    let geometry = line
        .split_whitespace()
        .find(|tok| tok.contains('x') && tok.contains('+'))?;

    let mut parts = geometry.split('+');
    let _size = parts.next()?;
    let x = parts.next()?.to_string();
    let y = parts.next()?.to_string();
    Some((x, y))
}

/// `(output, x, y)` from the saved key=value position file.
fn parse_position_file(contents: &str) -> Option<(String, String, String)> {
    let mut output = None;
    let mut x = None;
    let mut y = None;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "output" => output = Some(value.to_string()),
            "pos_x" => x = Some(value.to_string()),
            "pos_y" => y = Some(value.to_string()),
            _ => {}
        }
    }
    Some((output?, x?, y?))
}

fn position_file() -> Option<PathBuf> {
    Some(dirs::config_dir()?.join("tabcast").join("display_position"))
}

// ── Process helpers ──────────────────────────────────────────────

fn run_capture(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

fn run_status(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn to_refs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY: &str = "\
Screen 0: minimum 320 x 200, current 1920 x 1080, maximum 16384 x 16384
eDP-1 connected primary 1920x1080+0+0 (normal left inverted right x axis y axis) 344mm x 194mm
DP-1 disconnected (normal left inverted right x axis y axis)
VIRTUAL1 connected 1920x1200+1920+0 (normal left inverted right x axis y axis) 0mm x 0mm
VIRTUAL2 disconnected (normal left inverted right x axis y axis)
HDMI-1 disconnected (normal left inverted right x axis y axis)";

    #[test]
    fn prefers_virtual_outputs() {
        assert_eq!(pick_unused_output(QUERY).unwrap(), "VIRTUAL2");
    }

    #[test]
    fn falls_back_to_first_disconnected() {
        let query = "DP-1 disconnected (normal)\nHDMI-1 disconnected (normal)";
        assert_eq!(pick_unused_output(query).unwrap(), "DP-1");
    }

    #[test]
    fn finds_primary_output() {
        assert_eq!(primary_output(QUERY).unwrap(), "eDP-1");
    }

    #[test]
    fn parses_cvt_modeline() {
        let cvt = "# 1920x1200 119.90 Hz (CVT) hsync: 152.40 kHz; pclk: 317.00 MHz\n\
                   Modeline \"1920x1200_120.00\"  317.00  1920 2072 2280 2640  1200 1203 1209 1271 -hsync +vsync";
        let (name, params) = parse_modeline(cvt).unwrap();
        assert_eq!(name, "1920x1200_120.00");
        assert_eq!(params[0], "317.00");
        assert_eq!(params.len(), 11);
    }

    #[test]
    fn rejects_modeline_without_quotes() {
        assert!(parse_modeline("no modeline here").is_none());
    }

    #[test]
    fn parses_monitor_index() {
        let monitors = "Monitors: 2\n\
                        0: +*eDP-1 1920/344x1080/194+0+0  eDP-1\n\
                        1: +VIRTUAL1 1920/438x1200/274+1920+0  VIRTUAL1";
        assert_eq!(parse_monitor_index(monitors, "VIRTUAL1"), Some(1));
        assert_eq!(parse_monitor_index(monitors, "eDP-1"), Some(0));
        assert_eq!(parse_monitor_index(monitors, "HDMI-1"), None);
    }

    #[test]
    fn parses_output_position() {
        let (x, y) = parse_output_position(QUERY, "VIRTUAL1").unwrap();
        assert_eq!(x, "1920");
        assert_eq!(y, "0");
    }

    #[test]
    fn position_file_roundtrip() {
        let contents = "output=VIRTUAL1\npos_x=3840\npos_y=0\nwidth=1920\nheight=1200\nrefresh=120\n";
        let (output, x, y) = parse_position_file(contents).unwrap();
        assert_eq!(output, "VIRTUAL1");
        assert_eq!(x, "3840");
        assert_eq!(y, "0");
    }

    #[test]
    fn position_file_requires_all_keys() {
        assert!(parse_position_file("output=VIRTUAL1\npos_x=10\n").is_none());
    }
}
