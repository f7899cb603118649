//! Host service: sequences startup and shutdown of the whole pipeline
//! and owns every component's lifetime.
//!
//! Startup order: USB bridge → virtual display → frame source (with
//! primary-monitor fallback) → encoder → server → touch engine →
//! coupler wiring → start. Any failure tears down what was built and
//! surfaces one error. Shutdown is the exact reverse, with callbacks
//! unwired before any stage drops.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use tabcast_core::bridge::UsbBridge;
use tabcast_core::display::VirtualDisplay;
use tabcast_core::encoder;
use tabcast_core::gesture::GestureEngine;
use tabcast_core::input::EnigoBackend;
use tabcast_core::pipeline::{self, SharedEncoder};
use tabcast_core::{Result, ScreenSource, StreamingServer};

use crate::config::HostConfig;

/// Settle time after creating the virtual display, before capture
/// binds to it.
const DISPLAY_SETTLE: Duration = Duration::from_millis(500);

// ── HostService ──────────────────────────────────────────────────

pub struct HostService {
    config: HostConfig,
    /// Where the config came from; SIGHUP reloads it.
    config_path: Option<PathBuf>,
}

impl HostService {
    pub fn new(config: HostConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Run the pipeline until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let config = &self.config;
        let refresh = config.effective_refresh();

        // 1. USB bridge (non-fatal; Wi-Fi fallback).
        let mut bridge = UsbBridge::new(config.network.port);
        bridge.setup();

        // 2. Virtual display (non-fatal; primary-monitor fallback).
        let mut display = VirtualDisplay::new();
        let display_ok = match display.create(
            config.display.width,
            config.display.height,
            refresh,
        ) {
            Ok(()) => {
                tokio::time::sleep(DISPLAY_SETTLE).await;
                display.restore_position();
                true
            }
            Err(e) => {
                warn!("virtual display unavailable ({e}); capturing primary monitor");
                false
            }
        };

        // 3. Frame source. Teardown of the bridge and display on any
        // early return is handled by their Drop impls.
        let mut source = ScreenSource::new();
        let mut initialized = false;
        if display_ok {
            if let Some(index) = display.display_index() {
                initialized = source.initialize(index).is_ok();
            }
        }
        if !initialized {
            source.initialize(0)?;
        }

        // 4. Encoder; the factory picks the first working backend.
        let encoder = encoder::create(
            source.width(),
            source.height(),
            refresh,
            config.effective_bitrate(),
        )?;
        info!(encoder = encoder.name(), "encoder selected");
        let encoder: SharedEncoder = Arc::new(Mutex::new(encoder));

        // 5. Server.
        let server = StreamingServer::new(config.network.port);
        server.set_display_size(
            source.width() as i32,
            source.height() as i32,
            config.display.rotation,
        );

        // 6. Touch engine.
        let engine = if config.input.touch_enabled {
            let engine = Arc::new(GestureEngine::new(Box::new(EnigoBackend::new()?)));
            engine.set_display_bounds(0, 0, source.width() as i32, source.height() as i32);
            let touch_engine = Arc::clone(&engine);
            server.set_touch_callback(Box::new(move |event| touch_engine.handle_touch(&event)));
            Some(engine)
        } else {
            info!("touch injection disabled by configuration");
            None
        };

        // 7. Wire the pipeline and status callbacks.
        pipeline::wire(&source, &encoder, &server);
        server.set_connection_callback(Box::new(|connected| {
            if connected {
                info!("client connected");
            } else {
                info!("client disconnected");
            }
        }));
        server.set_stats_callback(Box::new(|fps, mbps| {
            debug!("streaming {fps:.1} fps at {mbps:.1} Mbps");
        }));

        // 8. Start capture and the server.
        source.start_capture(refresh);
        if let Err(e) = server.start().await {
            source.stop();
            pipeline::disconnect(&source, &encoder, &server);
            return Err(e);
        }

        info!(port = server.local_port(), "tabcast running");
        self.wait_for_shutdown(&encoder, &server).await;

        // Shutdown, reverse order of startup.
        server.stop().await;
        source.stop();
        pipeline::disconnect(&source, &encoder, &server);
        if let Some(engine) = &engine {
            engine.stop();
        }
        encoder.lock().expect("encoder lock").flush();
        if display_ok {
            display.save_position();
            display.destroy();
        }
        bridge.teardown();

        info!("tabcast stopped");
        Ok(())
    }

    /// Block until Ctrl-C; on SIGHUP, reload the config file and apply
    /// what can change at runtime (bitrate/quality/boost, rotation).
    /// Resolution and refresh changes require a restart.
    async fn wait_for_shutdown(&self, encoder: &SharedEncoder, server: &StreamingServer) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down");
                        return;
                    }
                    _ = hangup.recv() => {
                        if let Some(path) = &self.config_path {
                            info!("SIGHUP: reloading {}", path.display());
                            let reloaded = HostConfig::load(path);
                            apply_settings(&reloaded, encoder, server);
                        }
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C received; shutting down");
        }
    }
}

/// Apply the runtime-changeable subset of the configuration.
fn apply_settings(config: &HostConfig, encoder: &SharedEncoder, server: &StreamingServer) {
    encoder.lock().expect("encoder lock").update_settings(
        config.effective_bitrate(),
        config.effective_quality(),
        config.stream.gaming_boost,
    );
    server.update_rotation(config.display.rotation);
    info!(
        bitrate_mbps = config.effective_bitrate(),
        rotation = config.display.rotation,
        gaming_boost = config.stream.gaming_boost,
        "settings applied"
    );
}
