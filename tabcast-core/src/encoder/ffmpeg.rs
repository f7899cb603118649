//! libavcodec H.265 backend.
//!
//! One struct covers all libavcodec encoders in the selection list;
//! only the option dictionary and upload pixel format differ per
//! backend. Hardware encoders (`hevc_nvenc`, `hevc_qsv`) take NV12,
//! the software fallback (`libx265`) takes planar YUV420P.
//!
//! Every backend is configured for the same bit-exact contract:
//! all-intra (GOP 1, forced IDR), no B-frames, low delay, VBR with
//! 1.5× peak and a 1-second VBV window, HEVC Main profile. The output
//! stage normalises whatever the codec emits into self-contained
//! Annex-B access units.

use std::sync::Once;

use ffmpeg_next as ffmpeg;

use ffmpeg::codec;
use ffmpeg::format::Pixel;
use ffmpeg::picture;
use ffmpeg::{Dictionary, Packet, Rational};

use super::annexb::ParameterSetCache;
use super::{convert, OutputCallback, VideoEncoder};
use crate::error::{Result, TabcastError};

/// `general_profile_idc` for HEVC Main.
const PROFILE_HEVC_MAIN: i32 = 1;

fn ffmpeg_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = ffmpeg::init();
    });
}

/// Which of the candidate encoder names the local libavcodec carries.
pub(super) fn probe_backends(names: &[&'static str]) -> Vec<&'static str> {
    ffmpeg_init();
    names
        .iter()
        .copied()
        .filter(|name| ffmpeg::encoder::find_by_name(name).is_some())
        .collect()
}

// ── FfmpegEncoder ────────────────────────────────────────────────

pub struct FfmpegEncoder {
    backend: &'static str,
    label: String,
    width: u32,
    height: u32,
    fps: u32,
    bitrate_mbps: u32,
    pixel_format: Pixel,
    encoder: ffmpeg::encoder::video::Encoder,
    frame: ffmpeg::frame::Video,
    packet: Packet,
    params: ParameterSetCache,
    callback: Option<OutputCallback>,
    frame_index: i64,
    reinit_attempted: bool,
}

impl FfmpegEncoder {
    /// Open the named libavcodec encoder, or fail so the factory can
    /// try the next backend.
    pub fn try_new(
        backend: &'static str,
        width: u32,
        height: u32,
        fps: u32,
        bitrate_mbps: u32,
    ) -> Result<Self> {
        ffmpeg_init();

        let pixel_format = match backend {
            "libx265" => Pixel::YUV420P,
            _ => Pixel::NV12,
        };

        let encoder = open_encoder(backend, width, height, fps, bitrate_mbps, pixel_format)?;

        Ok(Self {
            backend,
            label: format!("ffmpeg ({backend})"),
            width,
            height,
            fps,
            bitrate_mbps,
            pixel_format,
            encoder,
            frame: ffmpeg::frame::Video::new(pixel_format, width, height),
            packet: Packet::empty(),
            params: ParameterSetCache::new(),
            callback: None,
            frame_index: 0,
            reinit_attempted: false,
        })
    }

    fn upload(&mut self, data: &[u8], stride: usize) {
        // The encoder may still hold a reference to the previous
        // frame's buffers; make them private before writing.
        // SAFETY: the frame pointer is valid for the life of `frame`.
        unsafe {
            ffmpeg::ffi::av_frame_make_writable(self.frame.as_mut_ptr());
        }

        let w = self.width as usize;
        let h = self.height as usize;

        let y_stride = self.frame.stride(0);
        convert::fill_luma(data, w, h, stride, self.frame.data_mut(0), y_stride);

        if self.pixel_format == Pixel::NV12 {
            let uv_stride = self.frame.stride(1);
            convert::fill_chroma_nv12(data, w, h, stride, self.frame.data_mut(1), uv_stride);
        } else {
            let u_stride = self.frame.stride(1);
            convert::fill_chroma_u(data, w, h, stride, self.frame.data_mut(1), u_stride);
            let v_stride = self.frame.stride(2);
            convert::fill_chroma_v(data, w, h, stride, self.frame.data_mut(2), v_stride);
        }
    }

    /// Drain every packet the codec has ready and deliver normalised
    /// Annex-B access units to the output callback.
    fn drain_packets(&mut self, timestamp_ns: u64) {
        while self.encoder.receive_packet(&mut self.packet).is_ok() {
            if let Some(data) = self.packet.data() {
                let access_unit = self.params.process(data);
                let keyframe = self.packet.is_key();
                if let Some(cb) = self.callback.as_mut() {
                    cb(&access_unit, timestamp_ns, keyframe);
                }
            }
        }
    }

    fn submit(&mut self, timestamp_ns: u64) -> Result<()> {
        self.frame.set_pts(Some(self.frame_index));
        self.frame.set_kind(picture::Type::I);
        self.frame_index += 1;

        self.encoder
            .send_frame(&self.frame)
            .map_err(|e| TabcastError::Encoder {
                backend: self.backend,
                message: format!("send_frame: {e}"),
            })?;

        self.drain_packets(timestamp_ns);
        Ok(())
    }

    /// One silent recovery attempt after the backend reports loss;
    /// a second consecutive failure propagates to the caller.
    fn reinit(&mut self) -> Result<()> {
        self.encoder = open_encoder(
            self.backend,
            self.width,
            self.height,
            self.fps,
            self.bitrate_mbps,
            self.pixel_format,
        )?;
        Ok(())
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn encode(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        stride: usize,
        timestamp_ns: u64,
    ) -> Result<()> {
        if width != self.width || height != self.height {
            return Err(TabcastError::Encoder {
                backend: self.backend,
                message: format!(
                    "frame geometry {width}x{height} does not match session {}x{}",
                    self.width, self.height
                ),
            });
        }

        self.upload(data, stride);

        match self.submit(timestamp_ns) {
            Ok(()) => {
                self.reinit_attempted = false;
                Ok(())
            }
            Err(e) => {
                if !self.reinit_attempted {
                    self.reinit_attempted = true;
                    if self.reinit().is_ok() {
                        tracing::warn!(backend = self.backend, "encoder reinitialised after error");
                    }
                }
                Err(e)
            }
        }
    }

    fn update_settings(&mut self, bitrate_mbps: u32, quality: f32, gaming_boost: bool) {
        let (bitrate_mbps, quality) = if gaming_boost {
            (super::GAMING_BOOST_BITRATE_MBPS, super::GAMING_BOOST_QUALITY)
        } else {
            (bitrate_mbps, quality)
        };
        let bitrate_mbps = super::clamp_bitrate(bitrate_mbps);
        self.bitrate_mbps = bitrate_mbps;

        let bits = i64::from(bitrate_mbps) * 1_000_000;
        // SAFETY: the context outlives the encoder; plain field writes
        // applied by the codec on the next frame.
        unsafe {
            let ctx = self.encoder.as_mut_ptr();
            (*ctx).bit_rate = bits;
            (*ctx).rc_max_rate = bits + bits / 2;
            (*ctx).rc_buffer_size = bits.min(i64::from(i32::MAX)) as i32;
        }

        tracing::info!(
            backend = self.backend,
            bitrate_mbps,
            quality = f64::from(quality),
            gaming_boost,
            "encoder settings updated"
        );
    }

    fn flush(&mut self) {
        let _ = self.encoder.send_eof();
        self.drain_packets(0);
    }

    fn name(&self) -> &str {
        &self.label
    }

    fn set_output_callback(&mut self, callback: Option<OutputCallback>) {
        self.callback = callback;
    }
}

// ── Configuration ────────────────────────────────────────────────

fn open_encoder(
    backend: &'static str,
    width: u32,
    height: u32,
    fps: u32,
    bitrate_mbps: u32,
    pixel_format: Pixel,
) -> Result<ffmpeg::encoder::video::Encoder> {
    let codec = ffmpeg::encoder::find_by_name(backend).ok_or(TabcastError::Encoder {
        backend,
        message: "not present in this libavcodec build".into(),
    })?;

    let mut video = codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()
        .map_err(|e| TabcastError::Encoder {
            backend,
            message: format!("context: {e}"),
        })?;

    let bits = bitrate_mbps as usize * 1_000_000;

    video.set_width(width);
    video.set_height(height);
    video.set_format(pixel_format);
    video.set_time_base(Rational(1, fps as i32));
    video.set_frame_rate(Some(Rational(fps as i32, 1)));
    video.set_bit_rate(bits);
    video.set_max_bit_rate(bits + bits / 2);
    video.set_gop(1);
    video.set_max_b_frames(0);
    video.set_flags(codec::Flags::LOW_DELAY);

    // SAFETY: fields the safe wrapper does not expose — the 1-second
    // VBV window, single-threaded operation and the Main profile.
    unsafe {
        let ctx = video.as_mut_ptr();
        (*ctx).rc_buffer_size = (bits as i64).min(i64::from(i32::MAX)) as i32;
        (*ctx).thread_count = 1;
        (*ctx).profile = PROFILE_HEVC_MAIN;
    }

    video
        .open_with(backend_options(backend))
        .map_err(|e| TabcastError::Encoder {
            backend,
            message: format!("open: {e}"),
        })
}

/// Per-backend private options for the all-intra low-delay contract.
fn backend_options(backend: &str) -> Dictionary<'static> {
    let mut opts = Dictionary::new();
    match backend {
        "hevc_nvenc" => {
            opts.set("preset", "p1");
            opts.set("tune", "ull");
            opts.set("rc", "vbr");
            opts.set("forced-idr", "1");
        }
        "hevc_qsv" => {
            opts.set("preset", "veryfast");
            opts.set("forced_idr", "1");
        }
        "libx265" => {
            opts.set("preset", "ultrafast");
            opts.set("tune", "zerolatency");
            opts.set(
                "x265-params",
                "keyint=1:min-keyint=1:bframes=0:repeat-headers=1",
            );
        }
        _ => {}
    }
    opts
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_options_force_all_intra() {
        let opts = backend_options("libx265");
        let params = opts.get("x265-params").unwrap();
        assert!(params.contains("keyint=1"));
        assert!(params.contains("bframes=0"));
        assert!(params.contains("repeat-headers=1"));
    }

    #[test]
    fn hardware_backends_force_idr() {
        assert_eq!(backend_options("hevc_nvenc").get("forced-idr"), Some("1"));
        assert_eq!(backend_options("hevc_qsv").get("forced_idr"), Some("1"));
    }

    #[test]
    fn probe_only_reports_known_names() {
        // The software encoder may or may not be compiled in, but the
        // probe must never invent names.
        let found = probe_backends(&["libx265", "definitely_not_a_codec"]);
        assert!(!found.contains(&"definitely_not_a_codec"));
    }
}
