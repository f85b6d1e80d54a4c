//! H.264 encoder selection and configuration
//!
//! The publisher encodes with one of two implementations: `x264enc`
//! (software) or `avenc_h264_omx` (hardware-accelerated). The choice is an
//! explicit operator decision; when the requested implementation is missing
//! startup fails rather than silently downgrading, because a downgrade would
//! break the bitrate/latency expectations the operator configured around.

mod tuning;

use gstreamer as gst;
use gstreamer::prelude::*;

pub use tuning::Tuning;

/// Error type for encoder selection
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("encoder not available: {0}")]
    NotAvailable(String),

    #[error("failed to create {element}: {message}")]
    Creation { element: String, message: String },
}

pub type Result<T> = std::result::Result<T, EncoderError>;

/// Which encoder implementation is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Software,
    HardwareAccelerated,
}

impl EncoderKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            EncoderKind::Software => "x264 (software)",
            EncoderKind::HardwareAccelerated => "OMX H.264 (hardware)",
        }
    }
}

/// Bitrate conservative enough for the target network
const DEFAULT_BITRATE_KBPS: u32 = 1280;

/// Short keyframe distance so a failed-over subscriber resynchronizes fast
const DEFAULT_KEYFRAME_INTERVAL: u32 = 30;

/// The selected encoder implementation and its tuning, fixed at selection
/// time and immutable afterwards.
#[derive(Debug, Clone)]
pub struct EncoderProfile {
    pub kind: EncoderKind,
    pub element_name: &'static str,
    pub bitrate_kbps: u32,
    pub keyframe_interval_frames: u32,
    /// Implementation-specific properties applied on top of bitrate/keyframe
    pub tuning: &'static [Tuning],
}

impl EncoderProfile {
    /// Pick the encoder implementation the operator asked for.
    ///
    /// Fails with [`EncoderError::NotAvailable`] when the requested kind is
    /// not installed; an explicitly requested hardware encoder is never
    /// silently replaced by software.
    pub fn select(use_hardware: bool) -> Result<Self> {
        let profile = if use_hardware {
            Self::hardware_h264()
        } else {
            Self::software_h264()
        };

        if gst::ElementFactory::find(profile.element_name).is_none() {
            return Err(EncoderError::NotAvailable(format!(
                "{} ({})",
                profile.element_name,
                profile.kind.display_name()
            )));
        }

        log::info!(
            "selected encoder {} at {} kbit/s, keyframe every {} frames",
            profile.kind.display_name(),
            profile.bitrate_kbps,
            profile.keyframe_interval_frames
        );
        Ok(profile)
    }

    fn software_h264() -> Self {
        Self {
            kind: EncoderKind::Software,
            element_name: "x264enc",
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            keyframe_interval_frames: DEFAULT_KEYFRAME_INTERVAL,
            tuning: tuning::X264_REALTIME,
        }
    }

    fn hardware_h264() -> Self {
        Self {
            kind: EncoderKind::HardwareAccelerated,
            element_name: "avenc_h264_omx",
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            keyframe_interval_frames: DEFAULT_KEYFRAME_INTERVAL,
            tuning: tuning::OMX_REALTIME,
        }
    }

    /// Create and configure the encoder element chain.
    ///
    /// For the hardware encoder this is two elements: the encoder itself does
    /// not repeat SPS/PPS with IDR frames, so a parser re-inserts them on
    /// every keyframe — a subscriber that joins (or fails over) mid-stream
    /// must be able to decode from any keyframe.
    pub fn build_elements(&self) -> Result<Vec<gst::Element>> {
        let encoder = gst::ElementFactory::make(self.element_name)
            .name("encoder")
            .build()
            .map_err(|e| EncoderError::Creation {
                element: self.element_name.to_string(),
                message: e.to_string(),
            })?;

        match self.kind {
            EncoderKind::Software => {
                // x264enc takes kbit/s
                encoder.set_property("bitrate", self.bitrate_kbps);
                encoder.set_property("key-int-max", self.keyframe_interval_frames);
            }
            EncoderKind::HardwareAccelerated => {
                // avenc takes bit/s
                encoder.set_property("bitrate", self.bitrate_kbps as i64 * 1000);
                encoder.set_property("gop-size", self.keyframe_interval_frames as i32);
            }
        }
        tuning::apply(&encoder, self.tuning);

        let mut elements = vec![encoder];

        if self.kind == EncoderKind::HardwareAccelerated {
            let parser = gst::ElementFactory::make("h264parse")
                .name("parser")
                .property("config-interval", -1i32)
                .build()
                .map_err(|e| EncoderError::Creation {
                    element: "h264parse".to_string(),
                    message: e.to_string(),
                })?;
            elements.push(parser);
        }

        Ok(elements)
    }
}
