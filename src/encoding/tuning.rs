//! Fixed encoder tuning tables
//!
//! All values target low-latency live streaming of a single camera feed.
//! They are compiled in rather than configurable: the redundancy scheme
//! relies on every publisher producing streams with identical timing
//! characteristics, so per-instance tuning would be a liability.

use gstreamer as gst;
use gstreamer::prelude::*;

/// One encoder property with its build-time value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tuning {
    UInt(&'static str, u32),
    Bool(&'static str, bool),
    /// Enum-typed properties, set by nick (e.g. x264enc speed-preset)
    Nick(&'static str, &'static str),
}

/// x264 settings: real-time preset, VBV bounded to two seconds, one thread
/// to bound latency jitter, bitstream extras (VUI, AUD, trellis) off.
pub const X264_REALTIME: &[Tuning] = &[
    Tuning::UInt("vbv-buf-capacity", 2000),
    Tuning::UInt("threads", 1),
    Tuning::Bool("sliced-threads", false),
    Tuning::Nick("speed-preset", "ultrafast"),
    Tuning::Bool("insert-vui", false),
    Tuning::Bool("trellis", false),
    Tuning::Bool("aud", false),
];

/// The OMX wrapper exposes almost nothing beyond bitrate and GOP size,
/// which are applied separately.
pub const OMX_REALTIME: &[Tuning] = &[];

/// Apply a tuning table to an encoder element.
pub fn apply(encoder: &gst::Element, tuning: &[Tuning]) {
    for entry in tuning {
        match *entry {
            Tuning::UInt(name, value) => encoder.set_property(name, value),
            Tuning::Bool(name, value) => encoder.set_property(name, value),
            Tuning::Nick(name, value) => encoder.set_property_from_str(name, value),
        }
    }
}
