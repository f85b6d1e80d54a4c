//! Device capability model and capture format negotiation
//!
//! A capture device advertises its supported modes as GStreamer caps. This
//! module parses the raw-video structures out of those caps and picks the
//! mode to request: the highest frame rate the device offers, and within
//! that rate tier the largest pixel area. Frame rate wins over resolution
//! because the downstream encoder's latency budget is rate-sensitive;
//! resolution is only maximized inside the best-rate tier.

use gstreamer as gst;
use gstreamer::prelude::*;

/// Error type for format negotiation
#[derive(Debug, thiserror::Error)]
pub enum NegotiateError {
    #[error("device advertised no usable raw video capabilities")]
    NoCapabilities,
}

pub type Result<T> = std::result::Result<T, NegotiateError>;

/// One advertised capture mode.
///
/// `fps_den > 0` and `width, height > 0` hold for every mode produced by
/// [`CapabilitySet::from_gst_caps`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityMode {
    pub pixel_format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps_num: i32,
    pub fps_den: i32,
}

impl CapabilityMode {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Exact rational comparison of frame rates; never truncates, so
    /// 30000/1001 correctly loses to 30/1.
    pub fn cmp_frame_rate(&self, other: &CapabilityMode) -> std::cmp::Ordering {
        let lhs = self.fps_num as i64 * other.fps_den as i64;
        let rhs = other.fps_num as i64 * self.fps_den as i64;
        lhs.cmp(&rhs)
    }

    fn same_frame_rate(&self, other: &CapabilityMode) -> bool {
        self.cmp_frame_rate(other) == std::cmp::Ordering::Equal
    }
}

/// Ordered set of capture modes a device advertises. Immutable once parsed.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    modes: Vec<CapabilityMode>,
}

impl CapabilitySet {
    pub fn new(modes: Vec<CapabilityMode>) -> Self {
        Self { modes }
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn modes(&self) -> &[CapabilityMode] {
        &self.modes
    }

    /// Parse the raw-video structures of device caps into concrete modes.
    ///
    /// Only `video/x-raw` structures participate in negotiation; compressed
    /// formats the device may also offer (MJPEG etc.) are ignored because the
    /// pipeline encodes from raw frames. Fields holding lists are expanded,
    /// ranges contribute their maximum.
    pub fn from_gst_caps(caps: &gst::CapsRef) -> Self {
        let mut modes = Vec::new();

        for i in 0..caps.size() {
            let Some(structure) = caps.structure(i) else {
                continue;
            };
            if structure.name().as_str() != "video/x-raw" {
                continue;
            }

            let pixel_format = extract_format(structure);
            let widths = extract_int_values(structure, "width");
            let heights = extract_int_values(structure, "height");
            let framerates = extract_framerates(structure);

            for &width in &widths {
                for &height in &heights {
                    for &(fps_num, fps_den) in &framerates {
                        if width == 0 || height == 0 || fps_num <= 0 || fps_den <= 0 {
                            continue;
                        }
                        modes.push(CapabilityMode {
                            pixel_format: pixel_format.clone(),
                            width,
                            height,
                            fps_num,
                            fps_den,
                        });
                    }
                }
            }
        }

        Self { modes }
    }
}

/// The single capture mode chosen for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub pixel_format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps_num: i32,
    pub fps_den: i32,
}

impl NegotiatedFormat {
    /// Built-in mode known to work with the synthetic test source
    pub fn default_safe() -> Self {
        Self {
            pixel_format: Some("I420".to_string()),
            width: 640,
            height: 480,
            fps_num: 30,
            fps_den: 1,
        }
    }

    /// Render as the caps the constraint stage requests from the source.
    pub fn to_caps(&self) -> gst::Caps {
        let mut builder = gst::Caps::builder("video/x-raw")
            .field("width", self.width as i32)
            .field("height", self.height as i32)
            .field("framerate", gst::Fraction::new(self.fps_num, self.fps_den));
        if let Some(format) = &self.pixel_format {
            builder = builder.field("format", format.as_str());
        }
        builder.build()
    }
}

impl std::fmt::Display for NegotiatedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}x{} @ {}/{}",
            self.pixel_format.as_deref().unwrap_or("(any)"),
            self.width,
            self.height,
            self.fps_num,
            self.fps_den
        )
    }
}

impl From<&CapabilityMode> for NegotiatedFormat {
    fn from(mode: &CapabilityMode) -> Self {
        Self {
            pixel_format: mode.pixel_format.clone(),
            width: mode.width,
            height: mode.height,
            fps_num: mode.fps_num,
            fps_den: mode.fps_den,
        }
    }
}

/// Choose the capture format for this session.
///
/// Policy, in priority order:
/// 1. An operator-forced format is returned unchanged.
/// 2. The test source gets the built-in safe default.
/// 3. Otherwise pick the advertised mode with the highest frame rate, and
///    among same-rate modes the one with the largest area; ties resolve to
///    the first such mode in advertisement order.
pub fn negotiate(
    caps: &CapabilitySet,
    fixed_override: Option<NegotiatedFormat>,
    is_test_source: bool,
) -> Result<NegotiatedFormat> {
    if let Some(format) = fixed_override {
        log::info!("using operator-fixed capture format: {}", format);
        return Ok(format);
    }

    if is_test_source {
        let format = NegotiatedFormat::default_safe();
        log::info!("test source selected, using default format: {}", format);
        return Ok(format);
    }

    let modes = caps.modes();
    if modes.is_empty() {
        return Err(NegotiateError::NoCapabilities);
    }

    let best_rate = modes
        .iter()
        .max_by(|a, b| a.cmp_frame_rate(b))
        .expect("mode list checked non-empty");

    let mut best = None;
    for mode in modes {
        if !mode.same_frame_rate(best_rate) {
            continue;
        }
        // strict comparison keeps the first-encountered mode on area ties
        match best {
            None => best = Some(mode),
            Some(current) if mode.area() > current.area() => best = Some(mode),
            Some(_) => {}
        }
    }

    let chosen = best.expect("at least one mode matches the maximum rate");
    log::info!(
        "negotiated capture format {} ({} modes advertised)",
        NegotiatedFormat::from(chosen),
        modes.len()
    );
    Ok(chosen.into())
}

fn extract_format(structure: &gst::StructureRef) -> Option<String> {
    if let Ok(format) = structure.get::<String>("format") {
        return Some(format);
    }
    // A format list means the converter can reach any of them; take the
    // first as the representative.
    if let Ok(value) = structure.value("format") {
        if let Ok(list) = value.get::<gst::List>() {
            for v in list.iter() {
                if let Ok(format) = v.get::<String>() {
                    return Some(format);
                }
            }
        }
    }
    None
}

/// Extract integer values from a caps structure field.
/// Handles fixed values, lists, and ranges (maximum wins for ranges).
fn extract_int_values(structure: &gst::StructureRef, field: &str) -> Vec<u32> {
    if let Ok(val) = structure.get::<i32>(field) {
        return vec![val.max(0) as u32];
    }

    if let Ok(value) = structure.value(field) {
        if let Ok(list) = value.get::<gst::List>() {
            let mut result = Vec::new();
            for v in list.iter() {
                if let Ok(int_val) = v.get::<i32>() {
                    result.push(int_val.max(0) as u32);
                }
            }
            if !result.is_empty() {
                return result;
            }
        }

        if let Ok(range) = value.get::<gst::IntRange<i32>>() {
            return vec![range.max().max(0) as u32];
        }
    }

    Vec::new()
}

/// Extract frame rates as exact (numerator, denominator) pairs.
/// Handles fixed fractions, fraction lists, and fraction ranges.
fn extract_framerates(structure: &gst::StructureRef) -> Vec<(i32, i32)> {
    if let Ok(frac) = structure.get::<gst::Fraction>("framerate") {
        return vec![(frac.numer(), frac.denom())];
    }

    if let Ok(value) = structure.value("framerate") {
        if let Ok(list) = value.get::<gst::List>() {
            let mut result = Vec::new();
            for v in list.iter() {
                if let Ok(frac) = v.get::<gst::Fraction>() {
                    result.push((frac.numer(), frac.denom()));
                }
            }
            if !result.is_empty() {
                return result;
            }
        }

        if let Ok(range) = value.get::<gst::FractionRange>() {
            let max = range.max();
            return vec![(max.numer(), max.denom())];
        }
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(width: u32, height: u32, fps_num: i32, fps_den: i32) -> CapabilityMode {
        CapabilityMode {
            pixel_format: Some("YUY2".to_string()),
            width,
            height,
            fps_num,
            fps_den,
        }
    }

    #[test]
    fn highest_frame_rate_wins_over_resolution() {
        let caps = CapabilitySet::new(vec![
            mode(1920, 1080, 15, 1),
            mode(640, 480, 60, 1),
            mode(1280, 720, 30, 1),
        ]);

        let format = negotiate(&caps, None, false).unwrap();
        assert_eq!((format.width, format.height), (640, 480));
        assert_eq!((format.fps_num, format.fps_den), (60, 1));
    }

    #[test]
    fn largest_area_wins_within_best_rate_tier() {
        let caps = CapabilitySet::new(vec![
            mode(640, 480, 30, 1),
            mode(1280, 720, 30, 1),
            mode(800, 600, 30, 1),
        ]);

        let format = negotiate(&caps, None, false).unwrap();
        assert_eq!((format.width, format.height), (1280, 720));
    }

    #[test]
    fn rates_compare_as_rationals_not_floats() {
        // 30000/1001 (29.97) must lose to 30/1 even though both round to 30
        let caps = CapabilitySet::new(vec![
            mode(1920, 1080, 30000, 1001),
            mode(640, 480, 30, 1),
        ]);

        let format = negotiate(&caps, None, false).unwrap();
        assert_eq!((format.fps_num, format.fps_den), (30, 1));
        assert_eq!((format.width, format.height), (640, 480));
    }

    #[test]
    fn equivalent_rationals_share_a_tier() {
        // 60/2 equals 30/1; both sit in the best tier, larger area wins
        let caps = CapabilitySet::new(vec![
            mode(640, 480, 60, 2),
            mode(1280, 720, 30, 1),
        ]);

        let format = negotiate(&caps, None, false).unwrap();
        assert_eq!((format.width, format.height), (1280, 720));
    }

    #[test]
    fn area_ties_resolve_to_first_advertised() {
        let first = CapabilityMode {
            pixel_format: Some("NV12".to_string()),
            ..mode(1280, 720, 30, 1)
        };
        let caps = CapabilitySet::new(vec![first.clone(), mode(1280, 720, 30, 1)]);

        let format = negotiate(&caps, None, false).unwrap();
        assert_eq!(format.pixel_format.as_deref(), Some("NV12"));
    }

    #[test]
    fn empty_caps_fail_negotiation() {
        let caps = CapabilitySet::default();
        assert!(matches!(
            negotiate(&caps, None, false),
            Err(NegotiateError::NoCapabilities)
        ));
    }

    #[test]
    fn test_source_gets_the_safe_default() {
        let caps = CapabilitySet::default();
        let format = negotiate(&caps, None, true).unwrap();
        assert_eq!(format, NegotiatedFormat::default_safe());
        assert_eq!(format.pixel_format.as_deref(), Some("I420"));
        assert_eq!((format.width, format.height), (640, 480));
        assert_eq!((format.fps_num, format.fps_den), (30, 1));
    }

    #[test]
    fn fixed_override_bypasses_everything() {
        let caps = CapabilitySet::default();
        let forced = NegotiatedFormat {
            pixel_format: None,
            width: 320,
            height: 240,
            fps_num: 15,
            fps_den: 1,
        };

        let format = negotiate(&caps, Some(forced.clone()), false).unwrap();
        assert_eq!(format, forced);
    }

    #[test]
    fn caps_parsing_expands_lists_and_ranges() {
        crate::gstreamer_init::init_gstreamer_env();
        if !crate::gstreamer_init::is_gstreamer_available() {
            return;
        }

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "YUY2")
            .field("width", 1280i32)
            .field("height", 720i32)
            .field(
                "framerate",
                gst::List::new([
                    gst::Fraction::new(30, 1),
                    gst::Fraction::new(15, 1),
                ]),
            )
            .build();

        let set = CapabilitySet::from_gst_caps(&caps);
        assert_eq!(set.modes().len(), 2);
        assert_eq!(set.modes()[0].fps_num, 30);
        assert_eq!(set.modes()[1].fps_num, 15);
    }

    #[test]
    fn caps_parsing_ignores_compressed_structures() {
        crate::gstreamer_init::init_gstreamer_env();
        if !crate::gstreamer_init::is_gstreamer_available() {
            return;
        }

        let caps = gst::Caps::builder("image/jpeg")
            .field("width", 1920i32)
            .field("height", 1080i32)
            .field("framerate", gst::Fraction::new(30, 1))
            .build();

        let set = CapabilitySet::from_gst_caps(&caps);
        assert!(set.is_empty());
    }

    #[test]
    fn negotiated_format_renders_to_caps() {
        crate::gstreamer_init::init_gstreamer_env();
        if !crate::gstreamer_init::is_gstreamer_available() {
            return;
        }

        let caps = NegotiatedFormat::default_safe().to_caps();
        let structure = caps.structure(0).unwrap();
        assert_eq!(structure.name().as_str(), "video/x-raw");
        assert_eq!(structure.get::<i32>("width").unwrap(), 640);
        assert_eq!(structure.get::<String>("format").unwrap(), "I420");
        assert_eq!(
            structure.get::<gst::Fraction>("framerate").unwrap(),
            gst::Fraction::new(30, 1)
        );
    }
}
