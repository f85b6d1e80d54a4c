//! Local preview collaborator boundary
//!
//! The publisher hands decoded frames to whatever renders them locally (a
//! GUI window in a full deployment). The collaborator is push-driven, gets
//! at most one buffered frame, and must render or drop without blocking —
//! the publish path never waits for the preview.

use std::sync::atomic::{AtomicU64, Ordering};

/// One decoded frame for local display.
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub data: Vec<u8>,
}

/// Receiver of preview frames. Implementations must return quickly; a slow
/// consumer should drop the frame itself rather than stall the caller.
pub trait PreviewSink: Send {
    fn push_frame(&self, frame: PreviewFrame);
}

/// Headless preview: counts frames and logs occasionally. Used when no GUI
/// collaborator is attached.
#[derive(Debug, Default)]
pub struct LogPreview {
    frames: AtomicU64,
}

impl PreviewSink for LogPreview {
    fn push_frame(&self, frame: PreviewFrame) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed);
        if n % 300 == 0 {
            log::debug!(
                "preview frame #{}: {} {}x{} ({} bytes)",
                n,
                frame.pixel_format,
                frame.width,
                frame.height,
                frame.data.len()
            );
        }
    }
}
