//! Processing graph assembly and state machine
//!
//! The graph is capture → format constraint → conversion → encoder → tee,
//! fanning out to a publish branch (H.264 access units into the bus
//! publisher) and a preview branch (decoded RGBA frames for the local
//! operator). Assembly is staged: elements are created unlinked, linked in a
//! fixed order, then driven READY and PLAYING with bounded waits. Teardown
//! runs sinks-first in reverse link order and is safe to invoke at any
//! point, including after a partial startup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::devices::capabilities::NegotiatedFormat;
use crate::devices::selection::SourceSelection;
use crate::encoding::EncoderProfile;
use crate::preview::{PreviewFrame, PreviewSink};
use crate::publish::EncodedUnit;

/// Error type for pipeline assembly and state transitions
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to create {element}: {message}")]
    Creation { element: String, message: String },

    #[error("failed to link pipeline: {0}")]
    Link(String),

    #[error("capture device cannot satisfy the negotiated format {format}")]
    FormatNotSupported { format: String },

    #[error("pipeline refused the {stage} transition: {source}")]
    StateChange {
        stage: &'static str,
        #[source]
        source: gst::StateChangeError,
    },

    #[error("pipeline stuck reaching {stage}: {detail}")]
    StateTimeout { stage: &'static str, detail: String },

    #[error("operation requires pipeline state {expected:?}, but it is {actual:?}")]
    WrongState {
        expected: PipelineState,
        actual: PipelineState,
    },

    #[error(transparent)]
    Encoder(#[from] crate::encoding::EncoderError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Lifecycle of the processing graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Stages exist but are unlinked
    Created,
    /// Stages linked in order; no data flowing
    Linked,
    /// Every stage confirmed readiness
    Ready,
    /// Data flowing; sinks emitting
    Playing,
    /// Torn down; terminal
    Stopped,
}

/// The assembled processing graph. Exclusive owner of every stage it
/// creates; dropping it tears the graph down.
pub struct PipelineAssembler {
    pipeline: gst::Pipeline,
    state: PipelineState,
    format: NegotiatedFormat,
    advertised_caps: Option<gst::Caps>,
    is_test_source: bool,

    // stage groups in link order; stop() walks them in reverse
    capture: Vec<gst::Element>,
    encode: Vec<gst::Element>,
    tee: gst::Element,
    publish_branch: Vec<gst::Element>,
    preview_branch: Vec<gst::Element>,

    publish_sink: gst_app::AppSink,
    preview_sink: Option<gst_app::AppSink>,
}

/// Bounded wait used for the READY and PLAYING confirmations
pub const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(5);

fn make_element(factory: &str, name: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|e| PipelineError::Creation {
            element: factory.to_string(),
            message: e.to_string(),
        })
}

impl PipelineAssembler {
    /// Create all stages, unlinked.
    ///
    /// The source handle comes from selection already probed to READY; the
    /// constraint stage is fixed to exactly the negotiated format.
    pub fn new(
        selection: SourceSelection,
        format: NegotiatedFormat,
        profile: &EncoderProfile,
    ) -> Result<Self> {
        let pipeline = gst::Pipeline::with_name("camcast");

        let advertised_caps = selection.advertised_caps();
        let is_test_source = selection.is_test_source();
        let source = selection.into_element();

        let constraint = gst::ElementFactory::make("capsfilter")
            .name("format-constraint")
            .property("caps", &format.to_caps())
            .build()
            .map_err(|e| PipelineError::Creation {
                element: "capsfilter".to_string(),
                message: e.to_string(),
            })?;
        let convert = make_element("videoconvert", "convert")?;
        let capture = vec![source, constraint, convert];

        let encode = profile.build_elements()?;

        let tee = make_element("tee", "fan-out")?;

        // Publish branch: single-slot queue, then an appsink constrained to
        // byte-stream access units. drop=false — losing units here must be
        // visible as backpressure, never silent.
        let publish_queue = gst::ElementFactory::make("queue")
            .name("publish-queue")
            .property("max-size-buffers", 1u32)
            .property("max-size-bytes", 0u32)
            .property("max-size-time", 0u64)
            .build()
            .map_err(|e| PipelineError::Creation {
                element: "queue".to_string(),
                message: e.to_string(),
            })?;

        let publish_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let publish_sink = gst_app::AppSink::builder()
            .name("publish-sink")
            .caps(&publish_caps)
            .max_buffers(1)
            .drop(false)
            .sync(false)
            .build();
        let publish_branch = vec![
            publish_queue,
            publish_sink.clone().upcast::<gst::Element>(),
        ];

        let (preview_branch, preview_sink) = Self::build_preview_branch()?;

        Ok(Self {
            pipeline,
            state: PipelineState::Created,
            format,
            advertised_caps,
            is_test_source,
            capture,
            encode,
            tee,
            publish_branch,
            preview_branch,
            publish_sink,
            preview_sink,
        })
    }

    /// Preview taps the encoded stream, so it decodes back to raw frames
    /// before handing them to the collaborator. Preview is best-effort: when
    /// no H.264 decoder is installed the branch degrades to a fakesink
    /// instead of failing startup.
    fn build_preview_branch() -> Result<(Vec<gst::Element>, Option<gst_app::AppSink>)> {
        let queue = gst::ElementFactory::make("queue")
            .name("preview-queue")
            .property("max-size-buffers", 1u32)
            .property("max-size-bytes", 0u32)
            .property("max-size-time", 0u64)
            .property_from_str("leaky", "downstream")
            .build()
            .map_err(|e| PipelineError::Creation {
                element: "queue".to_string(),
                message: e.to_string(),
            })?;

        let decoder_factory = ["avdec_h264", "openh264dec"]
            .iter()
            .find(|name| gst::ElementFactory::find(name).is_some());

        let Some(decoder_factory) = decoder_factory else {
            log::warn!("no H.264 decoder available; preview disabled");
            let fakesink = gst::ElementFactory::make("fakesink")
                .name("preview-off")
                .property("sync", false)
                .build()
                .map_err(|e| PipelineError::Creation {
                    element: "fakesink".to_string(),
                    message: e.to_string(),
                })?;
            return Ok((vec![queue, fakesink], None));
        };

        let decoder = make_element(decoder_factory, "preview-decoder")?;
        let convert = make_element("videoconvert", "preview-convert")?;

        let preview_caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGBA")
            .build();
        let sink = gst_app::AppSink::builder()
            .name("preview-sink")
            .caps(&preview_caps)
            .max_buffers(1)
            .drop(true)
            .sync(false)
            .build();

        let branch = vec![
            queue,
            decoder,
            convert,
            sink.clone().upcast::<gst::Element>(),
        ];
        Ok((branch, Some(sink)))
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn negotiated_format(&self) -> &NegotiatedFormat {
        &self.format
    }

    fn expect_state(&self, expected: PipelineState) -> Result<()> {
        if self.state != expected {
            return Err(PipelineError::WrongState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Link every stage in order: capture → constraint → conversion →
    /// encoder → tee → {publish, preview}.
    ///
    /// Verifies up front that the device can satisfy the negotiated format;
    /// a constraint the device cannot meet would otherwise only surface as
    /// an opaque negotiation failure deep inside the graph.
    pub fn link(&mut self) -> Result<()> {
        self.expect_state(PipelineState::Created)?;

        if !self.is_test_source {
            if let Some(advertised) = &self.advertised_caps {
                if !advertised.is_empty() && !advertised.can_intersect(&self.format.to_caps()) {
                    return Err(PipelineError::FormatNotSupported {
                        format: self.format.to_string(),
                    });
                }
            }
        }

        let mut elements: Vec<&gst::Element> = Vec::new();
        elements.extend(self.capture.iter());
        elements.extend(self.encode.iter());
        elements.push(&self.tee);
        elements.extend(self.publish_branch.iter());
        elements.extend(self.preview_branch.iter());

        self.pipeline
            .add_many(&elements)
            .map_err(|e| PipelineError::Link(e.to_string()))?;

        let mut trunk: Vec<&gst::Element> = Vec::new();
        trunk.extend(self.capture.iter());
        trunk.extend(self.encode.iter());
        trunk.push(&self.tee);
        gst::Element::link_many(&trunk).map_err(|e| PipelineError::Link(e.to_string()))?;

        // tee requests a src pad per branch
        self.tee
            .link(&self.publish_branch[0])
            .map_err(|e| PipelineError::Link(format!("tee -> publish branch: {}", e)))?;
        gst::Element::link_many(&self.publish_branch.iter().collect::<Vec<_>>())
            .map_err(|e| PipelineError::Link(format!("publish branch: {}", e)))?;

        self.tee
            .link(&self.preview_branch[0])
            .map_err(|e| PipelineError::Link(format!("tee -> preview branch: {}", e)))?;
        gst::Element::link_many(&self.preview_branch.iter().collect::<Vec<_>>())
            .map_err(|e| PipelineError::Link(format!("preview branch: {}", e)))?;

        self.state = PipelineState::Linked;
        log::debug!("pipeline linked for {}", self.format);
        Ok(())
    }

    /// Install the handler receiving each encoded access unit.
    ///
    /// Runs on the pipeline's streaming thread; the handler must not block.
    /// Sequence numbers are assigned here, monotonically from zero.
    pub fn install_publish_handler<F>(&self, handler: F)
    where
        F: Fn(EncodedUnit) + Send + 'static,
    {
        let sequence = Arc::new(AtomicU64::new(0));
        self.publish_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let Some(buffer) = sample.buffer() else {
                        return Ok(gst::FlowSuccess::Ok);
                    };
                    let keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
                    let pts_ns = buffer.pts().map(|t| t.nseconds());
                    let Ok(map) = buffer.map_readable() else {
                        return Err(gst::FlowError::Error);
                    };
                    let unit = EncodedUnit {
                        sequence: sequence.fetch_add(1, Ordering::Relaxed),
                        keyframe,
                        pts_ns,
                        data: map.as_slice().to_vec(),
                    };
                    handler(unit);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }

    /// Install the preview collaborator. No-op when preview is disabled.
    pub fn install_preview_handler(&self, preview: Box<dyn PreviewSink>) {
        let Some(sink) = &self.preview_sink else {
            return;
        };
        sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let Some(buffer) = sample.buffer() else {
                        return Ok(gst::FlowSuccess::Ok);
                    };
                    let Some(info) = sample
                        .caps()
                        .and_then(|caps| gst_video::VideoInfo::from_caps(caps).ok())
                    else {
                        return Ok(gst::FlowSuccess::Ok);
                    };
                    let Ok(map) = buffer.map_readable() else {
                        return Ok(gst::FlowSuccess::Ok);
                    };
                    preview.push_frame(PreviewFrame {
                        width: info.width(),
                        height: info.height(),
                        pixel_format: info.format().to_str().to_string(),
                        data: map.as_slice().to_vec(),
                    });
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }

    /// Drive every stage to readiness, blocking up to `timeout`.
    pub fn ready(&mut self, timeout: Duration) -> Result<()> {
        self.expect_state(PipelineState::Linked)?;
        self.transition(gst::State::Paused, "READY", timeout)?;
        self.state = PipelineState::Ready;
        log::info!("pipeline ready");
        Ok(())
    }

    /// Start data flow, blocking up to `timeout` for confirmation.
    pub fn play(&mut self, timeout: Duration) -> Result<()> {
        self.expect_state(PipelineState::Ready)?;
        self.transition(gst::State::Playing, "PLAYING", timeout)?;
        self.state = PipelineState::Playing;
        log::info!("pipeline playing ({})", self.format);
        Ok(())
    }

    fn transition(
        &self,
        target: gst::State,
        stage: &'static str,
        timeout: Duration,
    ) -> Result<()> {
        match self.pipeline.set_state(target) {
            Ok(gst::StateChangeSuccess::Async) => {}
            Ok(_) => return Ok(()),
            Err(source) => {
                if let Some(detail) = self.pop_bus_error() {
                    log::error!("{} transition failed: {}", stage, detail);
                }
                return Err(PipelineError::StateChange { stage, source });
            }
        }

        // async change in progress; block until confirmed or timed out
        let wait = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let (result, current, pending) = self.pipeline.state(wait);
        match result {
            Ok(gst::StateChangeSuccess::Async) => Err(PipelineError::StateTimeout {
                stage,
                detail: format!("stuck in {:?} with {:?} pending", current, pending),
            }),
            Ok(_) => Ok(()),
            Err(source) => {
                let detail = self
                    .pop_bus_error()
                    .unwrap_or_else(|| "no bus diagnostic".to_string());
                log::error!("{} transition failed: {}", stage, detail);
                Err(PipelineError::StateChange { stage, source })
            }
        }
    }

    /// First pending error on the pipeline bus, if any.
    pub fn pop_bus_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        for msg in bus.iter() {
            if let gst::MessageView::Error(err) = msg.view() {
                let src = msg
                    .src()
                    .map(|s| s.path_string().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                return Some(format!("{}: {} ({:?})", src, err.error(), err.debug()));
            }
        }
        None
    }

    /// Tear the graph down: sinks first, sources last, then the pipeline
    /// itself. Idempotent, and safe after a partial startup — stages that
    /// were never linked are still individually driven to NULL.
    pub fn stop(&mut self) {
        if self.state == PipelineState::Stopped {
            return;
        }

        let groups: [&[gst::Element]; 4] = [
            &self.preview_branch,
            &self.publish_branch,
            &self.encode,
            &self.capture,
        ];
        for group in groups {
            for element in group.iter().rev() {
                let _ = element.set_state(gst::State::Null);
            }
        }
        let _ = self.tee.set_state(gst::State::Null);
        let _ = self.pipeline.set_state(gst::State::Null);

        self.state = PipelineState::Stopped;
        log::info!("pipeline stopped");
    }
}

impl Drop for PipelineAssembler {
    fn drop(&mut self) {
        self.stop();
    }
}
