//! Top-level publisher driver
//!
//! Composes selection, negotiation, encoder choice, pipeline assembly and
//! the ownership publisher, and owns the resulting pipeline/publisher pair
//! for the process lifetime. Encoded units cross from the pipeline's
//! streaming thread to the bus through a single-slot channel drained by a
//! dedicated publish thread, so the native framework's thread never touches
//! the bus directly.
//!
//! Bus ports are not `Send`, so the publish thread creates the
//! [`OwnershipPublisher`] itself and reports the outcome back; the publisher
//! lives and dies on that thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};

use crate::config::{ConfigError, PublisherConfig};
use crate::devices::capabilities::{negotiate, CapabilitySet, NegotiateError};
use crate::devices::selection::{SourceError, SourceSelection};
use crate::encoding::{EncoderError, EncoderProfile};
use crate::pipeline::{PipelineAssembler, PipelineError, PipelineState, STATE_CHANGE_TIMEOUT};
use crate::preview::PreviewSink;
use crate::publish::{EncodedUnit, OwnershipIdentity, OwnershipPublisher, PublishInitError};

/// Consecutive publish failures before the bus is reported unhealthy
const SUSTAINED_FAILURE_THRESHOLD: u32 = 30;

/// Bounded wait for the publish thread to bring the channel up
const PUBLISH_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything that can abort publisher startup, tagged by the stage that
/// failed so the operator sees exactly where.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("source selection failed: {0}")]
    Source(#[from] SourceError),

    #[error("format negotiation failed: {0}")]
    Negotiate(#[from] NegotiateError),

    #[error("encoder selection failed: {0}")]
    Encoder(#[from] EncoderError),

    #[error("pipeline assembly failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("publish channel initialization failed: {0}")]
    PublishInit(#[from] PublishInitError),

    #[error("publish thread did not confirm channel initialization in time")]
    PublishInitTimeout,
}

/// The running publisher: pipeline, bus publisher and the thread between
/// them. The single owner of all of it; there is no global state.
pub struct PublisherOrchestrator {
    pipeline: PipelineAssembler,
    publish_thread: Option<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl PublisherOrchestrator {
    /// Negotiate, assemble, and start publishing.
    ///
    /// Synchronous: returns once the pipeline has confirmed PLAYING, or with
    /// the first fatal error. All waits are bounded. The channel comes up
    /// before the pipeline so the first encoded unit already has somewhere
    /// to go.
    pub fn start(
        config: &PublisherConfig,
        preview: Box<dyn PreviewSink>,
    ) -> Result<Self, StartupError> {
        config.validate()?;

        let identity = OwnershipIdentity {
            channel_name: config.channel_name.clone(),
            strength: config.strength,
            liveliness_timeout: Duration::from_millis(config.liveliness_timeout_ms),
        };

        // Single-slot hand-off: the streaming thread pushes, the publish
        // thread drains. A full slot means the bus is slower than the
        // encoder — that is backpressure and gets logged, never silence.
        let (unit_tx, unit_rx) = bounded::<EncodedUnit>(1);
        let (init_tx, init_rx) = bounded::<Result<(), PublishInitError>>(1);
        let stop_flag = Arc::new(AtomicBool::new(false));

        let publish_thread = {
            let stop_flag = stop_flag.clone();
            std::thread::Builder::new()
                .name("camcast-publish".into())
                .spawn(move || {
                    let publisher = match OwnershipPublisher::initialize(identity) {
                        Ok(publisher) => {
                            let _ = init_tx.send(Ok(()));
                            publisher
                        }
                        Err(e) => {
                            let _ = init_tx.send(Err(e));
                            return;
                        }
                    };
                    publish_loop(&publisher, &unit_rx, &stop_flag);
                })
                .expect("spawning the publish thread cannot fail")
        };

        match init_rx.recv_timeout(PUBLISH_INIT_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = publish_thread.join();
                return Err(e.into());
            }
            Err(_) => {
                stop_flag.store(true, Ordering::Relaxed);
                let _ = publish_thread.join();
                return Err(StartupError::PublishInitTimeout);
            }
        }

        match Self::assemble(config, preview, unit_tx) {
            Ok(pipeline) => Ok(Self {
                pipeline,
                publish_thread: Some(publish_thread),
                stop_flag,
            }),
            Err(e) => {
                // a partially assembled pipeline was already torn down by
                // its Drop inside assemble(); stop the publish thread too
                stop_flag.store(true, Ordering::Relaxed);
                let _ = publish_thread.join();
                Err(e)
            }
        }
    }

    fn assemble(
        config: &PublisherConfig,
        preview: Box<dyn PreviewSink>,
        unit_tx: crossbeam_channel::Sender<EncodedUnit>,
    ) -> Result<PipelineAssembler, StartupError> {
        let selection =
            SourceSelection::select(&config.source_candidates, config.allow_test_source)?;
        let caps = selection
            .advertised_caps()
            .map(|caps| CapabilitySet::from_gst_caps(&caps))
            .unwrap_or_default();
        let format = negotiate(
            &caps,
            config.fixed_format.as_ref().map(|f| f.to_negotiated()),
            selection.is_test_source(),
        )?;
        let profile = EncoderProfile::select(config.use_hardware_encoder)?;

        let mut pipeline = PipelineAssembler::new(selection, format, &profile)?;
        pipeline.link()?;

        pipeline.install_publish_handler(move |unit| match unit_tx.try_send(unit) {
            Ok(()) => {}
            Err(TrySendError::Full(unit)) => {
                log::warn!(
                    "publish backpressure: dropping unit {} on a full queue",
                    unit.sequence
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        });
        pipeline.install_preview_handler(preview);

        pipeline.ready(STATE_CHANGE_TIMEOUT)?;
        pipeline.play(STATE_CHANGE_TIMEOUT)?;
        Ok(pipeline)
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.pipeline.state()
    }

    /// Pending fatal pipeline error, if the graph broke while running.
    pub fn take_pipeline_error(&self) -> Option<String> {
        self.pipeline.pop_bus_error()
    }

    fn join_publish_thread(&mut self) {
        if let Some(handle) = self.publish_thread.take() {
            let _ = handle.join();
        }
    }

    /// Stop data flow, tear the pipeline down, and join the publish thread.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.pipeline.stop();
        self.join_publish_thread();
    }
}

impl Drop for PublisherOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn publish_loop(
    publisher: &OwnershipPublisher,
    unit_rx: &Receiver<EncodedUnit>,
    stop_flag: &AtomicBool,
) {
    let mut consecutive_failures: u32 = 0;
    loop {
        match unit_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(unit) => match publisher.publish(&unit) {
                Ok(()) => {
                    if consecutive_failures >= SUSTAINED_FAILURE_THRESHOLD {
                        log::info!(
                            "publishing recovered after {} failures",
                            consecutive_failures
                        );
                    }
                    consecutive_failures = 0;
                }
                Err(e) => {
                    // per-unit failure: log and continue, the pipeline keeps
                    // running
                    consecutive_failures += 1;
                    log::warn!("dropping unit {}: {}", unit.sequence, e);
                    if consecutive_failures == SUSTAINED_FAILURE_THRESHOLD {
                        log::error!(
                            "publishing has failed {} times in a row; the bus looks unhealthy",
                            consecutive_failures
                        );
                    }
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("publish thread exiting");
}
