//! Capture source selection
//!
//! Probes a priority-ordered list of GStreamer source factories and keeps the
//! first one that reaches READY. A candidate that fails to instantiate or to
//! change state is discarded and the next one is tried; when every configured
//! candidate fails, the synthetic test source is used so the publisher can
//! still come up (e.g. on a machine whose camera is unplugged).

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;

/// Factory name of the synthetic fallback source
pub const TEST_SOURCE: &str = "videotestsrc";

/// Bounded wait for a probed source to confirm READY
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for source selection
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no capture device available: all candidates failed, including the test source")]
    DeviceUnavailable,
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// The selected capture source, held in READY state.
///
/// Exactly one live device handle exists per process; candidates that failed
/// their probe were torn down before the next one was tried.
pub struct SourceSelection {
    element: gst::Element,
    factory_name: String,
}

impl SourceSelection {
    /// Probe `candidates` in priority order and keep the first that works.
    ///
    /// Candidates naming the test source are skipped when
    /// `allow_test_source` is false. Regardless of the flag, the test source
    /// is the fallback of last resort when every configured candidate fails.
    pub fn select(candidates: &[String], allow_test_source: bool) -> Result<Self> {
        let (element, factory_name) =
            select_with(candidates, allow_test_source, probe_factory)?;
        log::info!("selected source element: {}", factory_name);
        Ok(Self {
            element,
            factory_name,
        })
    }

    /// Factory name of the selected source (e.g. "v4l2src")
    pub fn factory_name(&self) -> &str {
        &self.factory_name
    }

    /// Whether the synthetic test source ended up selected
    pub fn is_test_source(&self) -> bool {
        self.factory_name == TEST_SOURCE
    }

    /// Formats the device advertises on its src pad, queried at READY.
    ///
    /// May be empty when the device cannot be queried before negotiation.
    pub fn advertised_caps(&self) -> Option<gst::Caps> {
        let pad = self.element.static_pad("src")?;
        Some(pad.query_caps(None))
    }

    /// Hand the source element over to the pipeline assembler.
    pub fn into_element(self) -> gst::Element {
        self.element
    }
}

/// Core first-success-wins iteration, with the probe step injected so the
/// ordering contract is testable without real devices.
fn select_with<H, F>(
    candidates: &[String],
    allow_test_source: bool,
    mut probe: F,
) -> Result<(H, String)>
where
    F: FnMut(&str) -> Option<H>,
{
    for candidate in candidates {
        if candidate == TEST_SOURCE && !allow_test_source {
            log::debug!("skipping {} (test source not allowed)", TEST_SOURCE);
            continue;
        }
        match probe(candidate) {
            Some(handle) => return Ok((handle, candidate.clone())),
            None => log::warn!("source candidate {} failed its probe, trying next", candidate),
        }
    }

    // Last resort: the synthetic source. If even this fails the environment
    // is broken and startup must abort.
    log::warn!("all configured source candidates failed, falling back to {}", TEST_SOURCE);
    probe(TEST_SOURCE)
        .map(|handle| (handle, TEST_SOURCE.to_string()))
        .ok_or(SourceError::DeviceUnavailable)
}

/// Instantiate a source factory and transition it to READY.
///
/// Returns None when the element cannot be created or refuses the state
/// change; the element is put back to NULL before being discarded.
fn probe_factory(factory_name: &str) -> Option<gst::Element> {
    let element = match gst::ElementFactory::make(factory_name)
        .name("source")
        .build()
    {
        Ok(element) => element,
        Err(e) => {
            log::debug!("factory {} not available: {}", factory_name, e);
            return None;
        }
    };

    if element.set_state(gst::State::Ready).is_err() {
        let _ = element.set_state(gst::State::Null);
        return None;
    }

    let timeout = gst::ClockTime::from_mseconds(PROBE_TIMEOUT.as_millis() as u64);
    let (result, _current, _pending) = element.state(timeout);
    if result.is_err() {
        log::debug!("{} did not reach READY", factory_name);
        let _ = element.set_state(gst::State::Null);
        return None;
    }

    Some(element)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_successful_candidate_short_circuits() {
        let attempts = RefCell::new(Vec::new());
        let probe = |name: &str| {
            attempts.borrow_mut().push(name.to_string());
            match name {
                "a-fails" => None,
                _ => Some(name.to_string()),
            }
        };

        let (handle, factory) =
            select_with(&strings(&["a-fails", "b-works", "c-works"]), false, probe).unwrap();

        assert_eq!(handle, "b-works");
        assert_eq!(factory, "b-works");
        // c-works was never probed
        assert_eq!(*attempts.borrow(), vec!["a-fails", "b-works"]);
    }

    #[test]
    fn all_failures_fall_back_to_test_source() {
        let probe = |name: &str| {
            if name == TEST_SOURCE {
                Some("synthetic".to_string())
            } else {
                None
            }
        };

        let (handle, factory) =
            select_with(&strings(&["a-fails", "b-fails"]), true, probe).unwrap();
        assert_eq!(handle, "synthetic");
        assert_eq!(factory, TEST_SOURCE);
    }

    #[test]
    fn test_source_candidate_is_skipped_when_not_allowed() {
        let attempts = RefCell::new(Vec::new());
        let probe = |name: &str| {
            attempts.borrow_mut().push(name.to_string());
            Some(name.to_string())
        };

        let (_, factory) =
            select_with(&strings(&[TEST_SOURCE, "real-src"]), false, probe).unwrap();

        assert_eq!(factory, "real-src");
        assert_eq!(*attempts.borrow(), vec!["real-src"]);
    }

    #[test]
    fn failing_test_source_is_fatal() {
        let result = select_with::<String, _>(&strings(&["a-fails"]), true, |_| None);
        assert!(matches!(result, Err(SourceError::DeviceUnavailable)));
    }

    #[test]
    fn explicit_test_source_candidate_wins_when_allowed() {
        let (_, factory) =
            select_with(&strings(&[TEST_SOURCE]), true, |n: &str| Some(n.to_string())).unwrap();
        assert_eq!(factory, TEST_SOURCE);
    }
}
