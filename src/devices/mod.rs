// Capture device selection and format negotiation

pub mod capabilities;
pub mod selection;

pub use capabilities::{negotiate, CapabilityMode, CapabilitySet, NegotiatedFormat};
pub use selection::SourceSelection;
