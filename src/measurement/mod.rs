//! Measurement streaming pipeline.
//!
//! Notification payloads flow through the reassembler and parser into the
//! session controller, which buffers samples and hands finished sessions to
//! the store after correlating both units.

pub mod buffer;
pub mod controller;
pub mod correlator;
pub mod parser;
pub mod reassembler;
pub mod types;

pub use buffer::SampleBuffer;
pub use controller::MeasurementController;
pub use correlator::{correlate, correlate_up_to};
pub use parser::{parse_frame, parse_message};
pub use reassembler::{Frame, FrameReassembler};
pub use types::{
    CompanionStatus, ControlSignal, CorrelatedPoint, DeviceMessage, ParseError, Sample,
    SensorSource, SessionConfig, SessionOwner, SessionRecord, SessionSnapshot, SessionStatus,
};
