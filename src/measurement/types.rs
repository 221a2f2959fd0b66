//! Measurement types: samples, control signals, session status and records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Which inertial unit produced a sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorSource {
    /// Master unit, the one holding the BLE link
    Primary,
    /// Slave unit, relayed through the master
    Secondary,
    /// Any other device id, kept verbatim
    Unknown(String),
}

impl SensorSource {
    /// Map a device id from the wire. Matching is case-insensitive.
    pub fn from_device_id(id: &str) -> Self {
        match id.trim().to_ascii_uppercase().as_str() {
            "MASTER" | "PRIMARY" => SensorSource::Primary,
            "SLAVE" | "SECONDARY" => SensorSource::Secondary,
            _ => SensorSource::Unknown(id.to_string()),
        }
    }
}

impl std::fmt::Display for SensorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorSource::Primary => write!(f, "MASTER"),
            SensorSource::Secondary => write!(f, "SLAVE"),
            SensorSource::Unknown(id) => write!(f, "{}", id),
        }
    }
}

/// One angle reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// Producing unit
    pub source: SensorSource,
    /// Position within the run, per source
    pub sequence_index: u32,
    /// Measured angle in degrees
    pub angle_degrees: f64,
    /// Device-relative timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl Sample {
    pub fn new(source: SensorSource, sequence_index: u32, angle_degrees: f64, timestamp_ms: u64) -> Self {
        Self {
            source,
            sequence_index,
            angle_degrees,
            timestamp_ms,
        }
    }
}

/// State of the secondary unit as reported by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionStatus {
    /// Secondary unit answered
    Ok,
    /// Secondary unit did not answer
    Error,
}

/// Non-sample messages from the master unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Last message of a run
    EndOfStream,
    /// Reply to a companion status check
    Companion(CompanionStatus),
}

/// A decoded logical message.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Sample(Sample),
    Control(ControlSignal),
}

/// Why a logical message could not be decoded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("expected a JSON object")]
    NotAnObject,

    #[error("invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("unknown control token: {0}")]
    UnknownToken(String),
}

/// Status of a measurement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// No session running
    #[default]
    Idle,
    /// START sent, samples are being buffered
    Measuring,
    /// STOP sent, waiting for END or the finalize timeout
    Stopping,
    /// Handing the record to persistence
    Saving,
    /// Record saved; waiting for acknowledgement
    Success,
    /// Save failed; samples retained until acknowledged
    Error,
}

impl SessionStatus {
    /// Whether a session is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionStatus::Measuring | SessionStatus::Stopping | SessionStatus::Saving
        )
    }

    /// Whether the status waits for `reset_status`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Success | SessionStatus::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "Idle"),
            SessionStatus::Measuring => write!(f, "Measuring"),
            SessionStatus::Stopping => write!(f, "Stopping"),
            SessionStatus::Saving => write!(f, "Saving"),
            SessionStatus::Success => write!(f, "Saved"),
            SessionStatus::Error => write!(f, "Save failed"),
        }
    }
}

/// One point of the derived angle series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelatedPoint {
    /// Sequence index both samples share
    pub index: u32,
    /// X-axis value: primary timestamp, else secondary, else 0
    pub timestamp_ms: u64,
    /// |primary angle - secondary angle|
    pub angle_delta: f64,
}

/// Who a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOwner {
    pub user_id: String,
    pub athlete_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

impl SessionOwner {
    pub fn new(user_id: impl Into<String>, athlete_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            athlete_id: athlete_id.into(),
            user_email: None,
        }
    }
}

/// A finished session as handed to persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub owner: SessionOwner,
    pub timestamp: DateTime<Utc>,
    pub samples: Vec<Sample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<Vec<CorrelatedPoint>>,
}

impl SessionRecord {
    /// Derived series, computed from raw samples when not stored.
    pub fn correlated_series(&self) -> Vec<CorrelatedPoint> {
        match &self.series {
            Some(series) => series.clone(),
            None => crate::measurement::correlator::correlate(&self.samples),
        }
    }
}

/// Default upper bound on a sample's sequence index.
pub const MAX_SEQUENCE_INDEX: u32 = 100_000;

/// Configuration for measurement sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Wait this long for END after STOP before finalizing anyway
    pub finalize_timeout_ms: u64,
    /// Largest single record the reassembler will hold
    pub max_message_bytes: usize,
    /// Samples with a larger sequence index are treated as corrupt
    pub max_sequence_index: u32,
    /// Store the correlated series alongside raw samples
    pub persist_series: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            finalize_timeout_ms: 1000,
            max_message_bytes: 4096,
            max_sequence_index: MAX_SEQUENCE_INDEX,
            persist_series: true,
        }
    }
}

/// Observable snapshot of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    /// Peripheral the session runs on
    pub address: Option<String>,
    pub sample_count: usize,
    /// Messages dropped this session as unparseable or out of range
    pub dropped_messages: usize,
    /// Last companion status report
    pub companion: Option<CompanionStatus>,
    /// Series of the last finalized session
    pub series: Vec<CorrelatedPoint>,
    /// Id of the last successfully saved session
    pub last_saved: Option<Uuid>,
}
