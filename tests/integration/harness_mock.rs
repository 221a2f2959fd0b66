//! Mock harness producing notification payloads.
//!
//! Generates what the master unit sends during a run: one JSON record per
//! sample from each unit, split into notification-sized chunks, followed by
//! END.

use liftlink::sensors::protocol::{payload_size, END_TOKEN};

/// Angle traces of both units for one lift.
pub struct MockHarness {
    /// Primary (master) unit angles, one per sequence index
    pub primary: Vec<f64>,
    /// Secondary (slave) unit angles; `None` marks a lost sample
    pub secondary: Vec<Option<f64>>,
    /// Sample period in milliseconds
    pub period_ms: u64,
    /// Negotiated ATT MTU
    pub mtu: u16,
}

impl Default for MockHarness {
    fn default() -> Self {
        Self {
            primary: vec![10.0, 20.0, 30.0],
            secondary: vec![Some(5.0), None, Some(25.0)],
            period_ms: 20,
            mtu: 23,
        }
    }
}

impl MockHarness {
    /// A squat-like trace: knee angle down to ~90 degrees and back up.
    pub fn squat(samples: usize, mtu: u16) -> Self {
        let primary: Vec<f64> = (0..samples)
            .map(|i| {
                let phase = i as f64 / (samples.max(2) - 1) as f64 * std::f64::consts::PI;
                90.0 * phase.sin()
            })
            .collect();
        let secondary = primary.iter().map(|a| Some(a * 0.4)).collect();

        Self {
            primary,
            secondary,
            period_ms: 20,
            mtu,
        }
    }

    /// Records in transmission order, master first at each index.
    pub fn records(&self) -> Vec<String> {
        let mut records = Vec::new();
        for (idx, angle) in self.primary.iter().enumerate() {
            let time = idx as u64 * self.period_ms;
            records.push(format!(
                r#"{{"id":"MASTER","idx":{},"angle":{:.3},"time":{}}}"#,
                idx, angle, time
            ));
            if let Some(Some(angle)) = self.secondary.get(idx) {
                records.push(format!(
                    r#"{{"id":"SLAVE","idx":{},"angle":{:.3},"time":{}}}"#,
                    idx,
                    angle,
                    time + 1
                ));
            }
        }
        records
    }

    /// The whole run as one byte stream, END included.
    pub fn stream(&self) -> Vec<u8> {
        let mut stream = self.records().concat();
        stream.push_str(END_TOKEN);
        stream.into_bytes()
    }

    /// The run split into notification payloads for the configured MTU.
    pub fn notifications(&self) -> Vec<Vec<u8>> {
        self.stream()
            .chunks(payload_size(self.mtu))
            .map(<[u8]>::to_vec)
            .collect()
    }
}
