//! Derivation of the angle series from primary and secondary samples.
//!
//! Samples are paired by sequence index. Every index from 0 up to the largest
//! index seen on either unit yields one point; a unit missing at that index
//! contributes an angle of 0. Gaps are not interpolated. Indices above the
//! limit are skipped so a corrupt sample cannot blow up the series.

use crate::measurement::types::{CorrelatedPoint, Sample, SensorSource, MAX_SEQUENCE_INDEX};
use std::collections::HashMap;

/// Correlate a finished session's samples into `|primary - secondary|` points.
///
/// Samples from unknown sources are ignored. If an index repeats within a
/// source, the later sample wins.
pub fn correlate(samples: &[Sample]) -> Vec<CorrelatedPoint> {
    correlate_up_to(samples, MAX_SEQUENCE_INDEX)
}

/// Like [`correlate`], ignoring samples whose index exceeds `max_index`.
pub fn correlate_up_to(samples: &[Sample], max_index: u32) -> Vec<CorrelatedPoint> {
    let mut primary: HashMap<u32, &Sample> = HashMap::new();
    let mut secondary: HashMap<u32, &Sample> = HashMap::new();
    let mut skipped = 0usize;

    for sample in samples {
        if sample.sequence_index > max_index {
            skipped += 1;
            continue;
        }
        match sample.source {
            SensorSource::Primary => {
                primary.insert(sample.sequence_index, sample);
            }
            SensorSource::Secondary => {
                secondary.insert(sample.sequence_index, sample);
            }
            SensorSource::Unknown(_) => {}
        }
    }
    if skipped > 0 {
        tracing::warn!("Skipped {} samples with index above {}", skipped, max_index);
    }

    let max_index = match primary.keys().chain(secondary.keys()).max() {
        Some(&max) => max,
        None => return Vec::new(),
    };

    (0..=max_index)
        .map(|index| {
            let p = primary.get(&index);
            let s = secondary.get(&index);
            let angle = |sample: Option<&&Sample>| sample.map_or(0.0, |x| x.angle_degrees);
            let timestamp_ms = p.or(s).map_or(0, |x| x.timestamp_ms);

            CorrelatedPoint {
                index,
                timestamp_ms,
                angle_delta: (angle(p) - angle(s)).abs(),
            }
        })
        .collect()
}
