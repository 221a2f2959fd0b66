//! Per-session sample buffer.

use crate::measurement::types::{Sample, SensorSource};
use std::collections::HashMap;

/// Samples of one session, in arrival order.
///
/// A second sample for the same `(source, sequence_index)` replaces the
/// first one in place.
#[derive(Debug, Default, Clone)]
pub struct SampleBuffer {
    samples: Vec<Sample>,
    positions: HashMap<(SensorSource, u32), usize>,
    replaced: usize,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample. Returns `true` if it replaced an earlier one.
    pub fn push(&mut self, sample: Sample) -> bool {
        let key = (sample.source.clone(), sample.sequence_index);
        match self.positions.get(&key) {
            Some(&position) => {
                tracing::debug!(
                    "Duplicate sample {} #{} replaced",
                    sample.source,
                    sample.sequence_index
                );
                self.samples[position] = sample;
                self.replaced += 1;
                true
            }
            None => {
                self.positions.insert(key, self.samples.len());
                self.samples.push(sample);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of duplicates replaced since the last clear.
    pub fn replaced(&self) -> usize {
        self.replaced
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Take all samples, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<Sample> {
        self.positions.clear();
        self.replaced = 0;
        std::mem::take(&mut self.samples)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.positions.clear();
        self.replaced = 0;
    }
}
