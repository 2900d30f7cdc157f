//! Telemetry ring buffers
//!
//! The device streams `spark_<index>_<value>` samples for each output. The
//! last [`TELEMETRY_CAPACITY`] samples per output are kept for display.

use std::collections::VecDeque;

use crate::state::OUTPUT_COUNT;

/// Samples kept per output
pub const TELEMETRY_CAPACITY: usize = 50;

/// Fixed-capacity sample history for all outputs
#[derive(Debug, Clone)]
pub struct Telemetry {
    buffers: Vec<VecDeque<f64>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            buffers: (0..OUTPUT_COUNT)
                .map(|_| VecDeque::with_capacity(TELEMETRY_CAPACITY))
                .collect(),
        }
    }

    /// Append a sample, dropping the oldest once full
    ///
    /// Returns the buffer contents oldest-first, or `None` for an
    /// out-of-range index.
    pub fn push(&mut self, index: usize, value: f64) -> Option<&[f64]> {
        let buffer = self.buffers.get_mut(index)?;
        if buffer.len() == TELEMETRY_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(value);
        Some(buffer.make_contiguous())
    }

    /// Copy of one output's history, oldest first
    pub fn samples(&self, index: usize) -> Vec<f64> {
        self.buffers
            .get(index)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// Render samples as a one-line block sparkline, scaled to their own range
pub fn sparkline(samples: &[f64]) -> String {
    const BLOCKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

    let (min, max) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = max - min;

    samples
        .iter()
        .map(|&v| {
            if span <= f64::EPSILON {
                BLOCKS[0]
            } else {
                let level = ((v - min) / span * (BLOCKS.len() - 1) as f64).round() as usize;
                BLOCKS[level.min(BLOCKS.len() - 1)]
            }
        })
        .collect()
}
