//! Delta-threshold extrema detection with a per-bias result cache.

use std::collections::HashMap;

use log::debug;

use crate::bias::{BiasValue, BIAS_MAX};
use crate::codec;
use crate::error::DriverError;
use crate::protocol::Device;
use crate::transport::BulkTransport;

/// Default noise-rejection threshold.
pub const DEFAULT_DELTA: i32 = 2;

/// Samples acquired per requested peak on a cache miss.
const SAMPLES_PER_PEAK: usize = 75;

/// One detected maximum on channel 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Peak {
    /// Sample index of the raw maximum.
    pub index: usize,
    /// Parabola-refined x1 value at the maximum.
    pub value: f32,
}

/// Scan channel 1 for maxima, alternating between seeking a max and seeking
/// a min.
///
/// While seeking a max, the running maximum is accepted as a peak once the
/// signal drops below it by more than `delta`; the scan then hunts for the
/// next minimum, and flips back once the signal climbs `delta` above it.
/// The accepted value is refined through its two neighbor samples. Stops
/// early at `max_peaks`.
pub fn find_peaks(words: &[u32], delta: i32, max_peaks: usize) -> Vec<Peak> {
    let mut peaks = Vec::new();
    if max_peaks == 0 {
        return peaks;
    }
    let mut max = i32::MIN;
    let mut max_pos = 0usize;
    let mut min = i32::MAX;
    let mut seeking_max = false;
    for (i, &word) in words.iter().enumerate() {
        let current = codec::x1(word) as i32;
        if current > max {
            max = current;
            max_pos = i;
        }
        if current < min {
            min = current;
        }
        if seeking_max {
            if current < max - delta {
                peaks.push(Peak {
                    index: max_pos,
                    value: refine(words, max_pos, max),
                });
                if peaks.len() >= max_peaks {
                    break;
                }
                min = current;
                seeking_max = false;
            }
        } else if current > min + delta {
            max = current;
            max_pos = i;
            seeking_max = true;
        }
    }
    peaks
}

/// Three-point parabola through the maximum and its immediate neighbors;
/// returns the vertex value. The sample spacing cancels out of the vertex,
/// so the fit runs on unit spacing.
fn refine(words: &[u32], pos: usize, max: i32) -> f32 {
    if pos == 0 || pos + 1 >= words.len() {
        return max as f32;
    }
    let prev = codec::x1(words[pos - 1]) as f32;
    let next = codec::x1(words[pos + 1]) as f32;
    let mid = max as f32;
    let a = (prev + next - 2.0 * mid) / 2.0;
    if a == 0.0 {
        // plateau: nothing to refine
        return mid;
    }
    let b = (4.0 * mid - next - 3.0 * prev) / 2.0;
    prev - b * b / (4.0 * a)
}

/// Detected-peak cache keyed by bias value.
///
/// Entries hold up to `peaks_per_bias` refined peaks; an empty entry is a
/// miss. Changing the per-bias peak count resets the whole cache. Results
/// never persist past this handle.
pub struct PeakCache {
    peaks_per_bias: usize,
    entries: HashMap<u16, Vec<Peak>>,
}

impl PeakCache {
    pub fn new(peaks_per_bias: usize) -> Result<Self, DriverError> {
        if peaks_per_bias == 0 {
            return Err(DriverError::InvalidPeaksPerBias);
        }
        Ok(Self {
            peaks_per_bias,
            entries: HashMap::new(),
        })
    }

    /// Full invalidation: every cached entry is dropped and the per-bias
    /// capacity is replaced. There is no incremental path.
    pub fn reset(&mut self, peaks_per_bias: usize) -> Result<(), DriverError> {
        if peaks_per_bias == 0 {
            return Err(DriverError::InvalidPeaksPerBias);
        }
        self.peaks_per_bias = peaks_per_bias;
        self.entries = HashMap::new();
        Ok(())
    }

    pub fn peaks_per_bias(&self) -> usize {
        self.peaks_per_bias
    }

    /// True iff `bias` is in range and holds a non-empty entry.
    pub fn is_hit(&self, bias: u16) -> bool {
        bias <= BIAS_MAX && self.entries.get(&bias).is_some_and(|e| !e.is_empty())
    }

    /// Peaks for `bias`, from the cache when possible.
    ///
    /// A miss acquires a dedicated block (`peaks_per_bias * 75` samples) at
    /// that bias, runs the detector and stores the result. An out-of-range
    /// bias is an error, never a read of someone else's slot.
    pub fn peaks_at<T: BulkTransport>(
        &mut self,
        dev: &mut Device<T>,
        bias: u16,
        delta: i32,
    ) -> Result<&[Peak], DriverError> {
        if bias > BIAS_MAX {
            return Err(DriverError::BiasOutOfRange(bias as u32));
        }
        if !self.is_hit(bias) {
            debug!("peak cache miss for bias {bias}, acquiring");
            let block = dev.sample_at(
                BiasValue::new(bias)?,
                self.peaks_per_bias * SAMPLES_PER_PEAK,
            )?;
            let peaks = find_peaks(&block, delta, self.peaks_per_bias);
            self.entries.insert(bias, peaks);
        }
        Ok(self.entries.get(&bias).map(Vec::as_slice).unwrap_or(&[]))
    }
}
