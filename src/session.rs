//! Bias-sweep acquisition: chunked for event loops, blocking for scripts.

use log::{debug, info};

use crate::bias::{BiasValue, BIAS_MAX};
use crate::error::DriverError;
use crate::protocol::{Device, WORDS_PER_PACKET};
use crate::sink::SampleSink;
use crate::transport::BulkTransport;

/// Samples collected per waveform period at the nominal oscillator rate.
pub const SAMPLES_PER_PERIOD: usize = 60;

/// One `advance` call pulls at most this many words (64 packets), so a
/// caller can keep its event loop alive through a long sweep.
const CHUNK_WORDS: usize = WORDS_PER_PACKET * 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SweepState {
    Active,
    Done,
}

/// Chunked sweep over a range of bias values.
///
/// Built by [`SweepSession::begin`], driven by repeated [`advance`] calls
/// and closed out by [`finish`]. Each bias collects `periods * 60` samples;
/// a completed bias block is decoded into the sink before the tap steps.
/// The session owns all sweep state explicitly; the device handle is passed
/// into every call.
///
/// [`advance`]: SweepSession::advance
/// [`finish`]: SweepSession::finish
pub struct SweepSession<S> {
    sink: S,
    start: u16,
    end: u16,
    step: u16,
    samples_per_bias: usize,
    /// Current tap; wider than a tap so it can step past `end`.
    bias: u32,
    block: Vec<u32>,
    cursor: usize,
    chunks_this_bias: u32,
    state: SweepState,
}

impl<S: SampleSink> SweepSession<S> {
    pub fn begin(sink: S, start: u16, end: u16, step: u16, periods: usize) -> Result<Self, DriverError> {
        let samples_per_bias = validate_sweep(start, end, step, periods)?;
        info!(
            "starting sweep: start {start} end {end} step {step}, {samples_per_bias} samples per bias"
        );
        Ok(Self {
            sink,
            start,
            end,
            step,
            samples_per_bias,
            bias: start as u32,
            block: vec![0; samples_per_bias],
            cursor: 0,
            chunks_this_bias: 0,
            state: SweepState::Active,
        })
    }

    /// Collect the next chunk.
    ///
    /// Returns the overall completion percentage, clamped to `1..=99` while
    /// the sweep is running, and exactly 0 on the call that completes the
    /// final bias (and on any call after that). Errors abort the current
    /// step and leave the session resumable by the caller's policy.
    pub fn advance<T: BulkTransport>(&mut self, dev: &mut Device<T>) -> Result<u8, DriverError> {
        if self.state == SweepState::Done {
            return Ok(0);
        }
        let bias = BiasValue::new(self.bias as u16)?;
        if self.chunks_this_bias == 0 {
            dev.start_sample(bias)?;
        }

        let take = CHUNK_WORDS.min(self.samples_per_bias - self.cursor);
        debug!("collecting {take} samples for tap {bias}");
        dev.read_block(&mut self.block[self.cursor..self.cursor + take])?;
        self.cursor += take;
        self.chunks_this_bias += 1;
        if self.cursor < self.samples_per_bias {
            return Ok(self.percent());
        }

        // tap complete: close the sample out and bank the block
        dev.end_sample()?;
        self.sink.append(bias, &self.block)?;
        self.bias += self.step as u32;
        self.cursor = 0;
        self.chunks_this_bias = 0;
        if self.bias > self.end as u32 {
            self.state = SweepState::Done;
            info!("sweep complete");
            return Ok(0);
        }
        Ok(self.percent())
    }

    pub fn is_done(&self) -> bool {
        self.state == SweepState::Done
    }

    /// Flush the sink and hand it back. May be called early to abandon a
    /// sweep; whatever was in the partially filled block is discarded.
    pub fn finish(mut self) -> Result<S, DriverError> {
        self.sink.finish()?;
        Ok(self.sink)
    }

    // Overall completion across bias steps, interpolated within the current
    // bias by samples banked so far.
    fn percent(&self) -> u8 {
        let total_steps = ((self.end - self.start) / self.step + 1) as f64;
        let done_steps = ((self.bias - self.start as u32) / self.step as u32) as f64;
        let within = self.cursor as f64 / self.samples_per_bias as f64;
        let percent = ((done_steps + within) / total_steps * 100.0) as i64;
        percent.clamp(1, 99) as u8
    }
}

/// Blocking variant: run the whole sweep in one call and return the sink.
pub fn sweep_to_sink<T: BulkTransport, S: SampleSink>(
    dev: &mut Device<T>,
    mut sink: S,
    start: u16,
    end: u16,
    step: u16,
    periods: usize,
) -> Result<S, DriverError> {
    let samples_per_bias = validate_sweep(start, end, step, periods)?;
    let mut tap = start as u32;
    while tap <= end as u32 {
        let bias = BiasValue::new(tap as u16)?;
        info!("collecting {samples_per_bias} samples for tap {bias}");
        let block = dev.sample_at(bias, samples_per_bias)?;
        sink.append(bias, &block)?;
        tap += step as u32;
    }
    sink.finish()?;
    Ok(sink)
}

fn validate_sweep(start: u16, end: u16, step: u16, periods: usize) -> Result<usize, DriverError> {
    if start > end || end > BIAS_MAX || step == 0 || periods == 0 {
        return Err(DriverError::InvalidSweep {
            start,
            end,
            step,
            periods,
        });
    }
    Ok(periods * SAMPLES_PER_PERIOD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimTransport;
    use crate::sink::MemorySink;

    fn device() -> Device<SimTransport> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut dev = Device::new(SimTransport::new());
        dev.connect().unwrap();
        dev
    }

    #[test]
    fn three_tap_sweep_counts_up_then_signals_done() {
        let mut dev = device();
        let mut sweep = SweepSession::begin(MemorySink::new(), 0, 100, 50, 1).unwrap();

        // 60 samples per bias fit one chunk, so each call completes a tap.
        assert_eq!(sweep.advance(&mut dev).unwrap(), 33);
        assert_eq!(sweep.advance(&mut dev).unwrap(), 66);
        assert_eq!(sweep.advance(&mut dev).unwrap(), 0);
        assert!(sweep.is_done());
        // idempotent once done
        assert_eq!(sweep.advance(&mut dev).unwrap(), 0);

        let sink = sweep.finish().unwrap();
        assert!(sink.is_finished());
        assert_eq!(sink.rows.len(), 3 * 60);
        // one block per tap, in sweep order
        assert_eq!(sink.rows[0].0, 0);
        assert_eq!(sink.rows[60].0, 50);
        assert_eq!(sink.rows[120].0, 100);
    }

    #[test]
    fn long_tap_spans_multiple_chunks() {
        let mut dev = device();
        // 18000 samples per bias: one full 16320-word chunk plus a tail.
        let mut sweep = SweepSession::begin(MemorySink::new(), 0, 0, 1, 300).unwrap();
        assert_eq!(sweep.advance(&mut dev).unwrap(), 90);
        assert_eq!(sweep.advance(&mut dev).unwrap(), 0);
        let sink = sweep.finish().unwrap();
        assert_eq!(sink.rows.len(), 18_000);
    }

    #[test]
    fn progress_is_clamped_to_the_active_band() {
        let mut dev = device();
        // 41 taps of 60000 samples: the first chunk is well under 1%.
        let mut sweep = SweepSession::begin(MemorySink::new(), 0, 4000, 100, 1000).unwrap();
        assert_eq!(sweep.advance(&mut dev).unwrap(), 1);
    }

    #[test]
    fn early_finish_abandons_the_partial_block() {
        let mut dev = device();
        let mut sweep = SweepSession::begin(MemorySink::new(), 0, 4000, 100, 1000).unwrap();
        sweep.advance(&mut dev).unwrap();
        let sink = sweep.finish().unwrap();
        assert!(sink.is_finished());
        assert!(sink.rows.is_empty());
    }

    #[test]
    fn blocking_sweep_fills_the_sink() {
        let mut dev = device();
        let sink = sweep_to_sink(&mut dev, MemorySink::new(), 0, 100, 50, 1).unwrap();
        assert!(sink.is_finished());
        assert_eq!(sink.rows.len(), 3 * 60);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        for (start, end, step, periods) in
            [(100, 0, 1, 1), (0, 100, 0, 1), (0, 100, 1, 0), (0, 4096, 1, 1)]
        {
            assert!(matches!(
                SweepSession::begin(MemorySink::new(), start, end, step, periods),
                Err(DriverError::InvalidSweep { .. })
            ));
        }
    }

    #[test]
    fn step_overshooting_the_end_still_covers_the_start() {
        let mut dev = device();
        // only tap 0 fits in [0, 40] with step 100
        let sink = sweep_to_sink(&mut dev, MemorySink::new(), 0, 40, 100, 1).unwrap();
        assert_eq!(sink.rows.len(), 60);
        assert!(sink.rows.iter().all(|row| row.0 == 0));
    }
}
