//! Per-frame orchestration for an interactive display loop.
//!
//! One [`LivePipeline::tick`] per UI refresh: capture a block at the current
//! tap, refresh the spectrum on its cadence, re-align the trigger, and grow
//! the return map. All the frame-to-frame memory (trigger reference, bias,
//! refresh counter, point set) lives here, in plain fields.

use log::debug;

use crate::codec;
use crate::error::DriverError;
use crate::peaks;
use crate::protocol::Device;
use crate::spectrum;
use crate::transport::BulkTransport;

/// Capture size used when the spectrum refreshes.
pub const FFT_POINTS: usize = 8192;
pub const MIN_DISPLAY_POINTS: usize = 1020;
pub const MAX_DISPLAY_POINTS: usize = 8192;
const DEFAULT_DISPLAY_POINTS: usize = 2040;

/// Frames between spectrum refreshes when the bias holds still.
const FFT_REFRESH_FRAMES: u32 = 20;

/// Trailing samples excluded from the trigger scan, so there is always a
/// full window to draw after the anchor.
const POINTS_AFTER_TRIGGER: usize = 300;
const TRIGGER_SENSITIVITY: i32 = 2;

const RETURN_MAP_MAX_POINTS: usize = 600;
const RETURN_MAP_MARGIN: usize = 50;
const RETURN_MAP_DELTA: i32 = 5;

/// Three consecutive peak values from one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReturnMapPoint {
    pub first: f32,
    pub second: f32,
    pub third: f32,
}

pub struct LivePipeline {
    display_points: usize,
    fft_enabled: bool,
    frames_since_fft: u32,
    last_bias: Option<u16>,
    trigger_ref: (i32, i32),
    trigger_index: usize,
    block: Vec<u32>,
    spectrum: Vec<f32>,
    return_map: Vec<ReturnMapPoint>,
}

impl LivePipeline {
    pub fn new() -> Self {
        Self {
            display_points: DEFAULT_DISPLAY_POINTS,
            fft_enabled: true,
            // first tick always refreshes (unknown bias counts as a change)
            frames_since_fft: 0,
            last_bias: None,
            trigger_ref: (0, 0),
            trigger_index: 0,
            block: Vec::new(),
            spectrum: Vec::new(),
            return_map: Vec::new(),
        }
    }

    /// Run one display frame against the device.
    pub fn tick<T: BulkTransport>(&mut self, dev: &mut Device<T>) -> Result<(), DriverError> {
        let bias = dev.get_status()?;
        let bias_changed = self.last_bias != Some(bias.get());

        let refresh = self.fft_enabled
            && (self.frames_since_fft >= FFT_REFRESH_FRAMES || bias_changed);
        if refresh {
            debug!("refreshing spectrum at tap {bias}");
            self.block = dev.sample_at(bias, FFT_POINTS)?;
            self.spectrum = spectrum::power_spectrum(&self.block)?;
            self.frames_since_fft = 0;
        } else {
            self.block = dev.sample_at(bias, self.display_points)?;
            self.frames_since_fft += 1;
        }

        self.retrigger();

        if bias_changed {
            self.return_map.clear();
        }
        if self.return_map.len() < RETURN_MAP_MAX_POINTS - RETURN_MAP_MARGIN {
            self.extend_return_map();
        }

        self.last_bias = Some(bias.get());
        Ok(())
    }

    /// Display block size for non-spectrum frames.
    pub fn set_display_points(&mut self, points: usize) -> Result<(), DriverError> {
        if !(MIN_DISPLAY_POINTS..=MAX_DISPLAY_POINTS).contains(&points) {
            return Err(DriverError::InvalidDisplayPoints(points));
        }
        self.display_points = points;
        Ok(())
    }

    pub fn enable_fft(&mut self) {
        self.fft_enabled = true;
    }

    pub fn disable_fft(&mut self) {
        self.fft_enabled = false;
    }

    pub fn plot_len(&self) -> usize {
        self.block.len()
    }

    pub fn plot_point(&self, index: usize) -> Option<(u16, u16, u16)> {
        self.block.get(index).map(|&word| codec::decode(word))
    }

    /// Sample offset that keeps consecutive frames phase-aligned.
    pub fn trigger_index(&self) -> usize {
        self.trigger_index
    }

    /// Most recent log-power spectrum; empty until the first refresh.
    pub fn spectrum(&self) -> &[f32] {
        &self.spectrum
    }

    pub fn return_map(&self) -> &[ReturnMapPoint] {
        &self.return_map
    }

    /// `(p[i], p[i+1])` projection of a return-map point.
    pub fn return_map_first(&self, index: usize) -> Option<(f32, f32)> {
        self.return_map.get(index).map(|p| (p.first, p.second))
    }

    /// `(p[i], p[i+2])` projection of a return-map point.
    pub fn return_map_second(&self, index: usize) -> Option<(f32, f32)> {
        self.return_map.get(index).map(|p| (p.first, p.third))
    }

    // Find the earliest sample whose (x1, x2) coincides with the previous
    // trigger point. A hit moves the anchor and the reference; a miss keeps
    // the old reference and parks the anchor at zero, which can leave frames
    // unaligned until the waveform happens to revisit the reference. That
    // drift sensitivity is inherent to the nearest-point heuristic.
    fn retrigger(&mut self) {
        let scan = self.block.len().saturating_sub(POINTS_AFTER_TRIGGER);
        for i in 0..scan {
            let (x1, x2, _) = codec::decode(self.block[i]);
            let (x1, x2) = (x1 as i32, x2 as i32);
            if (x1 - self.trigger_ref.0).abs() < TRIGGER_SENSITIVITY
                && (x2 - self.trigger_ref.1).abs() < TRIGGER_SENSITIVITY
            {
                self.trigger_index = i;
                self.trigger_ref = (x1, x2);
                return;
            }
        }
        self.trigger_index = 0;
    }

    fn extend_return_map(&mut self) {
        let found = peaks::find_peaks(&self.block, RETURN_MAP_DELTA, self.block.len() / 20);
        let room = RETURN_MAP_MAX_POINTS - self.return_map.len();
        for window in found.windows(3).take(room) {
            self.return_map.push(ReturnMapPoint {
                first: window[0].value,
                second: window[1].value,
                third: window[2].value,
            });
        }
    }
}

impl Default for LivePipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bias::BiasValue;
    use crate::sim::SimTransport;

    fn device() -> Device<SimTransport> {
        let mut dev = Device::new(SimTransport::new());
        dev.connect().unwrap();
        dev
    }

    #[test]
    fn first_frame_refreshes_the_spectrum() {
        let mut dev = device();
        let mut plot = LivePipeline::new();
        plot.tick(&mut dev).unwrap();
        assert_eq!(plot.plot_len(), FFT_POINTS);
        assert_eq!(plot.spectrum().len(), FFT_POINTS);
    }

    #[test]
    fn steady_bias_drops_to_display_captures() {
        let mut dev = device();
        let mut plot = LivePipeline::new();
        plot.tick(&mut dev).unwrap();
        let after_fft = dev.transport().data_requests();

        // Second frame at the same tap: a display-sized capture, which is
        // 8 packets plus the 5 settle discards instead of 33 + 5.
        plot.tick(&mut dev).unwrap();
        assert_eq!(plot.plot_len(), 2040);
        assert_eq!(dev.transport().data_requests() - after_fft, 13);
    }

    #[test]
    fn bias_change_forces_a_refresh_and_clears_the_map() {
        let mut dev = device();
        let mut plot = LivePipeline::new();
        plot.tick(&mut dev).unwrap();
        plot.tick(&mut dev).unwrap();
        let grown = plot.return_map().len();
        assert!(grown > 0);

        dev.set_bias(BiasValue::new(900).unwrap()).unwrap();
        plot.tick(&mut dev).unwrap();
        // fresh capture at FFT size, map rebuilt from this frame alone
        assert_eq!(plot.plot_len(), FFT_POINTS);
        let rebuilt = plot.return_map().len();
        assert!(rebuilt > 0);
        assert!(rebuilt < grown);
    }

    #[test]
    fn return_map_accumulates_toward_the_cap() {
        let mut dev = device();
        let mut plot = LivePipeline::new();
        // one spectrum frame (~134 triplets) plus display frames (~32 each)
        for _ in 0..16 {
            plot.tick(&mut dev).unwrap();
        }
        let len = plot.return_map().len();
        assert!(len >= RETURN_MAP_MAX_POINTS - RETURN_MAP_MARGIN);
        assert!(len <= RETURN_MAP_MAX_POINTS);
        // triplets chain consecutive peaks, so projections share the x value
        let (x_a, _) = plot.return_map_first(0).unwrap();
        let (x_b, _) = plot.return_map_second(0).unwrap();
        assert_eq!(x_a, x_b);
    }

    #[test]
    fn trigger_locks_onto_the_reference_point() {
        let mut dev = device();
        let mut plot = LivePipeline::new();
        // The default wave passes through (0, 0) once per period, matching
        // the pipeline's initial reference.
        plot.tick(&mut dev).unwrap();
        let idx = plot.trigger_index();
        let (x1, x2, _) = plot.plot_point(idx).unwrap();
        assert!(x1 <= 1 && x2 <= 1);

        plot.tick(&mut dev).unwrap();
        let (x1, x2, _) = plot.plot_point(plot.trigger_index()).unwrap();
        assert!(x1 <= 1 && x2 <= 1);
    }

    #[test]
    fn missed_trigger_keeps_the_old_reference() {
        // A wave pinned far from (0, 0) never matches the initial
        // reference, so the anchor stays parked at zero.
        let sim = SimTransport::new().with_wave(|_| codec::encode(500, 500, 500));
        let mut dev = Device::new(sim);
        dev.connect().unwrap();
        let mut plot = LivePipeline::new();
        plot.tick(&mut dev).unwrap();
        assert_eq!(plot.trigger_index(), 0);
        plot.tick(&mut dev).unwrap();
        assert_eq!(plot.trigger_index(), 0);
    }

    #[test]
    fn display_size_is_bounded() {
        let mut plot = LivePipeline::new();
        assert!(plot.set_display_points(1020).is_ok());
        assert!(plot.set_display_points(8192).is_ok());
        assert!(matches!(
            plot.set_display_points(1019),
            Err(DriverError::InvalidDisplayPoints(1019))
        ));
        assert!(matches!(
            plot.set_display_points(8193),
            Err(DriverError::InvalidDisplayPoints(8193))
        ));
    }

    #[test]
    fn disabling_fft_skips_the_transform() {
        let mut dev = device();
        let mut plot = LivePipeline::new();
        plot.disable_fft();
        plot.tick(&mut dev).unwrap();
        assert_eq!(plot.plot_len(), 2040);
        assert!(plot.spectrum().is_empty());
    }
}
