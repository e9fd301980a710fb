//! Log-power spectrum over channel 1 of a sample block.
//!
//! The transform is the classic in-place radix-2 Cooley-Tukey: a reverse
//! binary reindex followed by Danielson-Lanczos passes over an interleaved
//! re/im buffer. Not the fastest FFT around, but it gets the job done and
//! stays simple.

use std::f64::consts::PI;

use crate::codec;
use crate::error::DriverError;

/// Transform a sample block into `log10(magnitude^2)` per frequency bin.
///
/// Channel 1 is extracted from each word; the imaginary parts start at zero.
/// The block length must be a power of two, anything else is rejected with
/// [`DriverError::FftLength`]. Bins with zero energy come out as
/// `f32::NEG_INFINITY` (IEEE `log10(0)`), which is the defined sentinel.
pub fn power_spectrum(words: &[u32]) -> Result<Vec<f32>, DriverError> {
    if words.is_empty() || !words.len().is_power_of_two() {
        return Err(DriverError::FftLength(words.len()));
    }
    let mut buf = vec![0.0f32; words.len() * 2];
    for (i, &word) in words.iter().enumerate() {
        buf[i * 2] = codec::x1(word) as f32;
    }
    fft_in_place(&mut buf);
    Ok(buf
        .chunks_exact(2)
        .map(|bin| (bin[0] * bin[0] + bin[1] * bin[1]).log10())
        .collect())
}

/// In-place forward FFT over interleaved re/im pairs.
///
/// `data.len()` must be twice a power of two. The twiddle recurrence runs in
/// f64 to keep the trailing bins honest at 8192 points.
fn fft_in_place(data: &mut [f32]) {
    let n = data.len();
    let nn = n / 2;

    // reverse-binary reindexing
    let mut j = 1usize;
    let mut i = 1usize;
    while i < n {
        if j > i {
            data.swap(j - 1, i - 1);
            data.swap(j, i);
        }
        let mut m = nn;
        while m >= 2 && j > m {
            j -= m;
            m >>= 1;
        }
        j += m;
        i += 2;
    }

    // Danielson-Lanczos passes
    let mut mmax = 2usize;
    while n > mmax {
        let istep = mmax << 1;
        let theta = -(2.0 * PI / mmax as f64);
        let wtemp = (0.5 * theta).sin();
        let wpr = -2.0 * wtemp * wtemp;
        let wpi = theta.sin();
        let mut wr = 1.0f64;
        let mut wi = 0.0f64;
        let mut m = 1usize;
        while m < mmax {
            let mut i = m;
            while i <= n {
                let j = i + mmax;
                let tempr = wr as f32 * data[j - 1] - wi as f32 * data[j];
                let tempi = wr as f32 * data[j] + wi as f32 * data[j - 1];
                data[j - 1] = data[i - 1] - tempr;
                data[j] = data[i] - tempi;
                data[i - 1] += tempr;
                data[i] += tempi;
                i += istep;
            }
            let wtemp = wr;
            wr += wr * wpr - wi * wpi;
            wi += wi * wpr + wtemp * wpi;
            m += 2;
        }
        mmax = istep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_lengths() {
        assert!(matches!(
            power_spectrum(&vec![0u32; 100]),
            Err(DriverError::FftLength(100))
        ));
        assert!(matches!(power_spectrum(&[]), Err(DriverError::FftLength(0))));
    }

    #[test]
    fn silence_hits_the_sentinel() {
        let spectrum = power_spectrum(&[0u32; 8]).unwrap();
        assert_eq!(spectrum.len(), 8);
        assert!(spectrum.iter().all(|&bin| bin == f32::NEG_INFINITY));
    }

    #[test]
    fn impulse_is_flat() {
        // DFT of a unit impulse at n=0 is 1 in every bin, so the log power
        // sits at zero across the board.
        let mut words = vec![0u32; 16];
        words[0] = codec::encode(1, 0, 0);
        let spectrum = power_spectrum(&words).unwrap();
        for bin in spectrum {
            assert!(bin.abs() < 1e-4, "bin {bin} strayed from 0");
        }
    }

    #[test]
    fn sinusoid_peaks_at_its_bin() {
        let n = 64usize;
        let k = 5usize;
        let words: Vec<u32> = (0..n)
            .map(|i| {
                let phase = 2.0 * PI * k as f64 * i as f64 / n as f64;
                let x1 = (512.0 + 100.0 * phase.cos()).round() as u16;
                codec::encode(x1, 0, 0)
            })
            .collect();
        let spectrum = power_spectrum(&words).unwrap();
        assert!(spectrum[k] > spectrum[k - 1]);
        assert!(spectrum[k] > spectrum[k + 1]);
        // conjugate line shows up mirrored
        assert!(spectrum[n - k] > spectrum[n - k - 1]);
        assert!(spectrum[n - k] > spectrum[n - k + 1]);
        // the tone towers over a quiet bin well away from DC and k
        assert!(spectrum[k] > spectrum[20] + 2.0);
    }
}
