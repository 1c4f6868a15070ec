//! Pulse waveform synthesis.
//!
//! Turns a [`Pulse`] into the sample buffer uploaded to the AWG. Pure and
//! deterministic. The buffer shape never depends on the pulse amplitude;
//! amplitude is applied on the instrument as a separate gain command.

use crate::error::{AppResult, PpError};
use crate::experiment::Pulse;
use serde::{Deserialize, Serialize};

/// Sampling parameters and the generator's hard limits.
///
/// Defaults are the Keysight 33600A figures: 1 GSa/s, 4 ns minimum edge,
/// 4 ns minimum plateau, and arbitrary waveforms of 32 points up to the
/// 4 MSa standard memory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveformConfig {
    pub sample_rate_hz: f64,
    /// Seconds.
    pub min_rise_time: f64,
    /// Seconds.
    pub min_width: f64,
    /// Samples.
    pub min_arb_length: usize,
    /// Samples.
    pub max_arb_length: usize,
}

impl Default for WaveformConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 1e9,
            min_rise_time: 4e-9,
            min_width: 4e-9,
            min_arb_length: 32,
            max_arb_length: 4_000_000,
        }
    }
}

impl WaveformConfig {
    fn samples(&self, seconds: f64) -> usize {
        let n = (seconds * self.sample_rate_hz).round();
        if n.is_finite() && n > 0.0 {
            n as usize
        } else {
            0
        }
    }

    /// Edge length in samples, never shorter than the minimum rise time.
    pub fn edge_samples(&self, edge: f64) -> usize {
        self.samples(self.min_rise_time).max(self.samples(edge))
    }

    fn plateau_samples(&self, width: f64) -> usize {
        if width > self.min_width {
            self.samples(self.min_width).max(self.samples(width))
        } else {
            0
        }
    }

    /// Smallest buffer length allowed for a pulse with this period.
    pub fn min_length(&self, time_spread: f64) -> usize {
        self.min_arb_length.max(self.samples(time_spread))
    }

    /// Length of the buffer [`synthesize`] builds for `pulse`.
    pub fn buffer_length(&self, pulse: &Pulse) -> usize {
        self.edge_samples(pulse.edge)
            .saturating_mul(2)
            .saturating_add(self.plateau_samples(pulse.width))
            .max(self.min_length(pulse.time_spread))
    }

    /// Rejects a pulse whose buffer would not fit in generator memory.
    pub fn check_pulse(&self, pulse: &Pulse) -> AppResult<usize> {
        let length = self.buffer_length(pulse);
        if length > self.max_arb_length {
            return Err(PpError::Waveform(format!(
                "pulse needs {length} samples, the generator holds at most {}",
                self.max_arb_length
            )));
        }
        Ok(length)
    }
}

/// `n` evenly spaced points from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Rising edge, optional plateau, mirrored falling edge, then zero padding
/// up to [`WaveformConfig::min_length`].
///
/// Allocates [`WaveformConfig::buffer_length`] samples; callers bound it with
/// [`WaveformConfig::check_pulse`] first.
pub fn synthesize(pulse: &Pulse, config: &WaveformConfig) -> Vec<f64> {
    let rising = linspace(0.0, 1.0, config.edge_samples(pulse.edge));
    let plateau = config.plateau_samples(pulse.width);

    let target = config.min_length(pulse.time_spread);
    let mut buffer = Vec::with_capacity(target.max(2 * rising.len() + plateau));
    buffer.extend_from_slice(&rising);
    buffer.extend(std::iter::repeat(1.0).take(plateau));
    buffer.extend(rising.iter().rev());

    if buffer.len() < target {
        buffer.resize(target, 0.0);
    }
    buffer
}

/// Scales a buffer by its own peak magnitude into [-1, 1] single precision.
/// An all-zero buffer is returned unscaled.
pub fn normalize_unit(buffer: &[f64]) -> Vec<f32> {
    let peak = buffer.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    if peak == 0.0 {
        return buffer.iter().map(|&v| v as f32).collect();
    }
    buffer.iter().map(|&v| (v / peak) as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse(amp: f64, width: f64, edge: f64, time_spread: f64) -> Pulse {
        Pulse {
            amp,
            width,
            edge,
            time_spread,
        }
    }

    #[test]
    fn zero_width_is_symmetric_triangle() {
        let config = WaveformConfig::default();
        let buffer = synthesize(&pulse(1.0, 0.0, 3e-9, 0.0), &config);
        let edge = config.edge_samples(3e-9);
        assert_eq!(edge, 4);

        let (rise, rest) = buffer.split_at(edge);
        let fall: Vec<f64> = rest[..edge].iter().rev().copied().collect();
        assert_eq!(rise, fall.as_slice());
        assert_eq!(rise.first(), Some(&0.0));
        assert_eq!(rise.last(), Some(&1.0));
        assert!(rest[edge..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn plateau_only_above_min_width() {
        let config = WaveformConfig::default();
        let narrow = synthesize(&pulse(1.0, 4e-9, 10e-9, 0.0), &config);
        let wide = synthesize(&pulse(1.0, 10e-9, 10e-9, 0.0), &config);
        let ones = |b: &[f64]| b.iter().filter(|&&v| v == 1.0).count();
        // Each edge ends on exactly one sample at 1.0.
        assert_eq!(ones(&narrow), 2);
        assert_eq!(ones(&wide), 12);
    }

    #[test]
    fn length_respects_period_and_minimum() {
        let config = WaveformConfig::default();
        for (width, edge, spread) in [
            (10e-9, 3e-9, 100e-9),
            (0.0, 1e-9, 5e-9),
            (80e-9, 20e-9, 100e-9),
            (2e-9, 4e-9, 1e-6),
        ] {
            let buffer = synthesize(&pulse(0.5, width, edge, spread), &config);
            assert!(buffer.len() >= config.min_length(spread));
            assert!(buffer.len() >= config.min_arb_length);
        }
        let buffer = synthesize(&pulse(0.95, 10e-9, 3e-9, 100e-9), &config);
        assert_eq!(buffer.len(), 100);
    }

    #[test]
    fn buffer_length_matches_synthesis() {
        let config = WaveformConfig::default();
        for p in [
            pulse(0.95, 10e-9, 3e-9, 100e-9),
            pulse(1.0, 0.0, 1e-9, 5e-9),
            pulse(1.0, 150e-9, 30e-9, 100e-9),
        ] {
            assert_eq!(config.buffer_length(&p), synthesize(&p, &config).len());
        }
    }

    #[test]
    fn oversized_pulse_rejected_before_allocation() {
        let config = WaveformConfig::default();
        assert_eq!(config.check_pulse(&pulse(0.5, 10e-9, 3e-9, 100e-9)).unwrap(), 100);

        let err = config.check_pulse(&pulse(0.5, 10e-9, 3e-9, 1.0)).unwrap_err();
        assert!(matches!(err, PpError::Waveform(_)));
        assert!(err.to_string().contains("1000000000 samples"));

        let long_edge = pulse(0.5, 0.0, 0.01, 100e-9);
        assert!(config.check_pulse(&long_edge).is_err());
    }

    #[test]
    fn shape_independent_of_amplitude() {
        let config = WaveformConfig::default();
        let low = synthesize(&pulse(0.1, 10e-9, 3e-9, 100e-9), &config);
        let high = synthesize(&pulse(2.5, 10e-9, 3e-9, 100e-9), &config);
        assert_eq!(low, high);
    }

    #[test]
    fn normalize_divides_by_peak() {
        let scaled = normalize_unit(&[0.0, -2.0, 1.0]);
        assert_eq!(scaled, vec![0.0, -1.0, 0.5]);
        assert_eq!(normalize_unit(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn linspace_includes_endpoints() {
        let values = linspace(-180.0, 180.0, 400);
        assert_eq!(values.len(), 400);
        assert_eq!(values[0], -180.0);
        assert_eq!(values[399], 180.0);
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(linspace(2.0, 5.0, 1), vec![2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }
}
