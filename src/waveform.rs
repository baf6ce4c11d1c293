//! Synthetic TENG-like test signal.
//!
//! A flat baseline with narrow sinusoidal pulses recurring at a fixed period,
//! used in place of a real generator when no hardware is attached.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestCurve {
    /// Distance between pulse centers
    pub period: f64,
    /// Half-width of a pulse; one full sine period spans `2 * peak_width`
    pub peak_width: f64,
    pub amplitude: f64,
    pub bias: f64,
}

impl Default for TestCurve {
    fn default() -> Self {
        Self {
            period: 10.0,
            peak_width: 2.0,
            amplitude: 20.0,
            bias: 0.0,
        }
    }
}

impl TestCurve {
    pub fn new(period: f64, peak_width: f64, amplitude: f64, bias: f64) -> Self {
        Self {
            period,
            peak_width,
            amplitude,
            bias,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.period > 0.0) {
            return Err(format!("period must be positive, got {}", self.period));
        }
        if !(self.peak_width > 0.0) {
            return Err(format!(
                "peak_width must be positive, got {}",
                self.peak_width
            ));
        }
        Ok(())
    }

    /// Value of the curve at `x`.
    ///
    /// Returns `bias` unless `x` lies within `peak_width` of a positive
    /// multiple of `period`. There is no pulse around `x = 0`.
    pub fn value(&self, x: f64) -> f64 {
        // halfway points go to the even multiple
        let nearest_peak = (x / self.period).round_ties_even();
        let offset = x - nearest_peak * self.period;

        if nearest_peak > 0.0 && offset.abs() < self.peak_width {
            self.amplitude * (PI * offset / self.peak_width).sin() + self.bias
        } else {
            self.bias
        }
    }

    /// Sample the curve on `[start, end)` with the given step.
    pub fn sample(&self, start: f64, end: f64, step: f64) -> Vec<(f64, f64)> {
        if !(step > 0.0) || end <= start {
            return Vec::new();
        }
        let n = ((end - start) / step).ceil() as usize;
        (0..n)
            .map(|i| start + i as f64 * step)
            .take_while(|&x| x < end)
            .map(|x| (x, self.value(x)))
            .collect()
    }
}
