//! Smoothed continuous probability surface over the week grid.
//!
//! A curve is a length-10,080 non-negative vector summing to ~1. Numerical
//! policy: clamp-to-zero below 1e-12 after every operation, renormalize by
//! total sum (not an Lp norm), never let an empty histogram produce NaN.
//! A curve that collapses to all-zero after weighting is marked suppressed;
//! downstream this signals decision suppression.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TimingError};
use crate::minute_grid::MINUTES_PER_WEEK;

const ZERO_CLAMP: f64 = 1e-12;
const NORMALIZATION_TOLERANCE: f64 = 1e-6;

/// A time-localized multiplicative weight: every slot in
/// `[start_slot, start_slot + len)` (wrapping) receives `omega`.
/// The curve entry is multiplied by `(1 + Σ omega_i)`; an omega of exactly
/// -1 forces the entry to zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightSpan {
    pub start_slot: usize,
    pub len: usize,
    pub omega: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousCurve {
    probs: Vec<f64>,
    suppressed: bool,
}

impl ContinuousCurve {
    /// Every slot at `1 / 10080`.
    pub fn uniform() -> Self {
        Self {
            probs: vec![1.0 / MINUTES_PER_WEEK as f64; MINUTES_PER_WEEK],
            suppressed: false,
        }
    }

    /// Build from a raw per-slot histogram: Laplace prior, circular
    /// Gaussian smoothing, then normalization.
    pub fn from_histogram(counts: &[f64], laplace_alpha: f64, sigma_minutes: f64) -> Result<Self> {
        if counts.len() != MINUTES_PER_WEEK {
            return Err(TimingError::InvalidInput(format!(
                "histogram must have {} slots, got {}",
                MINUTES_PER_WEEK,
                counts.len()
            )));
        }
        let prior = laplace_alpha / MINUTES_PER_WEEK as f64;
        let primed: Vec<f64> = counts.iter().map(|c| c.max(0.0) + prior).collect();
        let smoothed = smooth_circular(&primed, sigma_minutes);
        let mut curve = Self {
            probs: smoothed,
            suppressed: false,
        };
        curve.renormalize();
        Ok(curve)
    }

    /// Rebuild from raw probabilities (e.g. a cohort prior). Negative
    /// entries clamp to zero; an all-zero vector falls back to uniform.
    pub fn from_probabilities(values: Vec<f64>) -> Result<Self> {
        if values.len() != MINUTES_PER_WEEK {
            return Err(TimingError::InvalidInput(format!(
                "curve must have {} slots, got {}",
                MINUTES_PER_WEEK,
                values.len()
            )));
        }
        let mut curve = Self {
            probs: values.into_iter().map(|v| v.max(0.0)).collect(),
            suppressed: false,
        };
        if curve.probs.iter().sum::<f64>() <= 0.0 {
            return Ok(Self::uniform());
        }
        curve.renormalize();
        Ok(curve)
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probs
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn get(&self, slot: usize) -> f64 {
        self.probs[slot % MINUTES_PER_WEEK]
    }

    /// Linear interpolation between adjacent slots, wrapping at the week
    /// boundary. Accepts fractional slots.
    pub fn interpolate(&self, slot_real: f64) -> f64 {
        let n = MINUTES_PER_WEEK as f64;
        let x = slot_real.rem_euclid(n);
        let i0 = x.floor() as usize % MINUTES_PER_WEEK;
        let i1 = (i0 + 1) % MINUTES_PER_WEEK;
        let frac = x - x.floor();
        self.probs[i0] * (1.0 - frac) + self.probs[i1] * frac
    }

    /// Argmax over a half-open wrapped window `[start_slot, end_slot)`.
    /// `start_slot == end_slot` means the whole week. Ties break toward the
    /// smaller slot index. `None` when the curve is suppressed.
    pub fn peak_in_window(&self, start_slot: usize, end_slot: usize) -> Option<usize> {
        if self.suppressed {
            return None;
        }
        let start = start_slot % MINUTES_PER_WEEK;
        let end = end_slot % MINUTES_PER_WEEK;
        let len = if start == end {
            MINUTES_PER_WEEK
        } else {
            (end + MINUTES_PER_WEEK - start) % MINUTES_PER_WEEK
        };

        let mut best_slot = None;
        let mut best_p = f64::NEG_INFINITY;
        for i in 0..len {
            let slot = (start + i) % MINUTES_PER_WEEK;
            let p = self.probs[slot];
            let better = p > best_p
                || (p == best_p && best_slot.map(|b| slot < b).unwrap_or(true));
            if better {
                best_p = p;
                best_slot = Some(slot);
            }
        }
        best_slot
    }

    /// Top-K peak slots ordered by probability descending, slot ascending
    /// on ties.
    pub fn top_peaks(&self, k: usize) -> Vec<(usize, f64)> {
        let mut indexed: Vec<(usize, f64)> =
            self.probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then(a.0.cmp(&b.0)));
        indexed.truncate(k);
        indexed
    }

    /// Multiply each entry by `(1 + Σ omega_i)` over the supplied spans; an
    /// omega of -1 zeroes the entry outright. Renormalizes afterwards, or
    /// marks the curve suppressed when nothing survives.
    pub fn apply_weights(&mut self, weights: &[WeightSpan]) {
        if weights.is_empty() || self.suppressed {
            return;
        }
        let mut omega_sum = vec![0.0f64; MINUTES_PER_WEEK];
        let mut forced_zero = vec![false; MINUTES_PER_WEEK];
        for w in weights {
            let len = w.len.min(MINUTES_PER_WEEK);
            for i in 0..len {
                let slot = (w.start_slot + i) % MINUTES_PER_WEEK;
                if w.omega == -1.0 {
                    forced_zero[slot] = true;
                } else {
                    omega_sum[slot] += w.omega;
                }
            }
        }
        for slot in 0..MINUTES_PER_WEEK {
            if forced_zero[slot] {
                self.probs[slot] = 0.0;
            } else {
                self.probs[slot] *= (1.0 + omega_sum[slot]).max(0.0);
            }
        }
        self.renormalize();
    }

    /// Zero out every entry outside the half-open wrapped window
    /// `[start_slot, end_slot)`. `start_slot == end_slot` keeps the whole
    /// week untouched.
    pub fn clip_to_window(&mut self, start_slot: usize, end_slot: usize) {
        let start = start_slot % MINUTES_PER_WEEK;
        let end = end_slot % MINUTES_PER_WEEK;
        if start == end || self.suppressed {
            return;
        }
        let inside = |slot: usize| {
            if start < end {
                slot >= start && slot < end
            } else {
                slot >= start || slot < end
            }
        };
        for slot in 0..MINUTES_PER_WEEK {
            if !inside(slot) {
                self.probs[slot] = 0.0;
            }
        }
        self.renormalize();
    }

    /// Entropy-based sharpness score: a uniform curve scores 0, a delta
    /// distribution scores 1. Suppressed curves score 0.
    pub fn confidence(&self) -> f64 {
        if self.suppressed {
            return 0.0;
        }
        let mut entropy = 0.0;
        for &p in &self.probs {
            if p > 0.0 {
                entropy -= p * p.ln();
            }
        }
        let max_entropy = (MINUTES_PER_WEEK as f64).ln();
        (1.0 - entropy / max_entropy).clamp(0.0, 1.0)
    }

    /// Packed little-endian f32 encoding for the feature cache.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MINUTES_PER_WEEK * 4);
        for &p in &self.probs {
            out.extend_from_slice(&(p as f32).to_le_bytes());
        }
        out
    }

    /// Decode a packed curve. Renormalizes only when the stored sum drifted
    /// beyond tolerance, so decode/encode is a fixed point for curves that
    /// were normalized before packing.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != MINUTES_PER_WEEK * 4 {
            return Err(TimingError::InvalidInput(format!(
                "packed curve must be {} bytes, got {}",
                MINUTES_PER_WEEK * 4,
                bytes.len()
            )));
        }
        let mut probs = Vec::with_capacity(MINUTES_PER_WEEK);
        for chunk in bytes.chunks_exact(4) {
            let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64;
            probs.push(v.max(0.0));
        }
        let sum: f64 = probs.iter().sum();
        if sum <= 0.0 {
            return Ok(Self {
                probs: vec![0.0; MINUTES_PER_WEEK],
                suppressed: true,
            });
        }
        let mut curve = Self {
            probs,
            suppressed: false,
        };
        if (sum - 1.0).abs() > NORMALIZATION_TOLERANCE {
            curve.renormalize();
        }
        curve
            .probs
            .iter_mut()
            .for_each(|p| *p = if *p < ZERO_CLAMP { 0.0 } else { *p });
        Ok(curve)
    }

    fn renormalize(&mut self) {
        for p in &mut self.probs {
            if !p.is_finite() || *p < ZERO_CLAMP {
                *p = 0.0;
            }
        }
        let sum: f64 = self.probs.iter().sum();
        if sum <= 0.0 {
            self.probs.iter_mut().for_each(|p| *p = 0.0);
            self.suppressed = true;
            return;
        }
        for p in &mut self.probs {
            *p /= sum;
            if *p < ZERO_CLAMP {
                *p = 0.0;
            }
        }
    }
}

/// Circular convolution with a Gaussian kernel truncated at 4 sigma.
/// Circularity preserves weekday/weekend continuity: density at Sunday
/// 23:59 bleeds into Monday 00:00.
pub fn smooth_circular(values: &[f64], sigma_minutes: f64) -> Vec<f64> {
    let n = values.len();
    if sigma_minutes <= 0.0 || n == 0 {
        return values.to_vec();
    }
    let radius = ((4.0 * sigma_minutes).ceil() as usize).min(n / 2);
    let denom = 2.0 * sigma_minutes * sigma_minutes;
    let mut kernel = Vec::with_capacity(2 * radius + 1);
    for i in 0..=(2 * radius) {
        let d = i as f64 - radius as f64;
        kernel.push((-d * d / denom).exp());
    }
    let kernel_sum: f64 = kernel.iter().sum();

    let mut out = vec![0.0f64; n];
    for (slot, entry) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (ki, kw) in kernel.iter().enumerate() {
            let src = (slot + n + ki - radius) % n;
            acc += values[src] * kw;
        }
        *entry = acc / kernel_sum;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_normalized(curve: &ContinuousCurve) {
        let sum: f64 = curve.probabilities().iter().sum();
        assert!((sum - 1.0).abs() <= 1e-6, "sum was {}", sum);
    }

    #[test]
    fn test_uniform_sums_to_one_and_zero_confidence() {
        let c = ContinuousCurve::uniform();
        assert_normalized(&c);
        assert!(c.confidence() < 1e-9);
    }

    #[test]
    fn test_from_histogram_peak_near_sample() {
        let mut counts = vec![0.0; MINUTES_PER_WEEK];
        counts[540] = 1.0;
        let c = ContinuousCurve::from_histogram(&counts, 1.0, 30.0).unwrap();
        assert_normalized(&c);
        let peak = c.peak_in_window(0, 0).unwrap();
        assert!(
            (peak as i64 - 540).abs() <= 30,
            "peak {} too far from sample",
            peak
        );
        assert!(c.confidence() > 0.0);
    }

    #[test]
    fn test_circular_smoothing_bleeds_across_week_boundary() {
        // Sunday 23:59 must contribute density to Monday 00:00.
        let mut counts = vec![0.0; MINUTES_PER_WEEK];
        counts[10_079] = 10.0;
        let c = ContinuousCurve::from_histogram(&counts, 0.0, 30.0).unwrap();
        let uniform_level = 1.0 / MINUTES_PER_WEEK as f64;
        assert!(c.get(0) > uniform_level);
        assert!(c.get(10_079) > c.get(0));
    }

    #[test]
    fn test_peak_tie_breaks_to_smaller_slot() {
        let c = ContinuousCurve::uniform();
        assert_eq!(c.peak_in_window(0, 0), Some(0));
        assert_eq!(c.peak_in_window(300, 400), Some(300));
        // Wrapping window: smallest absolute index inside wins.
        assert_eq!(c.peak_in_window(10_000, 100), Some(0));
    }

    #[test]
    fn test_interpolate_between_slots() {
        let mut counts = vec![0.0; MINUTES_PER_WEEK];
        counts[100] = 5.0;
        let c = ContinuousCurve::from_histogram(&counts, 0.0, 10.0).unwrap();
        let mid = c.interpolate(100.5);
        assert!(mid <= c.get(100));
        assert!(mid >= c.get(101).min(c.get(100)));
        // Wraps cleanly.
        let _ = c.interpolate(-0.5);
        let _ = c.interpolate(10_080.25);
    }

    #[test]
    fn test_apply_weights_boosts_span() {
        let mut c = ContinuousCurve::uniform();
        c.apply_weights(&[WeightSpan {
            start_slot: 10,
            len: 5,
            omega: 2.0,
        }]);
        assert_normalized(&c);
        assert!(c.get(10) > c.get(100));
        assert_eq!(c.peak_in_window(0, 0), Some(10));
    }

    #[test]
    fn test_weight_of_minus_one_zeroes_entries() {
        let mut c = ContinuousCurve::uniform();
        c.apply_weights(&[WeightSpan {
            start_slot: 0,
            len: 10,
            omega: -1.0,
        }]);
        assert_eq!(c.get(5), 0.0);
        assert_normalized(&c);
        assert!(!c.is_suppressed());
    }

    #[test]
    fn test_zeroing_everything_marks_suppressed() {
        let mut c = ContinuousCurve::uniform();
        c.apply_weights(&[WeightSpan {
            start_slot: 0,
            len: MINUTES_PER_WEEK,
            omega: -1.0,
        }]);
        assert!(c.is_suppressed());
        assert_eq!(c.confidence(), 0.0);
        assert_eq!(c.peak_in_window(0, 0), None);
        let sum: f64 = c.probabilities().iter().sum();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn test_clip_to_wrapping_window() {
        let mut c = ContinuousCurve::uniform();
        c.clip_to_window(10_000, 100);
        assert_normalized(&c);
        assert!(c.get(10_050) > 0.0);
        assert!(c.get(50) > 0.0);
        assert_eq!(c.get(5_000), 0.0);
    }

    #[test]
    fn test_bytes_roundtrip_is_fixed_point() {
        let mut counts = vec![0.0; MINUTES_PER_WEEK];
        counts[42] = 3.0;
        counts[9_000] = 7.0;
        let c = ContinuousCurve::from_histogram(&counts, 1.0, 30.0).unwrap();
        let bytes = c.to_bytes();
        let reloaded = ContinuousCurve::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded.to_bytes(), bytes);
        assert_normalized(&reloaded);
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(ContinuousCurve::from_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_top_peaks_ordering() {
        let mut counts = vec![0.0; MINUTES_PER_WEEK];
        counts[100] = 10.0;
        counts[5_000] = 5.0;
        let c = ContinuousCurve::from_histogram(&counts, 0.0, 5.0).unwrap();
        let peaks = c.top_peaks(2);
        assert_eq!(peaks[0].0, 100);
        assert!(peaks[0].1 > peaks[1].1);
    }
}
