//! Online mean/variance accumulator for numeric attribute values.
//!
//! This is the substrate the contextual layer is built on: a self-contained,
//! narrow-contract numeric accumulator with no dependency on the rest of
//! the tree.

use serde::{Deserialize, Serialize};

/// An online (Welford) accumulator of a numeric attribute's mean and
/// variance, updated one observation at a time without retaining the raw
/// samples.
///
/// # Examples
///
/// ```
/// use contextual_cobweb::accumulator::ContinuousValue;
///
/// let mut cv = ContinuousValue::new();
/// cv.update(1.0);
/// cv.update(3.0);
/// assert_eq!(cv.num(), 2);
/// assert!((cv.unbiased_mean() - 2.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContinuousValue {
    num: u64,
    mean: f64,
    m2: f64,
}

impl Default for ContinuousValue {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinuousValue {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            num: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// Folds a single observation in.
    pub fn update(&mut self, value: f64) {
        self.num += 1;
        let delta = value - self.mean;
        self.mean += delta / self.num as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    /// Merges another accumulator's observations into this one, as if every
    /// value folded into `other` had instead been folded into `self`.
    pub fn combine(&mut self, other: &ContinuousValue) {
        if other.num == 0 {
            return;
        }
        if self.num == 0 {
            *self = *other;
            return;
        }

        let combined_num = self.num + other.num;
        let delta = other.mean - self.mean;
        let combined_mean =
            self.mean + delta * (other.num as f64 / combined_num as f64);
        let combined_m2 = self.m2
            + other.m2
            + delta * delta * (self.num as f64 * other.num as f64 / combined_num as f64);

        self.num = combined_num;
        self.mean = combined_mean;
        self.m2 = combined_m2;
    }

    /// The number of observations folded into this accumulator.
    #[must_use]
    pub fn num(&self) -> u64 {
        self.num
    }

    /// The running mean. Zero for an empty accumulator.
    #[must_use]
    pub fn unbiased_mean(&self) -> f64 {
        self.mean
    }

    /// The sample (Bessel-corrected) standard deviation. Zero for fewer
    /// than two observations.
    #[must_use]
    pub fn unbiased_std(&self) -> f64 {
        if self.num < 2 {
            0.0
        } else {
            (self.m2 / (self.num - 1) as f64).sqrt()
        }
    }

    /// The standard deviation normalized against an external `scale` (the
    /// attribute-level population spread, divided by the tree's configured
    /// scaling target). A `scale` of zero disables normalization.
    #[must_use]
    pub fn scaled_unbiased_std(&self, scale: f64) -> f64 {
        if scale > 0.0 {
            self.unbiased_std() / scale
        } else {
            self.unbiased_std()
        }
    }
}
