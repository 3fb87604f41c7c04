/*
 *  Copyright (c) 2011 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

/// Exponential filter with a time-varying weight: each sample is folded in
/// with `alpha^exp`, where `exp` is the elapsed time (or sample count) since
/// the previous sample. Callers apply samples at irregular intervals, so the
/// decay must scale with actual elapsed time, not sample count.
#[derive(Clone, Debug)]
pub struct ExpFilter {
    alpha: f32,
    filtered: Option<f32>,
    max: f32,
}

impl ExpFilter {
    pub fn new(alpha: f32) -> Self {
        Self::with_max(alpha, f32::MAX)
    }

    pub fn with_max(alpha: f32, max: f32) -> Self {
        Self {
            alpha,
            filtered: None,
            max,
        }
    }

    /// Drops the estimate and installs a new base decay factor.
    pub fn Reset(&mut self, alpha: f32) {
        self.alpha = alpha;
        self.filtered = None;
    }

    /// Folds in `sample` with weight `alpha^exp`. The very first sample after
    /// a reset becomes the estimate directly.
    pub fn Apply(&mut self, exp: f32, sample: f32) -> f32 {
        let filtered = match self.filtered {
            // Initialize filtered value.
            None => sample,
            Some(v) => {
                let alpha = self.alpha.powf(exp);
                alpha * v + (1.0 - alpha) * sample
            }
        };
        let filtered = filtered.min(self.max);
        self.filtered = Some(filtered);
        filtered
    }

    pub fn Value(&self) -> f32 {
        self.filtered.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn FirstSampleIsTakenAsIs() {
        let mut filter = ExpFilter::new(0.9);
        filter.Apply(100.0, 42.0);
        assert_relative_eq!(filter.Value(), 42.0);
    }

    #[test]
    fn DecayScalesWithElapsedTime() {
        let mut fast = ExpFilter::new(0.9999);
        let mut slow = ExpFilter::new(0.9999);
        fast.Apply(1.0, 0.0);
        slow.Apply(1.0, 0.0);
        // A sample applied after 10 s must pull the estimate further than the
        // same sample applied after 1 s.
        fast.Apply(10000.0, 255.0);
        slow.Apply(1000.0, 255.0);
        assert!(fast.Value() > slow.Value());
    }

    #[test]
    fn ResetDropsEstimate() {
        let mut filter = ExpFilter::new(0.9);
        filter.Apply(1.0, 10.0);
        filter.Reset(0.5);
        assert_relative_eq!(filter.Value(), 0.0);
        filter.Apply(1.0, 3.0);
        assert_relative_eq!(filter.Value(), 3.0);
    }

    #[test]
    fn RespectsMax() {
        let mut filter = ExpFilter::with_max(0.9, 0.96);
        filter.Apply(1.0, 2.0);
        assert_relative_eq!(filter.Value(), 0.96);
    }
}
