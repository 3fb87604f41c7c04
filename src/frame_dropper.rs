/*
 *  Copyright (c) 2011 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

use crate::ExpFilter;

/// Token bucket deciding whether the next frame must be skipped to keep the
/// encoder within its bitrate budget. The bucket leaks at the target rate
/// (`Leak`, once per frame tick) and is drained by every encoded frame
/// (`Fill`). Key-frame fills are smoothed over several frames so a natural
/// key-frame spike does not trigger a burst of drops.
pub struct FrameDropper {
    enabled: bool,
    // Tokens available for the next frame, in kbits. Negative means the
    // encoder is in debt and the next frame is dropped.
    accumulator_kbits: f32,
    accumulator_cap_kbits: f32,
    per_frame_budget_kbits: f32,
    target_rate_kbps: f32,
    frame_rate_fps: f32,
    // Remainder of a smoothed key-frame fill, consumed chunk-wise per leak.
    key_frame_pending_kbits: f32,
    key_frame_chunk_kbits: f32,
    // Set when a single frame exceeded the whole bucket capacity.
    large_frame_overshoot: bool,
    // Fraction of recent frames dropped, drives ActualFrameRate().
    drop_ratio: ExpFilter,
}

impl Default for FrameDropper {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDropper {
    // The bucket holds at most half a second of the target rate.
    const WINDOW_S: f32 = 0.5;
    const DROP_RATIO_ALPHA: f32 = 0.9;
    const DROP_RATIO_MAX: f32 = 0.96;

    pub fn new() -> Self {
        let mut this = Self {
            enabled: true,
            accumulator_kbits: 0.0,
            accumulator_cap_kbits: 0.0,
            per_frame_budget_kbits: 0.0,
            target_rate_kbps: 0.0,
            frame_rate_fps: 0.0,
            key_frame_pending_kbits: 0.0,
            key_frame_chunk_kbits: 0.0,
            large_frame_overshoot: false,
            drop_ratio: ExpFilter::with_max(Self::DROP_RATIO_ALPHA, Self::DROP_RATIO_MAX),
        };
        this.Reset();
        this
    }

    pub fn Reset(&mut self) {
        self.accumulator_kbits = 0.0;
        self.accumulator_cap_kbits = 0.0;
        self.per_frame_budget_kbits = 0.0;
        self.key_frame_pending_kbits = 0.0;
        self.key_frame_chunk_kbits = 0.0;
        self.large_frame_overshoot = false;
        self.drop_ratio.Reset(Self::DROP_RATIO_ALPHA);
    }

    pub fn Enable(&mut self, enable: bool) {
        self.enabled = enable;
    }

    /// Re-rates the bucket. `frame_rate_fps == 0` keeps the previous frame
    /// rate (used when only the bitrate changed).
    pub fn SetRates(&mut self, bit_rate_kbps: f32, frame_rate_fps: f32) {
        self.target_rate_kbps = bit_rate_kbps.max(0.0);
        if frame_rate_fps > 0.0 {
            self.frame_rate_fps = frame_rate_fps;
        }
        self.per_frame_budget_kbits = if self.frame_rate_fps > 0.0 {
            self.target_rate_kbps / self.frame_rate_fps
        } else {
            0.0
        };
        self.accumulator_cap_kbits = Self::WINDOW_S * self.target_rate_kbps;
        // Start over with one frame of credit.
        self.accumulator_kbits = self.per_frame_budget_kbits;
        self.key_frame_pending_kbits = 0.0;
        self.key_frame_chunk_kbits = 0.0;
        self.large_frame_overshoot = false;
    }

    /// Charges the bucket for an encoded frame.
    pub fn Fill(&mut self, encoded_size_bytes: usize, delta_frame: bool) {
        if !self.enabled {
            return;
        }
        let size_kbits = encoded_size_bytes as f32 * 8.0 / 1000.0;
        if size_kbits > self.accumulator_cap_kbits {
            self.large_frame_overshoot = true;
        }
        if delta_frame {
            self.accumulator_kbits -= size_kbits;
        } else {
            // Spread the key frame over up to one second of frame slots so a
            // single natural spike does not force drops on its own.
            let spread = (size_kbits / self.per_frame_budget_kbits.max(f32::EPSILON))
                .round()
                .clamp(1.0, self.frame_rate_fps.max(1.0));
            let chunk = size_kbits / spread;
            self.accumulator_kbits -= chunk;
            self.key_frame_pending_kbits += size_kbits - chunk;
            self.key_frame_chunk_kbits = chunk;
        }
        self.CapAccumulator();
    }

    /// Leaks one frame interval worth of budget into the bucket and consumes
    /// one chunk of any pending key-frame debt.
    pub fn Leak(&mut self, input_frame_rate_fps: f32) {
        if !self.enabled || input_frame_rate_fps < 1.0 {
            return;
        }
        if self.target_rate_kbps <= 0.0 {
            return;
        }
        self.accumulator_kbits += self.target_rate_kbps / input_frame_rate_fps;
        if self.key_frame_pending_kbits > 0.0 {
            let chunk = self.key_frame_chunk_kbits.min(self.key_frame_pending_kbits);
            self.accumulator_kbits -= chunk;
            self.key_frame_pending_kbits -= chunk;
        }
        self.CapAccumulator();
    }

    /// True iff the next frame must be skipped.
    pub fn DropNextFrame(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        let drop = self.accumulator_kbits < 0.0 || self.large_frame_overshoot;
        self.large_frame_overshoot = false;
        self.drop_ratio.Apply(1.0, if drop { 1.0 } else { 0.0 });
        drop
    }

    /// Estimated frame rate actually sent, given the incoming rate.
    pub fn ActualFrameRate(&self, input_frame_rate_fps: f32) -> f32 {
        if !self.enabled {
            return input_frame_rate_fps;
        }
        input_frame_rate_fps * (1.0 - self.drop_ratio.Value())
    }

    fn CapAccumulator(&mut self) {
        self.accumulator_kbits = self
            .accumulator_kbits
            .clamp(-self.accumulator_cap_kbits, self.accumulator_cap_kbits);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn dropper_at(bit_rate_kbps: f32, frame_rate_fps: f32) -> FrameDropper {
        let mut dropper = FrameDropper::new();
        dropper.SetRates(bit_rate_kbps, frame_rate_fps);
        dropper
    }

    #[test]
    fn NoDropsWhenOnBudget() {
        let mut dropper = dropper_at(300.0, 30.0);
        // 300 kbps at 30 fps is 1250 bytes per frame.
        for _ in 0..100 {
            dropper.Leak(30.0);
            assert!(!dropper.DropNextFrame());
            dropper.Fill(1250, true);
        }
        assert_relative_eq!(dropper.ActualFrameRate(30.0), 30.0);
    }

    #[test]
    fn DropsWhenOverBudget() {
        let mut dropper = dropper_at(100.0, 30.0);
        let mut dropped = 0;
        for _ in 0..10 {
            dropper.Leak(30.0);
            if dropper.DropNextFrame() {
                dropped += 1;
            } else {
                // Double the per-frame budget on every sent frame.
                dropper.Fill(834, true);
            }
        }
        assert!(dropped > 0);
        assert!(dropper.ActualFrameRate(30.0) < 30.0);
    }

    #[test]
    fn KeyFrameSpikeIsSmoothed() {
        let mut dropper = dropper_at(300.0, 30.0);
        dropper.Leak(30.0);
        // A 5x key frame within bucket capacity: spread, not dropped outright.
        dropper.Fill(6250, false);
        dropper.Leak(30.0);
        assert!(!dropper.DropNextFrame());
    }

    #[test]
    fn OversizedFrameFlagsOvershoot() {
        let mut dropper = dropper_at(100.0, 30.0);
        dropper.Leak(30.0);
        dropper.Fill(20000, true); // 160 kbits against a 50 kbit bucket
        assert!(dropper.DropNextFrame());
    }

    #[test]
    fn DisableForcesSend() {
        let mut dropper = dropper_at(100.0, 30.0);
        for _ in 0..10 {
            dropper.Leak(30.0);
            dropper.Fill(20000, true);
        }
        assert!(dropper.DropNextFrame());
        dropper.Enable(false);
        dropper.Fill(20000, true);
        assert!(!dropper.DropNextFrame());
    }

    #[test]
    fn SetRatesResetsBucket() {
        let mut dropper = dropper_at(100.0, 30.0);
        dropper.Fill(20000, true);
        assert!(dropper.DropNextFrame());
        dropper.SetRates(100.0, 30.0);
        assert!(!dropper.DropNextFrame());
    }
}
