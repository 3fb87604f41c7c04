/*
 *  Copyright (c) 2011 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

use crate::ContentMetrics;

/// Motion fields are only meaningful when enough blocks actually moved.
const MIN_ZERO_MOTION_SIZE: f32 = 0.1;
/// Window for the content-change detector, in seconds of frames.
const CHANGE_WINDOW_S: f32 = 5.0;
/// Relative move of the normalized motion or spatial sum that counts as a
/// scene change.
const CHANGE_THR: f32 = 0.4;

/// Maintains a recursive time-average of the per-frame content metrics and a
/// short-term sum used to detect scene changes. The per-frame snapshot is
/// folded in by value; no reference outlives the update call.
pub struct ContentMetricsProcessing {
    recursive_avg: ContentMetrics,
    frame_rate_fps: f32,
    frame_cnt: u32,
    // Local (non-averaged) sums for the change detector.
    short_motion_sum: f32,
    short_spatial_sum: f32,
    short_frame_cnt: u32,
    prev_norm_motion: Option<f32>,
    prev_norm_spatial: Option<f32>,
    change_detected: bool,
}

impl Default for ContentMetricsProcessing {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentMetricsProcessing {
    pub fn new() -> Self {
        Self {
            recursive_avg: ContentMetrics::default(),
            frame_rate_fps: 0.0,
            frame_cnt: 0,
            short_motion_sum: 0.0,
            short_spatial_sum: 0.0,
            short_frame_cnt: 0,
            prev_norm_motion: None,
            prev_norm_spatial: None,
            change_detected: false,
        }
    }

    pub fn Reset(&mut self) {
        self.recursive_avg = ContentMetrics::default();
        self.frame_cnt = 0;
        self.ResetShortTermAvgData();
        self.prev_norm_motion = None;
        self.prev_norm_spatial = None;
        self.change_detected = false;
    }

    pub fn ResetShortTermAvgData(&mut self) {
        self.short_motion_sum = 0.0;
        self.short_spatial_sum = 0.0;
        self.short_frame_cnt = 0;
    }

    pub fn UpdateFrameRate(&mut self, frame_rate_fps: f32) {
        self.frame_rate_fps = frame_rate_fps;
    }

    /// Folds one frame of metrics into the global recursive average.
    pub fn UpdateContentData(&mut self, metrics: &ContentMetrics) {
        self.UpdateGlobal(metrics);
        self.ContentChangeCheck(metrics);
    }

    /// Long-term averaged metrics, None until the first frame arrives.
    pub fn LongTermAvgData(&self) -> Option<ContentMetrics> {
        if self.frame_cnt == 0 {
            return None;
        }
        Some(self.recursive_avg)
    }

    /// True once the local sums moved more than CHANGE_THR relative to their
    /// previous 5-second average. Cleared by Reset().
    pub fn content_change(&self) -> bool {
        self.change_detected
    }

    fn UpdateGlobal(&mut self, metrics: &ContentMetrics) {
        // Time-weighted recursive factor; the first frame hard-replaces the
        // average to avoid a long convergence from zero.
        let beta = if self.frame_cnt == 0 || self.frame_rate_fps <= 0.0 {
            1.0
        } else {
            (1000.0 / (self.frame_rate_fps * 1000.0)).min(1.0)
        };
        let avg = &mut self.recursive_avg;
        avg.motion_magnitude_nz = fold(avg.motion_magnitude_nz, metrics.motion_magnitude_nz, beta);
        avg.size_zero_motion = fold(avg.size_zero_motion, metrics.size_zero_motion, beta);
        avg.spatial_pred_err = fold(avg.spatial_pred_err, metrics.spatial_pred_err, beta);
        avg.spatial_pred_err_h = fold(avg.spatial_pred_err_h, metrics.spatial_pred_err_h, beta);
        avg.spatial_pred_err_v = fold(avg.spatial_pred_err_v, metrics.spatial_pred_err_v, beta);
        // The motion-field shape is only averaged when enough blocks moved.
        if metrics.size_zero_motion > MIN_ZERO_MOTION_SIZE {
            avg.motion_horizontalness =
                fold(avg.motion_horizontalness, metrics.motion_horizontalness, beta);
            avg.motion_cluster_distortion = fold(
                avg.motion_cluster_distortion,
                metrics.motion_cluster_distortion,
                beta,
            );
        }
        // Native values pass through unchanged.
        avg.native_width = metrics.native_width;
        avg.native_height = metrics.native_height;
        avg.native_frame_rate = metrics.native_frame_rate;
        self.frame_cnt += 1;
    }

    fn ContentChangeCheck(&mut self, metrics: &ContentMetrics) {
        self.short_motion_sum += metrics.motion_magnitude_nz;
        self.short_spatial_sum += (metrics.spatial_pred_err
            + metrics.spatial_pred_err_h
            + metrics.spatial_pred_err_v)
            / 3.0;
        self.short_frame_cnt += 1;

        let window_frames = (CHANGE_WINDOW_S * self.frame_rate_fps).max(1.0) as u32;
        if self.short_frame_cnt < window_frames {
            return;
        }
        let norm_motion = self.short_motion_sum / self.short_frame_cnt as f32;
        let norm_spatial = self.short_spatial_sum / self.short_frame_cnt as f32;
        if let (Some(prev_motion), Some(prev_spatial)) =
            (self.prev_norm_motion, self.prev_norm_spatial)
        {
            if relative_move(norm_motion, prev_motion) > CHANGE_THR
                || relative_move(norm_spatial, prev_spatial) > CHANGE_THR
            {
                self.change_detected = true;
            }
        }
        self.prev_norm_motion = Some(norm_motion);
        self.prev_norm_spatial = Some(norm_spatial);
        self.ResetShortTermAvgData();
    }
}

fn fold(avg: f32, sample: f32, beta: f32) -> f32 {
    (1.0 - beta) * avg + beta * sample
}

fn relative_move(value: f32, prev: f32) -> f32 {
    if prev <= f32::EPSILON {
        return if value > f32::EPSILON { 1.0 } else { 0.0 };
    }
    (value - prev).abs() / prev
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn metrics(motion: f32, spatial: f32) -> ContentMetrics {
        ContentMetrics {
            motion_magnitude_nz: motion,
            size_zero_motion: 0.5,
            spatial_pred_err: spatial,
            spatial_pred_err_h: spatial,
            spatial_pred_err_v: spatial,
            motion_horizontalness: 0.3,
            motion_cluster_distortion: 0.2,
            native_width: 640,
            native_height: 480,
            native_frame_rate: 30.0,
        }
    }

    #[test]
    fn FirstFrameReplacesAverage() {
        let mut content = ContentMetricsProcessing::new();
        content.UpdateFrameRate(30.0);
        assert!(content.LongTermAvgData().is_none());
        content.UpdateContentData(&metrics(0.1, 0.02));
        let avg = content.LongTermAvgData().unwrap();
        assert_relative_eq!(avg.motion_magnitude_nz, 0.1);
        assert_relative_eq!(avg.spatial_pred_err, 0.02);
        assert_eq!(avg.native_width, 640);
    }

    #[test]
    fn RecursiveAverageConverges() {
        let mut content = ContentMetricsProcessing::new();
        content.UpdateFrameRate(30.0);
        content.UpdateContentData(&metrics(0.0, 0.0));
        for _ in 0..300 {
            content.UpdateContentData(&metrics(0.3, 0.03));
        }
        let avg = content.LongTermAvgData().unwrap();
        assert!((avg.motion_magnitude_nz - 0.3).abs() < 0.01);
        assert!((avg.spatial_pred_err - 0.03).abs() < 0.001);
    }

    #[test]
    fn MotionShapeSkippedForStationaryFrames() {
        let mut content = ContentMetricsProcessing::new();
        content.UpdateFrameRate(30.0);
        let mut stationary = metrics(0.0, 0.02);
        stationary.size_zero_motion = 0.05;
        stationary.motion_horizontalness = 0.9;
        content.UpdateContentData(&stationary);
        let avg = content.LongTermAvgData().unwrap();
        assert_relative_eq!(avg.motion_horizontalness, 0.0);
    }

    #[test]
    fn SceneChangeFlagsAfterTwoWindows() {
        let mut content = ContentMetricsProcessing::new();
        content.UpdateFrameRate(30.0);
        // 5 s of quiet content, then 5 s of heavy motion.
        for _ in 0..150 {
            content.UpdateContentData(&metrics(0.05, 0.02));
        }
        assert!(!content.content_change());
        for _ in 0..150 {
            content.UpdateContentData(&metrics(0.3, 0.02));
        }
        assert!(content.content_change());
        content.Reset();
        assert!(!content.content_change());
    }
}
