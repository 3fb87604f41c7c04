/*
 *  Copyright (c) 2011 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

/// Type of an encoded frame as reported by the encoder wrapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    Key,
    Delta,
    Golden,
}

impl FrameType {
    /// Golden frames are treated like key frames for rate purposes: they are
    /// large and not part of the regular delta-frame cadence.
    pub fn is_delta(self) -> bool {
        !matches!(self, FrameType::Key | FrameType::Golden)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodecType {
    Unknown,
    Vp8,
    H264,
    Generic,
}

/// Per-frame content analysis produced by the encoder's pre-processing pass.
/// The snapshot is only borrowed for the duration of the update call; the
/// aggregator stores a recursive average by value.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ContentMetrics {
    /// Average motion vector magnitude over the non-zero motion blocks, [0, 1].
    pub motion_magnitude_nz: f32,
    /// Fraction of blocks with zero motion, [0, 1].
    pub size_zero_motion: f32,
    /// Intra prediction errors: omni-directional, horizontal, vertical, [0, 1].
    pub spatial_pred_err: f32,
    pub spatial_pred_err_h: f32,
    pub spatial_pred_err_v: f32,
    /// Horizontalness of the motion field over the non-zero blocks.
    pub motion_horizontalness: f32,
    /// Cluster distortion of the motion field over the non-zero blocks.
    pub motion_cluster_distortion: f32,
    /// Resolution and frame rate of the source, before any down-sampling.
    pub native_width: u32,
    pub native_height: u32,
    pub native_frame_rate: f32,
}
