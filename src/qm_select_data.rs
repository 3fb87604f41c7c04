/*
 *  Copyright (c) 2011 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

//! Parameters for the spatial/temporal quality selector.

/// Buffer level, as a fraction of the per-second target, considered "low".
pub const PERC_BUFFER_THR: f32 = 0.10;
/// Fraction of low-buffer intervals above which the encoder is stressed.
pub const MAX_BUFFER_LOW: f32 = 0.5;
/// Signed rate-mismatch magnitude above which the encoder is not stable.
pub const MAX_RATE_MM: f32 = 0.5;
/// Initial buffer level, fraction of the per-second target.
pub const INIT_BUFFER_LEVEL: f32 = 0.5;

/// Loss rate above which the target rate is biased down before the
/// down-sampling decision.
pub const LOSS_THR: f32 = 0.1;
/// Scale factor for the loss bias.
pub const LOSS_RATE_FAC: f32 = 1.5;

/// Content-class thresholds: motion (normalized non-zero motion magnitude).
pub const LOW_MOTION_NFD: f32 = 0.04;
pub const HIGH_MOTION_NFD: f32 = 0.075;
/// Content-class thresholds: texture (spatial prediction error).
pub const LOW_TEXTURE: f32 = 0.025;
pub const HIGH_TEXTURE: f32 = 0.035;
/// Texture thresholds shrink for large images, where prediction errors are
/// naturally lower.
pub const SCALE_TEXTURE: f32 = 0.9;

/// No down-sampling below QCIF.
pub const MIN_IMAGE_SIZE: u32 = 176 * 144;
/// No temporal down-sampling below this incoming frame rate.
pub const MIN_FRAME_RATE_QM: f32 = 8.0;

/// Bounds on the accumulated down-sampling state.
pub const MAX_SPATIAL_DOWN_FACT: u32 = 16;
pub const MAX_TEMP_DOWN_FACT: u32 = 4;
pub const MAX_SPATIAL_TEMP_DOWN_FACT: u32 = 16;

/// Hysteresis: restore requires this much headroom over the transition rate
/// of the restored resolution.
pub const TRANS_RATE_SCALE_UP_SPATIAL: f32 = 1.25;
pub const TRANS_RATE_SCALE_UP_TEMP: f32 = 1.25;

/// Rate mismatches larger than this (in kbps) are transients and are not
/// summed.
pub const THRESH_SUM_MM: f32 = 1000.0;

/// Directional spatial mode selection (1x2 / 2x1 / 2x2). The selector is an
/// experimental hook; these only matter when it is invoked.
pub const RATE_RED_SPATIAL_2X2: f32 = 0.9;
pub const SPATIAL_ERR_2X2_VS_H: f32 = 0.1;
pub const SPATIAL_ERR_2X2_VS_V: f32 = 0.1;
pub const SPATIAL_ERR_V_VS_H: f32 = 0.1;

/// Minimum interval between two quality-mode changes, outside of detected
/// content changes.
pub const MIN_INTERVAL_MS: i64 = 2000;

/// Frame-size thresholds splitting image types 0..6 (QCIF up to beyond HD).
/// `image_type` is the number of thresholds below `width * height`.
pub const FRAME_SIZE_TH: [u32; 6] = [
    63360,   // between QCIF and CIF
    204288,  // between CIF and VGA
    356352,  // between VGA and 4CIF
    663552,  // between 4CIF and 720p
    1497600, // between 720p and 1080p
    3110400, // between 1080p and beyond
];

/// Maximum useful encoding rate per image type, in kbps. Above this rate
/// the resolution is never the bottleneck.
pub const MAX_RATE_QM: [f32; 7] = [
    250.0,  // QCIF
    500.0,  // CIF
    700.0,  // VGA
    1000.0, // 4CIF
    1500.0, // 720p
    2200.0, // 1080p
    3000.0, // above
];

/// Transition-rate scale factors, indexed by
/// `image_class * 9 + content_class`. Image class 0 covers image types up to
/// VGA, class 1 everything larger.
pub const SCALE_TRANS_RATE_QM: [f32; 18] = [
    // Image class 0:
    0.25, 0.30, 0.33, //
    0.35, 0.35, 0.38, //
    0.40, 0.42, 0.45, //
    // Image class 1:
    0.30, 0.35, 0.38, //
    0.40, 0.42, 0.45, //
    0.48, 0.50, 0.52, //
];

/// Spatial action per content class: 1 keeps the resolution, 4 halves both
/// dimensions (2x2). Classes are `3 * motion_level + spatial_level` with
/// level order (Low = 0, Default = 1, High = 2).
pub const SPATIAL_ACTION: [u32; 9] = [
    1, 1, 1, // low motion
    4, 1, 1, // default motion
    4, 4, 1, // high motion
];

/// Temporal action per content class: 1 keeps the frame rate, 2 halves it.
pub const TEMPORAL_ACTION: [u32; 9] = [
    1, 2, 2, // low motion
    1, 1, 2, // default motion
    1, 1, 2, // high motion
];
