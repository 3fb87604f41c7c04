/*
 *  Copyright (c) 2011 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

use tracing::debug;

use crate::error::MediaOptError;
use crate::qm_select_data::*;
use crate::{ContentMetrics, FrameType};

/// Spatial/temporal down- or up-sampling decision. Factor 1 keeps the
/// dimension, 2 halves it, 0 restores it to native.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QualityMode {
    pub spatial_width_fact: u32,
    pub spatial_height_fact: u32,
    pub temporal_fact: u32,
}

impl Default for QualityMode {
    fn default() -> Self {
        Self {
            spatial_width_fact: 1,
            spatial_height_fact: 1,
            temporal_fact: 1,
        }
    }
}

impl QualityMode {
    pub fn is_unchanged(&self) -> bool {
        self.spatial_width_fact == 1 && self.spatial_height_fact == 1 && self.temporal_fact == 1
    }
}

/// Ternary feature level, in content-class index order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Level {
    Low = 0,
    Default = 1,
    High = 2,
}

#[derive(Clone, Copy)]
struct Feature {
    value: f32,
    level: Level,
}

impl Default for Feature {
    fn default() -> Self {
        Self {
            value: 0.0,
            level: Level::Default,
        }
    }
}

/// How the encoder is coping with its current rate and resolution, derived
/// from the low-buffer ratio and the signed rate mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EncoderState {
    Stable,
    /// Persistent overshoot or frequently drained buffer.
    Stressed,
    /// Persistent undershoot: resolution can likely be restored early.
    Easy,
}

fn encoder_state(ratio_buffer_low: f32, rate_mismatch: f32) -> EncoderState {
    if ratio_buffer_low > MAX_BUFFER_LOW || rate_mismatch > MAX_RATE_MM {
        EncoderState::Stressed
    } else if rate_mismatch < -MAX_RATE_MM {
        EncoderState::Easy
    } else {
        EncoderState::Stable
    }
}

/// Selects spatial and temporal resolution for the encoder, based on the
/// averaged content metrics, the encoder's rate behavior, and per-resolution
/// transitional rates.
pub struct QmSelect {
    init: bool,
    qm: QualityMode,
    width: u32,
    height: u32,
    user_frame_rate: f32,
    incoming_frame_rate: f32,
    /// kbps, the source-coding target for the current interval.
    target_bit_rate: f32,
    per_frame_bandwidth: f32,
    buffer_level: f32,
    loss_pr: f32,
    motion: Feature,
    spatial: Feature,
    aspect_ratio: f32,
    image_type: u8,
    max_rate_qm: f32,
    // Accumulated down-sampling relative to native: spatial counts pixels
    // (2x2 step is 4), temporal counts frame-rate halvings.
    state_dec_factor_spatial: u32,
    state_dec_factor_temp: u32,
    // Per-interval sums, cleared after every selection.
    sum_target_rate: f32,
    sum_incoming_frame_rate: f32,
    sum_seq_rate_mm: f32,
    update_rate_cnt: u32,
    sum_encoded_bytes: u64,
    frame_cnt: u32,
    low_buffer_cnt: u32,
}

impl Default for QmSelect {
    fn default() -> Self {
        Self::new()
    }
}

impl QmSelect {
    pub fn new() -> Self {
        let mut this = Self {
            init: false,
            qm: QualityMode::default(),
            width: 0,
            height: 0,
            user_frame_rate: 0.0,
            incoming_frame_rate: 0.0,
            target_bit_rate: 0.0,
            per_frame_bandwidth: 0.0,
            buffer_level: 0.0,
            loss_pr: 0.0,
            motion: Feature::default(),
            spatial: Feature::default(),
            aspect_ratio: 1.0,
            image_type: 1,
            max_rate_qm: 0.0,
            state_dec_factor_spatial: 1,
            state_dec_factor_temp: 1,
            sum_target_rate: 0.0,
            sum_incoming_frame_rate: 0.0,
            sum_seq_rate_mm: 0.0,
            update_rate_cnt: 0,
            sum_encoded_bytes: 0,
            frame_cnt: 0,
            low_buffer_cnt: 0,
        };
        this.Reset();
        this
    }

    pub fn Reset(&mut self) {
        self.state_dec_factor_spatial = 1;
        self.state_dec_factor_temp = 1;
        self.buffer_level = 0.0;
        self.target_bit_rate = 0.0;
        self.incoming_frame_rate = 0.0;
        self.user_frame_rate = 0.0;
        self.per_frame_bandwidth = 0.0;
        self.loss_pr = 0.0;
        self.ResetQM();
        self.ResetRates();
    }

    pub fn ResetQM(&mut self) {
        self.motion = Feature::default();
        self.spatial = Feature::default();
        self.aspect_ratio = 1.0;
        self.max_rate_qm = 0.0;
        self.image_type = 1;
        self.qm = QualityMode::default();
    }

    pub fn ResetRates(&mut self) {
        self.sum_encoded_bytes = 0;
        self.sum_target_rate = 0.0;
        self.sum_incoming_frame_rate = 0.0;
        self.sum_seq_rate_mm = 0.0;
        self.frame_cnt = 0;
        self.low_buffer_cnt = 0;
        self.update_rate_cnt = 0;
    }

    /// Called on encoder (re)configuration. Down-sampling state survives: the
    /// encoder being reconfigured to a down-sampled resolution is the normal
    /// effect of our own decision.
    pub fn Initialize(
        &mut self,
        bit_rate_kbps: f32,
        user_frame_rate: f32,
        width: u32,
        height: u32,
    ) -> Result<(), MediaOptError> {
        if user_frame_rate == 0.0 {
            return Err(MediaOptError::InvalidParameter("frame rate"));
        }
        if width == 0 || height == 0 {
            return Err(MediaOptError::InvalidParameter("frame size"));
        }
        self.target_bit_rate = bit_rate_kbps;
        self.user_frame_rate = user_frame_rate;
        self.width = width;
        self.height = height;
        self.buffer_level = INIT_BUFFER_LEVEL * bit_rate_kbps;
        if self.incoming_frame_rate == 0.0 {
            self.per_frame_bandwidth = bit_rate_kbps / user_frame_rate;
            self.incoming_frame_rate = user_frame_rate;
        } else {
            // The encoder lags behind a frame-rate change by about a second;
            // average the old measured rate with the new setting.
            self.per_frame_bandwidth = 0.5
                * (bit_rate_kbps / user_frame_rate
                    + bit_rate_kbps / self.incoming_frame_rate);
        }
        self.init = true;
        Ok(())
    }

    /// Per-frame update of the virtual encoder buffer.
    pub fn UpdateEncodedSize(&mut self, encoded_size_bytes: usize, _frame_type: FrameType) {
        self.sum_encoded_bytes += encoded_size_bytes as u64;
        self.frame_cnt += 1;

        let encoded_size_kbits = encoded_size_bytes as f32 * 8.0 / 1000.0;
        self.buffer_level += self.per_frame_bandwidth - encoded_size_kbits;

        if self.buffer_level <= PERC_BUFFER_THR * INIT_BUFFER_LEVEL * self.target_bit_rate {
            self.low_buffer_cnt += 1;
        }
    }

    /// Per-interval update with the rates the encoder will use next, plus the
    /// filtered loss. The previous interval's values are folded into the
    /// averages first.
    pub fn UpdateRates(
        &mut self,
        target_bit_rate_kbps: f32,
        avg_sent_bit_rate_bps: f32,
        incoming_frame_rate: f32,
        loss_pr: f32,
    ) {
        self.sum_target_rate += self.target_bit_rate;
        self.sum_incoming_frame_rate += self.incoming_frame_rate;
        self.update_rate_cnt += 1;

        // Signed sequence-rate mismatch: positive means overshoot. Large
        // transients are excluded from the sum.
        let avg_sent_kbps = avg_sent_bit_rate_bps / 1000.0;
        if (self.target_bit_rate - avg_sent_kbps).abs() < THRESH_SUM_MM
            && self.target_bit_rate > 0.0
        {
            self.sum_seq_rate_mm += (avg_sent_kbps - self.target_bit_rate) / self.target_bit_rate;
        }

        self.target_bit_rate = target_bit_rate_kbps;
        self.incoming_frame_rate = incoming_frame_rate;
        self.loss_pr = loss_pr;
        self.per_frame_bandwidth = if incoming_frame_rate > 0.0 {
            target_bit_rate_kbps / incoming_frame_rate
        } else {
            0.0
        };
    }

    /// Current (spatial, temporal) down-sampling factors relative to native.
    pub fn DownSampleStates(&self) -> (u32, u32) {
        (self.state_dec_factor_spatial, self.state_dec_factor_temp)
    }

    /// Runs one selection over the averaged content metrics. Restore checks
    /// run first and short-circuit the down-sampling decision.
    pub fn SelectQuality(
        &mut self,
        content_metrics: Option<&ContentMetrics>,
    ) -> Result<QualityMode, MediaOptError> {
        if !self.init {
            return Err(MediaOptError::Uninitialized);
        }
        let metrics = match content_metrics {
            Some(metrics) => *metrics,
            None => {
                // Without metrics there is nothing to decide on; fall back to
                // native defaults.
                self.Reset();
                return Ok(self.qm);
            }
        };

        self.qm = QualityMode::default();
        self.aspect_ratio = self.width as f32 / self.height as f32;

        let ratio_buffer_low = if self.frame_cnt > 0 {
            self.low_buffer_cnt as f32 / self.frame_cnt as f32
        } else {
            0.0
        };
        let (mut avg_target_rate, mut avg_incoming_frame_rate, rate_mismatch) =
            if self.update_rate_cnt > 0 {
                (
                    self.sum_target_rate / self.update_rate_cnt as f32,
                    self.sum_incoming_frame_rate / self.update_rate_cnt as f32,
                    self.sum_seq_rate_mm / self.update_rate_cnt as f32,
                )
            } else {
                (0.0, 0.0, 0.0)
            };
        // Weight the interval averages evenly with the upcoming rates.
        avg_target_rate = 0.5 * avg_target_rate + 0.5 * self.target_bit_rate;
        avg_incoming_frame_rate =
            0.5 * avg_incoming_frame_rate + 0.5 * self.incoming_frame_rate;

        let state = encoder_state(ratio_buffer_low, rate_mismatch);

        // Transitional rate of the 2x up-sampled resolution, for the restore
        // hysteresis, then of the current resolution.
        self.set_max_rate_for_qm(2 * self.width, 2 * self.height);
        let image_type_up = self.image_type;
        let max_rate_qm_up = self.max_rate_qm;
        self.set_max_rate_for_qm(self.width, self.height);

        self.motion_nfd(&metrics);
        self.spatial_texture(&metrics);

        let content_class = 3 * self.motion.level as usize + self.spatial.level as usize;
        let image_class = if self.image_type <= 3 { 0 } else { 1 };
        let scale_trans_rate = SCALE_TRANS_RATE_QM[image_class * 9 + content_class];
        let image_class_up = if image_type_up <= 3 { 0 } else { 1 };
        let scale_trans_rate_up = SCALE_TRANS_RATE_QM[image_class_up * 9 + content_class];

        let est_trans_rate_down =
            self.incoming_frame_rate * scale_trans_rate * self.max_rate_qm / 30.0;
        let est_trans_rate_up_temp = TRANS_RATE_SCALE_UP_TEMP * 2.0 * est_trans_rate_down;
        let est_trans_rate_up_spatial = TRANS_RATE_SCALE_UP_SPATIAL
            * self.incoming_frame_rate
            * scale_trans_rate_up
            * max_rate_qm_up
            / 30.0;

        debug!(
            motion = ?self.motion.level,
            spatial = ?self.spatial.level,
            ?state,
            est_trans_rate_down,
            "quality selection"
        );

        // Restore checks first.
        let mut selected_up = false;
        if self.state_dec_factor_spatial > 1
            && ((avg_target_rate > est_trans_rate_up_spatial && state == EncoderState::Stable)
                || state == EncoderState::Easy)
        {
            // Factor 0 marks restore to native.
            self.qm.spatial_width_fact = 0;
            self.qm.spatial_height_fact = 0;
            selected_up = true;
        }
        if self.state_dec_factor_temp > 1
            && ((avg_target_rate > est_trans_rate_up_temp && state == EncoderState::Stable)
                || state == EncoderState::Easy)
        {
            self.qm.temporal_fact = 0;
            selected_up = true;
        }
        if selected_up {
            // Only 2x2 spatial and 2x temporal steps exist, so restoring
            // undoes one full step of each kind.
            if self.qm.temporal_fact == 0 {
                self.state_dec_factor_temp /= 2;
            }
            if self.qm.spatial_width_fact == 0 && self.qm.spatial_height_fact == 0 {
                self.state_dec_factor_spatial /= 4;
            }
            return Ok(self.qm);
        }

        // Heavy loss eats into the usable rate before the encoder sees it;
        // bias the decision toward down-sampling.
        let biased_target_rate = if self.loss_pr > LOSS_THR {
            avg_target_rate / (1.0 + LOSS_RATE_FAC * self.loss_pr)
        } else {
            avg_target_rate
        };

        let trigger_down = biased_target_rate < est_trans_rate_down
            || (state == EncoderState::Stressed && biased_target_rate < self.max_rate_qm);
        if !trigger_down {
            return Ok(self.qm);
        }

        let spatial_fact = SPATIAL_ACTION[content_class];
        let temporal_fact = TEMPORAL_ACTION[content_class];
        match spatial_fact {
            4 => {
                self.qm.spatial_width_fact = 2;
                self.qm.spatial_height_fact = 2;
            }
            2 => {
                // Directional down-sampling is an experimental hook; the
                // action tables never request it in this version.
                self.qm.spatial_width_fact = 2;
                self.qm.spatial_height_fact = 1;
            }
            _ => {}
        }
        self.qm.temporal_fact = temporal_fact;

        // Sanity overrides, checked against the would-be state so the bounds
        // hold over any decision sequence.
        let spatial_step = self.qm.spatial_width_fact * self.qm.spatial_height_fact;
        if self.width * self.height <= MIN_IMAGE_SIZE
            || self.state_dec_factor_spatial * spatial_step > MAX_SPATIAL_DOWN_FACT
        {
            self.qm.spatial_width_fact = 1;
            self.qm.spatial_height_fact = 1;
        }
        if avg_incoming_frame_rate <= MIN_FRAME_RATE_QM
            || self.state_dec_factor_temp * self.qm.temporal_fact > MAX_TEMP_DOWN_FACT
        {
            self.qm.temporal_fact = 1;
        }
        let spatial_cand =
            self.state_dec_factor_spatial * self.qm.spatial_width_fact * self.qm.spatial_height_fact;
        let temp_cand = self.state_dec_factor_temp * self.qm.temporal_fact;
        if spatial_cand * temp_cand > MAX_SPATIAL_TEMP_DOWN_FACT {
            self.qm = QualityMode::default();
        }

        self.state_dec_factor_spatial *= self.qm.spatial_width_fact * self.qm.spatial_height_fact;
        self.state_dec_factor_temp *= self.qm.temporal_fact;
        Ok(self.qm)
    }

    /// Directional spatial mode (1x2 / 2x1 / 2x2) based on prediction errors
    /// and aspect ratio. Experimental; not invoked by the current selection
    /// path, which only uses 2x2.
    pub fn SelectSpatialDirectionMode(&mut self, trans_rate: f32, metrics: &ContentMetrics) {
        // Well below the transitional rate only the full 2x2 helps.
        if self.target_bit_rate < trans_rate * RATE_RED_SPATIAL_2X2 {
            self.qm.spatial_width_fact = 2;
            self.qm.spatial_height_fact = 2;
            return;
        }

        let spatial_err = metrics.spatial_pred_err;
        let spatial_err_h = metrics.spatial_pred_err_h;
        let spatial_err_v = metrics.spatial_pred_err_v;

        // Wide aspect ratios keep the default 1x2 when it predicts best.
        if self.aspect_ratio >= 16.0 / 9.0
            && spatial_err_h < spatial_err
            && spatial_err_h < spatial_err_v
        {
            return;
        }
        if spatial_err < spatial_err_h * (1.0 + SPATIAL_ERR_2X2_VS_H)
            && spatial_err < spatial_err_v * (1.0 + SPATIAL_ERR_2X2_VS_V)
        {
            self.qm.spatial_width_fact = 2;
            self.qm.spatial_height_fact = 2;
            return;
        }
        if spatial_err_v < spatial_err_h * (1.0 - SPATIAL_ERR_V_VS_H)
            && spatial_err_v < spatial_err * (1.0 - SPATIAL_ERR_2X2_VS_V)
        {
            self.qm.spatial_width_fact = 1;
            self.qm.spatial_height_fact = 2;
        }
    }

    fn motion_nfd(&mut self, metrics: &ContentMetrics) {
        self.motion.value = metrics.motion_magnitude_nz;
        self.motion.level = if self.motion.value < LOW_MOTION_NFD {
            Level::Low
        } else if self.motion.value > HIGH_MOTION_NFD {
            Level::High
        } else {
            Level::Default
        };
    }

    fn spatial_texture(&mut self, metrics: &ContentMetrics) {
        self.spatial.value =
            (metrics.spatial_pred_err + metrics.spatial_pred_err_h + metrics.spatial_pred_err_v)
                / 3.0;
        // Prediction errors run lower on large images.
        let scale = if self.image_type > 3 { SCALE_TEXTURE } else { 1.0 };
        self.spatial.level = if self.spatial.value > scale * HIGH_TEXTURE {
            Level::High
        } else if self.spatial.value < scale * LOW_TEXTURE {
            Level::Low
        } else {
            Level::Default
        };
    }

    fn set_max_rate_for_qm(&mut self, width: u32, height: u32) {
        let image_size = width * height;
        self.image_type = FRAME_SIZE_TH
            .iter()
            .position(|&th| image_size < th)
            .unwrap_or(FRAME_SIZE_TH.len()) as u8;
        self.max_rate_qm = MAX_RATE_QM[self.image_type as usize];
    }
}
