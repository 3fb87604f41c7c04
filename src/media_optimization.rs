/*
 *  Copyright (c) 2011 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

use std::rc::Rc;

use tracing::{debug, warn};

use crate::content_metrics_processing::ContentMetricsProcessing;
use crate::error::MediaOptError;
use crate::frame_dropper::FrameDropper;
use crate::media_opt_util::{
    ConvertFECRate, LossProtectionLogic, ProtectionMethodType,
};
use crate::qm_select::{QmSelect, QualityMode};
use crate::qm_select_data::MIN_INTERVAL_MS;
use crate::rtc::Clock;
use crate::{ContentMetrics, FrameType, VideoCodecType};

/// Sink for the selected protection settings. Rates are fixed-point
/// fractions of source packets.
pub trait ProtectionCallback {
    fn protection_request(
        &mut self,
        delta_fec_rate_255: u8,
        key_fec_rate_255: u8,
        nack_enabled: bool,
    );
}

/// Sink for spatial/temporal quality changes. Values are absolute.
pub trait QmSettingsCallback {
    fn set_video_qm_settings(&mut self, frame_rate_fps: u32, width: u32, height: u32);
}

/// Outcome of one rate-control interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetRates {
    /// Source-coding target after subtracting protection overhead.
    pub target_bit_rate_bps: u32,
    /// Loss the encoder should adapt to, after accounting for repair.
    pub effective_loss_255: u8,
}

// Incoming frame-rate measurement window.
const FRAME_COUNT_HISTORY_SIZE: usize = 90;
const FRAME_HISTORY_WIN_MS: i64 = 2000;
// Sent bitrate measurement window.
const BITRATE_MAX_FRAME_SAMPLES: usize = 60;
const BITRATE_AVERAGE_WIN_MS: i64 = 1000;

#[derive(Clone, Copy)]
struct EncodedFrameSample {
    size_bytes: i64,
    time_complete_ms: i64,
}

const EMPTY_SAMPLE: EncodedFrameSample = EncodedFrameSample {
    size_bytes: -1,
    time_complete_ms: -1,
};

/// Content-adaptive controller for a real-time video sender: selects the
/// loss-protection method, reports the encoder-effective loss, subtracts
/// protection overhead from the target rate, drops frames over budget, and
/// adapts spatial/temporal resolution to the content.
///
/// Single-threaded; every method is called serially by the encoder worker,
/// and callbacks fire synchronously on the caller's stack.
pub struct MediaOptimization {
    clock: Rc<dyn Clock>,
    init: bool,
    send_codec_type: VideoCodecType,
    codec_width: u16,
    codec_height: u16,
    user_frame_rate: f32,
    max_bit_rate_bps: u32,
    max_payload_size: u16,
    frame_dropper: FrameDropper,
    loss_prot_logic: LossProtectionLogic,
    content: ContentMetricsProcessing,
    qms: QmSelect,
    enable_qm: bool,
    protection_callback: Option<Box<dyn ProtectionCallback>>,
    qm_settings_callback: Option<Box<dyn QmSettingsCallback>>,
    loss_prot_overhead_bps: u32,
    fraction_lost_255: u8,
    last_bit_rate_bps: u32,
    target_bit_rate_bps: u32,
    incoming_frame_rate: f32,
    incoming_frame_times: [i64; FRAME_COUNT_HISTORY_SIZE],
    encoded_frame_samples: [EncodedFrameSample; BITRATE_MAX_FRAME_SAMPLES],
    avg_sent_bit_rate_bps: f32,
    key_frame_cnt: u32,
    delta_frame_cnt: u32,
    last_qm_update_ms: i64,
    last_change_ms: i64,
}

impl MediaOptimization {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        let now_ms = clock.time_millis();
        Self {
            clock,
            init: false,
            send_codec_type: VideoCodecType::Unknown,
            codec_width: 0,
            codec_height: 0,
            user_frame_rate: 0.0,
            max_bit_rate_bps: 0,
            max_payload_size: 1460,
            frame_dropper: FrameDropper::new(),
            loss_prot_logic: LossProtectionLogic::new(now_ms),
            content: ContentMetricsProcessing::new(),
            qms: QmSelect::new(),
            enable_qm: false,
            protection_callback: None,
            qm_settings_callback: None,
            loss_prot_overhead_bps: 0,
            fraction_lost_255: 0,
            last_bit_rate_bps: 0,
            target_bit_rate_bps: 0,
            incoming_frame_rate: 0.0,
            incoming_frame_times: [-1; FRAME_COUNT_HISTORY_SIZE],
            encoded_frame_samples: [EMPTY_SAMPLE; BITRATE_MAX_FRAME_SAMPLES],
            avg_sent_bit_rate_bps: 0.0,
            key_frame_cnt: 0,
            delta_frame_cnt: 0,
            last_qm_update_ms: 0,
            last_change_ms: 0,
        }
    }

    pub fn Reset(&mut self) {
        let now_ms = self.clock.time_millis();
        self.incoming_frame_times = [-1; FRAME_COUNT_HISTORY_SIZE];
        self.ProcessIncomingFrameRate(now_ms);
        self.frame_dropper.Reset();
        self.frame_dropper.SetRates(0.0, 0.0);
        self.loss_prot_logic.Reset(now_ms);
        self.loss_prot_logic.UpdateFrameRate(self.incoming_frame_rate);
        self.content.Reset();
        self.qms.Reset();
        self.init = false;
        self.last_bit_rate_bps = 0;
        self.target_bit_rate_bps = 0;
        self.loss_prot_overhead_bps = 0;
        self.codec_width = 0;
        self.codec_height = 0;
        self.user_frame_rate = 0.0;
        self.key_frame_cnt = 0;
        self.delta_frame_cnt = 0;
        self.last_qm_update_ms = 0;
        self.last_change_ms = 0;
        self.encoded_frame_samples = [EMPTY_SAMPLE; BITRATE_MAX_FRAME_SAMPLES];
        self.avg_sent_bit_rate_bps = 0.0;
    }

    /// Encoder (re)configuration: resets codec-specific state. Called both on
    /// user-initiated changes and when the encoder adopts a quality-mode
    /// decision.
    pub fn SetEncodingData(
        &mut self,
        send_codec_type: VideoCodecType,
        max_bit_rate_bps: u32,
        frame_rate_fps: u32,
        bit_rate_bps: u32,
        width: u16,
        height: u16,
    ) -> Result<(), MediaOptError> {
        if bit_rate_bps == 0 {
            warn!("rejecting encoding data with zero bit rate");
            return Err(MediaOptError::InvalidParameter("bit rate"));
        }
        if frame_rate_fps == 0 {
            warn!("rejecting encoding data with zero frame rate");
            return Err(MediaOptError::InvalidParameter("frame rate"));
        }
        if width == 0 || height == 0 {
            warn!(width, height, "rejecting encoding data with empty frame");
            return Err(MediaOptError::InvalidParameter("frame size"));
        }
        self.last_change_ms = self.clock.time_millis();
        self.content.Reset();
        self.content.UpdateFrameRate(frame_rate_fps as f32);

        self.max_bit_rate_bps = max_bit_rate_bps;
        self.send_codec_type = send_codec_type;
        self.target_bit_rate_bps = bit_rate_bps;
        self.loss_prot_logic.UpdateBitRate(bit_rate_bps as f32 / 1000.0);
        self.loss_prot_logic.UpdateFrameRate(frame_rate_fps as f32);
        self.loss_prot_logic.UpdateFrameSize(width, height);
        self.frame_dropper.Reset();
        self.frame_dropper
            .SetRates(bit_rate_bps as f32 / 1000.0, frame_rate_fps as f32);
        self.user_frame_rate = frame_rate_fps as f32;
        self.codec_width = width;
        self.codec_height = height;
        self.qms.Initialize(
            bit_rate_bps as f32 / 1000.0,
            self.user_frame_rate,
            width as u32,
            height as u32,
        )?;
        self.init = true;
        Ok(())
    }

    /// The central once-per-second control step: folds in the new loss and
    /// RTT report, re-scores the protection methods, publishes the selected
    /// settings, re-rates the frame dropper, and runs the quality selector.
    pub fn SetTargetRates(
        &mut self,
        bit_rate_bps: u32,
        fraction_lost_255: u8,
        rtt_ms: i64,
    ) -> Result<TargetRates, MediaOptError> {
        if !self.init {
            return Err(MediaOptError::Uninitialized);
        }
        let now_ms = self.clock.time_millis();

        self.loss_prot_logic.UpdateBitRate(bit_rate_bps as f32 / 1000.0);
        self.loss_prot_logic.UpdateLossPr(fraction_lost_255, now_ms);
        self.loss_prot_logic.UpdateRtt(rtt_ms);
        self.loss_prot_logic
            .UpdateResidualPacketLoss(fraction_lost_255 as f32 / 255.0);

        // The protection methods must see the actual/sent frame rate.
        let actual_frame_rate = self.SentFrameRate().max(1.0);
        self.loss_prot_logic.UpdateFrameRate(actual_frame_rate);

        self.fraction_lost_255 = fraction_lost_255;

        // Filtered loss: windowed max for FEC-type methods, average for the
        // rest. The methods are then re-scored against it.
        let packet_loss_enc = self.loss_prot_logic.FilteredLoss(now_ms);
        self.loss_prot_logic.UpdateFilteredLossPr(packet_loss_enc);
        self.loss_prot_logic.UpdateMethod();

        let mut effective_loss = packet_loss_enc;
        let mut protection_request = None;
        if let Some(selected) = self.loss_prot_logic.SelectedMethod() {
            effective_loss = selected.RequiredPacketLossER();
            let nack_enabled = matches!(
                selected.Type(),
                ProtectionMethodType::Nack | ProtectionMethodType::NackFec
            );
            // Factors are kept relative to total packets internally; the RTP
            // FEC convention is relative to source packets.
            protection_request = Some((
                ConvertFECRate(selected.RequiredProtectionFactorD()),
                ConvertFECRate(selected.RequiredProtectionFactorK()),
                nack_enabled,
            ));
        }
        if let Some((delta_rate, key_rate, nack_enabled)) = protection_request {
            if let Some(callback) = self.protection_callback.as_mut() {
                callback.protection_request(delta_rate, key_rate, nack_enabled);
            }
        }

        self.loss_prot_overhead_bps =
            (self.loss_prot_logic.HighestOverhead() + 0.5) as u32;

        // NACK retransmissions are bursty; momentarily reserve their expected
        // rate from the dropper's budget instead of the smooth FEC overhead.
        if self.loss_prot_logic.FindMethod(ProtectionMethodType::Nack).is_some() {
            let nack_rate_bps = ((self.last_bit_rate_bps as u64
                * self.fraction_lost_255 as u64)
                / 255) as u32;
            let nack_rate_bps = nack_rate_bps.min(self.target_bit_rate_bps);
            self.frame_dropper
                .SetRates(bit_rate_bps.saturating_sub(nack_rate_bps) as f32 / 1000.0, 0.0);
        } else {
            self.frame_dropper.SetRates(
                bit_rate_bps.saturating_sub(self.loss_prot_overhead_bps) as f32 / 1000.0,
                0.0,
            );
        }

        self.last_bit_rate_bps = self.target_bit_rate_bps;
        self.target_bit_rate_bps = bit_rate_bps.saturating_sub(self.loss_prot_overhead_bps);

        if self.enable_qm {
            self.qms.UpdateRates(
                self.target_bit_rate_bps as f32 / 1000.0,
                self.avg_sent_bit_rate_bps,
                self.incoming_frame_rate,
                effective_loss as f32 / 255.0,
            );
            if self.check_status_for_qm_change(now_ms) {
                if let Err(err) = self.select_quality(now_ms) {
                    debug!(?err, "quality selection skipped");
                }
            }
            self.content.ResetShortTermAvgData();
        }

        Ok(TargetRates {
            target_bit_rate_bps: self.target_bit_rate_bps,
            effective_loss_255: effective_loss,
        })
    }

    /// Per-frame post-encode hook.
    pub fn UpdateWithEncodedData(&mut self, encoded_length: usize, frame_type: FrameType) {
        let now_ms = self.clock.time_millis();
        self.update_bit_rate_estimate(encoded_length as i64, now_ms);
        if encoded_length == 0 {
            return;
        }
        let delta_frame = frame_type.is_delta();
        self.frame_dropper.Fill(encoded_length, delta_frame);
        if self.max_payload_size > 0 {
            let min_packets_per_frame =
                encoded_length as f32 / self.max_payload_size as f32;
            if delta_frame {
                self.loss_prot_logic
                    .UpdatePacketsPerFrame(min_packets_per_frame, now_ms);
            } else {
                self.loss_prot_logic
                    .UpdatePacketsPerFrameKey(min_packets_per_frame, now_ms);
            }
            if self.enable_qm {
                self.qms.UpdateEncodedSize(encoded_length, frame_type);
            }
        }
        if !delta_frame {
            self.loss_prot_logic
                .UpdateKeyFrameSize(encoded_length as f32);
        }
        if delta_frame {
            self.delta_frame_cnt += 1;
        } else {
            self.key_frame_cnt += 1;
        }
    }

    /// True iff the next frame should be skipped to hold the rate budget.
    pub fn DropFrame(&mut self) -> bool {
        let input_frame_rate = self.InputFrameRate() as f32;
        self.frame_dropper.Leak(input_frame_rate);
        self.frame_dropper.DropNextFrame()
    }

    /// Registers a new incoming (captured) frame for rate measurement.
    pub fn UpdateIncomingFrameRate(&mut self) {
        let now_ms = self.clock.time_millis();
        if self.incoming_frame_times[0] >= 0 {
            for i in (0..FRAME_COUNT_HISTORY_SIZE - 1).rev() {
                self.incoming_frame_times[i + 1] = self.incoming_frame_times[i];
            }
        }
        self.incoming_frame_times[0] = now_ms;
        self.ProcessIncomingFrameRate(now_ms);
    }

    pub fn InputFrameRate(&mut self) -> u32 {
        self.ProcessIncomingFrameRate(self.clock.time_millis());
        (self.incoming_frame_rate + 0.5) as u32
    }

    /// Frame rate actually sent, after drops.
    pub fn SentFrameRate(&mut self) -> f32 {
        let input = self.InputFrameRate();
        self.frame_dropper.ActualFrameRate(input as f32)
    }

    /// Average sent bitrate over the last second, in kbps.
    pub fn SentBitRate(&mut self) -> f32 {
        self.update_bit_rate_estimate(-1, self.clock.time_millis());
        self.avg_sent_bit_rate_bps / 1000.0
    }

    pub fn SentFrameCount(&self) -> (u32, u32) {
        (self.key_frame_cnt, self.delta_frame_cnt)
    }

    pub fn MaxBitRate(&self) -> u32 {
        self.max_bit_rate_bps
    }

    pub fn SendCodecType(&self) -> VideoCodecType {
        self.send_codec_type
    }

    pub fn SetMtu(&mut self, mtu_bytes: u16) {
        self.max_payload_size = mtu_bytes;
    }

    /// Per-frame content metrics. None disables quality-mode updates until a
    /// snapshot arrives again.
    pub fn UpdateContentData(&mut self, content_metrics: Option<&ContentMetrics>) {
        match content_metrics {
            None => {
                self.enable_qm = false;
                self.qms.Reset();
            }
            Some(metrics) => {
                self.content.UpdateContentData(metrics);
                if self.qm_settings_callback.is_some() {
                    self.enable_qm = true;
                }
            }
        }
    }

    pub fn RegisterProtectionCallback(
        &mut self,
        callback: Option<Box<dyn ProtectionCallback>>,
    ) {
        self.protection_callback = callback;
    }

    /// The quality-mode callback also gates the whole quality-selection path.
    pub fn RegisterVideoQMCallback(&mut self, callback: Option<Box<dyn QmSettingsCallback>>) {
        self.enable_qm = callback.is_some();
        self.qm_settings_callback = callback;
    }

    pub fn EnableFrameDropper(&mut self, enable: bool) {
        self.frame_dropper.Enable(enable);
    }

    pub fn EnableNack(&mut self, enable: bool) {
        self.enable_method(ProtectionMethodType::Nack, enable);
    }

    pub fn EnableFec(&mut self, enable: bool) {
        self.enable_method(ProtectionMethodType::Fec, enable);
    }

    pub fn EnableNackFec(&mut self, enable: bool) {
        self.enable_method(ProtectionMethodType::NackFec, enable);
    }

    pub fn IsNackEnabled(&self) -> bool {
        self.loss_prot_logic
            .FindMethod(ProtectionMethodType::Nack)
            .is_some()
    }

    pub fn IsFecEnabled(&self) -> bool {
        self.loss_prot_logic
            .FindMethod(ProtectionMethodType::Fec)
            .is_some()
    }

    pub fn IsNackFecEnabled(&self) -> bool {
        self.loss_prot_logic
            .FindMethod(ProtectionMethodType::NackFec)
            .is_some()
    }

    fn enable_method(&mut self, method_type: ProtectionMethodType, enable: bool) {
        let updated = if enable {
            self.loss_prot_logic.AddMethod(method_type)
        } else {
            self.loss_prot_logic.RemoveMethod(method_type)
        };
        if updated {
            self.loss_prot_logic.UpdateMethod();
        }
    }

    /// Runs one quality selection and publishes the result.
    fn select_quality(&mut self, now_ms: i64) -> Result<(), MediaOptError> {
        self.qms.ResetQM();
        let long_term = self.content.LongTermAvgData();
        let qm = self.qms.SelectQuality(long_term.as_ref())?;
        self.qm_update(&qm);
        self.qms.ResetRates();
        self.last_qm_update_ms = now_ms;
        self.content.Reset();
        Ok(())
    }

    fn qm_update(&mut self, qm: &QualityMode) -> bool {
        if qm.is_unchanged() {
            return false;
        }
        let frame_rate = if qm.temporal_fact == 0 {
            // Restore: double the measured rate.
            (2.0 * self.incoming_frame_rate) as u32
        } else {
            (self.incoming_frame_rate / qm.temporal_fact as f32 + 1.0) as u32
        };
        let (width, height) = if qm.spatial_width_fact == 0 && qm.spatial_height_fact == 0 {
            // Restore to the native size carried by the content metrics.
            match self.content.LongTermAvgData() {
                Some(cm) => (cm.native_width, cm.native_height),
                None => (2 * self.codec_width as u32, 2 * self.codec_height as u32),
            }
        } else {
            (
                self.codec_width as u32 / qm.spatial_width_fact,
                self.codec_height as u32 / qm.spatial_height_fact,
            )
        };
        debug!(width, height, frame_rate, "quality mode update");
        if let Some(callback) = self.qm_settings_callback.as_mut() {
            callback.set_video_qm_settings(frame_rate, width, height);
        }
        true
    }

    // Rate-limits quality changes: enough time must have passed since both
    // the last change and the last encoder reconfiguration, unless the
    // content itself changed scene.
    fn check_status_for_qm_change(&self, now_ms: i64) -> bool {
        if self.content.content_change() {
            return true;
        }
        now_ms - self.last_qm_update_ms >= MIN_INTERVAL_MS
            && now_ms - self.last_change_ms >= MIN_INTERVAL_MS
    }

    /// Sliding-window sent-bitrate estimate. `encoded_length < 0` only
    /// refreshes the average against the current time.
    fn update_bit_rate_estimate(&mut self, encoded_length: i64, now_ms: i64) {
        let mut frame_size_sum: i64 = 0;
        let mut time_oldest: i64 = -1;
        // Find an empty slot for the new sample while accumulating the
        // in-window history. Slots are oldest-first.
        let mut slot: i32 = BITRATE_MAX_FRAME_SAMPLES as i32 - 1;
        while slot >= 0 {
            let sample = &self.encoded_frame_samples[slot as usize];
            if sample.size_bytes == -1 {
                break;
            }
            if now_ms - sample.time_complete_ms < BITRATE_AVERAGE_WIN_MS {
                frame_size_sum += sample.size_bytes;
                if time_oldest == -1 {
                    time_oldest = sample.time_complete_ms;
                }
            }
            slot -= 1;
        }
        if encoded_length > 0 {
            if slot < 0 {
                // No empty slot, shift out the oldest.
                for i in (0..BITRATE_MAX_FRAME_SAMPLES - 1).rev() {
                    self.encoded_frame_samples[i + 1] = self.encoded_frame_samples[i];
                }
                slot = 0;
            }
            self.encoded_frame_samples[slot as usize] = EncodedFrameSample {
                size_bytes: encoded_length,
                time_complete_ms: now_ms,
            };
        }
        if time_oldest > -1 {
            let denom = ((now_ms - time_oldest) as f32).max(1.0);
            self.avg_sent_bit_rate_bps =
                (frame_size_sum + encoded_length.max(0)) as f32 * 8000.0 / denom;
        } else if encoded_length > 0 {
            self.avg_sent_bit_rate_bps = (encoded_length * 8) as f32;
        } else {
            self.avg_sent_bit_rate_bps = 0.0;
        }
    }

    fn ProcessIncomingFrameRate(&mut self, now_ms: i64) {
        let mut frames_in_window = 0;
        let mut num = 1;
        while num < FRAME_COUNT_HISTORY_SIZE - 1 {
            if self.incoming_frame_times[num] <= 0
                || now_ms - self.incoming_frame_times[num] > FRAME_HISTORY_WIN_MS
            {
                break;
            }
            frames_in_window += 1;
            num += 1;
        }
        if num > 1 {
            let diff_ms = now_ms - self.incoming_frame_times[num - 1];
            self.incoming_frame_rate = 1.0;
            if diff_ms > 0 {
                self.incoming_frame_rate = frames_in_window as f32 * 1000.0 / diff_ms as f32;
            }
        } else {
            self.incoming_frame_rate = frames_in_window as f32;
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use test_trace::test;

    use super::*;
    use crate::rtc::SimulatedClock;

    #[derive(Default)]
    struct ProtectionRecorder {
        calls: Vec<(u8, u8, bool)>,
    }

    impl ProtectionCallback for Rc<RefCell<ProtectionRecorder>> {
        fn protection_request(
            &mut self,
            delta_fec_rate_255: u8,
            key_fec_rate_255: u8,
            nack_enabled: bool,
        ) {
            self.borrow_mut()
                .calls
                .push((delta_fec_rate_255, key_fec_rate_255, nack_enabled));
        }
    }

    #[derive(Default)]
    struct QmRecorder {
        calls: Vec<(u32, u32, u32)>,
    }

    impl QmSettingsCallback for Rc<RefCell<QmRecorder>> {
        fn set_video_qm_settings(&mut self, frame_rate_fps: u32, width: u32, height: u32) {
            self.borrow_mut().calls.push((frame_rate_fps, width, height));
        }
    }

    fn optimizer() -> (MediaOptimization, Rc<SimulatedClock>) {
        let clock = Rc::new(SimulatedClock::new(1000));
        let opt = MediaOptimization::new(clock.clone());
        (opt, clock)
    }

    fn metrics_high_motion_low_texture() -> ContentMetrics {
        ContentMetrics {
            motion_magnitude_nz: 0.1,
            size_zero_motion: 0.5,
            spatial_pred_err: 0.01,
            spatial_pred_err_h: 0.01,
            spatial_pred_err_v: 0.01,
            motion_horizontalness: 0.3,
            motion_cluster_distortion: 0.2,
            native_width: 640,
            native_height: 480,
            native_frame_rate: 30.0,
        }
    }

    /// One second of captured and encoded frames at the given rate.
    fn feed_frames(
        opt: &mut MediaOptimization,
        clock: &SimulatedClock,
        frames: u32,
        frame_size_bytes: usize,
    ) {
        for _ in 0..frames {
            clock.advance_ms(1000 / frames as i64);
            opt.UpdateIncomingFrameRate();
            opt.UpdateWithEncodedData(frame_size_bytes, FrameType::Delta);
        }
    }

    #[test]
    fn SetTargetRatesBeforeSetEncodingDataFails() {
        let (mut opt, _clock) = optimizer();
        assert!(matches!(
            opt.SetTargetRates(500_000, 26, 50),
            Err(MediaOptError::Uninitialized)
        ));
    }

    #[test]
    fn SetEncodingDataRejectsZeroParameters() {
        let (mut opt, _clock) = optimizer();
        assert!(opt
            .SetEncodingData(VideoCodecType::Vp8, 1_000_000, 0, 500_000, 640, 480)
            .is_err());
        assert!(opt
            .SetEncodingData(VideoCodecType::Vp8, 1_000_000, 30, 0, 640, 480)
            .is_err());
        assert!(opt
            .SetEncodingData(VideoCodecType::Vp8, 1_000_000, 30, 500_000, 0, 480)
            .is_err());
    }

    #[test]
    fn NackSuppressesResidualLossAtShortRtt() {
        let (mut opt, _clock) = optimizer();
        opt.SetEncodingData(VideoCodecType::Vp8, 1_000_000, 30, 500_000, 640, 480)
            .unwrap();
        opt.EnableNack(true);
        let rates = opt.SetTargetRates(500_000, 26, 50).unwrap();
        assert_eq!(rates.effective_loss_255, 0);
    }

    #[test]
    fn FecReactsToLoss() {
        let (mut opt, clock) = optimizer();
        opt.SetEncodingData(VideoCodecType::Vp8, 1_000_000, 30, 500_000, 640, 480)
            .unwrap();
        opt.EnableFec(true);
        let recorder = Rc::new(RefCell::new(ProtectionRecorder::default()));
        opt.RegisterProtectionCallback(Some(Box::new(recorder.clone())));
        feed_frames(&mut opt, &clock, 30, 2083);
        let rates = opt.SetTargetRates(500_000, 26, 50).unwrap();

        let recorder = recorder.borrow();
        let calls = &recorder.calls;
        assert_eq!(calls.len(), 1);
        let (delta_rate, key_rate, nack_enabled) = calls[0];
        assert!(delta_rate > 0);
        assert!(key_rate >= delta_rate);
        assert!(!nack_enabled);
        // Overhead was subtracted from the target.
        assert!(rates.target_bit_rate_bps < 500_000);
        assert!(rates.effective_loss_255 > 0);
    }

    #[test]
    fn HybridCollapsesToNackAtVeryShortRtt() {
        let (mut opt, _clock) = optimizer();
        opt.SetEncodingData(VideoCodecType::Vp8, 1_000_000, 30, 500_000, 640, 480)
            .unwrap();
        opt.EnableNackFec(true);
        let recorder = Rc::new(RefCell::new(ProtectionRecorder::default()));
        opt.RegisterProtectionCallback(Some(Box::new(recorder.clone())));
        opt.SetTargetRates(500_000, 26, 10).unwrap();

        let recorder = recorder.borrow();
        let calls = &recorder.calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (0, 0, true));
    }

    #[test]
    fn ProtectionRequestIsIdempotentUnderStableInput() {
        let (mut opt, _clock) = optimizer();
        opt.SetEncodingData(VideoCodecType::Vp8, 1_000_000, 30, 500_000, 640, 480)
            .unwrap();
        opt.EnableFec(true);
        let recorder = Rc::new(RefCell::new(ProtectionRecorder::default()));
        opt.RegisterProtectionCallback(Some(Box::new(recorder.clone())));
        opt.SetTargetRates(500_000, 26, 50).unwrap();
        opt.SetTargetRates(500_000, 26, 50).unwrap();

        let recorder = recorder.borrow();
        let calls = &recorder.calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
    }

    #[test]
    fn DownSamplesUnderLowRateHighMotion() {
        let (mut opt, clock) = optimizer();
        opt.SetEncodingData(VideoCodecType::Vp8, 1_000_000, 30, 100_000, 640, 480)
            .unwrap();
        let recorder = Rc::new(RefCell::new(QmRecorder::default()));
        opt.RegisterVideoQMCallback(Some(Box::new(recorder.clone())));
        let metrics = metrics_high_motion_low_texture();

        for _ in 0..3 {
            for _ in 0..30 {
                clock.advance_ms(33);
                opt.UpdateIncomingFrameRate();
                opt.UpdateWithEncodedData(417, FrameType::Delta);
                opt.UpdateContentData(Some(&metrics));
            }
            opt.SetTargetRates(100_000, 26, 50).unwrap();
        }

        let recorder = recorder.borrow();
        let calls = &recorder.calls;
        assert_eq!(calls.len(), 1);
        let (frame_rate, width, height) = calls[0];
        assert_eq!(width, 320);
        assert_eq!(height, 240);
        assert!((29..=31).contains(&frame_rate));
    }

    #[test]
    fn RestoresResolutionWhenRateRecovers() {
        let (mut opt, clock) = optimizer();
        opt.SetEncodingData(VideoCodecType::Vp8, 1_000_000, 30, 100_000, 640, 480)
            .unwrap();
        let recorder = Rc::new(RefCell::new(QmRecorder::default()));
        opt.RegisterVideoQMCallback(Some(Box::new(recorder.clone())));
        let metrics = metrics_high_motion_low_texture();

        for _ in 0..3 {
            for _ in 0..30 {
                clock.advance_ms(33);
                opt.UpdateIncomingFrameRate();
                opt.UpdateWithEncodedData(417, FrameType::Delta);
                opt.UpdateContentData(Some(&metrics));
            }
            opt.SetTargetRates(100_000, 26, 50).unwrap();
        }
        assert_eq!(recorder.borrow().calls.last(), Some(&(31, 320, 240)));

        // The encoder adopts the down-sampled resolution at a higher rate.
        opt.SetEncodingData(VideoCodecType::Vp8, 1_000_000, 30, 400_000, 320, 240)
            .unwrap();
        for _ in 0..5 {
            for _ in 0..30 {
                clock.advance_ms(33);
                opt.UpdateIncomingFrameRate();
                opt.UpdateWithEncodedData(1667, FrameType::Delta);
                opt.UpdateContentData(Some(&metrics));
            }
            opt.SetTargetRates(400_000, 0, 50).unwrap();
        }

        let recorder = recorder.borrow();
        let (_, width, height) = *recorder.calls.last().unwrap();
        assert_eq!(width, 640);
        assert_eq!(height, 480);
    }

    #[test]
    fn FrameDropperHonorsDisable() {
        let (mut opt, clock) = optimizer();
        opt.SetEncodingData(VideoCodecType::Vp8, 1_000_000, 30, 100_000, 640, 480)
            .unwrap();
        let mut dropped = false;
        for _ in 0..10 {
            clock.advance_ms(33);
            opt.UpdateIncomingFrameRate();
            opt.UpdateWithEncodedData(20_000, FrameType::Delta);
            dropped |= opt.DropFrame();
        }
        assert!(dropped);

        opt.EnableFrameDropper(false);
        opt.UpdateWithEncodedData(20_000, FrameType::Delta);
        assert!(!opt.DropFrame());
    }

    #[test]
    fn MeasuresIncomingFrameRate() {
        let (mut opt, clock) = optimizer();
        for _ in 0..30 {
            clock.advance_ms(33);
            opt.UpdateIncomingFrameRate();
        }
        let rate = opt.InputFrameRate();
        assert!((28..=32).contains(&rate), "measured {}", rate);
    }

    #[test]
    fn MeasuresSentBitRate() {
        let (mut opt, clock) = optimizer();
        // 30 frames x 2083 bytes in one second is ~500 kbps.
        feed_frames(&mut opt, &clock, 30, 2083);
        let kbps = opt.SentBitRate();
        assert!((450.0..=550.0).contains(&kbps), "measured {}", kbps);
    }

    #[test]
    fn CountsKeyAndDeltaFrames() {
        let (mut opt, _clock) = optimizer();
        opt.UpdateWithEncodedData(5000, FrameType::Key);
        opt.UpdateWithEncodedData(1000, FrameType::Delta);
        opt.UpdateWithEncodedData(1000, FrameType::Delta);
        opt.UpdateWithEncodedData(5000, FrameType::Golden);
        assert_eq!(opt.SentFrameCount(), (2, 2));
    }

    #[test]
    fn NullContentMetricsDisableQualityUpdates() {
        let (mut opt, clock) = optimizer();
        opt.SetEncodingData(VideoCodecType::Vp8, 1_000_000, 30, 100_000, 640, 480)
            .unwrap();
        let recorder = Rc::new(RefCell::new(QmRecorder::default()));
        opt.RegisterVideoQMCallback(Some(Box::new(recorder.clone())));
        opt.UpdateContentData(None);

        for _ in 0..3 {
            for _ in 0..30 {
                clock.advance_ms(33);
                opt.UpdateIncomingFrameRate();
                opt.UpdateWithEncodedData(417, FrameType::Delta);
            }
            opt.SetTargetRates(100_000, 26, 50).unwrap();
        }
        assert!(recorder.borrow().calls.is_empty());
    }

    #[test]
    fn MethodEnableFlagsRoundTrip() {
        let (mut opt, _clock) = optimizer();
        opt.EnableNack(true);
        opt.EnableFec(true);
        assert!(opt.IsNackEnabled());
        assert!(opt.IsFecEnabled());
        assert!(!opt.IsNackFecEnabled());
        opt.EnableNack(false);
        assert!(!opt.IsNackEnabled());
    }
}
