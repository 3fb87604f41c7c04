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

use crate::fec_tables::{
    AVG_FEC_RECOVERY_XOR, CODE_RATE_XOR_TABLE, CODE_SIZE, HIGH_RTT_NACK_MS, LOW_RTT_NACK_MS,
    NACK_FEC_TABLE, PLOSS_MAX, RATE_PAR, RATE_TABLE_STEPS, recovery_code_index,
};
use crate::ExpFilter;

/// Sliding loss window: 30 one-second buckets.
pub const LOSS_PR_HISTORY_SIZE: usize = 30;
pub const LOSS_PR_SHORT_FILTER_WIN_MS: i64 = 1000;
/// NACK is useless once retransmissions arrive later than this.
const NACK_MAX_RTT_MS: i64 = 1000;
/// Intra requests stop paying off at moderate RTT.
const INTRA_REQUEST_MAX_RTT_MS: i64 = 150;
/// MB intra refresh needs enough frames per second to cycle the picture.
const MB_INTRA_REFRESH_MIN_FRAME_RATE: f32 = 10.0;
/// Floor on the effective loss reported to the encoder while FEC is active,
/// 255-fixed-point (~2.5%).
const MIN_EFFECTIVE_LOSS_FEC: f32 = 0.025 * 255.0;
/// Default RTP payload size used for packets-per-frame estimates.
const MAX_PAYLOAD_SIZE: u16 = 1460;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtectionMethodType {
    None,
    Nack,
    Fec,
    NackFec,
    IntraRequest,
    PeriodicIntra,
    MbIntraRefresh,
}

/// Snapshot of the control state handed to every method on each re-score.
/// Rebuilt per interval, never retained.
#[derive(Clone, Debug, Default)]
pub struct ProtectionParameters {
    pub rtt_ms: i64,
    /// Filtered loss fraction in [0, 1].
    pub loss_pr: f32,
    pub bit_rate_kbps: f32,
    pub frame_rate_fps: f32,
    pub key_frame_size: f32,
    pub packets_per_frame: f32,
    pub packets_per_frame_key: f32,
    pub residual_packet_loss_fec: f32,
    pub fec_rate_delta: u8,
    pub fec_rate_key: u8,
    pub codec_width: u16,
    pub codec_height: u16,
}

/// Converts a protection factor from "fraction of total packets" to
/// "fraction of source packets", the convention the RTP FEC module expects.
pub fn ConvertFECRate(code_rate_rtp: u8) -> u8 {
    let converted = 0.5 + 255.0 * code_rate_rtp as f32 / (255 - code_rate_rtp) as f32;
    (converted as u32).min(255) as u8
}

/// One loss-protection strategy and its last scored outcome. The variant tag
/// selects the scoring algorithm; all scored results share the same shape.
pub struct ProtectionMethod {
    method_type: ProtectionMethodType,
    // Factors are fractions of total packets, 255-fixed-point, kept below
    // PLOSS_MAX (50%). Conversion to source-packet convention happens only
    // when the values are published.
    protection_factor_k: u8,
    protection_factor_d: u8,
    // Raw key-frame table lookup, before the lower bounds; the hybrid method
    // re-applies the bounds after softening the delta factor.
    key_code_rate_lookup: u8,
    effective_packet_loss: u8,
    residual_packet_loss_fec: f32,
    max_payload_size: u16,
    use_uep_protection_k: bool,
    use_uep_protection_d: bool,
    // Discounts the FEC overhead estimate when rounding would generate
    // fewer actual FEC packets than the factor suggests.
    corr_fec_cost: f32,
    efficiency_bps: f32,
}

impl ProtectionMethod {
    pub fn new(method_type: ProtectionMethodType) -> Self {
        Self {
            method_type,
            protection_factor_k: 0,
            protection_factor_d: 0,
            key_code_rate_lookup: 0,
            effective_packet_loss: 0,
            residual_packet_loss_fec: 0.0,
            max_payload_size: MAX_PAYLOAD_SIZE,
            use_uep_protection_k: false,
            use_uep_protection_d: true,
            corr_fec_cost: 1.0,
            efficiency_bps: 0.0,
        }
    }

    pub fn Type(&self) -> ProtectionMethodType {
        self.method_type
    }

    pub fn RequiredProtectionFactorK(&self) -> u8 {
        self.protection_factor_k
    }

    pub fn RequiredProtectionFactorD(&self) -> u8 {
        self.protection_factor_d
    }

    pub fn RequiredPacketLossER(&self) -> u8 {
        self.effective_packet_loss
    }

    pub fn RequiredUepProtectionK(&self) -> bool {
        self.use_uep_protection_k
    }

    pub fn RequiredUepProtectionD(&self) -> bool {
        self.use_uep_protection_d
    }

    pub fn ResidualPacketLossFec(&self) -> f32 {
        self.residual_packet_loss_fec
    }

    /// Estimated bit cost of this method, also its selection score.
    pub fn RequiredBitRate(&self) -> f32 {
        self.efficiency_bps
    }

    /// Re-scores this method against the current control state. Returns
    /// whether the method is recommended at all under these conditions.
    pub fn UpdateParameters(&mut self, parameters: &ProtectionParameters) -> bool {
        match self.method_type {
            ProtectionMethodType::Fec => self.update_fec(parameters),
            ProtectionMethodType::Nack => self.update_nack(parameters),
            ProtectionMethodType::NackFec => self.update_nack_fec(parameters),
            ProtectionMethodType::IntraRequest => {
                self.update_passthrough(parameters);
                parameters.rtt_ms < INTRA_REQUEST_MAX_RTT_MS
            }
            ProtectionMethodType::PeriodicIntra => {
                self.update_passthrough(parameters);
                true
            }
            ProtectionMethodType::MbIntraRefresh => {
                self.update_passthrough(parameters);
                parameters.frame_rate_fps >= MB_INTRA_REFRESH_MIN_FRAME_RATE
            }
            ProtectionMethodType::None => false,
        }
    }

    fn update_fec(&mut self, parameters: &ProtectionParameters) -> bool {
        self.fec_protection_factor(parameters);
        self.fec_effective_loss(parameters, 1.0);

        // Overhead cost, ignoring key frames. The factor is relative to the
        // total packet count, so the cost is a direct fraction of the rate.
        let fec_rate = self.protection_factor_d as f32 / 255.0;
        self.efficiency_bps =
            parameters.bit_rate_kbps * 1000.0 * fec_rate * self.corr_fec_cost;
        true
    }

    fn update_nack(&mut self, parameters: &ProtectionParameters) -> bool {
        self.protection_factor_k = 0;
        self.protection_factor_d = 0;
        // Retransmissions hide the loss from the encoder at short RTT; past
        // the NACK threshold the loss passes through unrepaired.
        if parameters.rtt_ms < HIGH_RTT_NACK_MS {
            self.effective_packet_loss = 0;
            self.residual_packet_loss_fec = 0.0;
        } else {
            self.effective_packet_loss = (255.0 * parameters.loss_pr) as u8;
            self.residual_packet_loss_fec = parameters.loss_pr;
        }
        self.efficiency_bps = parameters.bit_rate_kbps * 1000.0 * parameters.loss_pr
            / (1.0 + parameters.loss_pr);
        parameters.rtt_ms <= NACK_MAX_RTT_MS
    }

    fn update_nack_fec(&mut self, parameters: &ProtectionParameters) -> bool {
        // Three operating points: below LOW_RTT_NACK_MS pure NACK, above
        // HIGH_RTT_NACK_MS pure FEC, in between a blend where the FEC rates
        // soften as retransmissions get more effective.
        if parameters.rtt_ms < LOW_RTT_NACK_MS {
            self.protection_factor_k = 0;
            self.protection_factor_d = 0;
            self.key_code_rate_lookup = 0;
            self.effective_packet_loss = 0;
            self.residual_packet_loss_fec = parameters.loss_pr;
            self.corr_fec_cost = 0.0;
        } else {
            self.fec_protection_factor(parameters);
            if parameters.rtt_ms < HIGH_RTT_NACK_MS {
                let softness = NACK_FEC_TABLE[parameters.rtt_ms as usize] as f32 / 4096.0;
                let scaled_d = (self.protection_factor_d as f32 * softness) as u8;
                self.protection_factor_d = scaled_d;
                self.fec_effective_loss(parameters, softness);
                self.effective_packet_loss =
                    (self.effective_packet_loss as f32 * softness) as u8;
                // Key frames keep the full lower bounds even in the blend.
                let packet_loss = ((255.0 * parameters.loss_pr) as u32)
                    .min(PLOSS_MAX as u32 - 1) as u8;
                let boost_key_prot =
                    (2 * scaled_d as u32).min(PLOSS_MAX as u32 - 1) as u8;
                let scaled_k = (self.protection_factor_k as f32 * softness) as u8;
                self.protection_factor_k = scaled_k
                    .max(packet_loss)
                    .max(boost_key_prot)
                    .max(self.key_code_rate_lookup)
                    .min(PLOSS_MAX as u8 - 1);
            } else {
                self.fec_effective_loss(parameters, 1.0);
            }
        }

        // Cost is the FEC overhead plus, while NACK is still effective, the
        // retransmission cost of the residual loss.
        let fec_rate = self.protection_factor_d as f32 / 255.0;
        let mut efficiency =
            parameters.bit_rate_kbps * 1000.0 * fec_rate * self.corr_fec_cost;
        if parameters.rtt_ms < HIGH_RTT_NACK_MS {
            let residual = self.residual_packet_loss_fec.max(0.0);
            efficiency += parameters.bit_rate_kbps * 1000.0 * residual / (1.0 + residual);
        }
        self.efficiency_bps = efficiency;
        parameters.rtt_ms <= NACK_MAX_RTT_MS
    }

    fn update_passthrough(&mut self, parameters: &ProtectionParameters) {
        self.protection_factor_k = 0;
        self.protection_factor_d = 0;
        self.effective_packet_loss = (255.0 * parameters.loss_pr) as u8;
        self.residual_packet_loss_fec = parameters.loss_pr;
        self.efficiency_bps = 0.0;
    }

    /// FEC protection settings; varies with packet loss, rate and resolution.
    fn fec_protection_factor(&mut self, parameters: &ProtectionParameters) {
        let packet_loss_raw = (255.0 * parameters.loss_pr) as u32;
        if packet_loss_raw == 0 {
            self.protection_factor_k = 0;
            self.protection_factor_d = 0;
            self.key_code_rate_lookup = 0;
            self.corr_fec_cost = 1.0;
            return;
        }
        // Tables are defined only up to 50% loss.
        let packet_loss = packet_loss_raw.min(PLOSS_MAX as u32 - 1) as usize;

        let (avg_tot_packets, eff_rate) = self.frame_shape(parameters);
        let code_rate_delta = self.delta_code_rate_for_loss(parameters, packet_loss);

        // Key frames are effectively sent at a higher rate; re-enter the
        // table at the boosted rate.
        let packet_frame_delta = (0.5 + parameters.packets_per_frame) as u8;
        let packet_frame_key = (0.5 + parameters.packets_per_frame_key) as u8;
        let boost_key = boost_code_rate_key(packet_frame_delta, packet_frame_key);
        let rate_index_key = (1 + (boost_key as i32 * eff_rate - RATE_PAR) / RATE_PAR)
            .clamp(0, RATE_TABLE_STEPS as i32 - 1) as usize;
        let key_lookup = CODE_RATE_XOR_TABLE[rate_index_key * PLOSS_MAX + packet_loss];
        self.key_code_rate_lookup = key_lookup;

        // Key protection must cover at least the filtered loss and twice the
        // delta protection.
        let boost_key_prot = (2 * code_rate_delta as u32).min(PLOSS_MAX as u32 - 1) as u8;
        let code_rate_key = key_lookup
            .max(packet_loss as u8)
            .max(boost_key_prot)
            .min(PLOSS_MAX as u8 - 1);

        self.protection_factor_k = code_rate_key;
        self.protection_factor_d = code_rate_delta;

        // When rounding would generate less than about one FEC packet per
        // frame the overhead estimated here never materializes in the RTP
        // sender; discount the cost estimate accordingly.
        let est_num_fec_gen =
            0.5 + self.protection_factor_d as f32 * avg_tot_packets as f32 / 255.0;
        self.corr_fec_cost = if est_num_fec_gen < 1.0 {
            0.0
        } else if est_num_fec_gen < 1.5 {
            0.5
        } else {
            1.0
        };
    }

    /// Average packets per frame (source and FEC) and the resolution-scaled
    /// effective rate in kbits per frame, shared by the table entry points.
    fn frame_shape(&self, parameters: &ProtectionParameters) -> (u8, i32) {
        // Average bits per frame, in kbits.
        let bit_rate_per_frame =
            (parameters.bit_rate_kbps / parameters.frame_rate_fps) as u16;
        let avg_tot_packets = 1 + (bit_rate_per_frame as f32 * 1000.0
            / (8.0 * self.max_payload_size as f32)
            + 0.5) as u8;

        // Larger systems need relatively less protection for the same rate;
        // the exponent below one softens the size effect.
        let spatial_size_to_ref = (parameters.codec_width as f32
            * parameters.codec_height as f32)
            / (704.0 * 576.0);
        let resoln_fac = 1.0 / spatial_size_to_ref.powf(0.3);
        let eff_rate = (resoln_fac * bit_rate_per_frame as f32) as i32;

        (avg_tot_packets, eff_rate)
    }

    /// Delta-frame code rate at one point of the table loss axis.
    fn delta_code_rate_for_loss(
        &self,
        parameters: &ProtectionParameters,
        packet_loss: usize,
    ) -> u8 {
        if packet_loss == 0 {
            return 0;
        }
        let (avg_tot_packets, eff_rate) = self.frame_shape(parameters);
        let rate_index = ((eff_rate - RATE_PAR) / RATE_PAR)
            .clamp(0, RATE_TABLE_STEPS as i32 - 1) as usize;

        let mut code_rate_delta = CODE_RATE_XOR_TABLE[rate_index * PLOSS_MAX + packet_loss];

        if avg_tot_packets > 1 {
            // At low packet counts the table under-protects; blend in a
            // one-packet-per-frame minimum, weighted toward the minimum as
            // the frame shrinks.
            let min_protection = 255.0 / avg_tot_packets as f32;
            let t = (avg_tot_packets as f32 - 4.0) / 3.0;
            let w1 = (0.5 + t).clamp(0.5, 1.5);
            let w2 = (0.5 - 0.5 * t).clamp(0.0, 0.5);
            let blended = (w1 * min_protection + w2 * code_rate_delta as f32) as u8;
            code_rate_delta = code_rate_delta.max(blended);
        }
        // 50% is max.
        code_rate_delta.min(PLOSS_MAX as u8 - 1)
    }

    /// Average recovery from the FEC under the random-loss model, at one
    /// point of the table loss axis, in the 255-fixed-point loss scale.
    fn avg_recovery_for_loss(
        &self,
        parameters: &ProtectionParameters,
        packet_loss: usize,
        protection_factor_d: u8,
    ) -> f32 {
        let (avg_tot_packets, _) = self.frame_shape(parameters);

        let protection_factor = protection_factor_d as f32 / 255.0;
        let fec_packets_exact = 0.5 + protection_factor * avg_tot_packets as f32;
        let fec_packets_per_frame = fec_packets_exact as usize;
        let source_packets_per_frame =
            (avg_tot_packets as usize).saturating_sub(fec_packets_per_frame);

        if fec_packets_per_frame == 0 || source_packets_per_frame == 0 {
            // No protection, or rate too low.
            return 0.0;
        }
        let fec = fec_packets_per_frame.min(CODE_SIZE).min(source_packets_per_frame);
        let source = source_packets_per_frame.min(CODE_SIZE);

        let loss = packet_loss.min(PLOSS_MAX - 1);

        let index1 = recovery_code_index(fec, source) * PLOSS_MAX + loss;
        // Interpolate toward the next larger code; fall back to the first
        // entry where the table ends.
        let index2 = if source + 1 <= CODE_SIZE {
            recovery_code_index(fec + 1, source + 1) * PLOSS_MAX + loss
        } else {
            index1
        };

        let recovery1 = AVG_FEC_RECOVERY_XOR[index1] as f32;
        let recovery2 = AVG_FEC_RECOVERY_XOR[index2] as f32;
        let weight = fec_packets_exact - fec_packets_per_frame as f32;
        weight * recovery2 + (1.0 - weight) * recovery1
    }

    /// Residual loss after FEC recovery, and the softened effective loss
    /// reported to the encoder. `factor_scale` scales the delta protection
    /// (the hybrid method passes its softness while retransmissions carry
    /// part of the repair).
    ///
    /// The recovery table moves in whole-code steps as the protection grows
    /// with the loss, so the point-wise curve can dip while the channel
    /// degrades. Both outputs are the running maximum of that curve over the
    /// loss axis, which keeps them non-decreasing in the reported loss.
    fn fec_effective_loss(&mut self, parameters: &ProtectionParameters, factor_scale: f32) {
        let packet_loss = 255.0 * parameters.loss_pr;
        if packet_loss <= 0.0 {
            self.residual_packet_loss_fec = 0.0;
            self.effective_packet_loss = 0;
            return;
        }
        let loss_index = ((packet_loss + 0.5) as usize).min(PLOSS_MAX - 1);

        let mut max_residual = 0.0f32;
        let mut max_effective = 0.0f32;
        for loss in 1..=loss_index {
            let factor_d =
                (self.delta_code_rate_for_loss(parameters, loss) as f32 * factor_scale) as u8;
            let recovery = self.avg_recovery_for_loss(parameters, loss, factor_d);
            max_residual = max_residual.max(loss as f32 - recovery);
            // The encoder only gets half credit for the FEC recovery, so its
            // own error resilience does not switch off entirely.
            max_effective = max_effective.max(loss as f32 - 0.5 * recovery);
        }
        // Past the table range the recovery is pinned and the excess loss
        // passes straight through.
        let beyond_table = (packet_loss - (PLOSS_MAX as f32 - 1.0)).max(0.0);

        self.residual_packet_loss_fec = (max_residual + beyond_table) / 255.0;
        self.effective_packet_loss =
            (max_effective + beyond_table).max(MIN_EFFECTIVE_LOSS_FEC) as u8;
    }
}

/// Boost factor for key-frame protection: scales with the packet-count ratio
/// of key to delta frames, never below 2.
fn boost_code_rate_key(packet_frame_delta: u8, packet_frame_key: u8) -> u8 {
    let ratio = if packet_frame_delta > 0 {
        packet_frame_key / packet_frame_delta
    } else {
        1
    };
    ratio.max(2)
}

#[derive(Clone, Copy)]
struct LossProtSample {
    loss_pr_255: u8,
    time_ms: i64,
}

/// Drives the protection-method set: filters the incoming loss and
/// packets-per-frame signals, keeps the windowed loss history, re-scores all
/// registered methods once per interval and selects one.
pub struct LossProtectionLogic {
    methods: Vec<ProtectionMethod>,
    selected_type: ProtectionMethodType,
    rtt_ms: i64,
    loss_pr: f32,
    bit_rate_kbps: f32,
    frame_rate_fps: f32,
    key_frame_size: f32,
    fec_rate_key: u8,
    fec_rate_delta: u8,
    residual_packet_loss_fec: f32,
    codec_width: u16,
    codec_height: u16,
    loss_pr_255: ExpFilter,
    last_pr_update_ms: i64,
    // time_ms == -1 marks an empty slot; slots are newest-first.
    loss_pr_history: [LossProtSample; LOSS_PR_HISTORY_SIZE],
    short_max_loss_pr_255: u8,
    packets_per_frame: ExpFilter,
    packets_per_frame_key: ExpFilter,
    last_packet_per_frame_update_ms: i64,
    last_packet_per_frame_update_ms_key: i64,
}

impl LossProtectionLogic {
    pub fn new(now_ms: i64) -> Self {
        Self {
            methods: Vec::new(),
            selected_type: ProtectionMethodType::None,
            rtt_ms: 0,
            loss_pr: 0.0,
            bit_rate_kbps: 0.0,
            frame_rate_fps: 0.0,
            key_frame_size: 0.0,
            fec_rate_key: 0,
            fec_rate_delta: 0,
            residual_packet_loss_fec: 0.0,
            codec_width: 0,
            codec_height: 0,
            loss_pr_255: ExpFilter::new(0.9999),
            last_pr_update_ms: now_ms,
            loss_pr_history: [LossProtSample {
                loss_pr_255: 0,
                time_ms: -1,
            }; LOSS_PR_HISTORY_SIZE],
            short_max_loss_pr_255: 0,
            packets_per_frame: ExpFilter::new(0.9999),
            packets_per_frame_key: ExpFilter::new(0.9999),
            last_packet_per_frame_update_ms: now_ms,
            last_packet_per_frame_update_ms_key: now_ms,
        }
    }

    /// Registers a method of the given type; a type exists at most once.
    pub fn AddMethod(&mut self, method_type: ProtectionMethodType) -> bool {
        if method_type == ProtectionMethodType::None || self.FindMethod(method_type).is_some() {
            return false;
        }
        self.methods.push(ProtectionMethod::new(method_type));
        true
    }

    pub fn RemoveMethod(&mut self, method_type: ProtectionMethodType) -> bool {
        let before = self.methods.len();
        self.methods.retain(|m| m.Type() != method_type);
        if self.selected_type == method_type {
            self.selected_type = ProtectionMethodType::None;
        }
        self.methods.len() != before
    }

    pub fn FindMethod(&self, method_type: ProtectionMethodType) -> Option<&ProtectionMethod> {
        self.methods.iter().find(|m| m.Type() == method_type)
    }

    /// Largest bit cost over all registered methods; the target rate is
    /// reduced by this much to leave room for protection.
    pub fn HighestOverhead(&self) -> f32 {
        self.methods
            .iter()
            .map(|m| m.RequiredBitRate())
            .fold(0.0, f32::max)
    }

    pub fn UpdateRtt(&mut self, rtt_ms: i64) {
        self.rtt_ms = rtt_ms;
    }

    pub fn UpdateBitRate(&mut self, bit_rate_kbps: f32) {
        self.bit_rate_kbps = bit_rate_kbps;
    }

    pub fn UpdateFrameRate(&mut self, frame_rate_fps: f32) {
        self.frame_rate_fps = frame_rate_fps;
    }

    pub fn UpdateKeyFrameSize(&mut self, key_frame_size: f32) {
        self.key_frame_size = key_frame_size;
    }

    pub fn UpdateResidualPacketLoss(&mut self, residual_packet_loss: f32) {
        self.residual_packet_loss_fec = residual_packet_loss;
    }

    pub fn UpdateFrameSize(&mut self, width: u16, height: u16) {
        self.codec_width = width;
        self.codec_height = height;
    }

    /// Folds a new loss report into both the exponential filter and the
    /// windowed max history.
    pub fn UpdateLossPr(&mut self, loss_pr_255: u8, now_ms: i64) {
        self.UpdateMaxLossHistory(loss_pr_255, now_ms);
        self.loss_pr_255.Apply(
            (now_ms - self.last_pr_update_ms) as f32,
            loss_pr_255 as f32,
        );
        self.last_pr_update_ms = now_ms;
        self.loss_pr = self.loss_pr_255.Value() / 255.0;
    }

    pub fn UpdatePacketsPerFrame(&mut self, packets: f32, now_ms: i64) {
        self.packets_per_frame.Apply(
            (now_ms - self.last_packet_per_frame_update_ms) as f32,
            packets,
        );
        self.last_packet_per_frame_update_ms = now_ms;
    }

    pub fn UpdatePacketsPerFrameKey(&mut self, packets: f32, now_ms: i64) {
        self.packets_per_frame_key.Apply(
            (now_ms - self.last_packet_per_frame_update_ms_key) as f32,
            packets,
        );
        self.last_packet_per_frame_update_ms_key = now_ms;
    }

    /// Installs the encoder-effective loss back into the control state, so
    /// the next re-score sees what the encoder sees.
    pub fn UpdateFilteredLossPr(&mut self, packet_loss_enc: u8) {
        self.loss_pr = packet_loss_enc as f32 / 255.0;
    }

    fn UpdateMaxLossHistory(&mut self, loss_pr_255: u8, now_ms: i64) {
        if self.loss_pr_history[0].time_ms >= 0
            && now_ms - self.loss_pr_history[0].time_ms < LOSS_PR_SHORT_FILTER_WIN_MS
        {
            if loss_pr_255 > self.short_max_loss_pr_255 {
                self.short_max_loss_pr_255 = loss_pr_255;
            }
        } else if self.loss_pr_history[0].time_ms == -1 {
            // First sample lands in the ring directly.
            self.loss_pr_history[0] = LossProtSample {
                loss_pr_255,
                time_ms: now_ms,
            };
            self.short_max_loss_pr_255 = 0;
        } else {
            // Second boundary: shift the ring, commit the short-term max.
            for i in (0..LOSS_PR_HISTORY_SIZE - 1).rev() {
                self.loss_pr_history[i + 1] = self.loss_pr_history[i];
            }
            if self.short_max_loss_pr_255 == 0 {
                self.short_max_loss_pr_255 = loss_pr_255;
            }
            self.loss_pr_history[0] = LossProtSample {
                loss_pr_255: self.short_max_loss_pr_255,
                time_ms: now_ms,
            };
            self.short_max_loss_pr_255 = 0;
        }
    }

    /// Largest loss sample in the last 30 seconds, including the running
    /// short-term max of the current second.
    pub fn MaxFilteredLossPr(&self, now_ms: i64) -> u8 {
        let mut max_found = self.short_max_loss_pr_255;
        if self.loss_pr_history[0].time_ms == -1 {
            return max_found;
        }
        for sample in &self.loss_pr_history {
            if sample.time_ms == -1 {
                break;
            }
            if now_ms - sample.time_ms
                > LOSS_PR_HISTORY_SIZE as i64 * LOSS_PR_SHORT_FILTER_WIN_MS
            {
                // This sample and everything after it is too old.
                break;
            }
            if sample.loss_pr_255 > max_found {
                max_found = sample.loss_pr_255;
            }
        }
        max_found
    }

    /// Loss fed to the selected method: FEC-based methods see the windowed
    /// max so they react to bursts, the rest see the exponential average.
    pub fn FilteredLoss(&self, now_ms: i64) -> u8 {
        match self.selected_type {
            ProtectionMethodType::Fec | ProtectionMethodType::NackFec => {
                self.MaxFilteredLossPr(now_ms)
            }
            _ => (self.loss_pr_255.Value() + 0.5) as u8,
        }
    }

    /// Re-scores every registered method and selects one. Returns false when
    /// nothing is registered or nothing is recommended.
    pub fn UpdateMethod(&mut self) -> bool {
        let parameters = ProtectionParameters {
            rtt_ms: self.rtt_ms,
            loss_pr: self.loss_pr,
            bit_rate_kbps: self.bit_rate_kbps,
            frame_rate_fps: self.frame_rate_fps.max(1.0),
            key_frame_size: self.key_frame_size,
            packets_per_frame: self.packets_per_frame.Value(),
            packets_per_frame_key: self.packets_per_frame_key.Value(),
            residual_packet_loss_fec: self.residual_packet_loss_fec,
            fec_rate_delta: self.fec_rate_delta,
            fec_rate_key: self.fec_rate_key,
            codec_width: self.codec_width,
            codec_height: self.codec_height,
        };

        let mut best: Option<(u8, ProtectionMethodType)> = None;
        for method in &mut self.methods {
            let recommended = method.UpdateParameters(&parameters);
            if !recommended {
                continue;
            }
            let priority = selection_priority(method.Type());
            if best.map_or(true, |(p, _)| priority < p) {
                best = Some((priority, method.Type()));
            }
        }
        match best {
            Some((_, method_type)) => {
                self.selected_type = method_type;
                if let Some(selected) = self.FindMethod(method_type) {
                    let rate_key = selected.RequiredProtectionFactorK();
                    let rate_delta = selected.RequiredProtectionFactorD();
                    self.fec_rate_key = rate_key;
                    self.fec_rate_delta = rate_delta;
                }
                debug!(
                    ?method_type,
                    fec_rate_delta = self.fec_rate_delta,
                    fec_rate_key = self.fec_rate_key,
                    "protection method selected"
                );
                true
            }
            None => {
                self.selected_type = ProtectionMethodType::None;
                false
            }
        }
    }

    pub fn SelectedMethod(&self) -> Option<&ProtectionMethod> {
        self.FindMethod(self.selected_type)
    }

    pub fn SelectedType(&self) -> ProtectionMethodType {
        self.selected_type
    }

    /// Clears the filters and the loss history; the method registry is user
    /// policy and survives a reset.
    pub fn Reset(&mut self, now_ms: i64) {
        self.last_pr_update_ms = now_ms;
        self.last_packet_per_frame_update_ms = now_ms;
        self.last_packet_per_frame_update_ms_key = now_ms;
        self.loss_pr_255.Reset(0.9999);
        self.packets_per_frame.Reset(0.9999);
        self.packets_per_frame_key.Reset(0.9999);
        self.loss_pr = 0.0;
        self.fec_rate_delta = 0;
        self.fec_rate_key = 0;
        self.loss_pr_history = [LossProtSample {
            loss_pr_255: 0,
            time_ms: -1,
        }; LOSS_PR_HISTORY_SIZE];
        self.short_max_loss_pr_255 = 0;
    }
}

/// Fixed tiebreak between recommended methods; lower wins. FEC over hybrid
/// over NACK, intra fallbacks last.
fn selection_priority(method_type: ProtectionMethodType) -> u8 {
    match method_type {
        ProtectionMethodType::Fec => 0,
        ProtectionMethodType::NackFec => 1,
        ProtectionMethodType::Nack => 2,
        ProtectionMethodType::IntraRequest => 3,
        ProtectionMethodType::PeriodicIntra => 4,
        ProtectionMethodType::MbIntraRefresh => 5,
        ProtectionMethodType::None => u8::MAX,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn params(loss_255: u32, bit_rate_kbps: f32, rtt_ms: i64) -> ProtectionParameters {
        ProtectionParameters {
            rtt_ms,
            loss_pr: loss_255 as f32 / 255.0,
            bit_rate_kbps,
            frame_rate_fps: 30.0,
            key_frame_size: 0.0,
            packets_per_frame: 2.0,
            packets_per_frame_key: 6.0,
            residual_packet_loss_fec: 0.0,
            fec_rate_delta: 0,
            fec_rate_key: 0,
            codec_width: 704,
            codec_height: 576,
        }
    }

    #[test]
    fn FecFactorsStayBoundedAndKeyDominates() {
        let mut fec = ProtectionMethod::new(ProtectionMethodType::Fec);
        for &loss in &[1u32, 13, 26, 52, 77, 102, 128, 200] {
            for &rate in &[100.0, 500.0, 1000.0, 4000.0] {
                assert!(fec.UpdateParameters(&params(loss, rate, 50)));
                let d = fec.RequiredProtectionFactorD();
                let k = fec.RequiredProtectionFactorK();
                assert!(d < PLOSS_MAX as u8, "delta {} at loss {} rate {}", d, loss, rate);
                assert!(k < PLOSS_MAX as u8);
                assert!(k >= d);
                assert!(d > 0, "nonzero loss must yield protection");
            }
        }
    }

    #[test]
    fn FecZeroLossMeansZeroProtection() {
        let mut fec = ProtectionMethod::new(ProtectionMethodType::Fec);
        assert!(fec.UpdateParameters(&params(0, 500.0, 50)));
        assert_eq!(fec.RequiredProtectionFactorD(), 0);
        assert_eq!(fec.RequiredProtectionFactorK(), 0);
        assert_eq!(fec.RequiredPacketLossER(), 0);
    }

    #[test]
    fn FecEffectiveLossMonotoneInLoss() {
        // Dense sweep: the recovery table steps in whole codes as the
        // protection factor grows, which must never read as the effective or
        // residual loss improving while the channel degrades.
        for &rate in &[500.0f32, 1000.0, 2000.0, 4000.0] {
            let mut fec = ProtectionMethod::new(ProtectionMethodType::Fec);
            let mut prev_effective = 0u8;
            let mut prev_residual = 0.0f32;
            for loss in 1..=254u32 {
                fec.UpdateParameters(&params(loss, rate, 50));
                let effective = fec.RequiredPacketLossER();
                let residual = fec.ResidualPacketLossFec();
                assert!(
                    effective >= prev_effective,
                    "effective loss fell from {} to {} at loss {} rate {}",
                    prev_effective,
                    effective,
                    loss,
                    rate
                );
                assert!(
                    residual >= prev_residual,
                    "residual loss fell from {} to {} at loss {} rate {}",
                    prev_residual,
                    residual,
                    loss,
                    rate
                );
                prev_effective = effective;
                prev_residual = residual;
            }
            assert!(prev_effective > 0);
        }
    }

    #[test]
    fn NackHidesLossAtShortRtt() {
        let mut nack = ProtectionMethod::new(ProtectionMethodType::Nack);
        assert!(nack.UpdateParameters(&params(26, 500.0, 50)));
        assert_eq!(nack.RequiredPacketLossER(), 0);
        assert_eq!(nack.RequiredProtectionFactorD(), 0);
        assert!(nack.RequiredBitRate() > 0.0);
    }

    #[test]
    fn NackPassesLossThroughAtLongRtt() {
        let mut nack = ProtectionMethod::new(ProtectionMethodType::Nack);
        assert!(nack.UpdateParameters(&params(26, 500.0, 300)));
        assert_eq!(nack.RequiredPacketLossER(), 26);
    }

    #[test]
    fn NackNotRecommendedBeyondMaxRtt() {
        let mut nack = ProtectionMethod::new(ProtectionMethodType::Nack);
        assert!(!nack.UpdateParameters(&params(26, 500.0, 1200)));
    }

    #[test]
    fn HybridCollapsesToNackAtVeryShortRtt() {
        let mut hybrid = ProtectionMethod::new(ProtectionMethodType::NackFec);
        assert!(hybrid.UpdateParameters(&params(26, 500.0, 10)));
        assert_eq!(hybrid.RequiredProtectionFactorD(), 0);
        assert_eq!(hybrid.RequiredProtectionFactorK(), 0);
        assert_eq!(hybrid.RequiredPacketLossER(), 0);
    }

    #[test]
    fn HybridMatchesFecAtLongRtt() {
        let mut hybrid = ProtectionMethod::new(ProtectionMethodType::NackFec);
        let mut fec = ProtectionMethod::new(ProtectionMethodType::Fec);
        hybrid.UpdateParameters(&params(26, 500.0, 200));
        fec.UpdateParameters(&params(26, 500.0, 200));
        assert_eq!(
            hybrid.RequiredProtectionFactorD(),
            fec.RequiredProtectionFactorD()
        );
        assert_eq!(
            hybrid.RequiredProtectionFactorK(),
            fec.RequiredProtectionFactorK()
        );
    }

    #[test]
    fn HybridSoftensDeltaFactorInBlendRange() {
        let mut hybrid = ProtectionMethod::new(ProtectionMethodType::NackFec);
        let mut fec = ProtectionMethod::new(ProtectionMethodType::Fec);
        hybrid.UpdateParameters(&params(26, 500.0, 60));
        fec.UpdateParameters(&params(26, 500.0, 60));
        let d_hybrid = hybrid.RequiredProtectionFactorD();
        let d_fec = fec.RequiredProtectionFactorD();
        assert!(d_hybrid < d_fec);
        // Key frames keep the loss lower bound even when softened.
        assert!(hybrid.RequiredProtectionFactorK() >= 26);
        assert!(hybrid.RequiredProtectionFactorK() >= d_hybrid);
        assert!(hybrid.RequiredProtectionFactorK() < PLOSS_MAX as u8);
    }

    #[test]
    fn ConvertedRateIsRelativeToSourcePackets() {
        // 25% of total packets is a third of the source packets.
        assert_eq!(ConvertFECRate(64), 85);
        assert_eq!(ConvertFECRate(0), 0);
        // 50% of total equals 100% of source.
        assert_eq!(ConvertFECRate(128), 255);
    }

    #[test]
    fn MethodRegistryKeepsTypesUnique() {
        let mut logic = LossProtectionLogic::new(0);
        assert!(logic.AddMethod(ProtectionMethodType::Fec));
        assert!(!logic.AddMethod(ProtectionMethodType::Fec));
        assert!(logic.AddMethod(ProtectionMethodType::Nack));
        assert_eq!(logic.methods.len(), 2);
        assert!(logic.RemoveMethod(ProtectionMethodType::Fec));
        assert!(!logic.RemoveMethod(ProtectionMethodType::Fec));
        assert!(logic.FindMethod(ProtectionMethodType::Fec).is_none());
        assert!(logic.FindMethod(ProtectionMethodType::Nack).is_some());
    }

    #[test]
    fn SelectionPrefersFecOverNack() {
        let mut logic = LossProtectionLogic::new(0);
        logic.AddMethod(ProtectionMethodType::Nack);
        logic.AddMethod(ProtectionMethodType::Fec);
        logic.UpdateBitRate(500.0);
        logic.UpdateFrameRate(30.0);
        logic.UpdateFrameSize(704, 576);
        logic.UpdateRtt(50);
        logic.UpdateLossPr(26, 0);
        assert!(logic.UpdateMethod());
        assert_eq!(logic.SelectedType(), ProtectionMethodType::Fec);
        logic.RemoveMethod(ProtectionMethodType::Fec);
        assert!(logic.UpdateMethod());
        assert_eq!(logic.SelectedType(), ProtectionMethodType::Nack);
    }

    #[test]
    fn UpdateMethodPublishesSelectedFactors() {
        let mut logic = LossProtectionLogic::new(0);
        logic.AddMethod(ProtectionMethodType::Fec);
        logic.UpdateBitRate(500.0);
        logic.UpdateFrameRate(30.0);
        logic.UpdateFrameSize(704, 576);
        logic.UpdateRtt(50);
        logic.UpdateLossPr(26, 0);
        assert!(logic.UpdateMethod());
        let selected = logic.SelectedMethod().unwrap();
        assert!(selected.RequiredProtectionFactorD() > 0);
        assert_eq!(logic.fec_rate_delta, selected.RequiredProtectionFactorD());
        assert_eq!(logic.fec_rate_key, selected.RequiredProtectionFactorK());
    }

    #[test]
    fn LossWindowTracksMaxOverThirtySeconds() {
        let mut logic = LossProtectionLogic::new(0);
        logic.UpdateLossPr(30, 0);
        logic.UpdateLossPr(80, 1000);
        logic.UpdateLossPr(10, 2000);
        assert_eq!(logic.MaxFilteredLossPr(2000), 80);
        // The 80 sample ages out of the 30 s window, the 10 stays.
        assert_eq!(logic.MaxFilteredLossPr(31500), 10);
    }

    #[test]
    fn ShortTermMaxUpdatesWithinTheSecond() {
        let mut logic = LossProtectionLogic::new(0);
        logic.UpdateLossPr(10, 0);
        logic.UpdateLossPr(90, 200);
        logic.UpdateLossPr(40, 700);
        assert_eq!(logic.MaxFilteredLossPr(700), 90);
    }

    #[test]
    fn FilteredLossDependsOnSelectedMethod() {
        let mut logic = LossProtectionLogic::new(0);
        logic.AddMethod(ProtectionMethodType::Fec);
        logic.UpdateBitRate(500.0);
        logic.UpdateFrameRate(30.0);
        logic.UpdateFrameSize(704, 576);
        logic.UpdateLossPr(100, 0);
        logic.UpdateLossPr(5, 1000);
        logic.UpdateMethod();
        // FEC sees the burst through the windowed max.
        assert_eq!(logic.FilteredLoss(1000), 100);
        logic.RemoveMethod(ProtectionMethodType::Fec);
        logic.AddMethod(ProtectionMethodType::Nack);
        logic.UpdateRtt(50);
        logic.UpdateMethod();
        // NACK sees the exponential average, far below the burst.
        assert!(logic.FilteredLoss(1000) < 100);
    }

    #[test]
    fn ResetClearsHistoryButKeepsRegistry() {
        let mut logic = LossProtectionLogic::new(0);
        logic.AddMethod(ProtectionMethodType::NackFec);
        logic.UpdateLossPr(100, 0);
        logic.Reset(5000);
        assert_eq!(logic.MaxFilteredLossPr(5000), 0);
        assert!(logic.FindMethod(ProtectionMethodType::NackFec).is_some());
    }
}
