/*
 *  Copyright (c) 2011 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

//! Protection tables for the XOR FEC code, shared by every protection method.
//!
//! The upstream implementation ships these as offline-simulated byte blobs.
//! Here they are regenerated once at first use from the same random-loss
//! model the simulation used, with the original indexing preserved:
//!
//! * code-rate table: 50 effective-rate indices x 129 loss points;
//! * recovery table: 300 triangular (source, fec) code pairs (codes up to
//!   24x24) x 129 loss points;
//! * NACK/FEC softness table: per-ms RTT adjustment in [0, 4096].

use lazy_static::lazy_static;

/// Loss axis of the tables: 0..=128, i.e. up to 50% in 255-fixed-point.
pub const PLOSS_MAX: usize = 129;
/// Rate axis of the code-rate table, each step is RATE_PAR kbits/frame.
pub const RATE_TABLE_STEPS: usize = 50;
pub const RATE_PAR: i32 = 5;
pub const FEC_TABLE_SIZE: usize = RATE_TABLE_STEPS * PLOSS_MAX;
/// Largest (source, fec) dimension covered by the recovery table.
pub const CODE_SIZE: usize = 24;
pub const ER_TABLE_SIZE: usize = CODE_SIZE * (CODE_SIZE + 1) / 2 * PLOSS_MAX;
/// RTT range over which hybrid NACK/FEC blends between the two modes.
pub const LOW_RTT_NACK_MS: i64 = 20;
pub const HIGH_RTT_NACK_MS: i64 = 100;

lazy_static! {
    /// FEC code rate (fraction of total packets, 255-fixed-point, < 129) by
    /// (effective rate index, loss).
    pub static ref CODE_RATE_XOR_TABLE: [u8; FEC_TABLE_SIZE] = build_code_rate_table();

    /// Average FEC recovery (same 255-fixed-point scale as the loss axis) by
    /// (triangular (source, fec) code index, loss).
    pub static ref AVG_FEC_RECOVERY_XOR: [u8; ER_TABLE_SIZE] = build_recovery_table();

    /// Hybrid NACK/FEC softness, 0 at LOW_RTT_NACK_MS rising monotonically to
    /// 4096 at HIGH_RTT_NACK_MS. Indexed by RTT in ms.
    pub static ref NACK_FEC_TABLE: [u16; HIGH_RTT_NACK_MS as usize] = build_softness_table();
}

/// Triangular index of the (source, fec) code, fec <= source <= CODE_SIZE.
/// Enumeration order matches the table layout: source-major, fec within.
pub fn recovery_code_index(fec_packets: usize, source_packets: usize) -> usize {
    debug_assert!(fec_packets >= 1 && fec_packets <= source_packets);
    debug_assert!(source_packets <= CODE_SIZE);
    source_packets * (source_packets - 1) / 2 + (fec_packets - 1)
}

fn build_code_rate_table() -> [u8; FEC_TABLE_SIZE] {
    let mut table = [0u8; FEC_TABLE_SIZE];
    for rate_index in 0..RATE_TABLE_STEPS {
        // Representative bits per frame for this index, in kbits.
        let rate_kbits_per_frame = (RATE_PAR * (rate_index as i32 + 1)) as f64;
        let packets_per_frame = 1.0 + (rate_kbits_per_frame * 1000.0 / (8.0 * 1460.0)).round();
        for loss in 0..PLOSS_MAX {
            let p = loss as f64 / 255.0;
            // More protection than the raw loss rate, backing off as the
            // packet count per frame grows and granularity improves.
            let fraction = p * (1.0 + 1.3 * (-packets_per_frame / 6.0).exp());
            let value = (255.0 * fraction).round() as u32;
            table[rate_index * PLOSS_MAX + loss] = value.min(PLOSS_MAX as u32 - 1) as u8;
        }
    }
    table
}

fn build_recovery_table() -> [u8; ER_TABLE_SIZE] {
    let mut table = [0u8; ER_TABLE_SIZE];
    for source in 1..=CODE_SIZE {
        for fec in 1..=source {
            let base = recovery_code_index(fec, source) * PLOSS_MAX;
            for loss in 0..PLOSS_MAX {
                let p = loss as f64 / 255.0;
                // A lost packet of an (n, k) erasure code is recovered iff
                // the losses among the other n - 1 packets stay within the
                // parity budget.
                let recoverable = binomial_cdf(source + fec - 1, fec - 1, p);
                table[base + loss] = (loss as f64 * recoverable).round() as u8;
            }
        }
    }
    table
}

/// P[Bin(n, p) <= k].
fn binomial_cdf(n: usize, k: usize, p: f64) -> f64 {
    let q = 1.0 - p;
    let mut term = q.powi(n as i32); // i = 0 term
    let mut sum = term;
    for i in 0..k {
        if q == 0.0 {
            break;
        }
        term *= (n - i) as f64 / (i + 1) as f64 * (p / q);
        sum += term;
    }
    sum.min(1.0)
}

fn build_softness_table() -> [u16; HIGH_RTT_NACK_MS as usize] {
    let mut table = [0u16; HIGH_RTT_NACK_MS as usize];
    for (rtt, entry) in table.iter_mut().enumerate() {
        let rtt = rtt as i64;
        if rtt > LOW_RTT_NACK_MS {
            let span = (HIGH_RTT_NACK_MS - LOW_RTT_NACK_MS) as f64;
            *entry = (4096.0 * (rtt - LOW_RTT_NACK_MS) as f64 / span).round() as u16;
        }
    }
    table
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn CodeRateMonotoneInLoss() {
        for rate_index in 0..RATE_TABLE_STEPS {
            for loss in 1..PLOSS_MAX {
                let prev = CODE_RATE_XOR_TABLE[rate_index * PLOSS_MAX + loss - 1];
                let cur = CODE_RATE_XOR_TABLE[rate_index * PLOSS_MAX + loss];
                assert!(cur >= prev);
            }
        }
    }

    #[test]
    fn CodeRateCappedAtFiftyPercent() {
        assert!(CODE_RATE_XOR_TABLE.iter().all(|&v| v < PLOSS_MAX as u8));
    }

    #[test]
    fn RecoveryNeverExceedsLoss() {
        for source in 1..=CODE_SIZE {
            for fec in 1..=source {
                let base = recovery_code_index(fec, source) * PLOSS_MAX;
                for loss in 0..PLOSS_MAX {
                    assert!(AVG_FEC_RECOVERY_XOR[base + loss] as usize <= loss);
                }
            }
        }
    }

    #[test]
    fn MoreParityRecoversMore() {
        // Fixed source packet count, growing parity: recovery at 20% loss
        // must not decrease.
        let loss = 51;
        let mut prev = 0;
        for fec in 1..=8 {
            let v = AVG_FEC_RECOVERY_XOR[recovery_code_index(fec, 8) * PLOSS_MAX + loss];
            assert!(v >= prev);
            prev = v;
        }
    }

    #[test]
    fn SoftnessRampsOverRttRange() {
        assert_eq!(NACK_FEC_TABLE[0], 0);
        assert_eq!(NACK_FEC_TABLE[LOW_RTT_NACK_MS as usize], 0);
        for rtt in LOW_RTT_NACK_MS as usize + 1..HIGH_RTT_NACK_MS as usize {
            assert!(NACK_FEC_TABLE[rtt] >= NACK_FEC_TABLE[rtt - 1]);
        }
        assert_eq!(NACK_FEC_TABLE[HIGH_RTT_NACK_MS as usize - 1], 4045);
    }

    #[test]
    fn TriangularIndexCoversTableExactly()
    {
        let mut seen = 0;
        for source in 1..=CODE_SIZE {
            for fec in 1..=source {
                assert_eq!(recovery_code_index(fec, source), seen);
                seen += 1;
            }
        }
        assert_eq!(seen * PLOSS_MAX, ER_TABLE_SIZE);
    }
}
