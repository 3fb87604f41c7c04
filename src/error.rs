/*
 *  Copyright (c) 2011 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

/// Errors surfaced at the public boundary. Internal helpers are total over
/// their declared domains; all validation happens before state is mutated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MediaOptError {
    #[error("used before SetEncodingData")]
    Uninitialized,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}
