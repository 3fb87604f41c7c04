mod common_types;
mod content_metrics_processing;
mod error;
mod exp_filter;
mod fec_tables;
mod frame_dropper;
mod media_opt_util;
mod media_optimization;
mod qm_select;
mod qm_select_data;

pub use common_types::*;
pub use content_metrics_processing::*;
pub use error::*;
pub use exp_filter::*;
pub use fec_tables::*;
pub use frame_dropper::*;
pub use media_opt_util::*;
pub use media_optimization::*;
pub use qm_select::*;
pub use qm_select_data::*;

pub mod rtc;
