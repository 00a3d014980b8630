//! Shared pieces of the SRT command-line tools.

pub mod config;
pub mod stats;

pub use config::{ToolConfig, TransferOptions};
pub use stats::{display_stats, format_bandwidth, format_bytes};
