//! 音频基础模块
//!
//! 包含：
//! - Format: 音频格式、格式表、isochronous 包尺寸
//! - FIFO: Lock-free SPSC 样本 FIFO（模拟 PDM/PCM 接收 FIFO）
//! - Stats: 推流统计

pub mod fifo;
pub mod format;
pub mod stats;

pub use fifo::SpscFifo;
pub use format::{AudioFormat, PacketGeometry, DEFAULT_FORMAT_INDEX, SUPPORTED_FORMATS};
pub use stats::{StatsReport, StreamStats};
