//! 运行配置

use crate::audio::format::{DEFAULT_FORMAT_INDEX, DEFAULT_SERVICE_INTERVAL_MS};
use crate::capture::pdm::DEFAULT_FIFO_DEPTH;
use crate::control::DEFAULT_FEATURE_UNIT_ID;

/// 流配置
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// 初始格式索引（`SUPPORTED_FORMATS` 下标）
    pub format_index: usize,
    /// 服务周期（毫秒）
    pub interval_ms: u32,
    /// supervisor 轮询间隔（毫秒）
    pub supervisor_slice_ms: u64,
    /// 等待主机完成枚举的最长时间（毫秒）
    pub enumeration_timeout_ms: u64,
    /// 采集 FIFO 深度（word，会被向上取整到 2 的幂）
    pub fifo_depth: usize,
    /// 模拟时钟漂移：每毫秒 ±N word
    pub jitter_words: usize,
    pub feature_unit_id: u8,
    /// 是否 mlock 样本缓冲区
    pub lock_memory: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format_index: DEFAULT_FORMAT_INDEX,
            interval_ms: DEFAULT_SERVICE_INTERVAL_MS,
            supervisor_slice_ms: 50,
            enumeration_timeout_ms: 5_000,
            fifo_depth: DEFAULT_FIFO_DEPTH,
            jitter_words: 0,
            feature_unit_id: DEFAULT_FEATURE_UNIT_ID,
            lock_memory: true,
        }
    }
}
