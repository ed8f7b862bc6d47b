//! 音频子系统时钟
//!
//! 采集开始前必须按采样率把 PLL 设置到对应频率（见 [`audio_clock_hz`]）

use std::sync::atomic::{AtomicU32, Ordering};

pub use crate::audio::format::audio_clock_hz;

/// 时钟配置错误
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("PLL rejected frequency {hz} Hz")]
    FrequencyRejected { hz: u32 },
}

/// 时钟配置契约
pub trait AudioClock {
    /// 为给定采样率设置音频子系统时钟，返回实际频率
    fn apply_sample_rate_clock(&mut self, sample_rate: u32) -> Result<u32, ClockError>;
}

/// 模拟 PLL
///
/// 可以配置为拒绝所有频率，用于验证启动失败路径
#[derive(Debug, Default)]
pub struct SimulatedClock {
    frequency_hz: AtomicU32,
    reject: bool,
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 拒绝所有频率设置的时钟
    pub fn failing() -> Self {
        Self {
            frequency_hz: AtomicU32::new(0),
            reject: true,
        }
    }

    /// 当前频率，0 表示尚未配置
    pub fn frequency_hz(&self) -> u32 {
        self.frequency_hz.load(Ordering::Acquire)
    }
}

impl AudioClock for SimulatedClock {
    fn apply_sample_rate_clock(&mut self, sample_rate: u32) -> Result<u32, ClockError> {
        let hz = audio_clock_hz(sample_rate);
        if self.reject {
            return Err(ClockError::FrequencyRejected { hz });
        }

        self.frequency_hz.store(hz, Ordering::Release);
        log::info!("Audio clock set to {} Hz for {} Hz sampling", hz, sample_rate);
        Ok(hz)
    }
}
