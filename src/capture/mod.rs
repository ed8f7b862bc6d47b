//! 采集源适配层
//!
//! Streaming arbiter 只通过 [`CaptureSource`] 访问硬件：
//! 配置、启动、停止、清空 FIFO、非阻塞读取

pub mod pdm;

pub use pdm::{spawn_feeder, CaptureCounters, FeederConfig, PdmFeeder, SimulatedPdm};

use crate::audio::AudioFormat;

/// 采集源错误
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// 硬件不支持该格式
    #[error("unsupported capture format: {0}")]
    UnsupportedFormat(AudioFormat),
}

/// 采集源（PDM/PCM 外设）契约
///
/// 除 `configure` 外所有操作都可以在服务周期回调内调用：
/// 不阻塞、不分配、不等待更多数据
pub trait CaptureSource {
    /// 配置采集格式，不支持时返回错误；重复配置同一格式无副作用
    fn configure(&mut self, format: &AudioFormat) -> Result<(), CaptureError>;

    /// 开始采集，调用前必须先 `clear`
    fn start(&mut self);

    /// 停止采集，FIFO 中残留的数据不再有意义
    fn stop(&mut self);

    /// 丢弃 FIFO 中所有未读数据
    fn clear(&mut self);

    /// FIFO 当前水位（word）
    fn fifo_level(&self) -> usize;

    /// 非阻塞读取
    ///
    /// 返回 `min(want_words, dest.len(), 当前水位)`，并把这么多 word 拷贝到 `dest`
    fn read(&mut self, dest: &mut [u16], want_words: usize) -> usize;
}
