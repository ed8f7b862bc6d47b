//! 跨上下文共享的控制状态
//!
//! 服务周期上下文（arbiter）与控制传输上下文（control surface）都不能阻塞，
//! 所以共享状态只有几个单字原子标志，每个字段每个方向只有一个写者：
//! - control surface 写 start/stop/mute/format
//! - arbiter 只在消费后清除 start-pending，并把 recording 置位
//!
//! 每个标志独占一个 cache line
//!
//! 启动帧周期先消费 start-pending、之后才置位 recording。
//! 两步之间到达的停止请求由 stop epoch 检测：每次停止都递增计数，
//! arbiter 置位 recording 后若发现计数变化则撤销

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::audio::format::{DEFAULT_FORMAT_INDEX, SUPPORTED_FORMATS};

/// 录音状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    ArmedToStart,
    Recording,
}

/// 共享控制状态
#[derive(Debug)]
pub struct SharedControlState {
    start_pending: CachePadded<AtomicBool>,
    recording: CachePadded<AtomicBool>,
    muted: CachePadded<AtomicBool>,
    format_index: CachePadded<AtomicUsize>,
    stop_epoch: CachePadded<AtomicU32>,
}

impl SharedControlState {
    pub fn new() -> Self {
        Self::with_format_index(DEFAULT_FORMAT_INDEX)
    }

    pub fn with_format_index(index: usize) -> Self {
        let index = if index < SUPPORTED_FORMATS.len() {
            index
        } else {
            DEFAULT_FORMAT_INDEX
        };

        Self {
            start_pending: CachePadded::new(AtomicBool::new(false)),
            recording: CachePadded::new(AtomicBool::new(false)),
            muted: CachePadded::new(AtomicBool::new(false)),
            format_index: CachePadded::new(AtomicUsize::new(index)),
            stop_epoch: CachePadded::new(AtomicU32::new(0)),
        }
    }

    // === control surface 写 ===

    /// 主机开始录音：下一个服务周期重新启动采集
    #[inline]
    pub fn request_start(&self) {
        self.start_pending.store(true, Ordering::Release);
    }

    /// 主机停止录音：立即生效，不等待 arbiter 确认
    #[inline]
    pub fn request_stop(&self) {
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);
        self.start_pending.store(false, Ordering::Release);
        self.recording.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    /// 调用方负责范围检查
    #[inline]
    pub fn set_format_index(&self, index: usize) {
        debug_assert!(index < SUPPORTED_FORMATS.len());
        self.format_index.store(index, Ordering::Release);
    }

    // === arbiter 写 ===

    /// 当前 stop epoch，必须在 [`take_start_request`](Self::take_start_request) 之前读取
    #[inline]
    pub fn stop_epoch(&self) -> u32 {
        self.stop_epoch.load(Ordering::Acquire)
    }

    /// 消费 start-pending 标志
    ///
    /// 返回 true 表示本周期需要重新启动采集；只有 arbiter 调用
    #[inline]
    pub fn take_start_request(&self) -> bool {
        self.start_pending.swap(false, Ordering::AcqRel)
    }

    /// 启动帧已准备好，进入 Recording
    ///
    /// `epoch` 是消费 start-pending 之前读到的 stop epoch。
    /// 期间有停止请求时撤销 recording 并返回 false。
    /// 与 `request_stop` 构成先写后读的交叉，两边都需要 SeqCst
    #[inline]
    pub fn mark_recording(&self, epoch: u32) -> bool {
        self.recording.store(true, Ordering::SeqCst);
        if self.stop_epoch.load(Ordering::SeqCst) != epoch {
            self.recording.store(false, Ordering::Release);
            return false;
        }
        true
    }

    // === 读 ===

    #[inline]
    pub fn is_start_pending(&self) -> bool {
        self.start_pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    #[inline]
    pub fn format_index(&self) -> usize {
        self.format_index.load(Ordering::Acquire)
    }

    /// 从标志推导出的录音状态
    pub fn recording_state(&self) -> RecordingState {
        if self.is_start_pending() {
            RecordingState::ArmedToStart
        } else if self.is_recording() {
            RecordingState::Recording
        } else {
            RecordingState::Idle
        }
    }
}

impl Default for SharedControlState {
    fn default() -> Self {
        Self::new()
    }
}
