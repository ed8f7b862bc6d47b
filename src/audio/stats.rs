//! 推流统计模块
//!
//! 在服务周期回调中收集统计信息，FIFO 水位采用降频采样减少开销

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 水位采样间隔：每 N 个服务周期采样一次
const LEVEL_SAMPLE_INTERVAL: u64 = 16;

/// 水位采样缓冲区大小
const LEVEL_BUFFER_SIZE: usize = 256;

/// 推流统计收集器
///
/// 所有操作都是 lock-free 的，可以在服务周期回调中使用
pub struct StreamStats {
    tick_count: AtomicU64,
    idle_ticks: AtomicU64,
    priming_frames: AtomicU64,
    muted_frames: AtomicU64,
    // 录音中切换格式的次数（采集源不跟随，FIFO 会欠载或溢出）
    live_format_changes: AtomicU64,

    // 低于标称长度的包（FIFO 欠载）
    short_packets: AtomicU64,
    // 读满容量的包（消化积压）
    long_packets: AtomicU64,

    words_delivered: AtomicU64,

    // 水位（降频采样）
    level_buffer: Box<[AtomicUsize; LEVEL_BUFFER_SIZE]>,
    level_write_idx: AtomicUsize,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            tick_count: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            priming_frames: AtomicU64::new(0),
            muted_frames: AtomicU64::new(0),
            live_format_changes: AtomicU64::new(0),
            short_packets: AtomicU64::new(0),
            long_packets: AtomicU64::new(0),
            words_delivered: AtomicU64::new(0),
            level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            level_write_idx: AtomicUsize::new(0),
        }
    }

    /// 每个服务周期开始时调用
    #[inline]
    pub fn on_tick(&self) -> u64 {
        self.tick_count.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_idle(&self) {
        self.idle_ticks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_priming(&self) {
        self.priming_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_live_format_change(&self) {
        self.live_format_changes.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次 Recording 周期的读取结果
    ///
    /// `tick` 为 `on_tick` 的返回值，只在采样点才记录水位
    #[inline]
    pub fn record_packet(
        &self,
        tick: u64,
        fifo_level: usize,
        words: usize,
        nominal_words: usize,
        muted: bool,
    ) {
        if words < nominal_words {
            self.short_packets.fetch_add(1, Ordering::Relaxed);
        } else if words > nominal_words {
            self.long_packets.fetch_add(1, Ordering::Relaxed);
        }
        if muted {
            self.muted_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.words_delivered.fetch_add(words as u64, Ordering::Relaxed);

        if tick % LEVEL_SAMPLE_INTERVAL == 0 {
            let idx = self.level_write_idx.fetch_add(1, Ordering::Relaxed) % LEVEL_BUFFER_SIZE;
            // +1 区分「未采样」和「水位为 0」
            self.level_buffer[idx].store(fifo_level + 1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn priming_frames(&self) -> u64 {
        self.priming_frames.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn muted_frames(&self) -> u64 {
        self.muted_frames.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn live_format_changes(&self) -> u64 {
        self.live_format_changes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn short_packets(&self) -> u64 {
        self.short_packets.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn words_delivered(&self) -> u64 {
        self.words_delivered.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, bytes_per_word: usize) -> StatsReport {
        let levels: Vec<usize> = self
            .level_buffer
            .iter()
            .map(|l| l.load(Ordering::Relaxed))
            .filter(|&l| l > 0)
            .map(|l| l - 1)
            .collect();

        let level_stats = FifoLevelStats {
            min: levels.iter().copied().min().unwrap_or(0),
            max: levels.iter().copied().max().unwrap_or(0),
            samples: levels.len(),
        };

        let words = self.words_delivered.load(Ordering::Relaxed);

        StatsReport {
            tick_count: self.tick_count.load(Ordering::Relaxed),
            idle_ticks: self.idle_ticks.load(Ordering::Relaxed),
            priming_frames: self.priming_frames.load(Ordering::Relaxed),
            muted_frames: self.muted_frames.load(Ordering::Relaxed),
            live_format_changes: self.live_format_changes.load(Ordering::Relaxed),
            short_packets: self.short_packets.load(Ordering::Relaxed),
            long_packets: self.long_packets.load(Ordering::Relaxed),
            words_delivered: words,
            bytes_delivered: words * bytes_per_word as u64,
            level_sample_interval: LEVEL_SAMPLE_INTERVAL,
            level_stats,
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.tick_count.store(0, Ordering::Relaxed);
        self.idle_ticks.store(0, Ordering::Relaxed);
        self.priming_frames.store(0, Ordering::Relaxed);
        self.muted_frames.store(0, Ordering::Relaxed);
        self.live_format_changes.store(0, Ordering::Relaxed);
        self.short_packets.store(0, Ordering::Relaxed);
        self.long_packets.store(0, Ordering::Relaxed);
        self.words_delivered.store(0, Ordering::Relaxed);
        self.level_write_idx.store(0, Ordering::Relaxed);

        for level in self.level_buffer.iter() {
            level.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub tick_count: u64,
    pub idle_ticks: u64,
    pub priming_frames: u64,
    pub muted_frames: u64,
    pub live_format_changes: u64,
    pub short_packets: u64,
    pub long_packets: u64,
    pub words_delivered: u64,
    pub bytes_delivered: u64,
    pub level_sample_interval: u64,
    pub level_stats: FifoLevelStats,
}

#[derive(Debug)]
pub struct FifoLevelStats {
    pub min: usize,
    pub max: usize,
    pub samples: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Streaming Statistics")?;
        writeln!(f, "====================")?;
        writeln!(f, "Service ticks: {}", self.tick_count)?;
        writeln!(f, "  Idle (silent): {}", self.idle_ticks)?;
        writeln!(f, "  Priming frames: {}", self.priming_frames)?;
        writeln!(f, "  Muted frames: {}", self.muted_frames)?;
        if self.live_format_changes > 0 {
            writeln!(
                f,
                "  Format changes while recording: {}",
                self.live_format_changes
            )?;
        }
        writeln!(f)?;

        writeln!(f, "Drift compensation:")?;
        writeln!(f, "  Short packets (under-run): {}", self.short_packets)?;
        writeln!(f, "  Long packets (catch-up): {}", self.long_packets)?;
        writeln!(f)?;

        writeln!(
            f,
            "FIFO Level (every {} ticks, {} samples):",
            self.level_sample_interval, self.level_stats.samples
        )?;
        writeln!(f, "  Min: {} words", self.level_stats.min)?;
        writeln!(f, "  Max: {} words", self.level_stats.max)?;
        writeln!(f)?;

        writeln!(
            f,
            "Delivered: {} words ({} bytes)",
            self.words_delivered, self.bytes_delivered
        )?;

        Ok(())
    }
}
