//! 模拟 PDM/PCM 麦克风前端
//!
//! `SimulatedPdm` 是消费者端（交给 arbiter），`PdmFeeder` 是生产者端（抽取器）
//! 两者通过 lock-free FIFO 连接，启停状态通过原子标志共享

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;

use super::{CaptureError, CaptureSource};
use crate::audio::format::SUPPORTED_FORMATS;
use crate::audio::{AudioFormat, SpscFifo};

/// 硬件 FIFO 默认深度（word）
pub const DEFAULT_FIFO_DEPTH: usize = 256;

/// 测试音频率
const TONE_HZ: f32 = 1000.0;

/// 采集源计数器
///
/// 用于观察 arbiter 与硬件的交互次数
#[derive(Debug, Default)]
pub struct CaptureCounters {
    pub clears: AtomicU64,
    pub starts: AtomicU64,
    pub stops: AtomicU64,
    pub reads: AtomicU64,
    pub words_read: AtomicU64,
    pub words_fed: AtomicU64,
    pub overflow_words: AtomicU64,
}

impl CaptureCounters {
    pub fn clears(&self) -> u64 {
        self.clears.load(Ordering::Relaxed)
    }

    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn overflow_words(&self) -> u64 {
        self.overflow_words.load(Ordering::Relaxed)
    }
}

/// 模拟 PDM/PCM 外设（消费者端）
pub struct SimulatedPdm {
    fifo: Arc<SpscFifo<u16>>,
    enabled: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    format: Option<AudioFormat>,
}

impl SimulatedPdm {
    /// 创建采集源和配对的生产者
    pub fn new(fifo_depth: usize) -> (Self, PdmFeeder) {
        let fifo = Arc::new(SpscFifo::with_min_depth(fifo_depth));
        let enabled = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(CaptureCounters::default());

        let feeder = PdmFeeder {
            fifo: Arc::clone(&fifo),
            enabled: Arc::clone(&enabled),
            counters: Arc::clone(&counters),
            channels: 2,
            phase: 0.0,
            phase_step: 0.0,
            scratch: Vec::new(),
        };

        let pdm = Self {
            fifo,
            enabled,
            counters,
            format: None,
        };

        (pdm, feeder)
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        Arc::clone(&self.counters)
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    pub fn is_running(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn is_supported(format: &AudioFormat) -> bool {
        // PDM/PCM word length 固定 16-bit，单声道或立体声
        format.bits_per_sample == 16
            && matches!(format.channels, 1 | 2)
            && SUPPORTED_FORMATS
                .iter()
                .any(|f| f.sample_rate == format.sample_rate)
    }
}

impl CaptureSource for SimulatedPdm {
    fn configure(&mut self, format: &AudioFormat) -> Result<(), CaptureError> {
        if !Self::is_supported(format) {
            return Err(CaptureError::UnsupportedFormat(*format));
        }
        if self.format != Some(*format) {
            log::info!(
                "PDM/PCM configured: {} (decimation {})",
                format,
                crate::audio::format::PDM_DECIMATION_RATE
            );
            self.format = Some(*format);
        }
        Ok(())
    }

    fn start(&mut self) {
        if self.format.is_none() {
            log::warn!("PDM/PCM start ignored: not configured");
            return;
        }
        self.counters.starts.fetch_add(1, Ordering::Relaxed);
        self.enabled.store(true, Ordering::Release);
    }

    fn stop(&mut self) {
        self.counters.stops.fetch_add(1, Ordering::Relaxed);
        self.enabled.store(false, Ordering::Release);
    }

    fn clear(&mut self) {
        self.counters.clears.fetch_add(1, Ordering::Relaxed);
        self.fifo.discard();
    }

    #[inline]
    fn fifo_level(&self) -> usize {
        self.fifo.level()
    }

    #[inline]
    fn read(&mut self, dest: &mut [u16], want_words: usize) -> usize {
        let want = want_words.min(dest.len());
        let got = self.fifo.pop_into(&mut dest[..want]);

        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .words_read
            .fetch_add(got as u64, Ordering::Relaxed);
        got
    }
}

/// 模拟 PDM 抽取器（生产者端）
///
/// 只在采集源已启动时向 FIFO 推入样本，生成立体声 1kHz 测试音
pub struct PdmFeeder {
    fifo: Arc<SpscFifo<u16>>,
    enabled: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    channels: usize,
    phase: f32,
    phase_step: f32,
    scratch: Vec<u16>,
}

impl PdmFeeder {
    /// 设置生成音频的格式
    pub fn set_format(&mut self, format: &AudioFormat) {
        self.channels = (format.channels as usize).max(1);
        self.phase_step = 2.0 * std::f32::consts::PI * TONE_HZ / format.sample_rate as f32;
    }

    /// 推入 `words` 个测试音样本
    ///
    /// 采集源未启动时不推入任何数据，返回实际进入 FIFO 的 word 数
    pub fn feed(&mut self, words: usize) -> usize {
        if !self.enabled.load(Ordering::Acquire) {
            return 0;
        }

        self.scratch.clear();
        while self.scratch.len() < words {
            let value = (self.phase.sin() * 16384.0) as i16;
            self.phase = (self.phase + self.phase_step) % (2.0 * std::f32::consts::PI);
            for _ in 0..self.channels {
                if self.scratch.len() == words {
                    break;
                }
                // 写入 FIFO 的是原始 PCM 位模式
                self.scratch.push(value as u16);
            }
        }

        self.push_words_internal(words)
    }

    /// 直接推入指定样本（测试用），同样受启停状态约束
    pub fn push_words(&mut self, words: &[u16]) -> usize {
        if !self.enabled.load(Ordering::Acquire) {
            return 0;
        }
        self.scratch.clear();
        self.scratch.extend_from_slice(words);
        self.push_words_internal(words.len())
    }

    fn push_words_internal(&mut self, words: usize) -> usize {
        let pushed = self.fifo.push(&self.scratch);
        self.counters
            .words_fed
            .fetch_add(pushed as u64, Ordering::Relaxed);
        if pushed < words {
            self.counters
                .overflow_words
                .fetch_add((words - pushed) as u64, Ordering::Relaxed);
        }
        pushed
    }

    #[inline]
    pub fn fifo_level(&self) -> usize {
        self.fifo.level()
    }
}

/// 抽取器线程配置
#[derive(Clone, Debug)]
pub struct FeederConfig {
    pub format: AudioFormat,
    /// 每毫秒样本数的随机抖动（word，±）
    pub jitter_words: usize,
}

/// 启动抽取器线程
///
/// 按实际流逝时间计算应产出的样本数，每毫秒推入一次，
/// 并叠加 ±`jitter_words` 的随机抖动模拟硬件时钟漂移
pub fn spawn_feeder(
    mut feeder: PdmFeeder,
    config: FeederConfig,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    feeder.set_format(&config.format);

    thread::Builder::new()
        .name("pdm-feeder".to_string())
        .spawn(move || {
            let mut rng = rand::thread_rng();
            let words_per_sec =
                config.format.sample_rate as u64 * config.format.channels as u64;
            let jitter = config.jitter_words as i64;

            let mut epoch = Instant::now();
            let mut produced: u64 = 0;
            let mut was_enabled = false;

            log::info!(
                "PDM feeder started: {} ({} words/ms, jitter ±{})",
                config.format,
                config.format.words_per_ms(),
                config.jitter_words
            );

            while running.load(Ordering::Acquire) {
                let enabled = feeder.enabled.load(Ordering::Acquire);
                if enabled && !was_enabled {
                    // 重新启动时从当前时刻开始计数
                    epoch = Instant::now();
                    produced = 0;
                }
                was_enabled = enabled;

                if enabled {
                    let elapsed_us = epoch.elapsed().as_micros() as u64;
                    let due = elapsed_us * words_per_sec / 1_000_000;
                    let mut words = due.saturating_sub(produced) as i64;
                    if jitter > 0 && words > 0 {
                        words = (words + rng.gen_range(-jitter..=jitter)).max(0);
                    }
                    // 按帧对齐，保持声道交织
                    let channels = config.format.channels.max(1) as i64;
                    words -= words % channels;

                    feeder.feed(words as usize);
                    produced += words as u64;
                }

                thread::sleep(Duration::from_millis(1));
            }

            log::info!("PDM feeder finished");
        })
}
