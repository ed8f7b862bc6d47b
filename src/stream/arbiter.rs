//! Streaming arbiter
//!
//! 每个服务周期调用一次 [`StreamingArbiter::tick`]，立即返回下一个要发送的包。
//! 核心设计：ping/pong 双缓冲 + 共享原子标志，没有锁、没有阻塞、没有分配
//!
//! 状态机：
//! - Idle: 返回标称长度的静音帧，不碰硬件
//! - ArmedToStart: 清空 FIFO、启动采集、交出清零的启动帧（标称长度）
//! - Recording: 切换写缓冲区、按水位决定读取量、读取、必要时替换为静音帧

use std::sync::Arc;

use super::buffer::{words_as_bytes, BufferTag, SampleBuffer};
use super::shared::{RecordingState, SharedControlState};
use crate::audio::format::{max_capacity_words, PacketGeometry, SUPPORTED_FORMATS};
use crate::audio::{AudioFormat, StreamStats, DEFAULT_FORMAT_INDEX};
use crate::capture::CaptureSource;

/// 包的数据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// 常量全零帧（Idle 或静音）
    Silence,
    /// ping/pong 缓冲区之一
    Buffer(BufferTag),
}

/// 交给传输层的包
///
/// 借用自 arbiter：在下一次 `tick` 之前传输层只能读取它
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    words: &'a [u16],
    source: FrameSource,
}

impl<'a> Packet<'a> {
    #[inline]
    pub fn words(&self) -> &'a [u16] {
        self.words
    }

    /// 线上字节
    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        words_as_bytes(self.words)
    }

    /// 包长（字节）
    #[inline]
    pub fn len(&self) -> usize {
        std::mem::size_of_val(self.words)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[inline]
    pub fn source(&self) -> FrameSource {
        self.source
    }

    pub fn is_silent(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }
}

/// Streaming arbiter
///
/// 独占两块样本缓冲区和采集源；传输上下文每个服务周期调用一次 `tick`
pub struct StreamingArbiter<C: CaptureSource> {
    capture: C,
    shared: Arc<SharedControlState>,
    stats: Arc<StreamStats>,

    buffers: [SampleBuffer; 2],
    silent_frame: SampleBuffer,
    write_target: BufferTag,

    /// 格式表中每个格式对应的包尺寸
    geometries: Vec<PacketGeometry>,

    /// 上一个周期观察到的状态
    state: RecordingState,
    capture_running: bool,
    /// 上一个周期使用的格式索引
    format_index: usize,
}

impl<C: CaptureSource> StreamingArbiter<C> {
    /// 创建 arbiter，缓冲区按格式表中最大的包尺寸分配
    pub fn new(capture: C, shared: Arc<SharedControlState>, interval_ms: u32) -> Self {
        let geometries = SUPPORTED_FORMATS
            .iter()
            .map(|f| PacketGeometry::for_format(f, interval_ms))
            .collect();

        Self::with_geometries(capture, shared, geometries, max_capacity_words(interval_ms))
    }

    /// 使用显式包尺寸创建（每个格式索引一个）
    pub fn with_geometries(
        capture: C,
        shared: Arc<SharedControlState>,
        geometries: Vec<PacketGeometry>,
        capacity_words: usize,
    ) -> Self {
        assert!(!geometries.is_empty(), "at least one packet geometry required");
        assert!(
            geometries.iter().all(|g| g.capacity_words() <= capacity_words),
            "packet geometry exceeds buffer capacity"
        );

        log::debug!(
            "Streaming arbiter: {} formats, buffer capacity {} words",
            geometries.len(),
            capacity_words
        );

        Self {
            capture,
            stats: Arc::new(StreamStats::new()),
            buffers: [
                SampleBuffer::zeroed(capacity_words),
                SampleBuffer::zeroed(capacity_words),
            ],
            silent_frame: SampleBuffer::zeroed(capacity_words),
            write_target: BufferTag::A,
            geometries,
            format_index: shared.format_index(),
            shared,
            state: RecordingState::Idle,
            capture_running: false,
        }
    }

    /// 锁定三块缓冲区的内存
    pub fn lock_memory(&mut self) -> bool {
        let a = self.buffers[0].lock_memory();
        let b = self.buffers[1].lock_memory();
        let s = self.silent_frame.lock_memory();
        a && b && s
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    pub fn shared(&self) -> &Arc<SharedControlState> {
        &self.shared
    }

    pub fn capture(&self) -> &C {
        &self.capture
    }

    pub fn capture_mut(&mut self) -> &mut C {
        &mut self.capture
    }

    /// 上一个周期结束时的状态
    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// 下一个 Recording 周期之前最后写入的缓冲区
    pub fn write_target(&self) -> BufferTag {
        self.write_target
    }

    /// 当前格式对应的包尺寸
    pub fn geometry(&self) -> PacketGeometry {
        self.geometry_at(self.shared.format_index())
    }

    pub fn active_format(&self) -> AudioFormat {
        SUPPORTED_FORMATS
            .get(self.shared.format_index())
            .copied()
            .unwrap_or_default()
    }

    fn geometry_at(&self, index: usize) -> PacketGeometry {
        self.geometries
            .get(index)
            .or_else(|| self.geometries.get(DEFAULT_FORMAT_INDEX))
            .copied()
            .unwrap_or(self.geometries[0])
    }

    /// 服务周期回调
    ///
    /// 有界时间内返回，从不阻塞；返回的包在下一次调用前保持有效
    pub fn tick(&mut self) -> Packet<'_> {
        let tick = self.stats.on_tick();
        let format_index = self.shared.format_index();
        if format_index != self.format_index {
            self.on_format_change(format_index);
        }
        let geometry = self.geometry_at(format_index);

        // 必须先于消费 start-pending 读取
        let stop_epoch = self.shared.stop_epoch();
        if self.shared.take_start_request() {
            return self.prime(geometry, stop_epoch);
        }

        if !self.shared.is_recording() {
            return self.idle(geometry);
        }

        // === Recording ===

        // 1. 切换写缓冲区：上一周期交出的缓冲区此时仍被传输层读取
        self.write_target = self.write_target.other();

        // 2. 漂移补偿：根据 FIFO 水位决定读取量
        let fifo_level = self.capture.fifo_level();
        let want = geometry.request_words(fifo_level);

        // 3. 读取到新的写缓冲区
        let idx = self.write_target.index();
        let got = self.capture.read(&mut self.buffers[idx], want);
        debug_assert!(got <= geometry.capacity_words());

        // 4. 静音：替换为同长度的全零帧，采集照常进行
        let muted = self.shared.is_muted();
        self.stats
            .record_packet(tick, fifo_level, got, geometry.nominal_words(), muted);

        // 5. 包长 = 读取的 word 数 × word 字节数
        if muted {
            Packet {
                words: &self.silent_frame[..got],
                source: FrameSource::Silence,
            }
        } else {
            Packet {
                words: &self.buffers[idx][..got],
                source: FrameSource::Buffer(self.write_target),
            }
        }
    }

    /// ArmedToStart：重新启动采集并交出启动帧
    fn prime(&mut self, geometry: PacketGeometry, stop_epoch: u32) -> Packet<'_> {
        // 清空上一次会话残留的 FIFO 数据
        self.capture.clear();
        self.capture.start();
        self.capture_running = true;

        if !self.shared.mark_recording(stop_epoch) {
            // 本周期内主机已经停止
            log::info!("Recording start cancelled by stop");
            return self.idle(geometry);
        }

        // 录音中重新启动时，上一周期交出的缓冲区可能仍在传输
        self.write_target = if self.state == RecordingState::Recording {
            self.write_target.other()
        } else {
            BufferTag::A
        };
        let idx = self.write_target.index();
        self.buffers[idx].clear();

        if self.state != RecordingState::Recording {
            log::info!("Recording started ({})", self.active_format());
        } else {
            log::info!("Recording restarted ({})", self.active_format());
        }
        self.state = RecordingState::Recording;
        self.stats.record_priming();

        // 还没有采集到样本，按标称长度发送
        Packet {
            words: &self.buffers[idx][..geometry.nominal_words()],
            source: FrameSource::Buffer(self.write_target),
        }
    }

    /// 采集源和时钟仍按旧采样率运行，只有包尺寸跟随新格式
    fn on_format_change(&mut self, format_index: usize) {
        let from = SUPPORTED_FORMATS.get(self.format_index).copied().unwrap_or_default();
        let to = SUPPORTED_FORMATS.get(format_index).copied().unwrap_or_default();
        if self.shared.is_recording() {
            log::warn!(
                "Format changed while recording: {} → {}, capture keeps its rate",
                from,
                to
            );
            self.stats.record_live_format_change();
        } else {
            log::info!("Format changed: {} → {}", from, to);
        }
        self.format_index = format_index;
    }

    /// Idle：标称长度静音帧
    fn idle(&mut self, geometry: PacketGeometry) -> Packet<'_> {
        if self.capture_running {
            // 主机停止（或 supervisor 兜底停止）后第一个周期
            self.capture.stop();
            self.capture_running = false;
            log::info!("Recording stopped");
        }
        self.state = RecordingState::Idle;
        self.stats.record_idle();

        Packet {
            words: &self.silent_frame[..geometry.nominal_words()],
            source: FrameSource::Silence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSource as _, PdmFeeder, SimulatedPdm};

    const CAPACITY: usize = 88;
    const SLACK: usize = 2;

    /// 容量 88 words、余量 2 words 的单格式 arbiter
    fn arbiter() -> (StreamingArbiter<SimulatedPdm>, PdmFeeder, Arc<SharedControlState>) {
        let (mut pdm, mut feeder) = SimulatedPdm::new(1024);
        let format = AudioFormat::default();
        pdm.configure(&format).unwrap();
        feeder.set_format(&format);

        let shared = Arc::new(SharedControlState::with_format_index(0));
        let geometry = PacketGeometry::new(CAPACITY, SLACK, 2);
        let arbiter =
            StreamingArbiter::with_geometries(pdm, Arc::clone(&shared), vec![geometry], CAPACITY);
        (arbiter, feeder, shared)
    }

    fn started() -> (StreamingArbiter<SimulatedPdm>, PdmFeeder, Arc<SharedControlState>) {
        let (mut arbiter, feeder, shared) = arbiter();
        shared.request_start();
        arbiter.tick();
        (arbiter, feeder, shared)
    }

    #[test]
    fn test_idle_returns_nominal_silence_without_hardware() {
        let (mut arbiter, _feeder, _shared) = arbiter();
        let counters = arbiter.capture().counters();

        for _ in 0..5 {
            let packet = arbiter.tick();
            assert_eq!(packet.source(), FrameSource::Silence);
            assert_eq!(packet.len(), (CAPACITY - SLACK) * 2);
            assert!(packet.is_silent());
        }

        assert_eq!(counters.reads(), 0);
        assert_eq!(counters.starts(), 0);
        assert_eq!(counters.clears(), 0);
        assert_eq!(arbiter.state(), RecordingState::Idle);
    }

    #[test]
    fn test_start_primes_exactly_once() {
        let (mut arbiter, mut feeder, shared) = arbiter();
        let counters = arbiter.capture().counters();

        shared.request_start();
        let packet = arbiter.tick();
        assert_eq!(packet.source(), FrameSource::Buffer(BufferTag::A));
        assert_eq!(packet.len(), (CAPACITY - SLACK) * 2);
        assert!(packet.is_silent());

        assert_eq!(arbiter.state(), RecordingState::Recording);
        assert!(shared.is_recording());
        assert!(!shared.is_start_pending());
        assert_eq!(counters.clears(), 1);
        assert_eq!(counters.starts(), 1);

        // 之后的周期不再清空/启动
        for _ in 0..10 {
            feeder.feed(88);
            arbiter.tick();
        }
        assert_eq!(counters.clears(), 1);
        assert_eq!(counters.starts(), 1);
    }

    #[test]
    fn test_buffers_alternate() {
        let (mut arbiter, mut feeder, _shared) = started();

        // 启动帧来自 A
        let mut last = FrameSource::Buffer(BufferTag::A);
        for _ in 0..20 {
            feeder.feed(88);
            let source = arbiter.tick().source();
            // 本周期写入的缓冲区不是上一周期交出的缓冲区
            assert_ne!(source, last);
            let next_write = arbiter.write_target().other();
            assert_ne!(FrameSource::Buffer(next_write), source);
            last = source;
        }
    }

    #[test]
    fn test_drift_policy_scenario() {
        let (mut arbiter, mut feeder, shared) = started();

        // 水位 90 → 截断到容量 88
        feeder.feed(90);
        let packet = arbiter.tick();
        assert_eq!(packet.words().len(), 88);
        assert_eq!(packet.len(), 176);
        assert!(!packet.is_silent());
        assert_eq!(arbiter.capture().fifo_level(), 2);

        // 清空剩余
        let mut sink = [0u16; 8];
        arbiter.capture_mut().read(&mut sink, 8);

        // 水位 60 → 请求 86，实际只拿到 60
        feeder.feed(60);
        let packet = arbiter.tick();
        assert_eq!(packet.words().len(), 60);
        assert_eq!(packet.len(), 120);

        // 静音：同样长度的全零帧
        shared.set_muted(true);
        feeder.feed(90);
        let packet = arbiter.tick();
        assert_eq!(packet.source(), FrameSource::Silence);
        assert_eq!(packet.len(), 88 * 2);
        assert!(packet.is_silent());

        feeder.feed(58);
        let packet = arbiter.tick();
        assert_eq!(packet.len(), 60 * 2);
        assert!(packet.is_silent());
    }

    #[test]
    fn test_level_equal_to_capacity_reads_full() {
        let (mut arbiter, mut feeder, _shared) = started();

        feeder.feed(CAPACITY);
        assert_eq!(arbiter.tick().words().len(), CAPACITY);
        assert_eq!(arbiter.capture().fifo_level(), 0);
    }

    #[test]
    fn test_level_below_reduced_request() {
        let (mut arbiter, mut feeder, _shared) = started();

        let reduced = CAPACITY - SLACK;
        feeder.feed(reduced - 1);
        assert_eq!(arbiter.tick().words().len(), reduced - 1);

        // 水位稍高于 reduced 但低于容量：只读 reduced
        feeder.feed(reduced + 1);
        assert_eq!(arbiter.tick().words().len(), reduced);
        assert_eq!(arbiter.capture().fifo_level(), 1);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let (mut arbiter, mut feeder, _shared) = started();

        for level in [0usize, 1, 50, 86, 87, 88, 89, 200, 500] {
            arbiter.capture_mut().clear();
            feeder.feed(level);
            let got = arbiter.tick().words().len();
            assert!(got <= CAPACITY, "level {} read {}", level, got);
        }
    }

    #[test]
    fn test_mute_keeps_draining_fifo() {
        let run = |muted: bool| {
            let (mut arbiter, mut feeder, shared) = started();
            shared.set_muted(muted);
            for _ in 0..8 {
                feeder.feed(88);
                let packet = arbiter.tick();
                assert_eq!(packet.is_silent(), muted);
            }
            arbiter.capture().fifo_level()
        };

        let muted_level = run(true);
        let unmuted_level = run(false);
        assert!(muted_level <= unmuted_level);
    }

    #[test]
    fn test_stop_returns_to_idle_within_one_tick() {
        let (mut arbiter, mut feeder, shared) = started();
        let counters = arbiter.capture().counters();

        feeder.feed(88);
        arbiter.tick();

        shared.request_stop();
        let packet = arbiter.tick();
        assert_eq!(packet.source(), FrameSource::Silence);
        assert_eq!(packet.len(), (CAPACITY - SLACK) * 2);
        assert_eq!(arbiter.state(), RecordingState::Idle);
        assert_eq!(counters.stops(), 1);

        // 后续 Idle 周期不再读硬件
        let reads = counters.reads();
        arbiter.tick();
        arbiter.tick();
        assert_eq!(counters.reads(), reads);
        assert_eq!(counters.stops(), 1);
    }

    #[test]
    fn test_restart_while_recording_reprimes() {
        let (mut arbiter, mut feeder, shared) = started();
        let counters = arbiter.capture().counters();

        feeder.feed(88);
        let previous = arbiter.tick().source();
        assert_eq!(previous, FrameSource::Buffer(BufferTag::B));

        shared.request_start();
        let packet = arbiter.tick();
        assert_ne!(packet.source(), previous);
        assert!(packet.is_silent());
        assert_eq!(counters.clears(), 2);
        assert_eq!(counters.starts(), 2);
        // 旧数据被丢弃
        assert_eq!(arbiter.capture().fifo_level(), 0);

        // 启动帧来自 A 时，再次重启改用 B
        feeder.feed(88);
        shared.request_start();
        let packet = arbiter.tick();
        assert_eq!(packet.source(), FrameSource::Buffer(BufferTag::B));
    }

    #[test]
    fn test_default_geometries_follow_format_index() {
        let (mut pdm, _feeder) = SimulatedPdm::new(1024);
        pdm.configure(&AudioFormat::default()).unwrap();
        let shared = Arc::new(SharedControlState::new());
        let mut arbiter = StreamingArbiter::new(pdm, Arc::clone(&shared), 1);

        // 44.1kHz：176 字节
        assert_eq!(arbiter.tick().len(), 176);

        // 16kHz：64 字节
        shared.set_format_index(0);
        assert_eq!(arbiter.tick().len(), 64);
        assert_eq!(arbiter.geometry().capacity_words(), 34);
    }

    /// 在 `start` 内部模拟控制上下文的停止请求：正好落在消费 start-pending 与置位 recording 之间
    struct StopDuringStart {
        inner: SimulatedPdm,
        shared: Arc<SharedControlState>,
        fire: bool,
    }

    impl CaptureSource for StopDuringStart {
        fn configure(&mut self, format: &AudioFormat) -> Result<(), crate::capture::CaptureError> {
            self.inner.configure(format)
        }
        fn start(&mut self) {
            self.inner.start();
            if std::mem::take(&mut self.fire) {
                self.shared.request_stop();
            }
        }
        fn stop(&mut self) {
            self.inner.stop();
        }
        fn clear(&mut self) {
            self.inner.clear();
        }
        fn fifo_level(&self) -> usize {
            self.inner.fifo_level()
        }
        fn read(&mut self, dest: &mut [u16], want_words: usize) -> usize {
            self.inner.read(dest, want_words)
        }
    }

    #[test]
    fn test_stop_during_priming_reaches_idle() {
        let (mut pdm, _feeder) = SimulatedPdm::new(1024);
        pdm.configure(&AudioFormat::default()).unwrap();
        let counters = pdm.counters();
        let shared = Arc::new(SharedControlState::new());
        let capture = StopDuringStart {
            inner: pdm,
            shared: Arc::clone(&shared),
            fire: true,
        };
        let mut arbiter = StreamingArbiter::new(capture, Arc::clone(&shared), 1);

        shared.request_start();
        let packet = arbiter.tick();
        assert_eq!(packet.source(), FrameSource::Silence);
        assert_eq!(packet.len(), 176);

        assert_eq!(shared.recording_state(), RecordingState::Idle);
        assert_eq!(arbiter.state(), RecordingState::Idle);
        assert_eq!(counters.stops(), 1);
        assert_eq!(arbiter.stats().priming_frames(), 0);

        // 之后的周期保持静音
        assert_eq!(arbiter.tick().source(), FrameSource::Silence);

        // 下一次开始正常启动
        shared.request_start();
        let packet = arbiter.tick();
        assert_eq!(packet.source(), FrameSource::Buffer(BufferTag::A));
        assert_eq!(shared.recording_state(), RecordingState::Recording);
    }

    #[test]
    fn test_format_change_while_recording_is_counted() {
        let (mut pdm, mut feeder) = SimulatedPdm::new(1024);
        let format = AudioFormat::default();
        pdm.configure(&format).unwrap();
        feeder.set_format(&format);
        let shared = Arc::new(SharedControlState::new());
        let mut arbiter = StreamingArbiter::new(pdm, Arc::clone(&shared), 1);

        // Idle 时切换不计数
        shared.set_format_index(0);
        arbiter.tick();
        assert_eq!(arbiter.stats().live_format_changes(), 0);

        shared.request_start();
        arbiter.tick();
        shared.set_format_index(2);
        feeder.feed(88);
        let packet = arbiter.tick();
        assert!(packet.len() <= arbiter.geometry().capacity_bytes());
        assert_eq!(arbiter.stats().live_format_changes(), 1);

        // 索引不变时不重复计数
        feeder.feed(88);
        arbiter.tick();
        assert_eq!(arbiter.stats().live_format_changes(), 1);
    }
}
